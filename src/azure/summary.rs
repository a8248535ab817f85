use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use crate::{
    pipeline::{Inbox, Outbox, Stage, StageContext},
    report::ReportRecord,
    resource::EnrichedResource,
};

/// Resource type of the per-subscription total row.
pub const TOTAL_ROW: &str = "Total";

/// How many resources of one type a subscription holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ResourceCount {
    pub subscription_id: String,
    pub resource_type: String,
    /// The resource provider without its `Microsoft.` prefix, e.g. `Compute`.
    pub category: String,
    pub count: usize,
}

impl ReportRecord for ResourceCount {
    fn group(&self) -> String {
        self.subscription_id.clone()
    }

    fn group_title(&self) -> String {
        format!("Subscription {}", self.subscription_id)
    }

    fn headers() -> &'static [&'static str] {
        &["Resource Type", "Category", "Count"]
    }

    fn row(&self) -> Vec<String> {
        vec![self.resource_type.clone(), self.category.clone(), self.count.to_string()]
    }
}

fn category(resource_type: &str) -> String {
    let provider = resource_type.split('/').next().unwrap_or_default();
    provider.strip_prefix("Microsoft.").unwrap_or(provider).to_string()
}

/// Counts resources per subscription and type.
///
/// Each subscription's rows are ordered by descending count, then type, and
/// end with a [`TOTAL_ROW`].
pub fn count_resources(resources: &[EnrichedResource]) -> Vec<ResourceCount> {
    let mut by_subscription: BTreeMap<&str, BTreeMap<&str, usize>> = BTreeMap::new();
    for resource in resources {
        let types = by_subscription.entry(resource.account_id.as_str()).or_default();
        *types.entry(resource.type_name.as_str()).or_default() += 1;
    }

    let mut counts = Vec::new();
    for (subscription, types) in by_subscription {
        let mut rows: Vec<(&str, usize)> = types.into_iter().collect();
        rows.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        let total: usize = rows.iter().map(|(_, count)| count).sum();
        for (resource_type, count) in rows {
            counts.push(ResourceCount {
                subscription_id: subscription.to_string(),
                resource_type: resource_type.to_string(),
                category: category(resource_type),
                count,
            });
        }
        counts.push(ResourceCount {
            subscription_id: subscription.to_string(),
            resource_type: TOTAL_ROW.to_string(),
            category: String::new(),
            count: total,
        });
    }
    counts
}

/// Turns a batch of listed resources into per-subscription counts.
#[derive(Default)]
pub struct CountResources;

#[async_trait]
impl Stage<Vec<EnrichedResource>, ResourceCount> for CountResources {
    fn name(&self) -> &'static str {
        "azure-count-resources"
    }

    async fn apply(&self, ctx: StageContext, mut inbox: Inbox<Vec<EnrichedResource>>, outbox: Outbox<ResourceCount>) {
        while let Some(batch) = inbox.recv(&ctx).await {
            debug!("Counting {} resources", batch.len());
            for count in count_resources(&batch) {
                if !outbox.send(count) {
                    return;
                }
            }
        }
    }
}
