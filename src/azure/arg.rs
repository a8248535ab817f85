use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use super::SharedAzureApi;
use crate::{
    pipeline::{Inbox, Outbox, Stage, StageContext},
    provider::ProviderErrorKind,
    templates::QueryTemplate,
    util::Counted,
};

const MAX_THROTTLE_RETRIES: u32 = 5;
const WELL_KNOWN_COLUMNS: &[&str] = &["id", "name", "type", "location"];

/// One Resource Graph row matched by a template.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArgQueryResult {
    pub template_id: String,
    pub template_name: String,
    pub template_details: Arc<QueryTemplate>,
    pub subscription_id: String,
    pub resource_id: String,
    pub resource_name: String,
    pub resource_type: String,
    pub location: String,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub properties: Map<String, Value>,
}

impl ArgQueryResult {
    fn from_row(template: &Arc<QueryTemplate>, subscription: &str, row: Map<String, Value>) -> Self {
        let column = |name: &str| row.get(name).and_then(Value::as_str).unwrap_or_default().to_string();
        let resource_id = column("id");
        let resource_name = column("name");
        let resource_type = column("type");
        let location = column("location");
        let properties =
            row.into_iter().filter(|(k, _)| !WELL_KNOWN_COLUMNS.contains(&k.as_str())).collect();
        Self {
            template_id: template.id.clone(),
            template_name: template.name.clone(),
            template_details: template.clone(),
            subscription_id: subscription.to_string(),
            resource_id,
            resource_name,
            resource_type,
            location,
            properties,
        }
    }
}

/// Runs every template against each incoming subscription.
pub struct ArgTemplates {
    api: SharedAzureApi,
    templates: Vec<Arc<QueryTemplate>>,
}

impl ArgTemplates {
    pub fn new(api: SharedAzureApi, templates: Vec<QueryTemplate>) -> Self {
        Self { api, templates: templates.into_iter().map(Arc::new).collect() }
    }

    /// Pages through one query. Returns `false` once the consumer is gone or
    /// the pipeline was cancelled.
    async fn run_template(
        &self,
        ctx: &StageContext,
        outbox: &Outbox<ArgQueryResult>,
        subscription: &str,
        template: &Arc<QueryTemplate>,
    ) -> bool {
        debug!("Executing template {} ({})", template.id, template.name);
        let mut skip_token: Option<String> = None;
        let mut throttled = 0;
        let mut matched = 0;
        loop {
            let page = tokio::select! {
                biased;
                _ = ctx.cancelled() => return false,
                page = self.api.resource_graph(subscription, &template.query_body, skip_token.as_deref()) => page,
            };
            match page {
                Ok(page) => {
                    throttled = 0;
                    for row in page.items {
                        let Value::Object(row) = row else {
                            continue;
                        };
                        if !outbox.send(ArgQueryResult::from_row(template, subscription, row)) {
                            return false;
                        }
                        matched += 1;
                    }
                    match page.next {
                        Some(token) => skip_token = Some(token),
                        None => break,
                    }
                }
                Err(e) if e.kind == ProviderErrorKind::Throttled && throttled < MAX_THROTTLE_RETRIES => {
                    throttled += 1;
                    let backoff = Duration::from_millis(500 * 2u64.pow(throttled));
                    warn!("Resource Graph throttled template {}, retrying in {backoff:?}", template.id);
                    if !ctx.shutdown().sleep(backoff).await {
                        return false;
                    }
                }
                Err(e) => {
                    error!("Failed to execute template {} in {subscription}: {e}", template.id);
                    break;
                }
            }
        }
        if matched > 0 {
            info!("Template {} matched {} in {subscription}", template.id, Counted::regular(matched, "resource"));
        }
        true
    }
}

#[async_trait]
impl Stage<String, ArgQueryResult> for ArgTemplates {
    fn name(&self) -> &'static str {
        "azure-arg-templates"
    }

    async fn apply(&self, ctx: StageContext, mut inbox: Inbox<String>, outbox: Outbox<ArgQueryResult>) {
        if self.templates.is_empty() {
            warn!("No Resource Graph templates to run");
            return;
        }
        while let Some(subscription) = inbox.recv(&ctx).await {
            info!("Processing subscription {subscription}");
            for template in &self.templates {
                if !self.run_template(&ctx, &outbox, &subscription, template).await {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;
    use crate::{
        azure::{AzureApi, Page},
        options::OptionSet,
        pipeline::{run_to_end, Generator, StageExt},
        provider::ProviderError,
    };

    #[derive(Default)]
    struct Graph {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl AzureApi for Graph {
        async fn list_subscriptions(&self) -> Result<Vec<String>, ProviderError> {
            Ok(vec![])
        }

        async fn list_resources(&self, _: &str, _: Option<&str>) -> Result<Page<Value>, ProviderError> {
            Ok(Page::default())
        }

        async fn resource_graph(
            &self,
            subscription: &str,
            query: &str,
            skip_token: Option<&str>,
        ) -> Result<Page<Value>, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if query.contains("broken") {
                return Err(ProviderError::new(ProviderErrorKind::Other, "BadRequest"));
            }
            let row = |name: &str| {
                json!({
                    "id": format!("/subscriptions/{subscription}/x/{name}"),
                    "name": name,
                    "type": "microsoft.web/sites",
                    "location": "eastus",
                    "defaultHostName": format!("{name}.azurewebsites.net"),
                })
            };
            Ok(match skip_token {
                None => Page { items: vec![row("one"), json!("not-an-object")], next: Some("t".into()) },
                Some(_) => Page { items: vec![row("two")], next: None },
            })
        }

        async fn get_resource(&self, _: &str, _: &str, _: Option<&str>) -> Result<Value, ProviderError> {
            Ok(Value::Null)
        }
    }

    fn template(id: &str, query: &str) -> QueryTemplate {
        QueryTemplate { id: id.into(), name: id.to_uppercase(), query_body: query.into(), ..Default::default() }
    }

    #[tokio::test]
    async fn pages_every_template_and_splits_columns() {
        let ctx = StageContext::new(OptionSet::new());
        let api = Arc::new(Graph::default());
        let stage = ArgTemplates::new(api.clone(), vec![template("broken", "broken"), template("sites", "resources")]);
        let results = run_to_end(Generator::new(vec!["sub-1".to_string()]).then(stage).boxed(), &ctx).await;

        assert_eq!(results.len(), 2);
        assert_eq!(api.calls.load(Ordering::SeqCst), 3);
        let first = &results[0];
        assert_eq!(first.template_id, "sites");
        assert_eq!(first.template_name, "SITES");
        assert_eq!(first.subscription_id, "sub-1");
        assert_eq!(first.resource_name, "one");
        assert_eq!(first.location, "eastus");
        assert_eq!(first.properties.len(), 1);
        assert_eq!(first.properties["defaultHostName"], "one.azurewebsites.net");

        let rendered = serde_json::to_value(first).unwrap();
        assert_eq!(rendered["templateDetails"]["query"], "resources");
        assert_eq!(rendered["resourceId"], "/subscriptions/sub-1/x/one");
    }
}
