use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{debug, error, warn};

use super::{AzureApi, SharedAzureApi};
use crate::{
    options::{OptionSet, SUBSCRIPTIONS},
    pipeline::{split_list, Inbox, Outbox, Stage, StageContext},
    provider::ProviderErrorKind,
    resource::EnrichedResource,
    util::Counted,
};

const MAX_THROTTLE_RETRIES: u32 = 5;

/// Resolves the `subscriptions` option: `all` asks Azure, empty means none.
pub async fn resolve_subscriptions(
    options: &OptionSet,
    api: &dyn AzureApi,
) -> Result<Vec<String>, crate::provider::ProviderError> {
    let raw = options.value(SUBSCRIPTIONS);
    if raw.trim().eq_ignore_ascii_case("all") {
        debug!("Listing subscriptions visible to the caller");
        api.list_subscriptions().await
    } else {
        Ok(split_list(&raw))
    }
}

/// Source stage emitting the subscriptions to enumerate.
pub struct Subscriptions {
    api: SharedAzureApi,
}

impl Subscriptions {
    pub fn new(api: SharedAzureApi) -> Self {
        Self { api }
    }
}

#[async_trait]
impl Stage<(), String> for Subscriptions {
    fn name(&self) -> &'static str {
        "azure-subscriptions"
    }

    async fn apply(&self, ctx: StageContext, _inbox: Inbox<()>, outbox: Outbox<String>) {
        let subscriptions = tokio::select! {
            biased;
            _ = ctx.cancelled() => return,
            subs = resolve_subscriptions(ctx.options(), self.api.as_ref()) => subs,
        };
        match subscriptions {
            Ok(subscriptions) => {
                debug!("Enumerating {}", Counted::regular(subscriptions.len(), "subscription"));
                for subscription in subscriptions {
                    if ctx.is_cancelled() || !outbox.send(subscription) {
                        break;
                    }
                }
            }
            Err(e) => error!("Failed to list subscriptions: {e}"),
        }
    }
}

/// Converts one item of the generic resources listing.
fn to_resource(subscription: &str, item: Value) -> Option<EnrichedResource> {
    let id = item.get("id").and_then(Value::as_str)?.to_string();
    let type_name = item.get("type").and_then(Value::as_str).unwrap_or_default().to_string();
    let location = item.get("location").and_then(Value::as_str).unwrap_or_default().to_string();
    let properties = serde_json::to_string(&item).ok()?;
    Some(EnrichedResource::new(id, type_name, location, subscription, properties))
}

async fn list_subscription(
    api: SharedAzureApi,
    ctx: StageContext,
    outbox: Outbox<EnrichedResource>,
    subscription: String,
    limiter: Option<Arc<Semaphore>>,
) {
    let _permit = match limiter {
        Some(limiter) => tokio::select! {
            biased;
            _ = ctx.cancelled() => return,
            permit = limiter.acquire_owned() => match permit {
                Ok(permit) => Some(permit),
                Err(_) => return,
            },
        },
        None => None,
    };

    let mut next_link: Option<String> = None;
    let mut throttled = 0;
    let mut listed = 0;
    loop {
        let page = tokio::select! {
            biased;
            _ = ctx.cancelled() => return,
            page = api.list_resources(&subscription, next_link.as_deref()) => page,
        };
        match page {
            Ok(page) => {
                throttled = 0;
                for item in page.items {
                    let Some(resource) = to_resource(&subscription, item) else {
                        debug!("Skipping a resource without an id in {subscription}");
                        continue;
                    };
                    if !outbox.send(resource) {
                        return;
                    }
                    listed += 1;
                }
                match page.next {
                    Some(link) => next_link = Some(link),
                    None => break,
                }
            }
            Err(e) if e.kind == ProviderErrorKind::Throttled && throttled < MAX_THROTTLE_RETRIES => {
                throttled += 1;
                let backoff = Duration::from_millis(500 * 2u64.pow(throttled));
                warn!("Throttled listing {subscription}, retrying in {backoff:?}");
                if !ctx.shutdown().sleep(backoff).await {
                    return;
                }
            }
            Err(e) if e.is_benign() => {
                debug!("Cannot list resources of {subscription}: {e}");
                return;
            }
            Err(e) => {
                error!("Failed to list resources of {subscription}: {e}");
                break;
            }
        }
    }
    debug!("Listed {} in {subscription}", Counted::regular(listed, "resource"));
}

/// Lists every resource of each incoming subscription, one worker per
/// subscription, capped by the `workers` option.
pub struct ListResources {
    api: SharedAzureApi,
}

impl ListResources {
    pub fn new(api: SharedAzureApi) -> Self {
        Self { api }
    }
}

#[async_trait]
impl Stage<String, EnrichedResource> for ListResources {
    fn name(&self) -> &'static str {
        "azure-list-resources"
    }

    async fn apply(&self, ctx: StageContext, mut inbox: Inbox<String>, outbox: Outbox<EnrichedResource>) {
        let limiter = match ctx.options().workers() {
            Ok(limit) => limit.map(|n| Arc::new(Semaphore::new(n))),
            Err(e) => {
                error!("{e}");
                return;
            }
        };
        let mut workers = Vec::new();
        while let Some(subscription) = inbox.recv(&ctx).await {
            let subscription = subscription.trim().to_string();
            if subscription.is_empty() {
                continue;
            }
            workers.push(ctx.spawn(list_subscription(
                self.api.clone(),
                ctx.clone(),
                outbox.clone(),
                subscription,
                limiter.clone(),
            )));
        }
        for worker in workers {
            if let Err(e) = worker.await {
                error!("Listing worker failed: {e}");
            }
        }
    }
}
