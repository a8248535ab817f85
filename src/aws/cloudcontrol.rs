use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::{sync::Semaphore, task::JoinHandle};
use tracing::{debug, error, info, warn};

use super::{AwsApi, SharedAwsApi};
use crate::{
    options::{OptionSet, REGIONS},
    pipeline::{split_list, Inbox, Outbox, Stage, StageContext},
    provider::{ProviderError, ProviderErrorKind},
    resource::EnrichedResource,
    util::Counted,
};

pub const GLOBAL_REGION: &str = "us-east-1";

const GLOBAL_SERVICES: &[&str] = &[
    "AWS::IAM::",
    "AWS::CloudFront::",
    "AWS::Route53::",
    "AWS::Organizations::",
    "AWS::GlobalAccelerator::",
    "AWS::WAF::",
    "AWS::Shield::",
];

const MAX_THROTTLE_RETRIES: u32 = 5;

/// Types whose listings are account-wide and must be queried in one region only.
pub fn is_global_service(type_name: &str) -> bool {
    GLOBAL_SERVICES.iter().any(|prefix| type_name.starts_with(prefix))
}

/// Resolves the `regions` option: `all` asks the provider, empty means none.
pub async fn resolve_regions(options: &OptionSet, api: &dyn AwsApi) -> Result<Vec<String>, ProviderError> {
    let raw = options.value(REGIONS);
    if raw.trim().eq_ignore_ascii_case("all") {
        debug!("Gathering enabled regions");
        let regions = api.enabled_regions().await?;
        debug!("Enabled regions: {}", regions.join(", "));
        Ok(regions)
    } else {
        Ok(split_list(&raw))
    }
}

/// Lists every resource of each incoming type name in every configured region.
///
/// One worker per (type, region) pair, capped by the `workers` option.
pub struct CloudControlList {
    api: SharedAwsApi,
}

impl CloudControlList {
    pub fn new(api: SharedAwsApi) -> Self {
        Self { api }
    }
}

struct ListJob {
    type_name: String,
    region: String,
    account_id: String,
}

async fn list_worker(
    api: SharedAwsApi,
    ctx: StageContext,
    outbox: Outbox<EnrichedResource>,
    job: ListJob,
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

    let ListJob { type_name, region, account_id } = job;
    let mut next_token: Option<String> = None;
    let mut throttled = 0;
    let mut listed = 0;
    loop {
        let page = tokio::select! {
            biased;
            _ = ctx.cancelled() => return,
            page = api.list_resources(&region, &type_name, next_token.as_deref()) => page,
        };
        match page {
            Ok(page) => {
                throttled = 0;
                for item in page.items {
                    let resource = EnrichedResource::new(
                        item.identifier,
                        type_name.clone(),
                        region.clone(),
                        account_id.clone(),
                        item.properties,
                    );
                    if !outbox.send(resource) {
                        return;
                    }
                    listed += 1;
                }
                match page.next_token {
                    Some(token) if !token.is_empty() => next_token = Some(token),
                    _ => break,
                }
            }
            Err(e) if e.kind == ProviderErrorKind::RegionUnsupported => {
                debug!("{type_name} is not available in {region}: {e}");
                return;
            }
            Err(e) if e.kind == ProviderErrorKind::Throttled && throttled < MAX_THROTTLE_RETRIES => {
                throttled += 1;
                let backoff = Duration::from_millis(500 * 2u64.pow(throttled));
                warn!("Throttled listing {type_name} in {region}, retrying in {backoff:?}");
                if !ctx.shutdown().sleep(backoff).await {
                    return;
                }
            }
            Err(e) if e.kind == ProviderErrorKind::AccessDenied => {
                error!("Access denied listing {type_name} in {region}: {e}");
                return;
            }
            Err(e) => {
                error!("Failed to list {type_name} in {region}: {e}");
                break;
            }
        }
    }
    debug!("Listed {} of {type_name} in {region}", Counted::regular(listed, "resource"));
}

#[async_trait]
impl Stage<String, EnrichedResource> for CloudControlList {
    fn name(&self) -> &'static str {
        "aws-cloudcontrol-list"
    }

    async fn apply(&self, ctx: StageContext, mut inbox: Inbox<String>, outbox: Outbox<EnrichedResource>) {
        let regions = match resolve_regions(ctx.options(), self.api.as_ref()).await {
            Ok(regions) => regions,
            Err(e) => {
                error!("Failed to resolve regions: {e}");
                return;
            }
        };
        if regions.is_empty() {
            debug!("No regions to enumerate");
            return;
        }
        let limiter = match ctx.options().workers() {
            Ok(limit) => limit.map(|n| Arc::new(Semaphore::new(n))),
            Err(e) => {
                error!("{e}");
                return;
            }
        };
        let account_id = match self.api.account_id(&regions[0]).await {
            Ok(id) => id,
            Err(e) => {
                warn!("Could not determine the account id: {e}");
                String::new()
            }
        };
        let global_region =
            if regions.iter().any(|r| r == GLOBAL_REGION) { GLOBAL_REGION } else { regions[0].as_str() };

        let mut workers: Vec<JoinHandle<()>> = Vec::new();
        while let Some(type_name) = inbox.recv(&ctx).await {
            let type_name = type_name.trim().to_string();
            if type_name.is_empty() {
                continue;
            }
            let scopes: Vec<&str> = if is_global_service(&type_name) {
                vec![global_region]
            } else {
                regions.iter().map(String::as_str).collect()
            };
            for region in scopes {
                let job = ListJob {
                    type_name: type_name.clone(),
                    region: region.to_string(),
                    account_id: account_id.clone(),
                };
                workers.push(ctx.spawn(list_worker(
                    self.api.clone(),
                    ctx.clone(),
                    outbox.clone(),
                    job,
                    limiter.clone(),
                )));
            }
        }
        info!("Waiting on {}", Counted::regular(workers.len(), "listing worker"));
        for worker in workers {
            let _ = worker.await;
        }
    }
}

/// One resource to fetch by type name and primary identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceTarget {
    pub type_name: String,
    pub identifier: String,
}

impl ResourceTarget {
    pub fn new(type_name: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self { type_name: type_name.into(), identifier: identifier.into() }
    }
}

/// The single region `CloudControlGet` reads from: the first entry of the
/// `regions` option, or the global region for `all`, an empty value and
/// account-wide types.
fn lookup_region(options: &OptionSet, type_name: &str) -> String {
    if is_global_service(type_name) {
        return GLOBAL_REGION.to_string();
    }
    let regions = split_list(&options.value(REGIONS));
    match regions.as_slice() {
        [] => GLOBAL_REGION.to_string(),
        [region] if region.eq_ignore_ascii_case("all") => GLOBAL_REGION.to_string(),
        [region] => region.clone(),
        [region, ..] => {
            warn!("Resources are fetched from one region; using {region}");
            region.clone()
        }
    }
}

/// Fetches the current properties of each incoming resource.
pub struct CloudControlGet {
    api: SharedAwsApi,
}

impl CloudControlGet {
    pub fn new(api: SharedAwsApi) -> Self {
        Self { api }
    }

    async fn fetch(&self, ctx: &StageContext, target: &ResourceTarget, region: &str) -> Option<String> {
        let ResourceTarget { type_name, identifier } = target;
        let mut throttled = 0;
        loop {
            let properties = tokio::select! {
                biased;
                _ = ctx.cancelled() => return None,
                properties = self.api.get_resource(region, type_name, identifier) => properties,
            };
            match properties {
                Ok(properties) => return Some(properties),
                Err(e) if e.kind == ProviderErrorKind::Throttled && throttled < MAX_THROTTLE_RETRIES => {
                    throttled += 1;
                    let backoff = Duration::from_millis(500 * 2u64.pow(throttled));
                    warn!("Throttled fetching {identifier}, retrying in {backoff:?}");
                    if !ctx.shutdown().sleep(backoff).await {
                        return None;
                    }
                }
                Err(e) if e.is_benign() => {
                    warn!("Cannot fetch {type_name} {identifier} in {region}: {e}");
                    return None;
                }
                Err(e) => {
                    error!("Failed to fetch {type_name} {identifier} in {region}: {e}");
                    return None;
                }
            }
        }
    }
}

#[async_trait]
impl Stage<ResourceTarget, EnrichedResource> for CloudControlGet {
    fn name(&self) -> &'static str {
        "aws-cloudcontrol-get"
    }

    async fn apply(&self, ctx: StageContext, mut inbox: Inbox<ResourceTarget>, outbox: Outbox<EnrichedResource>) {
        let mut accounts: HashMap<String, String> = HashMap::new();
        while let Some(target) = inbox.recv(&ctx).await {
            let region = lookup_region(ctx.options(), &target.type_name);
            let account_id = match accounts.get(&region) {
                Some(id) => id.clone(),
                None => {
                    let id = self.api.account_id(&region).await.unwrap_or_else(|e| {
                        warn!("Could not determine the account id: {e}");
                        String::new()
                    });
                    accounts.insert(region.clone(), id.clone());
                    id
                }
            };
            let Some(properties) = self.fetch(&ctx, &target, &region).await else {
                continue;
            };
            let resource = EnrichedResource::new(target.identifier, target.type_name, region, account_id, properties);
            if !outbox.send(resource) {
                break;
            }
        }
    }
}
