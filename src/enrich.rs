//! Per-resource enrichment and the conversion of resources into scanner payloads.

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, error};

use crate::{
    payload::{Platform, Provenance, ScannerPayload},
    pipeline::{Inbox, Outbox, Stage, StageContext},
    provider::ProviderError,
    resource::EnrichedResource,
};

/// Fetches one named attribute for a resource.
#[async_trait]
pub trait Enrichment: Send + Sync {
    fn name(&self) -> &'static str;

    /// The property key the fetched value is appended under.
    fn key(&self) -> &'static str;

    /// Resources this enrichment does not accept are dropped by [`Enrich`].
    fn accepts(&self, resource: &EnrichedResource) -> bool {
        let _ = resource;
        true
    }

    /// `Ok(None)` means there is nothing to add.
    async fn fetch(&self, resource: &EnrichedResource) -> Result<Option<Value>, ProviderError>;
}

/// Runs an [`Enrichment`] over each resource.
///
/// On any failure the input resource is passed through untouched.
pub struct Enrich<E> {
    enrichment: E,
}

impl<E: Enrichment> Enrich<E> {
    pub fn new(enrichment: E) -> Self {
        Self { enrichment }
    }

    async fn enrich(&self, resource: EnrichedResource) -> EnrichedResource {
        let value = match self.enrichment.fetch(&resource).await {
            Ok(Some(value)) => value,
            Ok(None) => return resource,
            Err(e) if e.is_benign() => {
                debug!("{} unavailable for {}: {e}", self.enrichment.key(), resource.identifier);
                return resource;
            }
            Err(e) => {
                error!("Failed to fetch {} for {}: {e}", self.enrichment.key(), resource.identifier);
                return resource;
            }
        };
        match resource.with_property(self.enrichment.key(), value) {
            Ok(enriched) => enriched,
            Err(e) => {
                error!("Could not add {} to {}: {e}", self.enrichment.key(), resource.identifier);
                resource
            }
        }
    }
}

#[async_trait]
impl<E: Enrichment + 'static> Stage<EnrichedResource, EnrichedResource> for Enrich<E> {
    fn name(&self) -> &'static str {
        self.enrichment.name()
    }

    async fn apply(
        &self,
        ctx: StageContext,
        mut inbox: Inbox<EnrichedResource>,
        outbox: Outbox<EnrichedResource>,
    ) {
        while let Some(resource) = inbox.recv(&ctx).await {
            if !self.enrichment.accepts(&resource) {
                continue;
            }
            let enriched = tokio::select! {
                biased;
                _ = ctx.cancelled() => break,
                r = self.enrich(resource) => r,
            };
            if !outbox.send(enriched) {
                break;
            }
        }
    }
}

/// Hands the whole property blob of each resource to the scanner.
pub struct PropertiesToPayload {
    platform: Platform,
}

impl PropertiesToPayload {
    pub fn new(platform: Platform) -> Self {
        Self { platform }
    }

    pub fn convert(&self, resource: &EnrichedResource) -> Option<ScannerPayload> {
        let body = resource.properties.trim();
        if body.is_empty() || body == "{}" {
            return None;
        }
        Some(ScannerPayload::bytes(body.as_bytes(), Provenance::for_resource(self.platform, resource)))
    }
}

#[async_trait]
impl Stage<EnrichedResource, ScannerPayload> for PropertiesToPayload {
    fn name(&self) -> &'static str {
        "properties-to-payload"
    }

    async fn apply(
        &self,
        ctx: StageContext,
        mut inbox: Inbox<EnrichedResource>,
        outbox: Outbox<ScannerPayload>,
    ) {
        while let Some(resource) = inbox.recv(&ctx).await {
            match self.convert(&resource) {
                Some(payload) => {
                    if !outbox.send(payload) {
                        break;
                    }
                }
                None => debug!("{} has no properties to scan", resource.identifier),
            }
        }
    }
}
