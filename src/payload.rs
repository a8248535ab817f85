use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::resource::EnrichedResource;

#[derive(Copy, Clone, Debug, Display, EnumString, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Aws,
    Azure,
    Docker,
}

/// Where a payload came from. Carried to the scanner so findings can be traced back.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub platform: String,
    pub resource_type: String,
    pub resource_id: String,
    pub region: String,
    pub account_id: String,
}

impl Provenance {
    pub fn new(
        platform: Platform,
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
        region: impl Into<String>,
        account_id: impl Into<String>,
    ) -> Self {
        Self {
            platform: platform.to_string(),
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
            region: region.into(),
            account_id: account_id.into(),
        }
    }

    pub fn for_resource(platform: Platform, resource: &EnrichedResource) -> Self {
        Self::new(
            platform,
            resource.type_name.clone(),
            resource.identifier.clone(),
            resource.region.clone(),
            resource.account_id.clone(),
        )
    }
}

/// Exactly one of a UTF-8 body or a base64-encoded byte string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadContent {
    Content(String),
    ContentBase64(String),
}

/// One unit of work for the secret scanner; serialized as a single JSON line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScannerPayload {
    #[serde(flatten)]
    pub content: PayloadContent,
    pub provenance: Provenance,
}

impl ScannerPayload {
    pub fn text(content: impl Into<String>, provenance: Provenance) -> Self {
        Self { content: PayloadContent::Content(content.into()), provenance }
    }

    pub fn bytes(content: &[u8], provenance: Provenance) -> Self {
        Self::base64(STANDARD.encode(content), provenance)
    }

    /// Wraps content that is already base64 encoded.
    pub fn base64(encoded: impl Into<String>, provenance: Provenance) -> Self {
        Self { content: PayloadContent::ContentBase64(encoded.into()), provenance }
    }

    pub fn is_empty(&self) -> bool {
        match &self.content {
            PayloadContent::Content(s) | PayloadContent::ContentBase64(s) => s.is_empty(),
        }
    }

    /// The payload as one newline-terminated JSON line.
    pub fn to_line(&self) -> serde_json::Result<Vec<u8>> {
        let mut line = serde_json::to_vec(self)?;
        line.push(b'\n');
        Ok(line)
    }
}
