use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, thiserror::Error)]
pub enum PropertyError {
    #[error("properties are not valid JSON: {0}")]
    Invalid(#[from] serde_json::Error),

    #[error("properties are not a JSON object")]
    NotAnObject,

    #[error("property `{0}` is already present")]
    AlreadyPresent(String),
}

/// A cloud resource as it travels from enumeration through enrichment.
///
/// `properties` holds the textual JSON blob returned by the provider. Enrichment
/// appends keys to it and never rewrites existing ones.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EnrichedResource {
    pub identifier: String,
    pub type_name: String,
    pub region: String,
    pub account_id: String,
    pub properties: String,
}

impl EnrichedResource {
    pub fn new(
        identifier: impl Into<String>,
        type_name: impl Into<String>,
        region: impl Into<String>,
        account_id: impl Into<String>,
        properties: impl Into<String>,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            type_name: type_name.into(),
            region: region.into(),
            account_id: account_id.into(),
            properties: properties.into(),
        }
    }

    /// Parses the property blob. An empty blob reads as an empty object.
    pub fn properties_map(&self) -> Result<Map<String, Value>, PropertyError> {
        if self.properties.trim().is_empty() {
            return Ok(Map::new());
        }
        match serde_json::from_str::<Value>(&self.properties)? {
            Value::Object(map) => Ok(map),
            _ => Err(PropertyError::NotAnObject),
        }
    }

    /// Looks up a top-level string property.
    pub fn property_str(&self, key: &str) -> Option<String> {
        self.properties_map().ok()?.get(key)?.as_str().map(str::to_string)
    }

    /// Returns a copy of this resource with `key` appended to its properties.
    ///
    /// Existing keys keep their position and value; the new key goes last.
    pub fn with_property(&self, key: &str, value: Value) -> Result<Self, PropertyError> {
        let mut map = self.properties_map()?;
        if map.contains_key(key) {
            return Err(PropertyError::AlreadyPresent(key.to_string()));
        }
        map.insert(key.to_string(), value);
        let properties = serde_json::to_string(&Value::Object(map))?;
        Ok(Self { properties, ..self.clone() })
    }
}
