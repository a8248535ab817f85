//! Azure enumeration over the Resource Manager and Resource Graph APIs.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

mod arg;
mod arm;
mod find_secrets;
mod list;
mod summary;

pub use arg::{ArgQueryResult, ArgTemplates};
pub use arm::{ArmClient, MANAGEMENT_URL};
pub use find_secrets::{
    azure_find_secrets_types, AzureFindSecrets, VirtualMachineUserData, AZURE_FIND_SECRETS_TYPES,
    VIRTUAL_MACHINE_TYPE,
};
pub use list::{resolve_subscriptions, ListResources, Subscriptions};
pub use summary::{count_resources, CountResources, ResourceCount, TOTAL_ROW};

use crate::provider::ProviderError;

/// One page of a paginated Azure response and the token for the next one.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next: Option<String>,
}

/// The Azure calls the pipelines make. [`ArmClient`] is the real implementation.
#[async_trait]
pub trait AzureApi: Send + Sync {
    async fn list_subscriptions(&self) -> Result<Vec<String>, ProviderError>;

    /// One page of the generic resources listing of a subscription.
    async fn list_resources(&self, subscription: &str, next_link: Option<&str>) -> Result<Page<Value>, ProviderError>;

    /// One page of a Resource Graph query scoped to a subscription.
    async fn resource_graph(
        &self,
        subscription: &str,
        query: &str,
        skip_token: Option<&str>,
    ) -> Result<Page<Value>, ProviderError>;

    async fn get_resource(
        &self,
        resource_id: &str,
        api_version: &str,
        expand: Option<&str>,
    ) -> Result<Value, ProviderError>;
}

pub type SharedAzureApi = Arc<dyn AzureApi>;
