//! AWS enumeration, enrichment and secret-source extraction.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

mod cloudcontrol;
mod content;
mod enrichments;
mod find_secrets;
mod sdk;

pub use cloudcontrol::{
    is_global_service, resolve_regions, CloudControlGet, CloudControlList, ResourceTarget, GLOBAL_REGION,
};
pub use content::{EcrImages, EcrLogin, InstanceUserData, StackTemplate};
pub use enrichments::{BucketPolicy, FunctionPolicy, LaunchPermissions};
pub use find_secrets::{find_secrets_types, FindSecrets, FIND_SECRETS_TYPES};
pub use sdk::SdkAwsApi;

use crate::{
    docker::RegistryCredentials,
    provider::{ProviderError, ProviderErrorKind},
};

/// One resource from a listing page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedResource {
    pub identifier: String,
    pub properties: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourcePage {
    pub items: Vec<ListedResource>,
    pub next_token: Option<String>,
}

fn unsupported(operation: &str) -> ProviderError {
    ProviderError::new(ProviderErrorKind::Other, format!("{operation} is not implemented by this provider"))
}

/// The AWS calls the pipelines make. [`SdkAwsApi`] is the real implementation.
#[async_trait]
pub trait AwsApi: Send + Sync {
    async fn enabled_regions(&self) -> Result<Vec<String>, ProviderError>;

    async fn account_id(&self, region: &str) -> Result<String, ProviderError>;

    /// One Cloud Control listing page for `type_name` in `region`.
    async fn list_resources(
        &self,
        region: &str,
        type_name: &str,
        next_token: Option<&str>,
    ) -> Result<ResourcePage, ProviderError>;

    /// Current properties of one resource, as Cloud Control describes them.
    async fn get_resource(&self, region: &str, type_name: &str, identifier: &str) -> Result<String, ProviderError> {
        let _ = (region, type_name, identifier);
        Err(unsupported("get_resource"))
    }

    async fn image_launch_permissions(&self, region: &str, image_id: &str) -> Result<Value, ProviderError> {
        let _ = (region, image_id);
        Err(unsupported("image_launch_permissions"))
    }

    async fn bucket_policy(&self, region: &str, bucket: &str) -> Result<Option<String>, ProviderError> {
        let _ = (region, bucket);
        Err(unsupported("bucket_policy"))
    }

    async fn function_policy(&self, region: &str, function: &str) -> Result<Option<String>, ProviderError> {
        let _ = (region, function);
        Err(unsupported("function_policy"))
    }

    /// Base64 user data of an EC2 instance.
    async fn instance_user_data(&self, region: &str, instance_id: &str) -> Result<Option<String>, ProviderError> {
        let _ = (region, instance_id);
        Err(unsupported("instance_user_data"))
    }

    async fn stack_template(&self, region: &str, stack: &str) -> Result<Option<String>, ProviderError> {
        let _ = (region, stack);
        Err(unsupported("stack_template"))
    }

    /// The most recently pushed tag of an ECR repository.
    async fn latest_image_tag(&self, region: &str, repository: &str) -> Result<Option<String>, ProviderError> {
        let _ = (region, repository);
        Err(unsupported("latest_image_tag"))
    }

    async fn registry_credentials(&self, region: &str) -> Result<RegistryCredentials, ProviderError> {
        let _ = region;
        Err(unsupported("registry_credentials"))
    }
}

pub type SharedAwsApi = Arc<dyn AwsApi>;
