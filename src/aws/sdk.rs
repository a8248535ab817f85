use std::collections::HashMap;

use async_trait::async_trait;
use aws_config::{BehaviorVersion, SdkConfig};
use aws_credential_types::Credentials;
use aws_sdk_ec2::types::{ImageAttributeName, InstanceAttributeName};
use aws_smithy_types::error::display::DisplayErrorContext;
use aws_types::region::Region;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::debug;

use super::{AwsApi, ListedResource, ResourcePage, GLOBAL_REGION};
use crate::{
    docker::RegistryCredentials,
    options::{OptionSet, PROFILE, ROLE_ARN},
    provider::{ProviderError, ProviderErrorKind},
};

fn sdk_error<E: std::error::Error>(err: E) -> ProviderError {
    ProviderError::from_message(DisplayErrorContext(err).to_string())
}

/// [`AwsApi`] backed by the AWS SDK.
///
/// Credentials come from the standard provider chain (optionally a named
/// profile, an assumed role, or `CLOUDSWEEP_AWS_KEY`/`CLOUDSWEEP_AWS_SECRET`).
/// Each instance keeps its own per-region configs; stages do not share them.
pub struct SdkAwsApi {
    profile: Option<String>,
    role_arn: Option<String>,
    configs: Mutex<HashMap<String, SdkConfig>>,
}

impl SdkAwsApi {
    pub fn new(profile: Option<String>, role_arn: Option<String>) -> Self {
        Self { profile, role_arn, configs: Mutex::new(HashMap::new()) }
    }

    pub fn from_options(options: &OptionSet) -> Self {
        let non_empty = |s: String| (!s.trim().is_empty()).then_some(s);
        Self::new(non_empty(options.value(PROFILE)), non_empty(options.value(ROLE_ARN)))
    }

    async fn config(&self, region: &str) -> SdkConfig {
        let mut configs = self.configs.lock().await;
        if let Some(config) = configs.get(region) {
            return config.clone();
        }

        let mut loader =
            aws_config::defaults(BehaviorVersion::latest()).region(Region::new(region.to_string()));
        if let Some(profile) = &self.profile {
            loader = loader.profile_name(profile);
        }
        if let (Ok(key), Ok(secret)) =
            (std::env::var("CLOUDSWEEP_AWS_KEY"), std::env::var("CLOUDSWEEP_AWS_SECRET"))
        {
            loader = loader.credentials_provider(Credentials::new(key, secret, None, None, "cloudsweep_env"));
        }
        let mut config = loader.load().await;

        if let Some(role) = &self.role_arn {
            let assume_role = aws_config::sts::AssumeRoleProvider::builder(role.clone())
                .session_name("cloudsweep")
                .configure(&config)
                .build()
                .await;
            config = config.into_builder().credentials_provider(
                aws_credential_types::provider::SharedCredentialsProvider::new(assume_role),
            ).build();
        }

        debug!("Loaded AWS config for {region}");
        configs.insert(region.to_string(), config.clone());
        config
    }
}

#[async_trait]
impl AwsApi for SdkAwsApi {
    async fn enabled_regions(&self) -> Result<Vec<String>, ProviderError> {
        let client = aws_sdk_ec2::Client::new(&self.config(GLOBAL_REGION).await);
        let resp = client.describe_regions().send().await.map_err(sdk_error)?;
        Ok(resp.regions().iter().filter_map(|r| r.region_name().map(str::to_string)).collect())
    }

    async fn account_id(&self, region: &str) -> Result<String, ProviderError> {
        let client = aws_sdk_sts::Client::new(&self.config(region).await);
        let resp = client.get_caller_identity().send().await.map_err(sdk_error)?;
        resp.account()
            .map(str::to_string)
            .ok_or_else(|| ProviderError::new(ProviderErrorKind::Other, "caller identity has no account"))
    }

    async fn list_resources(
        &self,
        region: &str,
        type_name: &str,
        next_token: Option<&str>,
    ) -> Result<ResourcePage, ProviderError> {
        let client = aws_sdk_cloudcontrol::Client::new(&self.config(region).await);
        let resp = client
            .list_resources()
            .type_name(type_name)
            .max_results(100)
            .set_next_token(next_token.map(str::to_string))
            .send()
            .await
            .map_err(sdk_error)?;
        let items = resp
            .resource_descriptions()
            .iter()
            .filter_map(|d| {
                Some(ListedResource {
                    identifier: d.identifier()?.to_string(),
                    properties: d.properties().unwrap_or("{}").to_string(),
                })
            })
            .collect();
        Ok(ResourcePage { items, next_token: resp.next_token().map(str::to_string) })
    }

    async fn get_resource(&self, region: &str, type_name: &str, identifier: &str) -> Result<String, ProviderError> {
        let client = aws_sdk_cloudcontrol::Client::new(&self.config(region).await);
        let resp = client
            .get_resource()
            .type_name(type_name)
            .identifier(identifier)
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(resp.resource_description().and_then(|d| d.properties()).unwrap_or("{}").to_string())
    }

    async fn image_launch_permissions(&self, region: &str, image_id: &str) -> Result<Value, ProviderError> {
        let client = aws_sdk_ec2::Client::new(&self.config(region).await);
        let resp = client
            .describe_image_attribute()
            .image_id(image_id)
            .attribute(ImageAttributeName::LaunchPermission)
            .send()
            .await
            .map_err(sdk_error)?;
        let permissions: Vec<Value> = resp
            .launch_permissions()
            .iter()
            .map(|p| {
                json!({
                    "Group": p.group().map(|g| g.as_str()),
                    "UserId": p.user_id(),
                    "OrganizationArn": p.organization_arn(),
                    "OrganizationalUnitArn": p.organizational_unit_arn(),
                })
            })
            .collect();
        Ok(Value::Array(permissions))
    }

    async fn bucket_policy(&self, region: &str, bucket: &str) -> Result<Option<String>, ProviderError> {
        let client = aws_sdk_s3::Client::new(&self.config(region).await);
        let resp = client.get_bucket_policy().bucket(bucket).send().await.map_err(sdk_error)?;
        Ok(resp.policy().map(str::to_string))
    }

    async fn function_policy(&self, region: &str, function: &str) -> Result<Option<String>, ProviderError> {
        let client = aws_sdk_lambda::Client::new(&self.config(region).await);
        let resp = client.get_policy().function_name(function).send().await.map_err(sdk_error)?;
        Ok(resp.policy().map(str::to_string))
    }

    async fn instance_user_data(&self, region: &str, instance_id: &str) -> Result<Option<String>, ProviderError> {
        let client = aws_sdk_ec2::Client::new(&self.config(region).await);
        let resp = client
            .describe_instance_attribute()
            .instance_id(instance_id)
            .attribute(InstanceAttributeName::UserData)
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(resp.user_data().and_then(|v| v.value()).map(str::to_string))
    }

    async fn stack_template(&self, region: &str, stack: &str) -> Result<Option<String>, ProviderError> {
        let client = aws_sdk_cloudformation::Client::new(&self.config(region).await);
        let resp = client.get_template().stack_name(stack).send().await.map_err(sdk_error)?;
        Ok(resp.template_body().map(str::to_string))
    }

    async fn latest_image_tag(&self, region: &str, repository: &str) -> Result<Option<String>, ProviderError> {
        let client = aws_sdk_ecr::Client::new(&self.config(region).await);
        let mut latest: Option<(i64, String)> = None;
        let mut next_token: Option<String> = None;
        loop {
            let resp = client
                .describe_images()
                .repository_name(repository)
                .set_next_token(next_token.take())
                .send()
                .await
                .map_err(sdk_error)?;
            for detail in resp.image_details() {
                let Some(tag) = detail.image_tags().first() else {
                    continue;
                };
                let pushed = detail.image_pushed_at().map(|t| t.secs()).unwrap_or_default();
                if latest.as_ref().map_or(true, |(at, _)| pushed > *at) {
                    latest = Some((pushed, tag.clone()));
                }
            }
            match resp.next_token() {
                Some(token) if !token.is_empty() => next_token = Some(token.to_string()),
                _ => break,
            }
        }
        Ok(latest.map(|(_, tag)| tag))
    }

    async fn registry_credentials(&self, region: &str) -> Result<RegistryCredentials, ProviderError> {
        let client = aws_sdk_ecr::Client::new(&self.config(region).await);
        let resp = client.get_authorization_token().send().await.map_err(sdk_error)?;
        let data = resp
            .authorization_data()
            .first()
            .ok_or_else(|| ProviderError::new(ProviderErrorKind::Other, "no ECR authorization data"))?;
        let token = data
            .authorization_token()
            .ok_or_else(|| ProviderError::new(ProviderErrorKind::Other, "no ECR authorization token"))?;
        let decoded = STANDARD
            .decode(token)
            .map_err(|e| ProviderError::new(ProviderErrorKind::Other, format!("bad ECR token: {e}")))?;
        let decoded = String::from_utf8_lossy(&decoded);
        let (username, password) = decoded
            .split_once(':')
            .ok_or_else(|| ProviderError::new(ProviderErrorKind::Other, "malformed ECR token"))?;
        Ok(RegistryCredentials {
            server: data.proxy_endpoint().unwrap_or_default().to_string(),
            username: username.to_string(),
            password: password.to_string(),
        })
    }
}
