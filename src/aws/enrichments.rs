use async_trait::async_trait;
use serde_json::Value;

use super::SharedAwsApi;
use crate::{enrich::Enrichment, provider::ProviderError, resource::EnrichedResource};

/// Parses a policy document, keeping it as a string when it is not JSON.
fn policy_value(document: String) -> Value {
    serde_json::from_str(&document).unwrap_or(Value::String(document))
}

/// Appends `LaunchPermissions` to EC2 images; reveals public or shared AMIs.
pub struct LaunchPermissions {
    api: SharedAwsApi,
}

impl LaunchPermissions {
    pub fn new(api: SharedAwsApi) -> Self {
        Self { api }
    }
}

#[async_trait]
impl Enrichment for LaunchPermissions {
    fn name(&self) -> &'static str {
        "aws-ec2-launch-permissions"
    }

    fn key(&self) -> &'static str {
        "LaunchPermissions"
    }

    fn accepts(&self, resource: &EnrichedResource) -> bool {
        resource.type_name == "AWS::EC2::Image"
    }

    async fn fetch(&self, resource: &EnrichedResource) -> Result<Option<Value>, ProviderError> {
        self.api
            .image_launch_permissions(&resource.region, &resource.identifier)
            .await
            .map(Some)
    }
}

/// Appends the bucket policy document as `AccessPolicy`.
pub struct BucketPolicy {
    api: SharedAwsApi,
}

impl BucketPolicy {
    pub fn new(api: SharedAwsApi) -> Self {
        Self { api }
    }
}

#[async_trait]
impl Enrichment for BucketPolicy {
    fn name(&self) -> &'static str {
        "aws-s3-bucket-policy"
    }

    fn key(&self) -> &'static str {
        "AccessPolicy"
    }

    fn accepts(&self, resource: &EnrichedResource) -> bool {
        resource.type_name == "AWS::S3::Bucket"
    }

    async fn fetch(&self, resource: &EnrichedResource) -> Result<Option<Value>, ProviderError> {
        let policy = self.api.bucket_policy(&resource.region, &resource.identifier).await?;
        Ok(policy.map(policy_value))
    }
}

/// Appends the Lambda resource policy as `AccessPolicy`.
pub struct FunctionPolicy {
    api: SharedAwsApi,
}

impl FunctionPolicy {
    pub fn new(api: SharedAwsApi) -> Self {
        Self { api }
    }
}

#[async_trait]
impl Enrichment for FunctionPolicy {
    fn name(&self) -> &'static str {
        "aws-lambda-function-policy"
    }

    fn key(&self) -> &'static str {
        "AccessPolicy"
    }

    fn accepts(&self, resource: &EnrichedResource) -> bool {
        resource.type_name == "AWS::Lambda::Function"
    }

    async fn fetch(&self, resource: &EnrichedResource) -> Result<Option<Value>, ProviderError> {
        let policy = self.api.function_policy(&resource.region, &resource.identifier).await?;
        Ok(policy.map(policy_value))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::{
        aws::{AwsApi, ResourcePage},
        enrich::Enrich,
        options::OptionSet,
        pipeline::{run_to_end, Generator, StageContext, StageExt},
    };

    struct Policies;

    #[async_trait]
    impl AwsApi for Policies {
        async fn enabled_regions(&self) -> Result<Vec<String>, ProviderError> {
            Ok(vec![])
        }

        async fn account_id(&self, _region: &str) -> Result<String, ProviderError> {
            Ok(String::new())
        }

        async fn list_resources(
            &self,
            _region: &str,
            _type_name: &str,
            _next_token: Option<&str>,
        ) -> Result<ResourcePage, ProviderError> {
            Ok(ResourcePage::default())
        }

        async fn bucket_policy(&self, _region: &str, bucket: &str) -> Result<Option<String>, ProviderError> {
            match bucket {
                "public" => Ok(Some(r#"{"Statement":[{"Principal":"*"}]}"#.into())),
                _ => Err(ProviderError::from_message("NoSuchBucketPolicy")),
            }
        }
    }

    #[tokio::test]
    async fn bucket_policy_enrichment() {
        let ctx = StageContext::new(OptionSet::new());
        let public = EnrichedResource::new("public", "AWS::S3::Bucket", "us-east-1", "1", r#"{"BucketName":"public"}"#);
        let private = EnrichedResource::new("private", "AWS::S3::Bucket", "us-east-1", "1", "{}");
        let other = EnrichedResource::new("fn", "AWS::Lambda::Function", "us-east-1", "1", "{}");
        let stage = Generator::new(vec![public, private.clone(), other])
            .then(Enrich::new(BucketPolicy::new(Arc::new(Policies))));
        let out = run_to_end(stage.boxed(), &ctx).await;
        assert_eq!(out.len(), 2);
        let props: Value = serde_json::from_str(&out[0].properties).unwrap();
        assert_eq!(props["BucketName"], "public");
        assert_eq!(props["AccessPolicy"]["Statement"][0]["Principal"], json!("*"));
        assert_eq!(out[1], private);
    }

    #[test]
    fn non_json_policies_stay_strings() {
        assert_eq!(policy_value("not json".into()), json!("not json"));
    }
}
