use async_trait::async_trait;
use tracing::{debug, error};

use super::SharedAwsApi;
use crate::{
    docker::{ecr_region, ImageContext},
    payload::{Platform, Provenance, ScannerPayload},
    pipeline::{Inbox, Outbox, Stage, StageContext},
    provider::ProviderError,
    resource::EnrichedResource,
};

fn log_fetch_error(what: &str, resource: &EnrichedResource, e: &ProviderError) {
    if e.is_benign() {
        debug!("No {what} for {}: {e}", resource.identifier);
    } else {
        error!("Failed to fetch {what} for {}: {e}", resource.identifier);
    }
}

fn provenance(resource: &EnrichedResource, resource_type: String) -> Provenance {
    Provenance {
        resource_type,
        ..Provenance::for_resource(Platform::Aws, resource)
    }
}

/// EC2 instance user data, already base64 encoded by the API.
pub struct InstanceUserData {
    api: SharedAwsApi,
}

impl InstanceUserData {
    pub const TYPE: &'static str = "AWS::EC2::Instance";

    pub fn new(api: SharedAwsApi) -> Self {
        Self { api }
    }
}

#[async_trait]
impl Stage<EnrichedResource, ScannerPayload> for InstanceUserData {
    fn name(&self) -> &'static str {
        "aws-ec2-user-data"
    }

    async fn apply(&self, ctx: StageContext, mut inbox: Inbox<EnrichedResource>, outbox: Outbox<ScannerPayload>) {
        while let Some(resource) = inbox.recv(&ctx).await {
            if resource.type_name != Self::TYPE {
                continue;
            }
            let fetched = tokio::select! {
                biased;
                _ = ctx.cancelled() => break,
                r = self.api.instance_user_data(&resource.region, &resource.identifier) => r,
            };
            match fetched {
                Ok(Some(user_data)) if !user_data.is_empty() => {
                    let payload = ScannerPayload::base64(
                        user_data,
                        provenance(&resource, format!("{}::UserData", Self::TYPE)),
                    );
                    if !outbox.send(payload) {
                        break;
                    }
                }
                Ok(_) => debug!("{} has no user data", resource.identifier),
                Err(e) => log_fetch_error("user data", &resource, &e),
            }
        }
    }
}

/// CloudFormation stack templates.
pub struct StackTemplate {
    api: SharedAwsApi,
}

impl StackTemplate {
    pub const TYPE: &'static str = "AWS::CloudFormation::Stack";

    pub fn new(api: SharedAwsApi) -> Self {
        Self { api }
    }
}

#[async_trait]
impl Stage<EnrichedResource, ScannerPayload> for StackTemplate {
    fn name(&self) -> &'static str {
        "aws-cloudformation-template"
    }

    async fn apply(&self, ctx: StageContext, mut inbox: Inbox<EnrichedResource>, outbox: Outbox<ScannerPayload>) {
        while let Some(resource) = inbox.recv(&ctx).await {
            if resource.type_name != Self::TYPE {
                continue;
            }
            let fetched = tokio::select! {
                biased;
                _ = ctx.cancelled() => break,
                r = self.api.stack_template(&resource.region, &resource.identifier) => r,
            };
            match fetched {
                Ok(Some(body)) if !body.is_empty() => {
                    let payload =
                        ScannerPayload::text(body, provenance(&resource, format!("{}::Template", Self::TYPE)));
                    if !outbox.send(payload) {
                        break;
                    }
                }
                Ok(_) => debug!("{} has an empty template", resource.identifier),
                Err(e) => log_fetch_error("template", &resource, &e),
            }
        }
    }
}

/// Turns ECR repositories into pullable images: the latest tag plus
/// registry credentials for the repository's region.
pub struct EcrImages {
    api: SharedAwsApi,
}

impl EcrImages {
    pub const TYPE: &'static str = "AWS::ECR::Repository";

    pub fn new(api: SharedAwsApi) -> Self {
        Self { api }
    }

    fn repository_uri(resource: &EnrichedResource) -> String {
        resource.property_str("RepositoryUri").unwrap_or_else(|| {
            format!(
                "{}.dkr.ecr.{}.amazonaws.com/{}",
                resource.account_id, resource.region, resource.identifier
            )
        })
    }

    async fn image_for(&self, resource: &EnrichedResource) -> Result<Option<ImageContext>, ProviderError> {
        let Some(tag) = self.api.latest_image_tag(&resource.region, &resource.identifier).await? else {
            return Ok(None);
        };
        let credentials = self.api.registry_credentials(&resource.region).await?;
        Ok(Some(ImageContext {
            image: format!("{}:{tag}", Self::repository_uri(resource)),
            credentials: Some(credentials),
        }))
    }
}

#[async_trait]
impl Stage<EnrichedResource, ImageContext> for EcrImages {
    fn name(&self) -> &'static str {
        "aws-ecr-images"
    }

    async fn apply(&self, ctx: StageContext, mut inbox: Inbox<EnrichedResource>, outbox: Outbox<ImageContext>) {
        while let Some(resource) = inbox.recv(&ctx).await {
            if resource.type_name != Self::TYPE {
                continue;
            }
            let found = tokio::select! {
                biased;
                _ = ctx.cancelled() => break,
                r = self.image_for(&resource) => r,
            };
            match found {
                Ok(Some(image)) => {
                    debug!("Latest image of {} is {}", resource.identifier, image.image);
                    if !outbox.send(image) {
                        break;
                    }
                }
                Ok(None) => debug!("{} has no tagged images", resource.identifier),
                Err(e) => log_fetch_error("images", &resource, &e),
            }
        }
    }
}

/// Fills in ECR credentials for images that have none configured.
///
/// Images outside ECR, or whose credentials cannot be fetched, pass through
/// unchanged and are pulled anonymously.
pub struct EcrLogin {
    api: SharedAwsApi,
}

impl EcrLogin {
    pub fn new(api: SharedAwsApi) -> Self {
        Self { api }
    }
}

#[async_trait]
impl Stage<ImageContext, ImageContext> for EcrLogin {
    fn name(&self) -> &'static str {
        "aws-ecr-login"
    }

    async fn apply(&self, ctx: StageContext, mut inbox: Inbox<ImageContext>, outbox: Outbox<ImageContext>) {
        while let Some(mut image) = inbox.recv(&ctx).await {
            if image.credentials.is_none() {
                if let Some(region) = ecr_region(&image.image) {
                    let fetched = tokio::select! {
                        biased;
                        _ = ctx.cancelled() => break,
                        r = self.api.registry_credentials(&region) => r,
                    };
                    match fetched {
                        Ok(credentials) => image.credentials = Some(credentials),
                        Err(e) if e.is_benign() => debug!("No ECR credentials for {}: {e}", image.image),
                        Err(e) => error!("Failed to fetch ECR credentials for {}: {e}", image.image),
                    }
                }
            }
            if !outbox.send(image) {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        aws::{AwsApi, ResourcePage},
        docker::RegistryCredentials,
        options::OptionSet,
        payload::PayloadContent,
        pipeline::{run_to_end, Generator, StageExt},
    };

    struct Content;

    #[async_trait]
    impl AwsApi for Content {
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

        async fn instance_user_data(&self, _region: &str, id: &str) -> Result<Option<String>, ProviderError> {
            Ok((id == "i-1").then(|| "ZWNobyBoaQ==".to_string()))
        }

        async fn latest_image_tag(&self, _region: &str, _repo: &str) -> Result<Option<String>, ProviderError> {
            Ok(Some("v2".into()))
        }

        async fn registry_credentials(&self, region: &str) -> Result<RegistryCredentials, ProviderError> {
            Ok(RegistryCredentials {
                server: format!("https://1.dkr.ecr.{region}.amazonaws.com"),
                username: "AWS".into(),
                password: "token".into(),
            })
        }
    }

    #[tokio::test]
    async fn user_data_only_for_instances() {
        let ctx = StageContext::new(OptionSet::new());
        let inputs = vec![
            EnrichedResource::new("i-1", "AWS::EC2::Instance", "us-east-1", "1", "{}"),
            EnrichedResource::new("i-2", "AWS::EC2::Instance", "us-east-1", "1", "{}"),
            EnrichedResource::new("b", "AWS::S3::Bucket", "us-east-1", "1", "{}"),
        ];
        let stage = Generator::new(inputs).then(InstanceUserData::new(Arc::new(Content)));
        let out = run_to_end(stage.boxed(), &ctx).await;
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].content, PayloadContent::ContentBase64("ZWNobyBoaQ==".into()));
        assert_eq!(out[0].provenance.resource_type, "AWS::EC2::Instance::UserData");
        assert_eq!(out[0].provenance.resource_id, "i-1");
    }

    #[tokio::test]
    async fn ecr_repositories_become_images() {
        let ctx = StageContext::new(OptionSet::new());
        let repo = EnrichedResource::new(
            "app",
            "AWS::ECR::Repository",
            "eu-west-1",
            "1",
            r#"{"RepositoryUri":"1.dkr.ecr.eu-west-1.amazonaws.com/app"}"#,
        );
        let stage = Generator::new(vec![repo]).then(EcrImages::new(Arc::new(Content)));
        let out = run_to_end(stage.boxed(), &ctx).await;
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].image, "1.dkr.ecr.eu-west-1.amazonaws.com/app:v2");
        assert!(out[0].needs_login());
    }

    #[tokio::test]
    async fn ecr_login_only_touches_anonymous_ecr_images() {
        let ctx = StageContext::new(OptionSet::new());
        let images = vec![
            ImageContext::anonymous("1.dkr.ecr.ap-south-1.amazonaws.com/app:1"),
            ImageContext::anonymous("nginx:latest"),
        ];
        let out = run_to_end(Generator::new(images).then(EcrLogin::new(Arc::new(Content))).boxed(), &ctx).await;
        assert_eq!(out.len(), 2);
        let server = out[0].credentials.as_ref().map(|c| c.server.as_str());
        assert_eq!(server, Some("https://1.dkr.ecr.ap-south-1.amazonaws.com"));
        assert!(out[1].credentials.is_none());
    }
}
