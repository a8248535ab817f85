use async_trait::async_trait;

use super::{EcrImages, InstanceUserData, SharedAwsApi, StackTemplate};
use crate::{
    docker::{ImageExtract, ImagePull, ImageSave, SharedRuntime},
    enrich::PropertiesToPayload,
    payload::{Platform, ScannerPayload},
    pipeline::{split_list, Inbox, Outbox, Stage, StageContext, StageExt, Switch},
    resource::EnrichedResource,
};

/// Resource types the AWS secrets pipeline knows how to mine.
pub const FIND_SECRETS_TYPES: &[&str] = &[
    "AWS::CloudFormation::Stack",
    "AWS::EC2::Instance",
    "AWS::ECR::Repository",
    "AWS::ECS::TaskDefinition",
    "AWS::Lambda::Function",
    "AWS::SSM::Document",
    "AWS::SSM::Parameter",
    "AWS::StepFunctions::StateMachine",
];

/// Expands the `resource-types` option; `ALL` (or empty) selects every supported type.
pub fn find_secrets_types(option: &str) -> Vec<String> {
    if option.trim().is_empty() || option.trim().eq_ignore_ascii_case("all") {
        FIND_SECRETS_TYPES.iter().map(|t| t.to_string()).collect()
    } else {
        split_list(option)
    }
}

const USER_DATA: usize = 0;
const TEMPLATE: usize = 1;
const IMAGES: usize = 2;
const PROPERTIES: usize = 3;

fn route(resource: &EnrichedResource) -> Option<usize> {
    match resource.type_name.as_str() {
        InstanceUserData::TYPE => Some(USER_DATA),
        StackTemplate::TYPE => Some(TEMPLATE),
        EcrImages::TYPE => Some(IMAGES),
        _ => Some(PROPERTIES),
    }
}

/// Sends each listed resource down the extraction path for its type.
///
/// EC2 instances yield user data, stacks their templates, ECR repositories
/// their latest image's files; everything else is scanned by properties.
pub struct FindSecrets {
    inner: Switch<EnrichedResource, ScannerPayload>,
}

impl FindSecrets {
    pub fn new(api: SharedAwsApi, runtime: SharedRuntime) -> Self {
        let images = EcrImages::new(api.clone())
            .then(ImagePull::new(runtime.clone()))
            .then(ImageSave::new(runtime))
            .then(ImageExtract);
        let branches = vec![
            InstanceUserData::new(api.clone()).boxed(),
            StackTemplate::new(api).boxed(),
            images.boxed(),
            PropertiesToPayload::new(Platform::Aws).boxed(),
        ];
        Self { inner: Switch::new(route, branches) }
    }
}

#[async_trait]
impl Stage<EnrichedResource, ScannerPayload> for FindSecrets {
    fn name(&self) -> &'static str {
        "aws-find-secrets"
    }

    async fn apply(&self, ctx: StageContext, inbox: Inbox<EnrichedResource>, outbox: Outbox<ScannerPayload>) {
        self.inner.apply(ctx, inbox, outbox).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_option_expansion() {
        assert_eq!(find_secrets_types("ALL").len(), FIND_SECRETS_TYPES.len());
        assert_eq!(find_secrets_types("").len(), FIND_SECRETS_TYPES.len());
        assert_eq!(
            find_secrets_types("AWS::EC2::Instance, AWS::Lambda::Function"),
            vec!["AWS::EC2::Instance", "AWS::Lambda::Function"]
        );
    }

    #[test]
    fn routing() {
        let r = |t: &str| route(&EnrichedResource::new("x", t, "r", "a", "{}"));
        assert_eq!(r("AWS::EC2::Instance"), Some(USER_DATA));
        assert_eq!(r("AWS::CloudFormation::Stack"), Some(TEMPLATE));
        assert_eq!(r("AWS::ECR::Repository"), Some(IMAGES));
        assert_eq!(r("AWS::Lambda::Function"), Some(PROPERTIES));
    }
}
