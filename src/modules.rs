//! Named pipelines.
//!
//! Each module declares the options it consumes, validates them when it is
//! built (a validation failure means no stage runs), wires its stages and is
//! then driven to completion by [`run_module`].

use std::sync::Arc;

use anyhow::{Context, Result};
use strum::{Display, EnumIter, EnumString, IntoEnumIterator};
use tracing::{debug, info};

use crate::{
    aws::{
        find_secrets_types, BucketPolicy, CloudControlGet, CloudControlList, EcrLogin, FindSecrets,
        FunctionPolicy, LaunchPermissions, ResourceTarget, SdkAwsApi, SharedAwsApi,
    },
    azure::{
        azure_find_secrets_types, ArgQueryResult, ArgTemplates, ArmClient, AzureFindSecrets, CountResources,
        ListResources, ResourceCount, SharedAzureApi, Subscriptions,
    },
    docker::{ImageContext, ImageExtract, ImagePull, ImageSave, RegistryRuntime, SharedRuntime},
    enrich::Enrich,
    options::{
        OptionSet, OptionSpec, DOCKER_PASSWORD, DOCKER_USER, FILENAME_SPEC, IMAGE, OUTPUT_SPEC, PROFILE,
        REGIONS, RESOURCE_ID, RESOURCE_TYPE, RESOURCE_TYPES, ROLE_ARN, SCANNER_SPECS, SUBSCRIPTIONS,
        TEMPLATE_DIR, WORKERS_SPEC,
    },
    payload::ScannerPayload,
    pipeline::{
        launch_source, split_list, Aggregate, BoxStage, Echo, Generator, Map, Shutdown, SplitByComma, StageContext,
        StageExt, Switch, Unique,
    },
    report::{Report, ReportRecord},
    resource::EnrichedResource,
    scanner::{ScannerBridge, ScannerSettings, ScannerSummary},
    templates::templates_for,
    util::Counted,
};

/// Resource types `aws/list-all` enumerates when `resource-types` is `ALL`.
pub const AWS_LIST_ALL_TYPES: &[&str] = &[
    "AWS::CloudFormation::Stack",
    "AWS::DynamoDB::Table",
    "AWS::EC2::Image",
    "AWS::EC2::Instance",
    "AWS::EC2::SecurityGroup",
    "AWS::EC2::Snapshot",
    "AWS::EC2::Volume",
    "AWS::ECR::Repository",
    "AWS::ECS::Cluster",
    "AWS::ECS::TaskDefinition",
    "AWS::EFS::FileSystem",
    "AWS::IAM::Role",
    "AWS::IAM::User",
    "AWS::KMS::Key",
    "AWS::Lambda::Function",
    "AWS::RDS::DBInstance",
    "AWS::Route53::HostedZone",
    "AWS::S3::Bucket",
    "AWS::SecretsManager::Secret",
    "AWS::SNS::Topic",
    "AWS::SQS::Queue",
    "AWS::SSM::Parameter",
    "AWS::StepFunctions::StateMachine",
];

/// Resource types that carry a resource policy `aws/resource-policies` fetches.
pub const AWS_POLICY_TYPES: &[&str] = &["AWS::EC2::Image", "AWS::Lambda::Function", "AWS::S3::Bucket"];

const PROFILE_SPEC: OptionSpec = OptionSpec::optional(PROFILE, "", "AWS shared-config profile");
const ROLE_ARN_SPEC: OptionSpec = OptionSpec::optional(ROLE_ARN, "", "IAM role to assume before enumerating");
const REGIONS_SPEC: OptionSpec =
    OptionSpec::optional(REGIONS, "all", "Comma-separated AWS regions, or `all` for every enabled region");
const AWS_TYPES_SPEC: OptionSpec =
    OptionSpec::optional(RESOURCE_TYPES, "ALL", "Comma-separated Cloud Control type names, or `ALL`");
const GET_REGION_SPEC: OptionSpec =
    OptionSpec::optional(REGIONS, "us-east-1", "AWS region holding the resources; only the first entry is used");
const RESOURCE_TYPE_SPEC: OptionSpec =
    OptionSpec::required(RESOURCE_TYPE, "Cloud Control type name of the resources, e.g. AWS::S3::Bucket");
const RESOURCE_ID_SPEC: OptionSpec =
    OptionSpec::required(RESOURCE_ID, "Comma-separated primary identifiers of the resources to fetch");
const SUBSCRIPTIONS_SPEC: OptionSpec =
    OptionSpec::optional(SUBSCRIPTIONS, "all", "Comma-separated subscription ids, or `all`");
const AZURE_TYPES_SPEC: OptionSpec = OptionSpec::optional(
    RESOURCE_TYPES,
    "",
    "Comma-separated Azure resource types, `ALL`, or empty for virtual machines and web sites",
);
const TEMPLATE_DIR_SPEC: OptionSpec =
    OptionSpec::optional(TEMPLATE_DIR, "", "Directory of Resource Graph query templates (builtin set when empty)");
const IMAGE_SPEC: OptionSpec = OptionSpec::required(IMAGE, "Comma-separated container images to scan");
const DOCKER_USER_SPEC: OptionSpec = OptionSpec::optional(DOCKER_USER, "", "Registry user name");
const DOCKER_PASSWORD_SPEC: OptionSpec = OptionSpec::optional(DOCKER_PASSWORD, "", "Registry password");

#[derive(Copy, Clone, Debug, Display, EnumIter, EnumString, PartialEq, Eq, Hash)]
pub enum ModuleId {
    #[strum(serialize = "aws/list-all")]
    AwsListAll,
    #[strum(serialize = "aws/resource-policies")]
    AwsResourcePolicies,
    #[strum(serialize = "aws/find-secrets")]
    AwsFindSecrets,
    #[strum(serialize = "aws/get-resource")]
    AwsGetResource,
    #[strum(serialize = "azure/list-all")]
    AzureListAll,
    #[strum(serialize = "azure/arg-scan")]
    AzureArgScan,
    #[strum(serialize = "azure/find-secrets")]
    AzureFindSecrets,
    #[strum(serialize = "azure/summary")]
    AzureSummary,
    #[strum(serialize = "docker/find-secrets")]
    DockerFindSecrets,
}

impl ModuleId {
    pub fn all() -> impl Iterator<Item = ModuleId> {
        ModuleId::iter()
    }

    pub fn description(self) -> &'static str {
        match self {
            ModuleId::AwsListAll => "List resources of the selected Cloud Control types in every region",
            ModuleId::AwsResourcePolicies => "List resources that carry resource policies, with their policies",
            ModuleId::AwsFindSecrets => "Scan user data, templates, images and properties of AWS resources for secrets",
            ModuleId::AwsGetResource => "Fetch the current properties of specific resources through Cloud Control",
            ModuleId::AzureListAll => "List every resource in the selected subscriptions",
            ModuleId::AzureArgScan => "Run Resource Graph query templates against the selected subscriptions",
            ModuleId::AzureFindSecrets => "Scan user data and properties of Azure resources for secrets",
            ModuleId::AzureSummary => "Count the resources of each type in the selected subscriptions",
            ModuleId::DockerFindSecrets => "Scan the files of container images for secrets",
        }
    }

    /// The options this module consumes.
    pub fn options(self) -> Vec<OptionSpec> {
        let mut specs = vec![OUTPUT_SPEC, FILENAME_SPEC];
        match self {
            ModuleId::AwsListAll | ModuleId::AwsResourcePolicies | ModuleId::AwsFindSecrets => {
                specs.extend([PROFILE_SPEC, ROLE_ARN_SPEC, REGIONS_SPEC, AWS_TYPES_SPEC, WORKERS_SPEC]);
            }
            ModuleId::AwsGetResource => {
                specs.extend([PROFILE_SPEC, ROLE_ARN_SPEC, GET_REGION_SPEC, RESOURCE_TYPE_SPEC, RESOURCE_ID_SPEC]);
            }
            ModuleId::AzureListAll | ModuleId::AzureFindSecrets | ModuleId::AzureSummary => {
                specs.extend([SUBSCRIPTIONS_SPEC, WORKERS_SPEC]);
            }
            ModuleId::AzureArgScan => specs.extend([SUBSCRIPTIONS_SPEC, TEMPLATE_DIR_SPEC]),
            ModuleId::DockerFindSecrets => {
                specs.extend([IMAGE_SPEC, DOCKER_USER_SPEC, DOCKER_PASSWORD_SPEC, PROFILE_SPEC]);
            }
        }
        if self == ModuleId::AzureFindSecrets {
            specs.push(AZURE_TYPES_SPEC);
        }
        if self.uses_scanner() {
            specs.extend(SCANNER_SPECS.iter().filter(|s| s.name != OUTPUT_SPEC.name && s.name != FILENAME_SPEC.name));
        }
        specs
    }

    pub fn uses_scanner(self) -> bool {
        matches!(self, ModuleId::AwsFindSecrets | ModuleId::AzureFindSecrets | ModuleId::DockerFindSecrets)
    }

    fn report_prefix(self) -> &'static str {
        match self {
            ModuleId::AwsListAll => "aws-list-all",
            ModuleId::AwsResourcePolicies => "aws-resource-policies",
            ModuleId::AwsFindSecrets => "aws-find-secrets",
            ModuleId::AwsGetResource => "aws-get-resource",
            ModuleId::AzureListAll => "azure-list-all",
            ModuleId::AzureArgScan => "azure-arg-scan",
            ModuleId::AzureFindSecrets => "azure-find-secrets",
            ModuleId::AzureSummary => "azure-summary",
            ModuleId::DockerFindSecrets => "docker-find-secrets",
        }
    }
}

type AwsFactory = Box<dyn Fn(&OptionSet) -> SharedAwsApi + Send + Sync>;
type AzureFactory = Box<dyn Fn() -> Result<SharedAzureApi> + Send + Sync>;
type RuntimeFactory = Box<dyn Fn() -> Result<SharedRuntime> + Send + Sync>;

/// Where modules get their provider clients from.
///
/// Each stage asks for its own client, so credentials are never shared
/// between stages. Tests swap in stubs with the `with_*` methods.
pub struct Providers {
    aws: AwsFactory,
    azure: AzureFactory,
    runtime: RuntimeFactory,
}

impl Default for Providers {
    fn default() -> Self {
        Self {
            aws: Box::new(|options: &OptionSet| -> SharedAwsApi { Arc::new(SdkAwsApi::from_options(options)) }),
            azure: Box::new(|| -> Result<SharedAzureApi> { Ok(Arc::new(ArmClient::from_environment()?)) }),
            runtime: Box::new(|| -> Result<SharedRuntime> { Ok(Arc::new(RegistryRuntime::new())) }),
        }
    }
}

impl Providers {
    pub fn with_aws(mut self, api: SharedAwsApi) -> Self {
        self.aws = Box::new(move |_: &OptionSet| api.clone());
        self
    }

    pub fn with_azure(mut self, api: SharedAzureApi) -> Self {
        self.azure = Box::new(move || -> Result<SharedAzureApi> { Ok(api.clone()) });
        self
    }

    pub fn with_runtime(mut self, runtime: SharedRuntime) -> Self {
        self.runtime = Box::new(move || -> Result<SharedRuntime> { Ok(runtime.clone()) });
        self
    }

    fn aws(&self, options: &OptionSet) -> SharedAwsApi {
        (self.aws)(options)
    }

    fn azure(&self) -> Result<SharedAzureApi> {
        (self.azure)().context("Failed to set up the Azure client")
    }

    fn runtime(&self) -> Result<SharedRuntime> {
        (self.runtime)().context("Failed to set up the container runtime")
    }
}

/// A built module, ready to be driven.
pub enum Pipeline {
    Resources(BoxStage<(), EnrichedResource>),
    Findings(BoxStage<(), ArgQueryResult>),
    Counts(BoxStage<(), ResourceCount>),
    Scanner(BoxStage<(), String>),
}

fn aws_types(options: &OptionSet, all: &[&str]) -> Vec<String> {
    let raw = options.value(RESOURCE_TYPES);
    if raw.trim().eq_ignore_ascii_case("all") {
        all.iter().map(|t| t.to_string()).collect()
    } else {
        split_list(&raw)
    }
}

fn reported<R>(id: ModuleId, title: &'static str, stage: BoxStage<(), R>) -> BoxStage<(), R>
where
    R: ReportRecord + Clone,
{
    stage.then(Report::new(title, id.report_prefix())).boxed()
}

fn scanned(id: ModuleId, payloads: BoxStage<(), ScannerPayload>) -> BoxStage<(), String> {
    let scanner = payloads.then(ScannerBridge).then(ScannerSummary);
    reported(id, "Secret scan summary", scanner.boxed()).then(Echo::default()).boxed()
}

/// Validates `options` against the module's declarations and wires its stages.
pub fn build(id: ModuleId, options: &mut OptionSet, providers: &Providers) -> Result<Pipeline> {
    options.validate(&id.options()).with_context(|| format!("Invalid options for {id}"))?;
    if id.uses_scanner() {
        ScannerSettings::from_options(options).context("Secret scanner is not available")?;
    }

    let pipeline = match id {
        ModuleId::AwsListAll => {
            let types = aws_types(options, AWS_LIST_ALL_TYPES);
            let listing = Generator::new(types).then(CloudControlList::new(providers.aws(options)));
            Pipeline::Resources(reported(id, "AWS resources", listing.boxed()))
        }
        ModuleId::AwsResourcePolicies => {
            let types = aws_types(options, AWS_POLICY_TYPES);
            let policies = Switch::new(
                |r: &EnrichedResource| match r.type_name.as_str() {
                    "AWS::EC2::Image" => Some(0),
                    "AWS::Lambda::Function" => Some(1),
                    "AWS::S3::Bucket" => Some(2),
                    _ => None,
                },
                vec![
                    Enrich::new(LaunchPermissions::new(providers.aws(options))).boxed(),
                    Enrich::new(FunctionPolicy::new(providers.aws(options))).boxed(),
                    Enrich::new(BucketPolicy::new(providers.aws(options))).boxed(),
                ],
            );
            let listing = Generator::new(types).then(CloudControlList::new(providers.aws(options))).then(policies);
            Pipeline::Resources(reported(id, "AWS resource policies", listing.boxed()))
        }
        ModuleId::AwsFindSecrets => {
            let types = find_secrets_types(&options.value(RESOURCE_TYPES));
            let payloads = Generator::new(types)
                .then(CloudControlList::new(providers.aws(options)))
                .then(FindSecrets::new(providers.aws(options), providers.runtime()?));
            Pipeline::Scanner(scanned(id, payloads.boxed()))
        }
        ModuleId::AwsGetResource => {
            let type_name = options.value(RESOURCE_TYPE).trim().to_string();
            let targets = Generator::new([options.value(RESOURCE_ID)])
                .then(SplitByComma)
                .then(Unique::default())
                .then(Map::new("aws-resource-target", move |identifier: String| {
                    ResourceTarget::new(type_name.clone(), identifier)
                }))
                .then(CloudControlGet::new(providers.aws(options)));
            Pipeline::Resources(reported(id, "AWS resources", targets.boxed()))
        }
        ModuleId::AzureListAll => {
            let api = providers.azure()?;
            let listing = Subscriptions::new(api.clone()).then(ListResources::new(api));
            Pipeline::Resources(reported(id, "Azure resources", listing.boxed()))
        }
        ModuleId::AzureArgScan => {
            let templates = templates_for(&options.value(TEMPLATE_DIR))?;
            info!("Loaded {}", Counted::regular(templates.len(), "Resource Graph template"));
            let api = providers.azure()?;
            let findings = Subscriptions::new(api.clone()).then(ArgTemplates::new(api, templates));
            Pipeline::Findings(reported(id, "Azure Resource Graph findings", findings.boxed()))
        }
        ModuleId::AzureSummary => {
            let api = providers.azure()?;
            let counts = Subscriptions::new(api.clone())
                .then(Unique::default())
                .then(ListResources::new(api))
                .then(Aggregate::default())
                .then(CountResources);
            Pipeline::Counts(reported(id, "Azure resource summary", counts.boxed()))
        }
        ModuleId::AzureFindSecrets => {
            let types = azure_find_secrets_types(&options.value(RESOURCE_TYPES));
            let api = providers.azure()?;
            let payloads = Subscriptions::new(api.clone())
                .then(ListResources::new(api.clone()))
                .then(AzureFindSecrets::new(api, types));
            Pipeline::Scanner(scanned(id, payloads.boxed()))
        }
        ModuleId::DockerFindSecrets => {
            let images = ImageContext::from_options(options);
            let runtime = providers.runtime()?;
            let payloads = Generator::new(images)
                .then(EcrLogin::new(providers.aws(options)))
                .then(ImagePull::new(runtime.clone()))
                .then(ImageSave::new(runtime))
                .then(ImageExtract);
            Pipeline::Scanner(scanned(id, payloads.boxed()))
        }
    };
    Ok(pipeline)
}

async fn drive<O: Send + 'static>(stage: BoxStage<(), O>, ctx: &StageContext) -> usize {
    let (output, handle) = launch_source(stage, ctx);
    let produced = output.drain().await;
    let _ = handle.await;
    produced
}

/// Builds and runs a module to completion, returning how many records its
/// final stage produced.
pub async fn run_module(
    id: ModuleId,
    mut options: OptionSet,
    providers: &Providers,
    shutdown: Shutdown,
) -> Result<usize> {
    let pipeline = build(id, &mut options, providers)?;
    let ctx = StageContext::with_shutdown(Arc::new(options), shutdown);
    info!("Running {id}");
    let produced = match pipeline {
        Pipeline::Resources(stage) => drive(stage, &ctx).await,
        Pipeline::Findings(stage) => drive(stage, &ctx).await,
        Pipeline::Counts(stage) => drive(stage, &ctx).await,
        Pipeline::Scanner(stage) => drive(stage, &ctx).await,
    };
    debug!("{id} finished with {produced} records; {} tasks still live", ctx.live_tasks());
    Ok(produced)
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;
    use crate::options::OptionError;

    #[test]
    fn module_ids_round_trip_through_strings() {
        for id in ModuleId::all() {
            assert_eq!(ModuleId::from_str(&id.to_string()).ok(), Some(id));
            assert!(!id.description().is_empty());
            assert_eq!(id.report_prefix(), id.to_string().replace('/', "-"));
        }
        assert!(ModuleId::from_str("gcp/list-all").is_err());
    }

    #[test]
    fn scanner_modules_declare_scanner_options() {
        let names: Vec<_> = ModuleId::DockerFindSecrets.options().iter().map(|s| s.name).collect();
        assert!(names.contains(&"np-path"));
        assert!(names.contains(&"image"));
        assert_eq!(names.iter().filter(|n| **n == "output").count(), 1);
        let names: Vec<_> = ModuleId::AzureArgScan.options().iter().map(|s| s.name).collect();
        assert!(!names.contains(&"np-path"));
    }

    #[test]
    fn missing_required_options_fail_construction() {
        let mut options = OptionSet::new();
        let err = build(ModuleId::DockerFindSecrets, &mut options, &Providers::default())
            .err()
            .and_then(|e| e.downcast::<OptionError>().ok());
        assert_eq!(err, Some(OptionError::Missing("image")));
    }

    #[test]
    fn get_resource_needs_a_type_and_identifiers() {
        let mut options = OptionSet::new().with(RESOURCE_TYPE, "AWS::S3::Bucket");
        let err = build(ModuleId::AwsGetResource, &mut options, &Providers::default())
            .err()
            .and_then(|e| e.downcast::<OptionError>().ok());
        assert_eq!(err, Some(OptionError::Missing("resource-id")));

        let mut options = OptionSet::new().with(RESOURCE_TYPE, "AWS::S3::Bucket").with(RESOURCE_ID, "a,b");
        assert!(build(ModuleId::AwsGetResource, &mut options, &Providers::default()).is_ok());
        assert_eq!(options.value(REGIONS), "us-east-1");
    }

    #[test]
    fn invalid_worker_counts_fail_construction() {
        let mut options = OptionSet::new().with(crate::options::WORKERS, "0");
        let err = build(ModuleId::AwsListAll, &mut options, &Providers::default())
            .err()
            .and_then(|e| e.downcast::<OptionError>().ok());
        assert!(matches!(err, Some(OptionError::Invalid { name: "workers", .. })));
    }

    #[test]
    fn all_expands_to_builtin_type_lists() {
        let options = OptionSet::new().with(RESOURCE_TYPES, "all");
        assert_eq!(aws_types(&options, AWS_POLICY_TYPES).len(), 3);
        let options = OptionSet::new().with(RESOURCE_TYPES, "AWS::S3::Bucket");
        assert_eq!(aws_types(&options, AWS_LIST_ALL_TYPES), vec!["AWS::S3::Bucket"]);
    }
}
