use clap::{Args, Subcommand};

use super::{set_list, set_opt, OutputArgs, ScannerArgs, ToOptions};
use crate::{
    modules::ModuleId,
    options::{OptionSet, PROFILE, REGIONS, RESOURCE_ID, RESOURCE_TYPE, RESOURCE_TYPES, ROLE_ARN, WORKERS},
};

#[derive(Args, Debug)]
pub struct AwsArgs {
    #[command(subcommand)]
    pub command: AwsCommand,

    /// Shared-config profile to load credentials from
    #[arg(global = true, long, value_name = "PROFILE")]
    pub profile: Option<String>,

    /// IAM role to assume before enumerating
    #[arg(global = true, long, value_name = "ARN")]
    pub role_arn: Option<String>,

    /// Regions to enumerate, or `all` for every enabled region
    #[arg(global = true, long, value_delimiter = ',', value_name = "REGION")]
    pub regions: Vec<String>,

    /// Cloud Control resource types, or `ALL` for the module's builtin list
    #[arg(global = true, long, value_delimiter = ',', value_name = "TYPE")]
    pub resource_types: Vec<String>,

    /// Maximum number of concurrent enumeration workers
    #[arg(global = true, long, value_name = "N")]
    pub workers: Option<usize>,

    #[command(flatten)]
    pub output_args: OutputArgs,
}

#[derive(Subcommand, Debug)]
pub enum AwsCommand {
    /// List resources of the selected types in every region
    ListAll,

    /// List resources that carry resource policies, with their policies
    ResourcePolicies,

    /// Scan user data, templates, images and properties for secrets
    FindSecrets(ScannerArgs),

    /// Fetch the current properties of specific resources
    GetResource(GetResourceArgs),
}

#[derive(Args, Debug, Clone)]
pub struct GetResourceArgs {
    /// Cloud Control type name, e.g. AWS::S3::Bucket
    #[arg(long, value_name = "TYPE")]
    pub resource_type: String,

    /// Primary identifiers of the resources to fetch
    #[arg(long = "resource-id", required = true, value_delimiter = ',', value_name = "ID")]
    pub resource_ids: Vec<String>,
}

impl AwsCommand {
    pub fn module(&self) -> ModuleId {
        match self {
            AwsCommand::ListAll => ModuleId::AwsListAll,
            AwsCommand::ResourcePolicies => ModuleId::AwsResourcePolicies,
            AwsCommand::FindSecrets(_) => ModuleId::AwsFindSecrets,
            AwsCommand::GetResource(_) => ModuleId::AwsGetResource,
        }
    }
}

impl ToOptions for AwsArgs {
    fn to_options(&self, options: &mut OptionSet) {
        self.output_args.to_options(options);
        set_opt(options, PROFILE, self.profile.as_ref());
        set_opt(options, ROLE_ARN, self.role_arn.as_ref());
        set_list(options, REGIONS, &self.regions);
        set_list(options, RESOURCE_TYPES, &self.resource_types);
        set_opt(options, WORKERS, self.workers);
        match &self.command {
            AwsCommand::FindSecrets(scanner) => scanner.to_options(options),
            AwsCommand::GetResource(args) => {
                options.set(RESOURCE_TYPE, args.resource_type.clone());
                set_list(options, RESOURCE_ID, &args.resource_ids);
            }
            AwsCommand::ListAll | AwsCommand::ResourcePolicies => {}
        }
    }
}
