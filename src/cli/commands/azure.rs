use std::path::PathBuf;

use clap::{Args, Subcommand, ValueHint};

use super::{set_list, set_opt, OutputArgs, ScannerArgs, ToOptions};
use crate::{
    modules::ModuleId,
    options::{OptionSet, RESOURCE_TYPES, SUBSCRIPTIONS, TEMPLATE_DIR, WORKERS},
};

#[derive(Args, Debug)]
pub struct AzureArgs {
    #[command(subcommand)]
    pub command: AzureCommand,

    /// Subscriptions to enumerate, or `all` for every enabled subscription
    #[arg(global = true, long, value_delimiter = ',', value_name = "SUBSCRIPTION")]
    pub subscriptions: Vec<String>,

    /// Maximum number of concurrent enumeration workers
    #[arg(global = true, long, value_name = "N")]
    pub workers: Option<usize>,

    #[command(flatten)]
    pub output_args: OutputArgs,
}

#[derive(Subcommand, Debug)]
pub enum AzureCommand {
    /// List every resource in the selected subscriptions
    ListAll,

    /// Run Resource Graph query templates against the selected subscriptions
    ArgScan(ArgScanArgs),

    /// Scan user data and properties of Azure resources for secrets
    FindSecrets(AzureFindSecretsArgs),

    /// Count the resources of each type in the selected subscriptions
    Summary,
}

#[derive(Args, Debug, Clone)]
pub struct ArgScanArgs {
    /// Directory of YAML query templates; the builtin set is used when omitted
    #[arg(long, value_name = "DIR", value_hint = ValueHint::DirPath)]
    pub template_dir: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct AzureFindSecretsArgs {
    /// Resource types to scan, or `ALL`; defaults to virtual machines and web apps
    #[arg(long, value_delimiter = ',', value_name = "TYPE")]
    pub resource_types: Vec<String>,

    #[command(flatten)]
    pub scanner_args: ScannerArgs,
}

impl AzureCommand {
    pub fn module(&self) -> ModuleId {
        match self {
            AzureCommand::ListAll => ModuleId::AzureListAll,
            AzureCommand::ArgScan(_) => ModuleId::AzureArgScan,
            AzureCommand::FindSecrets(_) => ModuleId::AzureFindSecrets,
            AzureCommand::Summary => ModuleId::AzureSummary,
        }
    }
}

impl ToOptions for AzureArgs {
    fn to_options(&self, options: &mut OptionSet) {
        self.output_args.to_options(options);
        set_list(options, SUBSCRIPTIONS, &self.subscriptions);
        set_opt(options, WORKERS, self.workers);
        match &self.command {
            AzureCommand::ListAll | AzureCommand::Summary => {}
            AzureCommand::ArgScan(args) => {
                set_opt(options, TEMPLATE_DIR, args.template_dir.as_ref().map(|p| p.display()));
            }
            AzureCommand::FindSecrets(args) => {
                set_list(options, RESOURCE_TYPES, &args.resource_types);
                args.scanner_args.to_options(options);
            }
        }
    }
}
