use clap::{Args, Subcommand};

use super::{set_list, set_opt, OutputArgs, ScannerArgs, ToOptions};
use crate::{
    modules::ModuleId,
    options::{OptionSet, DOCKER_PASSWORD, DOCKER_USER, IMAGE, PROFILE},
};

#[derive(Args, Debug)]
pub struct DockerArgs {
    #[command(subcommand)]
    pub command: DockerCommand,

    #[command(flatten)]
    pub output_args: OutputArgs,
}

#[derive(Subcommand, Debug)]
pub enum DockerCommand {
    /// Scan the files of container images for secrets
    FindSecrets(DockerFindSecretsArgs),
}

#[derive(Args, Debug, Clone)]
pub struct DockerFindSecretsArgs {
    /// Image references to scan; repeat or separate with commas
    #[arg(long, value_delimiter = ',', value_name = "IMAGE")]
    pub image: Vec<String>,

    /// Registry user name
    #[arg(long, value_name = "USER")]
    pub docker_user: Option<String>,

    /// Registry password
    #[arg(long, env = "CLOUDSWEEP_DOCKER_PASSWORD", hide_env_values = true, value_name = "PASSWORD")]
    pub docker_password: Option<String>,

    /// AWS profile used to log in to ECR registries
    #[arg(long, value_name = "PROFILE")]
    pub profile: Option<String>,

    #[command(flatten)]
    pub scanner_args: ScannerArgs,
}

impl DockerCommand {
    pub fn module(&self) -> ModuleId {
        match self {
            DockerCommand::FindSecrets(_) => ModuleId::DockerFindSecrets,
        }
    }
}

impl ToOptions for DockerArgs {
    fn to_options(&self, options: &mut OptionSet) {
        self.output_args.to_options(options);
        match &self.command {
            DockerCommand::FindSecrets(args) => {
                set_list(options, IMAGE, &args.image);
                set_opt(options, DOCKER_USER, args.docker_user.as_ref());
                set_opt(options, DOCKER_PASSWORD, args.docker_password.as_ref());
                set_opt(options, PROFILE, args.profile.as_ref());
                args.scanner_args.to_options(options);
            }
        }
    }
}
