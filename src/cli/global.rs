use clap::{ArgAction, Args, Parser, Subcommand};
use tracing_core::metadata::LevelFilter;

use crate::{
    cli::commands::{aws::AwsArgs, azure::AzureArgs, docker::DockerArgs, ToOptions},
    modules::ModuleId,
    options::OptionSet,
};

#[deny(missing_docs)]
#[derive(Parser, Debug)]
#[command(version = env!("CARGO_PKG_VERSION"))]
/// Cloudsweep - Enumerate cloud resources and scan them for secrets
pub struct CommandLineArgs {
    /// The command to execute
    #[command(subcommand)]
    pub command: Command,

    /// Global arguments that apply to all subcommands
    #[command(flatten)]
    pub global_args: GlobalArgs,
}

impl CommandLineArgs {
    pub fn parse_args() -> Self {
        CommandLineArgs::parse()
    }
}

/// Top-level subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run an AWS module
    #[command(name = "aws")]
    Aws(AwsArgs),

    /// Run an Azure module
    #[command(name = "azure")]
    Azure(AzureArgs),

    /// Run a container image module
    #[command(name = "docker")]
    Docker(DockerArgs),

    /// List the available modules and their options
    #[command(alias = "list-modules")]
    Modules,
}

impl Command {
    /// The module this command runs and the options collected for it, or
    /// `None` for commands that do not run a module.
    pub fn module(&self) -> Option<(ModuleId, OptionSet)> {
        let mut options = OptionSet::new();
        let id = match self {
            Command::Aws(args) => {
                args.to_options(&mut options);
                args.command.module()
            }
            Command::Azure(args) => {
                args.to_options(&mut options);
                args.command.module()
            }
            Command::Docker(args) => {
                args.to_options(&mut options);
                args.command.module()
            }
            Command::Modules => return None,
        };
        Some((id, options))
    }
}

/// Top-level global CLI arguments
#[derive(Args, Debug, Clone, Default)]
#[command(next_help_heading = "Global Options")]
pub struct GlobalArgs {
    /// Enable verbose output (up to 3 times for more detail)
    #[arg(global = true, long = "verbose", short = 'v', action = ArgAction::Count)]
    pub verbose: u8,

    /// Only report warnings and errors
    #[arg(global = true, long, short)]
    pub quiet: bool,
}

impl GlobalArgs {
    pub fn log_level(&self) -> LevelFilter {
        if self.quiet {
            LevelFilter::WARN
        } else {
            match self.verbose {
                0 => LevelFilter::INFO,  // Default level if no `-v` is provided
                1 => LevelFilter::DEBUG, // `-v`
                _ => LevelFilter::TRACE, // `-vv` or more
            }
        }
    }
}
