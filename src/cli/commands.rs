use std::path::PathBuf;

use clap::{Args, ValueHint};

use crate::options::{OptionSet, FILENAME, NP_ARGS, NP_FILTER, NP_OUTPUT, NP_PATH, OUTPUT};

pub mod aws;
pub mod azure;
pub mod docker;

/// Copies the flags a user actually passed into the option registry.
///
/// Flags left unset are not recorded, so module validation fills in the
/// declared defaults.
pub trait ToOptions {
    fn to_options(&self, options: &mut OptionSet);
}

pub(crate) fn set_opt(options: &mut OptionSet, name: &str, value: Option<impl ToString>) {
    if let Some(value) = value {
        options.set(name, value.to_string());
    }
}

pub(crate) fn set_list(options: &mut OptionSet, name: &str, values: &[String]) {
    if !values.is_empty() {
        options.set(name, values.join(","));
    }
}

#[derive(Args, Debug, Clone, Default)]
#[command(next_help_heading = "Output Options")]
pub struct OutputArgs {
    /// Directory for reports and scanner state [default: cloudsweep-output]
    #[arg(global = true, long, short, value_name = "DIR", value_hint = ValueHint::DirPath)]
    pub output: Option<PathBuf>,

    /// Base name for the report files [default: <module>-<unix time>]
    #[arg(global = true, long, value_name = "NAME")]
    pub filename: Option<String>,
}

impl ToOptions for OutputArgs {
    fn to_options(&self, options: &mut OptionSet) {
        set_opt(options, OUTPUT, self.output.as_ref().map(|p| p.display()));
        set_opt(options, FILENAME, self.filename.as_ref());
    }
}

#[derive(Args, Debug, Clone, Default)]
#[command(next_help_heading = "Scanner Options")]
pub struct ScannerArgs {
    /// Scanner datastore, relative to the output directory [default: datastore.np]
    #[arg(long, value_name = "DIR")]
    pub np_output: Option<String>,

    /// Scanner binary [default: noseyparker]
    #[arg(long, value_name = "PATH", value_hint = ValueHint::ExecutablePath)]
    pub np_path: Option<String>,

    /// Extra arguments for the scanner, space separated
    #[arg(long, value_name = "ARGS", allow_hyphen_values = true)]
    pub np_args: Option<String>,

    /// Keep only scanner output lines containing this text [default: Scanned]
    #[arg(long, value_name = "TEXT")]
    pub np_filter: Option<String>,
}

impl ToOptions for ScannerArgs {
    fn to_options(&self, options: &mut OptionSet) {
        set_opt(options, NP_OUTPUT, self.np_output.as_ref());
        set_opt(options, NP_PATH, self.np_path.as_ref());
        set_opt(options, NP_ARGS, self.np_args.as_ref());
        set_opt(options, NP_FILTER, self.np_filter.as_ref());
    }
}
