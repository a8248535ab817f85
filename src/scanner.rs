//! Bridge to the external secret scanner.
//!
//! The scanner is run as `<np-path> scan --datastore <dir> --progress never
//! --enumerator /dev/stdin [np-args]` and fed one JSON object per line. A
//! second invocation, `summarize -d <dir>`, reports what it found.

use std::{
    ffi::OsString,
    path::{Path, PathBuf},
    process::ExitStatus,
};

mod bridge;
mod summary;
mod writer;

pub use bridge::ScannerBridge;
pub use summary::ScannerSummary;
pub use writer::{PayloadWriter, WriteError};

use crate::options::{OptionSet, NP_ARGS, NP_FILTER, NP_OUTPUT, NP_PATH, OUTPUT};

#[derive(Debug, thiserror::Error)]
pub enum ScannerError {
    #[error("scanner binary `{path}` not found: {source}")]
    BinaryNotFound { path: String, source: which::Error },

    #[error("scanner binary `{0}` does not exist")]
    MissingBinary(PathBuf),

    #[error("cannot resolve the scanner datastore path: {0}")]
    Datastore(#[source] std::io::Error),

    #[error("failed to start the scanner: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("scanner exited with {status}: {stderr}")]
    Exit { status: ExitStatus, stderr: String },
}

/// Everything needed to invoke the scanner, resolved from the options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannerSettings {
    pub binary: PathBuf,
    pub datastore: PathBuf,
    pub extra_args: Vec<String>,
    pub filter: String,
}

impl ScannerSettings {
    pub fn from_options(options: &OptionSet) -> Result<Self, ScannerError> {
        Ok(Self {
            binary: resolve_binary(&options.value(NP_PATH))?,
            datastore: datastore_path(options)?,
            extra_args: options.value(NP_ARGS).split_whitespace().map(str::to_string).collect(),
            filter: options.value(NP_FILTER),
        })
    }

    pub fn scan_args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "scan".into(),
            "--datastore".into(),
            self.datastore.clone().into(),
            "--progress".into(),
            "never".into(),
            "--enumerator".into(),
            "/dev/stdin".into(),
        ];
        args.extend(self.extra_args.iter().map(OsString::from));
        args
    }

    pub fn summarize_args(&self) -> Vec<OsString> {
        vec!["summarize".into(), "-d".into(), self.datastore.clone().into()]
    }

    /// Whether a scanner stdout line is forwarded.
    pub fn keeps(&self, line: &str) -> bool {
        self.filter.is_empty() || line.contains(self.filter.as_str())
    }
}

/// Absolute paths are taken as-is; anything else is looked up on `PATH`.
pub fn resolve_binary(np_path: &str) -> Result<PathBuf, ScannerError> {
    let np_path = np_path.trim();
    let candidate = Path::new(np_path);
    if candidate.is_absolute() {
        return if candidate.is_file() {
            Ok(candidate.to_owned())
        } else {
            Err(ScannerError::MissingBinary(candidate.to_owned()))
        };
    }
    which::which(np_path).map_err(|source| ScannerError::BinaryNotFound { path: np_path.to_string(), source })
}

/// `<output>/<np-output>`, made absolute against the working directory.
pub fn datastore_path(options: &OptionSet) -> Result<PathBuf, ScannerError> {
    let path = Path::new(&options.value(OUTPUT)).join(options.value(NP_OUTPUT));
    if path.is_absolute() {
        return Ok(path);
    }
    let cwd = std::env::current_dir().map_err(ScannerError::Datastore)?;
    Ok(cwd.join(path))
}
