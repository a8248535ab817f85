//! Named, string-valued configuration shared by every stage of a pipeline.
//!
//! An [`OptionSet`] is assembled once (from the command line or a test) and
//! then shared read-only as `Arc<OptionSet>`. A lookup of an unknown name is
//! not an error: it yields the empty string.

use std::collections::BTreeMap;

pub const OUTPUT: &str = "output";
pub const FILENAME: &str = "filename";
pub const NP_OUTPUT: &str = "np-output";
pub const NP_PATH: &str = "np-path";
pub const NP_ARGS: &str = "np-args";
pub const NP_FILTER: &str = "np-filter";
pub const PROFILE: &str = "profile";
pub const ROLE_ARN: &str = "role-arn";
pub const REGIONS: &str = "regions";
pub const RESOURCE_TYPES: &str = "resource-types";
pub const RESOURCE_TYPE: &str = "resource-type";
pub const RESOURCE_ID: &str = "resource-id";
pub const SUBSCRIPTIONS: &str = "subscriptions";
pub const TEMPLATE_DIR: &str = "template-dir";
pub const WORKERS: &str = "workers";
pub const IMAGE: &str = "image";
pub const DOCKER_USER: &str = "docker-user";
pub const DOCKER_PASSWORD: &str = "docker-password";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum OptionError {
    #[error("required option `{0}` was not provided")]
    Missing(&'static str),

    #[error("option `{name}` has an invalid value `{value}`: {reason}")]
    Invalid { name: &'static str, value: String, reason: &'static str },
}

/// A single resolved option.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanOption {
    pub name: String,
    pub value: String,
    pub default: String,
}

/// Declaration of an option a module consumes.
#[derive(Debug, Clone, Copy)]
pub struct OptionSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub default: &'static str,
    pub required: bool,
}

impl OptionSpec {
    pub const fn optional(name: &'static str, default: &'static str, description: &'static str) -> Self {
        Self { name, description, default, required: false }
    }

    pub const fn required(name: &'static str, description: &'static str) -> Self {
        Self { name, description, default: "", required: true }
    }
}

pub const OUTPUT_SPEC: OptionSpec =
    OptionSpec::optional(OUTPUT, "cloudsweep-output", "Directory for reports and scanner state");
pub const FILENAME_SPEC: OptionSpec =
    OptionSpec::optional(FILENAME, "", "Base name for report files (defaults to a timestamp)");
pub const NP_OUTPUT_SPEC: OptionSpec =
    OptionSpec::optional(NP_OUTPUT, "datastore.np", "Scanner datastore directory under the output directory");
pub const NP_PATH_SPEC: OptionSpec =
    OptionSpec::optional(NP_PATH, "noseyparker", "Scanner binary, resolved through PATH when not absolute");
pub const NP_ARGS_SPEC: OptionSpec =
    OptionSpec::optional(NP_ARGS, "", "Extra arguments passed to the scanner");
pub const NP_FILTER_SPEC: OptionSpec =
    OptionSpec::optional(NP_FILTER, "Scanned", "Scanner stdout lines are kept only when they contain this text");
pub const WORKERS_SPEC: OptionSpec =
    OptionSpec::optional(WORKERS, "", "Maximum number of concurrent enumeration workers");

/// The options every scanner-backed module needs.
pub const SCANNER_SPECS: &[OptionSpec] =
    &[OUTPUT_SPEC, FILENAME_SPEC, NP_OUTPUT_SPEC, NP_PATH_SPEC, NP_ARGS_SPEC, NP_FILTER_SPEC];

#[derive(Debug, Clone, Default)]
pub struct OptionSet {
    entries: BTreeMap<String, ScanOption>,
}

impl OptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style setter.
    pub fn with(mut self, name: &str, value: impl Into<String>) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&mut self, name: &str, value: impl Into<String>) -> &mut Self {
        let value = value.into();
        self.entries
            .entry(name.to_string())
            .and_modify(|opt| opt.value.clone_from(&value))
            .or_insert_with(|| ScanOption { name: name.to_string(), value, default: String::new() });
        self
    }

    /// Returns the named option; a missing option reads as an empty value.
    pub fn lookup(&self, name: &str) -> ScanOption {
        self.entries.get(name).cloned().unwrap_or_else(|| ScanOption {
            name: name.to_string(),
            value: String::new(),
            default: String::new(),
        })
    }

    /// Shorthand for `lookup(name).value`.
    pub fn value(&self, name: &str) -> String {
        self.entries.get(name).map(|o| o.value.clone()).unwrap_or_default()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Parses the `workers` option. An empty value means "no cap".
    pub fn workers(&self) -> Result<Option<usize>, OptionError> {
        let raw = self.value(WORKERS);
        if raw.trim().is_empty() {
            return Ok(None);
        }
        match raw.trim().parse::<usize>() {
            Ok(0) => Err(OptionError::Invalid {
                name: WORKERS,
                value: raw,
                reason: "must be greater than zero",
            }),
            Ok(n) => Ok(Some(n)),
            Err(_) => Err(OptionError::Invalid { name: WORKERS, value: raw, reason: "not a number" }),
        }
    }

    /// Applies defaults from `specs` and checks required options.
    ///
    /// Options that were explicitly set to an empty string stay empty; only
    /// options never set receive the declared default as their value.
    pub fn validate(&mut self, specs: &[OptionSpec]) -> Result<(), OptionError> {
        for spec in specs {
            match self.entries.get_mut(spec.name) {
                Some(opt) => opt.default = spec.default.to_string(),
                None => {
                    self.entries.insert(
                        spec.name.to_string(),
                        ScanOption {
                            name: spec.name.to_string(),
                            value: spec.default.to_string(),
                            default: spec.default.to_string(),
                        },
                    );
                }
            }
        }
        for spec in specs.iter().filter(|s| s.required) {
            if self.value(spec.name).trim().is_empty() {
                return Err(OptionError::Missing(spec.name));
            }
        }
        self.workers()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_option_reads_empty() {
        let opts = OptionSet::new();
        let opt = opts.lookup("nope");
        assert_eq!(opt.name, "nope");
        assert_eq!(opt.value, "");
        assert_eq!(opts.value("nope"), "");
    }

    #[test]
    fn validate_fills_defaults_and_keeps_explicit_empty() {
        let mut opts = OptionSet::new().with(REGIONS, "");
        opts.validate(&[
            OptionSpec::optional(REGIONS, "all", "regions"),
            OptionSpec::optional(OUTPUT, "out", "output"),
        ])
        .unwrap();
        assert_eq!(opts.lookup(REGIONS).value, "");
        assert_eq!(opts.value(OUTPUT), "out");
    }

    #[test]
    fn validate_rejects_missing_required() {
        let mut opts = OptionSet::new();
        let err = opts.validate(&[OptionSpec::required(IMAGE, "image")]).unwrap_err();
        assert_eq!(err, OptionError::Missing(IMAGE));
    }

    #[test]
    fn workers_must_be_positive() {
        assert_eq!(OptionSet::new().workers().unwrap(), None);
        assert_eq!(OptionSet::new().with(WORKERS, "4").workers().unwrap(), Some(4));
        assert!(OptionSet::new().with(WORKERS, "0").workers().is_err());
        assert!(OptionSet::new().with(WORKERS, "many").workers().is_err());
    }
}
