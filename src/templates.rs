//! Azure Resource Graph query templates.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::util::Counted;

const BUILTIN_TEMPLATES: &[(&str, &str)] = &[
    ("app_service_auth_disabled.yaml", include_str!("../templates/app_service_auth_disabled.yaml")),
    ("storage_public_blob_access.yaml", include_str!("../templates/storage_public_blob_access.yaml")),
    ("vm_ssh_password_authentication.yaml", include_str!("../templates/vm_ssh_password_authentication.yaml")),
];

#[derive(Error, Debug)]
pub enum TemplateError {
    #[error("template directory `{0}` does not exist")]
    MissingDirectory(PathBuf),

    #[error("`{0}` is not a directory")]
    NotADirectory(PathBuf),

    #[error("no template files (*.yaml) found in `{0}`")]
    NoTemplates(PathBuf),

    #[error("failed to read template {path}: {source}")]
    Read { path: PathBuf, source: std::io::Error },

    #[error("failed to parse template {path}: {source}")]
    Parse { path: PathBuf, source: serde_yaml::Error },

    #[error("invalid template {path}: {field} is required")]
    Invalid { path: PathBuf, field: &'static str },
}

/// A named Resource Graph query with triage metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryTemplate {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub severity: String,
    #[serde(default, rename = "query")]
    pub query_body: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub references: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub triage_notes: String,
}

impl QueryTemplate {
    pub fn from_yaml(path: &Path, text: &str) -> Result<Self, TemplateError> {
        let template: QueryTemplate = serde_yaml::from_str(text)
            .map_err(|source| TemplateError::Parse { path: path.to_owned(), source })?;
        template.validate(path)?;
        Ok(template)
    }

    fn validate(&self, path: &Path) -> Result<(), TemplateError> {
        let missing = |field| TemplateError::Invalid { path: path.to_owned(), field };
        if self.id.trim().is_empty() {
            return Err(missing("id"));
        }
        if self.name.trim().is_empty() {
            return Err(missing("name"));
        }
        if self.query_body.trim().is_empty() {
            return Err(missing("query"));
        }
        Ok(())
    }
}

/// The templates shipped with the binary.
pub fn builtin_templates() -> Result<Vec<QueryTemplate>, TemplateError> {
    BUILTIN_TEMPLATES.iter().map(|(name, text)| QueryTemplate::from_yaml(Path::new(name), text)).collect()
}

/// Loads every `*.yaml`/`*.yml` file of `dir`, sorted by file name.
pub fn load_templates(dir: &Path) -> Result<Vec<QueryTemplate>, TemplateError> {
    if !dir.exists() {
        return Err(TemplateError::MissingDirectory(dir.to_owned()));
    }
    if !dir.is_dir() {
        return Err(TemplateError::NotADirectory(dir.to_owned()));
    }
    let entries =
        std::fs::read_dir(dir).map_err(|source| TemplateError::Read { path: dir.to_owned(), source })?;
    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.is_file()
                && matches!(path.extension().and_then(|e| e.to_str()), Some("yaml") | Some("yml"))
        })
        .collect();
    if files.is_empty() {
        return Err(TemplateError::NoTemplates(dir.to_owned()));
    }
    files.sort();

    let mut templates = Vec::with_capacity(files.len());
    for path in files {
        let text = std::fs::read_to_string(&path)
            .map_err(|source| TemplateError::Read { path: path.clone(), source })?;
        templates.push(QueryTemplate::from_yaml(&path, &text)?);
    }
    debug!("Loaded {} from {}", Counted::regular(templates.len(), "template"), dir.display());
    Ok(templates)
}

/// `template-dir` when set, otherwise the builtin set.
pub fn templates_for(dir: &str) -> Result<Vec<QueryTemplate>, TemplateError> {
    if dir.trim().is_empty() {
        builtin_templates()
    } else {
        load_templates(Path::new(dir.trim()))
    }
}
