//! Container-image extraction: pull, save to a tar, walk its layers.

use std::{path::Path, sync::Arc};

use anyhow::Result;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;

mod extract;
mod registry;
mod stages;

pub use extract::{extract_payloads, is_safe_member_path, read_manifest, ManifestEntry, MANIFEST_NAME};
pub use registry::RegistryRuntime;
pub use stages::{ImageExtract, ImagePull, ImageSave};

use crate::options::{OptionSet, DOCKER_PASSWORD, DOCKER_USER, IMAGE};
use crate::pipeline::split_list;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RegistryCredentials {
    pub server: String,
    pub username: String,
    pub password: String,
}

/// An image to pull, with the credentials to pull it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageContext {
    pub image: String,
    pub credentials: Option<RegistryCredentials>,
}

impl ImageContext {
    pub fn anonymous(image: impl Into<String>) -> Self {
        Self { image: image.into(), credentials: None }
    }

    /// Builds contexts from the `image`, `docker-user` and `docker-password` options.
    pub fn from_options(options: &OptionSet) -> Vec<Self> {
        let user = options.value(DOCKER_USER);
        let password = options.value(DOCKER_PASSWORD);
        split_list(&options.value(IMAGE))
            .into_iter()
            .map(|image| {
                let credentials = (!user.is_empty()).then(|| RegistryCredentials {
                    server: registry_server(&image),
                    username: user.clone(),
                    password: password.clone(),
                });
                Self { image, credentials }
            })
            .collect()
    }

    /// Login happens only for private registries with configured credentials.
    pub fn needs_login(&self) -> bool {
        self.credentials.as_ref().is_some_and(|c| !is_public_registry(&c.server))
    }
}

/// The runtime that pulls, saves and discards images.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn login(&self, image: &str, credentials: &RegistryCredentials) -> Result<()>;

    async fn pull(&self, image: &str, credentials: Option<&RegistryCredentials>) -> Result<()>;

    /// Exports a pulled image as a `docker save` style archive at `destination`.
    async fn save(&self, image: &str, destination: &Path) -> Result<()>;

    /// Forcibly discards a pulled image.
    async fn remove(&self, image: &str) -> Result<()>;
}

pub type SharedRuntime = Arc<dyn ContainerRuntime>;

pub fn is_public_registry(server: &str) -> bool {
    server.contains("public.ecr.aws")
}

/// The registry host of an image reference; Docker Hub when none is given.
pub fn registry_server(image: &str) -> String {
    match image.split_once('/') {
        Some((host, _)) if host.contains('.') || host.contains(':') || host == "localhost" => {
            host.to_string()
        }
        _ => "docker.io".to_string(),
    }
}

/// Filesystem-friendly name for an image: its last path segment with `:` replaced.
pub fn image_name(image: &str) -> String {
    let last = image.rsplit('/').next().unwrap_or(image);
    last.replace(':', "_")
}

static ECR_REGION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"ecr\.([-a-z0-9]+)\.amazonaws\.com").expect("valid regex"));

/// The AWS region an ECR image lives in, if it is one.
pub fn ecr_region(image: &str) -> Option<String> {
    if image.contains("public.ecr.aws") {
        return Some("us-east-1".to_string());
    }
    ECR_REGION.captures(image).map(|c| c[1].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_names() {
        assert_eq!(image_name("nginx:latest"), "nginx_latest");
        assert_eq!(image_name("123.dkr.ecr.us-west-2.amazonaws.com/team/app:v1"), "app_v1");
        assert_eq!(image_name("alpine"), "alpine");
    }

    #[test]
    fn registry_servers() {
        assert_eq!(registry_server("nginx:latest"), "docker.io");
        assert_eq!(registry_server("library/nginx"), "docker.io");
        assert_eq!(registry_server("ghcr.io/org/app:1"), "ghcr.io");
        assert_eq!(registry_server("localhost:5000/app"), "localhost:5000");
    }

    #[test]
    fn ecr_regions() {
        assert_eq!(
            ecr_region("123.dkr.ecr.eu-west-1.amazonaws.com/app:1").as_deref(),
            Some("eu-west-1")
        );
        assert_eq!(ecr_region("public.ecr.aws/x/y").as_deref(), Some("us-east-1"));
        assert_eq!(ecr_region("nginx"), None);
    }

    #[test]
    fn contexts_from_options() {
        let opts = OptionSet::new()
            .with(IMAGE, "public.ecr.aws/a/b:1, ghcr.io/c/d:2")
            .with(DOCKER_USER, "me")
            .with(DOCKER_PASSWORD, "pw");
        let contexts = ImageContext::from_options(&opts);
        assert_eq!(contexts.len(), 2);
        assert!(!contexts[0].needs_login());
        assert!(contexts[1].needs_login());
        assert_eq!(contexts[1].credentials.as_ref().unwrap().server, "ghcr.io");

        let anonymous = ImageContext::from_options(&OptionSet::new().with(IMAGE, "nginx"));
        assert!(!anonymous[0].needs_login());
    }
}
