use std::{
    collections::HashMap,
    io::Write,
    path::Path,
    sync::{Arc, Mutex},
};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use oci_distribution::{
    client::{linux_amd64_resolver, Client, ClientConfig},
    manifest,
    secrets::RegistryAuth,
    Reference, RegistryOperation,
};
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::debug;

use super::{ContainerRuntime, RegistryCredentials};

const ACCEPTED_LAYER_TYPES: &[&str] = &[
    manifest::IMAGE_LAYER_MEDIA_TYPE,
    manifest::IMAGE_LAYER_GZIP_MEDIA_TYPE,
    manifest::IMAGE_DOCKER_LAYER_TAR_MEDIA_TYPE,
    manifest::IMAGE_DOCKER_LAYER_GZIP_MEDIA_TYPE,
];

struct PulledImage {
    config: Vec<u8>,
    layers: Vec<Vec<u8>>,
}

/// Talks to registries directly over the OCI distribution API.
///
/// Pulled images are held in memory until saved or removed; `save` writes
/// them out in the `docker save` archive layout.
pub struct RegistryRuntime {
    client: Client,
    images: Mutex<HashMap<String, Arc<PulledImage>>>,
}

impl Default for RegistryRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryRuntime {
    pub fn new() -> Self {
        let client = Client::new(ClientConfig {
            platform_resolver: Some(Box::new(linux_amd64_resolver)),
            ..Default::default()
        });
        Self { client, images: Mutex::new(HashMap::new()) }
    }

    fn auth(credentials: Option<&RegistryCredentials>) -> RegistryAuth {
        match credentials {
            Some(c) if !c.username.is_empty() => {
                RegistryAuth::Basic(c.username.clone(), c.password.clone())
            }
            _ => RegistryAuth::Anonymous,
        }
    }
}

fn parse_reference(image: &str) -> Result<Reference> {
    image.parse().with_context(|| format!("invalid image reference {image}"))
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn append_file<W: Write>(builder: &mut tar::Builder<W>, name: &str, data: &[u8]) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_entry_type(tar::EntryType::Regular);
    header.set_cksum();
    builder.append_data(&mut header, name, data).with_context(|| format!("writing {name}"))?;
    Ok(())
}

/// Writes an image in the `docker save` layout: config, layer blobs and a
/// `manifest.json` tying them to the repo tag.
fn write_archive(image: &str, pulled: &PulledImage, destination: &Path) -> Result<()> {
    let file = std::fs::File::create(destination)
        .with_context(|| format!("creating {}", destination.display()))?;
    let mut builder = tar::Builder::new(file);

    let config_name = format!("blobs/sha256/{}", sha256_hex(&pulled.config));
    append_file(&mut builder, &config_name, &pulled.config)?;

    let mut layer_names = Vec::with_capacity(pulled.layers.len());
    for layer in &pulled.layers {
        let name = format!("blobs/sha256/{}", sha256_hex(layer));
        append_file(&mut builder, &name, layer)?;
        layer_names.push(name);
    }

    let manifest = json!([{
        "Config": config_name,
        "RepoTags": [image],
        "Layers": layer_names,
    }]);
    append_file(&mut builder, super::MANIFEST_NAME, &serde_json::to_vec(&manifest)?)?;
    builder.into_inner().context("finishing image archive")?.flush()?;
    Ok(())
}

#[async_trait]
impl ContainerRuntime for RegistryRuntime {
    async fn login(&self, image: &str, credentials: &RegistryCredentials) -> Result<()> {
        let reference = parse_reference(image)?;
        let mut client = self.client.clone();
        client
            .auth(&reference, &Self::auth(Some(credentials)), RegistryOperation::Pull)
            .await
            .with_context(|| format!("registry login to {} failed", credentials.server))?;
        Ok(())
    }

    async fn pull(&self, image: &str, credentials: Option<&RegistryCredentials>) -> Result<()> {
        let reference = parse_reference(image)?;
        debug!("Pulling {image}");
        let mut client = self.client.clone();
        let pulled = client
            .pull(&reference, &Self::auth(credentials), ACCEPTED_LAYER_TYPES.to_vec())
            .await
            .with_context(|| format!("pulling {image}"))?;
        let image_data = PulledImage {
            config: pulled.config.data.to_vec(),
            layers: pulled.layers.into_iter().map(|l| l.data.to_vec()).collect(),
        };
        self.images
            .lock()
            .map_err(|_| anyhow!("image cache poisoned"))?
            .insert(image.to_string(), Arc::new(image_data));
        Ok(())
    }

    async fn save(&self, image: &str, destination: &Path) -> Result<()> {
        let pulled = self
            .images
            .lock()
            .map_err(|_| anyhow!("image cache poisoned"))?
            .get(image)
            .cloned()
            .ok_or_else(|| anyhow!("{image} has not been pulled"))?;
        let (image, destination) = (image.to_string(), destination.to_path_buf());
        tokio::task::spawn_blocking(move || write_archive(&image, &pulled, &destination))
            .await
            .context("image archive writer did not finish")?
    }

    async fn remove(&self, image: &str) -> Result<()> {
        self.images.lock().map_err(|_| anyhow!("image cache poisoned"))?.remove(image);
        Ok(())
    }
}
