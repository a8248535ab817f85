// tests/common/mod.rs
#![allow(dead_code)]

use std::{
    collections::HashMap,
    io::Write,
    path::{Path, PathBuf},
    sync::Mutex,
};

use anyhow::Result;
use async_trait::async_trait;
use cloudsweep::{
    aws::{AwsApi, ListedResource, ResourcePage},
    docker::{ContainerRuntime, RegistryCredentials},
    provider::{ProviderError, ProviderErrorKind},
};

/// Serves one listing page per (region, type) and records which were asked for.
#[derive(Default)]
pub struct StubAws {
    pub regions: Vec<String>,
    pub pages: HashMap<(String, String), Vec<ListedResource>>,
    pub listed: Mutex<Vec<(String, String)>>,
}

impl StubAws {
    pub fn with_page(mut self, region: &str, type_name: &str, ids: &[&str]) -> Self {
        let items = ids
            .iter()
            .map(|id| ListedResource { identifier: id.to_string(), properties: format!(r#"{{"Name":"{id}"}}"#) })
            .collect();
        self.pages.insert((region.to_string(), type_name.to_string()), items);
        self
    }
}

#[async_trait]
impl AwsApi for StubAws {
    async fn enabled_regions(&self) -> Result<Vec<String>, ProviderError> {
        Ok(self.regions.clone())
    }

    async fn account_id(&self, _region: &str) -> Result<String, ProviderError> {
        Ok("123456789012".to_string())
    }

    async fn list_resources(
        &self,
        region: &str,
        type_name: &str,
        _next_token: Option<&str>,
    ) -> Result<ResourcePage, ProviderError> {
        self.listed.lock().unwrap().push((region.to_string(), type_name.to_string()));
        match self.pages.get(&(region.to_string(), type_name.to_string())) {
            Some(items) => Ok(ResourcePage { items: items.clone(), next_token: None }),
            None => Err(ProviderError::new(ProviderErrorKind::RegionUnsupported, "TypeNotFoundException")),
        }
    }

    async fn get_resource(&self, region: &str, type_name: &str, identifier: &str) -> Result<String, ProviderError> {
        self.pages
            .get(&(region.to_string(), type_name.to_string()))
            .and_then(|items| items.iter().find(|item| item.identifier == identifier))
            .map(|item| item.properties.clone())
            .ok_or_else(|| ProviderError::new(ProviderErrorKind::NotFound, "ResourceNotFoundException"))
    }
}

/// A runtime whose `save` copies a prepared image archive into place.
pub struct StubRuntime {
    pub archive: PathBuf,
    pub calls: Mutex<Vec<String>>,
}

impl StubRuntime {
    pub fn new(archive: PathBuf) -> Self {
        Self { archive, calls: Mutex::new(Vec::new()) }
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl ContainerRuntime for StubRuntime {
    async fn login(&self, image: &str, _credentials: &RegistryCredentials) -> Result<()> {
        self.record(format!("login {image}"));
        Ok(())
    }

    async fn pull(&self, image: &str, _credentials: Option<&RegistryCredentials>) -> Result<()> {
        self.record(format!("pull {image}"));
        Ok(())
    }

    async fn save(&self, image: &str, destination: &Path) -> Result<()> {
        self.record(format!("save {image}"));
        std::fs::copy(&self.archive, destination)?;
        Ok(())
    }

    async fn remove(&self, image: &str) -> Result<()> {
        self.record(format!("remove {image}"));
        Ok(())
    }
}

fn append(builder: &mut tar::Builder<impl Write>, name: &str, data: &[u8]) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_entry_type(tar::EntryType::Regular);
    builder.append_data(&mut header, name, data)?;
    Ok(())
}

/// Writes a saved-image archive with a single layer holding `files`.
pub fn image_tar(path: &Path, repo_tag: &str, layer: &str, files: &[(&str, &[u8])]) -> Result<()> {
    image_tar_with_root_files(path, repo_tag, layer, files, &[])
}

/// Like [`image_tar`], with extra files next to `manifest.json` at the archive root.
pub fn image_tar_with_root_files(
    path: &Path,
    repo_tag: &str,
    layer: &str,
    files: &[(&str, &[u8])],
    root_files: &[(&str, &[u8])],
) -> Result<()> {
    let mut layer_builder = tar::Builder::new(Vec::new());
    for (name, data) in files {
        append(&mut layer_builder, name, data)?;
    }
    let layer_bytes = layer_builder.into_inner()?;

    let manifest = serde_json::json!([{
        "Config": "config.json",
        "RepoTags": [repo_tag],
        "Layers": [layer],
    }]);
    let mut image = tar::Builder::new(std::fs::File::create(path)?);
    append(&mut image, "manifest.json", manifest.to_string().as_bytes())?;
    append(&mut image, layer, &layer_bytes)?;
    for (name, data) in root_files {
        append(&mut image, name, data)?;
    }
    image.into_inner()?.flush()?;
    Ok(())
}

/// A stand-in scanner. `scan` copies stdin to `<datastore>/input.jsonl` and
/// reports how many lines it saw; `summarize` prints a fixed summary.
#[cfg(unix)]
pub fn stub_scanner(dir: &Path) -> Result<PathBuf> {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("fake-scanner");
    std::fs::write(
        &path,
        r#"#!/bin/sh
case "$1" in
  scan)
    mkdir -p "$3"
    cat > "$3/input.jsonl"
    echo "scanner warming up" >&2
    echo "Scanned $(wc -l < "$3/input.jsonl" | tr -d ' ') inputs"
    echo "progress noise"
    ;;
  summarize)
    echo "Findings in $3: 0"
    ;;
esac
"#,
    )?;
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
    Ok(path)
}
