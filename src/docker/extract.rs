use std::{
    collections::HashMap,
    fs::File,
    io::{Cursor, Read},
    path::{Component, Path},
};

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use serde::Deserialize;
use tar::Archive;
use tracing::{debug, error, warn};

use crate::{
    payload::{Platform, Provenance, ScannerPayload},
    pipeline::Shutdown,
};

pub const MANIFEST_NAME: &str = "manifest.json";

/// One entry of a saved image's `manifest.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct ManifestEntry {
    #[serde(rename = "Config", default)]
    pub config: String,
    #[serde(rename = "RepoTags", default)]
    pub repo_tags: Vec<String>,
    #[serde(rename = "Layers", default)]
    pub layers: Vec<String>,
}

/// Rejects archive member paths that would land outside the extraction root.
pub fn is_safe_member_path(path: &Path) -> bool {
    path.components().all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// First pass over a saved image: locate and parse `manifest.json`.
pub fn read_manifest(tar_path: &Path) -> Result<Vec<ManifestEntry>> {
    let file = File::open(tar_path)
        .with_context(|| format!("Failed to open image archive {}", tar_path.display()))?;
    let mut archive = Archive::new(file);
    for entry in archive.entries().context("Failed to read image archive")? {
        let mut entry = entry.context("Failed to read image archive entry")?;
        if entry.path()?.to_string_lossy() != MANIFEST_NAME {
            continue;
        }
        let mut raw = Vec::new();
        entry.read_to_end(&mut raw).context("Failed to read manifest.json")?;
        return serde_json::from_slice(&raw).context("Failed to parse manifest.json");
    }
    anyhow::bail!("{} has no {MANIFEST_NAME}", tar_path.display())
}

/// Walks a saved image archive and hands every non-empty regular file to `emit`
/// as a scanner payload. Returns the number of payloads emitted.
///
/// Stops early when `emit` returns `false` or the pipeline is cancelled.
pub fn extract_payloads(
    tar_path: &Path,
    shutdown: &Shutdown,
    mut emit: impl FnMut(ScannerPayload) -> bool,
) -> Result<usize> {
    let manifest = read_manifest(tar_path)?;
    let fallback_tag = tar_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let image_tag = manifest
        .iter()
        .find_map(|m| m.repo_tags.first().cloned())
        .unwrap_or(fallback_tag);
    let layer_tags: HashMap<&str, &str> = manifest
        .iter()
        .flat_map(|m| {
            let tag = m.repo_tags.first().map(String::as_str).unwrap_or(image_tag.as_str());
            m.layers.iter().map(move |l| (l.as_str(), tag))
        })
        .collect();

    // Second pass: reopen to rewind.
    let file = File::open(tar_path)
        .with_context(|| format!("Failed to reopen image archive {}", tar_path.display()))?;
    let mut archive = Archive::new(file);
    let mut emitted = 0;
    for entry in archive.entries().context("Failed to read image archive")? {
        if shutdown.is_cancelled() {
            break;
        }
        let mut entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                error!("Failed reading image archive: {e}");
                break;
            }
        };
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let name = match entry.path() {
            Ok(path) if is_safe_member_path(&path) => path.to_string_lossy().into_owned(),
            Ok(path) => {
                warn!("unsafe tar path: {}", path.display());
                continue;
            }
            Err(e) => {
                warn!("unreadable tar path: {e}");
                continue;
            }
        };
        if name == MANIFEST_NAME {
            continue;
        }
        let mut data = Vec::new();
        if let Err(e) = entry.read_to_end(&mut data) {
            error!("Failed reading {name}: {e}");
            continue;
        }
        if data.is_empty() {
            debug!("Skipping empty file: {name}");
            continue;
        }

        match layer_tags.get(name.as_str()) {
            Some(tag) => {
                let (count, keep_going) = walk_layer(&data, tag, &name, shutdown, &mut emit);
                emitted += count;
                if !keep_going {
                    break;
                }
            }
            None => {
                let provenance =
                    Provenance::new(Platform::Docker, "image", image_tag.clone(), format!("file:{name}"), "");
                if !emit(ScannerPayload::bytes(&data, provenance)) {
                    break;
                }
                emitted += 1;
            }
        }
    }
    Ok(emitted)
}

/// Layer blobs may be gzip-compressed; anything that does not decode is
/// treated as a raw tar.
fn decode_layer(data: &[u8]) -> std::borrow::Cow<'_, [u8]> {
    if data.starts_with(&[0x1f, 0x8b]) {
        let mut decoded = Vec::new();
        match GzDecoder::new(data).read_to_end(&mut decoded) {
            Ok(_) => return std::borrow::Cow::Owned(decoded),
            Err(e) => debug!("layer is not gzip after all: {e}"),
        }
    }
    std::borrow::Cow::Borrowed(data)
}

fn walk_layer(
    data: &[u8],
    tag: &str,
    layer: &str,
    shutdown: &Shutdown,
    emit: &mut impl FnMut(ScannerPayload) -> bool,
) -> (usize, bool) {
    let decoded = decode_layer(data);
    let mut archive = Archive::new(Cursor::new(decoded.as_ref()));
    let entries = match archive.entries() {
        Ok(entries) => entries,
        Err(e) => {
            error!("Failed reading layer {layer}: {e}");
            return (0, true);
        }
    };
    let mut emitted = 0;
    for entry in entries {
        if shutdown.is_cancelled() {
            return (emitted, false);
        }
        let mut entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                error!("Failed reading layer {layer}: {e}");
                break;
            }
        };
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let file_name = match entry.path() {
            Ok(path) if is_safe_member_path(&path) => path.to_string_lossy().into_owned(),
            Ok(path) => {
                warn!("unsafe tar path in layer {layer}: {}", path.display());
                continue;
            }
            Err(e) => {
                warn!("unreadable tar path in layer {layer}: {e}");
                continue;
            }
        };
        let mut content = Vec::new();
        if let Err(e) = entry.read_to_end(&mut content) {
            error!("Failed reading file {file_name} in layer {layer}: {e}");
            continue;
        }
        if content.is_empty() {
            debug!("Skipping empty file: {file_name}");
            continue;
        }
        let provenance =
            Provenance::new(Platform::Docker, "layer", format!("{tag},{layer},{file_name}"), "", "");
        if !emit(ScannerPayload::bytes(&content, provenance)) {
            return (emitted, false);
        }
        emitted += 1;
    }
    (emitted, true)
}
