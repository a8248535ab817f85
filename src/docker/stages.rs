use std::path::PathBuf;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use super::{extract::extract_payloads, image_name, ImageContext, SharedRuntime};
use crate::{
    options::OUTPUT,
    payload::ScannerPayload,
    pipeline::{Inbox, Outbox, Stage, StageContext},
    util::Counted,
};

/// Pulls each image, logging in first when the registry needs it.
pub struct ImagePull {
    runtime: SharedRuntime,
}

impl ImagePull {
    pub fn new(runtime: SharedRuntime) -> Self {
        Self { runtime }
    }
}

#[async_trait]
impl Stage<ImageContext, String> for ImagePull {
    fn name(&self) -> &'static str {
        "image-pull"
    }

    async fn apply(&self, ctx: StageContext, mut inbox: Inbox<ImageContext>, outbox: Outbox<String>) {
        while let Some(image_ctx) = inbox.recv(&ctx).await {
            let image = image_ctx.image.trim().to_string();
            if image.is_empty() {
                continue;
            }
            if let (true, Some(credentials)) = (image_ctx.needs_login(), &image_ctx.credentials) {
                if let Err(e) = self.runtime.login(&image, credentials).await {
                    error!("Failed to log in to {}: {e:#}", credentials.server);
                    continue;
                }
            }
            let pulled = tokio::select! {
                biased;
                _ = ctx.cancelled() => break,
                r = self.runtime.pull(&image, image_ctx.credentials.as_ref()) => r,
            };
            match pulled {
                Ok(()) => {
                    debug!("Pulled {image}");
                    if !outbox.send(image) {
                        break;
                    }
                }
                Err(e) => error!("Failed to pull {image}: {e:#}"),
            }
        }
    }
}

/// Saves each pulled image to `<output>/<image-name>/<image-name>.tar`, then
/// removes the image whether or not the save worked.
pub struct ImageSave {
    runtime: SharedRuntime,
}

impl ImageSave {
    pub fn new(runtime: SharedRuntime) -> Self {
        Self { runtime }
    }
}

#[async_trait]
impl Stage<String, PathBuf> for ImageSave {
    fn name(&self) -> &'static str {
        "image-save"
    }

    async fn apply(&self, ctx: StageContext, mut inbox: Inbox<String>, outbox: Outbox<PathBuf>) {
        let output = PathBuf::from(ctx.option(OUTPUT));
        while let Some(image) = inbox.recv(&ctx).await {
            let name = image_name(&image);
            let dir = output.join(&name);
            let destination = dir.join(format!("{name}.tar"));

            let saved = match tokio::fs::create_dir_all(&dir).await {
                Ok(()) => self.runtime.save(&image, &destination).await,
                Err(e) => Err(anyhow::Error::new(e).context(format!("creating {}", dir.display()))),
            };
            if let Err(e) = self.runtime.remove(&image).await {
                warn!("Failed to remove {image}: {e:#}");
            }
            match saved {
                Ok(()) => {
                    debug!("Saved {image} to {}", destination.display());
                    if !outbox.send(destination) {
                        break;
                    }
                }
                Err(e) => error!("Failed to save {image}: {e:#}"),
            }
        }
    }
}

/// Walks saved image archives, emitting one payload per non-empty file.
#[derive(Default)]
pub struct ImageExtract;

#[async_trait]
impl Stage<PathBuf, ScannerPayload> for ImageExtract {
    fn name(&self) -> &'static str {
        "image-extract"
    }

    async fn apply(&self, ctx: StageContext, mut inbox: Inbox<PathBuf>, outbox: Outbox<ScannerPayload>) {
        while let Some(path) = inbox.recv(&ctx).await {
            let shutdown = ctx.shutdown().clone();
            let sink = outbox.clone();
            let archive = path.clone();
            let walked = tokio::task::spawn_blocking(move || {
                extract_payloads(&archive, &shutdown, |payload| sink.send(payload))
            })
            .await;
            match walked {
                Ok(Ok(n)) => info!("Extracted {} from {}", Counted::regular(n, "file"), path.display()),
                Ok(Err(e)) => error!("Failed to extract {}: {e:#}", path.display()),
                Err(e) => error!("Extraction task for {} failed: {e}", path.display()),
            }
            if outbox.is_closed() {
                break;
            }
        }
    }
}
