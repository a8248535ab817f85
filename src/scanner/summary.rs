use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, error, info};

use super::{ScannerError, ScannerSettings};
use crate::pipeline::{Inbox, Outbox, Stage, StageContext};

/// Waits for the scanner bridge to finish, then emits the scanner's summary
/// of its datastore as a single string.
#[derive(Default)]
pub struct ScannerSummary;

impl ScannerSummary {
    async fn summarize(settings: &ScannerSettings) -> Result<String, ScannerError> {
        let output = Command::new(&settings.binary)
            .args(settings.summarize_args())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(ScannerError::Spawn)?;
        if !output.status.success() {
            return Err(ScannerError::Exit {
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim_end().to_string())
    }
}

#[async_trait]
impl Stage<String, String> for ScannerSummary {
    fn name(&self) -> &'static str {
        "scanner-summary"
    }

    async fn apply(&self, ctx: StageContext, mut inbox: Inbox<String>, outbox: Outbox<String>) {
        while let Some(line) = inbox.recv(&ctx).await {
            info!("{line}");
        }
        if ctx.is_cancelled() {
            return;
        }

        let settings = match ScannerSettings::from_options(ctx.options()) {
            Ok(settings) => settings,
            Err(e) => {
                error!("Cannot summarize: {e}");
                return;
            }
        };
        if !settings.datastore.exists() {
            debug!("No datastore at {}; nothing to summarize", settings.datastore.display());
            return;
        }
        let summary = tokio::select! {
            biased;
            _ = ctx.cancelled() => return,
            summary = Self::summarize(&settings) => summary,
        };
        match summary {
            Ok(summary) if !summary.is_empty() => {
                outbox.send(summary);
            }
            Ok(_) => debug!("Scanner summary was empty"),
            Err(e) => error!("Failed to summarize {}: {e}", settings.datastore.display()),
        }
    }
}
