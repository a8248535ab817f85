use std::process::Stdio;

use async_trait::async_trait;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::{ChildStdin, Command},
    sync::watch,
};
use tracing::{debug, error, info, warn};

use super::{PayloadWriter, ScannerError, ScannerSettings, WriteError};
use crate::{
    payload::{Provenance, ScannerPayload},
    pipeline::{Inbox, Outbox, Stage, StageContext},
    util::Counted,
};

/// The payload most recently handed to the scanner.
///
/// Stderr is not synchronous with stdin, so this only tells which payload
/// was last written when a line shows up, not which one caused it.
type CurrentInput = watch::Receiver<Option<Provenance>>;

/// Feeds payloads to the scanner subprocess and emits the stdout lines that
/// pass the `np-filter` option.
///
/// The subprocess starts with the first payload; an empty input never runs
/// the scanner.
#[derive(Default)]
pub struct ScannerBridge;

async fn first_payload(ctx: &StageContext, inbox: &mut Inbox<ScannerPayload>) -> Option<ScannerPayload> {
    while let Some(payload) = inbox.recv(ctx).await {
        if !payload.is_empty() {
            return Some(payload);
        }
    }
    None
}

async fn feed(
    ctx: StageContext,
    first: ScannerPayload,
    mut inbox: Inbox<ScannerPayload>,
    writer: PayloadWriter<ChildStdin>,
    current: watch::Sender<Option<Provenance>>,
) {
    let mut pending = Some(first);
    let mut written = 0;
    loop {
        let payload = match pending.take() {
            Some(payload) => payload,
            None => match inbox.recv(&ctx).await {
                Some(payload) => payload,
                None => break,
            },
        };
        if payload.is_empty() {
            continue;
        }
        current.send_replace(Some(payload.provenance.clone()));
        match writer.write(&payload).await {
            Ok(()) => written += 1,
            Err(WriteError::Encode(e)) => {
                let p = &payload.provenance;
                error!(
                    platform = %p.platform,
                    resource_type = %p.resource_type,
                    resource_id = %p.resource_id,
                    region = %p.region,
                    account_id = %p.account_id,
                    "Dropping payload that failed to encode: {e}"
                );
            }
            Err(e) => {
                error!("Scanner stopped accepting input: {e}");
                break;
            }
        }
    }
    if let Err(e) = writer.close().await {
        debug!("Closing scanner input: {e}");
    }
    debug!("Sent {} to the scanner", Counted::regular(written, "payload"));
}

/// Logs each non-blank stderr line, tagged with the payload last written.
async fn log_stderr<R: AsyncRead + Unpin>(stderr: R, current: CurrentInput) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                debug!("Reading scanner stderr: {e}");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let provenance = current.borrow().clone();
        match provenance {
            Some(p) => warn!(
                resource_type = %p.resource_type,
                resource_id = %p.resource_id,
                region = %p.region,
                account_id = %p.account_id,
                "scanner: {line}"
            ),
            None => warn!("scanner: {line}"),
        }
    }
}

#[async_trait]
impl Stage<ScannerPayload, String> for ScannerBridge {
    fn name(&self) -> &'static str {
        "scanner"
    }

    async fn apply(&self, ctx: StageContext, mut inbox: Inbox<ScannerPayload>, outbox: Outbox<String>) {
        let settings = match ScannerSettings::from_options(ctx.options()) {
            Ok(settings) => settings,
            Err(e) => {
                error!("Scanner unavailable: {e}");
                return;
            }
        };
        let Some(first) = first_payload(&ctx, &mut inbox).await else {
            debug!("No payloads to scan; scanner not started");
            return;
        };

        if let Err(e) = tokio::fs::create_dir_all(settings.datastore.parent().unwrap_or(&settings.datastore)).await {
            error!("Cannot create {}: {e}", settings.datastore.display());
            return;
        }
        info!("Starting scanner {}", settings.binary.display());
        let spawned = Command::new(&settings.binary)
            .args(settings.scan_args())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(ScannerError::Spawn);
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                error!("{e}");
                return;
            }
        };
        let (Some(stdin), Some(stdout), Some(stderr)) = (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            error!("Scanner pipes were not available");
            let _ = child.start_kill();
            return;
        };

        let (current, current_rx) = watch::channel(None);
        let feeder = ctx.spawn(feed(ctx.clone(), first, inbox, PayloadWriter::new(stdin), current));
        let stderr_reader = ctx.spawn(log_stderr(stderr, current_rx));

        let mut lines = BufReader::new(stdout).lines();
        let mut killed = false;
        let mut forwarded = 0;
        loop {
            tokio::select! {
                _ = ctx.cancelled(), if !killed => {
                    debug!("Cancelled; stopping the scanner");
                    if let Err(e) = child.start_kill() {
                        debug!("Stopping the scanner: {e}");
                    }
                    killed = true;
                }
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        if settings.keeps(&line) && outbox.send(line) {
                            forwarded += 1;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        error!("Reading scanner output: {e}");
                        break;
                    }
                },
            }
        }

        let _ = feeder.await;
        match child.wait().await {
            Ok(status) if !status.success() && !killed => {
                error!("Scanner exited with {status}");
            }
            Ok(status) => debug!("Scanner exited with {status}"),
            Err(e) => error!("Waiting for the scanner: {e}"),
        }
        let _ = stderr_reader.await;
        debug!("Forwarded {}", Counted::regular(forwarded, "scanner line"));
    }
}
