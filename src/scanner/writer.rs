use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::Mutex,
};

use crate::payload::ScannerPayload;

#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("failed to write to the scanner: {0}")]
    Io(#[from] std::io::Error),

    #[error("scanner input is closed")]
    Closed,
}

/// Line-oriented JSON encoder shared by every feeder of one scanner.
///
/// Each payload is encoded in full before the lock is taken, and written
/// with a single `write_all` while holding it, so lines never interleave.
pub struct PayloadWriter<W> {
    inner: Mutex<Option<W>>,
}

impl<W: AsyncWrite + Unpin + Send> PayloadWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner: Mutex::new(Some(inner)) }
    }

    pub async fn write(&self, payload: &ScannerPayload) -> Result<(), WriteError> {
        let line = payload.to_line()?;
        let mut guard = self.inner.lock().await;
        let writer = guard.as_mut().ok_or(WriteError::Closed)?;
        writer.write_all(&line).await?;
        Ok(())
    }

    /// Flushes and drops the underlying writer. For a pipe this closes the
    /// write end, which is how the scanner learns its input is complete.
    pub async fn close(&self) -> Result<Option<W>, WriteError> {
        let mut guard = self.inner.lock().await;
        match guard.take() {
            Some(mut writer) => {
                writer.flush().await?;
                writer.shutdown().await?;
                Ok(Some(writer))
            }
            None => Ok(None),
        }
    }
}
