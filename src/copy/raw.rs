use std::pin::Pin;

use futures_util::{SinkExt, StreamExt};
use tokio_postgres::{CopyInSink, CopyOutStream};
use tokio_util::bytes::Bytes;

use super::{ChannelLease, CopyDirection};
use crate::error::SqlMiddlewareDbError;

enum RawInner {
    Import(Pin<Box<CopyInSink<Bytes>>>),
    Export(Pin<Box<CopyOutStream>>),
}

/// Unframed COPY stream: bytes pass through exactly as sent or received.
pub struct RawCopyStream {
    inner: RawInner,
    exhausted: bool,
    lease: ChannelLease,
}

impl std::fmt::Debug for RawCopyStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawCopyStream")
            .field("direction", &self.direction())
            .field("exhausted", &self.exhausted)
            .finish_non_exhaustive()
    }
}

impl RawCopyStream {
    pub(crate) fn import(sink: Pin<Box<CopyInSink<Bytes>>>, lease: ChannelLease) -> Self {
        Self {
            inner: RawInner::Import(sink),
            exhausted: false,
            lease,
        }
    }

    pub(crate) fn export(stream: Pin<Box<CopyOutStream>>, lease: ChannelLease) -> Self {
        Self {
            inner: RawInner::Export(stream),
            exhausted: false,
            lease,
        }
    }

    #[must_use]
    pub fn direction(&self) -> CopyDirection {
        match self.inner {
            RawInner::Import(_) => CopyDirection::Import,
            RawInner::Export(_) => CopyDirection::Export,
        }
    }

    /// Next chunk from an export, `None` once the server has sent everything.
    ///
    /// # Errors
    /// Returns `ProtocolError` on an import stream, or the backend error unchanged.
    pub async fn read(&mut self) -> Result<Option<Bytes>, SqlMiddlewareDbError> {
        self.lease.ensure_usable()?;
        let RawInner::Export(stream) = &mut self.inner else {
            return Err(SqlMiddlewareDbError::ProtocolError(
                "cannot read from a COPY FROM STDIN stream".to_string(),
            ));
        };
        if self.exhausted {
            return Ok(None);
        }
        match stream.next().await {
            Some(chunk) => Ok(Some(chunk?)),
            None => {
                self.exhausted = true;
                Ok(None)
            }
        }
    }

    /// Send bytes to an import.
    ///
    /// # Errors
    /// Returns `ProtocolError` on an export stream, or the backend error unchanged.
    pub async fn write(&mut self, data: impl Into<Bytes>) -> Result<(), SqlMiddlewareDbError> {
        self.lease.ensure_usable()?;
        let RawInner::Import(sink) = &mut self.inner else {
            return Err(SqlMiddlewareDbError::ProtocolError(
                "cannot write to a COPY TO STDOUT stream".to_string(),
            ));
        };
        sink.send(data.into()).await?;
        Ok(())
    }

    /// Complete the transfer. Imports are committed and return the imported row count;
    /// exports are drained to the end and return 0.
    ///
    /// # Errors
    /// Returns the backend error unchanged.
    pub async fn finish(mut self) -> Result<u64, SqlMiddlewareDbError> {
        self.lease.ensure_usable()?;
        match &mut self.inner {
            RawInner::Import(sink) => Ok(sink.as_mut().finish().await?),
            RawInner::Export(stream) => {
                if !self.exhausted {
                    while let Some(chunk) = stream.next().await {
                        chunk?;
                    }
                }
                Ok(0)
            }
        }
    }

    /// Abandon the transfer. An import is rolled back by the server; an export's remaining
    /// data is discarded.
    pub fn cancel(self) {
        tracing::debug!(direction = ?self.direction(), "raw COPY cancelled");
    }
}
