//! COPY transfer channels.
//!
//! A channel owns the connection's wire until it is finished, cancelled or dropped. Only one
//! may be open per connection; the lease below enforces that and keeps other commands from
//! queueing behind an import that will never complete.

mod binary;
mod raw;
mod text;

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use lazy_static::lazy_static;
use regex::Regex;
use tokio_postgres::{CopyInSink, CopyOutStream};
use tokio_util::bytes::Bytes;

use crate::connection::PgConnection;
use crate::error::SqlMiddlewareDbError;

pub use binary::{BinaryExporter, BinaryImporter, BinaryRow};
pub use raw::RawCopyStream;
pub use text::{TextExporter, TextImporter};

/// Upper bound on bytes buffered by importers before they are sent as one CopyData message.
pub(crate) const FLUSH_THRESHOLD: usize = 64 * 1024;

lazy_static! {
    static ref FROM_STDIN_RE: Regex =
        Regex::new(r"(?is)\bFROM\s+STDIN\b").expect("copy direction pattern is valid");
}

/// Which way data flows through a COPY channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyDirection {
    /// `COPY .. FROM STDIN`: the client sends rows.
    Import,
    /// `COPY .. TO STDOUT`: the server sends rows.
    Export,
}

impl CopyDirection {
    /// Direction implied by a COPY command. Anything that is not `FROM STDIN` is sent as an
    /// export so the backend reports malformed commands itself.
    #[must_use]
    pub fn of_command(copy_command: &str) -> Self {
        if FROM_STDIN_RE.is_match(copy_command) {
            CopyDirection::Import
        } else {
            CopyDirection::Export
        }
    }

    /// Fail unless `copy_command` moves data this way. Checked before the command is sent:
    /// a command of the other direction would leave the session in a COPY mode the channel
    /// cannot finish.
    pub(crate) fn require(self, copy_command: &str) -> Result<(), SqlMiddlewareDbError> {
        if Self::of_command(copy_command) == self {
            return Ok(());
        }
        let needed = match self {
            CopyDirection::Import => "an import channel needs a `COPY .. FROM STDIN` command",
            CopyDirection::Export => "an export channel cannot run a `COPY .. FROM STDIN` command",
        };
        Err(SqlMiddlewareDbError::ProtocolError(format!(
            "{needed}, got: {copy_command}"
        )))
    }
}

/// Exclusive claim on a connection's COPY slot, released on drop.
pub(crate) struct ChannelLease {
    active: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
}

impl ChannelLease {
    pub(crate) fn acquire(conn: &PgConnection) -> Result<Self, SqlMiddlewareDbError> {
        conn.ensure_open()?;
        let active = Arc::clone(conn.copy_flag());
        if active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SqlMiddlewareDbError::ProtocolError(
                "another COPY operation is already in progress on this connection".to_string(),
            ));
        }
        Ok(ChannelLease {
            active,
            closed: Arc::clone(conn.closed_flag()),
        })
    }

    /// Fails once the connection has been closed under the channel.
    pub(crate) fn ensure_usable(&self) -> Result<(), SqlMiddlewareDbError> {
        if self.closed.load(Ordering::Acquire) {
            Err(SqlMiddlewareDbError::ConnectionStateError(
                "transfer channel is invalid: the connection was closed".to_string(),
            ))
        } else {
            Ok(())
        }
    }
}

impl Drop for ChannelLease {
    fn drop(&mut self) {
        self.active.store(false, Ordering::Release);
        tracing::debug!("COPY channel released");
    }
}

pub(crate) async fn open_copy_out(
    conn: &PgConnection,
    copy_command: &str,
) -> Result<(Pin<Box<CopyOutStream>>, ChannelLease), SqlMiddlewareDbError> {
    conn.settle_rollback().await;
    let lease = ChannelLease::acquire(conn)?;
    let client = conn.client().await?;
    let stream = client.copy_out(copy_command).await?;
    tracing::debug!(command = copy_command, "COPY export opened");
    Ok((Box::pin(stream), lease))
}

pub(crate) async fn open_copy_in(
    conn: &PgConnection,
    copy_command: &str,
) -> Result<(Pin<Box<CopyInSink<Bytes>>>, ChannelLease), SqlMiddlewareDbError> {
    conn.settle_rollback().await;
    let lease = ChannelLease::acquire(conn)?;
    let client = conn.client().await?;
    let sink = client.copy_in(copy_command).await?;
    tracing::debug!(command = copy_command, "COPY import opened");
    Ok((Box::pin(sink), lease))
}
