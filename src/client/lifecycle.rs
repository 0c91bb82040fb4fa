use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::PgClient;
use crate::connection::timeout_from_millis;
use crate::error::SqlMiddlewareDbError;

impl PgClient {
    /// Close the session. Any open COPY channel becomes invalid.
    ///
    /// # Errors
    /// Returns `ConnectionStateError` if the connection was already closed.
    pub async fn close(&self) -> Result<(), SqlMiddlewareDbError> {
        self.connection()?.close().await
    }

    /// Wait for a notification on any channel this session listens to.
    ///
    /// Returns `true` as soon as one arrives, or immediately if one arrived since the last
    /// wait; `false` once `timeout` elapses. `None` waits indefinitely and a zero timeout
    /// only checks. Notifications themselves are delivered to `subscribe_notification` handlers.
    ///
    /// # Errors
    /// Returns `ConnectionStateError` if the connection is or becomes closed.
    pub async fn wait_for_notification(
        &self,
        timeout: Option<Duration>,
    ) -> Result<bool, SqlMiddlewareDbError> {
        let conn = self.open_connection()?;
        conn.notifications().wait(timeout, None).await
    }

    /// Like `wait_for_notification`, but stops with `Cancelled` when `cancel` fires.
    ///
    /// # Errors
    /// Returns `Cancelled` or `ConnectionStateError`.
    pub async fn wait_for_notification_cancellable(
        &self,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<bool, SqlMiddlewareDbError> {
        let conn = self.open_connection()?;
        conn.notifications().wait(timeout, Some(cancel)).await
    }

    /// Blocking form of `wait_for_notification`.
    ///
    /// # Errors
    /// As `wait_for_notification`, or `Unimplemented` when blocking calls are unavailable.
    pub fn wait_for_notification_blocking(
        &self,
        timeout: Option<Duration>,
    ) -> Result<bool, SqlMiddlewareDbError> {
        let conn = self.open_connection()?;
        conn.block_on(conn.notifications().wait(timeout, None))?
    }

    /// `wait_for_notification` with a millisecond timeout: negative waits indefinitely,
    /// zero only checks.
    ///
    /// # Errors
    /// As `wait_for_notification`.
    pub async fn wait_for_notification_millis(
        &self,
        timeout_ms: i64,
    ) -> Result<bool, SqlMiddlewareDbError> {
        self.wait_for_notification(timeout_from_millis(timeout_ms))
            .await
    }

    /// Deallocate every prepared statement of this session.
    ///
    /// # Errors
    /// Returns the backend error unchanged.
    pub async fn unprepare_all_statements(&self) -> Result<(), SqlMiddlewareDbError> {
        let conn = self.open_connection()?;
        let client = conn.command_client().await?;
        client.batch_execute("DEALLOCATE ALL").await?;
        // the driver's cached type-lookup statements were just deallocated
        client.clear_type_cache();
        tracing::debug!("prepared statements deallocated");
        Ok(())
    }

    /// Re-read the backend type catalog, e.g. after `CREATE TYPE`.
    ///
    /// # Errors
    /// Returns the backend error unchanged.
    pub async fn reload_types(&self) -> Result<(), SqlMiddlewareDbError> {
        let conn = self.open_connection()?;
        let client = conn.command_client().await?;
        client.clear_type_cache();
        conn.type_mapper().load(&client).await?;
        tracing::debug!(types = conn.type_mapper().len(), "type catalog reloaded");
        Ok(())
    }
}
