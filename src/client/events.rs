use std::sync::Arc;

use tokio_postgres::Notification;
use tokio_postgres::error::DbError;

use super::PgClient;
use crate::connection::SubscriptionHandle;
use crate::error::SqlMiddlewareDbError;

impl PgClient {
    /// Register a handler for server notices (`RAISE NOTICE`, warnings).
    ///
    /// Handlers run on the connection's driver task in registration order and must not block.
    ///
    /// # Errors
    /// Returns `ConnectionStateError` on a closed connection.
    pub fn subscribe_notice<F>(&self, handler: F) -> Result<SubscriptionHandle, SqlMiddlewareDbError>
    where
        F: Fn(&DbError) + Send + Sync + 'static,
    {
        let conn = self.open_connection()?;
        let handle = conn.events().subscribe_notice(Arc::new(handler));
        tracing::debug!(?handle, "notice handler subscribed");
        Ok(handle)
    }

    /// Register a handler for `NOTIFY` messages on channels this session listens to.
    ///
    /// # Errors
    /// Returns `ConnectionStateError` on a closed connection.
    pub fn subscribe_notification<F>(
        &self,
        handler: F,
    ) -> Result<SubscriptionHandle, SqlMiddlewareDbError>
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        let conn = self.open_connection()?;
        let handle = conn.events().subscribe_notification(Arc::new(handler));
        tracing::debug!(?handle, "notification handler subscribed");
        Ok(handle)
    }

    /// Remove a handler. Returns false if it was already removed.
    ///
    /// Events dispatched after this returns never reach the handler.
    ///
    /// # Errors
    /// Returns `CastError` when the executor's connection is not a `PgConnection`.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<bool, SqlMiddlewareDbError> {
        Ok(self.connection()?.events().unsubscribe(handle))
    }
}
