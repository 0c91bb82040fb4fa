use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::PgClient;
use crate::connection::PgConnection;
use crate::error::SqlMiddlewareDbError;
use crate::transaction::PgTransaction;
use crate::types::IsolationLevel;

impl PgClient {
    /// Start a transaction. `None` keeps the session's default isolation level.
    ///
    /// # Errors
    /// Returns `ExecutionError` if a transaction is already open, `ConnectionStateError` on a
    /// closed connection, or the backend error unchanged.
    pub async fn begin_transaction(
        &self,
        isolation: Option<IsolationLevel>,
    ) -> Result<PgTransaction, SqlMiddlewareDbError> {
        let conn = self.open_connection()?;
        begin(conn, isolation).await
    }

    /// Like `begin_transaction`, but gives up when `cancel` fires before the server
    /// acknowledges `BEGIN`. A cancelled begin leaves no transaction open.
    ///
    /// # Errors
    /// Returns `Cancelled` when cancelled, otherwise as `begin_transaction`.
    pub async fn begin_transaction_cancellable(
        &self,
        isolation: Option<IsolationLevel>,
        cancel: &CancellationToken,
    ) -> Result<PgTransaction, SqlMiddlewareDbError> {
        if cancel.is_cancelled() {
            return Err(cancelled());
        }
        let conn = self.open_connection()?;
        conn.settle_rollback().await;
        claim(&conn)?;
        let statement = IsolationLevel::begin_statement(isolation);

        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                // BEGIN may already be on the wire; ROLLBACK is queued behind it
                compensate(&conn).await;
                conn.end_transaction();
                Err(cancelled())
            }
            sent = send_begin(&conn, &statement) => match sent {
                Ok(()) => Ok(PgTransaction::started(Arc::clone(&conn), isolation)),
                Err(err) => {
                    conn.end_transaction();
                    Err(err)
                }
            },
        }
    }

    /// Blocking form of `begin_transaction`.
    ///
    /// # Errors
    /// As `begin_transaction`, or `Unimplemented` when blocking calls are unavailable.
    pub fn begin_transaction_blocking(
        &self,
        isolation: Option<IsolationLevel>,
    ) -> Result<PgTransaction, SqlMiddlewareDbError> {
        let conn = self.open_connection()?;
        Arc::clone(&conn).block_on(begin(conn, isolation))?
    }
}

async fn begin(
    conn: Arc<PgConnection>,
    isolation: Option<IsolationLevel>,
) -> Result<PgTransaction, SqlMiddlewareDbError> {
    conn.settle_rollback().await;
    claim(&conn)?;
    let statement = IsolationLevel::begin_statement(isolation);
    match send_begin(&conn, &statement).await {
        Ok(()) => Ok(PgTransaction::started(conn, isolation)),
        Err(err) => {
            conn.end_transaction();
            Err(err)
        }
    }
}

fn claim(conn: &PgConnection) -> Result<(), SqlMiddlewareDbError> {
    if conn.try_start_transaction() {
        Ok(())
    } else {
        Err(SqlMiddlewareDbError::ExecutionError(
            "a transaction is already open on this connection".to_string(),
        ))
    }
}

async fn send_begin(conn: &PgConnection, statement: &str) -> Result<(), SqlMiddlewareDbError> {
    let client = conn.command_client().await?;
    client.simple_query(statement).await?;
    tracing::debug!(statement, "postgres transaction started");
    Ok(())
}

async fn compensate(conn: &PgConnection) {
    match conn.command_client().await {
        Ok(client) => {
            if let Err(err) = client.simple_query("ROLLBACK").await {
                tracing::warn!(error = %err, "rollback after cancelled begin failed");
            }
        }
        Err(err) => tracing::warn!(error = %err, "cannot roll back cancelled begin"),
    }
}

fn cancelled() -> SqlMiddlewareDbError {
    SqlMiddlewareDbError::Cancelled("begin transaction cancelled".to_string())
}
