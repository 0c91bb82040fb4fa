use std::sync::Arc;

use crate::connection::PgConnection;
use crate::error::SqlMiddlewareDbError;
use crate::postgres::query;
use crate::results::ResultSet;
use crate::types::{IsolationLevel, RowValues};

/// An open transaction on a `PgConnection`.
///
/// Consumed by `commit` or `rollback`. Dropping it unfinished rolls back in the background;
/// later commands on the connection wait for that rollback.
pub struct PgTransaction {
    conn: Arc<PgConnection>,
    isolation: Option<IsolationLevel>,
    finished: bool,
}

impl std::fmt::Debug for PgTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgTransaction")
            .field("isolation", &self.isolation)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl PgTransaction {
    /// Wrap a connection whose `BEGIN` has been acknowledged and whose transaction slot is claimed.
    pub(crate) fn started(conn: Arc<PgConnection>, isolation: Option<IsolationLevel>) -> Self {
        Self {
            conn,
            isolation,
            finished: false,
        }
    }

    #[must_use]
    pub fn isolation(&self) -> Option<IsolationLevel> {
        self.isolation
    }

    /// Execute a batch of SQL statements inside the transaction.
    ///
    /// # Errors
    /// Returns backend errors unchanged.
    pub async fn execute_batch(&self, sql: &str) -> Result<(), SqlMiddlewareDbError> {
        let client = self.conn.command_client().await?;
        query::execute_batch(&client, sql).await
    }

    /// Execute a parameterized SELECT inside the transaction.
    ///
    /// # Errors
    /// Returns backend errors unchanged.
    pub async fn execute_select(
        &self,
        sql: &str,
        params: &[RowValues],
    ) -> Result<ResultSet, SqlMiddlewareDbError> {
        let client = self.conn.command_client().await?;
        query::execute_select(&client, sql, params).await
    }

    /// Execute a parameterized DML statement inside the transaction.
    ///
    /// # Errors
    /// Returns backend errors unchanged.
    pub async fn execute_dml(
        &self,
        sql: &str,
        params: &[RowValues],
    ) -> Result<usize, SqlMiddlewareDbError> {
        let client = self.conn.command_client().await?;
        query::execute_dml(&client, sql, params).await
    }

    /// Commit the transaction.
    ///
    /// # Errors
    /// Returns the backend error unchanged; the transaction is rolled back on failure.
    pub async fn commit(mut self) -> Result<(), SqlMiddlewareDbError> {
        self.finish("COMMIT").await
    }

    /// Roll back the transaction.
    ///
    /// # Errors
    /// Returns the backend error unchanged.
    pub async fn rollback(mut self) -> Result<(), SqlMiddlewareDbError> {
        self.finish("ROLLBACK").await
    }

    /// Blocking form of `commit`.
    ///
    /// # Errors
    /// As `commit`, or `Unimplemented` on a current-thread runtime.
    pub fn commit_blocking(self) -> Result<(), SqlMiddlewareDbError> {
        let conn = Arc::clone(&self.conn);
        conn.block_on(self.commit())?
    }

    /// Blocking form of `rollback`.
    ///
    /// # Errors
    /// As `rollback`, or `Unimplemented` on a current-thread runtime.
    pub fn rollback_blocking(self) -> Result<(), SqlMiddlewareDbError> {
        let conn = Arc::clone(&self.conn);
        conn.block_on(self.rollback())?
    }

    async fn finish(&mut self, sql: &str) -> Result<(), SqlMiddlewareDbError> {
        self.finished = true;
        let result = match self.conn.command_client().await {
            Ok(client) => {
                let outcome = client.simple_query(sql).await;
                if outcome.is_err()
                    && sql != "ROLLBACK"
                    && let Err(err) = client.simple_query("ROLLBACK").await
                {
                    tracing::warn!(error = %err, "rollback after failed commit failed");
                }
                outcome.map(|_| ()).map_err(SqlMiddlewareDbError::from)
            }
            Err(err) => Err(err),
        };
        self.conn.end_transaction();
        tracing::debug!(statement = sql, ok = result.is_ok(), "postgres transaction finished");
        result
    }
}

impl Drop for PgTransaction {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if !self.conn.is_open() {
            self.conn.end_transaction();
            return;
        }
        let conn = Arc::clone(&self.conn);
        self.conn.defer_rollback(async move {
            match conn.client().await {
                Ok(client) => {
                    if let Err(err) = client.simple_query("ROLLBACK").await {
                        tracing::warn!(error = %err, "background rollback of dropped transaction failed");
                    }
                }
                Err(err) => tracing::debug!(error = %err, "dropped transaction on a closed connection"),
            }
            conn.end_transaction();
        });
    }
}
