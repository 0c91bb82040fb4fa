//! `PgClient`: PostgreSQL capabilities layered over a generic executor.
//!
//! The client never caches the connection. Every operation resolves it from the
//! `ConnectionSource`, so a reconnect underneath is picked up by the next call.

mod capabilities;
mod copy;
mod events;
mod lifecycle;
mod transactions;

use std::sync::Arc;

use crate::config::PostgresOptions;
use crate::connection::PgConnection;
use crate::error::SqlMiddlewareDbError;
use crate::executor::{AsyncDatabaseExecutor, ConnectionFactory, ConnectionSource, PgExecutor};
use crate::results::ResultSet;
use crate::types::{CommandMode, RowValues};

/// Handle for PostgreSQL-specific operations on an executor's connection.
///
/// ```rust,no_run
/// use pg_middleware::prelude::*;
///
/// # async fn demo() -> Result<(), SqlMiddlewareDbError> {
/// let client = PgClient::connect("host=localhost user=postgres dbname=postgres").await?;
/// println!("server {}", client.server_version().await?);
///
/// let tx = client.begin_transaction(Some(IsolationLevel::Serializable)).await?;
/// tx.execute_dml("UPDATE accounts SET balance = balance - $1 WHERE id = $2",
///     &[RowValues::Int(10), RowValues::Int(7)]).await?;
/// tx.commit().await?;
///
/// client.close().await?;
/// # Ok(()) }
/// ```
#[derive(Clone)]
pub struct PgClient {
    executor: Arc<dyn AsyncDatabaseExecutor>,
    source: Arc<dyn ConnectionSource>,
}

impl std::fmt::Debug for PgClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgClient")
            .field("command_mode", &self.executor.command_mode())
            .field("connection", &self.source.connection().ok())
            .finish()
    }
}

impl PgClient {
    /// Open a session from a connection string.
    ///
    /// # Errors
    /// Returns `ConfigError` for an unparsable string, or the backend error if connecting fails.
    pub async fn connect(conn_str: &str) -> Result<Self, SqlMiddlewareDbError> {
        Self::from_options(PostgresOptions::from_connection_string(conn_str)?).await
    }

    /// # Errors
    /// As `connect`.
    pub async fn connect_with_mode(
        conn_str: &str,
        command_mode: CommandMode,
    ) -> Result<Self, SqlMiddlewareDbError> {
        let options =
            PostgresOptions::from_connection_string(conn_str)?.with_command_mode(command_mode);
        Self::from_options(options).await
    }

    /// Open a session through a custom factory, e.g. one that adds TLS.
    ///
    /// # Errors
    /// As `connect`, or whatever the factory returns.
    pub async fn connect_with_factory(
        conn_str: &str,
        factory: Arc<dyn ConnectionFactory>,
    ) -> Result<Self, SqlMiddlewareDbError> {
        let options = PostgresOptions::from_connection_string(conn_str)?;
        Self::from_options_with_factory(options, factory).await
    }

    /// # Errors
    /// Returns the backend error if connecting fails.
    pub async fn from_options(options: PostgresOptions) -> Result<Self, SqlMiddlewareDbError> {
        let executor = PgExecutor::connect(options).await?;
        Ok(Self::from_executor(Arc::new(executor)))
    }

    /// Open a session from full options through a custom factory.
    ///
    /// # Errors
    /// Returns whatever the factory returns.
    pub async fn from_options_with_factory(
        options: PostgresOptions,
        factory: Arc<dyn ConnectionFactory>,
    ) -> Result<Self, SqlMiddlewareDbError> {
        let executor = PgExecutor::connect_with_factory(options, factory).await?;
        Ok(Self::from_executor(Arc::new(executor)))
    }

    /// Wrap an executor that also hands out its connection.
    #[must_use]
    pub fn from_executor<E>(executor: Arc<E>) -> Self
    where
        E: AsyncDatabaseExecutor + ConnectionSource + 'static,
    {
        Self {
            executor: Arc::clone(&executor) as Arc<dyn AsyncDatabaseExecutor>,
            source: executor,
        }
    }

    /// Wrap an executor and a separate connection source.
    #[must_use]
    pub fn from_parts(
        executor: Arc<dyn AsyncDatabaseExecutor>,
        source: Arc<dyn ConnectionSource>,
    ) -> Self {
        Self { executor, source }
    }

    #[must_use]
    pub fn from_connection(conn: PgConnection) -> Self {
        Self::from_connection_with_mode(conn, CommandMode::Text)
    }

    #[must_use]
    pub fn from_connection_with_mode(conn: PgConnection, command_mode: CommandMode) -> Self {
        Self::from_executor(Arc::new(PgExecutor::from_connection(conn, command_mode)))
    }

    #[must_use]
    pub fn executor(&self) -> &Arc<dyn AsyncDatabaseExecutor> {
        &self.executor
    }

    /// The executor's current connection as a PostgreSQL session.
    ///
    /// # Errors
    /// Returns `CastError` when the executor's connection is not a `PgConnection`.
    pub fn connection(&self) -> Result<Arc<PgConnection>, SqlMiddlewareDbError> {
        self.source.connection()?.downcast::<PgConnection>()
    }

    /// The connection, failing with `ConnectionStateError` if it has been closed.
    pub(crate) fn open_connection(&self) -> Result<Arc<PgConnection>, SqlMiddlewareDbError> {
        let conn = self.connection()?;
        conn.ensure_open()?;
        Ok(conn)
    }

    /// Executes a batch of SQL statements through the executor.
    ///
    /// # Errors
    /// Returns backend errors unchanged.
    pub async fn execute_batch(&self, query: &str) -> Result<(), SqlMiddlewareDbError> {
        self.executor.execute_batch(query).await
    }

    /// Executes a SELECT through the executor.
    ///
    /// # Errors
    /// Returns backend errors unchanged.
    pub async fn execute_select(
        &self,
        query: &str,
        params: &[RowValues],
    ) -> Result<ResultSet, SqlMiddlewareDbError> {
        self.executor.execute_select(query, params).await
    }

    /// Executes a DML statement through the executor.
    ///
    /// # Errors
    /// Returns backend errors unchanged.
    pub async fn execute_dml(
        &self,
        query: &str,
        params: &[RowValues],
    ) -> Result<usize, SqlMiddlewareDbError> {
        self.executor.execute_dml(query, params).await
    }
}
