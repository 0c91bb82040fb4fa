//! The generic execution seam the adapter sits on.
//!
//! `PgClient` only knows an `AsyncDatabaseExecutor` for SQL and a `ConnectionSource` that
//! hands out the current connection as a type-erased `AnyConnection`. `PgExecutor` implements
//! both for a single PostgreSQL session.

use std::any::{Any, type_name};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;

use crate::config::PostgresOptions;
use crate::connection::PgConnection;
use crate::error::SqlMiddlewareDbError;
use crate::postgres as pg;
use crate::results::ResultSet;
use crate::types::{CommandMode, RowValues};

#[async_trait]
pub trait AsyncDatabaseExecutor: Send + Sync {
    /// How command text passed to `execute_select` / `execute_dml` is interpreted.
    fn command_mode(&self) -> CommandMode {
        CommandMode::Text
    }

    /// Executes a batch of SQL statements. No parameters are supported.
    async fn execute_batch(&self, query: &str) -> Result<(), SqlMiddlewareDbError>;

    /// Executes a single SELECT statement and returns the result set.
    async fn execute_select(
        &self,
        query: &str,
        params: &[RowValues],
    ) -> Result<ResultSet, SqlMiddlewareDbError>;

    /// Executes a single DML statement and returns the number of rows affected.
    async fn execute_dml(
        &self,
        query: &str,
        params: &[RowValues],
    ) -> Result<usize, SqlMiddlewareDbError>;
}

/// Hands out the connection an executor is currently using.
pub trait ConnectionSource: Send + Sync {
    /// # Errors
    /// Implementations return `ConnectionStateError` when no connection is available.
    fn connection(&self) -> Result<AnyConnection, SqlMiddlewareDbError>;
}

/// A connection object of unknown backend type.
#[derive(Clone)]
pub struct AnyConnection {
    inner: Arc<dyn Any + Send + Sync>,
    type_name: &'static str,
}

impl std::fmt::Debug for AnyConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnyConnection")
            .field("type_name", &self.type_name)
            .finish_non_exhaustive()
    }
}

impl AnyConnection {
    #[must_use]
    pub fn new<T: Any + Send + Sync>(conn: Arc<T>) -> Self {
        Self {
            inner: conn,
            type_name: type_name::<T>(),
        }
    }

    #[must_use]
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Recover the concrete connection.
    ///
    /// # Errors
    /// Returns `SqlMiddlewareDbError::CastError` naming both types on a mismatch.
    pub fn downcast<T: Any + Send + Sync>(&self) -> Result<Arc<T>, SqlMiddlewareDbError> {
        Arc::clone(&self.inner)
            .downcast::<T>()
            .map_err(|_| SqlMiddlewareDbError::CastError {
                expected: type_name::<T>(),
                found: self.type_name,
            })
    }
}

/// Opens sessions for `PgExecutor`, e.g. with a TLS connector via `PgConnection::from_parts`.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn connect(&self, options: &PostgresOptions) -> Result<PgConnection, SqlMiddlewareDbError>;
}

/// Plain TCP / unix-socket sessions without TLS.
#[derive(Debug, Clone, Copy, Default)]
pub struct PgConnectionFactory;

#[async_trait]
impl ConnectionFactory for PgConnectionFactory {
    async fn connect(&self, options: &PostgresOptions) -> Result<PgConnection, SqlMiddlewareDbError> {
        Ok(PgConnection::connect(options.connect_config()?)
            .await?
            .with_close_grace(options.close_grace))
    }
}

/// Executor over one PostgreSQL session that can be swapped out by `reconnect`.
pub struct PgExecutor {
    current: RwLock<Arc<PgConnection>>,
    options: Option<PostgresOptions>,
    factory: Arc<dyn ConnectionFactory>,
    command_mode: CommandMode,
}

impl std::fmt::Debug for PgExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgExecutor")
            .field("current", &self.current())
            .field("command_mode", &self.command_mode)
            .finish_non_exhaustive()
    }
}

impl PgExecutor {
    /// # Errors
    /// Returns the backend error if the session cannot be opened.
    pub async fn connect(options: PostgresOptions) -> Result<Self, SqlMiddlewareDbError> {
        Self::connect_with_factory(options, Arc::new(PgConnectionFactory)).await
    }

    /// # Errors
    /// Returns whatever the factory returns.
    pub async fn connect_with_factory(
        options: PostgresOptions,
        factory: Arc<dyn ConnectionFactory>,
    ) -> Result<Self, SqlMiddlewareDbError> {
        let conn = factory.connect(&options).await?;
        Ok(Self {
            current: RwLock::new(Arc::new(conn)),
            command_mode: options.command_mode,
            options: Some(options),
            factory,
        })
    }

    /// Adopt an open session. Such an executor cannot `reconnect`.
    #[must_use]
    pub fn from_connection(conn: PgConnection, command_mode: CommandMode) -> Self {
        Self {
            current: RwLock::new(Arc::new(conn)),
            options: None,
            factory: Arc::new(PgConnectionFactory),
            command_mode,
        }
    }

    /// The session currently in use.
    #[must_use]
    pub fn current(&self) -> Arc<PgConnection> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Open a fresh session with the original options and close the old one. A password
    /// provider on the options is asked again.
    ///
    /// # Errors
    /// Returns `ConfigError` for executors built with `from_connection`, or the factory's error.
    pub async fn reconnect(&self) -> Result<(), SqlMiddlewareDbError> {
        let options = self.options.as_ref().ok_or_else(|| {
            SqlMiddlewareDbError::ConfigError(
                "executor was built from an existing connection and has no options to reconnect with"
                    .to_string(),
            )
        })?;
        let fresh = Arc::new(self.factory.connect(options).await?);
        let old = std::mem::replace(
            &mut *self.current.write().unwrap_or_else(PoisonError::into_inner),
            fresh,
        );
        tracing::debug!("postgres executor reconnected");
        if old.is_open() {
            old.close().await?;
        }
        Ok(())
    }

    #[must_use]
    pub fn close_grace(&self) -> Duration {
        self.options
            .as_ref()
            .map_or(crate::connection::DEFAULT_CLOSE_GRACE, |o| o.close_grace)
    }
}

impl ConnectionSource for PgExecutor {
    fn connection(&self) -> Result<AnyConnection, SqlMiddlewareDbError> {
        Ok(AnyConnection::new(self.current()))
    }
}

#[async_trait]
impl AsyncDatabaseExecutor for PgExecutor {
    fn command_mode(&self) -> CommandMode {
        self.command_mode
    }

    async fn execute_batch(&self, query: &str) -> Result<(), SqlMiddlewareDbError> {
        let conn = self.current();
        let client = conn.command_client().await?;
        pg::execute_batch(&client, query).await
    }

    async fn execute_select(
        &self,
        query: &str,
        params: &[RowValues],
    ) -> Result<ResultSet, SqlMiddlewareDbError> {
        let sql = self.command_mode.render(query, params.len(), true);
        let conn = self.current();
        let client = conn.command_client().await?;
        pg::execute_select(&client, &sql, params).await
    }

    async fn execute_dml(
        &self,
        query: &str,
        params: &[RowValues],
    ) -> Result<usize, SqlMiddlewareDbError> {
        let sql = self.command_mode.render(query, params.len(), false);
        let conn = self.current();
        let client = conn.command_client().await?;
        pg::execute_dml(&client, &sql, params).await
    }
}
