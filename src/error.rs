use thiserror::Error;

#[derive(Debug, Error)]
pub enum SqlMiddlewareDbError {
    /// Errors reported by the backend, passed through with the server's diagnostic intact.
    #[error(transparent)]
    PostgresError(#[from] tokio_postgres::Error),

    #[error("Cast error: expected connection of type {expected}, found {found}")]
    CastError {
        expected: &'static str,
        found: &'static str,
    },

    #[error("Connection state error: {0}")]
    ConnectionStateError(String),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("SQL execution error: {0}")]
    ExecutionError(String),

    #[error("Unknown postgres type: {0}")]
    UnknownType(String),

    #[error("Unimplemented feature: {0}")]
    Unimplemented(String),
}

impl SqlMiddlewareDbError {
    pub(crate) fn closed() -> Self {
        SqlMiddlewareDbError::ConnectionStateError("connection is closed".to_string())
    }

    /// The backend's SQLSTATE code, when this error came from the server.
    #[must_use]
    pub fn sql_state(&self) -> Option<&tokio_postgres::error::SqlState> {
        match self {
            SqlMiddlewareDbError::PostgresError(err) => err.code(),
            _ => None,
        }
    }
}
