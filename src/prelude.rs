//! Convenient imports for common functionality.

pub use crate::client::PgClient;
pub use crate::config::PostgresOptions;
pub use crate::connection::{
    Capabilities, ConnectionSnapshot, DEFAULT_CLOSE_GRACE, EventKind, PgConnection,
    ServerVersion, SubscriptionHandle, TypeMapper, timeout_from_millis,
};
pub use crate::copy::{
    BinaryExporter, BinaryImporter, BinaryRow, CopyDirection, RawCopyStream, TextExporter,
    TextImporter,
};
pub use crate::error::SqlMiddlewareDbError;
pub use crate::executor::{
    AnyConnection, AsyncDatabaseExecutor, ConnectionFactory, ConnectionSource,
    PgConnectionFactory, PgExecutor,
};
pub use crate::results::{CustomDbRow, ResultSet};
#[cfg(feature = "tls")]
pub use crate::tls::{ClientIdentity, RustlsConnectionFactory, ServerCertificate};
pub use crate::transaction::PgTransaction;
pub use crate::types::{CommandMode, IsolationLevel, RowValues};

pub use tokio_postgres::types::Type;
pub use tokio_util::sync::CancellationToken;
