//! PostgreSQL capability adapter over `tokio-postgres`.
//!
//! [`PgClient`] sits on top of a generic executor and exposes what plain SQL execution
//! cannot: server notices and `LISTEN`/`NOTIFY` delivery, COPY import/export channels,
//! cancellable transactions, and connection lifecycle and introspection.

pub mod client;
pub mod config;
pub mod connection;
pub mod copy;
pub mod error;
pub mod executor;
pub mod postgres;
pub mod prelude;
pub mod results;
#[cfg(feature = "test-utils")]
pub mod test_utils;
#[cfg(feature = "tls")]
pub mod tls;
pub mod transaction;
pub mod types;

pub use client::PgClient;
pub use config::PostgresOptions;
pub use connection::PgConnection;
pub use error::SqlMiddlewareDbError;
pub use transaction::PgTransaction;
