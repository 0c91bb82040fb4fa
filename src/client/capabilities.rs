use std::sync::Arc;

use super::PgClient;
use crate::connection::{
    Capabilities, ConnectionSnapshot, PgConnection, ServerVersion, TypeMapper, setting_enabled,
};
use crate::error::SqlMiddlewareDbError;
use crate::postgres::query::simple_row;

const SNAPSHOT_QUERY: &str = "SELECT pg_backend_pid()::text, current_setting('server_version'), \
     current_setting('TimeZone'), current_setting('integer_datetimes')";

impl PgClient {
    /// # Errors
    /// Returns `ConnectionStateError` on a closed connection.
    pub fn host(&self) -> Result<String, SqlMiddlewareDbError> {
        Ok(self.open_connection()?.host())
    }

    /// # Errors
    /// Returns `ConnectionStateError` on a closed connection.
    pub fn port(&self) -> Result<u16, SqlMiddlewareDbError> {
        Ok(self.open_connection()?.port())
    }

    /// The role the session authenticated as.
    ///
    /// # Errors
    /// Returns `ConnectionStateError` on a closed connection.
    pub fn user_name(&self) -> Result<Option<String>, SqlMiddlewareDbError> {
        Ok(self.open_connection()?.config().get_user().map(str::to_string))
    }

    /// True when no password was supplied, i.e. authentication was left to the server
    /// (peer, trust, GSSAPI/SSPI or a password file).
    ///
    /// # Errors
    /// Returns `ConnectionStateError` on a closed connection.
    pub fn integrated_security(&self) -> Result<bool, SqlMiddlewareDbError> {
        Ok(self.open_connection()?.config().get_password().is_none())
    }

    /// Backend process id of the session.
    ///
    /// # Errors
    /// Returns `ConnectionStateError` on a closed connection or the backend error unchanged.
    pub async fn process_id(&self) -> Result<i32, SqlMiddlewareDbError> {
        let conn = self.open_connection()?;
        let value = setting(&conn, "SELECT pg_backend_pid()").await?;
        value.trim().parse::<i32>().map_err(|e| {
            SqlMiddlewareDbError::ExecutionError(format!("unexpected backend pid {value:?}: {e}"))
        })
    }

    /// # Errors
    /// Returns `ConnectionStateError` on a closed connection or the backend error unchanged.
    pub async fn server_version(&self) -> Result<ServerVersion, SqlMiddlewareDbError> {
        let conn = self.open_connection()?;
        let raw = setting(&conn, "SHOW server_version").await?;
        ServerVersion::parse(&raw).ok_or_else(|| {
            SqlMiddlewareDbError::ExecutionError(format!("unparsable server_version {raw:?}"))
        })
    }

    /// The session's `TimeZone` setting, e.g. `Europe/Berlin` or `UTC`.
    ///
    /// # Errors
    /// Returns `ConnectionStateError` on a closed connection or the backend error unchanged.
    pub async fn timezone(&self) -> Result<String, SqlMiddlewareDbError> {
        let conn = self.open_connection()?;
        setting(&conn, "SHOW TimeZone").await
    }

    /// # Errors
    /// Returns `ConnectionStateError` on a closed connection or the backend error unchanged.
    pub async fn has_integer_datetimes(&self) -> Result<bool, SqlMiddlewareDbError> {
        let conn = self.open_connection()?;
        Ok(setting_enabled(&setting(&conn, "SHOW integer_datetimes").await?))
    }

    /// # Errors
    /// Returns `ConnectionStateError` on a closed connection.
    pub fn type_mapper(&self) -> Result<Arc<TypeMapper>, SqlMiddlewareDbError> {
        Ok(Arc::clone(self.open_connection()?.type_mapper()))
    }

    /// # Errors
    /// Returns `ConnectionStateError` on a closed connection.
    pub fn capabilities(&self) -> Result<Capabilities, SqlMiddlewareDbError> {
        Ok(self.open_connection()?.capabilities())
    }

    /// All live connection properties in one round trip.
    ///
    /// # Errors
    /// Returns `ConnectionStateError` on a closed connection or the backend error unchanged.
    pub async fn snapshot(&self) -> Result<ConnectionSnapshot, SqlMiddlewareDbError> {
        let conn = self.open_connection()?;
        let row = {
            let client = conn.command_client().await?;
            simple_row(&client, SNAPSHOT_QUERY).await?
        };
        let column = |idx: usize| row.get(idx).cloned().flatten().unwrap_or_default();
        let pid = column(0);
        Ok(ConnectionSnapshot {
            host: conn.host(),
            port: conn.port(),
            user_name: conn.config().get_user().map(str::to_string),
            integrated_security: conn.config().get_password().is_none(),
            process_id: pid.trim().parse::<i32>().map_err(|e| {
                SqlMiddlewareDbError::ExecutionError(format!("unexpected backend pid {pid:?}: {e}"))
            })?,
            server_version: column(1),
            timezone: column(2),
            integer_datetimes: setting_enabled(&column(3)),
        })
    }
}

async fn setting(conn: &PgConnection, query: &str) -> Result<String, SqlMiddlewareDbError> {
    let client = conn.command_client().await?;
    let row = simple_row(&client, query).await?;
    row.into_iter().next().flatten().ok_or_else(|| {
        SqlMiddlewareDbError::ExecutionError(format!("{query} returned NULL"))
    })
}
