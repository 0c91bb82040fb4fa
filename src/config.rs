use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use deadpool_postgres::Config as PgConfig;
use tokio_postgres::Config;

use crate::connection::DEFAULT_CLOSE_GRACE;
use crate::error::SqlMiddlewareDbError;
use crate::types::CommandMode;

/// Supplies the password when a session is opened, e.g. a short-lived token from a secrets
/// store. It is given the configured settings and asked again on every connect and reconnect.
pub type PasswordProvider =
    Arc<dyn Fn(&Config) -> Result<String, SqlMiddlewareDbError> + Send + Sync>;

/// Everything needed to open a `PgClient`.
#[derive(Clone)]
pub struct PostgresOptions {
    pub config: Config,
    pub command_mode: CommandMode,
    pub close_grace: Duration,
    pub password_provider: Option<PasswordProvider>,
}

impl std::fmt::Debug for PostgresOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresOptions")
            .field("config", &self.config)
            .field("command_mode", &self.command_mode)
            .field("close_grace", &self.close_grace)
            .field("password_provider", &self.password_provider.is_some())
            .finish()
    }
}

impl PostgresOptions {
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            config,
            command_mode: CommandMode::default(),
            close_grace: DEFAULT_CLOSE_GRACE,
            password_provider: None,
        }
    }

    /// Parse a key/value or URL connection string, e.g.
    /// `host=localhost user=postgres dbname=app` or `postgres://postgres@localhost/app`.
    ///
    /// # Errors
    /// Returns `SqlMiddlewareDbError::ConfigError` if the string does not parse.
    pub fn from_connection_string(conn_str: &str) -> Result<Self, SqlMiddlewareDbError> {
        let config = Config::from_str(conn_str).map_err(|e| {
            SqlMiddlewareDbError::ConfigError(format!("invalid connection string: {e}"))
        })?;
        Ok(Self::new(config))
    }

    /// Build options from a `deadpool_postgres::Config`.
    ///
    /// # Errors
    /// Returns `SqlMiddlewareDbError::ConfigError` if dbname, host, port or user is missing,
    /// or the config cannot be converted.
    pub fn from_pg_config(pg_config: &PgConfig) -> Result<Self, SqlMiddlewareDbError> {
        if pg_config.dbname.is_none() {
            return Err(SqlMiddlewareDbError::ConfigError(
                "dbname is required".to_string(),
            ));
        }
        if pg_config.host.is_none() {
            return Err(SqlMiddlewareDbError::ConfigError(
                "host is required".to_string(),
            ));
        }
        if pg_config.port.is_none() {
            return Err(SqlMiddlewareDbError::ConfigError(
                "port is required".to_string(),
            ));
        }
        if pg_config.user.is_none() {
            return Err(SqlMiddlewareDbError::ConfigError(
                "user is required".to_string(),
            ));
        }

        let config = pg_config.get_pg_config().map_err(|e| {
            SqlMiddlewareDbError::ConfigError(format!("invalid postgres config: {e}"))
        })?;
        Ok(Self::new(config))
    }

    #[must_use]
    pub fn with_command_mode(mut self, command_mode: CommandMode) -> Self {
        self.command_mode = command_mode;
        self
    }

    #[must_use]
    pub fn with_close_grace(mut self, close_grace: Duration) -> Self {
        self.close_grace = close_grace;
        self
    }

    /// Ask `provider` for the password each time a session is opened. Its answer replaces any
    /// password in `config`.
    #[must_use]
    pub fn with_password_provider<F>(mut self, provider: F) -> Self
    where
        F: Fn(&Config) -> Result<String, SqlMiddlewareDbError> + Send + Sync + 'static,
    {
        self.password_provider = Some(Arc::new(provider));
        self
    }

    /// The settings to open the next session with.
    ///
    /// # Errors
    /// Returns whatever the password provider returns.
    pub fn connect_config(&self) -> Result<Config, SqlMiddlewareDbError> {
        let mut config = self.config.clone();
        if let Some(provider) = &self.password_provider {
            let password = provider(&self.config)?;
            config.password(password);
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_postgres::config::Host;

    fn full_pg_config() -> PgConfig {
        let mut cfg = PgConfig::new();
        cfg.dbname = Some("app".to_string());
        cfg.host = Some("db.internal".to_string());
        cfg.port = Some(6543);
        cfg.user = Some("svc".to_string());
        cfg
    }

    #[test]
    fn parses_key_value_strings() {
        let opts =
            PostgresOptions::from_connection_string("host=localhost port=5433 user=me dbname=x")
                .unwrap();
        assert_eq!(opts.config.get_ports(), &[5433]);
        assert_eq!(opts.config.get_user(), Some("me"));
        assert_eq!(opts.command_mode, CommandMode::Text);
        assert_eq!(opts.close_grace, DEFAULT_CLOSE_GRACE);
    }

    #[test]
    fn rejects_malformed_strings() {
        let err = PostgresOptions::from_connection_string("host=localhost port=notaport")
            .unwrap_err();
        assert!(matches!(err, SqlMiddlewareDbError::ConfigError(_)));
    }

    #[test]
    fn pg_config_requires_core_fields() {
        let opts = PostgresOptions::from_pg_config(&full_pg_config()).unwrap();
        assert_eq!(opts.config.get_dbname(), Some("app"));
        assert_eq!(
            opts.config.get_hosts(),
            &[Host::Tcp("db.internal".to_string())]
        );

        let mut missing_user = full_pg_config();
        missing_user.user = None;
        let err = PostgresOptions::from_pg_config(&missing_user).unwrap_err();
        assert!(err.to_string().contains("user is required"));

        let mut missing_db = full_pg_config();
        missing_db.dbname = None;
        assert!(PostgresOptions::from_pg_config(&missing_db).is_err());
    }

    #[test]
    fn password_provider_runs_for_every_connect_config() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let opts = PostgresOptions::from_connection_string("host=localhost user=svc password=stale")
            .unwrap()
            .with_password_provider(move |config| {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(format!("{}-token-{n}", config.get_user().unwrap_or_default()))
            });

        let first = opts.connect_config().unwrap();
        assert_eq!(first.get_password(), Some(&b"svc-token-1"[..]));
        let second = opts.clone().connect_config().unwrap();
        assert_eq!(second.get_password(), Some(&b"svc-token-2"[..]));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        // the configured settings are left alone
        assert_eq!(opts.config.get_password(), Some(&b"stale"[..]));
        assert!(format!("{opts:?}").contains("password_provider: true"));
    }

    #[test]
    fn password_provider_errors_propagate() {
        let opts = PostgresOptions::new(Config::new()).with_password_provider(|_| {
            Err(SqlMiddlewareDbError::ConfigError("vault unavailable".into()))
        });
        let err = opts.connect_config().unwrap_err();
        assert!(err.to_string().contains("vault unavailable"));
    }

    #[test]
    fn builders_override_defaults() {
        let opts = PostgresOptions::new(Config::new())
            .with_command_mode(CommandMode::StoredProcedure)
            .with_close_grace(Duration::from_millis(250));
        assert_eq!(opts.command_mode, CommandMode::StoredProcedure);
        assert_eq!(opts.close_grace, Duration::from_millis(250));
    }
}
