//! Embedded PostgreSQL for tests and local experiments.

use postgresql_embedded::PostgreSQL;

use crate::client::PgClient;

/// A running embedded server; stop it with [`stop_postgres_embedded`].
pub struct EmbeddedPostgres {
    pub postgresql: PostgreSQL,
    pub port: u16,
    pub database_url: String,
}

/// Install (bundled binaries), start a server and create `db_name` on it.
///
/// # Errors
/// Returns an error if the server cannot be set up or started, the database cannot be
/// created, or the post-start connectivity check fails.
pub async fn setup_postgres_embedded(
    db_name: &str,
) -> Result<EmbeddedPostgres, Box<dyn std::error::Error>> {
    let mut postgresql = PostgreSQL::default();
    postgresql.setup().await?;
    postgresql.start().await?;
    postgresql.create_database(db_name).await?;

    let settings = postgresql.settings();
    let port = settings.port;
    let database_url = format!(
        "postgres://{}:{}@{}:{port}/{db_name}",
        settings.username, settings.password, settings.host
    );
    tracing::info!(port, db = db_name, "embedded postgres started");

    let client = PgClient::connect(&database_url).await?;
    client.execute_batch("SELECT 1").await?;
    client.close().await?;

    Ok(EmbeddedPostgres {
        postgresql,
        port,
        database_url,
    })
}

/// Stop a server started by [`setup_postgres_embedded`].
pub async fn stop_postgres_embedded(postgres: EmbeddedPostgres) {
    if let Err(err) = postgres.postgresql.stop().await {
        tracing::warn!(error = %err, "embedded postgres did not stop cleanly");
    }
}
