#![allow(dead_code)]

use std::ops::Deref;
use std::time::Duration;

use pg_middleware::prelude::*;
use pg_middleware::test_utils::{EmbeddedPostgres, setup_postgres_embedded, stop_postgres_embedded};
use tokio_postgres::error::SqlState;

// bundled binaries are unpacked on first setup; one server installs at a time
static EMBEDDED_SETUP: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());

/// The database a test runs against: `TESTING_PG_URL` when set, otherwise an embedded
/// server that is stopped when this is dropped.
pub struct TestServer {
    url: String,
    embedded: Option<EmbeddedPostgres>,
}

impl TestServer {
    pub async fn start() -> Result<Self, SqlMiddlewareDbError> {
        if let Some(url) = std::env::var("TESTING_PG_URL")
            .ok()
            .filter(|url| !url.trim().is_empty())
        {
            return Ok(TestServer {
                url,
                embedded: None,
            });
        }

        let _setup = EMBEDDED_SETUP.lock().await;
        let embedded = setup_postgres_embedded("pgmw_test").await.map_err(|e| {
            SqlMiddlewareDbError::ConfigError(format!("embedded postgres did not start: {e}"))
        })?;
        Ok(TestServer {
            url: embedded.database_url.clone(),
            embedded: Some(embedded),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let Some(embedded) = self.embedded.take() else {
            return;
        };
        // the test's runtime may already be shutting down
        let stopped = std::thread::spawn(move || {
            match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt.block_on(stop_postgres_embedded(embedded)),
                Err(err) => eprintln!("cannot stop embedded postgres: {err}"),
            }
        })
        .join();
        if stopped.is_err() {
            eprintln!("stopping embedded postgres panicked");
        }
    }
}

/// A connected client plus the server it talks to.
pub struct TestDb {
    client: PgClient,
    server: TestServer,
}

impl TestDb {
    pub fn url(&self) -> &str {
        self.server.url()
    }
}

impl Deref for TestDb {
    type Target = PgClient;

    fn deref(&self) -> &PgClient {
        &self.client
    }
}

pub async fn connect() -> Result<TestDb, SqlMiddlewareDbError> {
    let server = TestServer::start().await?;
    let client = PgClient::connect(server.url()).await?;
    Ok(TestDb { client, server })
}

/// True when the session is inside a transaction block: only there does `SAVEPOINT` succeed.
pub async fn in_server_transaction(client: &PgClient) -> Result<bool, SqlMiddlewareDbError> {
    match client.execute_batch("SAVEPOINT pgmw_tx_check").await {
        Ok(()) => {
            client
                .execute_batch("RELEASE SAVEPOINT pgmw_tx_check")
                .await?;
            Ok(true)
        }
        Err(err) if err.sql_state() == Some(&SqlState::NO_ACTIVE_SQL_TRANSACTION) => Ok(false),
        Err(err) => Err(err),
    }
}

pub async fn count_rows(client: &PgClient, table: &str) -> Result<i64, SqlMiddlewareDbError> {
    let rs = client
        .execute_select(&format!("SELECT count(*) AS cnt FROM {table}"), &[])
        .await?;
    rs.results[0]
        .get("cnt")
        .and_then(RowValues::as_int)
        .copied()
        .ok_or_else(|| SqlMiddlewareDbError::ExecutionError("missing count".into()))
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
