mod common;

use pg_middleware::prelude::*;

#[tokio::test]
async fn live_properties_match_the_session() -> Result<(), SqlMiddlewareDbError> {
    let client = common::connect().await?;

    let pid = client.process_id().await?;
    assert!(pid > 0);

    let version = client.server_version().await?;
    assert!(version.major >= 10, "unexpected version {version}");
    let caps = client.capabilities()?;
    assert_eq!(caps.server_version_num / 10_000, version.major);
    // connected from a current-thread runtime
    assert!(!caps.blocking_calls);

    assert!(!client.timezone().await?.is_empty());
    assert!(client.has_integer_datetimes().await?);
    assert!(!client.host()?.is_empty());
    assert!(client.port()? > 0);

    let snapshot = client.snapshot().await?;
    assert_eq!(snapshot.process_id, pid);
    assert_eq!(snapshot.host, client.host()?);
    assert_eq!(snapshot.port, client.port()?);
    assert_eq!(snapshot.user_name, client.user_name()?);
    assert_eq!(snapshot.integrated_security, client.integrated_security()?);
    assert_eq!(snapshot.timezone, client.timezone().await?);
    assert!(snapshot.integer_datetimes);
    assert_eq!(
        ServerVersion::parse(&snapshot.server_version).map(|v| v.major),
        Some(version.major)
    );

    let mapper = client.type_mapper()?;
    assert_eq!(mapper.resolve("int4")?, Type::INT4);
    assert_eq!(mapper.resolve("pg_catalog.text")?, Type::TEXT);

    client.close().await?;
    Ok(())
}

#[tokio::test]
async fn timezone_follows_session_setting() -> Result<(), SqlMiddlewareDbError> {
    let client = common::connect().await?;
    client.execute_batch("SET TimeZone = 'America/Chicago'").await?;
    assert_eq!(client.timezone().await?, "America/Chicago");
    client.close().await?;
    Ok(())
}

#[tokio::test]
async fn stored_procedure_mode_calls_functions() -> Result<(), SqlMiddlewareDbError> {
    let server = common::TestServer::start().await?;
    let url = server.url();
    let client = PgClient::connect_with_mode(url, CommandMode::StoredProcedure).await?;
    client
        .execute_batch(
            "CREATE FUNCTION pg_temp.add_one(i int4) RETURNS int4 LANGUAGE sql AS $$ SELECT i + 1 $$;",
        )
        .await?;

    let rs = client
        .execute_select("pg_temp.add_one", &[RowValues::Int(41)])
        .await?;
    assert_eq!(rs.results.len(), 1);
    assert_eq!(rs.results[0].get_by_index(0), Some(&RowValues::Int(42)));

    client.close().await?;
    Ok(())
}

#[tokio::test]
async fn backend_errors_pass_through() -> Result<(), SqlMiddlewareDbError> {
    let client = common::connect().await?;
    let err = client
        .execute_select("SELECT * FROM no_such_table_pgmw", &[])
        .await
        .unwrap_err();
    assert!(matches!(err, SqlMiddlewareDbError::PostgresError(_)));
    assert_eq!(
        err.sql_state(),
        Some(&tokio_postgres::error::SqlState::UNDEFINED_TABLE)
    );
    client.close().await?;
    Ok(())
}
