mod common;

use pg_middleware::prelude::*;
use tokio_postgres::error::SqlState;

async fn items_table(client: &PgClient) -> Result<(), SqlMiddlewareDbError> {
    client
        .execute_batch("CREATE TEMP TABLE items (id int4 PRIMARY KEY, name text);")
        .await
}

#[tokio::test]
async fn text_import_then_export() -> Result<(), SqlMiddlewareDbError> {
    let client = common::connect().await?;
    items_table(&client).await?;

    let mut importer = client.begin_text_import("COPY items (id, name) FROM STDIN").await?;
    importer.write_row(&[Some("1"), Some("plain")]).await?;
    importer.write_row(&[Some("2"), Some("tab\there\nnewline")]).await?;
    importer.write_row(&[Some("3"), None]).await?;
    importer.write_line("4\tback\\\\slash").await?;
    assert_eq!(importer.finish().await?, 4);
    assert_eq!(common::count_rows(&client, "items").await?, 4);

    let mut exporter = client
        .begin_text_export("COPY (SELECT id, name FROM items ORDER BY id) TO STDOUT")
        .await?;
    let mut rows = Vec::new();
    while let Some(row) = exporter.read_row().await? {
        rows.push(row);
    }
    assert_eq!(
        rows,
        vec![
            vec![Some("1".to_string()), Some("plain".to_string())],
            vec![Some("2".to_string()), Some("tab\there\nnewline".to_string())],
            vec![Some("3".to_string()), None],
            vec![Some("4".to_string()), Some("back\\slash".to_string())],
        ]
    );
    assert!(exporter.read_line().await?.is_none());
    drop(exporter);

    let exporter = client
        .begin_text_export("COPY (SELECT id FROM items WHERE id < 3 ORDER BY id) TO STDOUT")
        .await?;
    assert_eq!(exporter.read_to_string().await?, "1\n2\n");

    client.close().await?;
    Ok(())
}

#[tokio::test]
async fn one_channel_per_connection() -> Result<(), SqlMiddlewareDbError> {
    let client = common::connect().await?;
    items_table(&client).await?;

    let mut importer = client.begin_text_import("COPY items FROM STDIN").await?;
    importer.write_row(&[Some("10"), Some("ten")]).await?;

    let second = client.begin_text_export("COPY items TO STDOUT").await;
    assert!(matches!(second, Err(SqlMiddlewareDbError::ProtocolError(_))));
    let raw = client.begin_raw_binary_copy("COPY items FROM STDIN").await;
    assert!(matches!(raw, Err(SqlMiddlewareDbError::ProtocolError(_))));
    let busy = client.execute_select("SELECT 1", &[]).await;
    assert!(matches!(busy, Err(SqlMiddlewareDbError::ProtocolError(_))));
    let begin = client.begin_transaction(None).await;
    assert!(matches!(begin, Err(SqlMiddlewareDbError::ProtocolError(_))));

    assert_eq!(importer.finish().await?, 1);

    // command-ready again once the first channel is done
    assert_eq!(common::count_rows(&client, "items").await?, 1);
    let exporter = client.begin_text_export("COPY items TO STDOUT").await?;
    assert_eq!(exporter.read_to_string().await?, "10\tten\n");

    client.close().await?;
    Ok(())
}

#[tokio::test]
async fn cancelled_import_keeps_nothing() -> Result<(), SqlMiddlewareDbError> {
    let client = common::connect().await?;
    items_table(&client).await?;

    let mut importer = client.begin_text_import("COPY items FROM STDIN").await?;
    importer.write_row(&[Some("1"), Some("dropped")]).await?;
    importer.cancel();

    assert_eq!(common::count_rows(&client, "items").await?, 0);
    let mut importer = client.begin_text_import("COPY items FROM STDIN").await?;
    importer.write_row(&[Some("2"), Some("kept")]).await?;
    assert_eq!(importer.finish().await?, 1);

    client.close().await?;
    Ok(())
}

#[tokio::test]
async fn malformed_commands_fail_with_backend_error() -> Result<(), SqlMiddlewareDbError> {
    let client = common::connect().await?;
    let err = client
        .begin_text_export("COPY no_such_table_pgmw TO STDOUT")
        .await
        .unwrap_err();
    assert_eq!(err.sql_state(), Some(&SqlState::UNDEFINED_TABLE));

    // the failed open released the channel
    let exporter = client.begin_text_export("COPY (SELECT 1) TO STDOUT").await?;
    assert_eq!(exporter.read_to_string().await?, "1\n");

    client.close().await?;
    Ok(())
}

#[tokio::test]
async fn wrong_direction_commands_are_refused_before_sending() -> Result<(), SqlMiddlewareDbError> {
    let client = common::connect().await?;
    items_table(&client).await?;

    let refused = [
        client.begin_text_export("COPY items FROM STDIN").await.map(|_| ()),
        client.begin_binary_export("COPY items FROM STDIN (FORMAT binary)").await.map(|_| ()),
        client.begin_text_import("COPY items TO STDOUT").await.map(|_| ()),
        client.begin_binary_import("COPY items TO STDOUT (FORMAT binary)").await.map(|_| ()),
    ];
    for result in refused {
        assert!(matches!(result, Err(SqlMiddlewareDbError::ProtocolError(_))));
    }

    let conn = client.connection()?;
    assert!(!conn.copy_in_progress());
    assert!(conn.is_open());
    client.execute_batch("SELECT 1").await?;
    assert_eq!(
        client.execute_dml("INSERT INTO items VALUES (1, 'after')", &[]).await?,
        1
    );
    assert_eq!(common::count_rows(&client, "items").await?, 1);

    client.close().await?;
    Ok(())
}

#[tokio::test]
async fn binary_import_then_export() -> Result<(), SqlMiddlewareDbError> {
    let client = common::connect().await?;
    client
        .execute_batch("CREATE TEMP TABLE readings (id int8, label text, ok bool, score float8);")
        .await?;

    let mut importer = client
        .begin_binary_import("COPY readings (id, label, ok, score) FROM STDIN (FORMAT binary)")
        .await?;
    assert!(matches!(
        importer.write_null(),
        Err(SqlMiddlewareDbError::ProtocolError(_))
    ));
    importer.start_row().await?;
    importer.write(&1_i64, &Type::INT8)?;
    importer.write(&"first", &Type::TEXT)?;
    importer.write(&true, &Type::BOOL)?;
    importer.write(&0.5_f64, &Type::FLOAT8)?;
    importer
        .write_row(&[
            RowValues::Int(2),
            RowValues::Null,
            RowValues::Bool(false),
            RowValues::Float(1.25),
        ])
        .await?;
    assert_eq!(importer.finish().await?, 2);

    let mut exporter = client
        .begin_binary_export(
            "COPY (SELECT id, label, ok, score FROM readings ORDER BY id) TO STDOUT (FORMAT binary)",
        )
        .await?;
    let first = exporter.next_row().await?.expect("first row");
    assert_eq!(first.len(), 4);
    assert_eq!(first.get::<i64>(0, &Type::INT8)?, 1);
    assert_eq!(first.get::<&str>(1, &Type::TEXT)?, "first");
    assert!(first.get::<bool>(2, &Type::BOOL)?);

    let second = exporter.next_row().await?.expect("second row");
    assert!(second.is_null(1));
    assert_eq!(
        second.to_row_values(&[Type::INT8, Type::TEXT, Type::BOOL, Type::FLOAT8])?,
        vec![
            RowValues::Int(2),
            RowValues::Null,
            RowValues::Bool(false),
            RowValues::Float(1.25)
        ]
    );
    assert!(exporter.next_row().await?.is_none());
    exporter.finish().await?;

    client.close().await?;
    Ok(())
}

#[tokio::test]
async fn mismatched_binary_types_are_rejected_by_the_server() -> Result<(), SqlMiddlewareDbError> {
    let client = common::connect().await?;
    items_table(&client).await?;

    let mut importer = client
        .begin_binary_import("COPY items (id, name) FROM STDIN (FORMAT binary)")
        .await?;
    importer.start_row().await?;
    // int8 bytes for an int4 column
    importer.write(&7_i64, &Type::INT8)?;
    importer.write(&"seven", &Type::TEXT)?;
    let err = importer.finish().await.unwrap_err();
    assert!(matches!(err, SqlMiddlewareDbError::PostgresError(_)));

    assert_eq!(common::count_rows(&client, "items").await?, 0);
    client.close().await?;
    Ok(())
}

#[tokio::test]
async fn raw_streams_pass_bytes_through() -> Result<(), SqlMiddlewareDbError> {
    let client = common::connect().await?;
    items_table(&client).await?;

    let mut import = client.begin_raw_binary_copy("COPY items FROM STDIN").await?;
    assert_eq!(import.direction(), CopyDirection::Import);
    import.write(b"5\tfive\n".to_vec()).await?;
    import.write("6\tsix\n").await?;
    assert!(matches!(
        import.read().await,
        Err(SqlMiddlewareDbError::ProtocolError(_))
    ));
    assert_eq!(import.finish().await?, 2);

    let mut export = client
        .begin_raw_binary_copy("COPY (SELECT id, name FROM items ORDER BY id) TO STDOUT")
        .await?;
    assert_eq!(export.direction(), CopyDirection::Export);
    let mut bytes = Vec::new();
    while let Some(chunk) = export.read().await? {
        bytes.extend_from_slice(&chunk);
    }
    assert_eq!(bytes, b"5\tfive\n6\tsix\n");
    assert_eq!(export.finish().await?, 0);

    client.close().await?;
    Ok(())
}
