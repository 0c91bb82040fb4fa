use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use pg_middleware::prelude::*;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Inspect a PostgreSQL session, listen for notifications, export with COPY")]
struct Args {
    /// Connection string, e.g. `postgres://user@localhost/db` or `host=localhost user=me`.
    #[arg(long)]
    url: String,
    #[arg(long, value_enum, default_value = "text")]
    command_mode: CommandMode,
    /// Negotiate TLS; the connection string's `sslmode` decides whether it is required.
    #[arg(long)]
    tls: bool,
    /// PEM file with extra root certificates to trust.
    #[arg(long, requires = "tls")]
    root_cert: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the connection snapshot as JSON.
    Info,
    /// LISTEN on a channel and print each notification as a JSON line.
    Listen {
        #[arg(long)]
        channel: String,
        /// Stop after this many milliseconds without a notification; negative waits forever.
        #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
        timeout_ms: i64,
    },
    /// Run a `COPY .. TO STDOUT` command and write its text output to stdout.
    Export {
        #[arg(long)]
        command: String,
    },
}

#[derive(Serialize)]
struct NotificationLine<'a> {
    channel: &'a str,
    payload: &'a str,
    process_id: i32,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("{err}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<(), SqlMiddlewareDbError> {
    let options =
        PostgresOptions::from_connection_string(&args.url)?.with_command_mode(args.command_mode);
    let client = if args.tls {
        let mut factory = RustlsConnectionFactory::new();
        if let Some(path) = &args.root_cert {
            let pem = std::fs::read(path).map_err(|e| {
                SqlMiddlewareDbError::ConfigError(format!("cannot read {}: {e}", path.display()))
            })?;
            factory = factory.with_root_certificates_pem(&pem)?;
        }
        PgClient::from_options_with_factory(options, Arc::new(factory)).await?
    } else {
        PgClient::from_options(options).await?
    };
    let outcome = match args.command {
        Command::Info => info(&client).await,
        Command::Listen {
            channel,
            timeout_ms,
        } => listen(&client, &channel, timeout_ms).await,
        Command::Export { command } => export(&client, &command).await,
    };
    client.close().await?;
    outcome
}

async fn info(client: &PgClient) -> Result<(), SqlMiddlewareDbError> {
    let snapshot = client.snapshot().await?;
    let json = serde_json::to_string_pretty(&snapshot)
        .map_err(|e| SqlMiddlewareDbError::ExecutionError(format!("cannot render snapshot: {e}")))?;
    println!("{json}");
    Ok(())
}

async fn listen(client: &PgClient, channel: &str, timeout_ms: i64) -> Result<(), SqlMiddlewareDbError> {
    let handle = client.subscribe_notification(|notification| {
        let line = NotificationLine {
            channel: notification.channel(),
            payload: notification.payload(),
            process_id: notification.process_id(),
        };
        if let Ok(json) = serde_json::to_string(&line) {
            println!("{json}");
        }
    })?;
    client
        .execute_batch(&format!("LISTEN {}", quote_ident(channel)))
        .await?;
    tracing::info!(channel, "listening");

    let stop = CancellationToken::new();
    let on_signal = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal.cancel();
        }
    });

    let timeout = timeout_from_millis(timeout_ms);
    let result = loop {
        match client.wait_for_notification_cancellable(timeout, &stop).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::info!("no notification within the timeout");
                break Ok(());
            }
            Err(SqlMiddlewareDbError::Cancelled(_)) => break Ok(()),
            Err(err) => break Err(err),
        }
    };
    client.unsubscribe(handle)?;
    result
}

async fn export(client: &PgClient, command: &str) -> Result<(), SqlMiddlewareDbError> {
    let mut exporter = client.begin_text_export(command).await?;
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    while let Some(line) = exporter.read_line().await? {
        writeln!(out, "{line}")
            .map_err(|e| SqlMiddlewareDbError::ExecutionError(format!("cannot write output: {e}")))?;
    }
    Ok(())
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
