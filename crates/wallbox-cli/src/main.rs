//! Command-line wallbox client.

use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::info;
use tracing_subscriber::EnvFilter;

use wallbox_client::{ClientConfig, WallboxClient};

#[derive(Parser)]
#[command(
    name = "wallbox",
    about = "Talk to a wallbox charger over its WebSocket status protocol"
)]
struct Args {
    /// Device host: name or address, optionally with a port.
    #[arg(long, env = "WALLBOX_HOST")]
    host: String,

    /// Device password.
    #[arg(long, env = "WALLBOX_PASSWORD", hide_env_values = true)]
    password: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the full status document as JSON.
    Status,
    /// Read one property.
    Get { key: String },
    /// Write one property. The value is parsed as JSON, falling back to
    /// a bare string.
    Set { key: String, value: String },
    /// Print the status document on an interval until interrupted.
    Watch {
        /// Poll interval in seconds.
        #[arg(long, default_value_t = 5)]
        interval_secs: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let client = WallboxClient::new(ClientConfig::new(args.host.clone()));

    info!(host = %args.host, "connecting");
    tokio::select! {
        result = client.connect(&args.password) => {
            result.context("connecting to device")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted during connect");
            client.close().await;
            return Ok(());
        }
    }

    let result = tokio::select! {
        result = run_command(&client, args.command) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("received interrupt, shutting down");
            Ok(())
        }
    };

    client.close().await;
    result
}

async fn run_command(client: &WallboxClient, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Status => {
            let snapshot = client.status().await?;
            println!("{}", serde_json::to_string_pretty(&Value::Object(snapshot))?);
        }
        Command::Get { key } => {
            let value = client.get_property(&key).await?;
            println!("{value}");
        }
        Command::Set { key, value } => {
            client.set_property(&key, parse_value(&value)).await?;
        }
        Command::Watch { interval_secs } => loop {
            let snapshot = client.status().await?;
            println!("{}", serde_json::to_string(&Value::Object(snapshot))?);
            tokio::time::sleep(Duration::from_secs(interval_secs)).await;
        },
    }
    Ok(())
}

/// Interpret the argument as JSON when possible, else as a bare string.
fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_value_json() {
        assert_eq!(parse_value("16"), json!(16));
        assert_eq!(parse_value("true"), json!(true));
        assert_eq!(parse_value("\"eco\""), json!("eco"));
        assert_eq!(parse_value("{\"a\":1}"), json!({"a":1}));
    }

    #[test]
    fn test_parse_value_bare_string() {
        assert_eq!(parse_value("eco"), json!("eco"));
        assert_eq!(parse_value("not{json"), json!("not{json"));
    }
}
