//! Neural Engine Operator CLI
//!
//! Talks to a running engine over its control-plane API for device and
//! session operations, and goes straight to the stores for ledger
//! forensics so a locked-down or stopped service can still be audited.
//!
//! Exit codes: 0 success, 1 user error, 2 integrity violation,
//! 3 service unavailable.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use colored::Colorize;

use neurascale_engine::config::StorageConfig;
use neurascale_engine::ingest::batch::split_frames;
use neurascale_engine::ledger::{LedgerStore, VerifyOutcome};

const EXIT_OK: u8 = 0;
const EXIT_USER_ERROR: u8 = 1;
const EXIT_INTEGRITY: u8 = 2;
const EXIT_UNAVAILABLE: u8 = 3;

#[derive(Parser)]
#[command(name = "neurascale", version, about = "NeuraScale Neural Engine operator CLI")]
struct Cli {
    /// Engine API base URL
    #[arg(long, env = "NEURASCALE_API", default_value = "http://127.0.0.1:8080")]
    api: String,

    /// Bearer token for API calls
    #[arg(long, env = "NEURASCALE_TOKEN")]
    token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Ingestion operations
    Ingest {
        #[command(subcommand)]
        command: IngestCommand,
    },
    /// Ledger forensics (direct store access)
    Ledger {
        #[command(subcommand)]
        command: LedgerCommand,
    },
    /// Device operations
    Devices {
        #[command(subcommand)]
        command: DevicesCommand,
    },
    /// Session operations
    Session {
        #[command(subcommand)]
        command: SessionCommand,
    },
}

#[derive(Subcommand)]
enum IngestCommand {
    /// Replay a batch file through the ingestion API
    Replay { file: PathBuf },
}

#[derive(Subcommand)]
enum LedgerCommand {
    /// Replay a chain range and verify every hash
    Verify {
        #[arg(long, default_value_t = 0)]
        from: u64,
        #[arg(long)]
        to: Option<u64>,
        #[arg(long, default_value_t = 0)]
        shard: u32,
    },
    /// Print a chain range as JSON lines
    Dump {
        /// Range as `from..to` (inclusive)
        range: String,
        #[arg(long, default_value_t = 0)]
        shard: u32,
    },
}

#[derive(Subcommand)]
enum DevicesCommand {
    /// List attached devices
    List,
    /// Run a discovery scan
    Scan {
        #[arg(long, default_value_t = 5)]
        timeout_s: u64,
    },
}

#[derive(Subcommand)]
enum SessionCommand {
    /// Start a recording session
    Start {
        #[arg(long)]
        paradigm: Option<String>,
        #[arg(long)]
        device: Vec<String>,
    },
    /// End the active session
    End { session_id: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {e:#}", "error:".red().bold());
            EXIT_USER_ERROR
        }
    };
    ExitCode::from(code)
}

async fn run(cli: Cli) -> anyhow::Result<u8> {
    match cli.command {
        Command::Ingest {
            command: IngestCommand::Replay { file },
        } => replay_batch(&cli.api, cli.token.as_deref(), &file).await,
        Command::Ledger { command } => ledger_command(command).await,
        Command::Devices { command } => devices_command(&cli.api, cli.token.as_deref(), command).await,
        Command::Session { command } => session_command(&cli.api, cli.token.as_deref(), command).await,
    }
}

// ============================================================================
// Ingest
// ============================================================================

async fn replay_batch(api: &str, token: Option<&str>, file: &PathBuf) -> anyhow::Result<u8> {
    use base64::Engine;

    let bytes = std::fs::read(file)?;
    let frames = match split_frames(&bytes) {
        Ok(frames) => frames,
        Err(e) => {
            eprintln!("{} {e}", "bad batch file:".red());
            return Ok(EXIT_USER_ERROR);
        }
    };
    println!("replaying {} frames from {}", frames.len(), file.display());

    let client = reqwest::Client::new();
    let mut accepted = 0u64;
    let mut rejected = 0u64;
    for frame in frames {
        let body = serde_json::json!({
            "frame_b64": base64::engine::general_purpose::STANDARD.encode(frame),
        });
        let mut request = client.post(format!("{api}/v1/ingest/neural-data")).json(&body);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                eprintln!("{} {e}", "engine unreachable:".red());
                return Ok(EXIT_UNAVAILABLE);
            }
        };
        match response.status().as_u16() {
            200 => accepted += 1,
            503 => {
                eprintln!("{}", "engine is in integrity lockdown".red());
                return Ok(EXIT_UNAVAILABLE);
            }
            _ => rejected += 1,
        }
    }
    println!(
        "{} accepted, {} rejected",
        accepted.to_string().green(),
        rejected.to_string().yellow()
    );
    Ok(EXIT_OK)
}

// ============================================================================
// Ledger
// ============================================================================

async fn ledger_command(command: LedgerCommand) -> anyhow::Result<u8> {
    let storage = StorageConfig::from_env();
    let store = match LedgerStore::connect(&storage.ledger_db).await {
        Ok(store) => store,
        Err(e) => {
            eprintln!("{} {e}", "ledger store unavailable:".red());
            return Ok(EXIT_UNAVAILABLE);
        }
    };

    match command {
        LedgerCommand::Verify { from, to, shard } => {
            let to = match to {
                Some(to) => to,
                None => match store.tip(shard).await? {
                    Some((seq, _)) => seq,
                    None => {
                        println!("{} shard {shard} is empty", "OK".green().bold());
                        return Ok(EXIT_OK);
                    }
                },
            };
            match store.verify(shard, from, to, None).await? {
                VerifyOutcome::Ok { checked } => {
                    println!(
                        "{} chain intact, {checked} events verified (shard {shard}, {from}..={to})",
                        "OK".green().bold()
                    );
                    Ok(EXIT_OK)
                }
                VerifyOutcome::Violation(violation) => {
                    println!(
                        "{} first bad seq {} ({})",
                        "VIOLATION".red().bold(),
                        violation.first_bad_seq,
                        violation.reason
                    );
                    Ok(EXIT_INTEGRITY)
                }
            }
        }
        LedgerCommand::Dump { range, shard } => {
            let (from, to) = match parse_range(&range) {
                Some(bounds) => bounds,
                None => {
                    eprintln!("{} range must look like 0..100", "error:".red());
                    return Ok(EXIT_USER_ERROR);
                }
            };
            let events = store.analytical_range(shard, from, to).await?;
            for event in &events {
                println!("{}", serde_json::to_string(event)?);
            }
            eprintln!("{} events", events.len());
            Ok(EXIT_OK)
        }
    }
}

fn parse_range(range: &str) -> Option<(u64, u64)> {
    let (from, to) = range.split_once("..")?;
    Some((from.parse().ok()?, to.parse().ok()?))
}

// ============================================================================
// Devices & sessions (API-backed)
// ============================================================================

async fn api_get(
    api: &str,
    token: Option<&str>,
    path: &str,
) -> anyhow::Result<Result<serde_json::Value, u8>> {
    let client = reqwest::Client::new();
    let mut request = client.get(format!("{api}{path}"));
    if let Some(token) = token {
        request = request.bearer_auth(token);
    }
    let response = match request.send().await {
        Ok(response) => response,
        Err(e) => {
            eprintln!("{} {e}", "engine unreachable:".red());
            return Ok(Err(EXIT_UNAVAILABLE));
        }
    };
    decode_response(response).await
}

async fn api_post(
    api: &str,
    token: Option<&str>,
    path: &str,
    body: serde_json::Value,
) -> anyhow::Result<Result<serde_json::Value, u8>> {
    let client = reqwest::Client::new();
    let mut request = client.post(format!("{api}{path}")).json(&body);
    if let Some(token) = token {
        request = request.bearer_auth(token);
    }
    let response = match request.send().await {
        Ok(response) => response,
        Err(e) => {
            eprintln!("{} {e}", "engine unreachable:".red());
            return Ok(Err(EXIT_UNAVAILABLE));
        }
    };
    decode_response(response).await
}

async fn decode_response(
    response: reqwest::Response,
) -> anyhow::Result<Result<serde_json::Value, u8>> {
    let status = response.status();
    let body: serde_json::Value = response.json().await.unwrap_or_default();
    if status.is_success() {
        return Ok(Ok(body));
    }
    eprintln!(
        "{} {} {}",
        "request failed:".red(),
        status,
        body["error"].as_str().unwrap_or("")
    );
    Ok(Err(if status.as_u16() == 503 {
        EXIT_UNAVAILABLE
    } else {
        EXIT_USER_ERROR
    }))
}

async fn devices_command(
    api: &str,
    token: Option<&str>,
    command: DevicesCommand,
) -> anyhow::Result<u8> {
    match command {
        DevicesCommand::List => match api_get(api, token, "/v1/devices").await? {
            Ok(devices) => {
                let list = devices.as_array().cloned().unwrap_or_default();
                if list.is_empty() {
                    println!("no devices attached");
                } else {
                    for device in list {
                        println!(
                            "{}  {}  {} ch @ {} Hz",
                            device["device_id"].as_str().unwrap_or("?").bold(),
                            device["device_type"].as_str().unwrap_or("?"),
                            device["channels"].as_array().map(|c| c.len()).unwrap_or(0),
                            device["sampling_rate_hz"]
                        );
                    }
                }
                Ok(EXIT_OK)
            }
            Err(code) => Ok(code),
        },
        DevicesCommand::Scan { timeout_s } => {
            match api_get(api, token, &format!("/v1/devices/discover?timeout={timeout_s}s")).await? {
                Ok(report) => {
                    for device in report["devices"].as_array().cloned().unwrap_or_default() {
                        println!(
                            "{}  [{}]  {}",
                            device["discovery_id"].as_str().unwrap_or("?").bold(),
                            device["protocol"].as_str().unwrap_or("?"),
                            device["friendly_name"].as_str().unwrap_or("?")
                        );
                    }
                    for error in report["errors"].as_array().cloned().unwrap_or_default() {
                        eprintln!(
                            "{} {}: {}",
                            "probe failed".yellow(),
                            error["protocol"].as_str().unwrap_or("?"),
                            error["message"].as_str().unwrap_or("?")
                        );
                    }
                    Ok(EXIT_OK)
                }
                Err(code) => Ok(code),
            }
        }
    }
}

async fn session_command(
    api: &str,
    token: Option<&str>,
    command: SessionCommand,
) -> anyhow::Result<u8> {
    match command {
        SessionCommand::Start { paradigm, device } => {
            let body = serde_json::json!({
                "paradigm": paradigm,
                "devices": device,
            });
            match api_post(api, token, "/v1/session/start", body).await? {
                Ok(reply) => {
                    println!(
                        "{} {}",
                        "session started:".green(),
                        reply["session_id"].as_str().unwrap_or("?").bold()
                    );
                    Ok(EXIT_OK)
                }
                Err(code) => Ok(code),
            }
        }
        SessionCommand::End { session_id } => {
            let body = serde_json::json!({ "session_id": session_id });
            match api_post(api, token, "/v1/session/end", body).await? {
                Ok(summary) => {
                    println!(
                        "{} {} samples, mean quality {:.2}",
                        "session closed:".green(),
                        summary["samples_seen"],
                        summary["quality_summary"].as_f64().unwrap_or(0.0)
                    );
                    Ok(EXIT_OK)
                }
                Err(code) => Ok(code),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_range() {
        assert_eq!(parse_range("0..100"), Some((0, 100)));
        assert_eq!(parse_range("5..5"), Some((5, 5)));
        assert_eq!(parse_range("5"), None);
        assert_eq!(parse_range("a..b"), None);
    }
}
