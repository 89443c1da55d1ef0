#![forbid(unsafe_code)]

//! `conduit`: run one query against a configured engine.
//!
//! Loads configuration, spawns the engine, submits the prompt, and prints
//! the final text (or streamed text as it arrives) to stdout. Logs go to
//! stderr. Ctrl-C cancels the query.

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use agent_conduit::protocol::Message;
use agent_conduit::session::{DeliveryMode, RequestId};
use agent_conduit::{AppError, EngineConfig, Result, Session};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "conduit", about = "Run one query against a stream-json engine", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file; defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Print text as the engine streams it.
    #[arg(long)]
    stream: bool,

    /// Prompt to submit.
    prompt: String,
}

fn main() -> Result<ExitCode> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<ExitCode> {
    // ── Load configuration ──────────────────────────────
    let mut config = match &args.config {
        Some(path) => EngineConfig::load_from_path(path)?,
        None => EngineConfig::default(),
    };
    config.load_credential_from_env();
    config.validate()?;
    info!(executable = %config.executable, "configuration loaded");

    // ── Start the session ───────────────────────────────
    let session = Session::spawn(&config).await?;

    let mode = if args.stream {
        DeliveryMode::Streaming
    } else {
        DeliveryMode::Blocking
    };
    let id = session.query(args.prompt.as_str(), mode).await?;

    let outcome = tokio::select! {
        outcome = drive(&session, &id, mode) => outcome,
        _ = tokio::signal::ctrl_c() => {
            warn!(request_id = %id, "interrupt received, cancelling query");
            session.cancel(&id).await?;
            Err(AppError::Interrupted(format!("request {id} cancelled")))
        }
    };

    if let Err(err) = session.close().await {
        warn!(%err, "session close failed");
    }

    match outcome {
        Ok(true) => Ok(ExitCode::SUCCESS),
        Ok(false) => Ok(ExitCode::FAILURE),
        Err(err) => {
            error!(%err, "query failed");
            Ok(ExitCode::FAILURE)
        }
    }
}

/// Print the query's output; returns whether the engine reported success.
async fn drive(session: &Session, id: &RequestId, mode: DeliveryMode) -> Result<bool> {
    if mode == DeliveryMode::Blocking {
        let outcome = session.wait(id).await?;
        println!("{}", outcome.text().unwrap_or_default());
        log_usage(&outcome.result);
        return Ok(outcome.is_success());
    }

    let mut stdout = std::io::stdout();
    let mut streamed = false;
    loop {
        let Some(message) = session.pull(id).await? else {
            return Ok(false);
        };
        match message {
            Message::Delta(delta) => {
                if let Some(text) = delta.text() {
                    streamed = true;
                    write!(stdout, "{text}")?;
                    stdout.flush()?;
                }
            }
            Message::AgentTurn(turn) if !streamed => {
                write!(stdout, "{}", turn.text())?;
            }
            Message::Result(result) => {
                writeln!(stdout)?;
                log_usage(&result);
                session.release(id).await;
                return Ok(result.is_success());
            }
            _ => {}
        }
    }
}

fn log_usage(result: &agent_conduit::protocol::ResultMessage) {
    info!(
        session_id = %result.session_id,
        duration_ms = ?result.duration_ms,
        num_turns = ?result.num_turns,
        total_cost_usd = ?result.total_cost_usd,
        "query finished"
    );
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
