//! Main Entrypoint for the voicelink command-line client
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment and command-line flags.
//! 2. Initializing logging.
//! 3. Building a voice session on the default audio devices.
//! 4. Relaying typed commands until `/quit` or Ctrl+C, then tearing down.

use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;
use voicelink_cli::commands::Command;
use voicelink_cli::config::Config;
use voicelink_cli::devices::CpalDevices;
use voicelink_cli::lifecycle::{Startup, connect_until};
use voicelink_core::{ProviderKind, VoiceSession, VoiceResult};

const OPENING_PROMPT: &str = "Greet the user briefly and ask what they would like to talk about.";

#[derive(Parser, Debug)]
#[command(version, about = "Talk to a realtime voice model from the terminal")]
struct Args {
    /// Realtime provider (openai or gemini); overrides REALTIME_PROVIDER.
    #[arg(long)]
    provider: Option<ProviderKind>,
    /// Voice name; overrides VOICE.
    #[arg(long)]
    voice: Option<String>,
    /// Session backend endpoint; overrides BACKEND_URL.
    #[arg(long)]
    backend_url: Option<String>,
    /// Send the opening instruction as soon as the session is up.
    #[arg(long)]
    start: bool,
    /// Context appended to the opening instruction.
    #[arg(long, requires = "start")]
    context: Option<String>,
}

fn report(action: &str, result: VoiceResult<()>) {
    if let Err(e) = result {
        warn!(error = %e, "Could not {action}");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // --- 1. Load Configuration ---
    let mut config = Config::from_env().context("Failed to load configuration")?;
    if let Some(provider) = args.provider {
        config.provider = provider;
    }
    if let Some(voice) = args.voice {
        config.voice = Some(voice);
    }
    if let Some(url) = args.backend_url {
        config.backend_url = Some(url);
    }

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::from_level(config.log_level).into())
                .from_env_lossy(),
        )
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
    info!("Configuration loaded. Opening audio devices...");

    // --- 3. Build the Session ---
    let instructions = match &config.instructions_path {
        Some(path) => Some(
            std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read instructions from {}", path.display()))?,
        ),
        None => None,
    };
    let session = VoiceSession::builder(
        config.negotiator(instructions.as_deref()),
        Arc::new(CpalDevices),
    )
    .config(config.session_config(OPENING_PROMPT.to_string()))
    .build();

    session.on_transcript(|text, is_final| {
        if is_final {
            println!("you> {text}");
        }
    });
    session.on_ai_response(|text| println!("ai > {text}"));
    session.on_error(|err| eprintln!("error [{}]: {err}", err.kind()));
    session.on_state_change(|state| info!(%state, "Session state changed"));

    // --- 4. Connect ---
    info!(
        provider = %config.provider,
        backend = config.backend_url.as_deref().unwrap_or("direct"),
        "Connecting..."
    );
    let startup = connect_until(&session, tokio::signal::ctrl_c())
        .await
        .context("Failed to connect")?;
    if startup == Startup::ShutdownRequested {
        return Ok(());
    }
    if args.start {
        report(
            "start the conversation",
            session.start_conversation(args.context.as_deref()),
        );
    }
    println!("Connected. Speak, or type a message. Commands: /start [context], /interrupt, /quit");

    // --- 5. Relay Commands ---
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal.");
                break;
            }
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read from stdin")? else {
                    break;
                };
                match Command::parse(&line) {
                    None => {}
                    Some(Command::Quit) => break,
                    Some(Command::Start(context)) => report(
                        "start the conversation",
                        session.start_conversation(context.as_deref()),
                    ),
                    Some(Command::Interrupt) => match session.interrupt() {
                        Ok(outcome) => info!(?outcome, "Interrupt requested"),
                        Err(e) => warn!(error = %e, "Could not interrupt"),
                    },
                    Some(Command::Say(text)) => report("send the message", session.send_message(&text)),
                }
            }
        }
    }

    session.disconnect();
    info!("Session closed.");
    Ok(())
}
