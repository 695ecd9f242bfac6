// tandem-cli: terminal client for tandem-core
//
// Key tools, config editing and an interactive chat with one peer.

mod config;

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use clap::{Parser, Subcommand};
use colored::*;
use std::sync::Arc;
use tandem_core::identity::KeyMaterial;
use tandem_core::transport::NoDirectEngine;
use tandem_core::{
    fingerprint, Collaborators, CoreEvent, CoreEventKind, HttpDirectory, IntegrityWarning,
    KeyKind, MessageStatus, OfflineBacklog, PeerId, Session, TransportState, WebSocketConnector,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::debug;

#[derive(Parser)]
#[command(name = "tandem")]
#[command(about = "Tandem: end-to-end encrypted chat over a relay", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate an agreement key pair and print its public half
    Keygen,
    /// Show the fingerprint of a base64 public key
    Fingerprint { public_key: String },
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Chat with a peer
    Chat {
        /// Your user id on the relay
        #[arg(long = "as")]
        local: u64,
        /// The peer's user id
        #[arg(short, long)]
        peer: u64,
        /// Bearer token for the relay and directory
        #[arg(short, long)]
        token: String,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Show,
    SetRelay { url: String },
    SetDirectory { url: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Keygen => cmd_keygen(),
        Commands::Fingerprint { public_key } => cmd_fingerprint(&public_key),
        Commands::Config { action } => cmd_config(action),
        Commands::Chat { local, peer, token } => {
            cmd_chat(PeerId(local), PeerId(peer), &token).await
        }
    }
}

fn cmd_keygen() -> Result<()> {
    let keys = KeyMaterial::generate(PeerId(0), KeyKind::Ecdh).context("Failed to generate keys")?;

    println!("{}", "Generated X25519 agreement key".bold());
    println!("  Public key:  {}", BASE64.encode(&keys.public_key).bright_yellow());
    println!("  Fingerprint: {}", keys.fingerprint().bright_cyan());
    println!();
    println!(
        "{}",
        "The private half is not stored; chat sessions generate their own.".dimmed()
    );
    Ok(())
}

fn cmd_fingerprint(public_key: &str) -> Result<()> {
    let bytes = BASE64
        .decode(public_key.trim())
        .context("Public key is not valid base64")?;
    println!("{}", fingerprint(&bytes).bright_cyan());
    Ok(())
}

fn cmd_config(action: ConfigAction) -> Result<()> {
    let mut config = config::Config::load()?;

    match action {
        ConfigAction::Show => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            println!();
            println!("{} {}", "File:".dimmed(), config::Config::config_file()?.display());
        }
        ConfigAction::SetRelay { url } => {
            config.set_relay(&url)?;
            config.save()?;
            println!("{} relay = {}", "✓".green(), url);
        }
        ConfigAction::SetDirectory { url } => {
            config.set_directory(&url)?;
            config.save()?;
            println!("{} directory = {}", "✓".green(), config.session.directory.base_url);
        }
    }
    Ok(())
}

async fn cmd_chat(local: PeerId, peer: PeerId, token: &str) -> Result<()> {
    let config = config::Config::load()?;
    debug!(%local, %peer, relay = %config.session.signaling.relay_url, "starting chat");
    let directory = Arc::new(HttpDirectory::new(
        config.session.directory.base_url.clone(),
        token,
    ));

    let session = Session::new(
        local,
        config.session.clone(),
        Collaborators {
            directory: directory.clone(),
            connector: Arc::new(WebSocketConnector::new()),
            engine: Arc::new(NoDirectEngine),
            backlog: Some(directory as Arc<dyn OfflineBacklog>),
        },
    );
    print_events(&session, peer);

    let record = session
        .initialize_keys()
        .await
        .context("Failed to publish keys")?;
    println!("🔑 Your fingerprint: {}", record.fingerprint().bright_cyan());

    session
        .start(token)
        .await
        .with_context(|| format!("Failed to connect to {}", config.session.signaling.relay_url))?;
    println!("{} Connected to relay", "✓".green());

    match session.establish_secret(peer).await {
        Ok(trust) => {
            let shown = session
                .keys()
                .cached_peer_key(peer)
                .map(|r| r.fingerprint())
                .unwrap_or_default();
            println!("  Peer {} fingerprint: {}", peer, shown.bright_cyan());
            if !trust.signature_valid {
                println!("  {} Peer key is not signed by the server", "⚠".yellow());
            }
        }
        Err(e) => println!(
            "  {} No key for peer {} yet ({}); messages will fail until they publish one",
            "⚠".yellow(),
            peer,
            e
        ),
    }

    match session.sync_offline_backlog().await {
        Ok(0) => {}
        Ok(n) => println!("  📬 {} message(s) while you were away", n),
        Err(e) => println!("  {} Backlog unavailable: {}", "⚠".yellow(), e),
    }

    println!();
    println!(
        "{}",
        "Type a message and press enter. Commands: /read /verify /sync /quit".dimmed()
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        match line {
            "" => continue,
            "/quit" => break,
            "/read" => {
                let n = session.mark_read(peer).await?;
                println!("{} marked {} read", "✓".green(), n);
            }
            "/verify" => match session.mark_manually_verified(peer) {
                Ok(_) => println!("{} peer {} verified", "✓".green(), peer),
                Err(e) => println!("{} {}", "✗".red(), e),
            },
            "/sync" => {
                let n = session.sync_offline_backlog().await?;
                println!("{} {} new", "✓".green(), n);
            }
            text => {
                if let Err(e) = session.send_plaintext(peer, text).await {
                    println!("{} {}", "✗".red(), e);
                }
            }
        }
    }

    session.shutdown().await;
    Ok(())
}

fn print_events(session: &Arc<Session>, peer: PeerId) {
    let events = session.events();

    events.subscribe(CoreEventKind::MessageReceived, move |event| {
        if let CoreEvent::MessageReceived {
            peer: from,
            message,
            plaintext,
        } = event
        {
            match plaintext {
                Some(text) if !message.encrypted => println!(
                    "{} {} {}",
                    format!("[{}]", from).bright_blue().bold(),
                    "(unencrypted)".yellow().bold(),
                    text
                ),
                Some(text) => println!("{} {}", format!("[{}]", from).bright_blue().bold(), text),
                None => println!(
                    "{} {}",
                    format!("[{}]", from).bright_blue().bold(),
                    "<unreadable>".dimmed()
                ),
            }
        }
    });

    events.subscribe(CoreEventKind::StatusChanged, move |event| {
        if let CoreEvent::StatusChanged { status, .. } = event {
            let mark = match status {
                MessageStatus::Delivered => "✓ delivered".green(),
                MessageStatus::Read => "✓✓ read".green(),
                MessageStatus::Failed => "✗ failed".red(),
                MessageStatus::Sent => return,
            };
            println!("  {}", mark);
        }
    });

    events.subscribe(CoreEventKind::TransportChanged, move |event| {
        if let CoreEvent::TransportChanged { peer: p, state } = event {
            if *p != peer {
                return;
            }
            let label = match state {
                TransportState::Direct => state.to_string().green(),
                TransportState::Relayed => state.to_string().yellow(),
                _ => state.to_string().dimmed(),
            };
            println!("  {} {}", "transport:".dimmed(), label);
        }
    });

    events.subscribe(CoreEventKind::IntegrityWarning, move |event| {
        if let CoreEvent::IntegrityWarning { peer: p, warning } = event {
            let text = match warning {
                IntegrityWarning::SignatureInvalid => "key signature invalid",
                IntegrityWarning::DecryptionFailed { .. } => "message failed to decrypt",
                IntegrityWarning::Unencrypted { .. } => {
                    "unencrypted message in an encrypted conversation"
                }
            };
            println!("  {} peer {}: {}", "⚠".yellow(), p, text);
        }
    });
}
