//! Echoes CLI
//!
//! Generates session keys and shows their fingerprints, checks a peer's
//! fingerprint out of band, and runs a loopback negotiation between two
//! in-process peers.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use echoes_core::KeyxConfig;
use echoes_core::config::load_config;
use echoes_core::tracing_init::{default_filter, init_tracing};
use echoes_crypto::fingerprint::fingerprint_of;
use echoes_crypto::{CryptoEngine, KeyFamily, KeyPart, verify_fingerprint};
use echoes_keyx::{InboundEcho, PeerKeyExchange, ProtocolMessage};

#[derive(Parser, Debug)]
#[command(name = "echoes")]
#[command(version, about = "Echoes - end-to-end encrypted chat key tooling")]
struct Cli {
    /// Explicit configuration file (JSON).
    #[arg(long, env = "ECHOES_CONFIG")]
    config: Option<PathBuf>,

    /// Log level filter (e.g. "info", "debug", "warn").
    #[arg(long)]
    log_level: Option<String>,

    /// Output logs as JSON.
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate a session key pair and print its public fingerprint.
    Fingerprint {
        #[arg(long, value_enum, default_value_t = FamilyArg::Keyx)]
        family: FamilyArg,

        /// Also print the exported public key.
        #[arg(long)]
        pem: bool,
    },
    /// Check a peer's exported public key against the fingerprint they read out.
    Verify {
        #[arg(long, value_enum, default_value_t = FamilyArg::Keyx)]
        family: FamilyArg,

        /// File holding the peer's PEM public key.
        key_file: PathBuf,

        /// Expected fingerprint; grouping whitespace and case are ignored.
        expected: String,
    },
    /// Negotiate between two in-process peers and send one encrypted echo.
    Loopback {
        #[arg(long, default_value = "hello from alice")]
        message: String,

        /// Pretend the receiving peer only supports the legacy family.
        #[arg(long)]
        legacy_peer: bool,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum FamilyArg {
    Asym,
    Keyx,
}

impl From<FamilyArg> for KeyFamily {
    fn from(arg: FamilyArg) -> Self {
        match arg {
            FamilyArg::Asym => Self::AsymmetricEncrypt,
            FamilyArg::Keyx => Self::KeyExchange,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = load_config(cli.config.as_deref())?;
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    config.logging.json |= cli.log_json;
    init_tracing(&default_filter(&config.logging.level), config.logging.json);

    match cli.command {
        Command::Fingerprint { family, pem } => fingerprint(family.into(), pem).await,
        Command::Verify {
            family,
            key_file,
            expected,
        } => verify(family.into(), &key_file, &expected),
        Command::Loopback {
            message,
            legacy_peer,
        } => loopback(&config.keyx, &message, legacy_peer).await,
    }
}

async fn fingerprint(family: KeyFamily, show_pem: bool) -> anyhow::Result<()> {
    let mut engine = CryptoEngine::new();
    engine.generate_key(family, false).await?;
    engine.export_key(family, KeyPart::Public)?;

    let exported = engine.exported(family);
    let fingerprint = exported
        .fingerprint
        .as_deref()
        .context("public key export produced no fingerprint")?;
    info!(%family, fingerprint, "Generated session key");

    let mut out = std::io::stdout().lock();
    writeln!(out, "{fingerprint}")?;
    if show_pem && let Some(pem) = &exported.public_pem {
        write!(out, "{pem}")?;
    }
    Ok(())
}

fn verify(family: KeyFamily, key_file: &Path, expected: &str) -> anyhow::Result<()> {
    let pem = std::fs::read_to_string(key_file)
        .with_context(|| format!("failed to read {}", key_file.display()))?;

    // Parse first so a fingerprint is never shown for unusable key material
    CryptoEngine::new()
        .import_key(family, &pem, false)?
        .into_public()?;

    let actual = fingerprint_of(&pem);
    let mut out = std::io::stdout().lock();
    writeln!(out, "{actual}")?;
    if verify_fingerprint(&actual, expected) {
        info!(%family, fingerprint = %actual, "Fingerprint matches");
        Ok(())
    } else {
        warn!(%family, fingerprint = %actual, "Fingerprint mismatch");
        anyhow::bail!("fingerprint does not match the expected value")
    }
}

struct Endpoint {
    name: &'static str,
    keyx: PeerKeyExchange,
    outbox: mpsc::Receiver<ProtocolMessage>,
}

impl Endpoint {
    fn new(name: &'static str, config: KeyxConfig) -> Self {
        let (tx, outbox) = mpsc::channel(32);
        Self {
            name,
            keyx: PeerKeyExchange::new(config, Arc::new(name), tx),
            outbox,
        }
    }
}

async fn loopback(config: &KeyxConfig, message: &str, legacy_peer: bool) -> anyhow::Result<()> {
    let mut alice = Endpoint::new("alice", config.clone());
    let bob_config = if legacy_peer {
        KeyxConfig {
            key_exchange_supported: false,
            ..config.clone()
        }
    } else {
        config.clone()
    };
    let mut bob = Endpoint::new("bob", bob_config);

    alice
        .keyx
        .send_key(bob.name, alice.keyx.preferred_family())
        .await?;
    pump(&mut alice, &mut bob).await?;
    bob.keyx
        .send_key(alice.name, bob.keyx.preferred_family())
        .await?;
    pump(&mut alice, &mut bob).await?;

    alice.keyx.send_echo(bob.name, message).await?;
    let received = pump(&mut alice, &mut bob).await?;

    let family = alice
        .keyx
        .negotiated_family(bob.name)
        .await
        .context("negotiation did not settle on a family")?;
    let alice_state = alice.keyx.encryption_state_of(bob.name).await;
    let bob_state = bob.keyx.encryption_state_of(alice.name).await;
    let bob_fingerprint = alice
        .keyx
        .peer_fingerprint(bob.name)
        .await
        .unwrap_or_default();

    {
        let mut out = std::io::stdout().lock();
        writeln!(out, "family:      {family}")?;
        writeln!(out, "alice sees:  {alice_state}")?;
        writeln!(out, "bob sees:    {bob_state}")?;
        writeln!(out, "bob key:     {bob_fingerprint}")?;
        for echo in &received {
            writeln!(out, "{} -> {}: {}", echo.from, bob.name, echo.text)?;
        }
    }

    alice.keyx.on_session_ended().await;
    bob.keyx.on_session_ended().await;
    Ok(())
}

/// Deliver queued messages in both directions until both outboxes are empty.
///
/// Key deliveries are acknowledged back to the sender like a relay would.
async fn pump(a: &mut Endpoint, b: &mut Endpoint) -> anyhow::Result<Vec<InboundEcho>> {
    let mut received = Vec::new();
    loop {
        let mut idle = true;
        while let Ok(message) = a.outbox.try_recv() {
            idle = false;
            received.extend(deliver(message, a, b).await?);
        }
        while let Ok(message) = b.outbox.try_recv() {
            idle = false;
            received.extend(deliver(message, b, a).await?);
        }
        if idle {
            return Ok(received);
        }
    }
}

async fn deliver(
    message: ProtocolMessage,
    from: &Endpoint,
    to: &Endpoint,
) -> anyhow::Result<Option<InboundEcho>> {
    debug!(
        from = from.name,
        to = to.name,
        wire = %serde_json::to_string(&message)?,
        "Relaying"
    );
    let ack = match &message {
        ProtocolMessage::Keyx { to, family, .. } => Some(ProtocolMessage::KeyxSent {
            to: to.clone(),
            family: *family,
        }),
        _ => None,
    };

    let inbound = to.keyx.handle_message(message).await?;
    if let Some(ack) = ack {
        from.keyx.handle_message(ack).await?;
    }
    Ok(inbound)
}
