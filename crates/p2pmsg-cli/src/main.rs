//! p2pmsg — a thin command-line driver over the public API of spec.md §6.
//!
//! Contains no protocol logic of its own: every command maps directly onto
//! [`p2pmsg_core::ConnectionManager`], [`p2pmsg_vault::KeyVault`], or
//! [`p2pmsg_store::Store`]. This is the end-to-end harness referenced by
//! spec.md §6 ("when driven from a CLI harness").

mod config;

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use p2pmsg_core::connection::ConnectionManager;
use p2pmsg_core::event::{Event, EventBus};
use p2pmsg_crypto::hash::Fingerprint;
use p2pmsg_store::Store;
use p2pmsg_vault::{Identity, KeyVault};

use config::Config;

/// p2pmsg — peer-to-peer secure messenger
#[derive(Parser)]
#[command(name = "p2pmsg")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "p2pmsg.toml")]
    config: PathBuf,

    /// Enable verbose (debug-level) logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a new identity and seal it under a passphrase
    InitVault,
    /// Rotate the vault's passphrase
    RotatePassphrase,
    /// Print this endpoint's identity fingerprint
    LocalFingerprint,
    /// Listen for an incoming connection, then drive an interactive session
    Listen {
        /// Port to listen on; defaults to the configured `listen_port`
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Dial a peer, then drive an interactive session
    Dial {
        /// Address to dial
        addr: String,
        /// Port to dial
        port: u16,
    },
    /// Print the message history with a pinned peer
    History {
        /// Peer fingerprint, colon-hex form
        fingerprint: String,
        /// Maximum number of messages to print
        #[arg(long, default_value_t = 50)]
        limit: u32,
        /// Number of messages to skip from the start
        #[arg(long, default_value_t = 0)]
        offset: u32,
    },
    /// List every conversation this endpoint has a history with
    ListConversations,
    /// List every peer this endpoint has pinned
    ListPeers,
    /// Mark a pinned peer's fingerprint as verified out-of-band
    VerifyPeer {
        /// Peer fingerprint, colon-hex form
        fingerprint: String,
    },
    /// Set the locally-assigned display name for a pinned peer
    SetDisplayName {
        /// Peer fingerprint, colon-hex form
        fingerprint: String,
        /// The new display name, or omit to clear it
        name: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;

    let filter = if cli.verbose { "debug".to_string() } else { config.logging.filter.clone() };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::InitVault => init_vault(&config),
        Commands::RotatePassphrase => rotate_passphrase(&config),
        Commands::LocalFingerprint => local_fingerprint(&config),
        Commands::Listen { port } => {
            let port = port.unwrap_or(config.protocol.listen_port);
            run_session(&config, SessionMode::Listen { port }).await
        }
        Commands::Dial { addr, port } => run_session(&config, SessionMode::Dial { addr, port }).await,
        Commands::History { fingerprint, limit, offset } => history(&config, &fingerprint, limit, offset),
        Commands::ListConversations => list_conversations(&config),
        Commands::ListPeers => list_peers(&config),
        Commands::VerifyPeer { fingerprint } => verify_peer(&config, &fingerprint),
        Commands::SetDisplayName { fingerprint, name } => set_display_name(&config, &fingerprint, name.as_deref()),
    }
}

fn read_passphrase(prompt: &str) -> anyhow::Result<Vec<u8>> {
    print!("{prompt}: ");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim_end_matches(['\n', '\r']).as_bytes().to_vec())
}

fn parse_fingerprint(s: &str) -> anyhow::Result<Fingerprint> {
    Fingerprint::parse(s).ok_or_else(|| anyhow::anyhow!("invalid fingerprint: {s}"))
}

fn argon2_params(config: &Config) -> p2pmsg_crypto::kdf::Argon2Params {
    p2pmsg_crypto::kdf::Argon2Params {
        time_cost: config.protocol.argon2_time_cost,
        memory_kib: config.protocol.argon2_memory_kib,
        parallelism: config.protocol.argon2_parallelism,
    }
}

fn init_vault(config: &Config) -> anyhow::Result<()> {
    let passphrase = read_passphrase("New vault passphrase")?;
    let vault = KeyVault::new(&config.storage.vault_dir);
    let identity = vault.initialize_with_params(&passphrase, argon2_params(config))?;
    println!("Vault created at {}", config.storage.vault_dir.display());
    println!("Fingerprint: {}", identity.fingerprint());
    Ok(())
}

fn rotate_passphrase(config: &Config) -> anyhow::Result<()> {
    let old = read_passphrase("Current passphrase")?;
    let new = read_passphrase("New passphrase")?;
    let vault = KeyVault::new(&config.storage.vault_dir);
    vault.rotate_passphrase_with_params(&old, &new, argon2_params(config))?;
    println!("Passphrase rotated.");
    Ok(())
}

fn local_fingerprint(config: &Config) -> anyhow::Result<()> {
    let identity = open_identity(config)?;
    println!("{}", identity.fingerprint());
    Ok(())
}

fn open_identity(config: &Config) -> anyhow::Result<Identity> {
    let passphrase = read_passphrase("Vault passphrase")?;
    let vault = KeyVault::new(&config.storage.vault_dir);
    Ok(vault.open(&passphrase)?)
}

fn open_store(config: &Config, identity: &Identity) -> anyhow::Result<Store> {
    Ok(Store::open(&config.storage.database_path, &config.storage.files_dir, identity)?)
}

fn history(config: &Config, fingerprint: &str, limit: u32, offset: u32) -> anyhow::Result<()> {
    let fingerprint = parse_fingerprint(fingerprint)?;
    let identity = open_identity(config)?;
    let store = open_store(config, &identity)?;
    let rows = store.log.conversation_history(fingerprint.as_bytes(), limit, offset)?;
    for row in rows {
        let who = match row.direction {
            p2pmsg_store::Direction::Sent => "me",
            p2pmsg_store::Direction::Received => "peer",
        };
        match row.kind {
            p2pmsg_store::MessageKind::Text => {
                println!("[{}] {who}: {}", row.timestamp, String::from_utf8_lossy(&row.plaintext));
            }
            p2pmsg_store::MessageKind::File => {
                println!(
                    "[{}] {who} sent file {} ({} bytes)",
                    row.timestamp,
                    row.file_name.as_deref().unwrap_or("?"),
                    row.file_size.unwrap_or(row.plaintext.len() as u64)
                );
            }
        }
    }
    Ok(())
}

fn list_conversations(config: &Config) -> anyhow::Result<()> {
    let identity = open_identity(config)?;
    let store = open_store(config, &identity)?;
    for conversation in store.log.list_conversations()? {
        let fp = Fingerprint::of(&conversation.peer_fingerprint);
        println!(
            "{}  {}  last_message_at={:?}",
            fp,
            conversation.display_name.as_deref().unwrap_or("(unnamed)"),
            conversation.last_message_at
        );
    }
    Ok(())
}

fn list_peers(config: &Config) -> anyhow::Result<()> {
    let identity = open_identity(config)?;
    let store = open_store(config, &identity)?;
    for peer in store.pins.list_peers()? {
        let fp = Fingerprint::of(&peer.identity_public_key);
        println!(
            "{}  {}  verified={}",
            fp,
            peer.display_name.as_deref().unwrap_or("(unnamed)"),
            peer.verified
        );
    }
    Ok(())
}

fn verify_peer(config: &Config, fingerprint: &str) -> anyhow::Result<()> {
    let fingerprint = parse_fingerprint(fingerprint)?;
    let identity = open_identity(config)?;
    let store = open_store(config, &identity)?;
    store.pins.set_verified(fingerprint.as_bytes(), true)?;
    println!("Marked {fingerprint} as verified.");
    Ok(())
}

fn set_display_name(config: &Config, fingerprint: &str, name: Option<&str>) -> anyhow::Result<()> {
    let fingerprint = parse_fingerprint(fingerprint)?;
    let identity = open_identity(config)?;
    let store = open_store(config, &identity)?;
    store.pins.set_display_name(fingerprint.as_bytes(), name)?;
    println!("Updated display name for {fingerprint}.");
    Ok(())
}

enum SessionMode {
    Listen { port: u16 },
    Dial { addr: String, port: u16 },
}

/// Drive one interactive session: connect, then concurrently print inbound
/// events and send stdin lines as text, until `/quit` or the peer
/// disconnects.
async fn run_session(config: &Config, mode: SessionMode) -> anyhow::Result<()> {
    let identity = Arc::new(open_identity(config)?);
    let store = Arc::new(open_store(config, &identity)?);

    let (events, mut subscriber) = EventBus::new();
    let manager = ConnectionManager::with_pin_store(
        config.protocol,
        identity.clone(),
        events,
        Box::new(p2pmsg_store::SqlitePinStore::new(store.pins.shared_connection())),
    );

    match mode {
        SessionMode::Listen { port } => {
            println!("Listening on port {port}...");
            manager.listen(port).await?;
        }
        SessionMode::Dial { addr, port } => {
            println!("Dialing {addr}:{port}...");
            manager.dial(&addr, port).await?;
        }
    }

    let current_peer: Arc<std::sync::Mutex<Option<Fingerprint>>> = Arc::new(std::sync::Mutex::new(None));

    let store_for_events = store.clone();
    let current_peer_for_events = current_peer.clone();
    let printer = tokio::spawn(async move {
        while let Some(event) = subscriber.recv().await {
            handle_event(&store_for_events, &current_peer_for_events, event);
        }
    });

    println!("type a message, /file <path> to send a file, or /quit to exit");

    let stdin = io::stdin();
    let mut line = String::new();
    loop {
        line.clear();
        print!("> ");
        io::stdout().flush()?;
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let text = line.trim_end_matches(['\n', '\r']);
        if text == "/quit" {
            break;
        }
        if text.is_empty() {
            continue;
        }
        if let Some(path) = text.strip_prefix("/file ") {
            if let Err(err) = send_file(&manager, &store, &current_peer, path.trim()).await {
                eprintln!("send failed: {err}");
            }
            continue;
        }
        match manager.send_text(text).await {
            Ok(()) => {
                if let Some(peer) = *current_peer.lock().expect("current peer mutex poisoned") {
                    let now = unix_now();
                    if let Err(err) = store.log.insert_message(
                        peer.as_bytes(),
                        p2pmsg_store::Direction::Sent,
                        p2pmsg_store::MessageKind::Text,
                        text.as_bytes(),
                        now,
                        None,
                        None,
                    ) {
                        tracing::warn!(%err, "failed to persist sent message");
                    }
                }
            }
            Err(err) => eprintln!("send failed: {err}"),
        }
    }

    manager.disconnect().await;
    printer.abort();
    Ok(())
}

/// Read `path` from disk, send it as a FILE message (§6's `send_file(path)`),
/// and persist a `Sent`-direction row recording its name and size.
async fn send_file(
    manager: &ConnectionManager,
    store: &Store,
    current_peer: &std::sync::Mutex<Option<Fingerprint>>,
    path: &str,
) -> anyhow::Result<()> {
    let bytes = std::fs::read(path)?;
    let name = std::path::Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string());

    manager.send_file(&name, &bytes).await?;

    if let Some(peer) = *current_peer.lock().expect("current peer mutex poisoned") {
        let now = unix_now();
        if let Err(err) = store.log.insert_message(
            peer.as_bytes(),
            p2pmsg_store::Direction::Sent,
            p2pmsg_store::MessageKind::File,
            &bytes,
            now,
            Some(&name),
            Some(bytes.len() as u64),
        ) {
            tracing::warn!(%err, "failed to persist sent file");
        }
    }
    Ok(())
}

/// Decode a `FILE` message's wire payload (`name_len(2,BE) || name || size(8,BE)
/// || bytes`, per [`p2pmsg_core::connection::ConnectionManager::send_file`])
/// into its logical name and bytes.
fn decode_file_payload(body: &[u8]) -> Option<(String, &[u8])> {
    let name_len = *body.first()? as usize * 256 + *body.get(1)? as usize;
    let name_start = 2;
    let name_end = name_start.checked_add(name_len)?;
    let name = String::from_utf8(body.get(name_start..name_end)?.to_vec()).ok()?;
    let size_start = name_end;
    let size_end = size_start.checked_add(8)?;
    let bytes = body.get(size_end..)?;
    Some((name, bytes))
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn handle_event(store: &Store, current_peer: &std::sync::Mutex<Option<Fingerprint>>, event: Event) {
    match event {
        Event::PeerConnecting { addr } => println!("connecting to {addr}..."),
        Event::HandshakeComplete { peer_fingerprint, first_contact } => {
            *current_peer.lock().expect("current peer mutex poisoned") = Some(peer_fingerprint);
            if first_contact {
                println!("new peer {peer_fingerprint} (TOFU pinned)");
            } else {
                println!("connected to {peer_fingerprint}");
            }
        }
        Event::MessageReceived { kind, body, timestamp } => {
            if kind == p2pmsg_core::frame::MessageType::Text {
                println!("[{timestamp}] peer: {}", String::from_utf8_lossy(&body));
            }
            if let Some(peer) = *current_peer.lock().expect("current peer mutex poisoned") {
                if kind == p2pmsg_core::frame::MessageType::File {
                    match decode_file_payload(&body) {
                        Some((name, bytes)) => {
                            if let Err(err) = store.attachments.save(peer.as_bytes(), &name, bytes) {
                                eprintln!("failed to save attachment {name}: {err}");
                            } else {
                                println!("[{timestamp}] peer sent file: {name} ({} bytes)", bytes.len());
                            }
                            if let Err(err) = store.log.insert_message(
                                peer.as_bytes(),
                                p2pmsg_store::Direction::Received,
                                p2pmsg_store::MessageKind::File,
                                bytes,
                                timestamp,
                                Some(&name),
                                Some(bytes.len() as u64),
                            ) {
                                tracing::warn!(%err, "failed to persist received file");
                            }
                        }
                        None => eprintln!("received malformed file payload"),
                    }
                } else if let Err(err) = store.log.insert_message(
                    peer.as_bytes(),
                    p2pmsg_store::Direction::Received,
                    kind_to_store(kind),
                    &body,
                    timestamp,
                    None,
                    None,
                ) {
                    tracing::warn!(%err, "failed to persist received message");
                }
            }
        }
        Event::MessageSent { kind, len } => {
            tracing::debug!(?kind, len, "message sent");
        }
        Event::PeerDisconnected { reason } => {
            *current_peer.lock().expect("current peer mutex poisoned") = None;
            println!("disconnected: {reason}");
        }
        Event::Error { kind, detail, fatal } => {
            eprintln!("error [{kind}]: {detail}{}", if fatal { " (fatal)" } else { "" });
        }
    }
}

fn kind_to_store(kind: p2pmsg_core::frame::MessageType) -> p2pmsg_store::MessageKind {
    match kind {
        p2pmsg_core::frame::MessageType::File => p2pmsg_store::MessageKind::File,
        _ => p2pmsg_store::MessageKind::Text,
    }
}
