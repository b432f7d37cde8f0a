//! # parleyd
//!
//! Headless front end for the Parley delivery core.
//!
//! `parleyd run` reconciles whatever a previous run left half-sent, then keeps
//! draining the outbound queue to the remote store until Ctrl+C.  The other
//! subcommands only touch the local store; queued messages go out on the
//! next `run`.

mod config;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use uuid::Uuid;

use parley_client::network::spawn_probe_loop;
use parley_client::{
    Collaborators, DeliveryEvent, DeliveryFeed, FsBlobStore, HttpRemoteSync, LocalStore,
    MessageQueueService, NetworkMonitor, Outbox, OutboxConfig, StaticAuth, TcpProbe,
};
use parley_shared::{ConnectivityState, ConversationId};

use crate::config::DaemonConfig;

#[derive(Parser)]
#[command(name = "parleyd", version, about = "Parley outbound delivery daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Deliver queued messages until interrupted.
    Run,
    /// Queue a text message.
    SendText {
        #[arg(long)]
        conversation: String,
        text: String,
    },
    /// Queue an image message.
    SendImage {
        #[arg(long)]
        conversation: String,
        #[arg(long)]
        file: PathBuf,
        #[arg(long)]
        width: u32,
        #[arg(long)]
        height: u32,
    },
    /// Show pending messages.
    Status {
        #[arg(long)]
        conversation: Option<String>,
    },
    /// Try a failed message again with a fresh attempt budget.
    Retry { id: Uuid },
    /// Delete a message that is not being sent.
    Discard { id: Uuid },
    /// Stop a message from being sent.
    Cancel { id: Uuid },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    parley_client::init_tracing();

    let cli = Cli::parse();
    let daemon = DaemonConfig::from_env();
    let outbox_config = OutboxConfig::from_env();
    outbox_config.validate()?;

    let network = NetworkMonitor::new(if daemon.probe_addr.is_some() {
        ConnectivityState::Offline
    } else {
        ConnectivityState::Online
    });
    let deps = collaborators(&daemon, &outbox_config, network).await?;

    match cli.command {
        Command::Run => run(daemon, outbox_config, deps).await,
        command => {
            let queue = MessageQueueService::new(outbox_config, deps, DeliveryFeed::default());
            local_command(&queue, command).await
        }
    }
}

async fn collaborators(
    daemon: &DaemonConfig,
    outbox: &OutboxConfig,
    network: NetworkMonitor,
) -> anyhow::Result<Collaborators> {
    std::fs::create_dir_all(&daemon.data_dir)
        .with_context(|| format!("creating {}", daemon.data_dir.display()))?;

    let store = LocalStore::open_at(&daemon.db_path())?;
    let blobs = FsBlobStore::new(daemon.blob_dir(), daemon.max_blob_size).await?;
    let remote = HttpRemoteSync::new(
        daemon.remote_url.clone(),
        daemon.remote_token.clone(),
        outbox.send_timeout,
    )
    .context("building HTTP client")?;

    info!(
        data_dir = %daemon.data_dir.display(),
        remote = %daemon.remote_url,
        user = %daemon.user_id,
        "Loaded configuration"
    );

    Ok(Collaborators {
        store,
        remote: Arc::new(remote),
        blobs: Arc::new(blobs),
        auth: Arc::new(StaticAuth::new(daemon.user_id.clone())),
        network,
    })
}

async fn run(
    daemon: DaemonConfig,
    config: OutboxConfig,
    deps: Collaborators,
) -> anyhow::Result<()> {
    info!("Starting parleyd v{}", env!("CARGO_PKG_VERSION"));

    let network = deps.network.clone();
    let outbox = Outbox::start(config.clone(), deps).await?;
    info!(report = ?outbox.recovery_report(), "Recovery complete");

    let probe = daemon.probe_addr.map(|addr| {
        info!(%addr, "Probing reachability");
        spawn_probe_loop(
            network,
            TcpProbe::new(addr, Duration::from_secs(3)),
            config.probe_interval,
            outbox.shutdown_signal(),
        )
    });

    let mut events = outbox.feed().subscribe();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Delivery feed lagged"),
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down");
                break;
            }
        }
    }

    outbox.shutdown().await;
    if let Some(probe) = probe {
        let _ = probe.await;
    }
    Ok(())
}

fn log_event(event: &DeliveryEvent) {
    match event {
        DeliveryEvent::StatusChanged {
            message_id,
            conversation_id,
            status,
        } => info!(msg_id = %message_id, conversation = %conversation_id, %status, "Status"),
        DeliveryEvent::Removed { message_id, .. } => info!(msg_id = %message_id, "Removed"),
        DeliveryEvent::RecoveryDeferred {
            message_id, reason, ..
        } => warn!(msg_id = %message_id, reason = %reason, "Recovery deferred"),
        DeliveryEvent::Resync { .. } => {}
    }
}

async fn local_command(queue: &MessageQueueService, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Run => anyhow::bail!("`run` needs the network"),
        Command::SendText { conversation, text } => {
            let id = queue
                .send_text(ConversationId::new(conversation), text)
                .await?;
            println!("{id}");
        }
        Command::SendImage {
            conversation,
            file,
            width,
            height,
        } => {
            let bytes = tokio::fs::read(&file)
                .await
                .with_context(|| format!("reading {}", file.display()))?;
            let id = queue
                .send_image(
                    ConversationId::new(conversation),
                    Bytes::from(bytes),
                    width,
                    height,
                )
                .await?;
            println!("{id}");
        }
        Command::Status { conversation } => {
            for (status, count) in queue.depth()? {
                println!("{:>20}  {count}", status.as_str());
            }
            let entries = match conversation {
                Some(c) => queue.snapshot(&ConversationId::new(c))?,
                None => queue.pending()?,
            };
            for entry in entries {
                println!(
                    "{}  {:<18}  attempts={}  next={}  {}",
                    entry.id,
                    entry.status.as_str(),
                    entry.attempt_count,
                    entry.next_eligible_at.to_rfc3339(),
                    entry.last_error.as_deref().unwrap_or("")
                );
            }
        }
        Command::Retry { id } => queue.retry(id).await?,
        Command::Discard { id } => queue.discard(id).await?,
        Command::Cancel { id } => {
            let outcome = queue.cancel(id).await?;
            println!("{outcome:?}");
        }
    }
    Ok(())
}
