//! Mailbox sync daemon.
//!
//! Polls every active mailbox of every tenant until interrupted, and
//! re-validates connectors waiting in `pending`.

use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ticketmail_core::connector::{ConnectorRepository, ConnectorValidator, KeyringCredentialStore};
use ticketmail_core::events::TracingEventSink;
use ticketmail_core::ingest::{Collaborators, ImapProtocol, SyncScheduler, SyncWorker};
use ticketmail_core::mailbox::MailboxRepository;
use ticketmail_core::objects::FsObjectStore;
use ticketmail_core::outbound::SmtpProtocol;
use ticketmail_core::ticket::LocalTicketService;
use ticketmail_core::{EngineConfig, Store};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ticketmail_worker=info,ticketmail_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = EngineConfig::load().await.context("loading configuration")?;
    if let Some(parent) = config.storage.database_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let store = Store::new(&config.storage.database_path.to_string_lossy())
        .await
        .context("opening database")?;

    let connectors = ConnectorRepository::new(store.clone(), Arc::new(KeyringCredentialStore::new()));
    let owner = format!(
        "{}:{}",
        std::env::var("HOSTNAME").unwrap_or_else(|_| "worker".into()),
        std::process::id()
    );
    let imap = Arc::new(ImapProtocol::new());
    let validator = ConnectorValidator::new(
        connectors.clone(),
        imap.clone(),
        Arc::new(SmtpProtocol::new()),
        config.network.operation_timeout(),
    );
    let worker = SyncWorker::new(
        store.clone(),
        connectors,
        imap,
        Collaborators {
            tickets: Arc::new(LocalTicketService::new(store.clone())),
            objects: Arc::new(FsObjectStore::new(config.storage.attachment_dir.clone())),
            events: Arc::new(TracingEventSink),
        },
        &config,
        owner.clone(),
    );
    let scheduler = SyncScheduler::new(worker, MailboxRepository::new(store.clone()), &config.sync)
        .with_validator(validator);

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested; finishing in-flight messages");
            shutdown.cancel();
        }
    });

    info!(%owner, database = %config.storage.database_path.display(), "Starting ticketmail worker");
    scheduler.run(cancel).await;
    store.close().await;
    Ok(())
}
