//! One sync cycle of one mailbox.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::EngineConfig;
use crate::connector::{Connector, ConnectorRepository, Direction, SeenStrategy, fetch_connector};
use crate::events::{EventSink, MailEvent};
use crate::inbox::{
    InboundLogEntry, InboundStatus, MessageError, NewInboxMessage, ParsedEmail, StoredAttachment,
    clean_subject, exists_in, insert_in, log_in,
};
use crate::mailbox::{Mailbox, NewTicketDecision, RuleInput, SyncTarget, fetch_mailbox};
use crate::objects::{ObjectStore, checksum};
use crate::routing::{Resolution, mint_in, resolve_in};
use crate::store::{Store, TenantTx};
use crate::sync_status::{
    Lease, LeaseOutcome, SyncKey, SyncStatusTracker, advance_cursor, checkpoint,
};
use crate::tenant::TenantContext;
use crate::ticket::{MessageDirection, NewTicket, TicketMessageInput, TicketService};
use crate::transport::{InboundProtocol, MailSource, with_timeout};
use crate::{ConnectorId, Error, InboxMessageId, MailboxId, ProjectId, Result, TenantId, TicketId};

/// Services the worker hands messages to.
#[derive(Clone)]
pub struct Collaborators {
    /// Ticket creation and append.
    pub tickets: Arc<dyn TicketService>,
    /// Attachment bytes.
    pub objects: Arc<dyn ObjectStore>,
    /// Post-commit notifications.
    pub events: Arc<dyn EventSink>,
}

/// How a mailbox cycle ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Every fetched message was processed.
    Completed,
    /// Shutdown requested; stopped between messages.
    Cancelled,
    /// Mailbox or connector not eligible.
    Skipped(String),
    /// Another worker holds the lease.
    Busy,
    /// Operator paused the mailbox.
    Paused,
    /// Mailbox-level failure; recorded as `sync_error`.
    Failed(String),
    /// The lease was reclaimed mid-cycle.
    LeaseLost,
}

/// What one cycle did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    /// Tenant.
    pub tenant_id: TenantId,
    /// Mailbox.
    pub mailbox_id: MailboxId,
    /// Mailbox address, when it could be loaded.
    pub mailbox_address: Option<String>,
    /// Ending.
    pub outcome: CycleOutcome,
    /// UIDs fetched.
    pub fetched: usize,
    /// Tickets opened.
    pub created: usize,
    /// Replies appended.
    pub appended: usize,
    /// Already stored.
    pub duplicates: usize,
    /// Stored without a ticket.
    pub rejected: usize,
    /// Per-message failures.
    pub failed: usize,
    /// Highest UID committed this cycle.
    pub last_uid: Option<u32>,
}

impl CycleReport {
    fn new(target: SyncTarget) -> Self {
        Self {
            tenant_id: target.tenant_id,
            mailbox_id: target.mailbox_id,
            mailbox_address: None,
            outcome: CycleOutcome::Completed,
            fetched: 0,
            created: 0,
            appended: 0,
            duplicates: 0,
            rejected: 0,
            failed: 0,
            last_uid: None,
        }
    }

    fn finish(mut self, outcome: CycleOutcome) -> Self {
        self.outcome = outcome;
        self
    }

    fn count(&mut self, uid: u32, outcome: &MessageOutcome) {
        match outcome {
            MessageOutcome::Created(_) => self.created += 1,
            MessageOutcome::Appended(_) => self.appended += 1,
            MessageOutcome::Duplicate => self.duplicates += 1,
            MessageOutcome::Rejected(_) => self.rejected += 1,
            MessageOutcome::Failed(_) => self.failed += 1,
        }
        self.last_uid = Some(self.last_uid.map_or(uid, |last| advance_cursor(last, uid)));
    }
}

/// Result of processing one UID.
#[derive(Debug, Clone, PartialEq, Eq)]
enum MessageOutcome {
    Created(TicketId),
    Appended(TicketId),
    Duplicate,
    Rejected(String),
    Failed(String),
}

impl MessageOutcome {
    /// Whether the message is now stored, so it may be flagged `\Seen`.
    const fn is_stored(&self) -> bool {
        matches!(self, Self::Created(_) | Self::Appended(_) | Self::Rejected(_) | Self::Duplicate)
    }
}

/// Per-cycle invariants.
struct Cycle<'a> {
    ctx: &'a TenantContext,
    mailbox: &'a Mailbox,
    connector_id: ConnectorId,
    lease: &'a Lease,
}

/// Polls one mailbox per call and turns its new mail into ticket activity.
#[derive(Clone)]
pub struct SyncWorker {
    store: Store,
    connectors: ConnectorRepository,
    tracker: SyncStatusTracker,
    protocol: Arc<dyn InboundProtocol>,
    collaborators: Collaborators,
    owner: String,
    max_batch_size: usize,
    operation_timeout: Duration,
    revalidate_after_failures: u32,
}

impl SyncWorker {
    /// Create a worker. `owner` identifies this process in lease rows.
    #[must_use]
    pub fn new(
        store: Store,
        connectors: ConnectorRepository,
        protocol: Arc<dyn InboundProtocol>,
        collaborators: Collaborators,
        config: &EngineConfig,
        owner: impl Into<String>,
    ) -> Self {
        Self {
            tracker: SyncStatusTracker::new(store.clone(), config.sync.lease_stale_after()),
            store,
            connectors,
            protocol,
            collaborators,
            owner: owner.into(),
            max_batch_size: config.sync.max_batch_size.max(1),
            operation_timeout: config.network.operation_timeout(),
            revalidate_after_failures: config.sync.revalidate_after_failures,
        }
    }

    /// Lease holder identity.
    #[must_use]
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Sync tracker used for leases.
    #[must_use]
    pub const fn tracker(&self) -> &SyncStatusTracker {
        &self.tracker
    }

    /// Run one cycle for a mailbox.
    ///
    /// Per-message problems are logged and counted; mailbox-level problems
    /// end the cycle, are stored as the mailbox's `sync_error` and are
    /// reported in the outcome.
    ///
    /// # Errors
    ///
    /// Returns an error only if the lease bookkeeping itself cannot be
    /// read or written.
    #[instrument(skip(self, target, cancel), fields(tenant_id = %target.tenant_id, mailbox_id = %target.mailbox_id))]
    pub async fn sync_mailbox(
        &self,
        target: SyncTarget,
        cancel: &CancellationToken,
    ) -> Result<CycleReport> {
        let ctx = TenantContext::new(target.tenant_id);
        let mut report = CycleReport::new(target);

        let (mailbox, connector) = match self.load(&ctx, target.mailbox_id).await? {
            Ok(pair) => pair,
            Err(reason) => {
                debug!(%reason, "Skipping mailbox");
                return Ok(report.finish(CycleOutcome::Skipped(reason)));
            }
        };
        report.mailbox_address = Some(mailbox.address.clone());

        let key = SyncKey::new(connector.id, &mailbox.address);
        let lease = match self.tracker.acquire(&ctx, &key, &self.owner).await? {
            LeaseOutcome::Acquired(lease) => lease,
            LeaseOutcome::Busy { owner } => {
                debug!(?owner, "Mailbox busy");
                return Ok(report.finish(CycleOutcome::Busy));
            }
            LeaseOutcome::Paused => return Ok(report.finish(CycleOutcome::Paused)),
        };

        let cycle = Cycle {
            ctx: &ctx,
            mailbox: &mailbox,
            connector_id: connector.id,
            lease: &lease,
        };
        let result = self.run(&cycle, &connector, cancel, &mut report).await;

        let outcome = match result {
            Ok(cancelled) => {
                self.tracker.release(&ctx, &lease, None).await?;
                self.connectors
                    .record_health(&ctx, connector.id, None, self.revalidate_after_failures)
                    .await?;
                if cancelled {
                    CycleOutcome::Cancelled
                } else {
                    CycleOutcome::Completed
                }
            }
            Err(Error::LeaseLost(_)) => {
                warn!("Lease lost mid-cycle; stopping");
                CycleOutcome::LeaseLost
            }
            Err(e) => {
                let message = e.to_string();
                warn!(error = %message, "Mailbox sync failed");
                self.tracker.release(&ctx, &lease, Some(&message)).await?;
                if matches!(e, Error::Transport(_) | Error::Credential(_)) {
                    self.connectors
                        .record_health(
                            &ctx,
                            connector.id,
                            Some(&message),
                            self.revalidate_after_failures,
                        )
                        .await?;
                }
                CycleOutcome::Failed(message)
            }
        };

        info!(
            mailbox = %mailbox.address,
            fetched = report.fetched,
            created = report.created,
            appended = report.appended,
            duplicates = report.duplicates,
            rejected = report.rejected,
            failed = report.failed,
            outcome = ?outcome,
            "Mailbox cycle finished"
        );
        Ok(report.finish(outcome))
    }

    /// Mailbox and connector, or the reason the mailbox is not syncable.
    async fn load(
        &self,
        ctx: &TenantContext,
        mailbox_id: MailboxId,
    ) -> Result<std::result::Result<(Mailbox, Connector), String>> {
        let mut tx = self.store.begin(ctx).await?;
        let Some(mailbox) = fetch_mailbox(&mut tx, mailbox_id).await? else {
            return Ok(Err(format!("mailbox {mailbox_id} not found")));
        };
        let connector = fetch_connector(&mut tx, mailbox.connector_id).await?;
        tx.commit().await?;

        if !mailbox.is_active {
            return Ok(Err(format!("mailbox {} is inactive", mailbox.address)));
        }
        let Some(connector) = connector else {
            return Ok(Err(format!("connector {} not found", mailbox.connector_id)));
        };
        if let Some(reason) = connector.ineligibility(Direction::Inbound) {
            return Ok(Err(reason));
        }
        Ok(Ok((mailbox, connector)))
    }

    /// Connect, fetch and process. Returns whether it stopped on cancellation.
    async fn run(
        &self,
        cycle: &Cycle<'_>,
        connector: &Connector,
        cancel: &CancellationToken,
        report: &mut CycleReport,
    ) -> Result<bool> {
        let target = self.connectors.imap_target(connector, &cycle.mailbox.folder)?;
        let seen = target.settings.seen_strategy;
        let mut session =
            with_timeout(self.operation_timeout, self.protocol.connect(&target)).await?;

        let result = self.drain(cycle, session.as_mut(), seen, cancel, report).await;

        if tokio::time::timeout(self.operation_timeout, session.logout())
            .await
            .is_err()
        {
            debug!("IMAP logout timed out");
        }
        result
    }

    async fn drain(
        &self,
        cycle: &Cycle<'_>,
        session: &mut dyn MailSource,
        seen: SeenStrategy,
        cancel: &CancellationToken,
        report: &mut CycleReport,
    ) -> Result<bool> {
        let limit = self.operation_timeout;
        with_timeout(limit, session.select(&cycle.mailbox.folder)).await?;
        let mut uids = with_timeout(limit, session.uids_after(cycle.lease.last_uid)).await?;
        uids.sort_unstable();
        uids.dedup();
        uids.retain(|uid| *uid > cycle.lease.last_uid);
        uids.truncate(self.max_batch_size);
        debug!(count = uids.len(), after = cycle.lease.last_uid, "New UIDs");

        for uid in uids {
            if cancel.is_cancelled() {
                info!(uid, "Cancellation requested; stopping before next message");
                return Ok(true);
            }

            let peek = seen != SeenStrategy::Immediate;
            let raw = with_timeout(limit, session.fetch(uid, peek)).await?;
            report.fetched += 1;

            let outcome = match raw {
                Some(raw) => self.process(cycle, uid, &raw).await?,
                None => {
                    self.record_failure(cycle, uid, None, "message vanished before fetch")
                        .await?
                }
            };

            if seen == SeenStrategy::MarkSeenAfterParse && outcome.is_stored() {
                if let Err(e) = with_timeout(limit, session.mark_seen(uid)).await {
                    warn!(uid, error = %e, "Could not flag message as seen");
                }
            }
            report.count(uid, &outcome);
        }
        Ok(false)
    }

    /// Everything that happens to one fetched message.
    #[instrument(skip(self, cycle, raw), fields(mailbox = %cycle.mailbox.address))]
    async fn process(&self, cycle: &Cycle<'_>, uid: u32, raw: &[u8]) -> Result<MessageOutcome> {
        let email = match ParsedEmail::parse(raw) {
            Ok(email) => email,
            Err(e) => {
                let reason = match e {
                    MessageError::Parse => "unparsable message",
                    MessageError::MissingMessageId => "missing Message-ID",
                };
                return self.record_failure(cycle, uid, None, reason).await;
            }
        };

        if self.is_duplicate(cycle, &email.message_id).await? {
            return self.record_duplicate(cycle, uid, &email).await;
        }

        let attachments = self.store_attachments(cycle.ctx.tenant_id(), &email).await?;

        match self.store_message(cycle, uid, &email, &attachments).await {
            Ok((outcome, event)) => {
                if let Some(event) = event {
                    self.collaborators.events.emit(event);
                }
                Ok(outcome)
            }
            Err(e) if e.is_unique_violation() => self.record_duplicate(cycle, uid, &email).await,
            Err(e @ (Error::Database(_) | Error::Io(_) | Error::LeaseLost(_))) => Err(e),
            Err(e) => {
                self.record_failure(cycle, uid, Some(&email.message_id), &e.to_string())
                    .await
            }
        }
    }

    async fn is_duplicate(&self, cycle: &Cycle<'_>, message_id: &str) -> Result<bool> {
        let mut tx = self.store.begin(cycle.ctx).await?;
        let exists = exists_in(&mut tx, message_id, &cycle.mailbox.address).await?;
        tx.commit().await?;
        Ok(exists)
    }

    async fn store_attachments(
        &self,
        tenant_id: TenantId,
        email: &ParsedEmail,
    ) -> Result<Vec<StoredAttachment>> {
        let mut stored = Vec::with_capacity(email.attachments.len());
        for attachment in &email.attachments {
            let sum = checksum(&attachment.bytes);
            let storage_path = self
                .collaborators
                .objects
                .put(tenant_id, &sum, &attachment.bytes)
                .await?;
            stored.push(StoredAttachment {
                filename: attachment.filename.clone(),
                content_type: attachment.content_type.clone(),
                size_bytes: attachment.bytes.len() as u64,
                checksum: sum,
                content_id: attachment.content_id.clone(),
                inline: attachment.inline,
                storage_path,
            });
        }
        Ok(stored)
    }

    /// The single transaction that stores a new message and its effects.
    async fn store_message(
        &self,
        cycle: &Cycle<'_>,
        uid: u32,
        email: &ParsedEmail,
        attachments: &[StoredAttachment],
    ) -> Result<(MessageOutcome, Option<MailEvent>)> {
        let tickets = &self.collaborators.tickets;
        let mut tx = self.store.begin(cycle.ctx).await?;

        let resolution = if email.auto_reply {
            None
        } else {
            Some(resolve_in(&mut tx, &email.thread_signals()).await?)
        };

        let placement = match resolution {
            None => Placement::Reject("auto-reply detected".to_string()),
            Some(Resolution::Continuation { ticket_id, via }) => {
                debug!(ticket_id = %ticket_id, ?via, "Continuation");
                let project = tickets.project_of(&mut tx, ticket_id).await?;
                Placement::Append(ticket_id, project.unwrap_or(cycle.mailbox.project_id))
            }
            Some(Resolution::Ambiguous { candidates }) => {
                let ids: Vec<String> = candidates.iter().map(ToString::to_string).collect();
                Placement::Reject(format!("ambiguous thread: matches tickets {}", ids.join(", ")))
            }
            Some(Resolution::NoMatch) => new_ticket_placement(cycle.mailbox, email),
        };

        let (ticket_id, project_id, is_reply) = match &placement {
            Placement::Append(ticket, project) => (Some(*ticket), *project, true),
            Placement::Create(project) => {
                let ticket = tickets
                    .create_ticket(
                        &mut tx,
                        NewTicket {
                            project_id: *project,
                            subject: ticket_subject(email),
                            requester: email.from_address.clone().unwrap_or_default(),
                        },
                    )
                    .await?;
                (Some(ticket), *project, false)
            }
            Placement::Reject(_) => (None, cycle.mailbox.project_id, false),
        };

        let inbox_id = insert_in(
            &mut tx,
            &NewInboxMessage {
                connector_id: cycle.connector_id,
                project_id: Some(project_id),
                mailbox_address: &cycle.mailbox.address,
                uid,
                email,
                ticket_id,
                is_reply,
                attachments,
            },
        )
        .await?;

        if let Some(ticket) = ticket_id {
            tickets
                .append_message(&mut tx, ticket, conversation_entry(inbox_id, email))
                .await?;
        }
        if matches!(placement, Placement::Create(_)) {
            if let Some(ticket) = ticket_id {
                mint_in(&mut tx, ticket, &cycle.mailbox.address, &email.message_id).await?;
            }
        }

        let (status, reason) = match &placement {
            Placement::Reject(reason) => (InboundStatus::Rejected, Some(reason.clone())),
            Placement::Append(..) | Placement::Create(_) => (InboundStatus::Accepted, None),
        };
        self.log(&mut tx, cycle, uid, Some(&email.message_id), status, reason.clone(), ticket_id)
            .await?;
        checkpoint(&mut tx, cycle.lease, uid, email.sent_at, true).await?;
        tx.commit().await?;

        let tenant_id = cycle.ctx.tenant_id();
        Ok(match (placement, ticket_id) {
            (Placement::Create(project_id), Some(ticket_id)) => (
                MessageOutcome::Created(ticket_id),
                Some(MailEvent::TicketCreated {
                    tenant_id,
                    ticket_id,
                    project_id,
                    inbox_message_id: inbox_id,
                }),
            ),
            (Placement::Append(..), Some(ticket_id)) => (
                MessageOutcome::Appended(ticket_id),
                Some(MailEvent::MessageCreated {
                    tenant_id,
                    ticket_id,
                    inbox_message_id: inbox_id,
                }),
            ),
            _ => (
                MessageOutcome::Rejected(reason.unwrap_or_default()),
                None,
            ),
        })
    }

    async fn record_duplicate(
        &self,
        cycle: &Cycle<'_>,
        uid: u32,
        email: &ParsedEmail,
    ) -> Result<MessageOutcome> {
        debug!(uid, message_id = %email.message_id, "Duplicate message");
        let mut tx = self.store.begin(cycle.ctx).await?;
        self.log(
            &mut tx,
            cycle,
            uid,
            Some(&email.message_id),
            InboundStatus::Accepted,
            Some("duplicate".to_string()),
            None,
        )
        .await?;
        checkpoint(&mut tx, cycle.lease, uid, email.sent_at, false).await?;
        tx.commit().await?;
        Ok(MessageOutcome::Duplicate)
    }

    async fn record_failure(
        &self,
        cycle: &Cycle<'_>,
        uid: u32,
        message_id: Option<&str>,
        reason: &str,
    ) -> Result<MessageOutcome> {
        warn!(uid, reason, "Message could not be processed");
        let mut tx = self.store.begin(cycle.ctx).await?;
        self.log(
            &mut tx,
            cycle,
            uid,
            message_id,
            InboundStatus::Error,
            Some(reason.to_string()),
            None,
        )
        .await?;
        checkpoint(&mut tx, cycle.lease, uid, None, false).await?;
        tx.commit().await?;
        Ok(MessageOutcome::Failed(reason.to_string()))
    }

    #[allow(clippy::too_many_arguments)]
    async fn log(
        &self,
        tx: &mut TenantTx,
        cycle: &Cycle<'_>,
        uid: u32,
        message_id: Option<&str>,
        status: InboundStatus,
        reason: Option<String>,
        ticket_id: Option<TicketId>,
    ) -> Result<()> {
        log_in(
            tx,
            &InboundLogEntry {
                connector_id: cycle.connector_id,
                mailbox_address: cycle.mailbox.address.clone(),
                uid: Some(uid),
                message_id: message_id.map(ToString::to_string),
                status,
                reason,
                ticket_id,
                created_at: Utc::now(),
            },
        )
        .await
    }
}

/// Where a new message goes.
enum Placement {
    Append(TicketId, ProjectId),
    Create(ProjectId),
    Reject(String),
}

fn new_ticket_placement(mailbox: &Mailbox, email: &ParsedEmail) -> Placement {
    if email.from_address.is_none() {
        return Placement::Reject("message has no sender".to_string());
    }
    let recipients: Vec<String> = email.to.iter().chain(&email.cc).cloned().collect();
    let input = RuleInput {
        subject: &email.subject,
        from: email.from_address.as_deref().unwrap_or_default(),
        recipients: &recipients,
    };
    match mailbox.new_ticket_decision(&input) {
        NewTicketDecision::Create(project) => Placement::Create(project),
        NewTicketDecision::Reject(reason) => Placement::Reject(reason),
    }
}

fn ticket_subject(email: &ParsedEmail) -> String {
    let subject = clean_subject(&email.subject);
    if subject.is_empty() {
        "(no subject)".to_string()
    } else {
        subject.to_string()
    }
}

fn conversation_entry(inbox_id: InboxMessageId, email: &ParsedEmail) -> TicketMessageInput {
    TicketMessageInput {
        inbox_message_id: Some(inbox_id),
        direction: MessageDirection::Inbound,
        author: email.from_address.clone().unwrap_or_default(),
        body: email.conversation_body(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::TransportError;
    use crate::connector::{CredentialKind, MemoryCredentialStore, NewConnector};
    use crate::events::ChannelEventSink;
    use crate::inbox::InboxRepository;
    use crate::mailbox::{MailboxRepository, NewMailbox};
    use crate::objects::MemoryObjectStore;
    use crate::routing::ThreadRouter;
    use crate::ticket::LocalTicketService;
    use crate::transport::ImapTarget;

    #[derive(Default)]
    struct Scripted {
        messages: Mutex<BTreeMap<u32, Vec<u8>>>,
        fail_connect: Mutex<bool>,
    }

    struct ScriptedProtocol(Arc<Scripted>);

    struct ScriptedSource(Arc<Scripted>);

    #[async_trait]
    impl InboundProtocol for ScriptedProtocol {
        async fn connect(
            &self,
            _target: &ImapTarget,
        ) -> std::result::Result<Box<dyn MailSource>, TransportError> {
            if *self.0.fail_connect.lock().unwrap() {
                return Err(TransportError::Auth("token revoked".into()));
            }
            Ok(Box::new(ScriptedSource(self.0.clone())))
        }
    }

    #[async_trait]
    impl MailSource for ScriptedSource {
        async fn select(&mut self, _folder: &str) -> std::result::Result<(), TransportError> {
            Ok(())
        }

        async fn uids_after(&mut self, after: u32) -> std::result::Result<Vec<u32>, TransportError> {
            Ok(self.0.messages.lock().unwrap().keys().copied().filter(|u| *u > after).collect())
        }

        async fn fetch(
            &mut self,
            uid: u32,
            _peek: bool,
        ) -> std::result::Result<Option<Vec<u8>>, TransportError> {
            Ok(self.0.messages.lock().unwrap().get(&uid).cloned())
        }

        async fn mark_seen(&mut self, _uid: u32) -> std::result::Result<(), TransportError> {
            Ok(())
        }

        async fn logout(self: Box<Self>) {}
    }

    struct Fixture {
        ctx: TenantContext,
        target: SyncTarget,
        script: Arc<Scripted>,
        worker: SyncWorker,
        tickets: LocalTicketService,
        inbox: InboxRepository,
        router: ThreadRouter,
    }

    async fn fixture(allow_new_ticket: bool) -> Fixture {
        let store = Store::in_memory().await.unwrap();
        let ctx = TenantContext::new(TenantId::new());
        let connectors =
            ConnectorRepository::new(store.clone(), Arc::new(MemoryCredentialStore::new()));
        let connector = connectors
            .create(
                &ctx,
                NewConnector {
                    project_id: None,
                    name: "Support".into(),
                    kind: crate::connector::imap_kind(),
                },
                &[(CredentialKind::Password, "pw")],
            )
            .await
            .unwrap();
        connectors.finish_validation(&ctx, connector.id, Ok(())).await.unwrap();

        let mailbox = MailboxRepository::new(store.clone())
            .create(
                &ctx,
                NewMailbox {
                    connector_id: connector.id,
                    project_id: ProjectId::new(),
                    address: "support@acme.com".into(),
                    folder: None,
                    routing_rules: Vec::new(),
                    allow_new_ticket,
                },
            )
            .await
            .unwrap();

        let script = Arc::new(Scripted::default());
        let tickets = LocalTicketService::new(store.clone());
        let (events, _rx) = ChannelEventSink::new();
        let worker = SyncWorker::new(
            store.clone(),
            connectors,
            Arc::new(ScriptedProtocol(script.clone())),
            Collaborators {
                tickets: Arc::new(tickets.clone()),
                objects: Arc::new(MemoryObjectStore::new()),
                events: Arc::new(events),
            },
            &EngineConfig::default(),
            "worker-1",
        );

        Fixture {
            target: SyncTarget {
                tenant_id: ctx.tenant_id(),
                mailbox_id: mailbox.id,
            },
            ctx,
            script,
            worker,
            tickets,
            inbox: InboxRepository::new(store.clone()),
            router: ThreadRouter::new(store),
        }
    }

    fn raw(id: &str, references: Option<&str>) -> Vec<u8> {
        let mut msg = format!(
            "From: Jane <jane@client.com>\r\nTo: support@acme.com\r\nMessage-ID: {id}\r\nSubject: Printer on fire\r\n"
        );
        if let Some(r) = references {
            msg.push_str(&format!("References: {r}\r\n"));
        }
        msg.push_str("\r\nIt is still burning.\r\n");
        msg.into_bytes()
    }

    impl Fixture {
        fn deliver(&self, uid: u32, bytes: Vec<u8>) {
            self.script.messages.lock().unwrap().insert(uid, bytes);
        }

        async fn cycle(&self) -> CycleReport {
            self.worker
                .sync_mailbox(self.target, &CancellationToken::new())
                .await
                .unwrap()
        }
    }

    #[tokio::test]
    async fn test_new_message_opens_ticket_with_routing() {
        let f = fixture(true).await;
        f.deliver(1, raw("<abc@client>", None));

        let report = f.cycle().await;
        assert_eq!(report.outcome, CycleOutcome::Completed);
        assert_eq!(report.created, 1);
        assert_eq!(report.last_uid, Some(1));

        let tickets = f.tickets.list(&f.ctx).await.unwrap();
        assert_eq!(tickets.len(), 1);
        assert_eq!(tickets[0].subject, "Printer on fire");
        let routing = f.router.find_active(&f.ctx, tickets[0].id).await.unwrap().unwrap();
        assert_eq!(routing.message_id_root, "<abc@client>");
        assert!(routing.reply_address.starts_with("support+"));
    }

    #[tokio::test]
    async fn test_reply_appends_and_redelivery_is_noop() {
        let f = fixture(true).await;
        f.deliver(1, raw("<abc@client>", None));
        f.cycle().await;
        f.deliver(2, raw("<def@client>", Some("<abc@client>")));
        let report = f.cycle().await;
        assert_eq!(report.appended, 1);

        // Server renumbers after a reconnect.
        f.deliver(3, raw("<abc@client>", None));
        let report = f.cycle().await;
        assert_eq!(report.duplicates, 1);
        assert_eq!(report.created, 0);

        let tickets = f.tickets.list(&f.ctx).await.unwrap();
        assert_eq!(tickets.len(), 1);
        assert_eq!(f.tickets.messages(&f.ctx, tickets[0].id).await.unwrap().len(), 2);
        assert_eq!(f.inbox.count(&f.ctx, "support@acme.com").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_bad_message_does_not_stop_batch() {
        let f = fixture(true).await;
        f.deliver(1, b"no headers at all".to_vec());
        f.deliver(2, raw("<ok@client>", None));

        let report = f.cycle().await;
        assert_eq!(report.failed, 1);
        assert_eq!(report.created, 1);

        let status = f.worker.tracker().get(&f.ctx, &report_key(&f).await).await.unwrap().unwrap();
        assert_eq!(status.last_uid, 2);
        assert_eq!(status.emails_synced_count, 1);
    }

    #[tokio::test]
    async fn test_closed_mailbox_rejects_unsolicited_mail() {
        let f = fixture(false).await;
        f.deliver(1, raw("<cold@client>", None));

        let report = f.cycle().await;
        assert_eq!(report.rejected, 1);
        assert!(f.tickets.list(&f.ctx).await.unwrap().is_empty());

        let log = f.inbox.inbound_log(&f.ctx, "support@acme.com", 10).await.unwrap();
        assert_eq!(log[0].status, InboundStatus::Rejected);
    }

    #[tokio::test]
    async fn test_auth_failure_marks_mailbox_error() {
        let f = fixture(true).await;
        *f.script.fail_connect.lock().unwrap() = true;
        f.deliver(1, raw("<abc@client>", None));

        let report = f.cycle().await;
        assert!(matches!(report.outcome, CycleOutcome::Failed(_)));

        let status = f.worker.tracker().get(&f.ctx, &report_key(&f).await).await.unwrap().unwrap();
        assert_eq!(status.state, crate::sync_status::SyncState::Error);
        assert_eq!(status.last_uid, 0);
        assert!(status.sync_error.unwrap().contains("token revoked"));
    }

    #[tokio::test]
    async fn test_cancelled_before_first_message() {
        let f = fixture(true).await;
        f.deliver(1, raw("<abc@client>", None));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = f.worker.sync_mailbox(f.target, &cancel).await.unwrap();
        assert_eq!(report.outcome, CycleOutcome::Cancelled);
        assert_eq!(report.fetched, 0);
    }

    async fn report_key(f: &Fixture) -> SyncKey {
        let mailbox = MailboxRepository::new(f.worker.store.clone())
            .get(&f.ctx, f.target.mailbox_id)
            .await
            .unwrap()
            .unwrap();
        SyncKey::new(mailbox.connector_id, &mailbox.address)
    }
}
