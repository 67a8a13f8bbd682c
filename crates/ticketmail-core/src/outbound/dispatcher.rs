//! Sends ticket replies with suppression, routing headers and retries.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::log::{NewOutboundRecord, open_in, status_in, transition_in};
use super::model::{OutboundRequest, OutboundStatus, SendOutcome, SendReport};
use super::retry::with_retry;
use crate::config::{EngineConfig, RetryPolicy};
use crate::connector::{ConnectorRepository, Direction, fetch_connector};
use crate::mailbox::{Mailbox, fetch_by_address};
use crate::routing::ensure_active_in;
use crate::store::{Store, TenantTx};
use crate::suppression::{BounceEvent, BounceKind, is_suppressed_in, record_bounce};
use crate::tenant::TenantContext;
use crate::transport::{OutboundProtocol, OutgoingMail, with_timeout};
use crate::{ConnectorId, Error, ProjectId, Result, TransportError, address};

/// Outbound send path.
///
/// Each connector gets its own pool of `max_concurrent_sends` slots; a
/// request that cannot get a slot within `permit_timeout` is deferred.
#[derive(Clone)]
pub struct OutboundDispatcher {
    store: Store,
    connectors: ConnectorRepository,
    protocol: Arc<dyn OutboundProtocol>,
    pools: Arc<Mutex<HashMap<ConnectorId, Arc<Semaphore>>>>,
    max_concurrent_sends: usize,
    permit_timeout: Duration,
    operation_timeout: Duration,
    retry: RetryPolicy,
    revalidate_after_failures: u32,
}

/// Prepared attempt, before the transport is contacted.
struct Prepared {
    mail: OutgoingMail,
    suppressed: Vec<String>,
}

impl OutboundDispatcher {
    /// Create a dispatcher.
    #[must_use]
    pub fn new(
        store: Store,
        connectors: ConnectorRepository,
        protocol: Arc<dyn OutboundProtocol>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            store,
            connectors,
            protocol,
            pools: Arc::new(Mutex::new(HashMap::new())),
            max_concurrent_sends: config.outbound.max_concurrent_sends.max(1),
            permit_timeout: config.outbound.permit_timeout(),
            operation_timeout: config.network.operation_timeout(),
            retry: config.outbound.retry.clone(),
            revalidate_after_failures: config.sync.revalidate_after_failures,
        }
    }

    /// Send a reply.
    ///
    /// Every attempt leaves one outbound log row keyed by its Message-ID.
    /// Delivery problems are reported in the [`SendReport`], not as errors.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the sender address is malformed, or an
    /// error if the log or routing rows cannot be written.
    #[instrument(skip(self, ctx, request), fields(tenant_id = %ctx.tenant_id(), ticket_id = %request.ticket_id))]
    pub async fn send(&self, ctx: &TenantContext, request: OutboundRequest) -> Result<SendReport> {
        let message_id = message_id_for(&request)?;
        let mut report = SendReport {
            message_id: message_id.clone(),
            outcome: SendOutcome::Sent,
            suppressed: Vec::new(),
            attempts: 0,
        };

        let mut tx = self.store.begin(ctx).await?;
        if status_in(&mut tx, &message_id).await? == Some(OutboundStatus::Sent) {
            tx.commit().await?;
            debug!(message_id = %message_id, "Already sent");
            report.outcome = SendOutcome::Duplicate;
            return Ok(report);
        }

        let mailbox = fetch_by_address(&mut tx, &request.from).await?;
        let project_id = request.project_id.or(mailbox.as_ref().map(|m| m.project_id));

        let prepared = match self.prepare(&mut tx, &request, mailbox, &message_id).await? {
            Ok(prepared) => prepared,
            Err((status, reason)) => {
                let row = log_row(&request, &message_id, project_id, &[], status, Some(&reason));
                open_in(&mut tx, &row).await?;
                tx.commit().await?;
                info!(message_id = %message_id, status = status.as_str(), %reason, "Send not attempted");
                report.outcome = match status {
                    OutboundStatus::Skipped => SendOutcome::Skipped(reason),
                    _ => SendOutcome::Failed(reason),
                };
                return Ok(report);
            }
        };
        report.suppressed.clone_from(&prepared.suppressed);

        let recipients: Vec<String> =
            prepared.mail.to.iter().chain(&prepared.mail.cc).cloned().collect();
        let target = match self.target(&mut tx, request.connector_id).await {
            Ok(target) => target,
            Err(reason) => {
                let row = log_row(
                    &request,
                    &message_id,
                    project_id,
                    &recipients,
                    OutboundStatus::Error,
                    Some(&reason),
                );
                open_in(&mut tx, &row).await?;
                tx.commit().await?;
                report.outcome = SendOutcome::Failed(reason);
                return Ok(report);
            }
        };
        let row = log_row(
            &request,
            &message_id,
            project_id,
            &recipients,
            OutboundStatus::Queued,
            None,
        );
        open_in(&mut tx, &row).await?;
        tx.commit().await?;

        let pool = self.pool(request.connector_id);
        let Ok(Ok(_permit)) = tokio::time::timeout(self.permit_timeout, pool.acquire_owned()).await
        else {
            let reason = Error::RateLimited(format!(
                "no send slot on connector {} within {:?}",
                request.connector_id, self.permit_timeout
            ))
            .to_string();
            self.finish(ctx, &message_id, OutboundStatus::Deferred, Some(&reason), 0)
                .await?;
            report.outcome = SendOutcome::Deferred(reason);
            return Ok(report);
        };

        let attempted = with_retry(&self.retry, || {
            with_timeout(
                self.operation_timeout,
                self.protocol.send(&target, &prepared.mail),
            )
        })
        .await;
        report.attempts = attempted.attempts;

        report.outcome = match attempted.result {
            Ok(()) => {
                self.finish(ctx, &message_id, OutboundStatus::Sent, None, attempted.attempts)
                    .await?;
                self.connectors
                    .record_health(ctx, request.connector_id, None, self.revalidate_after_failures)
                    .await?;
                info!(message_id = %message_id, recipients = recipients.len(), "Reply sent");
                SendOutcome::Sent
            }
            Err(e) => {
                self.record_failure(ctx, &request, &message_id, &recipients, &e, attempted.attempts)
                    .await?
            }
        };
        Ok(report)
    }

    /// Sender, connector and routing checks plus suppression filtering.
    ///
    /// The inner error is a log status with its reason.
    async fn prepare(
        &self,
        tx: &mut TenantTx,
        request: &OutboundRequest,
        mailbox: Option<Mailbox>,
        message_id: &str,
    ) -> Result<std::result::Result<Prepared, (OutboundStatus, String)>> {
        let Some(mailbox) = mailbox else {
            return Ok(Err((
                OutboundStatus::Error,
                format!("{} is not a mailbox of this tenant", request.from),
            )));
        };
        let Some(connector) = fetch_connector(tx, request.connector_id).await? else {
            return Ok(Err((
                OutboundStatus::Error,
                format!("connector {} not found", request.connector_id),
            )));
        };
        if let Some(reason) = connector.ineligibility(Direction::Outbound) {
            return Ok(Err((OutboundStatus::Error, reason)));
        }

        let mut suppressed = Vec::new();
        let to = self.deliverable(tx, &request.to, &mut suppressed).await?;
        let cc = self.deliverable(tx, &request.cc, &mut suppressed).await?;
        if to.is_empty() && cc.is_empty() {
            let reason = if suppressed.is_empty() {
                "no recipients".to_string()
            } else {
                format!("all recipients suppressed: {}", suppressed.join(", "))
            };
            return Ok(Err((OutboundStatus::Skipped, reason)));
        }
        if !suppressed.is_empty() {
            info!(suppressed = ?suppressed, "Dropping suppressed recipients");
        }

        let routing = ensure_active_in(tx, request.ticket_id, &mailbox.address, message_id).await?;
        let root = (routing.message_id_root != message_id).then(|| routing.message_id_root.clone());

        Ok(Ok(Prepared {
            mail: OutgoingMail {
                message_id: message_id.to_string(),
                from: mailbox.address,
                from_name: request.from_name.clone(),
                reply_to: Some(routing.reply_address),
                to,
                cc,
                subject: request.subject.clone(),
                text: request.text.clone(),
                html: request.html.clone(),
                in_reply_to: root.clone(),
                references: root.into_iter().collect(),
            },
            suppressed,
        }))
    }

    async fn deliverable(
        &self,
        tx: &mut TenantTx,
        addresses: &[String],
        suppressed: &mut Vec<String>,
    ) -> Result<Vec<String>> {
        let mut kept: Vec<String> = Vec::with_capacity(addresses.len());
        for raw in addresses {
            let address = address::normalize(raw);
            if address.is_empty() || kept.contains(&address) || suppressed.contains(&address) {
                continue;
            }
            if is_suppressed_in(tx, &address).await? {
                suppressed.push(address);
            } else {
                kept.push(address);
            }
        }
        Ok(kept)
    }

    async fn target(
        &self,
        tx: &mut TenantTx,
        id: ConnectorId,
    ) -> std::result::Result<crate::transport::SmtpTarget, String> {
        let connector = match fetch_connector(tx, id).await {
            Ok(Some(connector)) => connector,
            Ok(None) => return Err(format!("connector {id} not found")),
            Err(e) => return Err(e.to_string()),
        };
        self.connectors
            .smtp_target(&connector)
            .map_err(|e| e.to_string())
    }

    fn pool(&self, id: ConnectorId) -> Arc<Semaphore> {
        let size = self.max_concurrent_sends;
        match self.pools.lock() {
            Ok(mut pools) => pools
                .entry(id)
                .or_insert_with(|| Arc::new(Semaphore::new(size)))
                .clone(),
            Err(poisoned) => poisoned
                .into_inner()
                .entry(id)
                .or_insert_with(|| Arc::new(Semaphore::new(size)))
                .clone(),
        }
    }

    async fn finish(
        &self,
        ctx: &TenantContext,
        message_id: &str,
        status: OutboundStatus,
        reason: Option<&str>,
        attempts: u32,
    ) -> Result<()> {
        let mut tx = self.store.begin(ctx).await?;
        transition_in(&mut tx, message_id, status, reason, attempts).await?;
        tx.commit().await
    }

    async fn record_failure(
        &self,
        ctx: &TenantContext,
        request: &OutboundRequest,
        message_id: &str,
        recipients: &[String],
        error: &TransportError,
        attempts: u32,
    ) -> Result<SendOutcome> {
        let reason = error.to_string();
        match error {
            TransportError::Permanent { code, message } => {
                let rejected = rejected_recipients(error, recipients);
                let status = if error.is_recipient_rejection() {
                    OutboundStatus::Bounced
                } else {
                    OutboundStatus::Error
                };
                let mut tx = self.store.begin(ctx).await?;
                transition_in(&mut tx, message_id, status, Some(&reason), attempts).await?;
                for recipient in &rejected {
                    let event = BounceEvent {
                        message_id: Some(message_id.to_string()),
                        kind: Some(BounceKind::Hard),
                        status: Some(code.to_string()),
                        diagnostic: Some(message.clone()),
                        occurred_at: Some(Utc::now()),
                        ..BounceEvent::new(recipient.clone())
                    };
                    record_bounce(&mut tx, &event, BounceKind::Hard).await?;
                }
                tx.commit().await?;
                warn!(message_id = %message_id, %reason, rejected = ?rejected, "Reply rejected permanently");
                Ok(if status == OutboundStatus::Bounced {
                    SendOutcome::Bounced(reason)
                } else {
                    SendOutcome::Failed(reason)
                })
            }
            e if e.is_retryable() => {
                self.finish(ctx, message_id, OutboundStatus::Deferred, Some(&reason), attempts)
                    .await?;
                warn!(message_id = %message_id, %reason, "Reply deferred");
                Ok(SendOutcome::Deferred(reason))
            }
            e => {
                self.finish(ctx, message_id, OutboundStatus::Error, Some(&reason), attempts)
                    .await?;
                if matches!(e, TransportError::Auth(_)) {
                    self.connectors
                        .record_health(
                            ctx,
                            request.connector_id,
                            Some(&reason),
                            self.revalidate_after_failures,
                        )
                        .await?;
                }
                warn!(message_id = %message_id, %reason, "Reply failed");
                Ok(SendOutcome::Failed(reason))
            }
        }
    }
}

/// Recipients a permanent failure is attributable to.
///
/// The transport reports one reply for the whole transaction, so with
/// several recipients only those the reply names are blamed. Rejections of
/// the message itself (size, content policy) blame nobody.
fn rejected_recipients(error: &TransportError, recipients: &[String]) -> Vec<String> {
    let TransportError::Permanent { message, .. } = error else {
        return Vec::new();
    };
    if !error.is_recipient_rejection() {
        return Vec::new();
    }
    if let [only] = recipients {
        return vec![only.clone()];
    }
    let reply = message.to_lowercase();
    recipients
        .iter()
        .filter(|r| reply.contains(r.as_str()))
        .cloned()
        .collect()
}

/// Caller's Message-ID, normalised, or a fresh `<uuid.unix@domain>`.
fn message_id_for(request: &OutboundRequest) -> Result<String> {
    if let Some(id) = request.message_id.as_deref().and_then(address::normalize_message_id) {
        return Ok(id);
    }
    let from = address::normalize(&request.from);
    let (_, domain) = address::split(&from)
        .ok_or_else(|| Error::Config(format!("invalid sender address {:?}", request.from)))?;
    Ok(format!(
        "<{}.{}@{domain}>",
        Uuid::new_v4().simple(),
        Utc::now().timestamp()
    ))
}

fn log_row<'a>(
    request: &'a OutboundRequest,
    message_id: &'a str,
    project_id: Option<ProjectId>,
    recipients: &'a [String],
    status: OutboundStatus,
    reason: Option<&'a str>,
) -> NewOutboundRecord<'a> {
    NewOutboundRecord {
        message_id,
        connector_id: request.connector_id,
        ticket_id: request.ticket_id,
        project_id,
        recipients,
        subject: &request.subject,
        status,
        reason,
    }
}
