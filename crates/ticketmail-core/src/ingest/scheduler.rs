//! Polling scheduler: one task per mailbox on a bounded pool.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::worker::{CycleReport, SyncWorker};
use crate::Result;
use crate::config::SyncConfig;
use crate::connector::ConnectorValidator;
use crate::mailbox::{MailboxRepository, SyncTarget};

type RunningSet = Arc<Mutex<HashSet<SyncTarget>>>;

/// Drives [`SyncWorker`] cycles for every active mailbox of every tenant.
///
/// Mailboxes run in parallel up to `max_concurrent_mailboxes`; a mailbox
/// already running in this process is not started again, and the lease
/// keeps other processes out. Each tick only starts mailboxes that are
/// idle, so a slow mailbox never delays the others.
///
/// With a validator attached, every tick also re-validates `pending`
/// connectors, which is how connectors demoted after repeated health
/// failures become eligible again.
pub struct SyncScheduler {
    worker: SyncWorker,
    mailboxes: MailboxRepository,
    validator: Option<ConnectorValidator>,
    permits: Arc<Semaphore>,
    running: RunningSet,
    poll_interval: Duration,
}

impl SyncScheduler {
    /// Create a scheduler.
    #[must_use]
    pub fn new(worker: SyncWorker, mailboxes: MailboxRepository, config: &SyncConfig) -> Self {
        Self {
            worker,
            mailboxes,
            validator: None,
            permits: Arc::new(Semaphore::new(config.max_concurrent_mailboxes.max(1))),
            running: Arc::new(Mutex::new(HashSet::new())),
            poll_interval: config.poll_interval().max(Duration::from_secs(1)),
        }
    }

    /// Re-validate `pending` connectors on every tick.
    #[must_use]
    pub fn with_validator(mut self, validator: ConnectorValidator) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Run one pass over all sync targets and wait for every task.
    ///
    /// Pending connectors are validated first, so a connector that passes
    /// has its mailboxes synced in the same pass.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync targets cannot be listed. Failures of
    /// individual mailboxes are reported in their [`CycleReport`].
    pub async fn run_once(&self, cancel: &CancellationToken) -> Result<Vec<CycleReport>> {
        if let Some(validator) = &self.validator
            && let Err(e) = validator.validate_all_pending().await
        {
            warn!(error = %e, "Connector re-validation pass failed");
        }

        let mut tasks = JoinSet::new();
        self.start_idle(&mut tasks, cancel).await?;

        let mut reports = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            reports.extend(reap(joined));
        }
        Ok(reports)
    }

    /// Poll until cancelled.
    ///
    /// In-flight cycles finish their current message and release their
    /// leases before this returns.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(interval = ?self.poll_interval, "Sync scheduler started");
        let mut tasks = JoinSet::new();
        let mut validation: Option<JoinHandle<()>> = None;
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Some(report) = reap(joined) {
                        debug!(
                            mailbox_id = %report.mailbox_id,
                            created = report.created,
                            appended = report.appended,
                            "Mailbox cycle finished"
                        );
                    }
                }
                _ = ticker.tick() => {
                    if validation.as_ref().is_none_or(JoinHandle::is_finished) {
                        validation = self.spawn_validation();
                    }
                    match self.start_idle(&mut tasks, &cancel).await {
                        Ok(started) => debug!(started, in_flight = tasks.len(), "Poll tick"),
                        Err(e) => warn!(error = %e, "Poll tick failed"),
                    }
                }
            }
        }

        while let Some(joined) = tasks.join_next().await {
            reap(joined);
        }
        if let Some(handle) = validation
            && let Err(e) = handle.await
        {
            error!("Validation task panicked: {e}");
        }
        info!("Sync scheduler stopped");
    }

    /// Spawn a cycle for every sync target not already running here.
    async fn start_idle(
        &self,
        tasks: &mut JoinSet<Option<CycleReport>>,
        cancel: &CancellationToken,
    ) -> Result<usize> {
        let targets = self.mailboxes.sync_targets().await?;
        let mut started = 0;
        for target in targets {
            if cancel.is_cancelled() {
                break;
            }
            if !claim(&self.running, target) {
                debug!(mailbox_id = %target.mailbox_id, "Mailbox already running here");
                continue;
            }

            let worker = self.worker.clone();
            let permits = self.permits.clone();
            let running = self.running.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let _slot = Claim { running, target };
                let Ok(_permit) = permits.acquire_owned().await else {
                    return None;
                };
                match worker.sync_mailbox(target, &cancel).await {
                    Ok(report) => Some(report),
                    Err(e) => {
                        error!(
                            tenant_id = %target.tenant_id,
                            mailbox_id = %target.mailbox_id,
                            error = %e,
                            "Mailbox cycle aborted"
                        );
                        None
                    }
                }
            });
            started += 1;
        }
        Ok(started)
    }

    fn spawn_validation(&self) -> Option<JoinHandle<()>> {
        let validator = self.validator.clone()?;
        Some(tokio::spawn(async move {
            if let Err(e) = validator.validate_all_pending().await {
                warn!(error = %e, "Connector re-validation pass failed");
            }
        }))
    }
}

fn reap(joined: std::result::Result<Option<CycleReport>, JoinError>) -> Option<CycleReport> {
    match joined {
        Ok(report) => report,
        Err(e) => {
            error!("Mailbox task panicked: {e}");
            None
        }
    }
}

/// Mark a mailbox as running; `false` if it already is.
///
/// A task that panicked while holding the lock leaves the set intact, so
/// the poisoned guard is used as is.
fn claim(running: &Mutex<HashSet<SyncTarget>>, target: SyncTarget) -> bool {
    running
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(target)
}

/// Removes a mailbox from the running set when its task ends.
struct Claim {
    running: RunningSet,
    target: SyncTarget,
}

impl Drop for Claim {
    fn drop(&mut self) {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.target);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::{MailboxId, TenantId};

    fn target() -> SyncTarget {
        SyncTarget {
            tenant_id: TenantId::new(),
            mailbox_id: MailboxId::new(),
        }
    }

    #[test]
    fn test_claim_is_exclusive_until_dropped() {
        let running = Arc::new(Mutex::new(HashSet::new()));
        let target = target();

        assert!(claim(&running, target));
        assert!(!claim(&running, target));
        drop(Claim {
            running: running.clone(),
            target,
        });
        assert!(running.lock().unwrap().is_empty());
    }

    #[test]
    fn test_poisoned_running_set_still_tracks_claims() {
        let running: RunningSet = Arc::new(Mutex::new(HashSet::new()));
        let stuck = target();
        assert!(claim(&running, stuck));

        let holder = running.clone();
        let panicked = std::thread::spawn(move || {
            let _guard = holder.lock().unwrap();
            panic!("task died holding the running set");
        })
        .join();
        assert!(panicked.is_err());
        assert!(running.is_poisoned());

        // The mailbox that was running stays claimed, a new one can start,
        // and releasing either works.
        let fresh = target();
        assert!(!claim(&running, stuck));
        assert!(claim(&running, fresh));
        drop(Claim {
            running: running.clone(),
            target: stuck,
        });
        assert!(claim(&running, stuck));
        drop(Claim {
            running: running.clone(),
            target: fresh,
        });
        let remaining = running.lock().unwrap_or_else(PoisonError::into_inner).len();
        assert_eq!(remaining, 1);
    }
}
