use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::authority::{Authority, ReadOnly, Signal, reduce};
use super::service::LeaseService;
use super::watcher::LeaseWatcher;
use crate::clock::Clock;
use crate::coordinator::{CompletionOutcome, CoordinatorError, EntryOutcome};
use crate::model::*;
use crate::store::ReleaseOutcome;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub poll_interval: Duration,
    pub rollover_interval: Duration,
    /// Consecutive poll failures tolerated before the connection is reported lost.
    pub failure_threshold: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(3),
            rollover_interval: Duration::from_secs(30),
            failure_threshold: 3,
        }
    }
}

/// The one resource/slot a client is working on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub resource_id: String,
    pub slot: TimeSlot,
    pub holder: String,
    pub draft: Observation,
    pub authority: Authority,
}

impl Session {
    fn same_key(&self, resource_id: &str, slot: TimeSlot) -> bool {
        self.resource_id == resource_id && self.slot == slot
    }
}

/// What a UI renders.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionState {
    pub session: Option<Session>,
    pub connection_lost: bool,
}

/// Client-side owner of a single session. Methods take `&mut self`, so one
/// controller never runs two transitions at once.
pub struct SessionController<S: LeaseService, W: LeaseWatcher> {
    service: Arc<S>,
    watcher: W,
    clock: Clock,
    holder: String,
    role: Role,
    config: SessionConfig,
    session: Option<Session>,
    consecutive_failures: u32,
    state_tx: watch::Sender<SessionState>,
    autosaves: Vec<JoinHandle<()>>,
}

impl<S: LeaseService, W: LeaseWatcher> SessionController<S, W> {
    pub fn new(
        service: Arc<S>,
        watcher: W,
        clock: Clock,
        holder: impl Into<String>,
        role: Role,
        config: SessionConfig,
    ) -> Self {
        let (state_tx, _) = watch::channel(SessionState::default());
        Self {
            service,
            watcher,
            clock,
            holder: holder.into(),
            role,
            config,
            session: None,
            consecutive_failures: 0,
            state_tx,
            autosaves: Vec::new(),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    fn publish(&self) {
        self.state_tx.send_replace(SessionState {
            session: self.session.clone(),
            connection_lost: self.consecutive_failures >= self.config.failure_threshold,
        });
    }

    // ── Opening ──────────────────────────────────────────────

    /// Open `resource_id` for the current slot. The session is shown as
    /// editable (`Pending`) until the server answers, then reconciled.
    pub async fn open(&mut self, resource_id: &str) -> Result<Authority, CoordinatorError> {
        let slot = self.clock.current_slot();

        let mut previous = None;
        let mut draft = Observation::default();
        if let Some(current) = self.session.take() {
            if current.same_key(resource_id, slot) {
                draft = current.draft;
                previous = Some(current.authority);
            } else {
                self.stash_draft(&current);
                if current.resource_id != resource_id && current.authority == Authority::Confirmed {
                    self.release_quietly(&current).await;
                }
            }
        }

        let optimistic = if self.role.is_inspection_exempt() {
            Authority::Rejected(ReadOnly::Inspection)
        } else {
            Authority::Pending
        };
        self.session = Some(Session {
            resource_id: resource_id.to_string(),
            slot,
            holder: self.holder.clone(),
            draft,
            authority: optimistic.clone(),
        });
        self.publish();
        self.watcher.watch(resource_id).await;

        let result = self
            .service
            .acquire_for_editing(resource_id, &self.holder, self.role)
            .await;
        match result {
            Ok(grant) => {
                let authority = reduce(&optimistic, Signal::Granted(&grant), &self.holder);
                self.update(|s, _| s.authority = authority.clone());
                Ok(authority)
            }
            Err(e) if e.is_transient() => {
                error!("acquire {resource_id} failed: {e}");
                let signal = Signal::Failed {
                    previous: previous.as_ref(),
                };
                let authority = reduce(&optimistic, signal, &self.holder);
                self.update(|s, _| s.authority = authority);
                Err(e)
            }
            Err(e) => {
                // Not a transport problem; the open itself was invalid.
                self.session = None;
                self.publish();
                Err(e)
            }
        }
    }

    // ── Timers ───────────────────────────────────────────────

    /// Reconcile with server-side lease state. Transport failures are only
    /// returned once `failure_threshold` of them happen in a row.
    pub async fn poll(&mut self) -> Result<(), CoordinatorError> {
        if self.session.is_none() {
            return Ok(());
        }
        let leases = match self.watcher.poll().await {
            Ok(leases) => leases,
            Err(e) => {
                self.consecutive_failures += 1;
                if self.consecutive_failures < self.config.failure_threshold {
                    debug!("lease poll failed ({}x): {e}", self.consecutive_failures);
                    return Ok(());
                }
                if self.consecutive_failures == self.config.failure_threshold {
                    self.publish();
                }
                return Err(e);
            }
        };

        let recovered = self.consecutive_failures >= self.config.failure_threshold;
        self.consecutive_failures = 0;
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        let lease = leases
            .iter()
            .find(|l| session.same_key(&l.resource_id, l.slot));
        let next = reduce(&session.authority, Signal::Polled(lease), &self.holder);
        if next != session.authority || recovered {
            if session.authority.is_authoritative() && !next.is_authoritative() {
                warn!(
                    "{} lost lease on {} @ {}: {next:?}",
                    self.holder, session.resource_id, session.slot
                );
            }
            session.authority = next;
            self.publish();
        }
        Ok(())
    }

    /// Close the session if the clock has left its slot. Returns whether it did.
    pub fn check_rollover(&mut self) -> bool {
        let current = self.clock.current_slot();
        let Some(session) = self.session.take_if(|s| s.slot != current) else {
            return false;
        };
        info!(
            "slot rolled over from {} to {current}; closing {}",
            session.slot, session.resource_id
        );
        self.stash_draft(&session);
        self.publish();
        true
    }

    /// Drive polling and rollover checks until `shutdown` resolves.
    pub async fn run(&mut self, shutdown: impl Future<Output = ()>) {
        let mut poll = tokio::time::interval(self.config.poll_interval);
        let mut rollover = tokio::time::interval(self.config.rollover_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        rollover.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = rollover.tick() => {
                    self.check_rollover();
                }
                _ = poll.tick() => {
                    if let Err(e) = self.poll().await {
                        error!("lease polling keeps failing: {e}");
                    }
                }
            }
        }
    }

    // ── Editing ──────────────────────────────────────────────

    /// Edit the draft. Refused (returns false) unless the session may write.
    pub fn edit_draft(&mut self, edit: impl FnOnce(&mut Observation)) -> bool {
        let exempt = self.role.is_inspection_exempt();
        match self.session.as_mut() {
            Some(s) if s.authority.is_authoritative() || exempt => {
                edit(&mut s.draft);
                self.publish();
                true
            }
            _ => false,
        }
    }

    pub async fn submit(&mut self) -> Result<EntryOutcome, CoordinatorError> {
        let session = self.require_session()?.clone();
        let outcome = self
            .service
            .create_entry(
                &session.resource_id,
                session.slot,
                &self.holder,
                self.role,
                session.draft.clone(),
                EntryOrigin::Operator,
            )
            .await?;
        match &outcome {
            EntryOutcome::Created(_) => self.update(|s, _| s.draft = Observation::default()),
            EntryOutcome::Denied { holder } => self.update(|s, me| {
                s.authority = reduce(&s.authority, Signal::Denied(holder.as_deref()), me)
            }),
        }
        Ok(outcome)
    }

    /// Mark the resource processed; on success the lease is gone and the session closes.
    pub async fn mark_complete(&mut self) -> Result<CompletionOutcome, CoordinatorError> {
        let session = self.require_session()?.clone();
        let outcome = self
            .service
            .mark_complete(&session.resource_id, session.slot, &self.holder, self.role)
            .await?;
        match &outcome {
            CompletionOutcome::Completed { .. } => {
                self.stash_draft(&session);
                self.session = None;
                self.publish();
            }
            CompletionOutcome::Denied { holder } => self.update(|s, me| {
                s.authority = reduce(&s.authority, Signal::Denied(holder.as_deref()), me)
            }),
        }
        Ok(outcome)
    }

    /// Give the lease back and close the session.
    pub async fn release(&mut self, reason: ReleaseReason) -> Result<ReleaseOutcome, CoordinatorError> {
        let session = self.require_session()?.clone();
        self.stash_draft(&session);
        let outcome = self
            .service
            .release(&session.resource_id, session.slot, &self.holder, reason)
            .await?;
        self.session = None;
        self.publish();
        Ok(outcome)
    }

    /// Close without releasing; the lease lapses at the end of its slot.
    pub fn close(&mut self) {
        if let Some(session) = self.session.take() {
            self.stash_draft(&session);
            self.publish();
        }
    }

    /// Wait for every in-flight auto-save.
    pub async fn flush_autosaves(&mut self) {
        for handle in self.autosaves.drain(..) {
            let _ = handle.await;
        }
    }

    // ── Internals ────────────────────────────────────────────

    fn require_session(&self) -> Result<&Session, CoordinatorError> {
        self.session
            .as_ref()
            .ok_or_else(|| CoordinatorError::Validation("no open session".into()))
    }

    fn update(&mut self, f: impl FnOnce(&mut Session, &str)) {
        if let Some(session) = self.session.as_mut() {
            f(session, &self.holder);
            self.publish();
        }
    }

    /// Persist an unsubmitted draft as an auto-saved entry, without waiting.
    fn stash_draft(&mut self, session: &Session) {
        if session.draft.is_blank() {
            return;
        }
        let service = self.service.clone();
        let resource_id = session.resource_id.clone();
        let slot = session.slot;
        let holder = self.holder.clone();
        let role = self.role;
        let draft = session.draft.clone();

        self.autosaves.retain(|h| !h.is_finished());
        self.autosaves.push(tokio::spawn(async move {
            match service
                .create_entry(&resource_id, slot, &holder, role, draft, EntryOrigin::AutoSave)
                .await
            {
                Ok(EntryOutcome::Created(entry)) => {
                    debug!("auto-saved draft for {resource_id} @ {slot} ({})", entry.id)
                }
                Ok(EntryOutcome::Denied { holder: current }) => {
                    warn!("auto-save for {resource_id} @ {slot} refused (holder: {current:?})")
                }
                Err(e) => warn!("auto-save for {resource_id} @ {slot} failed: {e}"),
            }
        }));
    }

    async fn release_quietly(&self, session: &Session) {
        match self
            .service
            .release(
                &session.resource_id,
                session.slot,
                &self.holder,
                ReleaseReason::Manual,
            )
            .await
        {
            Ok(_) => debug!("released {} on switch", session.resource_id),
            Err(e) => warn!("release of {} on switch failed: {e}", session.resource_id),
        }
    }
}
