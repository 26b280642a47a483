mod error;

pub use error::CoordinatorError;

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::clock::Clock;
use crate::engine::Engine;
use crate::limits::*;
use crate::model::*;
use crate::store::{AcquireOutcome, EntryLog, LeaseStore, ReleaseOutcome, ResourceDirectory};

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Refuse a new lease while the holder has a live one on another resource.
    pub single_lease_per_holder: bool,
    /// How long after a lease ends its holder may still auto-save into the slot.
    pub autosave_grace_ms: Ms,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            single_lease_per_holder: true,
            autosave_grace_ms: DEFAULT_AUTOSAVE_GRACE_MS,
        }
    }
}

/// Why a caller got a read-only view instead of an editing lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOnlyReason {
    /// Inspection-exempt role; the store was not consulted.
    Inspection,
    LockedBy(String),
    /// The caller already edits another resource.
    HolderBusy { resource_id: String, slot: TimeSlot },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Grant {
    Editing(Lease),
    ReadOnly(ReadOnlyReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryOutcome {
    Created(Entry),
    /// Caller does not hold the key; `holder` is whoever does, if anyone.
    Denied { holder: Option<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionOutcome {
    /// `released` is false when the lease was already gone; the marker stands regardless.
    Completed { released: bool },
    Denied { holder: Option<String> },
}

/// Mutual-exclusion rules layered over the lease store and observation log.
#[derive(Clone)]
pub struct LeaseCoordinator {
    leases: Arc<dyn LeaseStore>,
    log: Arc<dyn EntryLog>,
    directory: Arc<dyn ResourceDirectory>,
    clock: Clock,
    config: CoordinatorConfig,
    /// One turn at a time per holder, so the single-lease check and the
    /// acquisition it guards cannot interleave with the same holder's next open.
    holder_turns: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl LeaseCoordinator {
    pub fn new(
        leases: Arc<dyn LeaseStore>,
        log: Arc<dyn EntryLog>,
        directory: Arc<dyn ResourceDirectory>,
        clock: Clock,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            leases,
            log,
            directory,
            clock,
            config,
            holder_turns: Arc::new(DashMap::new()),
        }
    }

    /// Coordinator whose store, log and directory are all one engine.
    pub fn for_engine(engine: Arc<Engine>, config: CoordinatorConfig) -> Self {
        let clock = engine.clock.clone();
        Self::new(engine.clone(), engine.clone(), engine, clock, config)
    }

    async fn holder_turn(&self, holder: &str) -> OwnedMutexGuard<()> {
        let turn = self
            .holder_turns
            .entry(holder.to_lowercase())
            .or_default()
            .clone();
        turn.lock_owned().await
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    // ── Leases ───────────────────────────────────────────────

    /// Acquire the current slot of a resource, or explain why the caller is read-only.
    /// A conflict is answered immediately: no retry, no queue.
    pub async fn acquire_for_editing(
        &self,
        resource_id: &str,
        holder: &str,
        role: Role,
    ) -> Result<Grant, CoordinatorError> {
        require_holder(holder)?;
        if role.is_inspection_exempt() {
            return Ok(Grant::ReadOnly(ReadOnlyReason::Inspection));
        }
        if !self.directory.resource_exists(resource_id).await? {
            return Err(CoordinatorError::UnknownResource(resource_id.to_string()));
        }

        let _turn = if self.config.single_lease_per_holder {
            let turn = self.holder_turn(holder).await;
            let busy = self
                .leases
                .leases_held_by(holder)
                .await?
                .into_iter()
                .find(|l| l.resource_id != resource_id);
            if let Some(other) = busy {
                debug!("{holder} refused {resource_id}: already holds {}", other.resource_id);
                return Ok(Grant::ReadOnly(ReadOnlyReason::HolderBusy {
                    resource_id: other.resource_id,
                    slot: other.slot,
                }));
            }
            Some(turn)
        } else {
            None
        };

        let slot = self.clock.current_slot();
        match self.leases.try_acquire(resource_id, slot, holder).await? {
            AcquireOutcome::Acquired(lease) => {
                // A new tenure starts the resource's processing over.
                self.log.clear_completion(resource_id).await?;
                debug!("{holder} acquired {resource_id} @ {slot}");
                Ok(Grant::Editing(lease))
            }
            AcquireOutcome::AlreadyHeld(lease) => Ok(Grant::Editing(lease)),
            AcquireOutcome::Conflict { holder: other } => {
                info!("{holder} denied {resource_id} @ {slot}: locked by {other}");
                Ok(Grant::ReadOnly(ReadOnlyReason::LockedBy(other)))
            }
        }
    }

    pub async fn release(
        &self,
        resource_id: &str,
        slot: TimeSlot,
        holder: &str,
        reason: ReleaseReason,
    ) -> Result<ReleaseOutcome, CoordinatorError> {
        require_holder(holder)?;
        Ok(self.leases.release(resource_id, slot, holder, reason).await?)
    }

    /// Administrative removal regardless of holder. Works on resources that
    /// no longer exist; that is how stale leases get cleaned up.
    pub async fn force_release(
        &self,
        resource_id: &str,
        slot: TimeSlot,
        role: Role,
        reason: ReleaseReason,
    ) -> Result<Option<Lease>, CoordinatorError> {
        if !role.is_admin() {
            return Err(CoordinatorError::NotPermitted("force release requires an admin role"));
        }
        let removed = self.leases.force_release(resource_id, slot, reason).await?;
        if let Some(lease) = &removed {
            info!(
                "force-released {resource_id} @ {slot} from {} ({reason})",
                lease.holder
            );
        }
        Ok(removed)
    }

    /// Release every live lease `holder` owns. Callers may clear their own;
    /// clearing someone else's requires an admin role.
    pub async fn release_all(
        &self,
        holder: &str,
        caller: &str,
        role: Role,
    ) -> Result<Vec<Lease>, CoordinatorError> {
        require_holder(holder)?;
        let own = same_holder(holder, caller);
        if !own && !role.is_admin() {
            return Err(CoordinatorError::NotPermitted(
                "releasing another holder's leases requires an admin role",
            ));
        }
        let reason = if own {
            ReleaseReason::Manual
        } else {
            ReleaseReason::Administrative
        };

        let mut released = Vec::new();
        for lease in self.leases.leases_held_by(holder).await? {
            if let ReleaseOutcome::Released(l) = self
                .leases
                .release(&lease.resource_id, lease.slot, holder, reason)
                .await?
            {
                released.push(l);
            }
        }
        if !released.is_empty() {
            info!("released {} leases of {holder} ({reason})", released.len());
        }
        Ok(released)
    }

    pub async fn list_active_leases(&self) -> Result<Vec<Lease>, CoordinatorError> {
        Ok(self.leases.list_active().await?)
    }

    pub async fn lease_for(
        &self,
        resource_id: &str,
        slot: TimeSlot,
    ) -> Result<Option<Lease>, CoordinatorError> {
        Ok(self.leases.lease_for(resource_id, slot).await?)
    }

    // ── Stale detection ──────────────────────────────────────

    /// Fails when live leases reference `resource_id` but it no longer resolves.
    /// Never deletes anything.
    pub async fn detect_stale(&self, resource_id: &str) -> Result<(), CoordinatorError> {
        if self.directory.resource_exists(resource_id).await? {
            return Ok(());
        }
        let holders: Vec<String> = self
            .leases
            .list_active()
            .await?
            .into_iter()
            .filter(|l| l.resource_id == resource_id)
            .map(|l| l.holder)
            .collect();
        if holders.is_empty() {
            return Ok(());
        }
        Err(CoordinatorError::StaleLeaseDetected {
            resource_id: resource_id.to_string(),
            holders,
        })
    }

    /// Live leases whose resource no longer resolves.
    pub async fn stale_leases(&self) -> Result<Vec<Lease>, CoordinatorError> {
        let mut stale = Vec::new();
        for lease in self.leases.list_active().await? {
            if !self.directory.resource_exists(&lease.resource_id).await? {
                stale.push(lease);
            }
        }
        metrics::gauge!(crate::observability::STALE_LEASES).set(stale.len() as f64);
        if !stale.is_empty() {
            warn!("{} stale leases awaiting administrative release", stale.len());
        }
        Ok(stale)
    }

    // ── Entries ──────────────────────────────────────────────

    pub async fn can_create_entry(
        &self,
        resource_id: &str,
        slot: TimeSlot,
        holder: &str,
        role: Role,
    ) -> Result<bool, CoordinatorError> {
        if role.is_inspection_exempt() {
            return Ok(true);
        }
        let lease = self.leases.lease_for(resource_id, slot).await?;
        Ok(lease.is_some_and(|l| l.held_by(holder)))
    }

    /// Validate and append one observation. Input errors are reported before
    /// any lease or log access.
    pub async fn create_entry(
        &self,
        resource_id: &str,
        slot: TimeSlot,
        holder: &str,
        role: Role,
        observation: Observation,
        origin: EntryOrigin,
    ) -> Result<EntryOutcome, CoordinatorError> {
        require_holder(holder)?;
        self.reject_future_slot(slot)?;
        let observation = normalize_observation(observation, origin)?;

        if !self.directory.resource_exists(resource_id).await? {
            return Err(CoordinatorError::UnknownResource(resource_id.to_string()));
        }

        if !self.can_create_entry(resource_id, slot, holder, role).await? {
            let current = self.leases.lease_for(resource_id, slot).await?;
            let admissible = origin == EntryOrigin::AutoSave
                && current.is_none()
                && self.within_autosave_grace(resource_id, slot, holder).await?;
            if !admissible {
                return Ok(EntryOutcome::Denied {
                    holder: current.map(|l| l.holder),
                });
            }
        }

        let entry = Entry {
            id: Ulid::new(),
            resource_id: resource_id.to_string(),
            slot,
            holder: holder.to_string(),
            observation,
            auto_saved: origin == EntryOrigin::AutoSave,
            created_at: self.clock.now_ms(),
        };
        let entry = self.log.append(entry).await?;
        debug!("{holder} logged {resource_id} @ {slot} ({})", entry.id);
        Ok(EntryOutcome::Created(entry))
    }

    /// The caller's own tenure on the key ended recently and not by force.
    async fn within_autosave_grace(
        &self,
        resource_id: &str,
        slot: TimeSlot,
        holder: &str,
    ) -> Result<bool, CoordinatorError> {
        let Some(ended) = self.leases.ended_lease(resource_id, slot).await? else {
            return Ok(false);
        };
        let age = self.clock.now_ms() - ended.ended_at;
        Ok(same_holder(&ended.holder, holder)
            && ended.reason.permits_autosave()
            && (0..=self.config.autosave_grace_ms).contains(&age))
    }

    pub async fn entries(
        &self,
        resource_id: &str,
        slot: Option<TimeSlot>,
    ) -> Result<Vec<Entry>, CoordinatorError> {
        Ok(self.log.entries(resource_id, slot).await?)
    }

    // ── Completion ───────────────────────────────────────────

    /// Mark the resource fully processed, then release the caller's lease.
    /// The marker is not rolled back if the release finds the lease gone.
    pub async fn mark_complete(
        &self,
        resource_id: &str,
        slot: TimeSlot,
        holder: &str,
        role: Role,
    ) -> Result<CompletionOutcome, CoordinatorError> {
        require_holder(holder)?;
        if !self.can_create_entry(resource_id, slot, holder, role).await? {
            let current = self.leases.lease_for(resource_id, slot).await?;
            return Ok(CompletionOutcome::Denied {
                holder: current.map(|l| l.holder),
            });
        }

        let completion = Completion {
            slot,
            holder: holder.to_string(),
            completed_at: self.clock.now_ms(),
        };
        self.log.set_completion(resource_id, completion).await?;

        let released = match self
            .leases
            .release(resource_id, slot, holder, ReleaseReason::Completed)
            .await
        {
            Ok(ReleaseOutcome::Released(_)) => true,
            Ok(ReleaseOutcome::NotHolder { .. }) => {
                if !role.is_inspection_exempt() {
                    warn!("{resource_id} @ {slot} completed but lease was already gone");
                }
                false
            }
            Err(e) => {
                warn!("{resource_id} @ {slot} completed but release failed: {e}");
                false
            }
        };
        Ok(CompletionOutcome::Completed { released })
    }

    pub async fn completion(&self, resource_id: &str) -> Result<Option<Completion>, CoordinatorError> {
        Ok(self.log.completion(resource_id).await?)
    }

    fn reject_future_slot(&self, slot: TimeSlot) -> Result<(), CoordinatorError> {
        if slot > self.clock.current_slot() {
            return Err(CoordinatorError::Validation(format!(
                "cannot log slot {slot} before it starts"
            )));
        }
        Ok(())
    }
}

fn require_holder(holder: &str) -> Result<(), CoordinatorError> {
    if holder.trim().is_empty() {
        return Err(CoordinatorError::Validation("holder identity is required".into()));
    }
    if holder.len() > MAX_HOLDER_LEN {
        return Err(CoordinatorError::LimitExceeded("holder identity too long"));
    }
    Ok(())
}

/// Enforce the issue form's rules and stamp auto-saved drafts.
pub fn normalize_observation(
    mut obs: Observation,
    origin: EntryOrigin,
) -> Result<Observation, CoordinatorError> {
    obs.description = obs.description.trim().to_string();
    obs.case_number = non_blank(obs.case_number);
    obs.missed_by = non_blank(obs.missed_by);

    match origin {
        EntryOrigin::Operator => {
            if obs.issue_present {
                if obs.description.is_empty() || obs.description.eq_ignore_ascii_case(NO_ISSUE) {
                    return Err(CoordinatorError::Validation(
                        "an issue needs a description".into(),
                    ));
                }
            } else {
                obs.description = NO_ISSUE.to_string();
            }
        }
        // Drafts may be half-filled; keep what was typed and flag it.
        EntryOrigin::AutoSave => {
            if obs.description.is_empty() && !obs.issue_present {
                obs.description = NO_ISSUE.to_string();
            }
            obs.description = if obs.description.is_empty() {
                AUTOSAVE_MARKER.to_string()
            } else {
                format!("{} {AUTOSAVE_MARKER}", obs.description)
            };
        }
    }

    if obs.description.len() > MAX_DESCRIPTION_LEN {
        return Err(CoordinatorError::Validation("description too long".into()));
    }
    if obs
        .case_number
        .as_deref()
        .is_some_and(|c| c.len() > MAX_CASE_NUMBER_LEN)
    {
        return Err(CoordinatorError::Validation("case number too long".into()));
    }
    if obs.missed_by.as_deref().is_some_and(|m| m.len() > MAX_HOLDER_LEN) {
        return Err(CoordinatorError::Validation("missed_by too long".into()));
    }
    Ok(obs)
}

fn non_blank(s: Option<String>) -> Option<String> {
    s.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}
