use tracing::debug;

use super::*;
use crate::observability::{LEASE_CONFLICTS_TOTAL, LEASES_ACQUIRED_TOTAL, LEASES_RELEASED_TOTAL};
use crate::store::{AcquireOutcome, ReleaseOutcome};

impl Engine {
    // ── Lease mutations ──────────────────────────────────────

    pub async fn try_acquire(
        &self,
        resource_id: &str,
        slot: TimeSlot,
        holder: &str,
    ) -> Result<AcquireOutcome, EngineError> {
        validate_resource_id(resource_id)?;
        validate_holder(holder)?;

        let lane = self.lane(resource_id)?;
        let mut guard = self.write_lane(lane).await;

        // Read the clock under the lane lock so two racers agree on expiry.
        let now = self.clock.now_ms();
        let expires_at = self.clock.slot_end(&slot);
        if expires_at <= now {
            return Err(EngineError::SlotElapsed(slot));
        }

        if let Some(existing) = guard.live_lease(&slot, now) {
            if existing.held_by(holder) {
                return Ok(AcquireOutcome::AlreadyHeld(existing.clone()));
            }
            metrics::counter!(LEASE_CONFLICTS_TOTAL).increment(1);
            return Ok(AcquireOutcome::Conflict {
                holder: existing.holder.clone(),
            });
        }

        // An expired lease still occupying the key is replaced, not honored.
        if let Some(expired) = guard.leases.get(&slot).cloned() {
            let event = Event::LeaseReleased {
                resource_id: resource_id.to_string(),
                slot,
                holder: expired.holder,
                reason: ReleaseReason::Expired,
                at: expired.expires_at,
            };
            self.persist_and_apply(&mut guard, &event).await?;
        }

        let lease = Lease {
            resource_id: resource_id.to_string(),
            slot,
            holder: holder.to_string(),
            acquired_at: now,
            expires_at,
        };
        let event = Event::LeaseAcquired {
            lease: lease.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        metrics::counter!(LEASES_ACQUIRED_TOTAL).increment(1);
        Ok(AcquireOutcome::Acquired(lease))
    }

    /// Release a lease the caller holds. Releasing what isn't held is a no-op
    /// reported as `NotHolder`, never an error.
    pub async fn release(
        &self,
        resource_id: &str,
        slot: TimeSlot,
        holder: &str,
        reason: ReleaseReason,
    ) -> Result<ReleaseOutcome, EngineError> {
        let Some(lane) = self.get_lane(resource_id) else {
            return Ok(ReleaseOutcome::NotHolder { current: None });
        };
        let mut guard = self.write_lane(lane).await;
        let now = self.clock.now_ms();

        let lease = match guard.live_lease(&slot, now) {
            Some(l) if l.held_by(holder) => l.clone(),
            Some(l) => {
                return Ok(ReleaseOutcome::NotHolder {
                    current: Some(l.holder.clone()),
                });
            }
            None => return Ok(ReleaseOutcome::NotHolder { current: None }),
        };

        let event = Event::LeaseReleased {
            resource_id: resource_id.to_string(),
            slot,
            holder: lease.holder.clone(),
            reason,
            at: now,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        metrics::counter!(LEASES_RELEASED_TOTAL, "reason" => reason.as_str()).increment(1);
        Ok(ReleaseOutcome::Released(lease))
    }

    pub async fn force_release(
        &self,
        resource_id: &str,
        slot: TimeSlot,
        reason: ReleaseReason,
    ) -> Result<Option<Lease>, EngineError> {
        let Some(lane) = self.get_lane(resource_id) else {
            return Ok(None);
        };
        let mut guard = self.write_lane(lane).await;
        let Some(lease) = guard.leases.get(&slot).cloned() else {
            return Ok(None);
        };

        let event = Event::LeaseReleased {
            resource_id: resource_id.to_string(),
            slot,
            holder: lease.holder.clone(),
            reason,
            at: self.clock.now_ms(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        metrics::counter!(LEASES_RELEASED_TOTAL, "reason" => reason.as_str()).increment(1);
        Ok(Some(lease))
    }

    /// Remove every lease whose slot has ended. Returns how many were removed.
    pub async fn sweep_expired(&self) -> Result<usize, EngineError> {
        let now = self.clock.now_ms();
        let mut removed = 0;
        for (resource_id, slot) in self.collect_expired_leases(now) {
            let Some(lane) = self.get_lane(&resource_id) else {
                continue;
            };
            let mut guard = self.write_lane(lane).await;
            // Re-check under the write lock: a racer may have replaced it.
            let Some(lease) = guard.leases.get(&slot).filter(|l| !l.is_live(now)).cloned() else {
                continue;
            };
            let event = Event::LeaseReleased {
                resource_id,
                slot,
                holder: lease.holder,
                reason: ReleaseReason::Expired,
                at: lease.expires_at,
            };
            self.persist_and_apply(&mut guard, &event).await?;
            removed += 1;
        }
        if removed > 0 {
            metrics::counter!(LEASES_RELEASED_TOTAL, "reason" => ReleaseReason::Expired.as_str())
                .increment(removed as u64);
            debug!("swept {removed} expired leases");
        }
        Ok(removed)
    }

    /// Expired leases across all lanes. Lanes locked by a writer are skipped;
    /// the next sweep picks them up.
    pub fn collect_expired_leases(&self, now: Ms) -> Vec<(String, TimeSlot)> {
        let mut out = Vec::new();
        for entry in self.lanes.iter() {
            if let Ok(guard) = entry.value().try_read() {
                for slot in guard.expired_slots(now) {
                    out.push((entry.key().clone(), slot));
                }
            }
        }
        out
    }

    // ── Lease queries ────────────────────────────────────────

    /// All live leases, ordered by resource id then slot.
    pub async fn list_active(&self) -> Vec<Lease> {
        let now = self.clock.now_ms();
        let mut out = Vec::new();
        for lane in self.all_lanes() {
            let guard = lane.read().await;
            out.extend(guard.leases.values().filter(|l| l.is_live(now)).cloned());
        }
        out.sort_by(|a, b| (&a.resource_id, a.slot).cmp(&(&b.resource_id, b.slot)));
        out
    }

    pub async fn lease_for(&self, resource_id: &str, slot: TimeSlot) -> Option<Lease> {
        let lane = self.get_lane(resource_id)?;
        let guard = lane.read().await;
        guard.live_lease(&slot, self.clock.now_ms()).cloned()
    }

    pub async fn leases_held_by(&self, holder: &str) -> Vec<Lease> {
        self.list_active()
            .await
            .into_iter()
            .filter(|l| l.held_by(holder))
            .collect()
    }

    /// The tenure that most recently ended on a key. An expired lease the
    /// sweeper hasn't removed yet counts as ended at its expiry.
    pub async fn ended_lease(&self, resource_id: &str, slot: TimeSlot) -> Option<EndedLease> {
        let lane = self.get_lane(resource_id)?;
        let guard = lane.read().await;
        let now = self.clock.now_ms();
        match guard.leases.get(&slot) {
            Some(l) if l.is_live(now) => None,
            Some(l) => Some(EndedLease {
                holder: l.holder.clone(),
                ended_at: l.expires_at,
                reason: ReleaseReason::Expired,
            }),
            None => guard.ended.get(&slot).cloned(),
        }
    }
}
