//! Persistence seams between the coordinator and whatever backs it.
//!
//! [`Engine`](crate::engine::Engine) implements all three traits; tests and
//! embedders can supply their own.

use async_trait::async_trait;

use crate::engine::EngineError;
use crate::model::*;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired(Lease),
    /// Caller already held the lease; nothing changed.
    AlreadyHeld(Lease),
    Conflict { holder: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released(Lease),
    /// No live lease, or one held by someone else (`current`).
    NotHolder { current: Option<String> },
}

#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Insert a lease if the key is free or its lease has expired. Atomic per key.
    async fn try_acquire(
        &self,
        resource_id: &str,
        slot: TimeSlot,
        holder: &str,
    ) -> Result<AcquireOutcome, EngineError>;

    async fn release(
        &self,
        resource_id: &str,
        slot: TimeSlot,
        holder: &str,
        reason: ReleaseReason,
    ) -> Result<ReleaseOutcome, EngineError>;

    /// Remove whatever lease sits on the key, live or expired, regardless of holder.
    async fn force_release(
        &self,
        resource_id: &str,
        slot: TimeSlot,
        reason: ReleaseReason,
    ) -> Result<Option<Lease>, EngineError>;

    async fn list_active(&self) -> Result<Vec<Lease>, EngineError>;

    async fn sweep_expired(&self) -> Result<usize, EngineError>;

    async fn lease_for(&self, resource_id: &str, slot: TimeSlot) -> Result<Option<Lease>, EngineError>;

    async fn leases_held_by(&self, holder: &str) -> Result<Vec<Lease>, EngineError>;

    /// Most recent tenure on the key that is no longer live, if any.
    async fn ended_lease(
        &self,
        resource_id: &str,
        slot: TimeSlot,
    ) -> Result<Option<EndedLease>, EngineError>;
}

#[async_trait]
pub trait EntryLog: Send + Sync {
    async fn append(&self, entry: Entry) -> Result<Entry, EngineError>;

    async fn entries(
        &self,
        resource_id: &str,
        slot: Option<TimeSlot>,
    ) -> Result<Vec<Entry>, EngineError>;

    async fn set_completion(&self, resource_id: &str, completion: Completion) -> Result<(), EngineError>;

    async fn clear_completion(&self, resource_id: &str) -> Result<(), EngineError>;

    async fn completion(&self, resource_id: &str) -> Result<Option<Completion>, EngineError>;
}

#[async_trait]
pub trait ResourceDirectory: Send + Sync {
    async fn resource_exists(&self, resource_id: &str) -> Result<bool, EngineError>;
}
