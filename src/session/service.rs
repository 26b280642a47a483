use async_trait::async_trait;

use crate::coordinator::{CompletionOutcome, CoordinatorError, EntryOutcome, Grant, LeaseCoordinator};
use crate::model::*;
use crate::store::ReleaseOutcome;

/// What a client session needs from the coordinator, wherever it runs.
#[async_trait]
pub trait LeaseService: Send + Sync + 'static {
    async fn acquire_for_editing(
        &self,
        resource_id: &str,
        holder: &str,
        role: Role,
    ) -> Result<Grant, CoordinatorError>;

    async fn release(
        &self,
        resource_id: &str,
        slot: TimeSlot,
        holder: &str,
        reason: ReleaseReason,
    ) -> Result<ReleaseOutcome, CoordinatorError>;

    async fn create_entry(
        &self,
        resource_id: &str,
        slot: TimeSlot,
        holder: &str,
        role: Role,
        observation: Observation,
        origin: EntryOrigin,
    ) -> Result<EntryOutcome, CoordinatorError>;

    async fn mark_complete(
        &self,
        resource_id: &str,
        slot: TimeSlot,
        holder: &str,
        role: Role,
    ) -> Result<CompletionOutcome, CoordinatorError>;

    async fn list_active_leases(&self) -> Result<Vec<Lease>, CoordinatorError>;
}

#[async_trait]
impl LeaseService for LeaseCoordinator {
    async fn acquire_for_editing(
        &self,
        resource_id: &str,
        holder: &str,
        role: Role,
    ) -> Result<Grant, CoordinatorError> {
        LeaseCoordinator::acquire_for_editing(self, resource_id, holder, role).await
    }

    async fn release(
        &self,
        resource_id: &str,
        slot: TimeSlot,
        holder: &str,
        reason: ReleaseReason,
    ) -> Result<ReleaseOutcome, CoordinatorError> {
        LeaseCoordinator::release(self, resource_id, slot, holder, reason).await
    }

    async fn create_entry(
        &self,
        resource_id: &str,
        slot: TimeSlot,
        holder: &str,
        role: Role,
        observation: Observation,
        origin: EntryOrigin,
    ) -> Result<EntryOutcome, CoordinatorError> {
        LeaseCoordinator::create_entry(self, resource_id, slot, holder, role, observation, origin)
            .await
    }

    async fn mark_complete(
        &self,
        resource_id: &str,
        slot: TimeSlot,
        holder: &str,
        role: Role,
    ) -> Result<CompletionOutcome, CoordinatorError> {
        LeaseCoordinator::mark_complete(self, resource_id, slot, holder, role).await
    }

    async fn list_active_leases(&self) -> Result<Vec<Lease>, CoordinatorError> {
        LeaseCoordinator::list_active_leases(self).await
    }
}
