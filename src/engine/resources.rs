use async_trait::async_trait;

use super::*;
use crate::store::{AcquireOutcome, EntryLog, LeaseStore, ReleaseOutcome, ResourceDirectory};

impl Engine {
    /// Register or rename a resource.
    pub async fn register_resource(&self, id: &str, name: Option<String>) -> Result<(), EngineError> {
        validate_resource_id(id)?;
        if name.as_deref().is_some_and(|n| n.len() > MAX_RESOURCE_NAME_LEN) {
            return Err(EngineError::LimitExceeded("resource name too long"));
        }
        if !self.resources.contains_key(id) && self.resources.len() >= MAX_RESOURCES_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many resources"));
        }
        let _gate = self.hold_compaction().await;
        let event = Event::ResourceRegistered {
            id: id.to_string(),
            name: name.clone(),
        };
        self.wal_append(&event).await?;
        self.resources.insert(
            id.to_string(),
            ResourceInfo {
                id: id.to_string(),
                name,
            },
        );
        self.notify.send(id, &event);
        Ok(())
    }

    /// Drop a resource from the directory. Its lane (leases, entries) is kept:
    /// leases on it become stale and stay until an admin removes them.
    pub async fn unregister_resource(&self, id: &str) -> Result<(), EngineError> {
        if !self.resources.contains_key(id) {
            return Err(EngineError::NotFound(id.to_string()));
        }
        let _gate = self.hold_compaction().await;
        let event = Event::ResourceUnregistered { id: id.to_string() };
        self.wal_append(&event).await?;
        self.resources.remove(id);
        self.notify.send(id, &event);
        Ok(())
    }

    pub fn resource_exists(&self, id: &str) -> bool {
        self.resources.contains_key(id)
    }

    pub fn list_resources(&self) -> Vec<ResourceInfo> {
        let mut out: Vec<ResourceInfo> = self.resources.iter().map(|e| e.value().clone()).collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }
}

// ── Store trait impls ────────────────────────────────────────

#[async_trait]
impl LeaseStore for Engine {
    async fn try_acquire(
        &self,
        resource_id: &str,
        slot: TimeSlot,
        holder: &str,
    ) -> Result<AcquireOutcome, EngineError> {
        Engine::try_acquire(self, resource_id, slot, holder).await
    }

    async fn release(
        &self,
        resource_id: &str,
        slot: TimeSlot,
        holder: &str,
        reason: ReleaseReason,
    ) -> Result<ReleaseOutcome, EngineError> {
        Engine::release(self, resource_id, slot, holder, reason).await
    }

    async fn force_release(
        &self,
        resource_id: &str,
        slot: TimeSlot,
        reason: ReleaseReason,
    ) -> Result<Option<Lease>, EngineError> {
        Engine::force_release(self, resource_id, slot, reason).await
    }

    async fn list_active(&self) -> Result<Vec<Lease>, EngineError> {
        Ok(Engine::list_active(self).await)
    }

    async fn sweep_expired(&self) -> Result<usize, EngineError> {
        Engine::sweep_expired(self).await
    }

    async fn lease_for(&self, resource_id: &str, slot: TimeSlot) -> Result<Option<Lease>, EngineError> {
        Ok(Engine::lease_for(self, resource_id, slot).await)
    }

    async fn leases_held_by(&self, holder: &str) -> Result<Vec<Lease>, EngineError> {
        Ok(Engine::leases_held_by(self, holder).await)
    }

    async fn ended_lease(
        &self,
        resource_id: &str,
        slot: TimeSlot,
    ) -> Result<Option<EndedLease>, EngineError> {
        Ok(Engine::ended_lease(self, resource_id, slot).await)
    }
}

#[async_trait]
impl EntryLog for Engine {
    async fn append(&self, entry: Entry) -> Result<Entry, EngineError> {
        self.append_entry(entry).await
    }

    async fn entries(
        &self,
        resource_id: &str,
        slot: Option<TimeSlot>,
    ) -> Result<Vec<Entry>, EngineError> {
        Ok(Engine::entries(self, resource_id, slot).await)
    }

    async fn set_completion(&self, resource_id: &str, completion: Completion) -> Result<(), EngineError> {
        Engine::set_completion(self, resource_id, completion).await
    }

    async fn clear_completion(&self, resource_id: &str) -> Result<(), EngineError> {
        Engine::clear_completion(self, resource_id).await
    }

    async fn completion(&self, resource_id: &str) -> Result<Option<Completion>, EngineError> {
        Ok(Engine::completion(self, resource_id).await)
    }
}

#[async_trait]
impl ResourceDirectory for Engine {
    async fn resource_exists(&self, resource_id: &str) -> Result<bool, EngineError> {
        Ok(Engine::resource_exists(self, resource_id))
    }
}
