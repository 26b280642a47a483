use super::*;
use crate::observability::ENTRIES_APPENDED_TOTAL;

impl Engine {
    pub async fn append_entry(&self, entry: Entry) -> Result<Entry, EngineError> {
        validate_resource_id(&entry.resource_id)?;
        validate_holder(&entry.holder)?;
        validate_observation(&entry.observation)?;

        let lane = self.lane(&entry.resource_id)?;
        let mut guard = self.write_lane(lane).await;
        if guard.entries.len() >= MAX_ENTRIES_PER_RESOURCE {
            return Err(EngineError::LimitExceeded("too many entries for resource"));
        }
        let event = Event::EntryAppended {
            entry: entry.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        metrics::counter!(
            ENTRIES_APPENDED_TOTAL,
            "origin" => if entry.auto_saved { "autosave" } else { "operator" }
        )
        .increment(1);
        Ok(entry)
    }

    /// Entries for a resource in insertion order, optionally narrowed to one slot.
    pub async fn entries(&self, resource_id: &str, slot: Option<TimeSlot>) -> Vec<Entry> {
        let Some(lane) = self.get_lane(resource_id) else {
            return Vec::new();
        };
        let guard = lane.read().await;
        guard.entries_for(slot.as_ref()).cloned().collect()
    }

    pub async fn set_completion(
        &self,
        resource_id: &str,
        completion: Completion,
    ) -> Result<(), EngineError> {
        validate_resource_id(resource_id)?;
        let lane = self.lane(resource_id)?;
        let mut guard = self.write_lane(lane).await;
        let event = Event::CompletionMarked {
            resource_id: resource_id.to_string(),
            completion,
        };
        self.persist_and_apply(&mut guard, &event).await
    }

    pub async fn clear_completion(&self, resource_id: &str) -> Result<(), EngineError> {
        let Some(lane) = self.get_lane(resource_id) else {
            return Ok(());
        };
        let mut guard = self.write_lane(lane).await;
        if guard.completion.is_none() {
            return Ok(());
        }
        let event = Event::CompletionCleared {
            resource_id: resource_id.to_string(),
        };
        self.persist_and_apply(&mut guard, &event).await
    }

    pub async fn completion(&self, resource_id: &str) -> Option<Completion> {
        let lane = self.get_lane(resource_id)?;
        let guard = lane.read().await;
        guard.completion.clone()
    }
}

fn validate_observation(obs: &Observation) -> Result<(), EngineError> {
    if obs.description.len() > MAX_DESCRIPTION_LEN {
        return Err(EngineError::LimitExceeded("description too long"));
    }
    if obs
        .case_number
        .as_deref()
        .is_some_and(|c| c.len() > MAX_CASE_NUMBER_LEN)
    {
        return Err(EngineError::LimitExceeded("case number too long"));
    }
    if obs
        .missed_by
        .as_deref()
        .is_some_and(|m| m.len() > MAX_HOLDER_LEN)
    {
        return Err(EngineError::LimitExceeded("missed_by too long"));
    }
    Ok(())
}
