mod entries;
mod error;
mod leases;
mod resources;
#[cfg(test)]
mod tests;

pub use error::EngineError;

use std::io;
use std::ops::{Deref, DerefMut};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock, RwLockReadGuard, mpsc, oneshot};

use crate::clock::Clock;
use crate::limits::*;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::observability::{WAL_FLUSH_BATCH_SIZE, WAL_FLUSH_DURATION_SECONDS};
use crate::wal::Wal;

pub type SharedLane = Arc<RwLock<LaneState>>;

/// A lane's write lock plus a shared hold on the compaction gate. While any
/// of these exist the WAL cannot be rewritten under them.
pub(super) struct LaneWrite<'a> {
    lane: OwnedRwLockWriteGuard<LaneState>,
    _gate: RwLockReadGuard<'a, ()>,
}

impl Deref for LaneWrite<'_> {
    type Target = LaneState;

    fn deref(&self) -> &LaneState {
        &self.lane
    }
}

impl DerefMut for LaneWrite<'_> {
    fn deref_mut(&mut self) -> &mut LaneState {
        &mut self.lane
    }
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Owns the tenant's WAL. Appends that queue up while one is being written
/// share a single fsync; every sender hears the batch's result.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                commit_batch(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(WAL_FLUSH_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
    for (_, reply) in batch.drain(..) {
        let _ = reply.send(
            result
                .as_ref()
                .map(|_| ())
                .map_err(|e| io::Error::new(e.kind(), e.to_string())),
        );
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let buffered = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append: leftover bytes must not ride along
    // with the next batch.
    let flushed = wal.flush_sync();
    buffered.and(flushed)
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result =
                Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let mut batch = vec![(event, response)];
            commit_batch(wal, &mut batch);
        }
    }
}

/// Apply an event directly to a lane (no locking; caller holds the lock).
fn apply_to_lane(lane: &mut LaneState, event: &Event) {
    match event {
        Event::LeaseAcquired { lease } => lane.insert_lease(lease.clone()),
        Event::LeaseReleased { slot, reason, at, .. } => {
            lane.remove_lease(slot, *reason, *at);
        }
        Event::EntryAppended { entry } => lane.entries.push(entry.clone()),
        Event::CompletionMarked { completion, .. } => lane.completion = Some(completion.clone()),
        Event::CompletionCleared { .. } => lane.completion = None,
        // Registry events are handled at the DashMap level, not here
        Event::ResourceRegistered { .. } | Event::ResourceUnregistered { .. } => {}
    }
}

/// One tenant's lease table, observation log and resource registry.
///
/// Every resource id gets a lane guarded by its own `RwLock`; holding a
/// lane's write lock across check, WAL append and apply is what makes
/// acquisition an atomic insert-if-absent-or-expired.
///
/// Mutations hold `compaction` shared, taken before any lane lock;
/// `compact_wal` holds it exclusively from snapshot to file swap.
pub struct Engine {
    pub lanes: DashMap<String, SharedLane>,
    pub(super) resources: DashMap<String, ResourceInfo>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    compaction: RwLock<()>,
    pub notify: Arc<NotifyHub>,
    pub clock: Clock,
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>, clock: Clock) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            lanes: DashMap::new(),
            resources: DashMap::new(),
            wal_tx,
            compaction: RwLock::new(()),
            notify,
            clock,
        };

        // Nothing else can see these lanes yet, so try_write always succeeds.
        // No blocking lock: tenants are created from inside the runtime.
        for event in &events {
            match event {
                Event::ResourceRegistered { id, name } => {
                    engine.resources.insert(
                        id.clone(),
                        ResourceInfo {
                            id: id.clone(),
                            name: name.clone(),
                        },
                    );
                }
                Event::ResourceUnregistered { id } => {
                    engine.resources.remove(id);
                }
                other => {
                    let lane = engine.lane_unchecked(other.resource_id());
                    if let Ok(mut guard) = lane.try_write() {
                        apply_to_lane(&mut guard, other);
                    }
                }
            }
        }

        Ok(engine)
    }

    /// Hand one command to the writer task and wait for its reply.
    async fn wal_request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> WalCommand,
    ) -> Result<T, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(command(tx))
            .await
            .map_err(|_| EngineError::WalError("writer task has stopped".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("writer task dropped the reply".into()))
    }

    /// Durably record `event`; returns once its batch is fsynced.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        self.wal_request(|response| WalCommand::Append {
            event: event.clone(),
            response,
        })
        .await?
        .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// Durable append, then apply to the locked lane and fan out to watchers.
    pub(super) async fn persist_and_apply(
        &self,
        lane: &mut LaneState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_lane(lane, event);
        self.notify.send(event.resource_id(), event);
        Ok(())
    }

    /// Lock a lane for mutation. Waits out a running compaction first.
    pub(super) async fn write_lane(&self, lane: SharedLane) -> LaneWrite<'_> {
        let gate = self.compaction.read().await;
        LaneWrite {
            lane: lane.write_owned().await,
            _gate: gate,
        }
    }

    /// Hold off compaction for a mutation that touches no lane.
    pub(super) async fn hold_compaction(&self) -> RwLockReadGuard<'_, ()> {
        self.compaction.read().await
    }

    pub fn get_lane(&self, resource_id: &str) -> Option<SharedLane> {
        self.lanes.get(resource_id).map(|e| e.value().clone())
    }

    fn lane_unchecked(&self, resource_id: &str) -> SharedLane {
        self.lanes
            .entry(resource_id.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(LaneState::new(resource_id.to_string()))))
            .value()
            .clone()
    }

    /// Get or create the lane for a resource, bounded by the per-tenant limit.
    pub(super) fn lane(&self, resource_id: &str) -> Result<SharedLane, EngineError> {
        if let Some(lane) = self.get_lane(resource_id) {
            return Ok(lane);
        }
        if self.lanes.len() >= MAX_RESOURCES_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many resources"));
        }
        Ok(self.lane_unchecked(resource_id))
    }

    /// Snapshot of every lane handle, so no DashMap shard is held across an await.
    pub(super) fn all_lanes(&self) -> Vec<SharedLane> {
        self.lanes.iter().map(|e| e.value().clone()).collect()
    }

    /// Rewrite the WAL as the smallest event list that rebuilds live state.
    /// Ended-lease tombstones are not carried over. No append can land
    /// between the snapshot and the swap.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _exclusive = self.compaction.write().await;
        let mut events: Vec<Event> = self
            .resources
            .iter()
            .map(|e| Event::ResourceRegistered {
                id: e.key().clone(),
                name: e.value().name.clone(),
            })
            .collect();

        for lane in self.all_lanes() {
            let guard = lane.read().await;
            for lease in guard.leases.values() {
                events.push(Event::LeaseAcquired {
                    lease: lease.clone(),
                });
            }
            for entry in &guard.entries {
                events.push(Event::EntryAppended {
                    entry: entry.clone(),
                });
            }
            if let Some(completion) = &guard.completion {
                events.push(Event::CompletionMarked {
                    resource_id: guard.resource_id.clone(),
                    completion: completion.clone(),
                });
            }
        }

        self.wal_request(|response| WalCommand::Compact { events, response })
            .await?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        self.wal_request(|response| WalCommand::AppendsSinceCompact { response })
            .await
            .unwrap_or(0)
    }
}

pub(super) fn validate_resource_id(id: &str) -> Result<(), EngineError> {
    if id.trim().is_empty() {
        return Err(EngineError::Invalid("resource id is required".into()));
    }
    if id.len() > MAX_RESOURCE_ID_LEN {
        return Err(EngineError::LimitExceeded("resource id too long"));
    }
    Ok(())
}

pub(super) fn validate_holder(holder: &str) -> Result<(), EngineError> {
    if holder.trim().is_empty() {
        return Err(EngineError::Invalid("holder identity is required".into()));
    }
    if holder.len() > MAX_HOLDER_LEN {
        return Err(EngineError::LimitExceeded("holder identity too long"));
    }
    Ok(())
}
