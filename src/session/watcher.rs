use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast::{self, error::TryRecvError};

use super::service::LeaseService;
use crate::coordinator::CoordinatorError;
use crate::engine::Engine;
use crate::model::{Event, Lease};

/// Source of lease visibility for a session. Swapping the implementation
/// (poll vs push) leaves the controller untouched.
#[async_trait]
pub trait LeaseWatcher: Send {
    /// Called when the session moves to a new resource.
    async fn watch(&mut self, _resource_id: &str) {}

    async fn poll(&mut self) -> Result<Vec<Lease>, CoordinatorError>;
}

/// Request/response visibility: every poll asks the service for all live leases.
pub struct PollingWatcher<S> {
    service: Arc<S>,
}

impl<S: LeaseService> PollingWatcher<S> {
    pub fn new(service: Arc<S>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl<S: LeaseService> LeaseWatcher for PollingWatcher<S> {
    async fn poll(&mut self) -> Result<Vec<Lease>, CoordinatorError> {
        self.service.list_active_leases().await
    }
}

/// Push visibility for an in-process engine: re-reads leases only after the
/// notify hub reports a change on the watched resource.
///
/// Expiry emits no event, so cached leases are re-filtered against the clock
/// on every poll.
pub struct NotifyWatcher {
    engine: Arc<Engine>,
    resource_id: Option<String>,
    rx: Option<broadcast::Receiver<Event>>,
    cache: Option<Vec<Lease>>,
}

impl NotifyWatcher {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            resource_id: None,
            rx: None,
            cache: None,
        }
    }

    fn drain(&mut self) -> bool {
        let Some(rx) = self.rx.as_mut() else {
            return false;
        };
        let mut changed = false;
        loop {
            match rx.try_recv() {
                Ok(_) | Err(TryRecvError::Lagged(_)) => changed = true,
                Err(TryRecvError::Empty) => return changed,
                Err(TryRecvError::Closed) => {
                    self.rx = None;
                    return true;
                }
            }
        }
    }
}

#[async_trait]
impl LeaseWatcher for NotifyWatcher {
    async fn watch(&mut self, resource_id: &str) {
        if self.resource_id.as_deref() == Some(resource_id) {
            return;
        }
        self.rx = Some(self.engine.notify.subscribe(resource_id));
        self.resource_id = Some(resource_id.to_string());
        self.cache = None;
    }

    async fn poll(&mut self) -> Result<Vec<Lease>, CoordinatorError> {
        let Some(resource_id) = self.resource_id.clone() else {
            return Ok(self.engine.list_active().await);
        };
        if self.drain() || self.cache.is_none() {
            let leases = self
                .engine
                .list_active()
                .await
                .into_iter()
                .filter(|l| l.resource_id == resource_id)
                .collect();
            self.cache = Some(leases);
        }
        let now = self.engine.clock.now_ms();
        Ok(self
            .cache
            .iter()
            .flatten()
            .filter(|l| l.is_live(now))
            .cloned()
            .collect())
    }
}
