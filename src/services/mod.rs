//! gRPC service implementations speaking the component protocols.

pub mod action;
pub mod discovery;
pub mod event_sourced;
pub mod replicated;
pub mod value_entity;

pub use action::ActionService;
pub use discovery::DiscoveryService;
pub use event_sourced::EventSourcedService;
pub use replicated::ReplicatedEntityService;
pub use value_entity::ValueEntityService;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::proto::Failure;

/// Size of the per-entity inbound frame queue.
pub(crate) const ENTITY_QUEUE_DEPTH: usize = 16;

/// Size of the per-stream outbound reply queue.
pub(crate) const REPLY_QUEUE_DEPTH: usize = 32;

/// A malformed inbound frame. Closes the stream it arrived on.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Stream must begin with an init frame")]
    MissingInit,

    #[error("Duplicate init frame for entity {0}")]
    DuplicateInit(String),

    #[error("Unknown service: {0}")]
    UnknownService(String),

    #[error("Entity {0} already has an active instance")]
    EntityAlreadyActive(String),

    #[error("Frame carries no message")]
    EmptyFrame,
}

impl ProtocolError {
    /// The failure frame reporting this error to the proxy, tied to no
    /// particular command.
    pub(crate) fn to_failure(&self) -> Failure {
        Failure {
            command_id: 0,
            description: self.to_string(),
            grpc_status_code: 0,
        }
    }
}

/// Tracks live entity instances so at most one exists per
/// (service, entity id). The guard releases the slot on drop.
#[derive(Debug, Default)]
pub(crate) struct EntityTracker {
    active: Mutex<HashSet<(String, String)>>,
}

impl EntityTracker {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Claim the slot for an entity, or None when an instance is already
    /// live.
    pub(crate) fn acquire(
        self: &Arc<Self>,
        service_name: &str,
        entity_id: &str,
    ) -> Option<EntityGuard> {
        let key = (service_name.to_string(), entity_id.to_string());
        let mut active = self.active.lock().expect("entity tracker poisoned");
        if !active.insert(key.clone()) {
            return None;
        }
        Some(EntityGuard {
            tracker: Arc::clone(self),
            key,
        })
    }

    #[cfg(test)]
    pub(crate) fn is_active(&self, service_name: &str, entity_id: &str) -> bool {
        self.active
            .lock()
            .expect("entity tracker poisoned")
            .contains(&(service_name.to_string(), entity_id.to_string()))
    }
}

pub(crate) struct EntityGuard {
    tracker: Arc<EntityTracker>,
    key: (String, String),
}

impl Drop for EntityGuard {
    fn drop(&mut self) {
        self.tracker
            .active
            .lock()
            .expect("entity tracker poisoned")
            .remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracker_enforces_single_instance() {
        let tracker = EntityTracker::new();
        let guard = tracker.acquire("svc", "id-1");
        assert!(guard.is_some());
        assert!(tracker.acquire("svc", "id-1").is_none());

        // A different id or service is independent.
        assert!(tracker.acquire("svc", "id-2").is_some());
        assert!(tracker.acquire("svc2", "id-1").is_some());

        drop(guard);
        assert!(tracker.acquire("svc", "id-1").is_some());
    }
}
