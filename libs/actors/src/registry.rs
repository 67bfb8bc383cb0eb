//! Actor Registry
//!
//! Identities for actors, groups and mailboxes, plus bookkeeping of which
//! actors are currently live and which group owns them.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use uuid::Uuid;

/// Unique actor identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActorId {
    id: Uuid,
}

impl ActorId {
    /// Create new actor ID
    pub fn new() -> Self {
        Self { id: Uuid::new_v4() }
    }

    /// Create from UUID
    pub fn from_uuid(id: Uuid) -> Self {
        Self { id }
    }

    /// Get UUID
    pub fn uuid(&self) -> Uuid {
        self.id
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "actor-{}", self.id.simple())
    }
}

impl Default for ActorId {
    fn default() -> Self {
        Self::new()
    }
}

static NEXT_GROUP_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_MAILBOX_ID: AtomicU64 = AtomicU64::new(1);

/// Cooperative group identifier, unique within the process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize)]
pub struct GroupId(u64);

impl GroupId {
    pub(crate) fn next() -> Self {
        Self(NEXT_GROUP_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "group-{}", self.0)
    }
}

/// Mailbox identifier, unique within the process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MailboxId(u64);

impl MailboxId {
    pub(crate) fn next() -> Self {
        Self(NEXT_MAILBOX_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for MailboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mbox-{}", self.0)
    }
}

/// Actor status as seen by the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorStatus {
    /// Constructed and subscribed, task not yet running
    Constructed,
    Running,
    /// Stop requested, draining already queued deliveries
    Stopping,
}

/// Registry entry for one live actor
#[derive(Debug, Clone)]
pub struct ActorEntry {
    pub group: GroupId,
    pub status: ActorStatus,
    pub registered_at: Instant,
}

/// Live actor bookkeeping
#[derive(Debug, Default)]
pub struct ActorRegistry {
    actors: RwLock<HashMap<ActorId, ActorEntry>>,
}

impl ActorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly constructed actor
    pub fn register_actor(&self, id: ActorId, group: GroupId) {
        tracing::trace!(actor_id = %id, group = %group, "Registering actor");
        self.actors.write().insert(
            id,
            ActorEntry {
                group,
                status: ActorStatus::Constructed,
                registered_at: Instant::now(),
            },
        );
    }

    /// Update status; unknown actors are ignored
    pub fn set_status(&self, id: &ActorId, status: ActorStatus) {
        if let Some(entry) = self.actors.write().get_mut(id) {
            entry.status = status;
        }
    }

    /// Remove actor, returning whether it was present
    pub fn unregister_actor(&self, id: &ActorId) -> bool {
        let removed = self.actors.write().remove(id).is_some();
        if !removed {
            tracing::warn!(actor_id = %id, "Attempted to unregister unknown actor");
        }
        removed
    }

    pub fn find_actor(&self, id: &ActorId) -> Option<ActorEntry> {
        self.actors.read().get(id).cloned()
    }

    pub fn contains_actor(&self, id: &ActorId) -> bool {
        self.actors.read().contains_key(id)
    }

    /// Get total live actor count
    pub fn total_actors(&self) -> usize {
        self.actors.read().len()
    }

    /// Count live actors owned by a group
    pub fn members_of(&self, group: GroupId) -> usize {
        self.actors
            .read()
            .values()
            .filter(|entry| entry.group == group)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_actor_id_creation() {
        let id1 = ActorId::new();
        let id2 = ActorId::new();

        assert_ne!(id1, id2);
        assert_ne!(id1.uuid(), id2.uuid());
        assert!(id1.to_string().starts_with("actor-"));
    }

    #[test]
    fn test_group_ids_are_monotonic() {
        let a = GroupId::next();
        let b = GroupId::next();
        assert!(b > a);
        assert_eq!(format!("{}", a), format!("group-{}", a.as_u64()));
    }

    #[test]
    fn test_registry_lifecycle() {
        let registry = ActorRegistry::new();
        let group = GroupId::next();
        let other = GroupId::next();
        let a = ActorId::new();
        let b = ActorId::new();
        let c = ActorId::new();

        registry.register_actor(a, group);
        registry.register_actor(b, group);
        registry.register_actor(c, other);
        assert_eq!(registry.total_actors(), 3);
        assert_eq!(registry.members_of(group), 2);

        registry.set_status(&a, ActorStatus::Running);
        assert_eq!(registry.find_actor(&a).unwrap().status, ActorStatus::Running);

        assert!(registry.unregister_actor(&a));
        assert!(!registry.unregister_actor(&a));
        assert!(!registry.contains_actor(&a));
        assert_eq!(registry.members_of(group), 1);
    }
}
