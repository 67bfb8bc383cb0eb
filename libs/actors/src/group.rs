//! # Cooperative Groups
//!
//! A cooperative group is a set of actors created and destroyed as a unit.
//!
//! ```text
//!  Creating ──▶ Active ──▶ Destroying ──▶ Terminated
//!     │                                       ▲
//!     └──── construction failure (discarded) ─┘ (no notification)
//! ```
//!
//! `registered` fires once, after every member was constructed and
//! subscribed. `deregistered` fires once, after every member unsubscribed
//! and exited and every child group terminated. Both are driven by a
//! completion counter guarded by the group's state mutex; whichever caller
//! observes the counter reach zero while the group is Destroying performs the
//! transition to Terminated, so the notification cannot fire twice.

use crate::actor::{Actor, ActorFactory, MemberFactory};
use crate::address::Address;
use crate::error::Result;
use crate::registry::{ActorId, GroupId};
use crate::system::ActorSystem;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::trace;

/// Lifecycle status of a group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GroupStatus {
    Creating,
    Active,
    Destroying,
    Terminated,
}

/// Why a group was deregistered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeregReason {
    Normal,
    Shutdown,
    /// The parent group is being deregistered
    ParentDeregistration,
    UserDefined(i32),
}

/// Identity of a registered group
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupHandle {
    id: GroupId,
    name: Arc<str>,
    size: usize,
}

impl GroupHandle {
    pub(crate) fn new(id: GroupId, name: String, size: usize) -> Self {
        Self {
            id,
            name: Arc::from(name),
            size,
        }
    }

    pub fn id(&self) -> GroupId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of member actors
    pub fn size(&self) -> usize {
        self.size
    }
}

impl fmt::Display for GroupHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.id)
    }
}

/// Receives a group's lifecycle notifications, each at most once
pub trait GroupObserver: Send + Sync {
    fn on_registered(&self, group: &GroupHandle);
    fn on_deregistered(&self, group: &GroupHandle, reason: DeregReason);
}

impl<T: GroupObserver + ?Sized> GroupObserver for Arc<T> {
    fn on_registered(&self, group: &GroupHandle) {
        (**self).on_registered(group)
    }

    fn on_deregistered(&self, group: &GroupHandle, reason: DeregReason) {
        (**self).on_deregistered(group, reason)
    }
}

/// Sent to an observing actor once its group became Active
#[derive(Debug, Clone)]
pub struct GroupRegistered {
    pub group: GroupHandle,
}

/// Sent to an observing actor once its group terminated
#[derive(Debug, Clone)]
pub struct GroupDeregistered {
    pub group: GroupHandle,
    pub reason: DeregReason,
}

impl GroupObserver for Address {
    fn on_registered(&self, group: &GroupHandle) {
        self.send(GroupRegistered {
            group: group.clone(),
        });
    }

    fn on_deregistered(&self, group: &GroupHandle, reason: DeregReason) {
        self.send(GroupDeregistered {
            group: group.clone(),
            reason,
        });
    }
}

/// Describes a group to register with [`ActorSystem::register_group`]
pub struct GroupBuilder {
    name: String,
    factories: Vec<Box<dyn MemberFactory>>,
    observers: Vec<Arc<dyn GroupObserver>>,
    parent: Option<GroupId>,
}

impl GroupBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            factories: Vec::new(),
            observers: Vec::new(),
            parent: None,
        }
    }

    /// Add an already built actor
    pub fn add_actor<A: Actor>(self, actor: A) -> Self {
        self.add_actor_with(move || Ok(actor))
    }

    /// Add an actor built by `factory` during registration; an error aborts
    /// the whole group
    pub fn add_actor_with<A, F>(mut self, factory: F) -> Self
    where
        A: Actor,
        F: FnOnce() -> Result<A> + Send + 'static,
    {
        self.factories.push(Box::new(ActorFactory::new(factory)));
        self
    }

    pub fn observe(mut self, observer: impl GroupObserver + 'static) -> Self {
        self.observers.push(Arc::new(observer));
        self
    }

    /// Register as a child; the parent terminates only after this group
    pub fn child_of(mut self, parent: &GroupHandle) -> Self {
        self.parent = Some(parent.id());
        self
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    #[allow(clippy::type_complexity)]
    pub(crate) fn into_parts(
        self,
    ) -> (
        String,
        Vec<Box<dyn MemberFactory>>,
        Vec<Arc<dyn GroupObserver>>,
        Option<GroupId>,
    ) {
        (self.name, self.factories, self.observers, self.parent)
    }
}

impl fmt::Debug for GroupBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroupBuilder")
            .field("name", &self.name)
            .field("members", &self.factories.len())
            .field("observers", &self.observers.len())
            .field("parent", &self.parent)
            .finish()
    }
}

/// What a caller must do after a group entered Destroying
pub(crate) struct Teardown {
    pub members: Vec<Address>,
    pub children: Vec<GroupId>,
    /// Nothing left to wait for; the caller completes the group
    pub terminated: bool,
}

struct GroupState {
    status: GroupStatus,
    remaining_members: usize,
    live_children: usize,
    children: Vec<GroupId>,
    reason: Option<DeregReason>,
}

impl GroupState {
    /// Move Destroying to Terminated once nothing is outstanding
    fn try_terminate(&mut self) -> bool {
        if self.status == GroupStatus::Destroying
            && self.remaining_members == 0
            && self.live_children == 0
        {
            self.status = GroupStatus::Terminated;
            true
        } else {
            false
        }
    }
}

/// Shared lifecycle state of one registered group
pub(crate) struct GroupCore {
    handle: GroupHandle,
    parent: Option<GroupId>,
    observers: Vec<Arc<dyn GroupObserver>>,
    members: Vec<Address>,
    state: Mutex<GroupState>,
}

impl GroupCore {
    pub fn new(
        handle: GroupHandle,
        parent: Option<GroupId>,
        observers: Vec<Arc<dyn GroupObserver>>,
        members: Vec<Address>,
    ) -> Self {
        let remaining_members = members.len();
        Self {
            handle,
            parent,
            observers,
            members,
            state: Mutex::new(GroupState {
                status: GroupStatus::Creating,
                remaining_members,
                live_children: 0,
                children: Vec::new(),
                reason: None,
            }),
        }
    }

    pub fn handle(&self) -> &GroupHandle {
        &self.handle
    }

    pub fn parent(&self) -> Option<GroupId> {
        self.parent
    }

    pub fn status(&self) -> GroupStatus {
        self.state.lock().status
    }

    pub fn reason(&self) -> Option<DeregReason> {
        self.state.lock().reason
    }

    /// Creating to Active, then notify observers
    pub fn activate(&self) {
        {
            let mut state = self.state.lock();
            debug_assert_eq!(state.status, GroupStatus::Creating);
            state.status = GroupStatus::Active;
        }
        for observer in &self.observers {
            observer.on_registered(&self.handle);
        }
    }

    /// Count a child that is about to be constructed; fails unless Active
    pub fn reserve_child(&self) -> bool {
        let mut state = self.state.lock();
        if state.status != GroupStatus::Active {
            return false;
        }
        state.live_children += 1;
        true
    }

    pub fn attach_child(&self, child: GroupId) {
        self.state.lock().children.push(child);
    }

    /// Returns `true` if this completed the group
    pub fn child_finished(&self, child: GroupId) -> bool {
        let mut state = self.state.lock();
        state.children.retain(|id| *id != child);
        state.live_children = state.live_children.saturating_sub(1);
        state.try_terminate()
    }

    /// Returns `true` if this completed the group
    pub fn member_finished(&self) -> bool {
        let mut state = self.state.lock();
        state.remaining_members = state.remaining_members.saturating_sub(1);
        trace!(
            group = %self.handle.name,
            remaining = state.remaining_members,
            "Group member finished"
        );
        state.try_terminate()
    }

    /// Active to Destroying; `None` for any other status
    pub fn begin_destroy(&self, reason: DeregReason) -> Option<Teardown> {
        let mut state = self.state.lock();
        if state.status != GroupStatus::Active {
            return None;
        }
        state.status = GroupStatus::Destroying;
        state.reason = Some(reason);
        Some(Teardown {
            members: self.members.clone(),
            children: state.children.clone(),
            terminated: state.try_terminate(),
        })
    }

    pub fn notify_deregistered(&self, reason: DeregReason) {
        for observer in &self.observers {
            observer.on_deregistered(&self.handle, reason);
        }
    }
}

/// Exit guard held by a running member.
///
/// Dropping it (normal exit or panic unwinding) unregisters the actor and
/// counts it out of its group.
pub(crate) struct Membership {
    system: ActorSystem,
    core: Arc<GroupCore>,
    actor_id: ActorId,
}

impl Membership {
    pub fn new(system: ActorSystem, core: Arc<GroupCore>, actor_id: ActorId) -> Self {
        Self {
            system,
            core,
            actor_id,
        }
    }
}

impl Drop for Membership {
    fn drop(&mut self) {
        self.system.registry().unregister_actor(&self.actor_id);
        self.system
            .metrics()
            .actors_stopped
            .fetch_add(1, Ordering::Relaxed);
        self.system.member_exited(&self.core);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl GroupObserver for Recorder {
        fn on_registered(&self, group: &GroupHandle) {
            self.events.lock().push(format!("registered {}", group.name()));
        }

        fn on_deregistered(&self, group: &GroupHandle, reason: DeregReason) {
            self.events
                .lock()
                .push(format!("deregistered {} {:?}", group.name(), reason));
        }
    }

    fn core(members: usize, recorder: &Arc<Recorder>) -> GroupCore {
        let addresses = (0..members).map(|_| Address::new(ActorId::new()).0).collect();
        GroupCore::new(
            GroupHandle::new(GroupId::next(), "unit".to_string(), members),
            None,
            vec![Arc::clone(recorder) as Arc<dyn GroupObserver>],
            addresses,
        )
    }

    #[test]
    fn test_completion_counter_terminates_once() {
        let recorder = Arc::new(Recorder::default());
        let core = core(3, &recorder);
        core.activate();

        assert!(!core.member_finished());
        let teardown = core.begin_destroy(DeregReason::Normal).unwrap();
        assert!(!teardown.terminated);
        assert_eq!(teardown.members.len(), 3);

        assert!(!core.member_finished());
        assert!(core.member_finished());
        assert_eq!(core.status(), GroupStatus::Terminated);

        // Late calls cannot terminate again
        assert!(!core.member_finished());
        assert!(core.begin_destroy(DeregReason::Shutdown).is_none());
        assert_eq!(core.reason(), Some(DeregReason::Normal));
    }

    #[test]
    fn test_children_hold_parent_open() {
        let recorder = Arc::new(Recorder::default());
        let core = core(0, &recorder);
        assert!(!core.reserve_child());

        core.activate();
        assert!(core.reserve_child());
        let child = GroupId::next();
        core.attach_child(child);

        let teardown = core.begin_destroy(DeregReason::Normal).unwrap();
        assert_eq!(teardown.children, vec![child]);
        assert!(!teardown.terminated);
        assert!(!core.reserve_child());

        assert!(core.child_finished(child));
        assert_eq!(core.status(), GroupStatus::Terminated);
    }

    #[test]
    fn test_address_observer_sends_notifications() {
        let (address, mut receiver) = Address::new(ActorId::new());
        let handle = GroupHandle::new(GroupId::next(), "observed".to_string(), 2);

        address.on_registered(&handle);
        address.on_deregistered(&handle, DeregReason::UserDefined(7));

        let first = match receiver.try_recv().unwrap() {
            crate::address::Delivery::Message(envelope) => envelope,
            other => panic!("unexpected delivery: {:?}", other),
        };
        assert_eq!(first.payload::<GroupRegistered>().unwrap().group, handle);

        let second = match receiver.try_recv().unwrap() {
            crate::address::Delivery::Message(envelope) => envelope,
            other => panic!("unexpected delivery: {:?}", other),
        };
        let deregistered = second.payload::<GroupDeregistered>().unwrap();
        assert_eq!(deregistered.reason, DeregReason::UserDefined(7));
    }

    #[test]
    fn test_observer_order() {
        let recorder = Arc::new(Recorder::default());
        let core = core(1, &recorder);
        core.activate();
        core.begin_destroy(DeregReason::Shutdown).unwrap();
        assert!(core.member_finished());
        core.notify_deregistered(DeregReason::Shutdown);

        let events = recorder.events.lock().clone();
        assert_eq!(events, vec!["registered unit", "deregistered unit Shutdown"]);
    }
}
