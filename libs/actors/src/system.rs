//! Actor System Core
//!
//! The [`ActorSystem`] is the explicit runtime handle: it creates mailboxes,
//! registers and deregisters cooperative groups, owns the live-actor registry
//! and the system-wide metrics, and reports when the last group has gone.
//! There is no process-global environment; every actor reaches the system
//! through its [`Context`](crate::actor::Context).
//!
//! # Group Registration
//!
//! ```text
//!  register_group(builder)
//!     │
//!     ├─ parent Active? ──── no ──▶ Err(ParentNotActive)
//!     │
//!     ├─ construct members in order (factory, define, subscribe)
//!     │      └─ failure ──▶ discard built members, Err(Construction)
//!     │
//!     ├─ status Active, live group count + 1
//!     ├─ observers: on_registered
//!     └─ spawn member tasks
//! ```
//!
//! # Lock Ordering
//!
//! A group's state mutex is never held while calling into another group, a
//! mailbox or an observer. The `groups` map is only touched through short
//! `DashMap` lookups whose guards are dropped before any group is locked.

use crate::actor::{Member, MemberEnv, MemberFactory};
use crate::config::SystemSettings;
use crate::error::{ActorError, Result};
use crate::group::{DeregReason, GroupBuilder, GroupCore, GroupHandle, GroupStatus, Membership};
use crate::mailbox::Mailbox;
use crate::registry::{ActorRegistry, GroupId};
use crate::subscription::IndexPolicy;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// System-wide counters
#[derive(Debug, Default)]
pub struct SystemMetrics {
    pub actors_spawned: AtomicU64,
    pub actors_stopped: AtomicU64,
    pub messages_handled: AtomicU64,
    pub ignored_messages: AtomicU64,
    pub handler_failures: AtomicU64,

    // Mailbox metrics
    pub messages_published: AtomicU64,
    pub deliveries: AtomicU64,
    pub index_switches_up: AtomicU64,
    pub index_switches_down: AtomicU64,

    // Group lifecycle metrics
    pub groups_registered: AtomicU64,
    pub groups_deregistered: AtomicU64,
    pub construction_failures: AtomicU64,
}

impl SystemMetrics {
    /// Record the outcome of one dispatched message
    pub fn record_dispatch(&self, handled: bool) {
        if handled {
            self.messages_handled.fetch_add(1, Ordering::Relaxed);
        } else {
            self.ignored_messages.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_handler_failure(&self) {
        self.handler_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Average deliveries per publish
    pub fn avg_fan_out(&self) -> f64 {
        let published = self.messages_published.load(Ordering::Relaxed);
        if published == 0 {
            return 0.0;
        }
        self.deliveries.load(Ordering::Relaxed) as f64 / published as f64
    }

    /// Get metrics snapshot
    pub fn get_stats(&self) -> SystemStats {
        SystemStats {
            actors_spawned: self.actors_spawned.load(Ordering::Relaxed),
            actors_stopped: self.actors_stopped.load(Ordering::Relaxed),
            messages_handled: self.messages_handled.load(Ordering::Relaxed),
            ignored_messages: self.ignored_messages.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
            messages_published: self.messages_published.load(Ordering::Relaxed),
            deliveries: self.deliveries.load(Ordering::Relaxed),
            avg_fan_out: self.avg_fan_out(),
            index_switches_up: self.index_switches_up.load(Ordering::Relaxed),
            index_switches_down: self.index_switches_down.load(Ordering::Relaxed),
            groups_registered: self.groups_registered.load(Ordering::Relaxed),
            groups_deregistered: self.groups_deregistered.load(Ordering::Relaxed),
            construction_failures: self.construction_failures.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`SystemMetrics`]
#[derive(Debug, Clone, Serialize)]
pub struct SystemStats {
    pub actors_spawned: u64,
    pub actors_stopped: u64,
    pub messages_handled: u64,
    pub ignored_messages: u64,
    pub handler_failures: u64,
    pub messages_published: u64,
    pub deliveries: u64,
    pub avg_fan_out: f64,
    pub index_switches_up: u64,
    pub index_switches_down: u64,
    pub groups_registered: u64,
    pub groups_deregistered: u64,
    pub construction_failures: u64,
}

/// Core actor system managing group lifecycles
#[derive(Clone)]
pub struct ActorSystem {
    inner: Arc<SystemInner>,
}

struct SystemInner {
    /// System ID for debugging
    system_id: String,
    settings: SystemSettings,
    policy: IndexPolicy,
    /// Registered groups (Active or Destroying)
    groups: DashMap<GroupId, Arc<GroupCore>>,
    registry: ActorRegistry,
    metrics: Arc<SystemMetrics>,
    live_groups: watch::Sender<usize>,
}

impl ActorSystem {
    /// Create a system whose mailboxes use the default index policy
    pub fn new(settings: SystemSettings) -> Self {
        Self::with_policy(settings, IndexPolicy::default())
    }

    pub fn with_policy(settings: SystemSettings, policy: IndexPolicy) -> Self {
        let system_id = format!("{}-{}", settings.name, Uuid::new_v4().simple());
        info!(
            system_id = %system_id,
            compact_limit = policy.compact_limit,
            low_water_divisor = policy.low_water_divisor,
            "Creating new actor system"
        );

        let (live_groups, _) = watch::channel(0);
        Self {
            inner: Arc::new(SystemInner {
                system_id,
                settings,
                policy,
                groups: DashMap::new(),
                registry: ActorRegistry::new(),
                metrics: Arc::new(SystemMetrics::default()),
                live_groups,
            }),
        }
    }

    pub fn system_id(&self) -> &str {
        &self.inner.system_id
    }

    pub fn settings(&self) -> &SystemSettings {
        &self.inner.settings
    }

    /// Create a broadcast mailbox sharing this system's policy and metrics
    pub fn create_mailbox(&self, name: impl Into<String>) -> Mailbox {
        Mailbox::with_metrics(name, self.inner.policy, Arc::clone(&self.inner.metrics))
    }

    /// Construct and start a group.
    ///
    /// Members are constructed in order and subscribe during construction.
    /// If any member fails, the members built so far are torn down before
    /// this returns and no observer is notified. Must be called from within
    /// a Tokio runtime, since member tasks are spawned on success.
    pub fn register_group(&self, builder: GroupBuilder) -> Result<GroupHandle> {
        let (name, factories, observers, parent_id) = builder.into_parts();
        let started = Instant::now();

        let parent = match parent_id {
            Some(parent_id) => {
                let parent = self
                    .group_core(parent_id)
                    .ok_or(ActorError::ParentNotActive { parent: parent_id })?;
                if !parent.reserve_child() {
                    return Err(ActorError::ParentNotActive { parent: parent_id });
                }
                Some(parent)
            }
            None => None,
        };

        let handle = GroupHandle::new(GroupId::next(), name, factories.len());
        debug!(
            group = %handle.name(),
            group_id = %handle.id(),
            members = handle.size(),
            "Constructing cooperative group"
        );

        let env = MemberEnv {
            system: self,
            group: &handle,
        };
        let mut members = Vec::with_capacity(factories.len());
        for (index, factory) in factories.into_iter().enumerate() {
            match factory.construct(&env) {
                Ok(member) => members.push(member),
                Err(source) => {
                    // Reverse order so later members release first
                    for member in members.into_iter().rev() {
                        member.discard();
                    }
                    if let Some(parent) = &parent {
                        self.release_child(parent, handle.id());
                    }
                    self.inner
                        .metrics
                        .construction_failures
                        .fetch_add(1, Ordering::Relaxed);
                    warn!(
                        group = %handle.name(),
                        member = index,
                        error = %source,
                        error_category = source.category(),
                        "Group construction failed, partial group discarded"
                    );
                    return Err(ActorError::Construction {
                        group: handle.name().to_string(),
                        member: index,
                        source: Box::new(source),
                    });
                }
            }
        }

        let addresses = members.iter().map(|member| member.address()).collect();
        let core = Arc::new(GroupCore::new(
            handle.clone(),
            parent.as_ref().map(|p| p.handle().id()),
            observers,
            addresses,
        ));
        if let Some(parent) = &parent {
            parent.attach_child(handle.id());
        }

        self.inner.groups.insert(handle.id(), Arc::clone(&core));
        self.inner.live_groups.send_modify(|count| *count += 1);
        self.inner.metrics.groups_registered.fetch_add(1, Ordering::Relaxed);
        core.activate();

        for member in members {
            let membership = Membership::new(self.clone(), Arc::clone(&core), member.id());
            member.start(membership);
        }

        info!(
            group = %handle.name(),
            group_id = %handle.id(),
            members = handle.size(),
            registration_us = started.elapsed().as_micros() as u64,
            "Cooperative group registered"
        );

        // Parent began tearing down while this child was being built
        if let Some(parent) = &parent {
            if parent.status() != GroupStatus::Active {
                self.deregister_group(&handle, DeregReason::ParentDeregistration);
            }
        }
        Ok(handle)
    }

    /// Begin tearing down a group; groups that are not Active are left alone
    pub fn deregister_group(&self, handle: &GroupHandle, reason: DeregReason) {
        let Some(core) = self.group_core(handle.id()) else {
            debug!(
                group = %handle.name(),
                group_id = %handle.id(),
                "Deregistration of unknown group ignored"
            );
            return;
        };

        let Some(teardown) = core.begin_destroy(reason) else {
            debug!(
                group = %handle.name(),
                status = ?core.status(),
                "Group is not active, deregistration ignored"
            );
            return;
        };

        debug!(
            group = %handle.name(),
            group_id = %handle.id(),
            ?reason,
            members = teardown.members.len(),
            children = teardown.children.len(),
            "Deregistering cooperative group"
        );

        for child in teardown.children {
            if let Some(child) = self.group_core(child) {
                self.deregister_group(child.handle(), DeregReason::ParentDeregistration);
            }
        }
        for address in &teardown.members {
            address.request_stop(reason);
        }
        if teardown.terminated {
            self.complete_group(&core);
        }
    }

    /// Status of a registered group; `None` once it has terminated
    pub fn group_status(&self, group: GroupId) -> Option<GroupStatus> {
        self.group_core(group).map(|core| core.status())
    }

    /// Groups registered and not yet terminated
    pub fn live_group_count(&self) -> usize {
        *self.inner.live_groups.borrow()
    }

    pub fn live_actor_count(&self) -> usize {
        self.inner.registry.total_actors()
    }

    pub fn registry(&self) -> &ActorRegistry {
        &self.inner.registry
    }

    /// Get system metrics
    pub fn metrics(&self) -> Arc<SystemMetrics> {
        Arc::clone(&self.inner.metrics)
    }

    /// Resolve once no group is registered
    pub async fn wait_until_idle(&self) {
        let mut receiver = self.inner.live_groups.subscribe();
        // The sender lives as long as `self`, so this only returns on idle
        let _ = receiver.wait_for(|count| *count == 0).await;
    }

    /// Deregister every group with [`DeregReason::Shutdown`] and wait for
    /// all of them to terminate
    pub async fn shutdown(&self) {
        let handles: Vec<GroupHandle> = self
            .inner
            .groups
            .iter()
            .map(|entry| entry.value().handle().clone())
            .collect();
        info!(
            system_id = %self.inner.system_id,
            groups = handles.len(),
            "Shutting down actor system"
        );

        for handle in &handles {
            self.deregister_group(handle, DeregReason::Shutdown);
        }
        self.wait_until_idle().await;

        info!(system_id = %self.inner.system_id, "Actor system shutdown complete");
    }

    /// Called from a member's exit guard
    pub(crate) fn member_exited(&self, core: &Arc<GroupCore>) {
        if core.member_finished() {
            self.complete_group(core);
        }
    }

    fn release_child(&self, parent: &Arc<GroupCore>, child: GroupId) {
        if parent.child_finished(child) {
            self.complete_group(parent);
        }
    }

    /// Final step of a group: runs exactly once, after the transition to
    /// Terminated
    fn complete_group(&self, core: &Arc<GroupCore>) {
        let handle = core.handle();
        self.inner.groups.remove(&handle.id());
        self.inner.metrics.groups_deregistered.fetch_add(1, Ordering::Relaxed);

        let reason = core.reason().unwrap_or(DeregReason::Normal);
        info!(
            group = %handle.name(),
            group_id = %handle.id(),
            ?reason,
            "Cooperative group deregistered"
        );
        core.notify_deregistered(reason);

        if let Some(parent) = core.parent().and_then(|id| self.group_core(id)) {
            self.release_child(&parent, handle.id());
        }
        self.inner
            .live_groups
            .send_modify(|count| *count = count.saturating_sub(1));
    }

    fn group_core(&self, group: GroupId) -> Option<Arc<GroupCore>> {
        self.inner.groups.get(&group).map(|entry| Arc::clone(entry.value()))
    }
}

impl Default for ActorSystem {
    fn default() -> Self {
        Self::new(SystemSettings::default())
    }
}

impl std::fmt::Debug for ActorSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActorSystem")
            .field("system_id", &self.inner.system_id)
            .field("live_groups", &self.live_group_count())
            .field("live_actors", &self.live_actor_count())
            .finish()
    }
}
