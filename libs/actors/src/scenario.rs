//! # Growth/Shrink Scenario
//!
//! Drives one shared `ping` mailbox from a single subscriber to tens of
//! thousands and back, repeatedly, and checks delivery after every change.
//!
//! ```text
//!  CreatingGroups                              DestroyingGroups
//!  ┌───────────────────────────────┐          ┌───────────────────────────────┐
//!  │ register group (size 1,2,4..) │          │ deregister newest group       │
//!  │   ▼ GroupRegistered           │  max     │   ▼ GroupDeregistered         │
//!  │ publish Ping, count Pongs     │ ───────▶ │ publish Ping, count Pongs     │
//!  │   ▼ barrier complete          │  live    │   ▼ barrier complete          │
//!  │ next group                    │          │ next newest group             │
//!  └───────────────────────────────┘          └──────────────┬────────────────┘
//!                ▲            no groups left, more iterations │
//!                └────────────────────────────────────────────┘
//! ```
//!
//! Responder groups are children of the coordinator's own group. After the
//! last iteration the coordinator deregisters its group, which leaves the
//! system idle.

use crate::actor::{Actor, Context, Definition};
use crate::address::Address;
use crate::config::ScenarioSettings;
use crate::error::{ActorError, Result};
use crate::group::{
    DeregReason, GroupBuilder, GroupDeregistered, GroupHandle, GroupObserver, GroupRegistered,
};
use crate::mailbox::Mailbox;
use crate::message::MessageType;
use crate::registry::GroupId;
use crate::subscription::IndexStats;
use crate::system::ActorSystem;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// Broadcast liveness check
#[derive(Debug, Clone, Copy)]
pub struct Ping;

/// Reply to [`Ping`], sent to the coordinator's address
#[derive(Debug, Clone, Copy)]
pub struct Pong;

/// Coordinator states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    CreatingGroups,
    DestroyingGroups,
    /// Finished or failed; every message is ignored
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponderState {
    Listening,
}

/// Group member answering every `Ping` with a `Pong`
pub struct PingResponder {
    ping: Mailbox,
    coordinator: Address,
}

impl PingResponder {
    pub fn new(ping: Mailbox, coordinator: Address) -> Self {
        Self { ping, coordinator }
    }
}

impl Actor for PingResponder {
    type State = ResponderState;

    fn initial_state(&self) -> ResponderState {
        ResponderState::Listening
    }

    fn define(&mut self, def: &mut Definition<Self>) -> Result<()> {
        def.subscribe::<Ping>(&self.ping)?;
        def.state(ResponderState::Listening)
            .on::<Ping>(|responder, _, _| {
                responder.coordinator.send(Pong);
                Ok(())
            });
        Ok(())
    }
}

/// Counts replies to one broadcast
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReplyBarrier {
    pub expected: usize,
    pub received: usize,
}

impl ReplyBarrier {
    pub fn arm(expected: usize) -> Self {
        Self {
            expected,
            received: 0,
        }
    }

    /// Count one reply; returns `true` exactly when the barrier completes
    pub fn record(&mut self) -> bool {
        self.received += 1;
        self.received == self.expected
    }

    pub fn is_complete(&self) -> bool {
        self.received >= self.expected
    }
}

/// One completed barrier
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BarrierRecord {
    pub iteration: u32,
    pub phase: Phase,
    pub live_groups: usize,
    pub expected: usize,
    pub received: usize,
    /// Ping subscriptions when the broadcast was sent
    pub subscriptions: usize,
}

/// Everything the coordinator observed
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScenarioReport {
    pub iterations_planned: u32,
    pub iterations_completed: u32,
    pub max_live_groups: usize,
    pub peak_subscribers: usize,
    pub barriers: Vec<BarrierRecord>,
    /// Group ids per iteration, in creation order
    pub creation_order: Vec<Vec<GroupId>>,
    /// Group ids per iteration, in teardown order
    pub teardown_order: Vec<Vec<GroupId>>,
    /// Ping index after the run
    pub final_index: Option<IndexStats>,
    pub elapsed_ms: u64,
    pub failure: Option<String>,
}

impl ScenarioReport {
    pub fn new(settings: &ScenarioSettings) -> Self {
        Self {
            iterations_planned: settings.iterations,
            max_live_groups: settings.max_live_groups,
            creation_order: vec![Vec::new()],
            teardown_order: vec![Vec::new()],
            ..Self::default()
        }
    }

    /// Expected reply counts of one iteration, in barrier order
    pub fn barrier_sequence(&self, iteration: u32) -> Vec<usize> {
        self.barriers
            .iter()
            .filter(|barrier| barrier.iteration == iteration)
            .map(|barrier| barrier.expected)
            .collect()
    }

    pub fn is_success(&self) -> bool {
        self.failure.is_none() && self.iterations_completed == self.iterations_planned
    }

    /// Turn a failed or incomplete run into an error
    pub fn into_result(self) -> Result<Self> {
        if let Some(failure) = &self.failure {
            return Err(ActorError::Scenario(failure.clone()));
        }
        if self.iterations_completed < self.iterations_planned {
            return Err(ActorError::Scenario(format!(
                "stopped after {} of {} iterations",
                self.iterations_completed, self.iterations_planned
            )));
        }
        Ok(self)
    }
}

/// Drives the growth/shrink cycle
pub struct GrowthShrinkCoordinator {
    settings: ScenarioSettings,
    ping: Mailbox,
    report: Arc<Mutex<ScenarioReport>>,
    /// Live responder groups, oldest first
    live: Vec<GroupHandle>,
    live_members: usize,
    /// Group whose registration or teardown we are waiting for
    pending: Option<GroupId>,
    iteration: u32,
    barrier: ReplyBarrier,
}

impl GrowthShrinkCoordinator {
    pub fn new(
        settings: ScenarioSettings,
        ping: Mailbox,
        report: Arc<Mutex<ScenarioReport>>,
    ) -> Self {
        Self {
            settings,
            ping,
            report,
            live: Vec::new(),
            live_members: 0,
            pending: None,
            iteration: 0,
            barrier: ReplyBarrier::default(),
        }
    }

    fn create_next_group(&mut self, ctx: &mut Context<Self>) -> Result<()> {
        let index = self.live.len();
        let size = self.settings.group_size(index).ok_or_else(|| {
            ActorError::Scenario(format!("group #{} size overflows", index))
        })?;

        let coordinator = ctx.address().clone();
        let mut builder = GroupBuilder::new(format!("responders-{}-{}", self.iteration, index))
            .child_of(ctx.group())
            .observe(coordinator.clone());
        for _ in 0..size {
            builder = builder.add_actor(PingResponder::new(self.ping.clone(), coordinator.clone()));
        }

        let handle = ctx.system().register_group(builder)?;
        debug!(group = %handle.name(), size, "Responder group created");
        self.pending = Some(handle.id());
        if let Some(order) = self.report.lock().creation_order.last_mut() {
            order.push(handle.id());
        }
        Ok(())
    }

    fn destroy_newest_group(&mut self, ctx: &mut Context<Self>) -> Result<()> {
        let handle = self
            .live
            .pop()
            .ok_or_else(|| ActorError::Scenario("no live group to destroy".to_string()))?;
        self.live_members -= handle.size();
        self.pending = Some(handle.id());
        if let Some(order) = self.report.lock().teardown_order.last_mut() {
            order.push(handle.id());
        }

        debug!(group = %handle.name(), remaining = self.live.len(), "Destroying responder group");
        ctx.system().deregister_group(&handle, DeregReason::Normal);
        Ok(())
    }

    /// Broadcast a ping to every live responder
    fn start_barrier(&mut self) -> Result<()> {
        let subscriptions = self.ping.subscriber_count(MessageType::of::<Ping>());
        if subscriptions != self.live_members {
            return Err(ActorError::Scenario(format!(
                "{} live responders but {} ping subscriptions",
                self.live_members, subscriptions
            )));
        }

        self.barrier = ReplyBarrier::arm(self.live_members);
        let delivered = self.ping.publish(Ping);
        if delivered != self.live_members {
            return Err(ActorError::Scenario(format!(
                "ping delivered to {} of {} responders",
                delivered, self.live_members
            )));
        }

        let mut report = self.report.lock();
        report.peak_subscribers = report.peak_subscribers.max(subscriptions);
        Ok(())
    }

    fn record_barrier(&self, phase: Phase) {
        let record = BarrierRecord {
            iteration: self.iteration,
            phase,
            live_groups: self.live.len(),
            expected: self.barrier.expected,
            received: self.barrier.received,
            subscriptions: self.live_members,
        };
        debug!(
            iteration = record.iteration,
            phase = ?record.phase,
            live_groups = record.live_groups,
            replies = record.received,
            "Barrier complete"
        );
        self.report.lock().barriers.push(record);
    }

    fn on_group_registered(
        &mut self,
        msg: &GroupRegistered,
        _ctx: &mut Context<Self>,
    ) -> Result<()> {
        if self.pending != Some(msg.group.id()) {
            warn!(group = %msg.group, "Unexpected group registration ignored");
            return Ok(());
        }
        self.pending = None;
        self.live_members += msg.group.size();
        self.live.push(msg.group.clone());
        self.start_barrier()
    }

    fn on_pong_while_growing(&mut self, _: &Pong, ctx: &mut Context<Self>) -> Result<()> {
        if !self.barrier.record() {
            return Ok(());
        }
        self.record_barrier(Phase::CreatingGroups);

        if self.live.len() >= self.settings.max_live_groups {
            ctx.transition(Phase::DestroyingGroups);
            self.destroy_newest_group(ctx)
        } else {
            self.create_next_group(ctx)
        }
    }

    fn on_group_deregistered(
        &mut self,
        msg: &GroupDeregistered,
        ctx: &mut Context<Self>,
    ) -> Result<()> {
        if self.pending != Some(msg.group.id()) {
            warn!(
                group = %msg.group,
                reason = ?msg.reason,
                "Unexpected group deregistration ignored"
            );
            return Ok(());
        }
        self.pending = None;

        if self.live.is_empty() {
            self.finish_iteration(ctx)
        } else {
            self.start_barrier()
        }
    }

    fn on_pong_while_shrinking(&mut self, _: &Pong, ctx: &mut Context<Self>) -> Result<()> {
        if !self.barrier.record() {
            return Ok(());
        }
        self.record_barrier(Phase::DestroyingGroups);
        self.destroy_newest_group(ctx)
    }

    fn finish_iteration(&mut self, ctx: &mut Context<Self>) -> Result<()> {
        self.iteration += 1;
        info!(
            iteration = self.iteration,
            of = self.settings.iterations,
            "Growth/shrink iteration complete"
        );

        {
            let mut report = self.report.lock();
            report.iterations_completed = self.iteration;
            if self.iteration < self.settings.iterations {
                report.creation_order.push(Vec::new());
                report.teardown_order.push(Vec::new());
            }
        }

        if self.iteration < self.settings.iterations {
            ctx.transition(Phase::CreatingGroups);
            self.create_next_group(ctx)
        } else {
            ctx.transition(Phase::Stopped);
            ctx.deregister_own_group(DeregReason::Normal);
            Ok(())
        }
    }

    /// Run one step; a failure is recorded and stops the scenario
    fn guarded<M>(
        &mut self,
        msg: &M,
        ctx: &mut Context<Self>,
        step: fn(&mut Self, &M, &mut Context<Self>) -> Result<()>,
    ) -> Result<()> {
        let result = step(self, msg, ctx);
        if let Err(e) = &result {
            error!(iteration = self.iteration, error = %e, "Scenario step failed");
            {
                let mut report = self.report.lock();
                if report.failure.is_none() {
                    report.failure = Some(match e {
                        ActorError::Scenario(reason) => reason.clone(),
                        other => other.to_string(),
                    });
                }
            }
            // Children go down with the coordinator's group
            ctx.transition(Phase::Stopped);
            ctx.deregister_own_group(DeregReason::UserDefined(1));
        }
        result
    }
}

impl Actor for GrowthShrinkCoordinator {
    type State = Phase;

    fn initial_state(&self) -> Phase {
        Phase::CreatingGroups
    }

    fn define(&mut self, def: &mut Definition<Self>) -> Result<()> {
        def.state(Phase::CreatingGroups)
            .on::<GroupRegistered>(|c, msg, ctx| c.guarded(msg, ctx, Self::on_group_registered))
            .on::<Pong>(|c, msg, ctx| c.guarded(msg, ctx, Self::on_pong_while_growing));
        def.state(Phase::DestroyingGroups)
            .on::<GroupDeregistered>(|c, msg, ctx| c.guarded(msg, ctx, Self::on_group_deregistered))
            .on::<Pong>(|c, msg, ctx| c.guarded(msg, ctx, Self::on_pong_while_shrinking));
        Ok(())
    }

    fn on_start(&mut self, ctx: &mut Context<Self>) -> Result<()> {
        info!(
            iterations = self.settings.iterations,
            max_live_groups = self.settings.max_live_groups,
            "Growth/shrink coordinator started"
        );
        self.guarded(&(), ctx, |c, _, ctx| c.create_next_group(ctx))
    }
}

/// Resolves a oneshot when the observed group terminates
struct Completion {
    done: Mutex<Option<oneshot::Sender<DeregReason>>>,
}

impl Completion {
    fn channel() -> (Self, oneshot::Receiver<DeregReason>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                done: Mutex::new(Some(tx)),
            },
            rx,
        )
    }
}

impl GroupObserver for Completion {
    fn on_registered(&self, _group: &GroupHandle) {}

    fn on_deregistered(&self, _group: &GroupHandle, reason: DeregReason) {
        if let Some(done) = self.done.lock().take() {
            let _ = done.send(reason);
        }
    }
}

/// Run the scenario to completion on `system`.
///
/// Registers the coordinator, waits for the coordinator's group (and with it
/// every responder group) to terminate and returns the report, or `Scenario`
/// if the coordinator failed or stopped early. Other groups on `system` are
/// left alone.
pub async fn run_scenario(
    system: &ActorSystem,
    settings: ScenarioSettings,
) -> Result<ScenarioReport> {
    settings.validate()?;
    let started = Instant::now();
    let ping = system.create_mailbox("ping");
    let report = Arc::new(Mutex::new(ScenarioReport::new(&settings)));

    let coordinator = GrowthShrinkCoordinator::new(settings, ping.clone(), Arc::clone(&report));
    let (completion, terminated) = Completion::channel();
    let handle = system.register_group(
        GroupBuilder::new("coordinator")
            .add_actor(coordinator)
            .observe(completion),
    )?;
    info!(group = %handle, "Scenario started");

    let reason = terminated.await.map_err(|_| {
        ActorError::Scenario("coordinator group dropped before terminating".to_string())
    })?;
    debug!(group = %handle, ?reason, "Coordinator group terminated");

    let mut report = report.lock().clone();
    report.elapsed_ms = started.elapsed().as_millis() as u64;
    report.final_index = ping.index_stats(MessageType::of::<Ping>());

    let leaked = ping.total_subscriptions();
    if leaked != 0 && report.failure.is_none() {
        report.failure = Some(format!("{} ping subscriptions left after teardown", leaked));
    }

    info!(
        iterations = report.iterations_completed,
        barriers = report.barriers.len(),
        peak_subscribers = report.peak_subscribers,
        elapsed_ms = report.elapsed_ms,
        "Scenario finished"
    );
    report.into_result()
}
