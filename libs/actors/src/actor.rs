//! # Actors and Per-State Dispatch
//!
//! An actor declares, once, a handler table for each of its states. The
//! active table is an `Arc` that is swapped on transition; subscriptions are
//! untouched, so a message type subscribed once may be handled in one state
//! and ignored in another.
//!
//! ```text
//!  define()                           run loop
//!  ┌──────────────────────────┐      ┌─────────────────────────────────┐
//!  │ subscribe::<Ping>(&mbox) │      │ recv ─▶ active.dispatch(msg)    │
//!  │ state(A).on::<Ping>(..)  │ ───▶ │          │ Handled / Ignored    │
//!  │ state(B).on::<Pong>(..)  │      │          ▼                      │
//!  └──────────────────────────┘      │ pending transition? swap table  │
//!                                    └─────────────────────────────────┘
//! ```
//!
//! A message with no entry in the active table is dropped and counted as
//! ignored. Handler errors are logged and counted; the actor keeps running.
//!
//! # Exit Sequence
//!
//! On a stop request the actor unsubscribes from every mailbox, runs
//! `on_finish` and then counts itself out of its group. The last two steps
//! are also driven by drop guards, so unsubscription and group bookkeeping
//! happen even if a handler panics.

use crate::address::{Address, Delivery};
use crate::error::Result;
use crate::group::{DeregReason, GroupHandle, Membership};
use crate::mailbox::Mailbox;
use crate::message::{Envelope, Message, MessageType};
use crate::registry::{ActorId, ActorStatus};
use crate::system::{ActorSystem, SystemMetrics};
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::marker::PhantomData;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Behavior of an actor.
///
/// `define` runs synchronously while the owning group is registered; it
/// declares the handler table of every state and subscribes to mailboxes.
/// The remaining hooks run on the actor's own task.
pub trait Actor: Send + Sized + 'static {
    /// Tagged state enum selecting the active handler table
    type State: Copy + Eq + Hash + fmt::Debug + Send + Sync + 'static;

    fn initial_state(&self) -> Self::State;

    fn define(&mut self, definition: &mut Definition<Self>) -> Result<()>;

    /// Called once before the first message
    fn on_start(&mut self, ctx: &mut Context<Self>) -> Result<()> {
        let _ = ctx;
        Ok(())
    }

    /// Called once after the actor unsubscribed everything
    fn on_finish(&mut self, ctx: &mut Context<Self>) {
        let _ = ctx;
    }
}

/// Outcome of dispatching one message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Handled,
    /// No handler for this message type in the active state
    Ignored,
}

type Handler<A> = Box<dyn Fn(&mut A, &Envelope, &mut Context<A>) -> Result<()> + Send + Sync>;

/// Immutable message-type to handler map of one state
pub struct HandlerTable<A: Actor> {
    state: Option<A::State>,
    handlers: HashMap<MessageType, Handler<A>>,
}

impl<A: Actor> HandlerTable<A> {
    fn empty() -> Self {
        Self {
            state: None,
            handlers: HashMap::new(),
        }
    }

    /// State this table was defined for; `None` for the empty table
    pub fn state(&self) -> Option<A::State> {
        self.state
    }

    pub fn handles(&self, message_type: MessageType) -> bool {
        self.handlers.contains_key(&message_type)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn dispatch(
        &self,
        actor: &mut A,
        envelope: &Envelope,
        ctx: &mut Context<A>,
    ) -> Result<Dispatch> {
        match self.handlers.get(&envelope.message_type()) {
            Some(handler) => handler(actor, envelope, ctx).map(|()| Dispatch::Handled),
            None => Ok(Dispatch::Ignored),
        }
    }
}

impl<A: Actor> fmt::Debug for HandlerTable<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerTable")
            .field("state", &self.state)
            .field("message_types", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// All state tables of one actor plus the active one
struct StateMachine<A: Actor> {
    tables: HashMap<A::State, Arc<HandlerTable<A>>>,
    empty: Arc<HandlerTable<A>>,
    active: Arc<HandlerTable<A>>,
    current: A::State,
}

impl<A: Actor> StateMachine<A> {
    fn new(tables: HashMap<A::State, HashMap<MessageType, Handler<A>>>, initial: A::State) -> Self {
        let tables: HashMap<_, _> = tables
            .into_iter()
            .map(|(state, handlers)| {
                let table = HandlerTable {
                    state: Some(state),
                    handlers,
                };
                (state, Arc::new(table))
            })
            .collect();
        let empty = Arc::new(HandlerTable::empty());
        let active = tables.get(&initial).cloned().unwrap_or_else(|| Arc::clone(&empty));
        Self {
            tables,
            empty,
            active,
            current: initial,
        }
    }

    fn active(&self) -> Arc<HandlerTable<A>> {
        Arc::clone(&self.active)
    }

    fn switch(&mut self, state: A::State) {
        self.active = self
            .tables
            .get(&state)
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.empty));
        self.current = state;
    }
}

/// Builder handed to [`Actor::define`]
pub struct Definition<A: Actor> {
    id: ActorId,
    address: Address,
    group: GroupHandle,
    system: ActorSystem,
    tables: HashMap<A::State, HashMap<MessageType, Handler<A>>>,
    subscriptions: Subscriptions,
}

impl<A: Actor> Definition<A> {
    fn new(id: ActorId, address: Address, group: GroupHandle, system: ActorSystem) -> Self {
        Self {
            id,
            address,
            group,
            system,
            tables: HashMap::new(),
            subscriptions: Subscriptions::new(id),
        }
    }

    pub fn id(&self) -> ActorId {
        self.id
    }

    /// The actor's own direct address
    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn group(&self) -> &GroupHandle {
        &self.group
    }

    pub fn system(&self) -> &ActorSystem {
        &self.system
    }

    /// Start or extend the handler table of `state`
    pub fn state(&mut self, state: A::State) -> StateDefinition<'_, A> {
        StateDefinition {
            state,
            table: self.tables.entry(state).or_default(),
        }
    }

    /// Subscribe this actor's address to `M` on `mailbox`
    pub fn subscribe<M: Message>(&mut self, mailbox: &Mailbox) -> Result<()> {
        let address = self.address.clone();
        let message_type = MessageType::of::<M>();
        mailbox.subscribe(
            message_type,
            self.id,
            Arc::new(move |envelope: &Envelope| {
                address.deliver(envelope.clone());
            }),
        )?;
        self.subscriptions.push(mailbox.clone(), message_type);
        Ok(())
    }

    #[allow(clippy::type_complexity)]
    fn into_parts(self) -> (HashMap<A::State, HashMap<MessageType, Handler<A>>>, Subscriptions) {
        (self.tables, self.subscriptions)
    }
}

/// Handler registration for one state
pub struct StateDefinition<'a, A: Actor> {
    state: A::State,
    table: &'a mut HashMap<MessageType, Handler<A>>,
}

impl<'a, A: Actor> StateDefinition<'a, A> {
    /// Handle `M` while this state is active; a second handler for the same
    /// type replaces the first
    pub fn on<M: Message>(
        self,
        handler: impl Fn(&mut A, &M, &mut Context<A>) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        let message_type = MessageType::of::<M>();
        let replaced = self.table.insert(
            message_type,
            Box::new(move |actor: &mut A, envelope: &Envelope, ctx: &mut Context<A>| {
                let message = envelope.payload::<M>()?;
                handler(actor, message, ctx)
            }),
        );
        if replaced.is_some() {
            debug!(state = ?self.state, message_type = %message_type, "Handler replaced");
        }
        self
    }
}

/// Per-actor handle passed to hooks and handlers
pub struct Context<A: Actor> {
    id: ActorId,
    address: Address,
    group: GroupHandle,
    system: ActorSystem,
    state: A::State,
    pending: Option<A::State>,
}

impl<A: Actor> Context<A> {
    pub fn id(&self) -> ActorId {
        self.id
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Group this actor belongs to
    pub fn group(&self) -> &GroupHandle {
        &self.group
    }

    pub fn system(&self) -> &ActorSystem {
        &self.system
    }

    /// Currently active state
    pub fn state(&self) -> A::State {
        self.state
    }

    /// Switch tables once the current handler returns; the last request wins
    pub fn transition(&mut self, state: A::State) {
        self.pending = Some(state);
    }

    /// Deregister the group this actor belongs to
    pub fn deregister_own_group(&self, reason: DeregReason) {
        self.system.deregister_group(&self.group, reason);
    }
}

/// Mailbox bindings owned by one actor, released on drop
pub(crate) struct Subscriptions {
    owner: ActorId,
    bindings: Vec<(Mailbox, MessageType)>,
}

impl Subscriptions {
    fn new(owner: ActorId) -> Self {
        Self {
            owner,
            bindings: Vec::new(),
        }
    }

    fn push(&mut self, mailbox: Mailbox, message_type: MessageType) {
        self.bindings.push((mailbox, message_type));
    }

    /// Unsubscribe everything, returning how many bindings were released
    fn release(&mut self) -> usize {
        let released = self.bindings.len();
        for (mailbox, message_type) in self.bindings.drain(..) {
            mailbox.unsubscribe(message_type, &self.owner);
        }
        released
    }
}

impl Drop for Subscriptions {
    fn drop(&mut self) {
        self.release();
    }
}

/// Environment available while a group constructs its members
pub(crate) struct MemberEnv<'a> {
    pub system: &'a ActorSystem,
    pub group: &'a GroupHandle,
}

/// Type-erased constructed member of a group
pub(crate) trait Member: Send {
    fn id(&self) -> ActorId;
    fn address(&self) -> Address;
    /// Spawn the actor's task
    fn start(self: Box<Self>, membership: Membership);
    /// Tear down a member that never started
    fn discard(self: Box<Self>);
}

/// Type-erased member constructor stored in a group builder
pub(crate) trait MemberFactory: Send {
    fn construct(self: Box<Self>, env: &MemberEnv<'_>) -> Result<Box<dyn Member>>;
}

pub(crate) struct ActorFactory<A, F> {
    factory: F,
    _actor: PhantomData<fn() -> A>,
}

impl<A, F> ActorFactory<A, F> {
    pub fn new(factory: F) -> Self {
        Self {
            factory,
            _actor: PhantomData,
        }
    }
}

impl<A, F> MemberFactory for ActorFactory<A, F>
where
    A: Actor,
    F: FnOnce() -> Result<A> + Send + 'static,
{
    fn construct(self: Box<Self>, env: &MemberEnv<'_>) -> Result<Box<dyn Member>> {
        let actor = (self.factory)()?;
        let cell = ActorCell::construct(actor, env)?;
        Ok(Box::new(cell))
    }
}

/// A constructed actor with everything it needs to run.
///
/// Field order matters: on drop, subscriptions are released before the
/// membership guard counts the actor out of its group.
struct ActorCell<A: Actor> {
    actor: A,
    machine: StateMachine<A>,
    context: Context<A>,
    receiver: mpsc::UnboundedReceiver<Delivery>,
    metrics: Arc<SystemMetrics>,
    subscriptions: Subscriptions,
    membership: Option<Membership>,
}

impl<A: Actor> ActorCell<A> {
    fn construct(mut actor: A, env: &MemberEnv<'_>) -> Result<Self> {
        let id = ActorId::new();
        let (address, receiver) = Address::new(id);
        let mut definition =
            Definition::new(id, address.clone(), env.group.clone(), env.system.clone());

        // On error the definition is dropped, releasing what it subscribed
        actor.define(&mut definition)?;

        let initial = actor.initial_state();
        let (tables, subscriptions) = definition.into_parts();
        let machine = StateMachine::new(tables, initial);
        env.system.registry().register_actor(id, env.group.id());

        trace!(
            actor_id = %id,
            actor_type = std::any::type_name::<A>(),
            group = %env.group.name(),
            states = machine.tables.len(),
            "Actor constructed"
        );

        Ok(Self {
            actor,
            machine,
            context: Context {
                id,
                address,
                group: env.group.clone(),
                system: env.system.clone(),
                state: initial,
                pending: None,
            },
            receiver,
            metrics: env.system.metrics(),
            subscriptions,
            membership: None,
        })
    }

    async fn run(mut self, membership: Membership) {
        let id = self.context.id;
        self.membership = Some(membership);
        self.context.system.registry().set_status(&id, ActorStatus::Running);

        if let Err(e) = self.actor.on_start(&mut self.context) {
            self.metrics.record_handler_failure();
            warn!(
                actor_id = %id,
                error = %e,
                error_category = e.category(),
                "Actor start hook failed"
            );
        }
        self.apply_transition();

        let reason = loop {
            match self.receiver.recv().await {
                Some(Delivery::Message(envelope)) => self.handle(envelope),
                Some(Delivery::Stop(reason)) => break reason,
                // Every sender is gone; nobody can stop us explicitly
                None => break DeregReason::Shutdown,
            }
        };

        self.context.system.registry().set_status(&id, ActorStatus::Stopping);
        let released = self.subscriptions.release();
        self.actor.on_finish(&mut self.context);

        debug!(
            actor_id = %id,
            group = %self.context.group.name(),
            ?reason,
            released,
            "Actor finished"
        );
    }

    fn handle(&mut self, envelope: Envelope) {
        let table = self.machine.active();
        match table.dispatch(&mut self.actor, &envelope, &mut self.context) {
            Ok(Dispatch::Handled) => self.metrics.record_dispatch(true),
            Ok(Dispatch::Ignored) => {
                self.metrics.record_dispatch(false);
                trace!(
                    actor_id = %self.context.id,
                    state = ?self.context.state,
                    message_type = %envelope.message_type(),
                    "Message ignored in current state"
                );
            }
            Err(e) => {
                self.metrics.record_handler_failure();
                warn!(
                    actor_id = %self.context.id,
                    state = ?self.context.state,
                    message_type = %envelope.message_type(),
                    error = %e,
                    error_category = e.category(),
                    "Message handler failed"
                );
            }
        }
        self.apply_transition();
    }

    fn apply_transition(&mut self) {
        if let Some(next) = self.context.pending.take() {
            let previous = self.machine.current;
            self.machine.switch(next);
            self.context.state = next;
            trace!(
                actor_id = %self.context.id,
                from = ?previous,
                to = ?next,
                handlers = self.machine.active.len(),
                "State transition"
            );
        }
    }
}

impl<A: Actor> Member for ActorCell<A> {
    fn id(&self) -> ActorId {
        self.context.id
    }

    fn address(&self) -> Address {
        self.context.address.clone()
    }

    fn start(self: Box<Self>, membership: Membership) {
        self.metrics.actors_spawned.fetch_add(1, Ordering::Relaxed);
        let cell = *self;
        tokio::spawn(cell.run(membership));
    }

    fn discard(self: Box<Self>) {
        let id = self.context.id;
        self.context.system.registry().unregister_actor(&id);
        trace!(actor_id = %id, "Discarding actor that never started");
    }
}
