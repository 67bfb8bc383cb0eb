//! Broadcast Mailbox Actor Runtime
//!
//! In-process actor runtime built around a broadcast mailbox whose
//! per-message-type subscriber index adapts its representation to the
//! subscriber count, from a handful of entries to tens of thousands and back.
//! Actors are created and destroyed in cooperative groups and dispatch
//! through per-state handler tables.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────┐        ┌───────────────────────────────┐
//! │ ActorSystem              │        │ Mailbox "ping"                │
//! │                          │        │                               │
//! │  register_group ─────────┼──┐     │  Ping ─▶ SubscriptionIndex    │
//! │  deregister_group        │  │     │          Compact ⇄ Indexed    │
//! │  wait_until_idle         │  │     └──────────────┬────────────────┘
//! └──────────────────────────┘  │                    │ snapshot fan-out
//!                               ▼                    ▼
//!                 ┌──────────────────────────────────────────────┐
//!                 │ CooperativeGroup                             │
//!                 │  ┌────────┐ ┌────────┐      ┌────────┐       │
//!                 │  │ actor  │ │ actor  │ ...  │ actor  │       │
//!                 │  │ queue  │ │ queue  │      │ queue  │       │
//!                 │  └────────┘ └────────┘      └────────┘       │
//!                 │  registered / deregistered ─▶ observers      │
//!                 └──────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use mailbox_actors::{run_scenario, ActorSystem, ScenarioSettings};
//!
//! # async fn demo() -> mailbox_actors::Result<()> {
//! let system = ActorSystem::default();
//! let report = run_scenario(&system, ScenarioSettings::default()).await?;
//! println!("{} barriers, peak {} subscribers", report.barriers.len(), report.peak_subscribers);
//! # Ok(())
//! # }
//! ```

pub mod actor;
pub mod address;
pub mod config;
pub mod error;
pub mod group;
pub mod mailbox;
pub mod message;
pub mod registry;
pub mod scenario;
pub mod subscription;
pub mod system;

pub use actor::{Actor, Context, Definition, Dispatch, HandlerTable, StateDefinition};
pub use address::Address;
pub use config::{RuntimeConfig, ScenarioSettings, SystemSettings};
pub use error::{ActorError, Result};
pub use group::{
    DeregReason, GroupBuilder, GroupDeregistered, GroupHandle, GroupObserver, GroupRegistered,
    GroupStatus,
};
pub use mailbox::Mailbox;
pub use message::{Envelope, Message, MessageType};
pub use registry::{ActorEntry, ActorId, ActorRegistry, ActorStatus, GroupId, MailboxId};
pub use scenario::{
    run_scenario, BarrierRecord, GrowthShrinkCoordinator, Phase, Ping, PingResponder, Pong,
    ReplyBarrier, ScenarioReport,
};
pub use subscription::{
    DeliveryHandler, IndexPolicy, IndexStats, Representation, Snapshot, SubscriptionEntry,
    SubscriptionIndex,
};
pub use system::{ActorSystem, SystemMetrics, SystemStats};
