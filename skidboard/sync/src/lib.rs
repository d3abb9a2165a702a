#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    rust_2018_idioms,
    missing_docs
)]

//! Skid dashboard core: derives selector mode, gates the manual valve, pools peer
//! controller telemetry and keeps one authoritative snapshot for every connected viewer.

/// Errors surfaced by the core.
#[path = "../error.rs"]
pub mod error;

/// Process tag store contract and an in-memory implementation.
#[path = "../tags.rs"]
pub mod tags;

/// Site configuration.
#[path = "../config.rs"]
pub mod config;

/// Structured logging and event hooks.
#[path = "../telemetry.rs"]
pub mod telemetry;

/// Selector mode derivation.
#[path = "../selector.rs"]
pub mod selector;

/// Fault flags derived from peer states.
#[path = "../faults.rs"]
pub mod faults;

/// Snapshot data model and partial updates.
#[path = "../snapshot.rs"]
pub mod snapshot;

/// Pooled telemetry reduction.
#[path = "../aggregate.rs"]
pub mod aggregate;

/// Snapshot ownership and fan-out.
#[path = "../broadcast.rs"]
pub mod broadcast;

/// Manual valve interlock.
#[path = "../interlock.rs"]
pub mod interlock;

/// Fixed-period tick driver and heartbeat task.
#[path = "../driver.rs"]
pub mod driver;

/// Runtime wiring.
#[path = "../main.rs"]
pub mod runtime;

pub use aggregate::{AggregateResult, Reduction, SolarField, TelemetryAggregator};
pub use broadcast::{
    Advisory, DisplayEvent, HealthReport, SnapshotBroadcaster, SubscriptionHandle, SubscriptionId,
};
pub use config::SkidConfig;
pub use driver::{spawn_heartbeat, TickDriver};
pub use error::SyncError;
pub use faults::FaultFlags;
pub use interlock::{
    ButtonEdge, EdgePolarity, InterlockOutcome, ValveCommand, ValveInterlock,
    ValvePins,
};
pub use runtime::{RunningSkid, SkidRuntime, SkidRuntimeBuilder};
pub use selector::{SelectorState, SelectorStateMachine};
pub use snapshot::{PartialUpdate, Snapshot};
pub use tags::{ControllerId, MemoryTagSource, Pin, TagSource, TagValue};
pub use telemetry::{SyncTelemetry, SyncTelemetryBuilder};
