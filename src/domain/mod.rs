//! Domain types for the AWARE orchestration core.
//!
//! - Events: immutable messages exchanged over the bus
//! - Action: isolation actions and their transition records
//! - Network: the static water network graph
//! - Telemetry: sensor windows and tariffs fed in by the driver

pub mod action;
pub mod events;
pub mod network;
pub mod telemetry;

pub use action::{ActionHistory, ActionId, ActionState, IsolationAction, TransitionRecord};
pub use events::{Event, EventKind, SystemMode};
pub use network::{NetworkGraph, NodeKind, TopologyError};
pub use telemetry::{TariffUpdate, TelemetrySample, TelemetryWindow};
