//! aware - Policy-governed multi-agent control for water networks
//!
//! Five agents cooperate over a synchronous in-process event bus to detect
//! leaks, plan valve isolations, schedule pumps against a tariff and carry
//! out isolations through an audited state machine. A watcher observes all
//! traffic and drops the system into safe mode when a guardrail is breached
//! or an actuation fails.
//!
//! # Modules
//!
//! - `adapters`: Collaborator seams (leak scorer, pump optimizer, valves)
//! - `agents`: The agent contract and the five agents
//! - `core`: Policy, bus, planner, state machine, audit store, episode driver
//! - `domain`: Data structures (Event, IsolationAction, NetworkGraph)
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Run the demo episode and print the timeline
//! aware episode
//!
//! # Let the planner act alone, with certain chaos
//! aware episode --auto-execute --chaos 1.0
//!
//! # Check that an episode replays identically
//! aware episode --output timeline.json && aware replay timeline.json
//! ```

pub mod adapters;
pub mod agents;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;

// Re-export main types at crate root for convenience
pub use crate::core::{EpisodeReport, Orchestrator, Policy, Scenario};
pub use domain::{ActionState, Event, EventKind, IsolationAction, NetworkGraph, SystemMode};
