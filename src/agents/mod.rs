//! Agents and the contract they share.
//!
//! An agent subscribes to event types, reacts to each delivered event and
//! returns the events it wants published. Agents never hold references to
//! each other or to the bus; everything they know about the world arrives
//! through the event and the [`AgentContext`].

pub mod actuator;
pub mod energy_opt;
pub mod leak_detect;
pub mod planner;
pub mod watcher;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::adapters::CollaboratorError;
use crate::core::mode::ModeView;
use crate::core::policy::{AgentPolicy, Policy};
use crate::domain::{Event, EventKind, NetworkGraph, SystemMode};

pub use actuator::ActuatorAgent;
pub use energy_opt::EnergyOptAgent;
pub use leak_detect::LeakDetectAgent;
pub use planner::PlannerAgent;
pub use watcher::WatcherAgent;

/// Subscription pattern matching every event type
pub const WILDCARD: &str = "*";

/// Source name of events injected by a human operator
pub const OPERATOR: &str = "operator";

/// Read-only view of the world handed to every handler call
#[derive(Clone, Copy)]
pub struct AgentContext<'a> {
    pub policy: &'a Policy,
    pub graph: &'a NetworkGraph,
    pub mode: &'a ModeView,
    /// Logical time of the tick being processed
    pub now: DateTime<Utc>,
}

impl<'a> AgentContext<'a> {
    /// Policy block of an agent
    pub fn policy_for(&self, agent: &str) -> &'a AgentPolicy {
        self.policy.agent(agent)
    }

    pub fn mode(&self) -> SystemMode {
        self.mode.current()
    }
}

/// Errors an agent may return from `handle`
#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),
}

/// A participant on the event bus
pub trait Agent: Send {
    /// Unique agent name, also the `source_agent` of its events
    fn name(&self) -> &str;

    /// Event types (or `*`) this agent wants delivered
    fn subscriptions(&self) -> Vec<String>;

    /// React to one event, returning the events to publish next
    fn handle(&mut self, event: &Event, ctx: &AgentContext<'_>) -> Result<Vec<EventKind>, AgentError>;
}
