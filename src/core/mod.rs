//! Core orchestration logic.
//!
//! This module contains:
//! - Policy: guardrail documents and their merge
//! - Bus: synchronous event dispatch between agents
//! - Mode: the process-wide auto/safe switch
//! - Planner: valve isolation search
//! - StateMachine: isolation action lifecycle
//! - AuditStore: transition trail and its persistent stores
//! - Orchestrator: episode driver

pub mod audit_store;
pub mod bus;
pub mod mode;
pub mod orchestrator;
pub mod planner;
pub mod policy;
pub mod state_machine;

// Re-export commonly used types
pub use audit_store::{open_sink, AuditBackend, AuditLog, AuditSink, JsonlAuditStore, SqliteAuditStore};
pub use bus::{DispatchError, EventBus};
pub use mode::{ModeController, ModeView};
pub use orchestrator::{EpisodeReport, ExternalInput, InputTick, Orchestrator, Scenario};
pub use planner::PlanError;
pub use policy::{AgentPolicy, Budgets, ConfigurationError, Policy};
pub use state_machine::{ActuationFailure, ExecutionGate, IsolationStateMachine, TransitionError};
