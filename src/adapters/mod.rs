//! Interfaces to the collaborators the agents depend on.
//!
//! The leak scorer, the energy optimizer and the valve actuator are external
//! systems. Agents only see the traits below; the crate ships deterministic
//! stand-ins so episodes can run end to end without them.

pub mod detector;
pub mod optimizer;
pub mod valves;

use thiserror::Error;

use crate::core::state_machine::ActuationFailure;
use crate::domain::events::{EnergyPlan, LeakAlert};
use crate::domain::{TariffUpdate, TelemetryWindow};

pub use detector::RuleBasedScorer;
pub use optimizer::{DemandProfile, TariffShiftOptimizer};
pub use valves::SimulatedValves;

/// Failure reported by an external collaborator
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CollaboratorError {
    #[error("{collaborator}: insufficient data ({detail})")]
    InsufficientData {
        collaborator: &'static str,
        detail: String,
    },

    #[error("{collaborator}: invalid input ({detail})")]
    InvalidInput {
        collaborator: &'static str,
        detail: String,
    },
}

/// Pump constraints passed to the optimizer
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PumpConstraints {
    pub max_parallel_pumps: u32,
    pub pressure_floor_kpa: f64,
    pub horizon_hours: u32,
}

/// Scores a telemetry window for leak likelihood
pub trait LeakScorer: Send {
    fn name(&self) -> &str;

    /// Score a window. The alert is returned whether or not it crosses any
    /// threshold; the caller applies its own confidence floor.
    fn score(&self, window: &TelemetryWindow) -> Result<LeakAlert, CollaboratorError>;
}

/// Builds pump schedules from demand and tariffs
pub trait EnergyOptimizer: Send {
    fn name(&self) -> &str;

    fn optimize(
        &self,
        demand: &DemandProfile,
        tariff: &TariffUpdate,
        constraints: PumpConstraints,
    ) -> Result<EnergyPlan, CollaboratorError>;
}

/// Operates physical valves
pub trait ValveActuator: Send {
    fn name(&self) -> &str;

    fn close(&mut self, valve: &str) -> Result<(), ActuationFailure>;

    fn open(&mut self, valve: &str) -> Result<(), ActuationFailure>;
}
