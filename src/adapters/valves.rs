//! In-process valve actuator.

use std::collections::BTreeSet;

use tracing::debug;

use super::ValveActuator;
use crate::core::state_machine::ActuationFailure;

/// Tracks valve positions in memory. Valves marked stuck refuse to move.
#[derive(Debug, Clone, Default)]
pub struct SimulatedValves {
    closed: BTreeSet<String>,
    stuck: BTreeSet<String>,
}

impl SimulatedValves {
    pub fn new() -> Self {
        Self::default()
    }

    /// Valves that will fail any command
    pub fn with_stuck<I, S>(mut self, valves: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.stuck.extend(valves.into_iter().map(Into::into));
        self
    }

    pub fn is_closed(&self, valve: &str) -> bool {
        self.closed.contains(valve)
    }

    pub fn closed_valves(&self) -> impl Iterator<Item = &str> {
        self.closed.iter().map(String::as_str)
    }

    fn check(&self, valve: &str) -> Result<(), ActuationFailure> {
        if self.stuck.contains(valve) {
            return Err(ActuationFailure {
                valve: valve.to_string(),
                reason: "valve did not respond".to_string(),
            });
        }
        Ok(())
    }
}

impl ValveActuator for SimulatedValves {
    fn name(&self) -> &str {
        "simulated-valves"
    }

    fn close(&mut self, valve: &str) -> Result<(), ActuationFailure> {
        self.check(valve)?;
        debug!(valve, "Closing valve");
        self.closed.insert(valve.to_string());
        Ok(())
    }

    fn open(&mut self, valve: &str) -> Result<(), ActuationFailure> {
        self.check(valve)?;
        debug!(valve, "Opening valve");
        self.closed.remove(valve);
        Ok(())
    }
}
