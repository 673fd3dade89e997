//! Energy optimization agent.

use tracing::debug;

use super::{Agent, AgentContext, AgentError};
use crate::adapters::{DemandProfile, EnergyOptimizer, PumpConstraints, TariffShiftOptimizer};
use crate::core::policy::ENERGY_OPT;
use crate::domain::telemetry::DEMAND_LPS;
use crate::domain::{Event, EventKind, TariffUpdate};

/// Keeps the latest tariff and recent demand, and republishes a pump
/// schedule whenever either changes and both are known.
pub struct EnergyOptAgent {
    optimizer: Box<dyn EnergyOptimizer>,
    tariff: Option<TariffUpdate>,
    demand: DemandProfile,
}

impl Default for EnergyOptAgent {
    fn default() -> Self {
        Self::new(Box::new(TariffShiftOptimizer::default()))
    }
}

impl EnergyOptAgent {
    pub fn new(optimizer: Box<dyn EnergyOptimizer>) -> Self {
        Self {
            optimizer,
            tariff: None,
            demand: DemandProfile::default(),
        }
    }
}

impl Agent for EnergyOptAgent {
    fn name(&self) -> &str {
        ENERGY_OPT
    }

    fn subscriptions(&self) -> Vec<String> {
        vec!["telemetry.window".to_string(), "tariff.update".to_string()]
    }

    fn handle(&mut self, event: &Event, ctx: &AgentContext<'_>) -> Result<Vec<EventKind>, AgentError> {
        match &event.kind {
            EventKind::TariffUpdate(tariff) => self.tariff = Some(tariff.clone()),
            EventKind::TelemetryWindow(window) => match window.latest(DEMAND_LPS) {
                Some(demand) => self.demand.observe(demand),
                None => return Ok(Vec::new()),
            },
            _ => return Ok(Vec::new()),
        }

        let Some(tariff) = &self.tariff else {
            debug!("No tariff yet, skipping pump schedule");
            return Ok(Vec::new());
        };
        if self.demand.is_empty() {
            return Ok(Vec::new());
        }

        let policy = ctx.policy_for(ENERGY_OPT);
        let constraints = PumpConstraints {
            max_parallel_pumps: policy.max_parallel_pumps,
            pressure_floor_kpa: policy.pressure_floor_kpa,
            horizon_hours: policy.budgets.horizon_hours,
        };

        let plan = self.optimizer.optimize(&self.demand, tariff, constraints)?;
        debug!(
            savings_pct = plan.savings_pct,
            max_pumps_on = plan.max_pumps_on,
            optimizer = self.optimizer.name(),
            "Pump schedule ready"
        );
        Ok(vec![EventKind::EnergyPlan(plan)])
    }
}
