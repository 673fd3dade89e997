//! Planner agent: turns leak alerts into isolation proposals.

use tracing::{info, warn};

use super::{Agent, AgentContext, AgentError};
use crate::core::planner::{self, PlanStamp};
use crate::core::policy::PLANNER;
use crate::domain::events::{IsolationPlanned, PlanInfeasible};
use crate::domain::{ActionId, Event, EventKind};

#[derive(Debug, Default)]
pub struct PlannerAgent {
    /// Plans produced so far; feeds the action id derivation
    ordinal: u64,
}

impl PlannerAgent {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Agent for PlannerAgent {
    fn name(&self) -> &str {
        PLANNER
    }

    fn subscriptions(&self) -> Vec<String> {
        vec!["alert.leak".to_string()]
    }

    fn handle(&mut self, event: &Event, ctx: &AgentContext<'_>) -> Result<Vec<EventKind>, AgentError> {
        let EventKind::LeakAlert(alert) = &event.kind else {
            return Ok(Vec::new());
        };

        let policy = ctx.policy_for(PLANNER);
        self.ordinal += 1;
        let stamp = PlanStamp {
            id: ActionId::derive(&alert.pipe_id, ctx.now, self.ordinal),
            origin_agent: PLANNER.to_string(),
            created_at: ctx.now,
        };

        let outcome = match planner::plan(ctx.graph, &alert.pipe_id, policy, stamp) {
            Ok(action) => {
                info!(
                    action_id = %action.id,
                    valves = ?action.valve_sequence,
                    customers = action.estimated_customers_affected,
                    "Isolation planned"
                );
                EventKind::IsolationPlanned(IsolationPlanned {
                    action,
                    radius_hops: policy.max_radius_hops,
                    confidence: alert.probability,
                })
            }
            Err(e) => {
                warn!(pipe = %alert.pipe_id, error = %e, "Isolation infeasible");
                EventKind::PlanInfeasible(PlanInfeasible {
                    leak_location: alert.pipe_id.clone(),
                    radius_hops: policy.max_radius_hops,
                    reason: e.to_string(),
                })
            }
        };

        Ok(vec![outcome])
    }
}
