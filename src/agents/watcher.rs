//! Watcher: guardrail monitor, chaos injector and sole writer of the
//! system mode.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{info, warn};

use super::{Agent, AgentContext, AgentError, OPERATOR, WILDCARD};
use crate::core::mode::{ModeController, ModeView};
use crate::core::policy::WATCHER;
use crate::domain::events::{ChaosInjected, EnergyPlan, GuardrailBreach, ModeChange};
use crate::domain::{Event, EventKind, SystemMode};

/// Fault description carried by injected chaos events
pub const CHAOS_FAULT: &str = "simulated actuator fault";

pub struct WatcherAgent {
    controller: ModeController,
    rng: StdRng,
    breaches: u64,
}

impl WatcherAgent {
    /// Take ownership of the mode writer; chaos draws are seeded with `chaos_seed`
    pub fn new(controller: ModeController, chaos_seed: u64) -> Self {
        Self {
            controller,
            rng: StdRng::seed_from_u64(chaos_seed),
            breaches: 0,
        }
    }

    pub fn mode_view(&self) -> ModeView {
        self.controller.view()
    }

    /// Guardrail breaches observed so far
    pub fn breaches(&self) -> u64 {
        self.breaches
    }

    fn breach(&mut self, guardrail: &str, observed: f64, limit: f64, trigger: &Event) -> EventKind {
        self.breaches += 1;
        warn!(
            guardrail,
            observed,
            limit,
            trigger_seq = trigger.seq,
            trigger = trigger.event_type(),
            "Guardrail breached"
        );
        EventKind::GuardrailBreach(GuardrailBreach {
            guardrail: guardrail.to_string(),
            observed,
            limit,
            trigger_seq: trigger.seq,
        })
    }

    /// Enter safe mode, emitting the mode event only on an actual change
    fn degrade(&self, reason: &str, out: &mut Vec<EventKind>) {
        if self.controller.enter_safe() {
            warn!(reason, "Entering safe mode");
            out.push(EventKind::SystemMode(ModeChange {
                mode: SystemMode::Safe,
                reason: reason.to_string(),
            }));
        }
    }

    fn check_energy_plan(&mut self, plan: &EnergyPlan, event: &Event, ctx: &AgentContext<'_>) -> Vec<EventKind> {
        let policy = ctx.policy_for(WATCHER);
        let mut out = Vec::new();

        if plan.max_pumps_on > policy.max_parallel_pumps {
            out.push(self.breach(
                "max_parallel_pumps",
                f64::from(plan.max_pumps_on),
                f64::from(policy.max_parallel_pumps),
                event,
            ));
        }
        if plan.min_pressure_kpa < policy.pressure_floor_kpa {
            out.push(self.breach(
                "pressure_floor_kpa",
                plan.min_pressure_kpa,
                policy.pressure_floor_kpa,
                event,
            ));
        }
        if plan.savings_pct > policy.budgets.max_savings_pct {
            out.push(self.breach(
                "max_savings_pct",
                plan.savings_pct,
                policy.budgets.max_savings_pct,
                event,
            ));
        }

        if !out.is_empty() {
            self.degrade("energy plan outside guardrails", &mut out);
        }
        out
    }
}

impl Agent for WatcherAgent {
    fn name(&self) -> &str {
        WATCHER
    }

    fn subscriptions(&self) -> Vec<String> {
        vec![WILDCARD.to_string()]
    }

    fn handle(&mut self, event: &Event, ctx: &AgentContext<'_>) -> Result<Vec<EventKind>, AgentError> {
        if event.source_agent == WATCHER {
            return Ok(Vec::new());
        }
        let policy = ctx.policy_for(WATCHER);
        let mut out = Vec::new();

        match &event.kind {
            EventKind::IsolationPlanned(planned) => {
                let hops = planned.action.max_hops();
                if hops > policy.max_radius_hops {
                    out.push(self.breach(
                        "max_radius_hops",
                        f64::from(hops),
                        f64::from(policy.max_radius_hops),
                        event,
                    ));
                    self.degrade("isolation plan exceeds radius", &mut out);
                }
            }
            EventKind::EnergyPlan(plan) => out = self.check_energy_plan(plan, event, ctx),
            EventKind::ActuationExecuting(transition) => {
                // Draw on every execution so the sequence only depends on the seed
                let roll: f64 = self.rng.gen();
                if roll < policy.chaos_probability {
                    info!(action_id = %transition.action_id, roll, "Injecting chaos");
                    out.push(EventKind::ChaosInjected(ChaosInjected {
                        action_id: transition.action_id,
                        fault: CHAOS_FAULT.to_string(),
                    }));
                    if policy.budgets.safe_mode_on_failure {
                        self.degrade("chaos injected", &mut out);
                    }
                }
            }
            EventKind::ActuationFailed(transition) => {
                if policy.budgets.safe_mode_on_failure {
                    warn!(action_id = %transition.action_id, "Actuation failed");
                    self.degrade("actuation failed", &mut out);
                }
            }
            EventKind::ModeResume(resume) => {
                if event.source_agent != OPERATOR {
                    warn!(source = %event.source_agent, "Ignoring resume from non-operator");
                } else if self.controller.resume() {
                    info!(operator = %resume.operator, "Resuming auto mode");
                    out.push(EventKind::SystemMode(ModeChange {
                        mode: SystemMode::Auto,
                        reason: format!("resumed by {}", resume.operator),
                    }));
                }
            }
            _ => {}
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::policy::Policy;
    use crate::domain::events::{ActuationTransition, ModeResume, PumpStep};
    use crate::domain::{ActionId, ActionState, NetworkGraph};
    use chrono::{TimeZone, Utc};

    fn event(seq: u64, source: &str, kind: EventKind) -> Event {
        Event {
            seq,
            timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            source_agent: source.to_string(),
            kind,
        }
    }

    fn executing() -> EventKind {
        EventKind::ActuationExecuting(ActuationTransition {
            action_id: ActionId::derive("P1", Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(), 1),
            leak_location: "P1".to_string(),
            from: ActionState::Approved,
            to: ActionState::Executing,
            actor: "actuator".to_string(),
        })
    }

    fn types(out: &[EventKind]) -> Vec<&'static str> {
        out.iter().map(|k| k.event_type()).collect()
    }

    #[test]
    fn test_certain_chaos_forces_safe_mode_once() {
        let policy = Policy::builtin().with_chaos_probability(1.0).unwrap();
        let graph = NetworkGraph::sample();
        let (controller, view) = ModeController::new();
        let mut watcher = WatcherAgent::new(controller, 42);
        let ctx = AgentContext {
            policy: &policy,
            graph: &graph,
            mode: &view,
            now: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        };

        let out = watcher.handle(&event(1, "actuator", executing()), &ctx).unwrap();
        assert_eq!(types(&out), vec!["chaos.injected", "system.mode"]);
        assert!(view.is_safe());

        let out = watcher.handle(&event(2, "actuator", executing()), &ctx).unwrap();
        assert_eq!(types(&out), vec!["chaos.injected"]);
    }

    #[test]
    fn test_zero_chaos_never_fires() {
        let policy = Policy::builtin().with_chaos_probability(0.0).unwrap();
        let graph = NetworkGraph::sample();
        let (controller, view) = ModeController::new();
        let mut watcher = WatcherAgent::new(controller, 7);
        let ctx = AgentContext {
            policy: &policy,
            graph: &graph,
            mode: &view,
            now: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        };

        for seq in 0..50 {
            let out = watcher.handle(&event(seq, "actuator", executing()), &ctx).unwrap();
            assert!(out.is_empty());
        }
        assert_eq!(view.current(), SystemMode::Auto);
    }

    #[test]
    fn test_energy_plan_breaches() {
        let policy = Policy::builtin();
        let graph = NetworkGraph::sample();
        let (controller, view) = ModeController::new();
        let mut watcher = WatcherAgent::new(controller, 42);
        let ctx = AgentContext {
            policy: &policy,
            graph: &graph,
            mode: &view,
            now: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        };

        let plan = EnergyPlan {
            steps: vec![PumpStep {
                hour: 0,
                pumps_on: 3,
                price: 0.1,
                pressure_kpa: 230.0,
            }],
            savings_pct: 12.0,
            min_pressure_kpa: 230.0,
            max_pumps_on: 3,
        };
        let out = watcher
            .handle(&event(9, "energy_opt", EventKind::EnergyPlan(plan)), &ctx)
            .unwrap();
        assert_eq!(
            types(&out),
            vec!["guardrail.breach", "guardrail.breach", "system.mode"]
        );
        match &out[0] {
            EventKind::GuardrailBreach(b) => {
                assert_eq!(b.guardrail, "max_parallel_pumps");
                assert_eq!(b.trigger_seq, 9);
            }
            other => panic!("Expected GuardrailBreach, got {:?}", other),
        }
        assert_eq!(watcher.breaches(), 2);
    }

    #[test]
    fn test_resume_requires_operator() {
        let policy = Policy::builtin();
        let graph = NetworkGraph::sample();
        let (controller, view) = ModeController::new();
        let mut watcher = WatcherAgent::new(controller, 42);
        let ctx = AgentContext {
            policy: &policy,
            graph: &graph,
            mode: &view,
            now: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        };
        let failed = EventKind::ActuationFailed(ActuationTransition {
            action_id: ActionId::derive("P1", ctx.now, 1),
            leak_location: "P1".to_string(),
            from: ActionState::Executing,
            to: ActionState::Failed,
            actor: "actuator".to_string(),
        });
        watcher.handle(&event(1, "actuator", failed), &ctx).unwrap();
        assert!(view.is_safe());

        let resume = || {
            EventKind::ModeResume(ModeResume {
                operator: "op-1".to_string(),
            })
        };
        let out = watcher.handle(&event(2, "planner", resume()), &ctx).unwrap();
        assert!(out.is_empty());
        assert!(view.is_safe());

        let out = watcher.handle(&event(3, OPERATOR, resume()), &ctx).unwrap();
        assert_eq!(types(&out), vec!["system.mode"]);
        assert_eq!(view.current(), SystemMode::Auto);
    }
}
