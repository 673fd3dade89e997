//! Actuator agent: drives the isolation state machine.
//!
//! Every successful transition is republished as the matching
//! `actuation.*` event; every refused one becomes `actuation.rejected`.
//! Execution is split over two events so that a fault injected while the
//! action is EXECUTING lands before the valves are touched.

use tracing::{info, warn};

use super::{Agent, AgentContext, AgentError};
use crate::adapters::{SimulatedValves, ValveActuator};
use crate::core::audit_store::AuditLog;
use crate::core::policy::ACTUATOR;
use crate::core::state_machine::{
    ActuationFailure, ExecutionGate, IsolationStateMachine, TransitionError,
};
use crate::domain::events::{ActuationRejected, ActuationTransition, IsolationPlanned};
use crate::domain::{ActionId, ActionState, Event, EventKind, SystemMode, TransitionRecord};

pub struct ActuatorAgent {
    machine: IsolationStateMachine,
    valves: Box<dyn ValveActuator>,
    /// Gate evaluated for the most recent execution attempt
    last_gate: Option<ExecutionGate>,
}

impl ActuatorAgent {
    /// Create an actuator whose transitions append to `audit`
    pub fn new(audit: AuditLog, valves: Box<dyn ValveActuator>) -> Self {
        Self {
            machine: IsolationStateMachine::new(audit),
            valves,
            last_gate: None,
        }
    }

    /// Actuator with in-memory valves
    pub fn simulated(audit: AuditLog) -> Self {
        Self::new(audit, Box::new(SimulatedValves::new()))
    }

    pub fn machine(&self) -> &IsolationStateMachine {
        &self.machine
    }

    pub fn last_gate(&self) -> Option<ExecutionGate> {
        self.last_gate
    }

    fn transition_event(&self, record: &TransitionRecord) -> EventKind {
        let leak_location = self
            .machine
            .action(record.action_id)
            .map(|a| a.leak_location.clone())
            .unwrap_or_default();

        EventKind::for_transition(ActuationTransition {
            action_id: record.action_id,
            leak_location,
            from: record.from_state,
            to: record.to_state,
            actor: record.actor.clone(),
        })
    }

    fn rejected(action_id: ActionId, operation: &str, error: &TransitionError) -> EventKind {
        warn!(%action_id, operation, error = %error, "Actuation rejected");
        EventKind::ActuationRejected(ActuationRejected {
            action_id,
            operation: operation.to_string(),
            reason: error.to_string(),
        })
    }

    fn gate_for(&self, id: ActionId, ctx: &AgentContext<'_>) -> ExecutionGate {
        let origin_auto_execute = self
            .machine
            .action(id)
            .map(|a| ctx.policy_for(&a.origin_agent).auto_execute)
            .unwrap_or(false);

        ExecutionGate {
            origin_auto_execute,
            mode: ctx.mode(),
        }
    }

    fn on_plan(&mut self, planned: &IsolationPlanned, ctx: &AgentContext<'_>) -> Vec<EventKind> {
        let action = &planned.action;
        let id = action.id;

        let proposed = match self.machine.propose(action.clone(), ACTUATOR, ctx.now) {
            Ok(record) => record,
            Err(e) => return vec![Self::rejected(id, "propose", &e)],
        };
        let mut out = vec![self.transition_event(&proposed)];

        let auto_enabled = ctx.policy_for(&action.origin_agent).auto_execute
            && ctx.mode() == SystemMode::Auto
            && planned.confidence >= ctx.policy_for(ACTUATOR).min_confidence;

        match self.machine.approve(id, None, auto_enabled, ctx.now) {
            Ok(record) => out.push(self.transition_event(&record)),
            Err(e) => out.push(Self::rejected(id, "approve", &e)),
        }
        out
    }

    fn on_approved(&mut self, id: ActionId, ctx: &AgentContext<'_>) -> Vec<EventKind> {
        if self.machine.state(id) != Some(ActionState::Approved) {
            return Vec::new();
        }

        let gate = self.gate_for(id, ctx);
        self.last_gate = Some(gate);

        match self.machine.begin_execution(id, gate, ACTUATOR, ctx.now) {
            Ok(record) => vec![self.transition_event(&record)],
            Err(e) => vec![Self::rejected(id, "execute", &e)],
        }
    }

    fn on_executing(&mut self, id: ActionId, ctx: &AgentContext<'_>) -> Vec<EventKind> {
        // A fault may already have failed the action
        if self.machine.state(id) != Some(ActionState::Executing) {
            return Vec::new();
        }

        let valves = self
            .machine
            .action(id)
            .map(|a| a.valve_sequence.clone())
            .unwrap_or_default();
        let mut outcome = Ok(());
        for valve in &valves {
            if let Err(failure) = self.valves.close(valve) {
                outcome = Err(failure);
                break;
            }
        }

        self.finish(id, outcome, ctx)
    }

    fn on_chaos(&mut self, id: ActionId, fault: &str, ctx: &AgentContext<'_>) -> Vec<EventKind> {
        if self.machine.state(id) != Some(ActionState::Executing) {
            return Vec::new();
        }

        let valve = self
            .machine
            .action(id)
            .and_then(|a| a.valve_sequence.first().cloned())
            .unwrap_or_default();
        let failure = ActuationFailure {
            valve,
            reason: fault.to_string(),
        };
        self.finish(id, Err(failure), ctx)
    }

    /// Complete an execution and roll back failures when allowed
    fn finish(
        &mut self,
        id: ActionId,
        outcome: Result<(), ActuationFailure>,
        ctx: &AgentContext<'_>,
    ) -> Vec<EventKind> {
        let failed = outcome.is_err();
        let record = match self.machine.complete_execution(id, outcome, ACTUATOR, ctx.now) {
            Ok(record) => record,
            Err(e) => return vec![Self::rejected(id, "complete", &e)],
        };

        let mut out = vec![self.transition_event(&record)];
        if !failed {
            info!(action_id = %id, actuator = self.valves.name(), "Isolation active");
            return out;
        }

        if ctx.policy_for(ACTUATOR).budgets.auto_rollback {
            out.extend(self.roll_back(id, ACTUATOR, ctx));
        }
        out
    }

    fn roll_back(&mut self, id: ActionId, actor: &str, ctx: &AgentContext<'_>) -> Vec<EventKind> {
        let records = match self.machine.rollback(id, actor, ctx.now) {
            Ok(records) => records,
            Err(e) => return vec![Self::rejected(id, "rollback", &e)],
        };

        let valves = self
            .machine
            .action(id)
            .map(|a| a.valve_sequence.clone())
            .unwrap_or_default();
        for valve in valves.iter().rev() {
            if let Err(e) = self.valves.open(valve) {
                warn!(%valve, error = %e, "Valve did not reopen during rollback");
            }
        }

        info!(action_id = %id, actor, "Isolation rolled back");
        records.iter().map(|r| self.transition_event(r)).collect()
    }

    fn on_operator_approval(
        &mut self,
        id: ActionId,
        approver: &str,
        ctx: &AgentContext<'_>,
    ) -> Vec<EventKind> {
        match self.machine.state(id) {
            // Already approved automatically but held back by the gate
            Some(ActionState::Approved) => match self.machine.record_approver(id, approver) {
                Ok(()) => self.on_approved(id, ctx),
                Err(e) => vec![Self::rejected(id, "approve", &e)],
            },
            _ => match self.machine.approve(id, Some(approver), false, ctx.now) {
                Ok(record) => vec![self.transition_event(&record)],
                Err(e) => vec![Self::rejected(id, "approve", &e)],
            },
        }
    }
}

impl Agent for ActuatorAgent {
    fn name(&self) -> &str {
        ACTUATOR
    }

    fn subscriptions(&self) -> Vec<String> {
        [
            "plan.isolation",
            "actuation.approved",
            "actuation.executing",
            "chaos.injected",
            "operator.approval",
            "operator.rollback",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }

    fn handle(&mut self, event: &Event, ctx: &AgentContext<'_>) -> Result<Vec<EventKind>, AgentError> {
        let own = event.source_agent == ACTUATOR;

        let out = match &event.kind {
            EventKind::IsolationPlanned(planned) => self.on_plan(planned, ctx),
            EventKind::ActuationApproved(t) if own => self.on_approved(t.action_id, ctx),
            EventKind::ActuationExecuting(t) if own => self.on_executing(t.action_id, ctx),
            EventKind::ChaosInjected(chaos) => self.on_chaos(chaos.action_id, &chaos.fault, ctx),
            EventKind::OperatorApproval(op) => {
                self.on_operator_approval(op.action_id, &op.approver, ctx)
            }
            EventKind::OperatorRollback(op) => self.roll_back(op.action_id, &op.operator, ctx),
            _ => Vec::new(),
        };
        Ok(out)
    }
}
