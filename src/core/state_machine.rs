//! Isolation action lifecycle.
//!
//! ```text
//! NORMAL -> PROPOSED -> APPROVED -> EXECUTING -> ACTIVE -> ROLLING_BACK -> RECOVERY -> NORMAL
//!                                       |                      ^
//!                                       +-----> FAILED --------+
//! ```
//!
//! The machine owns every action it has seen. Each successful transition
//! appends exactly one record to the shared [`AuditLog`]; a refused
//! transition leaves state and log untouched.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::debug;

use super::audit_store::AuditLog;
use crate::domain::{
    ActionHistory, ActionId, ActionState, IsolationAction, SystemMode, TransitionRecord,
};

/// Errors from the transition API
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("Action {action_id} requires operator approval")]
    ApprovalRequired { action_id: ActionId },

    #[error("Cannot {operation} action {action_id} from state {from}")]
    InvalidTransition {
        action_id: ActionId,
        from: ActionState,
        operation: &'static str,
    },

    #[error("Unknown action {0}")]
    UnknownAction(ActionId),
}

/// A valve operation that did not complete
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Actuation failed at valve {valve}: {reason}")]
pub struct ActuationFailure {
    pub valve: String,
    pub reason: String,
}

/// Conditions under which an action without an approver may execute
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionGate {
    /// `auto_execute` of the agent the action originated from
    pub origin_auto_execute: bool,
    /// System mode at the time of execution
    pub mode: SystemMode,
}

impl ExecutionGate {
    /// Whether the action may execute
    pub fn permits(&self, action: &IsolationAction) -> bool {
        action.has_approver() || (self.origin_auto_execute && self.mode == SystemMode::Auto)
    }
}

/// Owner of all isolation actions
#[derive(Debug, Default)]
pub struct IsolationStateMachine {
    actions: BTreeMap<ActionId, IsolationAction>,
    audit: AuditLog,
}

/// Move an action to `to` and append its audit record
fn advance(
    audit: &AuditLog,
    action: &mut IsolationAction,
    to: ActionState,
    actor: &str,
    at: DateTime<Utc>,
) -> TransitionRecord {
    let from = action.state;
    action.state = to;
    debug!(action_id = %action.id, %from, %to, actor, "Isolation transition");
    audit.append(action.id, from, to, actor, at)
}

fn invalid(action: &IsolationAction, operation: &'static str) -> TransitionError {
    TransitionError::InvalidTransition {
        action_id: action.id,
        from: action.state,
        operation,
    }
}

impl IsolationStateMachine {
    /// Create a machine appending to the given audit log
    pub fn new(audit: AuditLog) -> Self {
        Self {
            actions: BTreeMap::new(),
            audit,
        }
    }

    pub fn audit_log(&self) -> &AuditLog {
        &self.audit
    }

    /// Register an action and move it to PROPOSED.
    ///
    /// A known id may only be proposed again from NORMAL or RECOVERY.
    pub fn propose(
        &mut self,
        action: IsolationAction,
        actor: &str,
        at: DateTime<Utc>,
    ) -> Result<TransitionRecord, TransitionError> {
        let id = action.id;
        let mut incoming = IsolationAction {
            state: ActionState::Normal,
            approved_by: None,
            executed_at: None,
            rolled_back_at: None,
            ..action
        };

        if let Some(existing) = self.actions.get(&id) {
            match existing.state {
                ActionState::Normal | ActionState::Recovery => incoming.state = existing.state,
                _ => return Err(invalid(existing, "propose")),
            }
        }

        let record = advance(&self.audit, &mut incoming, ActionState::Proposed, actor, at);
        self.actions.insert(id, incoming);
        Ok(record)
    }

    /// PROPOSED -> APPROVED.
    ///
    /// Without an approver this only succeeds when auto-execution is enabled.
    pub fn approve(
        &mut self,
        id: ActionId,
        approved_by: Option<&str>,
        auto_execute_enabled: bool,
        at: DateTime<Utc>,
    ) -> Result<TransitionRecord, TransitionError> {
        let action = self
            .actions
            .get_mut(&id)
            .ok_or(TransitionError::UnknownAction(id))?;

        if action.state != ActionState::Proposed {
            return Err(invalid(action, "approve"));
        }

        let approver = approved_by.map(str::trim).filter(|who| !who.is_empty());
        let actor = match approver {
            Some(who) => {
                action.approved_by = Some(who.to_string());
                who.to_string()
            }
            None if auto_execute_enabled => "auto".to_string(),
            None => return Err(TransitionError::ApprovalRequired { action_id: id }),
        };

        Ok(advance(&self.audit, action, ActionState::Approved, &actor, at))
    }

    /// Attach an operator to an action that was approved automatically.
    ///
    /// The state does not change, so no audit record is written.
    pub fn record_approver(&mut self, id: ActionId, approver: &str) -> Result<(), TransitionError> {
        let action = self
            .actions
            .get_mut(&id)
            .ok_or(TransitionError::UnknownAction(id))?;

        let approver = approver.trim();
        if action.state != ActionState::Approved {
            return Err(invalid(action, "endorse"));
        }
        if approver.is_empty() {
            return Err(TransitionError::ApprovalRequired { action_id: id });
        }
        action.approved_by = Some(approver.to_string());
        Ok(())
    }

    /// APPROVED -> EXECUTING, if the gate permits
    pub fn begin_execution(
        &mut self,
        id: ActionId,
        gate: ExecutionGate,
        actor: &str,
        at: DateTime<Utc>,
    ) -> Result<TransitionRecord, TransitionError> {
        let action = self
            .actions
            .get_mut(&id)
            .ok_or(TransitionError::UnknownAction(id))?;

        if action.state != ActionState::Approved {
            return Err(invalid(action, "execute"));
        }
        if !gate.permits(action) {
            return Err(TransitionError::ApprovalRequired { action_id: id });
        }

        Ok(advance(&self.audit, action, ActionState::Executing, actor, at))
    }

    /// EXECUTING -> ACTIVE on success, EXECUTING -> FAILED on failure
    pub fn complete_execution(
        &mut self,
        id: ActionId,
        outcome: Result<(), ActuationFailure>,
        actor: &str,
        at: DateTime<Utc>,
    ) -> Result<TransitionRecord, TransitionError> {
        let action = self
            .actions
            .get_mut(&id)
            .ok_or(TransitionError::UnknownAction(id))?;

        if action.state != ActionState::Executing {
            return Err(invalid(action, "complete"));
        }

        let record = match outcome {
            Ok(()) => {
                action.executed_at = Some(at);
                advance(&self.audit, action, ActionState::Active, actor, at)
            }
            Err(failure) => {
                debug!(action_id = %id, error = %failure, "Actuation failed");
                advance(&self.audit, action, ActionState::Failed, actor, at)
            }
        };
        Ok(record)
    }

    /// Run the whole execution: gate check, actuation, completion
    pub fn execute<F>(
        &mut self,
        id: ActionId,
        gate: ExecutionGate,
        actor: &str,
        at: DateTime<Utc>,
        actuate: F,
    ) -> Result<Vec<TransitionRecord>, TransitionError>
    where
        F: FnOnce(&IsolationAction) -> Result<(), ActuationFailure>,
    {
        let started = self.begin_execution(id, gate, actor, at)?;
        let action = self
            .actions
            .get(&id)
            .ok_or(TransitionError::UnknownAction(id))?;
        let outcome = actuate(action);
        let finished = self.complete_execution(id, outcome, actor, at)?;
        Ok(vec![started, finished])
    }

    /// ACTIVE or FAILED -> ROLLING_BACK -> RECOVERY -> NORMAL
    pub fn rollback(
        &mut self,
        id: ActionId,
        actor: &str,
        at: DateTime<Utc>,
    ) -> Result<Vec<TransitionRecord>, TransitionError> {
        let action = self
            .actions
            .get_mut(&id)
            .ok_or(TransitionError::UnknownAction(id))?;

        if !matches!(action.state, ActionState::Active | ActionState::Failed) {
            return Err(invalid(action, "roll back"));
        }

        let mut records = Vec::with_capacity(3);
        for to in [
            ActionState::RollingBack,
            ActionState::Recovery,
            ActionState::Normal,
        ] {
            records.push(advance(&self.audit, action, to, actor, at));
        }
        action.rolled_back_at = Some(at);

        Ok(records)
    }

    pub fn state(&self, id: ActionId) -> Option<ActionState> {
        self.actions.get(&id).map(|a| a.state)
    }

    pub fn action(&self, id: ActionId) -> Option<&IsolationAction> {
        self.actions.get(&id)
    }

    pub fn actions(&self) -> impl Iterator<Item = &IsolationAction> {
        self.actions.values()
    }

    /// Audit history of one action
    pub fn history(&self, id: ActionId) -> Option<ActionHistory> {
        ActionHistory::from_records(id, &self.audit.for_action(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::BTreeMap;

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, minute, 0).unwrap()
    }

    fn action(leak: &str) -> IsolationAction {
        IsolationAction {
            id: ActionId::derive(leak, at(0), 1),
            leak_location: leak.to_string(),
            valve_sequence: vec!["V1".to_string(), "V2".to_string()],
            valve_hops: BTreeMap::from([("V1".to_string(), 1), ("V2".to_string(), 1)]),
            estimated_customers_affected: 0,
            estimated_water_loss_l: 480.0,
            state: ActionState::Proposed,
            approved_by: None,
            origin_agent: "planner".to_string(),
            created_at: at(0),
            executed_at: None,
            rolled_back_at: None,
        }
    }

    const AUTO: ExecutionGate = ExecutionGate {
        origin_auto_execute: true,
        mode: SystemMode::Auto,
    };

    const MANUAL: ExecutionGate = ExecutionGate {
        origin_auto_execute: false,
        mode: SystemMode::Auto,
    };

    fn ok(_: &IsolationAction) -> Result<(), ActuationFailure> {
        Ok(())
    }

    #[test]
    fn test_happy_path_with_operator() {
        let mut machine = IsolationStateMachine::default();
        let a = action("P1");
        let id = a.id;

        machine.propose(a, "actuator", at(1)).unwrap();
        machine.approve(id, Some("op-1"), false, at(2)).unwrap();
        let records = machine.execute(id, MANUAL, "actuator", at(3), ok).unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(machine.state(id), Some(ActionState::Active));
        assert_eq!(machine.action(id).unwrap().approved_by.as_deref(), Some("op-1"));
        assert_eq!(machine.action(id).unwrap().executed_at, Some(at(3)));
        assert_eq!(machine.audit_log().len(), 4);
    }

    #[test]
    fn test_approval_required_without_operator() {
        let mut machine = IsolationStateMachine::default();
        let a = action("P1");
        let id = a.id;
        machine.propose(a, "actuator", at(1)).unwrap();

        let err = machine.approve(id, None, false, at(2)).unwrap_err();
        assert_eq!(err, TransitionError::ApprovalRequired { action_id: id });

        let err = machine.approve(id, Some("   "), false, at(2)).unwrap_err();
        assert!(matches!(err, TransitionError::ApprovalRequired { .. }));

        assert_eq!(machine.state(id), Some(ActionState::Proposed));
        assert_eq!(machine.audit_log().len(), 1);
    }

    #[test]
    fn test_gate_blocks_auto_approved_action_in_safe_mode() {
        let mut machine = IsolationStateMachine::default();
        let a = action("P1");
        let id = a.id;
        machine.propose(a, "actuator", at(1)).unwrap();
        machine.approve(id, None, true, at(2)).unwrap();

        let safe = ExecutionGate {
            origin_auto_execute: true,
            mode: SystemMode::Safe,
        };
        let err = machine.execute(id, safe, "actuator", at(3), ok).unwrap_err();
        assert_eq!(err, TransitionError::ApprovalRequired { action_id: id });
        assert_eq!(machine.state(id), Some(ActionState::Approved));

        machine.execute(id, AUTO, "actuator", at(4), ok).unwrap();
        assert_eq!(machine.state(id), Some(ActionState::Active));
    }

    #[test]
    fn test_operator_endorses_auto_approved_action() {
        let mut machine = IsolationStateMachine::default();
        let a = action("P1");
        let id = a.id;
        machine.propose(a, "actuator", at(1)).unwrap();
        machine.approve(id, None, true, at(2)).unwrap();

        machine.record_approver(id, "op-2").unwrap();
        let safe = ExecutionGate {
            origin_auto_execute: true,
            mode: SystemMode::Safe,
        };
        machine.execute(id, safe, "actuator", at(3), ok).unwrap();
        assert_eq!(machine.state(id), Some(ActionState::Active));
        assert!(matches!(
            machine.record_approver(id, "op-2"),
            Err(TransitionError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_failure_then_rollback() {
        let mut machine = IsolationStateMachine::default();
        let a = action("P1");
        let id = a.id;
        machine.propose(a, "actuator", at(1)).unwrap();
        machine.approve(id, Some("op"), false, at(2)).unwrap();
        machine
            .execute(id, MANUAL, "actuator", at(3), |_| {
                Err(ActuationFailure {
                    valve: "V1".to_string(),
                    reason: "stuck".to_string(),
                })
            })
            .unwrap();
        assert_eq!(machine.state(id), Some(ActionState::Failed));

        let records = machine.rollback(id, "actuator", at(4)).unwrap();
        let hops: Vec<_> = records.iter().map(|r| r.to_state).collect();
        assert_eq!(
            hops,
            vec![
                ActionState::RollingBack,
                ActionState::Recovery,
                ActionState::Normal
            ]
        );
        assert_eq!(machine.state(id), Some(ActionState::Normal));
        assert_eq!(machine.action(id).unwrap().rolled_back_at, Some(at(4)));

        let history = machine.history(id).unwrap();
        assert_eq!(history.transitions.len(), 7);
        assert!(history.was_executed());
    }

    #[test]
    fn test_invalid_transitions_leave_state_unchanged() {
        let mut machine = IsolationStateMachine::default();
        let a = action("P1");
        let id = a.id;
        machine.propose(a.clone(), "actuator", at(1)).unwrap();

        match machine.rollback(id, "op", at(2)) {
            Err(TransitionError::InvalidTransition { from, operation, .. }) => {
                assert_eq!(from, ActionState::Proposed);
                assert_eq!(operation, "roll back");
            }
            other => panic!("Expected InvalidTransition, got {:?}", other),
        }

        assert!(matches!(
            machine.begin_execution(id, AUTO, "actuator", at(2)),
            Err(TransitionError::InvalidTransition { .. })
        ));
        assert!(matches!(
            machine.propose(a, "actuator", at(2)),
            Err(TransitionError::InvalidTransition { .. })
        ));

        assert_eq!(machine.state(id), Some(ActionState::Proposed));
        assert_eq!(machine.audit_log().len(), 1);
    }

    #[test]
    fn test_reproposal_after_rollback() {
        let mut machine = IsolationStateMachine::default();
        let a = action("P1");
        let id = a.id;
        machine.propose(a.clone(), "actuator", at(1)).unwrap();
        machine.approve(id, Some("op"), false, at(2)).unwrap();
        machine.execute(id, MANUAL, "actuator", at(3), ok).unwrap();
        machine.rollback(id, "op", at(4)).unwrap();

        let record = machine.propose(a, "actuator", at(5)).unwrap();
        assert_eq!(record.from_state, ActionState::Normal);
        assert_eq!(machine.action(id).unwrap().approved_by, None);
    }

    #[test]
    fn test_unknown_action() {
        let mut machine = IsolationStateMachine::default();
        let id = ActionId::derive("nowhere", at(0), 9);
        assert_eq!(
            machine.approve(id, Some("op"), false, at(1)),
            Err(TransitionError::UnknownAction(id))
        );
        assert!(machine.history(id).is_none());
        assert!(machine.state(id).is_none());
    }
}
