//! Isolation actions and their audit trail.
//!
//! An [`IsolationAction`] is a planned sequence of valve closures for one
//! leak. Its lifecycle is driven exclusively by the isolation state machine;
//! every transition appends one [`TransitionRecord`].

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of an isolation action.
///
/// Ids are UUIDv5 values derived from the planning inputs, so the same
/// episode always produces the same ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionId(Uuid);

impl ActionId {
    /// Derive an id from the leak location, planning time and planner ordinal
    pub fn derive(leak_location: &str, planned_at: DateTime<Utc>, ordinal: u64) -> Self {
        let name = format!("{}:{}:{}", leak_location, planned_at.to_rfc3339(), ordinal);
        Self(Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()))
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for ActionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Lifecycle state of an isolation action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionState {
    Normal,
    Proposed,
    Approved,
    Executing,
    Active,
    Failed,
    RollingBack,
    Recovery,
}

impl ActionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "NORMAL",
            Self::Proposed => "PROPOSED",
            Self::Approved => "APPROVED",
            Self::Executing => "EXECUTING",
            Self::Active => "ACTIVE",
            Self::Failed => "FAILED",
            Self::RollingBack => "ROLLING_BACK",
            Self::Recovery => "RECOVERY",
        }
    }
}

impl Default for ActionState {
    fn default() -> Self {
        Self::Normal
    }
}

impl fmt::Display for ActionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NORMAL" => Ok(Self::Normal),
            "PROPOSED" => Ok(Self::Proposed),
            "APPROVED" => Ok(Self::Approved),
            "EXECUTING" => Ok(Self::Executing),
            "ACTIVE" => Ok(Self::Active),
            "FAILED" => Ok(Self::Failed),
            "ROLLING_BACK" => Ok(Self::RollingBack),
            "RECOVERY" => Ok(Self::Recovery),
            other => Err(format!("unknown action state: {}", other)),
        }
    }
}

/// A planned (and possibly executed) valve-closure sequence for one leak
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IsolationAction {
    /// Deterministic action identifier
    pub id: ActionId,

    /// Pipe id of the leaking segment
    pub leak_location: String,

    /// Valves in closure order (nearest first)
    pub valve_sequence: Vec<String>,

    /// Hop distance of each selected valve from the leak
    pub valve_hops: BTreeMap<String, u32>,

    /// Customers left without supply once the sequence is closed
    pub estimated_customers_affected: u32,

    /// Litres lost on affected pipes until closure completes
    pub estimated_water_loss_l: f64,

    /// Current lifecycle state
    pub state: ActionState,

    /// Operator identity that approved the action (None when auto-approved)
    pub approved_by: Option<String>,

    /// Agent whose policy governs auto-execution of this action
    pub origin_agent: String,

    pub created_at: DateTime<Utc>,

    pub executed_at: Option<DateTime<Utc>>,

    pub rolled_back_at: Option<DateTime<Utc>>,
}

impl IsolationAction {
    /// Largest hop distance among the selected valves
    pub fn max_hops(&self) -> u32 {
        self.valve_hops.values().copied().max().unwrap_or(0)
    }

    pub fn has_approver(&self) -> bool {
        self.approved_by
            .as_deref()
            .map(|who| !who.trim().is_empty())
            .unwrap_or(false)
    }
}

/// One audit entry: a single state transition of a single action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRecord {
    /// Position in the global audit order
    pub seq: u64,

    pub action_id: ActionId,

    pub from_state: ActionState,

    pub to_state: ActionState,

    /// Who caused the transition (agent name, operator id, or "auto")
    pub actor: String,

    pub timestamp: DateTime<Utc>,
}

/// State of an action reconstructed from its audit records
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionHistory {
    pub action_id: ActionId,
    pub state: ActionState,
    pub transitions: Vec<TransitionRecord>,
}

impl ActionHistory {
    /// Rebuild an action's history from audit records (other ids are ignored)
    pub fn from_records(action_id: ActionId, records: &[TransitionRecord]) -> Option<Self> {
        let mut history = Self {
            action_id,
            state: ActionState::Normal,
            transitions: Vec::new(),
        };

        for record in records.iter().filter(|r| r.action_id == action_id) {
            history.apply(record);
        }

        if history.transitions.is_empty() {
            None
        } else {
            Some(history)
        }
    }

    /// Apply a single record
    pub fn apply(&mut self, record: &TransitionRecord) {
        self.state = record.to_state;
        self.transitions.push(record.clone());
    }

    /// Whether the action passed through EXECUTING at some point
    pub fn was_executed(&self) -> bool {
        self.transitions
            .iter()
            .any(|t| t.to_state == ActionState::Executing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, minute, 0).unwrap()
    }

    fn record(seq: u64, id: ActionId, from: ActionState, to: ActionState) -> TransitionRecord {
        TransitionRecord {
            seq,
            action_id: id,
            from_state: from,
            to_state: to,
            actor: "test".to_string(),
            timestamp: at(seq as u32),
        }
    }

    #[test]
    fn test_action_id_is_deterministic() {
        let a = ActionId::derive("P_J2_J3", at(0), 1);
        let b = ActionId::derive("P_J2_J3", at(0), 1);
        let c = ActionId::derive("P_J2_J3", at(0), 2);

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.to_string().parse::<ActionId>().unwrap(), a);
    }

    #[test]
    fn test_state_serialization() {
        let json = serde_json::to_string(&ActionState::RollingBack).unwrap();
        assert_eq!(json, "\"ROLLING_BACK\"");
        assert_eq!("ROLLING_BACK".parse::<ActionState>(), Ok(ActionState::RollingBack));
        assert!("rolling".parse::<ActionState>().is_err());
    }

    #[test]
    fn test_history_from_records() {
        let id = ActionId::derive("P1", at(0), 1);
        let other = ActionId::derive("P2", at(0), 1);

        let records = vec![
            record(1, id, ActionState::Normal, ActionState::Proposed),
            record(2, other, ActionState::Normal, ActionState::Proposed),
            record(3, id, ActionState::Proposed, ActionState::Approved),
            record(4, id, ActionState::Approved, ActionState::Executing),
            record(5, id, ActionState::Executing, ActionState::Active),
        ];

        let history = ActionHistory::from_records(id, &records).unwrap();
        assert_eq!(history.state, ActionState::Active);
        assert_eq!(history.transitions.len(), 4);
        assert!(history.was_executed());

        let missing = ActionId::derive("P3", at(0), 1);
        assert!(ActionHistory::from_records(missing, &records).is_none());
    }
}
