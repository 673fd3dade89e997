//! Event types carried by the bus.
//!
//! Every message between agents is an [`Event`]: an envelope stamped by the
//! bus (sequence number, logical time, source agent) around a strongly typed
//! [`EventKind`]. Events are immutable once published and the ordered list of
//! them is the episode timeline.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::action::{ActionId, ActionState, IsolationAction};
use super::telemetry::{TariffUpdate, TelemetryWindow};

/// A single published event.
///
/// Serialized as `{seq, timestamp, source_agent, type, payload}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Position in the episode's total order
    pub seq: u64,

    /// Logical time of the tick that caused this event
    pub timestamp: DateTime<Utc>,

    /// Agent (or external party) that produced the event
    pub source_agent: String,

    /// Type tag and payload
    #[serde(flatten)]
    pub kind: EventKind,
}

impl Event {
    /// Dot-namespaced type tag
    pub fn event_type(&self) -> &'static str {
        self.kind.event_type()
    }
}

/// Process-wide operating mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemMode {
    /// Agents may act within their guardrails
    Auto,
    /// Every actuation needs an operator approval
    Safe,
}

impl fmt::Display for SystemMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => f.write_str("auto"),
            Self::Safe => f.write_str("safe"),
        }
    }
}

/// All event types and their payloads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum EventKind {
    #[serde(rename = "telemetry.window")]
    TelemetryWindow(TelemetryWindow),

    #[serde(rename = "tariff.update")]
    TariffUpdate(TariffUpdate),

    #[serde(rename = "alert.leak")]
    LeakAlert(LeakAlert),

    #[serde(rename = "plan.isolation")]
    IsolationPlanned(IsolationPlanned),

    #[serde(rename = "plan.infeasible")]
    PlanInfeasible(PlanInfeasible),

    #[serde(rename = "energy.plan")]
    EnergyPlan(EnergyPlan),

    #[serde(rename = "actuation.proposed")]
    ActuationProposed(ActuationTransition),

    #[serde(rename = "actuation.approved")]
    ActuationApproved(ActuationTransition),

    #[serde(rename = "actuation.executing")]
    ActuationExecuting(ActuationTransition),

    #[serde(rename = "actuation.executed")]
    ActuationExecuted(ActuationTransition),

    #[serde(rename = "actuation.failed")]
    ActuationFailed(ActuationTransition),

    #[serde(rename = "actuation.rolling_back")]
    ActuationRollingBack(ActuationTransition),

    #[serde(rename = "actuation.recovered")]
    ActuationRecovered(ActuationTransition),

    #[serde(rename = "actuation.restored")]
    ActuationRestored(ActuationTransition),

    #[serde(rename = "actuation.rejected")]
    ActuationRejected(ActuationRejected),

    #[serde(rename = "guardrail.breach")]
    GuardrailBreach(GuardrailBreach),

    #[serde(rename = "chaos.injected")]
    ChaosInjected(ChaosInjected),

    #[serde(rename = "system.mode")]
    SystemMode(ModeChange),

    #[serde(rename = "system.mode.resume")]
    ModeResume(ModeResume),

    #[serde(rename = "operator.approval")]
    OperatorApproval(OperatorApproval),

    #[serde(rename = "operator.rollback")]
    OperatorRollback(OperatorRollback),
}

impl EventKind {
    /// Dot-namespaced type tag, identical to the serialized `type` field
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::TelemetryWindow(_) => "telemetry.window",
            Self::TariffUpdate(_) => "tariff.update",
            Self::LeakAlert(_) => "alert.leak",
            Self::IsolationPlanned(_) => "plan.isolation",
            Self::PlanInfeasible(_) => "plan.infeasible",
            Self::EnergyPlan(_) => "energy.plan",
            Self::ActuationProposed(_) => "actuation.proposed",
            Self::ActuationApproved(_) => "actuation.approved",
            Self::ActuationExecuting(_) => "actuation.executing",
            Self::ActuationExecuted(_) => "actuation.executed",
            Self::ActuationFailed(_) => "actuation.failed",
            Self::ActuationRollingBack(_) => "actuation.rolling_back",
            Self::ActuationRecovered(_) => "actuation.recovered",
            Self::ActuationRestored(_) => "actuation.restored",
            Self::ActuationRejected(_) => "actuation.rejected",
            Self::GuardrailBreach(_) => "guardrail.breach",
            Self::ChaosInjected(_) => "chaos.injected",
            Self::SystemMode(_) => "system.mode",
            Self::ModeResume(_) => "system.mode.resume",
            Self::OperatorApproval(_) => "operator.approval",
            Self::OperatorRollback(_) => "operator.rollback",
        }
    }

    /// Build the `actuation.*` event matching a state transition
    pub fn for_transition(transition: ActuationTransition) -> Self {
        match transition.to {
            ActionState::Proposed => Self::ActuationProposed(transition),
            ActionState::Approved => Self::ActuationApproved(transition),
            ActionState::Executing => Self::ActuationExecuting(transition),
            ActionState::Active => Self::ActuationExecuted(transition),
            ActionState::Failed => Self::ActuationFailed(transition),
            ActionState::RollingBack => Self::ActuationRollingBack(transition),
            ActionState::Recovery => Self::ActuationRecovered(transition),
            ActionState::Normal => Self::ActuationRestored(transition),
        }
    }
}

/// Leak alert raised by the leak detector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeakAlert {
    pub entity_id: String,
    /// Pipe believed to be leaking
    pub pipe_id: String,
    /// Leak probability in [0, 1]
    pub probability: f64,
    pub reasons: Vec<String>,
}

/// A proposed isolation action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IsolationPlanned {
    /// Snapshot of the action in PROPOSED state
    pub action: IsolationAction,
    /// Hop radius the planner searched
    pub radius_hops: u32,
    /// Probability of the alert that triggered planning
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanInfeasible {
    pub leak_location: String,
    pub radius_hops: u32,
    pub reason: String,
}

/// Pump setting for one hour of the planning horizon
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PumpStep {
    pub hour: u32,
    pub pumps_on: u32,
    pub price: f64,
    pub pressure_kpa: f64,
}

/// Pump schedule produced by the energy optimizer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnergyPlan {
    pub steps: Vec<PumpStep>,
    /// Cost saving against running every pump at the flat schedule
    pub savings_pct: f64,
    pub min_pressure_kpa: f64,
    pub max_pumps_on: u32,
}

/// One isolation state transition as seen on the bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActuationTransition {
    pub action_id: ActionId,
    pub leak_location: String,
    pub from: ActionState,
    pub to: ActionState,
    pub actor: String,
}

/// An operation on an action that the state machine refused
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActuationRejected {
    pub action_id: ActionId,
    pub operation: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardrailBreach {
    /// Name of the violated guardrail key
    pub guardrail: String,
    pub observed: f64,
    pub limit: f64,
    /// Sequence number of the event that breached it
    pub trigger_seq: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChaosInjected {
    pub action_id: ActionId,
    pub fault: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModeChange {
    pub mode: SystemMode,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModeResume {
    pub operator: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperatorApproval {
    pub action_id: ActionId,
    pub approver: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperatorRollback {
    pub action_id: ActionId,
    pub operator: String,
}
