//! Episode driver.
//!
//! An episode wires a fresh bus with the five agents, publishes a fixed
//! sequence of external inputs (ticks) and collects the resulting timeline
//! and audit trail. Everything an episode does is a function of the policy,
//! the network and the ticks, so replaying a scenario yields the same
//! timeline byte for byte.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};

use super::audit_store::{AuditLog, AuditSink};
use super::bus::{DispatchError, EventBus, DEFAULT_MAX_CASCADE_DEPTH};
use super::mode::ModeController;
use super::policy::{ConfigurationError, Policy, WATCHER};
use crate::agents::{
    ActuatorAgent, AgentContext, EnergyOptAgent, LeakDetectAgent, PlannerAgent, WatcherAgent,
};
use crate::domain::events::{ModeResume, OperatorApproval, OperatorRollback};
use crate::domain::telemetry::{TelemetrySample, DEMAND_LPS, FLOW_LPS, PRESSURE_KPA};
use crate::domain::{
    Event, EventKind, NetworkGraph, SystemMode, TariffUpdate, TelemetryWindow, TransitionRecord,
};

/// Source name of ticks that do not name one
pub const DRIVER_SOURCE: &str = "orchestrator";

fn default_source() -> String {
    DRIVER_SOURCE.to_string()
}

/// Inputs that may enter the bus from outside the agent set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ExternalInput {
    #[serde(rename = "telemetry.window")]
    TelemetryWindow(TelemetryWindow),

    #[serde(rename = "tariff.update")]
    TariffUpdate(TariffUpdate),

    #[serde(rename = "operator.approval")]
    OperatorApproval(OperatorApproval),

    #[serde(rename = "operator.rollback")]
    OperatorRollback(OperatorRollback),

    #[serde(rename = "system.mode.resume")]
    ModeResume(ModeResume),
}

impl From<ExternalInput> for EventKind {
    fn from(input: ExternalInput) -> Self {
        match input {
            ExternalInput::TelemetryWindow(w) => EventKind::TelemetryWindow(w),
            ExternalInput::TariffUpdate(t) => EventKind::TariffUpdate(t),
            ExternalInput::OperatorApproval(a) => EventKind::OperatorApproval(a),
            ExternalInput::OperatorRollback(r) => EventKind::OperatorRollback(r),
            ExternalInput::ModeResume(r) => EventKind::ModeResume(r),
        }
    }
}

/// One external input and the logical time it arrives at
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputTick {
    pub at: DateTime<Utc>,

    #[serde(default = "default_source")]
    pub source: String,

    pub input: ExternalInput,
}

/// An ordered list of ticks
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    pub ticks: Vec<InputTick>,
}

impl Scenario {
    pub fn from_yaml(content: &str) -> Result<Self, ConfigurationError> {
        serde_yaml::from_str(content)
            .map_err(|e| ConfigurationError::Scenario(e.to_string()))
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigurationError> {
        let content =
            std::fs::read_to_string(path).map_err(|source| ConfigurationError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        Self::from_yaml(&content)
    }

    /// Tariff, a quiet telemetry window, then a leak signature on `leak_pipe`
    pub fn demo(leak_pipe: &str) -> Self {
        let start = Utc
            .with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
            .single()
            .unwrap_or_default();

        let hourly_prices = (0..24)
            .map(|hour| match hour {
                0..=6 => 0.08,
                7..=16 => 0.14,
                17..=21 => 0.22,
                _ => 0.10,
            })
            .collect();

        let window = |offset: i64, readings: [(&str, f64, f64); 3]| {
            let at = start + Duration::minutes(offset);
            let mut samples = Vec::with_capacity(6);
            for (metric, first, last) in readings {
                for (i, value) in [first, last].into_iter().enumerate() {
                    samples.push(TelemetrySample {
                        metric: metric.to_string(),
                        value,
                        timestamp: at - Duration::minutes(5) + Duration::minutes(5 * i as i64),
                    });
                }
            }
            TelemetryWindow {
                entity_id: "J2".to_string(),
                pipe_id: Some(leak_pipe.to_string()),
                samples,
            }
        };

        let tick = |offset: i64, input: ExternalInput| InputTick {
            at: start + Duration::minutes(offset),
            source: default_source(),
            input,
        };

        Self {
            ticks: vec![
                tick(
                    0,
                    ExternalInput::TariffUpdate(TariffUpdate {
                        start,
                        hourly_prices,
                    }),
                ),
                tick(
                    5,
                    ExternalInput::TelemetryWindow(window(
                        5,
                        [
                            (PRESSURE_KPA, 300.0, 301.0),
                            (FLOW_LPS, 4.0, 3.9),
                            (DEMAND_LPS, 12.0, 12.1),
                        ],
                    )),
                ),
                tick(
                    10,
                    ExternalInput::TelemetryWindow(window(
                        10,
                        [
                            (PRESSURE_KPA, 300.0, 292.0),
                            (FLOW_LPS, 4.0, 11.0),
                            (DEMAND_LPS, 10.0, 14.0),
                        ],
                    )),
                ),
            ],
        }
    }

    pub fn push(&mut self, at: DateTime<Utc>, source: &str, input: ExternalInput) {
        self.ticks.push(InputTick {
            at,
            source: source.to_string(),
            input,
        });
    }

    /// Time of the last tick
    pub fn end(&self) -> Option<DateTime<Utc>> {
        self.ticks.iter().map(|t| t.at).max()
    }
}

/// A tick whose dispatch failed; the episode continued after it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickError {
    pub tick: usize,
    pub input_type: String,
    pub message: String,
}

/// Everything an episode produced
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpisodeReport {
    pub timeline: Vec<Event>,
    pub audit: Vec<TransitionRecord>,
    pub final_mode: SystemMode,
    pub errors: Vec<TickError>,
}

impl EpisodeReport {
    /// Timeline as the pretty-printed JSON array the CLI prints
    pub fn timeline_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&self.timeline)
    }

    pub fn digest(&self) -> serde_json::Result<String> {
        timeline_digest(&self.timeline)
    }

    pub fn events_of<'a>(&'a self, event_type: &'a str) -> impl Iterator<Item = &'a Event> + 'a {
        self.timeline
            .iter()
            .filter(move |e| e.event_type() == event_type)
    }
}

/// SHA-256 over the canonical JSON encoding of a timeline
pub fn timeline_digest(timeline: &[Event]) -> serde_json::Result<String> {
    let bytes = serde_json::to_vec(timeline)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("sha256:{}", hex::encode(hasher.finalize())))
}

/// Runs episodes over a fixed policy and network
pub struct Orchestrator {
    policy: Policy,
    graph: NetworkGraph,
    max_cascade_depth: usize,
}

impl Orchestrator {
    pub fn new(policy: Policy, graph: NetworkGraph) -> Self {
        Self {
            policy,
            graph,
            max_cascade_depth: DEFAULT_MAX_CASCADE_DEPTH,
        }
    }

    pub fn with_max_cascade_depth(mut self, depth: usize) -> Self {
        self.max_cascade_depth = depth;
        self
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn graph(&self) -> &NetworkGraph {
        &self.graph
    }

    /// Build a bus with the standard agent set. The watcher goes first so it
    /// sees every event before anyone reacts to it.
    fn wire(&self, audit: &AuditLog, controller: ModeController) -> Result<EventBus, DispatchError> {
        let chaos_seed = self.policy.agent(WATCHER).budgets.chaos_seed;

        let mut bus = EventBus::with_max_depth(self.max_cascade_depth);
        bus.register(Box::new(WatcherAgent::new(controller, chaos_seed)))?;
        bus.register(Box::new(LeakDetectAgent::default()))?;
        bus.register(Box::new(PlannerAgent::new()))?;
        bus.register(Box::new(EnergyOptAgent::default()))?;
        bus.register(Box::new(ActuatorAgent::simulated(audit.clone())))?;
        Ok(bus)
    }

    /// Run every tick of the scenario on a fresh bus
    #[instrument(skip(self, scenario), fields(ticks = scenario.ticks.len()))]
    pub fn run_episode(&self, scenario: &Scenario) -> Result<EpisodeReport, DispatchError> {
        let audit = AuditLog::new();
        let (controller, mode) = ModeController::new();
        let mut bus = self.wire(&audit, controller)?;
        let mut errors = Vec::new();

        info!(agents = ?bus.agent_names(), "Starting episode");

        for (index, tick) in scenario.ticks.iter().enumerate() {
            let ctx = AgentContext {
                policy: &self.policy,
                graph: &self.graph,
                mode: &mode,
                now: tick.at,
            };
            let kind = EventKind::from(tick.input.clone());
            let input_type = kind.event_type();
            debug!(tick = index, input = input_type, source = %tick.source, "Publishing tick");

            if let Err(e) = bus.publish(&tick.source, kind, &ctx) {
                warn!(tick = index, input = input_type, error = %e, "Tick dispatch failed");
                errors.push(TickError {
                    tick: index,
                    input_type: input_type.to_string(),
                    message: e.to_string(),
                });
            }
        }

        let report = EpisodeReport {
            timeline: bus.into_history(),
            audit: audit.records(),
            final_mode: mode.current(),
            errors,
        };

        info!(
            events = report.timeline.len(),
            transitions = report.audit.len(),
            mode = %report.final_mode,
            errors = report.errors.len(),
            "Episode complete"
        );
        Ok(report)
    }

    /// Append the episode's transitions to a persistent store
    pub async fn persist(&self, report: &EpisodeReport, sink: &dyn AuditSink) -> Result<usize> {
        sink.append_all(&report.audit)
            .await
            .with_context(|| format!("Failed to persist audit trail to {} store", sink.name()))?;
        debug!(records = report.audit.len(), store = sink.name(), "Audit trail persisted");
        Ok(report.audit.len())
    }
}
