//! Weighted rule-based leak scorer.
//!
//! Compares the first and last sample of each metric in a window: a pressure
//! drop, a flow rise and a demand rise each add to the score.

use serde::{Deserialize, Serialize};

use super::{CollaboratorError, LeakScorer};
use crate::domain::events::LeakAlert;
use crate::domain::telemetry::{TelemetryWindow, DEMAND_LPS, FLOW_LPS, PRESSURE_KPA};

/// Weights and calibration of the scorer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScorerWeights {
    pub pressure: f64,
    pub flow: f64,
    pub demand: f64,
    /// Score that maps to probability 1.0 before clamping
    pub scale: f64,
}

impl Default for ScorerWeights {
    fn default() -> Self {
        Self {
            pressure: 0.45,
            flow: 0.35,
            demand: 0.2,
            scale: 10.0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RuleBasedScorer {
    weights: ScorerWeights,
}

impl RuleBasedScorer {
    pub fn new(weights: ScorerWeights) -> Self {
        Self { weights }
    }
}

/// Change between the first and last value of a series (None if empty)
fn delta(series: &[f64]) -> Option<f64> {
    Some(series.last()? - series.first()?)
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

impl LeakScorer for RuleBasedScorer {
    fn name(&self) -> &str {
        "rule-based-scorer"
    }

    fn score(&self, window: &TelemetryWindow) -> Result<LeakAlert, CollaboratorError> {
        let pressure = delta(&window.series(PRESSURE_KPA));
        let flow = delta(&window.series(FLOW_LPS));
        let demand = delta(&window.series(DEMAND_LPS));

        if pressure.is_none() && flow.is_none() && demand.is_none() {
            return Err(CollaboratorError::InsufficientData {
                collaborator: "rule-based-scorer",
                detail: format!("window for {} has no usable samples", window.entity_id),
            });
        }

        let pressure_drop = pressure.map(|d| (-d).max(0.0)).unwrap_or(0.0);
        let flow_rise = flow.map(|d| d.max(0.0)).unwrap_or(0.0);
        let demand_rise = demand.map(|d| d.max(0.0)).unwrap_or(0.0);

        let contributions = [
            (
                self.weights.pressure * pressure_drop,
                format!("pressure dropped {:.2} kPa", pressure_drop),
            ),
            (
                self.weights.flow * flow_rise,
                format!("flow rose {:.2} L/s", flow_rise),
            ),
            (
                self.weights.demand * demand_rise,
                format!("demand rose {:.2} L/s", demand_rise),
            ),
        ];

        let score: f64 = contributions.iter().map(|(c, _)| c).sum();
        let probability = round3((score / self.weights.scale).clamp(0.01, 0.99));

        let mut ranked: Vec<&(f64, String)> =
            contributions.iter().filter(|(c, _)| *c > 0.0).collect();
        ranked.sort_by(|a, b| b.0.total_cmp(&a.0));

        Ok(LeakAlert {
            entity_id: window.entity_id.clone(),
            pipe_id: window.location().to_string(),
            probability,
            reasons: ranked.into_iter().map(|(_, r)| r.clone()).collect(),
        })
    }
}
