//! Leak detection agent.

use tracing::{debug, info};

use super::{Agent, AgentContext, AgentError};
use crate::adapters::{LeakScorer, RuleBasedScorer};
use crate::core::policy::LEAK_DETECT;
use crate::domain::{Event, EventKind};

/// Scores telemetry windows and raises `alert.leak` above `min_confidence`
pub struct LeakDetectAgent {
    scorer: Box<dyn LeakScorer>,
}

impl Default for LeakDetectAgent {
    fn default() -> Self {
        Self::new(Box::new(RuleBasedScorer::default()))
    }
}

impl LeakDetectAgent {
    pub fn new(scorer: Box<dyn LeakScorer>) -> Self {
        Self { scorer }
    }
}

impl Agent for LeakDetectAgent {
    fn name(&self) -> &str {
        LEAK_DETECT
    }

    fn subscriptions(&self) -> Vec<String> {
        vec!["telemetry.window".to_string()]
    }

    fn handle(&mut self, event: &Event, ctx: &AgentContext<'_>) -> Result<Vec<EventKind>, AgentError> {
        let EventKind::TelemetryWindow(window) = &event.kind else {
            return Ok(Vec::new());
        };

        let alert = self.scorer.score(window)?;
        let threshold = ctx.policy_for(LEAK_DETECT).min_confidence;

        if alert.probability < threshold {
            debug!(
                entity = %window.entity_id,
                probability = alert.probability,
                threshold,
                "Window below leak threshold"
            );
            return Ok(Vec::new());
        }

        info!(
            pipe = %alert.pipe_id,
            probability = alert.probability,
            scorer = self.scorer.name(),
            "Leak suspected"
        );
        Ok(vec![EventKind::LeakAlert(alert)])
    }
}
