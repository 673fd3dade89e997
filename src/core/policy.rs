//! Layered agent policy.
//!
//! A policy is built from a default document and an optional override
//! document. Both are YAML mappings keyed by agent name; the override is deep
//! merged onto the defaults leaf by leaf. Guardrail keys sit directly under
//! the agent, agent-specific budgets sit under `budgets`.
//!
//! ```yaml
//! planner:
//!   max_radius_hops: 2
//!   budgets:
//!     max_candidate_valves: 12
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use thiserror::Error;

use crate::domain::network::TopologyError;

pub const LEAK_DETECT: &str = "leak_detect";
pub const PLANNER: &str = "planner";
pub const ENERGY_OPT: &str = "energy_opt";
pub const ACTUATOR: &str = "actuator";
pub const WATCHER: &str = "watcher";

/// Agent names a policy document may configure
pub const KNOWN_AGENTS: [&str; 5] = [LEAK_DETECT, PLANNER, ENERGY_OPT, ACTUATOR, WATCHER];

/// Upper bound on the planner's exhaustive subset search
pub const MAX_CANDIDATE_VALVES_LIMIT: usize = 20;

/// Longest pump schedule horizon, one week
pub const MAX_HORIZON_HOURS: u32 = 168;

/// Built-in default policy document
pub const DEFAULT_POLICY_YAML: &str = r#"
leak_detect:
  min_confidence: 0.6

planner:
  max_radius_hops: 3
  auto_execute: false
  budgets:
    max_candidate_valves: 16

energy_opt:
  max_parallel_pumps: 2
  pressure_floor_kpa: 240.0
  budgets:
    horizon_hours: 24

actuator:
  min_confidence: 0.5
  budgets:
    auto_rollback: true

watcher:
  chaos_probability: 0.05
  max_radius_hops: 3
  max_parallel_pumps: 2
  pressure_floor_kpa: 240.0
  budgets:
    chaos_seed: 42
    safe_mode_on_failure: true
    max_savings_pct: 60.0
"#;

/// Errors raised while loading configuration documents
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {document} document: {source}")]
    Parse {
        document: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Unknown agent '{agent}' in {document} document")]
    UnknownAgent { agent: String, document: String },

    #[error("Invalid policy for agent '{agent}': {message}")]
    InvalidValue { agent: String, message: String },

    #[error("{agent}.{key} = {value} is out of range (expected {expected})")]
    OutOfRange {
        agent: String,
        key: &'static str,
        value: f64,
        expected: &'static str,
    },

    #[error("Invalid network topology: {0}")]
    Topology(#[from] TopologyError),

    #[error("Invalid scenario: {0}")]
    Scenario(String),
}

const DEFAULT_MAX_RADIUS_HOPS: u32 = 3;
const DEFAULT_CHAOS_PROBABILITY: f64 = 0.0;
const DEFAULT_MIN_CONFIDENCE: f64 = 0.5;
const DEFAULT_MAX_PARALLEL_PUMPS: u32 = 2;
const DEFAULT_PRESSURE_FLOOR_KPA: f64 = 240.0;
const DEFAULT_MAX_CANDIDATE_VALVES: usize = 16;
const DEFAULT_HORIZON_HOURS: u32 = 24;
const DEFAULT_CHAOS_SEED: u64 = 42;
const DEFAULT_MAX_SAVINGS_PCT: f64 = 60.0;

fn default_max_radius_hops() -> u32 {
    DEFAULT_MAX_RADIUS_HOPS
}
fn default_chaos_probability() -> f64 {
    DEFAULT_CHAOS_PROBABILITY
}
fn default_min_confidence() -> f64 {
    DEFAULT_MIN_CONFIDENCE
}
fn default_max_parallel_pumps() -> u32 {
    DEFAULT_MAX_PARALLEL_PUMPS
}
fn default_pressure_floor_kpa() -> f64 {
    DEFAULT_PRESSURE_FLOOR_KPA
}
fn default_max_candidate_valves() -> usize {
    DEFAULT_MAX_CANDIDATE_VALVES
}
fn default_horizon_hours() -> u32 {
    DEFAULT_HORIZON_HOURS
}
fn default_true() -> bool {
    true
}
fn default_chaos_seed() -> u64 {
    DEFAULT_CHAOS_SEED
}
fn default_max_savings_pct() -> f64 {
    DEFAULT_MAX_SAVINGS_PCT
}

/// Guardrails and budgets for one agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentPolicy {
    /// Hop radius an isolation may reach from the leak (default: 3)
    #[serde(default = "default_max_radius_hops")]
    pub max_radius_hops: u32,

    /// Whether actions originating from this agent may run without approval
    #[serde(default)]
    pub auto_execute: bool,

    /// Probability of injecting a synthetic actuation fault (default: 0)
    #[serde(default = "default_chaos_probability")]
    pub chaos_probability: f64,

    /// Minimum confidence required to act (default: 0.5)
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,

    /// Pumps allowed to run at the same time (default: 2)
    #[serde(default = "default_max_parallel_pumps")]
    pub max_parallel_pumps: u32,

    /// Lowest network pressure a pump schedule may produce (default: 240 kPa)
    #[serde(default = "default_pressure_floor_kpa")]
    pub pressure_floor_kpa: f64,

    #[serde(default)]
    pub budgets: Budgets,
}

/// Agent-specific budgets
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Budgets {
    /// Planner: candidate valves considered by the subset search (default: 16)
    #[serde(default = "default_max_candidate_valves")]
    pub max_candidate_valves: usize,

    /// Energy optimizer: hours in the planning horizon (default: 24)
    #[serde(default = "default_horizon_hours")]
    pub horizon_hours: u32,

    /// Actuator: roll failed actions back without an operator (default: true)
    #[serde(default = "default_true")]
    pub auto_rollback: bool,

    /// Watcher: seed of the chaos RNG (default: 42)
    #[serde(default = "default_chaos_seed")]
    pub chaos_seed: u64,

    /// Watcher: force safe mode on actuation faults (default: true)
    #[serde(default = "default_true")]
    pub safe_mode_on_failure: bool,

    /// Watcher: largest plausible energy saving before it counts as a breach
    #[serde(default = "default_max_savings_pct")]
    pub max_savings_pct: f64,
}

static FALLBACK_POLICY: AgentPolicy = AgentPolicy {
    max_radius_hops: DEFAULT_MAX_RADIUS_HOPS,
    auto_execute: false,
    chaos_probability: DEFAULT_CHAOS_PROBABILITY,
    min_confidence: DEFAULT_MIN_CONFIDENCE,
    max_parallel_pumps: DEFAULT_MAX_PARALLEL_PUMPS,
    pressure_floor_kpa: DEFAULT_PRESSURE_FLOOR_KPA,
    budgets: Budgets {
        max_candidate_valves: DEFAULT_MAX_CANDIDATE_VALVES,
        horizon_hours: DEFAULT_HORIZON_HOURS,
        auto_rollback: true,
        chaos_seed: DEFAULT_CHAOS_SEED,
        safe_mode_on_failure: true,
        max_savings_pct: DEFAULT_MAX_SAVINGS_PCT,
    },
};

impl Default for Budgets {
    fn default() -> Self {
        FALLBACK_POLICY.budgets.clone()
    }
}

impl Default for AgentPolicy {
    fn default() -> Self {
        FALLBACK_POLICY.clone()
    }
}

impl AgentPolicy {
    /// Check value ranges that the type system cannot express
    pub fn validate(&self, agent: &str) -> Result<(), ConfigurationError> {
        let out_of_range = |key: &'static str, value: f64, expected: &'static str| {
            ConfigurationError::OutOfRange {
                agent: agent.to_string(),
                key,
                value,
                expected,
            }
        };

        for (key, value) in [
            ("chaos_probability", self.chaos_probability),
            ("min_confidence", self.min_confidence),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(out_of_range(key, value, "a probability in [0, 1]"));
            }
        }

        if self.max_parallel_pumps < 1 {
            return Err(out_of_range(
                "max_parallel_pumps",
                f64::from(self.max_parallel_pumps),
                ">= 1",
            ));
        }

        if !self.pressure_floor_kpa.is_finite() {
            return Err(out_of_range(
                "pressure_floor_kpa",
                self.pressure_floor_kpa,
                "a finite pressure",
            ));
        }

        let budgets = &self.budgets;
        if budgets.max_candidate_valves < 1 || budgets.max_candidate_valves > MAX_CANDIDATE_VALVES_LIMIT
        {
            return Err(out_of_range(
                "budgets.max_candidate_valves",
                budgets.max_candidate_valves as f64,
                "1..=20",
            ));
        }

        if budgets.horizon_hours < 1 || budgets.horizon_hours > MAX_HORIZON_HOURS {
            return Err(out_of_range(
                "budgets.horizon_hours",
                f64::from(budgets.horizon_hours),
                "1..=168",
            ));
        }

        if !(0.0..=100.0).contains(&budgets.max_savings_pct) {
            return Err(out_of_range(
                "budgets.max_savings_pct",
                budgets.max_savings_pct,
                "a percentage in [0, 100]",
            ));
        }

        Ok(())
    }
}

/// Merged, validated policy for every agent.
///
/// Immutable for the duration of an episode.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Policy {
    agents: BTreeMap<String, AgentPolicy>,
}

impl Policy {
    /// Load the default document (built-in when `None`) and merge an override
    pub fn load(
        default_path: Option<&Path>,
        override_path: Option<&Path>,
    ) -> Result<Self, ConfigurationError> {
        let defaults = match default_path {
            Some(path) => read_document(path)?,
            None => DEFAULT_POLICY_YAML.to_string(),
        };
        let overrides = override_path.map(read_document).transpose()?;

        Self::from_documents(&defaults, overrides.as_deref())
    }

    /// Build a policy from YAML text
    pub fn from_documents(
        defaults: &str,
        overrides: Option<&str>,
    ) -> Result<Self, ConfigurationError> {
        let mut merged = Value::Mapping(parse_document(defaults, "default")?);
        if let Some(overrides) = overrides {
            let overlay = parse_document(overrides, "override")?;
            merge_values(&mut merged, Value::Mapping(overlay));
        }

        let mut agents = BTreeMap::new();
        for agent in KNOWN_AGENTS {
            let block = merged
                .get(agent)
                .cloned()
                .unwrap_or_else(|| Value::Mapping(Mapping::new()));
            let block = if block.is_null() {
                Value::Mapping(Mapping::new())
            } else {
                block
            };

            let policy: AgentPolicy =
                serde_yaml::from_value(block).map_err(|e| ConfigurationError::InvalidValue {
                    agent: agent.to_string(),
                    message: e.to_string(),
                })?;
            policy.validate(agent)?;
            agents.insert(agent.to_string(), policy);
        }

        Ok(Self { agents })
    }

    /// The built-in default policy
    pub fn builtin() -> Self {
        match Self::from_documents(DEFAULT_POLICY_YAML, None) {
            Ok(policy) => policy,
            Err(e) => unreachable!("built-in policy document is invalid: {}", e),
        }
    }

    /// Policy block for an agent (field defaults for unknown names)
    pub fn agent(&self, name: &str) -> &AgentPolicy {
        self.agents.get(name).unwrap_or(&FALLBACK_POLICY)
    }

    /// Replace the watcher's chaos probability after validating it
    pub fn with_chaos_probability(mut self, probability: f64) -> Result<Self, ConfigurationError> {
        let watcher = self.agents.entry(WATCHER.to_string()).or_default();
        watcher.chaos_probability = probability;
        watcher.validate(WATCHER)?;
        Ok(self)
    }

    /// Turn auto-execution on or off for one agent
    pub fn with_auto_execute(mut self, agent: &str, enabled: bool) -> Result<Self, ConfigurationError> {
        if !KNOWN_AGENTS.contains(&agent) {
            return Err(ConfigurationError::UnknownAgent {
                agent: agent.to_string(),
                document: "command line".to_string(),
            });
        }
        self.agents.entry(agent.to_string()).or_default().auto_execute = enabled;
        Ok(self)
    }

    /// Render the merged policy as YAML
    pub fn to_yaml(&self) -> Result<String, ConfigurationError> {
        serde_yaml::to_string(self).map_err(|source| ConfigurationError::Parse {
            document: "merged".to_string(),
            source,
        })
    }
}

impl Default for Policy {
    fn default() -> Self {
        Self::builtin()
    }
}

fn read_document(path: &Path) -> Result<String, ConfigurationError> {
    std::fs::read_to_string(path).map_err(|source| ConfigurationError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Parse a policy document into a mapping, rejecting unknown agents
fn parse_document(content: &str, document: &str) -> Result<Mapping, ConfigurationError> {
    let value: Value =
        serde_yaml::from_str(content).map_err(|source| ConfigurationError::Parse {
            document: document.to_string(),
            source,
        })?;

    let mapping = match value {
        Value::Null => Mapping::new(),
        Value::Mapping(mapping) => mapping,
        other => {
            return Err(ConfigurationError::InvalidValue {
                agent: "<root>".to_string(),
                message: format!("{} document must be a mapping, got {:?}", document, other),
            })
        }
    };

    for key in mapping.keys() {
        match key.as_str() {
            Some(name) if KNOWN_AGENTS.contains(&name) => {}
            _ => {
                return Err(ConfigurationError::UnknownAgent {
                    agent: key
                        .as_str()
                        .map(str::to_string)
                        .unwrap_or_else(|| format!("{:?}", key)),
                    document: document.to_string(),
                })
            }
        }
    }

    Ok(mapping)
}

/// Deep merge `overlay` onto `base`: mappings merge key-wise, leaves replace
fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (_, Value::Null) => {}
        (Value::Mapping(base_map), Value::Mapping(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_policy() {
        let policy = Policy::builtin();

        assert_eq!(policy.agent(LEAK_DETECT).min_confidence, 0.6);
        assert!(!policy.agent(PLANNER).auto_execute);
        assert_eq!(policy.agent(PLANNER).budgets.max_candidate_valves, 16);
        assert_eq!(policy.agent(WATCHER).chaos_probability, 0.05);
        assert_eq!(policy.agent(WATCHER).budgets.chaos_seed, 42);
        assert_eq!(policy.agent(ENERGY_OPT).max_parallel_pumps, 2);
    }

    #[test]
    fn test_override_replaces_leaf() {
        let defaults = "leak_detect:\n  min_confidence: 0.5\n";
        let policy =
            Policy::from_documents(defaults, Some("leak_detect:\n  min_confidence: 0.8\n")).unwrap();
        assert_eq!(policy.agent(LEAK_DETECT).min_confidence, 0.8);
    }

    #[test]
    fn test_empty_override_keeps_defaults() {
        let defaults = "leak_detect:\n  min_confidence: 0.5\n";
        let policy = Policy::from_documents(defaults, Some("")).unwrap();
        assert_eq!(policy.agent(LEAK_DETECT).min_confidence, 0.5);
    }

    #[test]
    fn test_nested_budget_merge_keeps_siblings() {
        let overrides = "watcher:\n  budgets:\n    chaos_seed: 7\n";
        let policy = Policy::from_documents(DEFAULT_POLICY_YAML, Some(overrides)).unwrap();
        let watcher = policy.agent(WATCHER);

        assert_eq!(watcher.budgets.chaos_seed, 7);
        assert_eq!(watcher.budgets.max_savings_pct, 60.0);
        assert_eq!(watcher.chaos_probability, 0.05);
    }

    #[test]
    fn test_missing_agent_gets_field_defaults() {
        let policy = Policy::from_documents("planner:\n  auto_execute: true\n", None).unwrap();
        let actuator = policy.agent(ACTUATOR);
        assert_eq!(actuator.min_confidence, 0.5);
        assert!(actuator.budgets.auto_rollback);
    }

    #[test]
    fn test_unknown_agent_rejected() {
        let result = Policy::from_documents(DEFAULT_POLICY_YAML, Some("pumpmaster:\n  x: 1\n"));
        match result {
            Err(ConfigurationError::UnknownAgent { agent, document }) => {
                assert_eq!(agent, "pumpmaster");
                assert_eq!(document, "override");
            }
            other => panic!("Expected UnknownAgent, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_key_rejected() {
        let result = Policy::from_documents(DEFAULT_POLICY_YAML, Some("planner:\n  radius: 2\n"));
        assert!(matches!(result, Err(ConfigurationError::InvalidValue { .. })));
    }

    #[test]
    fn test_negative_radius_rejected() {
        let result =
            Policy::from_documents(DEFAULT_POLICY_YAML, Some("planner:\n  max_radius_hops: -1\n"));
        assert!(matches!(result, Err(ConfigurationError::InvalidValue { .. })));
    }

    #[test]
    fn test_probability_out_of_range() {
        let result = Policy::from_documents(
            DEFAULT_POLICY_YAML,
            Some("watcher:\n  chaos_probability: 1.5\n"),
        );
        match result {
            Err(ConfigurationError::OutOfRange { agent, key, .. }) => {
                assert_eq!(agent, "watcher");
                assert_eq!(key, "chaos_probability");
            }
            other => panic!("Expected OutOfRange, got {:?}", other),
        }
    }

    #[test]
    fn test_zero_pumps_rejected() {
        let result = Policy::from_documents(
            DEFAULT_POLICY_YAML,
            Some("energy_opt:\n  max_parallel_pumps: 0\n"),
        );
        assert!(matches!(result, Err(ConfigurationError::OutOfRange { .. })));
    }

    #[test]
    fn test_horizon_bounded() {
        let result = Policy::from_documents(
            DEFAULT_POLICY_YAML,
            Some("energy_opt:\n  budgets:\n    horizon_hours: 4294967295\n"),
        );
        match result {
            Err(ConfigurationError::OutOfRange { agent, key, .. }) => {
                assert_eq!(agent, "energy_opt");
                assert_eq!(key, "budgets.horizon_hours");
            }
            other => panic!("Expected OutOfRange, got {:?}", other),
        }

        let week = Policy::from_documents(
            DEFAULT_POLICY_YAML,
            Some("energy_opt:\n  budgets:\n    horizon_hours: 168\n"),
        )
        .unwrap();
        assert_eq!(week.agent(ENERGY_OPT).budgets.horizon_hours, MAX_HORIZON_HOURS);
    }

    #[test]
    fn test_with_chaos_probability() {
        let policy = Policy::builtin().with_chaos_probability(1.0).unwrap();
        assert_eq!(policy.agent(WATCHER).chaos_probability, 1.0);

        assert!(Policy::builtin().with_chaos_probability(-0.1).is_err());
    }

    #[test]
    fn test_yaml_output_round_trips() {
        let policy = Policy::builtin();
        let yaml = policy.to_yaml().unwrap();
        let reparsed = Policy::from_documents(&yaml, None).unwrap();
        assert_eq!(reparsed, policy);
    }
}
