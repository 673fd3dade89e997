//! Water network topology used by the isolation planner.
//!
//! The graph is undirected: nodes are junctions, tanks and reservoirs, edges
//! are pipes. A pipe owns zero or more valves, each sitting at one of the
//! pipe's endpoints. The graph is loaded once per episode and never mutated.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while loading or validating a network document
#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("Failed to read network file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse network document: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Duplicate {kind} id: {id}")]
    DuplicateId { kind: &'static str, id: String },

    #[error("Pipe '{pipe}' references unknown node '{node}'")]
    UnknownNode { pipe: String, node: String },

    #[error("Valve '{valve}' sits at '{at}', which is not an endpoint of pipe '{pipe}'")]
    ValveNotOnPipe {
        valve: String,
        pipe: String,
        at: String,
    },

    #[error("Pipe '{0}' connects a node to itself")]
    SelfLoop(String),

    #[error("Network has no supply node (reservoir or tank)")]
    NoSupply,
}

/// Kind of network node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Junction,
    Tank,
    Reservoir,
}

impl NodeKind {
    /// Reservoirs and tanks feed the network
    pub fn is_supply(&self) -> bool {
        matches!(self, Self::Tank | Self::Reservoir)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub kind: NodeKind,
    /// Customers served at this node (junctions only)
    #[serde(default)]
    pub customers: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Valve {
    pub id: String,
    /// Endpoint of the owning pipe where the valve is installed
    pub at: String,
    /// Seconds needed to fully close the valve
    #[serde(default = "default_closure_time")]
    pub closure_time_s: f64,
}

fn default_closure_time() -> f64 {
    60.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pipe {
    pub id: String,
    pub from: String,
    pub to: String,
    /// Nominal flow through the pipe in L/s
    #[serde(default)]
    pub flow_lps: f64,
    #[serde(default)]
    pub valves: Vec<Valve>,
}

impl Pipe {
    /// The endpoint opposite to `node`
    pub fn other_end(&self, node: &str) -> Option<&str> {
        if self.from == node {
            Some(&self.to)
        } else if self.to == node {
            Some(&self.from)
        } else {
            None
        }
    }
}

/// Raw network document (YAML)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkDocument {
    pub nodes: Vec<Node>,
    pub pipes: Vec<Pipe>,
}

/// Validated, read-only network topology
#[derive(Debug, Clone)]
pub struct NetworkGraph {
    nodes: BTreeMap<String, Node>,
    pipes: BTreeMap<String, Pipe>,
    /// node id -> ids of pipes touching it (sorted)
    adjacency: BTreeMap<String, Vec<String>>,
    /// valve id -> owning pipe id
    valve_index: BTreeMap<String, String>,
}

impl NetworkGraph {
    /// Build and validate a graph from a parsed document
    pub fn from_document(doc: NetworkDocument) -> Result<Self, TopologyError> {
        let mut nodes = BTreeMap::new();
        for node in doc.nodes {
            if nodes.contains_key(&node.id) {
                return Err(TopologyError::DuplicateId {
                    kind: "node",
                    id: node.id,
                });
            }
            nodes.insert(node.id.clone(), node);
        }

        if !nodes.values().any(|n| n.kind.is_supply()) {
            return Err(TopologyError::NoSupply);
        }

        let mut pipes = BTreeMap::new();
        let mut adjacency: BTreeMap<String, Vec<String>> =
            nodes.keys().map(|id| (id.clone(), Vec::new())).collect();
        let mut valve_index = BTreeMap::new();

        for pipe in doc.pipes {
            if pipes.contains_key(&pipe.id) {
                return Err(TopologyError::DuplicateId {
                    kind: "pipe",
                    id: pipe.id,
                });
            }
            for end in [&pipe.from, &pipe.to] {
                if !nodes.contains_key(end) {
                    return Err(TopologyError::UnknownNode {
                        pipe: pipe.id.clone(),
                        node: end.clone(),
                    });
                }
            }
            if pipe.from == pipe.to {
                return Err(TopologyError::SelfLoop(pipe.id));
            }
            for valve in &pipe.valves {
                if valve.at != pipe.from && valve.at != pipe.to {
                    return Err(TopologyError::ValveNotOnPipe {
                        valve: valve.id.clone(),
                        pipe: pipe.id.clone(),
                        at: valve.at.clone(),
                    });
                }
                if valve_index
                    .insert(valve.id.clone(), pipe.id.clone())
                    .is_some()
                {
                    return Err(TopologyError::DuplicateId {
                        kind: "valve",
                        id: valve.id.clone(),
                    });
                }
            }

            for end in [&pipe.from, &pipe.to] {
                if let Some(list) = adjacency.get_mut(end) {
                    list.push(pipe.id.clone());
                }
            }
            pipes.insert(pipe.id.clone(), pipe);
        }

        for list in adjacency.values_mut() {
            list.sort();
        }

        Ok(Self {
            nodes,
            pipes,
            adjacency,
            valve_index,
        })
    }

    /// Parse a YAML network document
    pub fn from_yaml(content: &str) -> Result<Self, TopologyError> {
        let doc: NetworkDocument = serde_yaml::from_str(content)?;
        Self::from_document(doc)
    }

    /// Load a network from a YAML file
    pub fn from_file(path: &Path) -> Result<Self, TopologyError> {
        let content = std::fs::read_to_string(path).map_err(|source| TopologyError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&content)
    }

    /// Built-in demo network: one reservoir, one tank, five junctions.
    ///
    /// ```text
    ///  RES1 ── J1 ── J2 ── J5
    ///          │   ╱ │ ╲
    ///          │  ╱  │  TANK1
    ///          J3 ───┘
    ///          │
    ///          J4
    /// ```
    pub fn sample() -> Self {
        fn junction(id: &str, customers: u32) -> Node {
            Node {
                id: id.to_string(),
                kind: NodeKind::Junction,
                customers,
            }
        }
        fn pipe(id: &str, from: &str, to: &str, flow_lps: f64, valves: &[(&str, &str)]) -> Pipe {
            Pipe {
                id: id.to_string(),
                from: from.to_string(),
                to: to.to_string(),
                flow_lps,
                valves: valves
                    .iter()
                    .map(|(valve, at)| Valve {
                        id: valve.to_string(),
                        at: at.to_string(),
                        closure_time_s: default_closure_time(),
                    })
                    .collect(),
            }
        }

        let doc = NetworkDocument {
            nodes: vec![
                Node {
                    id: "RES1".to_string(),
                    kind: NodeKind::Reservoir,
                    customers: 0,
                },
                Node {
                    id: "TANK1".to_string(),
                    kind: NodeKind::Tank,
                    customers: 0,
                },
                junction("J1", 120),
                junction("J2", 80),
                junction("J3", 45),
                junction("J4", 30),
                junction("J5", 55),
            ],
            pipes: vec![
                pipe("P_RES_J1", "RES1", "J1", 12.0, &[("V_RES_J1", "J1")]),
                pipe("P_J1_J2", "J1", "J2", 6.0, &[("V_J1_J2", "J1")]),
                pipe(
                    "P_J2_J3",
                    "J2",
                    "J3",
                    4.0,
                    &[("V_J2_J3_A", "J2"), ("V_J2_J3_B", "J3")],
                ),
                pipe("P_J3_J1", "J3", "J1", 3.0, &[("V_J3_J1", "J3")]),
                pipe("P_J2_J5", "J2", "J5", 2.0, &[("V_J2_J5", "J2")]),
                pipe("P_J3_J4", "J3", "J4", 1.5, &[("V_J3_J4", "J3")]),
                pipe("P_T1_J2", "TANK1", "J2", 5.0, &[("V_T1_J2", "J2")]),
            ],
        };

        // The sample document is static and satisfies every validation rule.
        match Self::from_document(doc) {
            Ok(graph) => graph,
            Err(e) => unreachable!("built-in sample network is invalid: {}", e),
        }
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn pipe(&self, id: &str) -> Option<&Pipe> {
        self.pipes.get(id)
    }

    pub fn pipes(&self) -> impl Iterator<Item = &Pipe> {
        self.pipes.values()
    }

    /// Pipes touching a node, sorted by id
    pub fn pipes_at(&self, node: &str) -> &[String] {
        self.adjacency
            .get(node)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// Look up a valve and the pipe that owns it
    pub fn valve(&self, valve_id: &str) -> Option<(&Pipe, &Valve)> {
        let pipe = self.pipes.get(self.valve_index.get(valve_id)?)?;
        let valve = pipe.valves.iter().find(|v| v.id == valve_id)?;
        Some((pipe, valve))
    }

    /// Ids of supply nodes (reservoirs and tanks)
    pub fn supply_nodes(&self) -> BTreeSet<&str> {
        self.nodes
            .values()
            .filter(|n| n.kind.is_supply())
            .map(|n| n.id.as_str())
            .collect()
    }

    pub fn valve_count(&self) -> usize {
        self.valve_index.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_network_shape() {
        let graph = NetworkGraph::sample();
        assert_eq!(graph.nodes().count(), 7);
        assert_eq!(graph.pipes().count(), 7);
        assert_eq!(graph.valve_count(), 8);
        assert_eq!(graph.supply_nodes().len(), 2);

        let (pipe, valve) = graph.valve("V_J2_J3_B").unwrap();
        assert_eq!(pipe.id, "P_J2_J3");
        assert_eq!(valve.at, "J3");
        assert_eq!(valve.closure_time_s, 60.0);
    }

    #[test]
    fn test_adjacency_is_sorted() {
        let graph = NetworkGraph::sample();
        assert_eq!(
            graph.pipes_at("J2"),
            &["P_J1_J2", "P_J2_J3", "P_J2_J5", "P_T1_J2"]
        );
        assert!(graph.pipes_at("nowhere").is_empty());
    }

    #[test]
    fn test_yaml_parsing_with_defaults() {
        let yaml = r#"
nodes:
  - { id: R, kind: reservoir }
  - { id: A, kind: junction, customers: 10 }
pipes:
  - id: P1
    from: R
    to: A
    valves:
      - { id: V1, at: A }
"#;
        let graph = NetworkGraph::from_yaml(yaml).unwrap();
        let pipe = graph.pipe("P1").unwrap();
        assert_eq!(pipe.flow_lps, 0.0);
        assert_eq!(pipe.valves[0].closure_time_s, 60.0);
        assert_eq!(pipe.other_end("R"), Some("A"));
        assert_eq!(pipe.other_end("X"), None);
    }

    #[test]
    fn test_rejects_unknown_node() {
        let yaml = r#"
nodes:
  - { id: R, kind: reservoir }
pipes:
  - { id: P1, from: R, to: Z }
"#;
        let err = NetworkGraph::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, TopologyError::UnknownNode { .. }));
    }

    #[test]
    fn test_rejects_valve_off_pipe() {
        let yaml = r#"
nodes:
  - { id: R, kind: reservoir }
  - { id: A, kind: junction }
  - { id: B, kind: junction }
pipes:
  - id: P1
    from: R
    to: A
    valves:
      - { id: V1, at: B }
"#;
        let err = NetworkGraph::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, TopologyError::ValveNotOnPipe { .. }));
    }

    #[test]
    fn test_rejects_network_without_supply() {
        let yaml = r#"
nodes:
  - { id: A, kind: junction }
pipes: []
"#;
        assert!(matches!(
            NetworkGraph::from_yaml(yaml),
            Err(TopologyError::NoSupply)
        ));
    }
}
