//! Isolation planning: choose the valve closures that cut a leak off.
//!
//! Candidate valves are those within the hop radius of the leaking pipe. The
//! planner evaluates every subset of the candidates and keeps the one that
//! contains the leak with the fewest customers left unsupplied, breaking ties
//! by estimated water loss, then set size, then the sorted valve ids.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, instrument};

use super::policy::AgentPolicy;
use crate::domain::network::{NetworkGraph, NodeKind, Pipe};
use crate::domain::{ActionId, ActionState, IsolationAction};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    #[error("No valve set within {radius_hops} hops isolates {leak_location}")]
    NoFeasibleIsolation {
        leak_location: String,
        radius_hops: u32,
    },

    #[error("Unknown leak location: {0}")]
    UnknownLocation(String),
}

/// Identity fields for the action a plan produces
#[derive(Debug, Clone)]
pub struct PlanStamp {
    pub id: ActionId,
    pub origin_agent: String,
    pub created_at: DateTime<Utc>,
}

/// Effect of closing a set of valves
#[derive(Debug, Clone, PartialEq)]
pub struct ClosureOutcome {
    /// Leak interior unreachable from every supply node
    pub contains_leak: bool,
    /// Junctions cut off from supply
    pub unsupplied: BTreeSet<String>,
    pub customers_affected: u32,
    pub water_loss_l: f64,
}

/// Hop distance of every pipe reachable from the leak pipe
///
/// The leak pipe and pipes sharing an endpoint with it are at hop 1.
pub fn pipe_hops(graph: &NetworkGraph, leak_location: &str) -> Result<BTreeMap<String, u32>, PlanError> {
    let leak = graph
        .pipe(leak_location)
        .ok_or_else(|| PlanError::UnknownLocation(leak_location.to_string()))?;

    let mut node_distance: BTreeMap<&str, u32> = BTreeMap::new();
    let mut queue = VecDeque::new();
    for end in [leak.from.as_str(), leak.to.as_str()] {
        node_distance.insert(end, 0);
        queue.push_back(end);
    }

    while let Some(node) = queue.pop_front() {
        let distance = node_distance[node];
        for pipe_id in graph.pipes_at(node) {
            let Some(next) = graph.pipe(pipe_id).and_then(|p| p.other_end(node)) else {
                continue;
            };
            if !node_distance.contains_key(next) {
                node_distance.insert(next, distance + 1);
                queue.push_back(next);
            }
        }
    }

    let hops = graph
        .pipes()
        .filter_map(|pipe| {
            let nearest = [pipe.from.as_str(), pipe.to.as_str()]
                .iter()
                .filter_map(|end| node_distance.get(end).copied())
                .min()?;
            Some((pipe.id.clone(), nearest + 1))
        })
        .collect();

    Ok(hops)
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Vertex<'g> {
    Node(&'g str),
    LeakInterior,
}

/// Evaluate closing `closed` valves against a leak on `leak`
pub fn evaluate_closure(graph: &NetworkGraph, leak: &Pipe, closed: &[&str]) -> ClosureOutcome {
    let mut closed_pipes: BTreeSet<&str> = BTreeSet::new();
    let mut cut_ends: BTreeSet<&str> = BTreeSet::new();
    let mut closure_time_s = 0.0;

    for valve_id in closed {
        if let Some((pipe, valve)) = graph.valve(valve_id) {
            closure_time_s += valve.closure_time_s;
            if pipe.id == leak.id {
                cut_ends.insert(valve.at.as_str());
            } else {
                closed_pipes.insert(pipe.id.as_str());
            }
        }
    }

    let mut reached: BTreeSet<Vertex<'_>> = BTreeSet::new();
    let mut queue: VecDeque<Vertex<'_>> = VecDeque::new();
    for source in graph.supply_nodes() {
        reached.insert(Vertex::Node(source));
        queue.push_back(Vertex::Node(source));
    }

    while let Some(vertex) = queue.pop_front() {
        let mut next = Vec::new();
        match vertex {
            Vertex::Node(node) => {
                for pipe_id in graph.pipes_at(node) {
                    if *pipe_id == leak.id {
                        if !cut_ends.contains(node) {
                            next.push(Vertex::LeakInterior);
                        }
                    } else if !closed_pipes.contains(pipe_id.as_str()) {
                        if let Some(other) = graph.pipe(pipe_id).and_then(|p| p.other_end(node)) {
                            next.push(Vertex::Node(other));
                        }
                    }
                }
            }
            Vertex::LeakInterior => {
                for end in [leak.from.as_str(), leak.to.as_str()] {
                    if !cut_ends.contains(end) {
                        next.push(Vertex::Node(end));
                    }
                }
            }
        }
        for vertex in next {
            if reached.insert(vertex) {
                queue.push_back(vertex);
            }
        }
    }

    let supplied = |node: &str| reached.contains(&Vertex::Node(node));

    let mut unsupplied = BTreeSet::new();
    let mut customers_affected = 0;
    for node in graph.nodes() {
        if node.kind == NodeKind::Junction && !supplied(node.id.as_str()) {
            unsupplied.insert(node.id.clone());
            customers_affected += node.customers;
        }
    }

    let affected_flow: f64 = graph
        .pipes()
        .filter(|pipe| {
            pipe.id == leak.id
                || closed_pipes.contains(pipe.id.as_str())
                || !supplied(pipe.from.as_str())
                || !supplied(pipe.to.as_str())
        })
        .map(|pipe| pipe.flow_lps)
        .sum();

    ClosureOutcome {
        contains_leak: !reached.contains(&Vertex::LeakInterior),
        unsupplied,
        customers_affected,
        water_loss_l: affected_flow * closure_time_s,
    }
}

struct Selection<'g> {
    valves: Vec<&'g str>,
    customers: u32,
    loss: f64,
}

impl Selection<'_> {
    fn rank(&self, other: &Self) -> Ordering {
        self.customers
            .cmp(&other.customers)
            .then(self.loss.total_cmp(&other.loss))
            .then(self.valves.len().cmp(&other.valves.len()))
            .then_with(|| self.valves.cmp(&other.valves))
    }
}

/// Plan an isolation for a leak on `leak_location`.
///
/// Uses `max_radius_hops` and `budgets.max_candidate_valves` from `policy`.
/// The returned action is in PROPOSED state.
#[instrument(skip(graph, policy, stamp), fields(radius = policy.max_radius_hops))]
pub fn plan(
    graph: &NetworkGraph,
    leak_location: &str,
    policy: &AgentPolicy,
    stamp: PlanStamp,
) -> Result<IsolationAction, PlanError> {
    let leak = graph
        .pipe(leak_location)
        .ok_or_else(|| PlanError::UnknownLocation(leak_location.to_string()))?;
    let hops = pipe_hops(graph, leak_location)?;
    let radius = policy.max_radius_hops;

    let mut candidates: Vec<(u32, &str)> = graph
        .pipes()
        .filter_map(|pipe| hops.get(&pipe.id).map(|h| (*h, pipe)))
        .filter(|(h, _)| *h <= radius)
        .flat_map(|(h, pipe)| pipe.valves.iter().map(move |v| (h, v.id.as_str())))
        .collect();
    candidates.sort();
    candidates.truncate(policy.budgets.max_candidate_valves);

    debug!(candidates = candidates.len(), "Evaluating closure sets");

    let mut best: Option<Selection<'_>> = None;
    let total: u64 = 1 << candidates.len();
    for mask in 1..total {
        let mut valves: Vec<&str> = candidates
            .iter()
            .enumerate()
            .filter(|(i, _)| mask & (1 << i) != 0)
            .map(|(_, (_, id))| *id)
            .collect();

        let outcome = evaluate_closure(graph, leak, &valves);
        if !outcome.contains_leak {
            continue;
        }

        valves.sort();
        let selection = Selection {
            valves,
            customers: outcome.customers_affected,
            loss: outcome.water_loss_l,
        };
        let improves = match &best {
            Some(current) => selection.rank(current) == Ordering::Less,
            None => true,
        };
        if improves {
            best = Some(selection);
        }
    }

    let best = best.ok_or_else(|| PlanError::NoFeasibleIsolation {
        leak_location: leak_location.to_string(),
        radius_hops: radius,
    })?;

    let mut ordered: Vec<(u32, &str)> = best
        .valves
        .iter()
        .map(|id| {
            let hop = graph
                .valve(id)
                .and_then(|(pipe, _)| hops.get(&pipe.id).copied())
                .unwrap_or(0);
            (hop, *id)
        })
        .collect();
    ordered.sort();

    Ok(IsolationAction {
        id: stamp.id,
        leak_location: leak_location.to_string(),
        valve_sequence: ordered.iter().map(|(_, id)| id.to_string()).collect(),
        valve_hops: ordered.iter().map(|(h, id)| (id.to_string(), *h)).collect(),
        estimated_customers_affected: best.customers,
        estimated_water_loss_l: best.loss,
        state: ActionState::Proposed,
        approved_by: None,
        origin_agent: stamp.origin_agent,
        created_at: stamp.created_at,
        executed_at: None,
        rolled_back_at: None,
    })
}
