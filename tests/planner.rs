//! Isolation Planner Integration Tests
//!
//! Tests for radius limits, optimality and determinism on loaded networks.

use aware::core::planner::{self, evaluate_closure, pipe_hops, PlanError, PlanStamp};
use aware::core::policy::{Policy, PLANNER};
use aware::domain::ActionId;
use aware::NetworkGraph;
use chrono::{TimeZone, Utc};

const CHAIN: &str = r#"
nodes:
  - { id: R, kind: reservoir }
  - { id: J1, kind: junction, customers: 10 }
  - { id: J2, kind: junction, customers: 20 }
  - { id: J3, kind: junction, customers: 30 }
  - { id: J4, kind: junction, customers: 40 }
pipes:
  - { id: P1, from: R, to: J1, flow_lps: 9, valves: [{ id: V1, at: J1 }] }
  - { id: P2, from: J1, to: J2, flow_lps: 7 }
  - { id: P3, from: J2, to: J3, flow_lps: 5 }
  - { id: P4, from: J3, to: J4, flow_lps: 3 }
"#;

/// Leak on PL between J0 and J1, with a bypass J0-J2-J1. Closing VA alone
/// drains the whole network; VB plus VC cut out only the leak and J1.
fn bypass(slow_valve_s: f64) -> NetworkGraph {
    let yaml = format!(
        r#"
nodes:
  - {{ id: R, kind: reservoir }}
  - {{ id: J0, kind: junction, customers: 0 }}
  - {{ id: J1, kind: junction, customers: 0 }}
  - {{ id: J2, kind: junction, customers: 0 }}
pipes:
  - {{ id: P0, from: R, to: J0, flow_lps: 1, valves: [{{ id: VA, at: J0, closure_time_s: {} }}] }}
  - {{ id: PL, from: J0, to: J1, flow_lps: 1, valves: [{{ id: VB, at: J0, closure_time_s: 1 }}] }}
  - {{ id: P2, from: J0, to: J2, flow_lps: 1 }}
  - {{ id: P3, from: J2, to: J1, flow_lps: 1, valves: [{{ id: VC, at: J1, closure_time_s: 1 }}] }}
"#,
        slow_valve_s
    );
    NetworkGraph::from_yaml(&yaml).unwrap()
}

fn stamp(leak: &str) -> PlanStamp {
    let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    PlanStamp {
        id: ActionId::derive(leak, at, 1),
        origin_agent: PLANNER.to_string(),
        created_at: at,
    }
}

fn policy_with_radius(radius: u32) -> Policy {
    let overrides = format!("planner:\n  max_radius_hops: {}\n", radius);
    Policy::from_documents(aware::core::policy::DEFAULT_POLICY_YAML, Some(&overrides)).unwrap()
}

#[test]
fn test_far_valve_needs_wider_radius() {
    let graph = NetworkGraph::from_yaml(CHAIN).unwrap();
    let hops = pipe_hops(&graph, "P3").unwrap();
    assert_eq!(hops["P1"], 2);

    let narrow = policy_with_radius(1);
    let result = planner::plan(&graph, "P3", narrow.agent(PLANNER), stamp("P3"));
    assert_eq!(
        result,
        Err(PlanError::NoFeasibleIsolation {
            leak_location: "P3".to_string(),
            radius_hops: 1,
        })
    );

    let wide = policy_with_radius(2);
    let action = planner::plan(&graph, "P3", wide.agent(PLANNER), stamp("P3")).unwrap();
    assert_eq!(action.valve_sequence, vec!["V1"]);
    assert_eq!(action.max_hops(), 2);
    assert_eq!(action.estimated_customers_affected, 100);
}

#[test]
fn test_every_sample_plan_respects_radius() {
    let graph = NetworkGraph::sample();
    for radius in 1..=3 {
        let policy = policy_with_radius(radius);
        for pipe in graph.pipes() {
            match planner::plan(&graph, &pipe.id, policy.agent(PLANNER), stamp(&pipe.id)) {
                Ok(action) => {
                    assert!(action.max_hops() <= radius, "{} at radius {}", pipe.id, radius);
                    let closed: Vec<&str> =
                        action.valve_sequence.iter().map(String::as_str).collect();
                    assert!(evaluate_closure(&graph, pipe, &closed).contains_leak);
                }
                Err(PlanError::NoFeasibleIsolation { radius_hops, .. }) => {
                    assert_eq!(radius_hops, radius)
                }
                Err(other) => panic!("Unexpected error for {}: {:?}", pipe.id, other),
            }
        }
    }
}

#[test]
fn test_selected_set_minimizes_customers() {
    let graph = NetworkGraph::sample();
    let policy = Policy::builtin();
    let leak = graph.pipe("P_J1_J2").unwrap();
    let action = planner::plan(&graph, "P_J1_J2", policy.agent(PLANNER), stamp("P_J1_J2")).unwrap();

    // No other containing closure of the same candidate valves leaves fewer customers dry
    let hops = pipe_hops(&graph, "P_J1_J2").unwrap();
    let candidates: Vec<&str> = graph
        .pipes()
        .filter(|p| hops.get(&p.id).is_some_and(|h| *h <= 3))
        .flat_map(|p| p.valves.iter().map(|v| v.id.as_str()))
        .collect();
    for mask in 1u32..(1 << candidates.len()) {
        let closed: Vec<&str> = candidates
            .iter()
            .enumerate()
            .filter(|(i, _)| mask & (1 << i) != 0)
            .map(|(_, v)| *v)
            .collect();
        let outcome = evaluate_closure(&graph, leak, &closed);
        if outcome.contains_leak {
            assert!(outcome.customers_affected >= action.estimated_customers_affected);
        }
    }
}

#[test]
fn test_plans_are_deterministic() {
    let graph = NetworkGraph::sample();
    let policy = Policy::builtin();
    for pipe in ["P_J2_J3", "P_J3_J4", "P_J1_J2"] {
        let a = planner::plan(&graph, pipe, policy.agent(PLANNER), stamp(pipe)).unwrap();
        let b = planner::plan(&graph, pipe, policy.agent(PLANNER), stamp(pipe)).unwrap();
        assert_eq!(a, b);
    }
}

#[test]
fn test_lower_water_loss_beats_fewer_valves() {
    let graph = bypass(100.0);
    let leak = graph.pipe("PL").unwrap();

    let upstream = evaluate_closure(&graph, leak, &["VA"]);
    let local = evaluate_closure(&graph, leak, &["VB", "VC"]);
    assert!(upstream.contains_leak && local.contains_leak);
    assert_eq!(upstream.customers_affected, local.customers_affected);
    assert_eq!(upstream.water_loss_l, 400.0);
    assert_eq!(local.water_loss_l, 4.0);

    let policy = Policy::builtin();
    let action = planner::plan(&graph, "PL", policy.agent(PLANNER), stamp("PL")).unwrap();
    assert_eq!(action.valve_sequence, vec!["VB", "VC"]);
    assert_eq!(action.estimated_water_loss_l, 4.0);
}

#[test]
fn test_equal_loss_prefers_smaller_set() {
    let graph = bypass(1.0);
    let leak = graph.pipe("PL").unwrap();

    let upstream = evaluate_closure(&graph, leak, &["VA"]);
    let local = evaluate_closure(&graph, leak, &["VB", "VC"]);
    assert_eq!(upstream.customers_affected, local.customers_affected);
    assert_eq!(upstream.water_loss_l, local.water_loss_l);

    let policy = Policy::builtin();
    let action = planner::plan(&graph, "PL", policy.agent(PLANNER), stamp("PL")).unwrap();
    assert_eq!(action.valve_sequence, vec!["VA"]);
    assert_eq!(action.estimated_water_loss_l, 4.0);
}
