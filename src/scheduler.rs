//! Deterministic execution ordering.
//!
//! Stable Kahn's algorithm: among ready nodes the lexicographically
//! smallest identifier runs first. Nodes that can never become ready
//! (cycles) are appended in discovery order instead of failing the
//! whole plan.

use crate::error::{Error, Result};
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use tracing::warn;

/// A total execution order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Schedule {
    /// Every node exactly once.
    pub order: Vec<String>,
    /// Nodes appended after ordering stalled, in discovery order.
    pub unresolved: Vec<String>,
}

impl Schedule {
    pub fn is_complete(&self) -> bool {
        self.unresolved.is_empty()
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.order.iter().position(|n| n == id)
    }
}

struct Prepared<'a> {
    nodes: Vec<&'a str>,
    in_degree: HashMap<&'a str, usize>,
    successors: HashMap<&'a str, Vec<&'a str>>,
}

/// Collect nodes (given ones first, then unseen edge endpoints),
/// deduplicate edges and count in-degrees.
fn prepare<'a>(nodes: &'a [String], edges: &'a [(String, String)]) -> Prepared<'a> {
    let mut seen = HashSet::new();
    let mut ordered = Vec::new();
    let endpoints = edges.iter().flat_map(|(s, t)| [s.as_str(), t.as_str()]);
    for node in nodes.iter().map(String::as_str).chain(endpoints) {
        if seen.insert(node) {
            ordered.push(node);
        }
    }

    let mut in_degree: HashMap<&str, usize> = ordered.iter().map(|n| (*n, 0)).collect();
    let mut successors: HashMap<&str, Vec<&str>> = HashMap::new();
    let mut seen_edges = HashSet::new();
    for (source, target) in edges {
        if !seen_edges.insert((source.as_str(), target.as_str())) {
            continue;
        }
        successors
            .entry(source.as_str())
            .or_default()
            .push(target.as_str());
        *in_degree.entry(target.as_str()).or_default() += 1;
    }

    Prepared {
        nodes: ordered,
        in_degree,
        successors,
    }
}

/// Order `nodes` so that every edge's source precedes its target.
///
/// Never fails: nodes left over by a cycle are appended in discovery
/// order and listed in [`Schedule::unresolved`].
pub fn order(nodes: &[String], edges: &[(String, String)]) -> Schedule {
    let Prepared {
        nodes,
        mut in_degree,
        successors,
    } = prepare(nodes, edges);

    let mut ready: BinaryHeap<Reverse<&str>> = nodes
        .iter()
        .filter(|n| in_degree[*n] == 0)
        .map(|n| Reverse(*n))
        .collect();

    let mut emitted = HashSet::new();
    let mut order = Vec::with_capacity(nodes.len());
    while let Some(Reverse(node)) = ready.pop() {
        emitted.insert(node);
        order.push(node.to_string());
        for next in successors.get(node).into_iter().flatten() {
            if let Some(degree) = in_degree.get_mut(next) {
                *degree -= 1;
                if *degree == 0 {
                    ready.push(Reverse(*next));
                }
            }
        }
    }

    let unresolved: Vec<String> = nodes
        .iter()
        .filter(|n| !emitted.contains(*n))
        .map(|n| n.to_string())
        .collect();
    if !unresolved.is_empty() {
        warn!(
            units = ?unresolved,
            "dependency cycle detected, appending remaining units in discovery order"
        );
        order.extend(unresolved.iter().cloned());
    }

    Schedule { order, unresolved }
}

/// Like [`order`] but fails with [`Error::CycleOrUnresolved`] when any
/// node could not be ordered.
pub fn order_strict(nodes: &[String], edges: &[(String, String)]) -> Result<Vec<String>> {
    let schedule = order(nodes, edges);
    if schedule.is_complete() {
        Ok(schedule.order)
    } else {
        Err(Error::CycleOrUnresolved {
            units: schedule.unresolved,
        })
    }
}

/// Group nodes into waves: every node's sources sit in an earlier wave,
/// so units within a wave are independent of each other. Waves are
/// sorted by identifier; nodes stuck in cycles form a final wave in
/// discovery order.
pub fn batches(nodes: &[String], edges: &[(String, String)]) -> Vec<Vec<String>> {
    let Prepared {
        nodes,
        mut in_degree,
        successors,
    } = prepare(nodes, edges);

    let mut waves = Vec::new();
    let mut placed = HashSet::new();
    let mut current: Vec<&str> = nodes
        .iter()
        .copied()
        .filter(|n| in_degree[n] == 0)
        .collect();

    while !current.is_empty() {
        current.sort_unstable();
        let mut next = Vec::new();
        for node in &current {
            placed.insert(*node);
            for succ in successors.get(node).into_iter().flatten() {
                if let Some(degree) = in_degree.get_mut(succ) {
                    *degree -= 1;
                    if *degree == 0 {
                        next.push(*succ);
                    }
                }
            }
        }
        waves.push(current.iter().map(|n| n.to_string()).collect());
        current = next;
    }

    let stuck: Vec<String> = nodes
        .iter()
        .filter(|n| !placed.contains(*n))
        .map(|n| n.to_string())
        .collect();
    if !stuck.is_empty() {
        waves.push(stuck);
    }
    waves
}
