//! Dependency graph construction from relation declarations.
//!
//! Building never fails: relations that cannot be used are dropped and
//! reported as [`BuildWarning`]s next to the best graph that could be
//! built, and callers decide whether warnings are fatal.

use crate::model::{Relation, RelationBinding, TestUnit};
use crate::repair::{Markers, MarkerRepairStrategy, RepairStrategy};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, warn};

/// A relation after its endpoints were resolved to known units.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedRelation {
    pub source: String,
    pub target: String,
    pub description: Option<String>,
    pub bindings: Vec<RelationBinding>,
    /// Source was rewritten by self-loop repair.
    pub repaired: bool,
}

/// Nodes, deduplicated edges and inbound relations per target.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DependencyGraph {
    /// Unit identifiers in discovery order.
    pub nodes: Vec<String>,
    /// `(source, target)` pairs; the source runs first.
    pub edges: Vec<(String, String)>,
    pub inbound: BTreeMap<String, Vec<ResolvedRelation>>,
}

impl DependencyGraph {
    pub fn contains(&self, id: &str) -> bool {
        self.nodes.iter().any(|n| n == id)
    }

    pub fn has_edge(&self, source: &str, target: &str) -> bool {
        self.edges.iter().any(|(s, t)| s == source && t == target)
    }

    /// Sources of the edges pointing at `target`.
    pub fn sources_of(&self, target: &str) -> Vec<&str> {
        self.edges
            .iter()
            .filter(|(_, t)| t == target)
            .map(|(s, _)| s.as_str())
            .collect()
    }

    fn add_node(&mut self, id: &str, seen: &mut HashSet<String>) {
        if seen.insert(id.to_string()) {
            self.nodes.push(id.to_string());
        }
    }

    fn add_edge(&mut self, source: &str, target: &str, seen: &mut HashSet<(String, String)>) {
        let edge = (source.to_string(), target.to_string());
        if seen.insert(edge.clone()) {
            self.edges.push(edge);
        }
    }
}

/// Anomaly found while building; the offending relation was handled as
/// described.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BuildWarning {
    SelfLoopRepaired { unit: String, source: String },
    SelfLoopDropped { unit: String },
    NoActionableBinding { source: String, target: String },
}

impl std::fmt::Display for BuildWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SelfLoopRepaired { unit, source } => {
                write!(f, "self-loop on '{unit}' repaired to '{source}' -> '{unit}'")
            }
            Self::SelfLoopDropped { unit } => {
                write!(f, "self-loop on '{unit}' dropped, no repair found")
            }
            Self::NoActionableBinding { source, target } => write!(
                f,
                "relation '{source}' -> '{target}' dropped, no binding has both a source and target field"
            ),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BuildOutcome {
    pub graph: DependencyGraph,
    pub warnings: Vec<BuildWarning>,
}

#[derive(Clone, Copy)]
enum Role {
    Source,
    Target,
}

/// Turns relation declarations into a [`DependencyGraph`].
pub struct GraphBuilder {
    markers: Markers,
    repair: Box<dyn RepairStrategy>,
    unit_dependencies: bool,
}

impl Default for GraphBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self {
            markers: Markers::default(),
            repair: Box::new(MarkerRepairStrategy::default()),
            unit_dependencies: false,
        }
    }

    pub fn with_repair(mut self, repair: impl RepairStrategy + 'static) -> Self {
        self.repair = Box::new(repair);
        self
    }

    /// Markers used to disambiguate fragment matches.
    pub fn with_markers(mut self, markers: Markers) -> Self {
        self.markers = markers;
        self
    }

    /// Also derive edges from the units' own declared prerequisites.
    pub fn with_unit_dependencies(mut self, enabled: bool) -> Self {
        self.unit_dependencies = enabled;
        self
    }

    pub fn build(&self, relations: &[Relation], known: &[TestUnit]) -> BuildOutcome {
        let mut outcome = BuildOutcome::default();
        let mut seen_nodes = HashSet::new();
        let mut seen_edges = HashSet::new();

        for unit in known {
            outcome.graph.add_node(&unit.id, &mut seen_nodes);
        }

        for relation in relations {
            let Some((mut source, target)) = self.resolve_pair(relation, known) else {
                debug!(
                    source = ?relation.source,
                    target = ?relation.target,
                    document = ?relation.document,
                    "relation references unknown units, skipping"
                );
                continue;
            };

            let mut repaired = false;
            if source == target {
                let Some(unit) = known.iter().find(|u| u.id == target) else {
                    continue;
                };
                match self.repair.repair(relation, unit, known) {
                    Some(fixed) if fixed != target => {
                        warn!(unit = %target, source = %fixed, "repaired self-loop relation");
                        outcome.warnings.push(BuildWarning::SelfLoopRepaired {
                            unit: target.clone(),
                            source: fixed.clone(),
                        });
                        source = fixed;
                        repaired = true;
                    }
                    _ => {
                        warn!(unit = %target, "dropping self-loop relation");
                        outcome
                            .warnings
                            .push(BuildWarning::SelfLoopDropped { unit: target });
                        continue;
                    }
                }
            }

            if !relation.bindings.iter().any(RelationBinding::is_actionable) {
                warn!(%source, %target, "dropping relation without actionable binding");
                outcome
                    .warnings
                    .push(BuildWarning::NoActionableBinding { source, target });
                continue;
            }

            outcome.graph.add_node(&source, &mut seen_nodes);
            outcome.graph.add_node(&target, &mut seen_nodes);
            outcome.graph.add_edge(&source, &target, &mut seen_edges);
            outcome
                .graph
                .inbound
                .entry(target.clone())
                .or_default()
                .push(ResolvedRelation {
                    source,
                    target,
                    description: relation.description.clone(),
                    bindings: relation.bindings.clone(),
                    repaired,
                });
        }

        if self.unit_dependencies {
            for unit in known {
                for prerequisite in unit.prerequisites() {
                    if prerequisite == unit.id {
                        warn!(unit = %unit.id, "unit declares itself as prerequisite");
                        outcome.warnings.push(BuildWarning::SelfLoopDropped {
                            unit: unit.id.clone(),
                        });
                    } else if seen_nodes.contains(prerequisite) {
                        outcome
                            .graph
                            .add_edge(prerequisite, &unit.id, &mut seen_edges);
                    } else {
                        debug!(unit = %unit.id, prerequisite, "unknown prerequisite, no edge");
                    }
                }
            }
        }

        debug!(
            nodes = outcome.graph.nodes.len(),
            edges = outcome.graph.edges.len(),
            warnings = outcome.warnings.len(),
            "dependency graph built"
        );
        outcome
    }

    /// Units matching `text`: the exact identifier if present, otherwise
    /// every identifier containing it, case-insensitively.
    fn candidates<'a>(&self, text: &str, known: &'a [TestUnit]) -> Vec<&'a TestUnit> {
        let text = text.trim();
        if text.is_empty() {
            return Vec::new();
        }
        if let Some(exact) = known.iter().find(|u| u.id == text) {
            return vec![exact];
        }
        let needle = text.to_lowercase();
        known
            .iter()
            .filter(|u| u.id.to_lowercase().contains(&needle))
            .collect()
    }

    fn resolve_pair(&self, relation: &Relation, known: &[TestUnit]) -> Option<(String, String)> {
        let fallback = relation.document.as_deref();
        let sources = self.candidates(relation.source.as_deref().or(fallback)?, known);
        let targets = self.candidates(relation.target.as_deref().or(fallback)?, known);
        if sources.is_empty() || targets.is_empty() {
            return None;
        }

        let (source, target) = match (sources.as_slice(), targets.as_slice()) {
            ([source], [target]) => (*source, *target),
            ([source], many) => (*source, self.pick(many, *source, Role::Target)),
            (many, [target]) => (self.pick(many, *target, Role::Source), *target),
            _ => {
                let union: Vec<&TestUnit> = known
                    .iter()
                    .filter(|u| {
                        sources.iter().any(|s| s.id == u.id) || targets.iter().any(|t| t.id == u.id)
                    })
                    .collect();
                self.pair(&union)
            }
        };
        Some((source.id.clone(), target.id.clone()))
    }

    /// Choose one of `candidates` to pair with `fixed`.
    fn pick<'a>(
        &self,
        candidates: &[&'a TestUnit],
        fixed: &'a TestUnit,
        role: Role,
    ) -> &'a TestUnit {
        let others: Vec<&'a TestUnit> = candidates
            .iter()
            .copied()
            .filter(|c| c.id != fixed.id)
            .collect();
        let preferred = others.iter().copied().find(|c| match role {
            Role::Source => self.markers.is_creation(&c.id),
            Role::Target => self.markers.is_mutation(&c.id),
        });
        preferred
            .or_else(|| others.first().copied())
            .unwrap_or(fixed)
    }

    /// Pair a creation-marked source with a mutation-marked target,
    /// else the first two candidates in discovery order.
    fn pair<'a>(&self, candidates: &[&'a TestUnit]) -> (&'a TestUnit, &'a TestUnit) {
        let creation = candidates
            .iter()
            .copied()
            .find(|c| self.markers.is_creation(&c.id) && !self.markers.is_mutation(&c.id));
        if let Some(creation) = creation {
            let mutation = candidates
                .iter()
                .copied()
                .find(|c| c.id != creation.id && self.markers.is_mutation(&c.id));
            if let Some(mutation) = mutation {
                return (creation, mutation);
            }
        }
        match candidates {
            [first, second, ..] => (*first, *second),
            [only] => (*only, *only),
            [] => unreachable!("pair called without candidates"),
        }
    }
}

/// Build with the default marker-based repair strategy.
pub fn build(relations: &[Relation], known: &[TestUnit]) -> BuildOutcome {
    GraphBuilder::new().build(relations, known)
}
