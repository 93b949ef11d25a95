//! Repair of self-referential relations.
//!
//! A relation whose source and target resolve to the same unit can never
//! be scheduled. Most of these come from "reply"/"update" style
//! operations whose data actually comes from a sibling "create"
//! operation, so the default strategy looks for that sibling by name.
//! The marker lists are heuristics and only cover common naming.

use crate::model::{Relation, TestUnit};
use tracing::debug;

const CREATION_MARKERS: &[&str] = &[
    "create", "add", "new", "send", "insert", "upload", "register", "save",
];

const MUTATION_MARKERS: &[&str] = &[
    "reply", "forward", "update", "edit", "modify", "delete", "remove", "cancel", "revoke",
];

/// Tokens too generic to identify a resource.
const GENERIC_TOKENS: &[&str] = &["api", "v1", "v2", "v3", "test", "case", "id"];

/// Operation-name markers for creation and mutation operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Markers {
    pub creation: Vec<String>,
    pub mutation: Vec<String>,
}

impl Default for Markers {
    fn default() -> Self {
        Self {
            creation: CREATION_MARKERS.iter().map(|m| m.to_string()).collect(),
            mutation: MUTATION_MARKERS.iter().map(|m| m.to_string()).collect(),
        }
    }
}

impl Markers {
    pub fn is_creation(&self, text: &str) -> bool {
        let text = text.to_lowercase();
        self.creation.iter().any(|m| text.contains(m.as_str()))
    }

    pub fn is_mutation(&self, text: &str) -> bool {
        let text = text.to_lowercase();
        self.mutation.iter().any(|m| text.contains(m.as_str()))
    }

    /// Resource-name tokens of `text`: lowercase alphanumeric words
    /// that are not markers, numbers or generic path words.
    pub fn name_tokens(&self, text: &str) -> Vec<String> {
        let mut tokens: Vec<String> = Vec::new();
        for token in text
            .to_lowercase()
            .split(|c: char| !c.is_ascii_alphanumeric())
            .filter(|t| t.len() >= 2)
        {
            let is_marker = self
                .creation
                .iter()
                .chain(self.mutation.iter())
                .any(|m| token.contains(m.as_str()));
            let is_generic = GENERIC_TOKENS.contains(&token)
                || token.chars().all(|c| c.is_ascii_digit());
            if !is_marker && !is_generic && !tokens.iter().any(|t| t == token) {
                tokens.push(token.to_string());
            }
        }
        tokens
    }
}

/// Strategy for finding the real source of a self-loop relation.
pub trait RepairStrategy: Send + Sync {
    /// Return the identifier of the unit that should become the
    /// relation's source, or `None` to drop the relation.
    fn repair(&self, relation: &Relation, unit: &TestUnit, known: &[TestUnit]) -> Option<String>;
}

/// Never repairs; every self-loop is dropped.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRepair;

impl RepairStrategy for NoRepair {
    fn repair(&self, _: &Relation, _: &TestUnit, _: &[TestUnit]) -> Option<String> {
        None
    }
}

/// Looks for a creation-marked sibling sharing a resource name with a
/// mutation-marked unit.
#[derive(Debug, Clone, Default)]
pub struct MarkerRepairStrategy {
    markers: Markers,
}

impl MarkerRepairStrategy {
    pub fn new(markers: Markers) -> Self {
        Self { markers }
    }

    fn unit_text(unit: &TestUnit) -> String {
        format!(
            "{} {} {}",
            unit.id,
            unit.request.url,
            unit.description.as_deref().unwrap_or_default()
        )
    }
}

impl RepairStrategy for MarkerRepairStrategy {
    fn repair(&self, relation: &Relation, unit: &TestUnit, known: &[TestUnit]) -> Option<String> {
        let hints = format!(
            "{} {}",
            relation.description.as_deref().unwrap_or_default(),
            Self::unit_text(unit)
        );
        if !self.markers.is_mutation(&hints) {
            return None;
        }

        let stems = self
            .markers
            .name_tokens(&format!("{} {}", unit.id, unit.request.url));
        if stems.is_empty() {
            return None;
        }

        let mut best: Option<(&TestUnit, usize)> = None;
        for candidate in known.iter().filter(|k| k.id != unit.id) {
            if !self.markers.is_creation(&Self::unit_text(candidate)) {
                continue;
            }
            let tokens = self
                .markers
                .name_tokens(&format!("{} {}", candidate.id, candidate.request.url));
            let score = stems.iter().filter(|s| tokens.contains(s)).count();
            if score > 0 && best.map_or(true, |(_, top)| score > top) {
                best = Some((candidate, score));
            }
        }

        let (source, score) = best?;
        debug!(
            unit = %unit.id,
            source = %source.id,
            score,
            "self-loop repair candidate"
        );
        Some(source.id.clone())
    }
}
