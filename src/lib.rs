//! Dependency-ordered execution of API test units.
//!
//! Units declare prerequisites and field bindings; the graph builder and
//! scheduler decide an order, and the resolver carries values from each
//! prerequisite's request or response into the dependent's request,
//! recording them in a two-tier cache on the way.

pub mod cache;
pub mod config;
pub mod error;
pub mod extractor;
pub mod graph;
pub mod model;
pub mod remote_cache;
pub mod repair;
pub mod resolver;
pub mod runner;
pub mod scheduler;
pub mod substitute;
pub mod validator;

pub use cache::{CacheStore, MemoryRemoteBackend, RemoteBackend, SetOutcome, Tier};
pub use config::*;
pub use error::{BusinessStatus, Error, Result};
pub use graph::{BuildOutcome, BuildWarning, DependencyGraph, GraphBuilder};
pub use model::*;
pub use repair::{MarkerRepairStrategy, Markers, NoRepair, RepairStrategy};
pub use resolver::{DependencyResolver, UnitOutcome};
pub use runner::*;
pub use scheduler::Schedule;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_suite_serialization() {
        let suite = TestSuite {
            name: "メール".to_string(),
            units: vec![
                TestUnit::new("mail_create", HttpMethod::Post, "/mail")
                    .with_description("これは作成です")
                    .with_body(json!({"subject": "hello"})),
                TestUnit::new("mail_reply", HttpMethod::Post, "/mail/{mail_id}/reply")
                    .with_dependency(DependencyRef::new("mail_create").bind(
                        FieldBinding::new("$.data.id", DependencyKind::Response)
                            .into_target("url.mail_id")
                            .cached_as("mail_id"),
                    )),
            ],
            relations: vec![Relation::between("create", "reply")
                .with_binding(RelationBinding::field("id", "parent_id"))],
            config: RunConfig::default(),
        };

        let yaml = suite.to_yaml().unwrap();
        let deserialized = TestSuite::from_yaml(&yaml).unwrap();

        assert_eq!(suite.name, deserialized.name);
        assert_eq!(suite.units.len(), deserialized.units.len());
        assert_eq!(
            deserialized.units[1].depends_on,
            suite.units[1].depends_on
        );
        assert_eq!(deserialized.relations, suite.relations);
    }

    #[test]
    fn test_plan_from_relations_only() {
        let suite = TestSuite {
            name: "plan".to_string(),
            units: vec![
                TestUnit::new("mail_reply", HttpMethod::Post, "/reply"),
                TestUnit::new("mail_create", HttpMethod::Post, "/mail"),
            ],
            relations: vec![Relation::between("mail_create", "mail_reply")
                .with_binding(RelationBinding::field("id", "parent_id"))],
            config: RunConfig::default(),
        };

        let outcome = graph::build(&suite.relations, &suite.units);
        let order = scheduler::order_strict(&outcome.graph.nodes, &outcome.graph.edges).unwrap();
        assert_eq!(order, vec!["mail_create", "mail_reply"]);
    }
}
