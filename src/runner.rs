//! Suite execution: planning, HTTP dispatch and report assembly.

use crate::cache::CacheStore;
use crate::error::{Error, Result as CaseResult};
use crate::graph::{BuildWarning, DependencyGraph, GraphBuilder};
use crate::model::*;
use crate::resolver::DependencyResolver;
use crate::scheduler::{self, Schedule};
use crate::substitute::PreparedRequest;
use anyhow::Result;
use async_trait::async_trait;
use reqwest::{Client, Method as ReqMethod};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

/// Outcome of one outbound call.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: String,
    /// Body decoded as JSON, when it is JSON.
    pub json: Option<Value>,
}

impl UnitResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        let json = serde_json::from_str(&body).ok();
        Self {
            status,
            headers: HashMap::new(),
            body,
            json,
        }
    }
}

/// Sends a fully prepared request.
#[async_trait]
pub trait UnitExecutor: Send + Sync {
    async fn execute(
        &self,
        unit: &str,
        request: &PreparedRequest,
        timeout: Duration,
    ) -> CaseResult<UnitResponse>;
}

/// [`UnitExecutor`] backed by reqwest.
#[derive(Debug, Clone, Default)]
pub struct HttpExecutor {
    client: Client,
}

impl HttpExecutor {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    fn convert_method(method: HttpMethod) -> ReqMethod {
        match method {
            HttpMethod::Get => ReqMethod::GET,
            HttpMethod::Post => ReqMethod::POST,
            HttpMethod::Put => ReqMethod::PUT,
            HttpMethod::Delete => ReqMethod::DELETE,
            HttpMethod::Patch => ReqMethod::PATCH,
            HttpMethod::Head => ReqMethod::HEAD,
            HttpMethod::Options => ReqMethod::OPTIONS,
        }
    }
}

#[async_trait]
impl UnitExecutor for HttpExecutor {
    #[instrument(
        skip(self, request, timeout),
        fields(url = %request.url, method = request.method.as_str())
    )]
    async fn execute(
        &self,
        unit: &str,
        request: &PreparedRequest,
        timeout: Duration,
    ) -> CaseResult<UnitResponse> {
        let transport = |reason: String| Error::Transport {
            unit: unit.to_string(),
            reason,
        };

        let mut builder = self
            .client
            .request(Self::convert_method(request.method), &request.url)
            .timeout(timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = &request.body {
            let has_content_type = request
                .headers
                .keys()
                .any(|k| k.eq_ignore_ascii_case("content-type"));
            if !has_content_type {
                builder = builder.header("Content-Type", "application/json");
            }
            let text = serde_json::to_string(body).map_err(|e| transport(e.to_string()))?;
            builder = builder.body(text);
        }

        debug!("Sending request to {}", request.url);
        let response = builder
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::timed_out(unit, timeout)
                } else {
                    transport(format!("failed to send request: {e}"))
                }
            })?;
        let status = response.status().as_u16();
        debug!("Received response with status: {}", status);

        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .map(|(name, value)| (name.to_string(), value.to_str().unwrap_or("").to_string()))
            .collect();
        let body = response
            .text()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::timed_out(unit, timeout)
                } else {
                    transport(format!("failed to read response body: {e}"))
                }
            })?;

        Ok(UnitResponse {
            status,
            headers,
            json: serde_json::from_str(&body).ok(),
            body,
        })
    }
}

/// Join a relative unit URL onto the configured base URL.
pub fn join_base_url(base_url: Option<&str>, url: &str) -> CaseResult<String> {
    let Some(base_url) = base_url else {
        return Ok(url.to_string());
    };
    if url.contains("://") {
        return Ok(url.to_string());
    }
    let invalid = |reason: String| Error::InvalidUrl {
        url: url.to_string(),
        reason,
    };
    let mut base = url::Url::parse(base_url)
        .map_err(|e| invalid(format!("invalid base_url '{base_url}': {e}")))?;
    if url.is_empty() {
        return Ok(base.to_string());
    }
    // Keep the base path: "/v1" + "mail" must give "/v1/mail".
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    base.join(url.trim_start_matches('/'))
        .map(|u| u.to_string())
        .map_err(|e| invalid(format!("failed to join with '{base_url}': {e}")))
}

/// Everything decided before any unit runs.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionPlan {
    /// Units with relation bindings folded into their dependencies.
    pub units: Vec<TestUnit>,
    pub graph: DependencyGraph,
    pub warnings: Vec<BuildWarning>,
    pub schedule: Schedule,
    /// Independent waves, for display.
    pub batches: Vec<Vec<String>>,
}

/// Suite runner trait
#[async_trait]
pub trait SuiteRunner: Send + Sync {
    /// Execute every unit of `suite` in dependency order.
    async fn run(&self, suite: &TestSuite) -> Result<RunReport>;
}

/// Default suite runner
pub struct DefaultSuiteRunner {
    executor: Arc<dyn UnitExecutor>,
    cache: Arc<CacheStore>,
    builder: GraphBuilder,
}

impl DefaultSuiteRunner {
    /// Runner sending real HTTP requests.
    pub fn new(cache: Arc<CacheStore>) -> Self {
        Self::with_executor(Arc::new(HttpExecutor::new()), cache)
    }

    pub fn with_executor(executor: Arc<dyn UnitExecutor>, cache: Arc<CacheStore>) -> Self {
        Self {
            executor,
            cache,
            builder: GraphBuilder::new().with_unit_dependencies(true),
        }
    }

    pub fn with_graph_builder(mut self, builder: GraphBuilder) -> Self {
        self.builder = builder;
        self
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    /// Build the graph and order the units without running anything.
    pub fn plan(&self, suite: &TestSuite) -> ExecutionPlan {
        let outcome = self.builder.build(&suite.relations, &suite.units);
        let units = materialize(&suite.units, &outcome.graph);
        let schedule = scheduler::order(&outcome.graph.nodes, &outcome.graph.edges);
        let batches = scheduler::batches(&outcome.graph.nodes, &outcome.graph.edges);
        ExecutionPlan {
            units,
            graph: outcome.graph,
            warnings: outcome.warnings,
            schedule,
            batches,
        }
    }
}

/// Fold inbound relations into the target units' dependencies, unless
/// the unit already declares that prerequisite itself.
fn materialize(units: &[TestUnit], graph: &DependencyGraph) -> Vec<TestUnit> {
    units
        .iter()
        .map(|unit| {
            let mut unit = unit.clone();
            for relation in graph.inbound.get(&unit.id).into_iter().flatten() {
                if unit.prerequisites().any(|p| p == relation.source) {
                    debug!(
                        unit = %unit.id,
                        source = %relation.source,
                        "dependency declared on unit, relation bindings ignored"
                    );
                    continue;
                }
                let bindings: Vec<FieldBinding> = relation
                    .bindings
                    .iter()
                    .filter_map(|b| b.to_field_binding())
                    .collect();
                if bindings.is_empty() {
                    continue;
                }
                unit.depends_on.push(DependencyRef {
                    target: relation.source.clone(),
                    bindings,
                });
            }
            unit
        })
        .collect()
}

#[async_trait]
impl SuiteRunner for DefaultSuiteRunner {
    #[instrument(skip(self, suite), fields(name = %suite.name))]
    async fn run(&self, suite: &TestSuite) -> Result<RunReport> {
        let start_time = Instant::now();
        info!("Starting test suite: {}", suite.name);
        // Each run starts with an empty local tier; remote keys persist.
        self.cache.reset();

        let plan = self.plan(suite);
        for warning in &plan.warnings {
            warn!("{warning}");
        }
        if !plan.schedule.is_complete() {
            warn!(units = ?plan.schedule.unresolved, "some units could not be ordered");
        }

        let mut resolver = DependencyResolver::new(
            &plan.units,
            &self.cache,
            self.executor.as_ref(),
            &suite.config,
        );
        let total = plan.schedule.order.len();
        for (idx, id) in plan.schedule.order.iter().enumerate() {
            if resolver.is_done(id) {
                debug!(unit = %id, "already executed as a prerequisite");
                continue;
            }
            info!("Running unit {}/{}: {}", idx + 1, total, id);
            let success = resolver.run(id).await;
            if !success && suite.config.stop_on_failure {
                info!("Stopping suite due to unit failure");
                break;
            }
        }

        let units = resolver.into_results();
        let success = units.iter().all(|u| u.success);
        let report = RunReport {
            name: suite.name.clone(),
            success,
            order: plan.schedule.order,
            units,
            warnings: plan.warnings.iter().map(ToString::to_string).collect(),
            duration_ms: start_time.elapsed().as_millis() as u64,
            timestamp: chrono::Utc::now().to_rfc3339(),
        };

        info!(
            "Test suite finished: {} ({} ms) - Success: {}",
            report.name, report.duration_ms, report.success
        );
        Ok(report)
    }
}
