//! Per-unit dependency resolution and execution.
//!
//! A unit moves through `Pending → ResolvingDependencies → Ready →
//! Executed → CacheWritten`, or ends in `Failed` at any step. Values a
//! unit consumes are taken from its prerequisites' recorded exchanges,
//! so a prerequisite that has not run yet is executed first, inline.

use crate::cache::{CacheStore, SetOutcome, Tier};
use crate::error::{Error, Result};
use crate::extractor;
use crate::model::*;
use crate::runner::{join_base_url, UnitExecutor, UnitResponse};
use crate::substitute::{self, PreparedRequest, TargetPath};
use crate::validator;
use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};

/// What a finished unit left behind for its dependents.
#[derive(Debug, Clone)]
pub struct UnitOutcome {
    pub success: bool,
    pub state: UnitState,
    pub error: Option<String>,
    /// Request as sent, after substitution.
    pub request: Option<PreparedRequest>,
    pub response: Option<UnitResponse>,
}

struct Progress {
    state: UnitState,
    request: Option<PreparedRequest>,
    response: Option<UnitResponse>,
    cache_keys: Vec<String>,
}

impl Progress {
    fn new() -> Self {
        Self {
            state: UnitState::Pending,
            request: None,
            response: None,
            cache_keys: Vec::new(),
        }
    }

    fn advance(&mut self, unit: &str, next: UnitState) {
        debug!(unit, from = ?self.state, to = ?next, "state transition");
        self.state = next;
    }
}

pub struct DependencyResolver<'a> {
    units: HashMap<&'a str, &'a TestUnit>,
    cache: &'a CacheStore,
    executor: &'a dyn UnitExecutor,
    config: &'a RunConfig,
    outcomes: HashMap<String, UnitOutcome>,
    results: Vec<UnitResult>,
}

impl<'a> DependencyResolver<'a> {
    pub fn new(
        units: &'a [TestUnit],
        cache: &'a CacheStore,
        executor: &'a dyn UnitExecutor,
        config: &'a RunConfig,
    ) -> Self {
        let mut index = HashMap::with_capacity(units.len());
        for unit in units {
            index.entry(unit.id.as_str()).or_insert(unit);
        }
        Self {
            units: index,
            cache,
            executor,
            config,
            outcomes: HashMap::new(),
            results: Vec::new(),
        }
    }

    pub fn is_done(&self, id: &str) -> bool {
        self.outcomes.contains_key(id)
    }

    pub fn outcome(&self, id: &str) -> Option<&UnitOutcome> {
        self.outcomes.get(id)
    }

    /// Results in execution order.
    pub fn results(&self) -> &[UnitResult] {
        &self.results
    }

    pub fn into_results(self) -> Vec<UnitResult> {
        self.results
    }

    /// Run `id`, executing any prerequisite that has not run yet first.
    /// Returns whether `id` succeeded. Units run at most once.
    pub async fn run(&mut self, id: &str) -> bool {
        if let Some(outcome) = self.outcomes.get(id) {
            return outcome.success;
        }

        let chain = match self.pending_chain(id) {
            Ok(chain) => chain,
            Err(e) => {
                error!(unit = id, error = %e, "cannot resolve prerequisites");
                self.record_unresolvable(id, e);
                return false;
            }
        };

        for unit_id in &chain {
            let inline = unit_id != id;
            if inline {
                info!(unit = %unit_id, dependent = id, "executing prerequisite inline");
            }
            self.execute(unit_id, inline).await;
        }

        self.outcomes.get(id).is_some_and(|o| o.success)
    }

    /// Units that must run for `root`, prerequisites first, ending with
    /// `root` itself.
    fn pending_chain(&self, root: &str) -> Result<Vec<String>> {
        let mut chain = Vec::new();
        let mut path = Vec::new();
        self.visit(root, root, &mut path, &mut chain)?;
        Ok(chain)
    }

    fn visit(
        &self,
        id: &str,
        dependent: &str,
        path: &mut Vec<String>,
        chain: &mut Vec<String>,
    ) -> Result<()> {
        if self.outcomes.contains_key(id) || chain.iter().any(|c| c == id) {
            return Ok(());
        }
        if let Some(start) = path.iter().position(|p| p == id) {
            let mut units = path[start..].to_vec();
            units.push(id.to_string());
            return Err(Error::CycleOrUnresolved { units });
        }
        let unit = self.units.get(id).ok_or_else(|| Error::UnknownUnit {
            unit: dependent.to_string(),
            reference: id.to_string(),
        })?;

        path.push(id.to_string());
        if unit.has_dependencies() {
            for prerequisite in unit.prerequisites() {
                self.visit(prerequisite, id, path, chain)?;
            }
        }
        path.pop();
        chain.push(id.to_string());
        Ok(())
    }

    fn record_unresolvable(&mut self, id: &str, e: Error) {
        let description = self.units.get(id).and_then(|u| u.description.clone());
        self.outcomes.insert(
            id.to_string(),
            UnitOutcome {
                success: false,
                state: UnitState::Failed,
                error: Some(e.to_string()),
                request: None,
                response: None,
            },
        );
        self.results.push(UnitResult {
            id: id.to_string(),
            description,
            success: false,
            state: UnitState::Failed,
            error: Some(e.to_string()),
            request: None,
            response: None,
            cache_keys: Vec::new(),
            inline: false,
            duration_ms: 0,
        });
    }

    #[instrument(skip(self), fields(unit = %id))]
    async fn execute(&mut self, id: &str, inline: bool) {
        let Some(unit) = self.units.get(id).copied() else {
            return;
        };
        let started = Instant::now();
        let mut progress = Progress::new();

        let error = match self.drive(unit, &mut progress).await {
            Ok(()) => None,
            Err(e) => {
                if e.is_data_failure() {
                    warn!(unit = %unit.id, state = ?progress.state, "{e}");
                } else {
                    error!(unit = %unit.id, state = ?progress.state, "{e}");
                }
                progress.advance(&unit.id, UnitState::Failed);
                Some(e.to_string())
            }
        };
        let success = error.is_none();

        self.results.push(UnitResult {
            id: unit.id.clone(),
            description: unit.description.clone(),
            success,
            state: progress.state,
            error: error.clone(),
            request: progress.request.as_ref().map(request_info),
            response: progress.response.as_ref().map(response_info),
            cache_keys: progress.cache_keys,
            inline,
            duration_ms: started.elapsed().as_millis() as u64,
        });
        self.outcomes.insert(
            unit.id.clone(),
            UnitOutcome {
                success,
                state: progress.state,
                error,
                request: progress.request,
                response: progress.response,
            },
        );
    }

    async fn drive(&self, unit: &TestUnit, progress: &mut Progress) -> Result<()> {
        progress.advance(&unit.id, UnitState::ResolvingDependencies);

        let mut request = PreparedRequest::from(&unit.request);
        for (name, value) in &self.config.headers {
            request
                .headers
                .entry(name.clone())
                .or_insert_with(|| value.clone());
        }

        // Binding cache writes wait until every binding resolved.
        let mut staged = Vec::new();
        if unit.has_dependencies() {
            for dependency in &unit.depends_on {
                self.resolve_dependency(unit, dependency, &mut request, &mut staged)?;
            }
        } else if !unit.depends_on.is_empty() {
            debug!(unit = %unit.id, "dependencies declared but disabled");
        }
        // Remote writes can fail; local keys are only committed after them.
        let (remote, local): (Vec<_>, Vec<_>) = staged
            .into_iter()
            .partition(|(key, _)| Tier::of(key) == Tier::Remote);
        for (key, value) in remote.into_iter().chain(local) {
            if self.cache.set(&key, value).await? == SetOutcome::Stored {
                progress.cache_keys.push(key);
            }
        }

        let refs = request.cache_refs();
        if !refs.is_empty() {
            let found = self.cache.get_many(&refs).await?;
            substitute::expand_cache_refs(&mut request, &found);
        }
        request.url = join_base_url(self.config.base_url.as_deref(), &request.url)?;
        progress.advance(&unit.id, UnitState::Ready);

        let timeout = Duration::from_secs(unit.timeout.unwrap_or(self.config.timeout));
        let sent = progress.request.insert(request);
        let call = self.executor.execute(&unit.id, sent, timeout);
        let response = tokio::time::timeout(timeout, call)
            .await
            .map_err(|_| Error::timed_out(&unit.id, timeout))??;
        progress.advance(&unit.id, UnitState::Executed);

        let failures = validator::validate(&unit.expect, &response)?;
        if let Some(json) = &response.json {
            if validator::is_business_failure(json, &self.config.status) {
                warn!(
                    unit = %unit.id,
                    status = response.status,
                    "response reports a business failure code"
                );
            }
        }
        progress.response = Some(response);
        if !failures.is_empty() {
            return Err(Error::Expectation {
                unit: unit.id.clone(),
                failures,
            });
        }

        self.write_own_cache(unit, progress).await?;
        progress.advance(&unit.id, UnitState::CacheWritten);
        Ok(())
    }

    fn resolve_dependency(
        &self,
        unit: &TestUnit,
        dependency: &DependencyRef,
        request: &mut PreparedRequest,
        staged: &mut Vec<(String, Value)>,
    ) -> Result<()> {
        if dependency.is_self() {
            let setup = unit.setup.clone().unwrap_or(Value::Null);
            for binding in &dependency.bindings {
                match extractor::extract_first(&setup, &binding.path)? {
                    Some(value) => apply_binding(binding, value, request, staged)?,
                    None => warn!(
                        unit = %unit.id,
                        path = %binding.path,
                        "local setup produced no data, skipping binding"
                    ),
                }
            }
            return Ok(());
        }

        let prerequisite = dependency.target.as_str();
        let outcome = self
            .outcomes
            .get(prerequisite)
            .ok_or_else(|| Error::PrerequisiteFailed {
                unit: unit.id.clone(),
                prerequisite: prerequisite.to_string(),
                reason: "prerequisite has not run".to_string(),
            })?;
        if !outcome.success {
            return Err(Error::PrerequisiteFailed {
                unit: unit.id.clone(),
                prerequisite: prerequisite.to_string(),
                reason: outcome
                    .error
                    .clone()
                    .unwrap_or_else(|| "unknown error".to_string()),
            });
        }

        for binding in &dependency.bindings {
            let document = match binding.kind {
                DependencyKind::Response => outcome.response.as_ref().and_then(|r| r.json.as_ref()),
                DependencyKind::Request => outcome.request.as_ref().and_then(|r| r.body.as_ref()),
                DependencyKind::LocalSetup => self
                    .units
                    .get(prerequisite)
                    .and_then(|u| u.setup.as_ref()),
            };
            let found = match document {
                Some(document) => extractor::extract_first(document, &binding.path)?,
                None => None,
            };

            match found {
                Some(value) => {
                    debug!(
                        unit = %unit.id,
                        prerequisite,
                        path = %binding.path,
                        kind = %binding.kind,
                        "binding resolved"
                    );
                    apply_binding(binding, value, request, staged)?;
                }
                None if binding.kind == DependencyKind::LocalSetup => warn!(
                    unit = %unit.id,
                    prerequisite,
                    path = %binding.path,
                    "local setup produced no data, skipping binding"
                ),
                None => {
                    let business = outcome
                        .response
                        .as_ref()
                        .and_then(|r| r.json.as_ref())
                        .and_then(|json| validator::business_status(json, &self.config.status));
                    return Err(Error::NoMatchingData {
                        unit: unit.id.clone(),
                        prerequisite: prerequisite.to_string(),
                        path: binding.path.clone(),
                        business,
                    });
                }
            }
        }
        Ok(())
    }

    async fn write_own_cache(&self, unit: &TestUnit, progress: &mut Progress) -> Result<()> {
        for instruction in &unit.set_cache {
            let document = match instruction.from {
                CacheSource::Response => progress.response.as_ref().and_then(|r| r.json.as_ref()),
                CacheSource::Request => progress.request.as_ref().and_then(|r| r.body.as_ref()),
            };
            let Some(document) = document else {
                warn!(unit = %unit.id, key = %instruction.name, "no JSON body to cache from");
                continue;
            };
            let Some(value) = extractor::extract_first(document, &instruction.path)? else {
                warn!(
                    unit = %unit.id,
                    key = %instruction.name,
                    path = %instruction.path,
                    "cache instruction matched nothing"
                );
                continue;
            };
            if self.cache.set(&instruction.name, value).await? == SetOutcome::Stored {
                progress.cache_keys.push(instruction.name.clone());
            }
        }
        Ok(())
    }
}

fn apply_binding(
    binding: &FieldBinding,
    value: Value,
    request: &mut PreparedRequest,
    staged: &mut Vec<(String, Value)>,
) -> Result<()> {
    if let Some(target) = &binding.target {
        let target: TargetPath = target.parse()?;
        request.apply(&target, &value)?;
    }
    if let Some(key) = &binding.set_cache {
        staged.push((key.clone(), value));
    }
    Ok(())
}

fn request_info(request: &PreparedRequest) -> RequestInfo {
    RequestInfo {
        method: request.method.as_str().to_string(),
        url: request.url.clone(),
        headers: request.headers.clone(),
        body: request.body.as_ref().map(Value::to_string),
    }
}

fn response_info(response: &UnitResponse) -> ResponseInfo {
    ResponseInfo {
        status: response.status,
        headers: response.headers.clone(),
        body: Some(response.body.clone()),
    }
}
