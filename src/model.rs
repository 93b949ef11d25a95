//! Declarations of test units, their dependencies and relations, plus
//! the run report types.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Sentinel dependency target meaning "my own setup data".
pub const SELF_TARGET: &str = "self";

/// A suite of units and relation declarations loaded from one or more
/// documents.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestSuite {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub units: Vec<TestUnit>,
    #[serde(default)]
    pub relations: Vec<Relation>,
    #[serde(default)]
    pub config: RunConfig,
}

/// One executable API test case.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestUnit {
    /// Unique identifier.
    pub id: String,
    /// Identifier of the document the unit was declared in.
    #[serde(default)]
    pub document: Option<String>,
    /// Human-readable description.
    #[serde(default)]
    pub description: Option<String>,
    /// Outbound call shape.
    pub request: HttpRequest,
    /// Declared prerequisites, resolved in order.
    #[serde(default, alias = "dependencies")]
    pub depends_on: Vec<DependencyRef>,
    /// Explicit "has dependencies" flag. Derived from `depends_on`
    /// when absent.
    #[serde(default)]
    pub has_dependencies: Option<bool>,
    /// Locally supplied data for `self` references.
    #[serde(default)]
    pub setup: Option<Value>,
    /// Response expectations deciding pass/fail.
    #[serde(default)]
    pub expect: ResponseExpectation,
    /// Values this unit stores for later consumers once it executed.
    #[serde(default)]
    pub set_cache: Vec<CacheInstruction>,
    /// Timeout override in seconds for this unit's call.
    #[serde(default)]
    pub timeout: Option<u64>,
}

impl TestUnit {
    pub fn new(id: impl Into<String>, method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            document: None,
            description: None,
            request: HttpRequest {
                method,
                url: url.into(),
                headers: HashMap::new(),
                query: HashMap::new(),
                body: None,
            },
            depends_on: Vec::new(),
            has_dependencies: None,
            setup: None,
            expect: ResponseExpectation::default(),
            set_cache: Vec::new(),
            timeout: None,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.request.headers.insert(name.into(), value.into());
        self
    }

    pub fn caching(mut self, instruction: CacheInstruction) -> Self {
        self.set_cache.push(instruction);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.request.body = Some(body);
        self
    }

    pub fn with_dependency(mut self, dependency: DependencyRef) -> Self {
        self.depends_on.push(dependency);
        self
    }

    pub fn has_dependencies(&self) -> bool {
        self.has_dependencies
            .unwrap_or_else(|| !self.depends_on.is_empty())
    }

    /// Identifiers of other units this unit declares as prerequisites.
    pub fn prerequisites(&self) -> impl Iterator<Item = &str> {
        self.depends_on
            .iter()
            .filter(|d| !d.is_self())
            .map(|d| d.target.as_str())
    }
}

/// Reference from a unit to a prerequisite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencyRef {
    /// Prerequisite unit identifier, or `self`.
    #[serde(alias = "case_id")]
    pub target: String,
    #[serde(default)]
    pub bindings: Vec<FieldBinding>,
}

impl DependencyRef {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            bindings: Vec::new(),
        }
    }

    pub fn bind(mut self, binding: FieldBinding) -> Self {
        self.bindings.push(binding);
        self
    }

    pub fn is_self(&self) -> bool {
        self.target == SELF_TARGET
    }
}

/// Where a binding reads its value from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DependencyKind {
    Response,
    Request,
    #[serde(alias = "local_setup", alias = "sql")]
    LocalSetup,
}

impl Default for DependencyKind {
    fn default() -> Self {
        Self::Response
    }
}

impl std::fmt::Display for DependencyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Response => "response",
            Self::Request => "request",
            Self::LocalSetup => "local-setup",
        };
        f.write_str(name)
    }
}

/// One field-level extraction/substitution instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldBinding {
    /// JSONPath applied to the prerequisite's request or response.
    #[serde(alias = "jsonpath")]
    pub path: String,
    #[serde(default)]
    pub kind: DependencyKind,
    /// Cache key the extracted value is stored under.
    #[serde(default)]
    pub set_cache: Option<String>,
    /// Where the value lands in this unit's request. `None` means the
    /// binding only seeds the cache.
    #[serde(default, alias = "replace_key")]
    pub target: Option<String>,
}

impl FieldBinding {
    pub fn new(path: impl Into<String>, kind: DependencyKind) -> Self {
        Self {
            path: path.into(),
            kind,
            set_cache: None,
            target: None,
        }
    }

    pub fn into_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn cached_as(mut self, key: impl Into<String>) -> Self {
        self.set_cache = Some(key.into());
        self
    }

    pub fn is_stored_only(&self) -> bool {
        self.target.is_none()
    }
}

/// Which side of a unit's own exchange a cache instruction reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CacheSource {
    #[default]
    Response,
    Request,
}

/// Store a value from this unit's own exchange under `name`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheInstruction {
    pub name: String,
    #[serde(alias = "jsonpath")]
    pub path: String,
    #[serde(default)]
    pub from: CacheSource,
}

/// A declared data-flow edge between two units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relation {
    /// Source unit identifier or identifier fragment.
    #[serde(default)]
    pub source: Option<String>,
    /// Target unit identifier or identifier fragment.
    #[serde(default)]
    pub target: Option<String>,
    /// File-name fragment used when a side is not declared.
    #[serde(default)]
    pub document: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub bindings: Vec<RelationBinding>,
}

impl Relation {
    pub fn between(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: Some(source.into()),
            target: Some(target.into()),
            document: None,
            description: None,
            bindings: Vec::new(),
        }
    }

    pub fn with_binding(mut self, binding: RelationBinding) -> Self {
        self.bindings.push(binding);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Field-level flow inside a relation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationBinding {
    #[serde(default)]
    pub source_field: Option<String>,
    #[serde(default)]
    pub target_field: Option<String>,
    /// Explicit extraction path; derived from `source_field` when
    /// absent.
    #[serde(default, alias = "jsonpath")]
    pub path: Option<String>,
    #[serde(default)]
    pub kind: DependencyKind,
}

impl RelationBinding {
    pub fn field(source_field: impl Into<String>, target_field: impl Into<String>) -> Self {
        Self {
            source_field: Some(source_field.into()),
            target_field: Some(target_field.into()),
            path: None,
            kind: DependencyKind::Response,
        }
    }

    /// A binding carries data flow when it can be extracted and has a
    /// place to land.
    pub fn is_actionable(&self) -> bool {
        let extractable = self
            .path
            .as_deref()
            .or(self.source_field.as_deref())
            .is_some_and(|s| !s.trim().is_empty());
        let usable = self
            .target_field
            .as_deref()
            .is_some_and(|s| !s.trim().is_empty());
        extractable && usable
    }

    /// Convert into a unit-level binding.
    pub fn to_field_binding(&self) -> Option<FieldBinding> {
        if !self.is_actionable() {
            return None;
        }
        let path = match (&self.path, &self.source_field) {
            (Some(path), _) if !path.trim().is_empty() => path.clone(),
            (_, Some(field)) => format!("$..{}", field.trim()),
            _ => return None,
        };
        let target = self.target_field.as_deref()?.trim();
        let target = if crate::substitute::has_location_prefix(target) {
            target.to_string()
        } else {
            format!("body.{target}")
        };
        Some(FieldBinding {
            path,
            kind: self.kind,
            set_cache: None,
            target: Some(target),
        })
    }
}

/// HTTP request shape of a unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub query: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Patch => "PATCH",
            Self::Head => "HEAD",
            Self::Options => "OPTIONS",
        }
    }
}

/// Declarative response expectations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseExpectation {
    /// Expected status; any 2xx passes when absent.
    #[serde(default)]
    pub status: Option<u16>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// JSONPath → expected value.
    #[serde(default)]
    pub json: HashMap<String, Value>,
}

/// Run-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default)]
    pub base_url: Option<String>,
    /// Headers added to every unit unless the unit sets them.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Per-request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default)]
    pub stop_on_failure: bool,
    #[serde(default)]
    pub status: StatusDiscriminator,
    #[serde(default)]
    pub cache: CacheConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            headers: HashMap::new(),
            timeout: default_timeout(),
            stop_on_failure: false,
            status: StatusDiscriminator::default(),
            cache: CacheConfig::default(),
        }
    }
}

fn default_timeout() -> u64 {
    30
}

/// How a response body reports business success.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusDiscriminator {
    /// JSONPath of the status code field.
    #[serde(default = "default_code_path")]
    pub code: String,
    /// JSONPath of the status message field.
    #[serde(default = "default_message_path")]
    pub message: String,
    /// Code value meaning success.
    #[serde(default = "default_success_code")]
    pub success: Value,
}

impl Default for StatusDiscriminator {
    fn default() -> Self {
        Self {
            code: default_code_path(),
            message: default_message_path(),
            success: default_success_code(),
        }
    }
}

fn default_code_path() -> String {
    "$.code".to_string()
}

fn default_message_path() -> String {
    "$.message".to_string()
}

fn default_success_code() -> Value {
    Value::from(0)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Base URL of the remote key-value service.
    #[serde(default)]
    pub remote_url: Option<String>,
    /// Prefix prepended to every remote key.
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            remote_url: None,
            namespace: default_namespace(),
        }
    }
}

fn default_namespace() -> String {
    "caseflow:".to_string()
}

impl TestSuite {
    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }

    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn unit(&self, id: &str) -> Option<&TestUnit> {
        self.units.iter().find(|u| u.id == id)
    }
}

/// Lifecycle of a unit within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitState {
    Pending,
    ResolvingDependencies,
    Ready,
    Executed,
    CacheWritten,
    Failed,
}

/// Result of running a whole suite.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub name: String,
    pub success: bool,
    pub order: Vec<String>,
    pub units: Vec<UnitResult>,
    pub warnings: Vec<String>,
    pub duration_ms: u64,
    pub timestamp: String,
}

impl RunReport {
    pub fn unit(&self, id: &str) -> Option<&UnitResult> {
        self.units.iter().find(|u| u.id == id)
    }

    pub fn passed(&self) -> usize {
        self.units.iter().filter(|u| u.success).count()
    }

    pub fn failed(&self) -> usize {
        self.units.len() - self.passed()
    }
}

/// Result of running a single unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitResult {
    pub id: String,
    pub description: Option<String>,
    pub success: bool,
    pub state: UnitState,
    pub error: Option<String>,
    pub request: Option<RequestInfo>,
    pub response: Option<ResponseInfo>,
    pub cache_keys: Vec<String>,
    /// Executed ahead of its scheduled position to satisfy a
    /// dependent.
    pub inline: bool,
    pub duration_ms: u64,
}

/// Captured HTTP request information for a unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestInfo {
    pub method: String,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: Option<String>,
}

/// Captured HTTP response information for a unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseInfo {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Option<String>,
}
