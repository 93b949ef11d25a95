//! Error types for unit resolution, extraction and caching.

use thiserror::Error;

/// Result type alias for caseflow operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Business status reported by a prerequisite's response body.
#[derive(Debug, Clone, PartialEq)]
pub struct BusinessStatus {
    pub code: serde_json::Value,
    pub message: Option<String>,
}

impl std::fmt::Display for BusinessStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "code={}", self.code)?;
        if let Some(message) = &self.message {
            write!(f, ", message={message}")?;
        }
        Ok(())
    }
}

fn business_suffix(business: &Option<BusinessStatus>) -> String {
    match business {
        Some(status) => format!(" (prerequisite reported {status})"),
        None => String::new(),
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("cache key '{key}' not found")]
    KeyNotFound { key: String },

    #[error("remote cache backend unavailable for key '{key}': {reason}")]
    BackendUnavailable { key: String, reason: String },

    #[error("invalid extraction path '{path}': {reason}")]
    ExtractionSyntax { path: String, reason: String },

    #[error(
        "prerequisite '{prerequisite}' produced no data at '{path}' \
         for unit '{unit}'{}",
        business_suffix(.business)
    )]
    NoMatchingData {
        unit: String,
        prerequisite: String,
        path: String,
        business: Option<BusinessStatus>,
    },

    #[error("prerequisite '{prerequisite}' of unit '{unit}' failed: {reason}")]
    PrerequisiteFailed {
        unit: String,
        prerequisite: String,
        reason: String,
    },

    #[error("dependency cycle or unresolved ordering involving: {}", .units.join(", "))]
    CycleOrUnresolved { units: Vec<String> },

    #[error("unit '{unit}' references unknown unit '{reference}'")]
    UnknownUnit { unit: String, reference: String },

    #[error("invalid target path '{path}': {reason}")]
    InvalidTarget { path: String, reason: String },

    #[error("invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("request for unit '{unit}' failed: {reason}")]
    Transport { unit: String, reason: String },

    #[error("unit '{unit}' did not meet expectations: {}", .failures.join("; "))]
    Expectation { unit: String, failures: Vec<String> },
}

impl Error {
    pub fn backend_unavailable<K: Into<String>, R: ToString>(
        key: K,
        reason: R,
    ) -> Self {
        Self::BackendUnavailable {
            key: key.into(),
            reason: reason.to_string(),
        }
    }

    pub fn invalid_target<P: Into<String>, R: Into<String>>(
        path: P,
        reason: R,
    ) -> Self {
        Self::InvalidTarget {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn timed_out<U: Into<String>>(unit: U, after: std::time::Duration) -> Self {
        Self::Transport {
            unit: unit.into(),
            reason: format!("timed out after {after:?}"),
        }
    }

    /// True for failures caused by the data a prerequisite produced,
    /// as opposed to configuration or transport problems.
    pub fn is_data_failure(&self) -> bool {
        matches!(
            self,
            Self::NoMatchingData { .. } | Self::PrerequisiteFailed { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn no_matching_data_mentions_business_status() {
        let err = Error::NoMatchingData {
            unit: "reply".into(),
            prerequisite: "create".into(),
            path: "$.data.id".into(),
            business: Some(BusinessStatus {
                code: json!(40001),
                message: Some("quota exceeded".into()),
            }),
        };
        let text = err.to_string();
        assert!(text.contains("code=40001"), "{text}");
        assert!(text.contains("quota exceeded"), "{text}");
        assert!(err.is_data_failure());
    }

    #[test]
    fn no_matching_data_without_business_status() {
        let err = Error::NoMatchingData {
            unit: "reply".into(),
            prerequisite: "create".into(),
            path: "$.id".into(),
            business: None,
        };
        assert!(!err.to_string().contains("reported"));
    }
}
