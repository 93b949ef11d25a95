//! Response checks deciding whether a unit passed.

use crate::error::{BusinessStatus, Result};
use crate::extractor;
use crate::model::{ResponseExpectation, StatusDiscriminator};
use crate::runner::UnitResponse;
use serde_json::Value;
use std::collections::HashMap;

/// Status check; any 2xx passes when nothing is declared.
pub fn validate_status(expected: Option<u16>, actual: u16) -> Option<String> {
    match expected {
        Some(expected) if expected != actual => Some(format!(
            "status mismatch: expected {expected}, got {actual}"
        )),
        None if !(200..300).contains(&actual) => {
            Some(format!("status {actual} is not a success status"))
        }
        _ => None,
    }
}

/// Compare JSONPath expectations against the decoded body.
pub fn validate_json(
    json: &Value,
    expectations: &HashMap<String, Value>,
) -> Result<Vec<String>> {
    let mut errors = Vec::new();

    let mut paths: Vec<&String> = expectations.keys().collect();
    paths.sort();
    for path in paths {
        let expected = &expectations[path];
        match extractor::extract_first(json, path)? {
            Some(actual) if &actual == expected => {}
            Some(actual) => errors.push(format!(
                "JSON path '{path}' mismatch: expected {expected}, got {actual}"
            )),
            None => errors.push(format!("JSON path '{path}' not found in response")),
        }
    }

    Ok(errors)
}

/// Header names compare case-insensitively.
pub fn validate_headers(
    headers: &HashMap<String, String>,
    expectations: &HashMap<String, String>,
) -> Vec<String> {
    let mut errors = Vec::new();

    for (name, expected) in expectations {
        let actual = headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v);
        match actual {
            Some(actual) if actual == expected => {}
            Some(actual) => errors.push(format!(
                "header '{name}' mismatch: expected {expected}, got {actual}"
            )),
            None => errors.push(format!("header '{name}' missing from response")),
        }
    }

    errors.sort();
    errors
}

/// Every failed expectation for `response`.
pub fn validate(
    expect: &ResponseExpectation,
    response: &UnitResponse,
) -> Result<Vec<String>> {
    let mut errors = Vec::new();
    errors.extend(validate_status(expect.status, response.status));
    errors.extend(validate_headers(&response.headers, &expect.headers));

    if !expect.json.is_empty() {
        match &response.json {
            Some(json) => errors.extend(validate_json(json, &expect.json)?),
            None => errors.push("response body is not valid JSON".to_string()),
        }
    }

    Ok(errors)
}

/// Business status reported in `body`, if the discriminator field is
/// present.
pub fn business_status(
    body: &Value,
    discriminator: &StatusDiscriminator,
) -> Option<BusinessStatus> {
    let code = extractor::extract_first(body, &discriminator.code).ok()??;
    let message = extractor::extract_first(body, &discriminator.message)
        .ok()
        .flatten()
        .map(|m| extractor::value_to_text(&m));
    Some(BusinessStatus { code, message })
}

/// True when `body` carries a status code other than the success value.
pub fn is_business_failure(body: &Value, discriminator: &StatusDiscriminator) -> bool {
    business_status(body, discriminator)
        .is_some_and(|status| status.code != discriminator.success)
}
