//! Serde-deserializable types matching Jira API error payloads.

use serde::Deserialize;
use std::collections::BTreeMap;

/// Error body returned by Jira REST endpoints.
///
/// Core endpoints send `errorMessages` + `errors`; some gateway and agile
/// endpoints send a bare `message`.
#[derive(Debug, Default, Deserialize)]
pub struct ApiErrorBody {
  #[serde(rename = "errorMessages", default)]
  pub error_messages: Vec<String>,
  /// Field name -> problem, for validation failures
  #[serde(default)]
  pub errors: BTreeMap<String, String>,
  #[serde(default)]
  pub message: Option<String>,
  #[serde(rename = "errorCode", default)]
  pub error_code: Option<String>,
}

impl ApiErrorBody {
  /// Parse a body, returning `None` when it is not a Jira error document.
  pub fn parse(body: &[u8]) -> Option<Self> {
    let parsed: Self = serde_json::from_slice(body).ok()?;
    (!parsed.is_empty()).then_some(parsed)
  }

  pub fn is_empty(&self) -> bool {
    self.error_messages.is_empty()
      && self.errors.is_empty()
      && self.message.is_none()
      && self.error_code.is_none()
  }

  /// One-line human summary.
  pub fn summary(&self) -> String {
    let mut parts: Vec<String> = self.error_messages.clone();
    if let Some(m) = &self.message {
      parts.push(m.clone());
    }
    parts.extend(self.errors.iter().map(|(field, msg)| format!("{}: {}", field, msg)));
    parts.join("; ")
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_parse_core_error_body() {
    let body = br#"{"errorMessages":["Issue does not exist or you do not have permission to see it."],"errors":{}}"#;
    let parsed = ApiErrorBody::parse(body).unwrap();
    assert_eq!(
      parsed.summary(),
      "Issue does not exist or you do not have permission to see it."
    );
  }

  #[test]
  fn test_parse_field_errors() {
    let body = br#"{"errorMessages":[],"errors":{"summary":"You must specify a summary of the issue."}}"#;
    let parsed = ApiErrorBody::parse(body).unwrap();
    assert_eq!(parsed.summary(), "summary: You must specify a summary of the issue.");
  }

  #[test]
  fn test_non_error_bodies_are_ignored() {
    assert!(ApiErrorBody::parse(b"<html>Bad Gateway</html>").is_none());
    assert!(ApiErrorBody::parse(b"{}").is_none());
    assert!(ApiErrorBody::parse(br#"{"key":"PROJ-1"}"#).is_none());
  }
}
