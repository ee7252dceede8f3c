//! Shared error types including RFC7807 Problem Details.

use serde::{Deserialize, Serialize};

const PROBLEM_BASE: &str = "https://kinship.dev/problems";

/// RFC7807 Problem Details (application/problem+json)
///
/// The canonical error envelope for `/api/*` endpoints, including a refused
/// WebSocket handshake, so clients can tell "no token" from "bad token" from
/// "account disabled".
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProblemDetails {
    /// A URI reference that identifies the problem type.
    #[serde(rename = "type")]
    pub type_url: String,
    /// A short, human-readable summary of the problem type.
    pub title: String,
    /// HTTP status code.
    pub status: u16,
    /// Human-readable explanation specific to this occurrence.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Machine-readable reason, e.g. `INVALID_CREDENTIAL`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ProblemDetails {
    fn new(slug: &str, title: &str, status: u16, detail: impl Into<String>) -> Self {
        Self {
            type_url: format!("{PROBLEM_BASE}/{slug}"),
            title: title.to_string(),
            status,
            detail: Some(detail.into()),
            code: None,
        }
    }

    pub fn bad_request(detail: impl Into<String>) -> Self {
        Self::new("bad-request", "Bad Request", 400, detail)
    }

    pub fn unauthorized(detail: impl Into<String>) -> Self {
        Self::new("unauthorized", "Unauthorized", 401, detail)
    }

    pub fn forbidden(detail: impl Into<String>) -> Self {
        Self::new("forbidden", "Forbidden", 403, detail)
    }

    pub fn not_found(detail: impl Into<String>) -> Self {
        Self::new("not-found", "Not Found", 404, detail)
    }

    pub fn internal_error(detail: impl Into<String>) -> Self {
        Self::new("internal-error", "Internal Server Error", 500, detail)
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_is_serialized_only_when_set() {
        let plain = serde_json::to_value(ProblemDetails::bad_request("empty message")).unwrap();
        assert!(plain.get("code").is_none());
        assert_eq!(plain["type"], "https://kinship.dev/problems/bad-request");

        let coded = serde_json::to_value(ProblemDetails::unauthorized("expired").with_code("INVALID_CREDENTIAL")).unwrap();
        assert_eq!(coded["status"], 401);
        assert_eq!(coded["code"], "INVALID_CREDENTIAL");
    }
}
