//! Host protocol envelope
//!
//! Four verbs carried over a request/response protocol. The dispatcher is
//! stateless per request; everything here is plain serde data.

use crate::capability::Verb;
use crate::error::Error;
use crate::types::{ArtifactKind, Limits, Space};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A host protocol request. `verb`, and usually `kind` + `id`, are set;
/// the rest is verb-dependent.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Request {
    pub verb: Verb,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<ArtifactKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub space: Option<Space>,
    /// Search query text, or sign glob.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    /// Search scope: `<kind>[.<prefix>.*]`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// Runtime parameters for execute.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub params: serde_json::Map<String, Value>,
    #[serde(default)]
    pub options: RequestOptions,
}

impl Request {
    pub fn new(verb: Verb) -> Self {
        Self {
            verb,
            kind: None,
            id: None,
            space: None,
            query: None,
            scope: None,
            params: serde_json::Map::new(),
            options: RequestOptions::default(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RequestOptions {
    /// execute: validate only, do not dispatch.
    #[serde(default)]
    pub dry_run: bool,
    /// execute workflow: spawn a thread instead of returning the body.
    #[serde(default)]
    pub thread: bool,
    /// execute workflow as thread: detach instead of awaiting.
    #[serde(default, rename = "async")]
    pub detach: bool,
    /// Model override for spawned threads.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Limit overrides for spawned threads (must not exceed caps).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overrides: Option<Limits>,
    /// load: copy into this tier.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination: Option<Space>,
    /// search pagination.
    #[serde(default)]
    pub page: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_size: Option<usize>,
    /// search: enable bounded-edit-distance fuzzy matching.
    #[serde(default)]
    pub fuzzy: bool,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Success,
    Error,
}

/// Every response is `{status, …}`; errors add a machine-readable kind.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Response {
    pub status: ResponseStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
}

impl Response {
    pub fn success(data: Value) -> Self {
        Self {
            status: ResponseStatus::Success,
            error: None,
            data,
        }
    }

    pub fn failure(err: &Error) -> Self {
        Self {
            status: ResponseStatus::Error,
            error: Some(ErrorBody {
                kind: err.kind().to_string(),
                message: err.to_string(),
                detail: None,
            }),
            data: Value::Null,
        }
    }

    pub fn failure_with_detail(err: &Error, detail: Value) -> Self {
        Self {
            status: ResponseStatus::Error,
            error: Some(ErrorBody {
                kind: err.kind().to_string(),
                message: err.to_string(),
                detail: Some(detail),
            }),
            data: Value::Null,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ResponseStatus::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_response_carries_kind() {
        let resp = Response::failure(&Error::not_found("tool files/read"));
        assert!(!resp.is_success());
        let body = resp.error.unwrap();
        assert_eq!(body.kind, "NotFound");
        assert!(body.message.contains("files/read"));
    }

    #[test]
    fn request_roundtrip() {
        let mut req = Request::new(Verb::Execute);
        req.kind = Some(ArtifactKind::Tool);
        req.id = Some("files/read".into());
        req.options.dry_run = true;
        let json = serde_json::to_string(&req).unwrap();
        let back: Request = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id.as_deref(), Some("files/read"));
        assert!(back.options.dry_run);
    }
}
