//! Line protocol types exchanged between the pool and a worker over the
//! worker's stdin/stdout.
//!
//! Every message is a single JSON object terminated by `\n`, UTF-8, at most
//! [`MAX_LINE_BYTES`] bytes. There is no framing beyond the newline — the
//! protocol relies on `serde_json` objects never containing a literal,
//! un-escaped newline.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Current protocol version advertised by this crate.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Maximum size, in bytes, of a single protocol line (request or response).
pub const MAX_LINE_BYTES: usize = 1_048_576;

/// Maximum total bytes a worker will read from stdin across its lifetime
/// before refusing further input. Matches `MAX_LINE_BYTES` per spec: a
/// worker that reads nothing but one maximal request has used its whole
/// budget.
pub const MAX_TOTAL_INPUT_BYTES: usize = 1_048_576;

/// The kind of request being sent to a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestType {
    /// A liveness probe. Bypasses rate limiter and circuit breaker on the
    /// host side; answered unconditionally with `status: "pong"`.
    Ping,
    /// Run the embedded task through the worker's LLM/tool loop.
    Execute,
}

/// A single request sent host → worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Protocol version this request was built against. See
    /// [`CompatLevel::classify`] for the acceptance rule.
    #[serde(default)]
    pub version: String,

    /// Unique id for this request, used to demultiplex the response.
    pub id: String,

    /// Correlation id for tracing a task across logs. Defaults to `id` if
    /// the caller does not supply one.
    #[serde(default)]
    pub correlation_id: String,

    /// What kind of request this is.
    #[serde(rename = "type")]
    pub request_type: RequestType,

    /// The task text. Ignored for `Ping`.
    #[serde(default)]
    pub task: String,

    /// Caller-requested timeout, in seconds. `0` means "use the pool
    /// default".
    #[serde(default)]
    pub timeout_s: u64,

    /// Optional absolute Unix-epoch deadline (seconds). If present and
    /// already past by the time the worker picks up the request, the
    /// worker rejects it with `"request expired"` rather than running it.
    #[serde(default)]
    pub deadline_unix: Option<u64>,

    /// Secret values filtered to this task's allow-list. Installed into the
    /// worker's process-local secret store for the duration of the task and
    /// cleared unconditionally afterward.
    #[serde(default)]
    pub secrets: HashMap<String, String>,

    /// LLM API key for this task, handed over the protocol rather than via
    /// process environment. `None` after the worker has initialized its LLM
    /// client once (see spec §4.7).
    #[serde(default)]
    pub llm_api_key: Option<String>,
}

impl Request {
    /// Builds a minimal `ping` request.
    pub fn ping(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            version: PROTOCOL_VERSION.to_string(),
            correlation_id: id.clone(),
            id,
            request_type: RequestType::Ping,
            task: String::new(),
            timeout_s: 0,
            deadline_unix: None,
            secrets: HashMap::new(),
            llm_api_key: None,
        }
    }

    /// Returns the correlation id, falling back to `id` when unset.
    pub fn correlation_id_or_id(&self) -> &str {
        if self.correlation_id.is_empty() {
            &self.id
        } else {
            &self.correlation_id
        }
    }
}

/// Status of a completed or in-flight response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Success,
    Error,
    Pong,
}

/// A single response sent worker → host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// Echoes [`Request::id`] so the reader can demultiplex it.
    pub id: String,

    /// Echoes [`Request::correlation_id`].
    #[serde(default)]
    pub correlation_id: String,

    /// Protocol version the worker is speaking.
    #[serde(default = "default_version")]
    pub version: String,

    pub status: ResponseStatus,

    /// Present when `status == Success`.
    #[serde(default)]
    pub result: Option<String>,

    /// Present when `status == Error`.
    #[serde(default)]
    pub error: Option<String>,
}

fn default_version() -> String {
    PROTOCOL_VERSION.to_string()
}

impl Response {
    pub fn success(id: impl Into<String>, correlation_id: impl Into<String>, result: String) -> Self {
        Self {
            id: id.into(),
            correlation_id: correlation_id.into(),
            version: PROTOCOL_VERSION.to_string(),
            status: ResponseStatus::Success,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: impl Into<String>, correlation_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            correlation_id: correlation_id.into(),
            version: PROTOCOL_VERSION.to_string(),
            status: ResponseStatus::Error,
            result: None,
            error: Some(message.into()),
        }
    }

    pub fn pong(id: impl Into<String>, correlation_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            correlation_id: correlation_id.into(),
            version: PROTOCOL_VERSION.to_string(),
            status: ResponseStatus::Pong,
            result: None,
            error: None,
        }
    }

    /// Serializes to a single protocol line, including the trailing `\n`.
    pub fn to_line(&self) -> serde_json::Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

/// The outcome of checking a request's `version` field against the
/// compatibility table in spec §4.7/§6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompatLevel {
    /// `"1.0"` or empty — fully current.
    Current,
    /// `"0.9"` — accepted, but deprecated.
    Deprecated,
    /// Anything else — rejected.
    Incompatible,
}

impl CompatLevel {
    /// Classifies a `version` string per the protocol's compatibility
    /// table. Empty strings are treated as `"1.0"` (spec §9 open question:
    /// left as-is, not tightened).
    pub fn classify(version: &str) -> Self {
        match version {
            "" | "1.0" => CompatLevel::Current,
            "0.9" => CompatLevel::Deprecated,
            _ => CompatLevel::Incompatible,
        }
    }

    pub fn is_accepted(self) -> bool {
        !matches!(self, CompatLevel::Incompatible)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_empty_is_current() {
        assert_eq!(CompatLevel::classify(""), CompatLevel::Current);
    }

    #[test]
    fn classify_1_0_is_current() {
        assert_eq!(CompatLevel::classify("1.0"), CompatLevel::Current);
    }

    #[test]
    fn classify_0_9_is_deprecated_but_accepted() {
        assert_eq!(CompatLevel::classify("0.9"), CompatLevel::Deprecated);
        assert!(CompatLevel::classify("0.9").is_accepted());
    }

    #[test]
    fn classify_unknown_is_incompatible() {
        assert_eq!(CompatLevel::classify("2.0"), CompatLevel::Incompatible);
        assert!(!CompatLevel::classify("2.0").is_accepted());
    }

    #[test]
    fn ping_request_round_trips() {
        let req = Request::ping("abc");
        let json = serde_json::to_string(&req).expect("serialize");
        let back: Request = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.id, "abc");
        assert_eq!(back.request_type, RequestType::Ping);
    }

    #[test]
    fn correlation_id_defaults_to_id() {
        let req = Request {
            version: "1.0".into(),
            id: "x".into(),
            correlation_id: String::new(),
            request_type: RequestType::Execute,
            task: "do thing".into(),
            timeout_s: 0,
            deadline_unix: None,
            secrets: HashMap::new(),
            llm_api_key: None,
        };
        assert_eq!(req.correlation_id_or_id(), "x");
    }

    #[test]
    fn response_success_serializes_with_result() {
        let resp = Response::success("a", "a", "ok".to_string());
        let json = serde_json::to_string(&resp).expect("serialize");
        assert!(json.contains(r#""status":"success""#));
        assert!(json.contains(r#""result":"ok""#));
    }

    #[test]
    fn response_to_line_ends_with_newline() {
        let resp = Response::pong("a", "a");
        let line = resp.to_line().expect("serialize");
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
    }

    #[test]
    fn response_error_has_no_result() {
        let resp = Response::error("a", "a", "boom");
        assert!(resp.result.is_none());
        assert_eq!(resp.error.as_deref(), Some("boom"));
    }
}
