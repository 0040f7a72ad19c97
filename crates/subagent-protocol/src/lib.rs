//! Wire protocol and security contract shared by the subagent pool (host
//! side) and the sandboxed worker process (container side).
//!
//! This crate has no knowledge of containers, pools, or admission control —
//! it is the seam both sides link against so the newline-delimited JSON
//! protocol and the injection sanitizer can never drift between them.

pub mod protocol;
pub mod redact;
pub mod sanitizer;

pub use protocol::{
    CompatLevel, Request, RequestType, Response, ResponseStatus, MAX_LINE_BYTES,
    MAX_TOTAL_INPUT_BYTES, PROTOCOL_VERSION,
};
pub use redact::redact_for_log;
pub use sanitizer::{
    ContextType, InjectionSanitizer, PatternConfig, SanitizeOutcome, ValidationReport,
};
