//! The out-of-scope LLM/tool loop, pinned only by interface (spec §1/§6).
//!
//! A real deployment substitutes its own [`TaskRunner`] wired to an actual
//! model and tool set. [`EchoRunner`] is the inert default that ships with
//! this binary so it is runnable and testable standalone.

use async_trait::async_trait;

/// The worker's collaborator for turning a prepared task into a result
/// string. `task` has already been wrapped in the `[TASK:...]` /
/// `[EXTERNAL_DATA:...]` envelope by the time it reaches `run`.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run(&self, task: &str) -> Result<String, String>;
}

/// Echoes the prepared task back as the result. Production-shaped in the
/// sense that it honors the same interface a real LLM/tool loop would, but
/// does no model calls or tool execution of its own.
pub struct EchoRunner;

#[async_trait]
impl TaskRunner for EchoRunner {
    async fn run(&self, task: &str) -> Result<String, String> {
        Ok(task.to_string())
    }
}
