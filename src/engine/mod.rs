//! Agent query engine abstraction
//!
//! An engine takes a prompt plus an optional session id to resume and
//! yields a stream of [`EngineEvent`]s ending with [`EngineEvent::Result`].
//! Cancellation is cooperative: the caller cancels the token and keeps
//! draining until the engine closes the stream.

mod claude;
#[cfg(test)]
pub(crate) mod fake;

pub use claude::{ClaudeCli, StreamParser};

use crate::error::Result;
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Stream of engine events; an `Err` item reports an engine failure
pub type EngineStream = mpsc::Receiver<Result<EngineEvent>>;

/// A single query to run
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRequest {
    /// Full prompt text, attachments already referenced
    pub prompt: String,
    /// Session to continue, if any
    pub resume_session_id: Option<String>,
    /// Working directory the agent operates in
    pub cwd: PathBuf,
}

/// Terminal outcome of a query
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryOutcome {
    pub success: bool,
    pub result: Option<String>,
    pub errors: Vec<String>,
    pub cost_usd: Option<f64>,
    pub duration_ms: Option<u64>,
}

/// Typed events produced while a query runs
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// The engine assigned (or confirmed) a session id
    SessionStarted { session_id: String },
    /// Incremental assistant text
    TextDelta { text: String },
    /// A tool call is about to run
    ToolStarted {
        tool_use_id: String,
        tool_name: String,
        input: serde_json::Value,
    },
    /// A tool call finished; `tool_use_id` matches its `ToolStarted`
    ToolFinished {
        tool_use_id: String,
        tool_name: String,
        output: serde_json::Value,
        failed: bool,
    },
    /// Final result; the stream ends after this
    Result(QueryOutcome),
}

/// Runs agent queries
#[async_trait]
pub trait AgentEngine: Send + Sync {
    /// Start a query.
    ///
    /// Failing to start returns `Err`; failures after start arrive as `Err`
    /// items on the stream. Cancelling `cancel` must eventually close the
    /// stream.
    async fn query(&self, request: QueryRequest, cancel: CancellationToken) -> Result<EngineStream>;
}
