//! `claude` CLI engine driven in `stream-json` mode

use super::{AgentEngine, EngineEvent, EngineStream, QueryOutcome, QueryRequest};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Capacity of the event channel between the reader task and the executor
const EVENT_BUFFER: usize = 256;
/// Bytes of stderr kept for error reporting
const STDERR_TAIL: usize = 2000;

/// Relevant lines of `claude --output-format stream-json`.
/// Unknown message types are ignored.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamMessage {
    System {
        #[serde(default)]
        subtype: String,
        #[serde(default)]
        session_id: Option<String>,
    },
    StreamEvent {
        event: Value,
    },
    Assistant {
        #[serde(default)]
        message: Value,
    },
    User {
        #[serde(default)]
        message: Value,
    },
    Result {
        #[serde(default)]
        subtype: String,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        errors: Vec<String>,
        #[serde(default)]
        total_cost_usd: Option<f64>,
        #[serde(default)]
        duration_ms: Option<u64>,
    },
    #[serde(other)]
    Unknown,
}

/// Translates stream-json lines into [`EngineEvent`]s.
///
/// Keeps the tool-use id → name mapping needed to label tool results.
#[derive(Debug, Default)]
pub struct StreamParser {
    tool_names: HashMap<String, String>,
}

impl StreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse one output line; non-JSON and irrelevant lines yield nothing
    pub fn parse_line(&mut self, line: &str) -> Vec<EngineEvent> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Vec::new();
        }
        let Ok(message) = serde_json::from_str::<StreamMessage>(trimmed) else {
            tracing::trace!("Ignoring non-JSON engine output");
            return Vec::new();
        };

        match message {
            StreamMessage::System {
                subtype,
                session_id: Some(session_id),
            } if subtype == "init" => vec![EngineEvent::SessionStarted { session_id }],
            StreamMessage::StreamEvent { event } => text_delta(&event)
                .map(|text| vec![EngineEvent::TextDelta { text }])
                .unwrap_or_default(),
            StreamMessage::Assistant { message } => self.tool_uses(&message),
            StreamMessage::User { message } => self.tool_results(&message),
            StreamMessage::Result {
                subtype,
                is_error,
                result,
                errors,
                total_cost_usd,
                duration_ms,
            } => {
                let success = subtype == "success" && !is_error;
                let mut errors = errors;
                if !success && errors.is_empty() && subtype != "success" && !subtype.is_empty() {
                    errors.push(subtype.replace('_', " "));
                }
                vec![EngineEvent::Result(QueryOutcome {
                    success,
                    result: if success { result } else { None },
                    errors,
                    cost_usd: total_cost_usd,
                    duration_ms,
                })]
            }
            StreamMessage::System { .. } | StreamMessage::Unknown => Vec::new(),
        }
    }

    fn tool_uses(&mut self, message: &Value) -> Vec<EngineEvent> {
        content_blocks(message)
            .filter(|block| block.get("type").and_then(Value::as_str) == Some("tool_use"))
            .map(|block| {
                let tool_name = block
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string();
                let tool_use_id = block
                    .get("id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                if !tool_use_id.is_empty() {
                    self.tool_names.insert(tool_use_id.clone(), tool_name.clone());
                }
                EngineEvent::ToolStarted {
                    tool_use_id,
                    tool_name,
                    input: block.get("input").cloned().unwrap_or(Value::Null),
                }
            })
            .collect()
    }

    fn tool_results(&mut self, message: &Value) -> Vec<EngineEvent> {
        content_blocks(message)
            .filter(|block| block.get("type").and_then(Value::as_str) == Some("tool_result"))
            .map(|block| {
                let tool_use_id = block
                    .get("tool_use_id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let tool_name = self
                    .tool_names
                    .remove(&tool_use_id)
                    .unwrap_or_else(|| "unknown".to_string());
                EngineEvent::ToolFinished {
                    tool_use_id,
                    tool_name,
                    output: block.get("content").cloned().unwrap_or(Value::Null),
                    failed: block
                        .get("is_error")
                        .and_then(Value::as_bool)
                        .unwrap_or(false),
                }
            })
            .collect()
    }
}

fn content_blocks(message: &Value) -> impl Iterator<Item = &Value> {
    message
        .get("content")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
}

fn text_delta(event: &Value) -> Option<String> {
    if event.get("type").and_then(Value::as_str) != Some("content_block_delta") {
        return None;
    }
    let delta = event.get("delta")?;
    if delta.get("type").and_then(Value::as_str) != Some("text_delta") {
        return None;
    }
    delta.get("text").and_then(Value::as_str).map(str::to_string)
}

/// [`AgentEngine`] that spawns one `claude -p` process per query
#[derive(Debug, Clone)]
pub struct ClaudeCli {
    config: EngineConfig,
}

impl ClaudeCli {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    fn command(&self, request: &QueryRequest) -> Command {
        let mut cmd = Command::new(&self.config.binary);
        cmd.arg("-p")
            .arg(&request.prompt)
            .arg("--output-format")
            .arg("stream-json")
            .arg("--verbose")
            .arg("--include-partial-messages")
            .arg("--permission-mode")
            .arg(&self.config.permission_mode);

        if let Some(session_id) = &request.resume_session_id {
            cmd.arg("--resume").arg(session_id);
        }
        if let Some(append) = self
            .config
            .append_system_prompt
            .as_deref()
            .filter(|p| !p.is_empty())
        {
            cmd.arg("--append-system-prompt").arg(append);
        }
        cmd.args(&self.config.extra_args)
            .current_dir(&request.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Allow running from inside another agent session
            .env_remove("CLAUDECODE")
            .env_remove("CLAUDE_CODE")
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl AgentEngine for ClaudeCli {
    async fn query(&self, request: QueryRequest, cancel: CancellationToken) -> Result<EngineStream> {
        let mut child = self.command(&request).spawn().map_err(|e| {
            Error::Engine(format!(
                "Failed to start {}: {}",
                self.config.binary.display(),
                e
            ))
        })?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Engine("Failed to capture engine stdout".to_string()))?;
        let stderr = child.stderr.take();

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        tokio::spawn(async move {
            let stderr_task = tokio::spawn(async move {
                let mut buf = String::new();
                if let Some(mut stderr) = stderr {
                    let _ = stderr.read_to_string(&mut buf).await;
                }
                buf
            });

            let mut parser = StreamParser::new();
            let mut lines = BufReader::new(stdout).lines();
            let mut saw_result = false;

            loop {
                tokio::select! {
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => {
                            for event in parser.parse_line(&line) {
                                saw_result |= matches!(event, EngineEvent::Result(_));
                                if tx.send(Ok(event)).await.is_err() {
                                    let _ = child.kill().await;
                                    return;
                                }
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            let _ = tx.send(Err(Error::Engine(format!("Failed to read engine output: {}", e)))).await;
                            break;
                        }
                    },
                    _ = cancel.cancelled() => {
                        tracing::info!("Query cancelled, stopping engine process");
                        let _ = child.kill().await;
                        return;
                    }
                }
            }

            let status = child.wait().await;
            let stderr = stderr_task.await.unwrap_or_default();
            match status {
                Ok(status) if !status.success() && !saw_result && !cancel.is_cancelled() => {
                    let tail = stderr_tail(&stderr);
                    let message = if tail.is_empty() {
                        format!("Engine exited with {}", status)
                    } else {
                        format!("Engine exited with {}: {}", status, tail)
                    };
                    let _ = tx.send(Err(Error::Engine(message))).await;
                }
                Ok(_) => {}
                Err(e) => {
                    let _ = tx
                        .send(Err(Error::Engine(format!("Failed to wait for engine: {}", e))))
                        .await;
                }
            }
        });

        Ok(rx)
    }
}

fn stderr_tail(stderr: &str) -> &str {
    let trimmed = stderr.trim();
    if trimmed.len() <= STDERR_TAIL {
        return trimmed;
    }
    let mut start = trimmed.len() - STDERR_TAIL;
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    &trimmed[start..]
}
