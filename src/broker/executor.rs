//! Single-flight agent query execution
//!
//! A query moves the broker from Idle to Executing. The `prompt` handler
//! claims the active prompt id under the query lock before spawning
//! [`execute`], so a second prompt is rejected instead of racing the first.
//! Whatever happens inside the query, the state is reset and `status:idle`
//! is broadcast at the end.

use super::clients::ClientId;
use super::hmr;
use super::protocol::{BrokerStatus, ServerEvent, ToolPhase};
use super::server::BrokerShared;
use crate::engine::{EngineEvent, QueryOutcome, QueryRequest};
use crate::error::{Error, Result};
use crate::session::{ConversationEntry, ToolStatus};
use crate::upload::{cleanup_images, persist_images};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Execution state of the single in-flight query
#[derive(Debug, Default)]
pub struct QueryState {
    pub cancel: Option<CancellationToken>,
    /// Set iff a query is in flight
    pub active_prompt_id: Option<String>,
    /// Assistant text streamed so far, committed on completion
    pub accumulated_text: String,
    /// Inputs of running tool calls, keyed by tool-use id
    pub pending_tool_inputs: HashMap<String, Value>,
    /// The result entry is in history; a late `stop` must not add another
    pub committed: bool,
}

impl QueryState {
    pub fn is_active(&self) -> bool {
        self.active_prompt_id.is_some()
    }

    fn reset(&mut self) {
        self.cancel = None;
        self.active_prompt_id = None;
        self.accumulated_text.clear();
        self.pending_tool_inputs.clear();
        self.committed = false;
    }
}

/// Prompt text sent to the engine, with attached images referenced by path
pub fn build_prompt(content: &str, image_paths: &[String]) -> String {
    if image_paths.is_empty() {
        return content.to_string();
    }
    let instructions = image_paths
        .iter()
        .map(|p| format!("Use the Read tool to view the image at: {}", p))
        .collect::<Vec<_>>()
        .join("\n");
    if content.trim().is_empty() {
        format!("[Attached images — please view them]\n{}", instructions)
    } else {
        format!(
            "{}\n\n[Attached images — please view them first]\n{}",
            content, instructions
        )
    }
}

/// Handle a `prompt` message: claim the executor and spawn the query
pub(crate) async fn handle_prompt(
    shared: &Arc<BrokerShared>,
    client_id: ClientId,
    content: String,
    id: Option<String>,
    image_paths: Vec<String>,
) {
    if content.trim().is_empty() && image_paths.is_empty() {
        shared
            .clients
            .send_to(&client_id, &ServerEvent::error(None, "Prompt content is empty"))
            .await;
        return;
    }

    let prompt_id = id
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let cancel = {
        let mut query = shared.query.lock().await;
        if let Some(active) = &query.active_prompt_id {
            tracing::warn!(prompt_id = %prompt_id, active = %active, "Rejecting prompt, query in flight");
            let message = format!(
                "A query is already running (promptId {}). Stop it before sending another prompt.",
                active
            );
            shared
                .clients
                .send_to(&client_id, &ServerEvent::error(Some(prompt_id), message))
                .await;
            return;
        }
        let token = CancellationToken::new();
        query.active_prompt_id = Some(prompt_id.clone());
        query.cancel = Some(token.clone());
        query.accumulated_text.clear();
        query.pending_tool_inputs.clear();
        query.committed = false;
        token
    };

    let preview: String = content.chars().take(50).collect();
    tracing::info!(prompt_id = %prompt_id, images = image_paths.len(), "Received prompt: {}", preview);

    let shared = shared.clone();
    tokio::spawn(async move {
        execute(shared, prompt_id, content, image_paths, cancel).await;
    });
}

/// Run one query to completion, cancellation or failure
pub(crate) async fn execute(
    shared: Arc<BrokerShared>,
    prompt_id: String,
    content: String,
    image_paths: Vec<String>,
    cancel: CancellationToken,
) {
    let persisted = persist_images(&image_paths, &shared.image_dir).await;

    let resume_session_id = {
        let mut session = shared.session.lock().await;
        session.push(ConversationEntry::user(
            content.clone(),
            Some(persisted.clone()),
        ));
        shared.persist(&session);
        session.session_id.clone()
    };

    shared
        .clients
        .broadcast(&ServerEvent::status(
            BrokerStatus::Processing,
            Some(prompt_id.clone()),
        ))
        .await;

    let request = QueryRequest {
        prompt: build_prompt(&content, &persisted),
        resume_session_id,
        cwd: shared.project_root.clone(),
    };

    if let Err(e) = drive(&shared, &prompt_id, request, &cancel).await {
        if cancel.is_cancelled() {
            tracing::info!(prompt_id = %prompt_id, "Query aborted: {}", e);
        } else {
            let message = match e {
                Error::Engine(message) => message,
                other => other.to_string(),
            };
            tracing::error!(prompt_id = %prompt_id, "Query failed: {}", message);
            {
                let mut session = shared.session.lock().await;
                session.push(ConversationEntry::error(message.clone()));
                shared.persist(&session);
            }
            shared
                .clients
                .broadcast(&ServerEvent::error(Some(prompt_id.clone()), message))
                .await;
        }
    } else if cancel.is_cancelled() {
        tracing::info!(prompt_id = %prompt_id, "Query stopped");
    }

    let mut query = shared.query.lock().await;
    query.reset();
    shared
        .clients
        .broadcast(&ServerEvent::status(BrokerStatus::Idle, None))
        .await;
}

/// Consume the engine stream, relaying events to clients
async fn drive(
    shared: &Arc<BrokerShared>,
    prompt_id: &str,
    request: QueryRequest,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut stream = shared.engine.query(request, cancel.clone()).await?;
    let mut finished = false;

    while let Some(item) = stream.recv().await {
        // Drain without acting once the caller has cancelled
        if cancel.is_cancelled() {
            continue;
        }
        match item? {
            EngineEvent::SessionStarted { session_id } => {
                let mut session = shared.session.lock().await;
                if session.session_id.is_none() {
                    tracing::info!(session_id = %session_id, "Engine session started");
                    session.session_id = Some(session_id);
                    shared.persist(&session);
                }
            }
            EngineEvent::TextDelta { text } => {
                let mut query = shared.query.lock().await;
                query.accumulated_text.push_str(&text);
                shared
                    .clients
                    .broadcast(&ServerEvent::Stream {
                        prompt_id: prompt_id.to_string(),
                        chunk: text,
                        done: false,
                    })
                    .await;
            }
            EngineEvent::ToolStarted {
                tool_use_id,
                tool_name,
                input,
            } => {
                tracing::info!(prompt_id = %prompt_id, tool = %tool_name, tool_use_id = %tool_use_id, "Tool started");
                let mut query = shared.query.lock().await;
                query.pending_tool_inputs.insert(tool_use_id, input.clone());
                shared
                    .clients
                    .broadcast(&ServerEvent::Tool {
                        prompt_id: prompt_id.to_string(),
                        tool_name,
                        status: ToolPhase::Started,
                        input: Some(input),
                        output: None,
                    })
                    .await;
            }
            EngineEvent::ToolFinished {
                tool_use_id,
                tool_name,
                output,
                failed,
            } => {
                let input = shared
                    .query
                    .lock()
                    .await
                    .pending_tool_inputs
                    .remove(&tool_use_id);
                let (phase, status) = if failed {
                    (ToolPhase::Failed, ToolStatus::Failed)
                } else {
                    (ToolPhase::Completed, ToolStatus::Completed)
                };
                tracing::info!(prompt_id = %prompt_id, tool = %tool_name, failed, "Tool finished");
                shared
                    .clients
                    .broadcast(&ServerEvent::Tool {
                        prompt_id: prompt_id.to_string(),
                        tool_name: tool_name.clone(),
                        status: phase,
                        input: input.clone(),
                        output: Some(output.clone()),
                    })
                    .await;
                shared.session.lock().await.push(ConversationEntry::tool(
                    tool_name,
                    status,
                    input.unwrap_or(Value::Null),
                    output,
                ));
            }
            EngineEvent::Result(outcome) => {
                finished = true;
                complete(shared, prompt_id, outcome).await;
            }
        }
    }

    if !finished && !cancel.is_cancelled() {
        return Err(Error::Engine(
            "Engine stream ended without a result".to_string(),
        ));
    }
    Ok(())
}

/// Commit the terminal result to history and relay it
async fn complete(shared: &Arc<BrokerShared>, prompt_id: &str, outcome: QueryOutcome) {
    let failure_message = if outcome.errors.is_empty() {
        "Unknown error".to_string()
    } else {
        outcome.errors.join(", ")
    };

    // Committed before the result goes out, so a `stop` sent in reaction
    // to it finds nothing left to commit.
    {
        let mut query = shared.query.lock().await;
        let accumulated = std::mem::take(&mut query.accumulated_text);
        query.committed = true;
        let mut session = shared.session.lock().await;
        if outcome.success {
            let content = if accumulated.trim().is_empty() {
                outcome.result.clone().unwrap_or_default()
            } else {
                accumulated
            };
            if !content.trim().is_empty() {
                session.push(ConversationEntry::assistant(content));
            }
        } else {
            session.push(ConversationEntry::error(failure_message.clone()));
        }
        shared.persist(&session);
    }

    shared
        .clients
        .broadcast(&ServerEvent::Stream {
            prompt_id: prompt_id.to_string(),
            chunk: String::new(),
            done: true,
        })
        .await;
    shared
        .clients
        .broadcast(&ServerEvent::Result {
            prompt_id: prompt_id.to_string(),
            success: outcome.success,
            result: if outcome.success {
                outcome.result.clone()
            } else {
                None
            },
            error: (!outcome.success).then(|| failure_message.clone()),
            cost_usd: outcome.cost_usd,
            duration_ms: outcome.duration_ms,
        })
        .await;

    if outcome.success {
        tracing::info!(
            prompt_id = %prompt_id,
            duration_ms = outcome.duration_ms.unwrap_or_default(),
            cost_usd = outcome.cost_usd.unwrap_or_default(),
            "Query completed"
        );
        hmr::retrigger(&shared.git, &shared.project_root).await;
    } else {
        tracing::warn!(prompt_id = %prompt_id, "Query failed: {}", failure_message);
    }
}

/// Handle a `stop` message
pub(crate) async fn handle_stop(shared: &Arc<BrokerShared>, client_id: ClientId) {
    let (stopped, partial) = {
        let mut query = shared.query.lock().await;
        match query.cancel.clone() {
            Some(token) => {
                token.cancel();
                if query.committed {
                    (false, String::new())
                } else {
                    (true, std::mem::take(&mut query.accumulated_text))
                }
            }
            None => (false, String::new()),
        }
    };

    {
        let mut session = shared.session.lock().await;
        if stopped {
            tracing::info!("Query stopped by user");
            if !partial.trim().is_empty() {
                session.push(ConversationEntry::assistant(partial));
            }
            session.push(ConversationEntry::stopped());
        }
        shared.persist(&session);
    }

    shared
        .clients
        .send_to(&client_id, &ServerEvent::Stopped {})
        .await;
}

/// Handle a `new_session` message
pub(crate) async fn handle_new_session(shared: &Arc<BrokerShared>, client_id: ClientId) {
    if let Some(token) = &shared.query.lock().await.cancel {
        token.cancel();
    }

    shared.session.lock().await.clear();
    if let Err(e) = shared.store.clear() {
        tracing::warn!("Failed to clear session file: {}", e);
    }
    if let Err(e) = cleanup_images(&shared.image_dir).await {
        tracing::warn!("Failed to clean up images: {}", e);
    }

    tracing::info!("Session cleared");
    shared
        .clients
        .send_to(&client_id, &ServerEvent::SessionCleared {})
        .await;
}
