//! Scripted [`AgentEngine`] for executor and broker tests

use super::{AgentEngine, EngineEvent, EngineStream, QueryOutcome, QueryRequest};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

/// One step of a scripted query
#[derive(Debug, Clone)]
pub enum Step {
    Emit(EngineEvent),
    /// Send an error item on the stream
    Fail(String),
    /// Wait until the gate is opened (or the query is cancelled)
    Pause(Arc<Notify>),
    /// Block until the query is cancelled, then close the stream
    UntilCancelled,
}

impl Step {
    pub fn text(text: &str) -> Self {
        Self::Emit(EngineEvent::TextDelta {
            text: text.to_string(),
        })
    }

    pub fn success(result: &str) -> Self {
        Self::Emit(EngineEvent::Result(QueryOutcome {
            success: true,
            result: Some(result.to_string()),
            errors: vec![],
            cost_usd: Some(0.01),
            duration_ms: Some(1200),
        }))
    }

    pub fn failure(errors: &[&str]) -> Self {
        Self::Emit(EngineEvent::Result(QueryOutcome {
            success: false,
            result: None,
            errors: errors.iter().map(|e| e.to_string()).collect(),
            cost_usd: None,
            duration_ms: None,
        }))
    }
}

#[derive(Default)]
pub struct ScriptedEngine {
    scripts: Mutex<VecDeque<Vec<Step>>>,
    fail_start: Mutex<Option<String>>,
    pub requests: Mutex<Vec<QueryRequest>>,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the script for the next query
    pub fn push_script(&self, steps: Vec<Step>) {
        self.scripts.lock().unwrap().push_back(steps);
    }

    /// Make the next query fail to start
    pub fn fail_next_start(&self, message: &str) {
        *self.fail_start.lock().unwrap() = Some(message.to_string());
    }

    pub fn requests(&self) -> Vec<QueryRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl AgentEngine for ScriptedEngine {
    async fn query(&self, request: QueryRequest, cancel: CancellationToken) -> Result<EngineStream> {
        self.requests.lock().unwrap().push(request);
        if let Some(message) = self.fail_start.lock().unwrap().take() {
            return Err(Error::Engine(message));
        }
        let steps = self.scripts.lock().unwrap().pop_front().unwrap_or_default();

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            for step in steps {
                if cancel.is_cancelled() {
                    return;
                }
                match step {
                    Step::Emit(event) => {
                        if tx.send(Ok(event)).await.is_err() {
                            return;
                        }
                    }
                    Step::Fail(message) => {
                        let _ = tx.send(Err(Error::Engine(message))).await;
                    }
                    Step::Pause(gate) => {
                        tokio::select! {
                            _ = gate.notified() => {}
                            _ = cancel.cancelled() => return,
                        }
                    }
                    Step::UntilCancelled => {
                        cancel.cancelled().await;
                        return;
                    }
                }
            }
        });
        Ok(rx)
    }
}
