//! Broker lifecycle and shared state

use super::clients::{ClientId, ClientRegistry, ClientSender, Outbound};
use super::executor::{self, QueryState};
use super::git_handlers;
use super::http;
use super::protocol::{parse_client_message, BrokerStatus, ClientMessage, ServerEvent};
use crate::config::BrokerConfig;
use crate::engine::AgentEngine;
use crate::error::{Error, Result};
use crate::git::{GitBackend, GitCoordinator, WatchKey};
use crate::session::{Session, SessionStore};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// State shared by the HTTP surface, the executor and the watcher.
///
/// Lock order: `query` before `session` before the client registry.
pub struct BrokerShared {
    pub(crate) config: BrokerConfig,
    pub(crate) project_root: PathBuf,
    pub(crate) image_dir: PathBuf,
    pub(crate) clients: ClientRegistry,
    pub(crate) session: Mutex<Session>,
    pub(crate) store: SessionStore,
    pub(crate) query: Mutex<QueryState>,
    pub(crate) engine: Arc<dyn AgentEngine>,
    pub(crate) git: GitCoordinator,
    pub(crate) watch_baseline: Mutex<Option<WatchKey>>,
}

impl BrokerShared {
    /// Write the session to disk; failures are logged and otherwise ignored
    pub(crate) fn persist(&self, session: &Session) {
        if let Err(e) = self
            .store
            .save(session.session_id.as_deref(), &session.history)
        {
            tracing::warn!(path = %self.store.path().display(), "Failed to save session: {}", e);
        }
    }

    /// Register a client and replay current state to it.
    ///
    /// Replay frames go straight into the client's queue before it joins the
    /// registry, all under the query lock, so live stream chunks can neither
    /// be missed nor duplicated.
    pub(crate) async fn connect(self: &Arc<Self>, sender: ClientSender) -> ClientId {
        let id = Uuid::new_v4();
        {
            let query = self.query.lock().await;
            {
                let session = self.session.lock().await;
                send_direct(&sender, &ServerEvent::status(BrokerStatus::Connected, None));
                if !session.history.is_empty() {
                    send_direct(
                        &sender,
                        &ServerEvent::History {
                            entries: session.history.clone(),
                        },
                    );
                }
            }
            if let Some(prompt_id) = &query.active_prompt_id {
                send_direct(
                    &sender,
                    &ServerEvent::status(BrokerStatus::Processing, Some(prompt_id.clone())),
                );
                if !query.accumulated_text.is_empty() {
                    send_direct(
                        &sender,
                        &ServerEvent::Stream {
                            prompt_id: prompt_id.clone(),
                            chunk: query.accumulated_text.clone(),
                            done: false,
                        },
                    );
                }
            }
            self.clients.register(id, sender).await;
        }

        // The watcher baseline stays put: clients already connected have not
        // seen this snapshot yet.
        match self.git.snapshot().await {
            Ok(snapshot) => {
                self.clients
                    .send_to(&id, &ServerEvent::GitStatus(snapshot))
                    .await;
            }
            Err(e) => tracing::warn!(client_id = %id, "Initial git status failed: {}", e),
        }
        id
    }

    pub(crate) async fn disconnect(&self, id: &ClientId) {
        self.clients.unregister(id).await;
    }

    /// Validate one inbound text frame and dispatch it
    pub(crate) async fn handle_text(self: &Arc<Self>, client_id: ClientId, text: &str) {
        let message = match parse_client_message(text) {
            Ok(message) => message,
            Err(e) => {
                let preview: String = text.chars().take(200).collect();
                tracing::warn!(client_id = %client_id, "Rejected client message: {}", preview);
                self.clients
                    .send_to(&client_id, &ServerEvent::error(None, e.message()))
                    .await;
                return;
            }
        };

        match message {
            ClientMessage::Prompt {
                content,
                id,
                image_paths,
            } => {
                executor::handle_prompt(self, client_id, content, id, image_paths.unwrap_or_default())
                    .await
            }
            ClientMessage::NewSession {} => executor::handle_new_session(self, client_id).await,
            ClientMessage::Stop {} => executor::handle_stop(self, client_id).await,
            ClientMessage::DiscardChanges {} => git_handlers::handle_discard(self, client_id).await,
            ClientMessage::ListBranches {} => {
                git_handlers::handle_list_branches(self, client_id).await
            }
            ClientMessage::SwitchBranch { branch_name } => {
                git_handlers::handle_switch_branch(self, client_id, branch_name).await
            }
            ClientMessage::CreateBranch { branch_name } => {
                git_handlers::handle_create_branch(self, client_id, branch_name).await
            }
        }
    }
}

fn send_direct(sender: &ClientSender, event: &ServerEvent) {
    match event.encode() {
        Ok(json) => {
            let _ = sender.send(Outbound::Text(json));
        }
        Err(e) => tracing::warn!(event = event.kind(), "Failed to serialize event: {}", e),
    }
}

/// A running session broker.
///
/// Owns the client registry, the in-memory session and the query state.
/// Several brokers can coexist in one process.
pub struct Broker {
    shared: Arc<BrokerShared>,
    watcher_shutdown: CancellationToken,
    server_shutdown: CancellationToken,
    tasks: Mutex<BrokerTasks>,
}

#[derive(Default)]
struct BrokerTasks {
    server: Option<JoinHandle<()>>,
    watcher: Option<JoinHandle<()>>,
}

impl Broker {
    /// Build a broker, loading any persisted session from the project root
    pub fn new(
        config: BrokerConfig,
        engine: Arc<dyn AgentEngine>,
        git: Arc<dyn GitBackend>,
    ) -> Self {
        let project_root = config.project.root_dir();
        let store = SessionStore::new(config.project.session_path());
        let session = store.load();
        if !session.history.is_empty() {
            tracing::info!(
                entries = session.history.len(),
                session_id = session.session_id.as_deref().unwrap_or("-"),
                "Loaded persisted session"
            );
        }

        let shared = Arc::new(BrokerShared {
            image_dir: config.project.image_path(),
            git: GitCoordinator::new(git, &config.git),
            project_root,
            clients: ClientRegistry::new(),
            session: Mutex::new(session),
            store,
            query: Mutex::new(QueryState::default()),
            engine,
            watch_baseline: Mutex::new(None),
            config,
        });

        Self {
            shared,
            watcher_shutdown: CancellationToken::new(),
            server_shutdown: CancellationToken::new(),
            tasks: Mutex::new(BrokerTasks::default()),
        }
    }

    /// Bind the listener, then spawn the HTTP server and the git watcher
    pub async fn start(&self) -> Result<SocketAddr> {
        let server = &self.shared.config.server;
        let bind = format!("{}:{}", server.host, server.port);
        let listener = tokio::net::TcpListener::bind(&bind)
            .await
            .map_err(|e| Error::Broker(format!("Failed to bind {}: {}", bind, e)))?;
        let addr = listener.local_addr()?;

        let app = http::router(self.shared.clone());
        let shutdown = self.server_shutdown.clone();
        let server_task = tokio::spawn(async move {
            let serve = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await });
            if let Err(e) = serve.await {
                tracing::error!("HTTP server error: {}", e);
            }
        });

        let period = Duration::from_millis(self.shared.config.git.watch_interval_ms.max(1));
        let watcher_task = tokio::spawn(git_handlers::run_watcher(
            self.shared.clone(),
            period,
            self.watcher_shutdown.clone(),
        ));

        let mut tasks = self.tasks.lock().await;
        tasks.server = Some(server_task);
        tasks.watcher = Some(watcher_task);

        tracing::info!(
            address = %addr,
            project = %self.shared.project_root.display(),
            "Airdock broker listening"
        );
        Ok(addr)
    }

    /// Cancel the query, close clients, stop the watcher, then the listener
    pub async fn stop(&self) {
        if let Some(token) = &self.shared.query.lock().await.cancel {
            token.cancel();
        }
        self.shared.clients.close_all().await;

        let (watcher, server) = {
            let mut tasks = self.tasks.lock().await;
            (tasks.watcher.take(), tasks.server.take())
        };

        self.watcher_shutdown.cancel();
        if let Some(watcher) = watcher {
            let _ = watcher.await;
        }

        self.server_shutdown.cancel();
        if let Some(server) = server {
            if tokio::time::timeout(Duration::from_secs(5), server)
                .await
                .is_err()
            {
                tracing::warn!("HTTP server did not shut down in time");
            }
        }
        tracing::info!("Airdock broker stopped");
    }

    pub(crate) fn shared(&self) -> Arc<BrokerShared> {
        self.shared.clone()
    }

    /// Attach an in-process client, returning its id and outbound queue
    pub async fn connect_client(
        &self,
    ) -> (ClientId, tokio::sync::mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let id = self.shared.connect(tx).await;
        (id, rx)
    }

    /// Feed one text frame from `client_id` through the dispatcher
    pub async fn handle_text(&self, client_id: ClientId, text: &str) {
        self.shared.handle_text(client_id, text).await;
    }

    /// Whether a query is currently in flight
    pub async fn is_processing(&self) -> bool {
        self.shared.query.lock().await.is_active()
    }

    /// Snapshot of the in-memory session
    pub async fn session(&self) -> Session {
        self.shared.session.lock().await.clone()
    }

    pub async fn client_count(&self) -> usize {
        self.shared.clients.len().await
    }
}
