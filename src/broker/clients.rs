//! Connected client registry

use super::protocol::ServerEvent;
use std::collections::HashMap;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

/// Identifier of a connected client
pub type ClientId = Uuid;

/// Frame queued for a client's socket writer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Close,
}

/// Sending half of a client's outbound queue
pub type ClientSender = mpsc::UnboundedSender<Outbound>;

/// Open client connections keyed by id
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: RwLock<HashMap<ClientId, ClientSender>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, id: ClientId, sender: ClientSender) {
        self.clients.write().await.insert(id, sender);
        tracing::info!(client_id = %id, "Client connected");
    }

    pub async fn unregister(&self, id: &ClientId) {
        if self.clients.write().await.remove(id).is_some() {
            tracing::info!(client_id = %id, "Client disconnected");
        }
    }

    pub async fn len(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.clients.read().await.is_empty()
    }

    /// Send an event to one client; closed or unknown clients are ignored
    pub async fn send_to(&self, id: &ClientId, event: &ServerEvent) {
        let Some(json) = encode(event) else { return };
        if let Some(sender) = self.clients.read().await.get(id) {
            let _ = sender.send(Outbound::Text(json));
        }
    }

    /// Send an event to every open client, dropping closed ones
    pub async fn broadcast(&self, event: &ServerEvent) {
        let Some(json) = encode(event) else { return };
        let dead: Vec<ClientId> = {
            let clients = self.clients.read().await;
            clients
                .iter()
                .filter(|(_, sender)| sender.send(Outbound::Text(json.clone())).is_err())
                .map(|(id, _)| *id)
                .collect()
        };
        if !dead.is_empty() {
            let mut clients = self.clients.write().await;
            for id in dead {
                clients.remove(&id);
                tracing::debug!(client_id = %id, "Dropped closed client");
            }
        }
    }

    /// Ask every client socket to close and forget all clients
    pub async fn close_all(&self) {
        let mut clients = self.clients.write().await;
        for sender in clients.values() {
            let _ = sender.send(Outbound::Close);
        }
        let count = clients.len();
        clients.clear();
        if count > 0 {
            tracing::info!(count, "Closed client connections");
        }
    }
}

fn encode(event: &ServerEvent) -> Option<String> {
    match event.encode() {
        Ok(json) => Some(json),
        Err(e) => {
            tracing::warn!(event = event.kind(), "Failed to serialize event: {}", e);
            None
        }
    }
}
