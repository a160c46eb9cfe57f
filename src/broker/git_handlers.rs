//! Git message handlers and the working-tree watcher

use super::clients::ClientId;
use super::protocol::ServerEvent;
use super::server::BrokerShared;
use crate::git::{BranchMutation, WatchKey};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

pub(crate) async fn handle_discard(shared: &Arc<BrokerShared>, client_id: ClientId) {
    match shared.git.discard_all_changes().await {
        Ok(snapshot) => {
            *shared.watch_baseline.lock().await =
                Some(WatchKey::new(&snapshot.branch_name, &snapshot.changes));
            shared
                .clients
                .broadcast(&ServerEvent::GitStatus(snapshot))
                .await;
        }
        Err(e) => {
            tracing::warn!("Discard failed: {}", e);
            shared
                .clients
                .send_to(
                    &client_id,
                    &ServerEvent::error(None, format!("Failed to discard changes: {}", e)),
                )
                .await;
        }
    }
}

pub(crate) async fn handle_list_branches(shared: &Arc<BrokerShared>, client_id: ClientId) {
    let branches = match shared.git.list_branches().await {
        Ok(branches) => branches,
        Err(e) => {
            tracing::warn!("Listing branches failed: {}", e);
            Vec::new()
        }
    };
    shared
        .clients
        .send_to(&client_id, &ServerEvent::BranchesList { branches })
        .await;
}

pub(crate) async fn handle_switch_branch(
    shared: &Arc<BrokerShared>,
    client_id: ClientId,
    branch_name: String,
) {
    let mutation = shared.git.switch_branch(&branch_name).await;
    shared
        .clients
        .send_to(
            &client_id,
            &ServerEvent::BranchSwitched {
                branch_name: mutation.branch_name.clone(),
                success: mutation.success,
                error: mutation.error.clone(),
                warning: mutation.warning.clone(),
            },
        )
        .await;
    after_mutation(shared, &mutation).await;
}

pub(crate) async fn handle_create_branch(
    shared: &Arc<BrokerShared>,
    client_id: ClientId,
    branch_name: String,
) {
    let mutation = shared.git.create_branch(&branch_name).await;
    shared
        .clients
        .send_to(
            &client_id,
            &ServerEvent::BranchCreated {
                branch_name: mutation.branch_name.clone(),
                success: mutation.success,
                error: mutation.error.clone(),
            },
        )
        .await;
    after_mutation(shared, &mutation).await;
}

/// Broadcast the new working-tree state after a successful branch mutation
async fn after_mutation(shared: &Arc<BrokerShared>, mutation: &BranchMutation) {
    if !mutation.success {
        return;
    }
    if let Some(warning) = &mutation.warning {
        shared
            .clients
            .broadcast(&ServerEvent::StashConflict {
                branch_name: mutation.branch_name.clone(),
                message: warning.clone(),
            })
            .await;
    }
    broadcast_snapshot(shared).await;
}

/// Compute a full snapshot, broadcast it and make it the watcher baseline
pub(crate) async fn broadcast_snapshot(shared: &Arc<BrokerShared>) {
    match shared.git.snapshot().await {
        Ok(snapshot) => {
            *shared.watch_baseline.lock().await =
                Some(WatchKey::new(&snapshot.branch_name, &snapshot.changes));
            shared
                .clients
                .broadcast(&ServerEvent::GitStatus(snapshot))
                .await;
        }
        Err(e) => tracing::warn!("Git status failed: {}", e),
    }
}

/// One watcher tick: broadcast a snapshot if branch or changes moved
pub(crate) async fn poll_once(shared: &Arc<BrokerShared>) -> bool {
    let key = match shared.git.watch_key().await {
        Ok(key) => key,
        Err(e) => {
            tracing::debug!("Git watch poll failed: {}", e);
            return false;
        }
    };
    let changed = {
        let baseline = shared.watch_baseline.lock().await;
        baseline.as_ref() != Some(&key)
    };
    if changed {
        tracing::debug!(branch = %key.branch_name, "Working tree changed");
        broadcast_snapshot(shared).await;
    }
    changed
}

/// Poll the working tree until `shutdown` fires
pub(crate) async fn run_watcher(shared: Arc<BrokerShared>, period: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    tracing::debug!(period_ms = period.as_millis() as u64, "Git watcher started");
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                if shared.clients.is_empty().await {
                    continue;
                }
                poll_once(&shared).await;
            }
        }
    }
    tracing::debug!("Git watcher stopped");
}
