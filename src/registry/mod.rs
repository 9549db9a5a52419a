//! Node connection lifecycle, capability matching, liveness and workspace
//! visibility.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::capability::{CapabilityDescriptor, JobRequirements};
use crate::protocol::OrchestratorFrame;

const DEFAULT_REPUTATION: u8 = 50;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeView {
    pub node_id: String,
    pub capabilities: CapabilityDescriptor,
    pub available: bool,
    pub current_jobs: u32,
    pub reputation: u8,
    pub owner_user_id: Option<String>,
    pub workspace_ids: HashSet<String>,
    pub last_heartbeat_unix: u64,
}

struct NodeEntry {
    view: NodeView,
    reconnect_token: String,
    outbound: mpsc::UnboundedSender<OrchestratorFrame>,
}

struct Inner {
    nodes: HashMap<String, NodeEntry>,
    tokens: HashMap<String, String>, // reconnect token -> node id
}

#[derive(Clone)]
pub struct NodeRegistry {
    inner: Arc<RwLock<Inner>>,
    heartbeat_timeout_secs: u64,
}

impl NodeRegistry {
    pub fn new(heartbeat_timeout_secs: u64) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                nodes: HashMap::new(),
                tokens: HashMap::new(),
            })),
            heartbeat_timeout_secs,
        }
    }

    /// Registers a new node, or reattaches an existing one if `reconnect_token`
    /// matches a known token. Returns the node id and a fresh reconnect token.
    pub async fn register(
        &self,
        reconnect_token: Option<String>,
        capabilities: CapabilityDescriptor,
        outbound: mpsc::UnboundedSender<OrchestratorFrame>,
    ) -> (String, String) {
        let mut inner = self.inner.write().await;

        let existing_node_id = reconnect_token
            .as_ref()
            .and_then(|t| inner.tokens.get(t).cloned());

        let node_id = existing_node_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let new_token = Uuid::new_v4().to_string();

        if let Some(old_token) = reconnect_token {
            inner.tokens.remove(&old_token);
        }
        inner.tokens.insert(new_token.clone(), node_id.clone());

        let workspace_ids = inner
            .nodes
            .get(&node_id)
            .map(|e| e.view.workspace_ids.clone())
            .unwrap_or_default();
        let owner_user_id = inner
            .nodes
            .get(&node_id)
            .and_then(|e| e.view.owner_user_id.clone());

        inner.nodes.insert(
            node_id.clone(),
            NodeEntry {
                view: NodeView {
                    node_id: node_id.clone(),
                    capabilities,
                    available: true,
                    current_jobs: 0,
                    reputation: DEFAULT_REPUTATION,
                    owner_user_id,
                    workspace_ids,
                    last_heartbeat_unix: now_unix(),
                },
                reconnect_token: new_token.clone(),
                outbound,
            },
        );

        info!(node_id = %node_id, "node registered");
        (node_id, new_token)
    }

    pub async fn heartbeat(&self, node_id: &str, available: bool, current_jobs: u32) -> bool {
        let mut inner = self.inner.write().await;
        if let Some(entry) = inner.nodes.get_mut(node_id) {
            entry.view.available = available;
            entry.view.current_jobs = current_jobs;
            entry.view.last_heartbeat_unix = now_unix();
            true
        } else {
            false
        }
    }

    /// Removes a node, revoking its reconnect token so a stale token cannot
    /// reattach to state that has since been reassigned.
    pub async fn evict(&self, node_id: &str) -> Option<NodeView> {
        let mut inner = self.inner.write().await;
        let entry = inner.nodes.remove(node_id)?;
        inner.tokens.remove(&entry.reconnect_token);
        warn!(node_id = %node_id, "node evicted");
        Some(entry.view)
    }

    /// Sweeps nodes whose last heartbeat is older than the configured timeout.
    pub async fn evict_stale(&self) -> Vec<String> {
        let cutoff = now_unix().saturating_sub(self.heartbeat_timeout_secs);
        let stale: Vec<String> = {
            let inner = self.inner.read().await;
            inner
                .nodes
                .values()
                .filter(|e| e.view.last_heartbeat_unix < cutoff)
                .map(|e| e.view.node_id.clone())
                .collect()
        };
        for node_id in &stale {
            self.evict(node_id).await;
        }
        stale
    }

    /// Finds the best available node matching `requirements`, restricted to
    /// `workspace_id` membership when given. Ordering: available first, then
    /// descending reputation, then ascending current_jobs, then ascending id.
    pub async fn find_node(
        &self,
        requirements: &JobRequirements,
        workspace_id: Option<&str>,
    ) -> Option<String> {
        let inner = self.inner.read().await;
        let mut candidates: Vec<&NodeView> = inner
            .nodes
            .values()
            .map(|e| &e.view)
            .filter(|n| n.available)
            .filter(|n| requirements.matches(&n.capabilities))
            .filter(|n| match workspace_id {
                Some(ws) => n.workspace_ids.contains(ws),
                None => true,
            })
            .collect();

        candidates.sort_by(|a, b| {
            b.reputation
                .cmp(&a.reputation)
                .then(a.current_jobs.cmp(&b.current_jobs))
                .then(a.node_id.cmp(&b.node_id))
        });

        candidates.first().map(|n| n.node_id.clone())
    }

    /// Atomically rechecks availability and reserves a slot on `node_id`.
    pub async fn try_reserve(&self, node_id: &str) -> bool {
        let mut inner = self.inner.write().await;
        if let Some(entry) = inner.nodes.get_mut(node_id) {
            if entry.view.available {
                entry.view.current_jobs += 1;
                return true;
            }
        }
        false
    }

    pub async fn release(&self, node_id: &str) {
        let mut inner = self.inner.write().await;
        if let Some(entry) = inner.nodes.get_mut(node_id) {
            entry.view.current_jobs = entry.view.current_jobs.saturating_sub(1);
        }
    }

    pub async fn send_frame(&self, node_id: &str, frame: OrchestratorFrame) -> bool {
        let inner = self.inner.read().await;
        match inner.nodes.get(node_id) {
            Some(entry) => entry.outbound.send(frame).is_ok(),
            None => false,
        }
    }

    pub async fn claim(&self, node_id: &str, owner_user_id: &str) -> Result<(), ClaimError> {
        let mut inner = self.inner.write().await;
        let entry = inner
            .nodes
            .get_mut(node_id)
            .ok_or(ClaimError::NotFound)?;
        if entry.view.owner_user_id.is_some() {
            return Err(ClaimError::AlreadyClaimed);
        }
        entry.view.owner_user_id = Some(owner_user_id.to_string());
        Ok(())
    }

    pub async fn add_workspace(&self, node_id: &str, workspace_id: &str) {
        let mut inner = self.inner.write().await;
        if let Some(entry) = inner.nodes.get_mut(node_id) {
            entry.view.workspace_ids.insert(workspace_id.to_string());
        }
    }

    pub async fn list(&self, user_id: Option<&str>, workspaces: &HashSet<String>) -> Vec<NodeView> {
        let inner = self.inner.read().await;
        inner
            .nodes
            .values()
            .map(|e| &e.view)
            .filter(|n| visible_to(n, user_id, workspaces))
            .cloned()
            .collect()
    }

    pub async fn get(&self, node_id: &str) -> Option<NodeView> {
        self.inner.read().await.nodes.get(node_id).map(|e| e.view.clone())
    }

    pub async fn update_limits(&self, node_id: &str, limits: serde_json::Value) -> bool {
        debug!(node_id = %node_id, ?limits, "forwarding limits update");
        self.send_frame(node_id, OrchestratorFrame::UpdateLimits { limits })
            .await
    }
}

/// Unclaimed nodes are visible to everyone for onboarding; claimed nodes are
/// visible only to users whose workspace memberships intersect the node's.
fn visible_to(node: &NodeView, user_id: Option<&str>, workspaces: &HashSet<String>) -> bool {
    match &node.owner_user_id {
        None => true,
        Some(owner) => Some(owner.as_str()) == user_id || !node.workspace_ids.is_disjoint(workspaces),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClaimError {
    #[error("node not found")]
    NotFound,
    #[error("node already claimed")]
    AlreadyClaimed,
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{CpuDescriptor, GpuDescriptor, MemoryDescriptor, StorageDescriptor, StorageType};

    fn caps() -> CapabilityDescriptor {
        CapabilityDescriptor {
            gpus: vec![GpuDescriptor {
                vendor: "nvidia".into(),
                model: "rtx4090".into(),
                vram_mb: 24_000,
                compute_apis: Default::default(),
            }],
            cpu: CpuDescriptor {
                cores: 8,
                threads: 16,
                architecture: "x86_64".into(),
                features: Default::default(),
            },
            memory: MemoryDescriptor {
                total_mb: 32_000,
                available_mb: 16_000,
            },
            storage: StorageDescriptor {
                total_gb: 1000,
                available_gb: 500,
                storage_type: StorageType::Ssd,
            },
            docker_available: true,
            mcp_adapters: Default::default(),
        }
    }

    #[tokio::test]
    async fn find_node_orders_by_reputation_then_load_then_id() {
        let registry = NodeRegistry::new(30);
        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();

        let (id_a, _) = registry.register(None, caps(), tx1).await;
        let (id_b, _) = registry.register(None, caps(), tx2).await;

        // Both default reputation 50, zero jobs: tie broken by node id.
        let winner = registry.find_node(&JobRequirements::default(), None).await.unwrap();
        let expected = id_a.min(id_b);
        assert_eq!(winner, expected);
    }

    #[tokio::test]
    async fn evict_revokes_reconnect_token() {
        let registry = NodeRegistry::new(30);
        let (tx, _rx) = mpsc::unbounded_channel();
        let (node_id, token) = registry.register(None, caps(), tx).await;

        registry.evict(&node_id).await;

        let (tx2, _rx2) = mpsc::unbounded_channel();
        let (new_id, _) = registry.register(Some(token), caps(), tx2).await;
        assert_ne!(new_id, node_id, "stale token must not reattach");
    }

    #[tokio::test]
    async fn reserve_recheck_fails_when_unavailable() {
        let registry = NodeRegistry::new(30);
        let (tx, _rx) = mpsc::unbounded_channel();
        let (node_id, _) = registry.register(None, caps(), tx).await;
        registry.heartbeat(&node_id, false, 0).await;

        assert!(!registry.try_reserve(&node_id).await);
    }

    #[tokio::test]
    async fn unclaimed_nodes_visible_to_everyone() {
        let registry = NodeRegistry::new(30);
        let (tx, _rx) = mpsc::unbounded_channel();
        registry.register(None, caps(), tx).await;

        let visible = registry.list(Some("anyone"), &HashSet::new()).await;
        assert_eq!(visible.len(), 1);
    }
}
