//! Job admission, periodic dispatch matching, retries, cancellation, timeout
//! and garbage collection.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::time::{interval, Duration};
use tracing::{info, warn};
use uuid::Uuid;

use crate::capability::JobRequirements;
use crate::payments::PaymentEngine;
use crate::protocol::OrchestratorFrame;
use crate::registry::NodeRegistry;

const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_TIMEOUT_SECONDS: u64 = 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Assigned,
    Running,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled | JobStatus::Timeout
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub client_id: String,
    pub workspace_id: Option<String>,
    pub requirements: JobRequirements,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    pub assigned_node: Option<String>,
    pub created_at_unix: u64,
    pub started_at_unix: Option<u64>,
    pub retries: u32,
    pub max_retries: u32,
    pub timeout_seconds: u64,
    pub hold_id: Option<String>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}

/// What `complete` actually did, so callers (metrics, API responses) can
/// react without re-deriving it from job state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionOutcome {
    Completed,
    Retried,
    FailedFinal,
    /// Job already terminal or unknown; late/duplicate report, discarded.
    Ignored,
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("insufficient funds")]
    InsufficientFunds,
    #[error("job not found")]
    NotFound,
    #[error("queue full")]
    QueueFull,
}

struct Inner {
    jobs: HashMap<String, Job>,
    pending: VecDeque<String>,
    max_pending: Option<usize>,
}

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<RwLock<Inner>>,
    registry: NodeRegistry,
    payments: PaymentEngine,
}

impl Scheduler {
    pub fn new(registry: NodeRegistry, payments: PaymentEngine, max_pending: Option<usize>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                jobs: HashMap::new(),
                pending: VecDeque::new(),
                max_pending,
            })),
            registry,
            payments,
        }
    }

    /// Admits a job: validates, holds funds if an account was given, and
    /// appends it to the FIFO pending queue.
    pub async fn submit(
        &self,
        client_id: &str,
        account_id: Option<&str>,
        workspace_id: Option<String>,
        requirements: JobRequirements,
        payload: serde_json::Value,
    ) -> Result<Job, SchedulerError> {
        let mut inner = self.inner.write().await;
        if let Some(max) = inner.max_pending {
            if inner.pending.len() >= max {
                return Err(SchedulerError::QueueFull);
            }
        }

        let job_id = Uuid::new_v4().to_string();

        let hold_id = if let Some(account_id) = account_id {
            Some(
                self.payments
                    .hold(account_id, requirements.max_cost_cents, &job_id)
                    .await
                    .map_err(|_| SchedulerError::InsufficientFunds)?,
            )
        } else {
            None
        };

        let job = Job {
            id: job_id.clone(),
            client_id: client_id.to_string(),
            workspace_id,
            timeout_seconds: requirements.timeout_seconds.unwrap_or(DEFAULT_TIMEOUT_SECONDS),
            requirements,
            payload,
            status: JobStatus::Pending,
            assigned_node: None,
            created_at_unix: now_unix(),
            started_at_unix: None,
            retries: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            hold_id,
            result: None,
            error: None,
        };

        inner.jobs.insert(job_id.clone(), job.clone());
        inner.pending.push_back(job_id);
        Ok(job)
    }

    /// One dispatch pass: FIFO-order attempt to match each pending job to an
    /// available node, ties broken by node score inside the registry.
    pub async fn dispatch_tick(&self) {
        let pending: Vec<String> = {
            let inner = self.inner.read().await;
            inner.pending.iter().cloned().collect()
        };

        for job_id in pending {
            let (requirements, workspace_id) = {
                let inner = self.inner.read().await;
                match inner.jobs.get(&job_id) {
                    Some(job) if job.status == JobStatus::Pending => {
                        (job.requirements.clone(), job.workspace_id.clone())
                    }
                    _ => continue,
                }
            };

            let Some(node_id) = self
                .registry
                .find_node(&requirements, workspace_id.as_deref())
                .await
            else {
                continue;
            };

            if !self.registry.try_reserve(&node_id).await {
                continue;
            }

            let mut inner = self.inner.write().await;
            let Some(job) = inner.jobs.get_mut(&job_id) else {
                self.registry.release(&node_id).await;
                continue;
            };
            if job.status != JobStatus::Pending {
                self.registry.release(&node_id).await;
                continue;
            }
            job.status = JobStatus::Assigned;
            job.assigned_node = Some(node_id.clone());
            let payload = job.payload.clone();
            inner.pending.retain(|id| id != &job_id);
            drop(inner);

            self.registry
                .send_frame(
                    &node_id,
                    OrchestratorFrame::JobAssignment {
                        job_id: job_id.clone(),
                        payload,
                    },
                )
                .await;
            info!(job_id = %job_id, node_id = %node_id, "job dispatched");
        }
    }

    /// Applies a status report from the assigned node.
    pub async fn report_status(&self, job_id: &str, reported: &str) {
        let mut inner = self.inner.write().await;
        let Some(job) = inner.jobs.get_mut(job_id) else {
            return;
        };
        if job.status.is_terminal() {
            return; // cancellation wins over late frames
        }
        match reported {
            "accepted" => job.status = JobStatus::Assigned,
            "preparing" | "running" => {
                if job.started_at_unix.is_none() {
                    job.started_at_unix = Some(now_unix());
                }
                job.status = JobStatus::Running;
            }
            _ => {}
        }
    }

    /// Finalizes a job reported complete by its node, settling payment.
    pub async fn complete(
        &self,
        job_id: &str,
        success: bool,
        result: serde_json::Value,
        actual_cost_cents: u64,
        node_account_id: &str,
        error: Option<String>,
    ) -> CompletionOutcome {
        let (node_id, hold_id, should_retry) = {
            let mut inner = self.inner.write().await;
            let Some(job) = inner.jobs.get_mut(job_id) else {
                return CompletionOutcome::Ignored;
            };
            if job.status.is_terminal() {
                return CompletionOutcome::Ignored;
            }
            let node_id = job.assigned_node.clone();

            if success {
                job.status = JobStatus::Completed;
                job.result = Some(result);
                (node_id, job.hold_id.clone(), false)
            } else if job.retries < job.max_retries {
                job.retries += 1;
                job.status = JobStatus::Pending;
                job.assigned_node = None;
                inner.pending.push_back(job_id.to_string());
                (node_id, None, true)
            } else {
                job.status = JobStatus::Failed;
                job.error = error;
                (node_id, job.hold_id.clone(), false)
            }
        };

        if let Some(node_id) = &node_id {
            self.registry.release(node_id).await;
        }

        if should_retry {
            warn!(job_id = %job_id, "job failed, requeued for retry");
            return CompletionOutcome::Retried;
        }

        if let Some(hold_id) = hold_id {
            if success {
                let _ = self
                    .payments
                    .settle(&hold_id, node_account_id, actual_cost_cents)
                    .await;
            } else {
                let _ = self.payments.refund(&hold_id).await;
            }
        }

        if success {
            CompletionOutcome::Completed
        } else {
            CompletionOutcome::FailedFinal
        }
    }

    /// Cancels a job: dequeues if pending, best-effort cancel frame if
    /// assigned/running, always refunds and marks terminal.
    pub async fn cancel(&self, job_id: &str) -> Result<(), SchedulerError> {
        let (node_id, hold_id) = {
            let mut inner = self.inner.write().await;
            let Some(job) = inner.jobs.get_mut(job_id) else {
                return Err(SchedulerError::NotFound);
            };
            if job.status.is_terminal() {
                return Ok(());
            }
            let node_id = job.assigned_node.clone();
            let hold_id = job.hold_id.clone();
            job.status = JobStatus::Cancelled;
            inner.pending.retain(|id| id != job_id);
            (node_id, hold_id)
        };

        if let Some(node_id) = &node_id {
            self.registry
                .send_frame(
                    node_id,
                    OrchestratorFrame::CancelJob {
                        job_id: job_id.to_string(),
                    },
                )
                .await;
            self.registry.release(node_id).await;
        }

        if let Some(hold_id) = hold_id {
            let _ = self.payments.refund(&hold_id).await;
        }
        Ok(())
    }

    /// Sweeps jobs whose per-job deadline has passed.
    pub async fn enforce_timeouts(&self) {
        let now = now_unix();
        let expired: Vec<(String, Option<String>, Option<String>)> = {
            let inner = self.inner.read().await;
            inner
                .jobs
                .values()
                .filter(|j| !j.status.is_terminal())
                .filter(|j| now.saturating_sub(j.created_at_unix) >= j.timeout_seconds)
                .map(|j| (j.id.clone(), j.assigned_node.clone(), j.hold_id.clone()))
                .collect()
        };

        for (job_id, node_id, hold_id) in expired {
            {
                let mut inner = self.inner.write().await;
                if let Some(job) = inner.jobs.get_mut(&job_id) {
                    job.status = JobStatus::Timeout;
                }
                inner.pending.retain(|id| id != &job_id);
            }
            if let Some(node_id) = node_id {
                self.registry.release(&node_id).await;
            }
            if let Some(hold_id) = hold_id {
                let _ = self.payments.refund(&hold_id).await;
            }
            warn!(job_id = %job_id, "job timed out");
        }
    }

    /// Removes terminal jobs older than `retention_hours`.
    pub async fn gc(&self, retention_hours: u64) {
        let cutoff = now_unix().saturating_sub(retention_hours * 3600);
        let mut inner = self.inner.write().await;
        inner
            .jobs
            .retain(|_, job| !(job.status.is_terminal() && job.created_at_unix < cutoff));
    }

    pub async fn get(&self, job_id: &str) -> Option<Job> {
        self.inner.read().await.jobs.get(job_id).cloned()
    }

    pub async fn list(&self, client_id: Option<&str>, status: Option<JobStatus>) -> Vec<Job> {
        self.inner
            .read()
            .await
            .jobs
            .values()
            .filter(|j| client_id.is_none_or(|c| j.client_id == c))
            .filter(|j| status.is_none_or(|s| j.status == s))
            .cloned()
            .collect()
    }

    /// Called when a node is evicted mid-job: in-flight jobs on it retry if
    /// under their retry budget, otherwise fail and refund, identically to
    /// an explicit failure report from the node.
    pub async fn handle_node_evicted(&self, node_id: &str) {
        let affected: Vec<String> = {
            let inner = self.inner.read().await;
            inner
                .jobs
                .values()
                .filter(|j| j.assigned_node.as_deref() == Some(node_id) && !j.status.is_terminal())
                .map(|j| j.id.clone())
                .collect()
        };
        for job_id in affected {
            self.complete(
                &job_id,
                false,
                serde_json::Value::Null,
                0,
                "",
                Some("node evicted mid-job".to_string()),
            )
            .await;
        }
    }
}

/// Spawns the dispatch/eviction/gc ticker loop as a background task.
pub fn spawn_ticker(
    scheduler: Scheduler,
    registry: NodeRegistry,
    dispatch_tick: Duration,
    eviction_tick: Duration,
    gc_tick: Duration,
    retention_hours: u64,
) {
    tokio::spawn(async move {
        let mut dispatch_interval = interval(dispatch_tick);
        let mut eviction_interval = interval(eviction_tick);
        let mut gc_interval = interval(gc_tick);
        loop {
            tokio::select! {
                _ = dispatch_interval.tick() => {
                    scheduler.dispatch_tick().await;
                    scheduler.enforce_timeouts().await;
                }
                _ = eviction_interval.tick() => {
                    let evicted = registry.evict_stale().await;
                    for node_id in evicted {
                        scheduler.handle_node_evicted(&node_id).await;
                    }
                }
                _ = gc_interval.tick() => {
                    scheduler.gc(retention_hours).await;
                }
            }
        }
    });
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
    use tokio::sync::mpsc;

    fn caps() -> crate::capability::CapabilityDescriptor {
        crate::capability::CapabilityDescriptor {
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

    async fn setup() -> (Scheduler, NodeRegistry, PaymentEngine) {
        let registry = NodeRegistry::new(30);
        let payments = PaymentEngine::new(500);
        let scheduler = Scheduler::new(registry.clone(), payments.clone(), None);
        (scheduler, registry, payments)
    }

    #[tokio::test]
    async fn happy_path_submit_dispatch_complete_settles() {
        let (scheduler, registry, payments) = setup().await;
        payments.credit("client", 1_000).await.unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        registry.register(None, caps(), tx).await;

        let req = JobRequirements {
            max_cost_cents: 1_000,
            ..Default::default()
        };
        let job = scheduler
            .submit("client", Some("client"), None, req, serde_json::json!({}))
            .await
            .unwrap();

        scheduler.dispatch_tick().await;
        let dispatched = scheduler.get(&job.id).await.unwrap();
        assert_eq!(dispatched.status, JobStatus::Assigned);

        scheduler
            .complete(&job.id, true, serde_json::json!({"ok": true}), 1_000, "node-acct", None)
            .await;
        let done = scheduler.get(&job.id).await.unwrap();
        assert_eq!(done.status, JobStatus::Completed);

        let node_acct = payments.get_account("node-acct").await.unwrap();
        assert!(node_acct.balance_cents > 0);
    }

    #[tokio::test]
    async fn submit_without_funds_is_rejected() {
        let (scheduler, _registry, _payments) = setup().await;
        let req = JobRequirements {
            max_cost_cents: 1_000,
            ..Default::default()
        };
        let result = scheduler
            .submit("client", Some("client"), None, req, serde_json::json!({}))
            .await;
        assert!(matches!(result, Err(SchedulerError::InsufficientFunds)));
    }

    #[tokio::test]
    async fn failure_retries_then_fails_and_refunds() {
        let (scheduler, registry, payments) = setup().await;
        payments.credit("client", 500).await.unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        registry.register(None, caps(), tx).await;

        let req = JobRequirements {
            max_cost_cents: 500,
            ..Default::default()
        };
        let job = scheduler
            .submit("client", Some("client"), None, req, serde_json::json!({}))
            .await
            .unwrap();

        for _ in 0..=DEFAULT_MAX_RETRIES {
            scheduler.dispatch_tick().await;
            scheduler
                .complete(&job.id, false, serde_json::Value::Null, 0, "node-acct", Some("boom".into()))
                .await;
        }

        let final_job = scheduler.get(&job.id).await.unwrap();
        assert_eq!(final_job.status, JobStatus::Failed);
        let client = payments.get_account("client").await.unwrap();
        assert_eq!(client.balance_cents, 500);
    }

    #[tokio::test]
    async fn cancel_after_completion_is_a_noop() {
        let (scheduler, registry, payments) = setup().await;
        payments.credit("client", 500).await.unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        registry.register(None, caps(), tx).await;

        let req = JobRequirements {
            max_cost_cents: 500,
            ..Default::default()
        };
        let job = scheduler
            .submit("client", Some("client"), None, req, serde_json::json!({}))
            .await
            .unwrap();
        scheduler.dispatch_tick().await;
        scheduler
            .complete(&job.id, true, serde_json::json!({}), 500, "node-acct", None)
            .await;

        scheduler.cancel(&job.id).await.unwrap();
        let final_job = scheduler.get(&job.id).await.unwrap();
        assert_eq!(final_job.status, JobStatus::Completed, "completion wins the race");
    }

    #[tokio::test]
    async fn node_eviction_mid_job_requeues_then_fails() {
        let (scheduler, registry, payments) = setup().await;
        payments.credit("client", 500).await.unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let (node_id, _) = registry.register(None, caps(), tx).await;

        let req = JobRequirements {
            max_cost_cents: 500,
            ..Default::default()
        };
        let job = scheduler
            .submit("client", Some("client"), None, req, serde_json::json!({}))
            .await
            .unwrap();
        scheduler.dispatch_tick().await;

        scheduler.handle_node_evicted(&node_id).await;
        let after_first_eviction = scheduler.get(&job.id).await.unwrap();
        assert_eq!(after_first_eviction.status, JobStatus::Pending, "first eviction retries");

        // The node is gone, so each retry cycle needs a fresh reservation
        // before the next eviction can be observed against it.
        for _ in 0..DEFAULT_MAX_RETRIES {
            registry.try_reserve(&node_id).await;
            {
                let mut inner = scheduler.inner.write().await;
                if let Some(j) = inner.jobs.get_mut(&job.id) {
                    j.assigned_node = Some(node_id.clone());
                }
                inner.pending.retain(|id| id != &job.id);
            }
            scheduler.handle_node_evicted(&node_id).await;
        }
        let final_job = scheduler.get(&job.id).await.unwrap();
        assert_eq!(final_job.status, JobStatus::Failed);
    }
}
