//! Discriminated JSON frame union carried over the persistent node channel.

use serde::{Deserialize, Serialize};

use crate::capability::CapabilityDescriptor;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeFrame {
    Register {
        reconnect_token: Option<String>,
        capabilities: CapabilityDescriptor,
    },
    Heartbeat {
        available: bool,
        current_jobs: u32,
    },
    JobStatus {
        job_id: String,
        status: String,
    },
    JobResult {
        job_id: String,
        success: bool,
        output: serde_json::Value,
        actual_cost_cents: u64,
        error: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestratorFrame {
    Registered {
        node_id: String,
        reconnect_token: String,
    },
    JobAssignment {
        job_id: String,
        payload: serde_json::Value,
    },
    CancelJob {
        job_id: String,
    },
    UpdateLimits {
        limits: serde_json::Value,
    },
    WorkspacesUpdated {
        workspace_ids: Vec<String>,
    },
    Error {
        code: String,
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn node_frame_tags_are_snake_case() {
        let frame = NodeFrame::Heartbeat {
            available: true,
            current_jobs: 2,
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "heartbeat");
    }

    #[test]
    fn unknown_fields_are_ignored_on_decode() {
        let raw = json!({
            "type": "job_status",
            "job_id": "j1",
            "status": "running",
            "extra_field_from_future_client": true
        });
        let frame: NodeFrame = serde_json::from_value(raw).unwrap();
        assert_eq!(
            frame,
            NodeFrame::JobStatus {
                job_id: "j1".into(),
                status: "running".into()
            }
        );
    }

    #[test]
    fn orchestrator_frame_round_trips() {
        let frame = OrchestratorFrame::CancelJob {
            job_id: "job-42".into(),
        };
        let encoded = serde_json::to_string(&frame).unwrap();
        let decoded: OrchestratorFrame = serde_json::from_str(&encoded).unwrap();
        assert_eq!(frame, decoded);
    }
}
