//! WebSocket upgrade endpoint accepting persistent node connections.
//!
//! One task per connection reads `NodeFrame`s in order; a separate writer
//! task drains an unbounded per-connection channel so outbound frames never
//! block on the socket while a subsystem lock is held (see the registry's
//! `send_frame`).

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::protocol::{NodeFrame, OrchestratorFrame};
use crate::state::AppState;

pub async fn node_ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_node_socket(socket, state))
}

async fn handle_node_socket(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<OrchestratorFrame>();

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            let text = match serde_json::to_string(&frame) {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "failed to encode orchestrator frame");
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let mut node_id: Option<String> = None;

    while let Some(message) = stream.next().await {
        let message = match message {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "node socket read error");
                break;
            }
        };
        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) | Message::Binary(_) => continue,
        };

        let frame: NodeFrame = match serde_json::from_str(&text) {
            Ok(f) => f,
            Err(e) => {
                debug!(error = %e, "ignoring malformed node frame");
                continue;
            }
        };

        match frame {
            NodeFrame::Register {
                reconnect_token,
                capabilities,
            } => {
                let (id, token) = state
                    .registry
                    .register(reconnect_token, capabilities, outbound_tx.clone())
                    .await;
                info!(node_id = %id, "node connected");
                state.metrics.nodes_registered.inc();
                node_id = Some(id.clone());
                let _ = outbound_tx.send(OrchestratorFrame::Registered {
                    node_id: id,
                    reconnect_token: token,
                });
            }
            NodeFrame::Heartbeat {
                available,
                current_jobs,
            } => {
                if let Some(id) = &node_id {
                    state.registry.heartbeat(id, available, current_jobs).await;
                } else {
                    let _ = outbound_tx.send(OrchestratorFrame::Error {
                        code: "heartbeat_before_register".to_string(),
                        message: "heartbeat before register".to_string(),
                    });
                }
            }
            NodeFrame::JobStatus { job_id, status } => {
                state.scheduler.report_status(&job_id, &status).await;
            }
            NodeFrame::JobResult {
                job_id,
                success,
                output,
                actual_cost_cents,
                error,
            } => {
                let node_account = node_id.clone().unwrap_or_default();
                let outcome = state
                    .scheduler
                    .complete(&job_id, success, output, actual_cost_cents, &node_account, error)
                    .await;
                use crate::scheduler::CompletionOutcome;
                match outcome {
                    CompletionOutcome::Completed => state.metrics.jobs_completed_total.inc(),
                    CompletionOutcome::FailedFinal => state.metrics.jobs_failed_total.inc(),
                    CompletionOutcome::Retried | CompletionOutcome::Ignored => {}
                }
            }
        }
    }

    writer.abort();
    if let Some(id) = node_id {
        state.registry.evict(&id).await;
        state.metrics.nodes_registered.dec();
        state.scheduler.handle_node_evicted(&id).await;
        info!(node_id = %id, "node disconnected");
    }
}
