//! Axum router composition: wires every HTTP handler and the node
//! WebSocket upgrade onto a single `AppState`.

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::api::handlers;
use crate::api::ws::node_ws_handler;
use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    let ws_path = state.config.ws_path.clone();

    Router::new()
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        .route("/auth/signup", post(handlers::signup))
        .route("/auth/login", post(handlers::login))
        .route("/auth/me", get(handlers::me))
        .route("/workspaces", post(handlers::create_workspace))
        .route("/workspaces/join", post(handlers::join_workspace))
        .route("/workspaces/:id", get(handlers::get_workspace))
        .route("/workspaces/:id/leave", post(handlers::leave_workspace))
        .route(
            "/workspaces/:id/invite-code",
            post(handlers::regenerate_invite_code),
        )
        .route("/workspaces/:id/nodes", get(handlers::list_workspace_nodes))
        .route("/my-nodes", get(handlers::my_nodes))
        .route("/nodes/:id/claim", post(handlers::claim_node))
        .route("/nodes/:id/limits", post(handlers::update_node_limits))
        .route(
            "/jobs",
            post(handlers::submit_job).get(handlers::list_jobs),
        )
        .route(
            "/jobs/:id",
            get(handlers::get_job).delete(handlers::cancel_job),
        )
        .route("/accounts", post(handlers::create_account))
        .route("/accounts/:id", get(handlers::get_account))
        .route("/accounts/:id/deposit", post(handlers::request_deposit))
        .route("/accounts/:id/withdraw", post(handlers::request_withdraw))
        .route("/deposits/:id/confirm", post(handlers::confirm_deposit))
        .route("/admin/credit", post(handlers::admin_credit))
        .route(&ws_path, get(node_ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
