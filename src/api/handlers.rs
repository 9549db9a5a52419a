//! REST handlers for the client/admin-facing HTTP surface.

use std::collections::HashSet;

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::auth::User;
use crate::capability::JobRequirements;
use crate::error::{OrchestratorError, Result};
use crate::scheduler::{Job, JobStatus};
use crate::state::AppState;
use crate::workspace::Workspace;

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

async fn require_user(state: &AppState, headers: &HeaderMap) -> Result<User> {
    let token = bearer_token(headers).ok_or(OrchestratorError::Unauthenticated)?;
    state
        .auth
        .verify_token(token)
        .await
        .map_err(|_| OrchestratorError::Unauthenticated)
}

fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<()> {
    let provided = headers
        .get("X-Admin-Key")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if state.config.admin_key.is_empty() || provided != state.config.admin_key {
        return Err(OrchestratorError::Forbidden("admin key required".into()));
    }
    Ok(())
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_seconds: u64,
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: state.started_at.elapsed().as_secs(),
    })
}

pub async fn metrics(State(state): State<AppState>) -> String {
    let pending = state.scheduler.list(None, Some(JobStatus::Pending)).await.len() as i64;
    state.metrics.pending_jobs.set(pending);
    state.metrics.render()
}

#[derive(Deserialize)]
pub struct SignupRequest {
    pub username: String,
    pub password: String,
}

#[derive(Serialize)]
pub struct AuthResponse {
    pub token: String,
    pub user_id: String,
    pub username: String,
}

pub async fn signup(
    State(state): State<AppState>,
    Json(body): Json<SignupRequest>,
) -> Result<Json<AuthResponse>> {
    if body.username.is_empty() || body.password.len() < 6 {
        return Err(OrchestratorError::InvalidRequest(
            "username required, password must be at least 6 characters".into(),
        ));
    }
    let (user, token) = state
        .auth
        .signup(&body.username, &body.password)
        .await
        .map_err(|e| OrchestratorError::InvalidRequest(e.to_string()))?;
    Ok(Json(AuthResponse {
        token,
        user_id: user.id,
        username: user.username,
    }))
}

pub async fn login(
    State(state): State<AppState>,
    Json(body): Json<SignupRequest>,
) -> Result<Json<AuthResponse>> {
    let (user, token) = state
        .auth
        .login(&body.username, &body.password)
        .await
        .map_err(|_| OrchestratorError::Unauthenticated)?;
    Ok(Json(AuthResponse {
        token,
        user_id: user.id,
        username: user.username,
    }))
}

#[derive(Serialize)]
pub struct MeResponse {
    pub user_id: String,
    pub username: String,
    pub expires_at: u64,
}

pub async fn me(State(state): State<AppState>, headers: HeaderMap) -> Result<Json<MeResponse>> {
    let token = bearer_token(&headers).ok_or(OrchestratorError::Unauthenticated)?;
    let (user, expires_at) = state
        .auth
        .verify_token_with_expiry(token)
        .await
        .map_err(|_| OrchestratorError::Unauthenticated)?;
    Ok(Json(MeResponse {
        user_id: user.id,
        username: user.username,
        expires_at,
    }))
}

#[derive(Deserialize)]
pub struct CreateWorkspaceRequest {
    pub name: String,
}

pub async fn create_workspace(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateWorkspaceRequest>,
) -> Result<Json<Workspace>> {
    let user = require_user(&state, &headers).await?;
    Ok(Json(state.workspaces.create(&user.id, &body.name).await))
}

pub async fn get_workspace(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Workspace>> {
    let user = require_user(&state, &headers).await?;
    let workspace = state
        .workspaces
        .get(&id)
        .await
        .ok_or_else(|| OrchestratorError::NotFound(id.clone()))?;
    if !workspace.members.iter().any(|m| m.user_id == user.id) {
        return Err(OrchestratorError::Forbidden("not a member".into()));
    }
    Ok(Json(workspace))
}

#[derive(Deserialize)]
pub struct JoinWorkspaceRequest {
    pub invite_code: String,
}

#[derive(Serialize)]
pub struct JoinWorkspaceResponse {
    #[serde(flatten)]
    pub workspace: Workspace,
    pub already_member: bool,
}

pub async fn join_workspace(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<JoinWorkspaceRequest>,
) -> Result<Json<JoinWorkspaceResponse>> {
    let user = require_user(&state, &headers).await?;
    let outcome = state
        .workspaces
        .join(&body.invite_code, &user.id)
        .await
        .map_err(|e| OrchestratorError::InvalidRequest(e.to_string()))?;
    let already_member = outcome.already_member();
    Ok(Json(JoinWorkspaceResponse {
        workspace: outcome.into_workspace(),
        already_member,
    }))
}

#[derive(Serialize)]
pub struct SuccessResponse {
    pub success: bool,
}

pub async fn leave_workspace(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<SuccessResponse>> {
    let user = require_user(&state, &headers).await?;
    state
        .workspaces
        .leave(&id, &user.id)
        .await
        .map_err(|e| OrchestratorError::InvalidRequest(e.to_string()))?;
    Ok(Json(SuccessResponse { success: true }))
}

#[derive(Serialize)]
pub struct InviteCodeResponse {
    pub invite_code: String,
}

pub async fn regenerate_invite_code(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<InviteCodeResponse>> {
    let user = require_user(&state, &headers).await?;
    let invite_code = state
        .workspaces
        .regenerate_invite_code(&id, &user.id)
        .await
        .map_err(|e| OrchestratorError::Forbidden(e.to_string()))?;
    Ok(Json(InviteCodeResponse { invite_code }))
}

#[derive(Serialize)]
pub struct NodesResponse {
    pub nodes: Vec<crate::registry::NodeView>,
}

pub async fn list_workspace_nodes(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<NodesResponse>> {
    let user = require_user(&state, &headers).await?;
    let workspace = state
        .workspaces
        .get(&id)
        .await
        .ok_or_else(|| OrchestratorError::NotFound(id.clone()))?;
    if !workspace.members.iter().any(|m| m.user_id == user.id) {
        return Err(OrchestratorError::Forbidden("not a member".into()));
    }
    let nodes = state
        .registry
        .list(Some(&user.id), &HashSet::from([id]))
        .await;
    Ok(Json(NodesResponse { nodes }))
}

pub async fn my_nodes(State(state): State<AppState>, headers: HeaderMap) -> Result<Json<NodesResponse>> {
    let user = require_user(&state, &headers).await?;
    let workspaces: HashSet<String> = state
        .workspaces
        .list_for_user(&user.id)
        .await
        .into_iter()
        .map(|w| w.id)
        .collect();
    let nodes = state.registry.list(Some(&user.id), &workspaces).await;
    Ok(Json(NodesResponse { nodes }))
}

#[derive(Serialize)]
pub struct ClaimNodeResponse {
    pub owner_id: String,
}

pub async fn claim_node(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<ClaimNodeResponse>> {
    let user = require_user(&state, &headers).await?;
    state
        .registry
        .claim(&id, &user.id)
        .await
        .map_err(|e| OrchestratorError::Conflict(e.to_string()))?;
    Ok(Json(ClaimNodeResponse { owner_id: user.id }))
}

pub async fn update_node_limits(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(limits): Json<serde_json::Value>,
) -> Result<Json<SuccessResponse>> {
    let user = require_user(&state, &headers).await?;
    let node = state
        .registry
        .get(&id)
        .await
        .ok_or_else(|| OrchestratorError::NotFound(id.clone()))?;
    if node.owner_user_id.as_deref() != Some(user.id.as_str()) {
        return Err(OrchestratorError::Forbidden("not the node owner".into()));
    }
    state.registry.update_limits(&id, limits).await;
    Ok(Json(SuccessResponse { success: true }))
}

#[derive(Deserialize)]
pub struct SubmitJobRequest {
    #[serde(default)]
    pub account_id: Option<String>,
    #[serde(default)]
    pub workspace_id: Option<String>,
    #[serde(default)]
    pub requirements: JobRequirements,
    pub payload: serde_json::Value,
}

#[derive(Serialize)]
pub struct SubmitJobResponse {
    pub job_id: String,
    pub status: JobStatus,
    pub created_at: u64,
}

pub async fn submit_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<SubmitJobRequest>,
) -> Result<Json<SubmitJobResponse>> {
    let user = require_user(&state, &headers).await?;
    let has_type_tag = body
        .payload
        .as_object()
        .and_then(|obj| obj.get("type"))
        .is_some_and(|t| t.is_string());
    if !has_type_tag {
        return Err(OrchestratorError::InvalidRequest(
            "payload must be an object with a string \"type\" field".into(),
        ));
    }
    let job = state
        .scheduler
        .submit(
            &user.id,
            body.account_id.as_deref(),
            body.workspace_id,
            body.requirements,
            body.payload,
        )
        .await
        .map_err(|e| match e {
            crate::scheduler::SchedulerError::InsufficientFunds => OrchestratorError::InsufficientFunds,
            crate::scheduler::SchedulerError::QueueFull => {
                OrchestratorError::InvalidRequest("queue full".into())
            }
            crate::scheduler::SchedulerError::NotFound => OrchestratorError::NotFound("job".into()),
        })?;
    state.metrics.jobs_submitted_total.inc();
    Ok(Json(SubmitJobResponse {
        job_id: job.id,
        status: job.status,
        created_at: job.created_at_unix,
    }))
}

#[derive(Deserialize)]
pub struct ListJobsQuery {
    pub status: Option<JobStatus>,
}

#[derive(Serialize)]
pub struct JobsResponse {
    pub jobs: Vec<Job>,
}

pub async fn list_jobs(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ListJobsQuery>,
) -> Result<Json<JobsResponse>> {
    let user = require_user(&state, &headers).await?;
    let jobs = state.scheduler.list(Some(&user.id), query.status).await;
    Ok(Json(JobsResponse { jobs }))
}

pub async fn get_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Job>> {
    let user = require_user(&state, &headers).await?;
    let job = state
        .scheduler
        .get(&id)
        .await
        .ok_or_else(|| OrchestratorError::NotFound(id.clone()))?;
    if job.client_id != user.id {
        return Err(OrchestratorError::Forbidden("not your job".into()));
    }
    Ok(Json(job))
}

pub async fn cancel_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<SuccessResponse>> {
    let user = require_user(&state, &headers).await?;
    let job = state
        .scheduler
        .get(&id)
        .await
        .ok_or_else(|| OrchestratorError::NotFound(id.clone()))?;
    if job.client_id != user.id {
        return Err(OrchestratorError::Forbidden("not your job".into()));
    }
    let was_live = !job.status.is_terminal();
    state
        .scheduler
        .cancel(&id)
        .await
        .map_err(|_| OrchestratorError::NotFound(id))?;
    if was_live {
        state.metrics.jobs_cancelled_total.inc();
    }
    Ok(Json(SuccessResponse { success: true }))
}

#[derive(Deserialize)]
pub struct CreateAccountRequest {
    pub wallet_address: String,
    #[serde(default = "default_currency")]
    pub currency: String,
}

fn default_currency() -> String {
    "usd".to_string()
}

pub async fn create_account(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateAccountRequest>,
) -> Result<Json<crate::payments::Account>> {
    require_user(&state, &headers).await?;
    let account = state
        .payments
        .get_or_create_account(&body.wallet_address, &body.currency)
        .await;
    Ok(Json(account))
}

pub async fn get_account(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<crate::payments::Account>> {
    require_user(&state, &headers).await?;
    let account = state
        .payments
        .get_account(&id)
        .await
        .ok_or(OrchestratorError::NotFound(id))?;
    Ok(Json(account))
}

#[derive(Deserialize)]
pub struct DepositRequest {
    pub amount_cents: u64,
    #[serde(default = "default_currency")]
    pub currency: String,
}

pub async fn request_deposit(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<DepositRequest>,
) -> Result<Json<crate::payments::Deposit>> {
    require_user(&state, &headers).await?;
    let deposit = state
        .payments
        .request_deposit(&id, body.amount_cents, &body.currency)
        .await;
    Ok(Json(deposit))
}

pub async fn confirm_deposit(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<SuccessResponse>> {
    require_user(&state, &headers).await?;
    state
        .payments
        .confirm_deposit(&id)
        .await
        .map_err(|e| OrchestratorError::NotFound(e.to_string()))?;
    Ok(Json(SuccessResponse { success: true }))
}

#[derive(Deserialize)]
pub struct WithdrawRequest {
    pub amount_cents: u64,
}

pub async fn request_withdraw(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<WithdrawRequest>,
) -> Result<Json<SuccessResponse>> {
    require_user(&state, &headers).await?;
    state
        .payments
        .request_withdraw(&id, body.amount_cents)
        .await
        .map_err(|_| OrchestratorError::InsufficientFunds)?;
    Ok(Json(SuccessResponse { success: true }))
}

#[derive(Deserialize)]
pub struct AdminCreditRequest {
    pub account_id: String,
    pub amount_cents: u64,
}

pub async fn admin_credit(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<AdminCreditRequest>,
) -> Result<Json<crate::payments::Account>> {
    require_admin(&state, &headers)?;
    let account = state
        .payments
        .credit(&body.account_id, body.amount_cents)
        .await
        .map_err(|e| OrchestratorError::NotFound(e.to_string()))?;
    tracing::info!(account_id = %body.account_id, amount_cents = body.amount_cents, "admin credit applied");
    Ok(Json(account))
}
