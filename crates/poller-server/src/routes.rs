//! HTTP observability/control surface: `Router::new().route(...).with_state(state)`, handlers
//! returning `Result<Json<T>, (StatusCode, String)>`.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use poller_core::composite_node::DispatchOutcome;
use poller_core::model::{ExecutionId, ExecutionStatus, NodeId, OltId};
use poller_core::worker::SlotStatus;

use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/pollers", get(list_pollers))
        .route("/pollers/queue", get(get_queue))
        .route("/pollers/stats", get(get_stats))
        .route("/pollers/nodes/:id/run", post(run_node))
        .route("/executions/:id/complete", post(complete_execution))
        .route("/healthz", get(healthz))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

#[derive(Debug, Serialize)]
struct SlotSnapshot {
    slot_id: usize,
    status: &'static str,
    busy_percentage: f64,
    tasks_completed: u64,
    current_node_id: Option<NodeId>,
    current_execution_id: Option<ExecutionId>,
}

#[derive(Debug, Serialize)]
struct PollersResponse {
    slots: Vec<SlotSnapshot>,
    stats: StatsResponse,
}

async fn list_pollers(State(state): State<AppState>) -> Json<PollersResponse> {
    let slots = state
        .pool
        .slot_stats()
        .await
        .into_iter()
        .map(|s| SlotSnapshot {
            slot_id: s.slot_id,
            status: match s.status {
                SlotStatus::Free => "FREE",
                SlotStatus::Busy => "BUSY",
            },
            busy_percentage: s.busy_percentage(),
            tasks_completed: s.tasks_completed,
            current_node_id: s.current_node_id,
            current_execution_id: s.current_execution_id,
        })
        .collect();

    Json(PollersResponse {
        slots,
        stats: stats_response(&state).await,
    })
}

#[derive(Debug, Serialize)]
struct QueueEntryResponse {
    id: NodeId,
    name: String,
    olt: Uuid,
    status: &'static str,
    delayed: bool,
    priority: i32,
    execution_id: Option<ExecutionId>,
    next_run_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
struct QueueResponse {
    size: usize,
    max_size: usize,
    is_overload: bool,
    next_nodes: Vec<QueueEntryResponse>,
}

async fn get_queue(State(state): State<AppState>) -> Json<QueueResponse> {
    let queue = state.pool.queue();
    let queued = queue.peek(queue.size()).into_iter().map(|e| QueueEntryResponse {
        id: e.node_id,
        name: e.name,
        olt: e.olt_id.0,
        status: "QUEUED",
        delayed: e.delayed,
        priority: e.priority,
        execution_id: None,
        next_run_at: e.next_run_at,
    });

    let mut active = Vec::new();
    for slot in state.pool.slots() {
        let s = slot.stats().await;
        if s.status == SlotStatus::Busy {
            if let Some(node_id) = s.current_node_id {
                let olt = slot.current_olt_id().await;
                active.push(QueueEntryResponse {
                    id: node_id,
                    name: String::new(),
                    olt: olt.map(|o| o.0).unwrap_or_default(),
                    status: "ACTIVE",
                    delayed: false,
                    priority: 0,
                    execution_id: s.current_execution_id,
                    next_run_at: None,
                });
            }
        }
    }

    let mut next_nodes: Vec<QueueEntryResponse> = active;
    next_nodes.extend(queued);

    Json(QueueResponse {
        size: queue.size(),
        max_size: queue.max_size(),
        is_overload: queue.is_overload(),
        next_nodes,
    })
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    total_pollers: usize,
    free_pollers: usize,
    busy_pollers: usize,
    busy_percentage: f64,
    queue_size: usize,
    is_saturated: bool,
    is_overload: bool,
    total_tasks_completed: u64,
    total_tasks_delayed: u64,
    scheduler_running: bool,
    start_pollers: usize,
}

async fn stats_response(state: &AppState) -> StatsResponse {
    let stats = state.pool.stats().await;
    StatsResponse {
        total_pollers: stats.total_pollers,
        free_pollers: stats.free_pollers,
        busy_pollers: stats.busy_pollers,
        busy_percentage: stats.busy_percentage,
        queue_size: stats.queue_size,
        is_saturated: stats.is_saturated,
        is_overload: stats.is_overload,
        total_tasks_completed: stats.total_tasks_completed,
        total_tasks_delayed: stats.total_tasks_delayed,
        scheduler_running: true,
        start_pollers: stats.total_pollers,
    }
}

async fn get_stats(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(stats_response(&state).await)
}

async fn run_node(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<RunResponse>, (StatusCode, String)> {
    let node_id = NodeId(id);
    let node = state
        .store
        .get_node(node_id)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .ok_or((StatusCode::NOT_FOUND, "node not found".to_string()))?;

    if node.is_chain_node {
        return Err((
            StatusCode::BAD_REQUEST,
            "chain nodes cannot be run directly, only their master can".to_string(),
        ));
    }

    let workflow = state
        .store
        .get_workflow(node.workflow_id)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .ok_or((StatusCode::NOT_FOUND, "workflow not found".to_string()))?;

    let olt = state
        .store
        .get_olt(workflow.olt_id)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .ok_or((StatusCode::NOT_FOUND, "olt not found".to_string()))?;

    match state.pool.run_node_now(&olt, &workflow, &node).await {
        DispatchOutcome::Dispatched(execution) => Ok(Json(RunResponse {
            execution_id: Some(execution.id),
            status: "dispatched",
        })),
        DispatchOutcome::AlreadyRunning(execution) => Ok(Json(RunResponse {
            execution_id: Some(execution.id),
            status: "already_running",
        })),
        DispatchOutcome::Rejected(e) => Err((StatusCode::CONFLICT, e.to_string())),
    }
}

#[derive(Debug, Serialize)]
struct RunResponse {
    execution_id: Option<ExecutionId>,
    status: &'static str,
}

/// Body for the downstream execution runtime's required completion callback (§6):
/// "On terminal state, the runtime invokes the Completion Dispatcher callback with
/// `(olt_id, execution_id, status, duration_ms)`".
#[derive(Debug, Deserialize)]
struct CompleteExecutionRequest {
    olt_id: OltId,
    status: ExecutionStatus,
    duration_ms: i64,
}

async fn complete_execution(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<CompleteExecutionRequest>,
) -> Result<StatusCode, (StatusCode, String)> {
    if !body.status.is_terminal() {
        return Err((
            StatusCode::BAD_REQUEST,
            "status must be a terminal status (SUCCESS, FAILED, INTERRUPTED)".to_string(),
        ));
    }

    state
        .dispatcher
        .on_execution_terminal(body.olt_id, ExecutionId(id), body.status, body.duration_ms)
        .await;

    Ok(StatusCode::NO_CONTENT)
}
