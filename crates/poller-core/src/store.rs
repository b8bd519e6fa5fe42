//! Persistence port. One trait, organized by concern: OLT/Workflow/Node reads, Execution
//! lifecycle, janitor queries.
//!
//! Implementations (`MemoryStore`, `PostgresStore`) live in the `poller-store` crate, which
//! depends on this crate for the trait and the `model` types. The trait itself stays here,
//! not there, so that dependency only runs one way.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::PollerError;
use crate::model::{Execution, ExecutionId, ExecutionStatus, NodeId, Olt, OltId, Workflow, WorkflowId, WorkflowNode};

#[async_trait]
pub trait PollerStore: Send + Sync {
    // --- OLT ---
    async fn get_olt(&self, id: OltId) -> Result<Option<Olt>, PollerError>;

    // --- Workflow ---
    async fn get_workflow(&self, id: WorkflowId) -> Result<Option<Workflow>, PollerError>;

    // --- Workflow Node ---
    async fn get_node(&self, id: NodeId) -> Result<Option<WorkflowNode>, PollerError>;

    /// Enabled masters with `next_run_at <= now`, whose workflow is active and whose OLT is
    /// enabled and not soft-deleted (§4.E step 2). Does not filter on in-flight Executions;
    /// that's the scheduler's job once it has the candidate list.
    async fn list_ready_masters(&self, now: DateTime<Utc>) -> Result<Vec<WorkflowNode>, PollerError>;

    /// Enabled chain nodes of `master_id`, ordered `(priority desc, id asc)` (I3).
    async fn list_chain_nodes(&self, master_id: NodeId) -> Result<Vec<WorkflowNode>, PollerError>;

    /// Masters that are enabled but have never been scheduled (`next_run_at = null`), for the
    /// scheduler's auto-repair path (§4.E).
    async fn list_unscheduled_masters(&self) -> Result<Vec<WorkflowNode>, PollerError>;

    async fn set_node_next_run_at(&self, id: NodeId, next_run_at: DateTime<Utc>) -> Result<(), PollerError>;

    async fn record_node_completion(
        &self,
        id: NodeId,
        now: DateTime<Utc>,
        succeeded: bool,
        advance_next_run_at: Option<DateTime<Utc>>,
    ) -> Result<(), PollerError>;

    // --- Execution ---
    async fn create_execution(&self, execution: Execution) -> Result<(), PollerError>;

    async fn get_execution(&self, id: ExecutionId) -> Result<Option<Execution>, PollerError>;

    /// The single active (PENDING/RUNNING) Execution for a node, if any (I5).
    async fn active_execution_for_node(&self, node_id: NodeId) -> Result<Option<Execution>, PollerError>;

    /// True iff any Execution bound to this OLT is PENDING/RUNNING (I6).
    async fn olt_is_busy(&self, olt_id: OltId) -> Result<bool, PollerError>;

    async fn set_execution_external_task_id(
        &self,
        id: ExecutionId,
        external_task_id: String,
    ) -> Result<(), PollerError>;

    async fn set_execution_status(
        &self,
        id: ExecutionId,
        status: ExecutionStatus,
        finished_at: Option<DateTime<Utc>>,
        duration_ms: Option<i64>,
        error_message: Option<String>,
    ) -> Result<(), PollerError>;

    async fn merge_execution_result_summary(
        &self,
        id: ExecutionId,
        merge: serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), PollerError>;

    /// Executions still PENDING with `created_at` older than `older_than`, for the janitor
    /// age-based sweep (§5).
    async fn list_stale_pending(&self, older_than: DateTime<Utc>) -> Result<Vec<Execution>, PollerError>;

    /// RUNNING executions, for the delivery checker's liveness re-validation (§1 ADDED).
    async fn list_running(&self) -> Result<Vec<Execution>, PollerError>;
}
