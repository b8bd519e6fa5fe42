//! Postgres-backed `PollerStore`: raw `sqlx::query` (no compile-time `query!` macro, since
//! this crate doesn't assume a live database at build time) plus `sqlx::migrate!` for
//! schema management.

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;

use poller_core::error::PollerError;
use poller_core::model::{
    Execution, ExecutionId, ExecutionStatus, JobType, NodeId, Olt, OltId, Workflow, WorkflowId, WorkflowNode,
};
use poller_core::store::PollerStore;

fn status_to_str(status: ExecutionStatus) -> &'static str {
    match status {
        ExecutionStatus::Pending => "PENDING",
        ExecutionStatus::Running => "RUNNING",
        ExecutionStatus::Success => "SUCCESS",
        ExecutionStatus::Failed => "FAILED",
        ExecutionStatus::Interrupted => "INTERRUPTED",
    }
}

fn status_from_str(s: &str) -> anyhow::Result<ExecutionStatus> {
    Ok(match s {
        "PENDING" => ExecutionStatus::Pending,
        "RUNNING" => ExecutionStatus::Running,
        "SUCCESS" => ExecutionStatus::Success,
        "FAILED" => ExecutionStatus::Failed,
        "INTERRUPTED" => ExecutionStatus::Interrupted,
        other => return Err(anyhow!("unknown execution status {other}")),
    })
}

fn job_type_to_str(job_type: JobType) -> &'static str {
    job_type.as_str()
}

fn store_err(e: impl Into<anyhow::Error>) -> PollerError {
    PollerError::StoreUnavailable(e.into())
}

fn olt_from_row(row: &sqlx::postgres::PgRow) -> Result<Olt, PollerError> {
    Ok(Olt {
        id: OltId(row.get("id")),
        short_name: row.get("short_name"),
        ip: row.get("ip"),
        community: row.get("community"),
        brand: row.get("brand"),
        model: row.get("model"),
        enabled: row.get("enabled"),
        soft_deleted: row.get("soft_deleted"),
    })
}

fn node_from_row(row: &sqlx::postgres::PgRow) -> Result<WorkflowNode, PollerError> {
    Ok(WorkflowNode {
        id: NodeId(row.get("id")),
        workflow_id: WorkflowId(row.get("workflow_id")),
        name: row.get("name"),
        key: row.get("key"),
        enabled: row.get("enabled"),
        is_chain_node: row.get("is_chain_node"),
        master_node: row.get::<Option<uuid::Uuid>, _>("master_node").map(NodeId),
        interval_seconds: row.get("interval_seconds"),
        priority: row.get("priority"),
        next_run_at: row.get("next_run_at"),
        last_run_at: row.get("last_run_at"),
        last_success_at: row.get("last_success_at"),
        last_failure_at: row.get("last_failure_at"),
        espacio: row.get("espacio"),
    })
}

fn execution_from_row(row: &sqlx::postgres::PgRow) -> Result<Execution, PollerError> {
    let status_str: String = row.get("status");
    let job_type_str: String = row.get("job_type");
    let result_summary: serde_json::Value = row.get("result_summary");
    Ok(Execution {
        id: ExecutionId(row.get("id")),
        node_id: NodeId(row.get("node_id")),
        olt_id: OltId(row.get("olt_id")),
        job_type: JobType::from_espacio(&job_type_str),
        status: status_from_str(&status_str).map_err(store_err)?,
        created_at: row.get("created_at"),
        started_at: row.get("started_at"),
        finished_at: row.get("finished_at"),
        duration_ms: row.get("duration_ms"),
        external_task_id: row.get("external_task_id"),
        error_message: row.get("error_message"),
        result_summary: match result_summary {
            serde_json::Value::Object(map) => map,
            _ => serde_json::Map::new(),
        },
    })
}

/// PostgreSQL-backed implementation of `PollerStore`.
pub struct PostgresStore {
    pool: sqlx::PgPool,
}

impl PostgresStore {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    /// Run embedded migrations.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run poller-store migrations")?;
        Ok(())
    }
}

#[async_trait]
impl PollerStore for PostgresStore {
    async fn get_olt(&self, id: OltId) -> Result<Option<Olt>, PollerError> {
        let row = sqlx::query("SELECT * FROM olts WHERE id = $1")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        row.as_ref().map(olt_from_row).transpose()
    }

    async fn get_workflow(&self, id: WorkflowId) -> Result<Option<Workflow>, PollerError> {
        let row = sqlx::query("SELECT id, olt_id, active FROM workflows WHERE id = $1")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(row.map(|r| Workflow {
            id: WorkflowId(r.get("id")),
            olt_id: OltId(r.get("olt_id")),
            active: r.get("active"),
        }))
    }

    async fn get_node(&self, id: NodeId) -> Result<Option<WorkflowNode>, PollerError> {
        let row = sqlx::query("SELECT * FROM workflow_nodes WHERE id = $1")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        row.as_ref().map(node_from_row).transpose()
    }

    async fn list_ready_masters(&self, now: DateTime<Utc>) -> Result<Vec<WorkflowNode>, PollerError> {
        let rows = sqlx::query(
            "SELECT wn.* FROM workflow_nodes wn \
             JOIN workflows w ON w.id = wn.workflow_id \
             JOIN olts o ON o.id = w.olt_id \
             WHERE wn.enabled AND NOT wn.is_chain_node AND wn.next_run_at IS NOT NULL \
               AND wn.next_run_at <= $1 AND w.active AND o.enabled AND NOT o.soft_deleted",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        rows.iter().map(node_from_row).collect()
    }

    async fn list_chain_nodes(&self, master_id: NodeId) -> Result<Vec<WorkflowNode>, PollerError> {
        let rows = sqlx::query(
            "SELECT * FROM workflow_nodes WHERE master_node = $1 AND is_chain_node AND enabled \
             ORDER BY priority DESC, id ASC",
        )
        .bind(master_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        rows.iter().map(node_from_row).collect()
    }

    async fn list_unscheduled_masters(&self) -> Result<Vec<WorkflowNode>, PollerError> {
        let rows = sqlx::query(
            "SELECT * FROM workflow_nodes WHERE enabled AND NOT is_chain_node AND next_run_at IS NULL",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        rows.iter().map(node_from_row).collect()
    }

    async fn set_node_next_run_at(&self, id: NodeId, next_run_at: DateTime<Utc>) -> Result<(), PollerError> {
        sqlx::query("UPDATE workflow_nodes SET next_run_at = $1 WHERE id = $2")
            .bind(next_run_at)
            .bind(id.0)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn record_node_completion(
        &self,
        id: NodeId,
        now: DateTime<Utc>,
        succeeded: bool,
        advance_next_run_at: Option<DateTime<Utc>>,
    ) -> Result<(), PollerError> {
        sqlx::query(
            "UPDATE workflow_nodes SET \
                last_run_at = $1, \
                last_success_at = CASE WHEN $2 THEN $1 ELSE last_success_at END, \
                last_failure_at = CASE WHEN NOT $2 THEN $1 ELSE last_failure_at END, \
                next_run_at = COALESCE($3, next_run_at) \
             WHERE id = $4",
        )
        .bind(now)
        .bind(succeeded)
        .bind(advance_next_run_at)
        .bind(id.0)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn create_execution(&self, execution: Execution) -> Result<(), PollerError> {
        sqlx::query(
            "INSERT INTO executions \
                (id, node_id, olt_id, job_type, status, created_at, started_at, finished_at, \
                 duration_ms, external_task_id, error_message, result_summary) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
        )
        .bind(execution.id.0)
        .bind(execution.node_id.0)
        .bind(execution.olt_id.0)
        .bind(job_type_to_str(execution.job_type))
        .bind(status_to_str(execution.status))
        .bind(execution.created_at)
        .bind(execution.started_at)
        .bind(execution.finished_at)
        .bind(execution.duration_ms)
        .bind(execution.external_task_id)
        .bind(execution.error_message)
        .bind(serde_json::Value::Object(execution.result_summary))
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn get_execution(&self, id: ExecutionId) -> Result<Option<Execution>, PollerError> {
        let row = sqlx::query("SELECT * FROM executions WHERE id = $1")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        row.as_ref().map(execution_from_row).transpose()
    }

    async fn active_execution_for_node(&self, node_id: NodeId) -> Result<Option<Execution>, PollerError> {
        let row = sqlx::query(
            "SELECT * FROM executions WHERE node_id = $1 AND status IN ('PENDING', 'RUNNING') LIMIT 1",
        )
        .bind(node_id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;
        row.as_ref().map(execution_from_row).transpose()
    }

    async fn olt_is_busy(&self, olt_id: OltId) -> Result<bool, PollerError> {
        let row = sqlx::query(
            "SELECT EXISTS(SELECT 1 FROM executions WHERE olt_id = $1 AND status IN ('PENDING', 'RUNNING')) AS busy",
        )
        .bind(olt_id.0)
        .fetch_one(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(row.get("busy"))
    }

    async fn set_execution_external_task_id(&self, id: ExecutionId, external_task_id: String) -> Result<(), PollerError> {
        sqlx::query("UPDATE executions SET external_task_id = $1 WHERE id = $2")
            .bind(external_task_id)
            .bind(id.0)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn set_execution_status(
        &self,
        id: ExecutionId,
        status: ExecutionStatus,
        finished_at: Option<DateTime<Utc>>,
        duration_ms: Option<i64>,
        error_message: Option<String>,
    ) -> Result<(), PollerError> {
        sqlx::query(
            "UPDATE executions SET status = $1, finished_at = COALESCE($2, finished_at), \
             duration_ms = COALESCE($3, duration_ms), \
             error_message = COALESCE($4, error_message) \
             WHERE id = $5",
        )
        .bind(status_to_str(status))
        .bind(finished_at)
        .bind(duration_ms)
        .bind(error_message)
        .bind(id.0)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn merge_execution_result_summary(
        &self,
        id: ExecutionId,
        merge: serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), PollerError> {
        sqlx::query("UPDATE executions SET result_summary = result_summary || $1 WHERE id = $2")
            .bind(serde_json::Value::Object(merge))
            .bind(id.0)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn list_stale_pending(&self, older_than: DateTime<Utc>) -> Result<Vec<Execution>, PollerError> {
        let rows = sqlx::query("SELECT * FROM executions WHERE status = 'PENDING' AND created_at < $1")
            .bind(older_than)
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;
        rows.iter().map(execution_from_row).collect()
    }

    async fn list_running(&self) -> Result<Vec<Execution>, PollerError> {
        let rows = sqlx::query("SELECT * FROM executions WHERE status = 'RUNNING'")
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;
        rows.iter().map(execution_from_row).collect()
    }
}
