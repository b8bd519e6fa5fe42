//! Downstream execution runtime port (§6): the external task queue that actually performs
//! SNMP I/O. The core only ever submits and waits for a callback; it never blocks on the
//! network round-trip itself (§5).

use std::collections::HashSet;

use async_trait::async_trait;

use crate::error::PollerError;
use crate::model::{ExecutionId, JobType, NodeId, OltId};

#[async_trait]
pub trait ExecutionRuntime: Send + Sync {
    /// Submits a job for asynchronous execution, returning an opaque external task id that
    /// is stashed on the Execution for provenance/cancellation.
    async fn submit(
        &self,
        job_type: JobType,
        node_id: NodeId,
        olt_id: OltId,
        execution_id: ExecutionId,
    ) -> Result<String, PollerError>;

    /// External task ids the runtime currently considers live (submitted but not yet
    /// terminal). Used by the janitor's delivery check to tell an orphaned submission (task id
    /// present, but the runtime no longer knows about it) from one that is still in flight.
    async fn list_active_task_ids(&self) -> Result<HashSet<String>, PollerError>;
}
