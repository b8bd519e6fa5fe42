//! The atomic unit the scheduler and dispatcher reason about: a master node plus its
//! ordered chain, bound to one workflow and OLT (§3, §4.C).

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::clock::Clock;
use crate::error::PollerError;
use crate::lock::DistributedLock;
use crate::model::{Execution, Olt, Workflow, WorkflowNode};
use crate::runtime::ExecutionRuntime;
use crate::store::PollerStore;

/// Lock TTL for `exec:workflow_node:<id>` (§4.G, §6 config `node_lock_ttl_seconds`).
pub const NODE_LOCK_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct CompositeNode {
    pub master: WorkflowNode,
    pub chain: Vec<WorkflowNode>,
    pub workflow: Workflow,
    pub olt: Olt,
    pub delayed: bool,
    pub delay_time: i64,
}

/// Result of [`CompositeNode::dispatch_master`] (§9 redesign flag: a sum type in place of
/// exception-based idempotence control flow).
pub enum DispatchOutcome {
    Dispatched(Execution),
    AlreadyRunning(Execution),
    Rejected(PollerError),
}

impl CompositeNode {
    pub fn new(master: WorkflowNode, chain: Vec<WorkflowNode>, workflow: Workflow, olt: Olt) -> Self {
        Self {
            master,
            chain,
            workflow,
            olt,
            delayed: false,
            delay_time: 0,
        }
    }

    /// Priority copied from the master (§3 Composite Node).
    pub fn priority(&self) -> i32 {
        self.master.priority
    }

    /// §4.C: sets `delay_time`/`delayed` from `master.next_run_at` vs `now`.
    pub fn calculate_delay(&mut self, now: DateTime<Utc>) {
        let Some(next_run_at) = self.master.next_run_at else {
            self.delay_time = 0;
            self.delayed = false;
            return;
        };
        if next_run_at < now {
            let delay_time = (now - next_run_at).num_seconds();
            let interval = self.master.interval_seconds.unwrap_or(300);
            self.delay_time = delay_time;
            self.delayed = delay_time > interval;
        } else {
            self.delay_time = 0;
            self.delayed = false;
        }
    }

    /// §4.C precondition (a): OLT enabled, workflow active, node enabled. Chain-dispatch
    /// callers skip the `next_run_at`/template-active checks entirely: they never call
    /// this on anything but the node about to be dispatched.
    pub fn node_can_execute_now(olt: &Olt, workflow: &Workflow, node: &WorkflowNode) -> bool {
        olt.is_pollable() && workflow.active && node.enabled
    }

    /// Dispatches `node` (the master, or a chain node from the completion dispatcher)
    /// through the full protocol of §4.C: precondition check, distributed lock acquire,
    /// double-checked active-execution lookup, Execution creation, downstream submission.
    pub async fn dispatch_node(
        olt: &Olt,
        workflow: &Workflow,
        node: &WorkflowNode,
        store: &dyn PollerStore,
        lock: Arc<dyn DistributedLock>,
        runtime: &dyn ExecutionRuntime,
        clock: &dyn Clock,
    ) -> DispatchOutcome {
        if !Self::node_can_execute_now(olt, workflow, node) {
            return DispatchOutcome::Rejected(PollerError::PreconditionViolation {
                node_id: node.id,
                reason: "olt disabled, workflow inactive, or node disabled".to_string(),
            });
        }

        match store.active_execution_for_node(node.id).await {
            Ok(Some(existing)) => return DispatchOutcome::AlreadyRunning(existing),
            Ok(None) => {}
            Err(e) => return DispatchOutcome::Rejected(e),
        }

        let lock_key = format!("exec:workflow_node:{}", node.id);
        let guard = match lock.try_acquire(&lock_key, NODE_LOCK_TTL).await {
            Ok(Some(guard)) => guard,
            Ok(None) => {
                return match store.active_execution_for_node(node.id).await {
                    Ok(Some(existing)) => DispatchOutcome::AlreadyRunning(existing),
                    Ok(None) => DispatchOutcome::Rejected(PollerError::LockUnavailable { key: lock_key }),
                    Err(e) => DispatchOutcome::Rejected(e),
                };
            }
            Err(e) => return DispatchOutcome::Rejected(e),
        };

        match store.active_execution_for_node(node.id).await {
            Ok(Some(existing)) => {
                guard.release().await;
                return DispatchOutcome::AlreadyRunning(existing);
            }
            Ok(None) => {}
            Err(e) => {
                guard.release().await;
                return DispatchOutcome::Rejected(e);
            }
        }

        let job_type = node.job_type();
        let execution = Execution::new_pending(node.id, olt.id, job_type, clock.now());

        if let Err(e) = store.create_execution(execution.clone()).await {
            guard.release().await;
            return DispatchOutcome::Rejected(e);
        }

        match runtime.submit(job_type, node.id, olt.id, execution.id).await {
            Ok(external_task_id) => {
                if let Err(e) = store
                    .set_execution_external_task_id(execution.id, external_task_id)
                    .await
                {
                    warn!(node_id = %node.id, error = %e, "failed to persist external task id");
                }
                guard.release().await;
                info!(node_id = %node.id, execution_id = %execution.id, olt_id = %olt.id, "dispatched");
                DispatchOutcome::Dispatched(execution)
            }
            Err(e) => {
                let message = e.to_string();
                if let Err(store_err) = store
                    .set_execution_status(
                        execution.id,
                        crate::model::ExecutionStatus::Failed,
                        Some(clock.now()),
                        Some(0),
                        Some(message.clone()),
                    )
                    .await
                {
                    warn!(node_id = %node.id, error = %store_err, "failed to mark execution failed");
                }
                guard.release().await;
                DispatchOutcome::Rejected(PollerError::DownstreamSubmissionFailed {
                    execution_id: execution.id,
                    source: anyhow::anyhow!(message),
                })
            }
        }
    }

    /// Convenience entry point for the worker slot: dispatches `self.master`. Chain nodes
    /// are never dispatched through this method, only the completion dispatcher starts them.
    pub async fn dispatch_master(
        &self,
        store: &dyn PollerStore,
        lock: Arc<dyn DistributedLock>,
        runtime: &dyn ExecutionRuntime,
        clock: &dyn Clock,
    ) -> DispatchOutcome {
        Self::dispatch_node(&self.olt, &self.workflow, &self.master, store, lock, runtime, clock).await
    }
}
