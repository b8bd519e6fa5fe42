//! Periodic repair sweep, outside the scheduler's hot loop (§5).
//!
//! Two independent passes: an age-based sweep that interrupts stale `PENDING` Executions
//! (§5, §6 `janitor_pending_max_age_seconds`), and a delivery checker that catches
//! Executions whose task id was accepted by the store but is no longer known to the
//! downstream runtime (submission silently dropped after the fact).

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::clock::Clock;
use crate::dispatcher::CompletionDispatcher;
use crate::model::ExecutionStatus;
use crate::runtime::ExecutionRuntime;
use crate::store::PollerStore;

pub struct Janitor {
    store: Arc<dyn PollerStore>,
    dispatcher: Arc<CompletionDispatcher>,
    runtime: Arc<dyn ExecutionRuntime>,
    clock: Arc<dyn Clock>,
    pending_max_age: Duration,
    delivery_check_grace: Duration,
}

impl Janitor {
    pub fn new(
        store: Arc<dyn PollerStore>,
        dispatcher: Arc<CompletionDispatcher>,
        runtime: Arc<dyn ExecutionRuntime>,
        clock: Arc<dyn Clock>,
        pending_max_age: Duration,
        delivery_check_grace: Duration,
    ) -> Self {
        Self {
            store,
            dispatcher,
            runtime,
            clock,
            pending_max_age,
            delivery_check_grace,
        }
    }

    /// Marks `PENDING` Executions older than `pending_max_age` as `INTERRUPTED`, a repair
    /// mechanism rather than a normal path (§5). This is *not* the same as exactly-once
    /// retry: the node's own `next_run_at` advance is what lets the system self-heal.
    pub async fn sweep_stale_pending(&self) {
        let cutoff = self.clock.now() - chrono::Duration::from_std(self.pending_max_age).unwrap();
        let stale = match self.store.list_stale_pending(cutoff).await {
            Ok(executions) => executions,
            Err(e) => {
                warn!(error = %e, "store unavailable during janitor sweep");
                return;
            }
        };

        for execution in stale {
            info!(execution_id = %execution.id, node_id = %execution.node_id, "interrupting stale pending execution");
            self.dispatcher
                .on_execution_terminal(execution.olt_id, execution.id, ExecutionStatus::Interrupted, 0)
                .await;
        }
    }

    /// Delivery check (§1 ADDED): a `PENDING` Execution that has an `external_task_id` but has
    /// aged past the grace period without the downstream runtime confirming the task is still
    /// live is an orphaned submission, treat it the same as a stale pending entry.
    pub async fn check_delivery(&self) {
        let cutoff = self.clock.now() - chrono::Duration::from_std(self.delivery_check_grace).unwrap();
        let candidates = match self.store.list_stale_pending(cutoff).await {
            Ok(executions) => executions,
            Err(e) => {
                warn!(error = %e, "store unavailable during delivery check");
                return;
            }
        };

        let submitted: Vec<_> = candidates
            .into_iter()
            .filter(|e| e.external_task_id.is_some())
            .collect();
        if submitted.is_empty() {
            return;
        }

        let active = match self.runtime.list_active_task_ids().await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(error = %e, "could not query downstream runtime for active task ids, skipping delivery check");
                return;
            }
        };

        for execution in submitted {
            let task_id = execution.external_task_id.as_deref().unwrap_or_default();
            if !active.contains(task_id) {
                warn!(execution_id = %execution.id, task_id, "pending execution's task id no longer known to the downstream runtime, marking interrupted");
                self.dispatcher
                    .on_execution_terminal(execution.olt_id, execution.id, ExecutionStatus::Interrupted, 0)
                    .await;
            }
        }
    }

    /// Runs both passes once; intended to be driven by a periodic background task
    /// (`poller-server`'s janitor loop, `Config::janitor_interval`).
    pub async fn run_once(&self) {
        self.sweep_stale_pending().await;
        self.check_delivery().await;
    }
}
