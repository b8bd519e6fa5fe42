//! In-memory `PollerStore`, used for tests and for `cargo run` without a configured
//! database (`poller-server`'s default): one `RwLock<Inner>` holding a `HashMap` per concern.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use poller_core::error::PollerError;
use poller_core::model::{Execution, ExecutionId, ExecutionStatus, NodeId, Olt, OltId, Workflow, WorkflowId, WorkflowNode};
use poller_core::store::PollerStore;

struct Inner {
    olts: HashMap<OltId, Olt>,
    workflows: HashMap<WorkflowId, Workflow>,
    nodes: HashMap<NodeId, WorkflowNode>,
    executions: HashMap<ExecutionId, Execution>,
}

/// In-memory implementation of `PollerStore`, suitable for single-replica deployments and
/// all of this workspace's own tests.
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                olts: HashMap::new(),
                workflows: HashMap::new(),
                nodes: HashMap::new(),
                executions: HashMap::new(),
            }),
        }
    }

    pub async fn put_olt(&self, olt: Olt) {
        self.inner.write().await.olts.insert(olt.id, olt);
    }

    pub async fn put_workflow(&self, workflow: Workflow) {
        self.inner.write().await.workflows.insert(workflow.id, workflow);
    }

    pub async fn put_node(&self, node: WorkflowNode) {
        self.inner.write().await.nodes.insert(node.id, node);
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PollerStore for MemoryStore {
    // ── OLT ──

    async fn get_olt(&self, id: OltId) -> Result<Option<Olt>, PollerError> {
        Ok(self.inner.read().await.olts.get(&id).cloned())
    }

    // ── Workflow ──

    async fn get_workflow(&self, id: WorkflowId) -> Result<Option<Workflow>, PollerError> {
        Ok(self.inner.read().await.workflows.get(&id).cloned())
    }

    // ── Workflow Node ──

    async fn get_node(&self, id: NodeId) -> Result<Option<WorkflowNode>, PollerError> {
        Ok(self.inner.read().await.nodes.get(&id).cloned())
    }

    async fn list_ready_masters(&self, now: DateTime<Utc>) -> Result<Vec<WorkflowNode>, PollerError> {
        let r = self.inner.read().await;
        Ok(r.nodes
            .values()
            .filter(|n| n.enabled && !n.is_chain_node && n.next_run_at.is_some_and(|t| t <= now))
            .filter(|n| {
                let workflow_active = r.workflows.get(&n.workflow_id).is_some_and(|w| w.active);
                let olt_pollable = r
                    .workflows
                    .get(&n.workflow_id)
                    .and_then(|w| r.olts.get(&w.olt_id))
                    .is_some_and(|o| o.is_pollable());
                workflow_active && olt_pollable
            })
            .cloned()
            .collect())
    }

    async fn list_chain_nodes(&self, master_id: NodeId) -> Result<Vec<WorkflowNode>, PollerError> {
        let r = self.inner.read().await;
        let mut chain: Vec<WorkflowNode> = r
            .nodes
            .values()
            .filter(|n| n.enabled && n.is_chain_node && n.master_node == Some(master_id))
            .cloned()
            .collect();
        chain.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.0.cmp(&b.id.0)));
        Ok(chain)
    }

    async fn list_unscheduled_masters(&self) -> Result<Vec<WorkflowNode>, PollerError> {
        let r = self.inner.read().await;
        Ok(r.nodes
            .values()
            .filter(|n| n.enabled && !n.is_chain_node && n.next_run_at.is_none())
            .cloned()
            .collect())
    }

    async fn set_node_next_run_at(&self, id: NodeId, next_run_at: DateTime<Utc>) -> Result<(), PollerError> {
        let mut w = self.inner.write().await;
        if let Some(node) = w.nodes.get_mut(&id) {
            node.next_run_at = Some(next_run_at);
        }
        Ok(())
    }

    async fn record_node_completion(
        &self,
        id: NodeId,
        now: DateTime<Utc>,
        succeeded: bool,
        advance_next_run_at: Option<DateTime<Utc>>,
    ) -> Result<(), PollerError> {
        let mut w = self.inner.write().await;
        if let Some(node) = w.nodes.get_mut(&id) {
            node.last_run_at = Some(now);
            if succeeded {
                node.last_success_at = Some(now);
            } else {
                node.last_failure_at = Some(now);
            }
            if let Some(next) = advance_next_run_at {
                node.next_run_at = Some(next);
            }
        }
        Ok(())
    }

    // ── Execution ──

    async fn create_execution(&self, execution: Execution) -> Result<(), PollerError> {
        self.inner.write().await.executions.insert(execution.id, execution);
        Ok(())
    }

    async fn get_execution(&self, id: ExecutionId) -> Result<Option<Execution>, PollerError> {
        Ok(self.inner.read().await.executions.get(&id).cloned())
    }

    async fn active_execution_for_node(&self, node_id: NodeId) -> Result<Option<Execution>, PollerError> {
        let r = self.inner.read().await;
        Ok(r.executions
            .values()
            .find(|e| e.node_id == node_id && e.status.is_active())
            .cloned())
    }

    async fn olt_is_busy(&self, olt_id: OltId) -> Result<bool, PollerError> {
        let r = self.inner.read().await;
        Ok(r.executions.values().any(|e| e.olt_id == olt_id && e.status.is_active()))
    }

    async fn set_execution_external_task_id(&self, id: ExecutionId, external_task_id: String) -> Result<(), PollerError> {
        let mut w = self.inner.write().await;
        if let Some(e) = w.executions.get_mut(&id) {
            e.external_task_id = Some(external_task_id);
        }
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
        let mut w = self.inner.write().await;
        if let Some(e) = w.executions.get_mut(&id) {
            e.status = status;
            e.finished_at = finished_at;
            e.duration_ms = duration_ms;
            if error_message.is_some() {
                e.error_message = error_message;
            }
        }
        Ok(())
    }

    async fn merge_execution_result_summary(
        &self,
        id: ExecutionId,
        merge: serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), PollerError> {
        let mut w = self.inner.write().await;
        if let Some(e) = w.executions.get_mut(&id) {
            e.result_summary.extend(merge);
        }
        Ok(())
    }

    async fn list_stale_pending(&self, older_than: DateTime<Utc>) -> Result<Vec<Execution>, PollerError> {
        let r = self.inner.read().await;
        Ok(r.executions
            .values()
            .filter(|e| e.status == ExecutionStatus::Pending && e.created_at < older_than)
            .cloned()
            .collect())
    }

    async fn list_running(&self) -> Result<Vec<Execution>, PollerError> {
        let r = self.inner.read().await;
        Ok(r.executions.values().filter(|e| e.status == ExecutionStatus::Running).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use poller_core::model::JobType;

    fn make_olt(id: OltId) -> Olt {
        Olt {
            id,
            short_name: "olt-1".to_string(),
            ip: "10.0.0.1".to_string(),
            community: "public".to_string(),
            brand: "huawei".to_string(),
            model: "MA5800".to_string(),
            enabled: true,
            soft_deleted: false,
        }
    }

    fn make_master(id: NodeId, workflow_id: WorkflowId, next_run_at: Option<DateTime<Utc>>) -> WorkflowNode {
        WorkflowNode {
            id,
            workflow_id,
            name: "discover-onus".to_string(),
            key: "discover-onus".to_string(),
            enabled: true,
            is_chain_node: false,
            master_node: None,
            interval_seconds: Some(300),
            priority: 90,
            next_run_at,
            last_run_at: None,
            last_success_at: None,
            last_failure_at: None,
            espacio: "descubrimiento".to_string(),
        }
    }

    #[tokio::test]
    async fn olt_workflow_node_round_trip() {
        let store = MemoryStore::new();
        let olt_id = OltId::new();
        let workflow_id = WorkflowId::new();
        let node_id = NodeId::new();

        store.put_olt(make_olt(olt_id)).await;
        store
            .put_workflow(Workflow { id: workflow_id, olt_id, active: true })
            .await;
        store.put_node(make_master(node_id, workflow_id, None)).await;

        assert!(store.get_olt(olt_id).await.unwrap().is_some());
        assert!(store.get_workflow(workflow_id).await.unwrap().unwrap().active);
        assert_eq!(store.get_node(node_id).await.unwrap().unwrap().id, node_id);
    }

    #[tokio::test]
    async fn list_ready_masters_filters_on_next_run_at() {
        let store = MemoryStore::new();
        let olt_id = OltId::new();
        let workflow_id = WorkflowId::new();
        let now = Utc::now();

        store.put_olt(make_olt(olt_id)).await;
        store
            .put_workflow(Workflow { id: workflow_id, olt_id, active: true })
            .await;

        let due = make_master(NodeId::new(), workflow_id, Some(now - chrono::Duration::seconds(1)));
        let not_due = make_master(NodeId::new(), workflow_id, Some(now + chrono::Duration::seconds(60)));
        let unscheduled = make_master(NodeId::new(), workflow_id, None);

        store.put_node(due.clone()).await;
        store.put_node(not_due).await;
        store.put_node(unscheduled.clone()).await;

        let ready = store.list_ready_masters(now).await.unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].id, due.id);

        let unscheduled_list = store.list_unscheduled_masters().await.unwrap();
        assert_eq!(unscheduled_list.len(), 1);
        assert_eq!(unscheduled_list[0].id, unscheduled.id);
    }

    #[tokio::test]
    async fn list_ready_masters_excludes_inactive_workflow_and_disabled_olt() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let due_at = Some(now - chrono::Duration::seconds(1));

        let active_olt = OltId::new();
        let active_workflow = WorkflowId::new();
        store.put_olt(make_olt(active_olt)).await;
        store
            .put_workflow(Workflow { id: active_workflow, olt_id: active_olt, active: true })
            .await;
        let eligible = make_master(NodeId::new(), active_workflow, due_at);
        store.put_node(eligible.clone()).await;

        let inactive_workflow_olt = OltId::new();
        let inactive_workflow = WorkflowId::new();
        store.put_olt(make_olt(inactive_workflow_olt)).await;
        store
            .put_workflow(Workflow { id: inactive_workflow, olt_id: inactive_workflow_olt, active: false })
            .await;
        store
            .put_node(make_master(NodeId::new(), inactive_workflow, due_at))
            .await;

        let disabled_olt = OltId::new();
        let disabled_olt_workflow = WorkflowId::new();
        let mut olt = make_olt(disabled_olt);
        olt.enabled = false;
        store.put_olt(olt).await;
        store
            .put_workflow(Workflow { id: disabled_olt_workflow, olt_id: disabled_olt, active: true })
            .await;
        store
            .put_node(make_master(NodeId::new(), disabled_olt_workflow, due_at))
            .await;

        let soft_deleted_olt = OltId::new();
        let soft_deleted_workflow = WorkflowId::new();
        let mut olt = make_olt(soft_deleted_olt);
        olt.soft_deleted = true;
        store.put_olt(olt).await;
        store
            .put_workflow(Workflow { id: soft_deleted_workflow, olt_id: soft_deleted_olt, active: true })
            .await;
        store
            .put_node(make_master(NodeId::new(), soft_deleted_workflow, due_at))
            .await;

        let ready = store.list_ready_masters(now).await.unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].id, eligible.id);
    }

    #[tokio::test]
    async fn active_execution_for_node_reflects_status() {
        let store = MemoryStore::new();
        let node_id = NodeId::new();
        let olt_id = OltId::new();

        let execution = Execution::new_pending(node_id, olt_id, JobType::Discovery, Utc::now());
        let execution_id = execution.id;
        store.create_execution(execution).await.unwrap();

        assert!(store.active_execution_for_node(node_id).await.unwrap().is_some());
        assert!(store.olt_is_busy(olt_id).await.unwrap());

        store
            .set_execution_status(execution_id, ExecutionStatus::Success, Some(Utc::now()), Some(120), None)
            .await
            .unwrap();

        assert!(store.active_execution_for_node(node_id).await.unwrap().is_none());
        assert!(!store.olt_is_busy(olt_id).await.unwrap());
    }
}
