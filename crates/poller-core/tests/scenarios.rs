//! End-to-end scenario tests (§8 S1-S6) against an in-memory store, an in-memory lock, and a
//! fake execution runtime. The scheduler tick hands work to the pool asynchronously
//! (`tokio::spawn` inside `WorkerPool::assign`), so tests poll briefly for the expected state
//! rather than asserting immediately after calling `tick()`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use poller_core::clock::{Clock, FakeClock};
use poller_core::config::Config;
use poller_core::dispatcher::CompletionDispatcher;
use poller_core::error::PollerError;
use poller_core::lock::InMemoryLock;
use poller_core::model::{
    Execution, ExecutionId, ExecutionStatus, JobType, NodeId, Olt, OltId, Workflow, WorkflowId, WorkflowNode,
};
use poller_core::pool::WorkerPool;
use poller_core::runtime::ExecutionRuntime;
use poller_core::scheduler::SchedulerTick;
use poller_core::store::PollerStore;

#[derive(Default)]
struct TestStoreInner {
    olts: HashMap<OltId, Olt>,
    workflows: HashMap<WorkflowId, Workflow>,
    nodes: HashMap<NodeId, WorkflowNode>,
    executions: HashMap<ExecutionId, Execution>,
}

struct TestStore {
    inner: Mutex<TestStoreInner>,
}

impl TestStore {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(TestStoreInner::default()),
        })
    }

    fn add_olt(&self, olt: Olt) {
        self.inner.lock().unwrap().olts.insert(olt.id, olt);
    }

    fn add_workflow(&self, wf: Workflow) {
        self.inner.lock().unwrap().workflows.insert(wf.id, wf);
    }

    fn add_node(&self, node: WorkflowNode) {
        self.inner.lock().unwrap().nodes.insert(node.id, node);
    }

    fn disable_olt(&self, olt_id: OltId) {
        if let Some(olt) = self.inner.lock().unwrap().olts.get_mut(&olt_id) {
            olt.enabled = false;
        }
    }

    fn node(&self, id: NodeId) -> WorkflowNode {
        self.inner.lock().unwrap().nodes.get(&id).cloned().unwrap()
    }

    fn executions_for_node(&self, id: NodeId) -> Vec<Execution> {
        self.inner
            .lock()
            .unwrap()
            .executions
            .values()
            .filter(|e| e.node_id == id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl PollerStore for TestStore {
    async fn get_olt(&self, id: OltId) -> Result<Option<Olt>, PollerError> {
        Ok(self.inner.lock().unwrap().olts.get(&id).cloned())
    }

    async fn get_workflow(&self, id: WorkflowId) -> Result<Option<Workflow>, PollerError> {
        Ok(self.inner.lock().unwrap().workflows.get(&id).cloned())
    }

    async fn get_node(&self, id: NodeId) -> Result<Option<WorkflowNode>, PollerError> {
        Ok(self.inner.lock().unwrap().nodes.get(&id).cloned())
    }

    async fn list_ready_masters(&self, now: DateTime<Utc>) -> Result<Vec<WorkflowNode>, PollerError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .nodes
            .values()
            .filter(|n| n.enabled && !n.is_chain_node && n.next_run_at.is_some_and(|t| t <= now))
            .cloned()
            .collect())
    }

    async fn list_chain_nodes(&self, master_id: NodeId) -> Result<Vec<WorkflowNode>, PollerError> {
        let mut chain: Vec<WorkflowNode> = self
            .inner
            .lock()
            .unwrap()
            .nodes
            .values()
            .filter(|n| n.enabled && n.is_chain_node && n.master_node == Some(master_id))
            .cloned()
            .collect();
        chain.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.0.cmp(&b.id.0)));
        Ok(chain)
    }

    async fn list_unscheduled_masters(&self) -> Result<Vec<WorkflowNode>, PollerError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .nodes
            .values()
            .filter(|n| n.enabled && !n.is_chain_node && n.next_run_at.is_none())
            .cloned()
            .collect())
    }

    async fn set_node_next_run_at(&self, id: NodeId, next_run_at: DateTime<Utc>) -> Result<(), PollerError> {
        if let Some(node) = self.inner.lock().unwrap().nodes.get_mut(&id) {
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
        if let Some(node) = self.inner.lock().unwrap().nodes.get_mut(&id) {
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

    async fn create_execution(&self, execution: Execution) -> Result<(), PollerError> {
        self.inner.lock().unwrap().executions.insert(execution.id, execution);
        Ok(())
    }

    async fn get_execution(&self, id: ExecutionId) -> Result<Option<Execution>, PollerError> {
        Ok(self.inner.lock().unwrap().executions.get(&id).cloned())
    }

    async fn active_execution_for_node(&self, node_id: NodeId) -> Result<Option<Execution>, PollerError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .executions
            .values()
            .find(|e| e.node_id == node_id && e.status.is_active())
            .cloned())
    }

    async fn olt_is_busy(&self, olt_id: OltId) -> Result<bool, PollerError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .executions
            .values()
            .any(|e| e.olt_id == olt_id && e.status.is_active()))
    }

    async fn set_execution_external_task_id(&self, id: ExecutionId, external_task_id: String) -> Result<(), PollerError> {
        if let Some(e) = self.inner.lock().unwrap().executions.get_mut(&id) {
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
        if let Some(e) = self.inner.lock().unwrap().executions.get_mut(&id) {
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
        if let Some(e) = self.inner.lock().unwrap().executions.get_mut(&id) {
            e.result_summary.extend(merge);
        }
        Ok(())
    }

    async fn list_stale_pending(&self, older_than: DateTime<Utc>) -> Result<Vec<Execution>, PollerError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .executions
            .values()
            .filter(|e| e.status == ExecutionStatus::Pending && e.created_at < older_than)
            .cloned()
            .collect())
    }

    async fn list_running(&self) -> Result<Vec<Execution>, PollerError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .executions
            .values()
            .filter(|e| e.status == ExecutionStatus::Running)
            .cloned()
            .collect())
    }
}

struct FakeRuntime {
    submissions: AtomicUsize,
}

impl FakeRuntime {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            submissions: AtomicUsize::new(0),
        })
    }

    fn submission_count(&self) -> usize {
        self.submissions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExecutionRuntime for FakeRuntime {
    async fn submit(
        &self,
        _job_type: JobType,
        _node_id: NodeId,
        _olt_id: OltId,
        execution_id: ExecutionId,
    ) -> Result<String, PollerError> {
        self.submissions.fetch_add(1, Ordering::SeqCst);
        Ok(format!("task-{execution_id}"))
    }

    async fn list_active_task_ids(&self) -> Result<std::collections::HashSet<String>, PollerError> {
        Ok(std::collections::HashSet::new())
    }
}

fn make_olt(enabled: bool) -> Olt {
    Olt {
        id: OltId::new(),
        short_name: "OLT-A".to_string(),
        ip: "10.0.0.1".to_string(),
        community: "public".to_string(),
        brand: "Huawei".to_string(),
        model: "MA5800".to_string(),
        enabled,
        soft_deleted: false,
    }
}

fn make_master(workflow_id: WorkflowId, priority: i32, espacio: &str, next_run_at: Option<DateTime<Utc>>) -> WorkflowNode {
    WorkflowNode {
        id: NodeId::new(),
        workflow_id,
        name: "master".to_string(),
        key: "master".to_string(),
        enabled: true,
        is_chain_node: false,
        master_node: None,
        interval_seconds: Some(300),
        priority,
        next_run_at,
        last_run_at: None,
        last_success_at: None,
        last_failure_at: None,
        espacio: espacio.to_string(),
    }
}

fn make_chain_node(workflow_id: WorkflowId, master_id: NodeId, priority: i32) -> WorkflowNode {
    WorkflowNode {
        id: NodeId::new(),
        workflow_id,
        name: format!("chain-{priority}"),
        key: format!("chain-{priority}"),
        enabled: true,
        is_chain_node: true,
        master_node: Some(master_id),
        interval_seconds: None,
        priority,
        next_run_at: None,
        last_run_at: None,
        last_success_at: None,
        last_failure_at: None,
        espacio: "get".to_string(),
    }
}

async fn wait_until<F: Fn() -> bool>(predicate: F, timeout: Duration) {
    let start = std::time::Instant::now();
    while !predicate() {
        if start.elapsed() > timeout {
            panic!("condition not met within timeout");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

struct Harness {
    store: Arc<TestStore>,
    pool: Arc<WorkerPool>,
    scheduler: SchedulerTick,
    dispatcher: Arc<CompletionDispatcher>,
    clock: Arc<FakeClock>,
    runtime: Arc<FakeRuntime>,
}

fn build_harness(pool_size: usize) -> Harness {
    let store = TestStore::new();
    let lock = InMemoryLock::new();
    let runtime = FakeRuntime::new();
    let clock: Arc<FakeClock> = Arc::new(FakeClock::new(Utc::now()));

    let pool = WorkerPool::new(pool_size, 1000, store.clone(), lock.clone(), runtime.clone(), clock.clone());
    let scheduler = SchedulerTick::new(store.clone(), pool.clone(), clock.clone(), Config::default());
    let dispatcher = Arc::new(CompletionDispatcher::new(store.clone(), pool.clone(), lock.clone(), clock.clone()));

    Harness {
        store,
        pool,
        scheduler,
        dispatcher,
        clock,
        runtime,
    }
}

/// S1: single ready discovery master.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn single_ready_discovery_master_completes_and_reschedules() {
    let h = build_harness(10);
    let olt = make_olt(true);
    let workflow = Workflow {
        id: WorkflowId::new(),
        olt_id: olt.id,
        active: true,
    };
    let master = make_master(workflow.id, 90, "descubrimiento", Some(h.clock.now() - chrono::Duration::seconds(1)));
    let master_id = master.id;

    h.store.add_olt(olt.clone());
    h.store.add_workflow(workflow);
    h.store.add_node(master);

    h.scheduler.tick().await;

    wait_until(|| h.store.executions_for_node(master_id).len() == 1, Duration::from_secs(2)).await;
    assert_eq!(h.runtime.submission_count(), 1);

    let execution = h.store.executions_for_node(master_id).into_iter().next().unwrap();
    let completed_at = h.clock.now();
    h.dispatcher
        .on_execution_terminal(olt.id, execution.id, ExecutionStatus::Success, 1200)
        .await;

    let node_after = h.store.node(master_id);
    let next_run_at = node_after.next_run_at.expect("master should be rescheduled");
    assert_eq!(next_run_at, completed_at + chrono::Duration::seconds(300));

    let stats = h.pool.stats().await;
    assert_eq!(stats.total_tasks_completed, 1);
}

/// S2: master with three chain nodes, dispatched one at a time, never overlapping.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn chain_nodes_run_strictly_in_order() {
    let h = build_harness(10);
    let olt = make_olt(true);
    let workflow = Workflow {
        id: WorkflowId::new(),
        olt_id: olt.id,
        active: true,
    };
    let master = make_master(workflow.id, 90, "get", Some(h.clock.now() - chrono::Duration::seconds(1)));
    let master_id = master.id;
    let c1 = make_chain_node(workflow.id, master_id, 90);
    let c2 = make_chain_node(workflow.id, master_id, 80);
    let c3 = make_chain_node(workflow.id, master_id, 70);
    let (c1_id, c2_id, c3_id) = (c1.id, c2.id, c3.id);

    h.store.add_olt(olt.clone());
    h.store.add_workflow(workflow);
    h.store.add_node(master);
    h.store.add_node(c1);
    h.store.add_node(c2);
    h.store.add_node(c3);

    h.scheduler.tick().await;
    wait_until(|| h.store.executions_for_node(master_id).len() == 1, Duration::from_secs(2)).await;

    let master_exec = h.store.executions_for_node(master_id).into_iter().next().unwrap();
    h.dispatcher
        .on_execution_terminal(olt.id, master_exec.id, ExecutionStatus::Success, 500)
        .await;
    wait_until(|| !h.store.executions_for_node(c1_id).is_empty(), Duration::from_secs(2)).await;
    assert!(h.store.executions_for_node(c2_id).is_empty());
    assert!(h.store.executions_for_node(c3_id).is_empty());

    let c1_exec = h.store.executions_for_node(c1_id).into_iter().next().unwrap();
    h.dispatcher
        .on_execution_terminal(olt.id, c1_exec.id, ExecutionStatus::Success, 500)
        .await;
    wait_until(|| !h.store.executions_for_node(c2_id).is_empty(), Duration::from_secs(2)).await;
    assert!(h.store.executions_for_node(c3_id).is_empty());

    let c2_exec = h.store.executions_for_node(c2_id).into_iter().next().unwrap();
    h.dispatcher
        .on_execution_terminal(olt.id, c2_exec.id, ExecutionStatus::Success, 500)
        .await;
    wait_until(|| !h.store.executions_for_node(c3_id).is_empty(), Duration::from_secs(2)).await;
}

/// S3: two masters on the same OLT; the lower-priority one queues until the first finishes.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn two_masters_same_olt_serialize() {
    let h = build_harness(10);
    let olt = make_olt(true);
    let workflow = Workflow {
        id: WorkflowId::new(),
        olt_id: olt.id,
        active: true,
    };
    let m1 = make_master(workflow.id, 90, "descubrimiento", Some(h.clock.now() - chrono::Duration::seconds(1)));
    let m2 = make_master(workflow.id, 40, "get", Some(h.clock.now() - chrono::Duration::seconds(1)));
    let (m1_id, m2_id) = (m1.id, m2.id);

    h.store.add_olt(olt.clone());
    h.store.add_workflow(workflow);
    h.store.add_node(m1);
    h.store.add_node(m2);

    h.scheduler.tick().await;

    wait_until(|| h.store.executions_for_node(m1_id).len() == 1, Duration::from_secs(2)).await;
    assert!(h.store.executions_for_node(m2_id).is_empty(), "m2 must wait for the busy olt");

    let m1_exec = h.store.executions_for_node(m1_id).into_iter().next().unwrap();
    h.dispatcher
        .on_execution_terminal(olt.id, m1_exec.id, ExecutionStatus::Success, 300)
        .await;

    wait_until(|| h.store.executions_for_node(m2_id).len() == 1, Duration::from_secs(2)).await;
}

/// S4: duplicate dispatch under concurrent callbacks (§8 R1/R2). The same execution's
/// completion is reported twice; next_run_at advances once and the chain starts once.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn duplicate_completion_callback_is_idempotent() {
    let h = build_harness(10);
    let olt = make_olt(true);
    let workflow = Workflow {
        id: WorkflowId::new(),
        olt_id: olt.id,
        active: true,
    };
    let master = make_master(workflow.id, 90, "get", Some(h.clock.now() - chrono::Duration::seconds(1)));
    let master_id = master.id;
    let chain = make_chain_node(workflow.id, master_id, 90);
    let chain_id = chain.id;

    h.store.add_olt(olt.clone());
    h.store.add_workflow(workflow);
    h.store.add_node(master);
    h.store.add_node(chain);

    h.scheduler.tick().await;
    wait_until(|| h.store.executions_for_node(master_id).len() == 1, Duration::from_secs(2)).await;

    let execution = h.store.executions_for_node(master_id).into_iter().next().unwrap();
    let first_completed_at = h.clock.now();

    h.dispatcher
        .on_execution_terminal(olt.id, execution.id, ExecutionStatus::Success, 500)
        .await;
    wait_until(|| !h.store.executions_for_node(chain_id).is_empty(), Duration::from_secs(2)).await;

    let node_after_first = h.store.node(master_id);
    let next_run_at_after_first = node_after_first.next_run_at.expect("master should be rescheduled");
    assert_eq!(next_run_at_after_first, first_completed_at + chrono::Duration::seconds(300));

    h.clock.advance(Duration::from_secs(60));

    // Same (execution_id, terminal_status) reported a second time.
    h.dispatcher
        .on_execution_terminal(olt.id, execution.id, ExecutionStatus::Success, 500)
        .await;

    let node_after_second = h.store.node(master_id);
    assert_eq!(
        node_after_second.next_run_at,
        Some(next_run_at_after_first),
        "next_run_at must advance exactly once across duplicate callbacks"
    );
    assert_eq!(
        h.store.executions_for_node(chain_id).len(),
        1,
        "the chain's first node must start exactly once"
    );
}

/// S5: OLT disabled mid-flight, the chain is not started once the OLT goes down.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn disabled_olt_stops_chain_cascade() {
    let h = build_harness(10);
    let olt = make_olt(true);
    let workflow = Workflow {
        id: WorkflowId::new(),
        olt_id: olt.id,
        active: true,
    };
    let master = make_master(workflow.id, 90, "get", Some(h.clock.now() - chrono::Duration::seconds(1)));
    let master_id = master.id;
    let c1 = make_chain_node(workflow.id, master_id, 90);
    let c1_id = c1.id;

    h.store.add_olt(olt.clone());
    h.store.add_workflow(workflow);
    h.store.add_node(master);
    h.store.add_node(c1);

    h.scheduler.tick().await;
    wait_until(|| h.store.executions_for_node(master_id).len() == 1, Duration::from_secs(2)).await;

    h.store.disable_olt(olt.id);

    let master_exec = h.store.executions_for_node(master_id).into_iter().next().unwrap();
    h.dispatcher
        .on_execution_terminal(olt.id, master_exec.id, ExecutionStatus::Success, 300)
        .await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(h.store.executions_for_node(c1_id).is_empty(), "chain must not start on a disabled olt");
}

/// S6: saturation, pool smaller than ready work queues the overflow.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn saturation_queues_overflow_without_dropping() {
    let h = build_harness(3);
    let mut master_ids = Vec::new();
    for i in 0..6 {
        let olt = make_olt(true);
        let workflow = Workflow {
            id: WorkflowId::new(),
            olt_id: olt.id,
            active: true,
        };
        let master = make_master(workflow.id, 50 + i, "get", Some(h.clock.now() - chrono::Duration::seconds(1)));
        master_ids.push(master.id);
        h.store.add_olt(olt);
        h.store.add_workflow(workflow);
        h.store.add_node(master);
    }

    h.scheduler.tick().await;

    wait_until(
        || master_ids.iter().filter(|id| !h.store.executions_for_node(**id).is_empty()).count() == 3,
        Duration::from_secs(2),
    )
    .await;

    assert_eq!(h.pool.queue().size(), 3, "the remaining three masters should sit in the queue");
    assert!(h.pool.is_saturated().await);
}
