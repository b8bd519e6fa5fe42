//! Once per tick, gathers ready work and hands it to the pool (§4.E).
//!
//! Each tick: fetch ready masters, group chains, sort by delay/priority, assign-or-enqueue,
//! then drain the queue and log saturation (rate-limited).

use std::sync::{atomic::{AtomicU64, Ordering}, Arc};

use rand::Rng;
use tracing::warn;

use crate::clock::Clock;
use crate::composite_node::CompositeNode;
use crate::config::Config;
use crate::pool::WorkerPool;
use crate::store::PollerStore;

/// Log a saturation warning once every `N` ticks rather than every tick, so a long stretch
/// of saturation doesn't flood the log.
const SATURATION_LOG_EVERY_N_TICKS: u64 = 10;

pub struct SchedulerTick {
    store: Arc<dyn PollerStore>,
    pool: Arc<WorkerPool>,
    clock: Arc<dyn Clock>,
    config: Config,
    tick_count: AtomicU64,
}

impl SchedulerTick {
    pub fn new(store: Arc<dyn PollerStore>, pool: Arc<WorkerPool>, clock: Arc<dyn Clock>, config: Config) -> Self {
        Self {
            store,
            pool,
            clock,
            config,
            tick_count: AtomicU64::new(0),
        }
    }

    /// §4.E steps 1-8. Never panics or propagates: a store failure is logged and the tick
    /// returns, trusting the next tick to retry (§7 outer-boundary policy).
    pub async fn tick(&self) {
        let now = self.clock.now();
        let tick_no = self.tick_count.fetch_add(1, Ordering::Relaxed);

        if let Err(e) = self.auto_repair_unscheduled_masters(now).await {
            warn!(error = %e, "store unavailable during auto-repair, skipping this tick");
            return;
        }

        let ready_masters = match self.store.list_ready_masters(now).await {
            Ok(nodes) => nodes,
            Err(e) => {
                warn!(error = %e, "store unavailable listing ready masters, skipping this tick");
                return;
            }
        };

        let mut batch = Vec::with_capacity(ready_masters.len());
        for master in ready_masters {
            match self.build_composite_node(master, now).await {
                Ok(Some(cn)) => batch.push(cn),
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, "store unavailable building composite node, skipping node");
                }
            }
        }

        // §4.E step 5: delayed first, then larger delay, then higher priority.
        batch.sort_by(|a, b| {
            b.delayed
                .cmp(&a.delayed)
                .then(b.delay_time.cmp(&a.delay_time))
                .then(b.priority().cmp(&a.priority()))
        });

        // §4.E step 6: bounded so one tick can't starve completion handling; anything beyond
        // the bound is simply left for the next tick to re-identify (its next_run_at is
        // untouched until it actually runs).
        for cn in batch.into_iter().take(self.config.max_dispatch_per_tick) {
            if self.pool.has_free_slot().await {
                self.pool.assign(cn).await;
            } else {
                self.pool.queue().put(cn);
            }
        }

        self.pool.process_queue(self.config.process_queue_batch_size).await;

        if self.pool.is_saturated().await && tick_no % SATURATION_LOG_EVERY_N_TICKS == 0 {
            warn!(
                queue_size = self.pool.queue().size(),
                "worker pool saturated"
            );
        }
    }

    /// Excludes nodes/OLTs with an in-flight Execution (§4.E step 2) and attaches the
    /// enabled chain (§4.E step 3), then computes delay (§4.E step 4).
    async fn build_composite_node(
        &self,
        master: crate::model::WorkflowNode,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<Option<CompositeNode>, crate::error::PollerError> {
        if self.store.active_execution_for_node(master.id).await?.is_some() {
            return Ok(None);
        }

        let Some(workflow) = self.store.get_workflow(master.workflow_id).await? else {
            return Ok(None);
        };
        if !workflow.active {
            return Ok(None);
        }

        let Some(olt) = self.store.get_olt(workflow.olt_id).await? else {
            return Ok(None);
        };
        if !olt.is_pollable() {
            return Ok(None);
        }

        if self.store.olt_is_busy(olt.id).await? {
            return Ok(None);
        }

        let chain = self.store.list_chain_nodes(master.id).await?;
        let mut cn = CompositeNode::new(master, chain, workflow, olt);
        cn.calculate_delay(now);
        Ok(Some(cn))
    }

    /// §4.E auto-repair: an enabled master with `next_run_at = null` gets a fresh
    /// `next_run_at` instead of being silently invisible to the scheduler forever. A node
    /// that has never run (`last_run_at = null`) gets `now + jitter` within
    /// `Config::initial_jitter_seconds` to avoid a thundering herd at startup (§1 ADDED,
    /// supplemented from `execution_coordinator/stagger.py`); an existing node gets
    /// `now + interval_seconds`.
    async fn auto_repair_unscheduled_masters(
        &self,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<(), crate::error::PollerError> {
        let unscheduled = self.store.list_unscheduled_masters().await?;
        for node in unscheduled {
            let next_run_at = if node.last_run_at.is_none() {
                let jitter = if self.config.initial_jitter_seconds > 0 {
                    rand::thread_rng().gen_range(0..=self.config.initial_jitter_seconds)
                } else {
                    0
                };
                now + chrono::Duration::seconds(60 + jitter as i64)
            } else {
                let interval = node.interval_seconds.unwrap_or(300);
                now + chrono::Duration::seconds(interval)
            };
            self.store.set_node_next_run_at(node.id, next_run_at).await?;
        }
        Ok(())
    }
}
