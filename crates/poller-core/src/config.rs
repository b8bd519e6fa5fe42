//! Env-driven configuration: `--database-url` CLI-arg / `DATABASE_URL` env-var precedence,
//! extended with `POLLER_*` env vars for the engine's own tuning knobs.

use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub worker_pool_size: usize,
    pub queue_max_size: usize,
    pub lock_ttl: Duration,
    pub janitor_interval: Duration,
    pub pending_execution_timeout: Duration,
    pub scheduler_tick_interval: Duration,
    /// Grace period before a `PENDING` execution with a task id is checked against the
    /// downstream runtime's live-task set (janitor's delivery check).
    pub delivery_check_grace: Duration,
    /// Per-tick cap on newly-assigned-or-queued composite nodes (§4.E step 6).
    pub max_dispatch_per_tick: usize,
    /// Batch size passed to `WorkerPool::process_queue` (§4.D, §4.E step 7).
    pub process_queue_batch_size: usize,
    /// Spread jitter applied only to a newly-enabled master's first `next_run_at` (§1 ADDED).
    pub initial_jitter_seconds: u64,
    pub http_addr: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            redis_url: None,
            worker_pool_size: 8,
            queue_max_size: 500,
            lock_ttl: Duration::from_secs(60),
            janitor_interval: Duration::from_secs(30),
            pending_execution_timeout: Duration::from_secs(120),
            scheduler_tick_interval: Duration::from_secs(1),
            delivery_check_grace: Duration::from_secs(30),
            max_dispatch_per_tick: 20,
            process_queue_batch_size: 10,
            initial_jitter_seconds: 30,
            http_addr: "0.0.0.0:8080".to_string(),
        }
    }
}

impl Config {
    /// Builds config from environment variables, falling back to `--database-url`/
    /// `--redis-url` CLI args then to [`Config::default`] values (CLI arg first, then env var).
    pub fn from_env() -> Self {
        let mut cfg = Config::default();

        cfg.database_url = cli_arg("--database-url").or_else(|| env::var("DATABASE_URL").ok());
        cfg.redis_url = cli_arg("--redis-url").or_else(|| env::var("REDIS_URL").ok());

        if let Some(v) = env_usize("POLLER_WORKER_POOL_SIZE") {
            cfg.worker_pool_size = v;
        }
        if let Some(v) = env_usize("POLLER_QUEUE_MAX_SIZE") {
            cfg.queue_max_size = v;
        }
        if let Some(v) = env_u64("POLLER_LOCK_TTL_SECS") {
            cfg.lock_ttl = Duration::from_secs(v);
        }
        if let Some(v) = env_u64("POLLER_JANITOR_INTERVAL_SECS") {
            cfg.janitor_interval = Duration::from_secs(v);
        }
        if let Some(v) = env_u64("POLLER_PENDING_EXECUTION_TIMEOUT_SECS") {
            cfg.pending_execution_timeout = Duration::from_secs(v);
        }
        if let Some(v) = env_u64("POLLER_SCHEDULER_TICK_INTERVAL_SECS") {
            cfg.scheduler_tick_interval = Duration::from_secs(v);
        }
        if let Some(v) = env_u64("POLLER_DELIVERY_CHECK_GRACE_SECS") {
            cfg.delivery_check_grace = Duration::from_secs(v);
        }
        if let Some(v) = env_usize("POLLER_MAX_DISPATCH_PER_TICK") {
            cfg.max_dispatch_per_tick = v;
        }
        if let Some(v) = env_usize("POLLER_PROCESS_QUEUE_BATCH_SIZE") {
            cfg.process_queue_batch_size = v;
        }
        if let Some(v) = env_u64("POLLER_INITIAL_JITTER_SECONDS") {
            cfg.initial_jitter_seconds = v;
        }
        if let Ok(v) = env::var("POLLER_HTTP_ADDR") {
            cfg.http_addr = v;
        }

        cfg
    }
}

fn cli_arg(flag: &str) -> Option<String> {
    let args: Vec<String> = env::args().collect();
    args.windows(2)
        .find(|w| w[0] == flag)
        .map(|w| w[1].clone())
}

fn env_usize(key: &str) -> Option<usize> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_u64(key: &str) -> Option<u64> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}
