mod routes;
mod runtime;
mod state;

use std::sync::Arc;

use poller_core::clock::{Clock, SystemClock};
use poller_core::config::Config;
use poller_core::dispatcher::CompletionDispatcher;
use poller_core::janitor::Janitor;
use poller_core::lock::{DistributedLock, InMemoryLock};
use poller_core::pool::WorkerPool;
use poller_core::runtime::ExecutionRuntime;
use poller_core::scheduler::SchedulerTick;
use poller_core::store::PollerStore;
use poller_store::memory::MemoryStore;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use crate::runtime::{HttpExecutionRuntime, NullExecutionRuntime};
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::from_env();

    let store: Arc<dyn PollerStore> = match &config.database_url {
        #[cfg(feature = "postgres")]
        Some(url) => {
            tracing::info!("connecting to postgres");
            let pool = sqlx::PgPool::connect(url).await?;
            let pg = poller_store::postgres::PostgresStore::new(pool);
            pg.migrate().await?;
            tracing::info!("using PostgresStore (migrations applied)");
            Arc::new(pg)
        }
        #[cfg(not(feature = "postgres"))]
        Some(_) => {
            tracing::warn!("--database-url/DATABASE_URL set but postgres feature not enabled, using MemoryStore");
            Arc::new(MemoryStore::new())
        }
        None => {
            tracing::info!("using MemoryStore (no database url configured)");
            Arc::new(MemoryStore::new())
        }
    };

    let lock: Arc<dyn DistributedLock> = match &config.redis_url {
        Some(url) => {
            tracing::info!("connecting to redis for distributed locking");
            poller_redis::RedisLock::connect(url).await?
        }
        None => {
            tracing::info!("using in-memory lock (single replica only)");
            InMemoryLock::new()
        }
    };

    let task_runtime: Arc<dyn ExecutionRuntime> = match std::env::var("POLLER_DOWNSTREAM_SUBMIT_URL").ok() {
        Some(url) => {
            tracing::info!(url, "using HttpExecutionRuntime");
            Arc::new(HttpExecutionRuntime::new(url))
        }
        None => {
            tracing::warn!("POLLER_DOWNSTREAM_SUBMIT_URL not set, using NullExecutionRuntime");
            Arc::new(NullExecutionRuntime)
        }
    };

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let pool = WorkerPool::new(
        config.worker_pool_size,
        config.queue_max_size,
        store.clone(),
        lock.clone(),
        task_runtime.clone(),
        clock.clone(),
    );

    let scheduler = Arc::new(SchedulerTick::new(store.clone(), pool.clone(), clock.clone(), config.clone()));
    let dispatcher = Arc::new(CompletionDispatcher::new(store.clone(), pool.clone(), lock.clone(), clock.clone()));
    let janitor = Arc::new(Janitor::new(
        store.clone(),
        dispatcher.clone(),
        task_runtime,
        clock.clone(),
        config.pending_execution_timeout,
        config.delivery_check_grace,
    ));

    let scheduler_tick_interval = config.scheduler_tick_interval;
    tokio::spawn(async move {
        loop {
            scheduler.tick().await;
            tokio::time::sleep(scheduler_tick_interval).await;
        }
    });
    tracing::info!(interval_secs = scheduler_tick_interval.as_secs(), "scheduler tick loop spawned");

    let janitor_interval = config.janitor_interval;
    tokio::spawn(async move {
        loop {
            janitor.run_once().await;
            tokio::time::sleep(janitor_interval).await;
        }
    });
    tracing::info!(interval_secs = janitor_interval.as_secs(), "janitor loop spawned");

    let app_state = AppState {
        store,
        pool,
        clock,
        dispatcher,
    };
    let app = routes::build_router(app_state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let listener = TcpListener::bind(&config.http_addr).await?;
    tracing::info!(addr = %config.http_addr, "poller-server listening");
    axum::serve(listener, app).await?;

    Ok(())
}
