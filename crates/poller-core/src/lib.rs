//! Scheduling core for the GPON OLT polling engine.
//!
//! This crate owns the Scheduler, Composite-Node model, Worker Pool, and Completion
//! Dispatcher (§1, §2), plus the trait boundaries (`PollerStore`, `DistributedLock`,
//! `ExecutionRuntime`) that let all of it run against in-memory fakes in tests. No SNMP, no
//! Postgres, no Redis client lives in this crate; see `poller-store` and `poller-redis`.

pub mod clock;
pub mod composite_node;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod janitor;
pub mod lock;
pub mod model;
pub mod pool;
pub mod queue;
pub mod runtime;
pub mod scheduler;
pub mod store;
pub mod worker;

pub use clock::{Clock, SystemClock};
pub use composite_node::{CompositeNode, DispatchOutcome};
pub use config::Config;
pub use dispatcher::CompletionDispatcher;
pub use error::PollerError;
pub use janitor::Janitor;
pub use lock::{DistributedLock, InMemoryLock, LockGuard};
pub use pool::WorkerPool;
pub use runtime::ExecutionRuntime;
pub use scheduler::SchedulerTick;
pub use store::PollerStore;
