use std::sync::Arc;

use poller_core::clock::Clock;
use poller_core::dispatcher::CompletionDispatcher;
use poller_core::pool::WorkerPool;
use poller_core::store::PollerStore;

/// Shared state for all axum handlers: one `Clone`-able struct of `Arc`s handed to
/// `Router::with_state`.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn PollerStore>,
    pub pool: Arc<WorkerPool>,
    pub clock: Arc<dyn Clock>,
    pub dispatcher: Arc<CompletionDispatcher>,
}
