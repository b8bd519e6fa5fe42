//! Typed error hierarchy for the polling core (§7).

use crate::model::{ExecutionId, NodeId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PollerError {
    #[error("precondition violated for node {node_id}: {reason}")]
    PreconditionViolation { node_id: NodeId, reason: String },

    #[error("downstream submission failed for execution {execution_id}: {source}")]
    DownstreamSubmissionFailed {
        execution_id: ExecutionId,
        #[source]
        source: anyhow::Error,
    },

    #[error("store unavailable: {0}")]
    StoreUnavailable(#[source] anyhow::Error),

    #[error("lock unavailable for key {key}")]
    LockUnavailable { key: String },

    #[error("unknown execution {0}")]
    UnknownExecution(ExecutionId),

    #[error("could not query downstream runtime for active task ids: {0}")]
    DownstreamQueryFailed(#[source] anyhow::Error),
}
