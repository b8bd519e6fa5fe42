//! `ExecutionRuntime` implementations. The core never performs SNMP I/O itself, it only
//! submits to whatever actually runs the job and waits for a callback. `HttpExecutionRuntime`
//! posts to the configured downstream task queue's HTTP front door.

use std::collections::HashSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use poller_core::error::PollerError;
use poller_core::model::{ExecutionId, JobType, NodeId, OltId};
use poller_core::runtime::ExecutionRuntime;

#[derive(Debug, Serialize)]
struct SubmitRequest {
    job_type: &'static str,
    node_id: NodeId,
    olt_id: OltId,
    execution_id: ExecutionId,
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    external_task_id: String,
}

/// Submits jobs to the downstream task queue's HTTP front door.
pub struct HttpExecutionRuntime {
    client: reqwest::Client,
    submit_url: String,
    active_tasks_url: String,
}

impl HttpExecutionRuntime {
    pub fn new(submit_url: String) -> Self {
        let active_tasks_url = match submit_url.rsplit_once('/') {
            Some((base, _)) => format!("{base}/active-tasks"),
            None => format!("{submit_url}/active-tasks"),
        };
        Self {
            client: reqwest::Client::new(),
            submit_url,
            active_tasks_url,
        }
    }
}

#[async_trait]
impl ExecutionRuntime for HttpExecutionRuntime {
    async fn submit(
        &self,
        job_type: JobType,
        node_id: NodeId,
        olt_id: OltId,
        execution_id: ExecutionId,
    ) -> Result<String, PollerError> {
        let body = SubmitRequest {
            job_type: job_type.as_str(),
            node_id,
            olt_id,
            execution_id,
        };

        let response = self
            .client
            .post(&self.submit_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| PollerError::DownstreamSubmissionFailed {
                execution_id,
                source: anyhow::anyhow!(e),
            })?;

        if !response.status().is_success() {
            return Err(PollerError::DownstreamSubmissionFailed {
                execution_id,
                source: anyhow::anyhow!("downstream returned {}", response.status()),
            });
        }

        let parsed: SubmitResponse = response
            .json()
            .await
            .map_err(|e| PollerError::DownstreamSubmissionFailed {
                execution_id,
                source: anyhow::anyhow!(e),
            })?;

        Ok(parsed.external_task_id)
    }

    async fn list_active_task_ids(&self) -> Result<HashSet<String>, PollerError> {
        let response = self
            .client
            .get(&self.active_tasks_url)
            .send()
            .await
            .map_err(|e| PollerError::DownstreamQueryFailed(anyhow::anyhow!(e)))?;

        if !response.status().is_success() {
            return Err(PollerError::DownstreamQueryFailed(anyhow::anyhow!(
                "downstream returned {}",
                response.status()
            )));
        }

        response
            .json::<HashSet<String>>()
            .await
            .map_err(|e| PollerError::DownstreamQueryFailed(anyhow::anyhow!(e)))
    }
}

/// Dev-mode fallback when no downstream task queue is configured: submits nothing, just
/// hands back a synthetic task id. Executions created this way stay PENDING until the
/// janitor's stale-pending sweep interrupts them, matching how an unreachable downstream
/// would behave.
pub struct NullExecutionRuntime;

#[async_trait]
impl ExecutionRuntime for NullExecutionRuntime {
    async fn submit(
        &self,
        job_type: JobType,
        node_id: NodeId,
        olt_id: OltId,
        execution_id: ExecutionId,
    ) -> Result<String, PollerError> {
        warn!(%node_id, %olt_id, %execution_id, job_type = job_type.as_str(), "no downstream task queue configured, submission is a no-op");
        Ok(format!("noop-{}", Uuid::new_v4()))
    }

    async fn list_active_task_ids(&self) -> Result<HashSet<String>, PollerError> {
        // No real downstream, so nothing is ever confirmed live; the janitor's delivery
        // check will treat every noop task id as orphaned once it ages past the grace period.
        Ok(HashSet::new())
    }
}
