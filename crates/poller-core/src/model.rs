//! Domain entities for the GPON OLT polling engine.
//!
//! These are plain data structs; persistence is delegated to `poller_store::PollerStore`.
//! IDs are newtypes over `Uuid` rather than raw integers, matching the newtype-over-`Uuid`
//! convention used for domain identifiers throughout this workspace.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! uuid_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(u: Uuid) -> Self {
                Self(u)
            }
        }
    };
}

uuid_id!(OltId);
uuid_id!(WorkflowId);
uuid_id!(NodeId);
uuid_id!(ExecutionId);

/// A polled GPON OLT (§3). The core only ever reads `enabled && !soft_deleted` OLTs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Olt {
    pub id: OltId,
    pub short_name: String,
    pub ip: String,
    pub community: String,
    pub brand: String,
    pub model: String,
    pub enabled: bool,
    pub soft_deleted: bool,
}

impl Olt {
    pub fn is_pollable(&self) -> bool {
        self.enabled && !self.soft_deleted
    }
}

/// An ordered bundle of nodes bound to exactly one OLT (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: WorkflowId,
    pub olt_id: OltId,
    pub active: bool,
}

/// Which SNMP "espacio" (namespace) an OID belongs to determines the job type (I4).
pub const ESPACIO_DESCUBRIMIENTO: &str = "descubrimiento";

/// Job type derived from a node's OID namespace (I4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobType {
    /// SNMP walk enumerating ONU presence/state.
    Discovery,
    /// SNMP GET of a specific OID against specific ONU indices.
    Get,
}

impl JobType {
    pub fn from_espacio(espacio: &str) -> Self {
        if espacio == ESPACIO_DESCUBRIMIENTO {
            JobType::Discovery
        } else {
            JobType::Get
        }
    }

    pub fn default_priority(self) -> i32 {
        match self {
            JobType::Discovery => 90,
            JobType::Get => 40,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobType::Discovery => "descubrimiento",
            JobType::Get => "get",
        }
    }
}

/// A schedulable unit within a workflow (§3). A master node has `is_chain_node = false`
/// and carries `next_run_at`; a chain node has `is_chain_node = true`, a non-null
/// `master_node`, and `next_run_at = None` (I1, I2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowNode {
    pub id: NodeId,
    pub workflow_id: WorkflowId,
    pub name: String,
    pub key: String,
    pub enabled: bool,
    pub is_chain_node: bool,
    pub master_node: Option<NodeId>,
    pub interval_seconds: Option<i64>,
    pub priority: i32,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub espacio: String,
}

impl WorkflowNode {
    pub fn job_type(&self) -> JobType {
        JobType::from_espacio(&self.espacio)
    }

    /// Invariant I1/I2 check, used defensively in tests and store implementations.
    pub fn respects_master_chain_invariant(&self) -> bool {
        if self.is_chain_node {
            self.next_run_at.is_none() && self.master_node.is_some()
        } else {
            self.next_run_at.is_some()
        }
    }
}

/// Status of one Execution attempt (§3). `is_terminal`/`is_active` express I5/I6
/// without repeating the `{PENDING, RUNNING}` / terminal set literal everywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Success,
    Failed,
    Interrupted,
}

impl ExecutionStatus {
    pub fn is_active(self) -> bool {
        matches!(self, ExecutionStatus::Pending | ExecutionStatus::Running)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionStatus::Pending => "PENDING",
            ExecutionStatus::Running => "RUNNING",
            ExecutionStatus::Success => "SUCCESS",
            ExecutionStatus::Failed => "FAILED",
            ExecutionStatus::Interrupted => "INTERRUPTED",
        };
        write!(f, "{s}")
    }
}

/// One attempt at running a node (§3). Immutable once `status.is_terminal()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: ExecutionId,
    pub node_id: NodeId,
    pub olt_id: OltId,
    pub job_type: JobType,
    pub status: ExecutionStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub external_task_id: Option<String>,
    pub error_message: Option<String>,
    /// Opaque result map; may carry `poller_id` for provenance (§3).
    pub result_summary: serde_json::Map<String, serde_json::Value>,
}

impl Execution {
    pub fn new_pending(node_id: NodeId, olt_id: OltId, job_type: JobType, now: DateTime<Utc>) -> Self {
        Self {
            id: ExecutionId::new(),
            node_id,
            olt_id,
            job_type,
            status: ExecutionStatus::Pending,
            created_at: now,
            started_at: None,
            finished_at: None,
            duration_ms: None,
            external_task_id: None,
            error_message: None,
            result_summary: serde_json::Map::new(),
        }
    }
}
