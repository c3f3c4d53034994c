//! Append-only interface audit trail.
//!
//! One entry per significant pipeline event. Entries are snapshots: they
//! copy the payload and outcome text at the time of the event so later
//! edits to jobs or endpoints never rewrite history.

use crate::job::JobDirection;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What happened.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    /// A message crossed the boundary and a job was created (or matched).
    Ingest,
    /// A job attempt ran to an outcome.
    Process,
    /// An operator or replay batch requeued a job.
    Requeue,
    /// A remote acknowledgement was registered.
    Ack,
    /// An attempt ended in a transport failure.
    Error,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ingest => "ingest",
            Self::Process => "process",
            Self::Requeue => "requeue",
            Self::Ack => "ack",
            Self::Error => "error",
        }
    }
}

/// One audit trail entry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub action: AuditAction,
    pub direction: JobDirection,
    pub endpoint_id: Uuid,
    pub job_id: Option<Uuid>,
    pub external_uid: Option<String>,
    pub source_ip: Option<String>,
    /// Canonical payload snapshot at the time of the event.
    pub payload: Option<serde_json::Value>,
    /// Human-readable outcome text (ack text, error message, note).
    pub result: Option<String>,
    /// Job state after the event, when a job was involved.
    pub state: Option<String>,
    pub actor: String,
    pub at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(
        action: AuditAction,
        direction: JobDirection,
        endpoint_id: Uuid,
        actor: &str,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            action,
            direction,
            endpoint_id,
            job_id: None,
            external_uid: None,
            source_ip: None,
            payload: None,
            result: None,
            state: None,
            actor: actor.to_string(),
            at: Utc::now(),
        }
    }

    pub fn with_job(mut self, job_id: Uuid, state: &str) -> Self {
        self.job_id = Some(job_id);
        self.state = Some(state.to_string());
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_result(mut self, result: &str) -> Self {
        self.result = Some(result.to_string());
        self
    }

    pub fn with_external_uid(mut self, uid: Option<String>) -> Self {
        self.external_uid = uid;
        self
    }

    pub fn with_source_ip(mut self, ip: Option<String>) -> Self {
        self.source_ip = ip;
        self
    }
}
