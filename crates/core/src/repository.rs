//! Persistence seams.
//!
//! The pipeline talks to storage through these traits only; in-memory
//! implementations live in [`crate::memory`]. The audit trait is
//! deliberately append-only: there is no way to update or delete an entry
//! through it.

use crate::audit::AuditEntry;
use crate::endpoint::Endpoint;
use crate::job::{InterfaceJob, JobDirection, JobState};
use crate::LabResult;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Filter for job queries. Empty fields match everything.
#[derive(Clone, Debug, Default)]
pub struct JobQuery {
    pub endpoint_id: Option<Uuid>,
    pub direction: Option<JobDirection>,
    pub states: Vec<JobState>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl JobQuery {
    pub fn matches(&self, job: &InterfaceJob) -> bool {
        if let Some(endpoint_id) = self.endpoint_id {
            if job.endpoint_id != endpoint_id {
                return false;
            }
        }
        if let Some(direction) = self.direction {
            if job.direction != direction {
                return false;
            }
        }
        if !self.states.is_empty() && !self.states.contains(&job.state) {
            return false;
        }
        if let Some(from) = self.from {
            if job.created_at < from {
                return false;
            }
        }
        if let Some(to) = self.to {
            if job.created_at > to {
                return false;
            }
        }
        true
    }
}

pub trait EndpointRepository: Send + Sync {
    fn insert(&self, endpoint: Endpoint) -> LabResult<()>;

    /// The one lookup the hot path uses: inactive endpoints are invisible.
    fn find_active_by_code(&self, code: &str) -> LabResult<Option<Endpoint>>;

    fn get(&self, id: Uuid) -> LabResult<Option<Endpoint>>;

    fn list(&self) -> LabResult<Vec<Endpoint>>;
}

pub trait JobRepository: Send + Sync {
    fn insert(&self, job: InterfaceJob) -> LabResult<()>;

    /// Replaces the stored job with the same id.
    fn update(&self, job: &InterfaceJob) -> LabResult<()>;

    fn get(&self, id: Uuid) -> LabResult<Option<InterfaceJob>>;

    /// Dedup lookup: a non-cancelled inbound job for this endpoint carrying
    /// this external uid.
    fn find_inbound_by_external_uid(
        &self,
        endpoint_id: Uuid,
        external_uid: &str,
    ) -> LabResult<Option<InterfaceJob>>;

    /// Remote-ack matching: an outbound job on this endpoint, matched by id
    /// first, then name, then external uid.
    fn find_outbound(
        &self,
        endpoint_id: Uuid,
        job_id: Option<Uuid>,
        job_name: Option<&str>,
        external_uid: Option<&str>,
    ) -> LabResult<Option<InterfaceJob>>;

    fn query(&self, query: &JobQuery) -> LabResult<Vec<InterfaceJob>>;
}

pub trait AuditLogRepository: Send + Sync {
    fn append(&self, entry: AuditEntry) -> LabResult<()>;

    fn list(&self, endpoint_id: Option<Uuid>, job_id: Option<Uuid>) -> LabResult<Vec<AuditEntry>>;
}
