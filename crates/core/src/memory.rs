//! In-memory adapters.
//!
//! Mutex-wrapped collections behind the repository and gateway traits.
//! These back the binary's default wiring and every test in the workspace;
//! a database-backed deployment swaps them out at the trait seam.

use crate::audit::AuditEntry;
use crate::domain::{
    DeliveryReceipt, DeliveryTransport, DomainGateway, DomainReceipt, ExpectedEvent, GatewayError,
};
use crate::endpoint::Endpoint;
use crate::job::InterfaceJob;
use crate::repository::{AuditLogRepository, EndpointRepository, JobQuery, JobRepository};
use crate::{JobState, LabResult};
use chrono::{DateTime, Utc};
use lir_types::{AckCode, MessageKind, Payload};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

// A poisoned lock only means another thread panicked mid-test; the data is
// still usable.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
pub struct InMemoryEndpointRegistry {
    endpoints: Mutex<Vec<Endpoint>>,
}

impl InMemoryEndpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_endpoints(endpoints: Vec<Endpoint>) -> Self {
        Self { endpoints: Mutex::new(endpoints) }
    }
}

impl EndpointRepository for InMemoryEndpointRegistry {
    fn insert(&self, endpoint: Endpoint) -> LabResult<()> {
        lock(&self.endpoints).push(endpoint);
        Ok(())
    }

    fn find_active_by_code(&self, code: &str) -> LabResult<Option<Endpoint>> {
        Ok(lock(&self.endpoints)
            .iter()
            .find(|e| e.active && e.code == code)
            .cloned())
    }

    fn get(&self, id: Uuid) -> LabResult<Option<Endpoint>> {
        Ok(lock(&self.endpoints).iter().find(|e| e.id == id).cloned())
    }

    fn list(&self) -> LabResult<Vec<Endpoint>> {
        Ok(lock(&self.endpoints).clone())
    }
}

#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: Mutex<Vec<InterfaceJob>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl JobRepository for InMemoryJobStore {
    fn insert(&self, job: InterfaceJob) -> LabResult<()> {
        lock(&self.jobs).push(job);
        Ok(())
    }

    fn update(&self, job: &InterfaceJob) -> LabResult<()> {
        let mut jobs = lock(&self.jobs);
        match jobs.iter_mut().find(|j| j.id == job.id) {
            Some(stored) => {
                *stored = job.clone();
                Ok(())
            }
            None => Err(crate::LabError::JobNotFound),
        }
    }

    fn get(&self, id: Uuid) -> LabResult<Option<InterfaceJob>> {
        Ok(lock(&self.jobs).iter().find(|j| j.id == id).cloned())
    }

    fn find_inbound_by_external_uid(
        &self,
        endpoint_id: Uuid,
        external_uid: &str,
    ) -> LabResult<Option<InterfaceJob>> {
        Ok(lock(&self.jobs)
            .iter()
            .find(|j| {
                j.endpoint_id == endpoint_id
                    && j.direction == crate::JobDirection::Inbound
                    && j.state != JobState::Cancel
                    && j.external_uid.as_deref() == Some(external_uid)
            })
            .cloned())
    }

    fn find_outbound(
        &self,
        endpoint_id: Uuid,
        job_id: Option<Uuid>,
        job_name: Option<&str>,
        external_uid: Option<&str>,
    ) -> LabResult<Option<InterfaceJob>> {
        let jobs = lock(&self.jobs);
        let outbound = |j: &&InterfaceJob| {
            j.endpoint_id == endpoint_id && j.direction == crate::JobDirection::Outbound
        };

        if let Some(id) = job_id {
            if let Some(job) = jobs.iter().filter(outbound).find(|j| j.id == id) {
                return Ok(Some(job.clone()));
            }
        }
        if let Some(name) = job_name.filter(|n| !n.is_empty()) {
            if let Some(job) = jobs.iter().filter(outbound).find(|j| j.name == name) {
                return Ok(Some(job.clone()));
            }
        }
        if let Some(uid) = external_uid.filter(|u| !u.is_empty()) {
            if let Some(job) = jobs
                .iter()
                .filter(outbound)
                .find(|j| j.external_uid.as_deref() == Some(uid))
            {
                return Ok(Some(job.clone()));
            }
        }
        Ok(None)
    }

    fn query(&self, query: &JobQuery) -> LabResult<Vec<InterfaceJob>> {
        Ok(lock(&self.jobs)
            .iter()
            .filter(|j| query.matches(j))
            .cloned()
            .collect())
    }
}

#[derive(Default)]
pub struct InMemoryAuditLog {
    entries: Mutex<Vec<AuditEntry>>,
}

impl InMemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AuditLogRepository for InMemoryAuditLog {
    fn append(&self, entry: AuditEntry) -> LabResult<()> {
        lock(&self.entries).push(entry);
        Ok(())
    }

    fn list(&self, endpoint_id: Option<Uuid>, job_id: Option<Uuid>) -> LabResult<Vec<AuditEntry>> {
        Ok(lock(&self.entries)
            .iter()
            .filter(|e| endpoint_id.is_none_or(|id| e.endpoint_id == id))
            .filter(|e| job_id.is_none_or(|id| e.job_id == Some(id)))
            .cloned()
            .collect())
    }
}

/// In-memory laboratory domain: a catalogue of service codes, a set of open
/// accessions, and a list of deliveries it expects to have gone out.
pub struct InMemoryDomainGateway {
    known_services: Vec<String>,
    known_accessions: Mutex<Vec<String>>,
    expected_events: Mutex<Vec<ExpectedEvent>>,
    request_seq: AtomicU64,
    outage: AtomicBool,
}

impl InMemoryDomainGateway {
    pub fn new(known_services: Vec<String>, known_accessions: Vec<String>) -> Self {
        Self {
            known_services,
            known_accessions: Mutex::new(known_accessions),
            expected_events: Mutex::new(Vec::new()),
            request_seq: AtomicU64::new(1),
            outage: AtomicBool::new(false),
        }
    }

    /// A small catalogue covering the common chemistry panel.
    pub fn with_defaults() -> Self {
        Self::new(
            vec!["GLU".into(), "NA".into(), "K".into(), "HB".into(), "CREA".into()],
            Vec::new(),
        )
    }

    pub fn expect_event(&self, entity_ref: &str, kind: MessageKind) {
        lock(&self.expected_events).push(ExpectedEvent {
            entity_ref: entity_ref.to_string(),
            kind,
            at: Utc::now(),
        });
    }

    /// Makes every subsequent `ingest` fail, for exercising retry paths.
    pub fn set_outage(&self, down: bool) {
        self.outage.store(down, Ordering::SeqCst);
    }
}

impl DomainGateway for InMemoryDomainGateway {
    fn ingest(&self, _kind: MessageKind, payload: &Payload) -> Result<DomainReceipt, GatewayError> {
        if self.outage.load(Ordering::SeqCst) {
            return Err(GatewayError::Failure("laboratory system unavailable".into()));
        }

        match payload {
            Payload::Order(order) => {
                let valid: Vec<&str> = order
                    .lines
                    .iter()
                    .filter(|l| self.known_services.iter().any(|s| s == &l.service_code))
                    .map(|l| l.service_code.as_str())
                    .collect();
                if valid.is_empty() {
                    return Err(GatewayError::Rejected("no valid service lines".into()));
                }
                let seq = self.request_seq.fetch_add(1, Ordering::Relaxed);
                let entity_ref = format!("LR/{seq:05}");
                let accession = format!("ACC{seq:05}");
                lock(&self.known_accessions).push(accession);
                Ok(DomainReceipt {
                    entity_ref,
                    detail: format!("registered {} service line(s)", valid.len()),
                })
            }
            Payload::Result(result) => {
                if result.accession.is_empty() {
                    return Err(GatewayError::Rejected("result without accession".into()));
                }
                if !lock(&self.known_accessions).iter().any(|a| a == &result.accession) {
                    return Err(GatewayError::Rejected(format!(
                        "unknown accession {}",
                        result.accession
                    )));
                }
                Ok(DomainReceipt {
                    entity_ref: result.accession.clone(),
                    detail: format!("recorded {} result line(s)", result.results.len()),
                })
            }
            Payload::Other(_) => {
                // Passthrough payloads are stored as-is for manual triage.
                Ok(DomainReceipt { entity_ref: String::new(), detail: "stored".into() })
            }
        }
    }

    fn expected_outbound_events(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Vec<ExpectedEvent> {
        lock(&self.expected_events)
            .iter()
            .filter(|e| e.at >= from && e.at <= to)
            .cloned()
            .collect()
    }
}

enum TransportOutcome {
    Accept,
    Reject(AckCode, String),
    Fail(String),
}

/// Scripted transport for the binary's default wiring and for tests.
pub struct SimulatedTransport {
    outcome: Mutex<TransportOutcome>,
    delivered: Mutex<Vec<String>>,
}

impl SimulatedTransport {
    pub fn accepting() -> Self {
        Self {
            outcome: Mutex::new(TransportOutcome::Accept),
            delivered: Mutex::new(Vec::new()),
        }
    }

    pub fn rejecting(code: AckCode, detail: &str) -> Self {
        Self {
            outcome: Mutex::new(TransportOutcome::Reject(code, detail.to_string())),
            delivered: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(detail: &str) -> Self {
        Self {
            outcome: Mutex::new(TransportOutcome::Fail(detail.to_string())),
            delivered: Mutex::new(Vec::new()),
        }
    }

    /// Switches the scripted outcome, e.g. fail once then accept.
    pub fn now_accepting(&self) {
        *lock(&self.outcome) = TransportOutcome::Accept;
    }

    pub fn delivered_bodies(&self) -> Vec<String> {
        lock(&self.delivered).clone()
    }
}

impl DeliveryTransport for SimulatedTransport {
    fn deliver(&self, _endpoint: &Endpoint, body: &str) -> Result<DeliveryReceipt, String> {
        match &*lock(&self.outcome) {
            TransportOutcome::Fail(detail) => return Err(detail.clone()),
            TransportOutcome::Reject(code, detail) => {
                lock(&self.delivered).push(body.to_string());
                Ok(DeliveryReceipt { ack_code: Some(*code), detail: detail.clone() })
            }
            TransportOutcome::Accept => {
                lock(&self.delivered).push(body.to_string());
                Ok(DeliveryReceipt::accepted())
            }
        }
    }
}
