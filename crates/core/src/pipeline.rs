//! Ingestion and dispatch pipeline.
//!
//! `InterfaceService` orchestrates one message exchange end to end:
//! resolve the endpoint, authorise, parse, hand over to the domain, write
//! the acknowledgement and the audit trail. Endpoint resolution and
//! authorisation failures short-circuit before any job or audit entry
//! exists; everything after that point leaves a trace.

use crate::audit::{AuditAction, AuditEntry};
use crate::auth::{authorize, AuthHeaders};
use crate::config::CoreConfig;
use crate::domain::{DeliveryTransport, DomainGateway, GatewayError};
use crate::endpoint::{Endpoint, Protocol};
use crate::job::{InterfaceJob, JobDirection, JobState};
use crate::repository::{AuditLogRepository, EndpointRepository, JobQuery, JobRepository};
use crate::{LabError, LabResult};
use fhir::Fhir;
use hl7::Hl7;
use lir_types::{AckCode, MessageKind, Payload};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Outcome of a structured ingestion, ready for JSON serialisation.
#[derive(Clone, Debug, Serialize)]
pub struct IngestResponse {
    pub ok: bool,
    pub ack_code: Option<AckCode>,
    pub job_id: Option<Uuid>,
    pub job_name: Option<String>,
    pub state: Option<JobState>,
    pub error: Option<String>,
}

impl IngestResponse {
    fn from_job(job: &InterfaceJob) -> Self {
        Self {
            ok: job.ack_code == Some(AckCode::Aa),
            ack_code: job.ack_code,
            job_id: Some(job.id),
            job_name: Some(job.name.clone()),
            state: Some(job.state),
            error: job.error_message.clone(),
        }
    }
}

/// Protocol-level reply for the raw entry point. The HTTP layer copies
/// these fields into the response verbatim.
#[derive(Clone, Debug)]
pub struct WireResponse {
    pub status: u16,
    pub content_type: &'static str,
    pub body: String,
}

/// A remote acknowledgement registration request.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct AckRequest {
    pub ack_code: Option<AckCode>,
    pub job_id: Option<Uuid>,
    pub job_name: Option<String>,
    pub external_uid: Option<String>,
    pub message: Option<String>,
    pub payload: Option<serde_json::Value>,
}

#[derive(Clone, Debug, Serialize)]
pub struct AckResponse {
    pub ok: bool,
    pub error: Option<String>,
}

/// The interface relay service. Cheap to clone; all state lives behind the
/// injected repositories.
#[derive(Clone)]
pub struct InterfaceService {
    endpoints: Arc<dyn EndpointRepository>,
    jobs: Arc<dyn JobRepository>,
    audit: Arc<dyn AuditLogRepository>,
    gateway: Arc<dyn DomainGateway>,
    transport: Arc<dyn DeliveryTransport>,
    config: CoreConfig,
}

impl InterfaceService {
    pub fn new(
        endpoints: Arc<dyn EndpointRepository>,
        jobs: Arc<dyn JobRepository>,
        audit: Arc<dyn AuditLogRepository>,
        gateway: Arc<dyn DomainGateway>,
        transport: Arc<dyn DeliveryTransport>,
        config: CoreConfig,
    ) -> Self {
        Self { endpoints, jobs, audit, gateway, transport, config }
    }

    pub fn endpoint_repository(&self) -> Arc<dyn EndpointRepository> {
        Arc::clone(&self.endpoints)
    }

    pub fn job_repository(&self) -> Arc<dyn JobRepository> {
        Arc::clone(&self.jobs)
    }

    pub fn audit_repository(&self) -> Arc<dyn AuditLogRepository> {
        Arc::clone(&self.audit)
    }

    pub fn domain_gateway(&self) -> Arc<dyn DomainGateway> {
        Arc::clone(&self.gateway)
    }

    /// Resolves and authorises an inbound request. No audit entry is
    /// written on failure here: an unresolved or unauthorised caller has
    /// not crossed the boundary.
    fn resolve_inbound(
        &self,
        endpoint_code: &str,
        headers: &AuthHeaders,
        source_ip: Option<&str>,
    ) -> LabResult<Endpoint> {
        let endpoint = self
            .endpoints
            .find_active_by_code(endpoint_code)?
            .ok_or(LabError::EndpointNotFound)?;
        if !endpoint.direction.allows_inbound() {
            return Err(LabError::DirectionNotAllowed);
        }
        if !authorize(&endpoint, headers) {
            return Err(LabError::Unauthorized);
        }
        if !endpoint.allows_source_ip(source_ip.unwrap_or_default()) {
            return Err(LabError::SourceIpNotAllowed);
        }
        Ok(endpoint)
    }

    fn resolve_outbound(
        &self,
        endpoint_code: &str,
        headers: &AuthHeaders,
        source_ip: Option<&str>,
    ) -> LabResult<Endpoint> {
        let endpoint = self
            .endpoints
            .find_active_by_code(endpoint_code)?
            .ok_or(LabError::EndpointNotFound)?;
        if !endpoint.direction.allows_outbound() {
            return Err(LabError::DirectionNotAllowed);
        }
        if !authorize(&endpoint, headers) {
            return Err(LabError::Unauthorized);
        }
        if !endpoint.allows_source_ip(source_ip.unwrap_or_default()) {
            return Err(LabError::SourceIpNotAllowed);
        }
        Ok(endpoint)
    }

    /// Ingests a structured (already-JSON) inbound message.
    pub fn ingest_structured(
        &self,
        endpoint_code: &str,
        headers: &AuthHeaders,
        source_ip: Option<String>,
        message_type: MessageKind,
        payload: serde_json::Value,
        external_uid: Option<String>,
        raw_message: Option<String>,
    ) -> LabResult<IngestResponse> {
        let endpoint = self.resolve_inbound(endpoint_code, headers, source_ip.as_deref())?;
        let payload = Payload::from_value(message_type, payload);
        let job = self.run_inbound(
            &endpoint,
            message_type,
            payload,
            external_uid,
            source_ip,
            raw_message,
        )?;
        Ok(IngestResponse::from_job(&job))
    }

    /// Ingests a raw wire message and answers in the endpoint's protocol.
    pub fn ingest_raw(
        &self,
        endpoint_code: &str,
        headers: &AuthHeaders,
        source_ip: Option<String>,
        raw_body: &str,
    ) -> WireResponse {
        let endpoint = match self.resolve_inbound(endpoint_code, headers, source_ip.as_deref()) {
            Ok(endpoint) => endpoint,
            Err(err) => return Self::short_circuit_response(&err),
        };

        match endpoint.protocol {
            Protocol::Hl7v2 => self.ingest_raw_hl7(&endpoint, source_ip, raw_body),
            Protocol::Fhir => self.ingest_raw_fhir(&endpoint, source_ip, raw_body),
            _ => self.ingest_raw_passthrough(&endpoint, source_ip, raw_body),
        }
    }

    fn short_circuit_response(err: &LabError) -> WireResponse {
        let status = match err {
            LabError::EndpointNotFound => 404,
            LabError::DirectionNotAllowed | LabError::SourceIpNotAllowed => 403,
            LabError::Unauthorized => 401,
            _ => 400,
        };
        WireResponse { status, content_type: "text/plain", body: err.to_string() }
    }

    fn ingest_raw_hl7(
        &self,
        endpoint: &Endpoint,
        source_ip: Option<String>,
        raw_body: &str,
    ) -> WireResponse {
        let message = match Hl7::parse_message(raw_body, &endpoint.field_map_pairs()) {
            Ok(message) => message,
            Err(err) => {
                return WireResponse {
                    status: 400,
                    content_type: "text/plain",
                    body: Hl7::build_ack(AckCode::Ar, "", &err.to_string()),
                };
            }
        };

        let control_id = message.external_uid.clone().unwrap_or_default();
        let kind = message.kind();
        let job = match self.run_inbound(
            endpoint,
            kind,
            message.payload,
            message.external_uid,
            source_ip,
            Some(raw_body.to_string()),
        ) {
            Ok(job) => job,
            Err(err) => {
                return WireResponse {
                    status: 400,
                    content_type: "text/plain",
                    body: Hl7::build_ack(AckCode::Ar, &control_id, &err.to_string()),
                };
            }
        };

        let ack_code = job.ack_code.unwrap_or(AckCode::Ar);
        let text = job.error_message.as_deref().unwrap_or("Message processed");
        WireResponse {
            status: 200,
            content_type: "text/plain",
            body: Hl7::build_ack(ack_code, &control_id, text),
        }
    }

    fn ingest_raw_fhir(
        &self,
        endpoint: &Endpoint,
        source_ip: Option<String>,
        raw_body: &str,
    ) -> WireResponse {
        const FHIR_JSON: &str = "application/fhir+json";

        let message = match Fhir::parse_text(raw_body) {
            Ok(message) => message,
            Err(err) => {
                return WireResponse {
                    status: 400,
                    content_type: FHIR_JSON,
                    body: Fhir::build_outcome(false, &err.to_string()).to_string(),
                };
            }
        };

        let kind = message.kind();
        let job = match self.run_inbound(
            endpoint,
            kind,
            message.payload,
            message.external_uid,
            source_ip,
            Some(raw_body.to_string()),
        ) {
            Ok(job) => job,
            Err(err) => {
                return WireResponse {
                    status: 400,
                    content_type: FHIR_JSON,
                    body: Fhir::build_outcome(false, &err.to_string()).to_string(),
                };
            }
        };

        let ok = job.ack_code == Some(AckCode::Aa);
        let detail = job.error_message.as_deref().unwrap_or("processed");
        WireResponse {
            status: 200,
            content_type: FHIR_JSON,
            body: Fhir::build_outcome(ok, detail).to_string(),
        }
    }

    // REST/other protocols: JSON in, JSON out, message type taken from the
    // body with order as the default.
    fn ingest_raw_passthrough(
        &self,
        endpoint: &Endpoint,
        source_ip: Option<String>,
        raw_body: &str,
    ) -> WireResponse {
        let value: serde_json::Value = match serde_json::from_str(raw_body) {
            Ok(value) => value,
            Err(err) => {
                let body = serde_json::json!({ "ok": false, "error": format!("invalid JSON body: {err}") });
                return WireResponse { status: 400, content_type: "application/json", body: body.to_string() };
            }
        };

        let kind = value
            .get("message_type")
            .and_then(|v| v.as_str())
            .and_then(|s| MessageKind::parse(s).ok())
            .unwrap_or(MessageKind::Order);
        let external_uid = value
            .get("external_uid")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let payload = Payload::from_value(kind, value.get("payload").cloned().unwrap_or(value));

        match self.run_inbound(
            endpoint,
            kind,
            payload,
            external_uid,
            source_ip,
            Some(raw_body.to_string()),
        ) {
            Ok(job) => {
                let response = IngestResponse::from_job(&job);
                let body = serde_json::to_value(&response).unwrap_or_default().to_string();
                WireResponse { status: 200, content_type: "application/json", body }
            }
            Err(err) => {
                let body = serde_json::json!({ "ok": false, "error": err.to_string() });
                WireResponse { status: 400, content_type: "application/json", body: body.to_string() }
            }
        }
    }

    /// The shared inbound path: dedup, create job, hand to the domain,
    /// settle the acknowledgement, leave the audit trail.
    fn run_inbound(
        &self,
        endpoint: &Endpoint,
        kind: MessageKind,
        payload: Payload,
        external_uid: Option<String>,
        source_ip: Option<String>,
        raw_message: Option<String>,
    ) -> LabResult<InterfaceJob> {
        if self.config.dedup_inbound {
            if let Some(uid) = external_uid.as_deref().filter(|u| !u.is_empty()) {
                if let Some(existing) = self.jobs.find_inbound_by_external_uid(endpoint.id, uid)? {
                    info!(endpoint = %endpoint.code, external_uid = uid, job = %existing.name,
                        "duplicate inbound delivery matched existing job");
                    self.audit.append(
                        AuditEntry::new(
                            AuditAction::Ingest,
                            JobDirection::Inbound,
                            endpoint.id,
                            &self.config.audit_actor,
                        )
                        .with_job(existing.id, existing.state.as_str())
                        .with_external_uid(external_uid.clone())
                        .with_source_ip(source_ip)
                        .with_result("duplicate delivery, matched existing job"),
                    )?;
                    return Ok(existing);
                }
            }
        }

        let mut job = InterfaceJob::new_inbound(
            endpoint.id,
            kind,
            payload.to_value(),
            external_uid.clone(),
            source_ip.clone(),
            raw_message,
        );
        self.jobs.insert(job.clone())?;
        self.audit.append(
            AuditEntry::new(
                AuditAction::Ingest,
                JobDirection::Inbound,
                endpoint.id,
                &self.config.audit_actor,
            )
            .with_job(job.id, job.state.as_str())
            .with_external_uid(external_uid)
            .with_source_ip(source_ip)
            .with_payload(job.payload.clone()),
        )?;

        job.start_processing()?;
        self.jobs.update(&job)?;
        self.settle_domain_ingest(endpoint, &mut job, kind, &payload)?;
        Ok(job)
    }

    /// Runs the domain hand-over for an inbound job and records the
    /// outcome: receipt → done/AA, rejection → done/AE, failure → failed/AR.
    fn settle_domain_ingest(
        &self,
        endpoint: &Endpoint,
        job: &mut InterfaceJob,
        kind: MessageKind,
        payload: &Payload,
    ) -> LabResult<()> {
        match self.gateway.ingest(kind, payload) {
            Ok(receipt) => {
                if !receipt.entity_ref.is_empty() {
                    job.entity_ref = Some(receipt.entity_ref.clone());
                }
                job.complete(AckCode::Aa, None)?;
                self.jobs.update(job)?;
                info!(endpoint = %endpoint.code, job = %job.name, entity = %receipt.entity_ref,
                    "inbound message accepted");
                self.audit.append(
                    AuditEntry::new(
                        AuditAction::Process,
                        JobDirection::Inbound,
                        endpoint.id,
                        &self.config.audit_actor,
                    )
                    .with_job(job.id, job.state.as_str())
                    .with_result(&receipt.detail),
                )?;
            }
            Err(GatewayError::Rejected(reason)) => {
                job.complete(AckCode::Ae, Some(reason.clone()))?;
                self.jobs.update(job)?;
                warn!(endpoint = %endpoint.code, job = %job.name, %reason,
                    "inbound message rejected by the domain");
                self.audit.append(
                    AuditEntry::new(
                        AuditAction::Process,
                        JobDirection::Inbound,
                        endpoint.id,
                        &self.config.audit_actor,
                    )
                    .with_job(job.id, job.state.as_str())
                    .with_result(&reason),
                )?;
            }
            Err(GatewayError::Failure(reason)) => {
                job.fail(AckCode::Ar, &reason)?;
                self.jobs.update(job)?;
                warn!(endpoint = %endpoint.code, job = %job.name, %reason,
                    "inbound message failed");
                self.audit.append(
                    AuditEntry::new(
                        AuditAction::Error,
                        JobDirection::Inbound,
                        endpoint.id,
                        &self.config.audit_actor,
                    )
                    .with_job(job.id, job.state.as_str())
                    .with_result(&reason),
                )?;
            }
        }
        Ok(())
    }

    /// Registers a remote acknowledgement for an outbound job.
    pub fn register_outbound_ack(
        &self,
        endpoint_code: &str,
        headers: &AuthHeaders,
        source_ip: Option<String>,
        request: &AckRequest,
    ) -> LabResult<AckResponse> {
        let endpoint = self.resolve_outbound(endpoint_code, headers, source_ip.as_deref())?;

        let Some(ack_code) = request.ack_code else {
            return Ok(AckResponse { ok: false, error: Some("missing ack_code".into()) });
        };
        let Some(mut job) = self.jobs.find_outbound(
            endpoint.id,
            request.job_id,
            request.job_name.as_deref(),
            request.external_uid.as_deref(),
        )?
        else {
            return Ok(AckResponse { ok: false, error: Some("no interface job matched".into()) });
        };

        let message = request.message.as_deref().unwrap_or_default();
        if let Err(err) = job.record_remote_ack(ack_code, message, source_ip.clone()) {
            return Ok(AckResponse { ok: false, error: Some(err.to_string()) });
        }
        self.jobs.update(&job)?;

        let mut entry = AuditEntry::new(
            AuditAction::Ack,
            JobDirection::Outbound,
            endpoint.id,
            &self.config.audit_actor,
        )
        .with_job(job.id, job.state.as_str())
        .with_source_ip(source_ip)
        .with_result(&format!("{}: {message}", ack_code.as_str()));
        if let Some(payload) = request.payload.clone() {
            entry = entry.with_payload(payload);
        }
        self.audit.append(entry)?;
        info!(endpoint = %endpoint.code, job = %job.name, code = %ack_code,
            "remote acknowledgement registered");

        Ok(AckResponse { ok: true, error: None })
    }

    /// Creates a pending outbound job. Nothing is delivered until
    /// [`process_job`](Self::process_job) runs it.
    pub fn enqueue_outbound(
        &self,
        endpoint_code: &str,
        kind: MessageKind,
        payload: &Payload,
        entity_ref: Option<String>,
    ) -> LabResult<InterfaceJob> {
        let endpoint = self
            .endpoints
            .find_active_by_code(endpoint_code)?
            .ok_or(LabError::EndpointNotFound)?;
        if !endpoint.direction.allows_outbound() {
            return Err(LabError::DirectionNotAllowed);
        }
        let job = InterfaceJob::new_outbound(endpoint.id, kind, payload.to_value(), entity_ref);
        self.jobs.insert(job.clone())?;
        Ok(job)
    }

    /// Runs one attempt of a pending job.
    ///
    /// Outbound jobs render wire bytes and deliver through the transport;
    /// inbound jobs (replay) re-run the domain hand-over from the payload
    /// snapshot.
    pub fn process_job(&self, job_id: Uuid) -> LabResult<InterfaceJob> {
        let mut job = self.jobs.get(job_id)?.ok_or(LabError::JobNotFound)?;
        let endpoint = self
            .endpoints
            .get(job.endpoint_id)?
            .ok_or(LabError::EndpointNotFound)?;

        job.start_processing()?;
        self.jobs.update(&job)?;

        match job.direction {
            JobDirection::Inbound => {
                let payload = Payload::from_value(job.message_type, job.payload.clone());
                let kind = job.message_type;
                self.settle_domain_ingest(&endpoint, &mut job, kind, &payload)?;
            }
            JobDirection::Outbound => {
                let payload = Payload::from_value(job.message_type, job.payload.clone());
                let body = match endpoint.protocol {
                    Protocol::Hl7v2 => Hl7::build_message(&payload, &endpoint.code, &job.name),
                    Protocol::Fhir => Fhir::build_resource(&payload, &job.name).to_string(),
                    _ => payload.to_value().to_string(),
                };
                self.settle_delivery(&endpoint, &mut job, &body)?;
            }
        }
        Ok(job)
    }

    fn settle_delivery(
        &self,
        endpoint: &Endpoint,
        job: &mut InterfaceJob,
        body: &str,
    ) -> LabResult<()> {
        match self.transport.deliver(endpoint, body) {
            Ok(receipt) => match receipt.ack_code {
                Some(code @ (AckCode::Ae | AckCode::Ar)) => {
                    job.fail(code, &receipt.detail)?;
                    self.jobs.update(job)?;
                    warn!(endpoint = %endpoint.code, job = %job.name, code = %code,
                        detail = %receipt.detail, "outbound delivery refused by remote");
                    self.audit.append(
                        AuditEntry::new(
                            AuditAction::Process,
                            JobDirection::Outbound,
                            endpoint.id,
                            &self.config.audit_actor,
                        )
                        .with_job(job.id, job.state.as_str())
                        .with_result(&receipt.detail),
                    )?;
                }
                _ => {
                    job.complete(AckCode::Aa, None)?;
                    self.jobs.update(job)?;
                    info!(endpoint = %endpoint.code, job = %job.name, "outbound delivery accepted");
                    self.audit.append(
                        AuditEntry::new(
                            AuditAction::Process,
                            JobDirection::Outbound,
                            endpoint.id,
                            &self.config.audit_actor,
                        )
                        .with_job(job.id, job.state.as_str())
                        .with_result("delivered"),
                    )?;
                }
            },
            Err(detail) => {
                job.fail(AckCode::Ar, &detail)?;
                self.jobs.update(job)?;
                warn!(endpoint = %endpoint.code, job = %job.name, %detail,
                    "outbound delivery failed");
                self.audit.append(
                    AuditEntry::new(
                        AuditAction::Error,
                        JobDirection::Outbound,
                        endpoint.id,
                        &self.config.audit_actor,
                    )
                    .with_job(job.id, job.state.as_str())
                    .with_result(&detail),
                )?;
            }
        }
        Ok(())
    }

    /// Requeues a failed or dead-lettered job and re-attempts it exactly
    /// once.
    pub fn requeue_job(&self, job_id: Uuid) -> LabResult<InterfaceJob> {
        let mut job = self.jobs.get(job_id)?.ok_or(LabError::JobNotFound)?;
        let endpoint_id = job.endpoint_id;
        job.requeue()?;
        self.jobs.update(&job)?;
        self.audit.append(
            AuditEntry::new(
                AuditAction::Requeue,
                job.direction,
                endpoint_id,
                &self.config.audit_actor,
            )
            .with_job(job.id, job.state.as_str())
            .with_result(&format!("retry {}", job.retry_count)),
        )?;
        self.process_job(job_id)
    }

    /// Cancels a job that has not reached a terminal state. The record and
    /// its audit trail survive; the job just stops being eligible for any
    /// further attempt.
    pub fn cancel_job(&self, job_id: Uuid) -> LabResult<InterfaceJob> {
        let mut job = self.jobs.get(job_id)?.ok_or(LabError::JobNotFound)?;
        job.cancel()?;
        self.jobs.update(&job)?;
        info!(job = %job.name, "job cancelled");
        self.audit.append(
            AuditEntry::new(
                AuditAction::Process,
                job.direction,
                job.endpoint_id,
                &self.config.audit_actor,
            )
            .with_job(job.id, job.state.as_str())
            .with_result("cancelled by operator"),
        )?;
        Ok(job)
    }

    /// Moves failed jobs that have exhausted their endpoint's retry budget
    /// to the dead-letter state. Returns the ids of the escalated jobs.
    pub fn run_escalation(&self) -> LabResult<Vec<Uuid>> {
        let failed = self.jobs.query(&JobQuery {
            states: vec![JobState::Failed],
            ..Default::default()
        })?;

        let mut escalated = Vec::new();
        for mut job in failed {
            let Some(endpoint) = self.endpoints.get(job.endpoint_id)? else {
                continue;
            };
            if !endpoint.dead_letter_enabled || job.retry_count < endpoint.retry_limit {
                continue;
            }
            let reason = format!(
                "retry limit reached ({} of {})",
                job.retry_count, endpoint.retry_limit
            );
            job.escalate_to_dead_letter(&reason)?;
            self.jobs.update(&job)?;
            warn!(endpoint = %endpoint.code, job = %job.name, "job moved to dead letter");
            self.audit.append(
                AuditEntry::new(
                    AuditAction::Error,
                    job.direction,
                    endpoint.id,
                    &self.config.audit_actor,
                )
                .with_job(job.id, job.state.as_str())
                .with_result(&reason),
            )?;
            escalated.push(job.id);
        }
        Ok(escalated)
    }

    pub fn list_jobs(&self, query: &JobQuery) -> LabResult<Vec<InterfaceJob>> {
        self.jobs.query(query)
    }

    pub fn list_audit(
        &self,
        endpoint_id: Option<Uuid>,
        job_id: Option<Uuid>,
    ) -> LabResult<Vec<AuditEntry>> {
        self.audit.list(endpoint_id, job_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{AuthConfig, Direction};
    use crate::memory::{
        InMemoryAuditLog, InMemoryDomainGateway, InMemoryEndpointRegistry, InMemoryJobStore,
        SimulatedTransport,
    };
    use lir_types::{OrderLine, OrderPayload};

    struct Fixture {
        service: InterfaceService,
        gateway: Arc<InMemoryDomainGateway>,
        transport: Arc<SimulatedTransport>,
    }

    fn fixture_with(endpoints: Vec<Endpoint>, transport: SimulatedTransport) -> Fixture {
        let gateway = Arc::new(InMemoryDomainGateway::with_defaults());
        let transport = Arc::new(transport);
        let service = InterfaceService::new(
            Arc::new(InMemoryEndpointRegistry::with_endpoints(endpoints)),
            Arc::new(InMemoryJobStore::new()),
            Arc::new(InMemoryAuditLog::new()),
            Arc::clone(&gateway) as Arc<dyn DomainGateway>,
            Arc::clone(&transport) as Arc<dyn DeliveryTransport>,
            CoreConfig::default(),
        );
        Fixture { service, gateway, transport }
    }

    fn fixture(endpoints: Vec<Endpoint>) -> Fixture {
        fixture_with(endpoints, SimulatedTransport::accepting())
    }

    fn order_value() -> serde_json::Value {
        serde_json::json!({
            "patient_name": "John Doe",
            "priority": "routine",
            "sample_type": "blood",
            "lines": [{ "service_code": "GLU", "qty": 1 }]
        })
    }

    #[test]
    fn structured_ingest_accepts_a_valid_order() {
        let fx = fixture(vec![Endpoint::new("HIS1", Direction::Inbound, Protocol::Rest)]);
        let response = fx
            .service
            .ingest_structured(
                "HIS1",
                &AuthHeaders::default(),
                Some("10.0.0.1".into()),
                MessageKind::Order,
                order_value(),
                Some("MSG-1".into()),
                None,
            )
            .expect("ingest");

        assert!(response.ok);
        assert_eq!(response.ack_code, Some(AckCode::Aa));
        assert_eq!(response.state, Some(JobState::Done));

        let audit = fx.service.list_audit(None, response.job_id).expect("audit");
        let actions: Vec<AuditAction> = audit.iter().map(|e| e.action).collect();
        assert_eq!(actions, vec![AuditAction::Ingest, AuditAction::Process]);
    }

    #[test]
    fn short_circuits_leave_no_trace() {
        let mut secured = Endpoint::new("HIS1", Direction::Inbound, Protocol::Rest);
        secured.auth = AuthConfig::Bearer { token: Some("s3cret".into()) };
        let fx = fixture(vec![secured]);

        let unknown = fx.service.ingest_structured(
            "NOPE",
            &AuthHeaders::default(),
            None,
            MessageKind::Order,
            order_value(),
            None,
            None,
        );
        assert!(matches!(unknown, Err(LabError::EndpointNotFound)));

        let unauthorised = fx.service.ingest_structured(
            "HIS1",
            &AuthHeaders::bearer("wrong"),
            None,
            MessageKind::Order,
            order_value(),
            None,
            None,
        );
        assert!(matches!(unauthorised, Err(LabError::Unauthorized)));

        assert!(fx.service.list_audit(None, None).expect("audit").is_empty());
        assert!(fx
            .service
            .list_jobs(&JobQuery::default())
            .expect("jobs")
            .is_empty());
    }

    #[test]
    fn direction_gate_refuses_inbound_on_outbound_endpoints() {
        let fx = fixture(vec![Endpoint::new("EXT1", Direction::Outbound, Protocol::Rest)]);
        let result = fx.service.ingest_structured(
            "EXT1",
            &AuthHeaders::default(),
            None,
            MessageKind::Order,
            order_value(),
            None,
            None,
        );
        assert!(matches!(result, Err(LabError::DirectionNotAllowed)));
    }

    #[test]
    fn source_ip_allow_list_refuses_unlisted_callers() {
        let mut endpoint = Endpoint::new("HIS1", Direction::Inbound, Protocol::Rest);
        endpoint.allowed_ips = vec!["10.0.0.1".into()];
        let fx = fixture(vec![endpoint]);

        let refused = fx.service.ingest_structured(
            "HIS1",
            &AuthHeaders::default(),
            Some("10.9.9.9".into()),
            MessageKind::Order,
            order_value(),
            None,
            None,
        );
        assert!(matches!(refused, Err(LabError::SourceIpNotAllowed)));
    }

    #[test]
    fn domain_rejection_completes_with_ae() {
        let fx = fixture(vec![Endpoint::new("HIS1", Direction::Inbound, Protocol::Rest)]);
        let response = fx
            .service
            .ingest_structured(
                "HIS1",
                &AuthHeaders::default(),
                None,
                MessageKind::Order,
                serde_json::json!({ "lines": [{ "service_code": "NOPE" }] }),
                None,
                None,
            )
            .expect("ingest");

        assert!(!response.ok);
        assert_eq!(response.ack_code, Some(AckCode::Ae));
        assert_eq!(response.state, Some(JobState::Done));
        assert_eq!(response.error.as_deref(), Some("no valid service lines"));
    }

    #[test]
    fn domain_failure_fails_with_ar() {
        let fx = fixture(vec![Endpoint::new("HIS1", Direction::Inbound, Protocol::Rest)]);
        fx.gateway.set_outage(true);

        let response = fx
            .service
            .ingest_structured(
                "HIS1",
                &AuthHeaders::default(),
                None,
                MessageKind::Order,
                order_value(),
                None,
                None,
            )
            .expect("ingest");

        assert_eq!(response.ack_code, Some(AckCode::Ar));
        assert_eq!(response.state, Some(JobState::Failed));

        let audit = fx.service.list_audit(None, response.job_id).expect("audit");
        assert!(audit.iter().any(|e| e.action == AuditAction::Error));
    }

    #[test]
    fn duplicate_external_uid_matches_the_existing_job() {
        let fx = fixture(vec![Endpoint::new("HIS1", Direction::Inbound, Protocol::Rest)]);
        let first = fx
            .service
            .ingest_structured(
                "HIS1",
                &AuthHeaders::default(),
                None,
                MessageKind::Order,
                order_value(),
                Some("MSG-1".into()),
                None,
            )
            .expect("first");
        let second = fx
            .service
            .ingest_structured(
                "HIS1",
                &AuthHeaders::default(),
                None,
                MessageKind::Order,
                order_value(),
                Some("MSG-1".into()),
                None,
            )
            .expect("second");

        assert_eq!(first.job_id, second.job_id);
        assert_eq!(fx.service.list_jobs(&JobQuery::default()).expect("jobs").len(), 1);
    }

    #[test]
    fn structured_ingest_keeps_the_raw_snapshot() {
        let fx = fixture(vec![Endpoint::new("HIS1", Direction::Inbound, Protocol::Rest)]);
        let response = fx
            .service
            .ingest_structured(
                "HIS1",
                &AuthHeaders::default(),
                None,
                MessageKind::Order,
                order_value(),
                Some("MSG-9".into()),
                Some("ORM|GLU|original wire text".into()),
            )
            .expect("ingest");

        let stored = fx
            .service
            .job_repository()
            .get(response.job_id.expect("job id"))
            .expect("get")
            .expect("present");
        assert_eq!(stored.raw_message.as_deref(), Some("ORM|GLU|original wire text"));
    }

    #[test]
    fn raw_hl7_order_returns_an_aa_ack() {
        let fx = fixture(vec![Endpoint::new("HIS1", Direction::Inbound, Protocol::Hl7v2)]);
        let raw = "MSH|^~\\&|HIS|HOSP|LAB|LAB|20250101120000||ORM^O01|CTRL1|P|2.5\rPID|1||12345||Doe^John\rOBR|1|PLACER1||GLU^Glucose\r";

        let response =
            fx.service
                .ingest_raw("HIS1", &AuthHeaders::default(), Some("10.0.0.1".into()), raw);

        assert_eq!(response.status, 200);
        assert_eq!(response.content_type, "text/plain");
        assert!(response.body.starts_with("MSH|"));
        assert!(response.body.contains("MSA|AA|CTRL1"));
    }

    #[test]
    fn raw_hl7_garbage_returns_a_400_ar_ack() {
        let fx = fixture(vec![Endpoint::new("HIS1", Direction::Inbound, Protocol::Hl7v2)]);
        let response =
            fx.service
                .ingest_raw("HIS1", &AuthHeaders::default(), None, "PID|not first\r");

        assert_eq!(response.status, 400);
        assert!(response.body.contains("MSA|AR|"));
    }

    #[test]
    fn raw_unknown_endpoint_is_a_plain_404() {
        let fx = fixture(vec![]);
        let response = fx.service.ingest_raw("NOPE", &AuthHeaders::default(), None, "MSH|...");
        assert_eq!(response.status, 404);
        assert_eq!(response.content_type, "text/plain");
        assert_eq!(response.body, "endpoint_not_found");
    }

    #[test]
    fn raw_fhir_profile_violation_returns_a_400_outcome() {
        let fx = fixture(vec![Endpoint::new("FHIR1", Direction::Inbound, Protocol::Fhir)]);
        let body = serde_json::json!({
            "resourceType": "Observation",
            "id": "obs-1",
            "valueString": "5.4"
        })
        .to_string();

        let response = fx.service.ingest_raw("FHIR1", &AuthHeaders::default(), None, &body);
        assert_eq!(response.status, 400);
        assert_eq!(response.content_type, "application/fhir+json");
        assert!(response.body.contains("code.coding"));
    }

    #[test]
    fn raw_passthrough_defaults_the_message_type_to_order() {
        let fx = fixture(vec![Endpoint::new("MISC1", Direction::Inbound, Protocol::Rest)]);
        let body = serde_json::json!({
            "external_uid": "X-1",
            "payload": { "lines": [{ "service_code": "GLU" }] }
        })
        .to_string();

        let response = fx.service.ingest_raw("MISC1", &AuthHeaders::default(), None, &body);
        assert_eq!(response.status, 200);
        assert_eq!(response.content_type, "application/json");
        let parsed: serde_json::Value = serde_json::from_str(&response.body).expect("json");
        assert_eq!(parsed["ok"], serde_json::Value::Bool(true));
        assert_eq!(parsed["ack_code"], serde_json::Value::String("AA".into()));
    }

    #[test]
    fn outbound_job_delivers_rendered_hl7() {
        let fx = fixture(vec![Endpoint::new("EXT1", Direction::Outbound, Protocol::Hl7v2)]);
        let payload = Payload::Order(OrderPayload {
            patient_name: "John Doe".into(),
            lines: vec![OrderLine { service_code: "GLU".into(), qty: 1 }],
            ..Default::default()
        });

        let job = fx
            .service
            .enqueue_outbound("EXT1", MessageKind::Order, &payload, Some("LR/1".into()))
            .expect("enqueue");
        assert_eq!(job.state, JobState::Pending);

        let job = fx.service.process_job(job.id).expect("process");
        assert_eq!(job.state, JobState::Done);
        assert_eq!(job.ack_code, Some(AckCode::Aa));

        let bodies = fx.transport.delivered_bodies();
        assert_eq!(bodies.len(), 1);
        assert!(bodies[0].starts_with("MSH|"));
        assert!(bodies[0].contains("ORM^O01"));
    }

    #[test]
    fn transport_failure_fails_the_job_and_requeue_retries_once() {
        let fx = fixture_with(
            vec![Endpoint::new("EXT1", Direction::Outbound, Protocol::Hl7v2)],
            SimulatedTransport::failing("connection refused"),
        );
        let payload = Payload::Order(OrderPayload {
            lines: vec![OrderLine { service_code: "GLU".into(), qty: 1 }],
            ..Default::default()
        });

        let job = fx
            .service
            .enqueue_outbound("EXT1", MessageKind::Order, &payload, None)
            .expect("enqueue");
        let job = fx.service.process_job(job.id).expect("process");
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.error_message.as_deref(), Some("connection refused"));

        fx.transport.now_accepting();
        let job = fx.service.requeue_job(job.id).expect("requeue");
        assert_eq!(job.state, JobState::Done);
        assert_eq!(job.retry_count, 1);
        assert_eq!(fx.transport.delivered_bodies().len(), 1);
    }

    #[test]
    fn remote_ack_matches_by_name_and_records_the_outcome() {
        let fx = fixture(vec![Endpoint::new("EXT1", Direction::Bidirectional, Protocol::Rest)]);
        let payload = Payload::Result(Default::default());
        let job = fx
            .service
            .enqueue_outbound("EXT1", MessageKind::Report, &payload, None)
            .expect("enqueue");
        let job = fx.service.process_job(job.id).expect("process");
        assert_eq!(job.state, JobState::Done);

        let response = fx
            .service
            .register_outbound_ack(
                "EXT1",
                &AuthHeaders::default(),
                Some("10.2.2.2".into()),
                &AckRequest {
                    ack_code: Some(AckCode::Ae),
                    job_name: Some(job.name.clone()),
                    message: Some("schema mismatch".into()),
                    ..Default::default()
                },
            )
            .expect("register");
        assert!(response.ok);

        let stored = fx
            .service
            .job_repository()
            .get(job.id)
            .expect("get")
            .expect("present");
        // Recorded, but the finished job stays done.
        assert_eq!(stored.state, JobState::Done);
        assert_eq!(stored.ack_code, Some(AckCode::Ae));
        assert_eq!(stored.error_message.as_deref(), Some("schema mismatch"));
        assert!(stored.ack_received_at.is_some());
    }

    #[test]
    fn remote_ack_with_no_match_reports_it() {
        let fx = fixture(vec![Endpoint::new("EXT1", Direction::Outbound, Protocol::Rest)]);
        let response = fx
            .service
            .register_outbound_ack(
                "EXT1",
                &AuthHeaders::default(),
                None,
                &AckRequest { ack_code: Some(AckCode::Aa), ..Default::default() },
            )
            .expect("register");
        assert!(!response.ok);
        assert_eq!(response.error.as_deref(), Some("no interface job matched"));
    }

    #[test]
    fn escalation_moves_exhausted_jobs_to_dead_letter() {
        let mut endpoint = Endpoint::new("EXT1", Direction::Outbound, Protocol::Rest);
        endpoint.retry_limit = 1;
        let fx = fixture_with(vec![endpoint], SimulatedTransport::failing("down"));
        let payload = Payload::Result(Default::default());

        let job = fx
            .service
            .enqueue_outbound("EXT1", MessageKind::Report, &payload, None)
            .expect("enqueue");
        fx.service.process_job(job.id).expect("process");
        let job = fx.service.requeue_job(job.id).expect("requeue");
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.retry_count, 1);

        let escalated = fx.service.run_escalation().expect("escalation");
        assert_eq!(escalated, vec![job.id]);
        let stored = fx
            .service
            .job_repository()
            .get(job.id)
            .expect("get")
            .expect("present");
        assert_eq!(stored.state, JobState::DeadLetter);
        assert!(stored.dead_letter_reason.is_some());
    }

    #[test]
    fn escalation_skips_endpoints_without_dead_lettering() {
        let mut endpoint = Endpoint::new("EXT1", Direction::Outbound, Protocol::Rest);
        endpoint.retry_limit = 0;
        endpoint.dead_letter_enabled = false;
        let fx = fixture_with(vec![endpoint], SimulatedTransport::failing("down"));
        let payload = Payload::Result(Default::default());

        let job = fx
            .service
            .enqueue_outbound("EXT1", MessageKind::Report, &payload, None)
            .expect("enqueue");
        fx.service.process_job(job.id).expect("process");

        assert!(fx.service.run_escalation().expect("escalation").is_empty());
    }

    #[test]
    fn cancel_stops_a_pending_job_for_good() {
        let fx = fixture(vec![Endpoint::new("EXT1", Direction::Outbound, Protocol::Rest)]);
        let payload = Payload::Result(Default::default());
        let job = fx
            .service
            .enqueue_outbound("EXT1", MessageKind::Report, &payload, None)
            .expect("enqueue");

        let job = fx.service.cancel_job(job.id).expect("cancel");
        assert_eq!(job.state, JobState::Cancel);
        assert!(fx.service.process_job(job.id).is_err());
        assert!(fx.service.cancel_job(job.id).is_err());

        let audit = fx.service.list_audit(None, Some(job.id)).expect("audit");
        let entry = audit.last().expect("entry");
        assert_eq!(entry.result.as_deref(), Some("cancelled by operator"));
        assert_eq!(entry.state.as_deref(), Some("cancel"));
    }

    #[test]
    fn cancel_refuses_a_finished_job() {
        let fx = fixture(vec![Endpoint::new("HIS1", Direction::Inbound, Protocol::Rest)]);
        let response = fx
            .service
            .ingest_structured(
                "HIS1",
                &AuthHeaders::default(),
                None,
                MessageKind::Order,
                order_value(),
                None,
                None,
            )
            .expect("ingest");
        assert_eq!(response.state, Some(JobState::Done));

        let refused = fx.service.cancel_job(response.job_id.expect("job id"));
        assert!(matches!(
            refused,
            Err(LabError::InvalidTransition { from: JobState::Done, .. })
        ));
    }
}
