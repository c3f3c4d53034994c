//! # LIR Core
//!
//! Core machinery for the laboratory interface relay:
//! - endpoint registry and request authentication
//! - the interface-job state machine (retry, requeue, dead-letter)
//! - the ingestion pipeline orchestrating authenticate → parse → ingest →
//!   acknowledge
//! - append-only audit trail, replay batches and reconciliation reports
//!
//! **No API concerns**: HTTP routing, serialisation of wire responses and
//! OpenAPI documentation belong in `api-rest`.

pub mod audit;
pub mod auth;
pub mod config;
pub mod domain;
pub mod endpoint;
pub mod job;
pub mod memory;
pub mod pipeline;
pub mod reconciliation;
pub mod replay;
pub mod repository;

pub use audit::{AuditAction, AuditEntry};
pub use auth::AuthHeaders;
pub use config::CoreConfig;
pub use domain::{DeliveryReceipt, DeliveryTransport, DomainGateway, DomainReceipt, GatewayError};
pub use endpoint::{AuthConfig, Direction, Endpoint, FieldMapRule, Protocol};
pub use job::{InterfaceJob, JobDirection, JobState};
pub use pipeline::{AckRequest, AckResponse, IngestResponse, InterfaceService, WireResponse};
pub use reconciliation::ReconciliationReport;
pub use replay::{ReplayBatch, ReplayState};
pub use repository::{AuditLogRepository, EndpointRepository, JobQuery, JobRepository};

/// Errors surfaced by the interface relay core.
///
/// The first three variants render exactly as the wire error tokens the
/// short-circuit paths return to callers.
#[derive(Debug, thiserror::Error)]
pub enum LabError {
    #[error("endpoint_not_found")]
    EndpointNotFound,
    #[error("direction_not_allowed")]
    DirectionNotAllowed,
    #[error("unauthorized")]
    Unauthorized,
    #[error("source IP is not allowed for this endpoint")]
    SourceIpNotAllowed,
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("domain rejected message: {0}")]
    DomainRejection(String),
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("no interface job matched")]
    JobNotFound,
    #[error("invalid job transition: {action} from {from}")]
    InvalidTransition { from: JobState, action: &'static str },
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<hl7::Hl7Error> for LabError {
    fn from(err: hl7::Hl7Error) -> Self {
        Self::Protocol(err.to_string())
    }
}

impl From<fhir::FhirError> for LabError {
    fn from(err: fhir::FhirError) -> Self {
        Self::Protocol(err.to_string())
    }
}

pub type LabResult<T> = std::result::Result<T, LabError>;
