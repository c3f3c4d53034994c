//! FHIR R4 wire/boundary support for the laboratory interface relay.
//!
//! This crate provides validation and translation between FHIR JSON
//! resources and the canonical message model:
//! - minimal structural profile checks for `ServiceRequest`, `Observation`
//!   and `DiagnosticReport`
//! - parsing supported resources into canonical orders/results
//! - building outbound `ServiceRequest`/`DiagnosticReport` resources and
//!   `OperationOutcome` acknowledgements
//!
//! Resources are handled as `serde_json::Value` rather than strict wire
//! structs: the profiles here are deliberately lenient, and partner payloads
//! routinely carry fields we must ignore rather than reject.

pub mod resources;

pub use resources::Fhir;

/// Errors returned by the FHIR boundary crate.
#[derive(Debug, thiserror::Error)]
pub enum FhirError {
    /// The body was not parseable JSON at all.
    #[error("invalid FHIR JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    /// The resource is structurally short of its minimal profile.
    #[error("FHIR profile violation: {0}")]
    ProfileViolation(String),

    /// A resource type this relay does not handle.
    #[error("unsupported FHIR resourceType: {0}")]
    UnsupportedResource(String),
}

/// Type alias for Results that can fail with a [`FhirError`].
pub type FhirResult<T> = Result<T, FhirError>;
