//! Boundaries to the rest of the system.
//!
//! `DomainGateway` is the seam between the relay and the laboratory domain:
//! the pipeline hands over a canonical payload and gets back either a
//! receipt, a business rejection, or a failure. `DeliveryTransport` is the
//! seam on the way out: it moves rendered wire bytes to the remote system
//! and reports what the remote said.

use chrono::{DateTime, Utc};
use lir_types::{AckCode, MessageKind, Payload};

/// The domain accepted a message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DomainReceipt {
    /// Reference to the entity the message created or updated.
    pub entity_ref: String,
    pub detail: String,
}

/// The domain did not accept a message.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    /// Understood but not actionable. The exchange itself succeeded, so the
    /// job completes with a negative application ack.
    #[error("{0}")]
    Rejected(String),
    /// The domain could not be reached or errored out. The exchange failed
    /// and the job is eligible for retry.
    #[error("{0}")]
    Failure(String),
}

/// An outbound delivery the domain expects to have happened, used by
/// reconciliation to flag deliveries that never went out.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExpectedEvent {
    pub entity_ref: String,
    pub kind: MessageKind,
    pub at: DateTime<Utc>,
}

/// The laboratory domain as the relay sees it.
pub trait DomainGateway: Send + Sync {
    /// Hands an inbound payload to the domain.
    fn ingest(&self, kind: MessageKind, payload: &Payload) -> Result<DomainReceipt, GatewayError>;

    /// Outbound deliveries the domain expected within the period.
    fn expected_outbound_events(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Vec<ExpectedEvent>;
}

/// What the remote system answered to an outbound delivery.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeliveryReceipt {
    /// Application-level acknowledgement, when the remote returned one
    /// synchronously. `None` means delivered with no immediate ack.
    pub ack_code: Option<AckCode>,
    pub detail: String,
}

impl DeliveryReceipt {
    pub fn accepted() -> Self {
        Self { ack_code: Some(AckCode::Aa), detail: String::new() }
    }
}

/// Moves rendered wire bytes to a remote endpoint.
///
/// Implementations return `Err` only for transport-level failures (cannot
/// connect, timed out); a reachable remote that rejects the message is an
/// `Ok` receipt with a negative ack code.
pub trait DeliveryTransport: Send + Sync {
    fn deliver(
        &self,
        endpoint: &crate::endpoint::Endpoint,
        body: &str,
    ) -> Result<DeliveryReceipt, String>;
}
