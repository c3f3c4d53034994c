//! Shared vocabulary for the laboratory interface relay.
//!
//! This crate holds the protocol-agnostic types every other crate speaks:
//! message kinds, acknowledgement codes and the canonical message model that
//! the HL7 and FHIR codecs parse into and build from. No I/O lives here.

pub mod message;

pub use message::{
    CanonicalMessage, OrderLine, OrderPayload, Payload, ResultLine, ResultPayload,
};

/// Errors for the shared vocabulary types.
#[derive(Debug, thiserror::Error)]
pub enum TypesError {
    /// A string did not match any known enum value.
    #[error("unknown value: {0}")]
    UnknownValue(String),
}

/// HL7-style acknowledgement code for a message exchange.
///
/// `AA` accepts, `AE` signals an application error (the message was
/// understood but not actionable), `AR` rejects at the transport level.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum AckCode {
    #[serde(rename = "AA")]
    Aa,
    #[serde(rename = "AE")]
    Ae,
    #[serde(rename = "AR")]
    Ar,
}

impl AckCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Aa => "AA",
            Self::Ae => "AE",
            Self::Ar => "AR",
        }
    }

    /// Parses an acknowledgement code, case-insensitively.
    pub fn parse(s: &str) -> Result<Self, TypesError> {
        match s.to_uppercase().as_str() {
            "AA" => Ok(Self::Aa),
            "AE" => Ok(Self::Ae),
            "AR" => Ok(Self::Ar),
            _ => Err(TypesError::UnknownValue(s.to_string())),
        }
    }
}

impl std::fmt::Display for AckCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of message carried by an interface job.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Order,
    Result,
    Report,
    Ack,
    Patient,
    Qc,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Order => "order",
            Self::Result => "result",
            Self::Report => "report",
            Self::Ack => "ack",
            Self::Patient => "patient",
            Self::Qc => "qc",
        }
    }

    pub fn parse(s: &str) -> Result<Self, TypesError> {
        match s.to_lowercase().as_str() {
            "order" => Ok(Self::Order),
            "result" => Ok(Self::Result),
            "report" => Ok(Self::Report),
            "ack" => Ok(Self::Ack),
            "patient" => Ok(Self::Patient),
            "qc" => Ok(Self::Qc),
            _ => Err(TypesError::UnknownValue(s.to_string())),
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
