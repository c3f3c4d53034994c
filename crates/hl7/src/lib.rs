//! HL7 v2.x wire support for the laboratory interface relay.
//!
//! This crate provides the pipe-delimited segment grammar and the
//! parse/build pair between HL7 wire text and the canonical message model:
//! - `Hl7Message`: segment/field/component/subcomponent access with a
//!   deliberately lenient read policy (missing data reads as empty, never
//!   as an error)
//! - `Hl7`: facade for parsing inbound messages, building outbound ORM/ORU
//!   messages and rendering MSH/MSA acknowledgements
//!
//! The codec is stateless; endpoint-specific field maps are passed in by
//! the caller.

pub mod codec;
pub mod segments;

pub use codec::Hl7;
pub use segments::Hl7Message;

/// Errors returned by the HL7 boundary crate.
#[derive(Debug, thiserror::Error)]
pub enum Hl7Error {
    /// The wire text is not an HL7 message at all (no leading MSH segment).
    #[error("invalid HL7 message: missing MSH segment")]
    MalformedMessage,
}

/// Type alias for Results that can fail with an [`Hl7Error`].
pub type Hl7Result<T> = Result<T, Hl7Error>;
