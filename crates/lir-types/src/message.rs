//! Canonical message model.
//!
//! Every protocol codec parses into, and builds from, this shape, so the
//! ingestion pipeline and outbound dispatch never branch on protocol beyond
//! "which codec to call". Payloads are typed per message kind, with a
//! flattened `extra` map as the escape hatch for per-endpoint field-map
//! overrides that introduce keys the typed model does not know about.

use crate::MessageKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One parsed inbound (or renderable outbound) message.
#[derive(Clone, Debug, PartialEq)]
pub struct CanonicalMessage {
    pub payload: Payload,
    /// Remote correlation id (HL7 control id, FHIR resource id).
    pub external_uid: Option<String>,
    /// Protocol-level detail that is worth keeping but not acting on.
    pub meta: BTreeMap<String, String>,
}

impl CanonicalMessage {
    pub fn kind(&self) -> MessageKind {
        self.payload.kind()
    }
}

/// Message payload, tagged by message kind.
#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    Order(OrderPayload),
    Result(ResultPayload),
    /// REST/JSON passthrough for endpoints without a structured protocol.
    Other(serde_json::Map<String, serde_json::Value>),
}

impl Payload {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Order(_) => MessageKind::Order,
            Self::Result(_) => MessageKind::Result,
            Self::Other(_) => MessageKind::Order,
        }
    }

    /// Serialises the payload for snapshotting into jobs and audit entries.
    pub fn to_value(&self) -> serde_json::Value {
        match self {
            Self::Order(p) => serde_json::to_value(p).unwrap_or_default(),
            Self::Result(p) => serde_json::to_value(p).unwrap_or_default(),
            Self::Other(map) => serde_json::Value::Object(map.clone()),
        }
    }

    /// Restores a payload from a job snapshot.
    ///
    /// Restoration is lenient: missing fields default to empty so a partial
    /// snapshot degrades to missing data rather than a hard error.
    pub fn from_value(kind: MessageKind, value: serde_json::Value) -> Self {
        match kind {
            MessageKind::Order => serde_json::from_value::<OrderPayload>(value)
                .map(Self::Order)
                .unwrap_or_else(|_| Self::Order(OrderPayload::default())),
            MessageKind::Result | MessageKind::Report => {
                serde_json::from_value::<ResultPayload>(value)
                    .map(Self::Result)
                    .unwrap_or_else(|_| Self::Result(ResultPayload::default()))
            }
            _ => match value {
                serde_json::Value::Object(map) => Self::Other(map),
                _ => Self::Other(serde_json::Map::new()),
            },
        }
    }

    /// Applies one field-map override.
    ///
    /// Known scalar fields are overwritten in place; anything else lands in
    /// the payload's `extra` map. Callers apply overrides in rule order, so
    /// the last write wins.
    pub fn set_field(&mut self, key: &str, value: String) {
        match self {
            Self::Order(p) => match key {
                "patient_name" => p.patient_name = value,
                "priority" => p.priority = value,
                "sample_type" => p.sample_type = value,
                _ => {
                    p.extra.insert(key.to_string(), serde_json::Value::String(value));
                }
            },
            Self::Result(p) => match key {
                "accession" => p.accession = value,
                _ => {
                    p.extra.insert(key.to_string(), serde_json::Value::String(value));
                }
            },
            Self::Other(map) => {
                map.insert(key.to_string(), serde_json::Value::String(value));
            }
        }
    }
}

/// Payload of an order (test request) message.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderPayload {
    #[serde(default)]
    pub patient_name: String,
    #[serde(default)]
    pub priority: String,
    #[serde(default)]
    pub sample_type: String,
    #[serde(default)]
    pub lines: Vec<OrderLine>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// One requested service on an order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OrderLine {
    pub service_code: String,
    #[serde(default = "default_qty")]
    pub qty: u32,
}

fn default_qty() -> u32 {
    1
}

/// Payload of a result (or released report) message.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultPayload {
    #[serde(default)]
    pub accession: String,
    #[serde(default)]
    pub results: Vec<ResultLine>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// One analysis result line.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultLine {
    pub service_code: String,
    #[serde(default)]
    pub result: String,
    #[serde(default)]
    pub note: String,
}
