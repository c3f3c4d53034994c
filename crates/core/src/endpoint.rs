//! Endpoint registry model.
//!
//! An endpoint is one configured remote system connection: which protocol it
//! speaks, which direction it may exchange messages in, how it
//! authenticates, and any per-endpoint field-mapping rules. Endpoints are
//! created and edited by administrators; they are deactivated rather than
//! deleted so audit linkage survives.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Exchange direction an endpoint is configured for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
    Bidirectional,
}

impl Direction {
    pub fn allows_inbound(&self) -> bool {
        matches!(self, Self::Inbound | Self::Bidirectional)
    }

    pub fn allows_outbound(&self) -> bool {
        matches!(self, Self::Outbound | Self::Bidirectional)
    }
}

/// Wire protocol spoken by an endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Hl7v2,
    Fhir,
    Astm,
    Rest,
    Sftp,
}

/// Authentication scheme plus credentials for inbound requests.
///
/// A scheme with an unconfigured secret fails closed: no header value can
/// authorise against it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "auth_type", rename_all = "snake_case")]
pub enum AuthConfig {
    None,
    Bearer {
        token: Option<String>,
    },
    ApiKey {
        key: Option<String>,
    },
    Basic {
        username: Option<String>,
        password: Option<String>,
    },
}

/// One field-map override rule: extract `expr` from the wire message and
/// write it to `target` in the canonical payload. Rules apply in order
/// after default extraction; the last write wins.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMapRule {
    pub target: String,
    pub expr: String,
}

/// A configured remote system connection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Endpoint {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    /// Unique code among active endpoints; appears in inbound URLs.
    pub code: String,
    #[serde(default)]
    pub name: String,
    pub direction: Direction,
    pub protocol: Protocol,
    #[serde(flatten)]
    pub auth: AuthConfig,
    #[serde(default = "default_active")]
    pub active: bool,
    /// Optional source-IP allow-list for inbound access. Empty = allow all.
    #[serde(default)]
    pub allowed_ips: Vec<String>,
    /// Per-endpoint field-map overrides applied after default extraction.
    #[serde(default)]
    pub field_map: Vec<FieldMapRule>,
    /// Requeues tolerated before a failed job is eligible for dead-letter.
    #[serde(default = "default_retry_limit")]
    pub retry_limit: u32,
    #[serde(default = "default_active")]
    pub dead_letter_enabled: bool,
}

fn default_active() -> bool {
    true
}

fn default_retry_limit() -> u32 {
    3
}

impl Endpoint {
    /// Convenience constructor with open auth; used heavily by tests.
    pub fn new(code: &str, direction: Direction, protocol: Protocol) -> Self {
        Self {
            id: Uuid::new_v4(),
            code: code.to_string(),
            name: code.to_string(),
            direction,
            protocol,
            auth: AuthConfig::None,
            active: true,
            allowed_ips: Vec::new(),
            field_map: Vec::new(),
            retry_limit: default_retry_limit(),
            dead_letter_enabled: true,
        }
    }

    /// Checks the source IP against the allow-list, if one is configured.
    pub fn allows_source_ip(&self, source_ip: &str) -> bool {
        if self.allowed_ips.is_empty() || source_ip.is_empty() {
            return true;
        }
        self.allowed_ips.iter().any(|ip| ip == source_ip)
    }

    /// Field-map rules as `(target, expr)` pairs for the codecs.
    pub fn field_map_pairs(&self) -> Vec<(String, String)> {
        self.field_map
            .iter()
            .map(|rule| (rule.target.clone(), rule.expr.clone()))
            .collect()
    }
}
