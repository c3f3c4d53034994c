//! Core runtime configuration.
//!
//! Resolved once at process startup and passed into the service, so nothing
//! reads process-wide environment variables during request handling.

/// Core configuration resolved at startup.
#[derive(Clone, Debug)]
pub struct CoreConfig {
    /// Deduplicate inbound messages by `(endpoint, external_uid)`: a repeat
    /// of an already-ingested message returns the existing job instead of
    /// creating a second one.
    pub dedup_inbound: bool,
    /// Actor recorded on audit entries written by the pipeline itself.
    pub audit_actor: String,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            dedup_inbound: true,
            audit_actor: "interface".to_string(),
        }
    }
}
