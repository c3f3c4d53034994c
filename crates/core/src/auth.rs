//! Inbound request authentication.
//!
//! Authorises a request against an endpoint's configured scheme. All secret
//! comparisons are constant-time: a partner that can measure response
//! latency must not learn how much of a credential matched.

use crate::endpoint::{AuthConfig, Endpoint};
use base64::Engine;
use subtle::ConstantTimeEq;

/// The authentication material extracted from an inbound HTTP request.
#[derive(Clone, Debug, Default)]
pub struct AuthHeaders {
    /// Raw `Authorization` header value, if present.
    pub authorization: Option<String>,
    /// Raw `X-API-Key` header value, if present.
    pub api_key: Option<String>,
}

impl AuthHeaders {
    pub fn bearer(token: &str) -> Self {
        Self { authorization: Some(format!("Bearer {token}")), ..Self::default() }
    }

    pub fn basic(username: &str, password: &str) -> Self {
        let encoded =
            base64::engine::general_purpose::STANDARD.encode(format!("{username}:{password}"));
        Self { authorization: Some(format!("Basic {encoded}")), ..Self::default() }
    }

    pub fn api_key(key: &str) -> Self {
        Self { api_key: Some(key.to_string()), ..Self::default() }
    }
}

/// Authorises a request against the endpoint's configured scheme.
///
/// Unconfigured secrets fail closed; so does anything that does not match a
/// recognised scheme exactly.
pub fn authorize(endpoint: &Endpoint, headers: &AuthHeaders) -> bool {
    match &endpoint.auth {
        AuthConfig::None => true,
        AuthConfig::Bearer { token } => {
            let Some(token) = token.as_deref().filter(|t| !t.is_empty()) else {
                return false;
            };
            let expected = format!("Bearer {token}");
            headers
                .authorization
                .as_deref()
                .map(|provided| constant_time_eq(provided, &expected))
                .unwrap_or(false)
        }
        AuthConfig::ApiKey { key } => {
            let Some(key) = key.as_deref().filter(|k| !k.is_empty()) else {
                return false;
            };
            headers
                .api_key
                .as_deref()
                .map(|provided| constant_time_eq(provided, key))
                .unwrap_or(false)
        }
        AuthConfig::Basic { username, password } => {
            let expected_user = username.as_deref().unwrap_or("");
            let Some(expected_pass) = password.as_deref().filter(|p| !p.is_empty()) else {
                return false;
            };
            let Some(auth) = headers.authorization.as_deref() else {
                return false;
            };
            let Some(encoded) = auth.strip_prefix("Basic ") else {
                return false;
            };
            let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded) else {
                return false;
            };
            let Ok(decoded) = String::from_utf8(decoded) else {
                return false;
            };
            let Some((user, pass)) = decoded.split_once(':') else {
                return false;
            };
            constant_time_eq(user, expected_user) & constant_time_eq(pass, expected_pass)
        }
    }
}

/// Constant-time string comparison.
///
/// Both inputs are padded to a shared length before comparing so the timing
/// neither leaks content nor length.
fn constant_time_eq(a: &str, b: &str) -> bool {
    let max_len = a.len().max(b.len());
    let mut a_padded = vec![0u8; max_len];
    let mut b_padded = vec![0xFFu8; max_len];
    a_padded[..a.len()].copy_from_slice(a.as_bytes());
    b_padded[..b.len()].copy_from_slice(b.as_bytes());

    let lengths_equal = a.len().ct_eq(&b.len());
    let contents_equal = a_padded.ct_eq(&b_padded);
    (lengths_equal & contents_equal).into()
}
