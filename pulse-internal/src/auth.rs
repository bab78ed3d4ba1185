use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, RwLock};

use crate::error::{Error, ErrorDetails};

/// Who is performing the billable action. Exactly one side is ever present;
/// resolution happens once in the middleware and travels in request
/// extensions from there.
#[derive(Clone, Debug, PartialEq)]
pub enum Identity {
    User { user_id: String },
    Anonymous { ip_address: String },
}

impl Identity {
    pub fn user_id(&self) -> Option<&str> {
        match self {
            Identity::User { user_id } => Some(user_id),
            Identity::Anonymous { .. } => None,
        }
    }
}

// Hash API key using SHA256 with "pulse-" prefix (matching the key
// provisioning script)
fn hash_api_key(api_key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"pulse-");
    hasher.update(api_key.as_bytes());
    format!("{:x}", hasher.finalize())
}

// Common error response helper
fn auth_error_response(status: StatusCode, message: &str) -> Response {
    let body = serde_json::json!({
        "error": {
            "message": message,
            "type": "invalid_request_error",
            "code": status.as_u16()
        }
    });
    (status, axum::Json(body)).into_response()
}

/// API-key registry. Configuration carries hashed keys only; lookups hash the
/// presented key before comparison.
#[derive(Clone)]
pub struct Auth {
    enabled: bool,
    // hashed key -> user id
    keys: Arc<RwLock<HashMap<String, String>>>,
}

impl Auth {
    pub fn new(enabled: bool, keys: HashMap<String, String>) -> Self {
        Self {
            enabled,
            keys: Arc::new(RwLock::new(keys)),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Resolves an API key to a user id. With authentication disabled the
    /// presented key is taken as the user id verbatim, which keeps local
    /// development free of key provisioning.
    pub fn user_for_key(&self, api_key: &str) -> Option<String> {
        if !self.enabled {
            return Some(api_key.to_string());
        }
        let hashed_key = hash_api_key(api_key);

        // In practice, a poisoned RwLock indicates a panic in another thread while holding the lock.
        // This is a catastrophic failure that should not be recovered from.
        #[expect(clippy::expect_used)]
        let keys = self.keys.read().expect("RwLock poisoned");
        keys.get(&hashed_key).cloned()
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get("authorization")?.to_str().ok()?.trim();
    let token = value.strip_prefix("Bearer ").unwrap_or(value).trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_private() || v4.is_loopback() || v4.is_link_local() || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback() || v6.is_unspecified() || (v6.segments()[0] & 0xfe00) == 0xfc00
        }
    }
}

/// Client address for anonymous accounting. Prefers the first public IP in
/// the `x-forwarded-for` chain (proxies append their own hops), falls back to
/// the first entry, then to `x-real-ip`.
pub fn client_ip(headers: &HeaderMap) -> Option<String> {
    if let Some(chain) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        let candidates: Vec<&str> = chain
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();
        for candidate in &candidates {
            if let Ok(ip) = candidate.parse::<IpAddr>() {
                if !is_private_ip(ip) {
                    return Some(ip.to_string());
                }
            }
        }
        if let Some(first) = candidates.first() {
            return Some((*first).to_string());
        }
    }

    headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Resolves the caller to an `Identity` and stashes it in request extensions.
///
/// A presented API key must validate (401 otherwise); no key at all degrades
/// to an anonymous identity keyed by client IP. A request carrying neither
/// is a caller bug that fails loudly.
pub async fn resolve_identity(
    State(auth): State<Auth>,
    mut request: Request,
    next: Next,
) -> Result<Response, Response> {
    let identity = match bearer_token(request.headers()) {
        Some(key) => match auth.user_for_key(&key) {
            Some(user_id) => Identity::User { user_id },
            None => {
                return Err(auth_error_response(
                    StatusCode::UNAUTHORIZED,
                    "Invalid API key",
                ))
            }
        },
        None => match client_ip(request.headers()) {
            Some(ip_address) => Identity::Anonymous { ip_address },
            None => {
                let error = Error::new(ErrorDetails::IdentityMissing {
                    message: "request carried neither an api key nor a client address"
                        .to_string(),
                });
                return Err(error.into_response());
            }
        },
    };

    request.extensions_mut().insert(identity);
    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_hashes_are_hex_and_stable() {
        let first = hash_api_key("pk-live-1");
        let second = hash_api_key("pk-live-1");
        let other = hash_api_key("pk-live-2");

        assert_eq!(first, second);
        assert_ne!(first, other);
        assert_eq!(first.len(), 64);
        assert!(first.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_key_lookup_round_trips_through_the_hash() {
        let mut keys = HashMap::new();
        keys.insert(hash_api_key("pk-live-1"), "user-1".to_string());
        let auth = Auth::new(true, keys);

        assert_eq!(auth.user_for_key("pk-live-1").as_deref(), Some("user-1"));
        assert_eq!(auth.user_for_key("pk-live-wrong"), None);
    }

    #[test]
    fn test_disabled_auth_takes_the_key_as_user_id() {
        let auth = Auth::new(false, HashMap::new());
        assert_eq!(auth.user_for_key("dev-user").as_deref(), Some("dev-user"));
    }

    #[test]
    fn test_bearer_token_strips_scheme() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer pk-1"));
        assert_eq!(bearer_token(&headers).as_deref(), Some("pk-1"));

        headers.insert("authorization", HeaderValue::from_static("pk-2"));
        assert_eq!(bearer_token(&headers).as_deref(), Some("pk-2"));

        headers.insert("authorization", HeaderValue::from_static("Bearer "));
        assert_eq!(bearer_token(&headers), None);
    }

    #[test]
    fn test_client_ip_prefers_public_forwarded_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("10.0.0.7, 203.0.113.9, 172.16.3.1"),
        );
        assert_eq!(client_ip(&headers).as_deref(), Some("203.0.113.9"));
    }

    #[test]
    fn test_client_ip_falls_back_to_first_hop_then_real_ip() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("10.0.0.7"));
        assert_eq!(client_ip(&headers).as_deref(), Some("10.0.0.7"));

        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("198.51.100.4"));
        assert_eq!(client_ip(&headers).as_deref(), Some("198.51.100.4"));

        assert_eq!(client_ip(&HeaderMap::new()), None);
    }
}
