//! # Device Tokens
//!
//! Opaque per-browser id kept in a cookie, the rate limiter's device key.
//!
//! - 32 random bytes, hex encoded
//! - `HttpOnly`, `SameSite=Lax`, 180 days
//! - `Secure` only when the proxy says the request came in over https
use axum::http::{HeaderMap, header::COOKIE};
use chrono::{DateTime, Duration, Utc};
use rand::{RngCore, rngs::OsRng};
use serde::Serialize;

pub const COOKIE_NAME: &str = "mvp_device_token";
pub const FORWARDED_PROTO: &str = "x-forwarded-proto";

const TOKEN_BYTES: usize = 32;
const LIFETIME_DAYS: i64 = 180;

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct DeviceToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

pub fn generate() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);

    hex::encode(bytes)
}

/// Reuses a well formed token from the cookie, otherwise mints a new one.
pub fn issue(headers: &HeaderMap, now: DateTime<Utc>) -> DeviceToken {
    let token = from_cookie(headers)
        .filter(|token| is_well_formed(token))
        .unwrap_or_else(generate);

    DeviceToken {
        token,
        expires_at: now + Duration::days(LIFETIME_DAYS),
    }
}

pub fn from_cookie(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == COOKIE_NAME)
        .map(|(_, value)| value.trim().to_string())
}

pub fn set_cookie(token: &DeviceToken, headers: &HeaderMap) -> String {
    let max_age = Duration::days(LIFETIME_DAYS).num_seconds();
    let expires = token.expires_at.format("%a, %d %b %Y %H:%M:%S GMT");

    let mut cookie = format!(
        "{COOKIE_NAME}={}; Path=/; Max-Age={max_age}; Expires={expires}; HttpOnly; SameSite=Lax",
        token.token
    );
    if is_https(headers) {
        cookie.push_str("; Secure");
    }

    cookie
}

fn is_https(headers: &HeaderMap) -> bool {
    headers
        .get(FORWARDED_PROTO)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .is_some_and(|proto| proto.trim().eq_ignore_ascii_case("https"))
}

fn is_well_formed(token: &str) -> bool {
    token.len() == TOKEN_BYTES * 2 && token.bytes().all(|b| b.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use axum::http::{HeaderMap, HeaderValue, header::COOKIE};
    use chrono::{DateTime, Utc};

    use super::{FORWARDED_PROTO, generate, issue, set_cookie};

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-03-14T20:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_generated_tokens() {
        let token = generate();

        assert_eq!(token.len(), 64);
        assert_ne!(token, generate());
    }

    #[test]
    fn test_existing_cookie_is_reused() {
        let existing = generate();
        let mut headers = HeaderMap::new();
        headers.insert(
            COOKIE,
            HeaderValue::from_str(&format!("theme=dark; mvp_device_token={existing}")).unwrap(),
        );

        let issued = issue(&headers, now());
        assert_eq!(issued.token, existing);
        assert_eq!(issued.expires_at.to_rfc3339(), "2025-09-10T20:00:00+00:00");
    }

    #[test]
    fn test_garbage_cookie_is_replaced() {
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_static("mvp_device_token=abc"));

        assert_ne!(issue(&headers, now()).token, "abc");
    }

    #[test]
    fn test_cookie_attributes() {
        let token = issue(&HeaderMap::new(), now());

        let plain = set_cookie(&token, &HeaderMap::new());
        assert!(plain.starts_with(&format!("mvp_device_token={}", token.token)));
        assert!(plain.contains("HttpOnly"));
        assert!(plain.contains("SameSite=Lax"));
        assert!(plain.contains("Max-Age=15552000"));
        assert!(!plain.contains("Secure"));

        let mut https = HeaderMap::new();
        https.insert(FORWARDED_PROTO, HeaderValue::from_static("https"));
        assert!(set_cookie(&token, &https).ends_with("; Secure"));
    }
}
