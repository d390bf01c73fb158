//! # Device Fingerprints
//!
//! Turns the attributes a browser reports about itself into a stable pseudo-identity.
//!
//! ## Normalization
//! - Every attribute is trimmed and lower-cased
//! - Empty, `null` and `undefined` become `unknown`
//! - Degenerate readings are folded to `unknown` too: zero color depth, zero cores,
//!   empty/zero device memory, screens reported as `x` or `unknownxunknown`
//! - Fewer than 3 known attributes is rejected, bots love empty payloads
//!
//! ## Signature
//! Keys sorted ascending, `key:value` pairs joined with `|`. Attribute order in the
//! payload never matters.
//!
//! ## Daily Hash
//! `sha256("v1|{event}|{YYYY-MM-DD}|{signature}")` in hex. The UTC date is part of the
//! preimage so the same device becomes a new identity each day, capping it to one vote
//! per event per day.
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const UNKNOWN: &str = "unknown";
pub const MIN_ENTROPY: usize = 3;

const HASH_VERSION: &str = "v1";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum FingerprintError {
    #[error("Fingerprint contains insufficient entropy ({resolved} known attributes)")]
    InsufficientEntropy { resolved: usize },
}

/// Attributes exactly as the client reported them. Numbers and strings are both accepted
/// for every field since browsers disagree on types.
#[derive(Deserialize, Debug, Clone, Default)]
pub struct RawFingerprint {
    #[serde(default, deserialize_with = "lenient")]
    pub browser: String,
    #[serde(default, deserialize_with = "lenient")]
    pub platform: String,
    #[serde(default, deserialize_with = "lenient")]
    pub screen: String,
    #[serde(default, deserialize_with = "lenient")]
    pub color_depth: String,
    #[serde(default, deserialize_with = "lenient")]
    pub timezone: String,
    #[serde(default, deserialize_with = "lenient")]
    pub timezone_offset: String,
    #[serde(default, deserialize_with = "lenient")]
    pub device_memory: String,
    #[serde(default, deserialize_with = "lenient")]
    pub hardware_concurrency: String,
    #[serde(default, deserialize_with = "lenient")]
    pub languages: String,
    #[serde(default, deserialize_with = "lenient")]
    pub graphics: String,
    #[serde(default, deserialize_with = "lenient")]
    pub touch_support: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalFingerprint {
    values: BTreeMap<&'static str, String>,
}

impl RawFingerprint {
    pub fn normalize(&self) -> CanonicalFingerprint {
        let mut values = BTreeMap::from([
            ("browser", sanitize(&self.browser)),
            ("platform", sanitize(&self.platform)),
            ("screen", sanitize(&self.screen)),
            ("color_depth", sanitize(&self.color_depth)),
            ("timezone", sanitize(&self.timezone)),
            ("timezone_offset", sanitize(&self.timezone_offset)),
            ("device_memory", sanitize(&self.device_memory)),
            ("hardware_concurrency", sanitize(&self.hardware_concurrency)),
            ("languages", sanitize(&self.languages)),
            ("graphics", sanitize(&self.graphics)),
            ("touch_support", sanitize(&self.touch_support)),
        ]);

        fold(&mut values, "color_depth", &["0"]);
        fold(&mut values, "hardware_concurrency", &["0"]);
        fold(&mut values, "device_memory", &["0"]);
        fold(&mut values, "screen", &["x", "unknownxunknown"]);

        CanonicalFingerprint { values }
    }

    /// Normalizes and enforces the entropy floor.
    pub fn canonicalize(&self) -> Result<CanonicalFingerprint, FingerprintError> {
        let canonical = self.normalize();
        let resolved = canonical.entropy();

        if resolved < MIN_ENTROPY {
            return Err(FingerprintError::InsufficientEntropy { resolved });
        }

        Ok(canonical)
    }
}

impl CanonicalFingerprint {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn entropy(&self) -> usize {
        self.values.values().filter(|v| v.as_str() != UNKNOWN).count()
    }

    pub fn signature(&self) -> String {
        self.values
            .iter()
            .map(|(key, value)| format!("{key}:{value}"))
            .collect::<Vec<_>>()
            .join("|")
    }

    pub fn daily_hash(&self, event_id: i64, now: DateTime<Utc>) -> String {
        let day_token = now.format("%Y-%m-%d");
        let base = format!(
            "{HASH_VERSION}|{event_id}|{day_token}|{}",
            self.signature()
        );

        hex::encode(Sha256::digest(base.as_bytes()))
    }
}

pub fn sanitize(raw: &str) -> String {
    let trimmed = raw.trim().to_lowercase();

    match trimmed.as_str() {
        "" | "null" | "undefined" => UNKNOWN.to_string(),
        _ => trimmed,
    }
}

fn fold(values: &mut BTreeMap<&'static str, String>, key: &str, degenerate: &[&str]) {
    if let Some(value) = values.get_mut(key) {
        if degenerate.contains(&value.as_str()) {
            *value = UNKNOWN.to_string();
        }
    }
}

fn lenient<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Null => String::new(),
        Value::String(s) => s,
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(items) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join(","),
        Value::Object(_) => String::new(),
    })
}
