//! # Secrets
//!
//! Keyed-hash material injected at startup. Three independent keys:
//!
//! - `HMAC_IP_KEY`: hashes truncated client networks
//! - `VOTE_SECRET`: signs vote codes, the signature printed in every QR
//! - `HMAC_CODE_KEY`: signs staff bypass codes
//!
//! Each key is read from `/run/secrets/{NAME}` (Docker secrets) and falls back to the
//! environment variable of the same name. Missing keys abort startup.
//!
//! [`BypassSigner`] holds the bypass key on its own, so the issuer tool never needs the
//! vote or IP keys.
use std::{env, fs::read_to_string};

use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::config::ConfigError;

type HmacSha256 = Hmac<Sha256>;

const SECRETS_DIR: &str = "/run/secrets";

#[derive(Clone)]
pub struct Secrets {
    ip_mac: HmacSha256,
    vote_mac: HmacSha256,
    bypass: BypassSigner,
}

/// Signs and verifies staff bypass codes with `HMAC_CODE_KEY`.
#[derive(Clone)]
pub struct BypassSigner {
    mac: HmacSha256,
}

impl Secrets {
    pub fn load() -> Result<Self, ConfigError> {
        let ip_key = read_secret("HMAC_IP_KEY")?;
        let vote_key = read_secret("VOTE_SECRET")?;
        let code_key = read_secret("HMAC_CODE_KEY")?;

        Self::new(ip_key.as_bytes(), vote_key.as_bytes(), code_key.as_bytes())
    }

    pub fn new(ip_key: &[u8], vote_key: &[u8], code_key: &[u8]) -> Result<Self, ConfigError> {
        Ok(Self {
            ip_mac: prepare("HMAC_IP_KEY", ip_key)?,
            vote_mac: prepare("VOTE_SECRET", vote_key)?,
            bypass: BypassSigner::new(code_key)?,
        })
    }

    pub fn hash_network(&self, canonical: &str) -> String {
        keyed_hash(&self.ip_mac, canonical)
    }

    pub fn sign_vote_code(&self, code: &str) -> String {
        keyed_hash(&self.vote_mac, code)
    }

    /// Constant-time check of a hex signature against the vote key. Hex case is ignored.
    pub fn verify_vote_code(&self, code: &str, signature_hex: &str) -> bool {
        verify_hex(&self.vote_mac, code, signature_hex)
    }

    pub fn bypass_signer(&self) -> &BypassSigner {
        &self.bypass
    }

    pub fn sign_bypass_code(&self, code: &str) -> String {
        self.bypass.sign(code)
    }

    pub fn verify_bypass_code(&self, code: &str, signature_hex: &str) -> bool {
        self.bypass.verify(code, signature_hex)
    }
}

impl BypassSigner {
    pub fn load() -> Result<Self, ConfigError> {
        let code_key = read_secret("HMAC_CODE_KEY")?;

        Self::new(code_key.as_bytes())
    }

    pub fn new(code_key: &[u8]) -> Result<Self, ConfigError> {
        Ok(Self {
            mac: prepare("HMAC_CODE_KEY", code_key)?,
        })
    }

    pub fn sign(&self, code: &str) -> String {
        keyed_hash(&self.mac, code)
    }

    pub fn verify(&self, code: &str, signature_hex: &str) -> bool {
        verify_hex(&self.mac, code, signature_hex)
    }
}

fn prepare(name: &str, key: &[u8]) -> Result<HmacSha256, ConfigError> {
    if key.is_empty() {
        return Err(ConfigError::MissingSecret(name.to_string()));
    }

    HmacSha256::new_from_slice(key)
        .map_err(|e| ConfigError::InvalidSecret(name.to_string(), e.to_string()))
}

fn keyed_hash(mac: &HmacSha256, message: &str) -> String {
    let mut mac = mac.clone();
    mac.update(message.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

fn verify_hex(mac: &HmacSha256, message: &str, signature_hex: &str) -> bool {
    let Ok(provided) = hex::decode(signature_hex.trim()) else {
        return false;
    };

    let mut mac = mac.clone();
    mac.update(message.as_bytes());
    mac.verify_slice(&provided).is_ok()
}

fn read_secret(secret_name: &str) -> Result<Zeroizing<String>, ConfigError> {
    let path = format!("{SECRETS_DIR}/{secret_name}");

    let value = Zeroizing::new(match read_to_string(&path) {
        Ok(contents) => contents,
        Err(e) => {
            info!("{secret_name} not readable from {path} ({e}), trying environment");
            env::var(secret_name).map_err(|_| {
                warn!("{secret_name} not configured");
                ConfigError::MissingSecret(secret_name.to_string())
            })?
        }
    });

    Ok(Zeroizing::new(value.trim().to_string()))
}

#[cfg(test)]
mod tests {
    use super::{BypassSigner, Secrets};

    fn secrets() -> Secrets {
        Secrets::new(b"ip-key", b"vote-key", b"code-key").unwrap()
    }

    #[test]
    fn test_vote_signature_is_hex_sha256() {
        let signature = secrets().sign_vote_code("4821");

        assert_eq!(signature.len(), 64);
        assert!(signature.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(signature, secrets().sign_vote_code("4821"));
    }

    #[test]
    fn test_verify_ignores_hex_case() {
        let s = secrets();
        let signature = s.sign_vote_code("4821");

        assert!(s.verify_vote_code("4821", &signature));
        assert!(s.verify_vote_code("4821", &signature.to_uppercase()));
        assert!(!s.verify_vote_code("4822", &signature));
        assert!(!s.verify_vote_code("4821", "not-hex"));
    }

    #[test]
    fn test_keys_are_independent() {
        let s = secrets();

        assert_ne!(s.sign_vote_code("1234"), s.sign_bypass_code("1234"));
        assert_ne!(s.sign_vote_code("1234"), s.hash_network("1234"));
        assert!(!s.verify_bypass_code("1234", &s.sign_vote_code("1234")));
    }

    #[test]
    fn test_empty_key_is_rejected() {
        assert!(Secrets::new(b"", b"vote-key", b"code-key").is_err());
    }

    #[test]
    fn test_bypass_signer_needs_only_code_key() {
        let signer = BypassSigner::new(b"code-key").unwrap();
        let s = secrets();

        assert_eq!(signer.sign("STAFF01"), s.sign_bypass_code("STAFF01"));
        assert!(s.verify_bypass_code("STAFF01", &signer.sign("STAFF01")));
        assert!(BypassSigner::new(b"").is_err());
    }
}
