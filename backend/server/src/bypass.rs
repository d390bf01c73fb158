//! # Bypass Codes
//!
//! Staff hand these out when a legitimate device is flagged (shared family phone, kiosk,
//! a fingerprint collision). Format: `{code}.{hex hmac(HMAC_CODE_KEY, code)}`.
//!
//! A valid code replaces the fingerprint check for exactly one vote. Consumption is
//! recorded by the store together with the vote itself, so a code can never back two
//! votes even when both requests race.
use rand::{Rng, distributions::Alphanumeric, rngs::OsRng};
use thiserror::Error;

use crate::{
    secrets::{BypassSigner, Secrets},
    store::{StoreError, VoteStore},
};

pub const SEPARATOR: char = '.';

const GENERATED_LENGTH: usize = 10;

#[derive(Error, Debug)]
pub enum BypassError {
    #[error("Invalid bypass code format")]
    Malformed,

    #[error("Bypass code signature mismatch")]
    BadSignature,

    #[error("Bypass code already used")]
    AlreadyUsed,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Checks format and signature. Returns the bare code on success.
pub fn verify(secrets: &Secrets, raw: &str) -> Result<String, BypassError> {
    let (code, signature) = raw
        .trim()
        .split_once(SEPARATOR)
        .ok_or(BypassError::Malformed)?;

    let code = code.trim();
    let signature = signature.trim();

    if code.is_empty() || signature.is_empty() || signature.contains(SEPARATOR) {
        return Err(BypassError::Malformed);
    }

    if !secrets.verify_bypass_code(code, signature) {
        return Err(BypassError::BadSignature);
    }

    Ok(code.to_string())
}

/// [`verify`] plus the usage ledger.
pub async fn validate(
    store: &dyn VoteStore,
    secrets: &Secrets,
    raw: &str,
) -> Result<String, BypassError> {
    let code = verify(secrets, raw)?;

    if store.is_bypass_used(&code).await? {
        return Err(BypassError::AlreadyUsed);
    }

    Ok(code)
}

pub fn issue(signer: &BypassSigner, code: &str) -> Result<String, BypassError> {
    let code = code.trim();
    if code.is_empty() || code.contains(SEPARATOR) {
        return Err(BypassError::Malformed);
    }

    Ok(format!("{code}{SEPARATOR}{}", signer.sign(code)))
}

pub fn random_code() -> String {
    OsRng
        .sample_iter(&Alphanumeric)
        .take(GENERATED_LENGTH)
        .map(char::from)
        .collect::<String>()
        .to_uppercase()
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::{BypassError, issue, random_code, validate, verify};
    use crate::{
        secrets::{BypassSigner, Secrets},
        store::{MemoryStore, Vote, VoteIdentity, VoteStore},
    };

    fn secrets() -> Secrets {
        Secrets::new(b"ip-key", b"vote-key", b"code-key").unwrap()
    }

    #[test]
    fn test_issued_code_verifies() {
        let s = secrets();
        let issued = issue(s.bypass_signer(), "STAFF01").unwrap();

        assert_eq!(verify(&s, &issued).unwrap(), "STAFF01");
        assert_eq!(verify(&s, &format!("  {issued} ")).unwrap(), "STAFF01");
    }

    #[test]
    fn test_format_errors() {
        let s = secrets();

        for raw in ["", "STAFF01", ".abcd", "STAFF01.", "a.b.c"] {
            assert!(matches!(verify(&s, raw), Err(BypassError::Malformed)), "{raw}");
        }
        assert!(matches!(issue(s.bypass_signer(), "bad.code"), Err(BypassError::Malformed)));
    }

    #[test]
    fn test_forged_signature_rejected() {
        let s = secrets();
        let other = BypassSigner::new(b"other-code-key").unwrap();
        let forged = issue(&other, "STAFF01").unwrap();

        assert!(matches!(verify(&s, &forged), Err(BypassError::BadSignature)));
        assert!(matches!(verify(&s, "STAFF01.zz"), Err(BypassError::BadSignature)));
    }

    #[test]
    fn test_random_codes() {
        let code = random_code();

        assert_eq!(code.len(), 10);
        assert!(code.chars().all(|c| c.is_ascii_alphanumeric()));
        assert!(issue(secrets().bypass_signer(), &code).is_ok());
    }

    #[tokio::test]
    async fn test_used_code_is_rejected() {
        let s = secrets();
        let store = MemoryStore::new();
        let issued = issue(s.bypass_signer(), "STAFF01").unwrap();

        assert_eq!(validate(&store, &s, &issued).await.unwrap(), "STAFF01");

        store
            .insert_vote(&Vote {
                event_id: 7,
                player_id: 1,
                code: "1234".to_string(),
                signature: s.sign_vote_code("1234"),
                identity: VoteIdentity::Bypass("STAFF01".to_string()),
                device_token: "device".to_string(),
                hashed_ip: "ip".to_string(),
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        assert!(matches!(
            validate(&store, &s, &issued).await,
            Err(BypassError::AlreadyUsed)
        ));
    }
}
