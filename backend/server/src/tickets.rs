//! # Tickets
//!
//! A ticket is the redeemable side of a vote, keyed by `(event, code)`.
//!
//! ## Redemption
//!
//! ```text
//! Unredeemed ──redeem──> Redeemed (terminal)
//! ```
//!
//! | Stored row                      | Outcome                                       |
//! |---------------------------------|-----------------------------------------------|
//! | none                            | insert as redeemed, `already_redeemed: false` |
//! | signature differs               | `SignatureMismatch`, nothing written          |
//! | matches, unredeemed             | mark redeemed, `already_redeemed: false`      |
//! | matches, redeemed               | `already_redeemed: true`                      |
//! | insert lost to a concurrent one | look up again and compare                     |
//!
//! Scanning the same valid ticket twice is a success both times, the second scan just
//! reports that it was already redeemed.
//!
//! ## Check-in
//!
//! Scans go through [`check_in`], which recomputes the signature from the vote key before
//! touching the ledger and requires the vote to exist.
use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};
use url::Url;

use crate::{
    secrets::Secrets,
    store::{InsertOutcome, StoreError, Ticket, Vote, VoteStore},
};

const VALIDATE_PATH: &str = "lottery/validate";

/// A lost insert race resolves on the next lookup, anything beyond that is corruption.
const REDEEM_ATTEMPTS: usize = 2;

#[derive(Error, Debug)]
pub enum TicketError {
    #[error("Ticket not found")]
    NotFound,

    #[error("Ticket signature mismatch")]
    SignatureMismatch,

    #[error("Missing ticket parameters")]
    MissingParameters,

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct CheckIn {
    pub vote: Vote,
    pub already_redeemed: bool,
}

pub async fn validate(
    store: &dyn VoteStore,
    event_id: i64,
    code: &str,
) -> Result<Ticket, TicketError> {
    store
        .find_ticket(event_id, code)
        .await?
        .ok_or(TicketError::NotFound)
}

/// Returns whether the ticket had already been redeemed before this call.
pub async fn redeem(
    store: &dyn VoteStore,
    event_id: i64,
    code: &str,
    signature: &str,
    now: DateTime<Utc>,
) -> Result<bool, TicketError> {
    for _ in 0..REDEEM_ATTEMPTS {
        let Some(ticket) = store.find_ticket(event_id, code).await? else {
            let fresh = Ticket {
                event_id,
                code: code.to_string(),
                signature: signature.to_string(),
                redeemed_at: Some(now),
            };

            match store.insert_ticket(&fresh).await? {
                InsertOutcome::Inserted => return Ok(false),
                InsertOutcome::Duplicate => continue,
            }
        };

        if !ticket.signature.eq_ignore_ascii_case(signature) {
            return Err(TicketError::SignatureMismatch);
        }

        if ticket.redeemed_at.is_some() {
            return Ok(true);
        }

        // false means a concurrent scan got there first
        return Ok(!store.mark_redeemed(event_id, code, now).await?);
    }

    Err(StoreError::Unexpected(format!("ticket {event_id}/{code} vanished during redeem")).into())
}

pub async fn check_in(
    store: &dyn VoteStore,
    secrets: &Secrets,
    event_id: i64,
    code: &str,
    signature: &str,
    now: DateTime<Utc>,
) -> Result<CheckIn, TicketError> {
    let code = code.trim();
    let signature = signature.trim();

    if code.is_empty() || signature.is_empty() {
        return Err(TicketError::MissingParameters);
    }

    if !secrets.verify_vote_code(code, signature) {
        warn!(event_id, "Ticket scanned with a bad signature");
        return Err(TicketError::SignatureMismatch);
    }

    let vote = store
        .find_vote(event_id, code)
        .await?
        .ok_or(TicketError::NotFound)?;

    let already_redeemed = redeem(store, event_id, code, signature, now).await?;

    info!(event_id, code, already_redeemed, "Ticket checked in");

    Ok(CheckIn {
        vote,
        already_redeemed,
    })
}

/// `{base}/lottery/validate?e={event}&c={code}&s={signature}`
pub fn validation_url(
    base: &str,
    event_id: i64,
    code: &str,
    signature: &str,
) -> Result<String, url::ParseError> {
    let mut url = Url::parse(base)?;

    let path = format!("{}/{VALIDATE_PATH}", url.path().trim_end_matches('/'));
    url.set_path(&path);
    url.query_pairs_mut()
        .clear()
        .append_pair("e", &event_id.to_string())
        .append_pair("c", code)
        .append_pair("s", signature);

    Ok(url.into())
}

/// What a scanner read off a ticket.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ScannedTicket {
    #[serde(default, alias = "e")]
    pub event_id: Option<i64>,
    #[serde(alias = "c")]
    pub code: String,
    #[serde(alias = "s")]
    pub signature: String,
}

/// Accepts either the validation URL or a `{code, signature}` JSON blob.
pub fn parse_qr_data(raw: &str) -> Result<ScannedTicket, TicketError> {
    let raw = raw.trim();

    if raw.starts_with('{') {
        return serde_json::from_str(raw).map_err(|_| TicketError::MissingParameters);
    }

    let url = Url::parse(raw).map_err(|_| TicketError::MissingParameters)?;

    let (mut event_id, mut code, mut signature) = (None, None, None);
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "e" => event_id = value.parse().ok(),
            "c" => code = Some(value.into_owned()),
            "s" => signature = Some(value.into_owned()),
            _ => {}
        }
    }

    match (code, signature) {
        (Some(code), Some(signature)) if !code.is_empty() && !signature.is_empty() => {
            Ok(ScannedTicket {
                event_id,
                code,
                signature,
            })
        }
        _ => Err(TicketError::MissingParameters),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{DateTime, Duration, Utc};

    use super::{
        ScannedTicket, TicketError, check_in, parse_qr_data, redeem, validate, validation_url,
    };
    use crate::{
        secrets::Secrets,
        store::{MemoryStore, Ticket, Vote, VoteIdentity, VoteStore},
    };

    fn at(rfc3339: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(rfc3339)
            .unwrap()
            .with_timezone(&Utc)
    }

    fn secrets() -> Secrets {
        Secrets::new(b"ip-key", b"vote-key", b"code-key").unwrap()
    }

    async fn seed_vote(store: &MemoryStore, s: &Secrets, code: &str) -> String {
        let signature = s.sign_vote_code(code);
        store
            .insert_vote(&Vote {
                event_id: 7,
                player_id: 10,
                code: code.to_string(),
                signature: signature.clone(),
                identity: VoteIdentity::Fingerprint(format!("fp-{code}")),
                device_token: "device".to_string(),
                hashed_ip: "ip".to_string(),
                created_at: at("2025-03-14T20:00:00Z"),
            })
            .await
            .unwrap();
        signature
    }

    #[tokio::test]
    async fn test_redeem_twice() {
        let store = MemoryStore::new();
        let s = secrets();
        let signature = seed_vote(&store, &s, "4821").await;
        let now = at("2025-03-14T21:00:00Z");

        assert!(!redeem(&store, 7, "4821", &signature, now).await.unwrap());
        assert!(
            redeem(&store, 7, "4821", &signature, now + Duration::minutes(1))
                .await
                .unwrap()
        );

        let ticket = validate(&store, 7, "4821").await.unwrap();
        assert_eq!(ticket.redeemed_at, Some(now));
    }

    #[tokio::test]
    async fn test_wrong_signature_after_redeem_keeps_redemption() {
        let store = MemoryStore::new();
        let s = secrets();
        let signature = seed_vote(&store, &s, "4821").await;
        let now = at("2025-03-14T21:00:00Z");

        assert!(!redeem(&store, 7, "4821", &signature, now).await.unwrap());

        let result = redeem(&store, 7, "4821", "deadbeef", now + Duration::minutes(5)).await;
        assert!(matches!(result, Err(TicketError::SignatureMismatch)));
        assert_eq!(
            validate(&store, 7, "4821").await.unwrap().redeemed_at,
            Some(now)
        );
    }

    async fn race(store: Arc<MemoryStore>, code: &'static str, signature: String) -> usize {
        let now = at("2025-03-14T21:00:00Z");

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let store = Arc::clone(&store);
                let signature = signature.clone();
                tokio::spawn(async move { redeem(&*store, 7, code, &signature, now).await })
            })
            .collect();

        let mut first_scans = 0;
        for handle in handles {
            if !handle.await.unwrap().unwrap() {
                first_scans += 1;
            }
        }
        first_scans
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_redeem_missing_row_single_winner() {
        let store = Arc::new(MemoryStore::new());

        assert_eq!(race(Arc::clone(&store), "1234", "abcd".to_string()).await, 1);
        assert!(validate(&*store, 7, "1234").await.unwrap().redeemed_at.is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_redeem_single_winner() {
        let store = Arc::new(MemoryStore::new());
        let signature = seed_vote(&*store, &secrets(), "4821").await;

        assert_eq!(race(store, "4821", signature).await, 1);
    }

    #[tokio::test]
    async fn test_signature_comparison_ignores_case() {
        let store = MemoryStore::new();
        let s = secrets();
        let signature = seed_vote(&store, &s, "4821").await;

        let upper = signature.to_uppercase();
        assert!(!redeem(&store, 7, "4821", &upper, Utc::now()).await.unwrap());
    }

    #[tokio::test]
    async fn test_mismatch_leaves_ticket_untouched() {
        let store = MemoryStore::new();
        let s = secrets();
        seed_vote(&store, &s, "4821").await;

        let result = redeem(&store, 7, "4821", "deadbeef", Utc::now()).await;
        assert!(matches!(result, Err(TicketError::SignatureMismatch)));
        assert_eq!(validate(&store, 7, "4821").await.unwrap().redeemed_at, None);
    }

    #[tokio::test]
    async fn test_missing_row_is_inserted_redeemed() {
        let store = MemoryStore::new();
        let now = at("2025-03-14T21:00:00Z");

        assert!(!redeem(&store, 7, "1234", "abcd", now).await.unwrap());

        let ticket = validate(&store, 7, "1234").await.unwrap();
        assert_eq!(ticket.signature, "abcd");
        assert_eq!(ticket.redeemed_at, Some(now));

        assert!(redeem(&store, 7, "1234", "abcd", now).await.unwrap());
    }

    #[tokio::test]
    async fn test_validate_unknown_ticket() {
        let store = MemoryStore::new();

        assert!(matches!(
            validate(&store, 7, "0000").await,
            Err(TicketError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_redeemed_row_reports_already_redeemed() {
        let store = MemoryStore::new();
        store
            .insert_ticket(&Ticket {
                event_id: 7,
                code: "5555".to_string(),
                signature: "abcd".to_string(),
                redeemed_at: Some(at("2025-03-14T21:00:00Z")),
            })
            .await
            .unwrap();

        assert!(redeem(&store, 7, "5555", "ABCD", Utc::now()).await.unwrap());
    }

    #[tokio::test]
    async fn test_check_in_requires_signature_and_vote() {
        let store = MemoryStore::new();
        let s = secrets();
        let signature = seed_vote(&store, &s, "4821").await;
        let now = Utc::now();

        assert!(matches!(
            check_in(&store, &s, 7, "4821", "00ff", now).await,
            Err(TicketError::SignatureMismatch)
        ));

        let unknown = s.sign_vote_code("9999");
        assert!(matches!(
            check_in(&store, &s, 7, "9999", &unknown, now).await,
            Err(TicketError::NotFound)
        ));
        assert!(matches!(
            validate(&store, 7, "9999").await,
            Err(TicketError::NotFound)
        ));

        let first = check_in(&store, &s, 7, "4821", &signature, now).await.unwrap();
        assert!(!first.already_redeemed);
        assert_eq!(first.vote.player_id, 10);

        let second = check_in(&store, &s, 7, "4821", &signature, now).await.unwrap();
        assert!(second.already_redeemed);
    }

    #[test]
    fn test_validation_url() {
        assert_eq!(
            validation_url("https://mvp.example.com", 7, "4821", "abcd").unwrap(),
            "https://mvp.example.com/lottery/validate?e=7&c=4821&s=abcd"
        );
        assert_eq!(
            validation_url("https://mvp.example.com/app/", 7, "4821", "abcd").unwrap(),
            "https://mvp.example.com/app/lottery/validate?e=7&c=4821&s=abcd"
        );
        assert!(validation_url("not a url", 7, "4821", "abcd").is_err());
    }

    #[test]
    fn test_parse_qr_data() {
        let expected = ScannedTicket {
            event_id: Some(7),
            code: "4821".to_string(),
            signature: "abcd".to_string(),
        };

        let url = validation_url("https://mvp.example.com", 7, "4821", "abcd").unwrap();
        assert_eq!(parse_qr_data(&url).unwrap(), expected);
        assert_eq!(
            parse_qr_data(r#"{"event_id": 7, "code": "4821", "signature": "abcd"}"#).unwrap(),
            expected
        );
        assert_eq!(
            parse_qr_data(r#" {"code": "4821", "signature": "abcd"} "#)
                .unwrap()
                .event_id,
            None
        );

        for raw in ["", "garbage", "https://mvp.example.com/lottery/validate?e=7&c=4821", "{}"] {
            assert!(
                matches!(parse_qr_data(raw), Err(TicketError::MissingParameters)),
                "{raw}"
            );
        }
    }
}
