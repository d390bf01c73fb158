//! # Vote Submission
//!
//! ```text
//! payload ─> device token ─> hashed ip ─> fingerprint / bypass format
//!         ─> event open? ─> rate limit ─> bypass ledger
//!         ─> fingerprint lock ─> code + vote + ticket ─> receipt
//! ```
//!
//! Everything up to the rate limiter is read-only, a rejected payload never touches the
//! store. Once the lock is held every failure releases it, except a fingerprint that
//! already voted, whose lock is left to expire.
//!
//! Bypass votes skip entropy and locking entirely, the store consumes the bypass code
//! together with the vote.
use std::net::IpAddr;

use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    bypass,
    codes::{CodeError, VoteDraft},
    error::AppError,
    fingerprint::RawFingerprint,
    network::hashed_client_ip,
    state::AppState,
    store::VoteIdentity,
    tickets::validation_url,
};

pub const VOTE_RECORDED: &str = "Vote recorded";

#[derive(Deserialize, Debug, Clone)]
pub struct VoteRequest {
    pub player_id: i64,
    pub event_id: i64,
    #[serde(default)]
    pub device_token: String,
    #[serde(default)]
    pub fingerprint: RawFingerprint,
    /// Staff bypass code, replaces the fingerprint check.
    #[serde(default)]
    pub code: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct VoteReceipt {
    pub code: String,
    pub signature: String,
    pub qr_data: String,
    pub message: String,
}

pub async fn submit(
    state: &AppState,
    request: VoteRequest,
    headers: &HeaderMap,
    peer: Option<IpAddr>,
) -> Result<VoteReceipt, AppError> {
    let device_token = request.device_token.trim();
    if device_token.is_empty() || request.player_id <= 0 {
        return Err(AppError::MalformedPayload);
    }

    let event_id = request.event_id;
    let now = state.clock.now();

    let hashed_ip = hashed_client_ip(&state.secrets, headers, peer).inspect_err(|e| {
        warn!(event_id, error = %e, "Rejected vote without a usable client address");
    })?;

    let identity = match request.code.as_deref().map(str::trim) {
        Some(raw) if !raw.is_empty() => {
            VoteIdentity::Bypass(bypass::verify(&state.secrets, raw).inspect_err(|e| {
                warn!(event_id, hashed_ip = %hashed_ip, error = %e, "Rejected bypass code");
            })?)
        }
        _ => {
            let canonical = request.fingerprint.canonicalize().inspect_err(|e| {
                warn!(event_id, hashed_ip = %hashed_ip, error = %e, "Rejected fingerprint");
            })?;
            VoteIdentity::Fingerprint(canonical.daily_hash(event_id, now))
        }
    };

    if !state.events.is_active(event_id).await? {
        return Err(AppError::NoActiveEvent);
    }
    if !state.events.is_voting_open(event_id).await? {
        return Err(AppError::VotingClosed);
    }

    state
        .rate_limiter
        .check(device_token, &hashed_ip, now)
        .inspect_err(|e| warn!(event_id, hashed_ip = %hashed_ip, error = %e, "Vote throttled"))?;

    let guard = match &identity {
        VoteIdentity::Fingerprint(hash) => Some(state.locks.acquire(event_id, hash, now).await?),
        VoteIdentity::Bypass(code) => {
            if state.store.is_bypass_used(code).await? {
                return Err(AppError::BypassCodeUsed);
            }
            None
        }
    };

    let draft = VoteDraft {
        event_id,
        player_id: request.player_id,
        identity,
        device_token: device_token.to_string(),
        hashed_ip,
        created_at: now,
    };

    let issued = state
        .codes
        .issue(state.store.as_ref(), &state.secrets, &draft)
        .await;

    match (&issued, guard) {
        (Ok(_) | Err(CodeError::AlreadyVoted), Some(guard)) => guard.commit(),
        (Err(_), Some(guard)) => guard.release().await,
        (_, None) => {}
    }

    let vote = issued?;

    info!(
        event_id,
        player_id = vote.player_id,
        hashed_ip = %vote.hashed_ip,
        bypass = matches!(vote.identity, VoteIdentity::Bypass(_)),
        "Vote recorded"
    );

    let qr_data = validation_url(
        &state.config.ticket_base_url,
        event_id,
        &vote.code,
        &vote.signature,
    )?;

    Ok(VoteReceipt {
        code: vote.code,
        signature: vote.signature,
        qr_data,
        message: VOTE_RECORDED.to_string(),
    })
}
