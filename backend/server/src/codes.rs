//! # Vote Codes
//!
//! Fixed-width numeric codes, uniform over `[10^(d-1), 10^d)` so the leading digit is
//! never zero. A single digit code draws from `[0, 10)`.
//!
//! The store is the arbiter of uniqueness. A code collision draws a fresh code, any
//! other refusal ends the attempt.
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::{Rng, rngs::OsRng};
use thiserror::Error;
use tracing::{debug, error};

use crate::{
    secrets::Secrets,
    store::{InsertVoteError, StoreError, Vote, VoteIdentity, VoteStore},
};

#[derive(Error, Debug)]
pub enum CodeError {
    #[error("No free vote code after {attempts} attempts")]
    Exhausted { attempts: u32 },

    #[error("Fingerprint already voted in this event")]
    AlreadyVoted,

    #[error("Bypass code already used")]
    BypassUsed,

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub trait CodeSource: Send + Sync {
    fn next_code(&self, digits: u32) -> String;
}

pub struct OsCodeSource;

impl CodeSource for OsCodeSource {
    fn next_code(&self, digits: u32) -> String {
        let (low, high) = bounds(digits);
        let code = OsRng.gen_range(low..high);

        format!("{code:0width$}", width = digits.max(1) as usize)
    }
}

fn bounds(digits: u32) -> (u64, u64) {
    if digits <= 1 {
        return (0, 10);
    }

    (10u64.pow(digits - 1), 10u64.pow(digits))
}

/// Everything a vote needs except its code.
#[derive(Debug, Clone)]
pub struct VoteDraft {
    pub event_id: i64,
    pub player_id: i64,
    pub identity: VoteIdentity,
    pub device_token: String,
    pub hashed_ip: String,
    pub created_at: DateTime<Utc>,
}

impl VoteDraft {
    fn with_code(&self, code: String, signature: String) -> Vote {
        Vote {
            event_id: self.event_id,
            player_id: self.player_id,
            code,
            signature,
            identity: self.identity.clone(),
            device_token: self.device_token.clone(),
            hashed_ip: self.hashed_ip.clone(),
            created_at: self.created_at,
        }
    }
}

pub struct CodeGenerator {
    source: Arc<dyn CodeSource>,
    digits: u32,
    max_attempts: u32,
}

impl CodeGenerator {
    pub fn new(source: Arc<dyn CodeSource>, digits: u32, max_attempts: u32) -> Self {
        Self {
            source,
            digits,
            max_attempts,
        }
    }

    pub async fn issue(
        &self,
        store: &dyn VoteStore,
        secrets: &Secrets,
        draft: &VoteDraft,
    ) -> Result<Vote, CodeError> {
        for attempt in 1..=self.max_attempts {
            let code = self.source.next_code(self.digits);
            let signature = secrets.sign_vote_code(&code);
            let vote = draft.with_code(code, signature);

            match store.insert_vote(&vote).await {
                Ok(()) => return Ok(vote),
                Err(InsertVoteError::CodeCollision) => {
                    debug!(event_id = draft.event_id, attempt, "Vote code collision");
                }
                Err(InsertVoteError::FingerprintCollision) => return Err(CodeError::AlreadyVoted),
                Err(InsertVoteError::BypassCollision) => return Err(CodeError::BypassUsed),
                Err(InsertVoteError::Store(e)) => return Err(e.into()),
            }
        }

        error!(
            event_id = draft.event_id,
            attempts = self.max_attempts,
            "Vote code space exhausted"
        );

        Err(CodeError::Exhausted {
            attempts: self.max_attempts,
        })
    }
}
