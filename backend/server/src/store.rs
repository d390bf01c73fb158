//! # Vote Store
//!
//! The single source of truth for every invariant that must hold across requests. Every
//! write here is a conditional write that the backend performs atomically, the
//! application never does check-then-insert on its own.
//!
//! ## Records
//! - Fingerprint lock: `(event, daily hash) -> expiry`, at most one live lock per key
//! - Fingerprint record: `(event, daily hash) -> vote time`, blocks new locks until retention prunes it
//! - Vote: `(event, code) -> vote`, code unique within the event
//! - Bypass ledger: set of consumed staff codes
//! - Ticket: `(event, code) -> signature + redeemed_at`, one-way `redeemed_at` transition
//!
//! ## Backends
//! - [`MemoryStore`]: one mutex around plain maps, development and tests
//! - [`crate::database::RedisStore`]: Lua scripts, each executed atomically by Redis
use std::{
    collections::{HashMap, HashSet},
    sync::{Mutex, MutexGuard},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Corrupt record: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Store lock poisoned")]
    Poisoned,

    #[error("Unexpected store reply: {0}")]
    Unexpected(String),
}

/// Why a vote insert was refused. The store decides, callers never parse messages.
#[derive(Error, Debug)]
pub enum InsertVoteError {
    #[error("Vote code already used in this event")]
    CodeCollision,

    #[error("Fingerprint already voted in this event")]
    FingerprintCollision,

    #[error("Bypass code already used")]
    BypassCollision,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What let this vote through.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum VoteIdentity {
    /// Daily fingerprint hash.
    Fingerprint(String),
    /// Staff bypass code, consumed by the vote.
    Bypass(String),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Vote {
    pub event_id: i64,
    pub player_id: i64,
    pub code: String,
    pub signature: String,
    pub identity: VoteIdentity,
    pub device_token: String,
    pub hashed_ip: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Ticket {
    pub event_id: i64,
    pub code: String,
    pub signature: String,
    pub redeemed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Duplicate,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PruneReport {
    pub locks: usize,
    pub fingerprints: usize,
}

#[async_trait]
pub trait VoteStore: Send + Sync {
    async fn ping(&self) -> Result<(), StoreError>;

    /// Drops locks expired at `now` and fingerprint records created before `retain_after`.
    async fn prune(
        &self,
        now: DateTime<Utc>,
        retain_after: DateTime<Utc>,
    ) -> Result<PruneReport, StoreError>;

    /// Takes the lock unless a live lock or a fingerprint record exists for the key.
    async fn try_lock(
        &self,
        event_id: i64,
        fingerprint: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Idempotent.
    async fn unlock(&self, event_id: i64, fingerprint: &str) -> Result<(), StoreError>;

    /// Stores the vote, its identity record and an unredeemed ticket in one step.
    async fn insert_vote(&self, vote: &Vote) -> Result<(), InsertVoteError>;

    async fn find_vote(&self, event_id: i64, code: &str) -> Result<Option<Vote>, StoreError>;

    async fn is_bypass_used(&self, code: &str) -> Result<bool, StoreError>;

    async fn find_ticket(&self, event_id: i64, code: &str) -> Result<Option<Ticket>, StoreError>;

    async fn insert_ticket(&self, ticket: &Ticket) -> Result<InsertOutcome, StoreError>;

    /// Sets `redeemed_at` only if unset. Returns whether this call made the transition.
    async fn mark_redeemed(
        &self,
        event_id: i64,
        code: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;
}

type Key = (i64, String);

fn key(event_id: i64, value: &str) -> Key {
    (event_id, value.to_string())
}

#[derive(Default)]
struct Tables {
    locks: HashMap<Key, DateTime<Utc>>,
    fingerprints: HashMap<Key, DateTime<Utc>>,
    votes: HashMap<Key, Vote>,
    bypass: HashSet<String>,
    tickets: HashMap<Key, Ticket>,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables>, StoreError> {
        self.tables.lock().map_err(|_| StoreError::Poisoned)
    }
}

#[async_trait]
impl VoteStore for MemoryStore {
    async fn ping(&self) -> Result<(), StoreError> {
        self.tables().map(|_| ())
    }

    async fn prune(
        &self,
        now: DateTime<Utc>,
        retain_after: DateTime<Utc>,
    ) -> Result<PruneReport, StoreError> {
        let mut tables = self.tables()?;

        let locks_before = tables.locks.len();
        tables.locks.retain(|_, expires_at| *expires_at > now);

        let fingerprints_before = tables.fingerprints.len();
        tables
            .fingerprints
            .retain(|_, created_at| *created_at >= retain_after);

        Ok(PruneReport {
            locks: locks_before - tables.locks.len(),
            fingerprints: fingerprints_before - tables.fingerprints.len(),
        })
    }

    async fn try_lock(
        &self,
        event_id: i64,
        fingerprint: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut tables = self.tables()?;
        let key = key(event_id, fingerprint);

        if tables.fingerprints.contains_key(&key) {
            return Ok(false);
        }
        if tables.locks.get(&key).is_some_and(|held| *held > now) {
            return Ok(false);
        }

        tables.locks.insert(key, expires_at);
        Ok(true)
    }

    async fn unlock(&self, event_id: i64, fingerprint: &str) -> Result<(), StoreError> {
        self.tables()?.locks.remove(&key(event_id, fingerprint));
        Ok(())
    }

    async fn insert_vote(&self, vote: &Vote) -> Result<(), InsertVoteError> {
        let mut tables = self.tables()?;
        let vote_key = key(vote.event_id, &vote.code);

        if tables.votes.contains_key(&vote_key) {
            return Err(InsertVoteError::CodeCollision);
        }

        match &vote.identity {
            VoteIdentity::Fingerprint(hash) => {
                let fingerprint_key = key(vote.event_id, hash);
                if tables.fingerprints.contains_key(&fingerprint_key) {
                    return Err(InsertVoteError::FingerprintCollision);
                }
                tables.fingerprints.insert(fingerprint_key, vote.created_at);
            }
            VoteIdentity::Bypass(code) => {
                if !tables.bypass.insert(code.clone()) {
                    return Err(InsertVoteError::BypassCollision);
                }
            }
        }

        tables.tickets.entry(vote_key.clone()).or_insert_with(|| Ticket {
            event_id: vote.event_id,
            code: vote.code.clone(),
            signature: vote.signature.clone(),
            redeemed_at: None,
        });
        tables.votes.insert(vote_key, vote.clone());

        Ok(())
    }

    async fn find_vote(&self, event_id: i64, code: &str) -> Result<Option<Vote>, StoreError> {
        Ok(self.tables()?.votes.get(&key(event_id, code)).cloned())
    }

    async fn is_bypass_used(&self, code: &str) -> Result<bool, StoreError> {
        Ok(self.tables()?.bypass.contains(code))
    }

    async fn find_ticket(&self, event_id: i64, code: &str) -> Result<Option<Ticket>, StoreError> {
        Ok(self.tables()?.tickets.get(&key(event_id, code)).cloned())
    }

    async fn insert_ticket(&self, ticket: &Ticket) -> Result<InsertOutcome, StoreError> {
        let mut tables = self.tables()?;
        let ticket_key = key(ticket.event_id, &ticket.code);

        if tables.tickets.contains_key(&ticket_key) {
            return Ok(InsertOutcome::Duplicate);
        }

        tables.tickets.insert(ticket_key, ticket.clone());
        Ok(InsertOutcome::Inserted)
    }

    async fn mark_redeemed(
        &self,
        event_id: i64,
        code: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut tables = self.tables()?;

        match tables.tickets.get_mut(&key(event_id, code)) {
            Some(ticket) if ticket.redeemed_at.is_none() => {
                ticket.redeemed_at = Some(at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
