//! # Redis
//!
//! Persistent backend for locks, votes, tickets and the bypass ledger.
//!
//! ## Requirements
//!
//! - Atomic conditional writes, two phones with the same fingerprint can land on two
//!   workers in the same millisecond
//! - Small dataset, one event is a few thousand votes
//! - Cheap expiry, locks live for a minute and fingerprint records for two days
//!
//! ## Implementation
//!
//! - Every conditional write is a Lua script, Redis runs scripts one at a time
//! - Locks and fingerprint records are sorted sets scored by epoch millis, pruning is a
//!   single `ZREMRANGEBYSCORE`
//! - Votes are one hash per event, code to JSON
//! - Tickets are two hashes per event: code to signature, code to redemption time
//!
//! ## Keys
//!
//! ```text
//! vote:locks                  -> zset "{event}:{hash}" scored by lock expiry
//! vote:fingerprints           -> zset "{event}:{hash}" scored by vote time
//! vote:codes:{event}          -> hash code -> Vote JSON
//! vote:bypass                 -> set of consumed bypass codes
//! ticket:sig:{event}          -> hash code -> signature
//! ticket:redeemed:{event}     -> hash code -> RFC 3339 redemption time
//! event:{event}               -> hash is_active, votes_closed ("1"/"0"), owned by the admin side
//! ```
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::{
    AsyncCommands, Client, Script,
    aio::{ConnectionManager, ConnectionManagerConfig},
};

use crate::{
    events::EventState,
    store::{
        InsertOutcome, InsertVoteError, PruneReport, StoreError, Ticket, Vote, VoteIdentity,
        VoteStore,
    },
};

const LOCKS: &str = "vote:locks";
const FINGERPRINTS: &str = "vote:fingerprints";
const BYPASS: &str = "vote:bypass";

const TRY_LOCK: &str = r#"
if redis.call('ZSCORE', KEYS[2], ARGV[1]) then
    return 0
end
local held = redis.call('ZSCORE', KEYS[1], ARGV[1])
if held and tonumber(held) > tonumber(ARGV[2]) then
    return 0
end
redis.call('ZADD', KEYS[1], ARGV[3], ARGV[1])
return 1
"#;

const INSERT_VOTE: &str = r#"
if redis.call('HEXISTS', KEYS[1], ARGV[1]) == 1 then
    return 'code'
end
if ARGV[3] == 'fingerprint' then
    if redis.call('ZSCORE', KEYS[2], ARGV[4]) then
        return 'fingerprint'
    end
    redis.call('ZADD', KEYS[2], ARGV[5], ARGV[4])
else
    if redis.call('SADD', KEYS[3], ARGV[4]) == 0 then
        return 'bypass'
    end
end
redis.call('HSET', KEYS[1], ARGV[1], ARGV[2])
redis.call('HSETNX', KEYS[4], ARGV[1], ARGV[6])
return 'ok'
"#;

const INSERT_TICKET: &str = r#"
if redis.call('HSETNX', KEYS[1], ARGV[1], ARGV[2]) == 0 then
    return 0
end
if ARGV[3] ~= '' then
    redis.call('HSET', KEYS[2], ARGV[1], ARGV[3])
end
return 1
"#;

const MARK_REDEEMED: &str = r#"
if redis.call('HEXISTS', KEYS[1], ARGV[1]) == 0 then
    return 0
end
return redis.call('HSETNX', KEYS[2], ARGV[1], ARGV[2])
"#;

pub async fn init_redis(redis_url: &str) -> Result<ConnectionManager, StoreError> {
    let config = ConnectionManagerConfig::new()
        .set_number_of_retries(1)
        .set_connection_timeout(Duration::from_millis(100));

    let client = Client::open(redis_url)?;
    let connection_manager = client.get_connection_manager_with_config(config).await?;

    Ok(connection_manager)
}

fn codes_key(event_id: i64) -> String {
    format!("vote:codes:{event_id}")
}

fn ticket_sig_key(event_id: i64) -> String {
    format!("ticket:sig:{event_id}")
}

fn ticket_redeemed_key(event_id: i64) -> String {
    format!("ticket:redeemed:{event_id}")
}

fn member(event_id: i64, fingerprint: &str) -> String {
    format!("{event_id}:{fingerprint}")
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Unexpected(format!("bad timestamp {raw}: {e}")))
}

pub struct RedisStore {
    connection: ConnectionManager,
    try_lock: Script,
    insert_vote: Script,
    insert_ticket: Script,
    mark_redeemed: Script,
}

impl RedisStore {
    pub fn new(connection: ConnectionManager) -> Self {
        Self {
            connection,
            try_lock: Script::new(TRY_LOCK),
            insert_vote: Script::new(INSERT_VOTE),
            insert_ticket: Script::new(INSERT_TICKET),
            mark_redeemed: Script::new(MARK_REDEEMED),
        }
    }
}

#[async_trait]
impl VoteStore for RedisStore {
    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn prune(
        &self,
        now: DateTime<Utc>,
        retain_after: DateTime<Utc>,
    ) -> Result<PruneReport, StoreError> {
        let mut conn = self.connection.clone();

        let (locks, fingerprints): (usize, usize) = redis::pipe()
            .atomic()
            .zrembyscore(LOCKS, "-inf", now.timestamp_millis())
            .zrembyscore(
                FINGERPRINTS,
                "-inf",
                format!("({}", retain_after.timestamp_millis()),
            )
            .query_async(&mut conn)
            .await?;

        Ok(PruneReport {
            locks,
            fingerprints,
        })
    }

    async fn try_lock(
        &self,
        event_id: i64,
        fingerprint: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut conn = self.connection.clone();

        let acquired: i64 = self
            .try_lock
            .key(LOCKS)
            .key(FINGERPRINTS)
            .arg(member(event_id, fingerprint))
            .arg(now.timestamp_millis())
            .arg(expires_at.timestamp_millis())
            .invoke_async(&mut conn)
            .await?;

        Ok(acquired == 1)
    }

    async fn unlock(&self, event_id: i64, fingerprint: &str) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let _: i64 = conn.zrem(LOCKS, member(event_id, fingerprint)).await?;
        Ok(())
    }

    async fn insert_vote(&self, vote: &Vote) -> Result<(), InsertVoteError> {
        let mut conn = self.connection.clone();
        let payload = serde_json::to_string(vote).map_err(StoreError::from)?;

        let (kind, identity) = match &vote.identity {
            VoteIdentity::Fingerprint(hash) => ("fingerprint", member(vote.event_id, hash)),
            VoteIdentity::Bypass(code) => ("bypass", code.clone()),
        };

        let outcome: String = self
            .insert_vote
            .key(codes_key(vote.event_id))
            .key(FINGERPRINTS)
            .key(BYPASS)
            .key(ticket_sig_key(vote.event_id))
            .arg(&vote.code)
            .arg(payload)
            .arg(kind)
            .arg(identity)
            .arg(vote.created_at.timestamp_millis())
            .arg(&vote.signature)
            .invoke_async(&mut conn)
            .await
            .map_err(StoreError::from)?;

        match outcome.as_str() {
            "ok" => Ok(()),
            "code" => Err(InsertVoteError::CodeCollision),
            "fingerprint" => Err(InsertVoteError::FingerprintCollision),
            "bypass" => Err(InsertVoteError::BypassCollision),
            other => Err(StoreError::Unexpected(other.to_string()).into()),
        }
    }

    async fn find_vote(&self, event_id: i64, code: &str) -> Result<Option<Vote>, StoreError> {
        let mut conn = self.connection.clone();
        let raw: Option<String> = conn.hget(codes_key(event_id), code).await?;

        raw.map(|json| serde_json::from_str(&json).map_err(StoreError::from))
            .transpose()
    }

    async fn is_bypass_used(&self, code: &str) -> Result<bool, StoreError> {
        let mut conn = self.connection.clone();
        Ok(conn.sismember(BYPASS, code).await?)
    }

    async fn find_ticket(&self, event_id: i64, code: &str) -> Result<Option<Ticket>, StoreError> {
        let mut conn = self.connection.clone();

        let (signature, redeemed_at): (Option<String>, Option<String>) = redis::pipe()
            .atomic()
            .hget(ticket_sig_key(event_id), code)
            .hget(ticket_redeemed_key(event_id), code)
            .query_async(&mut conn)
            .await?;

        let Some(signature) = signature else {
            return Ok(None);
        };

        Ok(Some(Ticket {
            event_id,
            code: code.to_string(),
            signature,
            redeemed_at: redeemed_at.as_deref().map(parse_time).transpose()?,
        }))
    }

    async fn insert_ticket(&self, ticket: &Ticket) -> Result<InsertOutcome, StoreError> {
        let mut conn = self.connection.clone();

        let inserted: i64 = self
            .insert_ticket
            .key(ticket_sig_key(ticket.event_id))
            .key(ticket_redeemed_key(ticket.event_id))
            .arg(&ticket.code)
            .arg(&ticket.signature)
            .arg(ticket.redeemed_at.map(|t| t.to_rfc3339()).unwrap_or_default())
            .invoke_async(&mut conn)
            .await?;

        Ok(if inserted == 1 {
            InsertOutcome::Inserted
        } else {
            InsertOutcome::Duplicate
        })
    }

    async fn mark_redeemed(
        &self,
        event_id: i64,
        code: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut conn = self.connection.clone();

        let transitioned: i64 = self
            .mark_redeemed
            .key(ticket_sig_key(event_id))
            .key(ticket_redeemed_key(event_id))
            .arg(code)
            .arg(at.to_rfc3339())
            .invoke_async(&mut conn)
            .await?;

        Ok(transitioned == 1)
    }
}

pub struct RedisEventState {
    connection: ConnectionManager,
}

impl RedisEventState {
    pub fn new(connection: ConnectionManager) -> Self {
        Self { connection }
    }

    async fn flags(&self, event_id: i64) -> Result<(bool, bool), StoreError> {
        let mut conn = self.connection.clone();

        let (active, closed): (Option<String>, Option<String>) = redis::cmd("HMGET")
            .arg(format!("event:{event_id}"))
            .arg("is_active")
            .arg("votes_closed")
            .query_async(&mut conn)
            .await?;

        Ok((flag(active.as_deref()), flag(closed.as_deref())))
    }
}

fn flag(raw: Option<&str>) -> bool {
    matches!(raw.map(str::trim), Some("1" | "true"))
}

#[async_trait]
impl EventState for RedisEventState {
    async fn is_active(&self, event_id: i64) -> Result<bool, StoreError> {
        Ok(self.flags(event_id).await?.0)
    }

    async fn is_voting_open(&self, event_id: i64) -> Result<bool, StoreError> {
        let (active, closed) = self.flags(event_id).await?;
        Ok(active && !closed)
    }
}

#[cfg(test)]
mod tests {
    use super::{flag, member};

    #[test]
    fn test_flag_parsing() {
        assert!(flag(Some("1")));
        assert!(flag(Some(" true ")));
        assert!(!flag(Some("0")));
        assert!(!flag(None));
    }

    #[test]
    fn test_member_scopes_hash_by_event() {
        assert_ne!(member(7, "abc"), member(8, "abc"));
    }
}
