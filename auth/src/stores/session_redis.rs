//! Redis-based session store.
//!
//! # Key layout
//!
//! - `auth:session:{session_id}` → bincode-serialized [`Session`]
//! - `auth:session:user:{user_id}` → Set of `session_id|family_id` members
//!   (the family rides along so bulk revocation can drop family records
//!   without decoding bincode rows)
//! - `auth:session:family:{family_id}` → compact family record
//!   (`session_id|generation|refresh_exp|absolute_exp|revoked`)
//! - `auth:session:rth:{refresh_hash}` → `family_id|generation`, for every
//!   generation ever issued (superseded hashes stay indexed so reuse can be
//!   recognized as theft rather than as an unknown token)
//!
//! Rotation resolves a presented hash through the rth index to its family
//! record; a missing family record reads as Unknown. Hash-index entries are
//! therefore never swept individually — deleting the family record is what
//! invalidates them, and their own TTLs bound the leftover keys.
//!
//! The family record is the linearization point: rotation runs as one Lua
//! script that compares the presented generation against the current one
//! and either advances the family or revokes it. The bincode session row is
//! a projection updated after the CAS; the family record wins on any
//! disagreement.
//!
//! All keys carry TTLs bounded by the absolute session lifetime, so Redis
//! self-cleans expired state; [`SessionStore::reap`] removes dangling
//! user-set references on top.

use crate::error::{AuthError, Result};
use crate::providers::session::{RotateOutcome, SessionStore};
use crate::state::{RevocationReason, Session, SessionId, UserId};
use chrono::{DateTime, Duration, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};

/// Redis-backed [`SessionStore`] with atomic per-family rotation.
#[derive(Clone)]
pub struct RedisSessionStore {
    conn_manager: ConnectionManager,
}

const ROTATE_SCRIPT: &str = r"
local idx = redis.call('GET', KEYS[1])
if not idx then return {'unknown'} end
local sep = string.find(idx, '|', 1, true)
local family = string.sub(idx, 1, sep - 1)
local presented_gen = tonumber(string.sub(idx, sep + 1))

local famkey = 'auth:session:family:' .. family
local fam = redis.call('GET', famkey)
if not fam then return {'unknown'} end

local parts = {}
for part in string.gmatch(fam, '([^|]+)') do table.insert(parts, part) end
local session_id = parts[1]
local current_gen = tonumber(parts[2])
local refresh_exp = tonumber(parts[3])
local absolute_exp = tonumber(parts[4])
local revoked = parts[5]

if revoked == '1' then return {'unknown'} end

local now = tonumber(ARGV[1])
if now >= refresh_exp or now >= absolute_exp then return {'expired', session_id} end

if presented_gen < current_gen then
    redis.call('SET', famkey,
        session_id .. '|' .. current_gen .. '|' .. refresh_exp .. '|' .. absolute_exp .. '|1',
        'KEEPTTL')
    return {'reused', session_id}
end

local new_gen = current_gen + 1
local new_refresh_exp = math.min(now + tonumber(ARGV[2]), absolute_exp)
redis.call('SET', famkey,
    session_id .. '|' .. new_gen .. '|' .. new_refresh_exp .. '|' .. absolute_exp .. '|0',
    'KEEPTTL')
redis.call('SET', 'auth:session:rth:' .. ARGV[3], family .. '|' .. new_gen,
    'EX', math.max(absolute_exp - now, 1))
return {'rotated', session_id, tostring(new_gen), tostring(new_refresh_exp)}
";

impl RedisSessionStore {
    /// Connect to Redis.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::DependencyUnavailable`] if the connection fails.
    pub async fn new(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url)
            .map_err(|e| AuthError::DependencyUnavailable(format!("redis client: {e}")))?;
        let conn_manager = ConnectionManager::new(client)
            .await
            .map_err(|e| AuthError::DependencyUnavailable(format!("redis connection: {e}")))?;
        Ok(Self { conn_manager })
    }

    fn session_key(session_id: SessionId) -> String {
        format!("auth:session:{}", session_id.0)
    }

    fn user_sessions_key(user_id: UserId) -> String {
        format!("auth:session:user:{}", user_id.0)
    }

    fn family_key(family_id: &str) -> String {
        format!("auth:session:family:{family_id}")
    }

    fn refresh_hash_key(hash: &str) -> String {
        format!("auth:session:rth:{hash}")
    }

    /// Member stored in the per-user set: `session_id|family_id`.
    fn user_set_member(session: &Session) -> String {
        format!("{}|{}", session.session_id.0, session.family_id.0)
    }

    /// Split a user-set member back into its session and family parts.
    fn split_member(member: &str) -> (&str, Option<&str>) {
        match member.split_once('|') {
            Some((session_id, family_id)) => (session_id, Some(family_id)),
            None => (member, None),
        }
    }

    fn family_record(session: &Session) -> String {
        format!(
            "{}|{}|{}|{}|{}",
            session.session_id.0,
            session.generation,
            session.refresh_expires_at.timestamp(),
            session.absolute_expires_at.timestamp(),
            u8::from(session.revoked),
        )
    }

    async fn load_session(&self, session_id: SessionId) -> Result<Option<Session>> {
        let mut conn = self.conn_manager.clone();
        let bytes: Option<Vec<u8>> = conn
            .get(Self::session_key(session_id))
            .await
            .map_err(|e| AuthError::TemporaryFailure(format!("session get: {e}")))?;
        match bytes {
            Some(bytes) => bincode::deserialize(&bytes)
                .map(Some)
                .map_err(|e| AuthError::SerializationError(e.to_string())),
            None => Ok(None),
        }
    }

    async fn store_session(&self, session: &Session, now: DateTime<Utc>) -> Result<()> {
        let mut conn = self.conn_manager.clone();
        let bytes = bincode::serialize(session)
            .map_err(|e| AuthError::SerializationError(e.to_string()))?;
        let ttl = ttl_seconds(session.absolute_expires_at, now);
        let _: () = conn
            .set_ex(Self::session_key(session.session_id), bytes, ttl)
            .await
            .map_err(|e| AuthError::TemporaryFailure(format!("session set: {e}")))?;
        Ok(())
    }

    async fn load_by_id_str(&self, session_id: &str) -> Result<Option<Session>> {
        let parsed = session_id
            .parse::<uuid::Uuid>()
            .map_err(|_| AuthError::SerializationError("session id malformed".into()))?;
        self.load_session(SessionId(parsed)).await
    }
}

impl SessionStore for RedisSessionStore {
    async fn create_session(&self, session: &Session) -> Result<()> {
        let mut conn = self.conn_manager.clone();
        let now = Utc::now();
        let session_key = Self::session_key(session.session_id);

        // Reject duplicate session IDs (session fixation).
        let exists: bool = conn
            .exists(&session_key)
            .await
            .map_err(|e| AuthError::TemporaryFailure(format!("session exists: {e}")))?;
        if exists {
            return Err(AuthError::InvariantViolation("session id already exists".into()));
        }

        let bytes = bincode::serialize(session)
            .map_err(|e| AuthError::SerializationError(e.to_string()))?;
        let ttl = ttl_seconds(session.absolute_expires_at, now);
        #[allow(clippy::cast_possible_wrap)]
        let set_ttl = (ttl + 86_400) as i64;

        let _: () = redis::pipe()
            .atomic()
            .set_ex(&session_key, bytes, ttl)
            .sadd(
                Self::user_sessions_key(session.user_id),
                Self::user_set_member(session),
            )
            .ignore()
            .expire(Self::user_sessions_key(session.user_id), set_ttl)
            .ignore()
            .set_ex(
                Self::family_key(&session.family_id.0.to_string()),
                Self::family_record(session),
                ttl,
            )
            .ignore()
            .set_ex(
                Self::refresh_hash_key(&session.refresh_hash),
                format!("{}|{}", session.family_id.0, session.generation),
                ttl,
            )
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(|e| AuthError::TemporaryFailure(format!("session create: {e}")))?;

        tracing::info!(
            session_id = %session.session_id.0,
            user_id = %session.user_id.0,
            family = %session.family_id.0,
            "session created"
        );
        Ok(())
    }

    async fn get_session(&self, session_id: SessionId) -> Result<Option<Session>> {
        self.load_session(session_id).await
    }

    async fn rotate_refresh(
        &self,
        presented_hash: &str,
        new_hash: &str,
        now: DateTime<Utc>,
        refresh_ttl: Duration,
        access_expires_at: DateTime<Utc>,
    ) -> Result<RotateOutcome> {
        let mut conn = self.conn_manager.clone();
        let script = redis::Script::new(ROTATE_SCRIPT);
        let reply: Vec<String> = script
            .key(Self::refresh_hash_key(presented_hash))
            .arg(now.timestamp())
            .arg(refresh_ttl.num_seconds().max(1))
            .arg(new_hash)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| AuthError::TemporaryFailure(format!("rotate script: {e}")))?;

        match reply.first().map(String::as_str) {
            Some("rotated") => {
                let session_id = reply.get(1).ok_or_else(malformed_reply)?;
                let generation: u64 = reply
                    .get(2)
                    .and_then(|g| g.parse().ok())
                    .ok_or_else(malformed_reply)?;
                let refresh_exp: i64 = reply
                    .get(3)
                    .and_then(|g| g.parse().ok())
                    .ok_or_else(malformed_reply)?;

                // Project the CAS result onto the session row. The family
                // record is authoritative; this row is read-side state.
                let Some(mut session) = self.load_by_id_str(session_id).await? else {
                    return Ok(RotateOutcome::Unknown);
                };
                session.generation = generation;
                session.refresh_hash = new_hash.to_string();
                session.refresh_expires_at =
                    DateTime::from_timestamp(refresh_exp, 0).unwrap_or(session.absolute_expires_at);
                session.access_expires_at = access_expires_at;
                session.last_seen = now;
                self.store_session(&session, now).await?;

                tracing::debug!(
                    session_id = %session.session_id.0,
                    generation,
                    "refresh family rotated"
                );
                Ok(RotateOutcome::Rotated(session))
            }
            Some("reused") => {
                let session_id = reply.get(1).ok_or_else(malformed_reply)?;
                let session = match self.load_by_id_str(session_id).await? {
                    Some(mut session) => {
                        session.revoked = true;
                        session.revoked_reason = Some(RevocationReason::RefreshReused);
                        self.store_session(&session, now).await?;
                        session
                    }
                    None => return Ok(RotateOutcome::Unknown),
                };
                tracing::warn!(
                    session_id = %session.session_id.0,
                    family = %session.family_id.0,
                    "superseded refresh token presented, family revoked"
                );
                Ok(RotateOutcome::Reused { session })
            }
            Some("expired") => Ok(RotateOutcome::Expired),
            _ => Ok(RotateOutcome::Unknown),
        }
    }

    async fn revoke_session(
        &self,
        session_id: SessionId,
        reason: RevocationReason,
    ) -> Result<bool> {
        let mut conn = self.conn_manager.clone();
        let now = Utc::now();
        let Some(mut session) = self.load_session(session_id).await? else {
            return Ok(false);
        };

        session.revoked = true;
        session.revoked_reason = Some(reason);
        self.store_session(&session, now).await?;

        // Mark the family record so refresh rotation stops immediately.
        let fam_key = Self::family_key(&session.family_id.0.to_string());
        let record = Self::family_record(&session);
        let ttl = ttl_seconds(session.absolute_expires_at, now);
        let _: () = conn
            .set_ex(fam_key, record, ttl)
            .await
            .map_err(|e| AuthError::TemporaryFailure(format!("family revoke: {e}")))?;

        tracing::info!(session_id = %session_id.0, ?reason, "session revoked");
        Ok(true)
    }

    async fn revoke_all_for_user(
        &self,
        user_id: UserId,
        reason: RevocationReason,
    ) -> Result<usize> {
        let mut conn = self.conn_manager.clone();
        let user_key = Self::user_sessions_key(user_id);

        // Atomic bulk delete over the user's set: session rows and family
        // records go together, so a post-revocation refresh resolves its
        // hash-index entry to a missing family and reads Unknown. The rth
        // keys themselves are left to their TTLs — they are inert without
        // a family record.
        let script = redis::Script::new(
            r"
            local removed = 0
            local members = redis.call('SMEMBERS', KEYS[1])
            for _, member in ipairs(members) do
                local sid = member
                local fid = nil
                local sep = string.find(member, '|', 1, true)
                if sep then
                    sid = string.sub(member, 1, sep - 1)
                    fid = string.sub(member, sep + 1)
                end
                if redis.call('DEL', 'auth:session:' .. sid) == 1 then
                    removed = removed + 1
                end
                if fid then
                    redis.call('DEL', 'auth:session:family:' .. fid)
                end
            end
            redis.call('DEL', KEYS[1])
            return removed
            ",
        );
        let removed: usize = script
            .key(&user_key)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| AuthError::TemporaryFailure(format!("revoke all: {e}")))?;

        tracing::info!(user_id = %user_id.0, removed, ?reason, "all sessions revoked");
        Ok(removed)
    }

    async fn list_active(&self, user_id: UserId, now: DateTime<Utc>) -> Result<Vec<Session>> {
        let mut conn = self.conn_manager.clone();
        let members: Vec<String> = conn
            .smembers(Self::user_sessions_key(user_id))
            .await
            .map_err(|e| AuthError::TemporaryFailure(format!("user sessions: {e}")))?;

        let mut sessions = Vec::new();
        for member in members {
            let (session_id, _) = Self::split_member(&member);
            if let Some(session) = self.load_by_id_str(session_id).await? {
                if session.is_live(now) {
                    sessions.push(session);
                }
            }
        }
        Ok(sessions)
    }

    async fn reap(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut conn = self.conn_manager.clone();
        let mut removed = 0usize;

        // Physical expiry is TTL-driven; this sweep drops dangling set
        // references and rows past their absolute cap.
        let keys: Vec<String> = {
            let mut iter = conn
                .scan_match::<_, String>("auth:session:user:*")
                .await
                .map_err(|e| AuthError::TemporaryFailure(format!("reap scan: {e}")))?;
            let mut keys = Vec::new();
            while let Some(key) = iter.next_item().await {
                keys.push(key);
            }
            keys
        };

        for user_key in keys {
            let members: Vec<String> = conn
                .smembers(&user_key)
                .await
                .map_err(|e| AuthError::TemporaryFailure(format!("reap smembers: {e}")))?;
            for member in members {
                let (session_id, family_id) = Self::split_member(&member);
                let live = match self.load_by_id_str(session_id).await? {
                    Some(session) if session.is_live(now) => true,
                    Some(session) => {
                        let _: () = conn
                            .del(Self::session_key(session.session_id))
                            .await
                            .map_err(|e| {
                                AuthError::TemporaryFailure(format!("reap del: {e}"))
                            })?;
                        false
                    }
                    None => false,
                };
                if !live {
                    if let Some(family_id) = family_id {
                        let _: () = conn.del(Self::family_key(family_id)).await.map_err(|e| {
                            AuthError::TemporaryFailure(format!("reap family del: {e}"))
                        })?;
                    }
                    let _: () = conn.srem(&user_key, &member).await.map_err(|e| {
                        AuthError::TemporaryFailure(format!("reap srem: {e}"))
                    })?;
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}

fn ttl_seconds(until: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    #[allow(clippy::cast_sign_loss)]
    let seconds = (until - now).num_seconds().max(1) as u64;
    seconds
}

fn malformed_reply() -> AuthError {
    AuthError::SerializationError("rotate script reply malformed".into())
}
