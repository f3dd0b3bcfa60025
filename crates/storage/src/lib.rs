use chrono::{DateTime, Utc};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_postgres::error::SqlState;
use tokio_postgres::{Client, NoTls, Row};

const INIT_SQL: &str = include_str!("../migrations/001_init.sql");

#[derive(Debug)]
pub enum StorageError {
    Postgres,
    Redis,
    Serialization,
    Missing,
    Conflict,
    Invalid,
}

impl Display for StorageError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Postgres => write!(f, "postgres failure"),
            Self::Redis => write!(f, "redis failure"),
            Self::Serialization => write!(f, "serialization failure"),
            Self::Missing => write!(f, "missing record"),
            Self::Conflict => write!(f, "conflicting state"),
            Self::Invalid => write!(f, "invalid state"),
        }
    }
}

impl Error for StorageError {}

pub struct Storage {
    client: Client,
    _pg_task: JoinHandle<()>,
    redis: Arc<Mutex<redis::aio::MultiplexedConnection>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserStatus {
    Active,
    Banned,
    Deleted,
}

impl UserStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserStatus::Active => "active",
            UserStatus::Banned => "banned",
            UserStatus::Deleted => "deleted",
        }
    }
}

impl FromStr for UserStatus {
    type Err = StorageError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "active" => Ok(UserStatus::Active),
            "banned" => Ok(UserStatus::Banned),
            "deleted" => Ok(UserStatus::Deleted),
            _ => Err(StorageError::Serialization),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewUserProfile {
    pub user_id: String,
    pub handle: String,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserProfile {
    pub user_id: String,
    pub handle: String,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
    pub push_token: Option<String>,
    pub status: UserStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallType {
    Audio,
    Video,
}

impl CallType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallType::Audio => "audio",
            CallType::Video => "video",
        }
    }
}

impl FromStr for CallType {
    type Err = StorageError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "audio" => Ok(CallType::Audio),
            "video" => Ok(CallType::Video),
            _ => Err(StorageError::Serialization),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    Requested,
    Accepted,
    Rejected,
    Ended,
    Missed,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Requested => "requested",
            CallStatus::Accepted => "accepted",
            CallStatus::Rejected => "rejected",
            CallStatus::Ended => "ended",
            CallStatus::Missed => "missed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CallStatus::Rejected | CallStatus::Ended | CallStatus::Missed
        )
    }
}

impl FromStr for CallStatus {
    type Err = StorageError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "requested" => Ok(CallStatus::Requested),
            "accepted" => Ok(CallStatus::Accepted),
            "rejected" => Ok(CallStatus::Rejected),
            "ended" => Ok(CallStatus::Ended),
            "missed" => Ok(CallStatus::Missed),
            _ => Err(StorageError::Serialization),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewCall {
    pub call_id: String,
    pub caller: String,
    pub receiver: String,
    pub call_type: CallType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRecord {
    pub call_id: String,
    pub caller: String,
    pub receiver: String,
    pub call_type: CallType,
    pub status: CallStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub data_usage: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub message_id: String,
    pub sender: String,
    pub receiver: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub message_id: String,
    pub sender: String,
    pub receiver: String,
    pub content: String,
    pub delivered: bool,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    pub session_id: String,
    pub user_id: String,
    pub token_digest: String,
    pub created_at: DateTime<Utc>,
    pub ttl_seconds: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceSnapshot {
    pub entity: String,
    pub state: String,
    pub expires_at: DateTime<Utc>,
}

const CALL_COLUMNS: &str =
    "call_id, caller, receiver, call_type, status, started_at, ended_at, data_usage";
const MESSAGE_COLUMNS: &str =
    "message_id, sender, receiver, content, delivered, read, created_at";
const USER_COLUMNS: &str =
    "user_id, handle, display_name, avatar_url, push_token, status, created_at, updated_at";

fn call_from_row(row: &Row) -> Result<CallRecord, StorageError> {
    let call_type: String = row.get(3);
    let status: String = row.get(4);
    Ok(CallRecord {
        call_id: row.get(0),
        caller: row.get(1),
        receiver: row.get(2),
        call_type: CallType::from_str(call_type.as_str())?,
        status: CallStatus::from_str(status.as_str())?,
        started_at: row.get(5),
        ended_at: row.get(6),
        data_usage: row.get(7),
    })
}

fn message_from_row(row: &Row) -> MessageRecord {
    MessageRecord {
        message_id: row.get(0),
        sender: row.get(1),
        receiver: row.get(2),
        content: row.get(3),
        delivered: row.get(4),
        read: row.get(5),
        created_at: row.get(6),
    }
}

fn user_from_row(row: &Row) -> Result<UserProfile, StorageError> {
    let status: String = row.get(5);
    Ok(UserProfile {
        user_id: row.get(0),
        handle: row.get(1),
        display_name: row.get(2),
        avatar_url: row.get(3),
        push_token: row.get(4),
        status: UserStatus::from_str(status.as_str())?,
        created_at: row.get(6),
        updated_at: row.get(7),
    })
}

/// Opens the PostgreSQL and Redis connections.
pub async fn connect(postgres_dsn: &str, redis_url: &str) -> Result<Storage, StorageError> {
    let (client, connection) = tokio_postgres::connect(postgres_dsn, NoTls)
        .await
        .map_err(|_| StorageError::Postgres)?;
    let task = tokio::spawn(async move {
        if let Err(error) = connection.await {
            tracing::error!(error = %error, "postgres connection stopped");
        }
    });
    let redis_client = redis::Client::open(redis_url).map_err(|_| StorageError::Redis)?;
    let redis_connection = redis_client
        .get_multiplexed_async_connection()
        .await
        .map_err(|_| StorageError::Redis)?;
    Ok(Storage {
        client,
        _pg_task: task,
        redis: Arc::new(Mutex::new(redis_connection)),
    })
}

impl Storage {
    /// Applies the bundled schema migration.
    pub async fn migrate(&self) -> Result<(), StorageError> {
        self.client
            .batch_execute(INIT_SQL)
            .await
            .map_err(|_| StorageError::Postgres)
    }

    /// Probes both backends for readiness.
    pub async fn readiness(&self) -> Result<(), StorageError> {
        self.client
            .simple_query("SELECT 1")
            .await
            .map_err(|_| StorageError::Postgres)?;
        let mut conn = self.redis.lock().await;
        let _: String = redis::cmd("PING")
            .query_async::<String>(&mut *conn)
            .await
            .map_err(|_| StorageError::Redis)?;
        Ok(())
    }

    /// Creates a new user profile entry.
    pub async fn create_user(&self, profile: &NewUserProfile) -> Result<UserProfile, StorageError> {
        let now = Utc::now();
        let query = format!(
            "INSERT INTO app_user (user_id, handle, display_name, avatar_url, status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, 'active', $5, $5)
            RETURNING {USER_COLUMNS}"
        );
        let row = self
            .client
            .query_one(
                query.as_str(),
                &[
                    &profile.user_id,
                    &profile.handle,
                    &profile.display_name,
                    &profile.avatar_url,
                    &now,
                ],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        user_from_row(&row)
    }

    /// Loads a user profile by identifier.
    pub async fn load_user(&self, user_id: &str) -> Result<UserProfile, StorageError> {
        let query = format!("SELECT {USER_COLUMNS} FROM app_user WHERE user_id = $1");
        let row = self
            .client
            .query_opt(query.as_str(), &[&user_id])
            .await
            .map_err(|_| StorageError::Postgres)?;
        let row = row.ok_or(StorageError::Missing)?;
        user_from_row(&row)
    }

    /// Upserts the push notification token supplied by a client.
    pub async fn set_push_token(&self, user_id: &str, token: &str) -> Result<(), StorageError> {
        let now = Utc::now();
        let affected = self
            .client
            .execute(
                "UPDATE app_user SET push_token = $2, updated_at = $3 WHERE user_id = $1",
                &[&user_id, &token, &now],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        if affected == 0 {
            return Err(StorageError::Missing);
        }
        Ok(())
    }

    /// Reports whether the user participates in any non-terminal call.
    pub async fn is_user_busy(&self, user_id: &str) -> Result<bool, StorageError> {
        let row = self
            .client
            .query_opt(
                "SELECT 1 FROM call
                WHERE (caller = $1 OR receiver = $1) AND status IN ('requested', 'accepted')
                LIMIT 1",
                &[&user_id],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(row.is_some())
    }

    /// Creates a call in `requested` state unless either party already has an
    /// active call. Returns `None` when the claim is lost, including when a
    /// concurrent insert wins via the partial unique indexes.
    pub async fn create_call(&self, call: &NewCall) -> Result<Option<CallRecord>, StorageError> {
        let now = Utc::now();
        let query = format!(
            "INSERT INTO call (call_id, caller, receiver, call_type, status, started_at, data_usage)
            SELECT $1, $2, $3, $4, 'requested', $5, 0
            WHERE NOT EXISTS (
                SELECT 1 FROM call
                WHERE (caller = $2 OR receiver = $2 OR caller = $3 OR receiver = $3)
                  AND status IN ('requested', 'accepted')
            )
            RETURNING {CALL_COLUMNS}"
        );
        let result = self
            .client
            .query_opt(
                query.as_str(),
                &[
                    &call.call_id,
                    &call.caller,
                    &call.receiver,
                    &call.call_type.as_str(),
                    &now,
                ],
            )
            .await;
        match result {
            Ok(Some(row)) => Ok(Some(call_from_row(&row)?)),
            Ok(None) => Ok(None),
            Err(error) => {
                if error.code() == Some(&SqlState::UNIQUE_VIOLATION) {
                    return Ok(None);
                }
                Err(StorageError::Postgres)
            }
        }
    }

    /// Loads a call record by identifier.
    pub async fn load_call(&self, call_id: &str) -> Result<CallRecord, StorageError> {
        let query = format!("SELECT {CALL_COLUMNS} FROM call WHERE call_id = $1");
        let row = self
            .client
            .query_opt(query.as_str(), &[&call_id])
            .await
            .map_err(|_| StorageError::Postgres)?;
        let row = row.ok_or(StorageError::Missing)?;
        call_from_row(&row)
    }

    async fn transition_call(
        &self,
        call_id: &str,
        allowed_from: &[CallStatus],
        to: CallStatus,
        ended_at: Option<DateTime<Utc>>,
        data_usage: Option<i64>,
    ) -> Result<CallRecord, StorageError> {
        let from: Vec<String> = allowed_from
            .iter()
            .map(|status| status.as_str().to_string())
            .collect();
        let query = format!(
            "UPDATE call
            SET status = $2,
                ended_at = COALESCE($3, ended_at),
                data_usage = COALESCE($4, data_usage)
            WHERE call_id = $1 AND status = ANY($5)
            RETURNING {CALL_COLUMNS}"
        );
        let row = self
            .client
            .query_opt(
                query.as_str(),
                &[&call_id, &to.as_str(), &ended_at, &data_usage, &from],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        match row {
            Some(row) => call_from_row(&row),
            None => {
                let exists = self
                    .client
                    .query_opt("SELECT 1 FROM call WHERE call_id = $1", &[&call_id])
                    .await
                    .map_err(|_| StorageError::Postgres)?;
                if exists.is_some() {
                    Err(StorageError::Conflict)
                } else {
                    Err(StorageError::Missing)
                }
            }
        }
    }

    /// Moves a ringing call to `accepted`.
    pub async fn accept_call(&self, call_id: &str) -> Result<CallRecord, StorageError> {
        self.transition_call(
            call_id,
            &[CallStatus::Requested],
            CallStatus::Accepted,
            None,
            None,
        )
        .await
    }

    /// Moves a ringing call to `rejected`.
    pub async fn reject_call(&self, call_id: &str) -> Result<CallRecord, StorageError> {
        self.transition_call(
            call_id,
            &[CallStatus::Requested],
            CallStatus::Rejected,
            None,
            None,
        )
        .await
    }

    /// Moves an accepted call to `ended`, stamping the end time and usage.
    pub async fn end_call(
        &self,
        call_id: &str,
        ended_at: Option<DateTime<Utc>>,
        data_usage: Option<i64>,
    ) -> Result<CallRecord, StorageError> {
        let ended_at = ended_at.unwrap_or_else(Utc::now);
        self.transition_call(
            call_id,
            &[CallStatus::Accepted],
            CallStatus::Ended,
            Some(ended_at),
            Some(data_usage.unwrap_or(0)),
        )
        .await
    }

    /// Moves a call that is still ringing to `missed`. The status guard makes
    /// a late timer firing a no-op once the call has advanced.
    pub async fn expire_call(&self, call_id: &str) -> Result<CallRecord, StorageError> {
        self.transition_call(
            call_id,
            &[CallStatus::Requested],
            CallStatus::Missed,
            Some(Utc::now()),
            None,
        )
        .await
    }

    /// Lists call records involving the user, newest first.
    pub async fn list_calls_for_user(
        &self,
        user_id: &str,
        limit: i64,
    ) -> Result<Vec<CallRecord>, StorageError> {
        let query = format!(
            "SELECT {CALL_COLUMNS} FROM call
            WHERE caller = $1 OR receiver = $1
            ORDER BY started_at DESC LIMIT $2"
        );
        let rows = self
            .client
            .query(query.as_str(), &[&user_id, &limit])
            .await
            .map_err(|_| StorageError::Postgres)?;
        let mut calls = Vec::with_capacity(rows.len());
        for row in rows {
            calls.push(call_from_row(&row)?);
        }
        Ok(calls)
    }

    /// Persists a chat message; the delivered flag is set on creation.
    pub async fn create_message(
        &self,
        message: &NewMessage,
    ) -> Result<MessageRecord, StorageError> {
        let now = Utc::now();
        let query = format!(
            "INSERT INTO message (message_id, sender, receiver, content, delivered, read, created_at)
            VALUES ($1, $2, $3, $4, TRUE, FALSE, $5)
            RETURNING {MESSAGE_COLUMNS}"
        );
        let row = self
            .client
            .query_one(
                query.as_str(),
                &[
                    &message.message_id,
                    &message.sender,
                    &message.receiver,
                    &message.content,
                    &now,
                ],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(message_from_row(&row))
    }

    /// Sets the read flag; `None` when no record matches the identifier.
    pub async fn mark_message_read(
        &self,
        message_id: &str,
    ) -> Result<Option<MessageRecord>, StorageError> {
        let query = format!(
            "UPDATE message SET read = TRUE WHERE message_id = $1 RETURNING {MESSAGE_COLUMNS}"
        );
        let row = self
            .client
            .query_opt(query.as_str(), &[&message_id])
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(row.map(|row| message_from_row(&row)))
    }

    /// Lists messages exchanged between two users, newest first.
    pub async fn list_messages_between(
        &self,
        user_a: &str,
        user_b: &str,
        limit: i64,
    ) -> Result<Vec<MessageRecord>, StorageError> {
        let query = format!(
            "SELECT {MESSAGE_COLUMNS} FROM message
            WHERE (sender = $1 AND receiver = $2) OR (sender = $2 AND receiver = $1)
            ORDER BY created_at DESC LIMIT $3"
        );
        let rows = self
            .client
            .query(query.as_str(), &[&user_a, &user_b, &limit])
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(rows.iter().map(message_from_row).collect())
    }

    /// Stores a session issued by the external credential service.
    pub async fn record_session(&self, session: &SessionRecord) -> Result<(), StorageError> {
        self.client
            .execute(
                "INSERT INTO session (session_id, user_id, token_digest, created_at, ttl_seconds)
                VALUES ($1, $2, $3, $4, $5)",
                &[
                    &session.session_id,
                    &session.user_id,
                    &session.token_digest,
                    &session.created_at,
                    &session.ttl_seconds,
                ],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(())
    }

    /// Resolves an unexpired session by bearer-token digest.
    pub async fn load_session_by_digest(
        &self,
        token_digest: &str,
    ) -> Result<SessionRecord, StorageError> {
        let row = self
            .client
            .query_opt(
                "SELECT session_id, user_id, token_digest, created_at, ttl_seconds FROM session
                WHERE token_digest = $1
                  AND created_at + make_interval(secs => ttl_seconds::double precision) > now()",
                &[&token_digest],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        let row = row.ok_or(StorageError::Missing)?;
        Ok(SessionRecord {
            session_id: row.get(0),
            user_id: row.get(1),
            token_digest: row.get(2),
            created_at: row.get(3),
            ttl_seconds: row.get(4),
        })
    }

    /// Removes sessions past their time to live.
    pub async fn purge_expired_sessions(&self) -> Result<u64, StorageError> {
        let affected = self
            .client
            .execute(
                "DELETE FROM session
                WHERE created_at + make_interval(secs => ttl_seconds::double precision) <= now()",
                &[],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(affected)
    }

    /// Publishes a presence snapshot with its own expiry.
    pub async fn publish_presence(&self, snapshot: &PresenceSnapshot) -> Result<(), StorageError> {
        let mut conn = self.redis.lock().await;
        let ttl = (snapshot.expires_at.timestamp() - Utc::now().timestamp()).max(1) as usize;
        let payload = serde_json::json!({
            "entity": snapshot.entity.clone(),
            "state": snapshot.state.clone(),
            "expires_at": snapshot.expires_at.to_rfc3339(),
        })
        .to_string();
        redis::cmd("SETEX")
            .arg(format!("presence:{}", snapshot.entity))
            .arg(ttl)
            .arg(payload)
            .query_async::<()>(&mut *conn)
            .await
            .map_err(|_| StorageError::Redis)?;
        Ok(())
    }

    /// Reads back a presence snapshot, if one is still live.
    pub async fn read_presence(
        &self,
        entity: &str,
    ) -> Result<Option<PresenceSnapshot>, StorageError> {
        let mut conn = self.redis.lock().await;
        let value: Option<String> = redis::cmd("GET")
            .arg(format!("presence:{}", entity))
            .query_async::<Option<String>>(&mut *conn)
            .await
            .map_err(|_| StorageError::Redis)?;
        let Some(json) = value else {
            return Ok(None);
        };
        let parsed: serde_json::Value =
            serde_json::from_str(&json).map_err(|_| StorageError::Serialization)?;
        let state = parsed
            .get("state")
            .and_then(|v| v.as_str())
            .unwrap_or("online")
            .to_string();
        let expires = parsed
            .get("expires_at")
            .and_then(|v| v.as_str())
            .ok_or(StorageError::Serialization)?;
        let expires = DateTime::parse_from_rfc3339(expires)
            .map_err(|_| StorageError::Serialization)?
            .with_timezone(&Utc);
        Ok(Some(PresenceSnapshot {
            entity: entity.to_string(),
            state,
            expires_at: expires,
        }))
    }

    /// Records which session currently carries the user.
    pub async fn register_route(
        &self,
        entity: &str,
        session_id: &str,
        ttl_seconds: i64,
    ) -> Result<(), StorageError> {
        let mut conn = self.redis.lock().await;
        redis::cmd("SETEX")
            .arg(format!("route:{}", entity))
            .arg(ttl_seconds.max(1) as usize)
            .arg(session_id)
            .query_async::<()>(&mut *conn)
            .await
            .map_err(|_| StorageError::Redis)?;
        Ok(())
    }

    /// Drops the user's route entry.
    pub async fn clear_route(&self, entity: &str) -> Result<(), StorageError> {
        let mut conn = self.redis.lock().await;
        let _: () = redis::cmd("DEL")
            .arg(format!("route:{}", entity))
            .query_async::<()>(&mut *conn)
            .await
            .map_err(|_| StorageError::Redis)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn init_sql_declares_relations() {
        assert!(INIT_SQL.contains("CREATE TABLE"));
        assert!(INIT_SQL.contains("app_user"));
        assert!(INIT_SQL.contains("call"));
        assert!(INIT_SQL.contains("message"));
        assert!(INIT_SQL.contains("session"));
    }

    #[test]
    fn init_sql_guards_active_calls() {
        assert!(INIT_SQL.contains("call_active_caller_idx"));
        assert!(INIT_SQL.contains("call_active_receiver_idx"));
    }

    #[test]
    fn call_status_roundtrip() {
        assert_eq!(CallStatus::Requested.as_str(), "requested");
        assert_eq!(
            CallStatus::from_str("accepted").unwrap(),
            CallStatus::Accepted
        );
        assert!(CallStatus::from_str("ringing").is_err());
    }

    #[test]
    fn terminal_statuses() {
        assert!(!CallStatus::Requested.is_terminal());
        assert!(!CallStatus::Accepted.is_terminal());
        assert!(CallStatus::Rejected.is_terminal());
        assert!(CallStatus::Ended.is_terminal());
        assert!(CallStatus::Missed.is_terminal());
    }

    #[test]
    fn call_type_roundtrip() {
        assert_eq!(CallType::Audio.as_str(), "audio");
        assert_eq!(CallType::from_str("video").unwrap(), CallType::Video);
        assert!(CallType::from_str("screen").is_err());
    }

    #[test]
    fn user_status_roundtrip() {
        assert_eq!(UserStatus::Active.as_str(), "active");
        assert_eq!(UserStatus::from_str("banned").unwrap(), UserStatus::Banned);
        assert!(UserStatus::from_str("suspended").is_err());
    }

    #[tokio::test]
    async fn storage_integration_flow() -> Result<(), Box<dyn std::error::Error>> {
        let pg = match std::env::var("PEAL_TEST_PG_DSN") {
            Ok(value) => value,
            Err(_) => {
                eprintln!("skipping storage_integration_flow: PEAL_TEST_PG_DSN not set");
                return Ok(());
            }
        };
        let redis = match std::env::var("PEAL_TEST_REDIS_URL") {
            Ok(value) => value,
            Err(_) => {
                eprintln!("skipping storage_integration_flow: PEAL_TEST_REDIS_URL not set");
                return Ok(());
            }
        };
        let storage = connect(&pg, &redis).await?;
        storage.migrate().await?;
        let suffix = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let alice = storage
            .create_user(&NewUserProfile {
                user_id: format!("alice-{}", suffix),
                handle: format!("alice{}", suffix),
                display_name: Some("Alice".to_string()),
                avatar_url: None,
            })
            .await?;
        let bob = storage
            .create_user(&NewUserProfile {
                user_id: format!("bob-{}", suffix),
                handle: format!("bob{}", suffix),
                display_name: None,
                avatar_url: None,
            })
            .await?;

        assert!(!storage.is_user_busy(&bob.user_id).await?);

        let call = storage
            .create_call(&NewCall {
                call_id: format!("call-{}", suffix),
                caller: alice.user_id.clone(),
                receiver: bob.user_id.clone(),
                call_type: CallType::Audio,
            })
            .await?
            .expect("call created");
        assert_eq!(call.status, CallStatus::Requested);
        assert!(storage.is_user_busy(&bob.user_id).await?);
        assert!(storage.is_user_busy(&alice.user_id).await?);

        // Either party being busy blocks a second active call.
        let blocked = storage
            .create_call(&NewCall {
                call_id: format!("call-blocked-{}", suffix),
                caller: bob.user_id.clone(),
                receiver: alice.user_id.clone(),
                call_type: CallType::Video,
            })
            .await?;
        assert!(blocked.is_none());

        let accepted = storage.accept_call(&call.call_id).await?;
        assert_eq!(accepted.status, CallStatus::Accepted);
        match storage.reject_call(&call.call_id).await {
            Err(StorageError::Conflict) => {}
            other => panic!("expected conflict, got {:?}", other.map(|c| c.status)),
        }
        match storage.expire_call(&call.call_id).await {
            Err(StorageError::Conflict) => {}
            other => panic!("expected conflict, got {:?}", other.map(|c| c.status)),
        }
        let ended = storage
            .end_call(&call.call_id, None, Some(2048))
            .await?;
        assert_eq!(ended.status, CallStatus::Ended);
        assert_eq!(ended.data_usage, 2048);
        assert!(ended.ended_at.is_some());
        assert!(!storage.is_user_busy(&bob.user_id).await?);
        match storage.end_call(&call.call_id, None, None).await {
            Err(StorageError::Conflict) => {}
            other => panic!("expected conflict, got {:?}", other.map(|c| c.status)),
        }
        match storage.load_call("no-such-call").await {
            Err(StorageError::Missing) => {}
            other => panic!("expected missing, got {:?}", other.map(|c| c.call_id)),
        }

        let missed = storage
            .create_call(&NewCall {
                call_id: format!("call-missed-{}", suffix),
                caller: alice.user_id.clone(),
                receiver: bob.user_id.clone(),
                call_type: CallType::Video,
            })
            .await?
            .expect("second call created");
        let expired = storage.expire_call(&missed.call_id).await?;
        assert_eq!(expired.status, CallStatus::Missed);
        assert!(expired.ended_at.is_some());

        let history = storage.list_calls_for_user(&alice.user_id, 10).await?;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].call_id, missed.call_id);

        let message = storage
            .create_message(&NewMessage {
                message_id: format!("msg-{}", suffix),
                sender: alice.user_id.clone(),
                receiver: bob.user_id.clone(),
                content: "hello".to_string(),
            })
            .await?;
        assert!(message.delivered);
        assert!(!message.read);
        let marked = storage
            .mark_message_read(&message.message_id)
            .await?
            .expect("message exists");
        assert!(marked.read);
        assert!(storage.mark_message_read("no-such-message").await?.is_none());
        let thread = storage
            .list_messages_between(&bob.user_id, &alice.user_id, 50)
            .await?;
        assert_eq!(thread.len(), 1);

        storage
            .set_push_token(&bob.user_id, "ExponentPushToken[test]")
            .await?;
        let reloaded = storage.load_user(&bob.user_id).await?;
        assert_eq!(
            reloaded.push_token.as_deref(),
            Some("ExponentPushToken[test]")
        );

        let session = SessionRecord {
            session_id: format!("sess-{}", suffix),
            user_id: alice.user_id.clone(),
            token_digest: format!("digest-{}", suffix),
            created_at: Utc::now(),
            ttl_seconds: 3600,
        };
        storage.record_session(&session).await?;
        let loaded = storage.load_session_by_digest(&session.token_digest).await?;
        assert_eq!(loaded.user_id, alice.user_id);
        let expired_session = SessionRecord {
            session_id: format!("sess-old-{}", suffix),
            user_id: alice.user_id.clone(),
            token_digest: format!("digest-old-{}", suffix),
            created_at: Utc::now() - chrono::Duration::hours(2),
            ttl_seconds: 60,
        };
        storage.record_session(&expired_session).await?;
        match storage
            .load_session_by_digest(&expired_session.token_digest)
            .await
        {
            Err(StorageError::Missing) => {}
            other => panic!("expected missing, got {:?}", other.map(|s| s.session_id)),
        }
        let purged = storage.purge_expired_sessions().await?;
        assert!(purged >= 1);

        let snapshot = PresenceSnapshot {
            entity: alice.user_id.clone(),
            state: "online".to_string(),
            expires_at: Utc::now() + chrono::Duration::seconds(30),
        };
        storage.publish_presence(&snapshot).await?;
        let presence = storage
            .read_presence(&alice.user_id)
            .await?
            .expect("presence present");
        assert_eq!(presence.state, "online");
        storage
            .register_route(&alice.user_id, &session.session_id, 30)
            .await?;
        storage.clear_route(&alice.user_id).await?;
        Ok(())
    }
}
