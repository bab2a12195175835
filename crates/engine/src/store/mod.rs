use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use coview_common::types::{
    Annotation, AnnotationKind, Message, Participant, ParticipantRole, Session, SessionStatus,
};
use rand::Rng;
use sqlx::PgPool;
use tokio::sync::RwLock;
use uuid::Uuid;

const JOIN_CODE_LEN: usize = 8;
// Skips 0/O, 1/I/L so codes survive being read aloud.
const JOIN_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKMNPQRSTUVWXYZ23456789";
const JOIN_CODE_MAX_ATTEMPTS: usize = 8;

pub fn generate_join_code() -> String {
    let mut rng = rand::thread_rng();
    (0..JOIN_CODE_LEN)
        .map(|_| JOIN_CODE_ALPHABET[rng.gen_range(0..JOIN_CODE_ALPHABET.len())] as char)
        .collect()
}

/// Durable session state. Postgres in deployment, an in-process map
/// when `COVIEW_ENGINE_DATABASE_URL` is unset (single-node dev mode)
/// and in tests.
#[derive(Clone)]
pub enum SessionStore {
    Postgres(PgPool),
    Memory(Arc<RwLock<MemorySessionStore>>),
}

#[derive(Default)]
pub struct MemorySessionStore {
    sessions: HashMap<Uuid, Session>,
    participants: HashMap<(Uuid, Uuid), Participant>,
    annotations: HashMap<Uuid, Annotation>,
    messages: Vec<Message>,
}

impl SessionStore {
    pub fn in_memory() -> Self {
        Self::Memory(Arc::new(RwLock::new(MemorySessionStore::default())))
    }

    // ── Sessions ────────────────────────────────────────────────────

    /// Creates a session plus its host membership row atomically. The
    /// join code is regenerated on collision with another live session.
    pub async fn create_session(
        &self,
        document_id: Uuid,
        host_user_id: Uuid,
        host_display_name: &str,
        host_color: &str,
        max_participants: i32,
    ) -> Result<(Session, Participant)> {
        match self {
            Self::Postgres(pool) => {
                for _ in 0..JOIN_CODE_MAX_ATTEMPTS {
                    let session_id = Uuid::new_v4();
                    let join_code = generate_join_code();
                    let mut tx = pool.begin().await.context("failed to begin transaction")?;

                    let inserted = sqlx::query_as::<_, SessionRow>(
                        r#"
                        INSERT INTO sessions (id, document_id, host_user_id, join_code, status, max_participants)
                        VALUES ($1, $2, $3, $4, 'waiting', $5)
                        ON CONFLICT (join_code) DO NOTHING
                        RETURNING id, document_id, host_user_id, join_code, status,
                                  max_participants, created_at, started_at, ended_at
                        "#,
                    )
                    .bind(session_id)
                    .bind(document_id)
                    .bind(host_user_id)
                    .bind(&join_code)
                    .bind(max_participants)
                    .fetch_optional(&mut *tx)
                    .await
                    .context("failed to insert session")?;

                    let Some(session_row) = inserted else {
                        tx.rollback().await.ok();
                        continue;
                    };

                    let participant_row = sqlx::query_as::<_, ParticipantRow>(
                        r#"
                        INSERT INTO session_participants (session_id, user_id, display_name, role, color)
                        VALUES ($1, $2, $3, 'host', $4)
                        RETURNING session_id, user_id, display_name, role, color, joined_at, left_at
                        "#,
                    )
                    .bind(session_id)
                    .bind(host_user_id)
                    .bind(host_display_name)
                    .bind(host_color)
                    .fetch_one(&mut *tx)
                    .await
                    .context("failed to insert host participant")?;

                    tx.commit().await.context("failed to commit session creation")?;
                    return Ok((session_row.try_into()?, participant_row.try_into()?));
                }

                bail!("failed to generate a unique join code after {JOIN_CODE_MAX_ATTEMPTS} attempts")
            }
            Self::Memory(inner) => {
                let mut store = inner.write().await;

                let mut join_code = generate_join_code();
                let mut attempts = 0;
                while store.sessions.values().any(|session| session.join_code == join_code) {
                    attempts += 1;
                    if attempts >= JOIN_CODE_MAX_ATTEMPTS {
                        bail!("failed to generate a unique join code after {JOIN_CODE_MAX_ATTEMPTS} attempts");
                    }
                    join_code = generate_join_code();
                }

                let now = Utc::now();
                let session = Session {
                    id: Uuid::new_v4(),
                    document_id,
                    host_user_id,
                    join_code,
                    status: SessionStatus::Waiting,
                    max_participants,
                    created_at: now,
                    started_at: None,
                    ended_at: None,
                };
                let host = Participant {
                    session_id: session.id,
                    user_id: host_user_id,
                    display_name: host_display_name.to_string(),
                    role: ParticipantRole::Host,
                    color: host_color.to_string(),
                    joined_at: now,
                    left_at: None,
                };

                store.sessions.insert(session.id, session.clone());
                store.participants.insert((session.id, host_user_id), host.clone());
                Ok((session, host))
            }
        }
    }

    pub async fn session(&self, session_id: Uuid) -> Result<Option<Session>> {
        match self {
            Self::Postgres(pool) => {
                let row = sqlx::query_as::<_, SessionRow>(
                    r#"
                    SELECT id, document_id, host_user_id, join_code, status,
                           max_participants, created_at, started_at, ended_at
                    FROM sessions WHERE id = $1
                    "#,
                )
                .bind(session_id)
                .fetch_optional(pool)
                .await
                .context("failed to load session")?;
                row.map(Session::try_from).transpose()
            }
            Self::Memory(inner) => {
                let store = inner.read().await;
                Ok(store.sessions.get(&session_id).cloned())
            }
        }
    }

    pub async fn session_by_join_code(&self, join_code: &str) -> Result<Option<Session>> {
        match self {
            Self::Postgres(pool) => {
                let row = sqlx::query_as::<_, SessionRow>(
                    r#"
                    SELECT id, document_id, host_user_id, join_code, status,
                           max_participants, created_at, started_at, ended_at
                    FROM sessions WHERE join_code = $1
                    "#,
                )
                .bind(join_code)
                .fetch_optional(pool)
                .await
                .context("failed to load session by join code")?;
                row.map(Session::try_from).transpose()
            }
            Self::Memory(inner) => {
                let store = inner.read().await;
                Ok(store.sessions.values().find(|session| session.join_code == join_code).cloned())
            }
        }
    }

    /// Marks the session active and stamps `started_at`. Returns the
    /// updated row.
    pub async fn mark_started(&self, session_id: Uuid) -> Result<Session> {
        match self {
            Self::Postgres(pool) => {
                let row = sqlx::query_as::<_, SessionRow>(
                    r#"
                    UPDATE sessions SET status = 'active', started_at = now()
                    WHERE id = $1
                    RETURNING id, document_id, host_user_id, join_code, status,
                              max_participants, created_at, started_at, ended_at
                    "#,
                )
                .bind(session_id)
                .fetch_one(pool)
                .await
                .context("failed to mark session started")?;
                row.try_into()
            }
            Self::Memory(inner) => {
                let mut store = inner.write().await;
                let session = store
                    .sessions
                    .get_mut(&session_id)
                    .context("session vanished while starting")?;
                session.status = SessionStatus::Active;
                session.started_at = Some(Utc::now());
                Ok(session.clone())
            }
        }
    }

    /// Removes the session and everything hanging off it. Annotation
    /// and message rows go with it via cascade.
    pub async fn delete_session(&self, session_id: Uuid) -> Result<()> {
        match self {
            Self::Postgres(pool) => {
                sqlx::query("DELETE FROM sessions WHERE id = $1")
                    .bind(session_id)
                    .execute(pool)
                    .await
                    .context("failed to delete session")?;
                Ok(())
            }
            Self::Memory(inner) => {
                let mut store = inner.write().await;
                store.sessions.remove(&session_id);
                store.participants.retain(|(sid, _), _| *sid != session_id);
                store.annotations.retain(|_, annotation| annotation.session_id != session_id);
                store.messages.retain(|message| message.session_id != session_id);
                Ok(())
            }
        }
    }

    // ── Participants ────────────────────────────────────────────────

    pub async fn membership(
        &self,
        session_id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<Participant>> {
        match self {
            Self::Postgres(pool) => {
                let row = sqlx::query_as::<_, ParticipantRow>(
                    r#"
                    SELECT session_id, user_id, display_name, role, color, joined_at, left_at
                    FROM session_participants WHERE session_id = $1 AND user_id = $2
                    "#,
                )
                .bind(session_id)
                .bind(user_id)
                .fetch_optional(pool)
                .await
                .context("failed to load membership")?;
                row.map(Participant::try_from).transpose()
            }
            Self::Memory(inner) => {
                let store = inner.read().await;
                Ok(store.participants.get(&(session_id, user_id)).cloned())
            }
        }
    }

    /// Participants with a live membership (not left), ordered by join
    /// time.
    pub async fn active_participants(&self, session_id: Uuid) -> Result<Vec<Participant>> {
        match self {
            Self::Postgres(pool) => {
                let rows = sqlx::query_as::<_, ParticipantRow>(
                    r#"
                    SELECT session_id, user_id, display_name, role, color, joined_at, left_at
                    FROM session_participants
                    WHERE session_id = $1 AND left_at IS NULL
                    ORDER BY joined_at
                    "#,
                )
                .bind(session_id)
                .fetch_all(pool)
                .await
                .context("failed to list active participants")?;
                rows.into_iter().map(Participant::try_from).collect()
            }
            Self::Memory(inner) => {
                let store = inner.read().await;
                let mut participants: Vec<Participant> = store
                    .participants
                    .values()
                    .filter(|participant| {
                        participant.session_id == session_id && participant.left_at.is_none()
                    })
                    .cloned()
                    .collect();
                participants.sort_by_key(|participant| participant.joined_at);
                Ok(participants)
            }
        }
    }

    /// Count used for the capacity check. Only rows with `left_at`
    /// unset count against `max_participants`.
    pub async fn active_member_count(&self, session_id: Uuid) -> Result<i64> {
        match self {
            Self::Postgres(pool) => sqlx::query_scalar::<_, i64>(
                "SELECT COUNT(*) FROM session_participants WHERE session_id = $1 AND left_at IS NULL",
            )
            .bind(session_id)
            .fetch_one(pool)
            .await
            .context("failed to count active participants"),
            Self::Memory(inner) => {
                let store = inner.read().await;
                Ok(store
                    .participants
                    .values()
                    .filter(|participant| {
                        participant.session_id == session_id && participant.left_at.is_none()
                    })
                    .count() as i64)
            }
        }
    }

    pub async fn colors_in_use(&self, session_id: Uuid) -> Result<Vec<String>> {
        Ok(self
            .active_participants(session_id)
            .await?
            .into_iter()
            .map(|participant| participant.color)
            .collect())
    }

    /// Inserts a member row only while the active count is below the
    /// session's cap; returns `None` when the session is full. The
    /// count and the insert are one atomic step on both backends, so
    /// two concurrent joins cannot both squeeze into the last slot.
    pub async fn add_participant(
        &self,
        session_id: Uuid,
        user_id: Uuid,
        display_name: &str,
        color: &str,
        max_participants: i32,
    ) -> Result<Option<Participant>> {
        match self {
            Self::Postgres(pool) => {
                let mut tx = pool.begin().await.context("failed to begin join transaction")?;

                // Row lock on the session serializes concurrent joins.
                sqlx::query("SELECT id FROM sessions WHERE id = $1 FOR UPDATE")
                    .bind(session_id)
                    .execute(&mut *tx)
                    .await
                    .context("failed to lock session for join")?;

                let active: i64 = sqlx::query_scalar(
                    "SELECT COUNT(*) FROM session_participants WHERE session_id = $1 AND left_at IS NULL",
                )
                .bind(session_id)
                .fetch_one(&mut *tx)
                .await
                .context("failed to count active participants")?;

                if active >= i64::from(max_participants) {
                    tx.rollback().await.context("failed to roll back full join")?;
                    return Ok(None);
                }

                let row = sqlx::query_as::<_, ParticipantRow>(
                    r#"
                    INSERT INTO session_participants (session_id, user_id, display_name, role, color)
                    VALUES ($1, $2, $3, 'member', $4)
                    RETURNING session_id, user_id, display_name, role, color, joined_at, left_at
                    "#,
                )
                .bind(session_id)
                .bind(user_id)
                .bind(display_name)
                .bind(color)
                .fetch_one(&mut *tx)
                .await
                .context("failed to insert participant")?;
                tx.commit().await.context("failed to commit join")?;
                Ok(Some(row.try_into()?))
            }
            Self::Memory(inner) => {
                let mut store = inner.write().await;
                let active = store
                    .participants
                    .values()
                    .filter(|participant| {
                        participant.session_id == session_id && participant.left_at.is_none()
                    })
                    .count() as i64;
                if active >= i64::from(max_participants) {
                    return Ok(None);
                }

                let participant = Participant {
                    session_id,
                    user_id,
                    display_name: display_name.to_string(),
                    role: ParticipantRole::Member,
                    color: color.to_string(),
                    joined_at: Utc::now(),
                    left_at: None,
                };
                store.participants.insert((session_id, user_id), participant.clone());
                Ok(Some(participant))
            }
        }
    }

    /// Rejoin path: clears `left_at` on the existing membership row
    /// instead of inserting a duplicate, keeping the original role and
    /// color. The display name is refreshed from the current token.
    pub async fn reactivate_participant(
        &self,
        session_id: Uuid,
        user_id: Uuid,
        display_name: &str,
    ) -> Result<Participant> {
        match self {
            Self::Postgres(pool) => {
                let row = sqlx::query_as::<_, ParticipantRow>(
                    r#"
                    UPDATE session_participants
                    SET left_at = NULL, display_name = $3
                    WHERE session_id = $1 AND user_id = $2
                    RETURNING session_id, user_id, display_name, role, color, joined_at, left_at
                    "#,
                )
                .bind(session_id)
                .bind(user_id)
                .bind(display_name)
                .fetch_one(pool)
                .await
                .context("failed to reactivate participant")?;
                row.try_into()
            }
            Self::Memory(inner) => {
                let mut store = inner.write().await;
                let participant = store
                    .participants
                    .get_mut(&(session_id, user_id))
                    .context("membership vanished during rejoin")?;
                participant.left_at = None;
                participant.display_name = display_name.to_string();
                Ok(participant.clone())
            }
        }
    }

    pub async fn mark_left(&self, session_id: Uuid, user_id: Uuid) -> Result<()> {
        match self {
            Self::Postgres(pool) => {
                sqlx::query(
                    r#"
                    UPDATE session_participants SET left_at = now()
                    WHERE session_id = $1 AND user_id = $2 AND left_at IS NULL
                    "#,
                )
                .bind(session_id)
                .bind(user_id)
                .execute(pool)
                .await
                .context("failed to mark participant left")?;
                Ok(())
            }
            Self::Memory(inner) => {
                let mut store = inner.write().await;
                if let Some(participant) = store.participants.get_mut(&(session_id, user_id)) {
                    if participant.left_at.is_none() {
                        participant.left_at = Some(Utc::now());
                    }
                }
                Ok(())
            }
        }
    }

    // ── Annotations ─────────────────────────────────────────────────

    pub async fn annotations(&self, session_id: Uuid) -> Result<Vec<Annotation>> {
        match self {
            Self::Postgres(pool) => {
                let rows = sqlx::query_as::<_, AnnotationRow>(
                    r#"
                    SELECT id, session_id, author_id, page_number, kind, color,
                           payload, resolved, created_at, updated_at
                    FROM annotations WHERE session_id = $1
                    ORDER BY created_at
                    "#,
                )
                .bind(session_id)
                .fetch_all(pool)
                .await
                .context("failed to list annotations")?;
                rows.into_iter().map(Annotation::try_from).collect()
            }
            Self::Memory(inner) => {
                let store = inner.read().await;
                let mut annotations: Vec<Annotation> = store
                    .annotations
                    .values()
                    .filter(|annotation| annotation.session_id == session_id)
                    .cloned()
                    .collect();
                annotations.sort_by_key(|annotation| (annotation.created_at, annotation.id));
                Ok(annotations)
            }
        }
    }

    pub async fn create_annotation(
        &self,
        session_id: Uuid,
        author_id: Uuid,
        page_number: i32,
        kind: AnnotationKind,
        color: &str,
        payload: serde_json::Value,
    ) -> Result<Annotation> {
        match self {
            Self::Postgres(pool) => {
                let row = sqlx::query_as::<_, AnnotationRow>(
                    r#"
                    INSERT INTO annotations (id, session_id, author_id, page_number, kind, color, payload)
                    VALUES ($1, $2, $3, $4, $5, $6, $7)
                    RETURNING id, session_id, author_id, page_number, kind, color,
                              payload, resolved, created_at, updated_at
                    "#,
                )
                .bind(Uuid::new_v4())
                .bind(session_id)
                .bind(author_id)
                .bind(page_number)
                .bind(kind.as_str())
                .bind(color)
                .bind(&payload)
                .fetch_one(pool)
                .await
                .context("failed to insert annotation")?;
                row.try_into()
            }
            Self::Memory(inner) => {
                let mut store = inner.write().await;
                let now = Utc::now();
                let annotation = Annotation {
                    id: Uuid::new_v4(),
                    session_id,
                    author_id,
                    page_number,
                    kind,
                    color: color.to_string(),
                    payload,
                    resolved: false,
                    created_at: now,
                    updated_at: now,
                };
                store.annotations.insert(annotation.id, annotation.clone());
                Ok(annotation)
            }
        }
    }

    /// Partial update. `None` fields are left untouched. Returns the
    /// updated annotation, or `None` when it does not exist in this
    /// session.
    pub async fn update_annotation(
        &self,
        session_id: Uuid,
        annotation_id: Uuid,
        payload: Option<serde_json::Value>,
        resolved: Option<bool>,
    ) -> Result<Option<Annotation>> {
        match self {
            Self::Postgres(pool) => {
                let row = sqlx::query_as::<_, AnnotationRow>(
                    r#"
                    UPDATE annotations
                    SET payload = COALESCE($3, payload),
                        resolved = COALESCE($4, resolved),
                        updated_at = now()
                    WHERE id = $2 AND session_id = $1
                    RETURNING id, session_id, author_id, page_number, kind, color,
                              payload, resolved, created_at, updated_at
                    "#,
                )
                .bind(session_id)
                .bind(annotation_id)
                .bind(payload)
                .bind(resolved)
                .fetch_optional(pool)
                .await
                .context("failed to update annotation")?;
                row.map(Annotation::try_from).transpose()
            }
            Self::Memory(inner) => {
                let mut store = inner.write().await;
                let Some(annotation) = store.annotations.get_mut(&annotation_id) else {
                    return Ok(None);
                };
                if annotation.session_id != session_id {
                    return Ok(None);
                }
                if let Some(payload) = payload {
                    annotation.payload = payload;
                }
                if let Some(resolved) = resolved {
                    annotation.resolved = resolved;
                }
                annotation.updated_at = Utc::now();
                Ok(Some(annotation.clone()))
            }
        }
    }

    /// Returns whether a row was deleted.
    pub async fn delete_annotation(&self, session_id: Uuid, annotation_id: Uuid) -> Result<bool> {
        match self {
            Self::Postgres(pool) => {
                let result =
                    sqlx::query("DELETE FROM annotations WHERE id = $2 AND session_id = $1")
                        .bind(session_id)
                        .bind(annotation_id)
                        .execute(pool)
                        .await
                        .context("failed to delete annotation")?;
                Ok(result.rows_affected() > 0)
            }
            Self::Memory(inner) => {
                let mut store = inner.write().await;
                match store.annotations.get(&annotation_id) {
                    Some(annotation) if annotation.session_id == session_id => {
                        store.annotations.remove(&annotation_id);
                        store
                            .messages
                            .iter_mut()
                            .filter(|message| message.annotation_id == Some(annotation_id))
                            .for_each(|message| message.annotation_id = None);
                        Ok(true)
                    }
                    _ => Ok(false),
                }
            }
        }
    }

    pub async fn annotation_exists(&self, session_id: Uuid, annotation_id: Uuid) -> Result<bool> {
        match self {
            Self::Postgres(pool) => sqlx::query_scalar::<_, bool>(
                "SELECT EXISTS(SELECT 1 FROM annotations WHERE id = $2 AND session_id = $1)",
            )
            .bind(session_id)
            .bind(annotation_id)
            .fetch_one(pool)
            .await
            .context("failed to check annotation existence"),
            Self::Memory(inner) => {
                let store = inner.read().await;
                Ok(store
                    .annotations
                    .get(&annotation_id)
                    .is_some_and(|annotation| annotation.session_id == session_id))
            }
        }
    }

    // ── Messages ────────────────────────────────────────────────────

    pub async fn messages(&self, session_id: Uuid) -> Result<Vec<Message>> {
        match self {
            Self::Postgres(pool) => {
                let rows = sqlx::query_as::<_, MessageRow>(
                    r#"
                    SELECT id, session_id, author_id, content, annotation_id, created_at
                    FROM session_messages WHERE session_id = $1
                    ORDER BY created_at
                    "#,
                )
                .bind(session_id)
                .fetch_all(pool)
                .await
                .context("failed to list messages")?;
                Ok(rows.into_iter().map(Message::from).collect())
            }
            Self::Memory(inner) => {
                let store = inner.read().await;
                Ok(store
                    .messages
                    .iter()
                    .filter(|message| message.session_id == session_id)
                    .cloned()
                    .collect())
            }
        }
    }

    pub async fn create_message(
        &self,
        session_id: Uuid,
        author_id: Uuid,
        content: &str,
        annotation_id: Option<Uuid>,
    ) -> Result<Message> {
        match self {
            Self::Postgres(pool) => {
                let row = sqlx::query_as::<_, MessageRow>(
                    r#"
                    INSERT INTO session_messages (id, session_id, author_id, content, annotation_id)
                    VALUES ($1, $2, $3, $4, $5)
                    RETURNING id, session_id, author_id, content, annotation_id, created_at
                    "#,
                )
                .bind(Uuid::new_v4())
                .bind(session_id)
                .bind(author_id)
                .bind(content)
                .bind(annotation_id)
                .fetch_one(pool)
                .await
                .context("failed to insert message")?;
                Ok(row.into())
            }
            Self::Memory(inner) => {
                let mut store = inner.write().await;
                let message = Message {
                    id: Uuid::new_v4(),
                    session_id,
                    author_id,
                    content: content.to_string(),
                    annotation_id,
                    created_at: Utc::now(),
                };
                store.messages.push(message.clone());
                Ok(message)
            }
        }
    }
}

// ── Row conversions ─────────────────────────────────────────────────

#[derive(sqlx::FromRow)]
struct SessionRow {
    id: Uuid,
    document_id: Uuid,
    host_user_id: Uuid,
    join_code: String,
    status: String,
    max_participants: i32,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
}

impl TryFrom<SessionRow> for Session {
    type Error = anyhow::Error;

    fn try_from(row: SessionRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            document_id: row.document_id,
            host_user_id: row.host_user_id,
            join_code: row.join_code,
            status: row.status.parse()?,
            max_participants: row.max_participants,
            created_at: row.created_at,
            started_at: row.started_at,
            ended_at: row.ended_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ParticipantRow {
    session_id: Uuid,
    user_id: Uuid,
    display_name: String,
    role: String,
    color: String,
    joined_at: DateTime<Utc>,
    left_at: Option<DateTime<Utc>>,
}

impl TryFrom<ParticipantRow> for Participant {
    type Error = anyhow::Error;

    fn try_from(row: ParticipantRow) -> Result<Self> {
        Ok(Self {
            session_id: row.session_id,
            user_id: row.user_id,
            display_name: row.display_name,
            role: row.role.parse()?,
            color: row.color,
            joined_at: row.joined_at,
            left_at: row.left_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct AnnotationRow {
    id: Uuid,
    session_id: Uuid,
    author_id: Uuid,
    page_number: i32,
    kind: String,
    color: String,
    payload: serde_json::Value,
    resolved: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<AnnotationRow> for Annotation {
    type Error = anyhow::Error;

    fn try_from(row: AnnotationRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            session_id: row.session_id,
            author_id: row.author_id,
            page_number: row.page_number,
            kind: row.kind.parse()?,
            color: row.color,
            payload: row.payload,
            resolved: row.resolved,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct MessageRow {
    id: Uuid,
    session_id: Uuid,
    author_id: Uuid,
    content: String,
    annotation_id: Option<Uuid>,
    created_at: DateTime<Utc>,
}

impl From<MessageRow> for Message {
    fn from(row: MessageRow) -> Self {
        Self {
            id: row.id,
            session_id: row.session_id,
            author_id: row.author_id,
            content: row.content,
            annotation_id: row.annotation_id,
            created_at: row.created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{generate_join_code, SessionStore};
    use coview_common::types::{AnnotationKind, ParticipantRole, SessionStatus};
    use serde_json::json;
    use uuid::Uuid;

    async fn seeded_session(store: &SessionStore) -> (Uuid, Uuid) {
        let host = Uuid::new_v4();
        let (session, _) = store
            .create_session(Uuid::new_v4(), host, "Host", "#e06c75", 4)
            .await
            .expect("session should be created");
        (session.id, host)
    }

    #[test]
    fn join_codes_use_the_unambiguous_alphabet() {
        for _ in 0..50 {
            let code = generate_join_code();
            assert_eq!(code.len(), 8);
            assert!(code.chars().all(|c| super::JOIN_CODE_ALPHABET.contains(&(c as u8))));
        }
    }

    #[tokio::test]
    async fn create_session_seeds_host_membership() {
        let store = SessionStore::in_memory();
        let host = Uuid::new_v4();
        let (session, participant) = store
            .create_session(Uuid::new_v4(), host, "Host", "#e06c75", 8)
            .await
            .expect("session should be created");

        assert_eq!(session.status, SessionStatus::Waiting);
        assert_eq!(session.host_user_id, host);
        assert_eq!(participant.role, ParticipantRole::Host);
        assert_eq!(store.active_member_count(session.id).await.expect("count"), 1);

        let found = store
            .session_by_join_code(&session.join_code)
            .await
            .expect("lookup should succeed")
            .expect("session should be found by join code");
        assert_eq!(found.id, session.id);
    }

    #[tokio::test]
    async fn rejoin_reactivates_instead_of_duplicating() {
        let store = SessionStore::in_memory();
        let (session_id, _) = seeded_session(&store).await;
        let user = Uuid::new_v4();

        store
            .add_participant(session_id, user, "Alice", "#61afef", 4)
            .await
            .expect("participant should be added")
            .expect("session should have room");
        store.mark_left(session_id, user).await.expect("mark_left should succeed");
        assert_eq!(store.active_member_count(session_id).await.expect("count"), 1);

        let rejoined = store
            .reactivate_participant(session_id, user, "Alice R.")
            .await
            .expect("reactivation should succeed");
        assert!(rejoined.left_at.is_none());
        assert_eq!(rejoined.display_name, "Alice R.");
        assert_eq!(rejoined.color, "#61afef");
        assert_eq!(store.active_member_count(session_id).await.expect("count"), 2);
        assert_eq!(store.active_participants(session_id).await.expect("list").len(), 2);
    }

    #[tokio::test]
    async fn add_participant_refuses_a_full_session() {
        let store = SessionStore::in_memory();
        let (session_id, _) = seeded_session(&store).await;

        // Host occupies one of two slots.
        let second = store
            .add_participant(session_id, Uuid::new_v4(), "Second", "#61afef", 2)
            .await
            .expect("insert should succeed");
        assert!(second.is_some());

        let third = store
            .add_participant(session_id, Uuid::new_v4(), "Third", "#98c379", 2)
            .await
            .expect("insert should succeed");
        assert!(third.is_none());
        assert_eq!(store.active_member_count(session_id).await.expect("count"), 2);
    }

    #[tokio::test]
    async fn interleaved_joins_cannot_exceed_capacity() {
        let store = SessionStore::in_memory();
        let (session_id, _) = seeded_session(&store).await;

        let (a, b, c) = tokio::join!(
            store.add_participant(session_id, Uuid::new_v4(), "A", "#61afef", 2),
            store.add_participant(session_id, Uuid::new_v4(), "B", "#98c379", 2),
            store.add_participant(session_id, Uuid::new_v4(), "C", "#e5c07b", 2),
        );

        let admitted = [a, b, c]
            .into_iter()
            .filter(|joined| joined.as_ref().expect("insert should succeed").is_some())
            .count();
        assert_eq!(admitted, 1);
        assert_eq!(store.active_member_count(session_id).await.expect("count"), 2);
    }

    #[tokio::test]
    async fn mark_started_transitions_session() {
        let store = SessionStore::in_memory();
        let (session_id, _) = seeded_session(&store).await;

        let started = store.mark_started(session_id).await.expect("start should succeed");
        assert_eq!(started.status, SessionStatus::Active);
        assert!(started.started_at.is_some());
    }

    #[tokio::test]
    async fn delete_session_cascades() {
        let store = SessionStore::in_memory();
        let (session_id, host) = seeded_session(&store).await;

        store
            .create_annotation(session_id, host, 1, AnnotationKind::Highlight, "#e06c75", json!({"range": [0, 4]}))
            .await
            .expect("annotation should be created");
        store
            .create_message(session_id, host, "hello", None)
            .await
            .expect("message should be created");

        store.delete_session(session_id).await.expect("delete should succeed");

        assert!(store.session(session_id).await.expect("lookup").is_none());
        assert!(store.annotations(session_id).await.expect("list").is_empty());
        assert!(store.messages(session_id).await.expect("list").is_empty());
        assert_eq!(store.active_member_count(session_id).await.expect("count"), 0);
    }

    #[tokio::test]
    async fn annotation_update_is_partial() {
        let store = SessionStore::in_memory();
        let (session_id, host) = seeded_session(&store).await;

        let annotation = store
            .create_annotation(session_id, host, 3, AnnotationKind::Pen, "#e06c75", json!({"points": [[1, 2]]}))
            .await
            .expect("annotation should be created");
        assert!(!annotation.resolved);

        let resolved = store
            .update_annotation(session_id, annotation.id, None, Some(true))
            .await
            .expect("update should succeed")
            .expect("annotation should exist");
        assert!(resolved.resolved);
        assert_eq!(resolved.payload, json!({"points": [[1, 2]]}));

        let repainted = store
            .update_annotation(session_id, annotation.id, Some(json!({"points": []})), None)
            .await
            .expect("update should succeed")
            .expect("annotation should exist");
        assert!(repainted.resolved);
        assert_eq!(repainted.payload, json!({"points": []}));

        let missing = store
            .update_annotation(session_id, Uuid::new_v4(), None, Some(false))
            .await
            .expect("update should succeed");
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn annotation_delete_detaches_anchored_messages() {
        let store = SessionStore::in_memory();
        let (session_id, host) = seeded_session(&store).await;

        let annotation = store
            .create_annotation(session_id, host, 1, AnnotationKind::Comment, "#e06c75", json!({"text": "check this"}))
            .await
            .expect("annotation should be created");
        store
            .create_message(session_id, host, "re: the note", Some(annotation.id))
            .await
            .expect("message should be created");

        assert!(store
            .delete_annotation(session_id, annotation.id)
            .await
            .expect("delete should succeed"));
        assert!(!store
            .delete_annotation(session_id, annotation.id)
            .await
            .expect("second delete should succeed"));

        let messages = store.messages(session_id).await.expect("list");
        assert_eq!(messages.len(), 1);
        assert!(messages[0].annotation_id.is_none());
    }

    #[tokio::test]
    async fn annotations_are_scoped_to_their_session() {
        let store = SessionStore::in_memory();
        let (session_a, host_a) = seeded_session(&store).await;
        let (session_b, _) = seeded_session(&store).await;

        let annotation = store
            .create_annotation(session_a, host_a, 1, AnnotationKind::Highlight, "#e06c75", json!({}))
            .await
            .expect("annotation should be created");

        assert!(store
            .update_annotation(session_b, annotation.id, None, Some(true))
            .await
            .expect("update should succeed")
            .is_none());
        assert!(!store
            .delete_annotation(session_b, annotation.id)
            .await
            .expect("delete should succeed"));
    }

    #[tokio::test]
    async fn messages_preserve_insertion_order() {
        let store = SessionStore::in_memory();
        let (session_id, host) = seeded_session(&store).await;

        for content in ["first", "second", "third"] {
            store
                .create_message(session_id, host, content, None)
                .await
                .expect("message should be created");
        }

        let messages = store.messages(session_id).await.expect("list");
        let contents: Vec<&str> =
            messages.iter().map(|message| message.content.as_str()).collect();
        assert_eq!(contents, ["first", "second", "third"]);
    }
}
