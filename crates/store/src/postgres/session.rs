//! Session and message operations.
//!
//! Message seq assignment happens inside the inserting transaction under a
//! `FOR UPDATE` lock on the parent session row, so concurrent appends can
//! never produce gaps or duplicates.

use sqlx::types::Json;
use uuid::Uuid;

use mill_domain::message::{ContentBlock, Message, Role};
use mill_domain::session::{NewSession, Session};
use mill_domain::Result;

use super::rows::{role_str, MessageRow, SessionRow};
use super::{db_err, not_found, retrying, PgStore};
use crate::traits::{CompactionApply, SessionOps};

#[async_trait::async_trait]
impl SessionOps for PgStore {
    async fn create_session(&self, new: NewSession) -> Result<Session> {
        retrying!("create_session", self.create_session_once(&new).await)
    }

    async fn get_session(&self, id: Uuid) -> Result<Session> {
        retrying!("get_session", self.get_session_once(id).await)
    }

    async fn list_messages(
        &self,
        session_id: Uuid,
        include_archived: bool,
    ) -> Result<Vec<Message>> {
        retrying!(
            "list_messages",
            self.list_messages_once(session_id, include_archived).await
        )
    }

    async fn append_message(
        &self,
        session_id: Uuid,
        role: Role,
        content: Vec<ContentBlock>,
        token_count: i64,
    ) -> Result<Message> {
        retrying!(
            "append_message",
            self.append_message_once(session_id, role, &content, token_count)
                .await
        )
    }

    async fn apply_compaction(&self, session_id: Uuid, plan: CompactionApply) -> Result<Message> {
        retrying!(
            "apply_compaction",
            self.apply_compaction_once(session_id, &plan).await
        )
    }
}

impl PgStore {
    async fn create_session_once(&self, new: &NewSession) -> Result<Session> {
        let row: SessionRow = sqlx::query_as(
            r#"
            INSERT INTO sessions (id, tenant_id, identifier, parent_session_id, metadata)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&new.tenant_id)
        .bind(&new.identifier)
        .bind(new.parent_session_id)
        .bind(Json(&new.metadata))
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(row.into())
    }

    async fn get_session_once(&self, id: Uuid) -> Result<Session> {
        let row: Option<SessionRow> = sqlx::query_as("SELECT * FROM sessions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.map(Into::into).ok_or_else(|| not_found("session", id))
    }

    async fn list_messages_once(
        &self,
        session_id: Uuid,
        include_archived: bool,
    ) -> Result<Vec<Message>> {
        // Existence check so a bad id is NotFound rather than an empty list.
        let exists: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM sessions WHERE id = $1")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        if exists.is_none() {
            return Err(not_found("session", session_id));
        }

        let rows: Vec<MessageRow> = sqlx::query_as(
            r#"
            SELECT * FROM messages
            WHERE session_id = $1 AND ($2 OR NOT superseded)
            ORDER BY seq, created_at
            "#,
        )
        .bind(session_id)
        .bind(include_archived)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn append_message_once(
        &self,
        session_id: Uuid,
        role: Role,
        content: &[ContentBlock],
        token_count: i64,
    ) -> Result<Message> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let locked: Option<(Uuid,)> =
            sqlx::query_as("SELECT id FROM sessions WHERE id = $1 FOR UPDATE")
                .bind(session_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(db_err)?;
        if locked.is_none() {
            return Err(not_found("session", session_id));
        }

        let row: MessageRow = sqlx::query_as(
            r#"
            INSERT INTO messages (id, session_id, seq, role, content, token_count)
            SELECT $1, $2, COALESCE(MAX(seq), 0) + 1, $3, $4, $5
            FROM messages WHERE session_id = $2
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(session_id)
        .bind(role_str(role))
        .bind(Json(content))
        .bind(token_count)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        row.try_into()
    }

    async fn apply_compaction_once(
        &self,
        session_id: Uuid,
        plan: &CompactionApply,
    ) -> Result<Message> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        // Per-session advisory lock, released with the transaction;
        // serializes compactions of the same session across instances.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1::text, 0))")
            .bind(session_id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        let locked: Option<(Uuid,)> =
            sqlx::query_as("SELECT id FROM sessions WHERE id = $1 FOR UPDATE")
                .bind(session_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(db_err)?;
        if locked.is_none() {
            return Err(not_found("session", session_id));
        }

        sqlx::query(
            r#"
            UPDATE messages SET superseded = TRUE
            WHERE session_id = $1 AND NOT superseded AND seq <= $2
            "#,
        )
        .bind(session_id)
        .bind(plan.archive_up_to_seq)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        let summary: MessageRow = sqlx::query_as(
            r#"
            INSERT INTO messages (id, session_id, seq, role, content, token_count, is_summary)
            VALUES ($1, $2, $3, 'system-summary', $4, $5, TRUE)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(session_id)
        .bind(plan.summary_seq)
        .bind(Json(&plan.summary_content))
        .bind(plan.summary_tokens)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;

        sqlx::query("UPDATE sessions SET compaction_count = compaction_count + 1 WHERE id = $1")
            .bind(session_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        summary.try_into()
    }
}
