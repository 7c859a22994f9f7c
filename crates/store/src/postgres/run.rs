//! Run queue operations: claims, heartbeats, the iteration commit, and the
//! rescue transitions.

use sqlx::types::Json;
use uuid::Uuid;

use chrono::{DateTime, Utc};
use mill_domain::message::{estimate_tokens, ContentBlock};
use mill_domain::run::{Iteration, NewRun, Run, RunError};
use mill_domain::{Error, Result};

use super::rows::{stop_reason_str, tool_kind_str, IterationRow, RunRow};
use super::{db_err, not_found, notify_tx, retrying, PgStore};
use crate::notify::NotifyKind;
use crate::traits::{IterationRecord, RunFilter, RunOps};

#[async_trait::async_trait]
impl RunOps for PgStore {
    async fn create_run(&self, new: NewRun) -> Result<Run> {
        retrying!("create_run", self.create_run_once(&new).await)
    }

    async fn get_run(&self, id: Uuid) -> Result<Run> {
        retrying!("get_run", self.get_run_once(id).await)
    }

    async fn list_runs(&self, filter: RunFilter) -> Result<Vec<Run>> {
        retrying!("list_runs", self.list_runs_once(&filter).await)
    }

    async fn list_child_runs(&self, parent_run_id: Uuid) -> Result<Vec<Run>> {
        retrying!(
            "list_child_runs",
            self.list_child_runs_once(parent_run_id).await
        )
    }

    async fn claim_run(&self, instance_id: Uuid) -> Result<Option<Run>> {
        retrying!("claim_run", self.claim_run_once(instance_id).await)
    }

    async fn heartbeat_run(&self, run_id: Uuid, instance_id: Uuid) -> Result<()> {
        retrying!(
            "heartbeat_run",
            self.heartbeat_run_once(run_id, instance_id).await
        )
    }

    async fn record_iteration(
        &self,
        run_id: Uuid,
        instance_id: Uuid,
        rec: IterationRecord,
    ) -> Result<Iteration> {
        retrying!(
            "record_iteration",
            self.record_iteration_once(run_id, instance_id, &rec).await
        )
    }

    async fn resume_run(&self, run_id: Uuid, instance_id: Uuid) -> Result<()> {
        retrying!(
            "resume_run",
            self.resume_run_once(run_id, instance_id).await
        )
    }

    async fn fail_run(
        &self,
        run_id: Uuid,
        instance_id: Option<Uuid>,
        error: RunError,
    ) -> Result<()> {
        retrying!(
            "fail_run",
            self.fail_run_once(run_id, instance_id, &error).await
        )
    }

    async fn cancel_run(&self, run_id: Uuid) -> Result<()> {
        retrying!("cancel_run", self.cancel_run_once(run_id).await)
    }

    async fn requeue_run(&self, run_id: Uuid) -> Result<()> {
        retrying!("requeue_run", self.requeue_run_once(run_id).await)
    }

    async fn find_stuck_runs(&self, before: DateTime<Utc>) -> Result<Vec<Run>> {
        retrying!("find_stuck_runs", self.find_stuck_runs_once(before).await)
    }

    async fn list_iterations(&self, run_id: Uuid) -> Result<Vec<Iteration>> {
        retrying!("list_iterations", self.list_iterations_once(run_id).await)
    }
}

impl PgStore {
    async fn create_run_once(&self, new: &NewRun) -> Result<Run> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        // Serialize creates per session so the one-non-terminal-run rule
        // holds under concurrency.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1::text, 0))")
            .bind(new.session_id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        let session: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM sessions WHERE id = $1")
            .bind(new.session_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?;
        if session.is_none() {
            return Err(not_found("session", new.session_id));
        }
        let agent: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM agents WHERE id = $1")
            .bind(new.agent_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?;
        if agent.is_none() {
            return Err(not_found("agent", new.agent_id));
        }

        let busy: Option<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT id FROM runs
            WHERE session_id = $1 AND status IN ('queued', 'running', 'waiting_for_tools')
            LIMIT 1
            "#,
        )
        .bind(new.session_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;
        if busy.is_some() {
            return Err(Error::Conflict(format!(
                "session {} already has a non-terminal run",
                new.session_id
            )));
        }

        let row: RunRow = sqlx::query_as(
            r#"
            INSERT INTO runs (id, session_id, agent_id, parent_run_id, input_prompt, variables)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(new.session_id)
        .bind(new.agent_id)
        .bind(new.parent_run_id)
        .bind(&new.input_prompt)
        .bind(Json(&new.variables))
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;

        notify_tx(&mut tx, NotifyKind::RunReady, row.id, "queued").await?;
        tx.commit().await.map_err(db_err)?;
        row.try_into()
    }

    async fn get_run_once(&self, id: Uuid) -> Result<Run> {
        let row: Option<RunRow> = sqlx::query_as("SELECT * FROM runs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.ok_or_else(|| not_found("run", id))?.try_into()
    }

    async fn list_runs_once(&self, filter: &RunFilter) -> Result<Vec<Run>> {
        let limit = if filter.limit > 0 {
            filter.limit
        } else {
            i64::MAX
        };
        let rows: Vec<RunRow> = sqlx::query_as(
            r#"
            SELECT * FROM runs
            WHERE ($1::uuid IS NULL OR session_id = $1)
              AND ($2::text IS NULL OR status = $2)
            ORDER BY created_at
            LIMIT $3
            "#,
        )
        .bind(filter.session_id)
        .bind(filter.status.map(|s| s.as_str()))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn list_child_runs_once(&self, parent_run_id: Uuid) -> Result<Vec<Run>> {
        let rows: Vec<RunRow> =
            sqlx::query_as("SELECT * FROM runs WHERE parent_run_id = $1 ORDER BY created_at")
                .bind(parent_run_id)
                .fetch_all(&self.pool)
                .await
                .map_err(db_err)?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn claim_run_once(&self, instance_id: Uuid) -> Result<Option<Run>> {
        let row: Option<RunRow> = sqlx::query_as(
            r#"
            UPDATE runs SET
                status = 'running',
                claimed_by = $1,
                claimed_at = now(),
                last_heartbeat_at = now(),
                updated_at = now()
            WHERE id = (
                SELECT id FROM runs
                WHERE status = 'queued' AND claimed_by IS NULL
                ORDER BY created_at
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#,
        )
        .bind(instance_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.map(TryInto::try_into).transpose()
    }

    async fn heartbeat_run_once(&self, run_id: Uuid, instance_id: Uuid) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE runs SET last_heartbeat_at = now()
            WHERE id = $1 AND claimed_by = $2
              AND status IN ('running', 'waiting_for_tools')
            "#,
        )
        .bind(run_id)
        .bind(instance_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(Error::LostClaim);
        }
        Ok(())
    }

    async fn record_iteration_once(
        &self,
        run_id: Uuid,
        instance_id: Uuid,
        rec: &IterationRecord,
    ) -> Result<Iteration> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        // Ownership predicate, and a lock on the run row for iteration seq.
        let run: Option<RunRow> = sqlx::query_as(
            r#"
            SELECT * FROM runs
            WHERE id = $1 AND claimed_by = $2 AND status = 'running'
            FOR UPDATE
            "#,
        )
        .bind(run_id)
        .bind(instance_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;
        let Some(run) = run else {
            return Err(Error::LostClaim);
        };
        let session_id = run.session_id;

        // Assistant message under the session row lock.
        sqlx::query("SELECT id FROM sessions WHERE id = $1 FOR UPDATE")
            .bind(session_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        let token_count = if rec.usage.output_tokens > 0 {
            rec.usage.output_tokens
        } else {
            estimate_tokens(&rec.assistant_content)
        };
        sqlx::query(
            r#"
            INSERT INTO messages (id, session_id, seq, role, content, token_count)
            SELECT $1, $2, COALESCE(MAX(seq), 0) + 1, 'assistant', $3, $4
            FROM messages WHERE session_id = $2
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(session_id)
        .bind(Json(&rec.assistant_content))
        .bind(token_count)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        // Iteration row.
        let iteration: IterationRow = sqlx::query_as(
            r#"
            INSERT INTO iterations
                (id, run_id, seq, input_token_count, output_token_count, stop_reason,
                 started_at, finished_at)
            SELECT $1, $2, COALESCE(MAX(seq), 0) + 1, $3, $4, $5, $6, $7
            FROM iterations WHERE run_id = $2
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(run_id)
        .bind(rec.usage.input_tokens)
        .bind(rec.usage.output_tokens)
        .bind(stop_reason_str(rec.stop_reason))
        .bind(rec.started_at)
        .bind(rec.finished_at)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;

        if rec.tool_calls.is_empty() {
            let text = rec
                .assistant_content
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n");
            sqlx::query(
                r#"
                UPDATE runs SET
                    status = 'completed', result = $2, claimed_by = NULL, updated_at = now()
                WHERE id = $1
                "#,
            )
            .bind(run_id)
            .bind(text)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
            notify_tx(&mut tx, NotifyKind::RunCompleted, run_id, "completed").await?;
        } else {
            for (ord, call) in rec.tool_calls.iter().enumerate() {
                let te_id = Uuid::new_v4();
                sqlx::query(
                    r#"
                    INSERT INTO tool_executions
                        (id, run_id, iteration_id, tool_use_id, tool_name, kind, ord, input,
                         max_attempts)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                    "#,
                )
                .bind(te_id)
                .bind(run_id)
                .bind(iteration.id)
                .bind(&call.tool_use_id)
                .bind(&call.tool_name)
                .bind(tool_kind_str(call.kind))
                .bind(ord as i32)
                .bind(Json(&call.input))
                .bind(rec.max_attempts)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
                notify_tx(&mut tx, NotifyKind::ToolReady, te_id, "queued").await?;
            }
            sqlx::query(
                "UPDATE runs SET status = 'waiting_for_tools', updated_at = now() WHERE id = $1",
            )
            .bind(run_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;
        iteration.try_into()
    }

    async fn resume_run_once(&self, run_id: Uuid, instance_id: Uuid) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE runs SET
                status = 'running', last_heartbeat_at = now(), updated_at = now()
            WHERE id = $1 AND claimed_by = $2 AND status = 'waiting_for_tools'
            "#,
        )
        .bind(run_id)
        .bind(instance_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(Error::LostClaim);
        }
        Ok(())
    }

    async fn fail_run_once(
        &self,
        run_id: Uuid,
        instance_id: Option<Uuid>,
        error: &RunError,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let result = sqlx::query(
            r#"
            UPDATE runs SET
                status = 'failed', error = $2, claimed_by = NULL, updated_at = now()
            WHERE id = $1
              AND status IN ('queued', 'running', 'waiting_for_tools')
              AND ($3::uuid IS NULL OR claimed_by = $3)
            "#,
        )
        .bind(run_id)
        .bind(Json(error))
        .bind(instance_id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            let exists: Option<(String,)> =
                sqlx::query_as("SELECT status FROM runs WHERE id = $1")
                    .bind(run_id)
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(db_err)?;
            return Err(match exists {
                None => not_found("run", run_id),
                Some(_) if instance_id.is_some() => Error::LostClaim,
                Some(_) => Error::Conflict("run already terminal".into()),
            });
        }

        notify_tx(&mut tx, NotifyKind::RunCompleted, run_id, "failed").await?;
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn cancel_run_once(&self, run_id: Uuid) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let result = sqlx::query(
            r#"
            UPDATE runs SET status = 'cancelled', claimed_by = NULL, updated_at = now()
            WHERE id = $1 AND status IN ('queued', 'running', 'waiting_for_tools')
            "#,
        )
        .bind(run_id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            let exists: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM runs WHERE id = $1")
                .bind(run_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(db_err)?;
            // Cancelling a terminal run is a no-op.
            return exists.map(|_| ()).ok_or_else(|| not_found("run", run_id));
        }

        notify_tx(&mut tx, NotifyKind::RunCompleted, run_id, "cancelled").await?;
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn requeue_run_once(&self, run_id: Uuid) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let result = sqlx::query(
            r#"
            UPDATE runs SET
                status = 'queued', claimed_by = NULL, claimed_at = NULL,
                last_heartbeat_at = NULL, attempt = attempt + 1, updated_at = now()
            WHERE id = $1 AND status IN ('running', 'waiting_for_tools')
            "#,
        )
        .bind(run_id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        if result.rows_affected() > 0 {
            notify_tx(&mut tx, NotifyKind::RunReady, run_id, "queued").await?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn find_stuck_runs_once(&self, before: DateTime<Utc>) -> Result<Vec<Run>> {
        let rows: Vec<RunRow> = sqlx::query_as(
            r#"
            SELECT * FROM runs
            WHERE status IN ('running', 'waiting_for_tools')
              AND (last_heartbeat_at IS NULL OR last_heartbeat_at < $1)
            ORDER BY created_at
            "#,
        )
        .bind(before)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn list_iterations_once(&self, run_id: Uuid) -> Result<Vec<Iteration>> {
        let rows: Vec<IterationRow> =
            sqlx::query_as("SELECT * FROM iterations WHERE run_id = $1 ORDER BY seq")
                .bind(run_id)
                .fetch_all(&self.pool)
                .await
                .map_err(db_err)?;
        rows.into_iter().map(TryInto::try_into).collect()
    }
}
