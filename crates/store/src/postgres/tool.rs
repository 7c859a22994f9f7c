//! Tool execution queue operations.

use chrono::{DateTime, Utc};
use sqlx::types::Json;
use uuid::Uuid;

use mill_domain::tool::ToolExecution;
use mill_domain::{Error, Result};

use super::rows::ToolExecutionRow;
use super::{db_err, not_found, notify_tx, retrying, PgStore};
use crate::notify::NotifyKind;
use crate::traits::{ToolDisposition, ToolOps};

#[async_trait::async_trait]
impl ToolOps for PgStore {
    async fn claim_tool_execution(&self, instance_id: Uuid) -> Result<Option<ToolExecution>> {
        retrying!(
            "claim_tool_execution",
            self.claim_tool_execution_once(instance_id).await
        )
    }

    async fn get_tool_execution(&self, te_id: Uuid) -> Result<ToolExecution> {
        retrying!(
            "get_tool_execution",
            self.get_tool_execution_once(te_id).await
        )
    }

    async fn heartbeat_tool_execution(&self, te_id: Uuid, instance_id: Uuid) -> Result<()> {
        retrying!(
            "heartbeat_tool_execution",
            self.heartbeat_tool_execution_once(te_id, instance_id).await
        )
    }

    async fn complete_tool_execution(
        &self,
        te_id: Uuid,
        instance_id: Uuid,
        output: serde_json::Value,
    ) -> Result<()> {
        retrying!(
            "complete_tool_execution",
            self.complete_tool_execution_once(te_id, instance_id, &output)
                .await
        )
    }

    async fn fail_tool_execution(
        &self,
        te_id: Uuid,
        instance_id: Uuid,
        disposition: ToolDisposition,
    ) -> Result<()> {
        retrying!(
            "fail_tool_execution",
            self.fail_tool_execution_once(te_id, instance_id, &disposition)
                .await
        )
    }

    async fn release_tool_execution(
        &self,
        te_id: Uuid,
        instance_id: Uuid,
        available_at: DateTime<Utc>,
    ) -> Result<()> {
        retrying!(
            "release_tool_execution",
            self.release_tool_execution_once(te_id, instance_id, available_at)
                .await
        )
    }

    async fn list_tool_executions(&self, iteration_id: Uuid) -> Result<Vec<ToolExecution>> {
        retrying!(
            "list_tool_executions",
            self.list_tool_executions_once(iteration_id).await
        )
    }

    async fn find_stuck_tool_executions(
        &self,
        before: DateTime<Utc>,
    ) -> Result<Vec<ToolExecution>> {
        retrying!(
            "find_stuck_tool_executions",
            self.find_stuck_tool_executions_once(before).await
        )
    }

    async fn requeue_tool_execution(&self, te_id: Uuid) -> Result<()> {
        retrying!(
            "requeue_tool_execution",
            self.requeue_tool_execution_once(te_id).await
        )
    }

    async fn fail_tool_rescued(&self, te_id: Uuid, error: String) -> Result<()> {
        retrying!(
            "fail_tool_rescued",
            self.fail_tool_rescued_once(te_id, &error).await
        )
    }
}

impl PgStore {
    async fn claim_tool_execution_once(&self, instance_id: Uuid) -> Result<Option<ToolExecution>> {
        let row: Option<ToolExecutionRow> = sqlx::query_as(
            r#"
            UPDATE tool_executions SET
                status = 'running',
                claimed_by = $1,
                claimed_at = now(),
                last_heartbeat_at = now(),
                updated_at = now()
            WHERE id = (
                SELECT id FROM tool_executions
                WHERE status IN ('queued', 'snoozed') AND available_at <= now()
                ORDER BY available_at, created_at, ord
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

    async fn get_tool_execution_once(&self, te_id: Uuid) -> Result<ToolExecution> {
        let row: Option<ToolExecutionRow> =
            sqlx::query_as("SELECT * FROM tool_executions WHERE id = $1")
                .bind(te_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?;
        row.ok_or_else(|| not_found("tool execution", te_id))?
            .try_into()
    }

    async fn heartbeat_tool_execution_once(&self, te_id: Uuid, instance_id: Uuid) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE tool_executions SET last_heartbeat_at = now()
            WHERE id = $1 AND claimed_by = $2 AND status = 'running'
            "#,
        )
        .bind(te_id)
        .bind(instance_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(Error::LostClaim);
        }
        Ok(())
    }

    async fn complete_tool_execution_once(
        &self,
        te_id: Uuid,
        instance_id: Uuid,
        output: &serde_json::Value,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let run_id: Option<(Uuid,)> = sqlx::query_as(
            r#"
            UPDATE tool_executions SET
                status = 'succeeded', output = $3, claimed_by = NULL, updated_at = now()
            WHERE id = $1 AND claimed_by = $2 AND status = 'running'
            RETURNING run_id
            "#,
        )
        .bind(te_id)
        .bind(instance_id)
        .bind(Json(output))
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;

        let Some((run_id,)) = run_id else {
            return Err(Error::LostClaim);
        };
        notify_tx(&mut tx, NotifyKind::ToolCompleted, run_id, "succeeded").await?;
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn fail_tool_execution_once(
        &self,
        te_id: Uuid,
        instance_id: Uuid,
        disposition: &ToolDisposition,
    ) -> Result<()> {
        let (status, error, available_at, bump_attempt) = match disposition {
            ToolDisposition::Failed { error } => ("failed", error, None, false),
            ToolDisposition::Cancelled { error } => ("cancelled", error, None, false),
            ToolDisposition::Discarded { error } => ("discarded", error, None, false),
            ToolDisposition::Retry {
                error,
                available_at,
            } => ("queued", error, Some(*available_at), true),
            ToolDisposition::Snoozed {
                error,
                available_at,
            } => ("snoozed", error, Some(*available_at), false),
        };

        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let run_id: Option<(Uuid,)> = sqlx::query_as(
            r#"
            UPDATE tool_executions SET
                status = $3,
                error = $4,
                available_at = COALESCE($5, available_at),
                attempt = attempt + $6,
                claimed_by = NULL,
                claimed_at = NULL,
                updated_at = now()
            WHERE id = $1 AND claimed_by = $2 AND status = 'running'
            RETURNING run_id
            "#,
        )
        .bind(te_id)
        .bind(instance_id)
        .bind(status)
        .bind(error)
        .bind(available_at)
        .bind(if bump_attempt { 1i32 } else { 0i32 })
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;

        let Some((run_id,)) = run_id else {
            return Err(Error::LostClaim);
        };
        notify_tx(&mut tx, NotifyKind::ToolCompleted, run_id, status).await?;
        if available_at.is_some() {
            notify_tx(&mut tx, NotifyKind::ToolReady, te_id, status).await?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn release_tool_execution_once(
        &self,
        te_id: Uuid,
        instance_id: Uuid,
        available_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let result = sqlx::query(
            r#"
            UPDATE tool_executions SET
                status = 'queued', claimed_by = NULL, claimed_at = NULL,
                available_at = $3, updated_at = now()
            WHERE id = $1 AND claimed_by = $2 AND status = 'running'
            "#,
        )
        .bind(te_id)
        .bind(instance_id)
        .bind(available_at)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(Error::LostClaim);
        }
        notify_tx(&mut tx, NotifyKind::ToolReady, te_id, "queued").await?;
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn list_tool_executions_once(&self, iteration_id: Uuid) -> Result<Vec<ToolExecution>> {
        let rows: Vec<ToolExecutionRow> =
            sqlx::query_as("SELECT * FROM tool_executions WHERE iteration_id = $1 ORDER BY ord")
                .bind(iteration_id)
                .fetch_all(&self.pool)
                .await
                .map_err(db_err)?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn find_stuck_tool_executions_once(
        &self,
        before: DateTime<Utc>,
    ) -> Result<Vec<ToolExecution>> {
        let rows: Vec<ToolExecutionRow> = sqlx::query_as(
            r#"
            SELECT * FROM tool_executions
            WHERE status = 'running'
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

    async fn requeue_tool_execution_once(&self, te_id: Uuid) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let result = sqlx::query(
            r#"
            UPDATE tool_executions SET
                status = 'queued', claimed_by = NULL, claimed_at = NULL,
                last_heartbeat_at = NULL, available_at = now(),
                attempt = attempt + 1, updated_at = now()
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(te_id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        if result.rows_affected() > 0 {
            notify_tx(&mut tx, NotifyKind::ToolReady, te_id, "queued").await?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn fail_tool_rescued_once(&self, te_id: Uuid, error: &str) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let run_id: Option<(Uuid,)> = sqlx::query_as(
            r#"
            UPDATE tool_executions SET
                status = 'failed', error = $2, claimed_by = NULL, updated_at = now()
            WHERE id = $1 AND status IN ('queued', 'running', 'snoozed')
            RETURNING run_id
            "#,
        )
        .bind(te_id)
        .bind(error)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;

        if let Some((run_id,)) = run_id {
            notify_tx(&mut tx, NotifyKind::ToolCompleted, run_id, "failed").await?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }
}
