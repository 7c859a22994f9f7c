//! Instance registration and the leader lease.
//!
//! Lease take-over is decided by staleness (`expires_at < now()`), never by
//! comparing wall clocks between instances.

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::types::Json;
use tokio::sync::broadcast;
use uuid::Uuid;

use mill_domain::instance::Instance;
use mill_domain::Result;

use super::rows::InstanceRow;
use super::{db_err, notify_tx, retrying, PgStore};
use crate::notify::{Notification, NotifyKind};
use crate::traits::CoordinationOps;

#[async_trait::async_trait]
impl CoordinationOps for PgStore {
    async fn register_instance(&self, instance: &Instance) -> Result<()> {
        retrying!(
            "register_instance",
            self.register_instance_once(instance).await
        )
    }

    async fn refresh_instance(&self, id: Uuid) -> Result<bool> {
        retrying!("refresh_instance", self.refresh_instance_once(id).await)
    }

    async fn remove_instance(&self, id: Uuid) -> Result<()> {
        retrying!("remove_instance", self.remove_instance_once(id).await)
    }

    async fn delete_stale_instances(&self, before: DateTime<Utc>) -> Result<u64> {
        retrying!(
            "delete_stale_instances",
            self.delete_stale_instances_once(before).await
        )
    }

    async fn list_instances(&self) -> Result<Vec<Instance>> {
        retrying!("list_instances", self.list_instances_once().await)
    }

    async fn try_acquire_leader(&self, instance_id: Uuid, ttl: Duration) -> Result<bool> {
        retrying!(
            "try_acquire_leader",
            self.try_acquire_leader_once(instance_id, ttl).await
        )
    }

    async fn renew_leader(&self, instance_id: Uuid, ttl: Duration) -> Result<bool> {
        retrying!(
            "renew_leader",
            self.renew_leader_once(instance_id, ttl).await
        )
    }

    async fn release_leader(&self, instance_id: Uuid) -> Result<()> {
        retrying!("release_leader", self.release_leader_once(instance_id).await)
    }

    fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.event_sender().subscribe()
    }
}

impl PgStore {
    async fn register_instance_once(&self, instance: &Instance) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        sqlx::query(
            r#"
            INSERT INTO instances (id, name, metadata, started_at, last_heartbeat_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                metadata = EXCLUDED.metadata,
                last_heartbeat_at = EXCLUDED.last_heartbeat_at
            "#,
        )
        .bind(instance.id)
        .bind(&instance.name)
        .bind(Json(&instance.metadata))
        .bind(instance.started_at)
        .bind(instance.last_heartbeat_at)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        notify_tx(&mut tx, NotifyKind::InstanceEvent, instance.id, "registered").await?;
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn refresh_instance_once(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("UPDATE instances SET last_heartbeat_at = now() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn remove_instance_once(&self, id: Uuid) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        sqlx::query("DELETE FROM instances WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        notify_tx(&mut tx, NotifyKind::InstanceEvent, id, "removed").await?;
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn delete_stale_instances_once(&self, before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM instances WHERE last_heartbeat_at < $1")
            .bind(before)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected())
    }

    async fn list_instances_once(&self) -> Result<Vec<Instance>> {
        let rows: Vec<InstanceRow> =
            sqlx::query_as("SELECT * FROM instances ORDER BY started_at")
                .fetch_all(&self.pool)
                .await
                .map_err(db_err)?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn try_acquire_leader_once(&self, instance_id: Uuid, ttl: Duration) -> Result<bool> {
        let row: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO leader (singleton, instance_id, acquired_at, expires_at)
            VALUES (TRUE, $1, now(), now() + make_interval(secs => $2))
            ON CONFLICT (singleton) DO UPDATE SET
                instance_id = EXCLUDED.instance_id,
                acquired_at = EXCLUDED.acquired_at,
                expires_at = EXCLUDED.expires_at
            WHERE leader.expires_at < now() OR leader.instance_id = $1
            RETURNING instance_id
            "#,
        )
        .bind(instance_id)
        .bind(ttl.as_secs_f64())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(row.is_some())
    }

    async fn renew_leader_once(&self, instance_id: Uuid, ttl: Duration) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE leader SET expires_at = now() + make_interval(secs => $2)
            WHERE instance_id = $1
            "#,
        )
        .bind(instance_id)
        .bind(ttl.as_secs_f64())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn release_leader_once(&self, instance_id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM leader WHERE instance_id = $1")
            .bind(instance_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}
