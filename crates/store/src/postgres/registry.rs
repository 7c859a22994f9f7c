//! Agent and tool registry operations.

use sqlx::types::Json;
use uuid::Uuid;

use mill_domain::agent::{Agent, AgentDefinition};
use mill_domain::tool::ToolSpec;
use mill_domain::Result;

use super::rows::{AgentRow, ToolRow};
use super::{db_err, not_found, retrying, PgStore};
use crate::traits::RegistryOps;

#[async_trait::async_trait]
impl RegistryOps for PgStore {
    async fn upsert_agent(&self, def: AgentDefinition) -> Result<Agent> {
        retrying!("upsert_agent", self.upsert_agent_once(&def).await)
    }

    async fn get_or_create_agent(&self, def: AgentDefinition) -> Result<Agent> {
        retrying!(
            "get_or_create_agent",
            self.get_or_create_agent_once(&def).await
        )
    }

    async fn get_agent(&self, id: Uuid) -> Result<Agent> {
        retrying!("get_agent", self.get_agent_once(id).await)
    }

    async fn get_agent_by_name(&self, name: &str) -> Result<Agent> {
        retrying!("get_agent_by_name", self.get_agent_by_name_once(name).await)
    }

    async fn upsert_tool(&self, spec: &ToolSpec) -> Result<()> {
        retrying!("upsert_tool", self.upsert_tool_once(spec).await)
    }

    async fn list_tools(&self) -> Result<Vec<ToolSpec>> {
        retrying!("list_tools", self.list_tools_once().await)
    }
}

impl PgStore {
    async fn upsert_agent_once(&self, def: &AgentDefinition) -> Result<Agent> {
        let row: AgentRow = sqlx::query_as(
            r#"
            INSERT INTO agents
                (id, name, model, system_prompt, max_tokens, temperature, tools, agent_ids, config)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (name) DO UPDATE SET
                model = EXCLUDED.model,
                system_prompt = EXCLUDED.system_prompt,
                max_tokens = EXCLUDED.max_tokens,
                temperature = EXCLUDED.temperature,
                tools = EXCLUDED.tools,
                agent_ids = EXCLUDED.agent_ids,
                config = EXCLUDED.config
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&def.name)
        .bind(&def.model)
        .bind(&def.system_prompt)
        .bind(def.max_tokens.map(|v| v as i32))
        .bind(def.temperature)
        .bind(&def.tools)
        .bind(&def.agent_ids)
        .bind(Json(&def.config))
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(row.into())
    }

    async fn get_or_create_agent_once(&self, def: &AgentDefinition) -> Result<Agent> {
        let inserted: Option<AgentRow> = sqlx::query_as(
            r#"
            INSERT INTO agents
                (id, name, model, system_prompt, max_tokens, temperature, tools, agent_ids, config)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (name) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&def.name)
        .bind(&def.model)
        .bind(&def.system_prompt)
        .bind(def.max_tokens.map(|v| v as i32))
        .bind(def.temperature)
        .bind(&def.tools)
        .bind(&def.agent_ids)
        .bind(Json(&def.config))
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        match inserted {
            Some(row) => Ok(row.into()),
            None => self.get_agent_by_name_once(&def.name).await,
        }
    }

    async fn get_agent_once(&self, id: Uuid) -> Result<Agent> {
        let row: Option<AgentRow> = sqlx::query_as("SELECT * FROM agents WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.map(Into::into).ok_or_else(|| not_found("agent", id))
    }

    async fn get_agent_by_name_once(&self, name: &str) -> Result<Agent> {
        let row: Option<AgentRow> = sqlx::query_as("SELECT * FROM agents WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.map(Into::into).ok_or_else(|| not_found("agent", name))
    }

    async fn upsert_tool_once(&self, spec: &ToolSpec) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO tools (name, description, input_schema)
            VALUES ($1, $2, $3)
            ON CONFLICT (name) DO UPDATE SET
                description = EXCLUDED.description,
                input_schema = EXCLUDED.input_schema
            "#,
        )
        .bind(&spec.name)
        .bind(&spec.description)
        .bind(Json(&spec.input_schema))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn list_tools_once(&self) -> Result<Vec<ToolSpec>> {
        let rows: Vec<ToolRow> = sqlx::query_as("SELECT * FROM tools ORDER BY name")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(rows.into_iter().map(Into::into).collect())
    }
}
