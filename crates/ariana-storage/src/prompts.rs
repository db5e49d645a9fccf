//! Prompt queue rows. FIFO per agent by `created_at`.

use anyhow::{anyhow, Result};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use ariana_types::{AgentId, ModelKind, Prompt, PromptId, PromptStatus};

use crate::time;

/// Repository over the `prompts` table.
#[derive(Debug, Clone)]
pub struct PromptRepo {
    pool: SqlitePool,
}

impl PromptRepo {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Append a prompt to the agent's queue.
    pub async fn queue(&self, prompt: &Prompt) -> Result<()> {
        sqlx::query(
            "INSERT INTO prompts (id, agent_id, prompt, model, status, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(prompt.id.to_string())
        .bind(prompt.agent_id.to_string())
        .bind(&prompt.prompt)
        .bind(prompt.model.as_str())
        .bind(prompt.status.as_str())
        .bind(time::to_db(prompt.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Fetch one prompt.
    pub async fn get(&self, id: PromptId) -> Result<Option<Prompt>> {
        let row = sqlx::query("SELECT * FROM prompts WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(prompt_from_row).transpose()
    }

    /// Head of the agent's FIFO queue.
    pub async fn head_queued(&self, agent_id: AgentId) -> Result<Option<Prompt>> {
        let row = sqlx::query(
            "SELECT * FROM prompts WHERE agent_id = ? AND status = 'queued'
             ORDER BY created_at ASC, id ASC LIMIT 1",
        )
        .bind(agent_id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(prompt_from_row).transpose()
    }

    /// Update a prompt's status.
    pub async fn set_status(&self, id: PromptId, status: PromptStatus) -> Result<()> {
        sqlx::query("UPDATE prompts SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Mark every queued or running prompt failed. Used on machine death,
    /// ghost detection, and provisioning failure.
    pub async fn fail_active(&self, agent_id: AgentId) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE prompts SET status = 'failed'
             WHERE agent_id = ? AND status IN ('queued', 'running')",
        )
        .bind(agent_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Mark running prompts finished. Used at checkpoint time and by the
    /// interrupt path (an interrupted prompt still finished).
    pub async fn finish_running(&self, agent_id: AgentId) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE prompts SET status = 'finished'
             WHERE agent_id = ? AND status = 'running'",
        )
        .bind(agent_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Number of prompts currently `running` for the agent.
    pub async fn count_running(&self, agent_id: AgentId) -> Result<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM prompts WHERE agent_id = ? AND status = 'running'",
        )
        .bind(agent_id.to_string())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("n"))
    }

    /// Model of the most recently dispatched prompt; autonomous mode reuses
    /// it for injected follow-ups.
    pub async fn last_used_model(&self, agent_id: AgentId) -> Result<Option<ModelKind>> {
        let row = sqlx::query(
            "SELECT model FROM prompts WHERE agent_id = ? AND status != 'queued'
             ORDER BY created_at DESC LIMIT 1",
        )
        .bind(agent_id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| {
            r.get::<String, _>("model")
                .parse::<ModelKind>()
                .map_err(|e| anyhow!(e))
        })
        .transpose()
    }

    /// Total prompts ever queued for an agent; the first prompt triggers
    /// one-time background work (branch rename).
    pub async fn count_for_agent(&self, agent_id: AgentId) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM prompts WHERE agent_id = ?")
            .bind(agent_id.to_string())
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("n"))
    }

    /// Latest prompt whose `created_at` is not after `at`; the chronology
    /// rule that assigns task ids to observed commits.
    pub async fn latest_created_before(
        &self,
        agent_id: AgentId,
        at: chrono::DateTime<chrono::Utc>,
    ) -> Result<Option<Prompt>> {
        let row = sqlx::query(
            "SELECT * FROM prompts WHERE agent_id = ? AND created_at <= ?
             ORDER BY created_at DESC LIMIT 1",
        )
        .bind(agent_id.to_string())
        .bind(time::to_db(at))
        .fetch_optional(&self.pool)
        .await?;
        row.map(prompt_from_row).transpose()
    }
}

fn prompt_from_row(row: sqlx::sqlite::SqliteRow) -> Result<Prompt> {
    let id: String = row.get("id");
    let agent_id: String = row.get("agent_id");
    Ok(Prompt {
        id: PromptId(Uuid::parse_str(&id)?),
        agent_id: AgentId(Uuid::parse_str(&agent_id)?),
        prompt: row.get("prompt"),
        model: row.get::<String, _>("model").parse().map_err(|e: String| anyhow!(e))?,
        status: row.get::<String, _>("status").parse().map_err(|e: String| anyhow!(e))?,
        created_at: time::from_db(&row.get::<String, _>("created_at"))?,
    })
}
