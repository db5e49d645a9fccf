//! Conversation rows, including the per-agent streaming placeholder.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use ariana_types::{AgentId, MessageRole, PromptId, StoredMessage, ToolCall};

use crate::time;

/// Result of a streaming upsert: the affected row and whether anything
/// actually changed (unchanged polls must not emit notifications).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamingUpsert {
    /// Row id of the streaming placeholder.
    pub id: i64,
    /// The row was newly inserted.
    pub added: bool,
    /// An existing row's content changed.
    pub modified: bool,
}

/// Repository over the `messages` table.
#[derive(Debug, Clone)]
pub struct MessageRepo {
    pool: SqlitePool,
}

impl MessageRepo {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// The agent's unique streaming placeholder, if present.
    pub async fn get_streaming(&self, agent_id: AgentId) -> Result<Option<StoredMessage>> {
        let row = sqlx::query("SELECT * FROM messages WHERE agent_id = ? AND is_streaming = 1")
            .bind(agent_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(message_from_row).transpose()
    }

    /// Insert or update the unique streaming placeholder for the agent.
    pub async fn upsert_streaming(
        &self,
        agent_id: AgentId,
        role: MessageRole,
        content: &str,
        model: Option<&str>,
        timestamp: DateTime<Utc>,
        task_id: Option<PromptId>,
    ) -> Result<StreamingUpsert> {
        if let Some(existing) = self.get_streaming(agent_id).await? {
            if existing.content == content {
                return Ok(StreamingUpsert { id: existing.id, added: false, modified: false });
            }
            sqlx::query("UPDATE messages SET content = ?, model = ?, timestamp = ? WHERE id = ?")
                .bind(content)
                .bind(model)
                .bind(time::to_db(timestamp))
                .bind(existing.id)
                .execute(&self.pool)
                .await?;
            return Ok(StreamingUpsert { id: existing.id, added: false, modified: true });
        }
        let result = sqlx::query(
            "INSERT INTO messages (agent_id, role, content, model, timestamp, task_id,
             tools, is_streaming, source_uuid)
             VALUES (?, ?, ?, ?, ?, ?, '[]', 1, NULL)",
        )
        .bind(agent_id.to_string())
        .bind(role.as_str())
        .bind(content)
        .bind(model)
        .bind(time::to_db(timestamp))
        .bind(task_id.map(|t| t.to_string()))
        .execute(&self.pool)
        .await?;
        Ok(StreamingUpsert { id: result.last_insert_rowid(), added: true, modified: false })
    }

    /// Finalize the streaming placeholder in place: clear the flag, replace
    /// content and tools, stamp the worker-provided id.
    pub async fn finalize_streaming(
        &self,
        row_id: i64,
        content: &str,
        source_uuid: &str,
        tools: &[ToolCall],
        model: Option<&str>,
        task_id: Option<PromptId>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE messages SET is_streaming = 0, content = ?, source_uuid = ?, tools = ?,
             model = ?, task_id = COALESCE(?, task_id) WHERE id = ?",
        )
        .bind(content)
        .bind(source_uuid)
        .bind(serde_json::to_string(tools)?)
        .bind(model)
        .bind(task_id.map(|t| t.to_string()))
        .bind(row_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Look up a finalized row by its worker-provided id.
    pub async fn get_by_source_uuid(
        &self,
        agent_id: AgentId,
        source_uuid: &str,
    ) -> Result<Option<StoredMessage>> {
        let row = sqlx::query("SELECT * FROM messages WHERE agent_id = ? AND source_uuid = ?")
            .bind(agent_id.to_string())
            .bind(source_uuid)
            .fetch_optional(&self.pool)
            .await?;
        row.map(message_from_row).transpose()
    }

    /// Replace a row's tool list (late tool-results on the overlap re-check).
    pub async fn update_tools(&self, row_id: i64, tools: &[ToolCall]) -> Result<()> {
        sqlx::query("UPDATE messages SET tools = ? WHERE id = ?")
            .bind(serde_json::to_string(tools)?)
            .bind(row_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Insert a finalized message.
    #[allow(clippy::too_many_arguments)]
    pub async fn insert_finalized(
        &self,
        agent_id: AgentId,
        role: MessageRole,
        content: &str,
        model: Option<&str>,
        timestamp: DateTime<Utc>,
        task_id: Option<PromptId>,
        tools: &[ToolCall],
        source_uuid: &str,
    ) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO messages (agent_id, role, content, model, timestamp, task_id,
             tools, is_streaming, source_uuid)
             VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?)",
        )
        .bind(agent_id.to_string())
        .bind(role.as_str())
        .bind(content)
        .bind(model)
        .bind(time::to_db(timestamp))
        .bind(task_id.map(|t| t.to_string()))
        .bind(serde_json::to_string(tools)?)
        .bind(source_uuid)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// All rows for an agent, in insertion order.
    pub async fn list_for_agent(&self, agent_id: AgentId) -> Result<Vec<StoredMessage>> {
        let rows = sqlx::query("SELECT * FROM messages WHERE agent_id = ? ORDER BY id")
            .bind(agent_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(message_from_row).collect()
    }

    /// Total rows stored for an agent.
    pub async fn count_for_agent(&self, agent_id: AgentId) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM messages WHERE agent_id = ?")
            .bind(agent_id.to_string())
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("n"))
    }

    /// Delete streaming placeholders left behind by a previous process.
    /// Called once at controller startup.
    pub async fn clear_orphaned_streaming(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM messages WHERE is_streaming = 1")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

fn message_from_row(row: sqlx::sqlite::SqliteRow) -> Result<StoredMessage> {
    let agent_id: String = row.get("agent_id");
    let tools_raw: String = row.get("tools");
    let task_id = row
        .get::<Option<String>, _>("task_id")
        .map(|s| Uuid::parse_str(&s).map(PromptId).map_err(|e| anyhow!("bad task id: {e}")))
        .transpose()?;
    Ok(StoredMessage {
        id: row.get("id"),
        agent_id: AgentId(Uuid::parse_str(&agent_id)?),
        role: row.get::<String, _>("role").parse().map_err(|e: String| anyhow!(e))?,
        content: row.get("content"),
        model: row.get("model"),
        timestamp: time::from_db(&row.get::<String, _>("timestamp"))?,
        task_id,
        tools: serde_json::from_str(&tools_raw)?,
        is_streaming: row.get::<i64, _>("is_streaming") != 0,
        source_uuid: row.get("source_uuid"),
    })
}
