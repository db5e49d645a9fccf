//! Automation definitions, their execution records, and context events.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use ariana_types::{
    AgentId, Automation, AutomationEvent, AutomationEventStatus, AutomationId, AutomationTrigger,
    ContextEvent, ContextEventKind, ProjectId, TriggerType, UserId,
};

use crate::time;

/// Repository over the `automations` table.
#[derive(Debug, Clone)]
pub struct AutomationRepo {
    pool: SqlitePool,
}

impl AutomationRepo {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert an automation definition.
    pub async fn insert(&self, automation: &Automation) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO automations (
                id, project_id, user_id, name, trigger_type, file_glob,
                command_regex, trigger_automation_id, script_language,
                script_content, blocking, feed_output
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(automation.id.to_string())
        .bind(automation.project_id.to_string())
        .bind(automation.user_id.to_string())
        .bind(&automation.name)
        .bind(automation.trigger.trigger_type.as_str())
        .bind(&automation.trigger.file_glob)
        .bind(&automation.trigger.command_regex)
        .bind(automation.trigger.automation_id.map(|a| a.to_string()))
        .bind(automation.script_language.as_str())
        .bind(&automation.script_content)
        .bind(automation.blocking as i64)
        .bind(automation.feed_output as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Fetch one automation.
    pub async fn get(&self, id: AutomationId) -> Result<Option<Automation>> {
        let row = sqlx::query("SELECT * FROM automations WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(automation_from_row).transpose()
    }

    /// All automations of a project bound to a given hook.
    pub async fn list_for_trigger(
        &self,
        project_id: ProjectId,
        trigger: TriggerType,
    ) -> Result<Vec<Automation>> {
        let rows = sqlx::query(
            "SELECT * FROM automations WHERE project_id = ? AND trigger_type = ?",
        )
        .bind(project_id.to_string())
        .bind(trigger.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(automation_from_row).collect()
    }
}

fn automation_from_row(row: sqlx::sqlite::SqliteRow) -> Result<Automation> {
    let id: String = row.get("id");
    let project_id: String = row.get("project_id");
    let user_id: String = row.get("user_id");
    let trigger_automation_id = row
        .get::<Option<String>, _>("trigger_automation_id")
        .map(|s| Uuid::parse_str(&s).map(AutomationId).map_err(|e| anyhow!("bad id: {e}")))
        .transpose()?;
    Ok(Automation {
        id: AutomationId(Uuid::parse_str(&id)?),
        project_id: ProjectId(Uuid::parse_str(&project_id)?),
        user_id: UserId(Uuid::parse_str(&user_id)?),
        name: row.get("name"),
        trigger: AutomationTrigger {
            trigger_type: row
                .get::<String, _>("trigger_type")
                .parse()
                .map_err(|e: String| anyhow!(e))?,
            file_glob: row.get("file_glob"),
            command_regex: row.get("command_regex"),
            automation_id: trigger_automation_id,
        },
        script_language: row
            .get::<String, _>("script_language")
            .parse()
            .map_err(|e: String| anyhow!(e))?,
        script_content: row.get("script_content"),
        blocking: row.get::<i64, _>("blocking") != 0,
        feed_output: row.get::<i64, _>("feed_output") != 0,
    })
}

/// Repository over the `automation_events` table.
#[derive(Debug, Clone)]
pub struct AutomationEventRepo {
    pool: SqlitePool,
}

impl AutomationEventRepo {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Record the start of an execution. Any previous `running` row for the
    /// same automation+agent is superseded and marked `killed`.
    pub async fn insert_running(
        &self,
        automation_id: AutomationId,
        agent_id: AgentId,
        output: &str,
        started_at: DateTime<Utc>,
    ) -> Result<i64> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "UPDATE automation_events SET status = 'killed', finished_at = ?
             WHERE automation_id = ? AND agent_id = ? AND status = 'running'",
        )
        .bind(time::to_db(started_at))
        .bind(automation_id.to_string())
        .bind(agent_id.to_string())
        .execute(&mut *tx)
        .await?;
        let result = sqlx::query(
            "INSERT INTO automation_events (automation_id, agent_id, status, output, started_at)
             VALUES (?, ?, 'running', ?, ?)",
        )
        .bind(automation_id.to_string())
        .bind(agent_id.to_string())
        .bind(output)
        .bind(time::to_db(started_at))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(result.last_insert_rowid())
    }

    /// The current `running` row for an automation+agent, if any.
    pub async fn get_running(
        &self,
        automation_id: AutomationId,
        agent_id: AgentId,
    ) -> Result<Option<AutomationEvent>> {
        let row = sqlx::query(
            "SELECT * FROM automation_events
             WHERE automation_id = ? AND agent_id = ? AND status = 'running'
             ORDER BY id DESC LIMIT 1",
        )
        .bind(automation_id.to_string())
        .bind(agent_id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(event_from_row).transpose()
    }

    /// Refresh the running-output snapshot.
    pub async fn update_output(&self, id: i64, output: &str) -> Result<()> {
        sqlx::query("UPDATE automation_events SET output = ? WHERE id = ?")
            .bind(output)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Complete an execution with its terminal status.
    pub async fn complete(
        &self,
        id: i64,
        status: AutomationEventStatus,
        output: &str,
        exit_code: Option<i64>,
        finished_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE automation_events SET status = ?, output = ?, exit_code = ?, finished_at = ?
             WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(output)
        .bind(exit_code)
        .bind(time::to_db(finished_at))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record a fast execution that skipped the `running` observation.
    #[allow(clippy::too_many_arguments)]
    pub async fn insert_completed(
        &self,
        automation_id: AutomationId,
        agent_id: AgentId,
        status: AutomationEventStatus,
        output: &str,
        exit_code: Option<i64>,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    ) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO automation_events
             (automation_id, agent_id, status, output, exit_code, started_at, finished_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(automation_id.to_string())
        .bind(agent_id.to_string())
        .bind(status.as_str())
        .bind(output)
        .bind(exit_code)
        .bind(time::to_db(started_at))
        .bind(time::to_db(finished_at))
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Whether the automation has an execution record (any status) started
    /// at or after `since`. Backs `on_before_commit` deduplication.
    pub async fn ran_since(
        &self,
        automation_id: AutomationId,
        agent_id: AgentId,
        since: DateTime<Utc>,
    ) -> Result<bool> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM automation_events
             WHERE automation_id = ? AND agent_id = ? AND started_at >= ?",
        )
        .bind(automation_id.to_string())
        .bind(agent_id.to_string())
        .bind(time::to_db(since))
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get::<i64, _>("n") > 0)
    }

    /// All execution records for an agent.
    pub async fn list_for_agent(&self, agent_id: AgentId) -> Result<Vec<AutomationEvent>> {
        let rows = sqlx::query("SELECT * FROM automation_events WHERE agent_id = ? ORDER BY id")
            .bind(agent_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(event_from_row).collect()
    }
}

fn event_from_row(row: sqlx::sqlite::SqliteRow) -> Result<AutomationEvent> {
    let automation_id: String = row.get("automation_id");
    let agent_id: String = row.get("agent_id");
    Ok(AutomationEvent {
        id: row.get("id"),
        automation_id: AutomationId(Uuid::parse_str(&automation_id)?),
        agent_id: AgentId(Uuid::parse_str(&agent_id)?),
        status: row.get::<String, _>("status").parse().map_err(|e: String| anyhow!(e))?,
        output: row.get("output"),
        exit_code: row.get("exit_code"),
        started_at: time::from_db(&row.get::<String, _>("started_at"))?,
        finished_at: time::opt_from_db(row.get("finished_at"))?,
    })
}

/// Repository over the `context_events` table.
#[derive(Debug, Clone)]
pub struct ContextEventRepo {
    pool: SqlitePool,
}

impl ContextEventRepo {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Record a context event.
    pub async fn insert(
        &self,
        agent_id: AgentId,
        kind: ContextEventKind,
        remaining_percent: Option<f64>,
    ) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO context_events (agent_id, kind, remaining_percent, created_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(agent_id.to_string())
        .bind(kind.as_str())
        .bind(remaining_percent)
        .bind(time::to_db(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// All context events for an agent, oldest first.
    pub async fn list_for_agent(&self, agent_id: AgentId) -> Result<Vec<ContextEvent>> {
        let rows = sqlx::query("SELECT * FROM context_events WHERE agent_id = ? ORDER BY id")
            .bind(agent_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| {
                let agent_id: String = row.get("agent_id");
                Ok(ContextEvent {
                    id: row.get("id"),
                    agent_id: AgentId(Uuid::parse_str(&agent_id)?),
                    kind: row.get::<String, _>("kind").parse().map_err(|e: String| anyhow!(e))?,
                    remaining_percent: row.get("remaining_percent"),
                    created_at: time::from_db(&row.get::<String, _>("created_at"))?,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Storage;
    use ariana_types::ScriptLanguage;

    fn sample_automation(project_id: ProjectId, trigger: TriggerType, blocking: bool) -> Automation {
        Automation {
            id: AutomationId::new(),
            project_id,
            user_id: UserId::new(),
            name: "lint".into(),
            trigger: AutomationTrigger {
                trigger_type: trigger,
                file_glob: None,
                command_regex: None,
                automation_id: None,
            },
            script_language: ScriptLanguage::Bash,
            script_content: "cargo clippy".into(),
            blocking,
            feed_output: false,
        }
    }

    #[tokio::test]
    async fn list_for_trigger_filters_by_project_and_hook() {
        let storage = Storage::in_memory().await.unwrap();
        let repo = storage.automations();
        let project = ProjectId::new();

        repo.insert(&sample_automation(project, TriggerType::OnBeforeCommit, true))
            .await
            .unwrap();
        repo.insert(&sample_automation(project, TriggerType::OnAgentReady, false))
            .await
            .unwrap();
        repo.insert(&sample_automation(ProjectId::new(), TriggerType::OnBeforeCommit, true))
            .await
            .unwrap();

        let hits = repo
            .list_for_trigger(project, TriggerType::OnBeforeCommit)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].blocking);
    }

    #[tokio::test]
    async fn running_event_supersedes_previous() {
        let storage = Storage::in_memory().await.unwrap();
        let repo = storage.automation_events();
        let automation_id = AutomationId::new();
        let agent_id = AgentId::new();

        let first = repo
            .insert_running(automation_id, agent_id, "", Utc::now())
            .await
            .unwrap();
        let second = repo
            .insert_running(automation_id, agent_id, "", Utc::now())
            .await
            .unwrap();
        assert_ne!(first, second);

        let events = repo.list_for_agent(agent_id).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].status, AutomationEventStatus::Killed);
        assert_eq!(events[1].status, AutomationEventStatus::Running);
    }

    #[tokio::test]
    async fn complete_and_ran_since() {
        let storage = Storage::in_memory().await.unwrap();
        let repo = storage.automation_events();
        let automation_id = AutomationId::new();
        let agent_id = AgentId::new();
        let started = Utc::now();

        let id = repo.insert_running(automation_id, agent_id, "", started).await.unwrap();
        repo.complete(id, AutomationEventStatus::Finished, "ok", Some(0), Utc::now())
            .await
            .unwrap();

        assert!(repo
            .ran_since(automation_id, agent_id, started - chrono::Duration::seconds(1))
            .await
            .unwrap());
        assert!(!repo
            .ran_since(automation_id, agent_id, started + chrono::Duration::seconds(60))
            .await
            .unwrap());
    }
}
