//! Agent rows. Lifecycle writes here are reserved for the controller.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use ariana_types::{
    Agent, AgentId, AgentState, MachineCoords, MachineId, MachineType, ProjectId, PromptId,
    PullRequestState, UserId,
};

use crate::time;

/// Repository over the `agents` table.
#[derive(Debug, Clone)]
pub struct AgentRepo {
    pool: SqlitePool,
}

impl AgentRepo {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a freshly created agent.
    pub async fn insert(&self, agent: &Agent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO agents (
                id, user_id, project_id, name, branch_name, repo_full_name, task_summary,
                machine_id, machine_type, machine_address, machine_shared_key,
                service_preview_token, environment_id, state, is_trashed, provisioned_at,
                lifetime_units, current_task_id, pending_commit_triggered,
                pending_push_pr_triggered, last_commit_sha, last_commit_url,
                last_commit_at, git_history_last_pushed_commit_sha,
                start_commit_sha, pr_number, pr_state, pr_base_branch,
                pr_last_synced_at, slop_mode_until, slop_mode_custom_prompt,
                ralph_mode, error_message, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(agent.id.to_string())
        .bind(agent.user_id.to_string())
        .bind(agent.project_id.to_string())
        .bind(&agent.name)
        .bind(&agent.branch_name)
        .bind(&agent.repo_full_name)
        .bind(&agent.task_summary)
        .bind(agent.machine_id.as_ref().map(|m| m.0.clone()))
        .bind(agent.machine_type.as_str())
        .bind(&agent.machine_address)
        .bind(&agent.machine_shared_key)
        .bind(&agent.service_preview_token)
        .bind(&agent.environment_id)
        .bind(agent.state.as_str())
        .bind(agent.is_trashed as i64)
        .bind(agent.provisioned_at.map(time::to_db))
        .bind(agent.lifetime_units)
        .bind(agent.current_task_id.map(|t| t.to_string()))
        .bind(agent.pending_commit_triggered as i64)
        .bind(agent.pending_push_pr_triggered as i64)
        .bind(&agent.last_commit_sha)
        .bind(&agent.last_commit_url)
        .bind(agent.last_commit_at.map(time::to_db))
        .bind(&agent.git_history_last_pushed_commit_sha)
        .bind(&agent.start_commit_sha)
        .bind(agent.pr_number)
        .bind(agent.pr_state.map(|s| s.as_str()))
        .bind(&agent.pr_base_branch)
        .bind(agent.pr_last_synced_at.map(time::to_db))
        .bind(agent.slop_mode_until.map(time::to_db))
        .bind(&agent.slop_mode_custom_prompt)
        .bind(agent.ralph_mode as i64)
        .bind(&agent.error_message)
        .bind(time::to_db(agent.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Fetch one agent.
    pub async fn get(&self, id: AgentId) -> Result<Option<Agent>> {
        let row = sqlx::query("SELECT * FROM agents WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(agent_from_row).transpose()
    }

    /// Agents the poller and state tick consider: READY/IDLE/RUNNING and
    /// not trashed.
    pub async fn list_pollable(&self) -> Result<Vec<Agent>> {
        let rows = sqlx::query(
            "SELECT * FROM agents
             WHERE state IN ('READY', 'IDLE', 'RUNNING') AND is_trashed = 0
             ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(agent_from_row).collect()
    }

    /// Move the agent to a new lifecycle state, enforcing the transition
    /// table. `error_message` is stored on entry to `ERROR` and cleared on
    /// every other transition.
    pub async fn set_state(
        &self,
        id: AgentId,
        to: AgentState,
        error_message: Option<&str>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT state FROM agents WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| anyhow!("agent {id} not found"))?;
        let from: AgentState = row
            .get::<String, _>("state")
            .parse()
            .map_err(|e: String| anyhow!(e))?;
        from.check_transition(to)
            .with_context(|| format!("agent {id}"))?;
        sqlx::query("UPDATE agents SET state = ?, error_message = ? WHERE id = ?")
            .bind(to.as_str())
            .bind(if to == AgentState::Error { error_message } else { None })
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Toggle the soft-delete flag.
    pub async fn set_trashed(&self, id: AgentId, trashed: bool) -> Result<()> {
        sqlx::query("UPDATE agents SET is_trashed = ? WHERE id = ?")
            .bind(trashed as i64)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Attach assigned machine coordinates to the agent.
    pub async fn attach_machine(&self, id: AgentId, coords: &MachineCoords) -> Result<()> {
        sqlx::query(
            "UPDATE agents SET machine_id = ?, machine_address = ?, machine_shared_key = ?
             WHERE id = ?",
        )
        .bind(&coords.machine_id.0)
        .bind(&coords.address)
        .bind(&coords.shared_key)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Clear every machine-related field, preserving `machine_type` so a
    /// resume re-acquires the same kind of machine.
    pub async fn reset_machine_fields(&self, id: AgentId) -> Result<()> {
        sqlx::query(
            "UPDATE agents SET machine_id = NULL, machine_address = NULL,
             machine_shared_key = NULL, service_preview_token = NULL,
             provisioned_at = NULL WHERE id = ?",
        )
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Stamp provisioning completion and the service-preview token.
    pub async fn mark_provisioned(&self, id: AgentId, preview_token: &str) -> Result<()> {
        sqlx::query(
            "UPDATE agents SET provisioned_at = ?, service_preview_token = ? WHERE id = ?",
        )
        .bind(time::to_db(Utc::now()))
        .bind(preview_token)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Set or clear the prompt currently executing.
    pub async fn set_current_task(&self, id: AgentId, task: Option<PromptId>) -> Result<()> {
        sqlx::query("UPDATE agents SET current_task_id = ? WHERE id = ?")
            .bind(task.map(|t| t.to_string()))
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Flip the blocking-commit gate flag.
    pub async fn set_pending_commit(&self, id: AgentId, pending: bool) -> Result<()> {
        sqlx::query("UPDATE agents SET pending_commit_triggered = ? WHERE id = ?")
            .bind(pending as i64)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Flip the blocking-push gate flag.
    pub async fn set_pending_push_pr(&self, id: AgentId, pending: bool) -> Result<()> {
        sqlx::query("UPDATE agents SET pending_push_pr_triggered = ? WHERE id = ?")
            .bind(pending as i64)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Store the generated task summary.
    pub async fn set_task_summary(&self, id: AgentId, summary: &str) -> Result<()> {
        sqlx::query("UPDATE agents SET task_summary = ? WHERE id = ?")
            .bind(summary)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Store a renamed branch.
    pub async fn set_branch_name(&self, id: AgentId, branch: &str) -> Result<()> {
        sqlx::query("UPDATE agents SET branch_name = ? WHERE id = ?")
            .bind(branch)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Record the newest observed commit.
    pub async fn set_last_commit(
        &self,
        id: AgentId,
        sha: &str,
        url: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE agents SET last_commit_sha = ?, last_commit_url = ?, last_commit_at = ?
             WHERE id = ?",
        )
        .bind(sha)
        .bind(url)
        .bind(time::to_db(at))
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Advance the incremental git-history cutoff.
    pub async fn set_git_history_cursor(&self, id: AgentId, sha: Option<&str>) -> Result<()> {
        sqlx::query("UPDATE agents SET git_history_last_pushed_commit_sha = ? WHERE id = ?")
            .bind(sha)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Record PR coordinates for the agent branch.
    pub async fn set_pull_request(
        &self,
        id: AgentId,
        number: i64,
        state: PullRequestState,
        base_branch: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE agents SET pr_number = ?, pr_state = ?, pr_base_branch = ?,
             pr_last_synced_at = ? WHERE id = ?",
        )
        .bind(number)
        .bind(state.as_str())
        .bind(base_branch)
        .bind(time::to_db(Utc::now()))
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Update only the synced PR state and sync timestamp.
    pub async fn touch_pull_request(&self, id: AgentId, state: PullRequestState) -> Result<()> {
        sqlx::query("UPDATE agents SET pr_state = ?, pr_last_synced_at = ? WHERE id = ?")
            .bind(state.as_str())
            .bind(time::to_db(Utc::now()))
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Configure slop mode.
    pub async fn set_slop_mode(
        &self,
        id: AgentId,
        until: Option<DateTime<Utc>>,
        custom_prompt: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE agents SET slop_mode_until = ?, slop_mode_custom_prompt = ? WHERE id = ?",
        )
        .bind(until.map(time::to_db))
        .bind(custom_prompt)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Toggle ralph mode.
    pub async fn set_ralph_mode(&self, id: AgentId, enabled: bool) -> Result<()> {
        sqlx::query("UPDATE agents SET ralph_mode = ? WHERE id = ?")
            .bind(enabled as i64)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Burn lifetime slices, clamping at zero.
    pub async fn decrement_lifetime(&self, id: AgentId, units: i64) -> Result<i64> {
        let row = sqlx::query(
            "UPDATE agents SET lifetime_units = MAX(0, lifetime_units - ?)
             WHERE id = ? RETURNING lifetime_units",
        )
        .bind(units)
        .bind(id.to_string())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("lifetime_units"))
    }

    /// Number of agents currently holding a machine.
    pub async fn count_with_machine(&self) -> Result<i64> {
        let row =
            sqlx::query("SELECT COUNT(*) AS n FROM agents WHERE machine_id IS NOT NULL")
                .fetch_one(&self.pool)
                .await?;
        Ok(row.get("n"))
    }
}

pub(crate) fn agent_from_row(row: sqlx::sqlite::SqliteRow) -> Result<Agent> {
    let parse_uuid = |col: &str| -> Result<Uuid> {
        let raw: String = row.get(col);
        Uuid::parse_str(&raw).map_err(|e| anyhow!("bad uuid in {col}: {e}"))
    };
    let state: AgentState = row
        .get::<String, _>("state")
        .parse()
        .map_err(|e: String| anyhow!(e))?;
    let machine_type: MachineType = row
        .get::<String, _>("machine_type")
        .parse()
        .map_err(|e: String| anyhow!(e))?;
    let pr_state = row
        .get::<Option<String>, _>("pr_state")
        .map(|s| s.parse::<PullRequestState>().map_err(|e| anyhow!(e)))
        .transpose()?;
    let current_task_id = row
        .get::<Option<String>, _>("current_task_id")
        .map(|s| Uuid::parse_str(&s).map(PromptId).map_err(|e| anyhow!("bad task id: {e}")))
        .transpose()?;

    Ok(Agent {
        id: AgentId(parse_uuid("id")?),
        user_id: UserId(parse_uuid("user_id")?),
        project_id: ProjectId(parse_uuid("project_id")?),
        name: row.get("name"),
        branch_name: row.get("branch_name"),
        repo_full_name: row.get("repo_full_name"),
        task_summary: row.get("task_summary"),
        machine_id: row.get::<Option<String>, _>("machine_id").map(MachineId),
        machine_type,
        machine_address: row.get("machine_address"),
        machine_shared_key: row.get("machine_shared_key"),
        service_preview_token: row.get("service_preview_token"),
        environment_id: row.get("environment_id"),
        state,
        is_trashed: row.get::<i64, _>("is_trashed") != 0,
        provisioned_at: time::opt_from_db(row.get("provisioned_at"))?,
        lifetime_units: row.get("lifetime_units"),
        current_task_id,
        pending_commit_triggered: row.get::<i64, _>("pending_commit_triggered") != 0,
        pending_push_pr_triggered: row.get::<i64, _>("pending_push_pr_triggered") != 0,
        last_commit_sha: row.get("last_commit_sha"),
        last_commit_url: row.get("last_commit_url"),
        last_commit_at: time::opt_from_db(row.get("last_commit_at"))?,
        git_history_last_pushed_commit_sha: row.get("git_history_last_pushed_commit_sha"),
        start_commit_sha: row.get("start_commit_sha"),
        pr_number: row.get("pr_number"),
        pr_state,
        pr_base_branch: row.get("pr_base_branch"),
        pr_last_synced_at: time::opt_from_db(row.get("pr_last_synced_at"))?,
        slop_mode_until: time::opt_from_db(row.get("slop_mode_until"))?,
        slop_mode_custom_prompt: row.get("slop_mode_custom_prompt"),
        ralph_mode: row.get::<i64, _>("ralph_mode") != 0,
        error_message: row.get("error_message"),
        created_at: time::from_db(&row.get::<String, _>("created_at"))?,
    })
}

/// Minimal agent fixture shared by repository tests.
#[cfg(test)]
pub(crate) fn sample_agent() -> Agent {
    Agent::provisioning(
        UserId::new(),
        ProjectId::new(),
        "readme-writer".into(),
        "ariana/readme-writer".into(),
        "acme/website".into(),
        MachineType::Pool,
        12,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Storage;

    #[tokio::test]
    async fn insert_and_get_round_trip() {
        let storage = Storage::in_memory().await.unwrap();
        let agent = sample_agent();
        storage.agents().insert(&agent).await.unwrap();

        let back = storage.agents().get(agent.id).await.unwrap().unwrap();
        assert_eq!(back.id, agent.id);
        assert_eq!(back.state, AgentState::Provisioning);
        assert_eq!(back.machine_type, MachineType::Pool);
        assert_eq!(back.lifetime_units, 12);
    }

    #[tokio::test]
    async fn set_state_enforces_transition_table() {
        let storage = Storage::in_memory().await.unwrap();
        let agent = sample_agent();
        storage.agents().insert(&agent).await.unwrap();
        let repo = storage.agents();

        repo.set_state(agent.id, AgentState::Provisioned, None).await.unwrap();
        // Skipping CLONING is illegal.
        assert!(repo.set_state(agent.id, AgentState::Idle, None).await.is_err());
        repo.set_state(agent.id, AgentState::Cloning, None).await.unwrap();
        repo.set_state(agent.id, AgentState::Ready, None).await.unwrap();
    }

    #[tokio::test]
    async fn error_message_stored_and_cleared() {
        let storage = Storage::in_memory().await.unwrap();
        let agent = sample_agent();
        storage.agents().insert(&agent).await.unwrap();
        let repo = storage.agents();

        repo.set_state(agent.id, AgentState::Error, Some("health check failed"))
            .await
            .unwrap();
        let got = repo.get(agent.id).await.unwrap().unwrap();
        assert_eq!(got.error_message.as_deref(), Some("health check failed"));

        repo.set_state(agent.id, AgentState::Provisioning, None).await.unwrap();
        let got = repo.get(agent.id).await.unwrap().unwrap();
        assert!(got.error_message.is_none());
    }

    #[tokio::test]
    async fn pollable_excludes_trashed() {
        let storage = Storage::in_memory().await.unwrap();
        let mut agent = sample_agent();
        agent.state = AgentState::Idle;
        storage.agents().insert(&agent).await.unwrap();
        assert_eq!(storage.agents().list_pollable().await.unwrap().len(), 1);

        storage.agents().set_trashed(agent.id, true).await.unwrap();
        assert!(storage.agents().list_pollable().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn machine_uniqueness_enforced() {
        let storage = Storage::in_memory().await.unwrap();
        let a = sample_agent();
        let b = sample_agent();
        storage.agents().insert(&a).await.unwrap();
        storage.agents().insert(&b).await.unwrap();

        let coords = MachineCoords {
            machine_id: MachineId::from("m-1"),
            address: "10.0.0.7".into(),
            shared_key: "key".into(),
            desktop_url: None,
            desktop_token: None,
        };
        storage.agents().attach_machine(a.id, &coords).await.unwrap();
        assert!(storage.agents().attach_machine(b.id, &coords).await.is_err());
    }

    #[tokio::test]
    async fn lifetime_clamps_at_zero() {
        let storage = Storage::in_memory().await.unwrap();
        let agent = sample_agent();
        storage.agents().insert(&agent).await.unwrap();
        let left = storage.agents().decrement_lifetime(agent.id, 20).await.unwrap();
        assert_eq!(left, 0);
    }
}
