#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **ariana-storage** – SQLite persistence layer for the Ariana control plane.
//!
//! One [`Storage`] instance owns a single `SqlitePool` and hands out typed
//! per-entity repositories. Schema migrations run inline on open. Side-data
//! writes (messages, commits, events) use atomic upserts keyed by stable
//! identifiers (`source_uuid`, `commit_sha`) so that concurrent pollers
//! never duplicate rows; lifecycle writes (agent state, gate flags) are
//! reserved for the controller, which is their single writer.

use std::path::Path;

use anyhow::Result;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;

pub mod agents;
pub mod automations;
pub mod commits;
pub mod machines;
pub mod messages;
pub mod prompts;

pub use agents::AgentRepo;
pub use automations::{AutomationEventRepo, AutomationRepo, ContextEventRepo};
pub use commits::CommitRepo;
pub use machines::{AccessRepo, MachineRepo, ReservationRepo};
pub use messages::MessageRepo;
pub use prompts::PromptRepo;

/// Storage root: owns the pool and hands out repositories.
#[derive(Debug, Clone)]
pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    /// Open or create a database at the given path and run migrations.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let url = format!("sqlite://{}?mode=rwc", path.as_ref().display());
        let pool = SqlitePool::connect(&url).await?;
        Self::from_pool(pool).await
    }

    /// Open an in-memory database. Used by tests and local development.
    ///
    /// Capped at one connection: every pool connection to `:memory:` would
    /// otherwise get its own empty database.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Self::from_pool(pool).await
    }

    /// Build storage from an existing pool (shared pools, custom configs).
    pub async fn from_pool(pool: SqlitePool) -> Result<Self> {
        let storage = Self { pool };
        storage.migrate().await?;
        Ok(storage)
    }

    /// Access the underlying pool (transactions spanning repositories).
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Agent rows.
    pub fn agents(&self) -> AgentRepo {
        AgentRepo::new(self.pool.clone())
    }

    /// Prompt queue rows.
    pub fn prompts(&self) -> PromptRepo {
        PromptRepo::new(self.pool.clone())
    }

    /// Conversation rows.
    pub fn messages(&self) -> MessageRepo {
        MessageRepo::new(self.pool.clone())
    }

    /// Observed commits.
    pub fn commits(&self) -> CommitRepo {
        CommitRepo::new(self.pool.clone())
    }

    /// Automation definitions.
    pub fn automations(&self) -> AutomationRepo {
        AutomationRepo::new(self.pool.clone())
    }

    /// Automation execution records.
    pub fn automation_events(&self) -> AutomationEventRepo {
        AutomationEventRepo::new(self.pool.clone())
    }

    /// Context-window events.
    pub fn context_events(&self) -> ContextEventRepo {
        ContextEventRepo::new(self.pool.clone())
    }

    /// Machine reservation queue.
    pub fn reservations(&self) -> ReservationRepo {
        ReservationRepo::new(self.pool.clone())
    }

    /// Custom (user-registered) machines.
    pub fn machines(&self) -> MachineRepo {
        MachineRepo::new(self.pool.clone())
    }

    /// User-agent access grants.
    pub fn access(&self) -> AccessRepo {
        AccessRepo::new(self.pool.clone())
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS agents (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                project_id TEXT NOT NULL,
                name TEXT NOT NULL,
                branch_name TEXT NOT NULL,
                repo_full_name TEXT NOT NULL,
                task_summary TEXT,
                machine_id TEXT,
                machine_type TEXT NOT NULL,
                machine_address TEXT,
                machine_shared_key TEXT,
                service_preview_token TEXT,
                environment_id TEXT,
                state TEXT NOT NULL,
                is_trashed INTEGER NOT NULL DEFAULT 0,
                provisioned_at TEXT,
                lifetime_units INTEGER NOT NULL DEFAULT 0,
                current_task_id TEXT,
                pending_commit_triggered INTEGER NOT NULL DEFAULT 0,
                pending_push_pr_triggered INTEGER NOT NULL DEFAULT 0,
                last_commit_sha TEXT,
                last_commit_url TEXT,
                last_commit_at TEXT,
                git_history_last_pushed_commit_sha TEXT,
                start_commit_sha TEXT,
                pr_number INTEGER,
                pr_state TEXT,
                pr_base_branch TEXT,
                pr_last_synced_at TEXT,
                slop_mode_until TEXT,
                slop_mode_custom_prompt TEXT,
                ralph_mode INTEGER NOT NULL DEFAULT 0,
                error_message TEXT,
                created_at TEXT NOT NULL
            ) STRICT
            "#,
        )
        .execute(&self.pool)
        .await?;

        // One machine belongs to at most one agent at any time.
        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_agents_machine
             ON agents(machine_id) WHERE machine_id IS NOT NULL",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_agents_state ON agents(state)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS prompts (
                id TEXT PRIMARY KEY,
                agent_id TEXT NOT NULL,
                prompt TEXT NOT NULL,
                model TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL
            ) STRICT
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_prompts_agent
             ON prompts(agent_id, status, created_at)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                agent_id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                model TEXT,
                timestamp TEXT NOT NULL,
                task_id TEXT,
                tools TEXT NOT NULL DEFAULT '[]',
                is_streaming INTEGER NOT NULL DEFAULT 0,
                source_uuid TEXT
            ) STRICT
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Finalized rows are unique per worker-provided id.
        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_source
             ON messages(agent_id, source_uuid) WHERE source_uuid IS NOT NULL",
        )
        .execute(&self.pool)
        .await?;

        // At most one streaming placeholder per agent.
        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_streaming
             ON messages(agent_id) WHERE is_streaming = 1",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS commits (
                commit_sha TEXT PRIMARY KEY,
                agent_id TEXT NOT NULL,
                branch_name TEXT NOT NULL,
                commit_message TEXT NOT NULL,
                task_id TEXT,
                files_changed INTEGER NOT NULL DEFAULT 0,
                additions INTEGER NOT NULL DEFAULT 0,
                deletions INTEGER NOT NULL DEFAULT 0,
                pushed INTEGER NOT NULL DEFAULT 0,
                commit_patch TEXT,
                is_deleted INTEGER NOT NULL DEFAULT 0,
                authored_at TEXT NOT NULL
            ) STRICT
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_commits_agent ON commits(agent_id, authored_at)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS automations (
                id TEXT PRIMARY KEY,
                project_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                name TEXT NOT NULL,
                trigger_type TEXT NOT NULL,
                file_glob TEXT,
                command_regex TEXT,
                trigger_automation_id TEXT,
                script_language TEXT NOT NULL,
                script_content TEXT NOT NULL,
                blocking INTEGER NOT NULL DEFAULT 0,
                feed_output INTEGER NOT NULL DEFAULT 0
            ) STRICT
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_automations_project
             ON automations(project_id, trigger_type)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS automation_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                automation_id TEXT NOT NULL,
                agent_id TEXT NOT NULL,
                status TEXT NOT NULL,
                output TEXT NOT NULL DEFAULT '',
                exit_code INTEGER,
                started_at TEXT NOT NULL,
                finished_at TEXT
            ) STRICT
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_automation_events_agent
             ON automation_events(agent_id, automation_id, status)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS context_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                agent_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                remaining_percent REAL,
                created_at TEXT NOT NULL
            ) STRICT
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS reservations (
                id TEXT PRIMARY KEY,
                agent_id TEXT NOT NULL,
                status TEXT NOT NULL,
                machine_id TEXT,
                machine_address TEXT,
                machine_shared_key TEXT,
                desktop_url TEXT,
                desktop_token TEXT,
                created_at TEXT NOT NULL
            ) STRICT
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_reservations_agent
             ON reservations(agent_id, status)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS custom_machines (
                machine_id TEXT PRIMARY KEY,
                owner_user_id TEXT NOT NULL,
                address TEXT NOT NULL,
                shared_key TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'available',
                agent_id TEXT
            ) STRICT
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS agent_access (
                user_id TEXT NOT NULL,
                agent_id TEXT NOT NULL,
                level TEXT NOT NULL DEFAULT 'write',
                PRIMARY KEY (user_id, agent_id)
            ) STRICT
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Close the pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

pub(crate) mod time {
    //! RFC 3339 text timestamps, the storage representation for all dates.

    use anyhow::{anyhow, Result};
    use chrono::{DateTime, Utc};

    pub fn to_db(ts: DateTime<Utc>) -> String {
        ts.to_rfc3339()
    }

    pub fn from_db(raw: &str) -> Result<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| anyhow!("bad timestamp {raw:?}: {e}"))
    }

    pub fn opt_from_db(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
        raw.map(|s| from_db(&s)).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let storage = Storage::in_memory().await.unwrap();
        storage.migrate().await.unwrap();
        storage.migrate().await.unwrap();
    }

    #[tokio::test]
    async fn open_on_disk_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plane.db");
        let storage = Storage::open(&path).await.unwrap();
        storage.close().await;
        assert!(path.exists());
    }
}
