//! Observed commits. Rows are never deleted; `is_deleted` latches.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use ariana_types::{AgentId, Commit, PromptId};

use crate::time;

/// Repository over the `commits` table.
#[derive(Debug, Clone)]
pub struct CommitRepo {
    pool: SqlitePool,
}

impl CommitRepo {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or refresh a commit keyed by SHA. The upsert never touches
    /// `is_deleted`: a tombstoned commit stays tombstoned even if a stale
    /// fetch returns it again.
    pub async fn upsert(&self, commit: &Commit) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO commits (
                commit_sha, agent_id, branch_name, commit_message, task_id,
                files_changed, additions, deletions, pushed, commit_patch,
                is_deleted, authored_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?)
            ON CONFLICT(commit_sha) DO UPDATE SET
                branch_name = excluded.branch_name,
                commit_message = excluded.commit_message,
                task_id = COALESCE(excluded.task_id, commits.task_id),
                files_changed = excluded.files_changed,
                additions = excluded.additions,
                deletions = excluded.deletions,
                pushed = excluded.pushed,
                commit_patch = excluded.commit_patch
            "#,
        )
        .bind(&commit.commit_sha)
        .bind(commit.agent_id.to_string())
        .bind(&commit.branch_name)
        .bind(&commit.commit_message)
        .bind(commit.task_id.map(|t| t.to_string()))
        .bind(commit.files_changed)
        .bind(commit.additions)
        .bind(commit.deletions)
        .bind(commit.pushed as i64)
        .bind(&commit.commit_patch)
        .bind(time::to_db(commit.authored_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Fetch one commit by SHA.
    pub async fn get(&self, sha: &str) -> Result<Option<Commit>> {
        let row = sqlx::query("SELECT * FROM commits WHERE commit_sha = ?")
            .bind(sha)
            .fetch_optional(&self.pool)
            .await?;
        row.map(commit_from_row).transpose()
    }

    /// All commits for an agent, oldest first, tombstones included.
    pub async fn list_for_agent(&self, agent_id: AgentId) -> Result<Vec<Commit>> {
        let rows = sqlx::query(
            "SELECT * FROM commits WHERE agent_id = ? ORDER BY authored_at, commit_sha",
        )
        .bind(agent_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(commit_from_row).collect()
    }

    /// Live (non-tombstoned) commits for an agent.
    pub async fn list_live_for_agent(&self, agent_id: AgentId) -> Result<Vec<Commit>> {
        let rows = sqlx::query(
            "SELECT * FROM commits WHERE agent_id = ? AND is_deleted = 0
             ORDER BY authored_at, commit_sha",
        )
        .bind(agent_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(commit_from_row).collect()
    }

    /// Latch the tombstone flag.
    pub async fn mark_deleted(&self, sha: &str) -> Result<()> {
        sqlx::query("UPDATE commits SET is_deleted = 1 WHERE commit_sha = ?")
            .bind(sha)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Find a live commit sharing an author timestamp with a different SHA.
    /// An amend rewrites the SHA but keeps the author timestamp, so a match
    /// here means `exclude_sha` superseded the returned commit.
    pub async fn find_amended_predecessor(
        &self,
        agent_id: AgentId,
        authored_at: DateTime<Utc>,
        exclude_sha: &str,
    ) -> Result<Option<Commit>> {
        let row = sqlx::query(
            "SELECT * FROM commits WHERE agent_id = ? AND authored_at = ?
             AND commit_sha != ? AND is_deleted = 0 LIMIT 1",
        )
        .bind(agent_id.to_string())
        .bind(time::to_db(authored_at))
        .bind(exclude_sha)
        .fetch_optional(&self.pool)
        .await?;
        row.map(commit_from_row).transpose()
    }
}

fn commit_from_row(row: sqlx::sqlite::SqliteRow) -> Result<Commit> {
    let agent_id: String = row.get("agent_id");
    let task_id = row
        .get::<Option<String>, _>("task_id")
        .map(|s| Uuid::parse_str(&s).map(PromptId).map_err(|e| anyhow!("bad task id: {e}")))
        .transpose()?;
    Ok(Commit {
        commit_sha: row.get("commit_sha"),
        agent_id: AgentId(Uuid::parse_str(&agent_id)?),
        branch_name: row.get("branch_name"),
        commit_message: row.get("commit_message"),
        task_id,
        files_changed: row.get("files_changed"),
        additions: row.get("additions"),
        deletions: row.get("deletions"),
        pushed: row.get::<i64, _>("pushed") != 0,
        commit_patch: row.get("commit_patch"),
        is_deleted: row.get::<i64, _>("is_deleted") != 0,
        authored_at: time::from_db(&row.get::<String, _>("authored_at"))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Storage;

    fn sample_commit(agent_id: AgentId, sha: &str) -> Commit {
        Commit {
            commit_sha: sha.to_string(),
            agent_id,
            branch_name: "ariana/test".into(),
            commit_message: "add README".into(),
            task_id: None,
            files_changed: 1,
            additions: 10,
            deletions: 0,
            pushed: false,
            commit_patch: None,
            is_deleted: false,
            authored_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn upsert_is_idempotent_by_sha() {
        let storage = Storage::in_memory().await.unwrap();
        let repo = storage.commits();
        let agent_id = AgentId::new();

        let commit = sample_commit(agent_id, "abc123");
        repo.upsert(&commit).await.unwrap();
        repo.upsert(&commit).await.unwrap();

        assert_eq!(repo.list_for_agent(agent_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn tombstone_latches_across_upserts() {
        let storage = Storage::in_memory().await.unwrap();
        let repo = storage.commits();
        let agent_id = AgentId::new();

        let commit = sample_commit(agent_id, "abc123");
        repo.upsert(&commit).await.unwrap();
        repo.mark_deleted("abc123").await.unwrap();

        // A stale fetch returning the commit again must not resurrect it.
        repo.upsert(&commit).await.unwrap();
        let got = repo.get("abc123").await.unwrap().unwrap();
        assert!(got.is_deleted);
    }

    #[tokio::test]
    async fn amend_matching_by_author_timestamp() {
        let storage = Storage::in_memory().await.unwrap();
        let repo = storage.commits();
        let agent_id = AgentId::new();

        let original = sample_commit(agent_id, "old-sha");
        repo.upsert(&original).await.unwrap();

        let found = repo
            .find_amended_predecessor(agent_id, original.authored_at, "new-sha")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.commit_sha, "old-sha");

        // The new SHA itself never matches.
        assert!(repo
            .find_amended_predecessor(agent_id, original.authored_at, "old-sha")
            .await
            .unwrap()
            .is_none());
    }
}
