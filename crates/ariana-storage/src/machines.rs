//! Machine reservation queue, custom machines, and access grants.

use anyhow::{anyhow, bail, Result};
use chrono::Utc;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use ariana_types::{
    AgentId, CustomMachine, MachineCoords, MachineId, Reservation, ReservationId,
    ReservationStatus, UserId,
};

use crate::time;

/// Repository over the `reservations` table.
#[derive(Debug, Clone)]
pub struct ReservationRepo {
    pool: SqlitePool,
}

impl ReservationRepo {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Enqueue a reservation for an agent.
    pub async fn insert(&self, agent_id: AgentId) -> Result<Reservation> {
        let reservation = Reservation {
            id: ReservationId::new(),
            agent_id,
            status: ReservationStatus::Queued,
            coords: None,
            created_at: Utc::now(),
        };
        sqlx::query(
            "INSERT INTO reservations (id, agent_id, status, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(reservation.id.to_string())
        .bind(agent_id.to_string())
        .bind(reservation.status.as_str())
        .bind(time::to_db(reservation.created_at))
        .execute(&self.pool)
        .await?;
        Ok(reservation)
    }

    /// Fetch one reservation.
    pub async fn get(&self, id: ReservationId) -> Result<Option<Reservation>> {
        let row = sqlx::query("SELECT * FROM reservations WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(reservation_from_row).transpose()
    }

    /// The agent's most recent non-terminal reservation, for reuse on
    /// provisioning retries.
    pub async fn open_for_agent(&self, agent_id: AgentId) -> Result<Option<Reservation>> {
        let row = sqlx::query(
            "SELECT * FROM reservations WHERE agent_id = ? AND status IN ('queued', 'assigned')
             ORDER BY created_at DESC LIMIT 1",
        )
        .bind(agent_id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(reservation_from_row).transpose()
    }

    /// Attach machine coordinates and mark the reservation assigned.
    /// Called by the pool allocator (or test harnesses standing in for it).
    pub async fn assign(&self, id: ReservationId, coords: &MachineCoords) -> Result<()> {
        sqlx::query(
            "UPDATE reservations SET status = 'assigned', machine_id = ?, machine_address = ?,
             machine_shared_key = ?, desktop_url = ?, desktop_token = ?
             WHERE id = ? AND status = 'queued'",
        )
        .bind(&coords.machine_id.0)
        .bind(&coords.address)
        .bind(&coords.shared_key)
        .bind(&coords.desktop_url)
        .bind(&coords.desktop_token)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Terminal transition: the agent took the machine.
    pub async fn mark_fulfilled(&self, id: ReservationId) -> Result<()> {
        self.mark(id, ReservationStatus::Fulfilled).await
    }

    /// Terminal transition: the reservation was abandoned.
    pub async fn mark_cancelled(&self, id: ReservationId) -> Result<()> {
        self.mark(id, ReservationStatus::Cancelled).await
    }

    /// Number of reservations still waiting for a machine.
    pub async fn count_queued(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM reservations WHERE status = 'queued'")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("n"))
    }

    /// Cancel every open reservation. Administrative cleanup.
    pub async fn cancel_all_open(&self) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE reservations SET status = 'cancelled'
             WHERE status IN ('queued', 'assigned')",
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn mark(&self, id: ReservationId, status: ReservationStatus) -> Result<()> {
        sqlx::query("UPDATE reservations SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn reservation_from_row(row: sqlx::sqlite::SqliteRow) -> Result<Reservation> {
    let id: String = row.get("id");
    let agent_id: String = row.get("agent_id");
    let coords = match row.get::<Option<String>, _>("machine_id") {
        Some(machine_id) => Some(MachineCoords {
            machine_id: MachineId(machine_id),
            address: row
                .get::<Option<String>, _>("machine_address")
                .ok_or_else(|| anyhow!("assigned reservation missing address"))?,
            shared_key: row
                .get::<Option<String>, _>("machine_shared_key")
                .ok_or_else(|| anyhow!("assigned reservation missing shared key"))?,
            desktop_url: row.get("desktop_url"),
            desktop_token: row.get("desktop_token"),
        }),
        None => None,
    };
    Ok(Reservation {
        id: ReservationId(Uuid::parse_str(&id)?),
        agent_id: AgentId(Uuid::parse_str(&agent_id)?),
        status: row.get::<String, _>("status").parse().map_err(|e: String| anyhow!(e))?,
        coords,
        created_at: time::from_db(&row.get::<String, _>("created_at"))?,
    })
}

/// Repository over the `custom_machines` table.
#[derive(Debug, Clone)]
pub struct MachineRepo {
    pool: SqlitePool,
}

impl MachineRepo {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Register a user-owned machine.
    pub async fn register(&self, machine: &CustomMachine) -> Result<()> {
        sqlx::query(
            "INSERT INTO custom_machines (machine_id, owner_user_id, address, shared_key, status)
             VALUES (?, ?, ?, ?, 'available')",
        )
        .bind(&machine.machine_id.0)
        .bind(machine.owner_user_id.to_string())
        .bind(&machine.address)
        .bind(&machine.shared_key)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Fetch one machine.
    pub async fn get(&self, machine_id: &MachineId) -> Result<Option<CustomMachine>> {
        let row = sqlx::query("SELECT * FROM custom_machines WHERE machine_id = ?")
            .bind(&machine_id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.map(machine_from_row).transpose()
    }

    /// The machine currently claimed by an agent, if any. Resume paths use
    /// this to re-acquire the same custom machine.
    pub async fn find_by_agent(&self, agent_id: AgentId) -> Result<Option<CustomMachine>> {
        let row = sqlx::query("SELECT * FROM custom_machines WHERE agent_id = ?")
            .bind(agent_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(machine_from_row).transpose()
    }

    /// Atomically claim a machine for an agent. Fails when the machine is
    /// owned by a different user or already in use by another agent.
    pub async fn claim(
        &self,
        machine_id: &MachineId,
        agent_id: AgentId,
        user_id: UserId,
    ) -> Result<MachineCoords> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT * FROM custom_machines WHERE machine_id = ?")
            .bind(&machine_id.0)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| anyhow!("machine {machine_id} not found"))?;
        let machine = machine_from_row(row)?;
        if machine.owner_user_id != user_id {
            bail!("machine {machine_id} belongs to a different user");
        }
        if machine.in_use && machine.agent_id != Some(agent_id) {
            bail!("machine {machine_id} is already in use");
        }
        sqlx::query(
            "UPDATE custom_machines SET status = 'in_use', agent_id = ? WHERE machine_id = ?",
        )
        .bind(agent_id.to_string())
        .bind(&machine_id.0)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(MachineCoords {
            machine_id: machine.machine_id,
            address: machine.address,
            shared_key: machine.shared_key,
            desktop_url: None,
            desktop_token: None,
        })
    }

    /// Release a machine back to its owner. Compensating action for
    /// provisioning failures.
    pub async fn release(&self, machine_id: &MachineId) -> Result<()> {
        sqlx::query(
            "UPDATE custom_machines SET status = 'available', agent_id = NULL WHERE machine_id = ?",
        )
        .bind(&machine_id.0)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Remove a machine registration.
    pub async fn delete(&self, machine_id: &MachineId) -> Result<()> {
        sqlx::query("DELETE FROM custom_machines WHERE machine_id = ?")
            .bind(&machine_id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Release every claimed machine. Administrative cleanup.
    pub async fn release_all(&self) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE custom_machines SET status = 'available', agent_id = NULL
             WHERE status = 'in_use'",
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Number of custom machines currently claimed.
    pub async fn count_in_use(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM custom_machines WHERE status = 'in_use'")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("n"))
    }
}

fn machine_from_row(row: sqlx::sqlite::SqliteRow) -> Result<CustomMachine> {
    let owner: String = row.get("owner_user_id");
    let agent_id = row
        .get::<Option<String>, _>("agent_id")
        .map(|s| Uuid::parse_str(&s).map(AgentId).map_err(|e| anyhow!("bad agent id: {e}")))
        .transpose()?;
    Ok(CustomMachine {
        machine_id: MachineId(row.get("machine_id")),
        owner_user_id: UserId(Uuid::parse_str(&owner)?),
        address: row.get("address"),
        shared_key: row.get("shared_key"),
        in_use: row.get::<String, _>("status") == "in_use",
        agent_id,
    })
}

/// Repository over the `agent_access` table.
#[derive(Debug, Clone)]
pub struct AccessRepo {
    pool: SqlitePool,
}

impl AccessRepo {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Grant a user write access to an agent. Idempotent.
    pub async fn grant_write(&self, user_id: UserId, agent_id: AgentId) -> Result<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO agent_access (user_id, agent_id, level) VALUES (?, ?, 'write')",
        )
        .bind(user_id.to_string())
        .bind(agent_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Whether a user has write access to an agent.
    pub async fn has_write(&self, user_id: UserId, agent_id: AgentId) -> Result<bool> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM agent_access
             WHERE user_id = ? AND agent_id = ? AND level = 'write'",
        )
        .bind(user_id.to_string())
        .bind(agent_id.to_string())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get::<i64, _>("n") > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Storage;

    fn coords(id: &str) -> MachineCoords {
        MachineCoords {
            machine_id: MachineId::from(id),
            address: "10.1.2.3".into(),
            shared_key: "secret".into(),
            desktop_url: None,
            desktop_token: None,
        }
    }

    #[tokio::test]
    async fn reservation_lifecycle() {
        let storage = Storage::in_memory().await.unwrap();
        let repo = storage.reservations();
        let agent_id = AgentId::new();

        let reservation = repo.insert(agent_id).await.unwrap();
        assert_eq!(reservation.status, ReservationStatus::Queued);

        repo.assign(reservation.id, &coords("m-9")).await.unwrap();
        let assigned = repo.get(reservation.id).await.unwrap().unwrap();
        assert_eq!(assigned.status, ReservationStatus::Assigned);
        assert_eq!(assigned.coords.unwrap().machine_id, MachineId::from("m-9"));

        repo.mark_fulfilled(reservation.id).await.unwrap();
        assert!(repo.open_for_agent(agent_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn custom_claim_rejects_other_users_and_double_claims() {
        let storage = Storage::in_memory().await.unwrap();
        let repo = storage.machines();
        let owner = UserId::new();
        let machine = CustomMachine {
            machine_id: MachineId::from("box-1"),
            owner_user_id: owner,
            address: "box-1.local".into(),
            shared_key: "key".into(),
            in_use: false,
            agent_id: None,
        };
        repo.register(&machine).await.unwrap();

        // Wrong user.
        assert!(repo
            .claim(&machine.machine_id, AgentId::new(), UserId::new())
            .await
            .is_err());

        let holder = AgentId::new();
        repo.claim(&machine.machine_id, holder, owner).await.unwrap();

        // Second agent cannot take it; the holder may re-claim.
        assert!(repo.claim(&machine.machine_id, AgentId::new(), owner).await.is_err());
        assert!(repo.claim(&machine.machine_id, holder, owner).await.is_ok());

        repo.release(&machine.machine_id).await.unwrap();
        assert!(repo.claim(&machine.machine_id, AgentId::new(), owner).await.is_ok());
    }

    #[tokio::test]
    async fn grants_are_idempotent() {
        let storage = Storage::in_memory().await.unwrap();
        let repo = storage.access();
        let user = UserId::new();
        let agent = AgentId::new();

        assert!(!repo.has_write(user, agent).await.unwrap());
        repo.grant_write(user, agent).await.unwrap();
        repo.grant_write(user, agent).await.unwrap();
        assert!(repo.has_write(user, agent).await.unwrap());
    }
}
