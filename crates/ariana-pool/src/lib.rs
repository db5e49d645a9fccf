#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **ariana-pool** – Acquisition and release of worker machines.
//!
//! The pool is authoritative for who holds a machine. Pool machines are
//! handed out through a reservation queue the controller polls; custom
//! machines are claimed atomically in a storage transaction. The
//! controller must never assign or release machines outside this
//! interface.

use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::{debug, info, instrument};

use ariana_storage::Storage;
use ariana_types::{AgentId, MachineCoords, MachineId, Reservation, ReservationId,
    ReservationStatus, UserId};

/// Spacing of reservation-queue polls while waiting for assignment.
pub const RESERVATION_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Capacity and queue snapshot for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolMetrics {
    /// Agents currently holding a machine.
    pub active: i64,
    /// Configured machine cap.
    pub capacity: i64,
    /// Reservations still waiting in the queue.
    pub queued: i64,
}

/// Typed pool failures the controller pattern-matches on.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// The pool is at its machine cap; agent creation is refused upstream.
    #[error("machine pool at capacity ({active}/{capacity})")]
    AtCapacity {
        /// Machines in use.
        active: i64,
        /// Configured cap.
        capacity: i64,
    },

    /// The reservation was cancelled while waiting.
    #[error("reservation {0} was cancelled")]
    Cancelled(ReservationId),

    /// No assignment arrived within the caller's deadline.
    #[error("reservation {0} not assigned in time")]
    WaitTimeout(ReservationId),

    /// Storage-level failure.
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Result alias for pool operations.
pub type PoolResult<T> = std::result::Result<T, PoolError>;

/// Client over the machine pool: reservation queue plus custom machines.
#[derive(Debug, Clone)]
pub struct MachinePool {
    storage: Storage,
    capacity: i64,
}

impl MachinePool {
    /// Build a pool client with the `MAX_ACTIVE_MACHINES` cap.
    pub fn new(storage: Storage, capacity: i64) -> Self {
        Self { storage, capacity }
    }

    /// Number of agents currently holding machines.
    pub async fn get_active_count(&self) -> PoolResult<i64> {
        Ok(self.storage.agents().count_with_machine().await?)
    }

    /// Capacity/queue snapshot.
    pub async fn get_parking_metrics(&self) -> PoolResult<PoolMetrics> {
        Ok(PoolMetrics {
            active: self.storage.agents().count_with_machine().await?,
            capacity: self.capacity,
            queued: self.storage.reservations().count_queued().await?,
        })
    }

    /// Refuse new work when the cap is reached.
    pub async fn ensure_capacity(&self) -> PoolResult<()> {
        let active = self.get_active_count().await?;
        if active >= self.capacity {
            return Err(PoolError::AtCapacity { active, capacity: self.capacity });
        }
        Ok(())
    }

    /// Enqueue a reservation for the agent, reusing an open one if a
    /// previous provisioning attempt left it behind.
    pub async fn reserve(&self, agent_id: AgentId) -> PoolResult<Reservation> {
        if let Some(open) = self.storage.reservations().open_for_agent(agent_id).await? {
            debug!(%agent_id, reservation = %open.id, "reusing open reservation");
            return Ok(open);
        }
        let reservation = self.storage.reservations().insert(agent_id).await?;
        info!(%agent_id, reservation = %reservation.id, "reservation queued");
        Ok(reservation)
    }

    /// Poll the reservation row until the queue marks it `assigned`,
    /// returning the machine coordinates. `deadline` bounds the wait.
    #[instrument(skip(self))]
    pub async fn wait_for_assignment(
        &self,
        id: ReservationId,
        deadline: Duration,
    ) -> PoolResult<MachineCoords> {
        let started = Instant::now();
        loop {
            let reservation = self
                .storage
                .reservations()
                .get(id)
                .await?
                .ok_or_else(|| anyhow::anyhow!("reservation {id} disappeared"))?;
            match reservation.status {
                ReservationStatus::Assigned | ReservationStatus::Fulfilled => {
                    let coords = reservation
                        .coords
                        .ok_or_else(|| anyhow::anyhow!("assigned reservation {id} has no coords"))?;
                    info!(reservation = %id, machine = %coords.machine_id, "machine assigned");
                    return Ok(coords);
                }
                ReservationStatus::Cancelled => return Err(PoolError::Cancelled(id)),
                ReservationStatus::Queued => {}
            }
            if started.elapsed() >= deadline {
                return Err(PoolError::WaitTimeout(id));
            }
            sleep(RESERVATION_POLL_INTERVAL).await;
        }
    }

    /// Terminal transition: the agent took the machine.
    pub async fn fulfill(&self, id: ReservationId) -> PoolResult<()> {
        Ok(self.storage.reservations().mark_fulfilled(id).await?)
    }

    /// Terminal transition: abandon the reservation.
    pub async fn cancel(&self, id: ReservationId) -> PoolResult<()> {
        Ok(self.storage.reservations().mark_cancelled(id).await?)
    }

    /// Atomically claim a custom machine for an agent. Fails when the
    /// machine belongs to another user or is already in use.
    pub async fn claim_custom(
        &self,
        machine_id: &MachineId,
        agent_id: AgentId,
        user_id: UserId,
    ) -> PoolResult<MachineCoords> {
        Ok(self.storage.machines().claim(machine_id, agent_id, user_id).await?)
    }

    /// Atomic release; the compensating action for provisioning failure.
    pub async fn release(&self, machine_id: &MachineId) -> PoolResult<()> {
        Ok(self.storage.machines().release(machine_id).await?)
    }

    /// Remove a custom machine registration.
    pub async fn delete_machine(&self, machine_id: &MachineId) -> PoolResult<()> {
        Ok(self.storage.machines().delete(machine_id).await?)
    }

    /// Administrative reset: cancel open reservations, release claimed
    /// custom machines.
    pub async fn cleanup_all(&self) -> PoolResult<()> {
        let cancelled = self.storage.reservations().cancel_all_open().await?;
        let released = self.storage.machines().release_all().await?;
        info!(cancelled, released, "pool cleanup complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ariana_types::CustomMachine;

    async fn pool(capacity: i64) -> (MachinePool, Storage) {
        let storage = Storage::in_memory().await.unwrap();
        (MachinePool::new(storage.clone(), capacity), storage)
    }

    fn coords(id: &str) -> MachineCoords {
        MachineCoords {
            machine_id: MachineId::from(id),
            address: "10.0.0.1".into(),
            shared_key: "k".into(),
            desktop_url: None,
            desktop_token: None,
        }
    }

    #[tokio::test]
    async fn reserve_reuses_open_reservation() {
        let (pool, _storage) = pool(4).await;
        let agent_id = AgentId::new();

        let first = pool.reserve(agent_id).await.unwrap();
        let second = pool.reserve(agent_id).await.unwrap();
        assert_eq!(first.id, second.id);

        pool.cancel(first.id).await.unwrap();
        let third = pool.reserve(agent_id).await.unwrap();
        assert_ne!(first.id, third.id);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_polls_until_assigned() {
        let (pool, storage) = pool(4).await;
        let reservation = pool.reserve(AgentId::new()).await.unwrap();

        let assigner = {
            let storage = storage.clone();
            let id = reservation.id;
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                storage.reservations().assign(id, &coords("m-42")).await.unwrap();
            })
        };

        let coords = pool
            .wait_for_assignment(reservation.id, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(coords.machine_id, MachineId::from("m-42"));
        assigner.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn wait_times_out_on_empty_queue() {
        let (pool, _storage) = pool(4).await;
        let reservation = pool.reserve(AgentId::new()).await.unwrap();

        let err = pool
            .wait_for_assignment(reservation.id, Duration::from_secs(10))
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::WaitTimeout(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_reservation_aborts_wait() {
        let (pool, storage) = pool(4).await;
        let reservation = pool.reserve(AgentId::new()).await.unwrap();

        let canceller = {
            let storage = storage.clone();
            let id = reservation.id;
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(3)).await;
                storage.reservations().mark_cancelled(id).await.unwrap();
            })
        };

        let err = pool
            .wait_for_assignment(reservation.id, Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::Cancelled(_)));
        canceller.await.unwrap();
    }

    #[tokio::test]
    async fn capacity_check_counts_held_machines() {
        let (pool, storage) = pool(1).await;
        pool.ensure_capacity().await.unwrap();

        // One agent takes a machine; the pool is now full.
        let mut agent = ariana_types::Agent::provisioning(
            UserId::new(),
            ariana_types::ProjectId::new(),
            "holder".into(),
            "ariana/holder".into(),
            "acme/website".into(),
            ariana_types::MachineType::Pool,
            12,
        );
        agent.machine_id = Some(MachineId::from("m-1"));
        agent.machine_address = Some("10.0.0.1".into());
        agent.machine_shared_key = Some("k".into());
        storage.agents().insert(&agent).await.unwrap();

        let err = pool.ensure_capacity().await.unwrap_err();
        assert!(matches!(err, PoolError::AtCapacity { active: 1, capacity: 1 }));
    }

    #[tokio::test]
    async fn custom_claim_and_release_through_pool() {
        let (pool, storage) = pool(4).await;
        let owner = UserId::new();
        storage
            .machines()
            .register(&CustomMachine {
                machine_id: MachineId::from("box-7"),
                owner_user_id: owner,
                address: "box-7.local".into(),
                shared_key: "key".into(),
                in_use: false,
                agent_id: None,
            })
            .await
            .unwrap();

        let agent = AgentId::new();
        let coords = pool.claim_custom(&MachineId::from("box-7"), agent, owner).await.unwrap();
        assert_eq!(coords.address, "box-7.local");

        pool.release(&MachineId::from("box-7")).await.unwrap();
        assert!(pool.claim_custom(&MachineId::from("box-7"), AgentId::new(), owner).await.is_ok());
    }
}
