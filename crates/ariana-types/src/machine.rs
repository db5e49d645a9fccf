//! Machine reservations and coordinates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{AgentId, MachineId, ReservationId, UserId};

/// Status of a row in the machine reservation queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReservationStatus {
    /// Waiting for the pool to assign a machine.
    Queued,
    /// A machine has been attached; the agent may take it.
    Assigned,
    /// The agent took the machine; terminal.
    Fulfilled,
    /// Abandoned before assignment; terminal.
    Cancelled,
}

impl ReservationStatus {
    /// Stable storage representation.
    pub fn as_str(self) -> &'static str {
        match self {
            ReservationStatus::Queued => "queued",
            ReservationStatus::Assigned => "assigned",
            ReservationStatus::Fulfilled => "fulfilled",
            ReservationStatus::Cancelled => "cancelled",
        }
    }
}

impl std::str::FromStr for ReservationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(ReservationStatus::Queued),
            "assigned" => Ok(ReservationStatus::Assigned),
            "fulfilled" => Ok(ReservationStatus::Fulfilled),
            "cancelled" => Ok(ReservationStatus::Cancelled),
            other => Err(format!("unknown reservation status: {other}")),
        }
    }
}

/// Coordinates of an assigned worker machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineCoords {
    /// Pool-assigned machine id.
    pub machine_id: MachineId,
    /// Hostname or IP the worker daemon listens on.
    pub address: String,
    /// Shared secret authenticating RPC to this machine.
    pub shared_key: String,
    /// Remote-desktop URL, when the machine exposes one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub desktop_url: Option<String>,
    /// Remote-desktop access token.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub desktop_token: Option<String>,
}

/// A user-registered worker machine outside the pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomMachine {
    /// User-chosen machine id.
    pub machine_id: MachineId,
    /// Registering user; only their agents may claim the machine.
    pub owner_user_id: UserId,
    /// Hostname or IP the worker daemon listens on.
    pub address: String,
    /// Shared secret authenticating RPC to this machine.
    pub shared_key: String,
    /// Whether an agent currently holds the machine.
    pub in_use: bool,
    /// The holding agent, when in use.
    pub agent_id: Option<AgentId>,
}

/// A row in the machine-pool reservation queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reservation {
    /// Unique identifier.
    pub id: ReservationId,
    /// Agent the reservation is for.
    pub agent_id: AgentId,
    /// Queue status.
    pub status: ReservationStatus,
    /// Machine coordinates, present once `Assigned`.
    pub coords: Option<MachineCoords>,
    /// Enqueue time.
    pub created_at: DateTime<Utc>,
}
