#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **ariana-types** – Shared data model for the Ariana agent control plane.
//!
//! The crate is dependency-light and sits at the very bottom of the crate
//! graph so that *every* other crate can depend on it without causing cycles.
//! It defines the entities the controller persists (agents, prompts,
//! messages, commits, automations, reservations) and the wire types the
//! worker daemon exchanges with the control plane. It intentionally makes
//! no assumptions about I/O, cryptography, or storage.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

pub mod agent;
pub mod automation;
pub mod commit;
pub mod machine;
pub mod message;
pub mod prompt;
pub mod wire;

pub use agent::{Agent, AgentState, InvalidTransition, MachineType, PullRequestState};
pub use automation::{
    Automation, AutomationEvent, AutomationEventStatus, AutomationTrigger, ContextEvent,
    ContextEventKind, ScriptLanguage, TriggerType,
};
pub use commit::Commit;
pub use machine::{CustomMachine, MachineCoords, Reservation, ReservationStatus};
pub use message::{MessageRole, StoredMessage, ToolCall};
pub use prompt::{ModelKind, Prompt, PromptStatus};

//─────────────────────────────
//  Limits
//─────────────────────────────

/// Maximum accepted prompt length, to bound queue rows.
pub const MAX_PROMPT_LEN: usize = 100_000;

/// Maximum accepted agent display-name length.
pub const MAX_AGENT_NAME_LEN: usize = 256;

//─────────────────────────────
//  Identifiers
//─────────────────────────────

macro_rules! uuid_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Generate a fresh random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }
    };
}

uuid_id!(
    /// Identifier of an agent (the unit of work this plane manages).
    AgentId
);
uuid_id!(
    /// Identifier of a queued prompt; doubles as the *task id* once running.
    PromptId
);
uuid_id!(
    /// Identifier of a user-defined automation.
    AutomationId
);
uuid_id!(
    /// Identifier of a row in the machine reservation queue.
    ReservationId
);
uuid_id!(
    /// Identifier of a user account.
    UserId
);
uuid_id!(
    /// Identifier of a project (the owner of repositories and automations).
    ProjectId
);

/// Opaque identifier of a worker machine, assigned by the pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MachineId(pub String);

impl fmt::Display for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for MachineId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_serialize_transparently() {
        let id = AgentId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.0));
        let back: AgentId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn machine_id_is_opaque_text() {
        let id = MachineId::from("fly-7f3a");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"fly-7f3a\"");
    }
}
