#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **ariana-bus** – Change-notification bus for the Ariana control plane.
//!
//! The poller and controller publish typed notifications here so that
//! subscription transports (websockets, server-sent events - out of scope)
//! can fan changes out to clients. The bus is in-memory, broadcast-only,
//! and lag-tolerant: slow subscribers miss events rather than slowing the
//! poll loop down.

use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use ariana_types::{AgentId, AgentState};

//─────────────────────────────
//  Events
//─────────────────────────────

/// Typed notification emitted after the controller or poller mutates
/// agent-visible state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[non_exhaustive]
pub enum AgentEvent {
    /// A poll cycle added or modified conversation rows.
    EventsChanged {
        /// Agent whose conversation changed.
        agent_id: AgentId,
        /// Row ids inserted this cycle.
        added_message_ids: Vec<i64>,
        /// Row ids updated in place this cycle.
        modified_message_ids: Vec<i64>,
    },
    /// The controller moved the agent to a new lifecycle state.
    StateChanged {
        /// Agent that transitioned.
        agent_id: AgentId,
        /// The state entered.
        state: AgentState,
    },
    /// Remaining context crossed a 10% threshold downward.
    ContextWarning {
        /// Agent concerned.
        agent_id: AgentId,
        /// Remaining context percentage at crossing time.
        remaining_percent: f64,
    },
}

//─────────────────────────────
//  Bus trait
//─────────────────────────────

/// Publish-subscribe seam between the controller and event transports.
///
/// Publishing must complete quickly and never block the caller; if
/// subscribers are slow or absent the bus drops events to keep the poll
/// loop responsive.
pub trait AgentEventBus: Send + Sync {
    /// Publish an event to all subscribers.
    fn publish(&self, event: &AgentEvent) -> Result<()>;

    /// Subscribe to the live event stream.
    fn subscribe(&self) -> broadcast::Receiver<AgentEvent>;
}

//─────────────────────────────
//  In-memory implementation
//─────────────────────────────

/// Broadcast-backed in-memory bus.
#[derive(Debug, Clone)]
pub struct InMemoryBus {
    tx: Arc<broadcast::Sender<AgentEvent>>,
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl InMemoryBus {
    /// Create a bus with the given ring-buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx: Arc::new(tx) }
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl AgentEventBus for InMemoryBus {
    fn publish(&self, event: &AgentEvent) -> Result<()> {
        // Lagging or absent receivers are not an error.
        let _ = self.tx.send(event.clone());
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_subscriber() {
        let bus = InMemoryBus::default();
        let mut rx = bus.subscribe();

        let event = AgentEvent::StateChanged {
            agent_id: AgentId::new(),
            state: AgentState::Idle,
        };
        bus.publish(&event).unwrap();

        assert_eq!(rx.recv().await.unwrap(), event);
    }

    #[test]
    fn publish_without_subscribers_is_ok() {
        let bus = InMemoryBus::default();
        let event = AgentEvent::ContextWarning {
            agent_id: AgentId::new(),
            remaining_percent: 58.0,
        };
        assert!(bus.publish(&event).is_ok());
    }
}
