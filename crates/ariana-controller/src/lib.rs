#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **ariana-controller** – The agent lifecycle controller.
//!
//! This crate owns the per-agent state machine described in the data
//! model: `PROVISIONING → PROVISIONED → CLONING → READY → IDLE ⇄ RUNNING`,
//! with `ERROR` and `ARCHIVED` as resumable terminals. It provisions
//! worker machines through the pool, drives agents with a prompt pump,
//! ingests their conversation/commit/automation output, triggers
//! user-defined automations at lifecycle hooks, and reacts to failure
//! (dead machines, ghost agents) with bounded false positives.
//!
//! ## Architecture
//!
//! - [`AgentController`]: state machine, prompt pump, checkpoint gates,
//!   failure detection; the only writer of `Agent.state`.
//! - Poller (`poll_once`): parallel fan-out of conversation, automation,
//!   context, PR, and git-history ingestion with per-subsystem throttling.
//! - Tick loop (`run`): one poll + one state step per agent per tick,
//!   followed by the lifecycle-map sweeper.
//!
//! All per-agent mutable state lives in controller-instance maps; the
//! sweeper contract is the only way it is reclaimed.

pub mod config;
mod context;
mod controller;
mod poller;
mod state;
mod tick;

pub use config::ControllerConfig;
pub use controller::{AgentController, ControllerError, ControllerResult, CreateAgentRequest};
