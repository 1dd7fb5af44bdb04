//! Agent process supervisor.
//!
//! Spawns one long-lived AI coding agent CLI process per agent, normalizes
//! its NDJSON stdout into [`shared_types::StandardEvent`]s, restarts crashed
//! agents within a budget and reconciles statuses after a supervisor restart.

pub mod adapter;
pub mod adapters;
pub mod api;
pub mod config;
pub mod console;
pub mod crash;
pub mod decoder;
pub mod error;
pub mod observer;
pub mod persistence;
pub mod process;
pub mod protocol;
pub mod reconciler;
pub mod registry;
pub mod restart;
mod state;
pub mod stopper;
pub mod supervisor;
pub mod watchdog;

pub use error::{Result, SupervisorError};
pub use state::AppState;
pub use supervisor::AgentSupervisor;
