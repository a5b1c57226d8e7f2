//! TierStore Engine - context wiring and cooperative scheduling
//!
//! Builds every subsystem once from one configuration, wires the
//! cross-subsystem seams (backup catalog as the migration durability
//! guard, the monitor as the capacity alert sink, the recovery engine
//! as the integrity repair source), and drives the periodic cycles.

pub mod adapters;
pub mod context;
pub mod scheduler;

pub use context::{EngineContext, EngineStats};
pub use scheduler::PeriodicTask;
