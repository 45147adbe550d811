//! Core domain types
//!
//! This module contains the core domain structures used across Gantry
//! services. These types represent the fundamental business entities and are
//! shared between the coordinator (which persists and dispatches them) and
//! the agent (which executes dispatch-time snapshots).

pub mod job;
pub mod mission;
pub mod slave;
