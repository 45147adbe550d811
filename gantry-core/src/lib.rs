//! Gantry Core
//!
//! Core types and abstractions shared by the Gantry coordinator and agent.
//!
//! This crate contains:
//! - Domain types: missions, jobs, slaves, and recurring schedules
//! - Protocol: the typed messages exchanged over a coordinator/agent channel
//! - Envelope: the success/error envelope consumed by the request surface

pub mod collection;
pub mod domain;
pub mod envelope;
pub mod protocol;
