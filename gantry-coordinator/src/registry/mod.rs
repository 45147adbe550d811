//! In-memory registries
//!
//! Authoritative coordinator state: missions with their job histories and the
//! dispatch queue, and the slave roster with live connection state. Each
//! registry owns its write path; every mutation writes through to the store
//! and emits a push notification.

pub mod mission;
pub mod slave;
