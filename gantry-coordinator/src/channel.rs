//! Coordinator-side channel handles
//!
//! Each accepted agent connection gets one [`Channel`]: a cloneable handle
//! over the connection's outgoing message queue. The transport task that owns
//! the socket drains the queue; the slave registry holds the handle to push
//! job starts and to shut the connection down. A channel binds to at most one
//! slave for its whole lifetime.

use std::sync::{Mutex, PoisonError};

use gantry_core::protocol::CoordinatorMessage;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel is already bound to slave {0}")]
    AlreadyBound(String),
    #[error("channel is closed")]
    Closed,
}

/// What the connection's writer task pulls off the queue.
#[derive(Debug)]
pub enum Outgoing {
    Message(CoordinatorMessage),
    Shutdown,
}

/// Write side of one agent connection.
#[derive(Debug)]
pub struct Channel {
    queue: mpsc::UnboundedSender<Outgoing>,
    bound_to: Mutex<Option<String>>,
}

impl Channel {
    pub fn new(queue: mpsc::UnboundedSender<Outgoing>) -> Self {
        Self {
            queue,
            bound_to: Mutex::new(None),
        }
    }

    /// Queue a message for the agent. Fails only once the connection is gone.
    pub fn send(&self, message: CoordinatorMessage) -> Result<(), ChannelError> {
        self.queue
            .send(Outgoing::Message(message))
            .map_err(|_| ChannelError::Closed)
    }

    /// Ask the writer task to flush what is queued and close the socket.
    pub fn close(&self) {
        let _ = self.queue.send(Outgoing::Shutdown);
    }

    /// Record which slave this channel serves. A channel binds once; a
    /// second bind is refused no matter which slave asks.
    pub fn bind(&self, slave: &str) -> Result<(), ChannelError> {
        let mut bound = self
            .bound_to
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = bound.as_ref() {
            return Err(ChannelError::AlreadyBound(existing.clone()));
        }
        *bound = Some(slave.to_string());
        Ok(())
    }

    pub fn bound_to(&self) -> Option<String> {
        self.bound_to
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
