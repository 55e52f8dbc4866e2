//! Async channel bridge between the read-loop thread and Tokio runtime

use async_channel::{Receiver, Sender, bounded};
use bytes::Bytes;

/// Lifecycle events emitted by the connection engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// Stream opened and read loop running
    ConnectionEstablished,

    /// Environment reported the accessory as physically detached
    DeviceDisconnected,

    /// Session ended and its resources were released
    ConnectionClosed,

    /// Bytes read from the accessory
    DataReceived {
        /// Copy of the valid part of the read buffer
        data: Bytes,
    },
}

/// Handle for the read-loop thread (blocking)
#[derive(Clone)]
pub struct EventSender {
    event_tx: Sender<LifecycleEvent>,
}

impl EventSender {
    /// Send an event to the Tokio runtime (blocking)
    pub fn send_event(&self, event: LifecycleEvent) -> crate::Result<()> {
        self.event_tx
            .send_blocking(event)
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Send an event without blocking
    ///
    /// Used from contexts that must not block, such as detach signals
    /// delivered on the Tokio runtime.
    pub fn try_send_event(&self, event: LifecycleEvent) -> crate::Result<()> {
        self.event_tx
            .try_send(event)
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }
}

/// Handle for Tokio runtime (async)
#[derive(Clone)]
pub struct EventReceiver {
    event_rx: Receiver<LifecycleEvent>,
}

impl EventReceiver {
    /// Receive the next lifecycle event
    pub async fn recv_event(&self) -> crate::Result<LifecycleEvent> {
        self.event_rx
            .recv()
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Try to receive an event without waiting
    pub fn try_recv_event(&self) -> Option<LifecycleEvent> {
        self.event_rx.try_recv().ok()
    }

    /// Number of events waiting to be received
    pub fn pending(&self) -> usize {
        self.event_rx.len()
    }
}

/// Create the channel bridge between the read loop and Tokio
///
/// Returns (EventSender for the engine side, EventReceiver for Tokio)
pub fn create_event_bridge(capacity: usize) -> (EventSender, EventReceiver) {
    let (event_tx, event_rx) = bounded(capacity.max(1));

    (EventSender { event_tx }, EventReceiver { event_rx })
}
