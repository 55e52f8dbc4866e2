//! Lifecycle listener contract

use bytes::Bytes;
use common::{EventSender, LifecycleEvent};
use tracing::warn;

/// Receives lifecycle notifications from the connection engine
///
/// Every method runs on the read-loop thread except
/// [`on_device_disconnected`](Self::on_device_disconnected), which runs on
/// whichever thread delivered the detach signal.
pub trait EngineListener: Send + Sync {
    fn on_connection_established(&self);

    fn on_device_disconnected(&self);

    fn on_connection_closed(&self);

    /// Data read from the accessory
    ///
    /// `buffer` is the read loop's reused buffer; only `buffer[..length]` was
    /// filled by this read, the rest holds stale bytes.
    fn on_data_received(&self, buffer: &[u8], length: usize);
}

/// Forwards lifecycle events into the Tokio side of the event bridge
impl EngineListener for EventSender {
    fn on_connection_established(&self) {
        if let Err(e) = self.send_event(LifecycleEvent::ConnectionEstablished) {
            warn!("Dropping ConnectionEstablished event: {}", e);
        }
    }

    fn on_device_disconnected(&self) {
        if let Err(e) = self.try_send_event(LifecycleEvent::DeviceDisconnected) {
            warn!("Dropping DeviceDisconnected event: {}", e);
        }
    }

    fn on_connection_closed(&self) {
        if let Err(e) = self.send_event(LifecycleEvent::ConnectionClosed) {
            warn!("Dropping ConnectionClosed event: {}", e);
        }
    }

    fn on_data_received(&self, buffer: &[u8], length: usize) {
        let data = Bytes::copy_from_slice(&buffer[..length.min(buffer.len())]);
        if let Err(e) = self.send_event(LifecycleEvent::DataReceived { data }) {
            warn!("Dropping {} received bytes: {}", length, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::create_event_bridge;

    #[test]
    fn test_data_copies_only_valid_prefix() {
        let (sender, receiver) = create_event_bridge(4);
        let buffer = [1u8, 2, 3, 0xFF, 0xFF];

        sender.on_data_received(&buffer, 3);

        assert_eq!(
            receiver.try_recv_event(),
            Some(LifecycleEvent::DataReceived {
                data: Bytes::from_static(&[1, 2, 3])
            })
        );
    }

    #[test]
    fn test_detach_does_not_block_on_full_channel() {
        let (sender, receiver) = create_event_bridge(1);
        sender.on_connection_established();

        // Channel is full; must return instead of blocking
        sender.on_device_disconnected();

        assert_eq!(receiver.pending(), 1);
    }

    #[test]
    fn test_closed_receiver_is_not_fatal() {
        let (sender, receiver) = create_event_bridge(1);
        drop(receiver);

        sender.on_connection_established();
        sender.on_connection_closed();
        sender.on_data_received(&[0u8; 8], 8);
    }
}
