//! Platform abstractions for accessory discovery and I/O

use crate::permission::PermissionResponder;
use common::Result;
use std::fmt::Debug;

/// Duplex byte stream over an opened accessory
///
/// All methods take `&self`: the read-loop thread reads while other threads
/// write or close. Implementations must make `close` unblock a concurrent
/// `read`, which then returns an error. `close` may be called more than once.
pub trait AccessoryStream: Send + Sync + 'static {
    /// Blocking read into `buf`, returning the number of bytes read
    ///
    /// `Ok(0)` is end of stream.
    fn read(&self, buf: &mut [u8]) -> Result<usize>;

    /// Blocking write of the whole of `data`
    fn write_all(&self, data: &[u8]) -> Result<()>;

    /// Release the stream and its underlying resources
    ///
    /// Must return promptly even while a read is in flight; it is called
    /// from `shutdown` on the caller's thread.
    fn close(&self) -> Result<()>;
}

/// Environment that discovers accessories, records permission and opens streams
pub trait AccessoryManager: Send + Sync + 'static {
    /// Opaque reference to a discovered accessory
    type Device: Clone + Debug + Send + Sync + 'static;

    /// Stream produced by [`AccessoryManager::open`]
    type Stream: AccessoryStream;

    /// Whether the host has already granted access to `device`
    fn has_permission(&self, device: &Self::Device) -> bool;

    /// Ask the host for access to `device`
    ///
    /// Must not block. The answer is delivered later through `responder`;
    /// dropping the responder without answering abandons the request.
    fn request_permission(&self, device: &Self::Device, responder: PermissionResponder);

    /// Open the duplex stream for `device`
    fn open(&self, device: &Self::Device) -> Result<Self::Stream>;
}
