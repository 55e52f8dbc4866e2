//! Permission gate
//!
//! Sequences host-granted access before a session may open. At most one
//! request is in flight at a time; its answer arrives through a single-use
//! [`PermissionResponder`] that resumes the open sequence.

use crate::device::AccessoryManager;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

/// Outcome of [`PermissionGate::ensure`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionStatus {
    /// Permission was already granted and the continuation has run
    Granted,
    /// A request was issued; the continuation runs when it is granted
    Requested,
    /// Another request is still awaiting its answer; nothing was issued
    AlreadyPending,
}

type Continuation = Box<dyn FnOnce() + Send + 'static>;

/// Tracks the single in-flight permission request
pub struct PermissionGate {
    /// Id of the registered request, 0 when none
    active: Arc<AtomicU64>,
    next_id: AtomicU64,
}

impl PermissionGate {
    /// Create a gate with no request in flight
    pub fn new() -> Self {
        Self {
            active: Arc::new(AtomicU64::new(0)),
            next_id: AtomicU64::new(1),
        }
    }

    /// Run `on_granted` once access to `device` is granted
    ///
    /// Already granted: `on_granted` runs synchronously before this returns.
    /// Otherwise a request is registered and handed to the manager; the
    /// continuation runs on whatever thread answers the responder.
    pub fn ensure<M, F>(&self, manager: &M, device: &M::Device, on_granted: F) -> PermissionStatus
    where
        M: AccessoryManager + ?Sized,
        F: FnOnce() + Send + 'static,
    {
        if manager.has_permission(device) {
            debug!("Permission already granted for {:?}", device);
            on_granted();
            return PermissionStatus::Granted;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if self
            .active
            .compare_exchange(0, id, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(
                "Permission request already in flight, not asking again for {:?}",
                device
            );
            return PermissionStatus::AlreadyPending;
        }

        info!("Requesting permission for accessory {:?}", device);
        let responder = PermissionResponder {
            registration: Arc::clone(&self.active),
            id,
            device: format!("{:?}", device),
            on_granted: Some(Box::new(on_granted)),
        };
        manager.request_permission(device, responder);
        PermissionStatus::Requested
    }

    /// Whether a request is waiting for its answer
    pub fn is_pending(&self) -> bool {
        self.active.load(Ordering::Acquire) != 0
    }
}

impl Default for PermissionGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Single-use answer channel for one permission request
///
/// Consumed by [`respond`](Self::respond). Dropping it unanswered
/// unregisters the request so a later attempt can ask again.
pub struct PermissionResponder {
    registration: Arc<AtomicU64>,
    id: u64,
    device: String,
    on_granted: Option<Continuation>,
}

impl PermissionResponder {
    /// Deliver the host's answer
    pub fn respond(mut self, granted: bool) {
        let on_granted = self.on_granted.take();
        self.unregister();

        if !granted {
            warn!("Permission denied for accessory {}", self.device);
            return;
        }

        info!("Permission granted for accessory {}", self.device);
        if let Some(on_granted) = on_granted {
            on_granted();
        }
    }

    pub fn grant(self) {
        self.respond(true);
    }

    pub fn deny(self) {
        self.respond(false);
    }

    /// Clears the registration if it is still ours
    fn unregister(&self) -> bool {
        self.registration
            .compare_exchange(self.id, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl Drop for PermissionResponder {
    fn drop(&mut self) {
        if self.on_granted.is_some() && self.unregister() {
            debug!(
                "Permission request for {} dropped without an answer",
                self.device
            );
        }
    }
}

impl fmt::Debug for PermissionResponder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PermissionResponder")
            .field("id", &self.id)
            .field("device", &self.device)
            .field("answered", &self.on_granted.is_none())
            .finish()
    }
}
