//! Accessory connection engine
//!
//! Owns the lifecycle of a single accessory connection exposed as a duplex
//! byte stream:
//! - Permission sequencing before the device may be opened
//! - A dedicated read-loop thread per session
//! - The blocking write path
//! - Cooperative shutdown backed by closing the stream
//!
//! The platform side (discovery, permission records, opening the stream) is
//! supplied through the [`AccessoryManager`] trait; lifecycle notifications
//! go to an injected [`EngineListener`].

pub mod device;
pub mod engine;
pub mod listener;
pub mod permission;
pub mod test_utils;

pub use device::{AccessoryManager, AccessoryStream};
pub use engine::{ConnectionEngine, DEFAULT_BUFFER_SIZE, EngineConfig};
pub use listener::EngineListener;
pub use permission::{PermissionGate, PermissionResponder, PermissionStatus};
