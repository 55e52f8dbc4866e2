//! Common utilities for rust-aoa
//!
//! This crate provides shared functionality between the connection engine and
//! the host binary: error handling, logging setup, and the channel bridge that
//! carries lifecycle events from the blocking read-loop thread into Tokio.

pub mod channel;
pub mod error;
pub mod logging;

pub use channel::{EventReceiver, EventSender, LifecycleEvent, create_event_bridge};
pub use error::{Error, Result};
pub use logging::setup_logging;
