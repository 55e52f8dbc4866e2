//! Common error types

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("USB error: {0}")]
    Usb(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Permission denied for {0}")]
    PermissionDenied(String),

    #[error("Accessory not connected")]
    NotConnected,

    #[error("Stream closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, Error>;
