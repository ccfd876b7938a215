//! Network error types

use thiserror::Error;

/// Errors that can occur while setting up or running a receive session
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("failed to bind UDP port {port}: {source}")]
    BindUdp {
        port: u16,
        source: std::io::Error,
    },

    #[error("failed to bind TCP port {port}: {source}")]
    BindTcp {
        port: u16,
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
