//! Audio error types

use thiserror::Error;

/// Errors that can occur in the audio subsystem
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("no audio output device available")]
    NoOutputDevice,

    #[error("failed to open audio output: {0}")]
    DeviceOpenFailed(String),

    #[error("audio stream error: {0}")]
    StreamError(String),

    #[error("failed to spawn audio thread: {0}")]
    ThreadSpawn(#[from] std::io::Error),
}
