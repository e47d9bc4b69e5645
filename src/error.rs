//! Crate-level error type
//!
//! Each layer keeps its own error enum; [`TrackerError`] gathers them for
//! callers that drive several layers at once, such as the binary.

use crate::bus::BusError;
use crate::config::ConfigError;
use crate::fota::UpdateError;
use crate::protocol::{PayloadError, TopicError};
use crate::transport::MqttError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Topic error: {0}")]
    Topic(#[from] TopicError),

    #[error("Payload error: {0}")]
    Payload(#[from] PayloadError),

    #[error("Transport error: {0}")]
    Transport(#[from] MqttError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Update error: {0}")]
    Update(#[from] UpdateError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type TrackerResult<T> = Result<T, TrackerError>;

impl TrackerError {
    /// Whether retrying the same operation later may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            TrackerError::Bus(e) => e.is_timeout(),
            TrackerError::Transport(MqttError::NotConnected)
            | TrackerError::Transport(MqttError::PublishFailed(_))
            | TrackerError::Transport(MqttError::ConnectionFailed(_)) => true,
            _ => false,
        }
    }
}
