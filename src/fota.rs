//! Firmware update requests
//!
//! The update manager observes the firmware-update channel. Each filename
//! received from the broker becomes a download request for
//! `<host>/files/<filename>`, handed to a [`FirmwareDownloader`]. Downloading
//! and installing the image is the downloader's business.

use crate::bus::{Bus, ChannelId, Subscriber};
use crate::protocol::FirmwareFilename;
use crate::supervisor::{FatalEscalator, GENERIC_FATAL_CODE};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Longest download location the downloader accepts
pub const MAX_LOCATION_LEN: usize = 128;

/// A validated firmware download request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateRequest {
    pub filename: String,
    pub location: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UpdateError {
    #[error("Firmware filename is empty")]
    EmptyFilename,
    #[error("Firmware filename '{0}' is not allowed")]
    InvalidFilename(String),
    #[error("Download location of {len} bytes exceeds {max} bytes")]
    LocationTooLong { len: usize, max: usize },
    #[error("Download failed to start: {0}")]
    DownloadFailed(String),
}

/// Build the download request for `filename` on `host`
pub fn download_request(
    host: &str,
    filename: &FirmwareFilename,
) -> Result<UpdateRequest, UpdateError> {
    let raw = std::str::from_utf8(filename.as_bytes()).map_err(|_| {
        UpdateError::InvalidFilename(String::from_utf8_lossy(filename.as_bytes()).into_owned())
    })?;
    let name = raw.trim_matches(|c: char| c.is_whitespace() || c == '\0');

    if name.is_empty() {
        return Err(UpdateError::EmptyFilename);
    }
    if name.contains("..") || name.starts_with('/') || name.contains('\\') {
        return Err(UpdateError::InvalidFilename(name.to_string()));
    }

    let location = format!("{}/files/{}", host.trim_end_matches('/'), name);
    if location.len() > MAX_LOCATION_LEN {
        return Err(UpdateError::LocationTooLong {
            len: location.len(),
            max: MAX_LOCATION_LEN,
        });
    }

    Ok(UpdateRequest {
        filename: name.to_string(),
        location,
    })
}

/// Starts firmware downloads
#[async_trait]
pub trait FirmwareDownloader: Send + Sync + 'static {
    async fn start(&self, request: &UpdateRequest) -> Result<(), UpdateError>;
}

/// Downloader that only records the request in the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingDownloader;

#[async_trait]
impl FirmwareDownloader for LoggingDownloader {
    async fn start(&self, request: &UpdateRequest) -> Result<(), UpdateError> {
        info!(
            filename = %request.filename,
            location = %request.location,
            "Firmware download requested"
        );
        Ok(())
    }
}

/// Observer of the firmware-update channel
pub struct UpdateManager {
    bus: Arc<Bus>,
    subscriber: Subscriber,
    downloader: Arc<dyn FirmwareDownloader>,
    escalator: FatalEscalator,
    host: String,
    read_timeout: Duration,
}

impl UpdateManager {
    pub fn new(
        bus: Arc<Bus>,
        subscriber: Subscriber,
        downloader: Arc<dyn FirmwareDownloader>,
        escalator: FatalEscalator,
        host: impl Into<String>,
        read_timeout: Duration,
    ) -> Self {
        Self {
            bus,
            subscriber,
            downloader,
            escalator,
            host: host.into(),
            read_timeout,
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(host = %self.host, "Update manager started");
        loop {
            let channel = tokio::select! {
                next = self.subscriber.wait(None) => match next {
                    Ok(channel) => channel,
                    Err(e) => {
                        warn!(error = %e, "Update manager inbox closed");
                        break;
                    }
                },
                _ = shutdown.changed() => break,
            };

            if channel != ChannelId::FirmwareUpdate {
                continue;
            }

            let filename = match self
                .subscriber
                .read(&self.bus.firmware_update, self.read_timeout)
                .await
            {
                Ok(filename) => filename,
                Err(e) => {
                    error!(error = %e, "Failed to read firmware update request");
                    self.escalator.escalate(GENERIC_FATAL_CODE).await;
                    return;
                }
            };

            match download_request(&self.host, &filename) {
                Ok(request) => {
                    if let Err(e) = self.downloader.start(&request).await {
                        error!(
                            error = %e,
                            location = %request.location,
                            "Firmware download failed to start"
                        );
                    }
                }
                Err(e) => warn!(error = %e, "Ignoring firmware update request"),
            }
        }
        info!("Update manager stopped");
    }
}
