//! Message types carried on the device event bus
//!
//! Each bus channel carries exactly one of these value types. Messages are
//! plain values: producers build them, the bus stores a copy, consumers read
//! a copy back.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Capacity of a generic payload buffer in bytes
pub const GENERIC_PAYLOAD_CAPACITY: usize = 700;

/// A single satellite fix as produced by the location manager
///
/// # Examples
/// ```
/// use trackerlink::protocol::LocationFix;
///
/// let fix = LocationFix {
///     meas_id: 5,
///     latitude: 59.91,
///     longitude: 10.75,
///     ..Default::default()
/// };
/// assert_eq!(fix.meas_id, 5);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationFix {
    /// Monotonically increasing measurement id
    #[serde(default)]
    pub meas_id: u32,
    /// Latitude in degrees
    pub latitude: f64,
    /// Longitude in degrees
    pub longitude: f64,
    /// Altitude above WGS-84 ellipsoid in meters
    #[serde(default)]
    pub altitude: f32,
    /// Horizontal accuracy in meters
    #[serde(default)]
    pub accuracy: f32,
    /// Horizontal speed in m/s
    #[serde(default)]
    pub speed: f32,
    /// Speed accuracy in m/s
    #[serde(default)]
    pub speed_accuracy: f32,
    /// Heading in degrees
    #[serde(default)]
    pub heading: f32,
    /// UTC time of the fix, millisecond precision
    #[serde(default = "unix_epoch")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub pdop: f32,
    #[serde(default)]
    pub hdop: f32,
    #[serde(default)]
    pub vdop: f32,
    #[serde(default)]
    pub tdop: f32,
}

fn unix_epoch() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}

impl Default for LocationFix {
    fn default() -> Self {
        Self {
            meas_id: 0,
            latitude: 0.0,
            longitude: 0.0,
            altitude: 0.0,
            accuracy: 0.0,
            speed: 0.0,
            speed_accuracy: 0.0,
            heading: 0.0,
            timestamp: unix_epoch(),
            pdop: 0.0,
            hdop: 0.0,
            vdop: 0.0,
            tdop: 0.0,
        }
    }
}

/// Bounded text payload forwarded verbatim to the generic data topic
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GenericPayload(String);

impl GenericPayload {
    /// Build a payload, rejecting text that does not fit the buffer
    pub fn new(text: impl Into<String>) -> Result<Self, PayloadError> {
        let text = text.into();
        if text.len() > GENERIC_PAYLOAD_CAPACITY {
            return Err(PayloadError::TooLong {
                len: text.len(),
                capacity: GENERIC_PAYLOAD_CAPACITY,
            });
        }
        Ok(Self(text))
    }

    /// Build a payload, cutting the text at the last char boundary that fits
    pub fn truncated(text: &str) -> Self {
        if text.len() <= GENERIC_PAYLOAD_CAPACITY {
            return Self(text.to_string());
        }
        let mut end = GENERIC_PAYLOAD_CAPACITY;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        Self(text[..end].to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

/// Packet-data attach state reported by the cellular manager
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkStatus {
    #[default]
    Disconnected,
    Connected,
}

/// Name of a firmware image requested by the broker
///
/// The buffer is reference counted so redirecting a broker message onto the
/// bus never copies the bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FirmwareFilename(pub Bytes);

impl FirmwareFilename {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&'static str> for FirmwareFilename {
    fn from(value: &'static str) -> Self {
        Self(Bytes::from_static(value.as_bytes()))
    }
}

/// Opaque code carried on the fatal-error channel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FatalError(pub i32);

/// Payload construction errors
#[derive(Debug, Error, PartialEq)]
pub enum PayloadError {
    #[error("Payload of {len} bytes exceeds buffer capacity of {capacity} bytes")]
    TooLong { len: usize, capacity: usize },
}
