//! Bus producers
//!
//! Each producer owns one source of device data and publishes it on its bus
//! channel: line-framed text from a serial port or stdin, location fixes and
//! packet-data attach events.

pub mod ingest;
pub mod location;
pub mod network;

pub use ingest::LineIngest;
pub use location::{FixSource, JsonLinesFixSource, LocationManager, LOCATION_PUBLISH_TIMEOUT};
pub use network::{NetworkReporter, PdnEvent, NETWORK_PUBLISH_TIMEOUT};
