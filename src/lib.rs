//! trackerlink - cellular asset-tracker connectivity
//!
//! Moves device data between on-board producers and an MQTT broker over an
//! intermittent cellular link.
//!
//! # Overview
//!
//! Producers publish on a typed event bus:
//! - location fixes from a position source
//! - network attach state from the cellular manager
//! - free-form text lines from a serial port or stdin
//!
//! The transport coordinator observes the bus, buffers outbound data in
//! bounded queues and runs the broker link as a two-state machine. While
//! connected it drains the queues to the broker; firmware-update commands
//! from the broker are forwarded to the update manager. Unrecoverable faults
//! are escalated to the supervisor, which restarts the process.
//!
//! # Quick Start
//!
//! ```rust
//! use trackerlink::protocol::{LocationFix, LocationReport, Topics};
//!
//! let topics = Topics::derive("350457791234567", "data", 64).unwrap();
//! assert_eq!(topics.gps, "ind/350457791234567/gps");
//!
//! let fix = LocationFix {
//!     meas_id: 5,
//!     latitude: 59.91,
//!     longitude: 10.75,
//!     ..Default::default()
//! };
//! let json = LocationReport::from(&fix).to_json().unwrap();
//! assert!(json.contains("\"measId\":5"));
//! ```

pub mod bus;
pub mod config;
pub mod error;
pub mod fota;
pub mod modem;
pub mod observability;
pub mod producers;
pub mod protocol;
pub mod supervisor;
pub mod testing;
pub mod transport;
pub mod version;

pub use bus::{Bus, BusError, ChannelId, Observer, Subscriber, Topology};
pub use config::{ConfigError, GenericDispatch, TrackerConfig};
pub use error::{TrackerError, TrackerResult};
pub use protocol::*;
pub use supervisor::{FatalEscalator, Supervisor};
pub use transport::{BrokerClient, BrokerEvent, Coordinator, MqttBrokerClient, MqttError};
pub use version::FirmwareVersion;
