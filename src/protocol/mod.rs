//! Device message types, topic derivation and broker wire documents
//!
//! `messages` holds the values carried on the event bus, `topics` derives the
//! broker namespace from the device identity and `wire` renders the JSON
//! documents the backend consumes.

pub mod messages;
pub mod topics;
pub mod wire;

pub use messages::*;
pub use topics::*;
pub use wire::*;
