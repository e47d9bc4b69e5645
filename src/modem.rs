//! Cellular modem information source
//!
//! The coordinator reads the identity once for topic derivation and a fresh
//! parameter snapshot on every network status change for the login message.

use crate::protocol::CellularSnapshot;

/// Read access to modem identity and radio parameters
pub trait ModemInfo: Send + Sync + 'static {
    /// Unique device identity (the IMEI on cellular hardware)
    fn identity(&self) -> String;

    /// Current radio and SIM parameters
    fn snapshot(&self) -> CellularSnapshot;
}

/// Modem information fixed at startup, typically from configuration
#[derive(Debug, Clone)]
pub struct StaticModem {
    identity: String,
    snapshot: CellularSnapshot,
}

impl StaticModem {
    pub fn new(identity: impl Into<String>, snapshot: CellularSnapshot) -> Self {
        Self {
            identity: identity.into(),
            snapshot,
        }
    }
}

impl ModemInfo for StaticModem {
    fn identity(&self) -> String {
        self.identity.clone()
    }

    fn snapshot(&self) -> CellularSnapshot {
        self.snapshot.clone()
    }
}
