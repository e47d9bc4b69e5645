//! JSON documents published to the broker
//!
//! Field order and value formatting are consumed by the backend as-is, so
//! every document is a serde struct whose declaration order is the wire order.

use crate::protocol::messages::LocationFix;
use serde::{Deserialize, Serialize};

/// Payload published as the last will on the login topic
pub const LAST_WILL_PAYLOAD: &str = r#"{"networkStatus":"offline"}"#;

/// Location fix as published on the `gps` topic
///
/// All measurements are strings with fixed precision; only `measId` is a
/// JSON number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationReport {
    #[serde(rename = "Latitude")]
    pub latitude: String,
    #[serde(rename = "Longitude")]
    pub longitude: String,
    #[serde(rename = "Altitude")]
    pub altitude: String,
    #[serde(rename = "Accuracy")]
    pub accuracy: String,
    #[serde(rename = "Speed")]
    pub speed: String,
    #[serde(rename = "Speed accuracy")]
    pub speed_accuracy: String,
    #[serde(rename = "Heading")]
    pub heading: String,
    #[serde(rename = "Date")]
    pub date: String,
    #[serde(rename = "Time")]
    pub time: String,
    #[serde(rename = "PDOP")]
    pub pdop: String,
    #[serde(rename = "HDOP")]
    pub hdop: String,
    #[serde(rename = "VDOP")]
    pub vdop: String,
    #[serde(rename = "TDOP")]
    pub tdop: String,
    #[serde(rename = "measId")]
    pub meas_id: u32,
}

impl From<&LocationFix> for LocationReport {
    fn from(fix: &LocationFix) -> Self {
        Self {
            latitude: format!("{:.6}", fix.latitude),
            longitude: format!("{:.6}", fix.longitude),
            altitude: format!("{:.1}", fix.altitude),
            accuracy: format!("{:.1}", fix.accuracy),
            speed: format!("{:.1}", fix.speed),
            speed_accuracy: format!("{:.1}", fix.speed_accuracy),
            heading: format!("{:.1}", fix.heading),
            date: fix.timestamp.format("%Y-%m-%d").to_string(),
            time: fix.timestamp.format("%H:%M:%S%.3f").to_string(),
            pdop: format!("{:.1}", fix.pdop),
            hdop: format!("{:.1}", fix.hdop),
            vdop: format!("{:.1}", fix.vdop),
            tdop: format!("{:.1}", fix.tdop),
            meas_id: fix.meas_id,
        }
    }
}

impl LocationReport {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Cellular parameters read from the modem for the login message
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellularSnapshot {
    #[serde(default)]
    pub rsrp: i32,
    #[serde(default)]
    pub iccid: String,
    #[serde(default)]
    pub mcc: u16,
    #[serde(default)]
    pub mnc: String,
    #[serde(default)]
    pub cell_id: String,
    #[serde(default)]
    pub band: u32,
    #[serde(default)]
    pub area_code: String,
    #[serde(default)]
    pub operator: String,
    #[serde(default)]
    pub modem_firmware: String,
}

/// Document published on the login topic after every successful connect
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginMessage {
    pub network_status: String,
    pub rsrp: i32,
    pub iccid: String,
    pub mcc: String,
    pub mnc: String,
    pub cid: String,
    pub band: String,
    pub area_code: String,
    pub op: String,
    pub modem: String,
    pub fw: String,
}

impl LoginMessage {
    /// Build an `online` login message from modem parameters
    ///
    /// The mobile country code is rendered in hex, matching what the backend
    /// has always received from deployed units.
    pub fn online(snapshot: &CellularSnapshot, firmware: &str) -> Self {
        Self {
            network_status: "online".to_string(),
            rsrp: snapshot.rsrp,
            iccid: snapshot.iccid.clone(),
            mcc: format!("{:x}", snapshot.mcc),
            mnc: snapshot.mnc.clone(),
            cid: snapshot.cell_id.clone(),
            band: snapshot.band.to_string(),
            area_code: snapshot.area_code.clone(),
            op: snapshot.operator.clone(),
            modem: snapshot.modem_firmware.clone(),
            fw: firmware.to_string(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
