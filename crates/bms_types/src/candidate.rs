//! Discovery candidates

use serde::{Deserialize, Serialize};

use crate::{DeviceAddress, Protocol};

/// A device seen on the wire during discovery, not yet registered
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub protocol: Protocol,
    pub address: DeviceAddress,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vendor_id: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_apdu: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segmentation: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Candidate {
    pub fn new(address: DeviceAddress) -> Self {
        Self {
            protocol: address.protocol(),
            address,
            vendor_id: None,
            max_apdu: None,
            segmentation: None,
            name: None,
        }
    }

    /// Identity used to deduplicate replies
    pub fn identity(&self) -> String {
        match &self.address {
            DeviceAddress::Bacnet(a) => format!("bacnet:{}", a.instance),
            DeviceAddress::Modbus(a) => match &a.transport {
                Some(t) => format!("modbus:{}@{}", a.unit_id, t),
                None => format!("modbus:{}", a.unit_id),
            },
        }
    }
}
