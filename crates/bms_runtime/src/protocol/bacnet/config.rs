//! BACnet/IP network settings

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::protocol::{AdapterError, AdapterResult};

/// Standard BACnet/IP UDP port (0xBAC0)
pub const BACNET_PORT: u16 = 47808;

/// Local BACnet/IP network configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacnetNetConfig {
    /// Interface to bind to (e.g., "0.0.0.0" for all interfaces)
    #[serde(default = "default_interface")]
    pub interface: String,
    /// UDP port discovery listens on; device sockets use ephemeral ports
    #[serde(default = "default_port")]
    pub port: u16,
    /// Broadcast address (e.g., "10.0.1.255" for subnet broadcast)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broadcast: Option<String>,
}

fn default_interface() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    BACNET_PORT
}

impl Default for BacnetNetConfig {
    fn default() -> Self {
        Self {
            interface: default_interface(),
            port: BACNET_PORT,
            broadcast: None,
        }
    }
}

impl BacnetNetConfig {
    /// Create config from environment variables
    ///
    /// Reads:
    /// - `BACNET_IP` or `BMS_BACNET_IP`: Bind address (default: 0.0.0.0)
    /// - `BACNET_PORT`: UDP port (default: 47808)
    /// - `BACNET_BROADCAST`: Broadcast address (default: 255.255.255.255)
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Apply environment overrides on top of file configuration
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(interface) =
            std::env::var("BACNET_IP").or_else(|_| std::env::var("BMS_BACNET_IP"))
        {
            self.interface = interface;
        }
        if let Some(port) = std::env::var("BACNET_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
        {
            self.port = port;
        }
        if let Ok(broadcast) = std::env::var("BACNET_BROADCAST") {
            self.broadcast = Some(broadcast);
        }
        self
    }

    /// Address Who-Is broadcasts are sent to
    pub fn broadcast_addr(&self) -> AdapterResult<SocketAddr> {
        let raw = self.broadcast.as_deref().unwrap_or("255.255.255.255");
        parse_endpoint(raw)
    }

    pub(crate) fn local_addr(&self, port: u16) -> AdapterResult<SocketAddr> {
        format!("{}:{}", self.interface, port)
            .parse()
            .map_err(|e| AdapterError::Transport(format!("invalid interface '{}': {}", self.interface, e)))
    }
}

/// Parse "ip" or "ip:port", defaulting to the standard port
pub fn parse_endpoint(raw: &str) -> AdapterResult<SocketAddr> {
    let with_port = if raw.contains(':') {
        raw.to_string()
    } else {
        format!("{}:{}", raw, BACNET_PORT)
    };
    with_port
        .parse()
        .map_err(|e| AdapterError::Transport(format!("invalid BACnet endpoint '{}': {}", raw, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_defaults_to_bacnet_port() {
        assert_eq!(
            parse_endpoint("10.0.1.50").unwrap(),
            "10.0.1.50:47808".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            parse_endpoint("10.0.1.50:47809").unwrap().port(),
            47809
        );
        assert!(parse_endpoint("not-an-ip").is_err());
    }

    #[test]
    fn test_default_broadcast() {
        let config = BacnetNetConfig::default();
        assert_eq!(
            config.broadcast_addr().unwrap(),
            "255.255.255.255:47808".parse::<SocketAddr>().unwrap()
        );
    }
}
