//! Configuration management.
//!
//! Connection parameters for devices are declared in TOML, one table per
//! device, and deserialized into [`ConnectionConfig`]. The parameters are
//! mutually exclusive and checked in priority order (network address, telnet
//! host, HTTP request address, GPIB, USB), so exactly one selection yields
//! exactly one transport driver.
//!
//! ```toml
//! log_level = "info"
//!
//! [devices.dac]
//! network_address = "192.168.0.40"
//!
//! [devices.magnet_psu]
//! host_address = "192.168.0.41"
//!
//! [devices.multimeter]
//! gpib_pad = 22
//! ```

use crate::device::tcp::DEFAULT_SCPI_PORT;
use crate::device::telnet::DEFAULT_TELNET_PORT;
use crate::error::{AppResult, SweepError};
use config::Config;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

fn default_timeout_ms() -> u64 {
    2_000
}

fn default_max_timeout_ms() -> u64 {
    15_000
}

/// Connection parameters for one device.
///
/// Exactly one of the address fields should be set; `select()` applies the
/// priority order when several are.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ConnectionConfig {
    /// Ethernet instrument address (SCPI socket / VISA-over-TCPIP role).
    pub network_address: Option<String>,
    /// Telnet host address.
    pub host_address: Option<String>,
    /// HTTP command endpoint address.
    pub request_address: Option<String>,
    /// GPIB board index.
    #[serde(default)]
    pub gpib_board: u8,
    /// GPIB primary address; presence selects the GPIB transport.
    pub gpib_pad: Option<u8>,
    /// GPIB secondary address.
    #[serde(default)]
    pub gpib_sad: u8,
    /// Raw VISA USB resource string.
    pub usb_resource: Option<String>,
    /// TCP/telnet port override.
    pub port: Option<u16>,
    /// Transport I/O timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Maximum wait for operation-complete polling, in milliseconds.
    #[serde(default = "default_max_timeout_ms")]
    pub max_timeout_ms: u64,
}

/// The transport driver a configuration resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportSelection {
    Tcp { host: String, port: u16 },
    Telnet { host: String, port: u16 },
    Http { address: String },
    Gpib { board: u8, pad: u8, sad: u8 },
    VisaUsb { resource: String },
}

impl ConnectionConfig {
    /// Resolve the connection parameters to a transport, in priority order.
    pub fn select(&self) -> AppResult<TransportSelection> {
        if let Some(host) = &self.network_address {
            Ok(TransportSelection::Tcp {
                host: host.clone(),
                port: self.port.unwrap_or(DEFAULT_SCPI_PORT),
            })
        } else if let Some(host) = &self.host_address {
            Ok(TransportSelection::Telnet {
                host: host.clone(),
                port: self.port.unwrap_or(DEFAULT_TELNET_PORT),
            })
        } else if let Some(address) = &self.request_address {
            Ok(TransportSelection::Http {
                address: address.clone(),
            })
        } else if let Some(pad) = self.gpib_pad {
            Ok(TransportSelection::Gpib {
                board: self.gpib_board,
                pad,
                sad: self.gpib_sad,
            })
        } else if let Some(resource) = &self.usb_resource {
            Ok(TransportSelection::VisaUsb {
                resource: resource.clone(),
            })
        } else {
            Err(SweepError::Configuration(
                "either a network, host, request, GPIB, or USB address must be specified"
                    .to_string(),
            ))
        }
    }

    /// Transport I/O timeout.
    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Maximum wait for operation-complete polling.
    pub fn operation_complete_timeout(&self) -> Duration {
        Duration::from_millis(self.max_timeout_ms)
    }
}

/// Top-level settings for a measurement rig.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub devices: HashMap<String, ConnectionConfig>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Settings {
    /// Load settings from `config/<name>.toml` (default: `config/default`).
    pub fn new(config_name: Option<&str>) -> AppResult<Self> {
        let config_path = format!("config/{}", config_name.unwrap_or("default"));
        let s = Config::builder()
            .add_source(config::File::with_name(&config_path))
            .build()?;

        let settings: Settings = s.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Check that every declared device resolves to a transport.
    pub fn validate(&self) -> AppResult<()> {
        for (name, connection) in &self.devices {
            connection
                .select()
                .map_err(|e| SweepError::Configuration(format!("device '{}': {}", name, e)))?;
        }
        Ok(())
    }
}
