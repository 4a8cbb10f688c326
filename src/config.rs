//! TOML configuration
//!
//! Loaded by the daemon at startup. Every field has a default so a
//! partial (or missing) file still yields a working configuration.

use crate::connector::{BleProfile, Criteria, SerialProfile};
use crate::error::Result;
use crate::scheduler::ReconnectOptions;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Connector choice and node selection
    pub connector: ConnectorConfig,
    /// BLE-style protocol tunables
    pub ble: BleConfig,
    /// Serial protocol tunables
    pub serial: SerialConfig,
    /// Reconnection policy
    pub reconnect: ReconnectConfig,
    /// Log filtering
    pub logging: LoggingConfig,
}

/// Which link to use and which node to look for
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectorConfig {
    /// "serial" or "ble"
    pub kind: String,
    /// Node name to match; empty matches any
    pub name: String,
    /// MAC address or port path to match; empty matches any
    pub mac: String,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            kind: "serial".to_string(),
            name: String::new(),
            mac: String::new(),
        }
    }
}

impl ConnectorConfig {
    /// Selection criteria from the configured name/mac filters
    pub fn criteria(&self) -> Criteria {
        Criteria {
            name: (!self.name.is_empty()).then(|| self.name.clone()),
            mac: (!self.mac.is_empty()).then(|| self.mac.clone()),
        }
    }
}

/// BLE chunked-protocol settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BleConfig {
    /// Link frame size including the 12-byte header
    pub packet_size: usize,
    /// Continuation chunk length for inbound notifications
    pub notification_sentinel: usize,
    /// Firmware bytes per update frame
    pub ota_chunk_size: usize,
}

impl Default for BleConfig {
    fn default() -> Self {
        let profile = BleProfile::default();
        Self {
            packet_size: profile.packet_size,
            notification_sentinel: profile.notification_sentinel,
            ota_chunk_size: profile.ota_chunk_size,
        }
    }
}

impl BleConfig {
    /// Protocol profile with these settings applied
    pub fn profile(&self) -> BleProfile {
        BleProfile {
            packet_size: self.packet_size,
            notification_sentinel: self.notification_sentinel,
            ota_chunk_size: self.ota_chunk_size,
            ..BleProfile::default()
        }
    }
}

/// Serial framed-protocol settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Line speed in baud
    pub baud_rate: u32,
    /// Largest merged message per frame
    pub packet_budget: usize,
}

impl Default for SerialConfig {
    fn default() -> Self {
        let profile = SerialProfile::default();
        Self {
            baud_rate: profile.baud_rate,
            packet_budget: profile.packet_budget,
        }
    }
}

impl SerialConfig {
    /// Protocol profile with these settings applied
    pub fn profile(&self) -> SerialProfile {
        SerialProfile {
            baud_rate: self.baud_rate,
            packet_budget: self.packet_budget,
            ..SerialProfile::default()
        }
    }
}

/// Reconnection policy settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Reconnect after an unexpected link drop
    pub on_drop: bool,
    /// Keep trying to reach a node while disconnected
    pub autonomous: bool,
    /// Wait before the first attempt after a drop (milliseconds)
    pub delay_ms: u64,
    /// Autonomous retry period (milliseconds)
    pub tick_ms: u64,
    /// Budget for each reconnect select/connect (milliseconds)
    pub connect_timeout_ms: u64,
    /// Scan window for the reconnect selection (milliseconds)
    pub scan_window_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        let options = ReconnectOptions::default();
        Self {
            on_drop: true,
            autonomous: false,
            delay_ms: options.delay.as_millis() as u64,
            tick_ms: options.tick.as_millis() as u64,
            connect_timeout_ms: options.connect_timeout.as_millis() as u64,
            scan_window_ms: options.scan_window.as_millis() as u64,
        }
    }
}

impl ReconnectConfig {
    /// Scheduler reconnection options from these settings
    pub fn options(&self) -> ReconnectOptions {
        ReconnectOptions {
            on_drop: self.on_drop,
            autonomous: self.autonomous,
            delay: Duration::from_millis(self.delay_ms),
            tick: Duration::from_millis(self.tick_ms),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            scan_window: Duration::from_millis(self.scan_window_ms),
        }
    }
}

/// Log filtering settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// env_logger filter string, e.g. "info" or "dipa_link=debug"
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl AppConfig {
    /// Load from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Write to a TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip_through_toml() {
        let config = AppConfig::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: AppConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.connector.kind, "serial");
        assert_eq!(parsed.ble.packet_size, 512);
        assert_eq!(parsed.ble.notification_sentinel, 208);
        assert_eq!(parsed.serial.baud_rate, 115_200);
        assert!(parsed.reconnect.on_drop);
        assert_eq!(parsed.logging.level, "info");
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let parsed: AppConfig = toml::from_str(
            r#"
            [connector]
            kind = "ble"
            name = "lamp-12"

            [ble]
            packet_size = 244
            "#,
        )
        .unwrap();
        assert_eq!(parsed.connector.kind, "ble");
        assert_eq!(parsed.ble.packet_size, 244);
        assert_eq!(parsed.ble.notification_sentinel, 208);
        assert_eq!(parsed.serial.baud_rate, 115_200);
    }

    #[test]
    fn empty_filters_match_any_node() {
        let config = ConnectorConfig::default();
        assert_eq!(config.criteria(), Criteria::any());

        let config = ConnectorConfig {
            name: "lamp-12".to_string(),
            ..ConnectorConfig::default()
        };
        let criteria = config.criteria();
        assert_eq!(criteria.name.as_deref(), Some("lamp-12"));
        assert!(criteria.mac.is_none());
    }
}
