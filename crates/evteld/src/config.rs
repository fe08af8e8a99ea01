//! Daemon configuration
//!
//! Loaded from a TOML file handed over by whatever owns persistent
//! storage on the device. Vehicle-specific parameters (request timeout,
//! bus bit-rate) are not configured here; they come from the selected
//! vehicle's profile.

use serde::Deserialize;

use evtel_can::TransportConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    /// Display name of the vehicle to poll (e.g. "Leaf ZE1").
    pub vehicle: String,

    /// Transport selection and its adapter-specific fields.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Deliver two-sample averages to observers.
    #[serde(default)]
    pub fast_average: bool,

    /// Observer drain cadence.
    #[serde(default = "default_observer_interval")]
    pub observer_interval_ms: u64,

    /// Optional raw capability-mask override; defaults to everything the
    /// vehicle supports.
    #[serde(default)]
    pub item_mask: Option<u32>,
}

fn default_observer_interval() -> u64 {
    100
}

impl DaemonConfig {
    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_elm_tcp_config() {
        let config = DaemonConfig::from_toml(
            r#"
            vehicle = "Leaf ZE1"
            fast_average = true

            [transport]
            type = "elm-tcp"
            host = "192.168.0.10"
            port = 35000
            "#,
        )
        .unwrap();

        assert_eq!(config.vehicle, "Leaf ZE1");
        assert!(config.fast_average);
        assert_eq!(config.observer_interval_ms, 100);
        match config.transport {
            TransportConfig::ElmTcp(ref tcp) => {
                assert_eq!(tcp.host, "192.168.0.10");
                assert_eq!(tcp.port, 35000);
            }
            ref other => panic!("unexpected transport: {other:?}"),
        }
    }

    #[test]
    fn parses_socketcan_config_with_mask_override() {
        let config = DaemonConfig::from_toml(
            r#"
            vehicle = "VW MEB AWD"
            item_mask = 0x11003
            observer_interval_ms = 250

            [transport]
            type = "socket-can"
            interface = "can0"
            "#,
        )
        .unwrap();

        assert_eq!(config.item_mask, Some(0x11003));
        assert_eq!(config.observer_interval_ms, 250);
        assert!(matches!(config.transport, TransportConfig::SocketCan(_)));
    }

    #[test]
    fn transport_defaults_to_mock() {
        let config = DaemonConfig::from_toml(r#"vehicle = "Leaf ZE1""#).unwrap();
        assert!(matches!(config.transport, TransportConfig::Mock(_)));
    }
}
