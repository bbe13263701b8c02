use serde::{Deserialize, Deserializer};
use std::path::Path;

#[derive(Debug, Deserialize)]
pub struct Config {
    pub udp: UdpConfig,
    pub network_server: NetworkServerConfig,
    pub logging: LoggingConfig,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

#[derive(Debug, Deserialize)]
pub struct UdpConfig {
    pub bind: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkServerConfig {
    /// ADR installation margin (dB)
    pub installation_margin: f32,
    /// RX1 delay in seconds
    pub rx1_delay: u32,
    /// RX2 frequency in MHz
    pub rx2_frequency: f64,
    pub rx2_data_rate: u8,
    /// How long to collect receptions of the same uplink from other gateways
    pub deduplication_delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    #[serde(deserialize_with = "dev_addr_from_hex")]
    pub dev_addr: u32,
    pub max_dr: u8,
    pub max_tx_power_index: u8,
    #[serde(default)]
    pub dr: u8,
    #[serde(default)]
    pub tx_power_index: u8,
    #[serde(default = "default_nb_trans")]
    pub nb_trans: u8,
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

fn default_nb_trans() -> u8 {
    1
}

fn dev_addr_from_hex<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    u32::from_str_radix(&s, 16).map_err(serde::de::Error::custom)
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {:?}: {}", path, e))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| anyhow::anyhow!("Failed to parse config file: {}", e))?;
        Ok(config)
    }
}

impl Default for NetworkServerConfig {
    fn default() -> Self {
        Self {
            installation_margin: 10.0,
            rx1_delay: 1,
            rx2_frequency: 869.525,
            rx2_data_rate: 0,
            deduplication_delay_ms: 200,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            udp: UdpConfig {
                bind: "0.0.0.0:1700".to_string(),
            },
            network_server: NetworkServerConfig::default(),
            logging: LoggingConfig {
                level: "info".to_string(),
            },
            devices: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let config = Config::parse(
            r#"
[udp]
bind = "127.0.0.1:1700"

[network_server]
installation_margin = 5.0
rx1_delay = 1
rx2_frequency = 869.525
rx2_data_rate = 0
deduplication_delay_ms = 150

[logging]
level = "debug"

[[devices]]
dev_addr = "260B1234"
max_dr = 5
max_tx_power_index = 7

[[devices]]
dev_addr = "260b5678"
max_dr = 5
max_tx_power_index = 7
dr = 3
nb_trans = 2
"#,
        )
        .unwrap();

        assert_eq!(config.udp.bind, "127.0.0.1:1700");
        assert_eq!(config.network_server.installation_margin, 5.0);
        assert_eq!(config.network_server.deduplication_delay_ms, 150);
        assert_eq!(config.devices.len(), 2);
        assert_eq!(config.devices[0].dev_addr, 0x260B1234);
        assert_eq!(config.devices[0].nb_trans, 1);
        assert_eq!(config.devices[1].dev_addr, 0x260B5678);
        assert_eq!(config.devices[1].dr, 3);
    }

    #[test]
    fn test_bad_dev_addr_rejected() {
        let result = Config::parse(
            r#"
[udp]
bind = "0.0.0.0:1700"
[network_server]
installation_margin = 10.0
rx1_delay = 1
rx2_frequency = 869.525
rx2_data_rate = 0
deduplication_delay_ms = 200
[logging]
level = "info"
[[devices]]
dev_addr = "not-hex"
max_dr = 5
max_tx_power_index = 7
"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.network_server.rx1_delay, 1);
        assert!(config.devices.is_empty());
    }
}
