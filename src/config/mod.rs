use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use serde_yml;
use std::fs::File;
use std::io::prelude::*;

fn p1_port_default() -> String { return "/dev/ttyUSB0".to_string() }
fn p1_baud_default() -> u32 { return 115200 }
fn p1_read_interval_default() -> u64 { return 10 }
fn p1_invert_tariff_default() -> bool { return false }

#[derive(Deserialize, Serialize, Clone)]
pub struct P1Config {
    #[serde(default="p1_port_default")]
    pub port: String,
    #[serde(default="p1_baud_default")]
    pub baud: u32,
    /// Seconds between data requests to the meter.
    #[serde(default="p1_read_interval_default")]
    pub read_interval: u64,
    /// Swap the tariff-1/tariff-2 bands (some grid operators wire the
    /// peak/off-peak registers the other way around).
    #[serde(default="p1_invert_tariff_default")]
    pub invert_tariff: bool,
}

fn mqtt_enabled_default() -> bool { return false }
fn mqtt_host_default() -> String { return "localhost".to_string() }
fn mqtt_port_default() -> u16 { return 1883 }
fn mqtt_cred_default() -> String { return "".to_string() }
fn mqtt_client_name_default() -> String { return "p1gateway".to_string() }
fn mqtt_topic_default() -> String { return "p1gw".to_string() }

#[derive(Deserialize, Serialize, Clone)]
pub struct MqttConfig {
    #[serde(default="mqtt_enabled_default")]
    pub enabled: bool,
    #[serde(default="mqtt_host_default")]
    pub host: String,
    #[serde(default="mqtt_port_default")]
    pub port: u16,
    #[serde(default="mqtt_cred_default")]
    pub user: String,
    #[serde(default="mqtt_cred_default")]
    pub pass: String,
    #[serde(default="mqtt_client_name_default")]
    pub client_name: String,
    /// Root path segment every published fact goes under.
    #[serde(default="mqtt_topic_default")]
    pub topic: String,
}

fn telnet_enabled_default() -> bool { return false }
fn telnet_port_default() -> u16 { return 23 }
fn telnet_cred_default() -> String { return "".to_string() }

#[derive(Deserialize, Serialize, Clone)]
pub struct TelnetConfig {
    #[serde(default="telnet_enabled_default")]
    pub enabled: bool,
    #[serde(default="telnet_port_default")]
    pub port: u16,
    #[serde(default="telnet_cred_default")]
    pub user: String,
    /// Empty password means sessions are authenticated immediately.
    #[serde(default="telnet_cred_default")]
    pub password: String,
}

fn domoticz_enabled_default() -> bool { return false }
fn domoticz_host_default() -> String { return "localhost".to_string() }
fn domoticz_port_default() -> u16 { return 8080 }
fn domoticz_idx_default() -> u32 { return 0 }

#[derive(Deserialize, Serialize, Clone)]
pub struct DomoticzConfig {
    #[serde(default="domoticz_enabled_default")]
    pub enabled: bool,
    #[serde(default="domoticz_host_default")]
    pub host: String,
    #[serde(default="domoticz_port_default")]
    pub port: u16,
    /// Domoticz device idx for the electricity svalue; 0 disables.
    #[serde(default="domoticz_idx_default")]
    pub energy_idx: u32,
    /// Domoticz device idx for the gas counter; 0 disables.
    #[serde(default="domoticz_idx_default")]
    pub gas_idx: u32,
}

fn history_path_default() -> String { return "Last24H.json".to_string() }

#[derive(Deserialize, Serialize, Clone)]
pub struct HistoryConfig {
    #[serde(default="history_path_default")]
    pub path: String,
}

fn p1_default() -> P1Config { return P1Config { port: p1_port_default(), baud: p1_baud_default(), read_interval: p1_read_interval_default(), invert_tariff: p1_invert_tariff_default() }}
fn mqtt_default() -> MqttConfig { return MqttConfig { enabled: mqtt_enabled_default(), host: mqtt_host_default(), port: mqtt_port_default(), user: mqtt_cred_default(), pass: mqtt_cred_default(), client_name: mqtt_client_name_default(), topic: mqtt_topic_default() }}
fn telnet_default() -> TelnetConfig { return TelnetConfig { enabled: telnet_enabled_default(), port: telnet_port_default(), user: telnet_cred_default(), password: telnet_cred_default() }}
fn domoticz_default() -> DomoticzConfig { return DomoticzConfig { enabled: domoticz_enabled_default(), host: domoticz_host_default(), port: domoticz_port_default(), energy_idx: domoticz_idx_default(), gas_idx: domoticz_idx_default() }}
fn history_default() -> HistoryConfig { return HistoryConfig { path: history_path_default() }}

#[derive(Deserialize, Serialize, Clone)]
pub struct Config {
    #[serde(default="p1_default")]
    pub p1: P1Config,
    #[serde(default="mqtt_default")]
    pub mqtt: MqttConfig,
    #[serde(default="telnet_default")]
    pub telnet: TelnetConfig,
    #[serde(default="domoticz_default")]
    pub domoticz: DomoticzConfig,
    #[serde(default="history_default")]
    pub history: HistoryConfig,
}

impl Config {
    pub fn load() -> Self {
        /* Check for the two paths of the config file */
        let mut file = File::open("config/p1gw.yaml");
        if file.is_err() {
            file = Ok(File::open("p1gw.yaml").expect("Unable to read the config on config/p1gw.yaml or p1gw.yaml"));
        }

        let mut file = file.unwrap();

        let mut contents = String::new();
        file.read_to_string(&mut contents).expect("Unable to read config file");
        return serde_yml::from_str(&contents).expect("Unable to parse config file");
    }
}

lazy_static! {
    pub static ref CONFIG: Config = Config::load();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sections_fall_back_to_defaults() {
        let c: Config = serde_yml::from_str("mqtt:\n  enabled: true\n  host: broker.lan\n").unwrap();
        assert!(c.mqtt.enabled);
        assert_eq!(c.mqtt.host, "broker.lan");
        assert_eq!(c.mqtt.port, 1883);
        assert_eq!(c.p1.read_interval, 10);
        assert!(!c.p1.invert_tariff);
        assert!(!c.telnet.enabled);
        assert_eq!(c.history.path, "Last24H.json");
    }
}
