//! P1 smart meter gateway
//!
//! Reads DSMR telegrams from the meter's P1 port, decodes them into a
//! reading snapshot and fans the result out to the configured sinks
//! (MQTT, Domoticz, the telnet console and a rolling 24 hour log).

pub mod config;
pub mod domoticz;
pub mod history;
pub mod hub;
pub mod mqtt;
pub mod reader;
pub mod telnet;

// Re-export common types for easier access
pub use config::CONFIG;
pub use domoticz::DomoticzPusher;
pub use history::RollingLog;
pub use hub::{last_event, DistributionHub, TelegramEvent};
pub use mqtt::MqttReporter;
pub use reader::snapshot::MeterReading;
pub use reader::{P1Port, P1Reader};
pub use telnet::SessionConsole;
