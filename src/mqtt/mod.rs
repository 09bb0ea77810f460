//! MQTT sink.
//!
//! Owns its connection lifecycle completely: the broker link is a
//! {Disconnected, Connecting, Connected} machine with a fixed reconnect
//! backoff, and a run of consecutive connection errors tears the client
//! down wholesale so a wedged transport cannot keep queuing data. While
//! the link is down, readings are dropped, not buffered; fresh beats
//! complete here.

use crate::config::MqttConfig;
use crate::hub::TelegramEvent;
use crate::reader::snapshot::MeterReading;
use log::{debug, error, info, warn};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::Receiver;
use tokio::time::Instant;

const RECONNECT_DELAY: Duration = Duration::from_secs(2);
/// Consecutive connection errors tolerated before the client (and its
/// pending outbound queue) is dropped and rebuilt.
const ERROR_QUOTA: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

/// Backoff and error-quota bookkeeping, separate from the transport so
/// the arithmetic stays testable.
struct LinkHealth {
    errors: u32,
    next_attempt: Instant,
}

impl LinkHealth {
    fn new() -> Self {
        LinkHealth {
            errors: 0,
            next_attempt: Instant::now(),
        }
    }

    fn success(&mut self) {
        self.errors = 0;
    }

    /// Records a failure and arms the backoff deadline. Returns true when
    /// the quota is hit, meaning the client must be rebuilt; the counter
    /// restarts from zero in that case.
    fn failure(&mut self, now: Instant) -> bool {
        self.errors += 1;
        self.next_attempt = now + RECONNECT_DELAY;
        if self.errors >= ERROR_QUOTA {
            self.errors = 0;
            return true;
        }
        false
    }
}

pub struct MqttReporter {
    conf: MqttConfig,
    rx: Receiver<Arc<TelegramEvent>>,
    client: AsyncClient,
    eventloop: EventLoop,
    state: LinkState,
    health: LinkHealth,
}

impl MqttReporter {
    pub fn new(conf: MqttConfig, rx: Receiver<Arc<TelegramEvent>>) -> Self {
        let (client, eventloop) = Self::build_client(&conf);
        MqttReporter {
            conf,
            rx,
            client,
            eventloop,
            state: LinkState::Connecting,
            health: LinkHealth::new(),
        }
    }

    fn build_client(conf: &MqttConfig) -> (AsyncClient, EventLoop) {
        let mut options = MqttOptions::new(conf.client_name.clone(), conf.host.clone(), conf.port);
        options.set_keep_alive(Duration::from_secs(5));
        if !conf.user.is_empty() {
            options.set_credentials(conf.user.clone(), conf.pass.clone());
        }
        AsyncClient::new(options, 10)
    }

    pub async fn start_thread(&mut self) {
        info!("[MQTT] Connect to {}:{}", self.conf.host, self.conf.port);
        loop {
            tokio::select! {
                event = self.eventloop.poll() => self.handle_link_event(event).await,
                message = self.rx.recv() => match message {
                    Some(event) => self.report(&event),
                    None => break,
                }
            }
        }
        info!("[MQTT] Reporter stopped");
    }

    async fn handle_link_event(&mut self, event: Result<Event, rumqttc::ConnectionError>) {
        match event {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("[MQTT] Connected");
                self.state = LinkState::Connected;
                self.health.success();

                // once connected, publish an announcement
                self.send_metric("State/Payload", "p1 gateway running");
                self.send_metric("State/Version", env!("CARGO_PKG_VERSION"));
                if let Some(ip) = self.local_address() {
                    self.send_metric("State/IP", &ip);
                }
            }
            Ok(_) => {}
            Err(e) => {
                self.state = LinkState::Disconnected;
                error!("[MQTT] Connection failed: {e}");
                if self.health.failure(Instant::now()) {
                    warn!("[MQTT] Error quota reached, dropping client and pending queue");
                    let (client, eventloop) = Self::build_client(&self.conf);
                    self.client = client;
                    self.eventloop = eventloop;
                }
                // narrow recovery window: hold off the next attempt
                tokio::time::sleep_until(self.health.next_attempt).await;
                self.state = LinkState::Connecting;
            }
        }
    }

    /// One reading from the hub. A down link makes this a no-op; the
    /// cycle's data is dropped, never queued.
    fn report(&mut self, event: &TelegramEvent) {
        if self.state != LinkState::Connected {
            debug!("[MQTT] Not connected, reading dropped");
            return;
        }

        debug!("[MQTT] Send to MQTT");
        for (suffix, payload) in metric_set(&event.reading) {
            self.send_metric(suffix, &payload);
        }
    }

    fn send_metric(&self, suffix: &str, payload: &str) {
        if payload.is_empty() {
            return; // nothing to report
        }

        let topic = format!("{}/{}", self.conf.topic, suffix);
        if let Err(e) = self
            .client
            .try_publish(topic, QoS::AtMostOnce, false, payload)
        {
            warn!("[MQTT] Error to send to topic {}/{suffix}: {e}", self.conf.topic);
        }
    }

    /// The address the broker sees us on, for the liveness announcement.
    fn local_address(&self) -> Option<String> {
        let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
        socket
            .connect((self.conf.host.as_str(), self.conf.port))
            .ok()?;
        Some(socket.local_addr().ok()?.ip().to_string())
    }
}

/// The per-telegram fact list, `(topic suffix, payload)`. Empty payloads
/// are filtered at send time.
fn metric_set(r: &MeterReading) -> Vec<(&'static str, String)> {
    let tariff = if r.tariff_indicator == 0 {
        String::new()
    } else {
        r.tariff_indicator.to_string()
    };

    vec![
        ("equipmentID", r.equipment_id.clone()),
        ("consumption_low_tarif", r.electricity_used_tariff1.to_string()),
        ("consumption_high_tarif", r.electricity_used_tariff2.to_string()),
        ("returndelivery_low_tarif", r.electricity_returned_tariff1.to_string()),
        ("returndelivery_high_tarif", r.electricity_returned_tariff2.to_string()),
        ("actual_consumption", r.power_delivered.to_string()),
        ("actual_returndelivery", r.power_returned.to_string()),
        ("l1_instant_power_usage", r.power_delivered_l1.to_string()),
        ("l2_instant_power_usage", r.power_delivered_l2.to_string()),
        ("l3_instant_power_usage", r.power_delivered_l3.to_string()),
        ("l1_instant_power_current", r.current_l1.to_string()),
        ("l2_instant_power_current", r.current_l2.to_string()),
        ("l3_instant_power_current", r.current_l3.to_string()),
        ("l1_voltage", r.voltage_l1.to_string()),
        ("l2_voltage", r.voltage_l2.to_string()),
        ("l3_voltage", r.voltage_l3.to_string()),
        ("gas_meter_m3", r.gas_received_5min.clone()),
        ("actual_tarif_group", tariff),
        ("short_power_outages", r.power_failures.to_string()),
        ("long_power_outages", r.long_power_failures.to_string()),
        ("short_power_drops", r.voltage_sags_l1.to_string()),
        ("short_power_peaks", r.voltage_swells_l1.to_string()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::values::FixedValue;

    #[test]
    fn test_metric_set_values() {
        let mut r = MeterReading::default();
        r.equipment_id = "4B414C37".to_string();
        r.electricity_used_tariff1 = FixedValue::parse("992.992");
        r.power_delivered = FixedValue::parse("0.424");
        r.gas_received_5min = "5446.465".to_string();
        r.tariff_indicator = 2;

        let metrics = metric_set(&r);
        let get = |suffix: &str| {
            metrics
                .iter()
                .find(|(s, _)| *s == suffix)
                .map(|(_, p)| p.clone())
                .unwrap()
        };
        assert_eq!(get("equipmentID"), "4B414C37");
        assert_eq!(get("consumption_low_tarif"), "992.992");
        assert_eq!(get("actual_consumption"), "0.424");
        assert_eq!(get("gas_meter_m3"), "5446.465");
        assert_eq!(get("actual_tarif_group"), "2");
    }

    #[test]
    fn test_unseen_string_facts_are_empty_and_skippable() {
        let metrics = metric_set(&MeterReading::default());
        let get = |suffix: &str| {
            metrics
                .iter()
                .find(|(s, _)| *s == suffix)
                .map(|(_, p)| p.clone())
                .unwrap()
        };
        // empty payloads are the "nothing to report" signal
        assert_eq!(get("equipmentID"), "");
        assert_eq!(get("gas_meter_m3"), "");
        assert_eq!(get("actual_tarif_group"), "");
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_and_error_quota() {
        let mut health = LinkHealth::new();
        let now = Instant::now();

        assert!(!health.failure(now));
        assert_eq!(health.next_attempt, now + RECONNECT_DELAY);
        assert_eq!(health.errors, 1);

        health.success();
        assert_eq!(health.errors, 0);

        let mut rebuilt = false;
        for _ in 0..ERROR_QUOTA {
            rebuilt = health.failure(now);
        }
        assert!(rebuilt, "quota must force a client rebuild");
        assert_eq!(health.errors, 0, "counter resets after the rebuild");
    }
}
