//! Domoticz push integration.
//!
//! Sends each reading to the Domoticz JSON API as two udevice updates,
//! one for the combined electricity device and one for the gas counter.
//! A device idx of 0 leaves that device alone.

use crate::config::DomoticzConfig;
use crate::hub::TelegramEvent;
use crate::reader::snapshot::MeterReading;
use log::{debug, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::Receiver;

const PUSH_ATTEMPTS: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_millis(500);

pub struct DomoticzPusher {
    conf: DomoticzConfig,
    rx: Receiver<Arc<TelegramEvent>>,
    http: reqwest::Client,
}

impl DomoticzPusher {
    pub fn new(conf: DomoticzConfig, rx: Receiver<Arc<TelegramEvent>>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        DomoticzPusher { conf, rx, http }
    }

    pub async fn start_thread(&mut self) {
        while let Some(event) = self.rx.recv().await {
            self.push_reading(&event.reading).await;
        }
    }

    async fn push_reading(&self, r: &MeterReading) {
        if self.conf.energy_idx != 0 {
            self.push_device(self.conf.energy_idx, &energy_svalue(r)).await;
        }
        if self.conf.gas_idx != 0 && !r.gas_no_decimals.is_empty() {
            self.push_device(self.conf.gas_idx, &r.gas_no_decimals).await;
        }
    }

    async fn push_device(&self, idx: u32, svalue: &str) {
        let url = format!(
            "http://{}:{}/json.htm?type=command&param=udevice&idx={idx}&svalue={svalue}",
            self.conf.host, self.conf.port
        );

        for attempt in 1..=PUSH_ATTEMPTS {
            match self.http.get(&url).send().await {
                Ok(response) if response.status().is_success() => {
                    debug!("[DMTCZ] Updated device {idx}");
                    return;
                }
                Ok(response) => {
                    warn!("[DMTCZ] Device {idx} rejected: HTTP {}", response.status());
                    return;
                }
                Err(e) => {
                    warn!("[DMTCZ] Push to device {idx} failed (attempt {attempt}): {e}");
                    if attempt < PUSH_ATTEMPTS {
                        tokio::time::sleep(RETRY_DELAY).await;
                    }
                }
            }
        }
    }
}

/// The Domoticz P1 smart meter svalue: usage 1;usage 2;return 1;
/// return 2;actual usage;actual return, energy in Wh-scaled units.
fn energy_svalue(r: &MeterReading) -> String {
    format!(
        "{:.3};{:.3};{:.3};{:.3};{:.3};{:.3}",
        r.electricity_used_tariff1.val(),
        r.electricity_used_tariff2.val(),
        r.electricity_returned_tariff1.val(),
        r.electricity_returned_tariff2.val(),
        r.power_delivered.val(),
        r.power_returned.val()
    )
}
