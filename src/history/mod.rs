//! Rolling 24 hour energy log.
//!
//! One sample per wall-clock hour, at most 24 kept, persisted as JSON so
//! the window survives a restart. Writes go through a temp file plus
//! rename; a torn write can never destroy the existing log.

use crate::hub::TelegramEvent;
use crate::reader::snapshot::MeterReading;
use chrono::Timelike;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc::Receiver;

const MAX_SAMPLES: usize = 24;

/// One hourly snapshot of the four energy registers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HourSample {
    #[serde(rename = "DateTime")]
    pub timestamp: String,
    #[serde(rename = "T1")]
    pub used_tariff1: f64,
    #[serde(rename = "T2")]
    pub used_tariff2: f64,
    #[serde(rename = "R1")]
    pub returned_tariff1: f64,
    #[serde(rename = "R2")]
    pub returned_tariff2: f64,
}

impl HourSample {
    fn from_reading(r: &MeterReading) -> Self {
        HourSample {
            timestamp: r.timestamp.clone(),
            used_tariff1: r.electricity_used_tariff1.val(),
            used_tariff2: r.electricity_used_tariff2.val(),
            returned_tariff1: r.electricity_returned_tariff1.val(),
            returned_tariff2: r.electricity_returned_tariff2.val(),
        }
    }
}

/// Hour of day from a meter timestamp (`YYMMDDhhmmssX`), if parseable.
/// The timestamp arrives off the serial line, so anything other than
/// twelve leading ASCII digits reads as unusable.
fn hour_of(timestamp: &str) -> Option<u32> {
    let head = timestamp.get(..12)?;
    if !head.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    chrono::NaiveDateTime::parse_from_str(head, "%y%m%d%H%M%S")
        .ok()
        .map(|t| t.hour())
}

pub struct RollingLog {
    path: PathBuf,
    samples: VecDeque<HourSample>,
}

impl RollingLog {
    /// Opens the log at `path`, loading whatever previous run left there.
    /// A missing or corrupt file starts an empty window.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let samples = match fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<Vec<HourSample>>(&contents) {
                Ok(mut loaded) => {
                    loaded.truncate(MAX_SAMPLES);
                    info!("[STRG] Loaded {} hourly samples from {}", loaded.len(), path.display());
                    loaded.into()
                }
                Err(e) => {
                    warn!("[STRG] Corrupt log {} discarded: {e}", path.display());
                    VecDeque::new()
                }
            },
            Err(_) => VecDeque::new(),
        };
        RollingLog { path, samples }
    }

    pub fn samples(&self) -> impl Iterator<Item = &HourSample> {
        self.samples.iter()
    }

    /// Records the reading if its meter timestamp falls in a new hour.
    /// Returns true when a sample was appended (and persisted).
    pub fn record(&mut self, r: &MeterReading) -> io::Result<bool> {
        let Some(hour) = hour_of(&r.timestamp) else {
            debug!("[STRG] Unusable timestamp {:?}, sample skipped", r.timestamp);
            return Ok(false);
        };
        if let Some(last) = self.samples.back() {
            if hour_of(&last.timestamp) == Some(hour) {
                return Ok(false);
            }
        }

        self.samples.push_back(HourSample::from_reading(r));
        while self.samples.len() > MAX_SAMPLES {
            self.samples.pop_front();
        }
        self.save()?;
        debug!("[STRG] Hour {hour} recorded, {} samples kept", self.samples.len());
        Ok(true)
    }

    fn save(&self) -> io::Result<()> {
        let contents = serde_json::to_string(&Vec::from_iter(self.samples.iter()))
            .map_err(io::Error::other)?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, contents)?;
        fs::rename(&tmp, &self.path)
    }

    pub async fn start_thread(&mut self, mut rx: Receiver<Arc<TelegramEvent>>) {
        while let Some(event) = rx.recv().await {
            if let Err(e) = self.record(&event.reading) {
                warn!("[STRG] Unable to persist {}: {e}", self.path.display());
            }
        }
    }
}
