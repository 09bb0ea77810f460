//! P1 telegram acquisition.
//!
//! The meter only talks while the data-request line is asserted and grants
//! a bounded read window, so the reader is a polled state machine: the run
//! loop calls [`P1Reader::poll`] on every tick, waiting is a stored
//! deadline, and nothing here ever blocks past the read window.

use crate::config::P1Config;
use crate::hub::{DistributionHub, TelegramEvent};
use async_trait::async_trait;
use log::{debug, error, info, warn};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::time::Instant;
use tokio_serial::{SerialPort, SerialPortBuilderExt, SerialStream};

pub mod obis;
pub mod snapshot;
pub mod values;

use obis::ObisTable;
use snapshot::MeterReading;

/// A single OBIS line never legally exceeds this (0-0:96.13.0 allows a
/// 1024 char message); longer input is a resync condition, not a write.
pub const MAX_LINE_LENGTH: usize = 1024;
/// Hard ceiling for one accumulated telegram. Exceeding it aborts the
/// cycle; the datagram is never truncated into a plausible prefix.
pub const MAX_DATAGRAM_LENGTH: usize = 2048;

/// How long the meter gets to deliver a full telegram once requested.
const READ_WINDOW: Duration = Duration::from_secs(5);
/// Per-tick budget for pulling buffered serial data.
const LINE_WAIT: Duration = Duration::from_millis(20);
const TICK: Duration = Duration::from_millis(25);

static READ_NOW: AtomicBool = AtomicBool::new(false);

/// Ask the reader to start a cycle on its next tick instead of waiting
/// out the configured interval. Used by the operator console.
pub fn request_immediate_read() {
    READ_NOW.store(true, Ordering::Relaxed);
}

#[derive(Error, Debug)]
pub enum PortError {
    #[error("serial i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),
}

/// Seam between the decoder and the byte-oriented serial channel, so the
/// state machine can run against scripted input in tests.
#[async_trait]
pub trait TelegramPort {
    /// Returns the next complete line if one arrives within `wait`,
    /// `None` if the port stays quiet.
    async fn read_line(&mut self, wait: Duration) -> Result<Option<String>, PortError>;
    /// Drives the hardware data-request signal.
    fn set_data_request(&mut self, on: bool) -> Result<(), PortError>;
    /// Drops any buffered input, hardware and framer both.
    fn discard_input(&mut self) -> Result<(), PortError>;
}

/// Splits a raw byte stream into `\n`-terminated lines through one
/// bounded, reused buffer. An over-long line is dropped and the framer
/// resynchronises at the next newline; it never writes past its capacity.
pub struct LineFramer {
    buf: Vec<u8>,
    overrun: bool,
}

impl LineFramer {
    pub fn new() -> Self {
        LineFramer {
            buf: Vec::with_capacity(MAX_LINE_LENGTH),
            overrun: false,
        }
    }

    pub fn push(&mut self, bytes: &[u8], lines: &mut Vec<String>) {
        for &b in bytes {
            if b == b'\n' {
                if self.overrun {
                    warn!("[P1] Oversized line dropped");
                    self.overrun = false;
                } else {
                    let line = String::from_utf8_lossy(&self.buf)
                        .trim_end_matches('\r')
                        .to_string();
                    lines.push(line);
                }
                self.buf.clear();
            } else if self.buf.len() >= MAX_LINE_LENGTH {
                self.overrun = true;
                self.buf.clear();
            } else {
                self.buf.push(b);
            }
        }
    }

    pub fn reset(&mut self) {
        self.buf.clear();
        self.overrun = false;
    }
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new()
    }
}

/// The real serial port: RTS doubles as the P1 data-request line.
pub struct P1Port {
    stream: SerialStream,
    framer: LineFramer,
    pending: VecDeque<String>,
}

impl P1Port {
    pub fn open(path: &str, baud: u32) -> Result<Self, PortError> {
        let stream = tokio_serial::new(path, baud)
            .data_bits(tokio_serial::DataBits::Eight)
            .stop_bits(tokio_serial::StopBits::One)
            .parity(tokio_serial::Parity::None)
            .open_native_async()?;
        Ok(P1Port {
            stream,
            framer: LineFramer::new(),
            pending: VecDeque::new(),
        })
    }
}

#[async_trait]
impl TelegramPort for P1Port {
    async fn read_line(&mut self, wait: Duration) -> Result<Option<String>, PortError> {
        if let Some(line) = self.pending.pop_front() {
            return Ok(Some(line));
        }

        let mut chunk = [0u8; 256];
        match tokio::time::timeout(wait, self.stream.read(&mut chunk)).await {
            Err(_) => Ok(None), // nothing buffered within the budget
            Ok(Ok(0)) => Ok(None),
            Ok(Ok(n)) => {
                let mut lines = Vec::new();
                self.framer.push(&chunk[..n], &mut lines);
                self.pending.extend(lines);
                Ok(self.pending.pop_front())
            }
            Ok(Err(e)) => Err(e.into()),
        }
    }

    fn set_data_request(&mut self, on: bool) -> Result<(), PortError> {
        self.stream.write_request_to_send(on)?;
        Ok(())
    }

    fn discard_input(&mut self) -> Result<(), PortError> {
        self.stream.clear(tokio_serial::ClearBuffer::Input)?;
        self.framer.reset();
        self.pending.clear();
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderState {
    /// No request outstanding; waiting out the configured interval.
    Disabled,
    /// Request asserted, looking for the `/` start marker.
    Waiting,
    /// Accumulating lines until the `!` end marker.
    Reading,
    /// Terminal success for this cycle.
    Done,
    /// Terminal failure for this cycle (overflow); recovered by reset.
    Fault,
}

pub struct P1Reader<P: TelegramPort> {
    port: P,
    hub: DistributionHub,
    table: ObisTable,
    state: ReaderState,
    reading: MeterReading,
    datagram: String,
    meter_name: String,
    interval: Duration,
    next_update: Instant,
    window_deadline: Instant,
    last_sample: Option<Instant>,
}

impl<P: TelegramPort> P1Reader<P> {
    pub fn new(port: P, hub: DistributionHub, conf: &P1Config) -> Self {
        P1Reader {
            port,
            hub,
            table: ObisTable::new(conf.invert_tariff),
            state: ReaderState::Disabled,
            reading: MeterReading::default(),
            datagram: String::with_capacity(MAX_DATAGRAM_LENGTH),
            meter_name: String::new(),
            interval: Duration::from_secs(conf.read_interval),
            next_update: Instant::now(),
            window_deadline: Instant::now(),
            last_sample: None,
        }
    }

    pub fn state(&self) -> ReaderState {
        self.state
    }

    /// Monotonic instant of the last successfully decoded telegram.
    pub fn last_sample(&self) -> Option<Instant> {
        self.last_sample
    }

    pub fn meter_name(&self) -> &str {
        &self.meter_name
    }

    /// One run-loop tick. Waiting on a quiet port costs at most one
    /// line-read budget; a port that keeps delivering lines is drained
    /// until the telegram ends or the read window runs out.
    pub async fn poll(&mut self) -> Result<(), PortError> {
        match self.state {
            ReaderState::Disabled => {
                if READ_NOW.swap(false, Ordering::Relaxed) || Instant::now() >= self.next_update {
                    self.request_on()?;
                }
                Ok(())
            }
            ReaderState::Waiting | ReaderState::Reading => self.pump().await,
            // both terminal states reset through request_off(); reaching
            // here means a cycle ended without one, recover anyway
            ReaderState::Done | ReaderState::Fault => self.request_off(),
        }
    }

    pub async fn run(&mut self) {
        loop {
            if let Err(e) = self.poll().await {
                error!("[P1] {e}");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            tokio::time::sleep(TICK).await;
        }
    }

    fn request_on(&mut self) -> Result<(), PortError> {
        debug!("[P1] Data requested");
        self.port.discard_input()?;
        self.state = ReaderState::Waiting;
        self.window_deadline = Instant::now() + READ_WINDOW;
        self.port.set_data_request(true)
    }

    fn request_off(&mut self) -> Result<(), PortError> {
        self.state = ReaderState::Disabled;
        self.next_update = Instant::now() + self.interval;
        self.port.set_data_request(false)
    }

    async fn pump(&mut self) -> Result<(), PortError> {
        loop {
            if Instant::now() >= self.window_deadline {
                warn!("[P1] Read window timed out");
                self.port.discard_input()?;
                return self.request_off();
            }

            let Some(line) = self.port.read_line(LINE_WAIT).await? else {
                return Ok(()); // port quiet, yield to the run loop
            };

            self.decode_line(&line);
            match self.state {
                ReaderState::Done => {
                    self.finish();
                    return self.request_off();
                }
                ReaderState::Fault => {
                    warn!("[P1] Telegram discarded, {} bytes so far", self.datagram.len());
                    self.datagram.clear();
                    self.port.discard_input()?;
                    return self.request_off();
                }
                _ => {}
            }
        }
    }

    fn decode_line(&mut self, line: &str) {
        match self.state {
            ReaderState::Waiting => {
                // anything before the start marker is a stale fragment
                if let Some(start) = line.find('/') {
                    debug!("[P1] Start of datagram found");
                    self.datagram.clear();
                    self.append_line(&line[start..]);
                    if self.meter_name.is_empty() {
                        self.meter_name = identify_meter(line).to_string();
                        info!("[P1] Meter identified as {}", self.meter_name);
                    }
                    self.state = ReaderState::Reading;
                }
            }
            ReaderState::Reading => {
                if !self.append_line(line) {
                    self.state = ReaderState::Fault;
                    return;
                }
                if line.contains('!') {
                    debug!("[P1] End found");
                    self.state = ReaderState::Done;
                } else {
                    self.table.apply(line, &mut self.reading);
                }
            }
            _ => {}
        }
    }

    /// Appends a line plus CRLF to the datagram, refusing to grow past the
    /// ceiling. Returns false when the telegram must be aborted.
    fn append_line(&mut self, line: &str) -> bool {
        if self.datagram.len() + line.len() + 2 > MAX_DATAGRAM_LENGTH {
            return false;
        }
        self.datagram.push_str(line);
        self.datagram.push_str("\r\n");
        true
    }

    fn finish(&mut self) {
        self.last_sample = Some(Instant::now());
        info!("[P1] Telegram complete, {} bytes", self.datagram.len());
        self.hub.publish(TelegramEvent {
            reading: self.reading.clone(),
            raw: self.datagram.clone(),
        });
    }
}

/// Maps the `/XXX5...` header line onto a human meter name, once.
fn identify_meter(header: &str) -> &'static str {
    const KNOWN: [(&str, &str); 6] = [
        ("FLU5\\", "Siconia"),
        ("ISK5\\2M550E-1011", "ISKRA AM550e-1011"),
        ("KFM5KAIFA-METER", "Kaifa (MA105 or MA304)"),
        ("XMX5LGBBFG10", "Landis + Gyr E350"),
        ("XMX5LG", "Landis + Gyr"),
        ("Ene5\\T210-D", "Sagemcom T210-D"),
    ];
    for (tag, name) in KNOWN {
        if header.contains(tag) {
            return name;
        }
    }
    "UNKNOWN"
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    struct ScriptPort {
        lines: VecDeque<String>,
        request: Arc<AtomicBool>,
    }

    impl ScriptPort {
        fn new(lines: &[&str]) -> (Self, Arc<AtomicBool>) {
            let request = Arc::new(AtomicBool::new(false));
            (
                ScriptPort {
                    lines: lines.iter().map(|l| l.to_string()).collect(),
                    request: request.clone(),
                },
                request,
            )
        }
    }

    #[async_trait]
    impl TelegramPort for ScriptPort {
        async fn read_line(&mut self, _wait: Duration) -> Result<Option<String>, PortError> {
            Ok(self.lines.pop_front())
        }

        fn set_data_request(&mut self, on: bool) -> Result<(), PortError> {
            self.request.store(on, Ordering::Relaxed);
            Ok(())
        }

        fn discard_input(&mut self) -> Result<(), PortError> {
            Ok(())
        }
    }

    const TELEGRAM: [&str; 12] = [
        "/KFM5KAIFA-METER",
        "",
        "0-0:1.0.0(231029141500W)",
        "0-0:96.1.1(4B414C37)",
        "0-0:96.14.0(0002)",
        "1-0:1.8.1(000992.992*kWh)",
        "1-0:1.8.2(000560.157*kWh)",
        "1-0:1.7.0(00.424*kW)",
        "1-0:32.7.0(232.0*V)",
        "0-0:96.7.21(00051)",
        "0-1:24.2.1(231029141500W)(05446.465*m3)",
        "!5B3A",
    ];

    fn conf(read_interval: u64) -> P1Config {
        P1Config {
            port: String::new(),
            baud: 115200,
            read_interval,
            invert_tariff: false,
        }
    }

    async fn decode_script(lines: &[&str]) -> (P1Reader<ScriptPort>, Arc<AtomicBool>) {
        let (port, request) = ScriptPort::new(lines);
        let reader = P1Reader::new(port, DistributionHub::new(), &conf(10));
        (reader, request)
    }

    #[tokio::test]
    async fn test_full_telegram_cycle() {
        let (port, request) = ScriptPort::new(&TELEGRAM);
        let mut hub = DistributionHub::new();
        let mut rx = hub.register("test");
        let mut reader = P1Reader::new(port, hub, &conf(10));

        reader.poll().await.unwrap();
        assert_eq!(reader.state(), ReaderState::Waiting);
        assert!(request.load(Ordering::Relaxed));

        reader.poll().await.unwrap();
        assert_eq!(reader.state(), ReaderState::Disabled);
        assert!(!request.load(Ordering::Relaxed));
        assert!(reader.last_sample().is_some());
        assert_eq!(reader.meter_name(), "Kaifa (MA105 or MA304)");

        let event = rx.try_recv().expect("telegram published");
        assert_eq!(event.reading.electricity_used_tariff1.val(), 992.992);
        assert_eq!(event.reading.tariff_indicator, 2);
        assert_eq!(event.reading.gas_no_decimals, "5446465");
        assert!(event.raw.starts_with("/KFM5KAIFA-METER\r\n"));
        assert!(event.raw.ends_with("!5B3A\r\n"));
    }

    #[tokio::test]
    async fn test_parsing_is_idempotent() {
        let (mut first, _) = decode_script(&TELEGRAM).await;
        let (mut second, _) = decode_script(&TELEGRAM).await;
        for reader in [&mut first, &mut second] {
            reader.poll().await.unwrap();
            reader.poll().await.unwrap();
        }
        assert_eq!(first.reading, second.reading);
        assert_eq!(first.datagram, second.datagram);
    }

    #[tokio::test]
    async fn test_noise_before_start_marker_is_discarded() {
        let mut lines = vec!["1-0:1.8.1(000099.000*kWh)", "garbage"];
        lines.extend_from_slice(&TELEGRAM);
        let (mut reader, _) = decode_script(&lines).await;
        reader.poll().await.unwrap();
        reader.poll().await.unwrap();
        // the pre-marker counter line must not have been decoded
        assert_eq!(reader.reading.electricity_used_tariff1.val(), 992.992);
    }

    #[tokio::test]
    async fn test_oversized_telegram_faults_and_recovers() {
        let filler = "0-0:96.13.0(".to_string() + &"A".repeat(200) + ")";
        let mut lines: Vec<&str> = vec!["/KFM5KAIFA-METER"];
        for _ in 0..12 {
            lines.push(&filler);
        }
        lines.push("!");

        let (port, request) = ScriptPort::new(&lines);
        let mut hub = DistributionHub::new();
        let mut rx = hub.register("test");
        let mut reader = P1Reader::new(port, hub, &conf(10));

        reader.poll().await.unwrap();
        reader.poll().await.unwrap();
        assert_eq!(reader.state(), ReaderState::Disabled);
        assert!(!request.load(Ordering::Relaxed));
        assert!(rx.try_recv().is_err(), "aborted telegram must not publish");
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_window_timeout_recovers() {
        let (port, request) = ScriptPort::new(&["no start marker here"]);
        let mut reader = P1Reader::new(port, DistributionHub::new(), &conf(10));

        reader.poll().await.unwrap();
        assert_eq!(reader.state(), ReaderState::Waiting);

        tokio::time::advance(READ_WINDOW + Duration::from_millis(100)).await;
        reader.poll().await.unwrap();
        assert_eq!(reader.state(), ReaderState::Disabled);
        assert!(!request.load(Ordering::Relaxed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_gates_the_next_request() {
        let (port, request) = ScriptPort::new(&TELEGRAM);
        let mut reader = P1Reader::new(port, DistributionHub::new(), &conf(10));
        reader.poll().await.unwrap();
        reader.poll().await.unwrap();
        assert_eq!(reader.state(), ReaderState::Disabled);

        // interval not elapsed, no new request
        reader.poll().await.unwrap();
        assert!(!request.load(Ordering::Relaxed));

        tokio::time::advance(Duration::from_secs(11)).await;
        reader.poll().await.unwrap();
        assert_eq!(reader.state(), ReaderState::Waiting);
        assert!(request.load(Ordering::Relaxed));
    }

    #[test]
    fn test_line_framer_bounds_and_resync() {
        let mut framer = LineFramer::new();
        let mut lines = Vec::new();

        framer.push(b"1-0:1.7.0(00.424*kW)\r\n", &mut lines);
        assert_eq!(lines, vec!["1-0:1.7.0(00.424*kW)"]);

        lines.clear();
        let oversized = vec![b'x'; MAX_LINE_LENGTH + 50];
        framer.push(&oversized, &mut lines);
        framer.push(b"\nnext line\n", &mut lines);
        assert_eq!(lines, vec!["next line"]);
    }

    #[test]
    fn test_identify_meter() {
        assert_eq!(identify_meter("/KFM5KAIFA-METER"), "Kaifa (MA105 or MA304)");
        assert_eq!(identify_meter("/XMX5LGBBFG10"), "Landis + Gyr E350");
        assert_eq!(identify_meter("/ABC5something"), "UNKNOWN");
    }
}
