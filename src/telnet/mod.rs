//! Telnet operator console.
//!
//! A fixed pool of interactive sessions that each get the raw telegram
//! broadcast plus a small command vocabulary. Sessions authenticate when
//! a password is configured, are evicted after five idle minutes, and a
//! session whose outbound queue is full gets disconnected instead of
//! holding up the broadcast for everyone else.

use crate::config::TelnetConfig;
use crate::hub::TelegramEvent;
use crate::reader;
use log::{info, warn};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::Instant;

const MAX_SESSIONS: usize = 5;
const MAX_AUTH_ATTEMPTS: u32 = 3;
const AUTH_TIMEOUT: Duration = Duration::from_secs(30);
const IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);
/// Broadcasts a congested session cannot absorb before it is dropped.
const OUTBOUND_QUEUE: usize = 8;

struct Session {
    id: usize,
    tx: mpsc::Sender<String>,
    handle: JoinHandle<()>,
}

pub struct SessionConsole {
    conf: TelnetConfig,
    rx: mpsc::Receiver<Arc<TelegramEvent>>,
    slots: Arc<Mutex<Vec<Option<Session>>>>,
}

impl SessionConsole {
    pub fn new(conf: TelnetConfig, rx: mpsc::Receiver<Arc<TelegramEvent>>) -> Self {
        let slots = (0..MAX_SESSIONS).map(|_| None).collect();
        SessionConsole {
            conf,
            rx,
            slots: Arc::new(Mutex::new(slots)),
        }
    }

    pub async fn start_thread(&mut self) {
        let listener = match TcpListener::bind(("0.0.0.0", self.conf.port)).await {
            Ok(listener) => listener,
            Err(e) => {
                warn!("[TELNET] Unable to listen on port {}: {e}", self.conf.port);
                return;
            }
        };
        info!("[TELNET] Listening on port {}", self.conf.port);

        let slots = self.slots.clone();
        let conf = self.conf.clone();
        tokio::spawn(async move {
            accept_loop(listener, slots, conf).await;
        });

        while let Some(event) = self.rx.recv().await {
            self.broadcast(&event.raw);
        }
    }

    /// Offers the raw telegram to every live session. A full outbound
    /// queue marks the session congested; it is closed on the spot so the
    /// other sessions still get this and future broadcasts.
    fn broadcast(&self, raw: &str) {
        let mut slots = self.slots.lock().unwrap();
        for slot in slots.iter_mut() {
            let Some(session) = slot else { continue };
            if session.handle.is_finished() {
                *slot = None;
                continue;
            }
            match session.tx.try_send(raw.to_string()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!("[TELNET] Client {} is congested, kill connection", session.id);
                    session.handle.abort();
                    *slot = None;
                }
                Err(TrySendError::Closed(_)) => {
                    *slot = None;
                }
            }
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    slots: Arc<Mutex<Vec<Option<Session>>>>,
    conf: TelnetConfig,
) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("[TELNET] Accept failed: {e}");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        let mut slots_guard = slots.lock().unwrap();
        let free = slots_guard
            .iter()
            .position(|s| s.as_ref().map_or(true, |s| s.handle.is_finished()));
        match free {
            Some(id) => {
                let (tx, outbound) = mpsc::channel(OUTBOUND_QUEUE);
                let handle = tokio::spawn(serve_session(id, stream, outbound, conf.clone()));
                slots_guard[id] = Some(Session { id, tx, handle });
                drop(slots_guard);
                info!("[TELNET] New connection from {peer} (slot {id})");
            }
            None => {
                drop(slots_guard);
                warn!("[TELNET] Server is busy with {MAX_SESSIONS} active connections");
                tokio::spawn(async move {
                    let mut stream = stream;
                    let _ = stream
                        .write_all(b"Server is busy. Try again later.\r\n")
                        .await;
                });
            }
        }
    }
}

async fn serve_session(
    id: usize,
    stream: TcpStream,
    mut outbound: mpsc::Receiver<String>,
    conf: TelnetConfig,
) {
    let (read_half, mut writer) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    if !conf.password.is_empty() && !authenticate(&mut lines, &mut writer, &conf).await {
        info!("[TELNET] Closed connection for client {id}");
        return;
    }

    if writer
        .write_all(format!("Welcome! Your session ID is {id}.\r\n").as_bytes())
        .await
        .is_err()
    {
        return;
    }

    let mut last_activity = Instant::now();
    loop {
        let idle_deadline = last_activity + IDLE_TIMEOUT;
        tokio::select! {
            _ = tokio::time::sleep_until(idle_deadline) => {
                let _ = writer.write_all(b"Session timeout due to inactivity.\r\n").await;
                info!("[TELNET] Closed idle session {id}");
                return;
            }
            broadcast = outbound.recv() => match broadcast {
                Some(raw) => {
                    if writer.write_all(raw.as_bytes()).await.is_err() {
                        return;
                    }
                }
                None => return,
            },
            line = lines.next_line() => match line {
                Ok(Some(command)) => {
                    last_activity = Instant::now();
                    if !run_command(&mut writer, command.trim()).await {
                        info!("[TELNET] Closed connection for client {id}");
                        return;
                    }
                }
                Ok(None) | Err(_) => return,
            },
        }
    }
}

async fn authenticate<W: AsyncWrite + Unpin>(
    lines: &mut Lines<BufReader<OwnedReadHalf>>,
    writer: &mut W,
    conf: &TelnetConfig,
) -> bool {
    for attempt in 0..MAX_AUTH_ATTEMPTS {
        let Some(username) = prompt(lines, writer, b"Login: ").await else {
            return false;
        };
        let Some(password) = prompt(lines, writer, b"Password: ").await else {
            return false;
        };

        if username == conf.user && password == conf.password {
            let _ = writer.write_all(b"Authentication successful.\r\n").await;
            return true;
        }

        let remaining = MAX_AUTH_ATTEMPTS - attempt - 1;
        let _ = writer
            .write_all(format!("Authentication failed. {remaining} attempts remaining.\r\n").as_bytes())
            .await;
        // growing delay between attempts
        tokio::time::sleep(Duration::from_secs((attempt + 1) as u64)).await;
    }

    let _ = writer
        .write_all(b"Max attempts reached. Connection closed.\r\n")
        .await;
    false
}

async fn prompt<W: AsyncWrite + Unpin>(
    lines: &mut Lines<BufReader<OwnedReadHalf>>,
    writer: &mut W,
    text: &[u8],
) -> Option<String> {
    if writer.write_all(text).await.is_err() {
        return None;
    }
    match tokio::time::timeout(AUTH_TIMEOUT, lines.next_line()).await {
        Ok(Ok(Some(line))) => Some(line.trim().to_string()),
        Ok(_) => None,
        Err(_) => {
            let _ = writer.write_all(b"Timeout. Connection closed.\r\n").await;
            None
        }
    }
}

enum CommandAction {
    Reply(&'static str),
    ShowRaw,
    ForceRead,
    Reboot,
    Close,
}

fn parse_command(command: &str) -> CommandAction {
    match command {
        "exit" => CommandAction::Close,
        "help" => CommandAction::Reply("Available commands: help, raw, read, reboot, exit\r\n"),
        "raw" => CommandAction::ShowRaw,
        "read" => CommandAction::ForceRead,
        "reboot" => CommandAction::Reboot,
        "" => CommandAction::Reply(""),
        _ => CommandAction::Reply("Unknown command. Type 'help' for available commands.\r\n"),
    }
}

/// Executes one operator command; returns false when the session ends.
async fn run_command<W: AsyncWrite + Unpin>(writer: &mut W, command: &str) -> bool {
    match parse_command(command) {
        CommandAction::Close => {
            let _ = writer.write_all(b"Goodbye!\r\n").await;
            false
        }
        CommandAction::Reply(reply) => {
            if reply.is_empty() {
                return true;
            }
            writer.write_all(reply.as_bytes()).await.is_ok()
        }
        CommandAction::ShowRaw => {
            let reply = match crate::hub::last_event() {
                Some(event) => event.raw.clone(),
                None => "No telegram decoded yet.\r\n".to_string(),
            };
            writer.write_all(reply.as_bytes()).await.is_ok()
        }
        CommandAction::ForceRead => {
            reader::request_immediate_read();
            writer.write_all(b"Read requested.\r\n").await.is_ok()
        }
        CommandAction::Reboot => {
            warn!("[TELNET] User request reboot!");
            let _ = writer.write_all(b"Rebooting...\r\n").await;
            tokio::spawn(async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                // the host supervisor restarts the process
                std::process::exit(1);
            });
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn empty_conf() -> TelnetConfig {
        TelnetConfig {
            enabled: true,
            port: 0,
            user: String::new(),
            password: String::new(),
        }
    }

    #[tokio::test]
    async fn test_overflow_connection_gets_busy_reply() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // fill every slot with a live session that never finishes
        let slots: Arc<Mutex<Vec<Option<Session>>>> =
            Arc::new(Mutex::new((0..MAX_SESSIONS).map(|_| None).collect()));
        let mut keep_open = Vec::new();
        {
            let mut guard = slots.lock().unwrap();
            for id in 0..MAX_SESSIONS {
                let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
                keep_open.push(rx);
                guard[id] = Some(Session {
                    id,
                    tx,
                    handle: tokio::spawn(std::future::pending()),
                });
            }
        }
        tokio::spawn(accept_loop(listener, slots, empty_conf()));

        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut reply = String::new();
        client.read_to_string(&mut reply).await.unwrap();
        assert_eq!(reply, "Server is busy. Try again later.\r\n");
    }

    #[tokio::test]
    async fn test_free_slot_gets_a_session() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let slots: Arc<Mutex<Vec<Option<Session>>>> =
            Arc::new(Mutex::new((0..MAX_SESSIONS).map(|_| None).collect()));
        tokio::spawn(accept_loop(listener, slots, empty_conf()));

        // no password configured, the welcome comes straight away
        let client = TcpStream::connect(addr).await.unwrap();
        let mut lines = BufReader::new(client).lines();
        let greeting = lines.next_line().await.unwrap().unwrap();
        assert!(greeting.starts_with("Welcome!"), "got {greeting:?}");
    }

    #[test]
    fn test_parse_command_vocabulary() {
        assert!(matches!(parse_command("exit"), CommandAction::Close));
        assert!(matches!(parse_command("raw"), CommandAction::ShowRaw));
        assert!(matches!(parse_command("read"), CommandAction::ForceRead));
        assert!(matches!(parse_command("reboot"), CommandAction::Reboot));
        assert!(matches!(parse_command("help"), CommandAction::Reply(_)));
    }

    #[test]
    fn test_unknown_command_gets_a_hint() {
        let CommandAction::Reply(reply) = parse_command("frobnicate") else {
            panic!("unknown input must reply, not act");
        };
        assert!(reply.contains("help"));
    }

    #[tokio::test]
    async fn test_congested_session_is_evicted_from_broadcast() {
        let (_tx, rx) = mpsc::channel(1);
        let console = SessionConsole::new(
            TelnetConfig {
                enabled: true,
                port: 0,
                user: String::new(),
                password: String::new(),
            },
            rx,
        );

        // a session that never drains its queue, and a healthy one
        let (stuck_tx, _stuck_rx_kept) = mpsc::channel(1);
        let (healthy_tx, mut healthy_rx) = mpsc::channel(OUTBOUND_QUEUE);
        {
            let mut slots = console.slots.lock().unwrap();
            slots[0] = Some(Session {
                id: 0,
                tx: stuck_tx,
                handle: tokio::spawn(std::future::pending()),
            });
            slots[1] = Some(Session {
                id: 1,
                tx: healthy_tx,
                handle: tokio::spawn(std::future::pending()),
            });
        }

        console.broadcast("first telegram\r\n");
        console.broadcast("second telegram\r\n");

        assert_eq!(healthy_rx.recv().await.unwrap(), "first telegram\r\n");
        assert_eq!(healthy_rx.recv().await.unwrap(), "second telegram\r\n");

        let slots = console.slots.lock().unwrap();
        assert!(slots[0].is_none(), "congested session must be dropped");
        assert!(slots[1].is_some());
    }
}
