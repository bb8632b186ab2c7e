//! A scripted stand-in for the real daemon.
//!
//! [`FakeDaemon`] implements [`DaemonExecutor`]. Each launch binds a loopback
//! control port, writes the cookie, lock and control-port files where the
//! real daemon would, and answers control commands according to a
//! [`FakeDaemonScript`]. Everything it receives is recorded for assertions.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use onionkeeper_config::AppConfig;
use onionkeeper_core::{BoxFuture, DaemonExecutor, ProcessError};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tracing::debug;

/// How the fake daemon behaves.
#[derive(Debug, Clone)]
pub struct FakeDaemonScript {
    /// Cookie written to the cookie file and expected in `AUTHENTICATE`.
    pub cookie: Vec<u8>,
    pub write_cookie: bool,
    /// Write the control-port file. Without it the client never finds the
    /// port.
    pub write_port_file: bool,
    /// Reject every `AUTHENTICATE`, even with the right cookie.
    pub reject_auth: bool,
    /// Progress values sent as `BOOTSTRAP` events after `SETEVENTS`.
    pub bootstrap: Vec<u8>,
    /// Send `CIRCUIT_ESTABLISHED` after the bootstrap events.
    pub announce_circuit: bool,
    /// Close the control connection right after answering `SETEVENTS`.
    pub hang_up_after_events: bool,
    /// Value of `status/circuit-established`.
    pub circuit_already_established: bool,
    /// `None` answers with an empty value.
    pub socks: Option<String>,
    pub dns: Option<String>,
    /// Keys whose `RESETCONF` is rejected.
    pub failing_resets: Vec<String>,
    /// `circuit-status` body, one circuit per line.
    pub circuits: Vec<String>,
    /// Circuit ids whose `CLOSECIRCUIT` is rejected.
    pub failing_closes: Vec<String>,
    /// Fail the launch itself.
    pub spawn_error: bool,
}

impl Default for FakeDaemonScript {
    fn default() -> Self {
        Self {
            cookie: vec![0x5a; 32],
            write_cookie: true,
            write_port_file: true,
            reject_auth: false,
            bootstrap: vec![0, 10, 50, 100],
            announce_circuit: true,
            hang_up_after_events: false,
            circuit_already_established: false,
            socks: Some("127.0.0.1:9150".to_string()),
            dns: Some("127.0.0.1:5353".to_string()),
            failing_resets: Vec::new(),
            circuits: vec![
                "1 BUILT $AAAA~alpha,$BBBB~beta,$CCCC~gamma PURPOSE=GENERAL".to_string(),
                "2 BUILT $DDDD~delta,$EEEE~epsilon PURPOSE=HS_CLIENT_REND".to_string(),
            ],
            failing_closes: Vec::new(),
            spawn_error: false,
        }
    }
}

#[derive(Debug, Default)]
struct Record {
    launches: Vec<Vec<String>>,
    cancellations: usize,
    commands: Vec<String>,
}

/// Scripted [`DaemonExecutor`].
pub struct FakeDaemon {
    script: Arc<FakeDaemonScript>,
    lock_file: PathBuf,
    cookie_file: PathBuf,
    port_file: PathBuf,
    record: Arc<Mutex<Record>>,
}

impl FakeDaemon {
    /// Fake daemon that writes its files where `config` says they live.
    pub fn new(config: &AppConfig, script: FakeDaemonScript) -> Arc<Self> {
        Arc::new(Self {
            script: Arc::new(script),
            lock_file: config.lock_file(),
            cookie_file: config.cookie_file(),
            port_file: config.control_port_file(),
            record: Arc::new(Mutex::new(Record::default())),
        })
    }

    /// Number of launches so far.
    pub fn launches(&self) -> usize {
        self.record.lock().unwrap().launches.len()
    }

    /// Arguments of the most recent launch.
    pub fn last_args(&self) -> Option<Vec<String>> {
        self.record.lock().unwrap().launches.last().cloned()
    }

    /// Number of times a running instance was cancelled.
    pub fn cancellations(&self) -> usize {
        self.record.lock().unwrap().cancellations
    }

    /// Every control command received, in order.
    pub fn commands(&self) -> Vec<String> {
        self.record.lock().unwrap().commands.clone()
    }

    /// Commands received that start with `verb`.
    pub fn commands_with_verb(&self, verb: &str) -> Vec<String> {
        self.commands()
            .into_iter()
            .filter(|c| c.split(' ').next() == Some(verb))
            .collect()
    }

    pub fn clear_commands(&self) {
        self.record.lock().unwrap().commands.clear();
    }

    fn write_files(&self, port: u16) -> std::io::Result<()> {
        if self.script.write_cookie {
            std::fs::write(&self.cookie_file, &self.script.cookie)?;
        }
        std::fs::write(&self.lock_file, b"")?;
        if self.script.write_port_file {
            std::fs::write(&self.port_file, format!("PORT=127.0.0.1:{port}\n"))?;
        }
        Ok(())
    }
}

impl DaemonExecutor for FakeDaemon {
    fn name(&self) -> &str {
        "fake"
    }

    fn launch(
        &self,
        args: Vec<String>,
        cancel: oneshot::Receiver<()>,
    ) -> Result<BoxFuture<'static, Result<(), ProcessError>>, ProcessError> {
        if self.script.spawn_error {
            return Err(ProcessError::Spawn {
                program: "fake-daemon".to_string(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such binary"),
            });
        }

        let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
        listener.set_nonblocking(true)?;
        let port = listener.local_addr()?.port();
        let listener = TcpListener::from_std(listener)?;
        self.write_files(port)?;
        self.record.lock().unwrap().launches.push(args);
        debug!(port, "Fake daemon listening");

        let script = Arc::clone(&self.script);
        let record = Arc::clone(&self.record);
        let lock_file = self.lock_file.clone();
        Ok(Box::pin(async move {
            tokio::select! {
                _ = cancel => {
                    record.lock().unwrap().cancellations += 1;
                    let _ = std::fs::remove_file(&lock_file);
                }
                _ = serve(listener, script, Arc::clone(&record)) => {}
            }
            Ok(())
        }))
    }
}

async fn serve(listener: TcpListener, script: Arc<FakeDaemonScript>, record: Arc<Mutex<Record>>) {
    while let Ok((stream, _)) = listener.accept().await {
        handle_connection(stream, &script, &record).await;
    }
}

async fn handle_connection(stream: TcpStream, script: &FakeDaemonScript, record: &Mutex<Record>) {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();
    let mut authenticated = false;

    while let Ok(Some(line)) = lines.next_line().await {
        record.lock().unwrap().commands.push(line.clone());
        let (verb, rest) = line.split_once(' ').unwrap_or((line.as_str(), ""));

        let reply = if verb == "AUTHENTICATE" {
            authenticated =
                !script.reject_auth && rest.eq_ignore_ascii_case(&hex::encode(&script.cookie));
            if authenticated {
                "250 OK\r\n".to_string()
            } else {
                let _ = write_half
                    .write_all(b"515 Authentication failed: Wrong cookie.\r\n")
                    .await;
                return;
            }
        } else if !authenticated {
            "514 Authentication required.\r\n".to_string()
        } else {
            respond(script, verb, rest)
        };

        if write_half.write_all(reply.as_bytes()).await.is_err() {
            return;
        }
        if verb == "SETEVENTS" && script.hang_up_after_events {
            debug!("Fake daemon hanging up");
            return;
        }
    }
}

fn respond(script: &FakeDaemonScript, verb: &str, rest: &str) -> String {
    match verb {
        "SETEVENTS" => {
            let mut out = String::from("250 OK\r\n");
            for progress in &script.bootstrap {
                out.push_str(&format!(
                    "650 STATUS_CLIENT NOTICE BOOTSTRAP PROGRESS={progress} TAG=step SUMMARY=\"Step {progress}\"\r\n"
                ));
            }
            if script.announce_circuit {
                out.push_str("650 STATUS_CLIENT NOTICE CIRCUIT_ESTABLISHED\r\n");
            }
            out
        }
        "GETINFO" => get_info(script, rest),
        "RESETCONF" if script.failing_resets.iter().any(|k| k == rest) => {
            format!("552 Unrecognized option: Unknown option '{rest}'\r\n")
        }
        "CLOSECIRCUIT" if script.failing_closes.iter().any(|id| id == rest) => {
            format!("552 Unknown circuit \"{rest}\"\r\n")
        }
        "RESETCONF" | "SETCONF" | "SIGNAL" | "CLOSECIRCUIT" => "250 OK\r\n".to_string(),
        _ => format!("510 Unrecognized command \"{verb}\"\r\n"),
    }
}

fn get_info(script: &FakeDaemonScript, keys: &str) -> String {
    let mut out = String::new();
    for key in keys.split_whitespace() {
        match key {
            "net/listeners/socks" => listener_line(&mut out, key, script.socks.as_deref()),
            "net/listeners/dns" => listener_line(&mut out, key, script.dns.as_deref()),
            "status/circuit-established" => {
                let value = u8::from(script.circuit_already_established);
                out.push_str(&format!("250-{key}={value}\r\n"));
            }
            "circuit-status" => {
                out.push_str("250+circuit-status=\r\n");
                for circuit in &script.circuits {
                    out.push_str(circuit);
                    out.push_str("\r\n");
                }
                out.push_str(".\r\n");
            }
            other => return format!("552 Unrecognized key \"{other}\"\r\n"),
        }
    }
    out.push_str("250 OK\r\n");
    out
}

fn listener_line(out: &mut String, key: &str, addr: Option<&str>) {
    match addr {
        Some(addr) => out.push_str(&format!("250-{key}=\"{addr}\"\r\n")),
        None => out.push_str(&format!("250-{key}=\r\n")),
    }
}

/// Poll `check` every 10 ms until it holds or two seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
