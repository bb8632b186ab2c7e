//! Control session: one authenticated connection to the daemon's control port.
//!
//! ## Architecture
//!
//! ```text
//!  callers ──Request──▶ ┌──────────────┐  command line   ┌──────────┐
//!  (any task)           │ command task │ ───────────────▶│          │
//!      ▲                └──────▲───────┘                 │  daemon  │
//!      │ oneshot               │ replies (in order)      │          │
//!      │                ┌──────┴───────┐  reply / 650    │          │
//!      └────────────────│ reader task  │ ◀───────────────│          │
//!                       └──────┬───────┘                 └──────────┘
//!                              │ events
//!                       ┌──────▼───────┐
//!                       │EventRegistry │
//!                       └──────────────┘
//! ```
//!
//! The command task owns the write half and handles one request at a time:
//! write the command, wait for the next reply, hand it back. Request/response
//! pairs from concurrent callers therefore never interleave on the wire.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};
use zeroize::Zeroizing;

use crate::events::{Disposition, EventClass, EventRegistry, SubscriptionId};
use crate::options::{ConfigOption, as_assignment, render};
use crate::protocol::{
    Circuit, CircuitId, Command, ControlEvent, ProtocolError, Reply, ReplyParser, parse_circuits,
    parse_event, parse_info,
};

/// Pause between attempts to reach the control port.
const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Errors from the control session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("control port not reachable before deadline: {0}")]
    Connect(String),

    #[error("cannot read auth cookie at {path}: {source}")]
    CookieUnreadable {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("daemon rejected authentication: {0}")]
    AuthRejected(String),

    #[error("{command} rejected with {code}: {message}")]
    Rejected {
        command: &'static str,
        code: u16,
        message: String,
    },

    #[error("GETINFO reply lacks {0}")]
    MissingValue(String),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("control connection closed")]
    Closed,

    #[error("no live control session")]
    NotConnected,
}

struct Request {
    command: Command,
    respond: oneshot::Sender<Result<Reply, SessionError>>,
}

/// An open control connection.
///
/// Dropping the session (or calling [`close`](Self::close)) stops both
/// background tasks; in-flight requests then fail with
/// [`SessionError::Closed`].
pub struct ControlSession {
    requests: mpsc::Sender<Request>,
    registry: Arc<EventRegistry>,
    connected: watch::Receiver<bool>,
    closed: AtomicBool,
    tasks: [JoinHandle<()>; 2],
}

impl ControlSession {
    /// Wrap an already-open stream. Spawns the reader and command tasks.
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let registry = Arc::new(EventRegistry::new());
        let (request_tx, request_rx) = mpsc::channel(32);
        let (reply_tx, reply_rx) = mpsc::channel(32);
        let (connected_tx, connected_rx) = watch::channel(true);

        let reader = tokio::spawn(read_loop(
            read_half,
            reply_tx,
            Arc::clone(&registry),
            connected_tx,
        ));
        let writer = tokio::spawn(command_loop(write_half, request_rx, reply_rx));

        Self {
            requests: request_tx,
            registry,
            connected: connected_rx,
            closed: AtomicBool::new(false),
            tasks: [reader, writer],
        }
    }

    /// Open a TCP control connection to `addr`.
    pub async fn connect(addr: SocketAddr) -> Result<Self, SessionError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        debug!(%addr, "Control connection opened");
        Ok(Self::from_stream(stream))
    }

    /// Keep reading the control-port descriptor file and connecting to the
    /// address it names until one attempt succeeds or `deadline` passes.
    pub async fn connect_before(port_file: &Path, deadline: Instant) -> Result<Self, SessionError> {
        let mut last_error = format!("{} was never written", port_file.display());
        loop {
            let attempt = async {
                let addr = read_control_port_file(port_file).await?;
                Self::connect(addr).await
            };
            match tokio::time::timeout_at(deadline, attempt).await {
                Ok(Ok(session)) => return Ok(session),
                Ok(Err(e)) => {
                    trace!(error = %e, "Control port not ready yet");
                    last_error = e.to_string();
                }
                Err(_) => return Err(SessionError::Connect(last_error)),
            }
            if Instant::now() + CONNECT_RETRY_INTERVAL >= deadline {
                return Err(SessionError::Connect(last_error));
            }
            tokio::time::sleep(CONNECT_RETRY_INTERVAL).await;
        }
    }

    /// Whether the connection is still usable.
    pub fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
            && *self.connected.borrow()
            && !self.requests.is_closed()
    }

    /// Resolve once the daemon side of the connection is gone.
    pub async fn closed(&self) {
        let mut connected = self.connected.clone();
        let _ = connected.wait_for(|up| !*up).await;
    }

    /// Stop both background tasks and drop every subscription.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            for task in &self.tasks {
                task.abort();
            }
            self.registry.clear();
            debug!("Control session closed");
        }
    }

    /// Send `command` and return the daemon's reply, whatever its status.
    pub async fn request(&self, command: Command) -> Result<Reply, SessionError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SessionError::Closed);
        }
        let (respond, response) = oneshot::channel();
        self.requests
            .send(Request { command, respond })
            .await
            .map_err(|_| SessionError::Closed)?;
        response.await.map_err(|_| SessionError::Closed)?
    }

    /// Send `command` and require a 2xx reply.
    async fn expect_ok(&self, command: Command) -> Result<Reply, SessionError> {
        let verb = command.verb();
        let reply = self.request(command).await?;
        if reply.is_ok() {
            Ok(reply)
        } else {
            Err(SessionError::Rejected {
                command: verb,
                code: reply.code,
                message: reply.message().to_string(),
            })
        }
    }

    // ── Typed API methods ──────────────────────────────────────────────

    /// Authenticate with raw cookie bytes.
    pub async fn authenticate(&self, cookie: &[u8]) -> Result<(), SessionError> {
        let hex = Zeroizing::new(hex::encode_upper(cookie));
        let reply = self.request(Command::Authenticate(hex)).await?;
        if reply.is_ok() {
            debug!("Control session authenticated");
            Ok(())
        } else {
            Err(SessionError::AuthRejected(reply.message().to_string()))
        }
    }

    /// Read the cookie at `path` and authenticate with it.
    pub async fn authenticate_with_cookie_file(&self, path: &Path) -> Result<(), SessionError> {
        let cookie = read_cookie(path).await?;
        self.authenticate(&cookie).await
    }

    /// Replace the set of asynchronous events the daemon sends.
    pub async fn set_events(&self, events: &[&str]) -> Result<(), SessionError> {
        let events = events.iter().map(|e| e.to_string()).collect();
        self.expect_ok(Command::SetEvents(events)).await.map(drop)
    }

    /// Reset `key` to its default value.
    pub async fn reset_conf(&self, key: &str) -> Result<(), SessionError> {
        self.expect_ok(Command::ResetConf(vec![key.to_string()]))
            .await
            .map(drop)
    }

    /// Apply `options` as one `SETCONF` batch.
    pub async fn set_conf(&self, options: &[ConfigOption]) -> Result<(), SessionError> {
        let pairs = render(options, as_assignment);
        self.expect_ok(Command::SetConf(pairs)).await.map(drop)
    }

    /// Query several info keys in one round trip.
    pub async fn get_info(&self, keys: &[&str]) -> Result<HashMap<String, String>, SessionError> {
        let keys = keys.iter().map(|k| k.to_string()).collect();
        let reply = self.expect_ok(Command::GetInfo(keys)).await?;
        Ok(parse_info(&reply)?)
    }

    /// Send a signal such as `RELOAD` or `NEWNYM`.
    pub async fn signal(&self, name: &str) -> Result<(), SessionError> {
        self.expect_ok(Command::Signal(name.to_string()))
            .await
            .map(drop)
    }

    /// The daemon's current circuit table.
    pub async fn circuits(&self) -> Result<Vec<Circuit>, SessionError> {
        let mut info = self.get_info(&["circuit-status"]).await?;
        let body = info
            .remove("circuit-status")
            .ok_or_else(|| SessionError::MissingValue("circuit-status".to_string()))?;
        Ok(parse_circuits(&body)?)
    }

    /// Close one circuit.
    pub async fn close_circuit(&self, id: &CircuitId) -> Result<(), SessionError> {
        self.expect_ok(Command::CloseCircuit(id.0.clone()))
            .await
            .map(drop)
    }

    /// Register `handler` for events of `class`.
    pub fn subscribe(
        &self,
        class: EventClass,
        handler: impl FnMut(&ControlEvent) -> Disposition + Send + 'static,
    ) -> SubscriptionId {
        self.registry.subscribe(class, handler)
    }

    /// Drop a subscription early.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.registry.unsubscribe(id)
    }

    /// The session's subscription registry.
    pub fn registry(&self) -> &EventRegistry {
        &self.registry
    }
}

impl Drop for ControlSession {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Parse a control-port descriptor file (`PORT=127.0.0.1:9051`).
pub fn parse_control_port(contents: &str) -> Result<SocketAddr, ProtocolError> {
    contents
        .lines()
        .find_map(|line| line.trim().strip_prefix("PORT="))
        .and_then(|addr| addr.parse().ok())
        .ok_or_else(|| ProtocolError::MalformedLine(contents.trim().to_string()))
}

/// Read and parse the control-port descriptor file at `path`.
pub async fn read_control_port_file(path: &Path) -> Result<SocketAddr, SessionError> {
    let contents = tokio::fs::read_to_string(path).await?;
    Ok(parse_control_port(&contents)?)
}

/// Read the binary authentication cookie. The buffer is wiped on drop.
pub async fn read_cookie(path: &Path) -> Result<Zeroizing<Vec<u8>>, SessionError> {
    match tokio::fs::read(path).await {
        Ok(bytes) if !bytes.is_empty() => Ok(Zeroizing::new(bytes)),
        Ok(_) => Err(SessionError::CookieUnreadable {
            path: path.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "cookie file is empty"),
        }),
        Err(source) => Err(SessionError::CookieUnreadable {
            path: path.to_path_buf(),
            source,
        }),
    }
}

async fn read_loop<R>(
    reader: R,
    replies: mpsc::Sender<Reply>,
    registry: Arc<EventRegistry>,
    connected: watch::Sender<bool>,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    let mut parser = ReplyParser::new();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match parser.push_line(&line) {
                Ok(Some(reply)) if reply.is_event() => match parse_event(&reply) {
                    Some(event) => {
                        registry.dispatch(&event);
                    }
                    None => trace!(event = reply.message(), "Ignoring event"),
                },
                Ok(Some(reply)) => {
                    if replies.send(reply).await.is_err() {
                        break;
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Dropping malformed control reply"),
            },
            Ok(None) => {
                debug!("Daemon closed the control connection");
                break;
            }
            Err(e) => {
                warn!(error = %e, "Control connection read failed");
                break;
            }
        }
    }

    connected.send_replace(false);
}

async fn command_loop<W>(
    mut writer: W,
    mut requests: mpsc::Receiver<Request>,
    mut replies: mpsc::Receiver<Reply>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(Request { command, respond }) = requests.recv().await {
        debug!(command = command.verb(), "Control request");
        let result = exchange(&mut writer, &mut replies, &command).await;
        let fatal = matches!(result, Err(SessionError::Closed | SessionError::Io(_)));
        // The caller may have given up waiting; that is fine.
        let _ = respond.send(result);
        if fatal {
            break;
        }
    }
}

async fn exchange<W>(
    writer: &mut W,
    replies: &mut mpsc::Receiver<Reply>,
    command: &Command,
) -> Result<Reply, SessionError>
where
    W: AsyncWrite + Unpin,
{
    let line = command.encode();
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    replies.recv().await.ok_or(SessionError::Closed)
}
