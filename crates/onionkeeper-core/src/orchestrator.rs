//! The orchestrator owns every piece of mutable client state and exposes the
//! public lifecycle operations.
//!
//! ## Start sequence
//!
//! ```text
//!  Stopped ─▶ Starting ─▶ ControlConnecting ─▶ Authenticating
//!     ▲                                              │
//!     │ stop() / failure                             ▼
//!     └──────── Running ◀─ CircuitEstablished ◀─ Bootstrapping(n)
//!                 ▲ │
//!                 │ ▼
//!            Reconfiguring
//! ```
//!
//! Each start attempt runs under an epoch number. [`Orchestrator::stop`] bumps
//! the epoch, and a continuation that sees a newer epoch changes nothing and
//! completes with [`StartError::Stopped`].

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use onionkeeper_config::AppConfig;
use serde::Serialize;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::events::{EventClass, bootstrap_observer, circuit_observer};
use crate::network::NetworkStatusReactor;
use crate::options::{
    BridgeMode, BridgeSources, ConfigBuilder, ConfigOption, IpCapability, as_cli_args, render,
    startup_options,
};
use crate::process::{DaemonBinary, DaemonExecutor, ProcessError, ProcessSupervisor};
use crate::protocol::{Circuit, CircuitId};
use crate::reconfigure::{ReconfigOutcome, ReconfigurationCoordinator};
use crate::session::{ControlSession, SessionError};
use crate::transport::{TransportProvisioner, provisioner_from_config};

const SOCKS_LISTENERS: &str = "net/listeners/socks";
const DNS_LISTENERS: &str = "net/listeners/dns";
const CIRCUIT_ESTABLISHED: &str = "status/circuit-established";

/// How long `stop` waits for the daemon process to exit after cancelling it.
const EXIT_GRACE: Duration = Duration::from_secs(5);

/// Which listener the daemon failed to report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerKind {
    Socks,
    Dns,
}

impl fmt::Display for ListenerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenerKind::Socks => write!(f, "SOCKS"),
            ListenerKind::Dns => write!(f, "DNS"),
        }
    }
}

/// Why a start attempt failed. Returned once per attempt, never retried.
#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("failed to start daemon: {0}")]
    ProcessStartFailure(#[source] ProcessError),

    #[error("failed to connect to control port: {0}")]
    ControlConnectFailure(#[source] SessionError),

    #[error("{0}")]
    CookieUnreadable(#[source] SessionError),

    #[error("control authentication failed: {0}")]
    AuthFailure(#[source] SessionError),

    #[error("daemon reported no {0} listener")]
    ListenerAddressMissing(ListenerKind),

    #[error("control connection lost before the first circuit")]
    SessionLost,

    #[error("start abandoned by stop")]
    Stopped,
}

/// Lifecycle state of the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum SessionState {
    #[default]
    Stopped,
    Starting,
    ControlConnecting,
    Authenticating,
    Bootstrapping(u8),
    CircuitEstablished,
    Running,
    Reconfiguring,
}

impl SessionState {
    fn rank(self) -> u8 {
        match self {
            SessionState::Stopped => 0,
            SessionState::Starting => 1,
            SessionState::ControlConnecting => 2,
            SessionState::Authenticating => 3,
            SessionState::Bootstrapping(_) => 4,
            SessionState::CircuitEstablished => 5,
            SessionState::Running | SessionState::Reconfiguring => 6,
        }
    }

    /// Whether moving from `self` to `next` keeps the lifecycle monotonic.
    /// `Stopped` is always reachable; `Running` and `Reconfiguring` alternate.
    pub fn can_advance_to(self, next: SessionState) -> bool {
        match (self, next) {
            (_, SessionState::Stopped) => true,
            (SessionState::Running, SessionState::Reconfiguring)
            | (SessionState::Reconfiguring, SessionState::Running) => true,
            (SessionState::Bootstrapping(a), SessionState::Bootstrapping(b)) => b > a,
            (current, next) => next.rank() > current.rank(),
        }
    }

    /// Whether a session is up and the first circuit has been built.
    pub fn is_live(self) -> bool {
        matches!(self, SessionState::Running | SessionState::Reconfiguring)
    }
}

/// Local proxy addresses reported by the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListenerAddresses {
    pub socks: String,
    pub dns: String,
}

struct Inner {
    config: AppConfig,
    sources: BridgeSources,
    provisioner: Arc<dyn TransportProvisioner>,
    bridge_mode: AtomicU8,
    ip_capability: AtomicU8,
    state: watch::Sender<SessionState>,
    epoch: watch::Sender<u64>,
    session: tokio::sync::Mutex<Option<Arc<ControlSession>>>,
    supervisor: Mutex<ProcessSupervisor>,
    start_lock: tokio::sync::Mutex<()>,
    reconfig_lock: tokio::sync::Mutex<()>,
    reactor_spawned: AtomicBool,
}

impl Inner {
    fn is_current(&self, epoch: u64) -> bool {
        *self.epoch.borrow() == epoch
    }

    /// Move to `next` if `epoch` is still current and the move is monotonic.
    fn advance(&self, epoch: u64, next: SessionState) -> bool {
        self.state.send_if_modified(|state| {
            if self.is_current(epoch) && state.can_advance_to(next) {
                debug!(from = ?*state, to = ?next, "State change");
                *state = next;
                true
            } else {
                false
            }
        })
    }

    /// Like [`advance`](Self::advance), but only a stale epoch is an error.
    fn step(&self, epoch: u64, next: SessionState) -> Result<(), StartError> {
        if self.advance(epoch, next) || self.is_current(epoch) {
            Ok(())
        } else {
            Err(StartError::Stopped)
        }
    }

    fn swap_state(&self, from: SessionState, to: SessionState) -> bool {
        self.state.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        })
    }

    fn supervisor(&self) -> MutexGuard<'_, ProcessSupervisor> {
        self.supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Cancel the daemon and wait, bounded by [`EXIT_GRACE`], for it to exit.
    /// Returns `false` if there was no daemon.
    async fn stop_daemon(&self) -> bool {
        let Some(task) = self.supervisor().cancel() else {
            return false;
        };
        if tokio::time::timeout(EXIT_GRACE, task).await.is_err() {
            warn!(grace_secs = EXIT_GRACE.as_secs(), "Daemon still running after stop");
        }
        true
    }
}

/// Holds the state at `Reconfiguring` and puts it back to `Running` when
/// dropped, whether the reconfiguration finished or its future was dropped.
/// A `stop` in the meantime wins: the state is only restored from
/// `Reconfiguring`.
struct ReconfigGuard<'a> {
    inner: &'a Inner,
}

impl<'a> ReconfigGuard<'a> {
    fn enter(inner: &'a Inner) -> Option<Self> {
        inner
            .swap_state(SessionState::Running, SessionState::Reconfiguring)
            .then(|| Self { inner })
    }
}

impl Drop for ReconfigGuard<'_> {
    fn drop(&mut self) {
        self.inner
            .swap_state(SessionState::Reconfiguring, SessionState::Running);
    }
}

/// Coordinates the daemon process, its control session and live
/// reconfiguration. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    /// Orchestrator that launches the daemon through `executor`, with the
    /// transport provisioner named in `config`.
    pub fn new(config: AppConfig, executor: Arc<dyn DaemonExecutor>) -> Self {
        let provisioner = provisioner_from_config(&config.transports);
        Self::with_provisioner(config, executor, provisioner)
    }

    pub fn with_provisioner(
        config: AppConfig,
        executor: Arc<dyn DaemonExecutor>,
        provisioner: Arc<dyn TransportProvisioner>,
    ) -> Self {
        let mode = config.bridges.mode.parse().unwrap_or_default();
        let supervisor = ProcessSupervisor::new(executor, config.lock_file());
        let inner = Inner {
            sources: BridgeSources::from_config(&config),
            provisioner,
            bridge_mode: AtomicU8::new(BridgeMode::to_u8(mode)),
            ip_capability: AtomicU8::new(IpCapability::Unknown.to_u8()),
            state: watch::Sender::new(SessionState::Stopped),
            epoch: watch::Sender::new(0),
            session: tokio::sync::Mutex::new(None),
            supervisor: Mutex::new(supervisor),
            start_lock: tokio::sync::Mutex::new(()),
            reconfig_lock: tokio::sync::Mutex::new(()),
            reactor_spawned: AtomicBool::new(false),
            config,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Orchestrator that runs the configured daemon binary.
    pub fn from_config(config: AppConfig) -> Self {
        let executor = Arc::new(DaemonBinary::new(&config.daemon.binary));
        Self::new(config, executor)
    }

    pub fn config(&self) -> &AppConfig {
        &self.inner.config
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    /// Start the daemon, connect and authenticate, and wait for the first
    /// circuit. Returns the SOCKS and DNS listener addresses.
    ///
    /// `on_progress` receives bootstrap progress, non-decreasing, with at
    /// most one value of 100.
    ///
    /// If a live session already exists, nothing is launched: the bridge
    /// options are reapplied through the reset chain and the current
    /// addresses are returned.
    pub async fn start(
        &self,
        mode: BridgeMode,
        on_progress: impl FnMut(u8) + Send + 'static,
    ) -> Result<ListenerAddresses, StartError> {
        let _guard = self.inner.start_lock.lock().await;
        self.set_bridge_mode(mode);

        if let Some(session) = self.live_session().await {
            info!(%mode, "Daemon already running, reconfiguring");
            self.reconfigure().await;
            return query_listeners(&session).await;
        }
        self.discard_stale_session().await;

        let epoch = *self.inner.epoch.borrow();
        let mut epochs = self.inner.epoch.subscribe();
        let result = tokio::select! {
            result = self.launch(epoch, on_progress) => result,
            _ = epochs.wait_for(|current| *current != epoch) => Err(StartError::Stopped),
        };

        match &result {
            Ok(addresses) => {
                info!(socks = %addresses.socks, dns = %addresses.dns, "Daemon ready");
            }
            Err(StartError::Stopped) => info!("Start abandoned"),
            Err(e) => {
                warn!(error = %e, "Start failed");
                self.teardown(epoch).await;
            }
        }
        result
    }

    async fn launch(
        &self,
        epoch: u64,
        mut on_progress: impl FnMut(u8) + Send + 'static,
    ) -> Result<ListenerAddresses, StartError> {
        let inner = &self.inner;
        let config = &inner.config;

        inner.step(epoch, SessionState::Starting)?;
        prepare_directories(config)
            .await
            .map_err(|e| StartError::ProcessStartFailure(ProcessError::Io(e)))?;
        let args = self.daemon_args(self.bridge_mode(), self.ip_capability());
        {
            let mut supervisor = inner.supervisor();
            if !inner.is_current(epoch) {
                return Err(StartError::Stopped);
            }
            if !supervisor.is_running() {
                remove_stale_port_file(config).map_err(StartError::ProcessStartFailure)?;
            }
            let launched = supervisor
                .start(args)
                .map_err(StartError::ProcessStartFailure)?;
            debug!(launched, "Daemon process ready");
        }

        inner.step(epoch, SessionState::ControlConnecting)?;
        tokio::time::sleep(Duration::from_millis(config.daemon.settle_delay_ms)).await;
        let deadline = Instant::now() + Duration::from_secs(config.daemon.connect_timeout_secs);
        let session = ControlSession::connect_before(&config.control_port_file(), deadline)
            .await
            .map_err(StartError::ControlConnectFailure)?;
        let session = Arc::new(session);

        inner.step(epoch, SessionState::Authenticating)?;
        session
            .authenticate_with_cookie_file(&config.cookie_file())
            .await
            .map_err(|e| match e {
                SessionError::CookieUnreadable { .. } => StartError::CookieUnreadable(e),
                e => StartError::AuthFailure(e),
            })?;

        {
            let mut slot = inner.session.lock().await;
            if !inner.is_current(epoch) {
                session.close();
                return Err(StartError::Stopped);
            }
            *slot = Some(Arc::clone(&session));
        }

        // Subscribe before enabling events so that none are missed.
        let weak: Weak<Inner> = Arc::downgrade(inner);
        session.subscribe(
            EventClass::Bootstrap,
            bootstrap_observer(move |progress| {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                if inner.is_current(epoch) {
                    inner.advance(epoch, SessionState::Bootstrapping(progress));
                    on_progress(progress);
                }
            }),
        );
        let (established_tx, established_rx) = oneshot::channel();
        let circuit_sub = session.subscribe(
            EventClass::CircuitEstablished,
            circuit_observer(move || {
                let _ = established_tx.send(());
            }),
        );

        session
            .set_events(&["STATUS_CLIENT"])
            .await
            .map_err(session_lost)?;
        inner.step(epoch, SessionState::Bootstrapping(0))?;

        let already_established = session
            .get_info(&[CIRCUIT_ESTABLISHED])
            .await
            .map_err(session_lost)?
            .get(CIRCUIT_ESTABLISHED)
            .is_some_and(|v| v == "1");
        if already_established {
            debug!("Circuit already established");
            session.unsubscribe(circuit_sub);
        } else {
            tokio::select! {
                established = established_rx => established.map_err(|_| StartError::SessionLost)?,
                _ = session.closed() => return Err(StartError::SessionLost),
            }
        }
        inner.step(epoch, SessionState::CircuitEstablished)?;

        let addresses = query_listeners(&session).await?;
        inner.step(epoch, SessionState::Running)?;
        Ok(addresses)
    }

    /// Disconnect and stop the daemon. Abandons an in-flight start. Safe to
    /// call any number of times.
    pub async fn stop(&self) {
        self.inner.epoch.send_modify(|epoch| *epoch += 1);
        let session = self.inner.session.lock().await.take();
        if let Some(session) = &session {
            session.close();
        }
        let stopped = self.inner.stop_daemon().await;
        self.inner.state.send_replace(SessionState::Stopped);
        if session.is_some() || stopped {
            info!("Daemon stopped");
        } else {
            debug!("Stop requested while already stopped");
        }
    }

    /// Undo a failed attempt, unless `stop` already did.
    async fn teardown(&self, epoch: u64) {
        if !self.inner.is_current(epoch) {
            return;
        }
        if let Some(session) = self.inner.session.lock().await.take() {
            session.close();
        }
        self.inner.stop_daemon().await;
        self.inner.advance(epoch, SessionState::Stopped);
    }

    /// Drop a session left behind by a daemon that went away.
    async fn discard_stale_session(&self) {
        if let Some(session) = self.inner.session.lock().await.take() {
            debug!("Discarding stale control session");
            session.close();
        }
        self.inner.state.send_replace(SessionState::Stopped);
    }

    // ── Circuits ────────────────────────────────────────────────────────

    /// The daemon's current circuits.
    pub async fn list_circuits(&self) -> Result<Vec<Circuit>, SessionError> {
        let session = self.connected_session().await?;
        session.circuits().await
    }

    /// Close each circuit in `ids`, in order, continuing past failures.
    /// Returns `true` if every close succeeded.
    pub async fn close_circuits(&self, ids: &[CircuitId]) -> Result<bool, SessionError> {
        let session = self.connected_session().await?;
        let mut all_closed = true;
        for id in ids {
            if let Err(e) = session.close_circuit(id).await {
                warn!(circuit = %id, error = %e, "Failed to close circuit");
                all_closed = false;
            }
        }
        Ok(all_closed)
    }

    // ── Reconfiguration ─────────────────────────────────────────────────

    pub fn set_bridge_mode(&self, mode: BridgeMode) {
        self.inner
            .bridge_mode
            .store(mode.to_u8(), Ordering::Release);
    }

    pub fn bridge_mode(&self) -> BridgeMode {
        BridgeMode::from_u8(self.inner.bridge_mode.load(Ordering::Acquire))
    }

    pub fn set_ip_capability(&self, capability: IpCapability) {
        self.inner
            .ip_capability
            .store(capability.to_u8(), Ordering::Release);
    }

    pub fn ip_capability(&self) -> IpCapability {
        IpCapability::from_u8(self.inner.ip_capability.load(Ordering::Acquire))
    }

    /// Reset the bridge options on the live session and apply the full option
    /// set for the current bridge mode and IP capability.
    pub async fn reconfigure(&self) -> ReconfigOutcome {
        self.reconfigure_with(true).await
    }

    /// Record a new IP capability and, if a session is live, apply the
    /// recomputed options and reset connections.
    pub async fn handle_ip_change(&self, capability: IpCapability) -> ReconfigOutcome {
        self.set_ip_capability(capability);
        self.reconfigure_with(false).await
    }

    async fn reconfigure_with(&self, reset_first: bool) -> ReconfigOutcome {
        let _guard = self.inner.reconfig_lock.lock().await;
        let Some(session) = self.live_session().await else {
            debug!("No live session, skipping reconfiguration");
            return ReconfigOutcome::NotLive;
        };
        let Some(_reconfiguring) = ReconfigGuard::enter(&self.inner) else {
            info!(state = ?self.state(), "Session not running, skipping reconfiguration");
            return ReconfigOutcome::NotLive;
        };

        let options = self.live_options(self.bridge_mode(), self.ip_capability());
        let coordinator = ReconfigurationCoordinator::new(&session);
        if reset_first {
            coordinator.run(&options).await
        } else {
            coordinator.apply(&options).await
        }
    }

    /// Start the network reactor. Only the first call per orchestrator
    /// spawns anything.
    pub fn spawn_network_reactor(
        &self,
        updates: watch::Receiver<IpCapability>,
    ) -> Option<JoinHandle<()>> {
        if self.inner.reactor_spawned.swap(true, Ordering::AcqRel) {
            debug!("Network reactor already running");
            return None;
        }
        let reactor = NetworkStatusReactor::new(self.clone(), updates);
        Some(tokio::spawn(reactor.run()))
    }

    // ── Options ─────────────────────────────────────────────────────────

    /// Bridge and IP options for a live session.
    pub fn live_options(&self, mode: BridgeMode, ip: IpCapability) -> Vec<ConfigOption> {
        ConfigBuilder::new(&self.inner.sources, self.inner.provisioner.as_ref()).build(mode, ip)
    }

    /// Full daemon command line: the fixed startup options followed by the
    /// bridge and IP options.
    pub fn daemon_args(&self, mode: BridgeMode, ip: IpCapability) -> Vec<String> {
        let mut options = startup_options(&self.inner.config);
        options.extend(self.live_options(mode, ip));
        render(&options, as_cli_args)
    }

    // ── State ───────────────────────────────────────────────────────────

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    /// The session, if the orchestrator is running and it is still connected.
    async fn live_session(&self) -> Option<Arc<ControlSession>> {
        if !self.state().is_live() {
            return None;
        }
        self.inner
            .session
            .lock()
            .await
            .as_ref()
            .filter(|session| session.is_connected())
            .cloned()
    }

    async fn connected_session(&self) -> Result<Arc<ControlSession>, SessionError> {
        self.inner
            .session
            .lock()
            .await
            .as_ref()
            .filter(|session| session.is_connected())
            .cloned()
            .ok_or(SessionError::NotConnected)
    }
}

fn session_lost(e: SessionError) -> StartError {
    warn!(error = %e, "Control session failed during bootstrap");
    StartError::SessionLost
}

async fn query_listeners(session: &ControlSession) -> Result<ListenerAddresses, StartError> {
    let mut info = session
        .get_info(&[SOCKS_LISTENERS, DNS_LISTENERS])
        .await
        .map_err(|e| match e {
            SessionError::Closed | SessionError::Io(_) => StartError::SessionLost,
            e => {
                warn!(error = %e, "Listener query rejected");
                StartError::ListenerAddressMissing(ListenerKind::Socks)
            }
        })?;
    let mut take = |key: &str, kind: ListenerKind| {
        info.remove(key)
            .filter(|addr| !addr.is_empty())
            .ok_or(StartError::ListenerAddressMissing(kind))
    };
    Ok(ListenerAddresses {
        socks: take(SOCKS_LISTENERS, ListenerKind::Socks)?,
        dns: take(DNS_LISTENERS, ListenerKind::Dns)?,
    })
}

async fn prepare_directories(config: &AppConfig) -> std::io::Result<()> {
    tokio::fs::create_dir_all(&config.daemon.data_dir).await?;
    tokio::fs::create_dir_all(&config.daemon.auth_dir).await?;
    if let Some(parent) = config.daemon.log_file.as_deref().and_then(|p| p.parent()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    Ok(())
}

fn remove_stale_port_file(config: &AppConfig) -> Result<(), ProcessError> {
    match std::fs::remove_file(config.control_port_file()) {
        Ok(()) => {
            debug!("Removed stale control-port file");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(ProcessError::Io(e)),
    }
}
