#![deny(unsafe_code)]

//! Onionkeeper core runtime.
//!
//! Drives an anonymity-network daemon from the outside: launches the process,
//! opens and authenticates its control session, follows bootstrap progress
//! until the first circuit is built, and reconfigures bridges and IP
//! preferences on the live session. The [`Orchestrator`] owns all of it.

use std::future::Future;
use std::pin::Pin;

/// A type-erased, `Send`-safe, boxed future, used as the return type of
/// async trait methods that need dynamic dispatch (`dyn Trait`).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Compile-time build metadata (version, git hash, profile).
pub mod build_info;
/// Event subscriptions and the bootstrap / circuit observers.
pub mod events;
/// IP-capability change handling.
pub mod network;
/// Option model and the bridge / IP option builder.
pub mod options;
/// Lifecycle owner and public operations.
pub mod orchestrator;
/// Daemon process launch and supervision.
pub mod process;
/// Control-protocol codec.
pub mod protocol;
/// Reset-then-apply reconfiguration chain.
pub mod reconfigure;
/// Control-port connection and typed commands.
pub mod session;
/// Transport-plugin endpoints.
pub mod transport;

pub use events::{Disposition, EventClass, EventRegistry, SubscriptionId};
pub use options::{BridgeMode, ConfigBuilder, ConfigOption, IpCapability};
pub use orchestrator::{ListenerAddresses, ListenerKind, Orchestrator, SessionState, StartError};
pub use process::{DaemonBinary, DaemonExecutor, ProcessError, ProcessSupervisor};
pub use protocol::{Circuit, CircuitId, ControlEvent};
pub use reconfigure::{ReconfigOutcome, ReconfigurationCoordinator};
pub use session::{ControlSession, SessionError};
pub use transport::{TransportProvisioner, provisioner_from_config};
