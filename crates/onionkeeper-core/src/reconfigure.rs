//! Live reconfiguration of a running daemon.
//!
//! The bridge-related options are reset one at a time, then the full new
//! option set is applied in one batch, then the daemon is told to rebuild its
//! connections. Every step is gated on the one before it. Failures are logged
//! and reported through [`ReconfigOutcome`]; they never raise an error, and a
//! failed reset leaves the previous configuration untouched.

use tracing::{debug, info, warn};

use crate::options::ConfigOption;
use crate::session::{ControlSession, SessionError};

/// Options cleared before a new bridge configuration is applied, in order.
pub const RESET_SEQUENCE: [&str; 3] = ["UseBridges", "ClientTransportPlugin", "Bridge"];

/// How far a reconfiguration got.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconfigOutcome {
    /// Options applied and connections reset.
    Applied,
    /// A reset step failed; nothing was applied.
    ResetAborted { key: &'static str, reason: String },
    /// Resets succeeded but `SETCONF` was rejected.
    ApplyFailed { reason: String },
    /// Options applied, but the connection reset failed.
    ReconnectFailed { reason: String },
    /// No live session to reconfigure.
    NotLive,
}

impl ReconfigOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, ReconfigOutcome::Applied)
    }
}

/// Drives the reset-then-apply chain over one control session.
pub struct ReconfigurationCoordinator<'a> {
    session: &'a ControlSession,
}

impl<'a> ReconfigurationCoordinator<'a> {
    pub fn new(session: &'a ControlSession) -> Self {
        Self { session }
    }

    /// Reset the bridge options, then apply `options` and reset connections.
    pub async fn run(&self, options: &[ConfigOption]) -> ReconfigOutcome {
        for key in RESET_SEQUENCE {
            if let Err(e) = self.session.reset_conf(key).await {
                warn!(key, error = %e, "Reconfiguration aborted, previous settings kept");
                return ReconfigOutcome::ResetAborted {
                    key,
                    reason: e.to_string(),
                };
            }
            debug!(key, "Option reset");
        }
        self.apply(options).await
    }

    /// Apply `options` without resetting first, then reset connections.
    pub async fn apply(&self, options: &[ConfigOption]) -> ReconfigOutcome {
        if let Err(e) = self.session.set_conf(options).await {
            warn!(error = %e, "Failed to apply options");
            return ReconfigOutcome::ApplyFailed {
                reason: e.to_string(),
            };
        }
        info!(count = options.len(), "Options applied");

        match self.reset_connection().await {
            Ok(()) => ReconfigOutcome::Applied,
            Err(e) => {
                warn!(error = %e, "Connection reset failed");
                ReconfigOutcome::ReconnectFailed {
                    reason: e.to_string(),
                }
            }
        }
    }

    /// Reload the daemon and close every open circuit so new ones are built
    /// under the current configuration. Circuit closures are best effort.
    pub async fn reset_connection(&self) -> Result<(), SessionError> {
        self.session.signal("RELOAD").await?;

        let circuits = match self.session.circuits().await {
            Ok(circuits) => circuits,
            Err(e) => {
                debug!(error = %e, "Could not list circuits after reload");
                return Ok(());
            }
        };
        let mut closed = 0usize;
        for circuit in &circuits {
            match self.session.close_circuit(&circuit.id).await {
                Ok(()) => closed += 1,
                Err(e) => debug!(circuit = %circuit.id, error = %e, "Circuit close failed"),
            }
        }
        debug!(closed, total = circuits.len(), "Connections reset");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, duplex};

    /// Answers RESETCONF for keys in `failing` with 552, CLOSECIRCUIT with
    /// 250, a fixed two-circuit table, and 250 for everything else.
    async fn serve(
        stream: tokio::io::DuplexStream,
        failing: &'static [&'static str],
    ) -> Vec<String> {
        let (read_half, mut write_half) = tokio::io::split(stream);
        let mut lines = BufReader::new(read_half).lines();
        let mut seen = Vec::new();
        while let Ok(Some(line)) = lines.next_line().await {
            let reply = if line
                .strip_prefix("RESETCONF ")
                .is_some_and(|key| failing.iter().any(|k| *k == key))
            {
                "552 Unrecognized option\r\n".to_string()
            } else if line == "GETINFO circuit-status" {
                "250+circuit-status=\r\n1 BUILT $A~a,$B~b PURPOSE=GENERAL\r\n\
                 2 BUILT $C~c PURPOSE=GENERAL\r\n.\r\n250 OK\r\n"
                    .to_string()
            } else {
                "250 OK\r\n".to_string()
            };
            seen.push(line);
            if write_half.write_all(reply.as_bytes()).await.is_err() {
                break;
            }
        }
        seen
    }

    fn options() -> Vec<ConfigOption> {
        vec![
            ConfigOption::new("UseBridges", "0"),
            ConfigOption::new("ClientUseIPv6", "1"),
        ]
    }

    #[tokio::test]
    async fn test_full_chain() {
        let (client, server) = duplex(8192);
        let peer = tokio::spawn(serve(server, &[]));
        let session = ControlSession::from_stream(client);

        let outcome = ReconfigurationCoordinator::new(&session)
            .run(&options())
            .await;
        assert!(outcome.is_applied());

        drop(session);
        let seen = peer.await.unwrap();
        assert_eq!(
            seen,
            vec![
                "RESETCONF UseBridges",
                "RESETCONF ClientTransportPlugin",
                "RESETCONF Bridge",
                "SETCONF UseBridges=\"0\" ClientUseIPv6=\"1\"",
                "SIGNAL RELOAD",
                "GETINFO circuit-status",
                "CLOSECIRCUIT 1",
                "CLOSECIRCUIT 2",
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_reset_never_applies() {
        let (client, server) = duplex(8192);
        let peer = tokio::spawn(serve(server, &["ClientTransportPlugin"]));
        let session = ControlSession::from_stream(client);

        let outcome = ReconfigurationCoordinator::new(&session)
            .run(&options())
            .await;
        assert!(matches!(
            outcome,
            ReconfigOutcome::ResetAborted {
                key: "ClientTransportPlugin",
                ..
            }
        ));

        drop(session);
        let seen = peer.await.unwrap();
        assert_eq!(
            seen,
            vec!["RESETCONF UseBridges", "RESETCONF ClientTransportPlugin"]
        );
    }

    #[tokio::test]
    async fn test_closed_session_reports_apply_failure() {
        let (client, _server) = duplex(8192);
        let session = ControlSession::from_stream(client);
        session.close();

        let outcome = ReconfigurationCoordinator::new(&session)
            .apply(&options())
            .await;
        assert!(matches!(outcome, ReconfigOutcome::ApplyFailed { .. }));
    }
}
