//! Reacts to changes in the reachable IP families.
//!
//! Detection happens elsewhere; this module only consumes a
//! `watch::Receiver<IpCapability>` and forwards every change to the
//! orchestrator, which reconfigures the live session if there is one.

use tokio::sync::watch;
use tracing::{debug, info};

use crate::options::IpCapability;
use crate::orchestrator::Orchestrator;

/// Forwards IP-capability changes to an [`Orchestrator`].
pub struct NetworkStatusReactor {
    orchestrator: Orchestrator,
    updates: watch::Receiver<IpCapability>,
}

impl NetworkStatusReactor {
    pub fn new(orchestrator: Orchestrator, updates: watch::Receiver<IpCapability>) -> Self {
        Self {
            orchestrator,
            updates,
        }
    }

    /// Run until the sending side of the channel is dropped.
    ///
    /// The value current at spawn time is recorded but not acted on; only
    /// subsequent changes trigger a reconfiguration.
    pub async fn run(mut self) {
        let initial = *self.updates.borrow_and_update();
        self.orchestrator.set_ip_capability(initial);
        info!(capability = %initial, "Network reactor started");

        while self.updates.changed().await.is_ok() {
            let capability = *self.updates.borrow_and_update();
            let outcome = self.orchestrator.handle_ip_change(capability).await;
            debug!(capability = %capability, ?outcome, "IP capability change handled");
        }

        info!("Network reactor stopped");
    }
}
