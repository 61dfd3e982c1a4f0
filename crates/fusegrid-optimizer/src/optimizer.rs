//! The optimizer loop.

use std::sync::Arc;

use fusegrid_mapper::{GroupMapper, UpdateReport};
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::strategy::Strategy;

pub struct Optimizer {
    mapper: Arc<GroupMapper>,
    strategy: Box<dyn Strategy>,
}

impl Optimizer {
    pub fn new(mapper: Arc<GroupMapper>, strategy: Box<dyn Strategy>) -> Self {
        Self { mapper, strategy }
    }

    /// Run until `shutdown` changes or its sender goes away.
    ///
    /// Shutdown is only observed while waiting; an update that already
    /// started runs to completion first.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(strategy = self.strategy.name(), "Optimizer started");

        loop {
            let wait = self.strategy.sleep();
            debug!(wait_ms = wait.as_millis() as u64, "Optimizer waiting");
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown.changed() => {
                    info!("Optimizer shutting down");
                    break;
                }
            }
            self.step().await;
        }
    }

    /// One optimize-and-apply round. `None` when the update failed.
    pub async fn step(&mut self) -> Option<UpdateReport> {
        let current = self.mapper.setup().await;
        let desired = self.strategy.optimize(&current);
        match self.mapper.update(desired).await {
            Ok(report) => {
                if !report.is_noop() {
                    info!(
                        deployed = report.deployed.len(),
                        deleted = report.deleted.len(),
                        residue = report.residue.len(),
                        "Optimizer applied new partition"
                    );
                }
                Some(report)
            }
            Err(e) => {
                error!(strategy = self.strategy.name(), error = %e, "Optimizer update failed");
                None
            }
        }
    }
}
