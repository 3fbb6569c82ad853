use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::signal;
use tracing::{info, warn};

use crate::config::Config;
use crate::correlator::RpcCorrelator;
use crate::relay_server::RelayServer;
use crate::transport::{ProcessLauncher, WorkerLauncher};

/// Builds the correlator for the configured worker command.
pub fn build_correlator(
    config: &Config,
    config_path: Option<&std::path::Path>,
) -> Result<Arc<RpcCorrelator>> {
    let launcher: Arc<dyn WorkerLauncher> =
        Arc::new(ProcessLauncher::from_config(&config.worker, config_path)?);
    Ok(Arc::new(RpcCorrelator::new(
        launcher,
        Duration::from_millis(config.worker.request_timeout_ms),
        config.worker.handshake,
    )))
}

pub struct RelayRuntime {
    config: Config,
    correlator: Arc<RpcCorrelator>,
}

impl RelayRuntime {
    pub fn new(config: Config, config_path: Option<PathBuf>) -> Result<Self> {
        let correlator = build_correlator(&config, config_path.as_deref())?;
        Ok(Self { config, correlator })
    }

    pub async fn run(self) -> Result<()> {
        info!(
            "starting relay (bind={}, http_bind={}, origins={}, request_timeout_ms={}, handshake={})",
            self.config.relay.bind,
            self.config.relay.http_bind.as_deref().unwrap_or("-"),
            self.config.relay.allowed_origins.join(","),
            self.config.worker.request_timeout_ms,
            self.config.worker.handshake
        );

        // The relay still serves after a failed first start; clients can send reconnect-mcp.
        if let Err(err) = self.correlator.start().await {
            warn!("initial worker start failed: {err}");
        }

        let server = RelayServer::new(self.config.relay.clone(), self.correlator.clone());
        let result = tokio::select! {
            res = server.run_forever() => res,
            _ = signal::ctrl_c() => {
                info!("received ctrl-c, shutting down");
                Ok(())
            }
        };
        self.correlator.stop().await;
        result
    }
}
