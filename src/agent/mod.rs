//! Lifecycle orchestration: wires configuration into reader threads and the
//! aggregator, and coordinates graceful shutdown.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::Config;
use crate::feed::LiveFeed;
use crate::reader::{PortError, PortReader};
use crate::sensor::SensorTable;
use crate::sink::{Aggregator, AggregatorOptions};

/// Agent owns all components: port readers, the aggregator, and the feed.
pub struct Agent {
    cfg: Config,
    table: Arc<SensorTable>,
    feed: Arc<LiveFeed>,
    readers: Vec<PortReader>,
    aggregator: Option<Aggregator>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("ports", &self.cfg.ports.len())
            .field("readers", &self.readers.len())
            .field("aggregator", &self.aggregator.is_some())
            .finish()
    }
}

impl Agent {
    /// Creates an agent from validated configuration.
    ///
    /// Descriptor construction happens here, so configuration errors (a
    /// `key` dtype without a key value, unknown field types) abort setup
    /// instead of surfacing mid-stream.
    pub fn new(cfg: Config) -> Result<Self> {
        let table = SensorTable::from_config(&cfg).context("building sensor table")?;

        Ok(Self {
            cfg,
            table: Arc::new(table),
            feed: Arc::new(LiveFeed::new()),
            readers: Vec::new(),
            aggregator: None,
            cancel: CancellationToken::new(),
        })
    }

    /// Spawns one reader thread per configured port and starts the
    /// aggregator tick loop.
    pub async fn start(&mut self) -> Result<()> {
        let (sample_tx, sample_rx) = unbounded_channel();
        let (error_tx, error_rx) = unbounded_channel();

        for (name, port_cfg) in &self.cfg.ports {
            let descriptors = self.table.for_port(&self.cfg, name);
            info!(
                port = %name,
                sensors = descriptors.len(),
                listener = port_cfg.listener,
                "starting port reader",
            );

            let reader = PortReader::new(
                name.clone(),
                port_cfg.clone(),
                descriptors,
                self.cfg.infer_limit,
                sample_tx.clone(),
                error_tx.clone(),
                self.cancel.child_token(),
            );
            reader.start();
            self.readers.push(reader);
        }

        let mut aggregator = Aggregator::new(
            AggregatorOptions::from(&self.cfg),
            vec![sample_rx],
            Arc::clone(&self.table),
            Arc::clone(&self.feed),
        )
        .context("creating aggregator")?;
        aggregator.start().await;
        self.aggregator = Some(aggregator);

        self.spawn_error_monitor(error_rx);

        info!(ports = self.readers.len(), "agent fully started");

        Ok(())
    }

    /// Gracefully stop all components: signal readers, join their threads,
    /// then stop the aggregator so its final flush sees everything the
    /// readers enqueued.
    pub async fn stop(&mut self) -> Result<()> {
        self.cancel.cancel();

        // Bounded wait: an in-flight blocking read completes within the
        // configured port timeout.
        for reader in &self.readers {
            reader.stop();
        }

        if let Some(aggregator) = self.aggregator.take() {
            aggregator
                .stop()
                .await
                .context("stopping aggregator")?;
        }

        info!("agent stopped");

        Ok(())
    }

    /// Latest-value feed handle for the plot renderer.
    pub fn feed(&self) -> Arc<LiveFeed> {
        Arc::clone(&self.feed)
    }

    /// Readiness probe, true once the aggregator has warmed up.
    pub async fn ready(&self, timeout: Duration) -> bool {
        match &self.aggregator {
            Some(aggregator) => aggregator.ready(timeout).await,
            None => false,
        }
    }

    /// Surfaces reader failures without taking down siblings: a port that
    /// fails to open is reported once and the remaining ports continue.
    fn spawn_error_monitor(&self, mut error_rx: UnboundedReceiver<PortError>) {
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    marker = error_rx.recv() => match marker {
                        Some(PortError { port, error }) => {
                            error!(port = %port, error = %error, "port reader failed");
                        }
                        None => return,
                    },
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_missing_device() -> Config {
        serde_yaml::from_str(
            r#"
interval: 5ms
ports:
  ghost:
    device: /dev/livemon-test-does-not-exist
    timeout: 5ms
sensors:
  weight:
    port: ghost
    key: W
    dtype: [key, int, float]
"#,
        )
        .expect("valid yaml")
    }

    #[test]
    fn test_new_rejects_bad_descriptor() {
        let cfg: Config = serde_yaml::from_str(
            r#"
ports:
  a: {}
sensors:
  s:
    port: a
    dtype: [key, int]
"#,
        )
        .expect("valid yaml");

        // `key` in dtype with no key value is a setup-time error.
        let err = Agent::new(cfg).expect_err("must fail");
        assert!(err.to_string().contains("building sensor table"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_open_failure_does_not_poison_lifecycle() {
        let mut agent = Agent::new(config_with_missing_device()).expect("agent");

        agent.start().await.expect("start");
        // The reader reports its open failure and exits; the aggregator and
        // the rest of the agent keep running until stopped.
        tokio::time::sleep(Duration::from_millis(50)).await;

        agent.stop().await.expect("stop");
        agent.stop().await.expect("second stop is a no-op");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_ready_is_false_before_start() {
        let agent = Agent::new(config_with_missing_device()).expect("agent");
        assert!(!agent.ready(Duration::from_millis(1)).await);
    }
}
