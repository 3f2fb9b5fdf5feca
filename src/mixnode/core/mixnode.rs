//! Top-level mixnode
//!
//! Owns every component (key store, pipeline, relay table, lottery,
//! metrics, transport) and wires them together via constructor injection.
//! The admin surface maps onto the public methods here: start, stop,
//! reload, rotate_keys, metrics and relay-table snapshots.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::core::config::MixnodeConfig;
use crate::core::keystore::KeyStore;
use crate::core::metrics::{MetricsSnapshot, MixnodeMetrics};
use crate::core::protocol_version::{ProtocolVersion, VersionGate};
use crate::core::relay_lottery::RelayLottery;
use crate::core::relay_table::{RelayDescriptor, RelayTable};
use crate::pipeline::{PacketPipeline, PipelineConfig};
use crate::server::tcp::{spawn_egress_forwarder, TcpServer};
use crate::vrf::poisson_delay::PoissonDelayGenerator;
use crate::{MixnodeError, MixnodeTrait, Result};

/// The long-running mixnode process object.
pub struct Mixnode {
    config: RwLock<MixnodeConfig>,
    keystore: KeyStore,
    relay_table: Arc<RelayTable>,
    lottery: RelayLottery,
    metrics: Arc<MixnodeMetrics>,
    pipeline: Arc<PacketPipeline>,
    listen_addr: SocketAddr,
    running: AtomicBool,
    /// Flips once; `stop` is terminal for the process.
    stopped: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    tcp_shutdown: Mutex<Option<tokio::sync::broadcast::Sender<()>>>,
}

impl Mixnode {
    pub fn new(config: MixnodeConfig) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.state_dir)?;

        let keystore = KeyStore::load_or_generate(&config.keys_path())?;
        let keys = keystore.current();

        let metrics = Arc::new(MixnodeMetrics::new());
        let gate = Arc::new(VersionGate::new(
            ProtocolVersion::CURRENT,
            config.min_supported_minor,
        ));
        let delays = Arc::new(PoissonDelayGenerator::new(
            config.mean_delay(),
            config.min_delay(),
            config.max_delay(),
        )?);

        let relay_table = Arc::new(RelayTable::new(config.relay_idle_timeout_secs));
        relay_table.load(&config.relays_path());
        let lottery = RelayLottery::new(keys.vrf.clone(), relay_table.clone());

        let pipeline = Arc::new(PacketPipeline::new(
            PipelineConfig::from(&config),
            keys.x25519_sk,
            keys.vrf.clone(),
            delays,
            gate,
            metrics.clone(),
        ));

        let (stopped, _) = watch::channel(false);
        Ok(Self {
            listen_addr: config.listen_addr,
            config: RwLock::new(config),
            keystore,
            relay_table,
            lottery,
            metrics,
            pipeline,
            running: AtomicBool::new(false),
            stopped,
            tasks: Mutex::new(Vec::new()),
            tcp_shutdown: Mutex::new(None),
        })
    }

    pub fn pipeline(&self) -> &Arc<PacketPipeline> {
        &self.pipeline
    }

    pub fn relay_table(&self) -> &Arc<RelayTable> {
        &self.relay_table
    }

    pub fn lottery(&self) -> &RelayLottery {
        &self.lottery
    }

    /// This epoch's Sphinx public key; senders address packets to it.
    pub fn sphinx_public_key(&self) -> [u8; 32] {
        self.keystore.current().x25519_pk
    }

    pub fn node_id(&self) -> [u8; 32] {
        self.keystore.current().node_id()
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn relay_descriptors(&self) -> Vec<RelayDescriptor> {
        self.relay_table
            .snapshot()
            .relays()
            .iter()
            .map(|e| e.descriptor.clone())
            .collect()
    }

    /// Apply a new configuration to the running node. Only the
    /// hot-reloadable subset takes effect; boot-only fields are ignored
    /// with a warning.
    pub fn reload(&self, new_config: MixnodeConfig) -> Result<()> {
        new_config.validate()?;
        {
            let current = self.config.read().expect("config lock poisoned");
            if new_config.pool_size != current.pool_size
                || new_config.worker_threads != current.worker_threads
            {
                warn!("pool_size/worker_threads are boot-only; ignoring changes");
            }
        }
        self.pipeline.reload(&new_config)?;
        self.relay_table
            .set_idle_timeout(new_config.relay_idle_timeout_secs);
        *self.config.write().expect("config lock poisoned") = new_config;
        info!("configuration reloaded");
        Ok(())
    }

    /// Rotate the epoch keys now: new X25519 secret, fresh replay set,
    /// relay reputation decay tick.
    pub fn rotate_keys(&self) -> Result<()> {
        let keys = self.keystore.rotate()?;
        self.pipeline.rotate_secret(keys.x25519_sk);
        self.relay_table.epoch_tick();
        Ok(())
    }

    /// Resolves when `stop` has completed, for the binary's main loop.
    pub async fn stopped(&self) {
        let mut rx = self.stopped.subscribe();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    async fn spawn_epoch_ticker(self: &Arc<Self>) -> JoinHandle<()> {
        let node = self.clone();
        let mut stopped = self.stopped.subscribe();
        tokio::spawn(async move {
            loop {
                let window = {
                    let config = node.config.read().expect("config lock poisoned");
                    Duration::from_secs(config.replay_window_secs)
                };
                tokio::select! {
                    _ = tokio::time::sleep(window) => {
                        if let Err(e) = node.rotate_keys() {
                            warn!("epoch rotation failed: {e}");
                        }
                    }
                    _ = stopped.changed() => break,
                }
            }
        })
    }
}

#[async_trait::async_trait]
impl MixnodeTrait for Mixnode {
    async fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if *self.stopped.borrow() {
            return Err(MixnodeError::Protocol(
                "node already stopped; restart the process".to_string(),
            ));
        }

        self.pipeline.start().await?;

        let egress = self
            .pipeline
            .take_egress()
            .ok_or_else(|| MixnodeError::Protocol("egress already taken".to_string()))?;

        let config = self.config.read().expect("config lock poisoned").clone();
        let mut server = TcpServer::new(config, self.pipeline.clone());
        *self.tcp_shutdown.lock().await = Some(server.shutdown_handle());
        // Bind now so an unusable address fails startup instead of a
        // background task.
        let listener = server.bind().await?;

        let mut tasks = self.tasks.lock().await;
        tasks.push(spawn_egress_forwarder(egress));
        tasks.push(tokio::spawn(async move {
            if let Err(e) = server.run_on(listener).await {
                warn!("TCP server exited: {e}");
            }
        }));

        info!(addr = %self.listen_addr, "mixnode started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        if let Some(tcp) = self.tcp_shutdown.lock().await.take() {
            let _ = tcp.send(());
        }
        self.pipeline.stop().await?;

        let relays_path = {
            let config = self.config.read().expect("config lock poisoned");
            config.relays_path()
        };
        if let Err(e) = self.relay_table.save(&relays_path) {
            warn!("failed to persist relay table: {e}");
        }

        let mut tasks = self.tasks.lock().await;
        for handle in tasks.drain(..) {
            handle.abort();
        }

        let _ = self.stopped.send(true);
        info!("mixnode stopped");
        Ok(())
    }

    async fn process_packet(&self, packet: &[u8]) -> Result<()> {
        self.pipeline.submit_packet(packet).await.map(|_| ())
    }

    fn metrics(&self) -> Arc<MixnodeMetrics> {
        self.metrics.clone()
    }

    fn address(&self) -> SocketAddr {
        self.listen_addr
    }
}

/// Convenience: build, start and return an `Arc`-wrapped node with its
/// epoch ticker running.
pub async fn spawn(config: MixnodeConfig) -> Result<Arc<Mixnode>> {
    let node = Arc::new(Mixnode::new(config)?);
    node.start().await?;
    let ticker = node.spawn_epoch_ticker().await;
    node.tasks.lock().await.push(ticker);
    Ok(node)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(dir: &std::path::Path, port: u16) -> MixnodeConfig {
        MixnodeConfig {
            listen_addr: format!("127.0.0.1:{port}").parse().unwrap(),
            state_dir: dir.to_path_buf(),
            pool_size: 16,
            worker_threads: 1,
            ..MixnodeConfig::default()
        }
    }

    #[tokio::test]
    async fn test_lifecycle_start_stop() {
        let dir = tempfile::tempdir().unwrap();
        let node = Arc::new(Mixnode::new(test_config(dir.path(), 19801)).unwrap());

        node.start().await.unwrap();
        assert!(node.running.load(Ordering::SeqCst));

        node.stop().await.unwrap();
        assert!(!node.running.load(Ordering::SeqCst));
        // keys.bin and relays.bin persisted.
        assert!(dir.path().join("keys.bin").exists());
        assert!(dir.path().join("relays.bin").exists());
    }

    #[tokio::test]
    async fn test_rotate_keys_changes_sphinx_key() {
        let dir = tempfile::tempdir().unwrap();
        let node = Mixnode::new(test_config(dir.path(), 19802)).unwrap();

        let key_before = node.sphinx_public_key();
        let id_before = node.node_id();
        node.rotate_keys().unwrap();
        assert_ne!(key_before, node.sphinx_public_key());
        assert_eq!(id_before, node.node_id());
    }

    #[tokio::test]
    async fn test_reload_rejects_invalid_config() {
        let dir = tempfile::tempdir().unwrap();
        let node = Mixnode::new(test_config(dir.path(), 19803)).unwrap();

        let mut bad = test_config(dir.path(), 19803);
        bad.min_delay_ms = 9999;
        assert!(node.reload(bad).is_err());

        let mut good = test_config(dir.path(), 19803);
        good.mean_delay_ms = 300;
        node.reload(good).unwrap();
        assert_eq!(
            node.config.read().unwrap().mean_delay_ms,
            300
        );
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected_at_boot() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path(), 19804);
        config.worker_threads = 0;
        assert!(matches!(
            Mixnode::new(config),
            Err(MixnodeError::Config(_))
        ));
    }
}
