//! Pool Maintainer (§4.1): keeps the warm-VM channel filled to capacity.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;
use tokio::time::{Duration, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::NodeConfig;
use crate::driver::FirecrackerDriver;
use crate::handshake::spawn_handshake_watchdog;
use crate::registry::{Entry, Registry, VmRecord, VmState};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A warm VM handed off to a caller dequeuing from the pool.
pub struct WarmVm {
    pub vmid: String,
    pub entry: Arc<Entry>,
}

/// Owns the bounded pool channel and the background task that fills it.
pub struct Pool {
    sender: mpsc::Sender<WarmVm>,
    receiver: tokio::sync::Mutex<mpsc::Receiver<WarmVm>>,
    closed: AtomicBool,
}

impl Pool {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        Self {
            sender,
            receiver: tokio::sync::Mutex::new(receiver),
            closed: AtomicBool::new(false),
        }
    }

    /// Dequeue one warm VM. Returns `None` once the pool has been closed and
    /// drained (manager shutdown in progress).
    pub async fn dequeue(&self) -> Option<WarmVm> {
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }
        self.receiver.lock().await.recv().await
    }

    /// Mark the pool closed; no further enqueues will be accepted. Already
    /// in-flight warm VMs remain available to drain via `dequeue`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Runs until `cancel` fires or the pool is closed. On each iteration: if the
/// channel has no free capacity, sleep briefly; otherwise launch one VM,
/// register it, spawn its handshake watchdog, and enqueue it.
pub async fn run_pool_maintainer(
    pool: Arc<Pool>,
    registry: Arc<Registry>,
    driver: Arc<dyn FirecrackerDriver>,
    config: Arc<NodeConfig>,
    cancel: CancellationToken,
) {
    reset_network_state(&config);

    loop {
        if cancel.is_cancelled() || pool.is_closed() {
            info!("pool maintainer exiting");
            return;
        }

        if pool.sender.capacity() == 0 {
            sleep(POLL_INTERVAL).await;
            continue;
        }

        match driver
            .launch(
                1,
                512,
                &config.internal_node_host,
                config.internal_node_port,
            )
            .await
        {
            Ok(vm) => {
                let mut record = VmRecord::new(vm.vmid.clone(), vm.ip, vm.vcpus, vm.memory_mb);
                record.state = VmState::WarmingUp;
                let vmid = record.vmid.clone();
                let entry = registry.insert(record).await;
                *entry.handle.lock().await = Some(vm.handle);

                spawn_handshake_watchdog(
                    vmid.clone(),
                    registry.clone(),
                    entry.clone(),
                    config.clone(),
                    cancel.clone(),
                );

                let warm = WarmVm {
                    vmid: vmid.clone(),
                    entry,
                };

                tokio::select! {
                    result = pool.sender.send(warm) => {
                        if result.is_err() {
                            info!(vmid = %vmid, "pool closed while enqueuing, dropping warm vm");
                            return;
                        }
                    }
                    _ = cancel.cancelled() => return,
                }
            }
            Err(err) => {
                warn!(error = %err, "pool maintainer: vm launch failed, retrying");
                sleep(POLL_INTERVAL).await;
            }
        }
    }
}

/// Optional startup preamble (§4.1): reset node-level CNI state unless
/// `preserve_network` is set.
fn reset_network_state(config: &NodeConfig) {
    if config.preserve_network {
        return;
    }
    let dir = std::path::Path::new(&config.cni_state_dir);
    if dir.exists() {
        let _ = std::fs::remove_dir_all(dir);
    }
    let _ = std::fs::create_dir_all(dir);
    remove_leftover_veths();
}

/// Deletes host veth interfaces left behind by a prior, uncleanly terminated
/// node process. Best-effort: a node without `ip` on PATH, or without
/// CAP_NET_ADMIN, just leaves them for the next restart to retry.
fn remove_leftover_veths() {
    let Ok(entries) = std::fs::read_dir("/sys/class/net") else {
        return;
    };
    for entry in entries.flatten() {
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if name.starts_with("veth") {
            let _ = std::process::Command::new("ip")
                .args(["link", "delete", &name])
                .status();
        }
    }
}
