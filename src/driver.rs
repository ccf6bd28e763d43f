//! Firecracker driver abstraction.
//!
//! The jailer invocation, kernel/rootfs setup, and CNI attach are out of this
//! crate's scope (§1); this module only defines the seam the Machine Manager
//! needs (launch, shut down, read back metadata) plus a real implementation
//! wrapping the Firecracker REST API client, and a fake for tests.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::process::{Child, Command};
use tokio::time::{Duration, sleep};

use crate::firecracker_client::{BootSource, Drive, FirecrackerClient, MachineConfig};

/// A launched microVM handle, as far as the manager needs to know.
pub struct LaunchedVm {
    pub vmid: String,
    pub ip: String,
    pub vcpus: u32,
    pub memory_mb: u64,
    pub handle: Box<dyn VmHandle>,
}

/// Operations available on a live hypervisor instance.
#[async_trait]
pub trait VmHandle: Send + Sync {
    async fn shutdown(&self) -> Result<()>;
}

/// External collaborator seam: boots and tears down Firecracker microVMs.
#[async_trait]
pub trait FirecrackerDriver: Send + Sync {
    /// Launch a new microVM configured to dial `internal_host:internal_port`.
    /// `vcpus`/`memory_mb` are fixed at creation time (§9.5: treated as
    /// immutable afterward).
    async fn launch(
        &self,
        vcpus: u32,
        memory_mb: u64,
        internal_host: &str,
        internal_port: u16,
    ) -> Result<LaunchedVm>;
}

/// Real driver: spawns a `firecracker` process per VM and configures it over
/// its Unix-socket REST API, mirroring the teacher's `FirecrackerSandbox`.
pub struct RealFirecrackerDriver {
    socket_dir: PathBuf,
    kernel_path: PathBuf,
    rootfs_path: PathBuf,
    next_cid: AtomicU32,
}

impl RealFirecrackerDriver {
    pub fn new(socket_dir: PathBuf, kernel_path: PathBuf, rootfs_path: PathBuf) -> Self {
        Self {
            socket_dir,
            kernel_path,
            rootfs_path,
            next_cid: AtomicU32::new(100),
        }
    }

    fn find_firecracker() -> Result<PathBuf> {
        if let Ok(path) = std::env::var("FIRECRACKER_BIN") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Ok(path);
            }
        }
        for loc in ["/usr/local/bin/firecracker", "/usr/bin/firecracker"] {
            let path = PathBuf::from(loc);
            if path.exists() {
                return Ok(path);
            }
        }
        bail!("firecracker binary not found")
    }

    async fn wait_for_socket(socket_path: &PathBuf) -> Result<()> {
        for _ in 0..50 {
            if socket_path.exists() {
                return Ok(());
            }
            sleep(Duration::from_millis(100)).await;
        }
        bail!("firecracker API socket not available after 5 seconds")
    }
}

struct RealVmHandle {
    process: tokio::sync::Mutex<Option<Child>>,
    socket_path: PathBuf,
}

#[async_trait]
impl VmHandle for RealVmHandle {
    async fn shutdown(&self) -> Result<()> {
        let client = FirecrackerClient::new(&self.socket_path);
        let _ = client.send_ctrl_alt_del().await;
        sleep(Duration::from_millis(300)).await;

        let mut guard = self.process.lock().await;
        if let Some(mut process) = guard.take() {
            let _ = process.kill().await;
        }
        let _ = std::fs::remove_file(&self.socket_path);
        Ok(())
    }
}

#[async_trait]
impl FirecrackerDriver for RealFirecrackerDriver {
    async fn launch(
        &self,
        vcpus: u32,
        memory_mb: u64,
        internal_host: &str,
        internal_port: u16,
    ) -> Result<LaunchedVm> {
        let vmid = uuid::Uuid::new_v4().to_string();
        let socket_path = self
            .socket_dir
            .join(format!(".firecracker.sock-{}-{}", std::process::id(), vmid));
        let _ = std::fs::remove_file(&socket_path);

        let firecracker_bin = Self::find_firecracker()?;
        let process = Command::new(&firecracker_bin)
            .arg("--api-sock")
            .arg(&socket_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to start firecracker: {}", firecracker_bin.display()))?;

        Self::wait_for_socket(&socket_path).await?;

        let client = FirecrackerClient::new(&socket_path);
        client
            .set_boot_source(&BootSource {
                kernel_image_path: self.kernel_path.to_string_lossy().to_string(),
                boot_args: format!(
                    "console=ttyS0 reboot=k panic=1 pci=off init=/init quiet loglevel=4 \
                     agentkernel.node_host={} agentkernel.node_port={}",
                    internal_host, internal_port
                ),
            })
            .await?;
        client
            .set_drive(
                "rootfs",
                &Drive {
                    drive_id: "rootfs".to_string(),
                    path_on_host: self.rootfs_path.to_string_lossy().to_string(),
                    is_root_device: true,
                    is_read_only: false,
                },
            )
            .await?;
        client
            .set_machine_config(&MachineConfig {
                vcpu_count: vcpus,
                mem_size_mib: memory_mb,
            })
            .await?;
        client.start_instance().await?;

        let cid = self.next_cid.fetch_add(1, Ordering::SeqCst);
        let ip = format!("169.254.{}.{}", (cid >> 8) & 0xff, cid & 0xff);

        Ok(LaunchedVm {
            vmid,
            ip,
            vcpus,
            memory_mb,
            handle: Box::new(RealVmHandle {
                process: tokio::sync::Mutex::new(Some(process)),
                socket_path,
            }),
        })
    }
}

/// Deterministic, in-process fake used by unit and scenario tests. Can be
/// configured to fail launches to exercise the pool maintainer's error path.
pub struct FakeDriver {
    fail_launch: std::sync::atomic::AtomicBool,
    counter: AtomicU32,
}

impl FakeDriver {
    pub fn new() -> Self {
        Self {
            fail_launch: std::sync::atomic::AtomicBool::new(false),
            counter: AtomicU32::new(0),
        }
    }

    pub fn set_fail_launch(&self, fail: bool) {
        self.fail_launch.store(fail, Ordering::SeqCst);
    }
}

impl Default for FakeDriver {
    fn default() -> Self {
        Self::new()
    }
}

struct FakeVmHandle;

#[async_trait]
impl VmHandle for FakeVmHandle {
    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl FirecrackerDriver for FakeDriver {
    async fn launch(
        &self,
        vcpus: u32,
        memory_mb: u64,
        _internal_host: &str,
        _internal_port: u16,
    ) -> Result<LaunchedVm> {
        if self.fail_launch.load(Ordering::SeqCst) {
            bail!("simulated driver failure");
        }
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        Ok(LaunchedVm {
            vmid: format!("fake-vm-{n}"),
            ip: format!("10.10.0.{}", n + 1),
            vcpus,
            memory_mb,
            handle: Box::new(FakeVmHandle),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fake_driver_launches_unique_vms() {
        let driver = FakeDriver::new();
        let a = driver.launch(1, 128, "127.0.0.1", 9901).await.unwrap();
        let b = driver.launch(1, 128, "127.0.0.1", 9901).await.unwrap();
        assert_ne!(a.vmid, b.vmid);
    }

    #[tokio::test]
    async fn fake_driver_can_simulate_failure() {
        let driver = FakeDriver::new();
        driver.set_fail_launch(true);
        assert!(driver.launch(1, 128, "127.0.0.1", 9901).await.is_err());
    }
}
