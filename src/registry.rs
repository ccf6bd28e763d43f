//! In-memory registry of VM records, per-VM locks, handshake timestamps, and
//! per-VM subscription lists (§3, §4.6, §9).
//!
//! A single lock covers the registry's maps; slow per-VM operations (stop)
//! additionally take the VM's own lock so concurrent stops on *different* VMs
//! never contend with each other.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use tokio::sync::Mutex;

use crate::bus::Subscription;
use crate::claims::DeployRequest;
use crate::driver::VmHandle;

/// VM lifecycle state (§3's state machine).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    Created,
    WarmingUp,
    Warm,
    Deploying,
    Deployed,
    Draining,
    Undeploying,
    Stopping,
    FailedBoot,
}

/// The workload binding recorded when a warm VM is deployed.
pub struct DeployBinding {
    pub request: DeployRequest,
    pub deployed_at: SystemTime,
}

/// A VM record. Lives in the registry from pool admission to removal.
pub struct VmRecord {
    pub vmid: String,
    pub ip: String,
    pub vcpus: u32,
    pub memory_mb: u64,
    pub created_at: SystemTime,
    pub state: VmState,
    pub deploy: Option<DeployBinding>,
}

impl VmRecord {
    pub fn new(vmid: impl Into<String>, ip: impl Into<String>, vcpus: u32, memory_mb: u64) -> Self {
        Self {
            vmid: vmid.into(),
            ip: ip.into(),
            vcpus,
            memory_mb,
            created_at: SystemTime::now(),
            state: VmState::Created,
            deploy: None,
        }
    }

    pub fn namespace(&self) -> Option<&str> {
        self.deploy.as_ref().map(|d| d.request.namespace.as_str())
    }
}

/// Per-VM bookkeeping entry: the VM record itself, its per-VM lock (held
/// during stop), and its live trigger subscriptions.
pub struct Entry {
    pub record: Mutex<VmRecord>,
    pub stop_lock: Mutex<()>,
    pub subscriptions: Mutex<Vec<Box<dyn Subscription>>>,
    /// The live hypervisor handle, taken and shut down by `stop_vm`. `None`
    /// once stopped, or for entries that never held a real driver handle.
    pub handle: Mutex<Option<Box<dyn VmHandle>>>,
}

/// Thread-safe index of live VMs, keyed by `vmid`, plus the handshake table.
#[derive(Default)]
pub struct Registry {
    entries: Mutex<HashMap<String, Arc<Entry>>>,
    handshakes: Mutex<HashMap<String, Instant>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a freshly created VM record. Never called twice for the same id.
    pub async fn insert(&self, record: VmRecord) -> Arc<Entry> {
        let vmid = record.vmid.clone();
        let entry = Arc::new(Entry {
            record: Mutex::new(record),
            stop_lock: Mutex::new(()),
            subscriptions: Mutex::new(Vec::new()),
            handle: Mutex::new(None),
        });
        self.entries.lock().await.insert(vmid, entry.clone());
        entry
    }

    pub async fn lookup(&self, vmid: &str) -> Option<Arc<Entry>> {
        self.entries.lock().await.get(vmid).cloned()
    }

    /// Remove and return the entry, if present. Idempotent: a second removal
    /// for the same id returns `None`.
    pub async fn remove(&self, vmid: &str) -> Option<Arc<Entry>> {
        self.entries.lock().await.remove(vmid)
    }

    pub async fn iter_ids(&self) -> Vec<String> {
        self.entries.lock().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Record a first-seen handshake timestamp for `vmid`. Entries are never
    /// deleted directly; they disappear implicitly when the VM is removed
    /// (the table itself retains stale entries, matching §3's stated design
    /// — harmless, since lookups are always keyed by a currently-live vmid).
    pub async fn record_handshake(&self, vmid: &str) {
        self.handshakes
            .lock()
            .await
            .entry(vmid.to_string())
            .or_insert_with(Instant::now);
    }

    pub async fn has_handshaked(&self, vmid: &str) -> bool {
        self.handshakes.lock().await.contains_key(vmid)
    }

    pub async fn handshake_table_is_empty(&self) -> bool {
        self.handshakes.lock().await.is_empty()
    }

    /// How long a handshake has been waited on, for watchdog deadline math.
    pub async fn time_since(&self, instant: Instant) -> Duration {
        instant.elapsed()
    }
}
