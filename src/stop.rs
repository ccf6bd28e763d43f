//! Stop/Undeploy Engine (§4.5) and manager shutdown.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{info, instrument, warn};

use crate::bus::{Message, MessageBus};
use crate::config::NodeConfig;
use crate::error::ManagerError;
use crate::registry::{Registry, VmState};
use crate::telemetry::{Telemetry, WorkloadLabel};

/// External event subject lifecycle events are published under (§6).
pub const EVENTS_SUBJECT: &str = "$NEX.events";

/// `stop(vmid, undeploy)` from §4.5. The per-VM lock is held for the
/// duration; a second concurrent call for the same `vmid` observes `NotFound`.
#[instrument(skip(registry, bus, config, telemetry), fields(vmid = %vmid))]
pub async fn stop_vm(
    vmid: &str,
    undeploy: bool,
    registry: Arc<Registry>,
    bus: Arc<dyn MessageBus>,
    config: Arc<NodeConfig>,
    telemetry: Arc<Telemetry>,
) -> Result<(), ManagerError> {
    let Some(entry) = registry.lookup(vmid).await else {
        return Err(ManagerError::NotFound);
    };

    let _stop_guard = entry.stop_lock.lock().await;

    // A concurrent stop may have already removed the record while we waited
    // for the lock; treat that as NotFound too.
    if registry.lookup(vmid).await.is_none() {
        return Err(ManagerError::NotFound);
    }

    // Step 2: drain subscriptions.
    let subscriptions = {
        let mut guard = entry.subscriptions.lock().await;
        std::mem::take(&mut *guard)
    };
    for subscription in subscriptions {
        subscription.unsubscribe().await;
    }

    // Step 3: undeploy request, if applicable.
    let (was_deployed, label, bytes_total, vcpus, memory_mb) = {
        let record = entry.record.lock().await;
        let was_deployed = record.state == VmState::Deployed;
        let label = record.deploy.as_ref().map(|binding| WorkloadLabel {
            workload_type: binding.request.workload_type().to_string(),
            namespace: binding.request.namespace.clone(),
        });
        let bytes_total = record
            .deploy
            .as_ref()
            .map(|binding| binding.request.total_bytes)
            .unwrap_or(0);
        (was_deployed, label, bytes_total, record.vcpus, record.memory_mb)
    };

    if undeploy && was_deployed {
        {
            let mut record = entry.record.lock().await;
            record.state = VmState::Draining;
        }
        let subject = format!("agentint.{vmid}.undeploy");
        let timeout = Duration::from_millis(config.undeploy_timeout_ms);
        if let Err(err) = bus
            .request(Message::new(subject, Bytes::new()), timeout)
            .await
        {
            warn!(error = %err, "undeploy request failed, continuing with hypervisor stop");
        }
        {
            let mut record = entry.record.lock().await;
            record.state = VmState::Undeploying;
        }
    }

    {
        let mut record = entry.record.lock().await;
        record.state = VmState::Stopping;
    }

    // Step 4: tear down the hypervisor instance.
    let handle = entry.handle.lock().await.take();
    if let Some(handle) = handle
        && let Err(err) = handle.shutdown().await
    {
        warn!(vmid = %vmid, error = %err, "hypervisor teardown failed");
    }

    // Step 5: remove the record.
    registry.remove(vmid).await;

    // Step 6: publish a "machine stopped" event.
    let event = serde_json::json!({
        "type": "machine_stopped",
        "vmid": vmid,
    });
    let _ = bus
        .publish(Message::new(
            EVENTS_SUBJECT,
            serde_json::to_vec(&event).unwrap_or_default(),
        ))
        .await;
    info!(vmid = %vmid, "machine stopped");

    // Step 7: telemetry inverse of deploy's contribution.
    if let Some(label) = label {
        telemetry.on_stop(label, bytes_total, vcpus, memory_mb);
    }

    Ok(())
}

/// Removes stale Firecracker control sockets owned by this process
/// (`.firecracker.sock-<pid>-*`), using the real OS temp directory — the
/// source bug that joined `"tmp"` as a relative path is deliberately not
/// reproduced here.
pub fn cleanup_stale_sockets(config: &NodeConfig) {
    let dir = config
        .firecracker_socket_dir
        .as_ref()
        .map(std::path::PathBuf::from)
        .unwrap_or_else(std::env::temp_dir);
    let pid = std::process::id();
    let prefix = format!(".firecracker.sock-{pid}-");

    let Ok(entries) = std::fs::read_dir(&dir) else {
        return;
    };
    for entry in entries.flatten() {
        if let Some(name) = entry.file_name().to_str()
            && name.starts_with(&prefix)
        {
            let _ = std::fs::remove_file(entry.path());
        }
    }
}
