//! Handshake Coordinator (§4.2): awaits a round-tripped hello from each new
//! VM; fails fatally if the very first hello never arrives.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::bus::{Handler, Message, MessageBus};
use crate::config::NodeConfig;
use crate::registry::{Entry, Registry, VmState};

const WATCHDOG_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Subject the guest agent's hello is published on, and the subject the
/// coordinator subscribes to, per §6.
pub const HANDSHAKE_SUBJECT: &str = "agentint.handshake";

#[derive(Debug, serde::Deserialize)]
struct HelloPayload {
    machine_id: String,
    #[allow(dead_code)]
    message: String,
}

/// Subscribes on `agentint.handshake`; replies with an empty envelope and
/// records the first-seen timestamp for the reporting `vmid`. The reply is
/// mandatory — it is the only proof of connectivity (§4.2).
pub struct HandshakeReceiver {
    registry: Arc<Registry>,
}

impl HandshakeReceiver {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    pub async fn install(self: Arc<Self>, bus: &dyn MessageBus) -> anyhow::Result<()> {
        bus.subscribe(HANDSHAKE_SUBJECT, self).await?;
        Ok(())
    }
}

#[async_trait]
impl Handler for HandshakeReceiver {
    async fn handle(&self, message: Message) -> Option<Message> {
        match serde_json::from_slice::<HelloPayload>(&message.payload) {
            Ok(hello) => {
                self.registry.record_handshake(&hello.machine_id).await;
                info!(vmid = %hello.machine_id, "handshake recorded");
            }
            Err(err) => {
                warn!(error = %err, "malformed handshake payload");
            }
        }
        Some(Message::new(message.subject, bytes::Bytes::new()))
    }
}

/// Spawns the per-VM watchdog task described in §4.2. Polls the handshake
/// table until `vmid` appears or the deadline passes; on timeout, applies the
/// fatal-first-handshake rule.
pub fn spawn_handshake_watchdog(
    vmid: String,
    registry: Arc<Registry>,
    entry: Arc<Entry>,
    config: Arc<NodeConfig>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let deadline = tokio::time::Instant::now()
            + Duration::from_millis(config.handshake_timeout_ms);

        loop {
            if registry.has_handshaked(&vmid).await {
                let mut record = entry.record.lock().await;
                record.state = VmState::Warm;
                info!(vmid = %vmid, "vm is warm");
                return;
            }

            if tokio::time::Instant::now() >= deadline {
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep(WATCHDOG_POLL_INTERVAL) => {}
                _ = cancel.cancelled() => return,
            }
        }

        // Deadline passed without a handshake.
        {
            let mut record = entry.record.lock().await;
            record.state = VmState::FailedBoot;
        }
        registry.remove(&vmid).await;
        warn!(
            vmid = %vmid,
            timeout_ms = config.handshake_timeout_ms,
            "handshake timed out"
        );

        let is_first_failure = registry.handshake_table_is_empty().await;
        if is_first_failure && config.strict_first_handshake {
            error!(
                vmid = %vmid,
                "first-ever handshake failed, triggering node-wide cancellation"
            );
            cancel.cancel();
        }
    });
}
