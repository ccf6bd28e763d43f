//! Deployment Engine (§4.3): validates, assigns, and transitions a warm VM
//! into deployed state; registers trigger subscriptions.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tracing::{info, instrument, warn};

use crate::bus::{Message, MessageBus};
use crate::claims::{DeployEnvelope, DeployReply, DeployRequest};
use crate::config::NodeConfig;
use crate::error::DeployError;
use crate::pool::WarmVm;
use crate::registry::{DeployBinding, Registry, VmState};
use crate::stop::stop_vm;
use crate::telemetry::{Telemetry, WorkloadLabel};
use crate::trigger::TriggerRouter;

/// Deploys `request` onto `warm_vm`. The caller has already dequeued the VM
/// from the pool and validated the request upstream (claims decoded, issuer
/// allow-listed, workload type supported).
#[instrument(skip(warm_vm, request, bus, registry, config, telemetry, trigger_router), fields(vmid = %warm_vm.vmid))]
#[allow(clippy::too_many_arguments)]
pub async fn deploy(
    warm_vm: WarmVm,
    request: DeployRequest,
    bus: Arc<dyn MessageBus>,
    registry: Arc<Registry>,
    config: Arc<NodeConfig>,
    telemetry: Arc<Telemetry>,
    trigger_router: Arc<TriggerRouter>,
) -> Result<(), DeployError> {
    let vmid = warm_vm.vmid.clone();
    let entry = warm_vm.entry.clone();

    // Step 1: bind the request to the VM record.
    let (vcpus, memory_mb) = {
        let mut record = entry.record.lock().await;
        record.state = VmState::Deploying;
        record.deploy = Some(DeployBinding {
            request: request.clone(),
            deployed_at: SystemTime::now(),
        });
        (record.vcpus, record.memory_mb)
    };

    // Telemetry is incremented as soon as the binding is in place, not after
    // the fallible steps below, so every rollback path (timeout, reject,
    // subscribe failure) is matched by `stop_vm`'s unconditional decrement
    // for a VM holding a binding and counters never go negative.
    let label = WorkloadLabel {
        workload_type: request.workload_type().to_string(),
        namespace: request.namespace.clone(),
    };
    telemetry.on_deploy(label, request.total_bytes, vcpus, memory_mb);

    // Step 2/3: request deploy over the internal bus; interpret the reply.
    let envelope = DeployEnvelope::from(&request);
    let payload = serde_json::to_vec(&envelope).map_err(|e| DeployError::Encoding(e.to_string()))?;
    let subject = format!("agentint.{vmid}.deploy");
    let deploy_timeout = Duration::from_millis(config.deploy_timeout_ms);

    let reply = bus
        .request(Message::new(subject, payload), deploy_timeout)
        .await;

    let reply = match reply {
        Ok(reply) => reply,
        Err(_) => {
            let _ = stop_vm(&vmid, false, registry.clone(), bus.clone(), config.clone(), telemetry.clone()).await;
            return Err(DeployError::Timeout);
        }
    };

    let decoded: DeployReply = match serde_json::from_slice(&reply.payload) {
        Ok(decoded) => decoded,
        Err(e) => {
            let _ = stop_vm(&vmid, false, registry.clone(), bus.clone(), config.clone(), telemetry.clone()).await;
            return Err(DeployError::Encoding(e.to_string()));
        }
    };

    if !decoded.accepted {
        let message = decoded.message.unwrap_or_else(|| "rejected".to_string());
        warn!(vmid = %vmid, reason = %message, "agent rejected deploy");
        let _ = stop_vm(&vmid, false, registry.clone(), bus.clone(), config.clone(), telemetry.clone()).await;
        return Err(DeployError::AgentRejected(message));
    }

    {
        let mut record = entry.record.lock().await;
        record.state = VmState::Deployed;
    }
    info!(vmid = %vmid, "vm deployed");

    // Step 4: subscribe to declared trigger subjects, if supported.
    if request.wants_triggers() && config.supports_triggers(request.workload_type()) {
        for subject in &request.trigger_subjects {
            let handler = trigger_router.clone().handler_for(
                vmid.clone(),
                subject.clone(),
                request.workload_name().to_string(),
                request.namespace.clone(),
            );
            match bus.subscribe(subject, handler).await {
                Ok(subscription) => {
                    entry.subscriptions.lock().await.push(subscription);
                }
                Err(cause) => {
                    warn!(vmid = %vmid, subject = %subject, error = %cause, "trigger subscription failed");
                    let _ = stop_vm(&vmid, true, registry.clone(), bus.clone(), config.clone(), telemetry.clone()).await;
                    return Err(DeployError::SubscribeFailed {
                        subject: subject.clone(),
                        cause: cause.to_string(),
                    });
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{Handler, LocalBus};
    use crate::claims::WorkloadClaims;
    use crate::driver::FakeDriver;
    use crate::registry::VmRecord;
    use async_trait::async_trait;

    struct AlwaysAccept;

    #[async_trait]
    impl Handler for AlwaysAccept {
        async fn handle(&self, message: Message) -> Option<Message> {
            let reply = DeployReply {
                accepted: true,
                message: None,
            };
            Some(Message::new(
                message.subject,
                serde_json::to_vec(&reply).unwrap(),
            ))
        }
    }

    struct AlwaysReject;

    #[async_trait]
    impl Handler for AlwaysReject {
        async fn handle(&self, message: Message) -> Option<Message> {
            let reply = DeployReply {
                accepted: false,
                message: Some("unsupported".to_string()),
            };
            Some(Message::new(
                message.subject,
                serde_json::to_vec(&reply).unwrap(),
            ))
        }
    }

    fn sample_request(namespace: &str, triggers: Vec<&str>) -> DeployRequest {
        DeployRequest {
            namespace: namespace.to_string(),
            claims: WorkloadClaims {
                subject: "echo".to_string(),
                issuer: "ABCDEF".to_string(),
                hash: "deadbeef".to_string(),
                workload_type: "v8".to_string(),
                description: None,
                encrypted_for: None,
            },
            total_bytes: 100,
            trigger_subjects: triggers.into_iter().map(String::from).collect(),
            payload: vec![],
        }
    }

    async fn setup() -> (Arc<Registry>, Arc<LocalBus>, Arc<NodeConfig>, Arc<Telemetry>, Arc<TriggerRouter>, WarmVm) {
        let registry = Arc::new(Registry::new());
        let bus = Arc::new(LocalBus::new());
        let config = Arc::new(NodeConfig::minimal(&["v8"]));
        let telemetry = Arc::new(Telemetry::new());
        let trigger_router = Arc::new(TriggerRouter::new(
            bus.clone() as Arc<dyn MessageBus>,
            telemetry.clone(),
            config.clone(),
        ));
        let entry = registry.insert(VmRecord::new("vm-1", "10.0.0.2", 2, 512)).await;
        let warm = WarmVm {
            vmid: "vm-1".to_string(),
            entry,
        };
        (registry, bus, config, telemetry, trigger_router, warm)
    }

    #[tokio::test]
    async fn accepted_deploy_transitions_to_deployed_and_subscribes() {
        let (registry, bus, config, telemetry, trigger_router, warm) = setup().await;
        bus.subscribe("agentint.vm-1.deploy", Arc::new(AlwaysAccept))
            .await
            .unwrap();

        let request = sample_request("default", vec!["t.a", "t.b"]);
        let bus_dyn: Arc<dyn MessageBus> = bus.clone();
        deploy(warm, request, bus_dyn, registry.clone(), config, telemetry.clone(), trigger_router)
            .await
            .unwrap();

        let entry = registry.lookup("vm-1").await.unwrap();
        assert_eq!(entry.record.lock().await.state, VmState::Deployed);
        assert_eq!(entry.subscriptions.lock().await.len(), 2);

        let label = WorkloadLabel {
            workload_type: "v8".to_string(),
            namespace: "default".to_string(),
        };
        assert_eq!(telemetry.workload_count(&label), 1);
    }

    #[tokio::test]
    async fn rejected_deploy_stops_vm_without_undeploy() {
        let (registry, bus, config, telemetry, trigger_router, warm) = setup().await;
        bus.subscribe("agentint.vm-1.deploy", Arc::new(AlwaysReject))
            .await
            .unwrap();

        let request = sample_request("default", vec![]);
        let bus_dyn: Arc<dyn MessageBus> = bus.clone();
        let err = deploy(warm, request, bus_dyn, registry.clone(), config, telemetry.clone(), trigger_router)
            .await
            .unwrap_err();

        assert!(matches!(err, DeployError::AgentRejected(_)));
        assert!(registry.lookup("vm-1").await.is_none());

        let label = WorkloadLabel {
            workload_type: "v8".to_string(),
            namespace: "default".to_string(),
        };
        assert_eq!(telemetry.workload_count(&label), 0);
    }
}
