//! End-to-end scenarios for the Machine Manager, driven against in-process
//! fakes (`LocalBus`, `FakeDriver`) rather than a compiled binary — the real
//! Firecracker driver and bus are external collaborators out of scope here.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use machine_manager::bus::{Handler, Message, MessageBus};
use machine_manager::claims::{DeployRequest, WorkloadClaims};
use machine_manager::config::NodeConfig;
use machine_manager::driver::{FakeDriver, FirecrackerDriver};
use machine_manager::error::{DeployError, ManagerError};
use machine_manager::handshake::HANDSHAKE_SUBJECT;
use machine_manager::manager::MachineManager;
use machine_manager::registry::VmState;

fn deploy_request(namespace: &str, triggers: &[&str]) -> DeployRequest {
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
        total_bytes: 1024,
        trigger_subjects: triggers.iter().map(|s| s.to_string()).collect(),
        payload: vec![1, 2, 3],
    }
}

struct AlwaysAccept;

#[async_trait]
impl Handler for AlwaysAccept {
    async fn handle(&self, message: Message) -> Option<Message> {
        let reply = machine_manager::claims::DeployReply {
            accepted: true,
            message: None,
        };
        Some(Message::new(
            message.subject,
            serde_json::to_vec(&reply).unwrap(),
        ))
    }
}

/// Waits (bounded) for the registry to report exactly `n` entries.
async fn wait_for_registry_len(manager: &MachineManager, n: usize) {
    for _ in 0..100 {
        if manager.registry().len().await == n {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("registry never reached length {n}");
}

async fn first_vmid(manager: &MachineManager) -> String {
    wait_for_registry_len(manager, 1).await;
    manager.registry().iter_ids().await.into_iter().next().unwrap()
}

/// S1: pool size 2, driver always succeeds, agent always handshakes quickly.
/// Expect exactly 2 registry records and no cancellation.
#[tokio::test]
async fn s1_healthy_pool_fills_without_cancellation() {
    let mut config = NodeConfig::minimal(&["v8"]);
    config.machine_pool_size = 2;
    config.preserve_network = true;
    config.handshake_timeout_ms = 1_000;

    let bus: Arc<dyn MessageBus> = Arc::new(machine_manager::bus::LocalBus::new());
    let driver: Arc<dyn FirecrackerDriver> = Arc::new(FakeDriver::new());

    let manager = MachineManager::new(config, bus.clone(), driver).unwrap();
    manager.start().await.unwrap();

    wait_for_registry_len(&manager, 2).await;

    for vmid in manager.registry().iter_ids().await {
        let payload = serde_json::to_vec(&serde_json::json!({
            "machine_id": vmid,
            "message": "hello",
        }))
        .unwrap();
        bus.request(Message::new(HANDSHAKE_SUBJECT, payload), Duration::from_millis(200))
            .await
            .unwrap();
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(manager.registry().len().await, 2);
    assert!(!manager.cancellation_token().is_cancelled());
}

/// S2: pool size 1, the agent never handshakes. After the (short, for test
/// speed) timeout, node-wide cancellation fires and the registry is drained.
#[tokio::test]
async fn s2_missing_first_handshake_triggers_fatal_cancellation() {
    let mut config = NodeConfig::minimal(&["v8"]);
    config.machine_pool_size = 1;
    config.preserve_network = true;
    config.handshake_timeout_ms = 100;

    let bus: Arc<dyn MessageBus> = Arc::new(machine_manager::bus::LocalBus::new());
    let driver: Arc<dyn FirecrackerDriver> = Arc::new(FakeDriver::new());

    let manager = MachineManager::new(config, bus, driver).unwrap();
    manager.start().await.unwrap();

    for _ in 0..100 {
        if manager.cancellation_token().is_cancelled() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(manager.cancellation_token().is_cancelled());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(manager.registry().len().await, 0);
}

/// S3: warm pool size 1; a deploy request for workload type "v8" with two
/// trigger subjects is accepted. Expect the VM Deployed, two subscriptions,
/// and the workload counter incremented.
#[tokio::test]
async fn s3_accepted_deploy_with_triggers() {
    let mut config = NodeConfig::minimal(&["v8"]);
    config.machine_pool_size = 1;
    config.preserve_network = true;
    config.handshake_timeout_ms = 60_000;

    let bus = Arc::new(machine_manager::bus::LocalBus::new());
    let driver: Arc<dyn FirecrackerDriver> = Arc::new(FakeDriver::new());
    let manager = MachineManager::new(config, bus.clone() as Arc<dyn MessageBus>, driver).unwrap();
    manager.start().await.unwrap();

    let vmid = first_vmid(&manager).await;
    bus.subscribe(&format!("agentint.{vmid}.deploy"), Arc::new(AlwaysAccept))
        .await
        .unwrap();

    let request = deploy_request("tenant-a", &["t.a", "t.b"]);
    let deployed_vmid = manager.deploy(request).await.unwrap();
    assert_eq!(deployed_vmid, vmid);

    let entry = manager.registry().lookup(&vmid).await.unwrap();
    assert_eq!(entry.record.lock().await.state, VmState::Deployed);
    assert_eq!(entry.subscriptions.lock().await.len(), 2);

    let label = machine_manager::telemetry::WorkloadLabel {
        workload_type: "v8".to_string(),
        namespace: "tenant-a".to_string(),
    };
    assert_eq!(manager.telemetry().workload_count(&label), 1);
}

/// S4: as S3, but the subscription to `t.b` fails. Expect the VM stopped
/// (undeploy=true), one "machine stopped" event, the workload counter back
/// at zero, and an error naming `t.b`.
#[tokio::test]
async fn s4_failed_trigger_subscription_rolls_back() {
    struct FailingSubscribeBus {
        inner: Arc<machine_manager::bus::LocalBus>,
        fail_subject: String,
    }

    #[async_trait]
    impl MessageBus for FailingSubscribeBus {
        async fn publish(&self, message: Message) -> anyhow::Result<()> {
            self.inner.publish(message).await
        }

        async fn request(&self, message: Message, timeout: Duration) -> anyhow::Result<Message> {
            self.inner.request(message, timeout).await
        }

        async fn subscribe(
            &self,
            subject: &str,
            handler: Arc<dyn Handler>,
        ) -> anyhow::Result<Box<dyn machine_manager::bus::Subscription>> {
            if subject == self.fail_subject {
                anyhow::bail!("simulated subscribe failure for {subject}");
            }
            self.inner.subscribe(subject, handler).await
        }
    }

    let mut config = NodeConfig::minimal(&["v8"]);
    config.machine_pool_size = 1;
    config.preserve_network = true;
    config.handshake_timeout_ms = 60_000;

    let local = Arc::new(machine_manager::bus::LocalBus::new());
    let bus: Arc<dyn MessageBus> = Arc::new(FailingSubscribeBus {
        inner: local.clone(),
        fail_subject: "t.b".to_string(),
    });
    let driver: Arc<dyn FirecrackerDriver> = Arc::new(FakeDriver::new());
    let manager = MachineManager::new(config, bus.clone(), driver).unwrap();
    manager.start().await.unwrap();

    let vmid = first_vmid(&manager).await;
    local
        .subscribe(&format!("agentint.{vmid}.deploy"), Arc::new(AlwaysAccept))
        .await
        .unwrap();

    let events_count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    struct EventCounter(Arc<std::sync::atomic::AtomicUsize>);
    #[async_trait]
    impl Handler for EventCounter {
        async fn handle(&self, _message: Message) -> Option<Message> {
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            None
        }
    }
    local
        .subscribe("$NEX.events", Arc::new(EventCounter(events_count.clone())))
        .await
        .unwrap();

    let request = deploy_request("tenant-a", &["t.a", "t.b"]);
    let err = manager.deploy(request).await.unwrap_err();
    match err {
        DeployError::SubscribeFailed { subject, .. } => assert_eq!(subject, "t.b"),
        other => panic!("expected SubscribeFailed, got {other:?}"),
    }

    assert!(manager.registry().lookup(&vmid).await.is_none());
    assert_eq!(events_count.load(std::sync::atomic::Ordering::SeqCst), 1);

    let label = machine_manager::telemetry::WorkloadLabel {
        workload_type: "v8".to_string(),
        namespace: "tenant-a".to_string(),
    };
    assert_eq!(manager.telemetry().workload_count(&label), 0);
}

/// S5: a deployed VM is stopped with undeploy=true. Expect an undeploy
/// request on `agentint.<vmid>.undeploy`, subscriptions drained, the record
/// removed, and one "machine stopped" event.
#[tokio::test]
async fn s5_stop_with_undeploy_runs_full_sequence() {
    let mut config = NodeConfig::minimal(&["v8"]);
    config.machine_pool_size = 1;
    config.preserve_network = true;
    config.handshake_timeout_ms = 60_000;

    let bus = Arc::new(machine_manager::bus::LocalBus::new());
    let driver: Arc<dyn FirecrackerDriver> = Arc::new(FakeDriver::new());
    let manager = MachineManager::new(config, bus.clone() as Arc<dyn MessageBus>, driver).unwrap();
    manager.start().await.unwrap();

    let vmid = first_vmid(&manager).await;
    bus.subscribe(&format!("agentint.{vmid}.deploy"), Arc::new(AlwaysAccept))
        .await
        .unwrap();

    let undeploy_seen = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    struct UndeployHandler(Arc<std::sync::atomic::AtomicUsize>);
    #[async_trait]
    impl Handler for UndeployHandler {
        async fn handle(&self, message: Message) -> Option<Message> {
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Some(Message::new(message.subject, Bytes::new()))
        }
    }
    bus.subscribe(
        &format!("agentint.{vmid}.undeploy"),
        Arc::new(UndeployHandler(undeploy_seen.clone())),
    )
    .await
    .unwrap();

    let events_count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    struct EventCounter(Arc<std::sync::atomic::AtomicUsize>);
    #[async_trait]
    impl Handler for EventCounter {
        async fn handle(&self, _message: Message) -> Option<Message> {
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            None
        }
    }
    bus.subscribe("$NEX.events", Arc::new(EventCounter(events_count.clone())))
        .await
        .unwrap();

    manager.deploy(deploy_request("tenant-a", &["t.a"])).await.unwrap();

    manager.stop(&vmid, true, None).await.unwrap();

    assert_eq!(undeploy_seen.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert_eq!(events_count.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert!(manager.registry().lookup(&vmid).await.is_none());
}

/// S6: a deployed VM in namespace "A" cannot be stopped by a caller that
/// claims namespace "B". The caller sees "no such workload"; the VM remains
/// Deployed.
#[tokio::test]
async fn s6_namespace_mismatch_is_not_found() {
    let mut config = NodeConfig::minimal(&["v8"]);
    config.machine_pool_size = 1;
    config.preserve_network = true;
    config.handshake_timeout_ms = 60_000;

    let bus = Arc::new(machine_manager::bus::LocalBus::new());
    let driver: Arc<dyn FirecrackerDriver> = Arc::new(FakeDriver::new());
    let manager = MachineManager::new(config, bus.clone() as Arc<dyn MessageBus>, driver).unwrap();
    manager.start().await.unwrap();

    let vmid = first_vmid(&manager).await;
    bus.subscribe(&format!("agentint.{vmid}.deploy"), Arc::new(AlwaysAccept))
        .await
        .unwrap();

    manager.deploy(deploy_request("A", &[])).await.unwrap();

    let err = manager.stop(&vmid, false, Some("B")).await.unwrap_err();
    assert!(matches!(err, ManagerError::NotFound));

    let entry = manager.registry().lookup(&vmid).await.unwrap();
    assert_eq!(entry.record.lock().await.state, VmState::Deployed);
}
