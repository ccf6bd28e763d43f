//! `MachineManager`: owns the registry, bus, driver, and pool maintainer, and
//! exposes the deploy/stop/run surface described throughout §4.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bus::MessageBus;
use crate::claims::DeployRequest;
use crate::config::NodeConfig;
use crate::driver::FirecrackerDriver;
use crate::error::{DeployError, ManagerError};
use crate::handshake::HandshakeReceiver;
use crate::pool::{Pool, run_pool_maintainer};
use crate::registry::Registry;
use crate::stop::{cleanup_stale_sockets, stop_vm};
use crate::telemetry::Telemetry;
use crate::trigger::TriggerRouter;

/// The Machine Manager. Construct one per node process.
pub struct MachineManager {
    registry: Arc<Registry>,
    bus: Arc<dyn MessageBus>,
    driver: Arc<dyn FirecrackerDriver>,
    config: Arc<NodeConfig>,
    telemetry: Arc<Telemetry>,
    trigger_router: Arc<TriggerRouter>,
    pool: Arc<Pool>,
    cancel: CancellationToken,
    shutdown_started: AtomicBool,
}

impl MachineManager {
    pub fn new(
        config: NodeConfig,
        bus: Arc<dyn MessageBus>,
        driver: Arc<dyn FirecrackerDriver>,
    ) -> Result<Arc<Self>, ManagerError> {
        config.validate()?;

        let config = Arc::new(config);
        let registry = Arc::new(Registry::new());
        let telemetry = Arc::new(Telemetry::new());
        let trigger_router = Arc::new(TriggerRouter::new(bus.clone(), telemetry.clone(), config.clone()));
        let pool = Arc::new(Pool::new(config.machine_pool_size));

        Ok(Arc::new(Self {
            registry,
            bus,
            driver,
            config,
            telemetry,
            trigger_router,
            pool,
            cancel: CancellationToken::new(),
            shutdown_started: AtomicBool::new(false),
        }))
    }

    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Installs the handshake receiver and spawns the pool maintainer.
    /// Returns once both are running; callers should then `await` on
    /// `cancellation_token().cancelled()` (or drive their own select loop)
    /// until shutdown.
    pub async fn start(self: &Arc<Self>) -> Result<(), ManagerError> {
        Arc::new(HandshakeReceiver::new(self.registry.clone()))
            .install(self.bus.as_ref())
            .await
            .map_err(|e| ManagerError::Internal(e.to_string()))?;

        let pool = self.pool.clone();
        let registry = self.registry.clone();
        let driver = self.driver.clone();
        let config = self.config.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            run_pool_maintainer(pool, registry, driver, config, cancel).await;
        });

        let shutdown_trigger = self.cancel.clone();
        let manager = self.clone();
        tokio::spawn(async move {
            shutdown_trigger.cancelled().await;
            manager.shutdown().await;
        });

        Ok(())
    }

    /// Dequeues a warm VM and deploys `request` onto it.
    pub async fn deploy(self: &Arc<Self>, request: DeployRequest) -> Result<String, DeployError> {
        let warm = self
            .pool
            .dequeue()
            .await
            .ok_or_else(|| DeployError::Internal("pool closed".to_string()))?;
        let vmid = warm.vmid.clone();

        crate::deploy::deploy(
            warm,
            request,
            self.bus.clone(),
            self.registry.clone(),
            self.config.clone(),
            self.telemetry.clone(),
            self.trigger_router.clone(),
        )
        .await?;

        Ok(vmid)
    }

    /// Stops a single VM. `caller_namespace`, when set, enforces namespace
    /// isolation (§8 property 8): a mismatch surfaces `NotFound` without
    /// revealing that the workload exists under a different namespace.
    pub async fn stop(
        self: &Arc<Self>,
        vmid: &str,
        undeploy: bool,
        caller_namespace: Option<&str>,
    ) -> Result<(), ManagerError> {
        if let Some(caller_namespace) = caller_namespace
            && let Some(entry) = self.registry.lookup(vmid).await
        {
            let actual = entry.record.lock().await.namespace().map(|s| s.to_string());
            if actual.as_deref() != Some(caller_namespace) {
                return Err(ManagerError::NotFound);
            }
        }

        stop_vm(
            vmid,
            undeploy,
            self.registry.clone(),
            self.bus.clone(),
            self.config.clone(),
            self.telemetry.clone(),
        )
        .await
    }

    /// Single-shot manager shutdown (§4.5). Safe to call more than once; only
    /// the first call runs the body.
    pub async fn shutdown(self: &Arc<Self>) {
        if self
            .shutdown_started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        info!("manager shutdown starting");
        self.pool.close();
        self.cancel.cancel();

        for vmid in self.registry.iter_ids().await {
            if let Err(err) = self.stop(&vmid, true, None).await {
                warn!(vmid = %vmid, error = %err, "error stopping vm during shutdown");
            }
        }

        cleanup_stale_sockets(&self.config);
        info!("manager shutdown complete");
    }
}
