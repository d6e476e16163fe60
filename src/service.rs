use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{
    api::CoordinatorApi,
    config::FleetConfig,
    node_registry::NodeRegistry,
    vm_registry::VmRegistry,
    vmfactory::VmFactoryCoordinator,
    worker::{
        provider::{CommandProvider, VmProvider},
        FactoryWorker,
    },
};
use shared_store::{open_store, ConnectionOptions, SharedStore};

#[derive(Clone)]
pub struct Service {
    pub config: FleetConfig,
    pub shutdown: CancellationToken,
    pub store: Arc<dyn SharedStore>,
    pub api: CoordinatorApi,
    pub node_registry: NodeRegistry,
    pub vm_registry: VmRegistry,
    pub coordinator: VmFactoryCoordinator,
}

impl Service {
    pub fn new(config: FleetConfig) -> Result<Self> {
        config.validate()?;
        let store = open_store(ConnectionOptions::Memory).context("error opening shared store")?;
        let node_registry = NodeRegistry::new(store.clone());
        let vm_registry = VmRegistry::new(store.clone());
        let coordinator = VmFactoryCoordinator::new(store.clone(), vm_registry.clone());
        let api = CoordinatorApi::new(
            node_registry.clone(),
            vm_registry.clone(),
            coordinator.clone(),
        );

        Ok(Self {
            config,
            shutdown: CancellationToken::new(),
            store,
            api,
            node_registry,
            vm_registry,
            coordinator,
        })
    }

    pub async fn start(&self) -> Result<()> {
        match self.factory_worker() {
            Some(worker) => {
                let mut handle = tokio::spawn(async move { worker.run().await });
                tokio::select! {
                    _ = signal::ctrl_c() => {
                        info!("shutdown signal received");
                        self.shutdown.cancel();
                        handle.await.context("factory worker task failed")?
                    }
                    // The worker only returns on its own when it hit an
                    // unrecoverable error.
                    result = &mut handle => {
                        result.context("factory worker task failed")?
                    }
                }
            }
            None => {
                info!("no provider commands configured; running coordination only");
                signal::ctrl_c().await?;
                info!("shutdown signal received");
                self.shutdown.cancel();
                Ok(())
            }
        }
    }

    fn factory_worker(&self) -> Option<FactoryWorker> {
        let create = self.config.factory.create_command.clone()?;
        let destroy = self.config.factory.destroy_command.clone()?;
        let provider: Arc<dyn VmProvider> = Arc::new(CommandProvider::new(create, destroy));
        Some(FactoryWorker::new(
            self.config.machine.clone(),
            self.node_registry.clone(),
            self.vm_registry.clone(),
            self.coordinator.clone(),
            provider,
            self.config.grab_hints(),
            self.config.poll_interval(),
            self.shutdown.clone(),
        ))
    }
}
