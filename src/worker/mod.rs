//! The factory daemon: the long-running worker process that asks the
//! coordinator for work and performs it.
//!
//! The daemon is split in two tasks joined by bounded queues: the grab loop
//! claims work and settles the bookkeeping, the executor task runs the
//! provider actions. Both sides block only through the concurrency-kernel
//! helpers, so the whole daemon unwinds within one poll tick of the
//! shutdown signal, completing any claimed assignment's bookkeeping on the
//! way out.

pub mod provider;

use std::{sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use data_model::{GrabHints, GrabResponse, NodeId};
use provider::VmProvider;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use vmfleet_utils::{dequeue, enqueue, receive_with_timeout, wait_for_queue, WaitError};

use crate::{
    node_registry::NodeRegistry,
    vm_registry::VmRegistry,
    vmfactory::VmFactoryCoordinator,
};

/// Backoff before re-polling a store that reported a transient failure.
const STORE_BACKOFF: Duration = Duration::from_secs(2);

/// How long the shutdown path waits for the executor to report the item it
/// already started.
const CLEANUP_WINDOW: Duration = Duration::from_secs(60);

/// One unit of work handed to the executor task.
#[derive(Debug)]
enum WorkItem {
    Build { vm: NodeId },
    Destroy { vm: NodeId },
}

/// The executor's report back to the grab loop, sent as a JSON payload over
/// the done channel.
#[derive(Debug, Serialize, Deserialize)]
struct WorkOutcome {
    ok: bool,
    error: Option<String>,
}

impl WorkOutcome {
    fn success() -> Self {
        Self {
            ok: true,
            error: None,
        }
    }

    fn failure(err: impl std::fmt::Display) -> Self {
        Self {
            ok: false,
            error: Some(err.to_string()),
        }
    }
}

#[derive(Clone)]
pub struct FactoryWorker {
    machine: String,
    nodes: NodeRegistry,
    vms: VmRegistry,
    coordinator: VmFactoryCoordinator,
    provider: Arc<dyn VmProvider>,
    hints: GrabHints,
    poll_interval: Duration,
    shutdown: CancellationToken,
}

impl FactoryWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        machine: String,
        nodes: NodeRegistry,
        vms: VmRegistry,
        coordinator: VmFactoryCoordinator,
        provider: Arc<dyn VmProvider>,
        hints: GrabHints,
        poll_interval: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            machine,
            nodes,
            vms,
            coordinator,
            provider,
            hints,
            poll_interval,
            shutdown,
        }
    }

    /// Runs the factory until the shutdown signal fires.
    pub async fn run(&self) -> Result<()> {
        let id = self
            .nodes
            .allocate_id(&self.machine)
            .context("allocating factory id")?;
        self.coordinator
            .register(&id)
            .context("registering vm factory")?;
        info!(factory_id = %id, "vm factory registered");

        let (work_tx, work_rx) = mpsc::channel::<WorkItem>(1);
        let (done_tx, mut done_rx) = mpsc::channel::<Vec<u8>>(1);
        let executor = tokio::spawn(run_executor(
            self.provider.clone(),
            self.vms.clone(),
            work_rx,
            done_tx,
            self.poll_interval,
            self.shutdown.clone(),
        ));

        let result = self.grab_loop(&id, &work_tx, &mut done_rx).await;

        drop(work_tx);
        if let Err(err) = executor.await {
            error!(factory_id = %id, "executor task panicked: {err:?}");
        }
        // Hand back any still-claimed work before leaving the fleet.
        match self.coordinator.unregister(&id) {
            Ok(_) => info!(factory_id = %id, "vm factory unregistered"),
            Err(err) => error!(factory_id = %id, "failed to unregister vm factory: {err}"),
        }
        result
    }

    async fn grab_loop(
        &self,
        id: &NodeId,
        work_tx: &mpsc::Sender<WorkItem>,
        done_rx: &mut mpsc::Receiver<Vec<u8>>,
    ) -> Result<()> {
        loop {
            // Backpressure gate: never claim work while the executor is
            // still busy with the previous item.
            match wait_for_queue(work_tx, self.poll_interval, &self.shutdown).await {
                Ok(()) => {}
                Err(WaitError::Cancelled) => return Ok(()),
                Err(err) => bail!("work queue failed: {err}"),
            }

            match self.coordinator.grab(id, &self.hints) {
                Ok(GrabResponse::NoWork) => {
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(self.poll_interval) => {}
                    }
                }
                Ok(GrabResponse::BuildClean) => {
                    let vm = self.nodes.allocate_id(&self.machine)?;
                    if !self.dispatch(id, WorkItem::Build { vm }, work_tx, done_rx).await? {
                        return Ok(());
                    }
                }
                Ok(GrabResponse::DestroyDirty(vm)) => {
                    if !self
                        .dispatch(id, WorkItem::Destroy { vm }, work_tx, done_rx)
                        .await?
                    {
                        return Ok(());
                    }
                }
                Err(err) if err.is_retryable() => {
                    warn!(factory_id = %id, "shared store unavailable, backing off: {err}");
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(STORE_BACKOFF) => {}
                    }
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Hands one claimed item to the executor and settles the assignment
    /// once the outcome comes back. Returns Ok(false) when the shutdown
    /// signal interrupted the exchange; any bookkeeping the executor no
    /// longer settles is handed back by `unregister` afterwards.
    async fn dispatch(
        &self,
        id: &NodeId,
        item: WorkItem,
        work_tx: &mpsc::Sender<WorkItem>,
        done_rx: &mut mpsc::Receiver<Vec<u8>>,
    ) -> Result<bool> {
        let built_vm = match &item {
            WorkItem::Build { vm } => Some(vm.clone()),
            WorkItem::Destroy { .. } => None,
        };

        match enqueue(work_tx, item, self.poll_interval, &self.shutdown).await {
            Ok(()) => {}
            // The executor never saw the work; the assignment is still
            // claimed and will be handed back at unregister time.
            Err(WaitError::Cancelled) => return Ok(false),
            Err(err) => bail!("work queue failed: {err}"),
        }

        let outcome: WorkOutcome =
            match receive_with_timeout(done_rx, None, &self.shutdown, false).await {
                Ok(outcome) => outcome,
                Err(WaitError::Cancelled) => {
                    // Final cleanup exchange: the executor drains the item it
                    // already received, so wait for its report with
                    // cancellation suppressed and settle the books.
                    match receive_with_timeout(done_rx, Some(CLEANUP_WINDOW), &self.shutdown, true)
                        .await
                    {
                        Ok(outcome) => {
                            self.settle(id, built_vm, outcome)?;
                            return Ok(false);
                        }
                        Err(err) => {
                            warn!(
                                factory_id = %id,
                                "no outcome for in-flight work during shutdown: {err}"
                            );
                            return Ok(false);
                        }
                    }
                }
                Err(err) => bail!("factory outcome channel failed: {err}"),
            };

        self.settle(id, built_vm, outcome)?;
        Ok(true)
    }

    fn settle(&self, id: &NodeId, built_vm: Option<NodeId>, outcome: WorkOutcome) -> Result<()> {
        match built_vm {
            Some(vm) => {
                if outcome.ok {
                    self.coordinator.note_clean_id(id, &vm)?;
                } else {
                    // Finishing with no noted id registers nothing.
                    error!(factory_id = %id, vm_id = %vm, "clean build failed: {:?}", outcome.error);
                }
            }
            None => {
                if !outcome.ok {
                    error!(factory_id = %id, "dirty vm destruction failed: {:?}", outcome.error);
                }
            }
        }
        self.coordinator.finish(id)?;
        Ok(())
    }
}

async fn run_executor(
    provider: Arc<dyn VmProvider>,
    vms: VmRegistry,
    mut work_rx: mpsc::Receiver<WorkItem>,
    done_tx: mpsc::Sender<Vec<u8>>,
    poll_interval: Duration,
    shutdown: CancellationToken,
) {
    loop {
        let item = match dequeue(&mut work_rx, poll_interval, &shutdown).await {
            Ok(item) => item,
            Err(WaitError::Cancelled) => {
                // Drain the item the grab loop may have already enqueued so
                // shutdown never strands a claimed assignment.
                match work_rx.try_recv() {
                    Ok(item) => item,
                    Err(_) => return,
                }
            }
            Err(_) => return,
        };

        let outcome = execute(provider.as_ref(), &vms, item).await;
        let payload = match serde_json::to_vec(&outcome) {
            Ok(payload) => payload,
            Err(err) => {
                error!("failed to encode work outcome: {err}");
                return;
            }
        };
        // The done channel always has room: the grab loop consumes every
        // outcome before dispatching the next item.
        if done_tx.try_send(payload).is_err() {
            return;
        }
    }
}

async fn execute(provider: &dyn VmProvider, vms: &VmRegistry, item: WorkItem) -> WorkOutcome {
    match item {
        WorkItem::Build { vm } => match provider.build_clean(&vm).await {
            Ok(()) => {
                info!(vm_id = %vm, "clean vm built");
                WorkOutcome::success()
            }
            Err(err) => WorkOutcome::failure(err),
        },
        WorkItem::Destroy { vm } => match provider.destroy(&vm).await {
            Ok(()) => {
                info!(vm_id = %vm, "dirty vm destroyed");
                match vms.unregister(&vm) {
                    Ok(_) => WorkOutcome::success(),
                    Err(err) => WorkOutcome::failure(err),
                }
            }
            Err(err) => WorkOutcome::failure(err),
        },
    }
}
