//! Hosting for resharding coordinators
//!
//! The node that holds the resharding lease owns every operation record. On
//! `step_up` it loads all records and resumes one coordinator per record;
//! `step_down` revokes the lease, which cancels every running instance at
//! its next await point. Instances torn down by a fatal error are rebuilt
//! from their durable record while the lease is still held.

use crate::common::{timestamp_now, Error, Result};
use crate::coordinator::machine::{
    CompletionOutcome, CoordinatorDeps, PhaseChangeEvent, ReshardingCoordinator,
};
use crate::coordinator::record::{
    CoordinatorPhase, OperationId, OperationRecord, PartitionAssignment, ReshardRequest,
};
use crate::coordinator::store::{CatalogWrite, WriteBatch};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct Hosted {
    lease: Option<CancellationToken>,
    instances: HashMap<OperationId, Arc<ReshardingCoordinator>>,
}

pub struct ReshardingService {
    deps: CoordinatorDeps,
    gc_expiry: Duration,
    hosted: Mutex<Hosted>,
}

impl ReshardingService {
    pub fn new(deps: CoordinatorDeps, gc_expiry: Duration) -> Arc<Self> {
        Arc::new(Self {
            deps,
            gc_expiry,
            hosted: Mutex::new(Hosted::default()),
        })
    }

    fn hosted(&self) -> MutexGuard<'_, Hosted> {
        self.hosted.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<PhaseChangeEvent> {
        self.deps.events.subscribe()
    }

    pub fn holds_lease(&self) -> bool {
        self.hosted().lease.is_some()
    }

    /// Take ownership and resume every stored operation. Returns how many were resumed.
    pub fn step_up(self: &Arc<Self>) -> Result<usize> {
        let records = self.deps.store.list_operations()?;

        let lease = {
            let mut hosted = self.hosted();
            if hosted.lease.is_some() {
                return Ok(0);
            }
            let lease = CancellationToken::new();
            hosted.lease = Some(lease.clone());
            lease
        };

        let count = records.len();
        for record in records {
            tracing::info!(
                operation_id = %record.operation_id,
                phase = %record.phase,
                "resuming resharding operation"
            );
            let coordinator = ReshardingCoordinator::resume(record, self.deps.clone());
            self.hosted()
                .instances
                .insert(coordinator.operation_id(), coordinator.clone());
            self.supervise(coordinator, lease.clone());
        }
        tracing::info!("resharding lease acquired, {} operation(s) resumed", count);
        Ok(count)
    }

    /// Give up ownership. Running instances stop at their next await point.
    pub fn step_down(&self) {
        let (lease, instances) = {
            let mut hosted = self.hosted();
            (hosted.lease.take(), std::mem::take(&mut hosted.instances))
        };
        if let Some(lease) = lease {
            lease.cancel();
            tracing::info!("resharding lease released, {} instance(s) stopped", instances.len());
        }
    }

    /// Admit a new operation and start driving it
    pub fn start_operation(
        self: &Arc<Self>,
        request: ReshardRequest,
        assignment: Option<PartitionAssignment>,
    ) -> Result<Arc<ReshardingCoordinator>> {
        let coordinator = ReshardingCoordinator::create(request, self.deps.clone())?;
        if let Some(assignment) = assignment {
            coordinator.set_partition_assignment(assignment)?;
        }
        let namespace = coordinator.record().original_namespace;

        let lease = {
            let mut hosted = self.hosted();
            let lease = hosted.lease.clone().ok_or_else(|| {
                Error::Conflict("this node does not hold the resharding lease".into())
            })?;
            let busy = hosted.instances.values().find(|c| {
                let record = c.record();
                record.original_namespace == namespace && !record.phase.is_terminal()
            });
            if let Some(existing) = busy {
                return Err(Error::Conflict(format!(
                    "{} is already being resharded by {}",
                    namespace,
                    existing.operation_id()
                )));
            }
            hosted
                .instances
                .insert(coordinator.operation_id(), coordinator.clone());
            lease
        };

        tracing::info!(
            operation_id = %coordinator.operation_id(),
            %namespace,
            "resharding operation admitted"
        );
        self.supervise(coordinator.clone(), lease);
        Ok(coordinator)
    }

    pub fn get(&self, id: &OperationId) -> Result<Arc<ReshardingCoordinator>> {
        self.hosted()
            .instances
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("resharding operation {}", id)))
    }

    /// Current records of all hosted operations, oldest first
    pub fn list(&self) -> Vec<OperationRecord> {
        let instances: Vec<_> = self.hosted().instances.values().cloned().collect();
        let mut records: Vec<_> = instances.iter().map(|c| c.record()).collect();
        records.sort_by_key(|r| (r.created_at, r.operation_id));
        records
    }

    /// Wait for the outcome of `id`, following the operation across instance rebuilds
    pub async fn wait(&self, id: &OperationId) -> Result<CompletionOutcome> {
        loop {
            let completion = self.get(id)?.completion();
            match completion.await {
                Ok(outcome) => return Ok(outcome),
                Err(Error::Cancelled) if self.holds_lease() => {
                    tokio::time::sleep(self.deps.retry.initial_delay()).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Run `coordinator` until it completes, rebuilding it after a fatal teardown
    fn supervise(self: &Arc<Self>, coordinator: Arc<ReshardingCoordinator>, lease: CancellationToken) {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let id = coordinator.operation_id();
            let mut coordinator = coordinator;
            let mut delay = service.deps.retry.initial_delay();
            loop {
                coordinator.clone().run(lease.child_token()).await;
                if lease.is_cancelled() || coordinator.try_completion().is_some() {
                    return;
                }

                tracing::warn!(operation_id = %id, "rebuilding coordinator from durable state in {:?}", delay);
                tokio::select! {
                    _ = lease.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
                delay = (delay * 2).min(service.deps.retry.max_delay());

                match service.deps.store.get_operation(&id) {
                    Ok(Some(record)) => {
                        coordinator = ReshardingCoordinator::resume(record, service.deps.clone());
                        let mut hosted = service.hosted();
                        if hosted.lease.is_none() {
                            return;
                        }
                        hosted.instances.insert(id, coordinator.clone());
                    }
                    Ok(None) => {
                        tracing::warn!(operation_id = %id, "operation was never made durable, dropping it");
                        service.hosted().instances.remove(&id);
                        return;
                    }
                    Err(e) => {
                        tracing::warn!(operation_id = %id, "cannot reload operation: {}", e);
                    }
                }
            }
        });
    }

    /// Delete finished operations older than the expiry, with whatever catalog
    /// entries an aborted operation left behind. Returns how many were removed.
    pub fn sweep_garbage(&self) -> Result<usize> {
        let store = &self.deps.store;
        let expiry = self.gc_expiry.as_secs();
        let now = timestamp_now();
        let mut removed = 0;

        for record in store.list_operations()? {
            if !record.garbage_collectable
                || !record.phase.is_terminal()
                || record.updated_at.saturating_add(expiry) > now
            {
                continue;
            }

            let mut batch = WriteBatch::new();
            if record.phase == CoordinatorPhase::Error {
                for chunk in store.list_chunks(&record.operation_id)? {
                    // After a commit the chunks under this uuid are live
                    if chunk.namespace == record.temporary_namespace {
                        batch.push(CatalogWrite::DeleteChunk {
                            collection_uuid: chunk.collection_uuid,
                            min: chunk.min,
                        });
                    }
                }
                for zone in store.list_zones(&record.temporary_namespace)? {
                    batch.push(CatalogWrite::DeleteZone {
                        namespace: zone.namespace,
                        min: zone.min,
                    });
                }
                if store.get_collection(&record.temporary_namespace)?.is_some() {
                    batch.push(CatalogWrite::DeleteCollection(
                        record.temporary_namespace.clone(),
                    ));
                }
                if let Some(mut original) = store.get_collection(&record.original_namespace)? {
                    let ours = original
                        .resharding
                        .as_ref()
                        .is_some_and(|f| f.operation_id == record.operation_id);
                    if ours {
                        original.resharding = None;
                        original.updated_at = now;
                        batch.put_collection(original);
                    }
                }
            }
            batch.push(CatalogWrite::DeleteOperation(record.operation_id));
            store.apply(batch)?;

            self.hosted().instances.remove(&record.operation_id);
            tracing::info!(operation_id = %record.operation_id, phase = %record.phase, "swept finished operation");
            removed += 1;
        }
        Ok(removed)
    }

    /// Periodic sweep until `shutdown` fires
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                if !service.holds_lease() {
                    continue;
                }
                match service.sweep_garbage() {
                    Ok(0) => {}
                    Ok(n) => tracing::debug!("garbage sweep removed {} operation(s)", n),
                    Err(e) => tracing::warn!("garbage sweep failed: {}", e),
                }
            }
        })
    }
}
