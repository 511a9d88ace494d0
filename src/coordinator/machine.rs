//! Resharding coordinator state machine
//!
//! One `ReshardingCoordinator` drives one operation through
//! `Unused → Initializing → Initialized → PreparingToDonate → Cloning →
//! Mirroring → Committed → Dropping → Done`, or into `Error`.
//!
//! Progress lives in the durable operation record, never in the task: the
//! driver always resumes from `record.phase`, and every durable step is one
//! atomic `WriteBatch`. Cancelling the driver between two awaits therefore
//! leaves the record at a phase boundary.

use crate::common::config::RetryConfig;
use crate::common::metrics::METRICS;
use crate::common::utils::{retry_with_backoff, RetryScope};
use crate::common::{timestamp_now, Error, Result};
use crate::coordinator::notifier::{ParticipantNotifier, RoutingNotifier};
use crate::coordinator::observer::{Gate, ProgressObserver};
use crate::coordinator::record::{
    ChunkEntry, CollectionEntry, CoordinatorPhase, OperationId, OperationRecord,
    ParticipantDescriptor, PartitionAssignment, ReshardRequest, ReshardingEntryKind,
    ReshardingFields, Timestamp, ZoneEntry,
};
use crate::coordinator::store::{CatalogStore, CatalogWrite, WriteBatch};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

/// Published for every phase change
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseChangeEvent {
    pub operation_id: OperationId,
    pub from: CoordinatorPhase,
    pub to: CoordinatorPhase,
    pub timestamp: i64,
}

/// Final outcome of an operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum CompletionOutcome {
    Succeeded,
    Failed { reason: String },
}

/// Collaborators shared by every coordinator on a node
#[derive(Clone)]
pub struct CoordinatorDeps {
    pub store: Arc<dyn CatalogStore>,
    pub notifier: ParticipantNotifier,
    pub retry: RetryConfig,
    pub events: broadcast::Sender<PhaseChangeEvent>,
}

impl CoordinatorDeps {
    pub fn new(
        store: Arc<dyn CatalogStore>,
        transport: Arc<dyn RoutingNotifier>,
        retry: RetryConfig,
    ) -> Self {
        let (events, _rx) = broadcast::channel(256);
        Self {
            store,
            notifier: ParticipantNotifier::new(transport),
            retry,
            events,
        }
    }
}

pub struct ReshardingCoordinator {
    id: OperationId,
    /// Last durable state, plus in-memory-only `Initializing`. Never held across an await.
    record: Mutex<OperationRecord>,
    observer: ProgressObserver,
    store: Arc<dyn CatalogStore>,
    notifier: ParticipantNotifier,
    retry: RetryConfig,
    events: broadcast::Sender<PhaseChangeEvent>,
    assignment: watch::Sender<Option<PartitionAssignment>>,
    completion: watch::Sender<Option<CompletionOutcome>>,
    user_abort: OnceLock<String>,
    abort_requested: CancellationToken,
    /// Ownership token of the running driver; once cancelled this instance is stale
    lease: OnceLock<CancellationToken>,
    started: AtomicBool,
}

impl ReshardingCoordinator {
    /// Build the instance for a record, fresh or loaded from the catalog.
    ///
    /// Running it continues from `record.phase`.
    pub fn resume(record: OperationRecord, deps: CoordinatorDeps) -> Arc<Self> {
        let observer = ProgressObserver::new(&record);
        let (assignment, _) = watch::channel(record.partition_assignment.clone());
        let (completion, _) = watch::channel(None);
        Arc::new(Self {
            id: record.operation_id,
            record: Mutex::new(record),
            observer,
            store: deps.store,
            notifier: deps.notifier,
            retry: deps.retry,
            events: deps.events,
            assignment,
            completion,
            user_abort: OnceLock::new(),
            abort_requested: CancellationToken::new(),
            lease: OnceLock::new(),
            started: AtomicBool::new(false),
        })
    }

    /// Build the instance for a new request; nothing is durable until `Initialize`
    pub fn create(request: ReshardRequest, deps: CoordinatorDeps) -> Result<Arc<Self>> {
        Ok(Self::resume(OperationRecord::new(request)?, deps))
    }

    pub fn operation_id(&self) -> OperationId {
        self.id
    }

    pub fn record(&self) -> OperationRecord {
        self.lock_record().clone()
    }

    pub fn phase(&self) -> CoordinatorPhase {
        self.lock_record().phase
    }

    pub fn observer(&self) -> &ProgressObserver {
        &self.observer
    }

    /// True once the ownership this instance ran under was revoked
    pub fn is_revoked(&self) -> bool {
        self.lease.get().is_some_and(|lease| lease.is_cancelled())
    }

    fn lock_record(&self) -> MutexGuard<'_, OperationRecord> {
        self.record.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Supply the planner's ranges and zones. Accepted once.
    pub fn set_partition_assignment(&self, assignment: PartitionAssignment) -> Result<()> {
        {
            let record = self.lock_record();
            if record.partition_assignment.is_some() {
                return Err(Error::Conflict(format!(
                    "partition assignment of {} is already set",
                    self.id
                )));
            }
            assignment.validate(&record.recipients)?;
        }

        let mut accepted = false;
        self.assignment.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(assignment);
            accepted = true;
            true
        });

        if accepted {
            Ok(())
        } else {
            Err(Error::Conflict(format!(
                "partition assignment of {} is already set",
                self.id
            )))
        }
    }

    /// Resolves once the operation reached `Done` or `Error`.
    ///
    /// Fails with `Error::Cancelled` if this instance is dropped first.
    pub fn completion(&self) -> impl Future<Output = Result<CompletionOutcome>> + Send + 'static {
        let mut rx = self.completion.subscribe();
        async move {
            let outcome = rx
                .wait_for(|c| c.is_some())
                .await
                .map_err(|_| Error::Cancelled)?
                .clone();
            outcome.ok_or(Error::Cancelled)
        }
    }

    pub fn try_completion(&self) -> Option<CompletionOutcome> {
        self.completion.borrow().clone()
    }

    /// Accept a participant's state report: persist it, then wake the observer.
    ///
    /// Fails with `Error::Cancelled` once this instance lost ownership, or when
    /// the durable record moved past the copy held here.
    pub fn on_participant_update(&self, descriptor: ParticipantDescriptor) -> Result<()> {
        self.observer.validate(&descriptor)?;
        if self.is_revoked() {
            return Err(Error::Cancelled);
        }
        {
            let mut record = self.lock_record();
            if record.phase.is_terminal() {
                return Err(Error::Conflict(format!(
                    "operation {} already finished in phase {}",
                    self.id, record.phase
                )));
            }
            let mut next = record.clone();
            next.apply_participant(descriptor.clone())?;
            if next != *record && record.phase >= CoordinatorPhase::Initialized {
                let durable = self.store.get_operation(&self.id)?;
                if durable.map(|d| d.phase) != Some(record.phase) {
                    tracing::warn!(operation_id = %self.id, phase = %record.phase, "stale coordinator refused participant update");
                    return Err(Error::Cancelled);
                }
                next.updated_at = timestamp_now();
                let mut batch = WriteBatch::new();
                batch.put_operation(next.clone());
                self.store.apply(batch)?;
            }
            *record = next;
        }
        METRICS.participant_updates.inc();
        tracing::debug!(
            operation_id = %self.id,
            shard = descriptor.shard_id(),
            role = %descriptor.role(),
            "participant update"
        );
        self.observer.on_participant_update(descriptor)
    }

    /// Request an abort. Only possible before the commit decision is durable.
    pub fn abort(&self, reason: impl Into<String>) -> Result<()> {
        let reason = reason.into();
        {
            // Held while recording the request so it cannot interleave with the commit write
            let record = self.lock_record();
            if record.phase.is_terminal() || record.phase.is_committed() {
                return Err(Error::Conflict(format!(
                    "operation {} cannot be aborted in phase {}",
                    self.id, record.phase
                )));
            }
            if self.user_abort.set(reason.clone()).is_err() {
                return Ok(());
            }
        }
        tracing::warn!(operation_id = %self.id, "abort requested: {}", reason);
        self.observer.abort(reason);
        self.abort_requested.cancel();
        Ok(())
    }

    /// Drive the operation until it finishes or `cancel` fires.
    ///
    /// Only the first call on an instance does anything. Outcomes are observable
    /// through `completion()` and the durable record.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        if self.started.swap(true, Ordering::SeqCst) {
            tracing::warn!(operation_id = %self.id, "coordinator already running");
            return;
        }
        let _ = self.lease.set(cancel.clone());
        METRICS.operations_in_flight.inc();
        tracing::info!(operation_id = %self.id, phase = %self.phase(), "coordinator running");

        let outcome = tokio::select! {
            _ = cancel.cancelled() => None,
            res = self.drive_until_aborted(&cancel) => Some(res),
        };

        match outcome {
            None | Some(Err(Error::Cancelled)) => {
                tracing::info!(operation_id = %self.id, "ownership released, stopping");
            }
            Some(Ok(())) => {}
            Some(Err(e)) if e.is_fatal() => {
                tracing::error!(operation_id = %self.id, "coordinator torn down: {}", e);
            }
            Some(Err(e)) => {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::info!(operation_id = %self.id, "ownership released during abort");
                    }
                    _ = self.abort_path(&e, &cancel) => {}
                }
            }
        }
        METRICS.operations_in_flight.dec();
    }

    async fn drive_until_aborted(&self, cancel: &CancellationToken) -> Result<()> {
        tokio::select! {
            biased;
            _ = self.abort_requested.cancelled() => Err(Error::Aborted(
                self.user_abort.get().cloned().unwrap_or_default(),
            )),
            res = self.drive(cancel) => res,
        }
    }

    async fn drive(&self, cancel: &CancellationToken) -> Result<()> {
        match self.phase() {
            CoordinatorPhase::Done => return self.finalize(cancel).await,
            CoordinatorPhase::Error => {
                self.finish_failed();
                return Ok(());
            }
            phase if phase < CoordinatorPhase::Initialized => self.initialize(cancel).await?,
            _ => {}
        }

        if self.phase() < CoordinatorPhase::PreparingToDonate {
            self.observer
                .await_gate(Gate::RecipientsCreatedCollection)
                .await?;
            self.transition(CoordinatorPhase::PreparingToDonate, None, cancel)
                .await?;
        }

        if self.phase() < CoordinatorPhase::Cloning {
            let donors = self.observer.await_gate(Gate::DonorsReadyToDonate).await?;
            let fetch_timestamp = choose_fetch_timestamp(&donors)?;
            self.transition(CoordinatorPhase::Cloning, Some(fetch_timestamp), cancel)
                .await?;
        }

        if self.phase() < CoordinatorPhase::Mirroring {
            self.observer
                .await_gate(Gate::RecipientsFinishedCloning)
                .await?;
            self.transition(CoordinatorPhase::Mirroring, None, cancel)
                .await?;
        }

        if self.phase() < CoordinatorPhase::Committed {
            self.observer
                .await_gate(Gate::RecipientsStrictConsistency)
                .await?;
            self.commit(cancel).await?;
        }

        if self.phase() < CoordinatorPhase::Dropping {
            self.observer
                .await_gate(Gate::RecipientsRenamedCollection)
                .await?;
            self.transition(CoordinatorPhase::Dropping, None, cancel)
                .await?;
        }

        if self.phase() < CoordinatorPhase::Done {
            self.observer
                .await_gate(Gate::DonorsDroppedOriginalCollection)
                .await?;
        }

        self.finalize(cancel).await
    }

    // === Durable steps ===

    /// Insert the record, annotate the original collection, and create the
    /// temporary collection's catalog entry, chunks and zones
    async fn initialize(&self, cancel: &CancellationToken) -> Result<()> {
        self.enter_initializing();

        // Hard dependency: ranges are supplied by the planner after construction
        let assignment = self.await_partition_assignment().await?;

        let from = self.phase();
        self.write_with_retry("initialize", RetryScope::Transient, cancel, |rec, store| {
            if rec.phase >= CoordinatorPhase::Initialized {
                return Err(Error::InvariantViolation(format!(
                    "initialize re-entered in phase {}",
                    rec.phase
                )));
            }
            let mut original = store
                .get_collection(&rec.original_namespace)?
                .ok_or_else(|| {
                    Error::NotFound(format!("collection {}", rec.original_namespace))
                })?;
            if let Some(existing) = &original.resharding {
                if existing.operation_id != rec.operation_id && !existing.phase.is_terminal() {
                    return Err(Error::Conflict(format!(
                        "{} is already being resharded by {}",
                        rec.original_namespace, existing.operation_id
                    )));
                }
            }

            rec.phase = CoordinatorPhase::Initialized;
            rec.partition_assignment = Some(assignment.clone());

            let mut batch = WriteBatch::new();
            original.resharding = Some(ReshardingFields {
                operation_id: rec.operation_id,
                phase: rec.phase,
                kind: ReshardingEntryKind::Source {
                    temporary_namespace: rec.temporary_namespace.clone(),
                },
            });
            original.updated_at = rec.updated_at;
            batch.put_collection(original);

            batch.put_collection(CollectionEntry {
                namespace: rec.temporary_namespace.clone(),
                uuid: rec.operation_id,
                shard_key: rec.new_shard_key.clone(),
                epoch: 1,
                resharding: Some(ReshardingFields {
                    operation_id: rec.operation_id,
                    phase: rec.phase,
                    kind: ReshardingEntryKind::Temporary {
                        original_namespace: rec.original_namespace.clone(),
                        fetch_timestamp: None,
                    },
                }),
                updated_at: rec.updated_at,
            });

            for chunk in &assignment.chunks {
                batch.push(CatalogWrite::PutChunk(ChunkEntry {
                    collection_uuid: rec.operation_id,
                    namespace: rec.temporary_namespace.clone(),
                    min: chunk.min.clone(),
                    max: chunk.max.clone(),
                    shard: chunk.shard.clone(),
                    version: 1,
                }));
            }
            for zone in &assignment.zones {
                batch.push(CatalogWrite::PutZone(ZoneEntry {
                    namespace: rec.temporary_namespace.clone(),
                    name: zone.name.clone(),
                    min: zone.min.clone(),
                    max: zone.max.clone(),
                }));
            }
            Ok(batch)
        })
        .await?;

        self.after_transition(from, CoordinatorPhase::Initialized);
        Ok(())
    }

    /// Make the temporary collection authoritative under the original namespace
    async fn commit(&self, cancel: &CancellationToken) -> Result<()> {
        self.write_with_retry("commit", RetryScope::Transient, cancel, |rec, store| {
            if let Some(reason) = self.user_abort.get() {
                return Err(Error::Aborted(reason.clone()));
            }
            if rec.phase != CoordinatorPhase::Mirroring {
                return Err(Error::InvariantViolation(format!(
                    "commit attempted in phase {}",
                    rec.phase
                )));
            }
            rec.phase = CoordinatorPhase::Committed;

            let original_ns = rec.original_namespace.clone();
            let original = store.get_collection(&original_ns)?.ok_or_else(|| {
                Error::InvariantViolation(format!("catalog entry for {} vanished", original_ns))
            })?;
            let already_swapped = original.uuid == rec.operation_id;
            let epoch = if already_swapped {
                original.epoch
            } else {
                original.epoch + 1
            };

            let mut batch = WriteBatch::new();

            // Old ownership goes first so the puts below win on shared keys.
            // Once swapped, the zones under the original namespace are already the new ones.
            if !already_swapped {
                for chunk in store.list_chunks(&original.uuid)? {
                    batch.push(CatalogWrite::DeleteChunk {
                        collection_uuid: original.uuid,
                        min: chunk.min,
                    });
                }
                for zone in store.list_zones(&original_ns)? {
                    batch.push(CatalogWrite::DeleteZone {
                        namespace: original_ns.clone(),
                        min: zone.min,
                    });
                }
            }

            for chunk in store.list_chunks(&rec.operation_id)? {
                batch.push(CatalogWrite::PutChunk(ChunkEntry {
                    namespace: original_ns.clone(),
                    version: epoch,
                    ..chunk
                }));
            }
            for zone in store.list_zones(&rec.temporary_namespace)? {
                batch.push(CatalogWrite::DeleteZone {
                    namespace: rec.temporary_namespace.clone(),
                    min: zone.min.clone(),
                });
                batch.push(CatalogWrite::PutZone(ZoneEntry {
                    namespace: original_ns.clone(),
                    ..zone
                }));
            }

            batch.put_collection(CollectionEntry {
                namespace: original_ns,
                uuid: rec.operation_id,
                shard_key: rec.new_shard_key.clone(),
                epoch,
                resharding: Some(ReshardingFields {
                    operation_id: rec.operation_id,
                    phase: rec.phase,
                    kind: ReshardingEntryKind::Source {
                        temporary_namespace: rec.temporary_namespace.clone(),
                    },
                }),
                updated_at: rec.updated_at,
            });
            batch.push(CatalogWrite::DeleteCollection(
                rec.temporary_namespace.clone(),
            ));
            Ok(batch)
        })
        .await?;

        self.after_transition(CoordinatorPhase::Mirroring, CoordinatorPhase::Committed);
        Ok(())
    }

    /// Enter `Done`: drop the annotation, mark the record collectable, notify, complete
    async fn finalize(&self, cancel: &CancellationToken) -> Result<()> {
        let from = self.phase();
        if from != CoordinatorPhase::Done {
            self.write_with_retry("finalize", RetryScope::Transient, cancel, |rec, store| {
                if rec.phase != CoordinatorPhase::Dropping {
                    return Err(Error::InvariantViolation(format!(
                        "finalize attempted in phase {}",
                        rec.phase
                    )));
                }
                rec.phase = CoordinatorPhase::Done;
                rec.garbage_collectable = true;

                let mut batch = WriteBatch::new();
                if let Some(mut entry) = store.get_collection(&rec.original_namespace)? {
                    let ours = entry
                        .resharding
                        .as_ref()
                        .is_some_and(|f| f.operation_id == rec.operation_id);
                    if ours {
                        entry.resharding = None;
                        entry.updated_at = rec.updated_at;
                        batch.put_collection(entry);
                    }
                }
                Ok(batch)
            })
            .await?;
            self.after_transition(from, CoordinatorPhase::Done);
        } else {
            self.refresh_after(CoordinatorPhase::Done);
        }

        tracing::info!(operation_id = %self.id, "resharding finished");
        self.fulfill(CompletionOutcome::Succeeded);
        Ok(())
    }

    /// Persist `Error`, mark collectable, notify and complete with the failure.
    ///
    /// Retries every error except invariant violations: an operation that
    /// failed without recording it would never be seen as finished.
    async fn abort_path(&self, cause: &Error, cancel: &CancellationToken) {
        let reason = cause.to_string();
        tracing::error!(operation_id = %self.id, phase = %self.phase(), "resharding failed: {}", reason);

        let from = self.phase();
        let res = self
            .write_with_retry("abort", RetryScope::Always, cancel, |rec, store| {
                if rec.phase.is_terminal() {
                    return Err(Error::InvariantViolation(format!(
                        "abort attempted in terminal phase {}",
                        rec.phase
                    )));
                }
                rec.phase = CoordinatorPhase::Error;
                rec.garbage_collectable = true;
                rec.abort_reason = Some(reason.clone());
                mirror_phase(rec, store)
            })
            .await;

        match res {
            Ok(_) => {
                self.after_transition(from, CoordinatorPhase::Error);
                self.finish_failed();
            }
            Err(e) => {
                tracing::warn!(operation_id = %self.id, "could not record failure: {}", e);
            }
        }
    }

    /// Plain phase advance on the success path, mirrored into the catalog
    async fn transition(
        &self,
        to: CoordinatorPhase,
        fetch_timestamp: Option<Timestamp>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let from = self.phase();
        self.write_with_retry(to.as_str(), RetryScope::Transient, cancel, |rec, store| {
            if rec.phase.next() != Some(to) {
                return Err(Error::InvariantViolation(format!(
                    "illegal transition {} -> {}",
                    rec.phase, to
                )));
            }
            rec.phase = to;
            if fetch_timestamp.is_some() {
                rec.fetch_timestamp = fetch_timestamp;
            }
            mirror_phase(rec, store)
        })
        .await?;

        self.after_transition(from, to);
        Ok(())
    }

    async fn write_with_retry<F>(
        &self,
        what: &str,
        scope: RetryScope,
        cancel: &CancellationToken,
        mutate: F,
    ) -> Result<OperationRecord>
    where
        F: Fn(&mut OperationRecord, &dyn CatalogStore) -> Result<WriteBatch> + Sync,
    {
        retry_with_backoff(what, self.retry, scope, cancel, || {
            self.write_record(&mutate)
        })
        .await
    }

    /// Apply `mutate` to a copy of the record and commit it together with the
    /// catalog writes it returns. The in-memory record changes only on success.
    fn write_record<F>(&self, mutate: F) -> Result<OperationRecord>
    where
        F: FnOnce(&mut OperationRecord, &dyn CatalogStore) -> Result<WriteBatch>,
    {
        let mut record = self.lock_record();
        let mut next = record.clone();
        next.updated_at = timestamp_now();

        let mut batch = mutate(&mut next, self.store.as_ref())?;
        batch.put_operation(next.clone());
        self.store.apply(batch)?;

        *record = next.clone();
        Ok(next)
    }

    // === Non-durable helpers ===

    fn enter_initializing(&self) {
        let moved = {
            let mut record = self.lock_record();
            if record.phase == CoordinatorPhase::Unused {
                record.phase = CoordinatorPhase::Initializing;
                true
            } else {
                false
            }
        };
        if moved {
            METRICS.operations_started.inc();
            self.after_transition(CoordinatorPhase::Unused, CoordinatorPhase::Initializing);
        }
    }

    async fn await_partition_assignment(&self) -> Result<PartitionAssignment> {
        let mut rx = self.assignment.subscribe();
        let assignment = rx
            .wait_for(|a| a.is_some())
            .await
            .map_err(|_| Error::Cancelled)?
            .clone();
        assignment.ok_or(Error::Cancelled)
    }

    fn after_transition(&self, from: CoordinatorPhase, to: CoordinatorPhase) {
        METRICS.record_transition(to.as_str());
        tracing::info!(operation_id = %self.id, %from, %to, "resharding phase transition");
        // No subscribers is fine
        let _ = self.events.send(PhaseChangeEvent {
            operation_id: self.id,
            from,
            to,
            timestamp: Utc::now().timestamp_millis(),
        });
        self.refresh_after(to);
    }

    /// Which participants need to re-read routing after entering `phase`
    fn refresh_after(&self, phase: CoordinatorPhase) {
        let record = self.record();
        let original = record.original_namespace.as_str();
        let temporary = record.temporary_namespace.as_str();
        match phase {
            CoordinatorPhase::Unused | CoordinatorPhase::Initializing => {}
            CoordinatorPhase::PreparingToDonate | CoordinatorPhase::Dropping => {
                self.notifier
                    .tell_to_refresh(self.id, record.donor_ids(), original);
            }
            CoordinatorPhase::Cloning => {
                self.notifier
                    .tell_to_refresh(self.id, record.recipient_ids(), temporary);
            }
            CoordinatorPhase::Initialized | CoordinatorPhase::Mirroring | CoordinatorPhase::Error => {
                self.notifier
                    .tell_to_refresh(self.id, record.recipient_ids(), temporary);
                self.notifier
                    .tell_to_refresh(self.id, record.donor_ids(), original);
            }
            CoordinatorPhase::Committed | CoordinatorPhase::Done => {
                self.notifier
                    .tell_to_refresh(self.id, record.all_shard_ids(), original);
            }
        }
    }

    fn finish_failed(&self) {
        let reason = self
            .lock_record()
            .abort_reason
            .clone()
            .unwrap_or_else(|| "resharding failed".to_string());
        self.fulfill(CompletionOutcome::Failed { reason });
    }

    fn fulfill(&self, outcome: CompletionOutcome) {
        let succeeded = outcome == CompletionOutcome::Succeeded;
        let fulfilled = self.completion.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(outcome);
            true
        });
        if fulfilled {
            if succeeded {
                METRICS.operations_succeeded.inc();
            } else {
                METRICS.operations_failed.inc();
            }
        }
    }
}

/// Mirror the record's phase (and fetch timestamp) into both catalog annotations
fn mirror_phase(record: &OperationRecord, store: &dyn CatalogStore) -> Result<WriteBatch> {
    let mut batch = WriteBatch::new();
    for namespace in [&record.original_namespace, &record.temporary_namespace] {
        let Some(mut entry) = store.get_collection(namespace)? else {
            continue;
        };
        let Some(fields) = entry
            .resharding
            .as_mut()
            .filter(|f| f.operation_id == record.operation_id)
        else {
            continue;
        };
        fields.phase = record.phase;
        if let ReshardingEntryKind::Temporary {
            fetch_timestamp, ..
        } = &mut fields.kind
        {
            *fetch_timestamp = record.fetch_timestamp;
        }
        entry.updated_at = record.updated_at;
        batch.put_collection(entry);
    }
    Ok(batch)
}

/// Highest reported minimum, so every donor can serve the snapshot
fn choose_fetch_timestamp(donors: &[ParticipantDescriptor]) -> Result<Timestamp> {
    donors
        .iter()
        .filter_map(|p| match p {
            ParticipantDescriptor::Donor(d) => d.min_fetch_timestamp,
            ParticipantDescriptor::Recipient(_) => None,
        })
        .max()
        .ok_or_else(|| Error::InvariantViolation("no donor reported a fetch timestamp".into()))
}
