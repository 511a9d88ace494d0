//! Shared fixtures for the resharding tests

#![allow(dead_code)]

use async_trait::async_trait;
use minishard::common::RetryConfig;
use minishard::coordinator::notifier::RoutingNotifier;
use minishard::coordinator::record::{
    ChunkEntry, ChunkRange, CollectionEntry, CoordinatorPhase, DonorShard, DonorState,
    ParticipantDescriptor, PartitionAssignment, RecipientShard, RecipientState, ReshardRequest,
    ZoneRange,
};
use minishard::coordinator::record::{OperationId, OperationRecord, ZoneEntry};
use minishard::coordinator::store::{CatalogStore, CatalogWrite, MemCatalogStore, WriteBatch};
use minishard::coordinator::{CoordinatorDeps, ReshardingCoordinator};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

pub const NAMESPACE: &str = "app.users";
pub const DONORS: [&str; 2] = ["shard-a", "shard-b"];
pub const RECIPIENTS: [&str; 2] = ["shard-c", "shard-d"];

/// Records every refresh instead of sending it
#[derive(Default)]
pub struct RecordingNotifier {
    calls: Mutex<Vec<(String, String)>>,
}

impl RecordingNotifier {
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn refreshed(&self, shard: &str, namespace: &str) -> bool {
        self.calls()
            .iter()
            .any(|(s, ns)| s == shard && ns == namespace)
    }
}

#[async_trait]
impl RoutingNotifier for RecordingNotifier {
    async fn flush_routing_table(&self, shard: &str, namespace: &str) -> minishard::Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push((shard.to_string(), namespace.to_string()));
        Ok(())
    }
}

/// Applies every batch, but reports the next `n` batches that delete a
/// collection as failed, like a commit whose acknowledgement never arrived
#[derive(Default)]
pub struct LostAckStore {
    pub inner: MemCatalogStore,
    lose: AtomicUsize,
}

impl LostAckStore {
    pub fn lose_collection_drops(&self, n: usize) {
        self.lose.store(n, Ordering::SeqCst);
    }
}

impl CatalogStore for LostAckStore {
    fn apply(&self, batch: WriteBatch) -> minishard::Result<()> {
        let drops = batch
            .writes()
            .iter()
            .any(|w| matches!(w, CatalogWrite::DeleteCollection(_)));
        self.inner.apply(batch)?;
        let lost = drops
            && self
                .lose
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
        if lost {
            return Err(minishard::Error::StoreUnavailable("ack lost".into()));
        }
        Ok(())
    }

    fn get_operation(&self, id: &OperationId) -> minishard::Result<Option<OperationRecord>> {
        self.inner.get_operation(id)
    }

    fn list_operations(&self) -> minishard::Result<Vec<OperationRecord>> {
        self.inner.list_operations()
    }

    fn get_collection(&self, namespace: &str) -> minishard::Result<Option<CollectionEntry>> {
        self.inner.get_collection(namespace)
    }

    fn list_chunks(&self, collection_uuid: &Uuid) -> minishard::Result<Vec<ChunkEntry>> {
        self.inner.list_chunks(collection_uuid)
    }

    fn list_zones(&self, namespace: &str) -> minishard::Result<Vec<ZoneEntry>> {
        self.inner.list_zones(namespace)
    }
}

pub fn fast_retry() -> RetryConfig {
    RetryConfig {
        initial_delay_ms: 1,
        max_delay_ms: 10,
    }
}

pub fn deps(store: Arc<dyn CatalogStore>, notifier: Arc<RecordingNotifier>) -> CoordinatorDeps {
    CoordinatorDeps::new(store, notifier, fast_retry())
}

pub fn request() -> ReshardRequest {
    ReshardRequest {
        namespace: NAMESPACE.to_string(),
        new_shard_key: vec!["tenant".to_string(), "id".to_string()],
        donors: DONORS.iter().map(|s| s.to_string()).collect(),
        recipients: RECIPIENTS.iter().map(|s| s.to_string()).collect(),
    }
}

pub fn assignment() -> PartitionAssignment {
    PartitionAssignment {
        chunks: vec![
            ChunkRange {
                min: "a".into(),
                max: "m".into(),
                shard: "shard-c".into(),
            },
            ChunkRange {
                min: "m".into(),
                max: "z".into(),
                shard: "shard-d".into(),
            },
        ],
        zones: vec![ZoneRange {
            name: "eu".into(),
            min: "a".into(),
            max: "f".into(),
        }],
    }
}

/// The collection being resharded, owned by the donors. Returns its uuid.
pub fn seed_original(store: &dyn CatalogStore) -> Uuid {
    let uuid = Uuid::new_v4();
    let mut batch = WriteBatch::new();
    batch.put_collection(CollectionEntry {
        namespace: NAMESPACE.to_string(),
        uuid,
        shard_key: vec!["_id".to_string()],
        epoch: 3,
        resharding: None,
        updated_at: 0,
    });
    for (min, max, shard) in [("a", "k", "shard-a"), ("k", "z", "shard-b")] {
        batch.push(CatalogWrite::PutChunk(ChunkEntry {
            collection_uuid: uuid,
            namespace: NAMESPACE.to_string(),
            min: min.into(),
            max: max.into(),
            shard: shard.into(),
            version: 3,
        }));
    }
    store.apply(batch).unwrap();
    uuid
}

pub fn donor(id: &str, state: DonorState, ts: Option<u64>) -> ParticipantDescriptor {
    ParticipantDescriptor::Donor(DonorShard {
        id: id.to_string(),
        state,
        min_fetch_timestamp: ts,
        abort_reason: None,
    })
}

pub fn failed_donor(id: &str, reason: &str) -> ParticipantDescriptor {
    ParticipantDescriptor::Donor(DonorShard {
        id: id.to_string(),
        state: DonorState::Error,
        min_fetch_timestamp: None,
        abort_reason: Some(reason.to_string()),
    })
}

pub fn recipient(id: &str, state: RecipientState) -> ParticipantDescriptor {
    ParticipantDescriptor::Recipient(RecipientShard {
        id: id.to_string(),
        state,
        abort_reason: None,
    })
}

pub fn report_recipients(coord: &ReshardingCoordinator, state: RecipientState) {
    for id in RECIPIENTS {
        coord.on_participant_update(recipient(id, state)).unwrap();
    }
}

pub fn report_donors_ready(coord: &ReshardingCoordinator, timestamps: [u64; 2]) {
    for (id, ts) in DONORS.iter().zip(timestamps) {
        coord
            .on_participant_update(donor(id, DonorState::ReadyToDonate, Some(ts)))
            .unwrap();
    }
}

pub fn report_donors(coord: &ReshardingCoordinator, state: DonorState) {
    for id in DONORS {
        coord.on_participant_update(donor(id, state, Some(1))).unwrap();
    }
}

/// Poll until the coordinator reached `phase`
pub async fn wait_for_phase(coord: &ReshardingCoordinator, phase: CoordinatorPhase) {
    let reached = tokio::time::timeout(Duration::from_secs(5), async {
        while coord.phase() < phase {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await;
    assert!(
        reached.is_ok(),
        "timed out waiting for {}, still in {}",
        phase,
        coord.phase()
    );
}

/// Poll until `check` holds
pub async fn eventually<F: Fn() -> bool>(check: F) {
    let ok = tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await;
    assert!(ok.is_ok(), "condition not met in time");
}

/// Drive a running coordinator through every gate to `Done`
pub async fn drive_to_done(coord: &ReshardingCoordinator) {
    wait_for_phase(coord, CoordinatorPhase::Initialized).await;
    report_recipients(coord, RecipientState::CreatedCollection);
    wait_for_phase(coord, CoordinatorPhase::PreparingToDonate).await;
    report_donors_ready(coord, [100, 150]);
    wait_for_phase(coord, CoordinatorPhase::Cloning).await;
    report_recipients(coord, RecipientState::Cloned);
    wait_for_phase(coord, CoordinatorPhase::Mirroring).await;
    report_recipients(coord, RecipientState::StrictConsistency);
    wait_for_phase(coord, CoordinatorPhase::Committed).await;
    report_recipients(coord, RecipientState::Renamed);
    wait_for_phase(coord, CoordinatorPhase::Dropping).await;
    report_donors(coord, DonorState::Dropped);
    wait_for_phase(coord, CoordinatorPhase::Done).await;
}
