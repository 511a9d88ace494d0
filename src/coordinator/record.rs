//! Durable resharding state
//!
//! Holds:
//! - The operation record (one per resharding operation)
//! - Coordinator phases and per-participant sub-states
//! - Catalog rows: collection entries, partition ranges (chunks), zones
//!
//! Types stored in the catalog are persisted with bincode, so they avoid
//! internally tagged enums and `skip_serializing_if`. `ParticipantDescriptor`
//! is only carried over JSON and is tagged by role.

use crate::common::{timestamp_now, Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

pub type OperationId = Uuid;
pub type ShardId = String;
/// Logical cluster time reported by donors
pub type Timestamp = u64;

/// Coordinator phases, in the only order they may be entered.
/// `Error` is terminal and reachable from any non-terminal phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CoordinatorPhase {
    Unused,
    Initializing,
    Initialized,
    PreparingToDonate,
    Cloning,
    Mirroring,
    Committed,
    Dropping,
    Done,
    Error,
}

impl CoordinatorPhase {
    pub const SUCCESS_PATH: [CoordinatorPhase; 9] = [
        CoordinatorPhase::Unused,
        CoordinatorPhase::Initializing,
        CoordinatorPhase::Initialized,
        CoordinatorPhase::PreparingToDonate,
        CoordinatorPhase::Cloning,
        CoordinatorPhase::Mirroring,
        CoordinatorPhase::Committed,
        CoordinatorPhase::Dropping,
        CoordinatorPhase::Done,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CoordinatorPhase::Unused => "unused",
            CoordinatorPhase::Initializing => "initializing",
            CoordinatorPhase::Initialized => "initialized",
            CoordinatorPhase::PreparingToDonate => "preparing-to-donate",
            CoordinatorPhase::Cloning => "cloning",
            CoordinatorPhase::Mirroring => "mirroring",
            CoordinatorPhase::Committed => "committed",
            CoordinatorPhase::Dropping => "dropping",
            CoordinatorPhase::Done => "done",
            CoordinatorPhase::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CoordinatorPhase::Done | CoordinatorPhase::Error)
    }

    /// Successor on the success path
    pub fn next(&self) -> Option<CoordinatorPhase> {
        let idx = Self::SUCCESS_PATH.iter().position(|p| p == self)?;
        Self::SUCCESS_PATH.get(idx + 1).copied()
    }

    /// Whether the commit decision has been made durable
    pub fn is_committed(&self) -> bool {
        matches!(
            self,
            CoordinatorPhase::Committed | CoordinatorPhase::Dropping | CoordinatorPhase::Done
        )
    }
}

impl std::fmt::Display for CoordinatorPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantRole {
    Donor,
    Recipient,
}

impl std::fmt::Display for ParticipantRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParticipantRole::Donor => write!(f, "donor"),
            ParticipantRole::Recipient => write!(f, "recipient"),
        }
    }
}

/// Donor sub-states, ordered by progress. `Error` sorts last but is never "reached".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DonorState {
    Unused,
    PreparingToDonate,
    ReadyToDonate,
    Donating,
    Mirroring,
    Dropped,
    Error,
}

impl DonorState {
    pub fn has_reached(self, target: DonorState) -> bool {
        self != DonorState::Error && self >= target
    }
}

/// Recipient sub-states, ordered by progress. `Error` sorts last but is never "reached".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecipientState {
    Unused,
    CreatingCollection,
    CreatedCollection,
    Cloning,
    Cloned,
    Applying,
    StrictConsistency,
    Renamed,
    Error,
}

impl RecipientState {
    pub fn has_reached(self, target: RecipientState) -> bool {
        self != RecipientState::Error && self >= target
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DonorShard {
    pub id: ShardId,
    pub state: DonorState,
    /// Earliest snapshot time this donor can serve, reported once ready
    pub min_fetch_timestamp: Option<Timestamp>,
    pub abort_reason: Option<String>,
}

impl DonorShard {
    pub fn new(id: impl Into<ShardId>) -> Self {
        Self {
            id: id.into(),
            state: DonorState::Unused,
            min_fetch_timestamp: None,
            abort_reason: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipientShard {
    pub id: ShardId,
    pub state: RecipientState,
    pub abort_reason: Option<String>,
}

impl RecipientShard {
    pub fn new(id: impl Into<ShardId>) -> Self {
        Self {
            id: id.into(),
            state: RecipientState::Unused,
            abort_reason: None,
        }
    }
}

/// A participant's reported progress, tagged by role
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum ParticipantDescriptor {
    Donor(DonorShard),
    Recipient(RecipientShard),
}

impl ParticipantDescriptor {
    pub fn role(&self) -> ParticipantRole {
        match self {
            ParticipantDescriptor::Donor(_) => ParticipantRole::Donor,
            ParticipantDescriptor::Recipient(_) => ParticipantRole::Recipient,
        }
    }

    pub fn shard_id(&self) -> &str {
        match self {
            ParticipantDescriptor::Donor(d) => &d.id,
            ParticipantDescriptor::Recipient(r) => &r.id,
        }
    }

    /// Reason, if the participant reported an unrecoverable error
    pub fn failure(&self) -> Option<String> {
        match self {
            ParticipantDescriptor::Donor(d) if d.state == DonorState::Error => Some(
                d.abort_reason
                    .clone()
                    .unwrap_or_else(|| "donor reported error".to_string()),
            ),
            ParticipantDescriptor::Recipient(r) if r.state == RecipientState::Error => Some(
                r.abort_reason
                    .clone()
                    .unwrap_or_else(|| "recipient reported error".to_string()),
            ),
            _ => None,
        }
    }
}

/// One range of the new shard key and its owner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRange {
    pub min: String,
    pub max: String,
    pub shard: ShardId,
}

/// A zone pinned to a range of the new shard key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneRange {
    pub name: String,
    pub min: String,
    pub max: String,
}

/// Initial ranges and zones under the new shard key, computed by the planner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionAssignment {
    pub chunks: Vec<ChunkRange>,
    pub zones: Vec<ZoneRange>,
}

impl PartitionAssignment {
    /// Ranges must be non-empty, contiguous and owned by recipients
    pub fn validate(&self, recipients: &[RecipientShard]) -> Result<()> {
        if self.chunks.is_empty() {
            return Err(Error::InvalidRequest(
                "partition assignment has no chunks".into(),
            ));
        }
        for chunk in &self.chunks {
            if chunk.min >= chunk.max {
                return Err(Error::InvalidRequest(format!(
                    "chunk [{}, {}) is empty",
                    chunk.min, chunk.max
                )));
            }
            if !recipients.iter().any(|r| r.id == chunk.shard) {
                return Err(Error::InvalidRequest(format!(
                    "chunk [{}, {}) is owned by {} which is not a recipient",
                    chunk.min, chunk.max, chunk.shard
                )));
            }
        }
        for pair in self.chunks.windows(2) {
            if pair[0].max != pair[1].min {
                return Err(Error::InvalidRequest(format!(
                    "chunks are not contiguous at {} / {}",
                    pair[0].max, pair[1].min
                )));
            }
        }
        for zone in &self.zones {
            if zone.name.is_empty() || zone.min >= zone.max {
                return Err(Error::InvalidRequest(format!(
                    "invalid zone {:?} [{}, {})",
                    zone.name, zone.min, zone.max
                )));
            }
        }
        // Zones are keyed by their min, so ranges may not overlap
        let mut zones: Vec<&ZoneRange> = self.zones.iter().collect();
        zones.sort_by(|a, b| a.min.cmp(&b.min));
        for pair in zones.windows(2) {
            if pair[1].min < pair[0].max {
                return Err(Error::InvalidRequest(format!(
                    "zones {:?} and {:?} overlap at [{}, {})",
                    pair[0].name, pair[1].name, pair[1].min, pair[0].max
                )));
            }
        }
        Ok(())
    }
}

/// Request to change the shard key of one collection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReshardRequest {
    pub namespace: String,
    pub new_shard_key: Vec<String>,
    pub donors: Vec<ShardId>,
    pub recipients: Vec<ShardId>,
}

/// The operation record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub operation_id: OperationId,
    pub phase: CoordinatorPhase,
    pub original_namespace: String,
    pub temporary_namespace: String,
    pub new_shard_key: Vec<String>,
    pub donors: Vec<DonorShard>,
    pub recipients: Vec<RecipientShard>,
    /// Agreed snapshot time, set when entering `Cloning`
    pub fetch_timestamp: Option<Timestamp>,
    /// Set exactly once, before the record first becomes durable
    pub partition_assignment: Option<PartitionAssignment>,
    pub garbage_collectable: bool,
    pub abort_reason: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl OperationRecord {
    /// Build the in-memory record for a fresh operation
    pub fn new(request: ReshardRequest) -> Result<Self> {
        if !request.namespace.contains('.') {
            return Err(Error::InvalidRequest(format!(
                "namespace {:?} must be <db>.<collection>",
                request.namespace
            )));
        }
        if request.new_shard_key.is_empty() {
            return Err(Error::InvalidRequest("new shard key is empty".into()));
        }
        let donors = unique_shards("donor", request.donors)?;
        let recipients = unique_shards("recipient", request.recipients)?;

        let operation_id = Uuid::new_v4();
        let now = timestamp_now();
        Ok(Self {
            operation_id,
            phase: CoordinatorPhase::Unused,
            temporary_namespace: temporary_namespace(&request.namespace, &operation_id),
            original_namespace: request.namespace,
            new_shard_key: request.new_shard_key,
            donors: donors.into_iter().map(DonorShard::new).collect(),
            recipients: recipients.into_iter().map(RecipientShard::new).collect(),
            fetch_timestamp: None,
            partition_assignment: None,
            garbage_collectable: false,
            abort_reason: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// All participant descriptors, donors first
    pub fn participants(&self) -> Vec<ParticipantDescriptor> {
        self.donors
            .iter()
            .cloned()
            .map(ParticipantDescriptor::Donor)
            .chain(
                self.recipients
                    .iter()
                    .cloned()
                    .map(ParticipantDescriptor::Recipient),
            )
            .collect()
    }

    /// Replace the stored descriptor for the reporting participant
    pub fn apply_participant(&mut self, descriptor: ParticipantDescriptor) -> Result<()> {
        let slot_found = match descriptor {
            ParticipantDescriptor::Donor(donor) => self
                .donors
                .iter_mut()
                .find(|d| d.id == donor.id)
                .map(|slot| *slot = donor)
                .is_some(),
            ParticipantDescriptor::Recipient(recipient) => self
                .recipients
                .iter_mut()
                .find(|r| r.id == recipient.id)
                .map(|slot| *slot = recipient)
                .is_some(),
        };
        if !slot_found {
            return Err(Error::InvariantViolation(format!(
                "participant set of {} is fixed",
                self.operation_id
            )));
        }
        Ok(())
    }

    pub fn donor_ids(&self) -> Vec<ShardId> {
        self.donors.iter().map(|d| d.id.clone()).collect()
    }

    pub fn recipient_ids(&self) -> Vec<ShardId> {
        self.recipients.iter().map(|r| r.id.clone()).collect()
    }

    /// Donors and recipients without duplicates
    pub fn all_shard_ids(&self) -> Vec<ShardId> {
        let all: BTreeSet<ShardId> = self
            .donor_ids()
            .into_iter()
            .chain(self.recipient_ids())
            .collect();
        all.into_iter().collect()
    }
}

fn unique_shards(role: &str, shards: Vec<ShardId>) -> Result<Vec<ShardId>> {
    if shards.is_empty() {
        return Err(Error::InvalidRequest(format!("no {} shards given", role)));
    }
    let mut seen = BTreeSet::new();
    for shard in &shards {
        if shard.is_empty() || !seen.insert(shard.as_str()) {
            return Err(Error::InvalidRequest(format!(
                "invalid or duplicate {} shard {:?}",
                role, shard
            )));
        }
    }
    Ok(shards)
}

/// `<db>.system.resharding.<uuid>`
pub fn temporary_namespace(original: &str, operation_id: &OperationId) -> String {
    let db = original.split('.').next().unwrap_or(original);
    format!("{}.system.resharding.{}", db, operation_id)
}

// === Catalog rows ===

/// Which side of the operation a catalog entry describes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReshardingEntryKind {
    /// The collection being resharded
    Source { temporary_namespace: String },
    /// The collection being built under the new shard key
    Temporary {
        original_namespace: String,
        fetch_timestamp: Option<Timestamp>,
    },
}

/// "Resharding in progress" annotation on a catalog entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReshardingFields {
    pub operation_id: OperationId,
    pub phase: CoordinatorPhase,
    pub kind: ReshardingEntryKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionEntry {
    pub namespace: String,
    pub uuid: Uuid,
    pub shard_key: Vec<String>,
    /// Bumped whenever ownership of the namespace changes
    pub epoch: u64,
    pub resharding: Option<ReshardingFields>,
    pub updated_at: u64,
}

/// One partition-range row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkEntry {
    pub collection_uuid: Uuid,
    pub namespace: String,
    pub min: String,
    pub max: String,
    pub shard: ShardId,
    pub version: u64,
}

/// One zone row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneEntry {
    pub namespace: String,
    pub name: String,
    pub min: String,
    pub max: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> ReshardRequest {
        ReshardRequest {
            namespace: "app.users".to_string(),
            new_shard_key: vec!["tenant".to_string()],
            donors: vec!["shard-a".to_string(), "shard-b".to_string()],
            recipients: vec!["shard-b".to_string(), "shard-c".to_string()],
        }
    }

    #[test]
    fn test_phase_order() {
        let mut phase = CoordinatorPhase::Unused;
        let mut seen = vec![phase];
        while let Some(next) = phase.next() {
            assert!(next > phase);
            seen.push(next);
            phase = next;
        }
        assert_eq!(seen, CoordinatorPhase::SUCCESS_PATH.to_vec());
        assert_eq!(CoordinatorPhase::Done.next(), None);
        assert_eq!(CoordinatorPhase::Error.next(), None);
        assert!(CoordinatorPhase::Error.is_terminal());
        assert!(!CoordinatorPhase::Committed.is_terminal());
    }

    #[test]
    fn test_sub_state_reached() {
        assert!(RecipientState::Cloned.has_reached(RecipientState::CreatedCollection));
        assert!(!RecipientState::Error.has_reached(RecipientState::CreatedCollection));
        assert!(!DonorState::PreparingToDonate.has_reached(DonorState::ReadyToDonate));
        assert!(DonorState::Dropped.has_reached(DonorState::Dropped));
    }

    #[test]
    fn test_new_record() {
        let record = OperationRecord::new(request()).unwrap();
        assert_eq!(record.phase, CoordinatorPhase::Unused);
        assert!(!record.garbage_collectable);
        assert!(record.partition_assignment.is_none());
        assert_eq!(
            record.temporary_namespace,
            format!("app.system.resharding.{}", record.operation_id)
        );
        assert_eq!(record.all_shard_ids(), vec!["shard-a", "shard-b", "shard-c"]);
        assert_eq!(record.participants().len(), 4);
    }

    #[test]
    fn test_new_record_rejects_bad_requests() {
        let mut dup = request();
        dup.donors.push("shard-a".to_string());
        assert!(OperationRecord::new(dup).is_err());

        let mut no_recipients = request();
        no_recipients.recipients.clear();
        assert!(OperationRecord::new(no_recipients).is_err());

        let mut bad_ns = request();
        bad_ns.namespace = "users".to_string();
        assert!(OperationRecord::new(bad_ns).is_err());
    }

    #[test]
    fn test_apply_participant_keeps_set_fixed() {
        let mut record = OperationRecord::new(request()).unwrap();
        let mut donor = DonorShard::new("shard-a");
        donor.state = DonorState::ReadyToDonate;
        donor.min_fetch_timestamp = Some(42);
        record
            .apply_participant(ParticipantDescriptor::Donor(donor.clone()))
            .unwrap();
        assert_eq!(record.donors[0], donor);

        let stranger = ParticipantDescriptor::Recipient(RecipientShard::new("shard-z"));
        assert!(record.apply_participant(stranger).is_err());
        assert_eq!(record.recipients.len(), 2);
    }

    #[test]
    fn test_assignment_validation() {
        let record = OperationRecord::new(request()).unwrap();
        let good = PartitionAssignment {
            chunks: vec![
                ChunkRange {
                    min: "a".into(),
                    max: "m".into(),
                    shard: "shard-b".into(),
                },
                ChunkRange {
                    min: "m".into(),
                    max: "z".into(),
                    shard: "shard-c".into(),
                },
            ],
            zones: vec![],
        };
        assert!(good.validate(&record.recipients).is_ok());

        let mut gap = good.clone();
        gap.chunks[1].min = "n".into();
        assert!(gap.validate(&record.recipients).is_err());

        let mut foreign = good.clone();
        foreign.chunks[0].shard = "shard-a".into();
        assert!(foreign.validate(&record.recipients).is_err());

        let zone = |name: &str, min: &str, max: &str| ZoneRange {
            name: name.into(),
            min: min.into(),
            max: max.into(),
        };
        let mut zoned = good.clone();
        zoned.zones = vec![zone("us", "f", "k"), zone("eu", "a", "f")];
        assert!(zoned.validate(&record.recipients).is_ok());

        let mut same_min = good.clone();
        same_min.zones = vec![zone("eu", "a", "f"), zone("apac", "a", "c")];
        assert!(same_min.validate(&record.recipients).is_err());

        let mut overlapping = good;
        overlapping.zones = vec![zone("eu", "a", "g"), zone("us", "f", "k")];
        assert!(overlapping.validate(&record.recipients).is_err());
    }

    #[test]
    fn test_descriptor_json_is_role_tagged() {
        let json = serde_json::json!({
            "role": "recipient",
            "id": "shard-c",
            "state": "created-collection",
            "abort_reason": null
        });
        let descriptor: ParticipantDescriptor = serde_json::from_value(json).unwrap();
        assert_eq!(descriptor.role(), ParticipantRole::Recipient);
        assert_eq!(descriptor.shard_id(), "shard-c");
        assert!(descriptor.failure().is_none());
    }
}
