//! Progress observer
//!
//! Aggregates participant reports for one operation and resolves waits once
//! every expected participant of a role satisfies a condition. Waits are
//! driven by a `tokio::sync::watch` channel: each accepted report wakes the
//! waiters, which re-check their predicate. Nothing polls on a timer.

use crate::common::{Error, Result};
use crate::coordinator::record::{
    DonorState, OperationId, OperationRecord, ParticipantDescriptor, ParticipantRole,
    RecipientState, ShardId,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use tokio::sync::watch;

/// The aggregate conditions the coordinator waits on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Gate {
    RecipientsCreatedCollection,
    DonorsReadyToDonate,
    RecipientsFinishedCloning,
    RecipientsStrictConsistency,
    RecipientsRenamedCollection,
    DonorsDroppedOriginalCollection,
}

impl Gate {
    pub fn role(&self) -> ParticipantRole {
        match self {
            Gate::DonorsReadyToDonate | Gate::DonorsDroppedOriginalCollection => {
                ParticipantRole::Donor
            }
            _ => ParticipantRole::Recipient,
        }
    }

    /// Whether one participant has made it past this gate
    pub fn is_satisfied_by(&self, participant: &ParticipantDescriptor) -> bool {
        match (self, participant) {
            (Gate::RecipientsCreatedCollection, ParticipantDescriptor::Recipient(r)) => {
                r.state.has_reached(RecipientState::CreatedCollection)
            }
            (Gate::DonorsReadyToDonate, ParticipantDescriptor::Donor(d)) => {
                d.state.has_reached(DonorState::ReadyToDonate) && d.min_fetch_timestamp.is_some()
            }
            (Gate::RecipientsFinishedCloning, ParticipantDescriptor::Recipient(r)) => {
                r.state.has_reached(RecipientState::Cloned)
            }
            (Gate::RecipientsStrictConsistency, ParticipantDescriptor::Recipient(r)) => {
                r.state.has_reached(RecipientState::StrictConsistency)
            }
            (Gate::RecipientsRenamedCollection, ParticipantDescriptor::Recipient(r)) => {
                r.state.has_reached(RecipientState::Renamed)
            }
            (Gate::DonorsDroppedOriginalCollection, ParticipantDescriptor::Donor(d)) => {
                d.state.has_reached(DonorState::Dropped)
            }
            _ => false,
        }
    }
}

impl std::fmt::Display for Gate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Gate::RecipientsCreatedCollection => "all recipients created collection",
            Gate::DonorsReadyToDonate => "all donors ready to donate",
            Gate::RecipientsFinishedCloning => "all recipients finished cloning",
            Gate::RecipientsStrictConsistency => "all recipients in strict consistency",
            Gate::RecipientsRenamedCollection => "all recipients renamed collection",
            Gate::DonorsDroppedOriginalCollection => "all donors dropped original collection",
        };
        f.write_str(name)
    }
}

type ParticipantKey = (ParticipantRole, ShardId);

/// Latest known state of every expected participant
#[derive(Debug, Clone, Default)]
pub struct ParticipantSet {
    participants: BTreeMap<ParticipantKey, ParticipantDescriptor>,
    aborted: Option<String>,
}

impl ParticipantSet {
    pub fn get(&self, role: ParticipantRole, shard: &str) -> Option<&ParticipantDescriptor> {
        self.participants.get(&(role, shard.to_string()))
    }

    pub fn with_role(&self, role: ParticipantRole) -> Vec<ParticipantDescriptor> {
        self.participants
            .iter()
            .filter(|((r, _), _)| *r == role)
            .map(|(_, p)| p.clone())
            .collect()
    }

    pub fn aborted(&self) -> Option<&str> {
        self.aborted.as_deref()
    }
}

/// Watches participant progress for one operation
pub struct ProgressObserver {
    operation_id: OperationId,
    participants: watch::Sender<ParticipantSet>,
    /// Gates that resolved successfully, with the participants that satisfied them
    resolved: Mutex<HashMap<Gate, Vec<ParticipantDescriptor>>>,
}

impl ProgressObserver {
    /// Seed from the record's participant descriptors
    pub fn new(record: &OperationRecord) -> Self {
        let participants = record
            .participants()
            .into_iter()
            .map(|p| ((p.role(), p.shard_id().to_string()), p))
            .collect();
        let (tx, _rx) = watch::channel(ParticipantSet {
            participants,
            aborted: None,
        });
        Self {
            operation_id: record.operation_id,
            participants: tx,
            resolved: Mutex::new(HashMap::new()),
        }
    }

    /// Reject reports from shards outside the fixed participant set
    pub fn validate(&self, descriptor: &ParticipantDescriptor) -> Result<()> {
        let known = self
            .participants
            .borrow()
            .participants
            .contains_key(&(descriptor.role(), descriptor.shard_id().to_string()));
        if known {
            Ok(())
        } else {
            Err(Error::UnknownParticipant {
                operation_id: self.operation_id.to_string(),
                shard: format!("{} {}", descriptor.role(), descriptor.shard_id()),
            })
        }
    }

    /// Record a participant's new state and wake waiters
    pub fn on_participant_update(&self, descriptor: ParticipantDescriptor) -> Result<()> {
        self.validate(&descriptor)?;
        let key = (descriptor.role(), descriptor.shard_id().to_string());
        self.participants.send_if_modified(|set| {
            if set.participants.get(&key) == Some(&descriptor) {
                return false;
            }
            set.participants.insert(key, descriptor);
            true
        });
        Ok(())
    }

    /// Fail every pending and future wait
    pub fn abort(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.participants.send_if_modified(|set| {
            if set.aborted.is_some() {
                return false;
            }
            set.aborted = Some(reason);
            true
        });
    }

    pub fn snapshot(&self) -> ParticipantSet {
        self.participants.borrow().clone()
    }

    pub fn is_resolved(&self, gate: Gate) -> bool {
        self.resolved
            .lock()
            .map(|r| r.contains_key(&gate))
            .unwrap_or(false)
    }

    /// Wait until every participant with `gate.role()` is past `gate`.
    ///
    /// A gate that already resolved returns the same participants again.
    pub async fn await_gate(&self, gate: Gate) -> Result<Vec<ParticipantDescriptor>> {
        let cached = self
            .resolved
            .lock()
            .map_err(|_| Error::Internal("observer lock poisoned".into()))?
            .get(&gate)
            .cloned();
        if let Some(done) = cached {
            return Ok(done);
        }

        tracing::debug!(operation_id = %self.operation_id, "waiting for {}", gate);
        let satisfied = self
            .await_all(gate.role(), |p| gate.is_satisfied_by(p))
            .await?;

        let mut resolved = self
            .resolved
            .lock()
            .map_err(|_| Error::Internal("observer lock poisoned".into()))?;
        Ok(resolved.entry(gate).or_insert(satisfied).clone())
    }

    /// Wait until `predicate` holds for every expected participant of `role`.
    ///
    /// Fails as soon as any participant reports an error or the operation is aborted.
    pub async fn await_all<P>(
        &self,
        role: ParticipantRole,
        predicate: P,
    ) -> Result<Vec<ParticipantDescriptor>>
    where
        P: Fn(&ParticipantDescriptor) -> bool,
    {
        let mut rx = self.participants.subscribe();
        loop {
            let outcome = evaluate(&rx.borrow_and_update(), role, &predicate);
            if let Some(outcome) = outcome {
                return outcome;
            }
            // The sender lives as long as `self`, so this only errors on teardown
            if rx.changed().await.is_err() {
                return Err(Error::Cancelled);
            }
        }
    }
}

fn evaluate<P>(
    set: &ParticipantSet,
    role: ParticipantRole,
    predicate: &P,
) -> Option<Result<Vec<ParticipantDescriptor>>>
where
    P: Fn(&ParticipantDescriptor) -> bool,
{
    if let Some(reason) = &set.aborted {
        return Some(Err(Error::Aborted(reason.clone())));
    }
    if let Some((shard, reason)) = set
        .participants
        .values()
        .find_map(|p| p.failure().map(|r| (p.shard_id().to_string(), r)))
    {
        return Some(Err(Error::ParticipantFailed { shard, reason }));
    }

    let matching = set.with_role(role);
    if matching.iter().all(|p| predicate(p)) {
        Some(Ok(matching))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::record::{DonorShard, RecipientShard, ReshardRequest};
    use std::sync::Arc;
    use tokio_test::{assert_pending, assert_ready, task};

    fn record() -> OperationRecord {
        OperationRecord::new(ReshardRequest {
            namespace: "app.users".to_string(),
            new_shard_key: vec!["tenant".to_string()],
            donors: vec!["shard-a".to_string(), "shard-b".to_string()],
            recipients: vec!["shard-a".to_string(), "shard-c".to_string()],
        })
        .unwrap()
    }

    fn recipient(id: &str, state: RecipientState) -> ParticipantDescriptor {
        ParticipantDescriptor::Recipient(RecipientShard {
            id: id.to_string(),
            state,
            abort_reason: None,
        })
    }

    fn donor(id: &str, state: DonorState, ts: Option<u64>) -> ParticipantDescriptor {
        ParticipantDescriptor::Donor(DonorShard {
            id: id.to_string(),
            state,
            min_fetch_timestamp: ts,
            abort_reason: None,
        })
    }

    #[test]
    fn test_gate_resolves_after_last_participant() {
        let observer = ProgressObserver::new(&record());
        let mut wait = task::spawn(observer.await_gate(Gate::RecipientsCreatedCollection));
        assert_pending!(wait.poll());

        observer
            .on_participant_update(recipient("shard-a", RecipientState::CreatedCollection))
            .unwrap();
        assert!(wait.is_woken());
        assert_pending!(wait.poll());

        // A donor with the same shard id does not count as the recipient
        observer
            .on_participant_update(donor("shard-c", DonorState::Unused, None))
            .unwrap_err();

        observer
            .on_participant_update(recipient("shard-c", RecipientState::Cloning))
            .unwrap();
        let satisfied = assert_ready!(wait.poll()).unwrap();
        assert_eq!(satisfied.len(), 2);
        drop(wait);
        assert!(observer.is_resolved(Gate::RecipientsCreatedCollection));
    }

    #[tokio::test]
    async fn test_already_satisfied_resolves_immediately() {
        let mut rec = record();
        for r in rec.recipients.iter_mut() {
            r.state = RecipientState::CreatedCollection;
        }
        let observer = ProgressObserver::new(&rec);
        let satisfied = observer
            .await_gate(Gate::RecipientsCreatedCollection)
            .await
            .unwrap();
        assert_eq!(satisfied.len(), 2);
    }

    #[tokio::test]
    async fn test_resolved_gate_is_not_refired() {
        let observer = ProgressObserver::new(&record());
        observer
            .on_participant_update(donor("shard-a", DonorState::ReadyToDonate, Some(10)))
            .unwrap();
        observer
            .on_participant_update(donor("shard-b", DonorState::ReadyToDonate, Some(12)))
            .unwrap();
        let first = observer.await_gate(Gate::DonorsReadyToDonate).await.unwrap();

        // Later reports do not change what the resolved gate returns
        observer
            .on_participant_update(donor("shard-b", DonorState::Donating, Some(99)))
            .unwrap();
        let second = observer.await_gate(Gate::DonorsReadyToDonate).await.unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_ready_to_donate_requires_timestamp() {
        let observer = ProgressObserver::new(&record());
        let mut wait = task::spawn(observer.await_gate(Gate::DonorsReadyToDonate));
        observer
            .on_participant_update(donor("shard-a", DonorState::ReadyToDonate, None))
            .unwrap();
        observer
            .on_participant_update(donor("shard-b", DonorState::ReadyToDonate, Some(5)))
            .unwrap();
        assert_pending!(wait.poll());

        observer
            .on_participant_update(donor("shard-a", DonorState::ReadyToDonate, Some(7)))
            .unwrap();
        assert_ready!(wait.poll()).unwrap();
    }

    #[tokio::test]
    async fn test_participant_error_fails_wait() {
        let observer = Arc::new(ProgressObserver::new(&record()));
        let waiter = {
            let observer = observer.clone();
            tokio::spawn(async move { observer.await_gate(Gate::DonorsReadyToDonate).await })
        };
        tokio::task::yield_now().await;

        observer
            .on_participant_update(ParticipantDescriptor::Donor(DonorShard {
                id: "shard-b".to_string(),
                state: DonorState::Error,
                min_fetch_timestamp: None,
                abort_reason: Some("oplog rolled over".to_string()),
            }))
            .unwrap();

        let err = waiter.await.unwrap().unwrap_err();
        match err {
            Error::ParticipantFailed { shard, reason } => {
                assert_eq!(shard, "shard-b");
                assert_eq!(reason, "oplog rolled over");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!observer.is_resolved(Gate::DonorsReadyToDonate));
    }

    #[tokio::test]
    async fn test_abort_fails_pending_and_future_waits() {
        let observer = ProgressObserver::new(&record());
        observer.abort("operator request");
        observer.abort("second reason ignored");

        let err = observer
            .await_gate(Gate::RecipientsFinishedCloning)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Aborted(ref r) if r == "operator request"));
        assert_eq!(observer.snapshot().aborted(), Some("operator request"));
    }

    #[test]
    fn test_unknown_participant_rejected() {
        let observer = ProgressObserver::new(&record());
        let err = observer
            .on_participant_update(recipient("shard-z", RecipientState::CreatedCollection))
            .unwrap_err();
        assert!(matches!(err, Error::UnknownParticipant { .. }));
        assert!(observer
            .snapshot()
            .get(ParticipantRole::Recipient, "shard-z")
            .is_none());
    }
}
