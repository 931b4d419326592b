//! Quorum: connected members plus agreed key/value settings.
//!
//! A proposal sequenced at `S` is approved exactly once, when the minimum
//! sequence number first reaches `S`. At that point every connected client
//! has seen it and none has rejected it. Approved values become visible
//! through [`Quorum::get`] in the same step that fires
//! [`QuorumEvent::ApproveProposal`].

use std::collections::{BTreeMap, BTreeSet};

use quill_core::{
    ClientDetail, ClientId, MessageContents, PendingProposal, Proposal, QuorumSnapshot,
    SequencedMessage, SequencedProposal,
};
use serde_json::Value;

use crate::events::{ListenerId, Listeners, QuorumEvent};
use crate::handle::{RuntimeClosed, RuntimeHandle};

#[derive(Debug, Clone)]
struct PendingRecord {
    proposal: SequencedProposal,
    local: bool,
    accepted: BTreeSet<ClientId>,
}

/// A proposal that just reached the minimum sequence number.
#[derive(Debug, Clone, PartialEq)]
pub struct ApprovedProposal {
    pub sequence_number: u64,
    pub key: String,
    pub value: Value,
    pub local: bool,
}

pub struct Quorum {
    minimum_sequence_number: u64,
    members: BTreeMap<ClientId, ClientDetail>,
    proposals: BTreeMap<u64, PendingRecord>,
    values: BTreeMap<String, Value>,
    handle: Option<RuntimeHandle>,
    listeners: Listeners<QuorumEvent>,
}

impl Quorum {
    pub fn new(minimum_sequence_number: u64, handle: Option<RuntimeHandle>) -> Self {
        Self {
            minimum_sequence_number,
            members: BTreeMap::new(),
            proposals: BTreeMap::new(),
            values: BTreeMap::new(),
            handle,
            listeners: Listeners::new(),
        }
    }

    /// Rebuild from the `quorum` snapshot blob.
    pub fn from_snapshot(
        minimum_sequence_number: u64,
        snapshot: QuorumSnapshot,
        handle: Option<RuntimeHandle>,
    ) -> Self {
        let mut quorum = Self::new(minimum_sequence_number, handle);
        quorum.members = snapshot.members.into_iter().collect();
        quorum.values = snapshot.values.into_iter().collect();
        for (sequence_number, proposal, accepted) in snapshot.proposals {
            quorum.proposals.insert(
                sequence_number,
                PendingRecord {
                    proposal,
                    local: false,
                    accepted: accepted.into_iter().collect(),
                },
            );
        }
        quorum
    }

    pub fn snapshot(&self) -> QuorumSnapshot {
        QuorumSnapshot {
            members: self.get_members(),
            proposals: self.pending_proposals(),
            values: self
                .values
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    // ─── Membership ─────────────────────────────────────────

    pub fn add_member(&mut self, client_id: ClientId, detail: ClientDetail) {
        log::debug!("quorum member joined: {}", client_id);
        self.members.insert(client_id.clone(), detail);
        self.listeners.emit(&QuorumEvent::AddMember(client_id));
    }

    pub fn remove_member(&mut self, client_id: &str) -> Option<ClientDetail> {
        let removed = self.members.remove(client_id);
        if removed.is_some() {
            log::debug!("quorum member left: {}", client_id);
            self.listeners
                .emit(&QuorumEvent::RemoveMember(client_id.to_string()));
        }
        removed
    }

    pub fn get_members(&self) -> Vec<(ClientId, ClientDetail)> {
        self.members
            .iter()
            .map(|(id, detail)| (id.clone(), detail.clone()))
            .collect()
    }

    pub fn get_member(&self, client_id: &str) -> Option<&ClientDetail> {
        self.members.get(client_id)
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    // ─── Proposals ──────────────────────────────────────────

    /// Record a sequenced proposal. Current members are recorded as its
    /// accepted client ids.
    pub fn add_proposal(
        &mut self,
        key: String,
        value: Value,
        sequence_number: u64,
        local: bool,
        client_sequence_number: u64,
        client_id: Option<ClientId>,
    ) {
        let proposal = SequencedProposal {
            sequence_number,
            key: key.clone(),
            value: value.clone(),
            client_sequence_number,
            client_id,
        };
        self.proposals.insert(
            sequence_number,
            PendingRecord {
                proposal,
                local,
                accepted: self.members.keys().cloned().collect(),
            },
        );
        self.listeners.emit(&QuorumEvent::AddProposal {
            sequence_number,
            key,
            value,
        });
    }

    /// Drop a pending proposal. Rejections of unknown or already approved
    /// proposals are ignored.
    pub fn reject_proposal(&mut self, client_id: &str, sequence_number: u64) -> bool {
        match self.proposals.remove(&sequence_number) {
            Some(record) => {
                log::info!(
                    "proposal {} ({}) rejected by {}",
                    sequence_number,
                    record.proposal.key,
                    client_id
                );
                true
            }
            None => false,
        }
    }

    /// Advance the MSN to the one stamped on `message`, approving every
    /// pending proposal it now covers in sequence order.
    pub fn update_minimum_sequence_number(
        &mut self,
        message: &SequencedMessage,
    ) -> Vec<ApprovedProposal> {
        let msn = message.minimum_sequence_number;
        if msn <= self.minimum_sequence_number {
            return Vec::new();
        }
        self.minimum_sequence_number = msn;

        let still_pending = self.proposals.split_off(&(msn + 1));
        let ready = std::mem::replace(&mut self.proposals, still_pending);

        let mut approved = Vec::with_capacity(ready.len());
        for (sequence_number, record) in ready {
            let SequencedProposal { key, value, .. } = record.proposal;
            log::info!("proposal {} approved: {} = {}", sequence_number, key, value);
            self.values.insert(key.clone(), value.clone());
            self.listeners.emit(&QuorumEvent::ApproveProposal {
                sequence_number,
                key: key.clone(),
                value: value.clone(),
            });
            approved.push(ApprovedProposal {
                sequence_number,
                key,
                value,
                local: record.local,
            });
        }
        approved
    }

    pub fn minimum_sequence_number(&self) -> u64 {
        self.minimum_sequence_number
    }

    pub fn pending_proposals(&self) -> Vec<PendingProposal> {
        self.proposals
            .iter()
            .map(|(seq, record)| {
                (
                    *seq,
                    record.proposal.clone(),
                    record.accepted.iter().cloned().collect(),
                )
            })
            .collect()
    }

    // ─── Values ─────────────────────────────────────────────

    pub fn has(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    // ─── Outbound ───────────────────────────────────────────

    /// Submit a proposal as the local client.
    pub fn propose(&self, key: impl Into<String>, value: Value) -> Result<(), RuntimeClosed> {
        let handle = self.handle.as_ref().ok_or(RuntimeClosed)?;
        handle.submit(MessageContents::Propose(Proposal {
            key: key.into(),
            value,
        }))
    }

    /// Submit a rejection of the proposal sequenced at `sequence_number`.
    pub fn reject(&self, sequence_number: u64) -> Result<(), RuntimeClosed> {
        let handle = self.handle.as_ref().ok_or(RuntimeClosed)?;
        handle.submit(MessageContents::Reject(sequence_number))
    }

    // ─── Listeners ──────────────────────────────────────────

    pub fn on<F>(&mut self, callback: F) -> ListenerId
    where
        F: FnMut(&QuorumEvent) + Send + 'static,
    {
        self.listeners.on(callback)
    }

    pub fn off(&mut self, id: ListenerId) -> bool {
        self.listeners.off(id)
    }
}

impl std::fmt::Debug for Quorum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Quorum")
            .field("minimum_sequence_number", &self.minimum_sequence_number)
            .field("members", &self.members.len())
            .field("proposals", &self.proposals.len())
            .field("values", &self.values)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::RuntimeRequest;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    fn at_msn(sequence_number: u64, msn: u64) -> SequencedMessage {
        SequencedMessage {
            sequence_number,
            minimum_sequence_number: msn,
            client_id: None,
            client_sequence_number: 0,
            reference_sequence_number: 0,
            origin: None,
            timestamp: 0,
            contents: MessageContents::NoOp,
        }
    }

    fn quorum_with_members() -> Quorum {
        let mut quorum = Quorum::new(90, None);
        quorum.add_member("a".into(), ClientDetail::default());
        quorum.add_member("b".into(), ClientDetail::default());
        quorum
    }

    #[test]
    fn test_proposal_approved_once_msn_reaches_it() {
        let mut quorum = quorum_with_members();
        quorum.add_proposal("code".into(), json!("pkgB"), 100, false, 1, Some("a".into()));

        assert!(quorum.update_minimum_sequence_number(&at_msn(101, 99)).is_empty());
        assert!(!quorum.has("code"));

        let approved = quorum.update_minimum_sequence_number(&at_msn(102, 100));
        assert_eq!(approved.len(), 1);
        assert_eq!(approved[0].sequence_number, 100);
        assert_eq!(quorum.get("code"), Some(&json!("pkgB")));

        assert!(quorum.update_minimum_sequence_number(&at_msn(103, 101)).is_empty());
        assert!(quorum.pending_proposals().is_empty());
    }

    #[test]
    fn test_approve_event_carries_value() {
        let mut quorum = quorum_with_members();
        let observed = Arc::new(Mutex::new(Vec::new()));
        let sink = observed.clone();
        quorum.on(move |event| {
            if let QuorumEvent::ApproveProposal { key, value, .. } = event {
                sink.lock().unwrap().push((key.clone(), value.clone()));
            }
        });

        quorum.add_proposal("x".into(), json!(1), 95, true, 1, None);
        let approved = quorum.update_minimum_sequence_number(&at_msn(96, 95));

        assert!(approved[0].local);
        assert_eq!(*observed.lock().unwrap(), vec![("x".to_string(), json!(1))]);
        assert_eq!(quorum.get("x"), Some(&json!(1)));
    }

    #[test]
    fn test_rejected_proposal_never_approves() {
        let mut quorum = quorum_with_members();
        quorum.add_proposal("code".into(), json!("bad"), 95, false, 1, Some("a".into()));

        assert!(quorum.reject_proposal("b", 95));
        assert!(!quorum.reject_proposal("b", 95));
        assert!(quorum.update_minimum_sequence_number(&at_msn(120, 110)).is_empty());
        assert!(!quorum.has("code"));
    }

    #[test]
    fn test_msn_never_regresses() {
        let mut quorum = Quorum::new(50, None);
        quorum.update_minimum_sequence_number(&at_msn(60, 55));
        quorum.update_minimum_sequence_number(&at_msn(61, 40));
        assert_eq!(quorum.minimum_sequence_number(), 55);
    }

    #[test]
    fn test_approvals_in_sequence_order() {
        let mut quorum = quorum_with_members();
        quorum.add_proposal("k".into(), json!("second"), 93, false, 2, None);
        quorum.add_proposal("k".into(), json!("first"), 92, false, 1, None);

        let approved = quorum.update_minimum_sequence_number(&at_msn(94, 93));
        let order: Vec<_> = approved.iter().map(|p| p.sequence_number).collect();
        assert_eq!(order, vec![92, 93]);
        assert_eq!(quorum.get("k"), Some(&json!("second")));
    }

    #[test]
    fn test_accepted_clients_are_members_at_proposal_time() {
        let mut quorum = quorum_with_members();
        quorum.add_proposal("k".into(), json!(true), 91, false, 1, None);
        quorum.add_member("late".into(), ClientDetail::default());

        let pending = quorum.pending_proposals();
        assert_eq!(pending[0].2, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_snapshot_restores_pending_state() {
        let mut quorum = quorum_with_members();
        quorum.add_proposal("code".into(), json!("pkg"), 95, false, 1, Some("a".into()));
        quorum.add_proposal("other".into(), json!(3), 91, false, 2, Some("b".into()));
        quorum.update_minimum_sequence_number(&at_msn(93, 92));

        let restored = Quorum::from_snapshot(92, quorum.snapshot(), None);
        assert_eq!(restored.get("other"), Some(&json!(3)));
        assert_eq!(restored.pending_proposals(), quorum.pending_proposals());
        assert_eq!(restored.get_members(), quorum.get_members());
    }

    #[test]
    fn test_propose_goes_through_handle() {
        let (handle, mut rx) = RuntimeHandle::channel();
        let quorum = Quorum::new(0, Some(handle));
        quorum.propose("code", json!("pkgB")).unwrap();
        quorum.reject(4).unwrap();

        assert_eq!(
            rx.try_recv().unwrap(),
            RuntimeRequest::Submit(MessageContents::Propose(Proposal {
                key: "code".into(),
                value: json!("pkgB"),
            }))
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            RuntimeRequest::Submit(MessageContents::Reject(4))
        );
    }

    #[test]
    fn test_propose_without_handle_fails() {
        let quorum = Quorum::new(0, None);
        assert_eq!(quorum.propose("k", json!(1)), Err(RuntimeClosed));
    }

    #[test]
    fn test_member_events() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let mut quorum = Quorum::new(0, None);
        let sink = events.clone();
        quorum.on(move |e| sink.lock().unwrap().push(e.clone()));

        quorum.add_member("c1".into(), ClientDetail::default());
        assert!(quorum.remove_member("c1").is_some());
        assert!(quorum.remove_member("c1").is_none());

        assert_eq!(
            *events.lock().unwrap(),
            vec![
                QuorumEvent::AddMember("c1".into()),
                QuorumEvent::RemoveMember("c1".into())
            ]
        );
    }
}
