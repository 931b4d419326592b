//! Event emission.
//!
//! [`Listeners`] is a small synchronous registry: callbacks run in
//! registration order on the thread that emits. [`DocumentEvent`] and
//! [`QuorumEvent`] are the two event families a host observes.

use std::sync::Arc;
use std::time::Duration;

use quill_core::{BlobMetadata, ClientId, ClientJoin, SequencedMessage};
use serde_json::Value;

use crate::error::DocumentError;

pub type ListenerId = u64;

type Callback<E> = Box<dyn FnMut(&E) + Send>;

/// Ordered set of callbacks for one event type.
pub struct Listeners<E> {
    next_id: ListenerId,
    callbacks: Vec<(ListenerId, Callback<E>)>,
}

impl<E> Listeners<E> {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            callbacks: Vec::new(),
        }
    }

    /// Register a callback. The returned id removes it again via [`off`](Self::off).
    pub fn on<F>(&mut self, callback: F) -> ListenerId
    where
        F: FnMut(&E) + Send + 'static,
    {
        let id = self.next_id;
        self.next_id += 1;
        self.callbacks.push((id, Box::new(callback)));
        id
    }

    pub fn off(&mut self, id: ListenerId) -> bool {
        let before = self.callbacks.len();
        self.callbacks.retain(|(existing, _)| *existing != id);
        self.callbacks.len() != before
    }

    /// Invoke every callback. Returns whether anyone was listening.
    pub fn emit(&mut self, event: &E) -> bool {
        for (_, callback) in self.callbacks.iter_mut() {
            callback(event);
        }
        !self.callbacks.is_empty()
    }

    pub fn clear(&mut self) {
        self.callbacks.clear();
    }

    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }
}

impl<E> Default for Listeners<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Events emitted by a [`Document`](crate::Document).
#[derive(Debug, Clone)]
pub enum DocumentEvent {
    /// Our own join was sequenced; carries the assigned client id
    Connected(ClientId),
    /// The delta stream dropped
    Disconnect,
    Error(Arc<DocumentError>),
    /// A sequenced message finished processing
    Op(SequencedMessage),
    /// Round trip latency reported by the transport, in milliseconds
    Pong(u64),
    /// Wall time spent processing one inbound message
    ProcessTime(Duration),
    /// The code package changed; carries the reloaded channel addresses
    RuntimeChanged(Vec<String>),
    ClientJoin(ClientJoin),
    ClientLeave(ClientId),
    BlobUploaded(BlobMetadata),
}

/// Events emitted by the [`Quorum`](crate::Quorum).
#[derive(Debug, Clone, PartialEq)]
pub enum QuorumEvent {
    AddMember(ClientId),
    RemoveMember(ClientId),
    AddProposal {
        sequence_number: u64,
        key: String,
        value: Value,
    },
    ApproveProposal {
        sequence_number: u64,
        key: String,
        value: Value,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_listeners_run_in_registration_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut listeners = Listeners::<u32>::new();

        let first = seen.clone();
        listeners.on(move |v| first.lock().unwrap().push(("first", *v)));
        let second = seen.clone();
        listeners.on(move |v| second.lock().unwrap().push(("second", *v)));

        assert!(listeners.emit(&7));
        assert_eq!(*seen.lock().unwrap(), vec![("first", 7), ("second", 7)]);
    }

    #[test]
    fn test_off_removes_only_that_listener() {
        let count = Arc::new(Mutex::new(0));
        let mut listeners = Listeners::<()>::new();

        let a = count.clone();
        let id = listeners.on(move |_| *a.lock().unwrap() += 1);
        let b = count.clone();
        listeners.on(move |_| *b.lock().unwrap() += 10);

        assert!(listeners.off(id));
        assert!(!listeners.off(id));
        listeners.emit(&());
        assert_eq!(*count.lock().unwrap(), 10);
    }

    #[test]
    fn test_emit_without_listeners() {
        let mut listeners = Listeners::<u8>::default();
        assert!(!listeners.emit(&1));
        assert!(listeners.is_empty());
    }
}
