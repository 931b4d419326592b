//! Requests from channels and the quorum back into the document.
//!
//! Channels never touch the delta manager directly. They hold a cloned
//! [`RuntimeHandle`] and push requests that the document drains between
//! inbound messages, so there is a single writer for outbound traffic.

use quill_core::MessageContents;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeRequest {
    /// Submit contents as the local client
    Submit(MessageContents),
    /// Write a snapshot with the given tag
    Snapshot(String),
    Close,
}

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("document runtime is closed")]
pub struct RuntimeClosed;

#[derive(Debug, Clone)]
pub struct RuntimeHandle {
    tx: mpsc::UnboundedSender<RuntimeRequest>,
}

impl RuntimeHandle {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<RuntimeRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn submit(&self, contents: MessageContents) -> Result<(), RuntimeClosed> {
        self.send(RuntimeRequest::Submit(contents))
    }

    pub fn snapshot(&self, tag: impl Into<String>) -> Result<(), RuntimeClosed> {
        self.send(RuntimeRequest::Snapshot(tag.into()))
    }

    pub fn close(&self) -> Result<(), RuntimeClosed> {
        self.send(RuntimeRequest::Close)
    }

    fn send(&self, request: RuntimeRequest) -> Result<(), RuntimeClosed> {
        self.tx.send(request).map_err(|_| RuntimeClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requests_arrive_in_order() {
        let (handle, mut rx) = RuntimeHandle::channel();
        handle.submit(MessageContents::NoOp).unwrap();
        handle.snapshot("tag").unwrap();

        assert_eq!(rx.try_recv().unwrap(), RuntimeRequest::Submit(MessageContents::NoOp));
        assert_eq!(rx.try_recv().unwrap(), RuntimeRequest::Snapshot("tag".into()));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_send_after_receiver_dropped() {
        let (handle, rx) = RuntimeHandle::channel();
        drop(rx);
        assert_eq!(handle.close(), Err(RuntimeClosed));
    }
}
