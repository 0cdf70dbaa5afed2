//! Request/reply correlation on the master side of a link.
//!
//! # How an invocation completes (for beginners)
//!
//! ```text
//!  invoke() ──alloc id──► pending[id] = oneshot ──encode──► link.write()
//!                                                              │
//!  receive(chunk) ◄──────────── reply bytes ◄──────────────────┘
//!      │
//!      └─ pending.remove(id) ──► oneshot.send(result) ──► invoke() returns
//! ```
//!
//! Every request gets a fresh message id from an [`IdAllocator`].  The id
//! stays allocated until the reply arrives, the write fails, or the link is
//! disconnected, whichever happens first.  Replies for ids that are not
//! pending are dropped.
//!
//! # Locking
//!
//! All state sits behind one `std::sync::Mutex`.  The lock is never held
//! across an `.await` and completions are sent after it has been released.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use tbus_core::{
    encode_message, DecodeEvent, Decoder, ErrorDescriptor, IdAllocator, Message, RoutePath,
    Transport, TransportError,
};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::error::InvokeError;

type Completion = oneshot::Sender<Result<Vec<u8>, InvokeError>>;

struct MasterState {
    ids: IdAllocator,
    pending: HashMap<u32, Completion>,
    decoder: Decoder,
    link: Option<Arc<dyn Transport>>,
    /// Bumped by every `connect`, so a stale link cannot tear down its successor.
    epoch: u64,
}

/// The calling end of a tbus link.
pub struct Master {
    state: Mutex<MasterState>,
}

impl Master {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MasterState {
                ids: IdAllocator::new(),
                pending: HashMap::new(),
                decoder: Decoder::new(),
                link: None,
                epoch: 0,
            }),
        })
    }

    /// Attaches the outbound link.
    ///
    /// Anything still pending on a previous link is resolved with
    /// [`InvokeError::Disconnected`] first.  Returns the epoch of the new
    /// link for use with [`Master::link_closed`].
    pub fn connect(&self, link: Arc<dyn Transport>) -> u64 {
        let (flushed, epoch) = {
            let mut state = self.state();
            let flushed = Self::flush(&mut state);
            state.link = Some(link);
            state.epoch += 1;
            (flushed, state.epoch)
        };
        Self::resolve_disconnected(flushed);
        info!(epoch, "master link connected");
        epoch
    }

    /// Drops the link and resolves every pending invocation with
    /// [`InvokeError::Disconnected`].
    pub fn disconnect(&self) {
        let flushed = {
            let mut state = self.state();
            state.link = None;
            Self::flush(&mut state)
        };
        if !flushed.is_empty() {
            info!(pending = flushed.len(), "flushing pending invocations");
        }
        Self::resolve_disconnected(flushed);
    }

    /// Disconnects only if `epoch` still names the current link.
    pub fn link_closed(&self, epoch: u64) {
        let current = {
            let state = self.state();
            state.link.is_some() && state.epoch == epoch
        };
        if current {
            info!(epoch, "master link closed by peer");
            self.disconnect();
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state().link.is_some()
    }

    /// Number of invocations waiting for a reply.
    pub fn pending_count(&self) -> usize {
        self.state().pending.len()
    }

    /// Number of message ids currently allocated.
    pub fn allocated_ids(&self) -> usize {
        self.state().ids.allocated()
    }

    /// Sends a request and waits for its reply payload.
    ///
    /// # Errors
    ///
    /// - [`InvokeError::Transport`] when no link is attached or the write fails.
    ///   The call is not retried.
    /// - [`InvokeError::Routing`], [`InvokeError::Method`] or
    ///   [`InvokeError::Protocol`] when the device side answers with an error.
    /// - [`InvokeError::Disconnected`] when the link goes away first.
    pub async fn invoke(
        &self,
        method: u8,
        payload: Vec<u8>,
        route: &RoutePath,
    ) -> Result<Vec<u8>, InvokeError> {
        let (msg_id, link, reply) = {
            let mut state = self.state();
            let link = state
                .link
                .clone()
                .ok_or(InvokeError::Transport(TransportError::NotConnected))?;
            let msg_id = state.ids.alloc();
            let (tx, rx) = oneshot::channel();
            state.pending.insert(msg_id, tx);
            (msg_id, link, rx)
        };

        let request = Message::request(msg_id, route.clone(), method, payload);
        let bytes = match encode_message(&request) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.abandon(msg_id);
                return Err(InvokeError::Protocol(e.to_string()));
            }
        };

        debug!(msg_id, method, route = ?route.hops(), "invoking");
        if let Err(e) = link.write(bytes).await {
            warn!(msg_id, "request write failed: {e}");
            self.abandon(msg_id);
            return Err(e.into());
        }

        // The sender only disappears without a value if the master is dropped.
        reply.await.unwrap_or(Err(InvokeError::Disconnected))
    }

    /// Feeds bytes received from the link.
    ///
    /// The whole chunk is decoded before any invocation is resolved.
    pub fn receive(&self, chunk: &[u8]) {
        let resolved: Vec<(Completion, Message)> = {
            let mut state = self.state();
            let events = state.decoder.decode(chunk);
            let mut resolved = Vec::new();
            for event in events {
                let Ok(DecodeEvent::Message(msg)) = event else {
                    continue;
                };
                match state.pending.remove(&msg.msg_id) {
                    Some(tx) => {
                        state.ids.release(msg.msg_id);
                        resolved.push((tx, msg));
                    }
                    None => warn!(msg_id = msg.msg_id, "reply for unknown message id dropped"),
                }
            }
            resolved
        };

        for (tx, msg) in resolved {
            // The caller may have stopped waiting; nothing to do then.
            let _ = tx.send(reply_result(msg));
        }
    }

    /// A [`Transport`] that feeds written bytes into [`Master::receive`].
    ///
    /// Used as the upstream of a device-side endpoint in the same process.
    /// Holds the master weakly.
    pub fn inbound(self: &Arc<Self>) -> Arc<dyn Transport> {
        Arc::new(Inbound {
            master: Arc::downgrade(self),
        })
    }

    /// Removes a pending entry that never made it onto the link.
    ///
    /// The reply may already have resolved it; the id is released only if the
    /// entry was still present.
    fn abandon(&self, msg_id: u32) {
        let mut state = self.state();
        if state.pending.remove(&msg_id).is_some() {
            state.ids.release(msg_id);
        }
    }

    fn flush(state: &mut MasterState) -> Vec<Completion> {
        state.decoder.reset();
        let drained: Vec<(u32, Completion)> = state.pending.drain().collect();
        drained
            .into_iter()
            .map(|(msg_id, tx)| {
                state.ids.release(msg_id);
                tx
            })
            .collect()
    }

    fn resolve_disconnected(flushed: Vec<Completion>) {
        for tx in flushed {
            let _ = tx.send(Err(InvokeError::Disconnected));
        }
    }

    fn state(&self) -> MutexGuard<'_, MasterState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn reply_result(msg: Message) -> Result<Vec<u8>, InvokeError> {
    if msg.body.is_error() {
        let descriptor = ErrorDescriptor::from_payload(&msg.body.payload)?;
        return Err(descriptor.into());
    }
    Ok(msg.body.payload)
}

struct Inbound {
    master: Weak<Master>,
}

#[async_trait]
impl Transport for Inbound {
    async fn write(&self, bytes: Vec<u8>) -> Result<(), TransportError> {
        let master = self.master.upgrade().ok_or(TransportError::Closed)?;
        master.receive(&bytes);
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::mock;
    use std::sync::mpsc;
    use tbus_core::protocol::decode_all;
    use tokio_test::{assert_pending, assert_ready, assert_ready_ok, task};

    mock! {
        pub Link {}
        #[async_trait]
        impl Transport for Link {
            async fn write(&self, bytes: Vec<u8>) -> Result<(), TransportError>;
        }
    }

    /// A link that accepts every write and hands the frames to a channel.
    fn recording_link() -> (Arc<MockLink>, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let mut link = MockLink::new();
        link.expect_write().returning(move |bytes| {
            let _ = tx.lock().unwrap().send(bytes);
            Ok(())
        });
        (Arc::new(link), rx)
    }

    fn sent_request(rx: &mpsc::Receiver<Vec<u8>>) -> Message {
        let bytes = rx.try_recv().expect("request written");
        decode_all(&bytes).unwrap().remove(0)
    }

    fn reply_bytes(msg: &Message) -> Vec<u8> {
        encode_message(msg).unwrap()
    }

    #[tokio::test]
    async fn test_invoke_without_link_is_not_connected() {
        let master = Master::new();

        let result = master.invoke(1, Vec::new(), &RoutePath::local()).await;

        assert!(matches!(
            result,
            Err(InvokeError::Transport(TransportError::NotConnected))
        ));
        assert_eq!(master.allocated_ids(), 0);
    }

    #[test]
    fn test_reply_resolves_the_matching_invocation() {
        // Arrange
        let master = Master::new();
        let (link, rx) = recording_link();
        master.connect(link);
        let route = RoutePath::new([1, 2]);
        let mut call = task::spawn(master.invoke(5, vec![7, 7], &route));

        // Act
        assert_pending!(call.poll());
        let request = sent_request(&rx);
        master.receive(&reply_bytes(&Message::reply(request.msg_id, vec![42])));

        // Assert
        assert_eq!(request.route.hops(), &[1, 2]);
        assert_eq!(request.body.flag, 5);
        assert!(call.is_woken());
        assert_eq!(assert_ready_ok!(call.poll()), vec![42]);
        assert_eq!(master.pending_count(), 0);
        assert_eq!(master.allocated_ids(), 0);
    }

    #[test]
    fn test_error_reply_becomes_typed_error() {
        let master = Master::new();
        let (link, rx) = recording_link();
        master.connect(link);
        let route = RoutePath::new([9]);
        let mut call = task::spawn(master.invoke(0, Vec::new(), &route));
        assert_pending!(call.poll());

        let request = sent_request(&rx);
        let descriptor = ErrorDescriptor::routing("invalid address 9");
        master.receive(&reply_bytes(&Message::error_reply(request.msg_id, &descriptor)));

        let result = assert_ready!(call.poll());
        assert!(matches!(result, Err(InvokeError::Routing(m)) if m.contains("invalid address")));
    }

    #[test]
    fn test_reply_for_unknown_id_is_dropped() {
        let master = Master::new();
        let (link, rx) = recording_link();
        master.connect(link);
        let route = RoutePath::local();
        let mut call = task::spawn(master.invoke(1, Vec::new(), &route));
        assert_pending!(call.poll());
        let request = sent_request(&rx);

        master.receive(&reply_bytes(&Message::reply(request.msg_id + 100, Vec::new())));

        assert!(!call.is_woken());
        assert_pending!(call.poll());
        assert_eq!(master.pending_count(), 1);
    }

    #[test]
    fn test_replies_split_across_chunks_resolve_once_complete() {
        let master = Master::new();
        let (link, rx) = recording_link();
        master.connect(link);
        let route = RoutePath::local();
        let mut call = task::spawn(master.invoke(1, Vec::new(), &route));
        assert_pending!(call.poll());
        let bytes = reply_bytes(&Message::reply(sent_request(&rx).msg_id, vec![1, 2, 3]));

        let (head, tail) = bytes.split_at(3);
        master.receive(head);
        assert_pending!(call.poll());
        master.receive(tail);

        assert_eq!(assert_ready_ok!(call.poll()), vec![1, 2, 3]);
    }

    #[test]
    fn test_disconnect_resolves_every_pending_call_once() {
        // Arrange – three calls in flight
        let master = Master::new();
        let (link, _rx) = recording_link();
        master.connect(link);
        let route = RoutePath::local();
        let mut calls: Vec<_> = (0..3)
            .map(|_| task::spawn(master.invoke(1, Vec::new(), &route)))
            .collect();
        for call in &mut calls {
            assert_pending!(call.poll());
        }
        assert_eq!(master.pending_count(), 3);

        // Act
        master.disconnect();

        // Assert
        for call in &mut calls {
            assert!(matches!(
                assert_ready!(call.poll()),
                Err(InvokeError::Disconnected)
            ));
        }
        assert_eq!(master.pending_count(), 0);
        assert_eq!(master.allocated_ids(), 0, "ids are released for reuse");
        assert!(!master.is_connected());
    }

    #[tokio::test]
    async fn test_write_failure_releases_id_without_retry() {
        // Arrange
        let master = Master::new();
        let mut link = MockLink::new();
        link.expect_write()
            .times(1)
            .returning(|_| Err(TransportError::Closed));
        master.connect(Arc::new(link));

        // Act
        let result = master.invoke(1, Vec::new(), &RoutePath::local()).await;

        // Assert
        assert!(matches!(
            result,
            Err(InvokeError::Transport(TransportError::Closed))
        ));
        assert_eq!(master.pending_count(), 0);
        assert_eq!(master.allocated_ids(), 0);
    }

    #[test]
    fn test_stale_link_close_keeps_the_new_link() {
        let master = Master::new();
        let (old, _rx_old) = recording_link();
        let (new, _rx_new) = recording_link();
        let old_epoch = master.connect(old);
        let new_epoch = master.connect(new);

        master.link_closed(old_epoch);
        assert!(master.is_connected());

        master.link_closed(new_epoch);
        assert!(!master.is_connected());
    }

    #[test]
    fn test_reconnect_flushes_calls_from_the_previous_link() {
        let master = Master::new();
        let (old, _rx_old) = recording_link();
        master.connect(old);
        let route = RoutePath::local();
        let mut call = task::spawn(master.invoke(1, Vec::new(), &route));
        assert_pending!(call.poll());

        let (new, _rx_new) = recording_link();
        master.connect(new);

        assert!(matches!(
            assert_ready!(call.poll()),
            Err(InvokeError::Disconnected)
        ));
        assert!(master.is_connected());
    }

    #[tokio::test]
    async fn test_inbound_adapter_closes_with_the_master() {
        let master = Master::new();
        let inbound = master.inbound();
        assert!(inbound.write(Vec::new()).await.is_ok());

        drop(master);

        assert!(matches!(
            inbound.write(Vec::new()).await,
            Err(TransportError::Closed)
        ));
    }
}
