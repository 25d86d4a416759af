//! # Relay State
//!
//! The client registry and the latest-snapshot cell, owned by one value that
//! is constructed at startup and handed (cheaply cloned) to the upstream feed
//! and to every WebSocket session.
//!
//! Every operation takes the same lock and runs to completion under it, so a
//! client that registers while a record is being published sees either the
//! old snapshot followed by the new broadcast, or only the new snapshot. It
//! never misses the update and never receives it twice.
//!
//! Each client has a bounded queue. A client whose queue is full is treated
//! as not open for that publish and misses the frame; it catches up with the
//! next one once its session drains the backlog.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use axum::extract::ws::Utf8Bytes;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::ticker_logic::error::RelayError;
use crate::ticker_logic::model::{ServerMessage, TickerRecord};

pub type ClientId = usize;

/// A serialized envelope. Clones share one buffer, so every recipient of a
/// publish gets the same bytes without a copy.
pub type Frame = Utf8Bytes;

/// Frames a client may have queued before further publishes skip it.
pub const CLIENT_QUEUE_CAPACITY: usize = 64;

/// One connected browser session. The session task owns the receiving half;
/// once it is dropped the client is no longer open.
struct ClientHandle {
    sender: mpsc::Sender<Frame>,
}

impl ClientHandle {
    fn is_open(&self) -> bool {
        !self.sender.is_closed()
    }
}

#[derive(Default)]
struct Inner {
    clients: HashMap<ClientId, ClientHandle>,
    latest: Option<TickerRecord>,
}

#[derive(Clone, Default)]
pub struct RelayState {
    inner: Arc<Mutex<Inner>>,
    next_client_id: Arc<AtomicUsize>,
}

impl RelayState {
    pub fn new() -> Self {
        Self::default()
    }

    // A panic while holding the lock cannot leave the map half-updated,
    // so a poisoned lock is still safe to use.
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// # Add Client
    ///
    /// Registers a new open client and returns its id with the receiver its
    /// session task should drain. If a snapshot exists it is queued on the
    /// new receiver before the client becomes visible to `publish`.
    pub fn add_client(&self) -> (ClientId, mpsc::Receiver<Frame>) {
        let client_id = self.next_client_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = mpsc::channel(CLIENT_QUEUE_CAPACITY);

        let mut inner = self.lock();
        if let Some(record) = inner.latest.as_ref() {
            match ServerMessage::Ticker(record).to_frame() {
                Ok(frame) => {
                    // Fresh queue with the receiver still in hand, this cannot fail.
                    let _ = tx.try_send(frame);
                }
                Err(e) => log::error!("Could not prime client {}: {}", client_id, e),
            }
        }
        inner.clients.insert(client_id, ClientHandle { sender: tx });
        (client_id, rx)
    }

    /// Removes a client. Returns `false` if it was not registered.
    pub fn remove_client(&self, client_id: ClientId) -> bool {
        self.lock().clients.remove(&client_id).is_some()
    }

    /// # Publish
    ///
    /// Stores `record` as the latest snapshot and queues its envelope for every
    /// open client. Clients whose session has already gone away, or whose queue
    /// is full, are skipped without error; they are dropped from the registry
    /// by their own disconnect.
    ///
    /// Returns the number of clients the frame was queued for. If the envelope
    /// cannot be serialized the snapshot is left untouched.
    pub fn publish(&self, record: TickerRecord) -> Result<usize, RelayError> {
        let frame = ServerMessage::Ticker(&record).to_frame()?;

        let mut inner = self.lock();
        inner.latest = Some(record);

        let mut delivered = 0;
        for (client_id, client) in inner.clients.iter().filter(|(_, c)| c.is_open()) {
            match client.sender.try_send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    log::debug!("Client {} is not keeping up, skipping frame", client_id);
                }
                Err(TrySendError::Closed(_)) => {}
            }
        }
        Ok(delivered)
    }

    pub fn latest(&self) -> Option<TickerRecord> {
        self.lock().latest.clone()
    }

    pub fn client_count(&self) -> usize {
        self.lock().clients.len()
    }

    #[cfg(test)]
    pub(crate) fn is_open(&self, client_id: ClientId) -> bool {
        self.lock()
            .clients
            .get(&client_id)
            .is_some_and(ClientHandle::is_open)
    }
}
