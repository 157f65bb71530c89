//! Links: authenticated channels between two endpoints of the overlay.
//!
//! A link is created by an initiator against a remote destination, carries
//! unreliable packets (with delivery receipts) and reliable requests (with
//! response receipts), and reports its round-trip time and maximum datagram
//! unit. All inbound traffic for a link surfaces as [`TransportEvent`]s on
//! the owning node's event channel.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use dashmap::DashMap;
use rand::RngCore;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use super::frame::WireMessage;
use super::identity::{AddressHash, Identity};
use super::node::PeerSender;
use super::TransportEvent;

/// Opaque link identifier, unique per link on both endpoints.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkId([u8; 16]);

impl LinkId {
    pub fn random() -> Self {
        let mut raw = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut raw);
        Self(raw)
    }

    pub fn hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hex())
    }
}

impl fmt::Debug for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}>", self.hex())
    }
}

impl Serialize for LinkId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.hex())
    }
}

impl<'de> Deserialize<'de> for LinkId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let raw = hex::decode(&s).map_err(D::Error::custom)?;
        if raw.len() != 16 {
            return Err(D::Error::custom("link id must be 16 bytes"));
        }
        let mut out = [0u8; 16];
        out.copy_from_slice(&raw);
        Ok(Self(out))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Pending,
    Active,
    Closed,
}

/// Terminal-or-not status of a packet or request send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiptStatus {
    Sent,
    Delivered,
    Failed,
}

/// Receipt for an unreliable packet. Resolves to `Delivered` when the far
/// side acknowledges it, or `Failed` when the link dies first.
#[derive(Debug, Clone)]
pub struct PacketReceipt {
    status: watch::Receiver<ReceiptStatus>,
}

impl PacketReceipt {
    pub fn status(&self) -> ReceiptStatus {
        *self.status.borrow()
    }
}

/// Receipt for a reliable request. Resolves to `Delivered` once the response
/// value has arrived, or `Failed` on timeout or link death.
pub struct RequestReceipt {
    status: watch::Receiver<ReceiptStatus>,
    response: Arc<Mutex<Option<Value>>>,
}

impl RequestReceipt {
    pub fn status(&self) -> ReceiptStatus {
        *self.status.borrow()
    }

    /// The response value, once `status()` is `Delivered`.
    pub fn response(&self) -> Option<Value> {
        self.response.lock().expect("response lock").clone()
    }

    /// Wait until the request reaches a terminal status or the timeout
    /// elapses (which counts as `Failed`).
    pub async fn wait(&mut self, timeout: Duration) -> ReceiptStatus {
        let waited = tokio::time::timeout(
            timeout,
            self.status.wait_for(|s| *s != ReceiptStatus::Sent),
        )
        .await;
        match waited {
            Ok(Ok(status)) => *status,
            // Channel closed or timed out without a terminal status.
            _ => ReceiptStatus::Failed,
        }
    }
}

struct PendingRequest {
    status: watch::Sender<ReceiptStatus>,
    response: Arc<Mutex<Option<Value>>>,
}

pub(crate) struct LinkInner {
    id: LinkId,
    destination: AddressHash,
    mdu: usize,
    peer: PeerSender,
    status: watch::Sender<LinkStatus>,
    closed: AtomicBool,
    established_at: Instant,
    rtt: Mutex<Option<Duration>>,
    remote_identity: Mutex<Option<AddressHash>>,
    next_seq: AtomicU64,
    pending_packets: Mutex<HashMap<u64, watch::Sender<ReceiptStatus>>>,
    pending_requests: Mutex<HashMap<u64, PendingRequest>>,
    links: Arc<DashMap<LinkId, Link>>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

/// Handle to a live link. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Link {
    inner: Arc<LinkInner>,
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Link({})", self.inner.id)
    }
}

impl Link {
    pub(crate) fn new(
        id: LinkId,
        destination: AddressHash,
        mdu: usize,
        initial: LinkStatus,
        peer: PeerSender,
        links: Arc<DashMap<LinkId, Link>>,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Self {
        let (status, _) = watch::channel(initial);
        Self {
            inner: Arc::new(LinkInner {
                id,
                destination,
                mdu,
                peer,
                status,
                closed: AtomicBool::new(false),
                established_at: Instant::now(),
                rtt: Mutex::new(None),
                remote_identity: Mutex::new(None),
                next_seq: AtomicU64::new(1),
                pending_packets: Mutex::new(HashMap::new()),
                pending_requests: Mutex::new(HashMap::new()),
                links,
                events,
            }),
        }
    }

    pub fn id(&self) -> LinkId {
        self.inner.id
    }

    pub fn destination(&self) -> AddressHash {
        self.inner.destination
    }

    /// Largest payload the link carries in a single frame.
    pub fn mdu(&self) -> usize {
        self.inner.mdu
    }

    pub fn status(&self) -> LinkStatus {
        *self.inner.status.borrow()
    }

    pub fn status_watch(&self) -> watch::Receiver<LinkStatus> {
        self.inner.status.subscribe()
    }

    /// Round-trip time, known once the link is active.
    pub fn rtt(&self) -> Option<Duration> {
        *self.inner.rtt.lock().expect("rtt lock")
    }

    pub fn remote_identity(&self) -> Option<AddressHash> {
        *self.inner.remote_identity.lock().expect("identity lock")
    }

    pub(crate) fn peer_id(&self) -> u64 {
        self.inner.peer.id()
    }

    /// Disclose the local identity to the far side.
    pub fn identify(&self, identity: &Identity) {
        self.send(WireMessage::Identify {
            link: self.inner.id,
            identity: identity.hash(),
        });
    }

    /// Send an unreliable packet over the link.
    pub fn send_packet(&self, payload: &[u8]) -> PacketReceipt {
        let id = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = watch::channel(ReceiptStatus::Sent);
        self.inner
            .pending_packets
            .lock()
            .expect("packets lock")
            .insert(id, tx);
        let ok = self.send(WireMessage::Packet {
            link: self.inner.id,
            id,
            payload: BASE64.encode(payload),
        });
        if !ok {
            self.fail_packet(id);
        }
        PacketReceipt { status: rx }
    }

    /// Issue a reliable request keyed by `path`.
    pub fn request(&self, path: &str, data: Value) -> RequestReceipt {
        let id = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = watch::channel(ReceiptStatus::Sent);
        let response = Arc::new(Mutex::new(None));
        self.inner
            .pending_requests
            .lock()
            .expect("requests lock")
            .insert(
                id,
                PendingRequest {
                    status: tx,
                    response: response.clone(),
                },
            );
        let ok = self.send(WireMessage::Request {
            link: self.inner.id,
            id,
            path: path.to_string(),
            data,
        });
        if !ok {
            self.complete_request(id, None);
        }
        RequestReceipt {
            status: rx,
            response,
        }
    }

    /// Answer a request received on this link.
    pub fn respond(&self, request_id: u64, data: Value) {
        self.send(WireMessage::Response {
            link: self.inner.id,
            id: request_id,
            data,
        });
    }

    /// Close the link, notifying the far side.
    pub fn teardown(&self) {
        if self.status() != LinkStatus::Closed {
            self.send(WireMessage::Teardown { link: self.inner.id });
        }
        self.close_local();
    }

    fn send(&self, message: WireMessage) -> bool {
        self.inner.peer.send(message)
    }

    pub(crate) fn activate(&self) {
        let rtt = self.inner.established_at.elapsed();
        *self.inner.rtt.lock().expect("rtt lock") = Some(rtt);
        self.inner.status.send_replace(LinkStatus::Active);
        self.send(WireMessage::LinkRtt {
            link: self.inner.id,
            rtt_ms: rtt.as_secs_f64() * 1000.0,
        });
    }

    pub(crate) fn set_rtt(&self, rtt: Duration) {
        *self.inner.rtt.lock().expect("rtt lock") = Some(rtt);
    }

    pub(crate) fn set_remote_identity(&self, identity: AddressHash) {
        *self.inner.remote_identity.lock().expect("identity lock") = Some(identity);
    }

    pub(crate) fn ack_packet(&self, id: u64) {
        if let Some(tx) = self
            .inner
            .pending_packets
            .lock()
            .expect("packets lock")
            .remove(&id)
        {
            tx.send_replace(ReceiptStatus::Delivered);
        }
    }

    fn fail_packet(&self, id: u64) {
        if let Some(tx) = self
            .inner
            .pending_packets
            .lock()
            .expect("packets lock")
            .remove(&id)
        {
            tx.send_replace(ReceiptStatus::Failed);
        }
    }

    /// Resolve a pending request. `Some` delivers a response, `None` fails it.
    pub(crate) fn complete_request(&self, id: u64, data: Option<Value>) {
        if let Some(pending) = self
            .inner
            .pending_requests
            .lock()
            .expect("requests lock")
            .remove(&id)
        {
            match data {
                Some(value) => {
                    *pending.response.lock().expect("response lock") = Some(value);
                    pending.status.send_replace(ReceiptStatus::Delivered);
                }
                None => {
                    pending.status.send_replace(ReceiptStatus::Failed);
                }
            }
        }
    }

    /// Mark the link closed and fail everything in flight. Idempotent; does
    /// not notify the far side.
    pub(crate) fn close_local(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(link = %self.inner.id, "link closed");
        self.inner.status.send_replace(LinkStatus::Closed);
        let packets: Vec<_> = self
            .inner
            .pending_packets
            .lock()
            .expect("packets lock")
            .drain()
            .collect();
        for (_, tx) in packets {
            tx.send_replace(ReceiptStatus::Failed);
        }
        let requests: Vec<_> = self
            .inner
            .pending_requests
            .lock()
            .expect("requests lock")
            .drain()
            .collect();
        for (_, pending) in requests {
            pending.status.send_replace(ReceiptStatus::Failed);
        }
        self.inner.links.remove(&self.inner.id);
        let _ = self
            .inner
            .events
            .send(TransportEvent::LinkClosed(self.clone()));
    }
}
