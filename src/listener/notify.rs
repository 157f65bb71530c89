//! The data-available notification retry engine.
//!
//! When new stdout lands in a session buffer, the client is poked with an
//! unreliable packet. One retry chain runs per link at most; further bursts
//! coalesce into the existing chain. Retries are spaced by an RTT-scaled
//! delay, and a link whose client never acknowledges is torn down.

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::registry::SessionRegistry;
use crate::protocol::DATA_AVAIL_MSG;
use crate::transport::{Link, LinkId, LinkStatus, ReceiptStatus};

/// Notification packets per burst before the link is declared dead.
pub const NOTIFY_TRY_LIMIT: u32 = 15;

/// How long a session lingers after its child exits, so the client can still
/// drain buffered stdout.
pub const POST_EXIT_GRACE: Duration = Duration::from_secs(300);

struct NotifierInner {
    chains: DashMap<LinkId, CancellationToken>,
    registry: SessionRegistry,
    handle: tokio::runtime::Handle,
}

/// Shared retry engine. Cheap to clone; callable from any thread.
#[derive(Clone)]
pub struct Notifier {
    inner: Arc<NotifierInner>,
}

impl Notifier {
    /// Must be called from within the runtime that should run the chains.
    pub fn new(registry: SessionRegistry) -> Self {
        Self {
            inner: Arc::new(NotifierInner {
                chains: DashMap::new(),
                registry,
                handle: tokio::runtime::Handle::current(),
            }),
        }
    }

    /// Begin a retry chain for `link` unless one is already running.
    pub fn data_available(&self, link: &Link, available: usize) {
        let tag = link.id();
        let token = match self.inner.chains.entry(tag) {
            Entry::Occupied(_) => {
                debug!(link = %tag, "notification already pending");
                return;
            }
            Entry::Vacant(vacant) => {
                let token = CancellationToken::new();
                vacant.insert(token.clone());
                token
            }
        };
        let notifier = self.clone();
        let link = link.clone();
        self.inner.handle.spawn(async move {
            notifier.run_chain(link, available, token).await;
        });
    }

    /// Cancel the chain for `tag`. After this returns, no further
    /// notification packets are sent for the tag until new data arrives.
    pub fn complete(&self, tag: LinkId) {
        if let Some((_, token)) = self.inner.chains.remove(&tag) {
            token.cancel();
        }
    }

    /// Tear the link down and clear its session once the post-exit grace
    /// elapses, unless the link died on its own first.
    pub fn schedule_cull(&self, link: Link) {
        let notifier = self.clone();
        self.inner.handle.spawn(async move {
            tokio::time::sleep(POST_EXIT_GRACE).await;
            debug!(link = %link.id(), "culling link after post-exit grace");
            if link.status() != LinkStatus::Closed {
                link.teardown();
            }
            notifier.inner.registry.clear(&link.id());
        });
    }

    /// Cancel every chain.
    pub fn shutdown(&self) {
        for entry in self.inner.chains.iter() {
            entry.value().cancel();
        }
        self.inner.chains.clear();
    }

    async fn run_chain(self, link: Link, available: usize, token: CancellationToken) {
        let tag = link.id();
        let rtt = link.rtt().unwrap_or(Duration::from_millis(200));
        let wait_delay = (rtt * 5).max(Duration::from_secs(1));
        let mut tries = 0u32;

        loop {
            if token.is_cancelled() {
                // complete() already removed the chain entry.
                return;
            }
            if link.status() != LinkStatus::Active {
                if let Some(session) = self.inner.registry.get(&tag) {
                    session.pending_receipt_take();
                }
                break;
            }

            let session = self.inner.registry.get(&tag);
            if let Some(receipt) = session.as_ref().and_then(|s| s.pending_receipt_take()) {
                if receipt.status() == ReceiptStatus::Delivered {
                    debug!(link = %tag, "notification delivered");
                    break;
                }
            }

            tries += 1;
            if tries > NOTIFY_TRY_LIMIT {
                error!(link = %tag, "notification retries exceeded, tearing down link");
                link.teardown();
                break;
            }

            if let Some(session) = session {
                info!(link = %tag, tries, available, "notifying client");
                if token.is_cancelled() {
                    return;
                }
                let receipt = link.send_packet(DATA_AVAIL_MSG.as_bytes());
                session.pending_receipt_put(receipt);
            }
            // else: the session is not registered yet (stdout raced session
            // startup) or was culled; check again next attempt.

            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(wait_delay) => {}
            }
        }

        if !token.is_cancelled() {
            self.inner.chains.remove(&tag);
        }
    }
}
