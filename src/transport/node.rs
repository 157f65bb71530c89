//! The overlay node: peer connections, path table, link table.
//!
//! Peers are TCP neighbors. Destinations announce themselves to connected
//! peers and answer path requests, which is all the path discovery a node
//! needs: the path table maps a destination hash to the peer it was announced
//! through. Links are multiplexed over peer connections by link id.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use dashmap::DashMap;
use serde::Deserialize;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::frame::{read_frame, write_frame, WireMessage};
use super::identity::{destination_hash, AddressHash, Identity};
use super::link::{Link, LinkId, LinkStatus};
use super::{TransportEvent, LINK_MDU};

/// Peer wiring for the overlay node, normally loaded from `config.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Address to accept peer connections on. Listeners need this.
    pub bind: Option<String>,
    /// Peers to dial at startup. Clients need at least one.
    pub peers: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
    #[error("no known path to destination")]
    NoPath,
}

/// Which identities may use an IN destination.
#[derive(Debug, Clone)]
pub enum AccessPolicy {
    AllowAll,
    AllowList(Vec<AddressHash>),
}

impl AccessPolicy {
    pub fn permits(&self, identity: Option<AddressHash>) -> bool {
        match self {
            AccessPolicy::AllowAll => true,
            AccessPolicy::AllowList(allowed) => {
                identity.is_some_and(|hash| allowed.contains(&hash))
            }
        }
    }
}

/// Handle for writing to one peer connection.
#[derive(Clone)]
pub struct PeerSender {
    id: u64,
    tx: mpsc::UnboundedSender<WireMessage>,
}

impl PeerSender {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn send(&self, message: WireMessage) -> bool {
        self.tx.send(message).is_ok()
    }
}

struct PathEntry {
    peer: PeerSender,
    #[allow(dead_code)]
    identity: AddressHash,
}

struct InDestination {
    policy: AccessPolicy,
    announce: bool,
}

struct NodeInner {
    identity_hash: AddressHash,
    links: Arc<DashMap<LinkId, Link>>,
    paths: DashMap<AddressHash, PathEntry>,
    in_destinations: DashMap<AddressHash, InDestination>,
    peers: Mutex<Vec<PeerSender>>,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
    local_addr: Mutex<Option<SocketAddr>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    next_peer_id: AtomicU64,
    shutting_down: AtomicBool,
}

/// An overlay node. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<NodeInner>,
}

impl Transport {
    /// Start a node: bind the peer listener if configured, dial the
    /// configured peers, and hand back the inbound event stream.
    pub async fn start(
        identity: &Identity,
        config: TransportConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<TransportEvent>), TransportError> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(NodeInner {
            identity_hash: identity.hash(),
            links: Arc::new(DashMap::new()),
            paths: DashMap::new(),
            in_destinations: DashMap::new(),
            peers: Mutex::new(Vec::new()),
            event_tx,
            local_addr: Mutex::new(None),
            accept_task: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            next_peer_id: AtomicU64::new(1),
            shutting_down: AtomicBool::new(false),
        });

        if let Some(bind) = &config.bind {
            let listener = TcpListener::bind(bind).await.map_err(|source| {
                TransportError::Bind {
                    addr: bind.clone(),
                    source,
                }
            })?;
            let local = listener.local_addr().ok();
            *inner.local_addr.lock().expect("addr lock") = local;
            if let Some(addr) = local {
                info!(%addr, "accepting peer connections");
            }
            let accept_inner = inner.clone();
            let handle = tokio::spawn(async move {
                loop {
                    match listener.accept().await {
                        Ok((stream, addr)) => {
                            let conn_inner = accept_inner.clone();
                            let conn = tokio::spawn(async move {
                                run_peer(conn_inner, stream, addr).await;
                            });
                            accept_inner.tasks.lock().expect("tasks lock").push(conn);
                        }
                        Err(e) => {
                            error!("accept failed: {e}");
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
            });
            *inner.accept_task.lock().expect("accept lock") = Some(handle);
        }

        for peer_addr in config.peers {
            let dial_inner = inner.clone();
            let handle = tokio::spawn(async move {
                match TcpStream::connect(&peer_addr).await {
                    Ok(stream) => {
                        let addr = stream
                            .peer_addr()
                            .unwrap_or_else(|_| "0.0.0.0:0".parse().expect("addr"));
                        run_peer(dial_inner, stream, addr).await;
                    }
                    Err(e) => warn!(peer = %peer_addr, "could not reach peer: {e}"),
                }
            });
            inner.tasks.lock().expect("tasks lock").push(handle);
        }

        Ok((Self { inner }, event_rx))
    }

    /// The bound peer-listener address, when one was configured.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock().expect("addr lock")
    }

    /// Register an IN destination for (app, service) under this node's
    /// identity. Returns the destination hash clients address.
    pub fn register_destination(
        &self,
        app_name: &str,
        service_name: &str,
        policy: AccessPolicy,
        announce: bool,
    ) -> AddressHash {
        let dest = destination_hash(self.inner.identity_hash, app_name, service_name);
        self.inner
            .in_destinations
            .insert(dest, InDestination { policy, announce });
        dest
    }

    /// Announce a registered destination to every connected peer.
    pub fn announce(&self, destination: AddressHash) {
        if !self.inner.in_destinations.contains_key(&destination) {
            return;
        }
        let message = WireMessage::Announce {
            destination,
            identity: self.inner.identity_hash,
        };
        for peer in self.inner.peers.lock().expect("peers lock").iter() {
            peer.send(message.clone());
        }
    }

    pub fn has_path(&self, destination: AddressHash) -> bool {
        self.inner.paths.contains_key(&destination)
    }

    /// Ask all peers whether they can reach `destination`. Answers arrive
    /// asynchronously; poll [`Transport::has_path`].
    pub fn request_path(&self, destination: AddressHash) {
        let message = WireMessage::PathRequest { destination };
        for peer in self.inner.peers.lock().expect("peers lock").iter() {
            peer.send(message.clone());
        }
    }

    /// Open a link to a destination a path is known for. The link starts
    /// PENDING; wait on its status watch for activation.
    pub fn establish_link(&self, destination: AddressHash) -> Result<Link, TransportError> {
        let peer = self
            .inner
            .paths
            .get(&destination)
            .map(|entry| entry.peer.clone())
            .ok_or(TransportError::NoPath)?;
        let id = LinkId::random();
        let link = Link::new(
            id,
            destination,
            LINK_MDU,
            LinkStatus::Pending,
            peer.clone(),
            self.inner.links.clone(),
            self.inner.event_tx.clone(),
        );
        self.inner.links.insert(id, link.clone());
        peer.send(WireMessage::LinkRequest {
            link: id,
            destination,
        });
        Ok(link)
    }

    /// All links that are not closed.
    pub fn active_links(&self) -> Vec<Link> {
        self.inner
            .links
            .iter()
            .map(|entry| entry.value().clone())
            .filter(|link| link.status() != LinkStatus::Closed)
            .collect()
    }

    /// Stop accepting new peer connections. Existing peers keep running.
    pub fn stop_accepting(&self) {
        if let Some(task) = self.inner.accept_task.lock().expect("accept lock").take() {
            task.abort();
        }
    }

    /// Tear down all links and stop accepting or serving peers.
    pub async fn shutdown(&self) {
        if self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop_accepting();
        for link in self.active_links() {
            link.teardown();
        }
        // Let the writer tasks flush the teardown frames.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let tasks: Vec<_> = std::mem::take(&mut *self.inner.tasks.lock().expect("tasks lock"));
        for task in tasks {
            task.abort();
        }
        self.inner.peers.lock().expect("peers lock").clear();
    }
}

/// Serve one peer connection until EOF, then release everything that rode it.
async fn run_peer(inner: Arc<NodeInner>, stream: TcpStream, addr: SocketAddr) {
    let peer_id = inner.next_peer_id.fetch_add(1, Ordering::Relaxed);
    debug!(peer = peer_id, %addr, "peer connected");
    let (mut read_half, mut write_half) = stream.into_split();

    let (tx, mut rx) = mpsc::unbounded_channel::<WireMessage>();
    let peer = PeerSender { id: peer_id, tx };
    inner.peers.lock().expect("peers lock").push(peer.clone());

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if let Err(e) = write_frame(&mut write_half, &message).await {
                debug!("peer write failed: {e}");
                break;
            }
        }
    });
    inner.tasks.lock().expect("tasks lock").push(writer);

    // A freshly connected peer learns about our announced destinations.
    for entry in inner.in_destinations.iter() {
        if entry.value().announce {
            peer.send(WireMessage::Announce {
                destination: *entry.key(),
                identity: inner.identity_hash,
            });
        }
    }

    read_loop(&inner, &peer, &mut read_half).await;

    debug!(peer = peer_id, %addr, "peer disconnected");
    inner
        .peers
        .lock()
        .expect("peers lock")
        .retain(|p| p.id != peer_id);
    inner.paths.retain(|_, entry| entry.peer.id != peer_id);
    let stranded: Vec<Link> = inner
        .links
        .iter()
        .filter(|entry| entry.value().peer_id() == peer_id)
        .map(|entry| entry.value().clone())
        .collect();
    for link in stranded {
        link.close_local();
    }
}

async fn read_loop(inner: &Arc<NodeInner>, peer: &PeerSender, read_half: &mut OwnedReadHalf) {
    loop {
        match read_frame(read_half).await {
            Ok(Some(message)) => dispatch(inner, peer, message),
            Ok(None) => break,
            Err(e) => {
                debug!("peer read failed: {e}");
                break;
            }
        }
    }
}

fn dispatch(inner: &Arc<NodeInner>, peer: &PeerSender, message: WireMessage) {
    match message {
        WireMessage::Announce {
            destination,
            identity,
        } => {
            debug!(destination = %destination, "path learned");
            inner.paths.insert(
                destination,
                PathEntry {
                    peer: peer.clone(),
                    identity,
                },
            );
        }
        WireMessage::PathRequest { destination } => {
            if inner.in_destinations.contains_key(&destination) {
                peer.send(WireMessage::Announce {
                    destination,
                    identity: inner.identity_hash,
                });
            }
        }
        WireMessage::LinkRequest { link, destination } => {
            if !inner.in_destinations.contains_key(&destination) {
                debug!(link = %link, "link request for unknown destination");
                peer.send(WireMessage::Teardown { link });
                return;
            }
            let new_link = Link::new(
                link,
                destination,
                LINK_MDU,
                LinkStatus::Active,
                peer.clone(),
                inner.links.clone(),
                inner.event_tx.clone(),
            );
            inner.links.insert(link, new_link.clone());
            peer.send(WireMessage::LinkProof { link });
            let _ = inner
                .event_tx
                .send(TransportEvent::LinkEstablished(new_link));
        }
        WireMessage::LinkProof { link } => {
            let found = inner.links.get(&link).map(|l| l.value().clone());
            if let Some(link) = found {
                if link.status() == LinkStatus::Pending {
                    link.activate();
                }
            }
        }
        WireMessage::LinkRtt { link, rtt_ms } => {
            let found = inner.links.get(&link).map(|l| l.value().clone());
            if let Some(link) = found {
                link.set_rtt(Duration::from_secs_f64(rtt_ms.max(0.0) / 1000.0));
            }
        }
        WireMessage::Identify { link, identity } => {
            let found = inner.links.get(&link).map(|l| l.value().clone());
            if let Some(link) = found {
                link.set_remote_identity(identity);
                let _ = inner
                    .event_tx
                    .send(TransportEvent::RemoteIdentified { link, identity });
            }
        }
        WireMessage::Packet { link, id, payload } => {
            let found = inner.links.get(&link).map(|l| l.value().clone());
            if let Some(link) = found {
                let payload = match BASE64.decode(&payload) {
                    Ok(raw) => raw,
                    Err(e) => {
                        debug!(link = %link.id(), "undecodable packet payload: {e}");
                        return;
                    }
                };
                peer.send(WireMessage::PacketAck { link: link.id(), id });
                let _ = inner.event_tx.send(TransportEvent::Packet { link, payload });
            }
        }
        WireMessage::PacketAck { link, id } => {
            let found = inner.links.get(&link).map(|l| l.value().clone());
            if let Some(link) = found {
                link.ack_packet(id);
            }
        }
        WireMessage::Request {
            link,
            id,
            path,
            data,
        } => {
            let found = inner.links.get(&link).map(|l| l.value().clone());
            let Some(link) = found else {
                debug!(link = %link, "request for unknown link");
                return;
            };
            let permitted = inner
                .in_destinations
                .get(&link.destination())
                .map(|dest| dest.value().policy.permits(link.remote_identity()))
                .unwrap_or(false);
            if !permitted {
                warn!(link = %link.id(), "request from unauthorized peer, tearing down link");
                link.teardown();
                return;
            }
            let _ = inner.event_tx.send(TransportEvent::Request {
                link,
                id,
                path,
                data,
            });
        }
        WireMessage::Response { link, id, data } => {
            let found = inner.links.get(&link).map(|l| l.value().clone());
            if let Some(link) = found {
                link.complete_request(id, Some(data));
            }
        }
        WireMessage::Teardown { link } => {
            let found = inner.links.get(&link).map(|l| l.value().clone());
            if let Some(link) = found {
                link.close_local();
            }
        }
    }
}
