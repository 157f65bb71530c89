//! Listener mode: expose a named service and serve a PTY-backed command to
//! each authenticated link.
//!
//! One event loop drives all link callbacks. The PTY reader threads and the
//! retry engine re-enter it through the runtime handle; the request handler
//! itself is synchronous.

pub mod notify;
pub mod pty;
pub mod registry;
pub mod session;

use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::protocol::{Request, Response, REQUEST_PATH};
use crate::transport::{
    AccessPolicy, AddressHash, Link, Transport, TransportEvent,
};
use crate::APP_NAME;
use notify::Notifier;
use registry::SessionRegistry;
use session::Session;

const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(900);

pub struct ListenerConfig {
    /// Command to run for each link.
    pub command: Vec<String>,
    pub service_name: String,
    /// Accept any identity, identified or not.
    pub allow_all: bool,
    /// Identity hashes allowed to connect when auth is enabled.
    pub allowed: Vec<AddressHash>,
    /// Announce the service to peers, at startup and periodically.
    pub announce: bool,
}

pub struct Listener {
    transport: Transport,
    registry: SessionRegistry,
    notifier: Notifier,
    command: Vec<String>,
    allow_all: bool,
    allowed: Vec<AddressHash>,
    announce: bool,
    destination: AddressHash,
}

impl Listener {
    /// Register the service destination and prepare the session machinery.
    /// Must run inside the runtime that will drive [`Listener::run`].
    pub fn new(transport: Transport, config: ListenerConfig) -> Self {
        let policy = if config.allow_all {
            AccessPolicy::AllowAll
        } else {
            AccessPolicy::AllowList(config.allowed.clone())
        };
        if !config.allow_all && config.allowed.is_empty() {
            warn!("no allowed identities configured, rnsh will not accept any connections");
        }
        let destination =
            transport.register_destination(APP_NAME, &config.service_name, policy, config.announce);
        info!(destination = %destination, "rnsh listening for commands");

        let registry = SessionRegistry::new();
        let notifier = Notifier::new(registry.clone());
        Self {
            transport,
            registry,
            notifier,
            command: config.command,
            allow_all: config.allow_all,
            allowed: config.allowed,
            announce: config.announce,
            destination,
        }
    }

    pub fn destination(&self) -> AddressHash {
        self.destination
    }

    /// Serve links until SIGINT, then shut down gracefully.
    pub async fn run(self, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
        let mut announce_timer = tokio::time::interval(ANNOUNCE_INTERVAL);
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);

        loop {
            tokio::select! {
                _ = &mut ctrl_c => {
                    self.shutdown().await;
                    return;
                }
                _ = announce_timer.tick(), if self.announce => {
                    self.transport.announce(self.destination);
                }
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => return,
                }
            }
        }
    }

    fn handle_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::LinkEstablished(link) => {
                info!(link = %link.id(), "link established");
            }
            TransportEvent::RemoteIdentified { link, identity } => {
                info!(link = %link.id(), identity = %identity, "initiator identified");
                if !self.allow_all && !self.allowed.contains(&identity) {
                    warn!(identity = %identity, "identity not allowed, tearing down link");
                    link.teardown();
                }
            }
            TransportEvent::Request {
                link,
                id,
                path,
                data,
            } => {
                if path != REQUEST_PATH {
                    warn!(link = %link.id(), path = %path, "request for unknown path");
                    link.respond(id, Response::default_now().to_value());
                    return;
                }
                let response = self.serve_data_request(&link, &data);
                link.respond(id, response.to_value());
            }
            TransportEvent::Packet { link, .. } => {
                debug!(link = %link.id(), "unexpected packet from initiator");
            }
            TransportEvent::LinkClosed(link) => self.on_link_closed(&link),
        }
    }

    /// The "data" request cycle: resolve or create the session, forward
    /// stdin and winsize, return a slice of buffered stdout.
    fn serve_data_request(&self, link: &Link, data: &Value) -> Response {
        let tag = link.id();
        // The request itself proves the client is alive and fetching.
        self.notifier.complete(tag);

        let request = match Request::from_value(data) {
            Ok(request) => request,
            Err(e) => {
                error!(link = %tag, "error processing request: {e}");
                if let Some(session) = self.registry.get(&tag) {
                    session.terminate();
                }
                return Response::default_now();
            }
        };

        let session = match self.registry.get(&tag) {
            Some(session) => session,
            None => {
                debug!(link = %tag, "starting session");
                match Session::spawn(
                    link.clone(),
                    &self.command,
                    request.term.as_deref(),
                    self.notifier.clone(),
                ) {
                    Ok(session) => {
                        self.registry.put(tag, session.clone());
                        session
                    }
                    Err(e) => {
                        error!(link = %tag, "failed to launch process: {e}");
                        return Response::default_now();
                    }
                }
            }
        };

        // Headroom for base64 and field encoding around the stdout slice.
        let read_size = link.mdu() * 3 / 2;
        session.handle_request(&request, read_size)
    }

    fn on_link_closed(&self, link: &Link) {
        info!(link = %link.id(), "link closed");
        match self.registry.get(&link.id()) {
            Some(session) => session.terminate(),
            None => debug!(link = %link.id(), "no process for link"),
        }
        self.notifier.complete(link.id());
        self.registry.clear(&link.id());
    }

    async fn shutdown(&self) {
        warn!("shutting down");
        self.transport.stop_accepting();
        for link in self.transport.active_links() {
            if let Some(session) = self.registry.get(&link.id()) {
                if session.running() {
                    session.terminate();
                }
            }
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
        for link in self.transport.active_links() {
            link.teardown();
        }
        self.notifier.shutdown();
        self.transport.shutdown().await;
    }
}
