//! Client mode: attach the local terminal to a remote PTY.
//!
//! The session loop snapshots accumulated stdin plus the local terminal
//! state into a request, fires it over the link, writes the returned stdout
//! locally, and then sleeps until a "data available" packet, a SIGWINCH, or
//! a 5-second tick wakes it. The loop ends when the remote reports the child
//! exited and the stdout buffer is fully drained.

pub mod tty;

use std::io::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::protocol::{Request, Response, DATA_AVAIL_MSG, REQUEST_PATH};
use crate::transport::{
    AddressHash, Identity, Link, LinkStatus, ReceiptStatus, Transport, TransportEvent,
};
use tty::TtyGuard;

/// Extra slack on top of the RTT-scaled request timeout.
const REMOTE_EXEC_GRACE: Duration = Duration::from_secs(2);
/// Additional wait for the response after the request is in flight.
const RECEIPT_GRACE: Duration = Duration::from_millis(500);
/// Ceiling on the idle wait between exchanges.
const WAKE_CEILING: Duration = Duration::from_secs(5);

const EXIT_FAILURE: i32 = 255;

/// A failure anywhere between the local terminal and the remote child.
#[derive(Debug, thiserror::Error)]
#[error("{msg}")]
pub struct RemoteExecutionError {
    pub msg: String,
}

fn remote_err(msg: impl Into<String>) -> RemoteExecutionError {
    RemoteExecutionError { msg: msg.into() }
}

pub struct ClientConfig {
    /// Destination hash, hex.
    pub destination: String,
    /// Skip identifying to the listener.
    pub no_id: bool,
    /// Path discovery, link establishment, and request timeout.
    pub timeout: Duration,
}

/// Check a destination hash argument before any link is opened.
pub fn validate_destination(destination: &str) -> Result<AddressHash, RemoteExecutionError> {
    AddressHash::from_hex(destination).map_err(|e| remote_err(e.to_string()))
}

/// Run the interactive session. Returns the remote return code.
pub async fn run(
    transport: Transport,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    identity: &Identity,
    config: ClientConfig,
) -> Result<i32, RemoteExecutionError> {
    let destination = validate_destination(&config.destination)?;
    let finished = CancellationToken::new();

    if !transport.has_path(destination) {
        info!("requesting path...");
        transport.request_path(destination);
        if !spin(
            || transport.has_path(destination),
            config.timeout,
            &finished,
        )
        .await
        {
            return Err(remote_err("Path not found"));
        }
    }

    info!("establishing link...");
    let link = transport
        .establish_link(destination)
        .map_err(|_| remote_err("Path not found"))?;
    let mut status = link.status_watch();
    let active = tokio::time::timeout(
        config.timeout,
        status.wait_for(|s| *s == LinkStatus::Active),
    )
    .await;
    if !matches!(active, Ok(Ok(_))) {
        return Err(remote_err(format!(
            "Could not establish link with {destination}"
        )));
    }

    if !config.no_id {
        link.identify(identity);
    }

    let wake = Arc::new(Notify::new());
    spawn_event_pump(events, wake.clone());

    let stdin_fd = libc::STDIN_FILENO;
    let tty = TtyGuard::new(stdin_fd);
    let stdin_buffer: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
    tty::spawn_stdin_reader(stdin_buffer.clone());

    // SIGWINCH wakes the loop so the next request carries the new winsize.
    if let Ok(mut winch) = signal(SignalKind::window_change()) {
        let winch_wake = wake.clone();
        tokio::spawn(async move {
            while winch.recv().await.is_some() {
                winch_wake.notify_one();
            }
        });
    }

    // SIGINT aborts until the first exchange has succeeded; afterwards it is
    // forwarded in-band so Ctrl-C reaches the remote shell.
    let in_band = Arc::new(AtomicBool::new(false));
    if let Ok(mut interrupt) = signal(SignalKind::interrupt()) {
        let int_buffer = stdin_buffer.clone();
        let int_flag = in_band.clone();
        let int_finished = finished.clone();
        tokio::spawn(async move {
            while interrupt.recv().await.is_some() {
                if int_flag.load(Ordering::SeqCst) {
                    int_buffer
                        .lock()
                        .expect("stdin buffer lock")
                        .extend_from_slice(b"\x03");
                } else {
                    int_finished.cancel();
                }
            }
        });
    }

    let result = session_loop(
        &link,
        &tty,
        &config,
        stdin_fd,
        &stdin_buffer,
        &wake,
        &in_band,
        &finished,
    )
    .await;

    tty.restore();
    link.teardown();
    result
}

fn spawn_event_pump(mut events: mpsc::UnboundedReceiver<TransportEvent>, wake: Arc<Notify>) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::Packet { payload, .. } => {
                    if payload == DATA_AVAIL_MSG.as_bytes() {
                        debug!("data available");
                        wake.notify_one();
                    } else {
                        error!("received unhandled packet");
                    }
                }
                TransportEvent::LinkClosed(_) => {
                    wake.notify_one();
                }
                _ => {}
            }
        }
    });
}

#[allow(clippy::too_many_arguments)]
async fn session_loop(
    link: &Link,
    tty: &TtyGuard,
    config: &ClientConfig,
    stdin_fd: i32,
    stdin_buffer: &Arc<Mutex<Vec<u8>>>,
    wake: &Arc<Notify>,
    in_band: &Arc<AtomicBool>,
    finished: &CancellationToken,
) -> Result<i32, RemoteExecutionError> {
    let mut first_loop = true;
    loop {
        if finished.is_cancelled() {
            return Err(remote_err("interrupted"));
        }

        let snapshot = {
            let mut buffer = stdin_buffer.lock().expect("stdin buffer lock");
            std::mem::take(&mut *buffer)
        };
        let request = Request {
            stdin: Some(snapshot),
            term: std::env::var("TERM").ok(),
            term_state: tty::term_state(stdin_fd),
        };

        let rtt = link.rtt().unwrap_or_default();
        let timeout = config.timeout + rtt * 4 + REMOTE_EXEC_GRACE;
        let mut receipt = link.request(REQUEST_PATH, request.to_value());

        let status = tokio::select! {
            status = receipt.wait(timeout + RECEIPT_GRACE) => status,
            _ = finished.cancelled() => return Err(remote_err("interrupted")),
        };
        if link.status() == LinkStatus::Closed {
            return Err(remote_err(
                "Could not request remote execution, link was closed",
            ));
        }
        if status != ReceiptStatus::Delivered {
            return Err(remote_err("Could not request remote execution"));
        }
        let value = receipt
            .response()
            .ok_or_else(|| remote_err("No result was received"))?;
        let response = Response::from_value(&value)
            .map_err(|e| remote_err(format!("Received invalid response: {e}")))?;

        tty.raw();
        if let Some(stdout_bytes) = &response.stdout {
            let mut out = std::io::stdout().lock();
            let _ = out.write_all(stdout_bytes);
            let _ = out.flush();
        }
        debug!(
            ready_bytes = response.ready_bytes,
            return_code = ?response.return_code,
            "response processed"
        );

        if first_loop {
            first_loop = false;
            in_band.store(true, Ordering::SeqCst);
            wake.notify_one();
        }

        if response.ready_bytes > 0 {
            // More stdout is buffered server-side; fetch it right away.
            wake.notify_one();
        }
        if (!response.running || response.return_code.is_some()) && response.ready_bytes == 0 {
            return Ok(response.return_code.unwrap_or(EXIT_FAILURE));
        }

        tokio::select! {
            _ = wake.notified() => {}
            _ = tokio::time::sleep(WAKE_CEILING) => {}
            _ = finished.cancelled() => return Err(remote_err("interrupted")),
        }
    }
}

/// Poll `until` every 10 ms, bounded by `timeout` and the finished token.
async fn spin(
    until: impl Fn() -> bool,
    timeout: Duration,
    finished: &CancellationToken,
) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while !until() {
        if finished.is_cancelled() || tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    true
}
