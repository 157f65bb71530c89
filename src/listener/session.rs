//! Per-link session state on the listener.
//!
//! A session ties a link to its child supervisor, the bounded stdout buffer,
//! the last observed terminal state, and at most one pending notification
//! receipt. Buffer and receipt share one mutex; a response's stdout slice is
//! removed from the buffer atomically with the sampling of the bytes that
//! remain.

use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use super::notify::Notifier;
use super::pty::{PtyError, PtyProcess};
use crate::protocol::{self, Request, Response, TermState};
use crate::transport::{Link, PacketReceipt};

#[derive(Default)]
struct SessionShared {
    buffer: Vec<u8>,
    pending_receipt: Option<PacketReceipt>,
}

pub struct Session {
    link: Link,
    process: PtyProcess,
    shared: Arc<Mutex<SessionShared>>,
    term_state: Mutex<Option<TermState>>,
}

impl Session {
    /// Start the configured command for `link` and wire its stdout and
    /// termination into the notifier.
    pub fn spawn(
        link: Link,
        argv: &[String],
        term: Option<&str>,
        notifier: Notifier,
    ) -> Result<Arc<Self>, PtyError> {
        let shared = Arc::new(Mutex::new(SessionShared::default()));

        let out_shared = shared.clone();
        let out_notifier = notifier.clone();
        let out_link = link.clone();
        let stdout_cb = move |chunk: &[u8]| {
            let total = {
                let mut shared = out_shared.lock().expect("session lock");
                shared.buffer.extend_from_slice(chunk);
                shared.buffer.len()
            };
            out_notifier.data_available(&out_link, total);
        };

        let exit_notifier = notifier.clone();
        let exit_link = link.clone();
        let terminated_cb = move |code: i32| {
            info!(link = %exit_link.id(), code, "child exited");
            // Wake the client so it learns of the exit before its next poll,
            // then cull the link once the post-exit grace elapses.
            exit_notifier.data_available(&exit_link, 0);
            exit_notifier.schedule_cull(exit_link.clone());
        };

        let process = PtyProcess::spawn(argv, term, link.mdu(), stdout_cb, terminated_cb)?;
        Ok(Arc::new(Self {
            link,
            process,
            shared,
            term_state: Mutex::new(None),
        }))
    }

    pub fn link(&self) -> &Link {
        &self.link
    }

    pub fn running(&self) -> bool {
        self.process.running()
    }

    pub fn terminate(&self) {
        self.process.terminate();
    }

    pub fn pending_receipt_take(&self) -> Option<PacketReceipt> {
        self.shared
            .lock()
            .expect("session lock")
            .pending_receipt
            .take()
    }

    pub fn pending_receipt_put(&self, receipt: PacketReceipt) {
        self.shared.lock().expect("session lock").pending_receipt = Some(receipt);
    }

    /// Serve one request tuple against this session.
    ///
    /// Winsize updates are applied before stdin writes from the same request,
    /// and the stdout slice is taken atomically with the remaining count.
    pub fn handle_request(&self, request: &Request, read_size: usize) -> Response {
        let running = self.process.running();
        if running {
            {
                let mut cached = self.term_state.lock().expect("term state lock");
                if cached.as_ref() != Some(&request.term_state) {
                    *cached = Some(request.term_state.clone());
                    self.update_winsize(&request.term_state);
                }
            }
            if let Some(stdin) = &request.stdin {
                if !stdin.is_empty() {
                    self.process.write(stdin);
                }
            }
        }
        let return_code = self.process.return_code();

        let (stdout, ready_bytes) = {
            let mut shared = self.shared.lock().expect("session lock");
            let take = read_size.min(shared.buffer.len());
            let stdout: Vec<u8> = shared.buffer.drain(..take).collect();
            (stdout, shared.buffer.len() as u64)
        };
        debug!(
            link = %self.link.id(),
            sent = stdout.len(),
            ready_bytes,
            "request served"
        );

        Response {
            running,
            return_code,
            ready_bytes,
            stdout: (!stdout.is_empty()).then_some(stdout),
            timestamp: protocol::now(),
        }
    }

    fn update_winsize(&self, state: &TermState) {
        let (Some(rows), Some(cols)) = (state.rows, state.cols) else {
            debug!(link = %self.link.id(), "no winsize in terminal state");
            return;
        };
        if let Err(e) = self.process.set_winsize(
            rows,
            cols,
            state.hpix.unwrap_or(0),
            state.vpix.unwrap_or(0),
        ) {
            debug!(link = %self.link.id(), "failed to update winsize: {e}");
        }
    }
}
