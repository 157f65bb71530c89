//! Local terminal plumbing: raw mode with guaranteed restore, terminal-state
//! capture for the request tuple, and the blocking stdin reader thread.

use std::os::fd::{BorrowedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use nix::sys::termios::{self, SetArg, Termios};
use serde_json::{json, Value};
use tracing::debug;

use crate::protocol::TermState;

/// Saves the terminal attributes of `fd` at construction and restores them
/// exactly once, on request or on drop.
pub struct TtyGuard {
    fd: RawFd,
    original: Option<Termios>,
    raw_entered: AtomicBool,
    restored: AtomicBool,
}

impl TtyGuard {
    pub fn new(fd: RawFd) -> Self {
        let original = termios::tcgetattr(unsafe { BorrowedFd::borrow_raw(fd) }).ok();
        Self {
            fd,
            original,
            raw_entered: AtomicBool::new(false),
            restored: AtomicBool::new(false),
        }
    }

    /// Put the terminal into raw mode. Idempotent.
    pub fn raw(&self) {
        if self.raw_entered.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(original) = &self.original {
            let mut raw = original.clone();
            termios::cfmakeraw(&mut raw);
            let _ = termios::tcsetattr(
                unsafe { BorrowedFd::borrow_raw(self.fd) },
                SetArg::TCSANOW,
                &raw,
            );
        }
    }

    /// Restore the original attributes. Idempotent.
    pub fn restore(&self) {
        if self.restored.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(original) = &self.original {
            let _ = termios::tcsetattr(
                unsafe { BorrowedFd::borrow_raw(self.fd) },
                SetArg::TCSANOW,
                original,
            );
        }
    }
}

impl Drop for TtyGuard {
    fn drop(&mut self) {
        self.restore();
    }
}

/// Window size of `fd`: (rows, cols, hpix, vpix).
pub fn winsize(fd: RawFd) -> Option<(u16, u16, u16, u16)> {
    let mut ws: libc::winsize = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::ioctl(fd, libc::TIOCGWINSZ, &mut ws) };
    if rc == 0 {
        Some((ws.ws_row, ws.ws_col, ws.ws_xpixel, ws.ws_ypixel))
    } else {
        None
    }
}

/// The terminal attributes of `fd` as an opaque blob for the request tuple:
/// the four mode-flag words followed by the control characters. Null when
/// `fd` is not a terminal.
pub fn termios_attrs(fd: RawFd) -> Value {
    match termios::tcgetattr(unsafe { BorrowedFd::borrow_raw(fd) }) {
        Ok(attrs) => json!([
            attrs.input_flags.bits(),
            attrs.output_flags.bits(),
            attrs.control_flags.bits(),
            attrs.local_flags.bits(),
            attrs.control_chars.to_vec(),
        ]),
        Err(_) => Value::Null,
    }
}

/// Snapshot the full terminal state of `fd` for a request.
pub fn term_state(fd: RawFd) -> TermState {
    let ws = winsize(fd);
    TermState {
        attrs: termios_attrs(fd),
        rows: ws.map(|w| w.0),
        cols: ws.map(|w| w.1),
        hpix: ws.map(|w| w.2),
        vpix: ws.map(|w| w.3),
    }
}

/// Append everything typed on stdin to `buffer` until EOF.
pub fn spawn_stdin_reader(buffer: Arc<Mutex<Vec<u8>>>) {
    let _ = std::thread::Builder::new()
        .name("stdin-reader".to_string())
        .spawn(move || {
            let mut buf = [0u8; 1024];
            loop {
                let n = unsafe {
                    libc::read(
                        libc::STDIN_FILENO,
                        buf.as_mut_ptr() as *mut libc::c_void,
                        buf.len(),
                    )
                };
                match n {
                    n if n > 0 => {
                        buffer
                            .lock()
                            .expect("stdin buffer lock")
                            .extend_from_slice(&buf[..n as usize]);
                    }
                    0 => {
                        debug!("stdin closed");
                        break;
                    }
                    _ => {
                        let err = std::io::Error::last_os_error();
                        if err.raw_os_error() == Some(libc::EINTR) {
                            continue;
                        }
                        debug!("stdin read failed: {err}");
                        break;
                    }
                }
            }
        });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn termios_attrs_of_non_tty_is_null() {
        let file = tempfile::tempfile().unwrap();
        use std::os::fd::AsRawFd;
        assert_eq!(termios_attrs(file.as_raw_fd()), Value::Null);
    }

    #[test]
    fn term_state_of_non_tty_has_no_winsize() {
        let file = tempfile::tempfile().unwrap();
        use std::os::fd::AsRawFd;
        let state = term_state(file.as_raw_fd());
        assert!(!state.has_winsize());
        assert_eq!(state.attrs, Value::Null);
    }
}
