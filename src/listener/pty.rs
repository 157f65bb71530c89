//! The PTY child supervisor.
//!
//! Owns one child process attached to a freshly opened PTY pair. A dedicated
//! OS thread pumps the master side into the stdout callback, a second thread
//! drains the write queue so callers never block, and a third reaps the child
//! and fires the terminated callback exactly once.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use portable_pty::{native_pty_system, CommandBuilder, MasterPty, PtySize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// TERM value used when the client does not send one.
pub const DEFAULT_TERM: &str = "xterm-256color";

/// Exit code reported when the child could not be spawned.
pub const SPAWN_FAILURE_CODE: i32 = 255;

const KILL_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum PtyError {
    #[error("empty command")]
    EmptyCommand,
    #[error("failed to open pty: {0}")]
    Open(String),
    #[error("failed to spawn {program}: {message}")]
    Spawn { program: String, message: String },
    #[error("failed to resize pty: {0}")]
    Resize(String),
}

struct ProcState {
    running: AtomicBool,
    return_code: Mutex<Option<i32>>,
}

/// A child process in a PTY, with callback-driven stdout and termination.
pub struct PtyProcess {
    master: Mutex<Box<dyn MasterPty + Send>>,
    write_tx: mpsc::UnboundedSender<Vec<u8>>,
    child_pid: i32,
    state: Arc<ProcState>,
    last_winsize: Mutex<Option<(u16, u16, u16, u16)>>,
    kill_escalated: AtomicBool,
}

impl PtyProcess {
    /// Open a PTY pair and start `argv` on its slave side, with the slave as
    /// the child's controlling terminal.
    ///
    /// `stdout_cb` receives each chunk read from the master, from the reader
    /// thread; it must not block. `terminated_cb` fires once the child is
    /// reaped, or immediately with [`SPAWN_FAILURE_CODE`] if spawning fails.
    /// `mdu` tunes the reader chunk size.
    pub fn spawn(
        argv: &[String],
        term: Option<&str>,
        mdu: usize,
        stdout_cb: impl FnMut(&[u8]) + Send + 'static,
        terminated_cb: impl FnOnce(i32) + Send + 'static,
    ) -> Result<Self, PtyError> {
        let program = match argv.first() {
            Some(program) => program.clone(),
            None => return Err(PtyError::EmptyCommand),
        };
        if !program_exists(&program) {
            terminated_cb(SPAWN_FAILURE_CODE);
            return Err(PtyError::Spawn {
                program,
                message: "no such program".to_string(),
            });
        }

        let pty = native_pty_system();
        let pair = pty
            .openpty(PtySize {
                rows: 24,
                cols: 80,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::Open(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&program);
        cmd.args(&argv[1..]);
        cmd.env("TERM", term.unwrap_or(DEFAULT_TERM));

        let mut child = match pair.slave.spawn_command(cmd) {
            Ok(child) => child,
            Err(e) => {
                terminated_cb(SPAWN_FAILURE_CODE);
                return Err(PtyError::Spawn {
                    program,
                    message: e.to_string(),
                });
            }
        };
        drop(pair.slave);

        let child_pid = child.process_id().map(|pid| pid as i32).unwrap_or(-1);

        let mut writer = pair
            .master
            .take_writer()
            .map_err(|e| PtyError::Open(e.to_string()))?;
        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| PtyError::Open(e.to_string()))?;

        let state = Arc::new(ProcState {
            running: AtomicBool::new(true),
            return_code: Mutex::new(None),
        });

        let chunk = mdu.max(1024);
        let mut stdout_cb = stdout_cb;
        std::thread::Builder::new()
            .name(format!("pty-reader-{child_pid}"))
            .spawn(move || {
                let mut buf = vec![0u8; chunk];
                loop {
                    match reader.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => stdout_cb(&buf[..n]),
                        Err(e) => {
                            let raw = e.raw_os_error().unwrap_or(0);
                            if raw == libc::EAGAIN || raw == libc::EINTR {
                                continue;
                            }
                            // EIO means the child side is gone.
                            debug!("pty reader finished: {e}");
                            break;
                        }
                    }
                }
            })
            .map_err(|e| PtyError::Open(e.to_string()))?;

        let (write_tx, mut write_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        std::thread::Builder::new()
            .name(format!("pty-writer-{child_pid}"))
            .spawn(move || {
                while let Some(data) = write_rx.blocking_recv() {
                    if let Err(e) = writer.write_all(&data).and_then(|_| writer.flush()) {
                        debug!("pty write dropped: {e}");
                    }
                }
            })
            .map_err(|e| PtyError::Open(e.to_string()))?;

        let reap_state = state.clone();
        std::thread::Builder::new()
            .name(format!("pty-wait-{child_pid}"))
            .spawn(move || {
                let code = match child.wait() {
                    Ok(status) => status.exit_code() as i32,
                    Err(e) => {
                        warn!("failed to reap child {child_pid}: {e}");
                        SPAWN_FAILURE_CODE
                    }
                };
                *reap_state.return_code.lock().expect("return code lock") = Some(code);
                reap_state.running.store(false, Ordering::SeqCst);
                terminated_cb(code);
            })
            .map_err(|e| PtyError::Open(e.to_string()))?;

        info!(pid = child_pid, program = %program, "child started");

        Ok(Self {
            master: Mutex::new(pair.master),
            write_tx,
            child_pid,
            state,
            last_winsize: Mutex::new(None),
            kill_escalated: AtomicBool::new(false),
        })
    }

    /// Queue bytes for the child's stdin. Never blocks; strict FIFO with
    /// previous writes. Writes after exit are dropped silently.
    pub fn write(&self, data: &[u8]) {
        if !self.running() {
            return;
        }
        let _ = self.write_tx.send(data.to_vec());
    }

    /// Apply a window-size ioctl to the master. Unchanged values are skipped.
    pub fn set_winsize(&self, rows: u16, cols: u16, hpix: u16, vpix: u16) -> Result<(), PtyError> {
        let mut last = self.last_winsize.lock().expect("winsize lock");
        if *last == Some((rows, cols, hpix, vpix)) {
            return Ok(());
        }
        self.master
            .lock()
            .expect("master lock")
            .resize(PtySize {
                rows,
                cols,
                pixel_width: hpix,
                pixel_height: vpix,
            })
            .map_err(|e| PtyError::Resize(e.to_string()))?;
        *last = Some((rows, cols, hpix, vpix));
        Ok(())
    }

    /// Signal the child to exit: SIGHUP, SIGTERM, then SIGKILL after a short
    /// grace. Idempotent; a no-op once the child has been reaped.
    pub fn terminate(&self) {
        if !self.running() || self.child_pid <= 0 {
            return;
        }
        // Interactive shells ignore SIGTERM but honor SIGHUP.
        unsafe {
            libc::kill(self.child_pid, libc::SIGHUP);
            libc::kill(self.child_pid, libc::SIGTERM);
        }
        if self.kill_escalated.swap(true, Ordering::SeqCst) {
            return;
        }
        let pid = self.child_pid;
        let state = self.state.clone();
        std::thread::spawn(move || {
            std::thread::sleep(KILL_GRACE);
            if state.running.load(Ordering::SeqCst) {
                warn!(pid, "child ignored termination signals, killing");
                unsafe {
                    libc::kill(pid, libc::SIGKILL);
                }
            }
        });
    }

    pub fn running(&self) -> bool {
        self.state.running.load(Ordering::SeqCst)
    }

    /// The child's exit code, once reaped.
    pub fn return_code(&self) -> Option<i32> {
        *self.state.return_code.lock().expect("return code lock")
    }
}

impl Drop for PtyProcess {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// True when `program` names an existing file, directly or via `PATH`.
fn program_exists(program: &str) -> bool {
    if program.contains('/') {
        return std::path::Path::new(program).exists();
    }
    std::env::var_os("PATH")
        .map(|path| {
            std::env::split_paths(&path).any(|dir| dir.join(program).exists())
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc as std_mpsc;

    fn strings(argv: &[&str]) -> Vec<String> {
        argv.iter().map(|s| s.to_string()).collect()
    }

    fn wait_exit(rx: &std_mpsc::Receiver<i32>) -> i32 {
        rx.recv_timeout(Duration::from_secs(10)).expect("child exit")
    }

    #[test]
    fn echo_child_reports_stdout_and_exit() {
        let (out_tx, out_rx) = std_mpsc::channel::<Vec<u8>>();
        let (exit_tx, exit_rx) = std_mpsc::channel::<i32>();
        let process = PtyProcess::spawn(
            &strings(&["/bin/echo", "hello"]),
            None,
            4096,
            move |chunk| {
                let _ = out_tx.send(chunk.to_vec());
            },
            move |code| {
                let _ = exit_tx.send(code);
            },
        )
        .unwrap();

        assert_eq!(wait_exit(&exit_rx), 0);
        assert!(!process.running());
        assert_eq!(process.return_code(), Some(0));

        let mut output = Vec::new();
        while let Ok(chunk) = out_rx.recv_timeout(Duration::from_millis(500)) {
            output.extend_from_slice(&chunk);
        }
        assert!(String::from_utf8_lossy(&output).contains("hello"));
    }

    #[test]
    fn cat_child_echoes_written_bytes() {
        let (out_tx, out_rx) = std_mpsc::channel::<Vec<u8>>();
        let (exit_tx, exit_rx) = std_mpsc::channel::<i32>();
        let process = PtyProcess::spawn(
            &strings(&["/bin/cat"]),
            Some("xterm"),
            4096,
            move |chunk| {
                let _ = out_tx.send(chunk.to_vec());
            },
            move |code| {
                let _ = exit_tx.send(code);
            },
        )
        .unwrap();

        process.write(b"roundtrip\n");
        let mut output = Vec::new();
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while !String::from_utf8_lossy(&output).contains("roundtrip") {
            let remaining = deadline
                .saturating_duration_since(std::time::Instant::now())
                .max(Duration::from_millis(1));
            let chunk = out_rx.recv_timeout(remaining).expect("echoed output");
            output.extend_from_slice(&chunk);
        }

        process.terminate();
        wait_exit(&exit_rx);
        assert!(!process.running());
    }

    #[test]
    fn terminate_is_idempotent_after_exit() {
        let (exit_tx, exit_rx) = std_mpsc::channel::<i32>();
        let process = PtyProcess::spawn(
            &strings(&["/bin/true"]),
            None,
            4096,
            |_| {},
            move |code| {
                let _ = exit_tx.send(code);
            },
        )
        .unwrap();
        wait_exit(&exit_rx);
        process.terminate();
        process.terminate();
        assert_eq!(process.return_code(), Some(0));
    }

    #[test]
    fn spawn_failure_reports_255() {
        let (exit_tx, exit_rx) = std_mpsc::channel::<i32>();
        let result = PtyProcess::spawn(
            &strings(&["/nonexistent/binary"]),
            None,
            4096,
            |_| {},
            move |code| {
                let _ = exit_tx.send(code);
            },
        );
        assert!(result.is_err());
        assert_eq!(wait_exit(&exit_rx), SPAWN_FAILURE_CODE);
    }

    #[test]
    fn winsize_change_is_observed_by_child() {
        let (out_tx, out_rx) = std_mpsc::channel::<Vec<u8>>();
        let (exit_tx, exit_rx) = std_mpsc::channel::<i32>();
        let process = PtyProcess::spawn(
            &strings(&["/bin/sh", "-c", "sleep 0.3; stty size"]),
            None,
            4096,
            move |chunk| {
                let _ = out_tx.send(chunk.to_vec());
            },
            move |code| {
                let _ = exit_tx.send(code);
            },
        )
        .unwrap();
        process.set_winsize(40, 120, 0, 0).unwrap();

        wait_exit(&exit_rx);
        let mut output = Vec::new();
        while let Ok(chunk) = out_rx.recv_timeout(Duration::from_millis(500)) {
            output.extend_from_slice(&chunk);
        }
        assert!(String::from_utf8_lossy(&output).contains("40 120"));
    }
}
