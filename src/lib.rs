//! rnsh: a remote interactive shell tunneled over an identity-addressed
//! overlay network.
//!
//! A listener exposes a named service and runs a configured command in a
//! pseudo-terminal for each authenticated link. A client attaches the local
//! terminal to that remote PTY: keyboard input, terminal resizes, and the
//! TERM/termios state travel to the listener in request tuples; buffered
//! stdout travels back in response tuples. An unreliable "data available"
//! notification wakes the client between its 5-second polls.

pub mod client;
pub mod config;
pub mod listener;
pub mod protocol;
pub mod transport;

/// Application name, used to derive destination addresses.
pub const APP_NAME: &str = "rnsh";
