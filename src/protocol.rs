//! The request/response tuples of the PTY-relay protocol.
//!
//! Both tuples encode fields by position with `null` sentinels, and byte
//! fields travel as base64 because the serialization layer is not guaranteed
//! binary-transparent in every position. The layout is fixed:
//!
//! Request:  `[stdin, term, termios, rows, cols, hpix, vpix]`
//! Response: `[running, return_code, ready_bytes, stdout, timestamp]`
//!
//! A listener decodes requests conservatively (missing or odd-typed fields
//! become absent); a client treats a malformed response as a protocol error.

use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::{json, Value};

/// Payload of the out-of-band "come fetch stdout" notification packet.
pub const DATA_AVAIL_MSG: &str = "data available";

/// Request path the listener serves.
pub const REQUEST_PATH: &str = "data";

const REQUEST_IDX_STDIN: usize = 0;
const REQUEST_IDX_TERM: usize = 1;
const REQUEST_IDX_TIOS: usize = 2;
const REQUEST_IDX_ROWS: usize = 3;
const REQUEST_IDX_COLS: usize = 4;
const REQUEST_IDX_HPIX: usize = 5;
const REQUEST_IDX_VPIX: usize = 6;

const RESPONSE_IDX_RUNNING: usize = 0;
const RESPONSE_IDX_RETCODE: usize = 1;
const RESPONSE_IDX_RDYBYTE: usize = 2;
const RESPONSE_IDX_STDOUT: usize = 3;
const RESPONSE_IDX_TMSTAMP: usize = 4;
const RESPONSE_LEN: usize = 5;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid base64 field: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("malformed response")]
    MalformedResponse,
}

/// The terminal state a request carries: an opaque termios blob plus the
/// window geometry. Compared as a whole for change detection.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TermState {
    pub attrs: Value,
    pub rows: Option<u16>,
    pub cols: Option<u16>,
    pub hpix: Option<u16>,
    pub vpix: Option<u16>,
}

impl TermState {
    pub fn has_winsize(&self) -> bool {
        self.rows.is_some() && self.cols.is_some()
    }
}

/// One client → listener exchange: accumulated stdin plus terminal state.
#[derive(Debug, Clone, Default)]
pub struct Request {
    pub stdin: Option<Vec<u8>>,
    pub term: Option<String>,
    pub term_state: TermState,
}

impl Request {
    pub fn to_value(&self) -> Value {
        json!([
            self.stdin.as_ref().map(|raw| BASE64.encode(raw)),
            self.term.clone(),
            self.term_state.attrs.clone(),
            self.term_state.rows,
            self.term_state.cols,
            self.term_state.hpix,
            self.term_state.vpix,
        ])
    }

    /// Decode a request tuple. Missing or odd-typed fields become absent;
    /// only an undecodable stdin field is an error.
    pub fn from_value(value: &Value) -> Result<Self, ProtocolError> {
        let fields = match value.as_array() {
            Some(fields) => fields,
            None => return Ok(Self::default()),
        };
        let field = |idx: usize| fields.get(idx).cloned().unwrap_or(Value::Null);
        let dim = |idx: usize| field(idx).as_u64().map(|n| n as u16);

        let stdin = match field(REQUEST_IDX_STDIN) {
            Value::String(encoded) => Some(BASE64.decode(encoded.as_bytes())?),
            _ => None,
        };
        Ok(Self {
            stdin,
            term: field(REQUEST_IDX_TERM).as_str().map(str::to_string),
            term_state: TermState {
                attrs: field(REQUEST_IDX_TIOS),
                rows: dim(REQUEST_IDX_ROWS),
                cols: dim(REQUEST_IDX_COLS),
                hpix: dim(REQUEST_IDX_HPIX),
                vpix: dim(REQUEST_IDX_VPIX),
            },
        })
    }
}

/// One listener → client exchange: child liveness plus a drained slice of
/// buffered stdout.
#[derive(Debug, Clone)]
pub struct Response {
    pub running: bool,
    pub return_code: Option<i32>,
    pub ready_bytes: u64,
    pub stdout: Option<Vec<u8>>,
    pub timestamp: f64,
}

impl Response {
    /// The conservative response returned when request processing fails.
    pub fn default_now() -> Self {
        Self {
            running: false,
            return_code: None,
            ready_bytes: 0,
            stdout: None,
            timestamp: now(),
        }
    }

    pub fn to_value(&self) -> Value {
        json!([
            self.running,
            self.return_code,
            self.ready_bytes,
            self.stdout.as_ref().map(|raw| BASE64.encode(raw)),
            self.timestamp,
        ])
    }

    /// Decode a response tuple. The listener's `running` value is
    /// authoritative; an absent field reads as still-running so the client
    /// keeps draining rather than exiting early.
    pub fn from_value(value: &Value) -> Result<Self, ProtocolError> {
        let fields = value.as_array().ok_or(ProtocolError::MalformedResponse)?;
        if fields.len() < RESPONSE_LEN {
            return Err(ProtocolError::MalformedResponse);
        }
        let stdout = match &fields[RESPONSE_IDX_STDOUT] {
            Value::String(encoded) => Some(BASE64.decode(encoded.as_bytes())?),
            Value::Null => None,
            _ => return Err(ProtocolError::MalformedResponse),
        };
        Ok(Self {
            running: fields[RESPONSE_IDX_RUNNING].as_bool().unwrap_or(true),
            return_code: fields[RESPONSE_IDX_RETCODE].as_i64().map(|n| n as i32),
            ready_bytes: fields[RESPONSE_IDX_RDYBYTE].as_u64().unwrap_or(0),
            stdout,
            timestamp: fields[RESPONSE_IDX_TMSTAMP].as_f64().unwrap_or(0.0),
        })
    }
}

/// Seconds since the Unix epoch.
pub fn now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trip_preserves_non_null_fields() {
        let request = Request {
            stdin: Some(b"ls -la\n".to_vec()),
            term: Some("xterm-256color".to_string()),
            term_state: TermState {
                attrs: json!([1, 2, 3, 4, [0u8, 0u8, 0u8, 0u8, 0u8, 0u8, 0u8, 0u8]]),
                rows: Some(24),
                cols: Some(80),
                hpix: Some(640),
                vpix: Some(480),
            },
        };
        let wire = request.to_value();
        assert_eq!(wire.as_array().unwrap().len(), 7);
        let back = Request::from_value(&wire).unwrap();
        assert_eq!(back.stdin, request.stdin);
        assert_eq!(back.term, request.term);
        assert_eq!(back.term_state, request.term_state);
    }

    #[test]
    fn empty_request_round_trips_as_absent() {
        let wire = Request::default().to_value();
        let back = Request::from_value(&wire).unwrap();
        assert!(back.stdin.is_none());
        assert!(back.term.is_none());
        assert!(!back.term_state.has_winsize());
    }

    #[test]
    fn short_or_non_array_requests_decode_conservatively() {
        let back = Request::from_value(&json!({"not": "a tuple"})).unwrap();
        assert!(back.stdin.is_none());
        let back = Request::from_value(&json!(["aGk="])).unwrap();
        assert_eq!(back.stdin.as_deref(), Some(b"hi".as_ref()));
        assert!(back.term.is_none());
    }

    #[test]
    fn bad_stdin_base64_is_an_error() {
        assert!(Request::from_value(&json!(["not base64!!"])).is_err());
    }

    #[test]
    fn response_round_trip() {
        let response = Response {
            running: true,
            return_code: None,
            ready_bytes: 42,
            stdout: Some(b"hello\n".to_vec()),
            timestamp: 1_700_000_000.5,
        };
        let wire = response.to_value();
        assert_eq!(wire.as_array().unwrap().len(), RESPONSE_LEN);
        let back = Response::from_value(&wire).unwrap();
        assert!(back.running);
        assert_eq!(back.return_code, None);
        assert_eq!(back.ready_bytes, 42);
        assert_eq!(back.stdout, response.stdout);
        assert_eq!(back.timestamp, response.timestamp);
    }

    #[test]
    fn response_missing_running_reads_as_running() {
        let back = Response::from_value(&json!([null, null, 0, null, 0.0])).unwrap();
        assert!(back.running);
    }

    #[test]
    fn malformed_response_is_an_error() {
        assert!(Response::from_value(&json!("nope")).is_err());
        assert!(Response::from_value(&json!([false, 0])).is_err());
    }
}
