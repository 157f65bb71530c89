//! End-to-end scenarios: a listener and a client node wired over loopback
//! TCP, with real child processes in real PTYs.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use serde_json::json;
use tokio::sync::mpsc;

use rnsh::client::{self, ClientConfig};
use rnsh::listener::{Listener, ListenerConfig};
use rnsh::protocol::{Request, Response, TermState, DATA_AVAIL_MSG, REQUEST_PATH};
use rnsh::transport::{
    AddressHash, Identity, Link, LinkStatus, ReceiptStatus, Transport, TransportConfig,
    TransportEvent,
};

const DEADLINE: Duration = Duration::from_secs(15);

fn strings(argv: &[&str]) -> Vec<String> {
    argv.iter().map(|s| s.to_string()).collect()
}

async fn start_listener(
    command: &[&str],
    allow_all: bool,
    allowed: Vec<AddressHash>,
) -> (AddressHash, SocketAddr) {
    let identity = Identity::generate();
    let (transport, events) = Transport::start(
        &identity,
        TransportConfig {
            bind: Some("127.0.0.1:0".to_string()),
            peers: vec![],
        },
    )
    .await
    .expect("listener transport");
    let addr = transport.local_addr().expect("bound address");
    let listener = Listener::new(
        transport,
        ListenerConfig {
            command: strings(command),
            service_name: "default".to_string(),
            allow_all,
            allowed,
            announce: true,
        },
    );
    let destination = listener.destination();
    tokio::spawn(listener.run(events));
    (destination, addr)
}

async fn start_client(
    addr: SocketAddr,
) -> (
    Identity,
    Transport,
    mpsc::UnboundedReceiver<TransportEvent>,
) {
    let identity = Identity::generate();
    let (transport, events) = Transport::start(
        &identity,
        TransportConfig {
            bind: None,
            peers: vec![addr.to_string()],
        },
    )
    .await
    .expect("client transport");
    (identity, transport, events)
}

async fn establish(
    transport: &Transport,
    destination: AddressHash,
    identify_as: Option<&Identity>,
) -> Link {
    let deadline = Instant::now() + DEADLINE;
    while !transport.has_path(destination) {
        assert!(Instant::now() < deadline, "path discovery timed out");
        transport.request_path(destination);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let link = transport.establish_link(destination).expect("link");
    let mut status = link.status_watch();
    tokio::time::timeout(DEADLINE, status.wait_for(|s| *s == LinkStatus::Active))
        .await
        .expect("link activation timed out")
        .expect("status watch");
    if let Some(identity) = identify_as {
        link.identify(identity);
    }
    link
}

fn request_tuple(stdin: Option<&[u8]>, winsize: Option<(u16, u16)>) -> serde_json::Value {
    Request {
        stdin: stdin.map(|raw| raw.to_vec()),
        term: Some("xterm".to_string()),
        term_state: TermState {
            attrs: json!([0, 0, 0, 0]),
            rows: winsize.map(|w| w.0),
            cols: winsize.map(|w| w.1),
            hpix: winsize.map(|_| 0),
            vpix: winsize.map(|_| 0),
        },
    }
    .to_value()
}

async fn exchange(link: &Link, data: serde_json::Value) -> Response {
    let mut receipt = link.request(REQUEST_PATH, data);
    let status = receipt.wait(Duration::from_secs(10)).await;
    assert_eq!(status, ReceiptStatus::Delivered, "request not answered");
    Response::from_value(&receipt.response().expect("response value")).expect("decodable response")
}

/// Poll with empty requests, collecting stdout, until the child has exited
/// and the buffer is fully drained. Returns (output, return_code).
async fn drain_session(link: &Link) -> (Vec<u8>, Option<i32>) {
    let deadline = Instant::now() + DEADLINE;
    let mut output = Vec::new();
    loop {
        assert!(Instant::now() < deadline, "session did not finish in time");
        let response = exchange(link, request_tuple(None, Some((24, 80)))).await;
        if let Some(stdout) = &response.stdout {
            output.extend_from_slice(stdout);
        }
        if !response.running && response.ready_bytes == 0 {
            return (output, response.return_code);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

// A trivial command's output reaches the client and the exit is reported.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn echo_session_runs_to_completion() {
    let (destination, addr) = start_listener(&["/bin/echo", "hello"], true, vec![]).await;
    let (_identity, transport, _events) = start_client(addr).await;
    let link = establish(&transport, destination, None).await;

    let (output, return_code) = drain_session(&link).await;
    assert!(String::from_utf8_lossy(&output).contains("hello"));
    assert_eq!(return_code, Some(0));

    // The session is done: further responses repeat the terminal state.
    let again = exchange(&link, request_tuple(None, None)).await;
    assert!(!again.running);
    assert_eq!(again.return_code, Some(0));
    assert_eq!(again.ready_bytes, 0);

    link.teardown();
    transport.shutdown().await;
}

// Stdin sent in a request comes back out of `cat`.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cat_round_trips_stdin() {
    let (destination, addr) = start_listener(&["/bin/cat"], true, vec![]).await;
    let (_identity, transport, _events) = start_client(addr).await;
    let link = establish(&transport, destination, None).await;

    exchange(&link, request_tuple(Some(b"ABCDE\n"), Some((24, 80)))).await;

    let deadline = Instant::now() + DEADLINE;
    let mut output = Vec::new();
    while !String::from_utf8_lossy(&output).contains("ABCDE") {
        assert!(Instant::now() < deadline, "cat output did not arrive");
        let response = exchange(&link, request_tuple(None, None)).await;
        if let Some(stdout) = &response.stdout {
            output.extend_from_slice(stdout);
        }
        assert!(response.running);
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    link.teardown();
    transport.shutdown().await;
}

// Stdout crosses responses strictly in buffer order.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stdout_is_a_monotonically_consumed_prefix() {
    let (destination, addr) =
        start_listener(&["/bin/sh", "-c", "seq 1 3000"], true, vec![]).await;
    let (_identity, transport, _events) = start_client(addr).await;
    let link = establish(&transport, destination, None).await;

    let (output, return_code) = drain_session(&link).await;
    assert_eq!(return_code, Some(0));

    let text = String::from_utf8_lossy(&output).replace("\r\n", "\n");
    let expected: String = (1..=3000).map(|n| format!("{n}\n")).collect();
    assert_eq!(text, expected);

    link.teardown();
    transport.shutdown().await;
}

// An identity outside the allow-list is torn down after identifying.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn disallowed_identity_is_torn_down() {
    let permitted = Identity::generate();
    let (destination, addr) =
        start_listener(&["/bin/cat"], false, vec![permitted.hash()]).await;

    let (intruder, transport, _events) = start_client(addr).await;
    let link = establish(&transport, destination, Some(&intruder)).await;

    let mut status = link.status_watch();
    tokio::time::timeout(DEADLINE, status.wait_for(|s| *s == LinkStatus::Closed))
        .await
        .expect("link was not torn down")
        .expect("status watch");
    assert_eq!(link.status(), LinkStatus::Closed);

    transport.shutdown().await;
}

// An allowed identity gets served, and the exit code is reported.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn allowed_identity_sees_exit_code() {
    let permitted = Identity::generate();
    let (destination, addr) =
        start_listener(&["/bin/sh", "-c", "exit 7"], false, vec![permitted.hash()]).await;

    let (_other, transport, _events) = start_client(addr).await;
    // Identify with the permitted identity, not the transport's own.
    let link = establish(&transport, destination, Some(&permitted)).await;

    let (_output, return_code) = drain_session(&link).await;
    assert_eq!(return_code, Some(7));

    link.teardown();
    transport.shutdown().await;
}

// A winsize carried by a request reaches the child before it reads it.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn winsize_reaches_the_child() {
    let (destination, addr) = start_listener(
        &["/bin/sh", "-c", "sleep 0.4; stty size; sleep 30"],
        true,
        vec![],
    )
    .await;
    let (_identity, transport, _events) = start_client(addr).await;
    let link = establish(&transport, destination, None).await;

    exchange(&link, request_tuple(None, Some((40, 120)))).await;

    let deadline = Instant::now() + DEADLINE;
    let mut output = Vec::new();
    while !String::from_utf8_lossy(&output).contains("40 120") {
        assert!(Instant::now() < deadline, "stty output did not arrive");
        let response = exchange(&link, request_tuple(None, Some((40, 120)))).await;
        if let Some(stdout) = &response.stdout {
            output.extend_from_slice(stdout);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    link.teardown();
    transport.shutdown().await;
}

// A malformed destination hash fails before any link is opened.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn invalid_destination_fails_before_any_link() {
    let identity = Identity::generate();
    let (transport, events) = Transport::start(&identity, TransportConfig::default())
        .await
        .expect("transport");
    let err = client::run(
        transport.clone(),
        events,
        &identity,
        ClientConfig {
            destination: "abcd".to_string(),
            no_id: true,
            timeout: Duration::from_secs(1),
        },
    )
    .await
    .unwrap_err();
    assert!(err.msg.contains("hexadecimal characters"));
    transport.shutdown().await;
}

// Buffered stdout produces at least one and at most 15 notification
// packets carrying exactly "data available".
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn idle_client_is_notified_of_new_stdout() {
    let (destination, addr) = start_listener(&["/bin/cat"], true, vec![]).await;
    let (_identity, transport, mut events) = start_client(addr).await;
    let link = establish(&transport, destination, None).await;

    // Feed the child, then stop requesting so stdout stays buffered.
    exchange(&link, request_tuple(Some(b"wake me\n"), Some((24, 80)))).await;

    let mut packets = 0usize;
    let window = tokio::time::sleep(Duration::from_secs(3));
    tokio::pin!(window);
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(TransportEvent::Packet { payload, .. }) => {
                    assert_eq!(payload, DATA_AVAIL_MSG.as_bytes());
                    packets += 1;
                }
                Some(_) => {}
                None => break,
            },
            _ = &mut window => break,
        }
    }
    assert!(packets >= 1, "no notification arrived");
    assert!(packets <= 15, "notification burst exceeded the try limit");

    link.teardown();
    transport.shutdown().await;
}

// The full client loop: attach, relay, observe the remote exit code.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn client_loop_completes_an_echo_session() {
    let (destination, addr) = start_listener(&["/bin/echo", "end-to-end"], true, vec![]).await;
    let (identity, transport, events) = start_client(addr).await;

    let code = client::run(
        transport.clone(),
        events,
        &identity,
        ClientConfig {
            destination: destination.hex(),
            no_id: false,
            timeout: Duration::from_secs(10),
        },
    )
    .await
    .expect("client session");
    assert_eq!(code, 0);
    transport.shutdown().await;
}
