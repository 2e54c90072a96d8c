//! Session tests over real loopback TCP.
//!
//! Local input is a `tokio::io::duplex` pipe the test types into, and the
//! display is an in-memory buffer the test polls.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use rchat::{EndpointOptions, Role, SessionEndpoint, SessionError, SharedDisplay, Termination, CANCEL_UNIT};
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};

const LIMIT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn quiet() -> EndpointOptions {
    EndpointOptions {
        bind_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
        silent: true,
        echo: false,
    }
}

fn display() -> SharedDisplay<Vec<u8>> {
    Arc::new(Mutex::new(Vec::new()))
}

async fn shown(display: &SharedDisplay<Vec<u8>>) -> String {
    String::from_utf8_lossy(&display.lock().await).into_owned()
}

/// Poll `display` until it shows `expected`.
async fn wait_for(display: &SharedDisplay<Vec<u8>>, expected: &str) {
    timeout(LIMIT, async {
        while shown(display).await != expected {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("display never showed {expected:?}"));
}

/// Type `text` one unit per write, like a user at a raw terminal.
async fn type_units(keys: &mut DuplexStream, text: &[u8]) {
    for unit in text {
        keys.write_all(&[*unit]).await.expect("type unit");
    }
}

/// A listening endpoint on an ephemeral loopback port, accepting in the
/// background. Resolves to the connected endpoint.
async fn listen() -> (tokio::task::JoinHandle<SessionEndpoint>, SocketAddr) {
    let mut endpoint = SessionEndpoint::new(quiet());
    let channel = endpoint.bind_listener(0).await.expect("bind listener");
    let addr = channel.local_addr();

    let accepting = tokio::spawn(async move {
        endpoint.accept_on(channel).await.expect("accept peer");
        endpoint
    });
    (accepting, addr)
}

async fn dial(addr: SocketAddr) -> SessionEndpoint {
    let mut endpoint = SessionEndpoint::new(quiet());
    timeout(LIMIT, endpoint.dial_as_initiator(&addr.ip().to_string(), addr.port()))
        .await
        .expect("dial timed out")
        .expect("dial failed");
    endpoint
}

// ---------------------------------------------------------------------------
// Setup
// ---------------------------------------------------------------------------

#[tokio::test]
async fn both_roles_connect_over_loopback() {
    let (accepting, addr) = listen().await;
    let client = dial(addr).await;
    let server = timeout(LIMIT, accepting).await.expect("accept timed out").unwrap();

    let server_side = server.connection().expect("server connection");
    let client_side = client.connection().expect("client connection");
    assert_eq!(server_side.role(), Role::Listener);
    assert_eq!(client_side.role(), Role::Initiator);
    assert_eq!(client_side.peer_addr(), addr);
}

#[tokio::test]
async fn both_roles_send_small_writes_immediately() {
    let (accepting, addr) = listen().await;
    let client = dial(addr).await;
    let server = timeout(LIMIT, accepting).await.expect("accept timed out").unwrap();

    assert!(server.connection().expect("server connection").nodelay());
    assert!(client.connection().expect("client connection").nodelay());
}

#[tokio::test]
async fn busy_port_fails_with_bind_error() {
    let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = taken.local_addr().unwrap().port();

    let mut endpoint = SessionEndpoint::new(quiet());
    let result = timeout(LIMIT, endpoint.accept_as_listener(port))
        .await
        .expect("bind on a busy port blocked");

    match result {
        Err(SessionError::Bind { addr, .. }) => assert_eq!(addr.port(), port),
        other => panic!("expected bind error, got {other:?}"),
    }
    assert!(!endpoint.is_connected());
}

#[tokio::test]
async fn unparsable_addresses_are_rejected() {
    for address in ["", "localhost", "not an ip", "256.0.0.1", "10.0.0", "127.0.0.1:8080"] {
        let mut endpoint = SessionEndpoint::new(quiet());
        let result = endpoint.dial_as_initiator(address, 8080).await;

        match result {
            Err(SessionError::InvalidAddress(given)) => assert_eq!(given, address),
            other => panic!("expected invalid address for {address:?}, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn refused_connection_fails_with_connect_error() {
    // Grab a free port, then close it again
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    let mut endpoint = SessionEndpoint::new(quiet());
    let result = timeout(LIMIT, endpoint.dial_as_initiator("127.0.0.1", port))
        .await
        .expect("connect timed out");

    assert!(matches!(result, Err(SessionError::Connect { .. })));
    assert!(result.unwrap_err().is_setup());
}

#[tokio::test]
async fn listener_admits_only_one_peer() {
    let (accepting, addr) = listen().await;
    let _client = dial(addr).await;
    let _server = timeout(LIMIT, accepting).await.expect("accept timed out").unwrap();

    // The listening channel is gone, a second peer is refused
    let second = TcpStream::connect(addr).await;
    assert!(second.is_err());
}

#[tokio::test]
async fn second_setup_on_connected_endpoint_fails() {
    let (accepting, addr) = listen().await;
    let mut client = dial(addr).await;
    let _server = timeout(LIMIT, accepting).await.expect("accept timed out").unwrap();

    let again = client.dial_as_initiator("127.0.0.1", addr.port()).await;
    assert!(matches!(again, Err(SessionError::AlreadyConnected(peer)) if peer == addr));
}

// ---------------------------------------------------------------------------
// Release
// ---------------------------------------------------------------------------

#[tokio::test]
async fn release_twice_is_harmless() {
    let (accepting, addr) = listen().await;
    let mut client = dial(addr).await;
    let server = timeout(LIMIT, accepting).await.expect("accept timed out").unwrap();

    assert!(client.release().await);
    assert!(!client.release().await);
    assert!(!client.is_connected());

    drop(server);
}

#[tokio::test]
async fn release_closes_the_connection_for_the_peer() {
    let (accepting, addr) = listen().await;
    let mut client = dial(addr).await;
    let mut server = timeout(LIMIT, accepting).await.expect("accept timed out").unwrap();

    client.release().await;

    let (_keys, input) = duplex(8);
    let end = timeout(LIMIT, server.run(input, display()))
        .await
        .expect("server did not notice the close")
        .unwrap();
    assert!(matches!(end, Termination::PeerClosed));
    assert!(!server.is_connected());
}

// ---------------------------------------------------------------------------
// Duplex sessions
// ---------------------------------------------------------------------------

#[tokio::test]
async fn units_sent_one_at_a_time_arrive_in_order() {
    let (accepting, addr) = listen().await;
    let mut client = dial(addr).await;
    let mut server = timeout(LIMIT, accepting).await.expect("accept timed out").unwrap();

    let screen = display();
    let (_server_keys, server_input) = duplex(8);
    let server_run = tokio::spawn({
        let screen = screen.clone();
        async move { server.run(server_input, screen).await }
    });

    let client_end = client.run(&b"hi\x03"[..], display()).await.unwrap();
    assert!(matches!(client_end, Termination::Cancelled));

    let server_end = timeout(LIMIT, server_run).await.expect("server kept running").unwrap().unwrap();
    assert!(matches!(server_end, Termination::PeerClosed));
    assert_eq!(shown(&screen).await, "hi");
}

#[tokio::test]
async fn peer_close_ends_session_without_local_input() {
    let (accepting, addr) = listen().await;
    let raw_peer = TcpStream::connect(addr).await.unwrap();
    let mut server = timeout(LIMIT, accepting).await.expect("accept timed out").unwrap();

    // Nobody ever types on this side
    let (_keys, input) = duplex(8);
    let session = tokio::spawn(async move {
        let end = server.run(input, display()).await;
        (end, server.is_connected())
    });

    drop(raw_peer);

    let (end, still_connected) = timeout(LIMIT, session).await.expect("session did not end").unwrap();
    assert!(matches!(end, Ok(Termination::PeerClosed)));
    assert!(!still_connected);
}

#[tokio::test]
async fn cancel_unit_closes_connection_once() {
    let (accepting, addr) = listen().await;
    let mut raw_peer = TcpStream::connect(addr).await.unwrap();
    let mut server = timeout(LIMIT, accepting).await.expect("accept timed out").unwrap();

    let (mut keys, input) = duplex(8);
    let session = tokio::spawn(async move {
        let end = server.run(input, display()).await;
        let released_again = server.release().await;
        (end, released_again)
    });

    type_units(&mut keys, b"ok").await;
    keys.write_all(&[CANCEL_UNIT]).await.unwrap();

    let (end, released_again) = timeout(LIMIT, session).await.expect("session did not end").unwrap();
    assert!(matches!(end, Ok(Termination::Cancelled)));
    assert!(!released_again);

    // The peer gets what was typed, then end of stream, and no cancel byte
    let mut received = Vec::new();
    timeout(LIMIT, raw_peer.read_to_end(&mut received))
        .await
        .expect("peer never saw the close")
        .unwrap();
    assert_eq!(received, b"ok");
}

#[tokio::test]
async fn hello_bye_end_to_end() {
    let (accepting, addr) = listen().await;
    let mut client = dial(addr).await;
    let mut server = timeout(LIMIT, accepting).await.expect("accept timed out").unwrap();

    let server_screen = display();
    let client_screen = display();
    let (mut server_keys, server_input) = duplex(8);
    let (mut client_keys, client_input) = duplex(8);

    let server_run = tokio::spawn({
        let screen = server_screen.clone();
        async move { server.run(server_input, screen).await }
    });
    let client_run = tokio::spawn({
        let screen = client_screen.clone();
        async move { client.run(client_input, screen).await }
    });

    type_units(&mut client_keys, b"hello").await;
    wait_for(&server_screen, "hello").await;

    type_units(&mut server_keys, b"bye").await;
    wait_for(&client_screen, "bye").await;

    client_keys.write_all(&[CANCEL_UNIT]).await.unwrap();

    let client_end = timeout(LIMIT, client_run).await.expect("client kept running").unwrap().unwrap();
    let server_end = timeout(LIMIT, server_run).await.expect("server kept running").unwrap().unwrap();
    assert!(matches!(client_end, Termination::Cancelled));
    assert!(matches!(server_end, Termination::PeerClosed));
}

#[tokio::test]
async fn echo_shows_sent_units_locally() {
    let (accepting, addr) = listen().await;
    let mut client = SessionEndpoint::new(EndpointOptions { echo: true, ..quiet() });
    client
        .dial_as_initiator(&addr.ip().to_string(), addr.port())
        .await
        .unwrap();
    let _server = timeout(LIMIT, accepting).await.expect("accept timed out").unwrap();

    let screen = display();
    let end = client.run(&b"yo\x03"[..], screen.clone()).await.unwrap();
    assert!(matches!(end, Termination::Cancelled));
    assert_eq!(shown(&screen).await, "yo");
}
