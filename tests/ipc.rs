mod common;

use std::path::PathBuf;
use std::sync::Arc;

use common::{temp_socket, wait_for_state};
use telemd::client::{ConnectionManager, ConnectionState, UnixTransport};
use telemd::error::{AuthError, ClientError};
use telemd::metrics::{DeviceMetrics, FixedMetrics};
use telemd::protocol::{RemoteError, ServerMessage};
use telemd::server::{CounterStore, IpcServer, PeerCredentialPolicy, TelemetryService, TrustDomain, TrustValidator};
use telemd::time::{Clock, SystemClock};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct Running {
    path: PathBuf,
    counters: Arc<CounterStore>,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

async fn start(tag: &str, policy: PeerCredentialPolicy, foreign_domain: bool) -> Running {
    let path = temp_socket(tag);
    let server = IpcServer::bind(&path, 0o600).unwrap();
    let mut domain = server.trust_domain().unwrap();
    if foreign_domain {
        domain = TrustDomain::new(domain.uid.wrapping_add(1));
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let validator = Arc::new(TrustValidator::new(
        Arc::new(policy),
        clock.clone(),
        "telemd.permission.ACCESS_ANALYTICS",
        domain,
        30_000,
    ));
    let counters = Arc::new(CounterStore::new(clock.clone()));
    let metrics: Arc<dyn DeviceMetrics> = Arc::new(FixedMetrics::new(80, 40.0, 20.0));
    let service = Arc::new(TelemetryService::new(validator, counters.clone(), metrics, clock));

    let shutdown = CancellationToken::new();
    let task = tokio::spawn(server.serve(service, shutdown.clone()));
    Running {
        path,
        counters,
        shutdown,
        task,
    }
}

fn open_policy() -> PeerCredentialPolicy {
    PeerCredentialPolicy::new(std::iter::empty(), true)
}

#[tokio::test]
async fn test_round_trip_over_socket() {
    let server = start("roundtrip", open_policy(), false).await;
    server.counters.increment(true);
    server.counters.increment(false);

    let manager = ConnectionManager::new(UnixTransport::new(&server.path));
    manager.connect().await.unwrap();

    let stats = manager.get_current_stats().await.unwrap();
    assert_eq!(stats.transaction_count, 2);
    assert_eq!(stats.failed_transactions, 1);
    assert_eq!(stats.battery_level, 80);
    assert!(manager.is_service_ready().await.unwrap());

    manager.reset_stats().await.unwrap();
    assert_eq!(server.counters.snapshot_counters().total, 0);

    manager.disconnect().await;
    server.shutdown.cancel();
    server.task.await.unwrap();
    assert!(!server.path.exists(), "socket file removed on shutdown");
}

#[tokio::test]
async fn test_missing_grant_is_denied_over_wire() {
    let server = start("denied", PeerCredentialPolicy::new(std::iter::empty(), false), false).await;
    let manager = ConnectionManager::new(UnixTransport::new(&server.path));
    manager.connect().await.unwrap();

    let err = manager.get_current_stats().await.unwrap_err();
    assert!(matches!(err, ClientError::Auth(AuthError::PermissionDenied)), "got {err:?}");
    // VERIFY: an authorization failure leaves the session up
    assert!(manager.state().is_connected());

    server.shutdown.cancel();
    server.task.await.unwrap();
}

#[tokio::test]
async fn test_foreign_domain_is_identity_mismatch() {
    let server = start("mismatch", open_policy(), true).await;
    let manager = ConnectionManager::new(UnixTransport::new(&server.path));
    manager.connect().await.unwrap();

    let err = manager.reset_stats().await.unwrap_err();
    assert!(matches!(err, ClientError::Auth(AuthError::IdentityMismatch)), "got {err:?}");

    server.shutdown.cancel();
    server.task.await.unwrap();
}

#[tokio::test]
async fn test_graceful_shutdown_disconnects_client() {
    let server = start("graceful", open_policy(), false).await;
    let manager = ConnectionManager::new(UnixTransport::new(&server.path));
    let mut states = manager.subscribe();
    manager.connect().await.unwrap();
    // One round trip so the server has accepted and is serving us
    manager.is_service_ready().await.unwrap();

    server.shutdown.cancel();
    wait_for_state(&mut states, |s| *s == ConnectionState::Disconnected).await;
    server.task.await.unwrap();
}

#[tokio::test]
async fn test_vanished_service_is_error() {
    let server = start("vanished", open_policy(), false).await;
    let manager = ConnectionManager::new(UnixTransport::new(&server.path));
    let mut states = manager.subscribe();
    manager.connect().await.unwrap();

    server.task.abort();
    let state = wait_for_state(&mut states, |s| matches!(s, ConnectionState::Error(_))).await;
    assert!(state.error_message().is_some());
}

#[tokio::test]
async fn test_connect_to_missing_socket_is_error() {
    let path = temp_socket("missing");
    let manager = ConnectionManager::new(UnixTransport::new(&path));

    let err = manager.connect().await.unwrap_err();
    assert!(matches!(err, ClientError::TransportFailure(_)));
    assert!(matches!(manager.state(), ConnectionState::Error(_)));
}

#[tokio::test]
async fn test_malformed_request_gets_fault_reply() {
    let server = start("malformed", open_policy(), false).await;
    let stream = UnixStream::connect(&server.path).await.unwrap();
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    write_half
        .write_all(b"{\"id\":5,\"method\":\"format_disk\"}\n")
        .await
        .unwrap();
    let line = lines.next_line().await.unwrap().unwrap();
    let reply: ServerMessage = serde_json::from_str(&line).unwrap();
    match reply {
        ServerMessage::Response {
            id: 5,
            outcome: Err(RemoteError::Fault(_)),
        } => {}
        other => panic!("expected fault for request 5, got {other:?}"),
    }

    // Garbage without an id ends the connection
    write_half.write_all(b"garbage\n").await.unwrap();
    assert!(lines.next_line().await.unwrap().is_none());

    server.shutdown.cancel();
    server.task.await.unwrap();
}

#[tokio::test]
async fn test_bind_replaces_stale_socket_file() {
    let path = temp_socket("stale");
    // Bound then dropped: the file stays behind with nobody listening
    drop(std::os::unix::net::UnixListener::bind(&path).unwrap());
    assert!(path.exists());

    let server = IpcServer::bind(&path, 0o600).unwrap();
    assert_eq!(server.socket_path(), path.as_path());
    drop(server);
    assert!(!path.exists());
}

#[tokio::test]
async fn test_bind_leaves_regular_file_alone() {
    let path = temp_socket("regular");
    std::fs::write(&path, b"not a socket").unwrap();

    let err = IpcServer::bind(&path, 0o600).err().expect("bind over a regular file must fail");
    assert_eq!(err.kind(), std::io::ErrorKind::AlreadyExists);
    assert_eq!(std::fs::read(&path).unwrap(), b"not a socket");
    std::fs::remove_file(&path).unwrap();
}

#[tokio::test]
async fn test_bind_refuses_live_socket() {
    let path = temp_socket("live");
    let live = std::os::unix::net::UnixListener::bind(&path).unwrap();

    let err = IpcServer::bind(&path, 0o600).err().expect("bind over a live socket must fail");
    assert_eq!(err.kind(), std::io::ErrorKind::AddrInUse);
    assert!(path.exists());

    drop(live);
    std::fs::remove_file(&path).unwrap();
}
