mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{
    init_tracing, next_port, session_id, settings, Counterparty, RecordingApp, ACC01, ACC02, WAIT,
};
use fixg_acceptor::protocol::FixMsgType;
use fixg_acceptor::{Acceptor, AcceptorError, RetryPolicy, SessionSettings};

async fn acceptor(port: u16) -> (Acceptor, Arc<RecordingApp>) {
    init_tracing();
    let app = Arc::new(RecordingApp::default());
    let acceptor = Acceptor::new(app.clone(), &settings(port)).await.unwrap();
    (acceptor, app)
}

async fn started(port: u16) -> (Acceptor, Arc<RecordingApp>) {
    let (acceptor, app) = acceptor(port).await;
    acceptor.start_with_retry(RetryPolicy::default()).await.unwrap();
    (acceptor, app)
}

async fn logged_on(port: u16, comp_id: &str) -> Counterparty {
    let cp = Counterparty::connect_with_retry(port).await.unwrap();
    cp.send_logon(comp_id).await.unwrap();
    assert!(cp.wait_for_logon(comp_id, WAIT).await, "no logon reply for {}", comp_id);
    cp
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_acceptor_in_stopped_state_on_initialisation() {
    let port = next_port();
    let (acceptor, app) = acceptor(port).await;

    assert!(!acceptor.is_started());
    assert!(!acceptor.are_sockets_running());
    assert!(!acceptor.is_logged_on());
    assert_eq!(app.created(), vec![session_id(ACC01), session_id(ACC02)]);
    assert!(Counterparty::connect(port).await.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_started_acceptor_receives_connection() {
    let port = next_port();
    let (acceptor, app) = started(port).await;
    assert!(acceptor.is_started());
    assert!(acceptor.are_sockets_running());
    assert!(!acceptor.is_logged_on());

    let _cp = logged_on(port, ACC01).await;
    assert!(acceptor.wait_for_logon(&session_id(ACC01), WAIT).await);
    assert!(acceptor.is_logged_on());
    assert!(acceptor.registry().contains(&session_id(ACC01)));
    assert_eq!(app.logons(), vec![session_id(ACC01)]);

    acceptor.dispose().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_multiple_sessions_are_tracked_independently() {
    let port = next_port();
    let (acceptor, app) = started(port).await;

    let cp1 = logged_on(port, ACC01).await;
    let _cp2 = logged_on(port, ACC02).await;
    assert!(acceptor.wait_for_logon(&session_id(ACC01), WAIT).await);
    assert!(acceptor.wait_for_logon(&session_id(ACC02), WAIT).await);
    assert_eq!(acceptor.logged_on_sessions(), vec![session_id(ACC01), session_id(ACC02)]);

    cp1.send_logout(ACC01).await.unwrap();
    assert!(cp1.wait_for_disconnect(WAIT).await);
    assert!(acceptor.registry().wait_for_absence(&session_id(ACC01), WAIT).await);
    assert!(acceptor.wait_for_logout(&session_id(ACC01), WAIT).await);

    assert!(acceptor.registry().contains(&session_id(ACC02)));
    assert!(acceptor.is_logged_on());
    assert_eq!(app.logouts(), vec![session_id(ACC01)]);
    assert_eq!(cp1.received_types(), vec![FixMsgType::Logon, FixMsgType::Logout]);

    acceptor.dispose().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_can_stop_acceptor() {
    let port = next_port();
    let (acceptor, _app) = started(port).await;

    acceptor.stop(false).await.unwrap();
    assert!(!acceptor.is_started());
    assert!(!acceptor.are_sockets_running());
    assert!(!acceptor.is_logged_on());
    assert!(acceptor.local_addrs().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_graceful_stop_logs_off_counterparty() {
    let port = next_port();
    let (acceptor, app) = started(port).await;
    let cp = logged_on(port, ACC01).await;
    assert!(acceptor.wait_for_logon(&session_id(ACC01), WAIT).await);

    acceptor.stop(false).await.unwrap();

    assert!(cp.wait_for_disconnect(WAIT).await, "counterparty still connected");
    assert!(!acceptor.registry().contains(&session_id(ACC01)));
    assert!(!acceptor.is_logged_on());
    assert!(!acceptor.are_sockets_running());
    assert_eq!(app.logouts(), vec![session_id(ACC01)]);

    // The counterparty saw the acceptor's Logout, not just a dropped socket.
    assert_eq!(cp.received_types(), vec![FixMsgType::Logon, FixMsgType::Logout]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_forced_stop_disconnects_counterparty() {
    let port = next_port();
    let (acceptor, app) = started(port).await;
    let cp = logged_on(port, ACC01).await;
    assert!(acceptor.wait_for_logon(&session_id(ACC01), WAIT).await);

    acceptor.stop(true).await.unwrap();

    // Registry and application are settled before stop returns.
    assert!(!acceptor.registry().contains(&session_id(ACC01)));
    assert!(!acceptor.is_logged_on());
    assert_eq!(app.logouts(), vec![session_id(ACC01)]);

    assert!(cp.wait_for_disconnect(WAIT).await);
    assert!(!acceptor.are_sockets_running());
    assert_eq!(cp.received_types(), vec![FixMsgType::Logon]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_can_restart_acceptor_after_stopping() {
    let port = next_port();
    let (acceptor, _app) = started(port).await;

    acceptor.stop(false).await.unwrap();
    acceptor.start_with_retry(RetryPolicy::default()).await.unwrap();

    assert!(acceptor.is_started());
    assert!(acceptor.are_sockets_running());
    assert!(!acceptor.is_logged_on());
    acceptor.dispose().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_counterparty_can_logon_after_restart() {
    let port = next_port();
    let (acceptor, _app) = started(port).await;

    acceptor.stop(false).await.unwrap();
    acceptor.start_with_retry(RetryPolicy::default()).await.unwrap();
    assert!(acceptor.is_started());
    assert!(acceptor.are_sockets_running());

    let _cp = logged_on(port, ACC01).await;
    assert!(acceptor.wait_for_logon(&session_id(ACC01), WAIT).await);
    assert!(acceptor.registry().contains(&session_id(ACC01)));
    acceptor.dispose().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_counterparty_can_logon_again_after_graceful_stop() {
    let port = next_port();
    let (acceptor, app) = started(port).await;
    let first = logged_on(port, ACC01).await;
    assert!(acceptor.wait_for_logon(&session_id(ACC01), WAIT).await);

    acceptor.stop(false).await.unwrap();
    assert!(first.wait_for_disconnect(WAIT).await);
    acceptor.start_with_retry(RetryPolicy::default()).await.unwrap();
    assert!(acceptor.is_started());
    assert!(acceptor.are_sockets_running());

    let _second = logged_on(port, ACC01).await;
    assert!(acceptor.wait_for_logon(&session_id(ACC01), WAIT).await);
    assert!(acceptor.registry().contains(&session_id(ACC01)));
    assert_eq!(app.logons().len(), 2);
    acceptor.dispose().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_counterparty_can_logon_again_after_forced_stop() {
    let port = next_port();
    let (acceptor, _app) = started(port).await;
    let first = logged_on(port, ACC01).await;
    assert!(acceptor.wait_for_logon(&session_id(ACC01), WAIT).await);

    acceptor.stop(true).await.unwrap();
    assert!(first.wait_for_disconnect(WAIT).await);
    acceptor.start_with_retry(RetryPolicy::default()).await.unwrap();

    let _second = logged_on(port, ACC01).await;
    assert!(acceptor.wait_for_logon(&session_id(ACC01), Duration::from_secs(60)).await);
    assert!(acceptor.registry().wait_for_presence(&session_id(ACC01), WAIT).await);
    acceptor.dispose().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_double_start_is_rejected() {
    let port = next_port();
    let (acceptor, _app) = started(port).await;

    assert!(matches!(acceptor.start().await, Err(AcceptorError::AlreadyStarted(_))));
    assert!(acceptor.is_started());
    acceptor.dispose().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_port_in_use_is_a_bind_error() {
    let port = next_port();
    let _blocker = std::net::TcpListener::bind(("127.0.0.1", port)).unwrap();
    let (acceptor, _app) = acceptor(port).await;

    let err = acceptor.start().await.unwrap_err();
    assert!(matches!(err, AcceptorError::Bind { .. }), "{:?}", err);
    assert!(!acceptor.is_started());
    assert!(!acceptor.are_sockets_running());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unresolvable_host_is_an_address_error() {
    init_tracing();
    let json = r#"{
        "default": { "ConnectionType": "acceptor", "SocketAcceptHost": "no.such.host.invalid", "SocketAcceptPort": "55099" },
        "sessions": [ { "BeginString": "FIX.4.2", "SenderCompID": "dummy", "TargetCompID": "acc01" } ]
    }"#;
    let settings = SessionSettings::from_json_str(json).unwrap();
    let acceptor = Acceptor::new(Arc::new(RecordingApp::default()), &settings).await.unwrap();

    let err = acceptor.start().await.unwrap_err();
    assert!(matches!(err, AcceptorError::Address { .. }), "{:?}", err);
    assert!(!err.is_retryable());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_disposed_acceptor_cannot_start() {
    let port = next_port();
    let (acceptor, _app) = started(port).await;
    let cp = logged_on(port, ACC02).await;

    acceptor.dispose().await.unwrap();
    acceptor.dispose().await.unwrap();
    assert!(cp.wait_for_disconnect(WAIT).await);
    assert!(!acceptor.are_sockets_running());
    assert!(matches!(acceptor.start().await, Err(AcceptorError::Disposed)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unknown_counterparty_is_rejected() {
    let port = next_port();
    let (acceptor, app) = started(port).await;

    let cp = Counterparty::connect_with_retry(port).await.unwrap();
    cp.send_logon("stranger").await.unwrap();
    assert!(cp.wait_for_disconnect(WAIT).await);

    assert!(acceptor.registry().is_empty());
    assert!(app.logons().is_empty());
    let reply = cp.received();
    assert_eq!(reply.len(), 1);
    assert_eq!(reply[0].msg_type, FixMsgType::Logout);
    assert_eq!(reply[0].field(58), Some("Unknown session"));
    acceptor.dispose().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_disconnect_severs_one_session() {
    let port = next_port();
    let (acceptor, app) = started(port).await;
    let cp1 = logged_on(port, ACC01).await;
    let cp2 = logged_on(port, ACC02).await;
    assert!(acceptor.wait_for_logon(&session_id(ACC02), WAIT).await);

    assert!(acceptor.disconnect(&session_id(ACC01)));
    assert!(cp1.wait_for_disconnect(WAIT).await);
    assert!(acceptor.wait_for_logout(&session_id(ACC01), WAIT).await);

    assert!(cp2.is_connected());
    assert!(acceptor.registry().contains(&session_id(ACC02)));
    assert_eq!(app.logouts(), vec![session_id(ACC01)]);
    acceptor.dispose().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_new_acceptor_binds_after_previous_disposed() {
    let port = next_port();
    let (first, _app) = started(port).await;
    let cp = logged_on(port, ACC01).await;
    first.stop(true).await.unwrap();
    first.dispose().await.unwrap();
    assert!(cp.wait_for_disconnect(WAIT).await);
    drop(first);

    let (second, app) = started(port).await;
    let _cp = logged_on(port, ACC01).await;
    assert!(second.wait_for_logon(&session_id(ACC01), WAIT).await);
    assert_eq!(app.logons(), vec![session_id(ACC01)]);
    second.dispose().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_quick_relogon_survives_slow_logout_callback() {
    init_tracing();
    let port = next_port();
    let app = Arc::new(RecordingApp::with_logout_delay(Duration::from_millis(500)));
    let acceptor = Acceptor::new(app.clone(), &settings(port)).await.unwrap();
    acceptor.start_with_retry(RetryPolicy::default()).await.unwrap();

    let first = logged_on(port, ACC01).await;
    assert!(acceptor.wait_for_logon(&session_id(ACC01), WAIT).await);
    first.send_logout(ACC01).await.unwrap();
    assert!(acceptor.registry().wait_for_absence(&session_id(ACC01), WAIT).await);

    // The first logout callback is still sleeping while the session logs on again.
    let _second = logged_on(port, ACC01).await;
    assert!(acceptor.registry().wait_for_presence(&session_id(ACC01), WAIT).await);
    let callbacks_done = tokio::time::timeout(WAIT, async {
        while app.logouts().is_empty() || app.logons().len() < 2 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(callbacks_done.is_ok());

    assert!(acceptor.registry().contains(&session_id(ACC01)));
    assert!(acceptor.is_logged_on());
    assert_eq!(acceptor.logged_on_sessions(), vec![session_id(ACC01)]);
    acceptor.dispose().await.unwrap();
}
