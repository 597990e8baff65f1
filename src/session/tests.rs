//! Session behaviour against an in-process server.
//!
//! All tests run on a paused clock, so timeouts, probes and reconnects are
//! driven by tokio's auto-advance instead of wall time.

use super::*;
use crate::notifications::handler;
use crate::protocol::VOLUME_CHANGED;
use crate::transport::memory::{self, MemoryServer};
use pretty_assertions::assert_eq;
use std::sync::Mutex as StdMutex;
use tokio::sync::mpsc::UnboundedReceiver;

/// Defaults, but with a probe that never fires so it stays out of frame counts.
fn quiet_config() -> SessionConfig {
    SessionConfig {
        probe_interval: Duration::from_secs(3600),
        ..SessionConfig::default()
    }
}

fn start(config: SessionConfig) -> (Session, MemoryServer, UnboundedReceiver<SessionEvent>) {
    let (transport, server) = memory::pair();
    let (tx, rx) = mpsc::unbounded_channel();
    let session = Session::start(transport, config, tx);
    (session, server, rx)
}

async fn connected(config: SessionConfig) -> (Session, MemoryServer, UnboundedReceiver<SessionEvent>) {
    let (session, server, mut events) = start(config);
    session.connect().await.unwrap();
    assert_eq!(events.recv().await, Some(SessionEvent::Initialized));
    assert_eq!(events.recv().await, Some(SessionEvent::Online));
    (session, server, events)
}

fn reply(request: &Value, result: Value) -> Value {
    json!({"jsonrpc": "2.0", "id": request["id"], "result": result})
}

fn spawn_call(
    session: &Session,
    method: &str,
    params: Value,
) -> tokio::task::JoinHandle<Result<Value, RpcError>> {
    let session = session.clone();
    let method = method.to_string();
    tokio::spawn(async move { session.call(&method, params).await })
}

#[tokio::test(start_paused = true)]
async fn test_call_before_connect_is_not_connected() {
    let (session, _server, _events) = start(quiet_config());
    assert_eq!(session.state(), ConnectionState::Disconnected);
    assert_eq!(
        session.call("Foo.Bar", json!({})).await,
        Err(RpcError::NotConnected)
    );
}

#[tokio::test(start_paused = true)]
async fn test_connect_reports_initialized_then_online() {
    let (session, server, mut events) = connected(quiet_config()).await;
    assert_eq!(session.state(), ConnectionState::Connected);
    assert!(server.is_open());

    // Connecting again is a no-op.
    session.connect().await.unwrap();
    assert_eq!(server.connect_attempts(), 1);
    assert!(events.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_call_resolves_with_result() {
    let (session, mut server, _events) = connected(quiet_config()).await;

    let call = spawn_call(&session, "Foo.Bar", json!({"x": 1}));
    let request = server.recv().await.unwrap();
    assert_eq!(request["jsonrpc"], "2.0");
    assert_eq!(request["method"], "Foo.Bar");
    assert_eq!(request["params"], json!({"x": 1}));

    server.push(reply(&request, json!(42)));
    assert_eq!(call.await.unwrap(), Ok(json!(42)));
}

#[tokio::test(start_paused = true)]
async fn test_each_request_gets_a_fresh_id() {
    let (session, mut server, _events) = connected(quiet_config()).await;

    let first = spawn_call(&session, "A.One", json!({}));
    let second = spawn_call(&session, "A.Two", json!({}));
    let a = server.recv().await.unwrap();
    let b = server.recv().await.unwrap();
    assert_ne!(a["id"], b["id"]);

    // Replies out of order still land on the right caller.
    let (one, two) = if a["method"] == "A.One" { (a, b) } else { (b, a) };
    server.push(reply(&two, json!("two")));
    server.push(reply(&one, json!("one")));
    assert_eq!(first.await.unwrap(), Ok(json!("one")));
    assert_eq!(second.await.unwrap(), Ok(json!("two")));
}

#[tokio::test(start_paused = true)]
async fn test_remote_error_is_returned_without_retry() {
    let (session, mut server, _events) = connected(quiet_config()).await;

    let call = spawn_call(&session, "Foo.Missing", json!({}));
    let request = server.recv().await.unwrap();
    server.push(json!({
        "jsonrpc": "2.0",
        "id": request["id"],
        "error": {"code": -32601, "message": "Method not found."}
    }));

    assert_eq!(
        call.await.unwrap(),
        Err(RpcError::Remote {
            code: -32601,
            message: "Method not found.".to_string(),
            data: None,
        })
    );

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(server.try_recv(), None);
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_request_is_retried_three_times_then_fails() {
    let (session, mut server, _events) = connected(quiet_config()).await;
    let started = Instant::now();

    let call = spawn_call(&session, "Foo.Slow", json!({"a": 1}));
    let mut ids = Vec::new();
    for _ in 0..=DEFAULT_CALL_RETRIES {
        let request = server.recv().await.unwrap();
        assert_eq!(request["method"], "Foo.Slow");
        assert_eq!(request["params"], json!({"a": 1}));
        ids.push(request["id"].as_u64().unwrap());
    }
    ids.dedup();
    assert_eq!(ids.len(), 4, "each resend uses a new id");

    assert_eq!(
        call.await.unwrap(),
        Err(RpcError::RetriesExhausted {
            method: "Foo.Slow".to_string(),
            attempts: 4,
        })
    );
    // Sends at 0s, 6s, 12s and 18s; the last one is swept at 24s.
    let elapsed = started.elapsed();
    assert!(
        elapsed >= Duration::from_secs(20) && elapsed <= Duration::from_secs(26),
        "gave up after {:?}",
        elapsed
    );
    assert_eq!(server.try_recv(), None);
}

#[tokio::test(start_paused = true)]
async fn test_fewer_retries_when_configured() {
    let config = SessionConfig {
        call_retries: 1,
        ..quiet_config()
    };
    let (session, mut server, _events) = connected(config).await;

    let call = spawn_call(&session, "Foo.Slow", json!({}));
    server.recv().await.unwrap();
    server.recv().await.unwrap();

    assert_eq!(
        call.await.unwrap(),
        Err(RpcError::RetriesExhausted {
            method: "Foo.Slow".to_string(),
            attempts: 2,
        })
    );
    assert_eq!(server.try_recv(), None);
}

#[tokio::test(start_paused = true)]
async fn test_late_reply_to_superseded_attempt_is_dropped() {
    let (session, mut server, _events) = connected(quiet_config()).await;

    let call = spawn_call(&session, "Foo.Slow", json!({}));
    let first = server.recv().await.unwrap();
    let second = server.recv().await.unwrap();

    server.push(reply(&first, json!("stale")));
    server.push(reply(&second, json!("fresh")));
    assert_eq!(call.await.unwrap(), Ok(json!("fresh")));
}

#[tokio::test(start_paused = true)]
async fn test_drop_fails_pending_and_reports_offline_once() {
    let (session, mut server, mut events) = connected(quiet_config()).await;

    let first = spawn_call(&session, "Foo.One", json!({}));
    let second = spawn_call(&session, "Foo.Two", json!({}));
    server.recv().await.unwrap();
    server.recv().await.unwrap();

    server.drop_connection();
    assert_eq!(first.await.unwrap(), Err(RpcError::NotConnected));
    assert_eq!(second.await.unwrap(), Err(RpcError::NotConnected));
    assert_eq!(events.recv().await, Some(SessionEvent::Offline));

    // Auto-retry brings it back; no second Initialized.
    assert_eq!(events.recv().await, Some(SessionEvent::Online));
    assert_eq!(server.connect_attempts(), 2);
    assert_eq!(session.state(), ConnectionState::Connected);
    assert!(events.try_recv().is_err());

    // Requests from the old connection are not replayed.
    assert_eq!(server.try_recv(), None);
}

#[tokio::test(start_paused = true)]
async fn test_failed_reconnects_do_not_repeat_offline() {
    let (_session, server, mut events) = connected(quiet_config()).await;

    server.set_auto_accept(false);
    server.drop_connection();
    assert_eq!(events.recv().await, Some(SessionEvent::Offline));

    for attempt in 2..=4 {
        while server.connect_attempts() < attempt {
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        server.refuse("still down");
    }
    assert!(events.try_recv().is_err());

    server.set_auto_accept(true);
    assert_eq!(events.recv().await, Some(SessionEvent::Online));
}

#[tokio::test(start_paused = true)]
async fn test_no_reconnect_when_auto_retry_is_off() {
    let config = SessionConfig {
        auto_retry: false,
        ..quiet_config()
    };
    let (session, server, mut events) = connected(config).await;

    server.drop_connection();
    assert_eq!(events.recv().await, Some(SessionEvent::Offline));
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(server.connect_attempts(), 1);
    assert_eq!(session.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_second_consecutive_missed_probe_forces_disconnect() {
    let (session, mut server, mut events) = connected(SessionConfig::default()).await;
    let started = Instant::now();

    // Probes go out at 5s and 10s. The first is swept as a miss at 12s.
    tokio::time::sleep(Duration::from_secs(13)).await;
    assert_eq!(session.state(), ConnectionState::Connected);
    assert!(events.try_recv().is_err());
    assert_eq!(server.recv().await.unwrap()["method"], "JSONRPC.Ping");
    assert_eq!(server.recv().await.unwrap()["method"], "JSONRPC.Ping");

    // The second miss is swept at 16s.
    session
        .wait_for_state(ConnectionState::Disconnected)
        .await
        .unwrap();
    let elapsed = started.elapsed();
    assert!(
        elapsed >= Duration::from_secs(15) && elapsed <= Duration::from_secs(17),
        "disconnected after {:?}",
        elapsed
    );
    assert_eq!(events.recv().await, Some(SessionEvent::Offline));
}

#[tokio::test(start_paused = true)]
async fn test_probe_reply_resets_missed_count() {
    let (session, mut server, mut events) = connected(SessionConfig::default()).await;

    // Ignore every other probe, so misses never come back to back.
    let responder = tokio::spawn(async move {
        let mut answer = false;
        while let Some(request) = server.recv().await {
            assert_eq!(request["method"], "JSONRPC.Ping");
            if answer {
                server.push(reply(&request, json!("pong")));
            }
            answer = !answer;
        }
    });

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(session.state(), ConnectionState::Connected);
    assert!(events.try_recv().is_err());
    responder.abort();
}

#[tokio::test(start_paused = true)]
async fn test_answered_probes_keep_connection() {
    let (session, mut server, mut events) = connected(SessionConfig::default()).await;

    let responder = tokio::spawn(async move {
        while let Some(request) = server.recv().await {
            assert_eq!(request["method"], "JSONRPC.Ping");
            server.push(reply(&request, json!("pong")));
        }
    });

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(session.state(), ConnectionState::Connected);
    assert!(events.try_recv().is_err());
    responder.abort();
}

#[tokio::test(start_paused = true)]
async fn test_malformed_and_unmatched_frames_are_dropped() {
    let (session, mut server, mut events) = connected(quiet_config()).await;

    server.push_raw("this is not json");
    server.push_raw("[1, 2, 3]");
    server.push(json!({"jsonrpc": "2.0", "id": 999, "result": "nobody asked"}));

    let call = spawn_call(&session, "Foo.Bar", json!({}));
    let request = server.recv().await.unwrap();
    server.push(reply(&request, json!(true)));
    assert_eq!(call.await.unwrap(), Ok(json!(true)));
    assert_eq!(session.state(), ConnectionState::Connected);
    assert!(events.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_notifications_reach_subscribers_in_order() {
    let (session, server, _events) = connected(quiet_config()).await;
    let (tx, mut rx) = mpsc::unbounded_channel();

    for tag in ["first", "second"] {
        let tx = tx.clone();
        session.subscribe(
            "Player.OnPlay",
            handler(move |data| {
                let _ = tx.send((tag, data.clone()));
            }),
        );
    }

    server.push(json!({
        "jsonrpc": "2.0",
        "method": "Player.OnPlay",
        "params": {"data": {"item": {}}, "sender": "xbmc"}
    }));

    assert_eq!(rx.recv().await, Some(("first", json!({"item": {}}))));
    assert_eq!(rx.recv().await, Some(("second", json!({"item": {}}))));
}

#[tokio::test(start_paused = true)]
async fn test_refused_connect_fails_without_offline() {
    let config = SessionConfig {
        auto_retry: false,
        ..quiet_config()
    };
    let (session, server, mut events) = start(config);
    server.set_auto_accept(false);

    let connect = {
        let session = session.clone();
        tokio::spawn(async move { session.connect().await })
    };
    session
        .wait_for_state(ConnectionState::Connecting)
        .await
        .unwrap();
    server.refuse("connection refused");

    assert_eq!(
        connect.await.unwrap(),
        Err(RpcError::ConnectFailed("connection refused".to_string()))
    );
    assert_eq!(session.state(), ConnectionState::Disconnected);
    assert!(events.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_close_drains_in_flight_requests() {
    let (session, mut server, mut events) = connected(quiet_config()).await;

    let call = spawn_call(&session, "Foo.Bar", json!({}));
    let request = server.recv().await.unwrap();

    let close = {
        let session = session.clone();
        tokio::spawn(async move { session.close().await })
    };
    session
        .wait_for_state(ConnectionState::Draining)
        .await
        .unwrap();
    assert_eq!(
        session.call("Foo.Late", json!({})).await,
        Err(RpcError::NotConnected)
    );

    server.push(reply(&request, json!("done")));
    assert_eq!(call.await.unwrap(), Ok(json!("done")));
    close.await.unwrap();

    assert_eq!(session.state(), ConnectionState::Disconnected);
    assert!(!server.is_open());
    assert_eq!(events.recv().await, Some(SessionEvent::Offline));

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(server.connect_attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_close_does_not_wait_for_unanswered_probe() {
    let (session, mut server, mut events) = connected(SessionConfig::default()).await;

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(server.recv().await.unwrap()["method"], "JSONRPC.Ping");

    tokio::time::timeout(Duration::from_secs(1), session.close())
        .await
        .expect("close waited on the probe");
    assert_eq!(session.state(), ConnectionState::Disconnected);
    assert_eq!(events.recv().await, Some(SessionEvent::Offline));
}

#[tokio::test(start_paused = true)]
async fn test_volume_is_polled_without_push() {
    let (session, mut server, _events) = start(quiet_config());
    server.set_push(false);
    session.connect().await.unwrap();

    let seen = Arc::new(StdMutex::new(Vec::new()));
    {
        let seen = Arc::clone(&seen);
        session.subscribe(
            VOLUME_CHANGED,
            handler(move |data| seen.lock().unwrap().push(data.clone())),
        );
    }

    let volumes = [
        json!({"volume": 50, "muted": false}),
        json!({"volume": 50, "muted": false}),
        json!({"volume": 60, "muted": false}),
    ];
    for volume in &volumes {
        let request = server.recv().await.unwrap();
        assert_eq!(request["method"], "Application.GetProperties");
        assert_eq!(request["params"], json!({"properties": ["volume", "muted"]}));
        server.push(reply(&request, volume.clone()));
    }
    // The next poll only goes out once the last reply was handled.
    server.recv().await.unwrap();

    assert_eq!(
        *seen.lock().unwrap(),
        vec![volumes[0].clone(), volumes[2].clone()]
    );
}

#[tokio::test(start_paused = true)]
async fn test_no_volume_poll_without_subscribers() {
    let (session, mut server, _events) = start(quiet_config());
    server.set_push(false);
    session.connect().await.unwrap();

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(server.try_recv(), None);
}

#[tokio::test(start_paused = true)]
async fn test_ping_measures_round_trip() {
    let (session, mut server, _events) = connected(quiet_config()).await;

    let ping = {
        let session = session.clone();
        tokio::spawn(async move { session.ping().await })
    };
    let request = server.recv().await.unwrap();
    assert_eq!(request["method"], "JSONRPC.Ping");
    tokio::time::sleep(Duration::from_millis(250)).await;
    server.push(reply(&request, json!("pong")));

    let latency = ping.await.unwrap().unwrap();
    assert!(latency >= Duration::from_millis(250));
}

#[test]
fn test_rpc_error_display() {
    assert_eq!(RpcError::NotConnected.to_string(), "Not connected");
    assert_eq!(
        RpcError::RetriesExhausted {
            method: "Foo.Bar".to_string(),
            attempts: 4
        }
        .to_string(),
        "Too many retries: Foo.Bar got no reply after 4 attempts"
    );
    let remote: RpcError = JsonRpcError {
        code: -32602,
        message: "Invalid params.".to_string(),
        data: None,
    }
    .into();
    assert_eq!(remote.to_string(), "Server error -32602: Invalid params.");
}
