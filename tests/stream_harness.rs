use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use hitbtc_stream_sdk::retry::RetryPolicy;
use hitbtc_stream_sdk::stream::proto::{SubscribeRequest, CORRELATION_TOKEN_LEN};
use hitbtc_stream_sdk::stream::session::UserStreamSession;
use hitbtc_stream_sdk::{
    ConnectionState, Credentials, StreamClient, StreamClientError, Subscription,
};
use secrecy::SecretString;
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{sleep, timeout, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};

const WAIT: Duration = Duration::from_secs(5);

type VenueSocket = WebSocketStream<TcpStream>;

struct MockVenue {
    endpoint: String,
    accepted: Arc<AtomicUsize>,
    _task: JoinHandle<()>,
}

impl MockVenue {
    fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    fn client(&self) -> StreamClient {
        StreamClient::new().with_endpoint(self.endpoint.clone())
    }
}

/// Serves websocket connections on a loopback port. The handler receives
/// each upgraded socket with its 1-based connection number.
async fn spawn_venue<F, Fut>(handler: F) -> MockVenue
where
    F: Fn(VenueSocket, usize) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock venue listener");
    let addr = listener
        .local_addr()
        .expect("read mock venue listener address");
    let accepted = Arc::new(AtomicUsize::new(0));
    let handler = Arc::new(handler);

    let task = tokio::spawn({
        let accepted = Arc::clone(&accepted);
        async move {
            while let Ok((stream, _)) = listener.accept().await {
                let number = accepted.fetch_add(1, Ordering::SeqCst) + 1;
                let handler = Arc::clone(&handler);
                tokio::spawn(async move {
                    if let Ok(socket) = accept_async(stream).await {
                        handler(socket, number).await;
                    }
                });
            }
        }
    });

    MockVenue {
        endpoint: format!("ws://{addr}/api/2/ws"),
        accepted,
        _task: task,
    }
}

async fn unused_endpoint() -> String {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind probe listener");
    let addr = listener.local_addr().expect("read probe address");
    drop(listener);
    format!("ws://{addr}/api/2/ws")
}

async fn recv_text(socket: &mut VenueSocket) -> Result<String, String> {
    loop {
        match socket.next().await {
            Some(Ok(Message::Text(text))) => return Ok(text),
            Some(Ok(Message::Ping(payload))) => {
                socket
                    .send(Message::Pong(payload))
                    .await
                    .map_err(|err| format!("failed to send pong: {err}"))?;
            }
            Some(Ok(Message::Pong(_))) => {}
            Some(Ok(Message::Close(_))) => {
                return Err("websocket closed before expected client request".to_string());
            }
            Some(Ok(_)) => return Err("received unexpected non-text websocket frame".to_string()),
            Some(Err(err)) => return Err(format!("websocket receive error: {err}")),
            None => return Err("websocket stream ended unexpectedly".to_string()),
        }
    }
}

async fn recv_request(socket: &mut VenueSocket) -> Result<SubscribeRequest, String> {
    let text = recv_text(socket).await?;
    serde_json::from_str(&text).map_err(|err| format!("failed to decode client request: {err}"))
}

async fn send_json(socket: &mut VenueSocket, value: Value) {
    socket
        .send(Message::Text(value.to_string()))
        .await
        .expect("send venue message");
}

/// Keeps reading so that pings are answered, until the client goes away.
async fn drain(socket: &mut VenueSocket) {
    while let Some(Ok(_)) = socket.next().await {}
}

async fn next_within(subscription: &mut Subscription) -> Option<Value> {
    timeout(WAIT, subscription.next())
        .await
        .expect("timed out waiting for subscription")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_acquires_share_one_connection() {
    let venue = spawn_venue(|mut socket, _| async move { drain(&mut socket).await }).await;
    let connection = venue.client().start();

    let mut acquires = JoinSet::new();
    for _ in 0..8 {
        let connection = connection.clone();
        acquires.spawn(async move { connection.acquire().await });
    }

    let mut ids = Vec::new();
    while let Some(joined) = acquires.join_next().await {
        ids.push(joined.expect("acquire task").expect("acquire"));
    }

    assert_eq!(ids.len(), 8);
    assert!(ids.iter().all(|id| *id == ids[0]));
    assert_eq!(venue.accepted(), 1);
    assert_eq!(connection.state(), ConnectionState::Open);
    assert_eq!(connection.acquire().await.expect("reacquire"), ids[0]);
    assert_eq!(venue.accepted(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn payloads_reach_only_listeners_of_their_method() {
    let venue = spawn_venue(|mut socket, _| async move {
        let request = recv_request(&mut socket).await.expect("subscribe request");
        assert_eq!(request.method, "subscribeTicker");
        send_json(&mut socket, json!({"method": "ticker", "params": {"seq": 1}})).await;
        send_json(&mut socket, json!({"method": "orderbook", "params": {"seq": 2}})).await;
        send_json(&mut socket, json!({"method": "ticker", "params": {"seq": 3}})).await;
        drain(&mut socket).await;
    })
    .await;
    let connection = venue.client().start();

    let mut ticker = connection.listen("ticker").await;
    let mut orderbook = connection.listen("orderbook").await;
    connection
        .subscribe("subscribeTicker", json!({"symbol": "ETHBTC"}))
        .await
        .expect("subscribe");

    assert_eq!(next_within(&mut ticker).await, Some(json!({"seq": 1})));
    assert_eq!(next_within(&mut orderbook).await, Some(json!({"seq": 2})));
    assert_eq!(next_within(&mut ticker).await, Some(json!({"seq": 3})));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn every_listener_of_a_name_gets_every_message_in_order() {
    let venue = spawn_venue(|mut socket, _| async move {
        recv_request(&mut socket).await.expect("subscribe request");
        for seq in 1..=3 {
            send_json(&mut socket, json!({"method": "ticker", "params": {"seq": seq}})).await;
        }
        drain(&mut socket).await;
    })
    .await;
    let connection = venue.client().start();

    let mut first = connection.listen("ticker").await;
    let mut second = connection.listen("ticker").await;
    assert_eq!(first.connection(), second.connection());
    connection
        .subscribe("subscribeTicker", json!({"symbol": "ETHBTC"}))
        .await
        .expect("subscribe");

    for listener in [&mut first, &mut second] {
        for seq in 1..=3 {
            assert_eq!(next_within(listener).await, Some(json!({"seq": seq})));
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unmatched_and_malformed_frames_do_not_stall_delivery() {
    let venue = spawn_venue(|mut socket, _| async move {
        recv_request(&mut socket).await.expect("subscribe request");
        socket
            .send(Message::Text("not json".to_string()))
            .await
            .expect("send garbage");
        send_json(&mut socket, json!({"jsonrpc": "2.0", "result": true, "id": "abc"})).await;
        send_json(&mut socket, json!({"method": "updateCandles", "params": {}})).await;
        send_json(&mut socket, json!([1, 2, 3])).await;
        socket
            .send(Message::Binary(vec![0xff, 0xfe]))
            .await
            .expect("send binary garbage");
        send_json(&mut socket, json!({"method": "ticker", "params": {"seq": 9}})).await;
        drain(&mut socket).await;
    })
    .await;
    let connection = venue.client().start();

    let mut ticker = connection.listen("ticker").await;
    connection
        .subscribe("subscribeTicker", json!({"symbol": "ETHBTC"}))
        .await
        .expect("subscribe");

    assert_eq!(next_within(&mut ticker).await, Some(json!({"seq": 9})));
    assert_eq!(connection.state(), ConnectionState::Open);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unanswered_probe_ends_sequences_and_closes_connection() {
    let venue = spawn_venue(|socket, _| async move {
        // Never read, so pings are never answered.
        sleep(Duration::from_secs(30)).await;
        drop(socket);
    })
    .await;
    let connection = venue
        .client()
        .with_receive_timeout(Duration::from_millis(150))
        .with_ping_timeout(Duration::from_millis(100))
        .start();

    let mut ticker = connection.listen("ticker").await;
    assert!(ticker.connection().is_some());
    let started = Instant::now();

    assert_eq!(next_within(&mut ticker).await, None);
    assert!(started.elapsed() >= Duration::from_millis(250));
    assert_eq!(connection.state(), ConnectionState::Closed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stalled_writes_end_sequences_and_close_connection() {
    let venue = spawn_venue(|socket, _| async move {
        // Never read, so the client's send buffer eventually fills.
        sleep(Duration::from_secs(30)).await;
        drop(socket);
    })
    .await;
    // Default receive timeout keeps the heartbeat out of the way; only the
    // write bound can end this session.
    let connection = venue
        .client()
        .with_ping_timeout(Duration::from_millis(100))
        .start();

    let mut ticker = connection.listen("ticker").await;
    assert!(ticker.connection().is_some());

    let payload = "x".repeat(1024 * 1024);
    let mut failure = None;
    for _ in 0..256 {
        let sent = timeout(
            WAIT,
            connection.subscribe("subscribeTicker", json!({"symbol": payload})),
        )
        .await
        .expect("subscribe must not block the worker");
        if let Err(err) = sent {
            failure = Some(err);
            break;
        }
    }

    assert!(matches!(failure, Some(StreamClientError::SendTimeout(_))));
    assert_eq!(next_within(&mut ticker).await, None);
    assert_eq!(connection.state(), ConnectionState::Closed);
    assert_eq!(venue.accepted(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn answered_probe_keeps_session_open() {
    let venue = spawn_venue(|mut socket, _| async move {
        recv_request(&mut socket).await.expect("subscribe request");
        let quiet = sleep(Duration::from_millis(500));
        tokio::pin!(quiet);
        loop {
            tokio::select! {
                frame = socket.next() => {
                    if !matches!(frame, Some(Ok(_))) {
                        return;
                    }
                }
                _ = &mut quiet => break,
            }
        }
        send_json(&mut socket, json!({"method": "ticker", "params": {"late": true}})).await;
        drain(&mut socket).await;
    })
    .await;
    let connection = venue
        .client()
        .with_receive_timeout(Duration::from_millis(100))
        .with_ping_timeout(Duration::from_millis(300))
        .start();

    let mut ticker = connection.listen("ticker").await;
    connection
        .subscribe("subscribeTicker", json!({"symbol": "ETHBTC"}))
        .await
        .expect("subscribe");

    assert_eq!(next_within(&mut ticker).await, Some(json!({"late": true})));
    assert_eq!(connection.state(), ConnectionState::Open);
    assert_eq!(venue.accepted(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn remote_close_ends_sequences() {
    let venue = spawn_venue(|mut socket, _| async move {
        recv_request(&mut socket).await.expect("subscribe request");
        let _ = socket.close(None).await;
        drain(&mut socket).await;
    })
    .await;
    let connection = venue.client().start();

    let mut ticker = connection.listen("ticker").await;
    connection
        .subscribe("subscribeTicker", json!({"symbol": "ETHBTC"}))
        .await
        .expect("subscribe");

    assert_eq!(next_within(&mut ticker).await, None);
    assert_eq!(connection.state(), ConnectionState::Closed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn resubscribing_keeps_one_interest_but_sends_every_frame() {
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    let venue = spawn_venue(move |mut socket, _| {
        let seen_tx = seen_tx.clone();
        async move {
            while let Ok(request) = recv_request(&mut socket).await {
                let _ = seen_tx.send(request);
            }
        }
    })
    .await;
    let connection = venue.client().start();

    let params = json!({"algo": "BASIC", "pKey": "user", "sKey": "secret"});
    connection
        .subscribe("login", params.clone())
        .await
        .expect("first subscribe");
    connection
        .subscribe("login", params.clone())
        .await
        .expect("second subscribe");

    assert_eq!(connection.interests().await.expect("interests"), vec!["login"]);

    let first = timeout(WAIT, seen_rx.recv())
        .await
        .expect("timed out waiting for first frame")
        .expect("venue channel closed");
    let second = timeout(WAIT, seen_rx.recv())
        .await
        .expect("timed out waiting for second frame")
        .expect("venue channel closed");
    for request in [&first, &second] {
        assert_eq!(request.method, "login");
        assert_eq!(request.params, params);
        assert_eq!(request.id.len(), CORRELATION_TOKEN_LEN);
        assert!(request.id.chars().all(|c| c.is_ascii_alphanumeric()));
    }
    assert_ne!(first.id, second.id);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn login_sends_basic_credentials_in_wire_order() {
    let (seen_tx, seen_rx) = oneshot::channel();
    let seen_tx = Arc::new(std::sync::Mutex::new(Some(seen_tx)));
    let venue = spawn_venue(move |mut socket, _| {
        let seen_tx = Arc::clone(&seen_tx);
        async move {
            let text = recv_text(&mut socket).await.expect("login frame");
            let sender = seen_tx.lock().ok().and_then(|mut slot| slot.take());
            if let Some(sender) = sender {
                let _ = sender.send(text);
            }
            drain(&mut socket).await;
        }
    })
    .await;
    let connection = venue.client().start();

    connection
        .login(&Credentials::new(
            "user",
            SecretString::new("secret".to_string()),
        ))
        .await
        .expect("login");

    let text = timeout(WAIT, seen_rx)
        .await
        .expect("timed out waiting for login frame")
        .expect("venue channel closed");
    assert!(text.starts_with(r#"{"method":"login","id":""#), "{text}");
    let request: SubscribeRequest = serde_json::from_str(&text).expect("decode login frame");
    assert_eq!(
        request.params,
        json!({"algo": "BASIC", "pKey": "user", "sKey": "secret"})
    );
    assert_eq!(connection.interests().await.expect("interests"), vec!["login"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn connect_failure_leaves_slot_empty() {
    let connection = StreamClient::new()
        .with_endpoint(unused_endpoint().await)
        .start();

    let err = connection.acquire().await.expect_err("nothing is listening");
    assert!(err.is_connect_failure());
    assert_eq!(connection.state(), ConnectionState::Closed);

    let mut ticker = connection.listen("ticker").await;
    assert!(ticker.connection().is_none());
    assert_eq!(next_within(&mut ticker).await, None);

    let err = connection
        .subscribe("subscribeTicker", json!({"symbol": "ETHBTC"}))
        .await
        .expect_err("still nothing is listening");
    assert!(err.is_connect_failure());
    assert_eq!(
        connection.interests().await.expect("interests"),
        vec!["subscribeTicker", "ticker"]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn listening_again_after_termination_uses_a_fresh_connection() {
    let venue = spawn_venue(|mut socket, number| async move {
        recv_request(&mut socket).await.expect("subscribe request");
        send_json(&mut socket, json!({"method": "ticker", "params": {"conn": number}})).await;
        let _ = socket.close(None).await;
        drain(&mut socket).await;
    })
    .await;
    let connection = venue.client().start();

    let mut first = connection.listen("ticker").await;
    connection
        .subscribe("subscribeTicker", json!({"symbol": "ETHBTC"}))
        .await
        .expect("first subscribe");
    assert_eq!(next_within(&mut first).await, Some(json!({"conn": 1})));
    assert_eq!(next_within(&mut first).await, None);

    let mut second = connection.listen("ticker").await;
    assert!(second.connection() > first.connection());
    connection
        .subscribe("subscribeTicker", json!({"symbol": "ETHBTC"}))
        .await
        .expect("second subscribe");
    assert_eq!(next_within(&mut second).await, Some(json!({"conn": 2})));
    assert_eq!(venue.accepted(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn explicit_close_ends_sequences_and_next_acquire_reconnects() {
    let venue = spawn_venue(|mut socket, _| async move { drain(&mut socket).await }).await;
    let connection = venue.client().start();

    let mut ticker = connection.listen("ticker").await;
    let first = ticker.connection().expect("connected");

    connection.close().await.expect("close");
    assert_eq!(next_within(&mut ticker).await, None);
    assert_eq!(connection.state(), ConnectionState::Closed);

    let second = connection.acquire().await.expect("reacquire");
    assert!(second > first);
    assert_eq!(venue.accepted(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dropping_every_handle_closes_the_connection() {
    let (closed_tx, closed_rx) = oneshot::channel();
    let closed_tx = Arc::new(std::sync::Mutex::new(Some(closed_tx)));
    let venue = spawn_venue(move |mut socket, _| {
        let closed_tx = Arc::clone(&closed_tx);
        async move {
            drain(&mut socket).await;
            let sender = closed_tx.lock().ok().and_then(|mut slot| slot.take());
            if let Some(sender) = sender {
                let _ = sender.send(());
            }
        }
    })
    .await;
    let connection = venue.client().start();
    connection.acquire().await.expect("acquire");

    drop(connection);

    timeout(WAIT, closed_rx)
        .await
        .expect("timed out waiting for the client to close")
        .expect("venue channel closed");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn user_stream_forwards_reports_and_resubscribes_after_close() {
    let venue = spawn_venue(|mut socket, number| async move {
        let login = recv_request(&mut socket).await.expect("login request");
        assert_eq!(login.method, "login");
        assert_eq!(
            login.params,
            json!({"algo": "BASIC", "pKey": "user", "sKey": "secret"})
        );
        let reports = recv_request(&mut socket).await.expect("reports request");
        assert_eq!(reports.method, "subscribeReports");
        assert_eq!(reports.params, json!({}));

        send_json(
            &mut socket,
            json!({"method": "report", "params": {"clientOrderId": format!("order-{number}")}}),
        )
        .await;
        let _ = socket.close(None).await;
        drain(&mut socket).await;
    })
    .await;
    let connection = venue.client().start();

    let mut handle = UserStreamSession::new(
        connection,
        Credentials::new("user", SecretString::new("secret".to_string())),
    )
    .with_retry_policy(RetryPolicy::no_retry())
    .with_resubscribe_delay(Duration::from_millis(50))
    .spawn();
    assert!(handle.last_recv_time().is_none());

    let first = timeout(WAIT, handle.recv()).await.expect("first report");
    assert_eq!(first, Some(json!({"clientOrderId": "order-1"})));
    assert!(handle.last_recv_time().is_some());

    let second = timeout(WAIT, handle.recv()).await.expect("second report");
    assert_eq!(second, Some(json!({"clientOrderId": "order-2"})));
    assert!(venue.accepted() >= 2);
}
