use futures_util::{SinkExt, StreamExt};
use relay_server::ticker_logic::downstream;
use relay_server::{FeedState, ReconnectPolicy, RelayState, UpstreamFeed};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tokio_tungstenite::{
    accept_async, connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream,
};

type Browser = WebSocketStream<MaybeTlsStream<TcpStream>>;

const ETH_1: &str = r#"{"e":"24hrTicker","s":"ETHUSDT","c":"2261.40","P":"-0.55","h":"2300.00","l":"2240.10","v":"181234.5"}"#;
const ETH_2: &str = r#"{"e":"24hrTicker","s":"ETHUSDT","c":"2262.05","P":"-0.52","h":"2300.00","l":"2240.10","v":"181240.0"}"#;
const ETH_3: &str = r#"{"e":"24hrTicker","s":"ETHUSDT","c":"2270.00","P":"-0.17","h":"2300.00","l":"2240.10","v":"181301.9"}"#;

enum UpstreamCmd {
    Send(&'static str),
    /// Drop the socket without a close handshake.
    Drop,
}

/// A stand-in for the exchange. Each accepted connection is reported on
/// `accepted` and then driven by commands until told to drop.
async fn fake_upstream() -> (String, mpsc::UnboundedSender<UpstreamCmd>, mpsc::UnboundedReceiver<Instant>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/ws/ethusdt@ticker", listener.local_addr().unwrap());
    let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel();
    let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((tcp, _)) = listener.accept().await {
            let Ok(mut ws) = accept_async(tcp).await else { continue };
            let _ = accepted_tx.send(Instant::now());
            while let Some(cmd) = cmd_rx.recv().await {
                match cmd {
                    UpstreamCmd::Send(text) => {
                        if ws.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    UpstreamCmd::Drop => break,
                }
            }
        }
    });

    (url, cmd_tx, accepted_rx)
}

async fn next_text(browser: &mut Browser) -> String {
    loop {
        let msg = timeout(Duration::from_secs(5), browser.next())
            .await
            .expect("no message within 5s")
            .expect("stream ended")
            .expect("websocket error");
        if let Message::Text(text) = msg {
            return text.to_string();
        }
    }
}

async fn assert_silent(browser: &mut Browser) {
    assert!(
        timeout(Duration::from_millis(200), browser.next()).await.is_err(),
        "expected no message"
    );
}

async fn wait_for_clients(relay: &RelayState, n: usize) {
    timeout(Duration::from_secs(5), async {
        while relay.client_count() != n {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("client count never reached");
}

fn envelope(record: &str) -> String {
    format!(r#"{{"type":"ticker","data":{}}}"#, record)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn relays_primes_and_survives_upstream_drop() {
    let (upstream_url, upstream, mut accepted) = fake_upstream().await;

    let relay = RelayState::new();
    let (shutdown_tx, _) = broadcast::channel(1);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let static_dir = tempfile::tempdir().unwrap();
    std::fs::write(static_dir.path().join("index.html"), "<h1>ETH/USDT</h1>").unwrap();
    let server = tokio::spawn(downstream::serve(
        listener,
        relay.clone(),
        static_dir.path().to_path_buf(),
        shutdown_tx.subscribe(),
    ));

    let reconnect_delay = Duration::from_millis(500);
    let feed = Arc::new(UpstreamFeed::new(
        upstream_url,
        ReconnectPolicy { delay: reconnect_delay, max_attempts: None },
        relay.clone(),
    ));
    let mut feed_state = feed.subscribe_state();
    let feed_task = {
        let feed = feed.clone();
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move { feed.run(shutdown).await })
    };

    let first_accept = accepted.recv().await.unwrap();
    feed_state.wait_for(|s| *s == FeedState::Open).await.unwrap();

    // A browser that connects before any ticker hears nothing.
    let (mut early, _) = connect_async(format!("ws://{}/", addr)).await.unwrap();
    wait_for_clients(&relay, 1).await;
    assert_silent(&mut early).await;

    // Malformed upstream payloads are dropped; valid ones are relayed verbatim.
    upstream.send(UpstreamCmd::Send("{\"c\": ")).unwrap();
    upstream.send(UpstreamCmd::Send(ETH_1)).unwrap();
    assert_eq!(next_text(&mut early).await, envelope(ETH_1));
    assert_silent(&mut early).await;

    // A late browser is primed with exactly the latest ticker.
    let (mut late, _) = connect_async(format!("ws://{}/", addr)).await.unwrap();
    assert_eq!(next_text(&mut late).await, envelope(ETH_1));
    wait_for_clients(&relay, 2).await;

    upstream.send(UpstreamCmd::Send(ETH_2)).unwrap();
    assert_eq!(next_text(&mut early).await, envelope(ETH_2));
    assert_eq!(next_text(&mut late).await, envelope(ETH_2));

    // Abnormal upstream close: health stays ok, reconnect waits the full delay.
    upstream.send(UpstreamCmd::Drop).unwrap();
    feed_state.wait_for(|s| *s == FeedState::Closed).await.unwrap();

    let health = reqwest::get(format!("http://{}/health", addr)).await.unwrap();
    assert_eq!(health.status(), 200);
    assert_eq!(health.text().await.unwrap(), r#"{"status":"ok"}"#);

    let second_accept = timeout(Duration::from_secs(5), accepted.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(second_accept - first_accept >= reconnect_delay);
    feed_state.wait_for(|s| *s == FeedState::Open).await.unwrap();

    // Browsers stay connected across the upstream outage.
    upstream.send(UpstreamCmd::Send(ETH_3)).unwrap();
    assert_eq!(next_text(&mut early).await, envelope(ETH_3));
    assert_eq!(next_text(&mut late).await, envelope(ETH_3));
    assert_eq!(relay.latest().unwrap().as_json(), ETH_3);

    // A browser that leaves is dropped from the registry.
    late.close(None).await.unwrap();
    wait_for_clients(&relay, 1).await;

    let index = reqwest::get(format!("http://{}/", addr)).await.unwrap();
    assert_eq!(index.text().await.unwrap(), "<h1>ETH/USDT</h1>");

    early.close(None).await.unwrap();
    wait_for_clients(&relay, 0).await;

    shutdown_tx.send(()).unwrap();
    let attempts = timeout(Duration::from_secs(5), feed_task).await.unwrap().unwrap();
    assert_eq!(attempts, 2);
    timeout(Duration::from_secs(5), server)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}
