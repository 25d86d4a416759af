//! # Upstream Ticker Feed
//!
//! Keeps one connection to the exchange ticker stream alive for the lifetime of
//! the process. Each connection walks `Connecting -> Open -> Closed`; every way
//! of reaching `Closed` (close frame, stream end, transport error, failed
//! handshake) goes through the same path, which waits the fixed reconnect delay
//! and starts over. Parse failures are logged and never tear the connection
//! down.

use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};

use crate::ticker_logic::error::RelayError;
use crate::ticker_logic::model::TickerRecord;
use crate::ticker_logic::state::RelayState;

pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedState {
    Connecting,
    Open,
    Closed,
}

/// Fixed-delay reconnect policy. No backoff growth and no jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub delay: Duration,
    /// Total connection attempts before giving up. `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            delay: DEFAULT_RECONNECT_DELAY,
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    pub fn allows_retry(&self, attempts_made: u32) -> bool {
        self.max_attempts.is_none_or(|max| attempts_made < max)
    }
}

pub struct UpstreamFeed {
    url: String,
    policy: ReconnectPolicy,
    state: RelayState,
    feed_state: watch::Sender<FeedState>,
}

impl UpstreamFeed {
    pub fn new(url: impl Into<String>, policy: ReconnectPolicy, state: RelayState) -> Self {
        let (feed_state, _) = watch::channel(FeedState::Closed);
        Self {
            url: url.into(),
            policy,
            state,
            feed_state,
        }
    }

    /// Follows `Connecting -> Open -> Closed` transitions as they happen.
    pub fn subscribe_state(&self) -> watch::Receiver<FeedState> {
        self.feed_state.subscribe()
    }

    fn set_state(&self, next: FeedState) {
        self.feed_state.send_replace(next);
    }

    /// # Handle Payload
    ///
    /// Parses one upstream message and publishes it. On a parse error the
    /// snapshot is left as it was and nothing is broadcast.
    ///
    /// Returns the number of clients the record was queued for.
    pub fn handle_payload(&self, text: &str) -> Result<usize, RelayError> {
        let record = TickerRecord::parse(text)?;
        if log::log_enabled!(log::Level::Debug) {
            if let Some(summary) = record.summary() {
                log::debug!("Ticker {}", summary);
            }
        }
        self.state.publish(record)
    }

    fn on_message(&self, msg: Message) {
        let outcome = match msg {
            Message::Text(text) => self.handle_payload(text.as_str()),
            Message::Binary(data) => std::str::from_utf8(&data)
                .map_err(RelayError::from)
                .and_then(|text| self.handle_payload(text)),
            Message::Close(frame) => {
                log::info!("Upstream ticker feed sent close frame: {:?}", frame);
                return;
            }
            // tungstenite answers pings on its own.
            _ => return,
        };

        match outcome {
            Ok(delivered) => log::trace!("Relayed ticker to {} client(s)", delivered),
            Err(e) => log::error!("Error parsing upstream ticker message: {}", e),
        }
    }

    /// # Run
    ///
    /// Connect/read/reconnect loop. Returns only on shutdown or when the
    /// policy's attempt limit is reached, with the number of connection
    /// attempts made.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> u32 {
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;
            self.set_state(FeedState::Connecting);
            log::info!("Connecting to upstream ticker feed {} (attempt {})", self.url, attempts);

            let connected = tokio::select! {
                _ = shutdown.recv() => {
                    log::info!("Upstream feed shutting down before connect completed.");
                    self.set_state(FeedState::Closed);
                    return attempts;
                }
                res = connect_async(self.url.as_str()) => res,
            };

            match connected {
                Ok((ws_stream, _)) => {
                    self.set_state(FeedState::Open);
                    log::info!("Connected to upstream ticker feed");
                    let (mut write, mut read) = ws_stream.split();

                    loop {
                        tokio::select! {
                            _ = shutdown.recv() => {
                                log::info!("Upstream feed shutting down...");
                                let _ = write.close().await;
                                self.set_state(FeedState::Closed);
                                return attempts;
                            }
                            msg = read.next() => match msg {
                                Some(Ok(msg)) => self.on_message(msg),
                                Some(Err(e)) => {
                                    // Recovery is left to the close path below.
                                    log::error!("{}", RelayError::from(e));
                                    break;
                                }
                                None => break,
                            }
                        }
                    }
                }
                Err(e) => log::error!("Failed to connect to upstream ticker feed: {}", RelayError::from(e)),
            }

            self.set_state(FeedState::Closed);

            if !self.policy.allows_retry(attempts) {
                log::warn!("Upstream ticker connection closed. Giving up after {} attempt(s).", attempts);
                return attempts;
            }

            log::warn!(
                "Upstream ticker connection closed. Reconnecting in {}ms...",
                self.policy.delay.as_millis()
            );
            tokio::select! {
                _ = shutdown.recv() => {
                    log::info!("Upstream feed shutting down during reconnect delay.");
                    return attempts;
                }
                _ = sleep(self.policy.delay) => {}
            }
        }
    }
}
