//! # Ticker Relay
//!
//! Serves a static dashboard and relays one upstream exchange ticker
//! WebSocket stream to every connected browser. New browsers are primed with
//! the most recent ticker so they render immediately.

#![forbid(unsafe_code)]

pub mod ticker_logic;

pub use ticker_logic::config::{Config, ConfigArgs, ConfigFileNote};
pub use ticker_logic::error::RelayError;
pub use ticker_logic::model::{ServerMessage, TickerRecord};
pub use ticker_logic::state::RelayState;
pub use ticker_logic::upstream::{FeedState, ReconnectPolicy, UpstreamFeed};
