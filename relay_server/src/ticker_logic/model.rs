use axum::extract::ws::Utf8Bytes;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use std::fmt;

use crate::ticker_logic::error::RelayError;

/// A single upstream ticker payload.
///
/// The record is kept as the exact JSON text received, so what goes out to
/// browsers under `data` is byte-for-byte what the exchange sent.
#[derive(Debug, Clone, Serialize)]
#[serde(transparent)]
pub struct TickerRecord(Box<RawValue>);

impl TickerRecord {
    /// Parses an upstream payload. Any well-formed JSON value is accepted.
    pub fn parse(text: &str) -> Result<Self, RelayError> {
        serde_json::from_str::<Box<RawValue>>(text)
            .map(Self)
            .map_err(RelayError::Parse)
    }

    pub fn as_json(&self) -> &str {
        self.0.get()
    }

    /// Lossy typed view of the well-known Binance 24h ticker fields.
    /// Returns `None` when the record is not an object.
    pub fn summary(&self) -> Option<TickerSummary> {
        serde_json::from_str(self.0.get()).ok()
    }
}

impl PartialEq for TickerRecord {
    fn eq(&self, other: &Self) -> bool {
        self.as_json() == other.as_json()
    }
}

impl Eq for TickerRecord {}

/// Envelope for everything sent to browser clients:
/// `{"type":"ticker","data":<record>}`.
#[derive(Debug, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum ServerMessage<'a> {
    Ticker(&'a TickerRecord),
}

impl ServerMessage<'_> {
    /// Serializes into a text frame. Clones share one buffer.
    pub fn to_frame(&self) -> Result<Utf8Bytes, RelayError> {
        serde_json::to_string(self)
            .map(Utf8Bytes::from)
            .map_err(RelayError::Serialize)
    }
}

/// The fields of `<symbol>@ticker` that are worth a log line.
/// Binance sends all numeric values as strings.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct TickerSummary {
    #[serde(rename = "s")]
    pub symbol: Option<String>,
    #[serde(rename = "c")]
    pub last_price: Option<String>,
    #[serde(rename = "p")]
    pub price_change: Option<String>,
    #[serde(rename = "P")]
    pub price_change_percent: Option<String>,
    #[serde(rename = "h")]
    pub high: Option<String>,
    #[serde(rename = "l")]
    pub low: Option<String>,
    #[serde(rename = "v")]
    pub volume: Option<String>,
}

impl fmt::Display for TickerSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let field = |v: &Option<String>| v.clone().unwrap_or_else(|| "-".to_string());
        write!(
            f,
            "{} last={} change={} ({}%) high={} low={} vol={}",
            field(&self.symbol),
            field(&self.last_price),
            field(&self.price_change),
            field(&self.price_change_percent),
            field(&self.high),
            field(&self.low),
            field(&self.volume),
        )
    }
}
