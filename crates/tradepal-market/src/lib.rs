use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod client;
mod news;
mod quote;

pub use client::MarketDataClient;
pub use news::parse_rss_headlines;
pub use quote::{parse_chart_response, round_cents};

pub const MAX_HEADLINES: usize = 5;

#[derive(Debug, Error)]
pub enum MarketDataError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("upstream returned {status} for {url}")]
    Status { status: u16, url: String },
    #[error("no price data available for {0}")]
    NoPrice(String),
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("{0}")]
    Upstream(String),
    #[error("{0} source is not configured")]
    Unavailable(&'static str),
}

pub type Result<T> = std::result::Result<T, MarketDataError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MarketSession {
    Regular,
    Pre,
    Post,
    Closed,
}

impl MarketSession {
    pub fn is_live(self) -> bool {
        !matches!(self, MarketSession::Closed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MarketSession::Regular => "REGULAR",
            MarketSession::Pre => "PRE",
            MarketSession::Post => "POST",
            MarketSession::Closed => "CLOSED",
        }
    }
}

/// Resolved quote for one symbol. `change` is always `price - previous_close`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceQuote {
    pub symbol: String,
    pub price: f64,
    pub previous_close: f64,
    pub change: f64,
    pub change_percent: f64,
    pub high: f64,
    pub low: f64,
    pub volume: u64,
    pub market_state: MarketSession,
    pub is_real_time: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptionsSentiment {
    Bullish,
    Bearish,
    Neutral,
}

impl OptionsSentiment {
    pub fn as_str(self) -> &'static str {
        match self {
            OptionsSentiment::Bullish => "bullish",
            OptionsSentiment::Bearish => "bearish",
            OptionsSentiment::Neutral => "neutral",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PutCallSentiment {
    pub ratio: f64,
    pub interpretation: OptionsSentiment,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

/// High put volume relative to calls reads as hedging, so bearish.
pub fn interpret_put_call_ratio(ratio: f64) -> OptionsSentiment {
    if ratio > 1.5 {
        OptionsSentiment::Bearish
    } else if ratio < 0.5 {
        OptionsSentiment::Bullish
    } else {
        OptionsSentiment::Neutral
    }
}

/// Everything gathered for one symbol. Each source fails independently; a
/// failed quote leaves `quote` empty and records why in `quote_error`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketSnapshot {
    pub symbol: String,
    pub quote: Option<PriceQuote>,
    pub quote_error: Option<String>,
    pub headlines: Vec<String>,
    pub put_call: Option<PutCallSentiment>,
    pub unusual_activity: Option<String>,
}

/// Symbol-specific guard for a live price the quote feed is known to misreport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SanityOverride {
    pub symbol: String,
    pub max_live_price: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketConfig {
    pub quote_base_url: String,
    pub news_rss_base_url: String,
    pub backend_base_url: Option<String>,
    pub quote_timeout_secs: u64,
    pub news_timeout_secs: u64,
    pub options_timeout_secs: u64,
    pub sanity_overrides: Vec<SanityOverride>,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            quote_base_url: "https://query1.finance.yahoo.com".to_string(),
            news_rss_base_url: "https://feeds.finance.yahoo.com".to_string(),
            backend_base_url: None,
            quote_timeout_secs: 10,
            news_timeout_secs: 10,
            options_timeout_secs: 15,
            sanity_overrides: vec![SanityOverride {
                symbol: "TSLA".to_string(),
                max_live_price: 1000.0,
            }],
        }
    }
}

#[async_trait]
pub trait MarketData: Send + Sync {
    async fn quote(&self, symbol: &str) -> Result<PriceQuote>;

    async fn headlines(&self, symbol: &str) -> Result<Vec<String>>;

    async fn put_call_ratio(&self, symbol: &str) -> Result<PutCallSentiment>;

    async fn unusual_activity(&self, symbol: &str) -> Result<String>;

    /// Runs the requested fetchers concurrently and keeps whatever succeeded.
    /// With `with_context` unset only the quote is fetched.
    async fn snapshot(&self, symbol: &str, with_context: bool) -> MarketSnapshot {
        let mut snapshot = MarketSnapshot {
            symbol: symbol.to_string(),
            ..MarketSnapshot::default()
        };

        if !with_context {
            match self.quote(symbol).await {
                Ok(quote) => snapshot.quote = Some(quote),
                Err(err) => snapshot.quote_error = Some(err.to_string()),
            }
            return snapshot;
        }

        let (quote, headlines, put_call, unusual) = tokio::join!(
            self.quote(symbol),
            self.headlines(symbol),
            self.put_call_ratio(symbol),
            self.unusual_activity(symbol),
        );

        match quote {
            Ok(quote) => snapshot.quote = Some(quote),
            Err(err) => {
                tracing::warn!(symbol, error = %err, "quote fetch failed");
                snapshot.quote_error = Some(err.to_string());
            }
        }
        match headlines {
            Ok(headlines) => snapshot.headlines = headlines,
            Err(err) => tracing::debug!(symbol, error = %err, "headline fetch failed"),
        }
        match put_call {
            Ok(sentiment) => snapshot.put_call = Some(sentiment),
            Err(err) => tracing::debug!(symbol, error = %err, "put/call fetch failed"),
        }
        match unusual {
            Ok(summary) => snapshot.unusual_activity = Some(summary),
            Err(err) => tracing::debug!(symbol, error = %err, "unusual activity fetch failed"),
        }
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_call_interpretation_thresholds() {
        assert_eq!(interpret_put_call_ratio(1.8), OptionsSentiment::Bearish);
        assert_eq!(interpret_put_call_ratio(1.5), OptionsSentiment::Neutral);
        assert_eq!(interpret_put_call_ratio(0.9), OptionsSentiment::Neutral);
        assert_eq!(interpret_put_call_ratio(0.3), OptionsSentiment::Bullish);
    }

    #[test]
    fn market_config_defaults_guard_tsla() {
        let config = MarketConfig::default();
        assert_eq!(config.sanity_overrides.len(), 1);
        assert_eq!(config.sanity_overrides[0].symbol, "TSLA");
        assert_eq!(config.options_timeout_secs, 15);
    }

    #[test]
    fn market_config_partial_json_keeps_defaults() {
        let config: MarketConfig =
            serde_json::from_str(r#"{"backend_base_url":"http://localhost:8000"}"#)
                .expect("config");
        assert_eq!(config.backend_base_url.as_deref(), Some("http://localhost:8000"));
        assert_eq!(config.quote_timeout_secs, 10);
    }

    struct FailingQuote;

    #[async_trait]
    impl MarketData for FailingQuote {
        async fn quote(&self, symbol: &str) -> Result<PriceQuote> {
            Err(MarketDataError::NoPrice(symbol.to_string()))
        }
        async fn headlines(&self, _symbol: &str) -> Result<Vec<String>> {
            Ok(vec!["Shares climb after delivery beat".to_string()])
        }
        async fn put_call_ratio(&self, _symbol: &str) -> Result<PutCallSentiment> {
            Err(MarketDataError::Unavailable("backend"))
        }
        async fn unusual_activity(&self, _symbol: &str) -> Result<String> {
            Ok("Large call sweeps near the 250 strike".to_string())
        }
    }

    #[tokio::test]
    async fn snapshot_keeps_sources_that_succeeded() {
        let snapshot = FailingQuote.snapshot("TSLA", true).await;
        assert!(snapshot.quote.is_none());
        assert_eq!(
            snapshot.quote_error.as_deref(),
            Some("no price data available for TSLA")
        );
        assert_eq!(snapshot.headlines.len(), 1);
        assert!(snapshot.put_call.is_none());
        assert!(snapshot.unusual_activity.is_some());
    }

    #[tokio::test]
    async fn price_only_snapshot_skips_context_sources() {
        let snapshot = FailingQuote.snapshot("TSLA", false).await;
        assert!(snapshot.quote_error.is_some());
        assert!(snapshot.headlines.is_empty());
        assert!(snapshot.unusual_activity.is_none());
    }
}
