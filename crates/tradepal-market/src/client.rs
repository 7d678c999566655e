use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;

use crate::news::parse_rss_headlines;
use crate::quote::parse_chart_response;
use crate::{
    interpret_put_call_ratio, MarketConfig, MarketData, MarketDataError, OptionsSentiment,
    PriceQuote, PutCallSentiment, Result, MAX_HEADLINES,
};

const USER_AGENT: &str = "Mozilla/5.0 (compatible; TradePal/0.1; +https://tradepal.ai)";

/// Market data over HTTP: the public chart API and RSS feed, plus an optional
/// backend for aggregated news and options flow.
#[derive(Clone)]
pub struct MarketDataClient {
    http: Client,
    config: MarketConfig,
}

impl MarketDataClient {
    pub fn new(config: MarketConfig) -> Result<Self> {
        let http = Client::builder().user_agent(USER_AGENT).build()?;
        Ok(Self::with_client(http, config))
    }

    pub fn with_client(http: Client, config: MarketConfig) -> Self {
        Self { http, config }
    }

    fn backend_url(&self, path: &str) -> Result<String> {
        let base = self
            .config
            .backend_base_url
            .as_deref()
            .map(str::trim)
            .filter(|base| !base.is_empty())
            .ok_or(MarketDataError::Unavailable("backend"))?;
        Ok(format!("{}{}", base.trim_end_matches('/'), path))
    }

    async fn get_json(&self, url: &str, timeout_secs: u64) -> Result<Value> {
        let response = self
            .http
            .get(url)
            .timeout(Duration::from_secs(timeout_secs))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(MarketDataError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        Ok(response.json::<Value>().await?)
    }

    async fn backend_headlines(&self, symbol: &str) -> Result<Vec<String>> {
        let url = self.backend_url(&format!("/api/news/{symbol}"))?;
        let body = self.get_json(&url, self.config.news_timeout_secs).await?;
        let headlines: Vec<String> = body
            .get("headlines")
            .and_then(|v| v.as_array())
            .into_iter()
            .flatten()
            .filter_map(|item| {
                item.as_str()
                    .or_else(|| item.get("title").and_then(|v| v.as_str()))
                    .map(|s| s.trim().to_string())
            })
            .filter(|s| !s.is_empty())
            .take(MAX_HEADLINES)
            .collect();
        if headlines.is_empty() {
            return Err(MarketDataError::Malformed(format!(
                "no headlines returned for {symbol}"
            )));
        }
        Ok(headlines)
    }

    async fn rss_headlines(&self, symbol: &str) -> Result<Vec<String>> {
        let url = format!(
            "{}/rss/2.0/headline",
            self.config.news_rss_base_url.trim_end_matches('/')
        );
        let response = self
            .http
            .get(&url)
            .query(&[("s", symbol), ("region", "US"), ("lang", "en-US")])
            .timeout(Duration::from_secs(self.config.news_timeout_secs))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(MarketDataError::Status {
                status: status.as_u16(),
                url,
            });
        }
        let xml = response.text().await?;
        Ok(parse_rss_headlines(&xml, MAX_HEADLINES))
    }
}

#[async_trait]
impl MarketData for MarketDataClient {
    async fn quote(&self, symbol: &str) -> Result<PriceQuote> {
        let symbol = symbol.trim().to_ascii_uppercase();
        let url = format!(
            "{}/v8/finance/chart/{}",
            self.config.quote_base_url.trim_end_matches('/'),
            symbol
        );
        let response = self
            .http
            .get(&url)
            .query(&[("interval", "1m"), ("range", "1d"), ("includePrePost", "true")])
            .timeout(Duration::from_secs(self.config.quote_timeout_secs))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(MarketDataError::Status {
                status: status.as_u16(),
                url,
            });
        }
        let body = response.json::<Value>().await?;
        parse_chart_response(&symbol, &body, &self.config.sanity_overrides)
    }

    async fn headlines(&self, symbol: &str) -> Result<Vec<String>> {
        let symbol = symbol.trim().to_ascii_uppercase();
        match self.backend_headlines(&symbol).await {
            Ok(headlines) => return Ok(headlines),
            Err(MarketDataError::Unavailable(_)) => {}
            Err(err) => {
                tracing::debug!(symbol = %symbol, error = %err, "backend news failed, trying rss");
            }
        }
        self.rss_headlines(&symbol).await
    }

    async fn put_call_ratio(&self, symbol: &str) -> Result<PutCallSentiment> {
        let symbol = symbol.trim().to_ascii_uppercase();
        let url = self.backend_url(&format!("/api/stock/put-call-ratio/{symbol}"))?;
        let body = self.get_json(&url, self.config.options_timeout_secs).await?;
        if let Some(err) = body.get("error").and_then(|v| v.as_str()) {
            return Err(MarketDataError::Upstream(err.to_string()));
        }
        let ratio = body
            .get("ratio")
            .and_then(|v| v.as_f64())
            .ok_or_else(|| MarketDataError::Malformed("put/call ratio missing".to_string()))?;
        let interpretation = body
            .get("interpretation")
            .cloned()
            .and_then(|v| serde_json::from_value::<OptionsSentiment>(v).ok())
            .unwrap_or_else(|| interpret_put_call_ratio(ratio));
        Ok(PutCallSentiment {
            ratio,
            interpretation,
            summary: body
                .get("summary")
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .filter(|s| !s.trim().is_empty()),
        })
    }

    async fn unusual_activity(&self, symbol: &str) -> Result<String> {
        let symbol = symbol.trim().to_ascii_uppercase();
        let url = self.backend_url(&format!("/api/stock/unusual-activity/{symbol}"))?;
        let body = self.get_json(&url, self.config.options_timeout_secs).await?;
        if let Some(err) = body.get("error").and_then(|v| v.as_str()) {
            return Err(MarketDataError::Upstream(err.to_string()));
        }
        body.get("summary")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .ok_or_else(|| {
                MarketDataError::Malformed("unusual activity summary missing".to_string())
            })
    }
}
