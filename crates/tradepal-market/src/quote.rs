use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

use crate::{MarketDataError, MarketSession, PriceQuote, Result, SanityOverride};

pub fn round_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn positive(value: Option<f64>) -> Option<f64> {
    value.filter(|v| v.is_finite() && *v > 0.0)
}

fn last_intraday_close(result: &Value) -> Option<f64> {
    result
        .get("indicators")
        .and_then(|v| v.get("quote"))
        .and_then(|v| v.get(0))
        .and_then(|v| v.get("close"))
        .and_then(|v| v.as_array())?
        .iter()
        .rev()
        .find_map(|v| positive(v.as_f64()))
}

fn session_from_state(state: &str) -> MarketSession {
    match state.to_ascii_uppercase().as_str() {
        "REGULAR" => MarketSession::Regular,
        "PRE" | "PREPRE" => MarketSession::Pre,
        "POST" | "POSTPOST" => MarketSession::Post,
        _ => MarketSession::Closed,
    }
}

fn within_period(meta: &Value, period: &str, at: i64) -> bool {
    let Some(window) = meta.get("currentTradingPeriod").and_then(|v| v.get(period)) else {
        return false;
    };
    let start = window.get("start").and_then(|v| v.as_i64());
    let end = window.get("end").and_then(|v| v.as_i64());
    matches!((start, end), (Some(start), Some(end)) if start <= at && at < end)
}

fn classify_session(meta: &Value, at: i64) -> MarketSession {
    if let Some(state) = meta.get("marketState").and_then(|v| v.as_str()) {
        return session_from_state(state);
    }
    if within_period(meta, "regular", at) {
        MarketSession::Regular
    } else if within_period(meta, "pre", at) {
        MarketSession::Pre
    } else if within_period(meta, "post", at) {
        MarketSession::Post
    } else {
        MarketSession::Closed
    }
}

/// Resolves a quote from a chart API response.
///
/// Price order is live price, previous close, chart previous close, then the
/// last intraday close. A configured override replaces an implausible live
/// price with the previous close.
pub fn parse_chart_response(
    symbol: &str,
    body: &Value,
    overrides: &[SanityOverride],
) -> Result<PriceQuote> {
    let result = body
        .get("chart")
        .and_then(|v| v.get("result"))
        .and_then(|v| v.get(0))
        .ok_or_else(|| {
            let detail = body
                .get("chart")
                .and_then(|v| v.get("error"))
                .and_then(|v| v.get("description"))
                .and_then(|v| v.as_str())
                .unwrap_or("missing chart result");
            MarketDataError::Malformed(detail.to_string())
        })?;
    let meta = result
        .get("meta")
        .ok_or_else(|| MarketDataError::Malformed("missing chart meta".to_string()))?;
    let field = |name: &str| positive(meta.get(name).and_then(|v| v.as_f64()));

    let live = field("regularMarketPrice");
    let previous_close = field("previousClose");
    let chart_previous_close = field("chartPreviousClose");
    let reference_close = previous_close.or(chart_previous_close);

    let mut price = live
        .or(previous_close)
        .or(chart_previous_close)
        .or_else(|| last_intraday_close(result));

    if let (Some(current), Some(rule)) = (
        price,
        overrides
            .iter()
            .find(|rule| rule.symbol.eq_ignore_ascii_case(symbol)),
    ) {
        if current > rule.max_live_price {
            if let Some(close) = reference_close {
                tracing::warn!(
                    symbol,
                    reported = current,
                    threshold = rule.max_live_price,
                    "live price above sanity threshold, using previous close"
                );
                price = Some(close);
            }
        }
    }

    let price = round_cents(price.ok_or_else(|| MarketDataError::NoPrice(symbol.to_string()))?);
    let previous_close = round_cents(reference_close.unwrap_or(price));
    let change = round_cents(price - previous_close);
    let change_percent = if previous_close != 0.0 {
        round_cents(change / previous_close * 100.0)
    } else {
        0.0
    };

    let market_time = meta.get("regularMarketTime").and_then(|v| v.as_i64());
    let timestamp: DateTime<Utc> = market_time
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
        .unwrap_or_else(Utc::now);
    let market_state = classify_session(meta, timestamp.timestamp());

    Ok(PriceQuote {
        symbol: meta
            .get("symbol")
            .and_then(|v| v.as_str())
            .unwrap_or(symbol)
            .to_ascii_uppercase(),
        price,
        previous_close,
        change,
        change_percent,
        high: round_cents(field("regularMarketDayHigh").unwrap_or(price)),
        low: round_cents(field("regularMarketDayLow").unwrap_or(price)),
        volume: meta
            .get("regularMarketVolume")
            .and_then(|v| v.as_u64())
            .unwrap_or(0),
        market_state,
        is_real_time: market_state.is_live(),
        timestamp,
    })
}
