use std::fmt::Write as _;
use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde::{Deserialize, Serialize};

use tradepal_market::{MarketData, MarketSnapshot, PriceQuote};

use crate::config::EnrichmentMode;

fn market_query_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)\b(price|prices|quote|quoted|trade|trading|stock|stocks|shares?|ticker|symbol|market|chart|premarket|pre-market|after[- ]hours|bullish|bearish|sentiment|options?|calls?|puts?|support|resistance|momentum|volatility|volatile|rally|selloff|sell-off|earnings|spy|qqq|nasdaq|s&p|dow|etf|crypto|bitcoin|how is \w+ doing|what'?s \w+ at)\b",
        )
        .expect("valid market query regex")
    })
}

fn platform_query_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)\b(pdt|pattern day trad\w*|accounts?|sign ?up|log ?in|password|deposit\w*|withdraw\w*|verification|kyc|regulations?|regulatory|rules?|finra|sec|margin requirements?|fees?|commissions?|settings|tutorial|how do i use|how to use|addict\w*|compulsi\w*|habits?|gambling|overtrad\w*|self[- ]control|impulse)\b",
        )
        .expect("valid platform query regex")
    })
}

fn ticker_token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b[A-Z]{1,5}\b").expect("valid ticker regex"))
}

/// Single capital letters that are far more often words than tickers, or
/// halves of "S&P".
const WEAK_TICKERS: &[&str] = &["I", "A", "S", "P"];

const COMPANY_SYMBOLS: &[(&str, &str)] = &[
    ("tesla", "TSLA"),
    ("apple", "AAPL"),
    ("microsoft", "MSFT"),
    ("amazon", "AMZN"),
    ("alphabet", "GOOGL"),
    ("google", "GOOGL"),
    ("meta platforms", "META"),
    ("facebook", "META"),
    ("meta", "META"),
    ("nvidia", "NVDA"),
    ("netflix", "NFLX"),
    ("amd", "AMD"),
    ("intel", "INTC"),
    ("palantir", "PLTR"),
    ("coinbase", "COIN"),
    ("gamestop", "GME"),
    ("disney", "DIS"),
    ("boeing", "BA"),
    ("walmart", "WMT"),
    ("jpmorgan", "JPM"),
    ("bank of america", "BAC"),
    ("coca-cola", "KO"),
    ("coca cola", "KO"),
    ("general motors", "GM"),
    ("ford", "F"),
    ("uber", "UBER"),
    ("shopify", "SHOP"),
    ("spotify", "SPOT"),
    ("s&p 500", "SPY"),
    ("s&p", "SPY"),
    ("nasdaq", "QQQ"),
    ("dow jones", "DIA"),
];

/// Shorter names only match as whole words.
const MIN_SUBSTRING_NAME_LEN: usize = 5;

pub fn is_market_query(prompt: &str) -> bool {
    market_query_re().is_match(prompt)
}

pub fn is_platform_query(prompt: &str) -> bool {
    platform_query_re().is_match(prompt)
}

fn normalize(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '&' || c == '-' || c == ' ' {
                c
            } else {
                ' '
            }
        })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn company_symbol(prompt: &str) -> Option<&'static str> {
    let normalized = normalize(prompt);

    if let Some((_, symbol)) = COMPANY_SYMBOLS.iter().find(|(name, _)| *name == normalized) {
        return Some(*symbol);
    }
    if let Some((_, symbol)) = COMPANY_SYMBOLS
        .iter()
        .filter(|(name, _)| name.len() >= MIN_SUBSTRING_NAME_LEN)
        .find(|(name, _)| normalized.contains(name))
    {
        return Some(*symbol);
    }
    normalized.split(' ').find_map(|word| {
        COMPANY_SYMBOLS
            .iter()
            .find(|(name, _)| *name == word)
            .map(|(_, symbol)| *symbol)
    })
}

/// Resolves a ticker from the prompt: an explicit uppercase token first,
/// then a known company name. Any 1-5 letter capitalized word counts as a
/// ticker, so acronyms can be picked up.
pub fn resolve_symbol(prompt: &str) -> Option<String> {
    let tokens: Vec<&str> = ticker_token_re()
        .find_iter(prompt)
        .map(|m| m.as_str())
        .collect();

    if let Some(token) = tokens.iter().find(|t| !WEAK_TICKERS.contains(t)) {
        return Some(token.to_string());
    }
    if let Some(symbol) = company_symbol(prompt) {
        return Some(symbol.to_string());
    }
    tokens.first().map(|t| t.to_string())
}

fn volatility_tier(change_percent: f64) -> &'static str {
    let magnitude = change_percent.abs();
    if magnitude < 1.5 {
        "low"
    } else if magnitude < 3.0 {
        "moderate"
    } else {
        "high"
    }
}

fn momentum_side(change: f64) -> &'static str {
    if change >= 0.0 {
        "bulls"
    } else {
        "bears"
    }
}

fn session_label(quote: &PriceQuote) -> String {
    if quote.is_real_time {
        format!("{} session, real-time", quote.market_state.as_str())
    } else {
        "market closed, last available price".to_string()
    }
}

/// Wraps the user prompt with the fetched numbers and a fixed answer format.
pub fn build_augmented_prompt(
    original: &str,
    quote: &PriceQuote,
    snapshot: &MarketSnapshot,
) -> String {
    let symbol = &quote.symbol;
    let as_of = quote.timestamp.format("%b %d %H:%M UTC").to_string();
    let sign = if quote.change >= 0.0 { "+" } else { "" };
    let mut out = String::new();

    let _ = writeln!(out, "User question: {}", original.trim());
    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "LIVE MARKET DATA FOR {symbol} (as of {as_of}, {}):",
        session_label(quote)
    );
    let _ = writeln!(out, "- Current price: ${:.2}", quote.price);
    let _ = writeln!(
        out,
        "- Change: {sign}{:.2} ({sign}{:.2}%)",
        quote.change, quote.change_percent
    );
    let _ = writeln!(out, "- Previous close: ${:.2}", quote.previous_close);
    let _ = writeln!(out, "- Day high: ${:.2}", quote.high);
    let _ = writeln!(out, "- Day low: ${:.2}", quote.low);
    if quote.volume > 0 {
        let _ = writeln!(out, "- Volume: {}", quote.volume);
    }
    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "Use these exact values verbatim. Do not invent, estimate, or substitute any price, change, range or volume figure that is not listed above."
    );

    if !snapshot.headlines.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "RECENT HEADLINES (you must reference at least one):");
        for headline in &snapshot.headlines {
            let _ = writeln!(out, "- {headline}");
        }
    }
    if let Some(put_call) = &snapshot.put_call {
        let _ = writeln!(out);
        let _ = write!(
            out,
            "OPTIONS FLOW (you must mention this): put/call ratio {:.2}, {}.",
            put_call.ratio,
            put_call.interpretation.as_str()
        );
        if let Some(summary) = &put_call.summary {
            let _ = write!(out, " {summary}");
        }
        let _ = writeln!(out);
    }
    if let Some(unusual) = &snapshot.unusual_activity {
        let _ = writeln!(out);
        let _ = writeln!(out, "UNUSUAL OPTIONS ACTIVITY (you must mention this): {unusual}");
    }

    let _ = writeln!(out);
    let _ = writeln!(out, "Answer using exactly this format:");
    let _ = write!(
        out,
        "\"{symbol} is trading at ${:.2} as of {as_of}. Resistance sits near ${:.2}, with today's range between ${:.2} and ${:.2}. Momentum favors the {} ({sign}{:.2}, {sign}{:.2}%). Volatility is {}.",
        quote.price,
        quote.high,
        quote.low,
        quote.high,
        momentum_side(quote.change),
        quote.change,
        quote.change_percent,
        volatility_tier(quote.change_percent),
    );
    if !snapshot.headlines.is_empty() {
        let _ = write!(out, " In the news: <one sentence on the most relevant headline>.");
    }
    if snapshot.put_call.is_some() || snapshot.unusual_activity.is_some() {
        let _ = write!(out, " Options flow: <one sentence on the options data above>.");
    }
    let _ = writeln!(out, " Catalysts to watch: <one or two upcoming catalysts>.\"");
    out
}

fn fallback_prompt(original: &str, symbol: &str, reason: Option<&str>) -> String {
    match reason {
        Some(reason) => format!(
            "{original}\n\n(Note: live market data for {symbol} could not be retrieved: {reason}. \
             Do not quote a specific current price.)"
        ),
        None => original.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EnrichmentOutcome {
    NotMarketQuery,
    PlatformQuery,
    NoSymbol,
    Enriched { symbol: String },
    FetchFailed { symbol: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrichedPrompt {
    pub prompt: String,
    pub outcome: EnrichmentOutcome,
}

impl EnrichedPrompt {
    fn unchanged(prompt: &str, outcome: EnrichmentOutcome) -> Self {
        Self {
            prompt: prompt.to_string(),
            outcome,
        }
    }
}

pub struct PromptEnricher {
    market: Arc<dyn MarketData>,
    mode: EnrichmentMode,
}

impl PromptEnricher {
    pub fn new(market: Arc<dyn MarketData>, mode: EnrichmentMode) -> Self {
        Self { market, mode }
    }

    /// Never fails: any market data problem yields the original prompt.
    pub async fn enrich(&self, prompt: &str) -> EnrichedPrompt {
        if !is_market_query(prompt) {
            return EnrichedPrompt::unchanged(prompt, EnrichmentOutcome::NotMarketQuery);
        }
        if is_platform_query(prompt) {
            return EnrichedPrompt::unchanged(prompt, EnrichmentOutcome::PlatformQuery);
        }
        let Some(symbol) = resolve_symbol(prompt) else {
            return EnrichedPrompt::unchanged(prompt, EnrichmentOutcome::NoSymbol);
        };

        let with_context = self.mode == EnrichmentMode::Full;
        let snapshot = self.market.snapshot(&symbol, with_context).await;
        match &snapshot.quote {
            Some(quote) => {
                tracing::debug!(
                    symbol = %symbol,
                    headlines = snapshot.headlines.len(),
                    "prompt enriched"
                );
                EnrichedPrompt {
                    prompt: build_augmented_prompt(prompt, quote, &snapshot),
                    outcome: EnrichmentOutcome::Enriched { symbol },
                }
            }
            None => {
                let reason = snapshot
                    .quote_error
                    .clone()
                    .unwrap_or_else(|| "quote unavailable".to_string());
                tracing::info!(
                    symbol = %symbol,
                    reason = %reason,
                    "enrichment fell back to original prompt"
                );
                EnrichedPrompt {
                    prompt: fallback_prompt(prompt, &symbol, Some(&reason)),
                    outcome: EnrichmentOutcome::FetchFailed { symbol, reason },
                }
            }
        }
    }
}
