use serde::{Deserialize, Serialize};

/// Coarse cause of a failed provider call, recovered from the raw error text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Authentication,
    RateLimit,
    ModelNotFound,
    Forbidden,
    BadRequest,
    Network,
    Other,
}

/// Status code at the head of a provider error, as in `"429 Too Many Requests: …"`.
fn leading_status(raw: &str) -> Option<u16> {
    let raw = raw.trim_start();
    let code = raw.get(..3)?;
    let rest = &raw[3..];
    if !(rest.is_empty() || rest.starts_with(' ') || rest.starts_with(':')) {
        return None;
    }
    code.parse().ok()
}

/// True when `code` appears as a whole number, so `9401` is not a 401.
fn mentions_code(raw: &str, code: &str) -> bool {
    raw.split(|c: char| !c.is_ascii_digit()).any(|token| token == code)
}

/// The leading status wins when it is one we know; otherwise the rules are
/// checked in order and the first match wins.
pub fn classify_provider_error(raw: &str) -> ErrorKind {
    match leading_status(raw) {
        Some(401) => return ErrorKind::Authentication,
        Some(429) => return ErrorKind::RateLimit,
        Some(404) => return ErrorKind::ModelNotFound,
        Some(403) => return ErrorKind::Forbidden,
        Some(400) => return ErrorKind::BadRequest,
        _ => {}
    }

    let lower = raw.to_ascii_lowercase();
    let has = |needle: &str| lower.contains(needle);

    if mentions_code(raw, "401") || has("unauthorized") || has("authentication") {
        ErrorKind::Authentication
    } else if mentions_code(raw, "429") || has("rate limit") {
        ErrorKind::RateLimit
    } else if mentions_code(raw, "404") || has("not found") || has("model_not_found") {
        ErrorKind::ModelNotFound
    } else if mentions_code(raw, "403") || has("forbidden") {
        ErrorKind::Forbidden
    } else if mentions_code(raw, "400") || has("bad request") {
        ErrorKind::BadRequest
    } else if has("failed to fetch")
        || has("networkerror")
        || has("network")
        || has("error sending request")
    {
        ErrorKind::Network
    } else {
        ErrorKind::Other
    }
}

impl ErrorKind {
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::Authentication => "authentication",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::ModelNotFound => "model_not_found",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::BadRequest => "bad_request",
            ErrorKind::Network => "network",
            ErrorKind::Other => "provider_error",
        }
    }

    /// Message shown to the user in place of the raw provider error.
    /// Unclassified errors keep their original text.
    pub fn user_message(self, provider: &str, model: &str, raw: &str) -> String {
        match self {
            ErrorKind::Authentication => format!(
                "Authentication failed for {provider}. Please check your API key in Settings."
            ),
            ErrorKind::RateLimit => {
                format!("Rate limit exceeded for {provider}. Please try again later.")
            }
            ErrorKind::ModelNotFound => format!(
                "Model \"{model}\" was not found on {provider}. It may not be available with your current API key."
            ),
            ErrorKind::Forbidden => format!(
                "Access denied for model \"{model}\" on {provider}. Your API key may not have access to this model."
            ),
            ErrorKind::BadRequest => format!(
                "Bad request to {provider} for model \"{model}\". The model or request format may not be supported."
            ),
            ErrorKind::Network => format!(
                "Network error while contacting {provider}. This may be caused by CORS restrictions or connectivity issues."
            ),
            ErrorKind::Other => raw.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_status_codes_and_phrases() {
        let cases = [
            ("401 Unauthorized: Incorrect API key provided", ErrorKind::Authentication),
            ("authentication_error: invalid x-api-key", ErrorKind::Authentication),
            ("429 rate limit exceeded", ErrorKind::RateLimit),
            ("Rate limit reached for requests", ErrorKind::RateLimit),
            ("404 Not Found: model: claude-9", ErrorKind::ModelNotFound),
            ("model_not_found", ErrorKind::ModelNotFound),
            ("403 Forbidden: project lacks access", ErrorKind::Forbidden),
            ("400 Bad Request: invalid temperature", ErrorKind::BadRequest),
            ("Failed to fetch", ErrorKind::Network),
            (
                "error sending request for url (https://api.openai.com/v1/chat/completions)",
                ErrorKind::Network,
            ),
            ("NetworkError when attempting to fetch resource.", ErrorKind::Network),
            ("500 Internal Server Error: overloaded", ErrorKind::Other),
        ];
        for (raw, expected) in cases {
            assert_eq!(classify_provider_error(raw), expected, "{raw}");
        }
    }

    #[test]
    fn earlier_rules_take_precedence() {
        assert_eq!(
            classify_provider_error("401 Unauthorized: network policy"),
            ErrorKind::Authentication
        );
        assert_eq!(
            classify_provider_error("429 Too Many Requests: model not found in quota"),
            ErrorKind::RateLimit
        );
    }

    #[test]
    fn token_counts_in_the_body_are_not_status_codes() {
        let raw = "429 Too Many Requests: Rate limit reached for gpt-4o. \
Limit 10000, Used 9401, Requested 1200.";
        assert_eq!(classify_provider_error(raw), ErrorKind::RateLimit);
        assert_eq!(
            classify_provider_error("tokens per min: Limit 10000, Used 9401, Requested 1200"),
            ErrorKind::Other
        );
        assert_eq!(
            classify_provider_error("upstream said 401 for this key"),
            ErrorKind::Authentication
        );
    }

    #[test]
    fn user_messages_name_provider_and_model() {
        assert_eq!(
            ErrorKind::RateLimit.user_message("OpenAI", "gpt-4", "429"),
            "Rate limit exceeded for OpenAI. Please try again later."
        );
        assert_eq!(
            ErrorKind::ModelNotFound.user_message("Anthropic", "claude-9", "404"),
            "Model \"claude-9\" was not found on Anthropic. It may not be available with your current API key."
        );
        assert!(ErrorKind::Authentication
            .user_message("Google", "gemini-1.5-pro", "401")
            .contains("check your API key in Settings"));
    }

    #[test]
    fn unclassified_errors_pass_through() {
        let raw = "500 Internal Server Error: upstream exploded";
        assert_eq!(ErrorKind::Other.user_message("OpenAI", "gpt-4", raw), raw);
        assert_eq!(ErrorKind::Other.code(), "provider_error");
    }
}
