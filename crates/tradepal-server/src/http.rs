use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::OnceLock;
use std::time::Duration;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use futures::{Stream, StreamExt};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tower_http::cors::{Any, CorsLayer};

use tradepal_core::{resolve_model_requests, ApiKeys};
use tradepal_market::MarketData;
use tradepal_providers::{all_selectable_models, provider_info};
use tradepal_types::{ModelRequest, ProviderId, ProviderInfo};
use tradepal_vault::CredentialError;

use crate::AppState;

struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let app = app_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "tradepal engine listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_err() {
                futures::future::pending::<()>().await;
            }
        })
        .await?;
    Ok(())
}

pub fn app_router(state: AppState) -> Router {
    let cors_allow_any = state.cors_allow_any;
    let router = Router::new()
        .route("/api/health", get(health))
        .route("/api/compare", post(compare))
        .route("/api/compare/stream", post(compare_stream))
        .route("/api/providers", get(list_providers))
        .route("/api/models", get(list_models))
        .route(
            "/api/credentials",
            get(list_credentials).delete(clear_credentials),
        )
        .route(
            "/api/credentials/{provider}",
            put(store_credential).delete(remove_credential),
        )
        .route("/api/stock/quote/{symbol}", get(stock_quote))
        .route("/api/stock/quotes", get(stock_quotes))
        .with_state(state);

    if cors_allow_any {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
        router.layer(cors)
    } else {
        router
    }
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "tradepal-engine",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct CompareInput {
    prompt: Option<String>,
    api_keys: Option<Value>,
    #[serde(default)]
    model_ids: Vec<String>,
    #[serde(default)]
    providers: Vec<String>,
    #[serde(default)]
    models: HashMap<String, String>,
    #[serde(default)]
    use_stored_keys: bool,
}

struct CompareJob {
    prompt: String,
    requests: Vec<ModelRequest>,
    api_keys: ApiKeys,
}

fn prepare_compare(
    state: &AppState,
    payload: Result<Json<CompareInput>, JsonRejection>,
) -> Result<CompareJob, ApiError> {
    let Json(input) = payload.map_err(|rejection| ApiError::bad_request(rejection.body_text()))?;

    let prompt = input
        .prompt
        .filter(|p| !p.trim().is_empty())
        .ok_or_else(|| ApiError::bad_request("Prompt is required"))?;

    let mut api_keys = ApiKeys::new();
    match input.api_keys {
        Some(Value::Object(map)) => {
            for (provider, key) in map {
                let Some(key) = key.as_str() else {
                    return Err(ApiError::bad_request("apiKeys values must be strings"));
                };
                let Ok(provider) = provider.parse::<ProviderId>() else {
                    continue;
                };
                if !key.trim().is_empty() {
                    api_keys.insert(provider, key.trim().to_string());
                }
            }
        }
        None | Some(Value::Null) if input.use_stored_keys => {}
        _ => return Err(ApiError::bad_request("apiKeys must be an object")),
    }

    let requests = resolve_model_requests(&input.model_ids, &input.providers, &input.models)
        .map_err(|err| ApiError::bad_request(err.to_string()))?;

    if input.use_stored_keys {
        for request in &requests {
            if api_keys.contains_key(&request.provider) {
                continue;
            }
            if let Some(key) = state.credentials.retrieve(request.provider) {
                api_keys.insert(request.provider, key);
            }
        }
    }

    Ok(CompareJob {
        prompt,
        requests,
        api_keys,
    })
}

async fn compare(
    State(state): State<AppState>,
    payload: Result<Json<CompareInput>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let job = prepare_compare(&state, payload)?;
    let orchestrator = state.orchestrator.clone();
    let responses = tokio::spawn(async move {
        orchestrator
            .compare(&job.prompt, &job.requests, &job.api_keys)
            .await
    })
    .await
    .map_err(|err| {
        tracing::error!("comparison task failed: {}", err);
        ApiError::internal("Internal server error while comparing models")
    })?;
    Ok(Json(json!({ "responses": responses })))
}

async fn compare_stream(
    State(state): State<AppState>,
    payload: Result<Json<CompareInput>, JsonRejection>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let job = prepare_compare(&state, payload)?;
    let total = job.requests.len();
    let (tx, rx) = mpsc::unbounded_channel();
    let orchestrator = state.orchestrator.clone();
    tokio::spawn(async move {
        orchestrator
            .compare_streaming(&job.prompt, &job.requests, &job.api_keys, tx)
            .await;
    });

    let results = UnboundedReceiverStream::new(rx).map(|result| {
        let payload = serde_json::to_string(&result).unwrap_or_default();
        Ok::<_, Infallible>(Event::default().event("result").data(payload))
    });
    let done = futures::stream::once(async move {
        Ok::<_, Infallible>(Event::default()
            .event("done")
            .data(json!({ "count": total }).to_string()))
    });

    Ok(Sse::new(results.chain(done))
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(10))))
}

#[derive(Debug, Serialize)]
struct ProviderListing {
    #[serde(flatten)]
    info: ProviderInfo,
    configured: bool,
}

async fn list_providers(State(state): State<AppState>) -> Json<Vec<ProviderListing>> {
    let configured = state.credentials.list_configured();
    Json(
        ProviderId::ALL
            .into_iter()
            .map(|provider| ProviderListing {
                info: provider_info(provider),
                configured: configured.contains(&provider),
            })
            .collect(),
    )
}

async fn list_models(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "models": all_selectable_models(&state.credentials) }))
}

async fn list_credentials(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "configured": state.credentials.list_configured(),
        "credentials": state.credentials.summaries(),
    }))
}

#[derive(Debug, Deserialize)]
struct StoreCredentialInput {
    key: String,
    label: Option<String>,
}

fn parse_provider(raw: &str) -> Result<ProviderId, ApiError> {
    raw.parse::<ProviderId>()
        .map_err(|err| ApiError::bad_request(err.to_string()))
}

fn credential_error(err: CredentialError) -> ApiError {
    match err {
        CredentialError::EmptyKey | CredentialError::InvalidFormat { .. } => {
            ApiError::bad_request(err.to_string())
        }
        other => {
            tracing::error!("credential storage failed: {}", other);
            ApiError::internal("Failed to update credential storage")
        }
    }
}

async fn store_credential(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    payload: Result<Json<StoreCredentialInput>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let provider = parse_provider(&provider)?;
    let Json(input) = payload.map_err(|rejection| ApiError::bad_request(rejection.body_text()))?;
    state
        .credentials
        .store(provider, &input.key, input.label.as_deref())
        .map_err(credential_error)?;
    Ok(Json(json!({ "provider": provider, "configured": true })))
}

async fn remove_credential(
    State(state): State<AppState>,
    Path(provider): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let provider = parse_provider(&provider)?;
    state.credentials.remove(provider).map_err(credential_error)?;
    Ok(Json(json!({ "provider": provider, "configured": false })))
}

async fn clear_credentials(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    state.credentials.clear_all().map_err(credential_error)?;
    Ok(Json(json!({ "cleared": true })))
}

/// Most symbols a single `/api/stock/quotes` call will fetch.
const MAX_QUOTE_SYMBOLS: usize = 20;

fn symbol_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Z.^-]{1,10}$").expect("valid symbol regex"))
}

/// Uppercases and checks a ticker before it is put into an upstream URL.
fn normalize_symbol(raw: &str) -> Result<String, ApiError> {
    let symbol = raw.trim().to_ascii_uppercase();
    if symbol_re().is_match(&symbol) {
        Ok(symbol)
    } else {
        Err(ApiError::bad_request(format!("Invalid symbol: {}", raw.trim())))
    }
}

async fn stock_quote(
    State(state): State<AppState>,
    Path(symbol): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let symbol = normalize_symbol(&symbol)?;
    match state.market.quote(&symbol).await {
        Ok(quote) => Ok(Json(json!(quote))),
        Err(err) => Err(ApiError {
            status: StatusCode::NOT_FOUND,
            message: err.to_string(),
        }),
    }
}

#[derive(Debug, Deserialize)]
struct QuotesQuery {
    symbols: Option<String>,
}

async fn stock_quotes(
    State(state): State<AppState>,
    Query(query): Query<QuotesQuery>,
) -> Result<Json<Vec<Value>>, ApiError> {
    let symbols = query
        .symbols
        .unwrap_or_default()
        .split(',')
        .filter(|s| !s.trim().is_empty())
        .map(normalize_symbol)
        .collect::<Result<Vec<_>, _>>()?;
    if symbols.is_empty() {
        return Err(ApiError::bad_request("symbols query parameter is required"));
    }
    if symbols.len() > MAX_QUOTE_SYMBOLS {
        return Err(ApiError::bad_request(format!(
            "At most {MAX_QUOTE_SYMBOLS} symbols per request"
        )));
    }

    let market = state.market.clone();
    let quotes = futures::future::join_all(symbols.iter().map(|symbol| {
        let market = market.clone();
        async move {
            match market.quote(symbol).await {
                Ok(quote) => json!(quote),
                Err(err) => json!({ "symbol": symbol, "error": err.to_string() }),
            }
        }
    }))
    .await;
    Ok(Json(quotes))
}
