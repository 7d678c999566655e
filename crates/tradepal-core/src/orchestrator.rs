use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::Client;
use tokio::sync::mpsc;
use uuid::Uuid;

use tradepal_market::MarketData;
use tradepal_observability::{
    comparison_finished, comparison_started, model_finished, ModelOutcome,
};
use tradepal_providers::{
    config_of, Generation, GenerationOptions, ProviderClient, ProviderEndpoints, TextGenerator,
};
use tradepal_types::{ComparisonResult, ModelRequest, ProviderId};

use crate::config::AppConfig;
use crate::enrichment::PromptEnricher;
use crate::errors::classify_provider_error;

pub const SYSTEM_PROMPT: &str = "You are TradePal AI, a friendly trading education assistant. \
Explain market concepts clearly and concisely for retail traders, keep a calm and neutral tone, \
and point out risk plainly. Never present an answer as personalized financial advice. \
When live market data is provided, use the supplied numbers exactly as given.";

pub type ApiKeys = HashMap<ProviderId, String>;

/// Builds the generation client for one model. Swapped out in tests.
pub trait ClientFactory: Send + Sync {
    fn create(&self, provider: ProviderId, model: &str, api_key: &str) -> Arc<dyn TextGenerator>;
}

pub struct HttpClientFactory {
    http: Client,
    endpoints: ProviderEndpoints,
    options: GenerationOptions,
}

impl HttpClientFactory {
    pub fn new(http: Client, endpoints: ProviderEndpoints, options: GenerationOptions) -> Self {
        Self {
            http,
            endpoints,
            options,
        }
    }
}

impl ClientFactory for HttpClientFactory {
    fn create(&self, provider: ProviderId, model: &str, api_key: &str) -> Arc<dyn TextGenerator> {
        Arc::new(ProviderClient::build(
            self.http.clone(),
            provider,
            model,
            api_key,
            &self.endpoints,
            self.options,
        ))
    }
}

fn empty_generation_message(provider_name: &str, model: &str, generation: &Generation) -> String {
    let reason = generation.finish_reason.as_deref().unwrap_or("unknown");
    let mut message =
        format!("{provider_name} returned an empty response for {model} (finish reason: {reason})");
    if generation.tool_calls > 0 {
        message.push_str(&format!(
            "; it requested {} tool call(s) without a final answer",
            generation.tool_calls
        ));
    }
    message
}

fn describe_timeout(timeout: Duration) -> String {
    if timeout.as_secs() >= 1 {
        format!("{}s", timeout.as_secs())
    } else {
        format!("{}ms", timeout.as_millis())
    }
}

#[derive(Clone)]
struct ModelPipeline {
    factory: Arc<dyn ClientFactory>,
    enricher: Arc<PromptEnricher>,
    timeout: Duration,
    comparison_id: String,
}

impl ModelPipeline {
    async fn run(
        &self,
        prompt: &str,
        request: &ModelRequest,
        api_key: Option<String>,
    ) -> ComparisonResult {
        let provider_name = config_of(request.provider).name;
        let Some(api_key) = api_key.filter(|key| !key.trim().is_empty()) else {
            let result = ComparisonResult::failure(
                request,
                format!("No API key provided for {}", request.provider),
            );
            self.record(request, &result, Some("missing_api_key"));
            return result;
        };

        let client = self
            .factory
            .create(request.provider, &request.model, api_key.trim());
        let enriched = self.enricher.enrich(prompt).await;

        let outcome = tokio::time::timeout(
            self.timeout,
            client.generate(SYSTEM_PROMPT, &enriched.prompt),
        )
        .await;
        let (result, error_code) = match outcome {
            Err(_) => (
                ComparisonResult::failure(
                    request,
                    format!(
                        "Request to {} timed out after {}",
                        request.model,
                        describe_timeout(self.timeout)
                    ),
                ),
                Some("timeout"),
            ),
            Ok(Err(err)) => {
                let raw = format!("{err:#}");
                let kind = classify_provider_error(&raw);
                tracing::debug!(
                    model_id = %request.model_id,
                    kind = kind.code(),
                    raw = %raw,
                    "provider call failed"
                );
                (
                    ComparisonResult::failure(
                        request,
                        kind.user_message(provider_name, &request.model, &raw),
                    ),
                    Some(kind.code()),
                )
            }
            Ok(Ok(generation)) if generation.text.trim().is_empty() => (
                ComparisonResult::failure(
                    request,
                    empty_generation_message(provider_name, &request.model, &generation),
                ),
                Some("empty_response"),
            ),
            Ok(Ok(generation)) => (ComparisonResult::success(request, generation.text), None),
        };
        self.record(request, &result, error_code);
        result
    }

    fn record(&self, request: &ModelRequest, result: &ComparisonResult, error_code: Option<&str>) {
        let outcome = match result.error.as_deref() {
            None => ModelOutcome::Succeeded,
            Some(message) => ModelOutcome::Failed {
                code: error_code.unwrap_or("unknown"),
                message,
            },
        };
        model_finished(
            &self.comparison_id,
            request.provider.as_str(),
            &request.model_id,
            outcome,
        );
    }
}

/// Fans one prompt out to every requested model and collects exactly one
/// result per request, whatever happens to the individual calls.
#[derive(Clone)]
pub struct ComparisonOrchestrator {
    factory: Arc<dyn ClientFactory>,
    enricher: Arc<PromptEnricher>,
    generation_timeout: Duration,
}

impl ComparisonOrchestrator {
    pub fn new(
        factory: Arc<dyn ClientFactory>,
        enricher: Arc<PromptEnricher>,
        generation_timeout: Duration,
    ) -> Self {
        Self {
            factory,
            enricher,
            generation_timeout,
        }
    }

    pub fn from_config(config: &AppConfig, http: Client, market: Arc<dyn MarketData>) -> Self {
        let factory = HttpClientFactory::new(http, config.endpoints(), config.generation.options());
        let enricher = PromptEnricher::new(market, config.enrichment.mode);
        Self::new(
            Arc::new(factory),
            Arc::new(enricher),
            config.generation.timeout(),
        )
    }

    pub async fn compare(
        &self,
        prompt: &str,
        requests: &[ModelRequest],
        api_keys: &ApiKeys,
    ) -> Vec<ComparisonResult> {
        self.run(prompt, requests, api_keys, None).await
    }

    /// Like [`compare`](Self::compare), but also pushes each result into
    /// `updates` as soon as its model settles.
    pub async fn compare_streaming(
        &self,
        prompt: &str,
        requests: &[ModelRequest],
        api_keys: &ApiKeys,
        updates: mpsc::UnboundedSender<ComparisonResult>,
    ) -> Vec<ComparisonResult> {
        self.run(prompt, requests, api_keys, Some(updates)).await
    }

    async fn run(
        &self,
        prompt: &str,
        requests: &[ModelRequest],
        api_keys: &ApiKeys,
        updates: Option<mpsc::UnboundedSender<ComparisonResult>>,
    ) -> Vec<ComparisonResult> {
        let comparison_id = Uuid::new_v4().to_string();
        let started = Instant::now();
        comparison_started(&comparison_id, requests.len(), prompt);

        let pipeline = ModelPipeline {
            factory: self.factory.clone(),
            enricher: self.enricher.clone(),
            timeout: self.generation_timeout,
            comparison_id: comparison_id.clone(),
        };
        let prompt: Arc<str> = Arc::from(prompt);

        let handles = requests
            .iter()
            .map(|request| {
                let pipeline = pipeline.clone();
                let prompt = prompt.clone();
                let request = request.clone();
                let api_key = api_keys.get(&request.provider).cloned();
                let updates = updates.clone();
                tokio::spawn(async move {
                    let result = pipeline.run(&prompt, &request, api_key).await;
                    if let Some(updates) = updates {
                        let _ = updates.send(result.clone());
                    }
                    result
                })
            })
            .collect::<Vec<_>>();

        let settled = futures::future::join_all(handles).await;
        let results = settled
            .into_iter()
            .zip(requests)
            .map(|(joined, request)| match joined {
                Ok(result) => result,
                Err(err) => {
                    tracing::error!(
                        model_id = %request.model_id,
                        error = %err,
                        "model pipeline aborted"
                    );
                    let result = ComparisonResult::unknown_failure(
                        &request.model_id,
                        format!("Unexpected error while querying {}: {err}", request.model_id),
                    );
                    if let Some(updates) = &updates {
                        let _ = updates.send(result.clone());
                    }
                    result
                }
            })
            .collect::<Vec<_>>();

        let succeeded = results.iter().filter(|r| r.is_success()).count();
        comparison_finished(
            &comparison_id,
            succeeded,
            results.len() - succeeded,
            started.elapsed(),
        );
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::Utc;
    use tradepal_market::{
        MarketDataError, MarketSession, PriceQuote, PutCallSentiment, Result as MarketResult,
    };

    use crate::config::EnrichmentMode;

    #[derive(Clone)]
    enum Behavior {
        Reply(&'static str),
        Fail(&'static str),
        Empty(Option<&'static str>, usize),
        Hang,
        Panic,
    }

    #[derive(Default)]
    struct Recorder {
        prompts: Mutex<Vec<(String, String)>>,
        created: Mutex<Vec<(ProviderId, String, String)>>,
    }

    struct FakeGenerator {
        model: String,
        behavior: Behavior,
        recorder: Arc<Recorder>,
    }

    #[async_trait]
    impl TextGenerator for FakeGenerator {
        async fn generate(
            &self,
            system_prompt: &str,
            user_prompt: &str,
        ) -> anyhow::Result<Generation> {
            assert_eq!(system_prompt, SYSTEM_PROMPT);
            self.recorder
                .prompts
                .lock()
                .unwrap()
                .push((self.model.clone(), user_prompt.to_string()));
            match &self.behavior {
                Behavior::Reply(text) => Ok(Generation {
                    text: text.to_string(),
                    finish_reason: Some("stop".to_string()),
                    tool_calls: 0,
                }),
                Behavior::Fail(message) => Err(anyhow::anyhow!(*message)),
                Behavior::Empty(reason, tool_calls) => Ok(Generation {
                    text: "  ".to_string(),
                    finish_reason: reason.map(str::to_string),
                    tool_calls: *tool_calls,
                }),
                Behavior::Hang => {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(Generation::default())
                }
                Behavior::Panic => panic!("generator blew up"),
            }
        }
    }

    struct FakeFactory {
        behaviors: HashMap<String, Behavior>,
        recorder: Arc<Recorder>,
    }

    impl ClientFactory for FakeFactory {
        fn create(
            &self,
            provider: ProviderId,
            model: &str,
            api_key: &str,
        ) -> Arc<dyn TextGenerator> {
            self.recorder.created.lock().unwrap().push((
                provider,
                model.to_string(),
                api_key.to_string(),
            ));
            let behavior = self
                .behaviors
                .get(model)
                .cloned()
                .unwrap_or(Behavior::Reply("default reply"));
            Arc::new(FakeGenerator {
                model: model.to_string(),
                behavior,
                recorder: self.recorder.clone(),
            })
        }
    }

    struct FixedMarket {
        quote: Option<PriceQuote>,
    }

    #[async_trait]
    impl MarketData for FixedMarket {
        async fn quote(&self, symbol: &str) -> MarketResult<PriceQuote> {
            self.quote
                .clone()
                .ok_or_else(|| MarketDataError::NoPrice(symbol.to_string()))
        }
        async fn headlines(&self, _symbol: &str) -> MarketResult<Vec<String>> {
            Err(MarketDataError::Unavailable("backend"))
        }
        async fn put_call_ratio(&self, _symbol: &str) -> MarketResult<PutCallSentiment> {
            Err(MarketDataError::Unavailable("backend"))
        }
        async fn unusual_activity(&self, _symbol: &str) -> MarketResult<String> {
            Err(MarketDataError::Unavailable("backend"))
        }
    }

    fn spy_quote() -> PriceQuote {
        PriceQuote {
            symbol: "SPY".to_string(),
            price: 450.12,
            previous_close: 448.62,
            change: 1.5,
            change_percent: 0.33,
            high: 452.0,
            low: 448.0,
            volume: 0,
            market_state: MarketSession::Regular,
            is_real_time: true,
            timestamp: Utc::now(),
        }
    }

    fn orchestrator(
        behaviors: &[(&str, Behavior)],
        quote: Option<PriceQuote>,
        timeout: Duration,
    ) -> (ComparisonOrchestrator, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let factory = FakeFactory {
            behaviors: behaviors
                .iter()
                .map(|(model, behavior)| (model.to_string(), behavior.clone()))
                .collect(),
            recorder: recorder.clone(),
        };
        let enricher = PromptEnricher::new(Arc::new(FixedMarket { quote }), EnrichmentMode::Full);
        (
            ComparisonOrchestrator::new(Arc::new(factory), Arc::new(enricher), timeout),
            recorder,
        )
    }

    fn keys(pairs: &[(ProviderId, &str)]) -> ApiKeys {
        pairs.iter().map(|(p, k)| (*p, k.to_string())).collect()
    }

    fn gpt4() -> ModelRequest {
        ModelRequest::parse("openai:gpt-4").expect("model id")
    }

    #[tokio::test]
    async fn enriched_prompt_carries_exact_price() {
        let (orchestrator, recorder) = orchestrator(
            &[("gpt-4", Behavior::Reply("SPY is up"))],
            Some(spy_quote()),
            Duration::from_secs(5),
        );
        let results = orchestrator
            .compare(
                "What's SPY's price?",
                &[gpt4()],
                &keys(&[(ProviderId::OpenAi, "sk-validkey-0123456789")]),
            )
            .await;

        assert_eq!(results.len(), 1);
        assert!(results[0].is_success());
        let prompts = recorder.prompts.lock().unwrap().clone();
        assert_eq!(prompts.len(), 1);
        let sent = &prompts[0].1;
        assert!(sent.contains("450.12"));
        assert!(sent.contains("Do not invent"));
        assert!(!sent.to_lowercase().contains("feel free to estimate"));
        assert!(!sent.to_lowercase().contains("you may estimate"));
    }

    #[tokio::test]
    async fn missing_key_fails_without_calling_provider() {
        let (orchestrator, recorder) =
            orchestrator(&[], Some(spy_quote()), Duration::from_secs(5));
        let results = orchestrator
            .compare("What's SPY's price?", &[gpt4()], &ApiKeys::new())
            .await;

        assert_eq!(
            results,
            vec![ComparisonResult {
                model_id: "openai:gpt-4".to_string(),
                provider: "openai".to_string(),
                model: "gpt-4".to_string(),
                content: String::new(),
                error: Some("No API key provided for openai".to_string()),
                completed: false,
            }]
        );
        assert!(recorder.created.lock().unwrap().is_empty());
        assert!(recorder.prompts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_key_is_isolated_from_other_models() {
        let (orchestrator, _) = orchestrator(
            &[
                ("gpt-4", Behavior::Reply("from openai")),
                ("claude-3-5-haiku-20241022", Behavior::Reply("from anthropic")),
            ],
            None,
            Duration::from_secs(5),
        );
        let requests = vec![
            gpt4(),
            ModelRequest::parse("anthropic:claude-3-5-haiku-20241022").expect("id"),
            ModelRequest::parse("google:gemini-1.5-flash").expect("id"),
        ];
        let results = orchestrator
            .compare(
                "Explain covered calls",
                &requests,
                &keys(&[
                    (ProviderId::OpenAi, "sk-a"),
                    (ProviderId::Anthropic, "sk-ant-b"),
                    (ProviderId::Google, "   "),
                ]),
            )
            .await;

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].content, "from openai");
        assert_eq!(results[1].content, "from anthropic");
        assert_eq!(
            results[2].error.as_deref(),
            Some("No API key provided for google")
        );
    }

    #[tokio::test]
    async fn rate_limit_is_rewritten_while_sibling_succeeds() {
        let (orchestrator, _) = orchestrator(
            &[
                ("gpt-4", Behavior::Fail("429 rate limit exceeded")),
                ("claude-3-5-sonnet-20241022", Behavior::Reply("Covered calls cap upside.")),
            ],
            None,
            Duration::from_secs(5),
        );
        let requests = vec![
            gpt4(),
            ModelRequest::parse("anthropic:claude-3-5-sonnet-20241022").expect("id"),
        ];
        let results = orchestrator
            .compare(
                "Explain covered calls",
                &requests,
                &keys(&[(ProviderId::OpenAi, "sk-a"), (ProviderId::Anthropic, "sk-ant-b")]),
            )
            .await;

        assert_eq!(results.len(), 2);
        assert_eq!(
            results[0].error.as_deref(),
            Some("Rate limit exceeded for OpenAI. Please try again later.")
        );
        assert!(!results[0].completed);
        assert_eq!(results[1].content, "Covered calls cap upside.");
        assert_eq!(results[1].error, None);
    }

    #[tokio::test]
    async fn empty_generation_is_an_error_not_a_blank_success() {
        let (orchestrator, _) = orchestrator(
            &[("gpt-4", Behavior::Empty(Some("tool_calls"), 2))],
            None,
            Duration::from_secs(5),
        );
        let results = orchestrator
            .compare("hello", &[gpt4()], &keys(&[(ProviderId::OpenAi, "sk-a")]))
            .await;

        let result = &results[0];
        assert!(!result.completed);
        let error = result.error.as_deref().unwrap_or_default();
        assert!(error.contains("empty response for gpt-4"), "{error}");
        assert!(error.contains("finish reason: tool_calls"), "{error}");
        assert!(error.contains("2 tool call(s)"), "{error}");
    }

    #[tokio::test]
    async fn unclassified_errors_keep_their_text() {
        let (orchestrator, _) = orchestrator(
            &[("gpt-4", Behavior::Fail("500 Internal Server Error: overloaded"))],
            None,
            Duration::from_secs(5),
        );
        let results = orchestrator
            .compare("hello", &[gpt4()], &keys(&[(ProviderId::OpenAi, "sk-a")]))
            .await;
        assert_eq!(
            results[0].error.as_deref(),
            Some("500 Internal Server Error: overloaded")
        );
    }

    #[tokio::test]
    async fn hung_provider_times_out() {
        let (orchestrator, _) = orchestrator(
            &[("gpt-4", Behavior::Hang), ("gpt-4o", Behavior::Reply("fast"))],
            None,
            Duration::from_millis(50),
        );
        let requests = vec![gpt4(), ModelRequest::new(ProviderId::OpenAi, "gpt-4o")];
        let results = orchestrator
            .compare("hello", &requests, &keys(&[(ProviderId::OpenAi, "sk-a")]))
            .await;
        assert_eq!(
            results[0].error.as_deref(),
            Some("Request to gpt-4 timed out after 50ms")
        );
        assert_eq!(results[1].content, "fast");
    }

    #[tokio::test]
    async fn panicking_pipeline_maps_to_unknown_placeholder() {
        let (orchestrator, _) = orchestrator(
            &[("gpt-4", Behavior::Panic), ("gpt-4o", Behavior::Reply("still here"))],
            None,
            Duration::from_secs(5),
        );
        let requests = vec![gpt4(), ModelRequest::new(ProviderId::OpenAi, "gpt-4o")];
        let results = orchestrator
            .compare("hello", &requests, &keys(&[(ProviderId::OpenAi, "sk-a")]))
            .await;

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].model_id, "openai:gpt-4");
        assert_eq!(results[0].provider, "unknown");
        assert_eq!(results[0].model, "unknown");
        assert!(results[0].error.is_some());
        assert_eq!(results[1].content, "still here");
    }

    #[tokio::test]
    async fn streaming_emits_every_result() {
        let (orchestrator, _) = orchestrator(
            &[("gpt-4", Behavior::Reply("a")), ("gpt-4o", Behavior::Fail("401 Unauthorized"))],
            None,
            Duration::from_secs(5),
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        let requests = vec![gpt4(), ModelRequest::new(ProviderId::OpenAi, "gpt-4o")];
        let results = orchestrator
            .compare_streaming("hello", &requests, &keys(&[(ProviderId::OpenAi, "sk-a")]), tx)
            .await;

        let mut streamed = Vec::new();
        while let Some(result) = rx.recv().await {
            streamed.push(result);
        }
        assert_eq!(streamed.len(), 2);
        assert_eq!(results.len(), 2);
        assert!(streamed
            .iter()
            .any(|r| r.error.as_deref().is_some_and(|e| e.contains("check your API key"))));
    }

    #[tokio::test]
    async fn keys_are_trimmed_before_client_creation() {
        let (orchestrator, recorder) =
            orchestrator(&[], None, Duration::from_secs(5));
        orchestrator
            .compare("hello", &[gpt4()], &keys(&[(ProviderId::OpenAi, "  sk-padded  ")]))
            .await;
        let created = recorder.created.lock().unwrap().clone();
        assert_eq!(
            created,
            vec![(ProviderId::OpenAi, "gpt-4".to_string(), "sk-padded".to_string())]
        );
    }
}
