pub mod board;
pub mod config;
pub mod enrichment;
pub mod errors;
pub mod orchestrator;
pub mod request;

pub use board::{ResultBoard, ResultSlot, SlotState};
pub use config::{AppConfig, ConfigStore, EnrichmentMode};
pub use enrichment::{EnrichedPrompt, EnrichmentOutcome, PromptEnricher};
pub use errors::{classify_provider_error, ErrorKind};
pub use orchestrator::{
    ApiKeys, ClientFactory, ComparisonOrchestrator, HttpClientFactory, SYSTEM_PROMPT,
};
pub use request::{resolve_model_requests, CompareRequestError};
