use std::sync::Arc;

use tradepal_core::{AppConfig, ComparisonOrchestrator};
use tradepal_market::{MarketData, MarketDataClient};
use tradepal_vault::CredentialStore;

mod http;

pub use http::{app_router, serve};

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: ComparisonOrchestrator,
    pub credentials: Arc<CredentialStore>,
    pub market: Arc<dyn MarketData>,
    pub cors_allow_any: bool,
}

impl AppState {
    pub fn new(
        orchestrator: ComparisonOrchestrator,
        credentials: Arc<CredentialStore>,
        market: Arc<dyn MarketData>,
    ) -> Self {
        Self {
            orchestrator,
            credentials,
            market,
            cors_allow_any: true,
        }
    }

    /// Wires the live HTTP clients for providers and market data.
    pub fn from_config(
        config: &AppConfig,
        credentials: Arc<CredentialStore>,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().build()?;
        let market: Arc<dyn MarketData> = Arc::new(MarketDataClient::new(config.market.clone())?);
        let orchestrator = ComparisonOrchestrator::from_config(config, http, market.clone());
        let mut state = Self::new(orchestrator, credentials, market);
        state.cors_allow_any = config.server.cors_allow_any;
        Ok(state)
    }
}
