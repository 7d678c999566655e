use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::fs;

use tradepal_market::MarketConfig;
use tradepal_providers::{GenerationOptions, ProviderEndpoints};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub hostname: String,
    pub port: u16,
    pub cors_allow_any: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            hostname: "127.0.0.1".to_string(),
            port: 8787,
            cors_allow_any: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrichmentMode {
    /// Quote, headlines, options flow and unusual activity.
    #[default]
    Full,
    PriceOnly,
}

impl EnrichmentMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "full" => Some(Self::Full),
            "price_only" | "price" => Some(Self::PriceOnly),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EnrichmentConfig {
    pub mode: EnrichmentMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub timeout_secs: u64,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 120,
            max_tokens: 1024,
            temperature: 0.2,
        }
    }
}

impl GenerationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }

    pub fn options(&self) -> GenerationOptions {
        GenerationOptions {
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProviderEndpointConfig {
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ProvidersConfig {
    pub openai: ProviderEndpointConfig,
    pub anthropic: ProviderEndpointConfig,
    pub google: ProviderEndpointConfig,
    pub openrouter: ProviderEndpointConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub market: MarketConfig,
    pub enrichment: EnrichmentConfig,
    pub generation: GenerationConfig,
    pub providers: ProvidersConfig,
}

impl AppConfig {
    pub fn endpoints(&self) -> ProviderEndpoints {
        let mut endpoints = ProviderEndpoints::default();
        let overrides = [
            (&mut endpoints.openai, &self.providers.openai),
            (&mut endpoints.anthropic, &self.providers.anthropic),
            (&mut endpoints.google, &self.providers.google),
            (&mut endpoints.openrouter, &self.providers.openrouter),
        ];
        for (slot, cfg) in overrides {
            if let Some(url) = cfg.url.as_deref().map(str::trim).filter(|u| !u.is_empty()) {
                *slot = url.to_string();
            }
        }
        endpoints
    }
}

#[derive(Debug, Clone, Default)]
struct ConfigLayers {
    file: Value,
    env: Value,
    cli: Value,
}

/// Layered JSON configuration: config file, environment and CLI overrides,
/// merged in that order.
#[derive(Clone)]
pub struct ConfigStore {
    path: PathBuf,
    layers: ConfigLayers,
}

impl ConfigStore {
    pub async fn new(path: impl AsRef<Path>, cli_overrides: Option<Value>) -> anyhow::Result<Self> {
        Self::with_env(path, cli_overrides, env_layer(|key| std::env::var(key).ok())).await
    }

    async fn with_env(
        path: impl AsRef<Path>,
        cli_overrides: Option<Value>,
        env: Value,
    ) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = read_json_file(&path).await?;
        let layers = ConfigLayers {
            file,
            env,
            cli: cli_overrides.unwrap_or_else(empty_object),
        };
        Ok(Self { path, layers })
    }

    pub fn get(&self) -> AppConfig {
        let merged = self.effective_value();
        match serde_json::from_value(merged) {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %err,
                    "invalid config, using defaults"
                );
                AppConfig::default()
            }
        }
    }

    fn effective_value(&self) -> Value {
        let mut merged = empty_object();
        deep_merge(&mut merged, &self.layers.file);
        deep_merge(&mut merged, &self.layers.env);
        deep_merge(&mut merged, &self.layers.cli);
        merged
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

async fn read_json_file(path: &Path) -> anyhow::Result<Value> {
    if !path.exists() {
        return Ok(empty_object());
    }
    let raw = fs::read_to_string(path).await?;
    match serde_json::from_str::<Value>(&raw) {
        Ok(value) => Ok(value),
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "ignoring unparseable config file"
            );
            Ok(empty_object())
        }
    }
}

fn env_layer(lookup: impl Fn(&str) -> Option<String>) -> Value {
    let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
    let mut root = empty_object();

    if let Some(host) = var("TRADEPAL_HOST") {
        deep_merge(&mut root, &json!({ "server": { "hostname": host } }));
    }
    if let Some(port) = var("TRADEPAL_PORT").and_then(|v| v.trim().parse::<u16>().ok()) {
        deep_merge(&mut root, &json!({ "server": { "port": port } }));
    }
    if let Some(cors) = var("TRADEPAL_CORS_ALLOW_ANY").and_then(|v| parse_bool_like(&v)) {
        deep_merge(&mut root, &json!({ "server": { "cors_allow_any": cors } }));
    }
    if let Some(url) = var("TRADEPAL_BACKEND_URL") {
        deep_merge(&mut root, &json!({ "market": { "backend_base_url": url } }));
    }
    if let Some(mode) = var("TRADEPAL_ENRICHMENT_MODE").and_then(|v| EnrichmentMode::parse(&v)) {
        deep_merge(&mut root, &json!({ "enrichment": { "mode": mode } }));
    }
    if let Some(secs) =
        var("TRADEPAL_GENERATION_TIMEOUT_SECS").and_then(|v| v.trim().parse::<u64>().ok())
    {
        deep_merge(&mut root, &json!({ "generation": { "timeout_secs": secs } }));
    }

    for (provider, key) in [
        ("openai", "OPENAI_BASE_URL"),
        ("anthropic", "ANTHROPIC_BASE_URL"),
        ("google", "GOOGLE_BASE_URL"),
        ("openrouter", "OPENROUTER_BASE_URL"),
    ] {
        if let Some(url) = var(key) {
            deep_merge(&mut root, &json!({ "providers": { provider: { "url": url } } }));
        }
    }

    root
}

fn parse_bool_like(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn deep_merge(base: &mut Value, overlay: &Value) {
    if overlay.is_null() {
        return;
    }
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                if value.is_null() {
                    continue;
                }
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base_value, overlay_value) => {
            *base_value = overlay_value.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_from(pairs: &[(&str, &str)]) -> Value {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        env_layer(|key| map.get(key).cloned())
    }

    #[tokio::test]
    async fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ConfigStore::with_env(dir.path().join("config.json"), None, empty_object())
            .await
            .expect("store");
        let config = store.get();
        assert_eq!(config.server.port, 8787);
        assert_eq!(config.enrichment.mode, EnrichmentMode::Full);
        assert_eq!(config.generation.timeout_secs, 120);
        assert_eq!(config.endpoints().openai, "https://api.openai.com/v1");
    }

    #[tokio::test]
    async fn layers_merge_file_then_env_then_cli() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{"server":{"hostname":"0.0.0.0","port":9000},"market":{"quote_timeout_secs":5}}"#,
        )
        .await
        .expect("write");

        let env = env_from(&[
            ("TRADEPAL_PORT", "9100"),
            ("TRADEPAL_ENRICHMENT_MODE", "price-only"),
            ("OPENROUTER_BASE_URL", "http://proxy.local/v1"),
        ]);
        let store = ConfigStore::with_env(&path, Some(json!({"server": {"port": 9200}})), env)
            .await
            .expect("store");
        let config = store.get();

        assert_eq!(config.server.hostname, "0.0.0.0");
        assert_eq!(config.server.port, 9200);
        assert_eq!(config.market.quote_timeout_secs, 5);
        assert_eq!(config.market.options_timeout_secs, 15);
        assert_eq!(config.enrichment.mode, EnrichmentMode::PriceOnly);
        assert_eq!(config.endpoints().openrouter, "http://proxy.local/v1");
        assert_eq!(config.endpoints().anthropic, "https://api.anthropic.com");
    }

    #[tokio::test]
    async fn env_overrides_file_and_cli_overrides_both() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"generation": {"timeout_secs": 60, "max_tokens": 2048}, "server": {"port": 9100}}"#,
        )
        .expect("write config");
        let store = ConfigStore::with_env(
            &path,
            Some(json!({"generation": {"timeout_secs": 30}})),
            json!({"generation": {"timeout_secs": 45}, "server": {"port": 9300}}),
        )
        .await
        .expect("store");
        let config = store.get();
        assert_eq!(config.generation.timeout_secs, 30);
        assert_eq!(config.generation.max_tokens, 2048);
        assert_eq!(config.server.port, 9300);
    }

    #[test]
    fn env_layer_ignores_blank_and_unparseable_values() {
        let env = env_from(&[
            ("TRADEPAL_HOST", "  "),
            ("TRADEPAL_PORT", "not-a-port"),
            ("TRADEPAL_BACKEND_URL", "http://localhost:8000"),
            ("TRADEPAL_ENRICHMENT_MODE", "everything"),
        ]);
        assert_eq!(
            env,
            json!({"market": {"backend_base_url": "http://localhost:8000"}})
        );
    }

    #[test]
    fn deep_merge_skips_null_overlay_values() {
        let mut base = json!({"server": {"port": 1}});
        deep_merge(&mut base, &json!({"server": {"port": null, "hostname": "h"}}));
        assert_eq!(base, json!({"server": {"port": 1, "hostname": "h"}}));
    }
}
