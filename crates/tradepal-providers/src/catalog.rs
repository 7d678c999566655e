use tradepal_types::{CostTier, ModelInfo, ProviderId, ProviderInfo};
use tradepal_vault::CredentialStore;

#[derive(Debug, Clone, Copy)]
pub struct ProviderCatalogEntry {
    pub name: &'static str,
    pub description: &'static str,
    pub models: &'static [&'static str],
    pub default_model: &'static str,
}

const OPENAI: ProviderCatalogEntry = ProviderCatalogEntry {
    name: "OpenAI",
    description: "GPT models from OpenAI",
    models: &[
        "gpt-4o",
        "gpt-4o-mini",
        "gpt-4-turbo",
        "gpt-4",
        "gpt-3.5-turbo",
    ],
    default_model: "gpt-4o-mini",
};

const ANTHROPIC: ProviderCatalogEntry = ProviderCatalogEntry {
    name: "Anthropic",
    description: "Claude models from Anthropic",
    models: &[
        "claude-3-5-sonnet-20241022",
        "claude-3-5-haiku-20241022",
        "claude-3-opus-20240229",
    ],
    default_model: "claude-3-5-sonnet-20241022",
};

const GOOGLE: ProviderCatalogEntry = ProviderCatalogEntry {
    name: "Google",
    description: "Gemini models from Google AI Studio",
    models: &["gemini-1.5-pro", "gemini-1.5-flash", "gemini-2.0-flash-exp"],
    default_model: "gemini-1.5-flash",
};

const OPENROUTER: ProviderCatalogEntry = ProviderCatalogEntry {
    name: "OpenRouter",
    description: "Open and hosted models routed through OpenRouter",
    models: &[
        "meta-llama/llama-3.1-70b-instruct",
        "deepseek/deepseek-chat",
        "mistralai/mixtral-8x7b-instruct",
        "qwen/qwen-2.5-72b-instruct:free",
    ],
    default_model: "meta-llama/llama-3.1-70b-instruct",
};

const COST_TIERS: &[(&str, CostTier)] = &[
    ("gpt-4o", CostTier::High),
    ("gpt-4o-mini", CostTier::Low),
    ("gpt-4-turbo", CostTier::High),
    ("gpt-4", CostTier::Premium),
    ("gpt-3.5-turbo", CostTier::Low),
    ("claude-3-5-sonnet-20241022", CostTier::High),
    ("claude-3-5-haiku-20241022", CostTier::Medium),
    ("claude-3-opus-20240229", CostTier::Premium),
    ("gemini-1.5-pro", CostTier::Medium),
    ("gemini-1.5-flash", CostTier::Low),
    ("gemini-2.0-flash-exp", CostTier::Low),
    ("meta-llama/llama-3.1-70b-instruct", CostTier::Medium),
    ("deepseek/deepseek-chat", CostTier::Low),
    ("mistralai/mixtral-8x7b-instruct", CostTier::Low),
    ("qwen/qwen-2.5-72b-instruct:free", CostTier::Low),
];

pub fn config_of(provider: ProviderId) -> &'static ProviderCatalogEntry {
    match provider {
        ProviderId::OpenAi => &OPENAI,
        ProviderId::Anthropic => &ANTHROPIC,
        ProviderId::Google => &GOOGLE,
        ProviderId::OpenRouter => &OPENROUTER,
    }
}

/// Unknown models are priced as `$$`.
pub fn cost_tier_of(model: &str) -> CostTier {
    COST_TIERS
        .iter()
        .find(|(name, _)| *name == model)
        .map(|(_, tier)| *tier)
        .unwrap_or(CostTier::Medium)
}

pub fn provider_info(provider: ProviderId) -> ProviderInfo {
    let entry = config_of(provider);
    ProviderInfo {
        id: provider,
        name: entry.name.to_string(),
        description: entry.description.to_string(),
        default_model: entry.default_model.to_string(),
        models: entry.models.iter().map(|m| m.to_string()).collect(),
    }
}

/// Providers whose stored key can actually be decrypted in this session.
pub fn available_providers(store: &CredentialStore) -> Vec<ProviderId> {
    ProviderId::ALL
        .into_iter()
        .filter(|provider| store.retrieve(*provider).is_some())
        .collect()
}

pub fn selectable_models(providers: &[ProviderId]) -> Vec<ModelInfo> {
    providers
        .iter()
        .flat_map(|provider| {
            let entry = config_of(*provider);
            entry.models.iter().map(move |model| ModelInfo {
                model_id: format!("{}:{}", provider.as_str(), model),
                provider: *provider,
                model: model.to_string(),
                provider_name: entry.name.to_string(),
                cost_tier: cost_tier_of(model),
            })
        })
        .collect()
}

pub fn all_selectable_models(store: &CredentialStore) -> Vec<ModelInfo> {
    selectable_models(&available_providers(store))
}
