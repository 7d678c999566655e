use std::collections::HashMap;

use thiserror::Error;

use tradepal_providers::config_of;
use tradepal_types::{ModelIdError, ModelRequest, ProviderId};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CompareRequestError {
    #[error("Either modelIds or providers must be provided")]
    MissingTargets,
    #[error(transparent)]
    InvalidModelId(#[from] ModelIdError),
}

/// Builds the per-model work list. `model_ids` wins over `providers`; a
/// provider without an entry in `models` uses its catalog default.
pub fn resolve_model_requests(
    model_ids: &[String],
    providers: &[String],
    models: &HashMap<String, String>,
) -> Result<Vec<ModelRequest>, CompareRequestError> {
    let mut requests: Vec<ModelRequest> = Vec::new();

    if !model_ids.is_empty() {
        for id in model_ids {
            let request = ModelRequest::parse(id)?;
            if !requests.iter().any(|r| r.model_id == request.model_id) {
                requests.push(request);
            }
        }
        return Ok(requests);
    }

    if providers.is_empty() {
        return Err(CompareRequestError::MissingTargets);
    }
    for raw in providers {
        let provider: ProviderId = raw.parse()?;
        let model = models
            .get(raw)
            .or_else(|| models.get(provider.as_str()))
            .map(|m| m.trim())
            .filter(|m| !m.is_empty())
            .unwrap_or(config_of(provider).default_model);
        let request = ModelRequest::new(provider, model);
        if !requests.iter().any(|r| r.model_id == request.model_id) {
            requests.push(request);
        }
    }
    Ok(requests)
}
