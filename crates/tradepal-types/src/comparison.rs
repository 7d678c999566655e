use serde::{Deserialize, Serialize};

use crate::{ModelIdError, ProviderId};

/// One unit of comparison work. `model_id` (`provider:model`) is the join key
/// carried through to the matching [`ComparisonResult`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelRequest {
    pub model_id: String,
    pub provider: ProviderId,
    pub model: String,
}

impl ModelRequest {
    pub fn new(provider: ProviderId, model: impl Into<String>) -> Self {
        let model = model.into();
        Self {
            model_id: format!("{}:{}", provider.as_str(), model),
            provider,
            model,
        }
    }

    pub fn parse(model_id: &str) -> Result<Self, ModelIdError> {
        let (provider, model) = parse_model_id(model_id)?;
        Ok(Self {
            model_id: model_id.trim().to_string(),
            provider,
            model,
        })
    }
}

/// Splits `provider:model` on the first colon only; model names such as
/// `qwen/qwen-2.5-72b-instruct:free` keep their own colons.
pub fn parse_model_id(model_id: &str) -> Result<(ProviderId, String), ModelIdError> {
    let trimmed = model_id.trim();
    let Some((provider, model)) = trimmed.split_once(':') else {
        return Err(ModelIdError::Malformed(trimmed.to_string()));
    };
    if model.trim().is_empty() {
        return Err(ModelIdError::Malformed(trimmed.to_string()));
    }
    let provider = provider.parse::<ProviderId>()?;
    Ok((provider, model.trim().to_string()))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComparisonResult {
    pub model_id: String,
    pub provider: String,
    pub model: String,
    pub content: String,
    pub error: Option<String>,
    pub completed: bool,
}

impl ComparisonResult {
    pub fn success(request: &ModelRequest, content: String) -> Self {
        Self {
            model_id: request.model_id.clone(),
            provider: request.provider.as_str().to_string(),
            model: request.model.clone(),
            content,
            error: None,
            completed: true,
        }
    }

    pub fn failure(request: &ModelRequest, error: impl Into<String>) -> Self {
        Self {
            model_id: request.model_id.clone(),
            provider: request.provider.as_str().to_string(),
            model: request.model.clone(),
            content: String::new(),
            error: Some(error.into()),
            completed: false,
        }
    }

    /// Entry for a pipeline whose task died before producing a result.
    pub fn unknown_failure(model_id: &str, error: impl Into<String>) -> Self {
        Self {
            model_id: model_id.to_string(),
            provider: "unknown".to_string(),
            model: "unknown".to_string(),
            content: String::new(),
            error: Some(error.into()),
            completed: false,
        }
    }

    pub fn is_success(&self) -> bool {
        self.completed && self.error.is_none() && !self.content.trim().is_empty()
    }
}
