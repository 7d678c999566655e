use serde::Serialize;

use tradepal_types::{ComparisonResult, ModelRequest};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SlotState {
    Loading,
    Succeeded { content: String },
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultSlot {
    pub model_id: String,
    pub provider: String,
    pub model: String,
    #[serde(flatten)]
    pub state: SlotState,
}

/// Per-model progress for one comparison. Slots start loading and settle
/// once; later results for a settled slot are dropped.
#[derive(Debug, Clone, Default)]
pub struct ResultBoard {
    slots: Vec<ResultSlot>,
}

impl ResultBoard {
    pub fn new(requests: &[ModelRequest]) -> Self {
        Self {
            slots: requests
                .iter()
                .map(|request| ResultSlot {
                    model_id: request.model_id.clone(),
                    provider: request.provider.as_str().to_string(),
                    model: request.model.clone(),
                    state: SlotState::Loading,
                })
                .collect(),
        }
    }

    /// Returns `true` when the result moved a loading slot to a final state.
    pub fn settle(&mut self, result: &ComparisonResult) -> bool {
        let Some(slot) = self
            .slots
            .iter_mut()
            .find(|slot| slot.model_id == result.model_id)
        else {
            tracing::debug!(model_id = %result.model_id, "result for unknown slot ignored");
            return false;
        };
        if slot.state != SlotState::Loading {
            return false;
        }

        slot.state = match result.error.as_deref().map(str::trim) {
            Some(error) if !error.is_empty() => SlotState::Failed {
                error: error.to_string(),
            },
            _ if result.completed && !result.content.trim().is_empty() => SlotState::Succeeded {
                content: result.content.clone(),
            },
            _ => SlotState::Failed {
                error: format!("No response received from {}", slot.model),
            },
        };
        true
    }

    pub fn get(&self, model_id: &str) -> Option<&ResultSlot> {
        self.slots.iter().find(|slot| slot.model_id == model_id)
    }

    pub fn snapshot(&self) -> &[ResultSlot] {
        &self.slots
    }

    pub fn is_finished(&self) -> bool {
        self.slots
            .iter()
            .all(|slot| slot.state != SlotState::Loading)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tradepal_types::ProviderId;

    fn requests() -> Vec<ModelRequest> {
        vec![
            ModelRequest::new(ProviderId::OpenAi, "gpt-4o"),
            ModelRequest::new(ProviderId::Google, "gemini-1.5-flash"),
        ]
    }

    #[test]
    fn slots_settle_once() {
        let requests = requests();
        let mut board = ResultBoard::new(&requests);
        assert!(!board.is_finished());

        assert!(board.settle(&ComparisonResult::success(&requests[0], "hi".to_string())));
        assert!(!board.settle(&ComparisonResult::failure(&requests[0], "late failure")));
        assert_eq!(
            board.get("openai:gpt-4o").map(|s| &s.state),
            Some(&SlotState::Succeeded {
                content: "hi".to_string()
            })
        );

        assert!(board.settle(&ComparisonResult::failure(&requests[1], "boom")));
        assert!(board.is_finished());
    }

    #[test]
    fn blank_completed_result_is_reported_as_failure() {
        let requests = requests();
        let mut board = ResultBoard::new(&requests);
        let blank = ComparisonResult::success(&requests[1], "   ".to_string());
        assert!(board.settle(&blank));
        assert_eq!(
            board.get("google:gemini-1.5-flash").map(|s| &s.state),
            Some(&SlotState::Failed {
                error: "No response received from gemini-1.5-flash".to_string()
            })
        );
    }

    #[test]
    fn unknown_model_ids_are_ignored() {
        let requests = requests();
        let mut board = ResultBoard::new(&requests);
        let stray = ComparisonResult::unknown_failure("anthropic:claude-9", "lost");
        assert!(!board.settle(&stray));
        assert_eq!(board.snapshot().len(), 2);
    }

    #[test]
    fn placeholder_for_known_id_fails_its_slot() {
        let requests = requests();
        let mut board = ResultBoard::new(&requests);
        let placeholder = ComparisonResult::unknown_failure("openai:gpt-4o", "task aborted");
        assert!(board.settle(&placeholder));
        assert!(matches!(
            board.get("openai:gpt-4o").map(|s| &s.state),
            Some(SlotState::Failed { .. })
        ));
    }
}
