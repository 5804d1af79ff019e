use serde::{Deserialize, Serialize};

/// How a model expects its sampling parameters.
///
/// Reasoning families reject `temperature` and take their output budget as
/// `max_completion_tokens` instead of `max_tokens`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFamily {
    Standard,
    Reasoning,
}

const REASONING_PREFIXES: &[&str] = &["o1", "o3", "o4", "gpt-5"];

impl ModelFamily {
    /// Classify a model id such as `openai/o3-mini` or `gpt-4o`.
    pub fn from_id(model_id: &str) -> Self {
        let bare = model_id
            .rsplit('/')
            .next()
            .unwrap_or(model_id)
            .trim()
            .to_ascii_lowercase();
        let is_reasoning = REASONING_PREFIXES.iter().any(|prefix| {
            bare.strip_prefix(prefix).is_some_and(|rest| {
                rest.is_empty() || rest.starts_with(|c: char| matches!(c, '-' | ':' | '.'))
            })
        });
        if is_reasoning {
            ModelFamily::Reasoning
        } else {
            ModelFamily::Standard
        }
    }

    pub fn supports_temperature(&self) -> bool {
        matches!(self, ModelFamily::Standard)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct CompletionTokensDetails {
    #[serde(default)]
    pub reasoning_tokens: u32,
}

/// API usage information from the completion service.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_tokens_details: Option<CompletionTokensDetails>,
    /// Cost in USD when the provider reports it (`total_cost`).
    #[serde(default, alias = "total_cost", skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
}

impl Usage {
    /// Tokens spent on hidden reasoning, if the provider reported any.
    pub fn reasoning_tokens(&self) -> u32 {
        self.completion_tokens_details
            .as_ref()
            .map(|d| d.reasoning_tokens)
            .unwrap_or(0)
    }

    pub fn cost(&self) -> f64 {
        self.cost.unwrap_or(0.0)
    }
}

/// Merge two optional `Usage` values, summing their token counts and costs.
pub fn merge_usage(primary: Option<Usage>, secondary: Option<Usage>) -> Option<Usage> {
    match (primary, secondary) {
        (Some(p), Some(s)) => {
            let reasoning = p.reasoning_tokens() + s.reasoning_tokens();
            Some(Usage {
                prompt_tokens: p.prompt_tokens + s.prompt_tokens,
                completion_tokens: p.completion_tokens + s.completion_tokens,
                total_tokens: p.total_tokens + s.total_tokens,
                completion_tokens_details: (p.completion_tokens_details.is_some()
                    || s.completion_tokens_details.is_some())
                .then_some(CompletionTokensDetails {
                    reasoning_tokens: reasoning,
                }),
                cost: match (p.cost, s.cost) {
                    (Some(pc), Some(sc)) => Some(pc + sc),
                    (pc, sc) => pc.or(sc),
                },
            })
        }
        (Some(p), None) => Some(p),
        (None, Some(s)) => Some(s),
        (None, None) => None,
    }
}
