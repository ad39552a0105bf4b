use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub model_id: String,
    pub display_name: String,
    pub provider: String,
    pub description: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub active: bool,
    /// Identifier sent to the provider; may carry a routing suffix such as `:free`.
    pub provider_model_id: String,
}

fn descriptor(
    model_id: &str,
    display_name: &str,
    provider: &str,
    description: &str,
    provider_model_id: &str,
) -> ModelDescriptor {
    ModelDescriptor {
        model_id: model_id.into(),
        display_name: display_name.into(),
        provider: provider.into(),
        description: description.into(),
        max_tokens: 4096,
        temperature: 0.7,
        top_p: 1.0,
        active: true,
        provider_model_id: provider_model_id.into(),
    }
}

/// The static, ordered model catalog loaded into every store on startup.
pub fn builtin_models() -> Vec<ModelDescriptor> {
    vec![
        descriptor(
            "x-ai/grok-4-fast",
            "Grok-4 Fast",
            "xAI",
            "Fast and capable AI model from xAI",
            "x-ai/grok-4-fast",
        ),
        descriptor(
            "mistralai/devstral-2512",
            "Mistral Devstral 2512",
            "Mistral AI",
            "Advanced conversational AI model from Mistral",
            "mistralai/devstral-2512:free",
        ),
        descriptor(
            "meta-llama/llama-3.3-70b-instruct",
            "Llama 3.3 70B Instruct",
            "Meta",
            "Powerful 70B parameter instruction-tuned model from Meta",
            "meta-llama/llama-3.3-70b-instruct",
        ),
    ]
}

pub fn find<'a>(catalog: &'a [ModelDescriptor], model_id: &str) -> Option<&'a ModelDescriptor> {
    catalog.iter().find(|m| m.model_id == model_id)
}

/// First active model, falling back to the first entry.
pub fn default_model(catalog: &[ModelDescriptor]) -> Option<&ModelDescriptor> {
    catalog.iter().find(|m| m.active).or_else(|| catalog.first())
}
