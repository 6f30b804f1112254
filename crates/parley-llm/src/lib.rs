pub mod providers;
pub mod retry;

use std::sync::Arc;

use parley_core::config::AppConfig;
use parley_core::traits::LanguageModel;

pub use providers::openai::OpenAiClient;
pub use retry::RetryingClient;

/// Build the language model from config: the primary model with retries,
/// then each fallback model in order.
pub fn create_client(config: &AppConfig) -> Arc<dyn LanguageModel> {
    let primary = Box::new(OpenAiClient::new(config.model.clone()));
    let fallbacks = config
        .fallback_models
        .iter()
        .map(|model| {
            let label = format!("{}/{}", model.provider, model.model_id);
            (label, Box::new(OpenAiClient::new(model.clone())) as Box<dyn LanguageModel>)
        })
        .collect();
    let retry = config.model.retry.clone().unwrap_or_default();
    Arc::new(RetryingClient::new(primary, fallbacks, retry))
}
