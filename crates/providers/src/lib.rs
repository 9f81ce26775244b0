//! `ag-providers` — LLM provider adapters.
//!
//! The gateway talks to any endpoint that follows the OpenAI chat-completions
//! contract (OpenAI, Azure-compatible proxies, Ollama, vLLM, DeepSeek, ...).
//! [`LlmProvider`] is the seam; [`OpenAiCompatProvider`] is the production
//! implementation. Providers are cheap to construct and are built per turn
//! from the turn's config snapshot, so per-user model/endpoint overrides
//! apply without any shared registry.

pub mod openai_compat;
pub mod traits;
mod util;

pub use openai_compat::OpenAiCompatProvider;
pub use traits::{ChatRequest, ChatResponse, LlmProvider};
pub use util::from_reqwest;

use ag_domain::config::ConfigSnapshot;
use ag_domain::Result;
use std::sync::Arc;

/// Build the provider for one turn from the snapshot captured at its start.
pub fn provider_for(snapshot: &ConfigSnapshot) -> Result<Arc<dyn LlmProvider>> {
    Ok(Arc::new(OpenAiCompatProvider::from_api_config(
        &snapshot.config.api,
    )?))
}
