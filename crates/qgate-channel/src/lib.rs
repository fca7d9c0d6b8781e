//! Concrete channel adapters and the registry wiring for them.

mod anthropic;
mod client;
mod openai;
mod streaming;
pub mod translate;
mod util;
mod vertex;

pub use anthropic::AnthropicAdapter;
pub use openai::OpenAiAdapter;
pub use vertex::VertexAdapter;

use qgate_relay::{AdapterRegistry, ApiType};

/// Registry with every built-in adapter family registered.
pub fn default_registry() -> AdapterRegistry {
    let mut registry = AdapterRegistry::new();
    registry.register(ApiType::Anthropic, || Box::new(AnthropicAdapter));
    registry.register(ApiType::OpenAI, || Box::new(OpenAiAdapter));
    registry.register(ApiType::Vertex, || Box::<VertexAdapter>::default());
    registry
}
