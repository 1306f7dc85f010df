//! # Cascade Providers
//!
//! Provider implementations and the descriptors the engine constructs them from.

pub mod openai;

// Re-exports
pub use openai::{OpenAiBuilder, OpenAiDescriptor, OpenAiProvider, OPENAI_API_KEY_ENV};

/// Environment variable read by [`deepseek`]
pub const DEEPSEEK_API_KEY_ENV: &str = "DEEPSEEK_API_KEY";

/// Descriptor for a DeepSeek model (OpenAI-compatible).
///
/// DeepSeek speaks the OpenAI protocol on a different endpoint; the key is
/// read from `DEEPSEEK_API_KEY` when the engine reaches this backend.
///
/// # Example
///
/// ```ignore
/// use cascade_provider::deepseek;
///
/// let runtime = Runtime::builder()
///     .backend(deepseek("deepseek-chat"))
///     .build();
/// ```
pub fn deepseek(model: impl Into<String>) -> OpenAiDescriptor {
    OpenAiDescriptor::new(model)
        .with_provider("deepseek", "DeepSeek")
        .with_api_key_env(DEEPSEEK_API_KEY_ENV)
        .with_api_base("https://api.deepseek.com/v1")
}

#[cfg(test)]
mod tests {
    use super::*;
    use cascade_core::backend::BackendDescriptor;

    #[test]
    fn test_deepseek_descriptor() {
        let descriptor = deepseek("deepseek-chat");
        assert_eq!(descriptor.id(), "deepseek:deepseek-chat");
        assert_eq!(descriptor.model(), "deepseek-chat");
    }
}
