//! JSON output strategies for different providers.
//!
//! A registered [`SchemaEntry`] is declared to a backend in one of two ways:
//! - JsonSchemaStrategy: strict `response_format.json_schema`, named with the entry label
//! - JsonModeStrategy: basic JSON object mode with the schema injected into the prompt

use crate::error::AiError;
use crate::schema::SchemaEntry;
use crate::types::{ChatCompletionRequest, ContentPart, Message, ResponseFormat, Role};

/// Strategy for declaring an expected shape on a chat completion request.
pub trait JsonOutputStrategy: Send + Sync {
    /// Get the strategy name for debugging
    fn name(&self) -> &str;

    /// Rewrite `req` so the backend answers with JSON matching `entry`
    fn apply(&self, req: &mut ChatCompletionRequest, entry: &SchemaEntry) -> Result<(), AiError>;
}

/// Strict JSON Schema, for providers that accept `response_format.json_schema`.
///
/// The schema is already closed by the registry, which strict mode requires.
#[derive(Debug, Clone)]
pub struct JsonSchemaStrategy {
    pub strict: bool,
}

impl JsonSchemaStrategy {
    pub fn new() -> Self {
        Self { strict: true }
    }

    pub fn with_strict(strict: bool) -> Self {
        Self { strict }
    }
}

impl Default for JsonSchemaStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl JsonOutputStrategy for JsonSchemaStrategy {
    fn name(&self) -> &str {
        "JsonSchemaStrategy"
    }

    fn apply(&self, req: &mut ChatCompletionRequest, entry: &SchemaEntry) -> Result<(), AiError> {
        req.response_format = Some(ResponseFormat::JsonSchema {
            name: entry.label.clone(),
            schema: entry.schema.clone(),
            strict: self.strict,
        });
        Ok(())
    }
}

/// JSON object mode plus a prompt instruction carrying the schema.
///
/// Used for providers like DeepSeek that cannot take a schema directly.
#[derive(Debug, Clone)]
pub struct JsonModeStrategy {
    /// Inject as a leading system message (true) or append to the last user message (false)
    pub use_system_message: bool,
}

impl JsonModeStrategy {
    pub fn new() -> Self {
        Self {
            use_system_message: true,
        }
    }

    pub fn with_system_message(use_system_message: bool) -> Self {
        Self { use_system_message }
    }

    fn build_json_instruction(entry: &SchemaEntry) -> Result<String, AiError> {
        let schema_str = serde_json::to_string_pretty(&entry.schema)?;
        Ok(format!(
            "Respond with a single JSON object named {} that matches this schema:\n```json\n{}\n```\n\
            Return only the JSON object. Include every required field and no others.",
            entry.label, schema_str
        ))
    }
}

impl Default for JsonModeStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl JsonOutputStrategy for JsonModeStrategy {
    fn name(&self) -> &str {
        "JsonModeStrategy"
    }

    fn apply(&self, req: &mut ChatCompletionRequest, entry: &SchemaEntry) -> Result<(), AiError> {
        req.response_format = Some(ResponseFormat::JsonObject);
        let instruction = Self::build_json_instruction(entry)?;

        if self.use_system_message {
            req.messages.insert(0, Message::system(instruction));
            return Ok(());
        }

        match req.messages.iter_mut().rev().find(|m| m.role == Role::User) {
            Some(last_user) => last_user.content.push(ContentPart::Text {
                text: format!("\n\n{}", instruction),
            }),
            None => req.messages.push(Message::user(instruction)),
        }
        Ok(())
    }
}

/// Pick a strategy from the provider id
pub fn detect_json_strategy(provider_id: &str) -> Box<dyn JsonOutputStrategy> {
    match provider_id {
        "openai" | "azure" => Box::new(JsonSchemaStrategy::new()),
        "deepseek" => Box::new(JsonModeStrategy::new()),
        // Unknown providers get JSON mode, which every compatible API accepts
        _ => Box::new(JsonModeStrategy::new()),
    }
}
