//! OpenAI-compatible provider using the async-openai crate.
//!
//! `OpenAiProvider` is the `invoke` half of a backend; `OpenAiDescriptor`
//! is the `construct` half, reading its API key from the environment when
//! the engine reaches it.

use async_openai::config::OpenAIConfig;
use async_openai::types::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CompletionUsage, CreateChatCompletionRequest, CreateChatCompletionRequestArgs,
    CreateChatCompletionResponse, CreateChatCompletionStreamResponse,
    FinishReason as OpenAIFinishReason, ResponseFormat as OpenAIResponseFormat,
    ResponseFormatJsonSchema as OpenAIResponseFormatJsonSchema, Role as OpenAIRole,
};
use async_openai::Client;
use async_trait::async_trait;
use cascade_core::backend::BackendDescriptor;
use cascade_core::error::AiError;
use cascade_core::provider::{ChatCompletionStream, ModelHandle, Provider};
use cascade_core::types::*;
use futures::stream::StreamExt;
use std::sync::Arc;

/// Environment variable read by [`OpenAiDescriptor::new`]
pub const OPENAI_API_KEY_ENV: &str = "OPENAI_API_KEY";

/// OpenAI provider using async-openai
#[derive(Clone)]
pub struct OpenAiProvider {
    client: Client<OpenAIConfig>,
    info: Arc<ProviderInfo>,
}

impl std::fmt::Debug for OpenAiProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiProvider")
            .field("info", &self.info)
            .finish()
    }
}

impl OpenAiProvider {
    pub fn builder() -> OpenAiBuilder {
        OpenAiBuilder::default()
    }

    fn convert_message(msg: &Message) -> Result<ChatCompletionRequestMessage, AiError> {
        let content = msg.joined_text();
        let built = match msg.role {
            Role::System => ChatCompletionRequestSystemMessageArgs::default()
                .content(content)
                .build()
                .map(ChatCompletionRequestMessage::System),
            Role::User => ChatCompletionRequestUserMessageArgs::default()
                .content(content)
                .build()
                .map(ChatCompletionRequestMessage::User),
            Role::Assistant => ChatCompletionRequestAssistantMessageArgs::default()
                .content(content)
                .build()
                .map(ChatCompletionRequestMessage::Assistant),
        };
        built.map_err(|e| AiError::invalid_request(format!("Failed to build {:?} message: {}", msg.role, e)))
    }

    fn convert_response_format(format: &ResponseFormat) -> OpenAIResponseFormat {
        match format {
            ResponseFormat::Text => OpenAIResponseFormat::Text,
            ResponseFormat::JsonObject => OpenAIResponseFormat::JsonObject,
            ResponseFormat::JsonSchema {
                name,
                schema,
                strict,
            } => OpenAIResponseFormat::JsonSchema {
                json_schema: OpenAIResponseFormatJsonSchema {
                    name: name.clone(),
                    schema: Some(schema.clone()),
                    strict: Some(*strict),
                    description: None,
                },
            },
        }
    }

    fn convert_role(role: &OpenAIRole) -> Role {
        match role {
            OpenAIRole::System => Role::System,
            OpenAIRole::User => Role::User,
            _ => Role::Assistant,
        }
    }

    fn convert_finish_reason(reason: OpenAIFinishReason) -> FinishReason {
        match reason {
            OpenAIFinishReason::Stop => FinishReason::Stop,
            OpenAIFinishReason::Length => FinishReason::Length,
            OpenAIFinishReason::ContentFilter => FinishReason::ContentFilter,
            OpenAIFinishReason::ToolCalls => FinishReason::Other("tool_calls".to_string()),
            OpenAIFinishReason::FunctionCall => FinishReason::Other("function_call".to_string()),
        }
    }

    fn convert_usage(usage: Option<CompletionUsage>) -> Usage {
        usage.map_or_else(Usage::default, |u| Usage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        })
    }

    fn build_request(req: &ChatCompletionRequest) -> Result<CreateChatCompletionRequest, AiError> {
        let messages = req
            .messages
            .iter()
            .map(Self::convert_message)
            .collect::<Result<Vec<_>, _>>()?;

        let mut builder = CreateChatCompletionRequestArgs::default();
        builder.model(&req.model).messages(messages);

        if let Some(max_tokens) = req.max_tokens {
            builder.max_tokens(max_tokens);
        }
        if let Some(temperature) = req.temperature {
            builder.temperature(temperature);
        }
        if let Some(response_format) = &req.response_format {
            builder.response_format(Self::convert_response_format(response_format));
        }
        if let Some(stream) = req.stream {
            builder.stream(stream);
        }

        builder
            .build()
            .map_err(|e| AiError::invalid_request(format!("Failed to build request: {}", e)))
    }

    fn convert_response(response: CreateChatCompletionResponse) -> ChatCompletionResponse {
        let choices = response
            .choices
            .into_iter()
            .map(|choice| Choice {
                index: choice.index,
                message: Message {
                    role: Self::convert_role(&choice.message.role),
                    content: vec![ContentPart::Text {
                        text: choice.message.content.unwrap_or_default(),
                    }],
                },
                finish_reason: choice
                    .finish_reason
                    .map_or(FinishReason::Stop, Self::convert_finish_reason),
            })
            .collect();

        ChatCompletionResponse {
            id: response.id,
            model: response.model,
            choices,
            usage: Self::convert_usage(response.usage),
            created: Some(u64::from(response.created)),
        }
    }

    fn convert_stream_chunk(response: CreateChatCompletionStreamResponse) -> ChatCompletionChunk {
        let choices = response
            .choices
            .into_iter()
            .map(|choice| ChoiceDelta {
                index: choice.index,
                delta: MessageDelta {
                    role: choice.delta.role.as_ref().map(Self::convert_role),
                    content: choice.delta.content,
                    reasoning: None,
                },
                finish_reason: choice.finish_reason.map(Self::convert_finish_reason),
            })
            .collect();

        ChatCompletionChunk {
            id: response.id,
            model: response.model,
            choices,
            usage: response.usage.map(|u| Self::convert_usage(Some(u))),
        }
    }
}

/// Map async-openai errors onto the retryable / non-retryable split.
///
/// async-openai carries its own reqwest major, so transport errors are
/// classified here rather than converted into `AiError::Network`.
fn convert_error(error: async_openai::error::OpenAIError) -> AiError {
    use async_openai::error::OpenAIError;

    match error {
        OpenAIError::Reqwest(e) if e.is_timeout() => AiError::timeout(e.to_string()),
        OpenAIError::Reqwest(e) => AiError::provider(format!("OpenAI transport error: {}", e)),
        OpenAIError::ApiError(api) => {
            let code = api.code.clone().unwrap_or_default();
            match code.as_str() {
                "rate_limit_exceeded" => AiError::rate_limit(api.message),
                "invalid_api_key" => AiError::authentication(api.message),
                _ => AiError::provider(format!("API error: {}", api.message)),
            }
        }
        OpenAIError::JSONDeserialize(e, _) => AiError::Serialization(e),
        other => AiError::provider(other.to_string()),
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn info(&self) -> Arc<ProviderInfo> {
        self.info.clone()
    }

    async fn chat_completion(
        &self,
        req: ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse, AiError> {
        let openai_req = Self::build_request(&req)?;
        let response = self
            .client
            .chat()
            .create(openai_req)
            .await
            .map_err(convert_error)?;
        Ok(Self::convert_response(response))
    }

    async fn stream_chat_completion(
        &self,
        req: ChatCompletionRequest,
    ) -> Result<Box<ChatCompletionStream>, AiError> {
        let mut openai_req = Self::build_request(&req)?;
        openai_req.stream = Some(true);

        let stream = self
            .client
            .chat()
            .create_stream(openai_req)
            .await
            .map_err(convert_error)?;

        let chat_stream = stream.map(|result| {
            result
                .map(Self::convert_stream_chunk)
                .map_err(|e| AiError::stream(e.to_string()))
        });
        Ok(Box::new(chat_stream))
    }
}

/// Builder for OpenAI-compatible providers
#[derive(Debug, Default)]
pub struct OpenAiBuilder {
    api_key: Option<String>,
    api_base: Option<String>,
    org_id: Option<String>,
}

impl OpenAiBuilder {
    pub fn api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Set API base URL (for OpenAI-compatible APIs like DeepSeek)
    pub fn api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = Some(api_base.into());
        self
    }

    pub fn organization(mut self, org_id: impl Into<String>) -> Self {
        self.org_id = Some(org_id.into());
        self
    }

    pub fn build(self) -> Result<OpenAiProvider, AiError> {
        self.build_with_id("openai", "OpenAI")
    }

    /// Build with a custom provider id and name, for OpenAI-compatible APIs
    pub fn build_with_id(
        self,
        provider_id: impl Into<String>,
        provider_name: impl Into<String>,
    ) -> Result<OpenAiProvider, AiError> {
        let api_key = self
            .api_key
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| AiError::configuration("API key is required"))?;

        let mut config = OpenAIConfig::new().with_api_key(api_key);
        if let Some(api_base) = self.api_base {
            config = config.with_api_base(api_base);
        }
        if let Some(org_id) = self.org_id {
            config = config.with_org_id(org_id);
        }

        Ok(OpenAiProvider {
            client: Client::with_config(config),
            info: Arc::new(ProviderInfo {
                id: provider_id.into(),
                name: provider_name.into(),
            }),
        })
    }
}

/// Descriptor that builds an OpenAI-compatible provider on demand.
///
/// Construction fails with [`AiError::Configuration`] when the API key
/// variable is unset, so a missing credential becomes a construction-stage
/// attempt and the engine moves on.
#[derive(Debug, Clone)]
pub struct OpenAiDescriptor {
    id: String,
    model: String,
    provider_id: String,
    provider_name: String,
    api_key_env: String,
    api_base: Option<String>,
}

impl OpenAiDescriptor {
    /// OpenAI `model`, keyed by `OPENAI_API_KEY`
    pub fn new(model: impl Into<String>) -> Self {
        let model = model.into();
        Self {
            id: format!("openai:{}", model),
            model,
            provider_id: "openai".to_string(),
            provider_name: "OpenAI".to_string(),
            api_key_env: OPENAI_API_KEY_ENV.to_string(),
            api_base: None,
        }
    }

    pub fn with_api_key_env(mut self, env: impl Into<String>) -> Self {
        self.api_key_env = env.into();
        self
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = Some(api_base.into());
        self
    }

    /// Present as another OpenAI-compatible provider; also resets the id
    pub fn with_provider(mut self, id: impl Into<String>, name: impl Into<String>) -> Self {
        self.provider_id = id.into();
        self.provider_name = name.into();
        self.id = format!("{}:{}", self.provider_id, self.model);
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

impl BackendDescriptor for OpenAiDescriptor {
    type Handle = ModelHandle;

    fn id(&self) -> &str {
        &self.id
    }

    fn construct(&self) -> Result<ModelHandle, AiError> {
        let api_key = std::env::var(&self.api_key_env)
            .ok()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| {
                AiError::configuration(format!("{} is not set", self.api_key_env))
            })?;

        let mut builder = OpenAiProvider::builder().api_key(api_key);
        if let Some(api_base) = &self.api_base {
            builder = builder.api_base(api_base.clone());
        }
        let provider = builder.build_with_id(self.provider_id.clone(), self.provider_name.clone())?;

        tracing::debug!("Constructed {} for model {}", self.provider_id, self.model);
        Ok(ModelHandle::new(Arc::new(provider), self.model.clone()))
    }
}
