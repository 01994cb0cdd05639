//! Provider request and response types

use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{Message, ProviderKind, Role};
use serde::{Deserialize, Serialize};

// ============================================================================
// REQUEST TYPES
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub(crate) struct ChatCompletionRequest<'a> {
    pub model: &'a str,
    pub messages: &'a [Message],
    pub temperature: f32,
    pub max_tokens: u32,
    pub stream: bool,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct AnthropicRequest<'a> {
    pub model: &'a str,
    pub messages: Vec<&'a Message>,
    pub max_tokens: u32,
    pub temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GenerateContentRequest {
    pub contents: Vec<GeminiContent>,
    pub generation_config: GenerationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeminiContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub parts: Vec<GeminiPart>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeminiPart {
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GenerationConfig {
    pub temperature: f32,
    pub max_output_tokens: u32,
    pub top_k: u32,
    pub top_p: f32,
}

impl<'a> AnthropicRequest<'a> {
    /// System messages move to the top-level `system` field
    pub fn new(model: &'a str, messages: &'a [Message], max_tokens: u32, temperature: f32) -> Self {
        let system: Vec<&str> = messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .collect();

        Self {
            model,
            messages: messages.iter().filter(|m| m.role != Role::System).collect(),
            max_tokens,
            temperature,
            system: (!system.is_empty()).then(|| system.join("\n\n")),
        }
    }
}

impl GenerateContentRequest {
    /// Gemini knows `user` and `model` turns; system text is sent as a leading user turn
    pub fn new(messages: &[Message], max_tokens: u32, temperature: f32) -> Self {
        let contents = messages
            .iter()
            .map(|m| GeminiContent {
                role: Some(match m.role {
                    Role::Assistant => "model".to_string(),
                    Role::User | Role::System => "user".to_string(),
                }),
                parts: vec![GeminiPart {
                    text: Some(m.content.clone()),
                }],
            })
            .collect();

        Self {
            contents,
            generation_config: GenerationConfig {
                temperature,
                max_output_tokens: max_tokens,
                top_k: 40,
                top_p: 0.95,
            },
        }
    }
}

// ============================================================================
// RESPONSE TYPES
// ============================================================================

/// OpenAI-compatible chat completion (OpenAI, Grok)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletion {
    #[serde(default)]
    pub id: Option<String>,
    pub model: String,
    pub choices: Vec<ChatChoice>,
    #[serde(default)]
    pub usage: Option<ChatUsage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatChoice {
    pub message: ChatMessage,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Anthropic message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnthropicMessage {
    #[serde(default)]
    pub id: Option<String>,
    pub model: String,
    pub content: Vec<ContentBlock>,
    #[serde(default)]
    pub stop_reason: Option<String>,
    pub usage: AnthropicUsage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnthropicUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// Gemini generateContent response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentResponse {
    #[serde(default)]
    pub candidates: Vec<GeminiCandidate>,
    #[serde(default)]
    pub prompt_feedback: Option<PromptFeedback>,
    #[serde(default)]
    pub usage_metadata: Option<UsageMetadata>,
    #[serde(default)]
    pub model_version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiCandidate {
    #[serde(default)]
    pub content: Option<GeminiContent>,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptFeedback {
    #[serde(default)]
    pub block_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageMetadata {
    #[serde(default)]
    pub prompt_token_count: u32,
    #[serde(default)]
    pub candidates_token_count: u32,
    #[serde(default)]
    pub total_token_count: u32,
}

/// A provider answer, parsed into the shape of the provider that produced it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "format", rename_all = "kebab-case")]
pub enum ProviderResponse {
    OpenAiCompatible(ChatCompletion),
    Anthropic(AnthropicMessage),
    Gemini(GenerateContentResponse),
}

impl ProviderResponse {
    /// Parse and validate a successful response body from `provider`
    pub fn parse(provider: ProviderKind, body: &[u8]) -> GatewayResult<Self> {
        let invalid = |reason: String| GatewayError::InvalidResponse {
            provider: provider.to_string(),
            reason,
        };

        let response = match provider {
            ProviderKind::OpenAi | ProviderKind::Grok => serde_json::from_slice(body).map(Self::OpenAiCompatible),
            ProviderKind::Anthropic => serde_json::from_slice(body).map(Self::Anthropic),
            ProviderKind::Gemini => serde_json::from_slice(body).map(Self::Gemini),
        }
        .map_err(|e| invalid(format!("unexpected body: {}", e)))?;

        response.validate(provider)?;
        Ok(response)
    }

    fn validate(&self, provider: ProviderKind) -> GatewayResult<()> {
        let invalid = |reason: &str| GatewayError::InvalidResponse {
            provider: provider.to_string(),
            reason: reason.to_string(),
        };

        match self {
            Self::OpenAiCompatible(completion) => {
                if completion.choices.is_empty() {
                    return Err(invalid("no choices"));
                }
            }
            Self::Anthropic(message) => {
                if !message.content.iter().any(|b| matches!(b, ContentBlock::Text { .. })) {
                    return Err(invalid("no text content"));
                }
            }
            Self::Gemini(response) => {
                if let Some(reason) = response.prompt_feedback.as_ref().and_then(|f| f.block_reason.as_ref()) {
                    return Err(GatewayError::validation(
                        "messages",
                        format!("blocked by provider safety filter: {}", reason),
                    ));
                }
                if response.candidates.is_empty() {
                    return Err(invalid("no candidates"));
                }
            }
        }
        Ok(())
    }

    /// Text of the first choice/candidate, or the joined text blocks
    pub fn text(&self) -> String {
        match self {
            Self::OpenAiCompatible(completion) => completion
                .choices
                .first()
                .and_then(|c| c.message.content.clone())
                .unwrap_or_default(),
            Self::Anthropic(message) => message
                .content
                .iter()
                .filter_map(|block| match block {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    ContentBlock::Other => None,
                })
                .collect::<Vec<_>>()
                .join(""),
            Self::Gemini(response) => response
                .candidates
                .first()
                .and_then(|c| c.content.as_ref())
                .map(|content| {
                    content
                        .parts
                        .iter()
                        .filter_map(|p| p.text.as_deref())
                        .collect::<Vec<_>>()
                        .join("")
                })
                .unwrap_or_default(),
        }
    }

    pub fn usage(&self) -> TokenUsage {
        match self {
            Self::OpenAiCompatible(completion) => completion
                .usage
                .as_ref()
                .map(|u| TokenUsage {
                    prompt_tokens: u.prompt_tokens,
                    completion_tokens: u.completion_tokens,
                    total_tokens: u.total_tokens,
                })
                .unwrap_or_default(),
            Self::Anthropic(message) => TokenUsage::new(message.usage.input_tokens, message.usage.output_tokens),
            Self::Gemini(response) => response
                .usage_metadata
                .as_ref()
                .map(|u| TokenUsage {
                    prompt_tokens: u.prompt_token_count,
                    completion_tokens: u.candidates_token_count,
                    total_tokens: u.total_token_count,
                })
                .unwrap_or_default(),
        }
    }

    /// Model name reported by the provider, if any
    pub fn model(&self) -> Option<&str> {
        match self {
            Self::OpenAiCompatible(completion) => Some(completion.model.as_str()),
            Self::Anthropic(message) => Some(message.model.as_str()),
            Self::Gemini(response) => response.model_version.as_deref(),
        }
    }

    /// Normalize into the uniform response shape
    pub fn into_completion(self, provider: ProviderKind, requested_model: &str) -> CompletionResponse {
        CompletionResponse {
            provider,
            model: self.model().unwrap_or(requested_model).to_string(),
            text: self.text(),
            usage: self.usage(),
            cached: false,
        }
    }
}

/// Token accounting of one completion
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// Provider-independent completion result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionResponse {
    pub provider: ProviderKind,
    pub model: String,
    pub text: String,
    pub usage: TokenUsage,
    /// Served from the response cache
    #[serde(default)]
    pub cached: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn body(value: serde_json::Value) -> Vec<u8> {
        serde_json::to_vec(&value).unwrap()
    }

    #[test]
    fn test_parse_openai_compatible() {
        let response = ProviderResponse::parse(
            ProviderKind::Grok,
            &body(json!({
                "id": "c1", "object": "chat.completion", "created": 1, "model": "grok-3-beta",
                "choices": [{"index": 0, "message": {"role": "assistant", "content": "Hi"}, "finish_reason": "stop"}],
                "usage": {"prompt_tokens": 5, "completion_tokens": 1, "total_tokens": 6}
            })),
        )
        .unwrap();

        let completion = response.into_completion(ProviderKind::Grok, "grok-3-beta");
        assert_eq!(completion.text, "Hi");
        assert_eq!(completion.usage.total_tokens, 6);
        assert!(!completion.cached);
    }

    #[test]
    fn test_empty_choices_is_invalid() {
        let err = ProviderResponse::parse(
            ProviderKind::OpenAi,
            &body(json!({"model": "gpt-3.5-turbo", "choices": []})),
        )
        .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidResponse { .. }));
    }

    #[test]
    fn test_parse_anthropic_joins_text_blocks() {
        let response = ProviderResponse::parse(
            ProviderKind::Anthropic,
            &body(json!({
                "id": "msg_1", "type": "message", "role": "assistant", "model": "claude-3-haiku-20240307",
                "content": [{"type": "text", "text": "Hello "}, {"type": "tool_use", "id": "t"}, {"type": "text", "text": "there"}],
                "stop_reason": "end_turn",
                "usage": {"input_tokens": 10, "output_tokens": 3}
            })),
        )
        .unwrap();
        assert_eq!(response.text(), "Hello there");
        assert_eq!(response.usage(), TokenUsage::new(10, 3));
    }

    #[test]
    fn test_gemini_block_and_candidates() {
        let blocked = ProviderResponse::parse(
            ProviderKind::Gemini,
            &body(json!({"promptFeedback": {"blockReason": "SAFETY"}})),
        )
        .unwrap_err();
        assert!(matches!(blocked, GatewayError::Validation { .. }));

        let response = ProviderResponse::parse(
            ProviderKind::Gemini,
            &body(json!({
                "candidates": [{"content": {"role": "model", "parts": [{"text": "Bonjour"}]}, "finishReason": "STOP"}],
                "usageMetadata": {"promptTokenCount": 4, "candidatesTokenCount": 2, "totalTokenCount": 6}
            })),
        )
        .unwrap();
        let completion = response.into_completion(ProviderKind::Gemini, "gemini-1.5-flash-8b");
        assert_eq!(completion.text, "Bonjour");
        assert_eq!(completion.model, "gemini-1.5-flash-8b");
        assert_eq!(completion.usage.total_tokens, 6);
    }

    #[test]
    fn test_garbage_body_is_invalid() {
        let err = ProviderResponse::parse(ProviderKind::Anthropic, b"<html>").unwrap_err();
        assert_eq!(err.error_type(), "invalid_response");
    }

    #[test]
    fn test_anthropic_request_lifts_system() {
        let messages = vec![Message::system("Be brief."), Message::user("Hi")];
        let request = AnthropicRequest::new("claude", &messages, 100, 0.5);
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["system"], "Be brief.");
        assert_eq!(json["messages"].as_array().unwrap().len(), 1);
        assert_eq!(json["messages"][0]["role"], "user");
    }

    #[test]
    fn test_gemini_request_shape() {
        let messages = vec![Message::user("Hi"), Message::assistant("Hello")];
        let json = serde_json::to_value(GenerateContentRequest::new(&messages, 256, 0.7)).unwrap();
        assert_eq!(json["contents"][1]["role"], "model");
        assert_eq!(json["contents"][0]["parts"][0]["text"], "Hi");
        assert_eq!(json["generationConfig"]["maxOutputTokens"], 256);
    }
}
