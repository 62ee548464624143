//! LLM client trait and provider implementations.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::schema::validates;

use super::types::{
    ChatMessage, ChatRole, InvokeRequest, InvokeResponse, Provider, ToolCall,
};

/// Upper bound on a single LLM call, regardless of configured timeout.
const MAX_TIMEOUT_SECS: u64 = 60;

/// LLM client trait: one free-form entry point and one structured one.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Run a completion, optionally with tool definitions.
    async fn invoke(&self, request: InvokeRequest) -> Result<InvokeResponse>;

    /// Run a completion that must return JSON conforming to `schema`.
    /// The response is parsed and validated; failures are ordinary errors.
    async fn invoke_structured(
        &self,
        messages: Vec<ChatMessage>,
        schema: &Value,
        system_prompt: Option<&str>,
        temperature: f64,
    ) -> Result<Value>;

    /// Get the provider for this client.
    fn provider(&self) -> Provider;
}

/// Configuration for LLM clients.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// API key
    pub api_key: String,
    /// Base URL override
    pub base_url: Option<String>,
    /// Default model
    pub default_model: Option<String>,
    /// Request timeout in seconds (bounded at 60)
    pub timeout_secs: u64,
}

impl ClientConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: None,
            default_model: None,
            timeout_secs: MAX_TIMEOUT_SECS,
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = Some(model.into());
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs.min(MAX_TIMEOUT_SECS);
        self
    }
}

fn build_http_client(timeout_secs: u64) -> Client {
    let timeout = Duration::from_secs(timeout_secs.min(MAX_TIMEOUT_SECS));

    // Some sandboxed macOS environments can panic during proxy auto-detection
    // in reqwest's default client builder. Fall back to no-proxy in that case.
    match catch_unwind(AssertUnwindSafe(|| {
        Client::builder().timeout(timeout).build()
    })) {
        Ok(Ok(client)) => client,
        Ok(Err(_)) | Err(_) => Client::builder()
            .no_proxy()
            .timeout(timeout)
            .build()
            .expect("Failed to create HTTP client"),
    }
}

/// Strip Markdown code fences from a model response, if present.
fn strip_code_fences(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.trim_start_matches('\n')
        .strip_suffix("```")
        .unwrap_or(rest)
        .trim()
}

/// Parse a model response as JSON and validate it against a schema.
/// Structured output is untrusted: anything that fails to parse or
/// validate is rejected.
pub fn parse_structured(provider: Provider, content: &str, schema: &Value) -> Result<Value> {
    let cleaned = strip_code_fences(content);
    let parsed: Value = serde_json::from_str(cleaned).map_err(|e| {
        Error::llm(
            provider.to_string(),
            format!("structured response is not valid JSON: {}", e),
        )
    })?;

    if !validates(schema, &parsed) {
        return Err(Error::llm(
            provider.to_string(),
            "structured response does not match the expected schema",
        ));
    }

    Ok(parsed)
}

fn structured_instruction(schema: &Value) -> String {
    format!(
        "Respond with a single JSON object matching this schema, and nothing else:\n{}",
        serde_json::to_string_pretty(schema).unwrap_or_else(|_| "{}".to_string())
    )
}

// ==================== Anthropic ====================

/// Anthropic Claude client.
pub struct AnthropicClient {
    config: ClientConfig,
    http: Client,
}

impl AnthropicClient {
    const DEFAULT_BASE_URL: &'static str = "https://api.anthropic.com";
    const API_VERSION: &'static str = "2023-06-01";
    const DEFAULT_MODEL: &'static str = "claude-3-5-sonnet-20241022";

    pub fn new(config: ClientConfig) -> Self {
        let http = build_http_client(config.timeout_secs);
        Self { config, http }
    }

    fn base_url(&self) -> &str {
        self.config
            .base_url
            .as_deref()
            .unwrap_or(Self::DEFAULT_BASE_URL)
    }
}

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    messages: Vec<AnthropicMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<AnthropicTool>,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct AnthropicTool {
    name: String,
    description: String,
    input_schema: Value,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContent>,
}

#[derive(Debug, Deserialize)]
struct AnthropicContent {
    #[serde(rename = "type")]
    content_type: String,
    text: Option<String>,
    name: Option<String>,
    input: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct AnthropicError {
    error: AnthropicErrorDetail,
}

#[derive(Debug, Deserialize)]
struct AnthropicErrorDetail {
    message: String,
    #[serde(rename = "type")]
    error_type: String,
}

#[async_trait]
impl LlmClient for AnthropicClient {
    async fn invoke(&self, request: InvokeRequest) -> Result<InvokeResponse> {
        let model = request
            .model
            .or_else(|| self.config.default_model.clone())
            .unwrap_or_else(|| Self::DEFAULT_MODEL.to_string());

        let messages: Vec<AnthropicMessage> = request
            .messages
            .iter()
            .map(|m| AnthropicMessage {
                role: match m.role {
                    ChatRole::Assistant => "assistant".to_string(),
                    // System content is carried in the dedicated field
                    ChatRole::User | ChatRole::System => "user".to_string(),
                },
                content: m.content.clone(),
            })
            .collect();

        let tools = request
            .tools
            .iter()
            .map(|t| AnthropicTool {
                name: t.name.clone(),
                description: t.description.clone(),
                input_schema: t.parameters.clone(),
            })
            .collect();

        let api_request = AnthropicRequest {
            model,
            messages,
            max_tokens: request.max_tokens.unwrap_or(4096),
            system: request.system_prompt,
            temperature: request.temperature,
            tools,
        };

        let url = format!("{}/v1/messages", self.base_url());
        let response = self
            .http
            .post(&url)
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", Self::API_VERSION)
            .header("content-type", "application/json")
            .json(&api_request)
            .send()
            .await
            .map_err(|e| Error::llm("anthropic", format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::llm("anthropic", format!("failed to read response: {}", e)))?;

        if !status.is_success() {
            if let Ok(error) = serde_json::from_str::<AnthropicError>(&body) {
                return Err(Error::llm(
                    "anthropic",
                    format!("API error ({}): {}", error.error.error_type, error.error.message),
                ));
            }
            return Err(Error::llm(
                "anthropic",
                format!("API error ({}): {}", status, body),
            ));
        }

        let api_response: AnthropicResponse = serde_json::from_str(&body)
            .map_err(|e| Error::llm("anthropic", format!("failed to parse response: {}", e)))?;

        let mut content = String::new();
        let mut tool_calls = Vec::new();
        for block in api_response.content {
            match block.content_type.as_str() {
                "text" => {
                    if let Some(text) = block.text {
                        content.push_str(&text);
                    }
                }
                "tool_use" => {
                    if let Some(name) = block.name {
                        tool_calls.push(ToolCall {
                            name,
                            arguments: block.input.unwrap_or(Value::Null),
                        });
                    }
                }
                _ => {}
            }
        }

        Ok(InvokeResponse {
            content,
            tool_calls,
        })
    }

    async fn invoke_structured(
        &self,
        mut messages: Vec<ChatMessage>,
        schema: &Value,
        system_prompt: Option<&str>,
        temperature: f64,
    ) -> Result<Value> {
        messages.push(ChatMessage::user(structured_instruction(schema)));

        let mut request = InvokeRequest::new().with_temperature(temperature);
        request.messages = messages;
        request.system_prompt = system_prompt.map(String::from);

        let response = self.invoke(request).await?;
        parse_structured(Provider::Anthropic, &response.content, schema)
    }

    fn provider(&self) -> Provider {
        Provider::Anthropic
    }
}

// ==================== OpenAI ====================

/// OpenAI chat-completions client.
pub struct OpenAiClient {
    config: ClientConfig,
    http: Client,
}

impl OpenAiClient {
    const DEFAULT_BASE_URL: &'static str = "https://api.openai.com";
    const DEFAULT_MODEL: &'static str = "gpt-4o";

    pub fn new(config: ClientConfig) -> Self {
        let http = build_http_client(config.timeout_secs);
        Self { config, http }
    }

    fn base_url(&self) -> &str {
        self.config
            .base_url
            .as_deref()
            .unwrap_or(Self::DEFAULT_BASE_URL)
    }
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAiMessage {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<OpenAiToolCall>,
}

#[derive(Debug, Deserialize)]
struct OpenAiToolCall {
    function: OpenAiFunctionCall,
}

#[derive(Debug, Deserialize)]
struct OpenAiFunctionCall {
    name: String,
    arguments: String,
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn invoke(&self, request: InvokeRequest) -> Result<InvokeResponse> {
        let model = request
            .model
            .or_else(|| self.config.default_model.clone())
            .unwrap_or_else(|| Self::DEFAULT_MODEL.to_string());

        let mut messages = Vec::new();
        if let Some(system) = &request.system_prompt {
            messages.push(json!({"role": "system", "content": system}));
        }
        for message in &request.messages {
            let role = match message.role {
                ChatRole::System => "system",
                ChatRole::User => "user",
                ChatRole::Assistant => "assistant",
            };
            messages.push(json!({"role": role, "content": message.content}));
        }

        let mut body = json!({
            "model": model,
            "messages": messages,
        });
        if let Some(temperature) = request.temperature {
            body["temperature"] = json!(temperature);
        }
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if !request.tools.is_empty() {
            body["tools"] = Value::Array(
                request
                    .tools
                    .iter()
                    .map(|t| {
                        json!({
                            "type": "function",
                            "function": {
                                "name": t.name,
                                "description": t.description,
                                "parameters": t.parameters,
                            }
                        })
                    })
                    .collect(),
            );
        }

        let url = format!("{}/v1/chat/completions", self.base_url());
        let response = self
            .http
            .post(&url)
            .header("authorization", format!("Bearer {}", self.config.api_key))
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::llm("openai", format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| Error::llm("openai", format!("failed to read response: {}", e)))?;

        if !status.is_success() {
            return Err(Error::llm("openai", format!("API error ({}): {}", status, text)));
        }

        let api_response: OpenAiResponse = serde_json::from_str(&text)
            .map_err(|e| Error::llm("openai", format!("failed to parse response: {}", e)))?;

        let choice = api_response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| Error::llm("openai", "response contained no choices"))?;

        let tool_calls = choice
            .message
            .tool_calls
            .into_iter()
            .map(|call| {
                let arguments = serde_json::from_str(&call.function.arguments)
                    .unwrap_or(Value::Null);
                ToolCall {
                    name: call.function.name,
                    arguments,
                }
            })
            .collect();

        Ok(InvokeResponse {
            content: choice.message.content.unwrap_or_default(),
            tool_calls,
        })
    }

    async fn invoke_structured(
        &self,
        mut messages: Vec<ChatMessage>,
        schema: &Value,
        system_prompt: Option<&str>,
        temperature: f64,
    ) -> Result<Value> {
        messages.push(ChatMessage::user(structured_instruction(schema)));

        let mut request = InvokeRequest::new().with_temperature(temperature);
        request.messages = messages;
        request.system_prompt = system_prompt.map(String::from);

        let response = self.invoke(request).await?;
        parse_structured(Provider::OpenAi, &response.content, schema)
    }

    fn provider(&self) -> Provider {
        Provider::OpenAi
    }
}

/// Build a client for the configured provider, or `None` when no API key is
/// set (components then use their deterministic fallbacks).
pub fn client_from_settings(
    settings: &crate::config::Settings,
) -> Option<std::sync::Arc<dyn LlmClient>> {
    let api_key = settings.active_api_key();
    if api_key.is_empty() {
        return None;
    }

    let config = ClientConfig::new(api_key).with_default_model(settings.active_model());
    let client: std::sync::Arc<dyn LlmClient> = match settings.llm_provider {
        Provider::Anthropic => std::sync::Arc::new(AnthropicClient::new(config)),
        Provider::OpenAi => std::sync::Arc::new(OpenAiClient::new(config)),
    };
    Some(client)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_strip_code_fences() {
        assert_eq!(strip_code_fences("{\"a\":1}"), "{\"a\":1}");
        assert_eq!(strip_code_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("```\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("  {\"a\":1}  "), "{\"a\":1}");
    }

    #[test]
    fn test_parse_structured_valid() {
        let schema = json!({
            "type": "object",
            "properties": {"verdict": {"type": "string"}},
            "required": ["verdict"]
        });
        let parsed =
            parse_structured(Provider::OpenAi, "{\"verdict\": \"accept\"}", &schema).unwrap();
        assert_eq!(parsed["verdict"], "accept");
    }

    #[test]
    fn test_parse_structured_rejects_invalid_json() {
        let schema = json!({"type": "object"});
        let result = parse_structured(Provider::OpenAi, "not json at all", &schema);
        assert!(matches!(result, Err(Error::Llm { .. })));
    }

    #[test]
    fn test_parse_structured_rejects_schema_mismatch() {
        let schema = json!({
            "type": "object",
            "properties": {"verdict": {"type": "string"}},
            "required": ["verdict"]
        });
        let result = parse_structured(Provider::OpenAi, "{\"other\": 1}", &schema);
        assert!(matches!(result, Err(Error::Llm { .. })));
    }

    #[test]
    fn test_client_from_settings_requires_key() {
        let settings = crate::config::Settings::default();
        assert!(client_from_settings(&settings).is_none());

        let mut with_key = crate::config::Settings::default();
        with_key.openai_api_key = "sk-test".to_string();
        let client = client_from_settings(&with_key).unwrap();
        assert_eq!(client.provider(), Provider::OpenAi);
    }

    #[test]
    fn test_timeout_is_bounded() {
        let config = ClientConfig::new("key").with_timeout(600);
        assert_eq!(config.timeout_secs, MAX_TIMEOUT_SECS);
    }
}
