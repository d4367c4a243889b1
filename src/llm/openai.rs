//! OpenAI 兼容 API 客户端
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url）；支持 DeepSeek、OpenAI、自建代理等。
//! 工具结果以 user 消息回传（工具协议由 ChatModel 的 JSON 约定承载），
//! assistant 的历史工具调用序列化为 JSON 拼入正文，保证模型能看到自己发出过的调用。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_openai::config::OpenAIConfig;
use async_openai::types::chat::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;

use crate::llm::{LlmClient, LlmError};
use crate::memory::{Message, Role};

/// Token 使用统计（累计值）
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub prompt_tokens: Arc<AtomicU64>,
    pub completion_tokens: Arc<AtomicU64>,
    pub total_tokens: Arc<AtomicU64>,
}

impl TokenUsage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, prompt: u64, completion: u64) {
        self.prompt_tokens.fetch_add(prompt, Ordering::Relaxed);
        self.completion_tokens.fetch_add(completion, Ordering::Relaxed);
        self.total_tokens.fetch_add(prompt + completion, Ordering::Relaxed);
    }

    pub fn get(&self) -> (u64, u64, u64) {
        (
            self.prompt_tokens.load(Ordering::Relaxed),
            self.completion_tokens.load(Ordering::Relaxed),
            self.total_tokens.load(Ordering::Relaxed),
        )
    }
}

/// OpenAI 兼容客户端：持有 Client；请求未指定模型时使用 default_model
pub struct OpenAiClient {
    client: Client<OpenAIConfig>,
    default_model: String,
    /// 累计 token 使用统计
    pub usage: TokenUsage,
}

impl OpenAiClient {
    pub fn new(base_url: Option<&str>, model: &str, api_key: Option<&str>) -> Self {
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_else(|| "sk-placeholder".to_string());

        let config = if let Some(url) = base_url {
            OpenAIConfig::new()
                .with_api_base(url)
                .with_api_key(api_key)
        } else {
            OpenAIConfig::new().with_api_key(api_key)
        };

        Self {
            client: Client::with_config(config),
            default_model: model.to_string(),
            usage: TokenUsage::new(),
        }
    }

    fn to_openai_messages(messages: &[Message]) -> Result<Vec<ChatCompletionRequestMessage>, LlmError> {
        messages
            .iter()
            .map(|m| {
                let built = match m.role {
                    Role::System => ChatCompletionRequestSystemMessageArgs::default()
                        .content(m.content.clone())
                        .build()
                        .map(ChatCompletionRequestMessage::System),
                    Role::User => ChatCompletionRequestUserMessageArgs::default()
                        .content(m.content.clone())
                        .build()
                        .map(ChatCompletionRequestMessage::User),
                    Role::Tool => ChatCompletionRequestUserMessageArgs::default()
                        .content(render_tool_result(m))
                        .build()
                        .map(ChatCompletionRequestMessage::User),
                    Role::Assistant => ChatCompletionRequestAssistantMessageArgs::default()
                        .content(render_assistant(m))
                        .build()
                        .map(ChatCompletionRequestMessage::Assistant),
                };
                built.map_err(|e| LlmError::Provider(format!("Build request message: {e}")))
            })
            .collect()
    }
}

fn render_tool_result(m: &Message) -> String {
    let status = if m.is_error { "error" } else { "ok" };
    format!(
        "Tool result [{}] {} ({}):\n{}",
        m.tool_call_id.as_deref().unwrap_or("-"),
        m.tool_name.as_deref().unwrap_or("tool"),
        status,
        m.content
    )
}

fn render_assistant(m: &Message) -> String {
    if m.tool_calls.is_empty() {
        return m.content.clone();
    }
    let calls: Vec<serde_json::Value> = m
        .tool_calls
        .iter()
        .map(|c| serde_json::json!({"id": c.id, "tool": c.name, "args": c.args}))
        .collect();
    let calls = serde_json::json!({ "tool_calls": calls });
    if m.content.trim().is_empty() {
        calls.to_string()
    } else {
        format!("{}\n{}", m.content, calls)
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    fn token_usage(&self) -> (u64, u64, u64) {
        self.usage.get()
    }

    async fn complete(&self, model: &str, messages: &[Message]) -> Result<String, LlmError> {
        let model = if model.is_empty() { self.default_model.as_str() } else { model };
        // provider:model 形式只取模型名
        let model = model.rsplit(':').next().unwrap_or(model);
        let request = CreateChatCompletionRequestArgs::default()
            .model(model)
            .messages(Self::to_openai_messages(messages)?)
            .build()
            .map_err(|e| LlmError::Provider(e.to_string()))?;

        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(|e| LlmError::from_provider_message(e.to_string()))?;

        if let Some(usage) = &response.usage {
            self.usage.add(
                usage.prompt_tokens as u64,
                usage.completion_tokens as u64,
            );
        }

        let content = response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default();

        Ok(content)
    }
}
