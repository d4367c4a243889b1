//! Mock / Scripted LLM 客户端（用于测试与无 API Key 的本地运行）
//!
//! - MockLlmClient：按 system prompt 识别当前阶段，给出确定性的最小回复，便于本地跑通完整研究流程。
//! - ScriptedLlmClient：由调用方提供闭包决定每次回复（可注入错误与延迟），供测试精确控制。

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use crate::llm::{LlmClient, LlmError};
use crate::memory::{Message, Role};
use crate::research::prompts::PromptKind;

fn last_user(messages: &[Message]) -> &str {
    messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .map(|m| m.content.as_str())
        .unwrap_or("(no input)")
}

/// Mock 客户端：每个阶段给出可解析的固定回复
#[derive(Debug, Default)]
pub struct MockLlmClient;

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, _model: &str, messages: &[Message]) -> Result<String, LlmError> {
        let input = last_user(messages);
        let reply = match PromptKind::detect(messages) {
            Some(PromptKind::Clarify) => json!({
                "need_clarification": false,
                "question": "",
                "verification": format!("Starting research on: {input}"),
            })
            .to_string(),
            Some(PromptKind::Brief) => json!({ "research_brief": input }).to_string(),
            Some(PromptKind::Supervisor) => {
                if messages.iter().any(|m| m.role == Role::Tool) {
                    json!({"tool": "ResearchComplete", "args": {}}).to_string()
                } else {
                    json!({"tool": "ConductResearch", "args": {"research_topic": input}}).to_string()
                }
            }
            Some(PromptKind::Researcher) => json!({"tool": "ResearchComplete", "args": {}}).to_string(),
            Some(PromptKind::Compress) => format!("Mock findings for: {input}"),
            Some(PromptKind::FinalReport) => format!("# Research Report (mock)\n\n{input}"),
            Some(PromptKind::SummarizePage) => json!({
                "summary": input.chars().take(200).collect::<String>(),
                "key_excerpts": "",
            })
            .to_string(),
            None => format!("Echo from Mock: {input}"),
        };
        Ok(reply)
    }
}

type ReplyFn = dyn Fn(&str, &[Message]) -> Result<String, LlmError> + Send + Sync;
type DelayFn = dyn Fn(&[Message]) -> Duration + Send + Sync;

/// 脚本化客户端：回复与延迟均由闭包决定；记录调用次数与使用的模型
pub struct ScriptedLlmClient {
    reply: Box<ReplyFn>,
    delay: Option<Box<DelayFn>>,
    calls: AtomicUsize,
    models: Mutex<Vec<String>>,
}

impl ScriptedLlmClient {
    pub fn new(
        reply: impl Fn(&str, &[Message]) -> Result<String, LlmError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            reply: Box::new(reply),
            delay: None,
            calls: AtomicUsize::new(0),
            models: Mutex::new(Vec::new()),
        }
    }

    /// 每次调用前按消息内容决定的延迟（模拟慢速调用）
    pub fn with_delay(mut self, delay: impl Fn(&[Message]) -> Duration + Send + Sync + 'static) -> Self {
        self.delay = Some(Box::new(delay));
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// 各次调用使用的模型标识（按调用顺序）
    pub fn models_used(&self) -> Vec<String> {
        self.models.lock().map(|m| m.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn complete(&self, model: &str, messages: &[Message]) -> Result<String, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut models) = self.models.lock() {
            models.push(model.to_string());
        }
        if let Some(delay) = &self.delay {
            let d = delay(messages);
            if !d.is_zero() {
                tokio::time::sleep(d).await;
            }
        }
        (self.reply)(model, messages)
    }
}
