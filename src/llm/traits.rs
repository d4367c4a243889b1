//! LLM 客户端抽象
//!
//! 所有后端（OpenAI 兼容 / DeepSeek / Mock / Scripted）实现 LlmClient：按模型名完成一次非流式补全。
//! 工具调用与结构化输出由上层 ChatModel 通过 prompt + JSON 解析实现。

use std::sync::OnceLock;

use async_trait::async_trait;
use thiserror::Error;

use crate::memory::Message;

/// 后端调用错误（由 FailureClassifier 映射为 FailureKind）
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LlmError {
    /// 请求超出模型输入上限；limit 为 provider 报告的上限（若有）
    #[error("Context length exceeded: {message}")]
    ContextLengthExceeded { message: String, limit: Option<usize> },

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Rate limited (retry after {retry_after_ms} ms)")]
    RateLimited { retry_after_ms: u64 },

    #[error("Network error: {0}")]
    Network(String),

    /// 其它 provider 错误，原文保留供分类
    #[error("Provider error: {0}")]
    Provider(String),
}

const CONTEXT_PATTERNS: &[&str] = &[
    "context_length_exceeded",
    "maximum context length",
    "prompt is too long",
    "input is too long",
    "too many tokens",
    "context window",
    "reduce the length",
];

const AUTH_PATTERNS: &[&str] = &[
    "unauthorized",
    "invalid api key",
    "invalid_api_key",
    "incorrect api key",
    "authentication",
    "permission denied",
];

const RATE_LIMIT_PATTERNS: &[&str] = &["rate limit", "rate_limit", "too many requests", "overloaded"];

const NETWORK_PATTERNS: &[&str] = &[
    "timed out",
    "timeout",
    "connection",
    "temporarily unavailable",
    "reset by peer",
];

fn limit_patterns() -> &'static [regex::Regex] {
    static PATTERNS: OnceLock<Vec<regex::Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"maximum context length is (\d+)",
            r"\d+ tokens? > (\d+) maximum",
            r"context window of (\d+)",
        ]
        .iter()
        .filter_map(|p| regex::Regex::new(p).ok())
        .collect()
    })
}

/// 文本中独立出现的 HTTP 状态码（不匹配 4013ms、14290 这类数字片段）
fn status_code(lower: &str) -> Option<u16> {
    static PATTERN: OnceLock<Option<regex::Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| regex::Regex::new(r"\b(40[13]|429|50[234])\b").ok())
        .as_ref()?
        .captures(lower)?
        .get(1)?
        .as_str()
        .parse()
        .ok()
}

fn retry_after_pattern() -> Option<&'static regex::Regex> {
    static PATTERN: OnceLock<Option<regex::Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| regex::Regex::new(r"(?i)retry after (\d+)\s*(ms|s)").ok())
        .as_ref()
}

impl LlmError {
    /// 从 provider 原始错误文本推断错误类别（各后端错误格式不一，按关键字匹配）
    pub fn from_provider_message(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();
        let contains_any = |patterns: &[&str]| patterns.iter().any(|p| lower.contains(p));

        if contains_any(CONTEXT_PATTERNS) {
            let limit = limit_patterns().iter().find_map(|re| {
                re.captures(&lower)
                    .and_then(|c| c.get(1))
                    .and_then(|m| m.as_str().parse::<usize>().ok())
            });
            return LlmError::ContextLengthExceeded { message, limit };
        }
        let status = status_code(&lower);
        if contains_any(AUTH_PATTERNS) || matches!(status, Some(401 | 403)) {
            return LlmError::Unauthorized(message);
        }
        if contains_any(RATE_LIMIT_PATTERNS) || status == Some(429) {
            let retry_after_ms = retry_after_pattern()
                .and_then(|re| re.captures(&lower))
                .and_then(|c| {
                    let n = c.get(1)?.as_str().parse::<u64>().ok()?;
                    Some(if c.get(2)?.as_str() == "s" { n * 1000 } else { n })
                })
                .unwrap_or(0);
            return LlmError::RateLimited { retry_after_ms };
        }
        if contains_any(NETWORK_PATTERNS) || matches!(status, Some(502..=504)) {
            return LlmError::Network(message);
        }
        LlmError::Provider(message)
    }
}

/// LLM 客户端 trait
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 非流式完成；model 为本阶段配置的模型标识
    async fn complete(&self, model: &str, messages: &[Message]) -> Result<String, LlmError>;

    /// 获取累计 token 使用统计：(prompt_tokens, completion_tokens, total_tokens)
    /// 默认返回 (0, 0, 0)，具体实现可覆盖
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}
