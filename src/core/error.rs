//! 研究运行错误类型与恢复动作
//!
//! 与 RecoveryEngine 配合：先把失败归类为 FailureKind，再决定 TruncateAndRetry / RetryWithPrompt / Backoff / Abort。

use std::time::Duration;

use thiserror::Error;

use crate::llm::LlmError;

/// 外部调用失败的分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// 请求超出目标模型的输入预算
    CapacityExceeded,
    Unauthorized,
    /// 网络 / 限流 / 超时
    Transient,
    /// 结构化输出或工具调用 JSON 校验失败
    Malformed,
    Fatal,
}

/// 研究运行过程中可能出现的错误
#[derive(Error, Debug)]
pub enum ResearchError {
    #[error("Capacity exceeded for model {model}: {detail}")]
    CapacityExceeded { model: String, detail: String },

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Malformed output: {0}")]
    Malformed(String),

    #[error("Fatal: {0}")]
    Fatal(String),

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Tool execution failed: {0}")]
    ToolExecutionFailed(String),

    #[error("Tool timeout: {0}")]
    ToolTimeout(String),

    #[error(transparent)]
    Reducer(#[from] crate::core::reducer::ReducerError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Config error: {0}")]
    Config(String),

    /// resume 时运行并未挂起等待用户回复
    #[error("Run {0} is not waiting for clarification")]
    NotSuspended(String),
}

impl ResearchError {
    pub fn kind(&self) -> FailureKind {
        match self {
            ResearchError::CapacityExceeded { .. } => FailureKind::CapacityExceeded,
            ResearchError::Unauthorized(_) => FailureKind::Unauthorized,
            ResearchError::Transient(_) | ResearchError::ToolTimeout(_) => FailureKind::Transient,
            ResearchError::Malformed(_) => FailureKind::Malformed,
            _ => FailureKind::Fatal,
        }
    }

    /// 由后端错误构造（model 用于容量错误的上下文）
    pub fn from_llm(model: &str, err: LlmError) -> Self {
        match err {
            LlmError::ContextLengthExceeded { message, .. } => ResearchError::CapacityExceeded {
                model: model.to_string(),
                detail: message,
            },
            LlmError::Unauthorized(msg) => ResearchError::Unauthorized(msg),
            LlmError::RateLimited { retry_after_ms } => {
                ResearchError::Transient(format!("rate limited, retry after {retry_after_ms} ms"))
            }
            LlmError::Network(msg) => ResearchError::Transient(msg),
            LlmError::Provider(msg) => ResearchError::Fatal(msg),
        }
    }
}

/// 恢复引擎根据失败类别给出的建议动作
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryAction {
    /// 截断到 budget（token）后重试
    TruncateAndRetry { budget: usize },
    /// 追加纠正提示后重试（结构化输出 / 工具调用 JSON 格式错误）
    RetryWithPrompt(String),
    /// 等待后重试
    Backoff(Duration),
    /// 放弃重试，输出降级结果
    Degrade(String),
    /// 终止当前调用，错误交给所属循环
    Abort,
}
