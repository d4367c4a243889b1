//! 工具执行器
//!
//! 持有 ToolRegistry 与全局超时：execute_raw 在超时内调用 registry.execute，超时或失败时转为 ResearchError
//! （ToolTimeout / ToolExecutionFailed / UnknownTool），每次调用输出结构化审计日志（JSON）。
//! execute 在此基础上对瞬时失败退避重试，并把最终结果包装成恰好一条 Tool 消息。

use std::time::{Duration, Instant};

use futures_util::future::join_all;
use tokio::time::timeout;

use crate::core::recovery::{FailureClassifier, RecoveryEngine};
use crate::core::{FailureKind, RecoveryAction, ResearchError};
use crate::memory::{Message, ToolCall};
use crate::tools::{Tool, ToolRegistry, ToolSpec};

/// 工具执行器：对每次调用施加超时，并将结果映射为 ResearchError
pub struct ToolExecutor {
    registry: ToolRegistry,
    timeout: Duration,
    recovery: RecoveryEngine,
}

impl ToolExecutor {
    pub fn new(registry: ToolRegistry, timeout_secs: u64, recovery: RecoveryEngine) -> Self {
        Self {
            registry,
            timeout: Duration::from_secs(timeout_secs),
            recovery,
        }
    }

    /// 执行指定工具；超时返回 ToolTimeout，工具返回 Err 则转为 ToolExecutionFailed；输出 JSON 审计日志
    pub async fn execute_raw(&self, tool_name: &str, args: serde_json::Value) -> Result<String, ResearchError> {
        let Some(tool) = self.registry.get(tool_name) else {
            return Err(ResearchError::UnknownTool(tool_name.to_string()));
        };
        let start = Instant::now();
        let args_preview = args_preview(&args);
        let result = timeout(self.timeout, tool.execute(args)).await;

        let (ok, outcome): (bool, &str) = match &result {
            Ok(Ok(_)) => (true, "ok"),
            Ok(Err(_)) => (false, "error"),
            Err(_) => (false, "timeout"),
        };
        let duration_ms = start.elapsed().as_millis() as u64;
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": tool_name,
            "ok": ok,
            "outcome": outcome,
            "duration_ms": duration_ms,
            "args_preview": args_preview,
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        match result {
            Ok(Ok(content)) => Ok(content),
            Ok(Err(e)) => Err(ResearchError::ToolExecutionFailed(e)),
            Err(_) => Err(ResearchError::ToolTimeout(tool_name.to_string())),
        }
    }

    /// 执行一个 ToolCall，返回其唯一的 Tool 结果消息；瞬时失败按退避策略重试
    pub async fn execute(&self, call: &ToolCall) -> Message {
        let mut attempt = 0u32;
        loop {
            let err = match self.execute_raw(&call.name, call.args.clone()).await {
                Ok(content) => return Message::tool_result(call, content, false),
                Err(err) => err,
            };
            let kind = match &err {
                ResearchError::ToolTimeout(_) => FailureKind::Transient,
                ResearchError::ToolExecutionFailed(msg) => FailureClassifier::classify_message(msg),
                other => other.kind(),
            };
            match self.recovery.handle_tool_error(kind, attempt) {
                RecoveryAction::Backoff(delay) => {
                    attempt += 1;
                    tracing::warn!(tool = %call.name, attempt, error = %err, "Transient tool failure, retrying");
                    tokio::time::sleep(delay).await;
                }
                _ => return Message::tool_result(call, format!("Error: {err}"), true),
            }
        }
    }

    /// 并发执行一批调用，结果按调用顺序返回
    pub async fn execute_all(&self, calls: &[ToolCall]) -> Vec<Message> {
        join_all(calls.iter().map(|call| self.execute(call))).await
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.registry.tool_names()
    }

    pub fn specs(&self) -> Vec<ToolSpec> {
        self.registry.specs()
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }
}

fn args_preview(args: &serde_json::Value) -> String {
    let s = args.to_string();
    if s.len() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
