//! 错误恢复引擎
//!
//! FailureClassifier 把后端错误归类为 FailureKind；RecoveryEngine 根据类别与已重试次数返回 RecoveryAction：
//! - CapacityExceeded：按模型上限（或 provider 报告的上限）每次收缩 10% 后截断重试，超过次数则降级；
//! - Transient：指数退避重试，尊重 retry_after，耗尽后升级为 Fatal；
//! - Malformed：追加纠正提示重试，耗尽后由调用方回退为非结构化文本；
//! - Unauthorized / Fatal：不重试，直接交给所属循环。

use std::time::Duration;

use crate::core::{FailureKind, RecoveryAction, ResearchError};
use crate::llm::{model_token_limit, LlmClient, LlmError};
use crate::memory::{truncate_messages, Message, TokenEstimator};
use crate::research::prompts::corrective_instruction;

/// 每次容量重试的预算收缩比例
const CAPACITY_SHRINK: f64 = 0.9;

/// 重试上限与退避参数（来自 [recovery] 与 [research] 配置）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryPolicy {
    pub max_capacity_retries: u32,
    pub max_transient_retries: u32,
    pub base_backoff_ms: u64,
    pub max_structured_output_retries: u32,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            max_capacity_retries: 3,
            max_transient_retries: 3,
            base_backoff_ms: 500,
            max_structured_output_retries: 3,
        }
    }
}

/// 失败分类器
pub struct FailureClassifier;

impl FailureClassifier {
    pub fn classify(err: &LlmError) -> FailureKind {
        match err {
            LlmError::ContextLengthExceeded { .. } => FailureKind::CapacityExceeded,
            LlmError::Unauthorized(_) => FailureKind::Unauthorized,
            LlmError::RateLimited { .. } | LlmError::Network(_) => FailureKind::Transient,
            LlmError::Provider(_) => FailureKind::Fatal,
        }
    }

    /// 工具返回的错误文本按同一套关键字归类
    pub fn classify_message(message: &str) -> FailureKind {
        Self::classify(&LlmError::from_provider_message(message))
    }
}

/// 一次带恢复的调用结果：Degraded 表示重试耗尽后放弃，调用方输出降级结果
#[derive(Debug, Clone, PartialEq)]
pub enum Invocation<T> {
    Complete(T),
    Degraded { reason: String },
}

impl<T> Invocation<T> {
    pub fn complete(self) -> Option<T> {
        match self {
            Invocation::Complete(v) => Some(v),
            Invocation::Degraded { .. } => None,
        }
    }
}

/// 语义化错误恢复：将失败映射为可执行动作
#[derive(Debug, Clone, Default)]
pub struct RecoveryEngine {
    policy: RecoveryPolicy,
}

impl RecoveryEngine {
    pub fn new(policy: RecoveryPolicy) -> Self {
        Self { policy }
    }

    /// 根据后端错误与该类别已重试次数返回建议动作；messages 为本次请求的输入，用于估算预算
    pub fn handle(&self, err: &LlmError, attempt: u32, model: &str, messages: &[Message]) -> RecoveryAction {
        match FailureClassifier::classify(err) {
            FailureKind::CapacityExceeded => {
                if attempt >= self.policy.max_capacity_retries {
                    return RecoveryAction::Degrade(format!(
                        "input still exceeds the limit of {model} after {attempt} truncations"
                    ));
                }
                RecoveryAction::TruncateAndRetry {
                    budget: self.capacity_budget(err, attempt, model, messages),
                }
            }
            FailureKind::Transient => {
                if attempt >= self.policy.max_transient_retries {
                    return RecoveryAction::Abort;
                }
                let retry_after = match err {
                    LlmError::RateLimited { retry_after_ms } => *retry_after_ms,
                    _ => 0,
                };
                RecoveryAction::Backoff(self.backoff(attempt, retry_after))
            }
            FailureKind::Malformed | FailureKind::Unauthorized | FailureKind::Fatal => RecoveryAction::Abort,
        }
    }

    /// 结构化输出 / 工具调用 JSON 解析失败：未耗尽时追加纠正提示，耗尽后 Abort（调用方回退为原文）
    pub fn handle_malformed(&self, detail: &str, attempt: u32) -> RecoveryAction {
        if attempt >= self.policy.max_structured_output_retries {
            return RecoveryAction::Abort;
        }
        RecoveryAction::RetryWithPrompt(corrective_instruction(detail))
    }

    /// 工具错误：Transient 可退避重试，其余直接成为错误结果
    pub fn handle_tool_error(&self, kind: FailureKind, attempt: u32) -> RecoveryAction {
        match kind {
            FailureKind::Transient if attempt < self.policy.max_transient_retries => {
                RecoveryAction::Backoff(self.backoff(attempt, 0))
            }
            _ => RecoveryAction::Abort,
        }
    }

    /// 预算 = min(上限, 当前估算) × 0.9^(attempt+1)；保证每次重试都比上一次更小
    fn capacity_budget(&self, err: &LlmError, attempt: u32, model: &str, messages: &[Message]) -> usize {
        let reported = match err {
            LlmError::ContextLengthExceeded { limit, .. } => *limit,
            _ => None,
        };
        let estimate = TokenEstimator::estimate_messages(messages);
        let limit = reported.or_else(|| model_token_limit(model)).unwrap_or(estimate);
        let base = limit.min(estimate) as f64;
        (base * CAPACITY_SHRINK.powi(attempt as i32 + 1)) as usize
    }

    fn backoff(&self, attempt: u32, retry_after_ms: u64) -> Duration {
        let exp = self.policy.base_backoff_ms.saturating_mul(1u64 << attempt.min(16));
        Duration::from_millis(exp.max(retry_after_ms))
    }

    /// 带恢复地完成一次补全：容量错误截断重试，瞬时错误退避重试，其余错误直接返回
    pub async fn complete(
        &self,
        llm: &dyn LlmClient,
        model: &str,
        messages: &[Message],
        request_timeout: Duration,
    ) -> Result<Invocation<String>, ResearchError> {
        let mut current = messages.to_vec();
        let mut capacity_attempts = 0u32;
        let mut transient_attempts = 0u32;

        loop {
            let result = match tokio::time::timeout(request_timeout, llm.complete(model, &current)).await {
                Ok(result) => result,
                Err(_) => Err(LlmError::Network(format!(
                    "request to {model} timed out after {}s",
                    request_timeout.as_secs()
                ))),
            };
            let err = match result {
                Ok(text) => return Ok(Invocation::Complete(text)),
                Err(err) => err,
            };

            let kind = FailureClassifier::classify(&err);
            let attempt = match kind {
                FailureKind::CapacityExceeded => capacity_attempts,
                FailureKind::Transient => transient_attempts,
                _ => 0,
            };
            match self.handle(&err, attempt, model, &current) {
                RecoveryAction::TruncateAndRetry { budget } => {
                    capacity_attempts += 1;
                    tracing::warn!(
                        model,
                        attempt = capacity_attempts,
                        budget,
                        "Context length exceeded, truncating and retrying"
                    );
                    current = truncate_messages(&current, budget);
                }
                RecoveryAction::Backoff(delay) => {
                    transient_attempts += 1;
                    tracing::warn!(
                        model,
                        attempt = transient_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Transient failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                RecoveryAction::Degrade(reason) => {
                    tracing::warn!(model, %reason, "Capacity recovery exhausted, degrading");
                    return Ok(Invocation::Degraded { reason });
                }
                RecoveryAction::RetryWithPrompt(_) | RecoveryAction::Abort => {
                    return Err(match kind {
                        FailureKind::Transient => ResearchError::Fatal(format!(
                            "{err} (still failing after {transient_attempts} retries)"
                        )),
                        _ => ResearchError::from_llm(model, err),
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedLlmClient;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn fast_engine() -> RecoveryEngine {
        RecoveryEngine::new(RecoveryPolicy {
            base_backoff_ms: 1,
            ..RecoveryPolicy::default()
        })
    }

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[test]
    fn test_classify_provider_messages() {
        let cases = [
            ("This model's maximum context length is 8192 tokens", FailureKind::CapacityExceeded),
            ("Error code: 401 - invalid api key", FailureKind::Unauthorized),
            ("429 Too Many Requests", FailureKind::Transient),
            ("operation timed out", FailureKind::Transient),
            ("model not found", FailureKind::Fatal),
        ];
        for (msg, kind) in cases {
            assert_eq!(FailureClassifier::classify_message(msg), kind, "{msg}");
        }
    }

    #[test]
    fn test_capacity_budget_shrinks_each_attempt() {
        let engine = fast_engine();
        let err = LlmError::ContextLengthExceeded {
            message: "too long".into(),
            limit: Some(1000),
        };
        let big = vec![Message::user("word ".repeat(20_000))];
        let budgets: Vec<usize> = (0..3)
            .map(|attempt| match engine.handle(&err, attempt, "gpt-4o", &big) {
                RecoveryAction::TruncateAndRetry { budget } => budget,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert!(budgets[0] < 1000);
        assert!(budgets[1] < budgets[0]);
        assert!(budgets[2] < budgets[1]);
        assert!(matches!(engine.handle(&err, 3, "gpt-4o", &big), RecoveryAction::Degrade(_)));
    }

    #[test]
    fn test_backoff_honors_retry_after() {
        let engine = RecoveryEngine::default();
        let err = LlmError::RateLimited { retry_after_ms: 5_000 };
        assert_eq!(
            engine.handle(&err, 0, "m", &[]),
            RecoveryAction::Backoff(Duration::from_millis(5_000))
        );
        let net = LlmError::Network("reset".into());
        assert_eq!(
            engine.handle(&net, 2, "m", &[]),
            RecoveryAction::Backoff(Duration::from_millis(2_000))
        );
        assert_eq!(engine.handle(&net, 3, "m", &[]), RecoveryAction::Abort);
    }

    #[test]
    fn test_malformed_retries_then_aborts() {
        let engine = RecoveryEngine::default();
        assert!(matches!(engine.handle_malformed("bad json", 0), RecoveryAction::RetryWithPrompt(p) if p.contains("bad json")));
        assert_eq!(engine.handle_malformed("bad json", 3), RecoveryAction::Abort);
    }

    #[tokio::test]
    async fn test_capacity_error_truncates_and_succeeds() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let llm = ScriptedLlmClient::new(move |_, messages| {
            seen.fetch_add(1, Ordering::SeqCst);
            if TokenEstimator::estimate_messages(messages) > 2_000 {
                Err(LlmError::ContextLengthExceeded {
                    message: "prompt is too long".into(),
                    limit: Some(2_000),
                })
            } else {
                Ok("fits".into())
            }
        });
        let messages = vec![
            Message::system("instructions"),
            Message::user("q"),
            Message::assistant("searching"),
            Message::user("x ".repeat(6_000)),
            Message::assistant("thinking"),
            Message::user("final question"),
        ];
        let result = fast_engine().complete(&llm, "m", &messages, TIMEOUT).await.unwrap();
        assert_eq!(result, Invocation::Complete("fits".into()));
        assert!(calls.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_capacity_error_degrades_after_retries() {
        let llm = ScriptedLlmClient::new(|_, _| {
            Err(LlmError::ContextLengthExceeded {
                message: "context_length_exceeded".into(),
                limit: None,
            })
        });
        let messages = vec![Message::system("s"), Message::user("q")];
        let result = fast_engine().complete(&llm, "m", &messages, TIMEOUT).await.unwrap();
        assert!(matches!(result, Invocation::Degraded { .. }));
        // 首次调用 + 3 次截断重试
        assert_eq!(llm.call_count(), 4);
    }

    #[tokio::test]
    async fn test_transient_exhaustion_escalates_to_fatal() {
        let llm = ScriptedLlmClient::new(|_, _| Err(LlmError::Network("connection reset".into())));
        let err = fast_engine()
            .complete(&llm, "m", &[Message::user("q")], TIMEOUT)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), FailureKind::Fatal);
        assert_eq!(llm.call_count(), 4);
    }

    #[tokio::test]
    async fn test_unauthorized_is_not_retried() {
        let llm = ScriptedLlmClient::new(|_, _| Err(LlmError::Unauthorized("bad key".into())));
        let err = fast_engine()
            .complete(&llm, "m", &[Message::user("q")], TIMEOUT)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), FailureKind::Unauthorized);
        assert_eq!(llm.call_count(), 1);
    }
}
