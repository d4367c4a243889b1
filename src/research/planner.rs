//! ChatModel：按阶段绑定的模型调用与输出解析
//!
//! 调用 LLM 得到回复或 JSON Tool Call；parse_llm_output 从文本中提取 JSON 并解析为工具调用或直接回复。
//! 支持三种调用形态：`{"tool": ..., "args": ...}`、`{"tool_calls": [...]}` 以及调用对象数组。
//! invoke_structured 把 schemars 生成的 schema 注入 system prompt，并把回复解析为目标类型。

use std::sync::Arc;
use std::time::Duration;

use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::core::recovery::{Invocation, RecoveryEngine};
use crate::core::{RecoveryAction, ResearchError};
use crate::llm::LlmClient;
use crate::memory::{Message, Role, ToolCall};
use crate::tools::schema::{render_output_instructions, render_tool_instructions};
use crate::tools::ToolSpec;

/// 解析后的模型输出
#[derive(Debug, Clone, PartialEq)]
pub enum PlannerOutput {
    /// 直接回复
    Response(String),
    /// 需要执行工具；content 为 JSON 之外的说明文字
    ToolCalls { content: String, calls: Vec<ToolCall> },
}

/// 一轮模型输出：tool_calls 为空即直接回复
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ModelTurn {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
}

/// 结构化调用结果：Unstructured 为纠正重试耗尽后的原文回退
#[derive(Debug, Clone, PartialEq)]
pub enum Structured<T> {
    Parsed(T),
    Unstructured(String),
}

/// 提取 JSON 片段，返回 (json, 其余文字)
fn extract_json(text: &str) -> Option<(&str, String)> {
    if let Some(start) = text.find("```json") {
        let rest = &text[start + 7..];
        let (json, after) = match rest.find("```") {
            Some(end) => (rest[..end].trim(), &rest[end + 3..]),
            None => (rest.trim(), ""),
        };
        let prose = format!("{}{}", &text[..start], after);
        return Some((json, prose.trim().to_string()));
    }
    // 仅当整段输出是数组时才按数组解析，避免把正文里的 [1] 之类引用当作 JSON
    let (start, close) = if text.starts_with('[') {
        (0, ']')
    } else {
        (text.find('{')?, '}')
    };
    // 没有闭合括号时取到末尾，交给 JSON 解析报错
    let end = text
        .rfind(close)
        .filter(|&end| end > start)
        .map(|end| end + 1)
        .unwrap_or(text.len());
    let prose = format!("{}{}", &text[..start], &text[end..]);
    Some((&text[start..end], prose.trim().to_string()))
}

/// 文本是否试图发起工具调用（解析失败时据此判定为 Malformed 而非普通回复）
fn looks_like_tool_call(json: &str) -> bool {
    json.contains("\"tool\"") || json.contains("\"tool_calls\"")
}

fn call_from_value(value: &Value) -> Result<Option<ToolCall>, String> {
    let Some(obj) = value.as_object() else {
        return Err(format!("tool call must be an object: {value}"));
    };
    let name = match obj.get("tool").or_else(|| obj.get("name")) {
        Some(Value::String(name)) => name.trim().to_string(),
        Some(other) => return Err(format!("tool name must be a string: {other}")),
        None => return Err(format!("tool call without a tool name: {value}")),
    };
    if name.is_empty() {
        return Ok(None);
    }
    let args = match obj.get("args").or_else(|| obj.get("arguments")) {
        None | Some(Value::Null) => Value::Object(Default::default()),
        Some(args @ Value::Object(_)) => args.clone(),
        // 部分模型把参数写成 JSON 字符串
        Some(Value::String(raw)) => serde_json::from_str::<Value>(raw)
            .ok()
            .filter(Value::is_object)
            .ok_or_else(|| format!("args for {name} must be a JSON object"))?,
        Some(other) => return Err(format!("args for {name} must be a JSON object, got {other}")),
    };
    let mut call = ToolCall::new(name, args);
    if let Some(Value::String(id)) = obj.get("id") {
        if !id.is_empty() {
            call.id = id.clone();
        }
    }
    Ok(Some(call))
}

/// 解析 LLM 输出：含工具调用 JSON 则为 ToolCalls，否则为 Response；工具调用 JSON 不合法时返回 Malformed
pub fn parse_llm_output(output: &str) -> Result<PlannerOutput, ResearchError> {
    let trimmed = output.trim();
    let Some((json_str, prose)) = extract_json(trimmed) else {
        return Ok(PlannerOutput::Response(trimmed.to_string()));
    };

    let value: Value = match serde_json::from_str(json_str) {
        Ok(v) => v,
        Err(e) if looks_like_tool_call(json_str) => {
            return Err(ResearchError::Malformed(format!("{e}: {json_str}")));
        }
        Err(_) => return Ok(PlannerOutput::Response(trimmed.to_string())),
    };

    let items: Vec<&Value> = match &value {
        Value::Object(obj) if obj.contains_key("tool_calls") => match obj.get("tool_calls") {
            Some(Value::Array(items)) => items.iter().collect(),
            _ => return Err(ResearchError::Malformed("tool_calls must be an array".to_string())),
        },
        Value::Object(obj) if obj.contains_key("tool") => vec![&value],
        Value::Array(items) if !items.is_empty() && items.iter().all(|i| i.get("tool").is_some()) => {
            items.iter().collect()
        }
        _ => return Ok(PlannerOutput::Response(trimmed.to_string())),
    };

    let mut calls = Vec::with_capacity(items.len());
    for item in items {
        if let Some(call) = call_from_value(item).map_err(ResearchError::Malformed)? {
            calls.push(call);
        }
    }
    if calls.is_empty() {
        return Ok(PlannerOutput::Response(trimmed.to_string()));
    }
    Ok(PlannerOutput::ToolCalls { content: prose, calls })
}

/// 解析结构化输出（容忍 markdown 代码块与前后说明文字）
pub fn parse_structured<T: DeserializeOwned>(output: &str) -> Result<T, ResearchError> {
    let trimmed = output.trim();
    let json_str = extract_json(trimmed).map(|(json, _)| json).unwrap_or(trimmed);
    serde_json::from_str(json_str).map_err(|e| ResearchError::Malformed(format!("{e}: {json_str}")))
}

/// 把说明段落追加到首条 system 消息；没有 system 消息时插入一条
fn with_system_suffix(messages: &[Message], suffix: &str) -> Vec<Message> {
    let mut out = messages.to_vec();
    match out.iter_mut().find(|m| m.role == Role::System) {
        Some(system) => {
            system.content.push_str("\n\n");
            system.content.push_str(suffix);
        }
        None => out.insert(0, Message::system(suffix)),
    }
    out
}

/// 绑定到某个模型的调用句柄；各阶段（研究 / 压缩 / 终稿 / 网页摘要）各持一个
#[derive(Clone)]
pub struct ChatModel {
    llm: Arc<dyn LlmClient>,
    model: String,
    recovery: RecoveryEngine,
    request_timeout: Duration,
}

impl ChatModel {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        model: impl Into<String>,
        recovery: RecoveryEngine,
        request_timeout: Duration,
    ) -> Self {
        Self {
            llm,
            model: model.into(),
            recovery,
            request_timeout,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// 获取 LLM 累计 token 使用统计
    pub fn token_usage(&self) -> (u64, u64, u64) {
        self.llm.token_usage()
    }

    /// 纯文本补全（容量 / 瞬时错误由恢复引擎处理）
    pub async fn invoke_text(&self, messages: &[Message]) -> Result<Invocation<String>, ResearchError> {
        self.recovery
            .complete(self.llm.as_ref(), &self.model, messages, self.request_timeout)
            .await
    }

    /// 带工具的调用：工具 schema 注入 system prompt，回复解析为 ModelTurn；
    /// 工具调用 JSON 不合法时追加纠正提示重试，耗尽后把原文当作直接回复
    pub async fn invoke(
        &self,
        messages: &[Message],
        tools: Option<&[ToolSpec]>,
    ) -> Result<Invocation<ModelTurn>, ResearchError> {
        let mut request = match tools {
            Some(specs) if !specs.is_empty() => with_system_suffix(messages, &render_tool_instructions(specs)),
            _ => messages.to_vec(),
        };
        let mut attempt = 0u32;
        loop {
            let raw = match self.invoke_text(&request).await? {
                Invocation::Complete(raw) => raw,
                Invocation::Degraded { reason } => return Ok(Invocation::Degraded { reason }),
            };
            match parse_llm_output(&raw) {
                Ok(PlannerOutput::Response(content)) => {
                    return Ok(Invocation::Complete(ModelTurn {
                        content,
                        tool_calls: Vec::new(),
                    }))
                }
                Ok(PlannerOutput::ToolCalls { content, calls }) => {
                    return Ok(Invocation::Complete(ModelTurn {
                        content,
                        tool_calls: calls,
                    }))
                }
                Err(e) => match self.recovery.handle_malformed(&e.to_string(), attempt) {
                    RecoveryAction::RetryWithPrompt(prompt) => {
                        attempt += 1;
                        tracing::warn!(model = %self.model, attempt, "Malformed tool call, retrying with corrective prompt");
                        request.push(Message::assistant(raw));
                        request.push(Message::user(prompt));
                    }
                    _ => {
                        tracing::warn!(model = %self.model, "Tool call still malformed, using raw text as response");
                        return Ok(Invocation::Complete(ModelTurn {
                            content: raw.trim().to_string(),
                            tool_calls: Vec::new(),
                        }));
                    }
                },
            }
        }
    }

    /// 结构化调用：回复须为匹配 T 的 JSON；不合法时追加纠正提示重试，耗尽后回退为原文
    pub async fn invoke_structured<T: DeserializeOwned + JsonSchema>(
        &self,
        messages: &[Message],
    ) -> Result<Invocation<Structured<T>>, ResearchError> {
        let mut request = with_system_suffix(messages, &render_output_instructions::<T>());
        let mut attempt = 0u32;
        loop {
            let raw = match self.invoke_text(&request).await? {
                Invocation::Complete(raw) => raw,
                Invocation::Degraded { reason } => return Ok(Invocation::Degraded { reason }),
            };
            match parse_structured::<T>(&raw) {
                Ok(parsed) => return Ok(Invocation::Complete(Structured::Parsed(parsed))),
                Err(e) => match self.recovery.handle_malformed(&e.to_string(), attempt) {
                    RecoveryAction::RetryWithPrompt(prompt) => {
                        attempt += 1;
                        tracing::warn!(model = %self.model, attempt, "Malformed structured output, retrying");
                        request.push(Message::assistant(raw));
                        request.push(Message::user(prompt));
                    }
                    _ => {
                        tracing::warn!(model = %self.model, "Structured output retries exhausted, falling back to raw text");
                        return Ok(Invocation::Complete(Structured::Unstructured(raw)));
                    }
                },
            }
        }
    }
}
