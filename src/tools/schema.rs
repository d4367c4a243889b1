//! 工具调用与结构化输出的 JSON Schema（schemars 自动生成）
//!
//! 用于将「合法 tool call」与结构化回复的 JSON 结构注入 system prompt，减少模型输出格式错误。

use schemars::{schema_for, JsonSchema};

use crate::tools::ToolSpec;

/// 单个工具调用：`{"tool": "...", "args": {...}}`（仅用于 Schema 生成）
#[allow(dead_code)]
#[derive(JsonSchema)]
struct ToolCallFormat {
    /// 工具名
    tool: String,
    /// 工具参数，结构见各工具的 parameters
    args: serde_json::Map<String, serde_json::Value>,
}

/// 一次回复中并行发起多个工具调用
#[allow(dead_code)]
#[derive(JsonSchema)]
struct ToolCallsFormat {
    tool_calls: Vec<ToolCallFormat>,
}

/// 返回工具调用的 JSON Schema 字符串
pub fn tool_call_schema_json() -> String {
    let schema = schema_for!(ToolCallsFormat);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}

/// 返回任意结构化输出类型的 JSON Schema 字符串
pub fn output_schema_json<T: JsonSchema>() -> String {
    let schema = schema_for!(T);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}

/// 渲染追加到 system prompt 的工具说明段落
pub fn render_tool_instructions(specs: &[ToolSpec]) -> String {
    let tools = serde_json::to_string_pretty(specs).unwrap_or_else(|_| "[]".to_string());
    format!(
        "## Available tools\n{tools}\n\n\
        ## Calling tools\n\
        To call tools, reply with only one JSON object and nothing else, for example \
        {{\"tool_calls\": [{{\"tool\": \"name\", \"args\": {{...}}}}]}}. \
        A single call may also be written as {{\"tool\": \"name\", \"args\": {{...}}}}. \
        Several calls in one reply run in parallel. The object must match this schema:\n{}\n\
        To answer without tools, reply with plain text.",
        tool_call_schema_json()
    )
}

/// 渲染追加到 system prompt 的结构化输出说明
pub fn render_output_instructions<T: JsonSchema>() -> String {
    format!(
        "## Output format\nReply with only one JSON object matching this schema, \
        without markdown fences or any other text:\n{}",
        output_schema_json::<T>()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_call_schema_mentions_fields() {
        let schema = tool_call_schema_json();
        assert!(schema.contains("tool_calls"));
        assert!(schema.contains("args"));
    }

    #[test]
    fn test_render_tool_instructions_lists_tools() {
        let specs = vec![ToolSpec {
            name: "think_tool".into(),
            description: "reflect".into(),
            parameters: serde_json::json!({"type": "object"}),
        }];
        let text = render_tool_instructions(&specs);
        assert!(text.contains("think_tool"));
        assert!(text.contains("## Calling tools"));
    }
}
