//! 内置工具：ConductResearch / ResearchComplete / think_tool
//!
//! ConductResearch 与 ResearchComplete 是控制信号，由监督循环和研究单元拦截处理；
//! 注册为工具是为了把参数 schema 暴露给模型。think_tool 只记录反思内容。

use async_trait::async_trait;
use schemars::{schema_for, JsonSchema};
use serde::Deserialize;
use serde_json::Value;

use crate::tools::Tool;

pub const CONDUCT_RESEARCH: &str = "ConductResearch";
pub const RESEARCH_COMPLETE: &str = "ResearchComplete";
pub const THINK_TOOL: &str = "think_tool";

/// ConductResearch 参数
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ConductResearchArgs {
    /// 要研究的单一主题，需完整独立地描述（至少一段话）
    pub research_topic: String,
}

impl ConductResearchArgs {
    /// 解析并校验委派参数；主题为空视为格式错误
    pub fn parse(args: &Value) -> Result<Self, String> {
        let parsed: Self = serde_json::from_value(args.clone())
            .map_err(|e| format!("Invalid ConductResearch args: {e}"))?;
        if parsed.research_topic.trim().is_empty() {
            return Err("Invalid ConductResearch args: research_topic is empty".to_string());
        }
        Ok(parsed)
    }
}

/// think_tool 参数
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ThinkArgs {
    /// 对当前进展、缺口与下一步的反思
    pub reflection: String,
}

fn schema_value<T: JsonSchema>() -> Value {
    serde_json::to_value(schema_for!(T)).unwrap_or_else(|_| serde_json::json!({"type": "object"}))
}

pub struct ConductResearchTool;

#[async_trait]
impl Tool for ConductResearchTool {
    fn name(&self) -> &str {
        CONDUCT_RESEARCH
    }

    fn description(&self) -> &str {
        "Delegate one research topic to a dedicated research assistant. Args: {\"research_topic\": \"...\"}."
    }

    fn parameters_schema(&self) -> Value {
        schema_value::<ConductResearchArgs>()
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let parsed = ConductResearchArgs::parse(&args)?;
        Ok(format!("Research delegated: {}", parsed.research_topic))
    }
}

pub struct ResearchCompleteTool;

#[async_trait]
impl Tool for ResearchCompleteTool {
    fn name(&self) -> &str {
        RESEARCH_COMPLETE
    }

    fn description(&self) -> &str {
        "Signal that the research is complete. Takes no arguments."
    }

    async fn execute(&self, _args: Value) -> Result<String, String> {
        Ok("Research marked complete.".to_string())
    }
}

pub struct ThinkTool;

#[async_trait]
impl Tool for ThinkTool {
    fn name(&self) -> &str {
        THINK_TOOL
    }

    fn description(&self) -> &str {
        "Record a short reflection on progress, gaps and next steps. Args: {\"reflection\": \"...\"}."
    }

    fn parameters_schema(&self) -> Value {
        schema_value::<ThinkArgs>()
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let parsed: ThinkArgs =
            serde_json::from_value(args).map_err(|e| format!("Invalid think_tool args: {e}"))?;
        Ok(format!("Reflection recorded: {}", parsed.reflection))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_conduct_research_args() {
        let ok = ConductResearchArgs::parse(&json!({"research_topic": "rust async runtimes"})).unwrap();
        assert_eq!(ok.research_topic, "rust async runtimes");
        assert!(ConductResearchArgs::parse(&json!({"topic": "x"})).is_err());
        assert!(ConductResearchArgs::parse(&json!({"research_topic": "  "})).is_err());
    }

    #[tokio::test]
    async fn test_think_tool_records_reflection() {
        let out = ThinkTool.execute(json!({"reflection": "need more sources"})).await.unwrap();
        assert!(out.contains("need more sources"));
        assert!(ThinkTool.execute(json!({})).await.is_err());
    }

    #[test]
    fn test_schema_exposes_topic_field() {
        let schema = ConductResearchTool.parameters_schema().to_string();
        assert!(schema.contains("research_topic"));
    }
}
