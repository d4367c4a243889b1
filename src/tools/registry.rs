//! 工具注册表
//!
//! 所有工具实现 Tool trait（name / description / parameters_schema / execute）。
//! 工具分三层注册：BuiltIn（信号与反思工具）、Search（搜索后端）、External（ToolServer 发现的远程工具）。
//! 同名工具先注册者胜出，后注册者被拒绝并产生一条 ToolCollision 诊断，永远不可调用。

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

/// 工具 trait：名称、描述（供 LLM 理解）、参数 schema、异步执行（args 为 JSON）
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具名称（用于 JSON 中的 "tool" 字段）
    fn name(&self) -> &str;

    /// 工具描述（供 LLM 理解功能）
    fn description(&self) -> &str;

    /// 参数 JSON Schema；默认返回空对象，表示无参数
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    /// 执行工具；Err 为可读的失败原因
    async fn execute(&self, args: Value) -> Result<String, String>;
}

/// 工具来源层级（注册顺序即优先级）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolTier {
    BuiltIn,
    Search,
    External,
}

/// 注入 prompt 的工具描述
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// 同名工具冲突诊断：kept 为已注册的层级，rejected 为被拒绝的层级
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolCollision {
    pub name: String,
    pub kept: ToolTier,
    pub rejected: ToolTier,
}

struct Entry {
    tool: Arc<dyn Tool>,
    tier: ToolTier,
}

/// 有序工具注册表：保持注册顺序，按名称查找
#[derive(Default)]
pub struct ToolRegistry {
    entries: Vec<Entry>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册单个工具；名称已存在时拒绝并返回冲突诊断
    pub fn register(&mut self, tool: Arc<dyn Tool>, tier: ToolTier) -> Option<ToolCollision> {
        if let Some(existing) = self.entries.iter().find(|e| e.tool.name() == tool.name()) {
            let collision = ToolCollision {
                name: tool.name().to_string(),
                kept: existing.tier,
                rejected: tier,
            };
            tracing::warn!(
                tool = %collision.name,
                kept = ?collision.kept,
                rejected = ?collision.rejected,
                "Tool name collision, later registration ignored"
            );
            return Some(collision);
        }
        self.entries.push(Entry { tool, tier });
        None
    }

    /// 按层级批量注册，返回本层产生的全部冲突
    pub fn register_tier(
        &mut self,
        tier: ToolTier,
        tools: impl IntoIterator<Item = Arc<dyn Tool>>,
    ) -> Vec<ToolCollision> {
        tools
            .into_iter()
            .filter_map(|tool| self.register(tool, tier))
            .collect()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.entries
            .iter()
            .find(|e| e.tool.name() == name)
            .map(|e| e.tool.clone())
    }

    pub fn tier_of(&self, name: &str) -> Option<ToolTier> {
        self.entries
            .iter()
            .find(|e| e.tool.name() == name)
            .map(|e| e.tier)
    }

    pub async fn execute(&self, name: &str, args: Value) -> Result<String, String> {
        let tool = self.get(name).ok_or_else(|| format!("Unknown tool: {name}"))?;
        tool.execute(args).await
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.tool.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 按注册顺序返回工具描述
    pub fn specs(&self) -> Vec<ToolSpec> {
        self.entries
            .iter()
            .map(|e| ToolSpec {
                name: e.tool.name().to_string(),
                description: e.tool.description().to_string(),
                parameters: e.tool.parameters_schema(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named {
        name: &'static str,
        reply: &'static str,
    }

    #[async_trait]
    impl Tool for Named {
        fn name(&self) -> &str {
            self.name
        }

        fn description(&self) -> &str {
            "test tool"
        }

        async fn execute(&self, _args: Value) -> Result<String, String> {
            Ok(self.reply.to_string())
        }
    }

    fn named(name: &'static str, reply: &'static str) -> Arc<dyn Tool> {
        Arc::new(Named { name, reply })
    }

    #[tokio::test]
    async fn test_first_registered_wins() {
        let mut registry = ToolRegistry::new();
        assert!(registry.register(named("web_search", "builtin"), ToolTier::Search).is_none());
        let collisions =
            registry.register_tier(ToolTier::External, vec![named("web_search", "remote"), named("fetch", "ok")]);

        assert_eq!(
            collisions,
            vec![ToolCollision {
                name: "web_search".into(),
                kept: ToolTier::Search,
                rejected: ToolTier::External,
            }]
        );
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.tier_of("web_search"), Some(ToolTier::Search));
        let out = registry.execute("web_search", Value::Null).await.unwrap();
        assert_eq!(out, "builtin");
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let registry = ToolRegistry::new();
        let err = registry.execute("nope", Value::Null).await.unwrap_err();
        assert!(err.contains("Unknown tool"));
    }

    #[test]
    fn test_specs_keep_registration_order() {
        let mut registry = ToolRegistry::new();
        registry.register(named("b", ""), ToolTier::BuiltIn);
        registry.register(named("a", ""), ToolTier::BuiltIn);
        let names: Vec<String> = registry.specs().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["b", "a"]);
    }
}
