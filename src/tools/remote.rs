//! 外部工具服务：通过 ToolServer 发现并调用远程工具
//!
//! ToolServer 负责 list_tools / call_tool（鉴权与传输握手由实现方处理）；
//! 每个发现的工具包装为 RemoteTool，以 External 层级注册到研究单元的工具表。

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::tools::Tool;

/// 远程工具描述
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "empty_object_schema")]
    pub input_schema: Value,
    #[serde(default)]
    pub output_schema: Option<Value>,
}

fn empty_object_schema() -> Value {
    serde_json::json!({"type": "object", "properties": {}})
}

/// 工具服务 trait
#[async_trait]
pub trait ToolServer: Send + Sync {
    /// 服务名（用于日志）
    fn server_name(&self) -> &str;

    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, String>;

    async fn call_tool(&self, name: &str, args: Value) -> Result<String, String>;
}

/// 包装远程工具为本地 Tool
pub struct RemoteTool {
    server: Arc<dyn ToolServer>,
    descriptor: ToolDescriptor,
    description: String,
}

impl RemoteTool {
    pub fn new(server: Arc<dyn ToolServer>, descriptor: ToolDescriptor) -> Self {
        let description = match &descriptor.output_schema {
            Some(schema) => format!("{} Returns: {}", descriptor.description, schema),
            None => descriptor.description.clone(),
        };
        Self {
            server,
            descriptor,
            description,
        }
    }
}

#[async_trait]
impl Tool for RemoteTool {
    fn name(&self) -> &str {
        &self.descriptor.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> Value {
        self.descriptor.input_schema.clone()
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        self.server.call_tool(&self.descriptor.name, args).await
    }
}

/// 从所有服务发现工具；单个服务失败只记录警告，不影响其它服务
pub async fn discover_tools(servers: &[Arc<dyn ToolServer>]) -> Vec<Arc<dyn Tool>> {
    let mut tools: Vec<Arc<dyn Tool>> = Vec::new();
    for server in servers {
        match server.list_tools().await {
            Ok(descriptors) => {
                tracing::info!(server = server.server_name(), count = descriptors.len(), "Discovered remote tools");
                tools.extend(
                    descriptors
                        .into_iter()
                        .map(|d| Arc::new(RemoteTool::new(server.clone(), d)) as Arc<dyn Tool>),
                );
            }
            Err(e) => {
                tracing::warn!(server = server.server_name(), error = %e, "Tool discovery failed, skipping server");
            }
        }
    }
    tools
}
