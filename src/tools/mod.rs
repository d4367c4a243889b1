//! 工具箱：注册表、执行器、JSON schema 渲染、信号工具、网页搜索与外部工具发现

pub mod executor;
pub mod registry;
pub mod remote;
pub mod schema;
pub mod search;
pub mod signals;

pub use executor::ToolExecutor;
pub use registry::{Tool, ToolCollision, ToolRegistry, ToolSpec, ToolTier};
pub use remote::{discover_tools, RemoteTool, ToolDescriptor, ToolServer};
pub use schema::tool_call_schema_json;
pub use search::{SearchBackend, SearchHit, SearchOptions, SearchTool, TavilyBackend, WEB_SEARCH};
pub use signals::{
    ConductResearchArgs, ConductResearchTool, ResearchCompleteTool, ThinkTool, CONDUCT_RESEARCH,
    RESEARCH_COMPLETE, THINK_TOOL,
};
