//! 研究构建器：统一的运行上下文初始化逻辑
//!
//! 从 AppConfig 构建各阶段的 ChatModel、监督者与研究单元的工具表、恢复策略与事件通道，
//! 最终产出 ResearchOrchestrator。研究单元工具表按 BuiltIn → Search → External 三层合并，同名先到先得。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;

use crate::config::{AppConfig, LlmSection, ResearchConfig};
use crate::core::checkpoint::{CheckpointStore, JsonFileCheckpointStore};
use crate::core::orchestrator::ResearchOrchestrator;
use crate::core::recovery::{RecoveryEngine, RecoveryPolicy};
use crate::llm::{create_deepseek_client, LlmClient, MockLlmClient, OpenAiClient};
use crate::research::events::{EventSink, ResearchEvent};
use crate::research::planner::ChatModel;
use crate::tools::search::SearchOptions;
use crate::tools::{
    discover_tools, ConductResearchTool, ResearchCompleteTool, SearchBackend, SearchTool, TavilyBackend,
    ThinkTool, Tool, ToolCollision, ToolExecutor, ToolRegistry, ToolServer, ToolTier,
};

/// 一次研究运行共享的只读上下文（各研究单元并发读取，不含可变状态）
pub struct ResearchContext {
    pub config: ResearchConfig,
    /// 监督者与研究单元使用的模型
    pub research_model: ChatModel,
    pub compression_model: ChatModel,
    pub final_report_model: ChatModel,
    pub supervisor_tools: ToolExecutor,
    pub researcher_tools: ToolExecutor,
    /// 工具表合并时产生的冲突诊断
    pub tool_collisions: Vec<ToolCollision>,
    /// 研究单元 prompt 中列出的外部工具说明
    pub external_tool_hint: String,
    pub events: EventSink,
}

/// 根据配置选择 LLM 后端；没有可用的 API Key 时回退为 Mock
/// 单页摘要超时：取配置值，但不超过工具超时的 4/5
fn summary_timeout(summary_secs: u64, tool_timeout_secs: u64) -> Duration {
    let ceiling = Duration::from_secs(tool_timeout_secs) * 4 / 5;
    Duration::from_secs(summary_secs.max(1)).min(ceiling)
}

pub fn create_llm_from_config(cfg: &LlmSection) -> Arc<dyn LlmClient> {
    let provider = cfg.provider.to_lowercase();
    let has_deepseek_key = std::env::var("DEEPSEEK_API_KEY").is_ok();
    let has_openai_key = std::env::var("OPENAI_API_KEY").is_ok();

    if provider == "mock" {
        tracing::info!("Using Mock LLM (configured)");
        return Arc::new(MockLlmClient);
    }
    // 有 DeepSeek Key 或（配置为 deepseek 且仅有 OpenAI Key 时也走 DeepSeek 兼容端点）
    let use_deepseek = (has_deepseek_key && provider != "openai") || (provider == "deepseek" && has_openai_key);
    if use_deepseek {
        tracing::info!("Using DeepSeek LLM ({})", cfg.model);
        Arc::new(create_deepseek_client(Some(&cfg.model)))
    } else if has_openai_key {
        tracing::info!("Using OpenAI-compatible LLM ({})", cfg.model);
        Arc::new(OpenAiClient::new(
            cfg.base_url.as_deref(),
            &cfg.model,
            std::env::var("OPENAI_API_KEY").ok().as_deref(),
        ))
    } else {
        tracing::warn!("No API key set or provider unknown, using Mock LLM");
        Arc::new(MockLlmClient)
    }
}

/// 研究构建器：统一配置和初始化研究运行的各个组件
pub struct ResearchBuilder {
    config: AppConfig,
    llm: Option<Arc<dyn LlmClient>>,
    search_backend: Option<Arc<dyn SearchBackend>>,
    tool_servers: Vec<Arc<dyn ToolServer>>,
    checkpoint_store: Option<Arc<dyn CheckpointStore>>,
    events: EventSink,
}

impl ResearchBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            llm: None,
            search_backend: None,
            tool_servers: Vec::new(),
            checkpoint_store: None,
            events: EventSink::disabled(),
        }
    }

    /// 指定 LLM 客户端（不指定时按配置创建）
    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    /// 指定搜索后端（不指定时按 [tools.search] 创建）
    pub fn with_search_backend(mut self, backend: Arc<dyn SearchBackend>) -> Self {
        self.search_backend = Some(backend);
        self
    }

    /// 追加外部工具服务
    pub fn with_tool_server(mut self, server: Arc<dyn ToolServer>) -> Self {
        self.tool_servers.push(server);
        self
    }

    pub fn with_checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoint_store = Some(store);
        self
    }

    /// 订阅过程事件
    pub fn with_events(mut self, tx: UnboundedSender<ResearchEvent>) -> Self {
        self.events = EventSink::new(tx);
        self
    }

    fn recovery_engine(&self) -> RecoveryEngine {
        RecoveryEngine::new(RecoveryPolicy {
            max_capacity_retries: self.config.recovery.max_capacity_retries,
            max_transient_retries: self.config.recovery.max_transient_retries,
            base_backoff_ms: self.config.recovery.base_backoff_ms,
            max_structured_output_retries: self.config.research.max_structured_output_retries,
        })
    }

    fn search_backend(&self) -> Option<Arc<dyn SearchBackend>> {
        if let Some(backend) = &self.search_backend {
            return Some(backend.clone());
        }
        let search = &self.config.tools.search;
        match search.provider.to_lowercase().as_str() {
            "tavily" => match TavilyBackend::from_env(search.timeout_secs) {
                Some(backend) => Some(Arc::new(backend)),
                None => {
                    tracing::warn!("TAVILY_API_KEY not set, web search disabled");
                    None
                }
            },
            "none" => None,
            other => {
                tracing::warn!(provider = other, "Unknown search provider, web search disabled");
                None
            }
        }
    }

    /// allowed_tools 非空时只保留名单内的工具
    fn allowed(&self, tool: &Arc<dyn Tool>) -> bool {
        let allowed = &self.config.research.allowed_tools;
        allowed.is_empty() || allowed.iter().any(|name| name == tool.name())
    }

    /// 构建研究单元工具表：内置 → 搜索 → 外部，返回 (注册表, 冲突诊断, 外部工具说明)
    async fn build_researcher_registry(&self, summarizer: ChatModel) -> (ToolRegistry, Vec<ToolCollision>, String) {
        let mut registry = ToolRegistry::new();
        let mut collisions = Vec::new();

        let built_in: Vec<Arc<dyn Tool>> = vec![Arc::new(ResearchCompleteTool), Arc::new(ThinkTool)];
        collisions.extend(registry.register_tier(ToolTier::BuiltIn, built_in));

        if let Some(backend) = self.search_backend() {
            let search = &self.config.tools.search;
            let summarizer = search.summarize_pages.then_some(summarizer);
            let tool: Arc<dyn Tool> = Arc::new(SearchTool::new(
                backend,
                summarizer,
                SearchOptions {
                    max_results: search.max_results,
                    max_content_length: search.max_content_length,
                    summary_timeout: summary_timeout(search.summary_timeout_secs, self.config.tools.tool_timeout_secs),
                },
            ));
            let tools = Some(tool).into_iter().filter(|t| self.allowed(t));
            collisions.extend(registry.register_tier(ToolTier::Search, tools));
        }

        let external: Vec<Arc<dyn Tool>> = discover_tools(&self.tool_servers)
            .await
            .into_iter()
            .filter(|t| self.allowed(t))
            .collect();
        let external_names: Vec<String> = external.iter().map(|t| t.name().to_string()).collect();
        collisions.extend(registry.register_tier(ToolTier::External, external));

        // 只列出真正可调用的外部工具
        let reachable: Vec<&String> = external_names
            .iter()
            .filter(|name| registry.tier_of(name) == Some(ToolTier::External))
            .collect();
        let hint = if reachable.is_empty() {
            "none".to_string()
        } else {
            reachable.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", ")
        };
        (registry, collisions, hint)
    }

    /// 构建共享上下文
    pub async fn build_context(&self) -> ResearchContext {
        let llm = self
            .llm
            .clone()
            .unwrap_or_else(|| create_llm_from_config(&self.config.llm));
        let recovery = self.recovery_engine();
        let timeout = Duration::from_secs(self.config.llm.request_timeout_secs);
        let models = &self.config.research.models;
        let model = |name: &str| ChatModel::new(llm.clone(), name, recovery.clone(), timeout);

        let mut supervisor_registry = ToolRegistry::new();
        let supervisor_tools: Vec<Arc<dyn Tool>> = vec![
            Arc::new(ConductResearchTool),
            Arc::new(ResearchCompleteTool),
            Arc::new(ThinkTool),
        ];
        let mut collisions = supervisor_registry.register_tier(ToolTier::BuiltIn, supervisor_tools);

        let (researcher_registry, researcher_collisions, hint) =
            self.build_researcher_registry(model(&models.summarization)).await;
        collisions.extend(researcher_collisions);
        tracing::info!(
            tools = ?researcher_registry.tool_names(),
            collisions = collisions.len(),
            "Research tools registered"
        );

        let timeout_secs = self.config.tools.tool_timeout_secs;
        ResearchContext {
            config: self.config.research.clone(),
            research_model: model(&models.research),
            compression_model: model(&models.compression),
            final_report_model: model(&models.final_report),
            supervisor_tools: ToolExecutor::new(supervisor_registry, timeout_secs, recovery.clone()),
            researcher_tools: ToolExecutor::new(researcher_registry, timeout_secs, recovery),
            tool_collisions: collisions,
            external_tool_hint: hint,
            events: self.events.clone(),
        }
    }

    /// 构建编排器（未指定检查点存储时使用 [app].checkpoint_dir 下的 JSON 文件）
    pub async fn build(self) -> ResearchOrchestrator {
        let ctx = Arc::new(self.build_context().await);
        let store = self
            .checkpoint_store
            .clone()
            .unwrap_or_else(|| Arc::new(JsonFileCheckpointStore::new(&self.config.app.checkpoint_dir)));
        ResearchOrchestrator::new(ctx, store)
    }
}
