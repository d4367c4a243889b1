//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__LLM__PROVIDER=openai`、
//! `HIVE__RESEARCH__MAX_CONCURRENT_RESEARCH_UNITS=3`）。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub research: ResearchConfig,
    pub recovery: RecoverySection,
    pub tools: ToolsSection,
}

/// [app] 段：应用名、检查点目录
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: Option<String>,
    /// 检查点目录（每个 run 一个 JSON 文件）
    pub checkpoint_dir: PathBuf,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            checkpoint_dir: PathBuf::from("workspace/runs"),
        }
    }
}

/// [llm] 段：后端选择与超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// 后端：deepseek / openai / mock；未设置对应 API Key 时回退为 mock
    pub provider: String,
    /// 客户端默认模型（各阶段模型见 [research.models]）
    pub model: String,
    pub base_url: Option<String>,
    /// 单次请求超时（秒），超时按 Transient 处理
    pub request_timeout_secs: u64,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "deepseek".to_string(),
            model: "deepseek-chat".to_string(),
            base_url: None,
            request_timeout_secs: 120,
        }
    }
}

/// 研究单元迭代计数方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IterationCounting {
    /// 每进入一次工具执行计 1
    #[default]
    PerPass,
    /// 按实际执行的工具调用数计数；超出剩余额度的调用不执行
    PerToolCall,
}

/// [research] 段：并发与迭代上限、澄清开关、工具白名单
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResearchConfig {
    pub max_concurrent_research_units: usize,
    pub max_research_iterations: usize,
    pub max_tool_call_iterations: usize,
    pub max_structured_output_retries: u32,
    pub allow_clarification: bool,
    pub iteration_counting: IterationCounting,
    /// 非空时只注册名单内的搜索 / 外部工具（内置工具不受影响）
    pub allowed_tools: Vec<String>,
    pub models: ResearchModels,
}

impl Default for ResearchConfig {
    fn default() -> Self {
        Self {
            max_concurrent_research_units: 5,
            max_research_iterations: 6,
            max_tool_call_iterations: 10,
            max_structured_output_retries: 3,
            allow_clarification: true,
            iteration_counting: IterationCounting::PerPass,
            allowed_tools: Vec::new(),
            models: ResearchModels::default(),
        }
    }
}

/// [research.models] 段：各阶段使用的模型；可写成 `provider:model`，请求时只取模型名
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResearchModels {
    pub research: String,
    pub compression: String,
    pub final_report: String,
    pub summarization: String,
}

impl Default for ResearchModels {
    fn default() -> Self {
        let model = || "deepseek-chat".to_string();
        Self {
            research: model(),
            compression: model(),
            final_report: model(),
            summarization: model(),
        }
    }
}

/// [recovery] 段：容量与瞬时错误的重试策略
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecoverySection {
    pub max_capacity_retries: u32,
    pub max_transient_retries: u32,
    pub base_backoff_ms: u64,
}

impl Default for RecoverySection {
    fn default() -> Self {
        Self {
            max_capacity_retries: 3,
            max_transient_retries: 3,
            base_backoff_ms: 500,
        }
    }
}

/// [tools] 段：工具超时与搜索后端
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    /// 单次工具调用超时（秒）
    pub tool_timeout_secs: u64,
    pub search: SearchSection,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_secs: 30,
            search: SearchSection::default(),
        }
    }
}

/// [tools.search] 段：搜索后端、结果数、正文上限、网页摘要开关
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SearchSection {
    /// tavily / none
    pub provider: String,
    pub max_results: usize,
    /// 原文截断长度（字符）
    pub max_content_length: usize,
    pub timeout_secs: u64,
    pub summarize_pages: bool,
    /// 单页摘要超时（秒），实际取值低于 tool_timeout_secs
    pub summary_timeout_secs: u64,
}

impl Default for SearchSection {
    fn default() -> Self {
        Self {
            provider: "tavily".to_string(),
            max_results: 5,
            max_content_length: 50_000,
            timeout_secs: 15,
            summarize_pages: true,
            summary_timeout_secs: 20,
        }
    }
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("research.allowed_tools")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.research.max_concurrent_research_units, 5);
        assert_eq!(cfg.research.max_research_iterations, 6);
        assert_eq!(cfg.research.max_tool_call_iterations, 10);
        assert_eq!(cfg.research.iteration_counting, IterationCounting::PerPass);
        assert!(cfg.research.allow_clarification);
        assert_eq!(cfg.recovery.max_capacity_retries, 3);
        assert_eq!(cfg.tools.search.max_content_length, 50_000);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[research]\nmax_research_iterations = 2\niteration_counting = \"per_tool_call\"\n\n[research.models]\nresearch = \"openai:gpt-4o\""
        )
        .unwrap();
        let cfg = load_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(cfg.research.max_research_iterations, 2);
        assert_eq!(cfg.research.iteration_counting, IterationCounting::PerToolCall);
        assert_eq!(cfg.research.models.research, "openai:gpt-4o");
        assert_eq!(cfg.research.models.compression, "deepseek-chat");
        assert_eq!(cfg.research.max_concurrent_research_units, 5);
    }
}
