//! Web 搜索工具：可插拔搜索后端、URL 去重、网页摘要与正文长度上限
//!
//! SearchTool（工具名 web_search）并发执行多条查询，按 URL 去重后，对带原文的结果可选地调用摘要模型；
//! 原文超过 max_content_length 时截断。HTML 原文使用 html2text 提取可读文本。

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use html2text::from_read;
use reqwest::Client;
use schemars::{schema_for, JsonSchema};
use serde::Deserialize;
use serde_json::Value;

use crate::memory::Message;
use crate::research::planner::{ChatModel, Structured};
use crate::research::prompts::summarize_page_prompt;
use crate::tools::Tool;

pub const WEB_SEARCH: &str = "web_search";

const TAVILY_ENDPOINT: &str = "https://api.tavily.com/search";

/// 单条搜索结果
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SearchHit {
    pub title: String,
    pub url: String,
    /// 搜索引擎给出的摘要片段
    #[serde(default)]
    pub content: String,
    /// 网页原文（后端支持时）
    #[serde(default)]
    pub raw_content: Option<String>,
}

/// 搜索后端 trait
#[async_trait]
pub trait SearchBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<SearchHit>, String>;
}

/// Tavily 搜索后端
pub struct TavilyBackend {
    client: Client,
    api_key: String,
}

#[derive(Deserialize)]
struct TavilyResponse {
    #[serde(default)]
    results: Vec<SearchHit>,
}

impl TavilyBackend {
    pub fn new(api_key: impl Into<String>, timeout_secs: u64) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .unwrap_or_default();
        Self {
            client,
            api_key: api_key.into(),
        }
    }

    /// 从环境变量 TAVILY_API_KEY 创建
    pub fn from_env(timeout_secs: u64) -> Option<Self> {
        std::env::var("TAVILY_API_KEY")
            .ok()
            .filter(|k| !k.trim().is_empty())
            .map(|key| Self::new(key, timeout_secs))
    }
}

#[async_trait]
impl SearchBackend for TavilyBackend {
    fn name(&self) -> &str {
        "tavily"
    }

    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<SearchHit>, String> {
        let body = serde_json::json!({
            "query": query,
            "max_results": max_results,
            "include_raw_content": true,
            "topic": "general",
        });
        let resp = self
            .client
            .post(TAVILY_ENDPOINT)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| format!("Request failed: {e}"))?;
        if !resp.status().is_success() {
            return Err(format!("HTTP {}", resp.status()));
        }
        let parsed: TavilyResponse = resp.json().await.map_err(|e| format!("Read body: {e}"))?;
        Ok(parsed.results)
    }
}

/// web_search 参数
#[derive(Debug, Deserialize, JsonSchema)]
pub struct SearchArgs {
    /// 要执行的搜索查询（可多条，并发执行）
    #[serde(default)]
    pub queries: Vec<String>,
    /// 单条查询（与 queries 二选一）
    #[serde(default)]
    pub query: Option<String>,
}

/// 网页摘要模型的结构化输出
#[derive(Debug, Deserialize, JsonSchema)]
pub struct PageSummary {
    pub summary: String,
    #[serde(default)]
    pub key_excerpts: String,
}

/// 搜索工具配置
#[derive(Debug, Clone, Copy)]
pub struct SearchOptions {
    pub max_results: usize,
    pub max_content_length: usize,
    /// 单页摘要超时；超时后使用截断原文
    pub summary_timeout: Duration,
}

/// Search 工具：调用后端、去重、摘要并格式化结果
pub struct SearchTool {
    backend: Arc<dyn SearchBackend>,
    summarizer: Option<ChatModel>,
    options: SearchOptions,
}

/// 简易去除 HTML 标签（html2text 失败时的回退）
fn strip_html_tags(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// 判断内容是否像 HTML（需提取可读文本）
fn looks_like_html(s: &str) -> bool {
    let s = s.trim_start();
    s.starts_with("<!")
        || s.starts_with("<html")
        || s.starts_with("<HTML")
        || (s.len() > 20 && s.contains('<') && (s.contains("</") || s.contains("<meta") || s.contains("<head")))
}

fn html_to_text(html: &str) -> String {
    match from_read(html.as_bytes(), 120) {
        Ok(text) if !text.trim().is_empty() => text,
        _ => strip_html_tags(html),
    }
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() > max_chars {
        text.chars().take(max_chars).collect::<String>() + "\n...[truncated]"
    } else {
        text.to_string()
    }
}

/// 按 URL 去重，保留首次出现的结果
pub fn dedup_by_url(hits: Vec<SearchHit>) -> Vec<SearchHit> {
    let mut seen = HashSet::new();
    hits.into_iter().filter(|h| seen.insert(h.url.clone())).collect()
}

impl SearchTool {
    pub fn new(backend: Arc<dyn SearchBackend>, summarizer: Option<ChatModel>, options: SearchOptions) -> Self {
        Self {
            backend,
            summarizer,
            options,
        }
    }

    /// 清洗原文：HTML 转文本并截断到 max_content_length
    fn clean_raw(&self, raw: &str) -> String {
        let raw = raw.trim_start_matches('\u{FEFF}');
        let text = if looks_like_html(raw) { html_to_text(raw) } else { raw.to_string() };
        truncate_chars(&text, self.options.max_content_length)
    }

    /// 对单条结果生成正文：有原文且启用摘要时调用摘要模型，失败或超时则回退为截断后的原文或片段
    async fn render_content(&self, hit: &SearchHit) -> String {
        let Some(raw) = hit.raw_content.as_deref().filter(|r| !r.trim().is_empty()) else {
            return hit.content.clone();
        };
        let cleaned = self.clean_raw(raw);
        let Some(model) = &self.summarizer else {
            return cleaned;
        };
        let messages = [Message::system(summarize_page_prompt()), Message::user(cleaned.clone())];
        let summarized = tokio::time::timeout(
            self.options.summary_timeout,
            model.invoke_structured::<PageSummary>(&messages),
        )
        .await;
        let Ok(summarized) = summarized else {
            tracing::warn!(
                url = %hit.url,
                timeout = ?self.options.summary_timeout,
                "Page summarization timed out, using raw content"
            );
            return cleaned;
        };
        match summarized {
            Ok(invocation) => match invocation.complete() {
                Some(Structured::Parsed(page)) if page.key_excerpts.trim().is_empty() => page.summary,
                Some(Structured::Parsed(page)) => format!(
                    "<summary>\n{}\n</summary>\n\n<key_excerpts>\n{}\n</key_excerpts>",
                    page.summary, page.key_excerpts
                ),
                Some(Structured::Unstructured(text)) => text,
                None => cleaned,
            },
            Err(e) => {
                tracing::warn!(url = %hit.url, error = %e, "Page summarization failed, using raw content");
                cleaned
            }
        }
    }

    async fn run(&self, queries: Vec<String>) -> Result<String, String> {
        let results = join_all(
            queries
                .iter()
                .map(|q| self.backend.search(q, self.options.max_results)),
        )
        .await;

        let mut hits = Vec::new();
        let mut errors = Vec::new();
        for (query, result) in queries.iter().zip(results) {
            match result {
                Ok(found) => hits.extend(found),
                Err(e) => {
                    tracing::warn!(backend = self.backend.name(), %query, error = %e, "Search query failed");
                    errors.push(e);
                }
            }
        }
        if hits.is_empty() && !errors.is_empty() {
            return Err(errors.join("; "));
        }

        let hits = dedup_by_url(hits);
        if hits.is_empty() {
            return Ok("No valid search results found. Please try different search queries.".to_string());
        }

        let contents = join_all(hits.iter().map(|h| self.render_content(h))).await;
        let mut out = String::from("Search results:\n");
        for (i, (hit, content)) in hits.iter().zip(contents).enumerate() {
            out.push_str(&format!(
                "\n--- SOURCE {}: {} ---\nURL: {}\n\n{}\n\n{}\n",
                i + 1,
                hit.title,
                hit.url,
                content,
                "-".repeat(80)
            ));
        }
        Ok(out)
    }
}

#[async_trait]
impl Tool for SearchTool {
    fn name(&self) -> &str {
        WEB_SEARCH
    }

    fn description(&self) -> &str {
        "Search the web. Runs all queries in parallel and returns deduplicated, summarized results. Args: {\"queries\": [\"...\"]}."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::to_value(schema_for!(SearchArgs)).unwrap_or_else(|_| serde_json::json!({"type": "object"}))
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let parsed: SearchArgs =
            serde_json::from_value(args).map_err(|e| format!("Invalid web_search args: {e}"))?;
        let mut queries: Vec<String> = parsed
            .queries
            .into_iter()
            .chain(parsed.query)
            .map(|q| q.trim().to_string())
            .filter(|q| !q.is_empty())
            .collect();
        queries.dedup();
        if queries.is_empty() {
            return Err("Missing queries".to_string());
        }
        tracing::info!(backend = self.backend.name(), count = queries.len(), "web search");
        self.run(queries).await
    }
}
