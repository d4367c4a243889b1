//! Hive - Rust 深度研究编排引擎
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 合并规则、状态机、并发派发、失败恢复、检查点与编排器
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / DeepSeek / Mock / Scripted）
//! - **memory**: 消息日志与 token 预算
//! - **observability**: 日志初始化
//! - **research**: 监督循环、研究单元、prompt 与过程事件
//! - **tools**: 工具注册表、执行器、搜索与外部工具发现

pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod research;
pub mod tools;

pub use crate::core::{ResearchBuilder, ResearchOrchestrator, RunOutcome};
