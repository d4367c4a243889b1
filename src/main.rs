//! Hive - Rust 深度研究编排引擎
//!
//! 用法：
//! - `hive [--config <file>] [--events] "<问题>"`：开始一次研究
//! - `hive [--config <file>] [--events] --resume <run_id> "<回答>"`：回答澄清问题并继续挂起的运行

use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::Parser;
use hive::config::load_config;
use hive::{ResearchBuilder, RunOutcome};

/// Hive - 有界并发的深度研究编排
#[derive(Parser, Debug)]
#[command(name = "hive", version, about = "Bounded multi-step research orchestration")]
struct Cli {
    /// 额外的配置文件（覆盖 config/default.toml）
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 以 JSON 行把过程事件打印到 stderr
    #[arg(long)]
    events: bool,

    /// 回答挂起运行的澄清问题
    #[arg(long, value_name = "RUN_ID")]
    resume: Option<String>,

    /// 研究问题，或 --resume 时对澄清问题的回答
    #[arg(required = true)]
    query: Vec<String>,
}

impl Cli {
    fn text(&self) -> anyhow::Result<String> {
        let text = self.query.join(" ");
        if text.trim().is_empty() {
            bail!("query must not be empty");
        }
        Ok(text)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    hive::observability::init();

    let cli = Cli::parse();
    let text = cli.text()?;
    let cfg = load_config(cli.config.clone()).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        Default::default()
    });

    let mut builder = ResearchBuilder::new(cfg);
    if cli.events {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        builder = builder.with_events(tx);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Ok(line) = serde_json::to_string(&event) {
                    eprintln!("{line}");
                }
            }
        });
    }
    let orchestrator = builder.build().await;

    let outcome = match &cli.resume {
        Some(run_id) => orchestrator
            .resume(run_id, &text)
            .await
            .with_context(|| format!("Failed to resume run {run_id}"))?,
        None => orchestrator.run(&text).await.context("Research run failed")?,
    };

    let (prompt, completion, total) = orchestrator.context().research_model.token_usage();
    tracing::info!(run_id = outcome.run_id(), prompt, completion, total, "Token usage");

    match outcome {
        RunOutcome::Completed { final_output, state } => {
            if final_output.degraded {
                eprintln!("warning: report is degraded (run {})", state.run_id);
            }
            println!("{}", final_output.report);
        }
        RunOutcome::NeedsClarification { question, state } => {
            println!("{question}");
            eprintln!("Reply with: hive --resume {} \"<answer>\"", state.run_id);
        }
    }
    Ok(())
}
