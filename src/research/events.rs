//! 研究过程事件：供 CLI / 前端展示阶段切换、委派、单元结束与终稿状态

use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;

use crate::core::state::{SupervisorExit, UnitExit, WorkflowPhase};

/// 单个过程事件（可序列化为 JSON 供前端展示）
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResearchEvent {
    /// 顶层阶段切换
    PhaseChanged { run_id: String, phase: WorkflowPhase },
    /// 需要用户澄清，运行挂起
    ClarificationRequested { run_id: String, question: String },
    /// 研究简报已生成
    BriefWritten { brief: String },
    /// 监督循环开始第 iteration 轮规划
    SupervisorPass { iteration: usize, max_iterations: usize },
    /// 本轮委派的主题（按派发顺序）
    Delegated { topics: Vec<String> },
    /// 单个研究单元结束
    UnitFinished {
        index: usize,
        topic: String,
        exit_reason: UnitExit,
        tool_call_iterations: usize,
        degraded: bool,
    },
    /// 监督循环结束
    SupervisorFinished {
        exit_reason: SupervisorExit,
        research_iterations: usize,
        peak_active_units: usize,
    },
    /// 终稿生成完毕
    ReportReady { degraded: bool },
}

/// 可选的事件发送端；接收端关闭后静默丢弃
#[derive(Debug, Clone, Default)]
pub struct EventSink(Option<UnboundedSender<ResearchEvent>>);

impl EventSink {
    pub fn new(tx: UnboundedSender<ResearchEvent>) -> Self {
        Self(Some(tx))
    }

    pub fn disabled() -> Self {
        Self(None)
    }

    pub fn emit(&self, event: ResearchEvent) {
        if let Some(tx) = &self.0 {
            let _ = tx.send(event);
        }
    }
}
