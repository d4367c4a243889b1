//! 运行状态：WorkflowState / SupervisorState / ResearchUnitState 及各状态机的阶段与退出原因
//!
//! WorkflowState 可序列化，用于检查点与挂起后恢复。

use serde::{Deserialize, Serialize};

use crate::core::reducer::{Channel, MergePolicy, ReducerError};
use crate::memory::{Message, MessageLog};

/// 顶层编排阶段
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowPhase {
    Clarifying,
    BriefWriting,
    Supervising,
    Synthesizing,
    Done,
}

/// 最终输出；degraded 表示恢复失败后的尽力结果
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FinalOutput {
    pub report: String,
    pub degraded: bool,
}

/// 顶层状态（单次运行）
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkflowState {
    pub run_id: String,
    pub phase: WorkflowPhase,
    pub messages: Channel<Vec<Message>>,
    pub research_brief: Channel<String>,
    pub notes: Channel<Vec<String>>,
    pub raw_notes: Channel<Vec<String>>,
    /// 澄清阶段挂起时向用户提出的问题
    pub pending_question: Option<String>,
    final_output: Option<FinalOutput>,
}

impl WorkflowState {
    pub fn new(run_id: impl Into<String>, query: impl Into<String>) -> Self {
        let messages = Channel::seeded("messages", MergePolicy::Append, vec![Message::user(query)]);
        Self {
            run_id: run_id.into(),
            phase: WorkflowPhase::Clarifying,
            messages,
            research_brief: Channel::replacing("research_brief"),
            notes: Channel::appending("notes"),
            raw_notes: Channel::appending("raw_notes"),
            pending_question: None,
            final_output: None,
        }
    }

    pub fn final_output(&self) -> Option<&FinalOutput> {
        self.final_output.as_ref()
    }

    /// final_output 每次运行只能写入一次
    pub fn set_final_output(&mut self, output: FinalOutput) -> Result<(), ReducerError> {
        if self.final_output.is_some() {
            return Err(ReducerError::AlreadyWritten {
                field: "final_output".to_string(),
            });
        }
        self.final_output = Some(output);
        Ok(())
    }

    pub fn brief(&self) -> &str {
        self.research_brief.value()
    }
}

/// 监督循环阶段
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorPhase {
    Planning,
    Dispatching,
    Merging,
    Terminated,
}

/// 监督循环退出原因（每次运行恰好记录一个）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorExit {
    IterationCeilingReached,
    ResearchComplete,
    NoActionableCalls,
    /// 规划调用不可恢复地失败（Unauthorized / Fatal / 容量降级）
    ModelFailure,
}

/// 监督循环状态：在简报完成时创建，循环结束时销毁
#[derive(Clone, Debug)]
pub struct SupervisorState {
    pub supervisor_messages: Channel<Vec<Message>>,
    pub research_iterations: usize,
    pub notes: Channel<Vec<String>>,
    pub raw_notes: Channel<Vec<String>>,
    pub exit_reason: Option<SupervisorExit>,
}

impl Default for SupervisorState {
    fn default() -> Self {
        Self {
            supervisor_messages: Channel::appending("supervisor_messages"),
            research_iterations: 0,
            notes: Channel::appending("notes"),
            raw_notes: Channel::appending("raw_notes"),
            exit_reason: None,
        }
    }
}

/// 研究单元阶段
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitPhase {
    Acting,
    ToolExecuting,
    Terminated,
}

/// 研究单元退出原因
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitExit {
    IterationCeilingReached,
    ResearchComplete,
    NoToolCalls,
    ModelFailure,
    /// 单元任务本身异常（panic 等），输出为降级结果
    UnitFailure,
}

/// 研究单元状态（每个委派主题一份）
#[derive(Clone, Debug, Default)]
pub struct ResearchUnitState {
    pub topic: String,
    pub unit_messages: MessageLog,
    pub tool_call_iterations: usize,
}

impl ResearchUnitState {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            ..Self::default()
        }
    }
}

/// 研究单元返回给上层的唯一产物
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ResearchUnitOutput {
    pub topic: String,
    pub compressed_summary: String,
    pub raw_notes: Vec<String>,
    pub tool_call_iterations: usize,
    pub exit_reason: UnitExit,
    pub degraded: bool,
}

impl ResearchUnitOutput {
    /// 单元异常时的降级输出
    pub fn failed(topic: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            compressed_summary: String::new(),
            raw_notes: vec![reason.into()],
            tool_call_iterations: 0,
            exit_reason: UnitExit::UnitFailure,
            degraded: true,
        }
    }
}
