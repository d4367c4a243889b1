//! 研究编排器：顶层阶段状态机
//!
//! Clarifying → BriefWriting → Supervising → Synthesizing → Done；
//! 澄清阶段需要用户补充信息时直接挂起（Clarifying → Done，pending_question 置位），由 resume 恢复。
//! 每次阶段切换后写检查点。

use std::sync::Arc;

use schemars::JsonSchema;
use serde::Deserialize;

use crate::core::builder::ResearchContext;
use crate::core::checkpoint::CheckpointStore;
use crate::core::recovery::Invocation;
use crate::core::reducer::Update;
use crate::core::state::{FinalOutput, WorkflowPhase, WorkflowState};
use crate::core::ResearchError;
use crate::memory::{Message, Role};
use crate::research::events::ResearchEvent;
use crate::research::planner::Structured;
use crate::research::prompts::{
    brief_prompt, clarify_prompt, final_report_input, final_report_prompt, render_conversation,
};
use crate::research::supervisor::SupervisorLoop;

/// 澄清判断的结构化输出
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ClarifyWithUser {
    /// 是否需要向用户提问
    pub need_clarification: bool,
    /// 需要澄清时向用户提出的问题
    #[serde(default)]
    pub question: String,
    /// 不需要澄清时确认开始研究的说明
    #[serde(default)]
    pub verification: String,
}

/// 研究简报的结构化输出
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ResearchQuestion {
    /// 指导后续研究的详细研究问题
    pub research_brief: String,
}

/// 一次 run / resume 的结果
#[derive(Debug)]
pub enum RunOutcome {
    Completed {
        final_output: FinalOutput,
        state: WorkflowState,
    },
    /// 运行挂起，等待用户用 resume 回复 question
    NeedsClarification { question: String, state: WorkflowState },
}

impl RunOutcome {
    pub fn run_id(&self) -> &str {
        match self {
            RunOutcome::Completed { state, .. } | RunOutcome::NeedsClarification { state, .. } => &state.run_id,
        }
    }
}

/// 研究编排器
pub struct ResearchOrchestrator {
    ctx: Arc<ResearchContext>,
    store: Arc<dyn CheckpointStore>,
}

impl ResearchOrchestrator {
    pub fn new(ctx: Arc<ResearchContext>, store: Arc<dyn CheckpointStore>) -> Self {
        Self { ctx, store }
    }

    pub fn context(&self) -> &ResearchContext {
        &self.ctx
    }

    /// 以用户问题开始一次新的研究运行
    pub async fn run(&self, query: &str) -> Result<RunOutcome, ResearchError> {
        let run_id = uuid::Uuid::new_v4().to_string();
        tracing::info!(%run_id, "Research run started");
        let state = WorkflowState::new(run_id, query);
        self.drive(state).await
    }

    /// 用户回复澄清问题后继续挂起的运行
    pub async fn resume(&self, run_id: &str, reply: &str) -> Result<RunOutcome, ResearchError> {
        let mut state = self
            .store
            .load(run_id)
            .await?
            .ok_or_else(|| ResearchError::Checkpoint(format!("no checkpoint for run {run_id}")))?;
        if state.phase != WorkflowPhase::Done || state.pending_question.is_none() || state.final_output().is_some() {
            return Err(ResearchError::NotSuspended(run_id.to_string()));
        }
        tracing::info!(%run_id, "Resuming suspended run");
        state.messages.push(Message::user(reply))?;
        state.pending_question = None;
        state.phase = WorkflowPhase::Clarifying;
        self.drive(state).await
    }

    async fn drive(&self, mut state: WorkflowState) -> Result<RunOutcome, ResearchError> {
        loop {
            self.ctx.events.emit(ResearchEvent::PhaseChanged {
                run_id: state.run_id.clone(),
                phase: state.phase,
            });
            match state.phase {
                WorkflowPhase::Clarifying => {
                    if let Some(question) = self.clarify(&mut state).await? {
                        state.pending_question = Some(question.clone());
                        state.phase = WorkflowPhase::Done;
                        // resume 依赖这个检查点，保存失败必须上报
                        self.store.save(&state).await?;
                        tracing::info!(run_id = %state.run_id, "Run suspended for clarification");
                        self.ctx.events.emit(ResearchEvent::ClarificationRequested {
                            run_id: state.run_id.clone(),
                            question: question.clone(),
                        });
                        return Ok(RunOutcome::NeedsClarification { question, state });
                    }
                    state.phase = WorkflowPhase::BriefWriting;
                }
                WorkflowPhase::BriefWriting => {
                    let brief = self.write_brief(&state).await;
                    state.research_brief.apply(Update::Replace(brief.clone()))?;
                    self.ctx.events.emit(ResearchEvent::BriefWritten { brief });
                    state.phase = WorkflowPhase::Supervising;
                }
                WorkflowPhase::Supervising => {
                    let supervisor = SupervisorLoop::new(self.ctx.clone());
                    let result = supervisor.run(state.brief()).await?;
                    tracing::info!(
                        run_id = %state.run_id,
                        exit_reason = ?result.exit_reason,
                        research_iterations = result.research_iterations,
                        notes = result.notes.value().len(),
                        "Supervisor finished"
                    );
                    state.notes.apply(Update::Append(result.notes.into_value()))?;
                    state.raw_notes.apply(Update::Append(result.raw_notes.into_value()))?;
                    state.phase = WorkflowPhase::Synthesizing;
                }
                WorkflowPhase::Synthesizing => {
                    let output = self.synthesize(&state).await;
                    state.set_final_output(output.clone())?;
                    state.messages.push(Message::assistant(output.report.clone()))?;
                    self.ctx.events.emit(ResearchEvent::ReportReady {
                        degraded: output.degraded,
                    });
                    state.phase = WorkflowPhase::Done;
                }
                WorkflowPhase::Done => {
                    let final_output = state
                        .final_output()
                        .cloned()
                        .ok_or_else(|| ResearchError::Fatal("run finished without a final report".into()))?;
                    tracing::info!(run_id = %state.run_id, degraded = final_output.degraded, "Research run completed");
                    return Ok(RunOutcome::Completed { final_output, state });
                }
            }
            tracing::info!(run_id = %state.run_id, phase = ?state.phase, "Phase transition");
            self.checkpoint(&state).await;
        }
    }

    /// 检查点失败只记录日志，不中断运行
    async fn checkpoint(&self, state: &WorkflowState) {
        if let Err(e) = self.store.save(state).await {
            tracing::warn!(run_id = %state.run_id, error = %e, "Checkpoint save failed");
        }
    }

    /// 返回 Some(question) 表示需要挂起等待用户
    async fn clarify(&self, state: &mut WorkflowState) -> Result<Option<String>, ResearchError> {
        if !self.ctx.config.allow_clarification {
            return Ok(None);
        }
        let request = vec![
            Message::system(clarify_prompt()),
            Message::user(render_conversation(state.messages.value())),
        ];
        // 澄清只是可选的前置检查，任何失败都直接进入简报阶段
        let decision = match self
            .ctx
            .research_model
            .invoke_structured::<ClarifyWithUser>(&request)
            .await
        {
            Ok(Invocation::Complete(Structured::Parsed(decision))) => decision,
            Ok(Invocation::Complete(Structured::Unstructured(_))) | Ok(Invocation::Degraded { .. }) => {
                tracing::warn!("Clarification check unavailable, proceeding without it");
                return Ok(None);
            }
            Err(e) => {
                tracing::warn!(error = %e, "Clarification check failed, proceeding without it");
                return Ok(None);
            }
        };
        if decision.need_clarification && !decision.question.trim().is_empty() {
            state.messages.push(Message::assistant(decision.question.clone()))?;
            return Ok(Some(decision.question));
        }
        if !decision.verification.trim().is_empty() {
            state.messages.push(Message::assistant(decision.verification))?;
        }
        Ok(None)
    }

    /// 结构化简报；解析失败用原文，模型降级或失败时用用户消息拼接
    async fn write_brief(&self, state: &WorkflowState) -> String {
        let conversation = render_conversation(state.messages.value());
        let request = vec![Message::system(brief_prompt()), Message::user(conversation)];
        let brief = match self
            .ctx
            .research_model
            .invoke_structured::<ResearchQuestion>(&request)
            .await
        {
            Ok(Invocation::Complete(Structured::Parsed(q))) => q.research_brief,
            Ok(Invocation::Complete(Structured::Unstructured(raw))) => raw,
            Ok(Invocation::Degraded { reason }) => {
                tracing::warn!(%reason, "Brief model degraded, using user messages as brief");
                String::new()
            }
            Err(e) => {
                tracing::warn!(error = %e, "Brief model failed, using user messages as brief");
                String::new()
            }
        };
        if !brief.trim().is_empty() {
            return brief.trim().to_string();
        }
        state
            .messages
            .value()
            .iter()
            .filter(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// 生成终稿；任何失败都回退为由 notes 拼成的降级报告
    async fn synthesize(&self, state: &WorkflowState) -> FinalOutput {
        let notes = state.notes.value();
        let findings = notes.join("\n\n");
        let request = vec![
            Message::system(final_report_prompt()),
            Message::user(final_report_input(
                state.brief(),
                &render_conversation(state.messages.value()),
                &findings,
            )),
        ];
        let reason = match self.ctx.final_report_model.invoke_text(&request).await {
            Ok(Invocation::Complete(report)) if !report.trim().is_empty() => {
                return FinalOutput {
                    report,
                    degraded: false,
                }
            }
            Ok(Invocation::Complete(_)) => "final report model returned empty output".to_string(),
            Ok(Invocation::Degraded { reason }) => reason,
            Err(e) => e.to_string(),
        };
        tracing::warn!(%reason, "Final report failed, emitting degraded report from notes");
        FinalOutput {
            report: degraded_report(state.brief(), notes, state.raw_notes.value(), &reason),
            degraded: true,
        }
    }
}

/// 降级报告：简报 + 各条 notes 原文；没有压缩摘要时退回原始笔记
fn degraded_report(brief: &str, notes: &[String], raw_notes: &[String], reason: &str) -> String {
    let mut report = format!("# Research Findings (unsynthesized)\n\n> Final report generation failed: {reason}\n\n## Brief\n\n{brief}\n");
    let findings = if notes.is_empty() { raw_notes } else { notes };
    if findings.is_empty() {
        report.push_str("\nNo findings were collected.\n");
    }
    for (i, note) in findings.iter().enumerate() {
        report.push_str(&format!("\n## Finding {}\n\n{}\n", i + 1, note.trim()));
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_degraded_report_lists_every_note() {
        let report = degraded_report("brief", &["a".into(), "b".into()], &["raw evidence".into()], "boom");
        assert!(report.contains("boom"));
        assert!(report.contains("## Finding 1\n\na"));
        assert!(report.contains("## Finding 2\n\nb"));
        assert!(!report.contains("raw evidence"));
        assert!(degraded_report("brief", &[], &[], "x").contains("No findings"));
    }

    #[test]
    fn test_degraded_report_falls_back_to_raw_notes() {
        let report = degraded_report("brief", &[], &["search evidence".into()], "boom");
        assert!(report.contains("## Finding 1\n\nsearch evidence"));
        assert!(!report.contains("No findings"));
    }
}
