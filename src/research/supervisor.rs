//! 监督循环：规划委派、并发派发研究单元、合并结果
//!
//! 状态机 Planning → Dispatching → Merging → {Planning | Terminated}。
//! 每轮 Planning 之前检查 research_iterations 是否已达上限；Planning 自增计数后调用模型。
//! 无工具调用、调用 ResearchComplete、达到迭代上限或模型不可恢复地失败时终止，且只记录一个退出原因。

use std::sync::Arc;

use crate::core::builder::ResearchContext;
use crate::core::dispatcher::{ConcurrencyDispatcher, DispatchReport};
use crate::core::recovery::Invocation;
use crate::core::reducer::Update;
use crate::core::state::{SupervisorExit, SupervisorPhase, SupervisorState};
use crate::core::ResearchError;
use crate::memory::{pending_tool_calls, Message, ToolCall};
use crate::research::events::ResearchEvent;
use crate::research::prompts::supervisor_prompt;
use crate::research::researcher::run_research_unit;
use crate::tools::{ConductResearchArgs, CONDUCT_RESEARCH, RESEARCH_COMPLETE};

/// 一轮规划产生的待处理工作
#[derive(Default)]
struct PendingPass {
    /// 本轮 assistant 消息中的全部调用（结果按此顺序追加）
    calls: Vec<ToolCall>,
    /// 非委派调用的结果（think_tool、未知工具、参数错误的委派）
    results: Vec<Message>,
    /// 合法委派：(调用, 主题)，顺序即派发顺序
    delegations: Vec<(ToolCall, String)>,
    report: Option<DispatchReport>,
}

/// 监督循环
pub struct SupervisorLoop {
    ctx: Arc<ResearchContext>,
    dispatcher: ConcurrencyDispatcher,
}

impl SupervisorLoop {
    pub fn new(ctx: Arc<ResearchContext>) -> Self {
        let dispatcher = ConcurrencyDispatcher::new(ctx.config.max_concurrent_research_units);
        Self { ctx, dispatcher }
    }

    /// 以研究简报为起点运行到终止，返回最终的监督状态（含 notes / raw_notes 与退出原因）
    pub async fn run(&self, brief: &str) -> Result<SupervisorState, ResearchError> {
        let config = &self.ctx.config;
        let max_iterations = config.max_research_iterations;
        let mut state = SupervisorState::default();
        state.supervisor_messages.apply(Update::Replace(vec![
            Message::system(supervisor_prompt(config.max_concurrent_research_units, max_iterations)),
            Message::user(brief),
        ]))?;

        let specs = self.ctx.supervisor_tools.specs();
        let mut phase = SupervisorPhase::Planning;
        let mut pass = PendingPass::default();
        let mut peak_active_units = 0;

        while phase != SupervisorPhase::Terminated {
            match phase {
                SupervisorPhase::Planning => {
                    debug_assert!(
                        pending_tool_calls(state.supervisor_messages.value()).is_empty(),
                        "every supervisor tool call needs a result before the next pass"
                    );
                    if state.research_iterations >= max_iterations {
                        state.exit_reason = Some(SupervisorExit::IterationCeilingReached);
                        phase = SupervisorPhase::Terminated;
                        continue;
                    }
                    state.research_iterations += 1;
                    self.ctx.events.emit(ResearchEvent::SupervisorPass {
                        iteration: state.research_iterations,
                        max_iterations,
                    });

                    let turn = match self
                        .ctx
                        .research_model
                        .invoke(state.supervisor_messages.value(), Some(&specs))
                        .await
                    {
                        Ok(Invocation::Complete(turn)) => turn,
                        Ok(Invocation::Degraded { reason }) => {
                            tracing::warn!(%reason, "Supervisor model degraded");
                            state.exit_reason = Some(SupervisorExit::ModelFailure);
                            phase = SupervisorPhase::Terminated;
                            continue;
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Supervisor model failed");
                            state.exit_reason = Some(SupervisorExit::ModelFailure);
                            phase = SupervisorPhase::Terminated;
                            continue;
                        }
                    };
                    state
                        .supervisor_messages
                        .push(Message::assistant_with_tool_calls(turn.content, turn.tool_calls.clone()))?;

                    if turn.tool_calls.is_empty() {
                        state.exit_reason = Some(SupervisorExit::NoActionableCalls);
                        phase = SupervisorPhase::Terminated;
                        continue;
                    }
                    if turn.tool_calls.iter().any(|c| c.name == RESEARCH_COMPLETE) {
                        // 同轮的其它调用不再执行，只补确认结果
                        for call in &turn.tool_calls {
                            let ack = if call.name == RESEARCH_COMPLETE {
                                "Research marked complete."
                            } else {
                                "Not executed: research was marked complete in the same turn."
                            };
                            state.supervisor_messages.push(Message::tool_result(call, ack, false))?;
                        }
                        state.exit_reason = Some(SupervisorExit::ResearchComplete);
                        phase = SupervisorPhase::Terminated;
                        continue;
                    }

                    pass = self.prepare_pass(turn.tool_calls).await;
                    phase = if pass.delegations.is_empty() {
                        // 仅反思的轮次：结果入栈后回到规划
                        self.append_results(&mut state, &mut pass)?;
                        SupervisorPhase::Planning
                    } else {
                        SupervisorPhase::Dispatching
                    };
                }
                SupervisorPhase::Dispatching => {
                    let topics: Vec<String> = pass.delegations.iter().map(|(_, topic)| topic.clone()).collect();
                    tracing::info!(count = topics.len(), iteration = state.research_iterations, "Dispatching research units");
                    self.ctx.events.emit(ResearchEvent::Delegated { topics: topics.clone() });

                    let ctx = self.ctx.clone();
                    let report = self
                        .dispatcher
                        .dispatch(topics, move |_, topic| {
                            let ctx = ctx.clone();
                            async move { run_research_unit(&ctx, topic).await }
                        })
                        .await;
                    peak_active_units = peak_active_units.max(report.peak_active);
                    pass.report = Some(report);
                    phase = SupervisorPhase::Merging;
                }
                SupervisorPhase::Merging => {
                    self.merge(&mut state, &mut pass)?;
                    phase = SupervisorPhase::Planning;
                }
                SupervisorPhase::Terminated => {}
            }
        }

        let exit_reason = state.exit_reason.unwrap_or(SupervisorExit::ModelFailure);
        state.exit_reason = Some(exit_reason);
        tracing::info!(
            exit_reason = ?exit_reason,
            research_iterations = state.research_iterations,
            notes = state.notes.value().len(),
            "Supervisor loop terminated"
        );
        self.ctx.events.emit(ResearchEvent::SupervisorFinished {
            exit_reason,
            research_iterations: state.research_iterations,
            peak_active_units,
        });
        Ok(state)
    }

    /// 拆分本轮调用：委派校验参数后排队，其余调用立即执行
    async fn prepare_pass(&self, calls: Vec<ToolCall>) -> PendingPass {
        let mut results = Vec::new();
        let mut delegations = Vec::new();
        let mut others = Vec::new();
        for call in &calls {
            if call.name == CONDUCT_RESEARCH {
                match ConductResearchArgs::parse(&call.args) {
                    Ok(args) => delegations.push((call.clone(), args.research_topic)),
                    Err(e) => results.push(Message::tool_result(call, format!("Error: {e}"), true)),
                }
            } else {
                others.push(call.clone());
            }
        }
        results.extend(self.ctx.supervisor_tools.execute_all(&others).await);
        PendingPass {
            calls,
            results,
            delegations,
            report: None,
        }
    }

    /// 把本轮全部结果按调用顺序追加到监督消息
    fn append_results(&self, state: &mut SupervisorState, pass: &mut PendingPass) -> Result<(), ResearchError> {
        let mut results = std::mem::take(&mut pass.results);
        for call in &pass.calls {
            if let Some(pos) = results.iter().position(|m| m.tool_call_id.as_deref() == Some(call.id.as_str())) {
                state.supervisor_messages.push(results.remove(pos))?;
            }
        }
        *pass = PendingPass::default();
        Ok(())
    }

    /// 合并派发结果：每个委派一条结果；摘要并入 notes，原始笔记并入 raw_notes（按派发顺序）
    fn merge(&self, state: &mut SupervisorState, pass: &mut PendingPass) -> Result<(), ResearchError> {
        let outputs = pass.report.take().map(|r| r.outputs).unwrap_or_default();
        let mut note_updates = Vec::new();
        let mut raw_updates = Vec::new();

        for (index, ((call, _), output)) in pass.delegations.iter().zip(outputs).enumerate() {
            self.ctx.events.emit(ResearchEvent::UnitFinished {
                index,
                topic: output.topic.clone(),
                exit_reason: output.exit_reason,
                tool_call_iterations: output.tool_call_iterations,
                degraded: output.degraded,
            });
            let content = if output.compressed_summary.trim().is_empty() {
                format!(
                    "Research on '{}' did not produce a summary ({:?}); raw notes were kept.",
                    output.topic, output.exit_reason
                )
            } else {
                output.compressed_summary.clone()
            };
            pass.results
                .push(Message::tool_result(call, content, output.compressed_summary.trim().is_empty()));
            if !output.compressed_summary.trim().is_empty() {
                note_updates.push((index, Update::Append(vec![output.compressed_summary])));
            }
            if !output.raw_notes.is_empty() {
                raw_updates.push((index, Update::Append(output.raw_notes)));
            }
        }

        state.notes.apply_ordered(note_updates)?;
        state.raw_notes.apply_ordered(raw_updates)?;
        self.append_results(state, pass)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::core::builder::ResearchBuilder;
    use crate::llm::{LlmClient, ScriptedLlmClient};
    use crate::memory::Role;
    use crate::research::prompts::PromptKind;
    use serde_json::json;

    async fn context(config: AppConfig, llm: Arc<dyn LlmClient>) -> Arc<ResearchContext> {
        Arc::new(ResearchBuilder::new(config).with_llm(llm).build_context().await)
    }

    fn config(max_iterations: usize) -> AppConfig {
        let mut cfg = AppConfig::default();
        cfg.research.max_research_iterations = max_iterations;
        cfg.tools.search.provider = "none".into();
        cfg.recovery.base_backoff_ms = 1;
        cfg
    }

    /// 监督者每轮委派一个主题，研究单元立即完成
    fn delegating_llm() -> ScriptedLlmClient {
        ScriptedLlmClient::new(|_, messages| {
            Ok(match PromptKind::detect(messages) {
                Some(PromptKind::Supervisor) => {
                    json!({"tool": "ConductResearch", "args": {"research_topic": "topic"}}).to_string()
                }
                Some(PromptKind::Researcher) => json!({"tool": "ResearchComplete", "args": {}}).to_string(),
                Some(PromptKind::Compress) => "compressed".to_string(),
                _ => "other".to_string(),
            })
        })
    }

    #[tokio::test]
    async fn test_iteration_ceiling_of_one_allows_one_dispatch() {
        let ctx = context(config(1), Arc::new(delegating_llm())).await;
        let state = SupervisorLoop::new(ctx).run("brief").await.unwrap();
        assert_eq!(state.exit_reason, Some(SupervisorExit::IterationCeilingReached));
        assert_eq!(state.research_iterations, 1);
        assert_eq!(state.notes.value(), &vec!["compressed".to_string()]);
    }

    #[tokio::test]
    async fn test_every_call_gets_exactly_one_result() {
        let llm = ScriptedLlmClient::new(|_, messages| {
            Ok(match PromptKind::detect(messages) {
                Some(PromptKind::Supervisor) => json!({"tool_calls": [
                    {"tool": "think_tool", "args": {"reflection": "plan"}},
                    {"tool": "ConductResearch", "args": {"research_topic": "A"}},
                    {"tool": "ConductResearch", "args": {"wrong": "B"}},
                    {"tool": "ConductResearch", "args": {"research_topic": "C"}}
                ]})
                .to_string(),
                Some(PromptKind::Researcher) => json!({"tool": "ResearchComplete", "args": {}}).to_string(),
                Some(PromptKind::Compress) => {
                    let topic = messages.iter().find(|m| m.role == Role::User).map(|m| m.content.clone());
                    format!("summary of {}", topic.unwrap_or_default())
                }
                _ => String::new(),
            })
        });
        let ctx = context(config(1), Arc::new(llm)).await;
        let state = SupervisorLoop::new(ctx).run("brief").await.unwrap();

        let messages = state.supervisor_messages.value();
        let assistant = messages.iter().rfind(|m| m.role == Role::Assistant).unwrap();
        let results: Vec<&Message> = messages.iter().filter(|m| m.role == Role::Tool).collect();
        assert_eq!(results.len(), assistant.tool_calls.len());
        for (call, result) in assistant.tool_calls.iter().zip(&results) {
            assert_eq!(result.tool_call_id.as_deref(), Some(call.id.as_str()));
        }
        assert!(results[2].is_error);
        assert_eq!(
            state.notes.value(),
            &vec!["summary of A".to_string(), "summary of C".to_string()]
        );
    }

    #[tokio::test]
    async fn test_research_complete_terminates() {
        let llm = ScriptedLlmClient::new(|_, messages| {
            Ok(match PromptKind::detect(messages) {
                Some(PromptKind::Supervisor) => json!({"tool": "ResearchComplete", "args": {}}).to_string(),
                _ => String::new(),
            })
        });
        let ctx = context(config(6), Arc::new(llm)).await;
        let state = SupervisorLoop::new(ctx).run("brief").await.unwrap();
        assert_eq!(state.exit_reason, Some(SupervisorExit::ResearchComplete));
        assert_eq!(state.research_iterations, 1);
        assert!(state.notes.value().is_empty());
    }

    #[tokio::test]
    async fn test_no_tool_calls_terminates() {
        let llm = ScriptedLlmClient::new(|_, _| Ok("I am done.".to_string()));
        let ctx = context(config(6), Arc::new(llm)).await;
        let state = SupervisorLoop::new(ctx).run("brief").await.unwrap();
        assert_eq!(state.exit_reason, Some(SupervisorExit::NoActionableCalls));
    }

    #[tokio::test]
    async fn test_think_only_passes_are_bounded_by_ceiling() {
        let llm = ScriptedLlmClient::new(|_, _| {
            Ok(json!({"tool": "think_tool", "args": {"reflection": "hmm"}}).to_string())
        });
        let ctx = context(config(3), Arc::new(llm)).await;
        let state = SupervisorLoop::new(ctx).run("brief").await.unwrap();
        assert_eq!(state.exit_reason, Some(SupervisorExit::IterationCeilingReached));
        assert_eq!(state.research_iterations, 3);
    }

    #[tokio::test]
    async fn test_model_failure_terminates_loop_only() {
        let llm = ScriptedLlmClient::new(|_, _| Err(crate::llm::LlmError::Unauthorized("401".into())));
        let ctx = context(config(6), Arc::new(llm)).await;
        let state = SupervisorLoop::new(ctx).run("brief").await.unwrap();
        assert_eq!(state.exit_reason, Some(SupervisorExit::ModelFailure));
    }
}
