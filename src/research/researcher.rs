//! 研究单元：针对单一主题的工具循环 + 结果压缩
//!
//! 状态机 Acting → ToolExecuting → {Acting | Terminated}。
//! 终止条件：迭代计数达到上限（进入工具执行前后各检查一次）、调用了 ResearchComplete、
//! 模型不再发起工具调用、或模型调用不可恢复地失败。
//! 终止后用压缩模型整理发现；压缩失败时输出空摘要并标记 degraded，原始笔记照常保留。
//! 单元执行在类型上不会失败：总是返回一个 ResearchUnitOutput。

use crate::config::IterationCounting;
use crate::core::builder::ResearchContext;
use crate::core::recovery::Invocation;
use crate::core::state::{ResearchUnitOutput, ResearchUnitState, UnitExit, UnitPhase};
use crate::memory::{Message, Role, ToolCall};
use crate::research::prompts::{compress_instruction, compress_prompt, researcher_prompt};
use crate::tools::RESEARCH_COMPLETE;

/// 本次进入工具执行时计入的迭代数与实际执行的调用
fn plan_pass(
    counting: IterationCounting,
    iterations: usize,
    max_iterations: usize,
    calls: &[ToolCall],
) -> (usize, usize) {
    match counting {
        IterationCounting::PerPass => (1, calls.len()),
        IterationCounting::PerToolCall => {
            let executable = calls.len().min(max_iterations.saturating_sub(iterations));
            (executable, executable)
        }
    }
}

/// 未压缩的原始笔记：工具结果与 assistant 内容按出现顺序拼接
fn collect_raw_notes(messages: &[Message]) -> Vec<String> {
    let joined = messages
        .iter()
        .filter(|m| matches!(m.role, Role::Tool | Role::Assistant))
        .map(|m| m.content.trim())
        .filter(|c| !c.is_empty())
        .collect::<Vec<_>>()
        .join("\n");
    if joined.is_empty() {
        Vec::new()
    } else {
        vec![joined]
    }
}

/// 为未执行的调用补一条错误结果，保证每个 ToolCall 都有结果
fn skipped_result(call: &ToolCall) -> Message {
    Message::tool_result(
        call,
        "Error: tool call budget exhausted, call was not executed",
        true,
    )
}

/// 运行一个研究单元直到终止，并返回压缩后的输出
pub async fn run_research_unit(ctx: &ResearchContext, topic: String) -> ResearchUnitOutput {
    let config = &ctx.config;
    let max_iterations = config.max_tool_call_iterations;
    let system = Message::system(researcher_prompt(&ctx.external_tool_hint));
    let specs = ctx.researcher_tools.specs();

    let mut state = ResearchUnitState::new(topic.clone());
    state.unit_messages.push(Message::user(topic.clone()));
    let mut phase = UnitPhase::Acting;
    let mut pending: Vec<ToolCall> = Vec::new();

    let mut exit_reason = None;
    while phase != UnitPhase::Terminated {
        match phase {
            UnitPhase::Acting => {
                debug_assert!(
                    state.unit_messages.pending_tool_calls().is_empty(),
                    "every tool call needs a result before the next model turn"
                );
                let mut request = vec![system.clone()];
                request.extend_from_slice(state.unit_messages.messages());
                let turn = match ctx.research_model.invoke(&request, Some(&specs)).await {
                    Ok(Invocation::Complete(turn)) => turn,
                    Ok(Invocation::Degraded { reason }) => {
                        tracing::warn!(%reason, "Research model degraded, terminating unit");
                        exit_reason = Some(UnitExit::ModelFailure);
                        phase = UnitPhase::Terminated;
                        continue;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Research model failed, terminating unit");
                        exit_reason = Some(UnitExit::ModelFailure);
                        phase = UnitPhase::Terminated;
                        continue;
                    }
                };
                state
                    .unit_messages
                    .push(Message::assistant_with_tool_calls(turn.content, turn.tool_calls.clone()));
                if turn.tool_calls.is_empty() {
                    exit_reason = Some(UnitExit::NoToolCalls);
                    phase = UnitPhase::Terminated;
                } else if state.tool_call_iterations >= max_iterations {
                    state.unit_messages.extend(turn.tool_calls.iter().map(skipped_result));
                    exit_reason = Some(UnitExit::IterationCeilingReached);
                    phase = UnitPhase::Terminated;
                } else {
                    pending = turn.tool_calls;
                    phase = UnitPhase::ToolExecuting;
                }
            }
            UnitPhase::ToolExecuting => {
                let calls = std::mem::take(&mut pending);
                let (increment, executable) =
                    plan_pass(config.iteration_counting, state.tool_call_iterations, max_iterations, &calls);
                state.tool_call_iterations += increment;
                tracing::debug!(
                    calls = calls.len(),
                    executed = executable,
                    iterations = state.tool_call_iterations,
                    "Executing tool calls"
                );

                let (run, skipped) = calls.split_at(executable);
                let results = ctx.researcher_tools.execute_all(run).await;
                state.unit_messages.extend(results);
                state.unit_messages.extend(skipped.iter().map(skipped_result));

                if run.iter().any(|c| c.name == RESEARCH_COMPLETE) {
                    exit_reason = Some(UnitExit::ResearchComplete);
                    phase = UnitPhase::Terminated;
                } else if state.tool_call_iterations >= max_iterations {
                    exit_reason = Some(UnitExit::IterationCeilingReached);
                    phase = UnitPhase::Terminated;
                } else {
                    phase = UnitPhase::Acting;
                }
            }
            UnitPhase::Terminated => {}
        }
    }
    let exit_reason = exit_reason.unwrap_or(UnitExit::ModelFailure);
    tracing::info!(
        exit_reason = ?exit_reason,
        tool_call_iterations = state.tool_call_iterations,
        "Research unit terminated"
    );

    let raw_notes = collect_raw_notes(state.unit_messages.messages());
    let (compressed_summary, degraded) = compress(ctx, state.unit_messages.messages()).await;

    ResearchUnitOutput {
        topic,
        compressed_summary,
        raw_notes,
        tool_call_iterations: state.tool_call_iterations,
        exit_reason,
        degraded,
    }
}

/// 用压缩模型整理单元的全部发现；失败时返回 ("", true)
async fn compress(ctx: &ResearchContext, unit_messages: &[Message]) -> (String, bool) {
    let mut request = vec![Message::system(compress_prompt())];
    request.extend_from_slice(unit_messages);
    request.push(Message::user(compress_instruction()));
    match ctx.compression_model.invoke_text(&request).await {
        Ok(Invocation::Complete(summary)) => (summary, false),
        Ok(Invocation::Degraded { reason }) => {
            tracing::warn!(%reason, "Compression degraded, keeping raw notes only");
            (String::new(), true)
        }
        Err(e) => {
            tracing::warn!(error = %e, "Compression failed, keeping raw notes only");
            (String::new(), true)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn calls(n: usize) -> Vec<ToolCall> {
        (0..n).map(|_| ToolCall::new("web_search", json!({}))).collect()
    }

    #[test]
    fn test_per_pass_counts_one_per_transition() {
        assert_eq!(plan_pass(IterationCounting::PerPass, 0, 10, &calls(4)), (1, 4));
    }

    #[test]
    fn test_per_tool_call_caps_at_remaining_budget() {
        assert_eq!(plan_pass(IterationCounting::PerToolCall, 0, 10, &calls(4)), (4, 4));
        assert_eq!(plan_pass(IterationCounting::PerToolCall, 8, 10, &calls(4)), (2, 2));
        assert_eq!(plan_pass(IterationCounting::PerToolCall, 10, 10, &calls(1)), (0, 0));
    }

    #[test]
    fn test_raw_notes_keep_tool_and_assistant_content() {
        let call = ToolCall::new("web_search", json!({}));
        let messages = vec![
            Message::user("topic"),
            Message::assistant_with_tool_calls("searching", vec![call.clone()]),
            Message::tool_result(&call, "result body", false),
        ];
        assert_eq!(collect_raw_notes(&messages), vec!["searching\nresult body".to_string()]);
        assert!(collect_raw_notes(&[Message::user("x")]).is_empty());
    }
}
