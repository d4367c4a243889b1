//! 研究流程集成测试：用 ScriptedLlmClient 驱动完整的编排器

use std::sync::{Arc, Mutex};
use std::time::Duration;

use hive::config::{AppConfig, IterationCounting};
use hive::core::{
    CheckpointStore, InMemoryCheckpointStore, ResearchError, SupervisorExit, UnitExit, WorkflowPhase,
};
use hive::llm::{LlmError, ScriptedLlmClient};
use hive::memory::{Message, Role};
use hive::research::prompts::PromptKind;
use hive::research::ResearchEvent;
use hive::{ResearchBuilder, ResearchOrchestrator, RunOutcome};
use serde_json::json;
use tokio::sync::mpsc::UnboundedReceiver;

fn config() -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.tools.search.provider = "none".into();
    cfg.recovery.base_backoff_ms = 1;
    cfg
}

fn first_user(messages: &[Message]) -> String {
    messages
        .iter()
        .find(|m| m.role == Role::User)
        .map(|m| m.content.clone())
        .unwrap_or_default()
}

fn last_user(messages: &[Message]) -> String {
    messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .map(|m| m.content.clone())
        .unwrap_or_default()
}

fn has_tool_results(messages: &[Message]) -> bool {
    messages.iter().any(|m| m.role == Role::Tool)
}

/// 各阶段的默认脚本：不澄清、委派 A 与 B、单元先 think 再完成、终稿回显输入
fn default_reply(messages: &[Message]) -> Result<String, LlmError> {
    Ok(match PromptKind::detect(messages) {
        Some(PromptKind::Clarify) => json!({
            "need_clarification": false,
            "question": "",
            "verification": "Starting research."
        })
        .to_string(),
        Some(PromptKind::Brief) => json!({"research_brief": "Compare A and B."}).to_string(),
        Some(PromptKind::Supervisor) if has_tool_results(messages) => {
            json!({"tool": "ResearchComplete", "args": {}}).to_string()
        }
        Some(PromptKind::Supervisor) => json!({"tool_calls": [
            {"tool": "ConductResearch", "args": {"research_topic": "A"}},
            {"tool": "ConductResearch", "args": {"research_topic": "B"}}
        ]})
        .to_string(),
        Some(PromptKind::Researcher) if has_tool_results(messages) => {
            json!({"tool": "ResearchComplete", "args": {}}).to_string()
        }
        Some(PromptKind::Researcher) => {
            json!({"tool": "think_tool", "args": {"reflection": "need one more look"}}).to_string()
        }
        Some(PromptKind::Compress) => format!("summary of {}", first_user(messages)),
        Some(PromptKind::FinalReport) => format!("REPORT\n{}", last_user(messages)),
        _ => String::new(),
    })
}

async fn build_orchestrator(
    cfg: AppConfig,
    llm: ScriptedLlmClient,
    store: Arc<InMemoryCheckpointStore>,
) -> (ResearchOrchestrator, UnboundedReceiver<ResearchEvent>) {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    let orchestrator = ResearchBuilder::new(cfg)
        .with_llm(Arc::new(llm))
        .with_checkpoint_store(store)
        .with_events(tx)
        .build()
        .await;
    (orchestrator, rx)
}

fn drain(rx: &mut UnboundedReceiver<ResearchEvent>) -> Vec<ResearchEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn unit_results(events: &[ResearchEvent]) -> Vec<(String, UnitExit, usize)> {
    events
        .iter()
        .filter_map(|e| match e {
            ResearchEvent::UnitFinished {
                topic,
                exit_reason,
                tool_call_iterations,
                ..
            } => Some((topic.clone(), *exit_reason, *tool_call_iterations)),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_end_to_end_run_produces_report_and_checkpoint() {
    let store = Arc::new(InMemoryCheckpointStore::new());
    let (orchestrator, mut rx) =
        build_orchestrator(config(), ScriptedLlmClient::new(|_, m| default_reply(m)), store.clone()).await;

    let outcome = orchestrator.run("Compare A and B").await.unwrap();
    let RunOutcome::Completed { final_output, state } = outcome else {
        panic!("expected a completed run");
    };

    assert!(!final_output.degraded);
    assert!(final_output.report.starts_with("REPORT"));
    assert!(final_output.report.contains("summary of A"));
    assert_eq!(
        state.notes.value(),
        &vec!["summary of A".to_string(), "summary of B".to_string()]
    );
    assert_eq!(state.brief(), "Compare A and B.");
    assert_eq!(state.phase, WorkflowPhase::Done);

    let saved = store.load(&state.run_id).await.unwrap().unwrap();
    assert_eq!(saved.phase, WorkflowPhase::Done);
    assert_eq!(saved.final_output(), Some(&final_output));

    let events = drain(&mut rx);
    assert!(matches!(
        events.first(),
        Some(ResearchEvent::PhaseChanged {
            phase: WorkflowPhase::Clarifying,
            ..
        })
    ));
    assert!(events.contains(&ResearchEvent::Delegated {
        topics: vec!["A".into(), "B".into()]
    }));
    let units = unit_results(&events);
    assert_eq!(units.len(), 2);
    assert!(units.iter().all(|(_, exit, iterations)| *exit == UnitExit::ResearchComplete && *iterations == 2));
    assert!(events.iter().any(|e| matches!(
        e,
        ResearchEvent::SupervisorFinished {
            exit_reason: SupervisorExit::ResearchComplete,
            research_iterations: 2,
            ..
        }
    )));
    assert!(events.contains(&ResearchEvent::ReportReady { degraded: false }));
}

#[tokio::test]
async fn test_research_iteration_ceiling_of_one() {
    let mut cfg = config();
    cfg.research.max_research_iterations = 1;
    cfg.research.allow_clarification = false;
    let store = Arc::new(InMemoryCheckpointStore::new());
    let (orchestrator, mut rx) =
        build_orchestrator(cfg, ScriptedLlmClient::new(|_, m| default_reply(m)), store).await;

    let outcome = orchestrator.run("Compare A and B").await.unwrap();
    assert!(matches!(outcome, RunOutcome::Completed { .. }));

    let events = drain(&mut rx);
    let delegations = events
        .iter()
        .filter(|e| matches!(e, ResearchEvent::Delegated { .. }))
        .count();
    assert_eq!(delegations, 1);
    assert!(events.iter().any(|e| matches!(
        e,
        ResearchEvent::SupervisorFinished {
            exit_reason: SupervisorExit::IterationCeilingReached,
            research_iterations: 1,
            ..
        }
    )));
}

#[tokio::test]
async fn test_clarification_suspends_and_resumes() {
    let llm = ScriptedLlmClient::new(|_, messages| match PromptKind::detect(messages) {
        Some(PromptKind::Clarify) if !last_user(messages).contains("EU only") => Ok(json!({
            "need_clarification": true,
            "question": "Which market do you mean?",
            "verification": ""
        })
        .to_string()),
        _ => default_reply(messages),
    });
    let store = Arc::new(InMemoryCheckpointStore::new());
    let (orchestrator, mut rx) = build_orchestrator(config(), llm, store.clone()).await;

    let outcome = orchestrator.run("Compare A and B").await.unwrap();
    let RunOutcome::NeedsClarification { question, state } = outcome else {
        panic!("expected a suspended run");
    };
    assert_eq!(question, "Which market do you mean?");
    assert_eq!(state.pending_question.as_deref(), Some("Which market do you mean?"));
    assert!(state.final_output().is_none());
    assert!(drain(&mut rx)
        .iter()
        .any(|e| matches!(e, ResearchEvent::ClarificationRequested { .. })));

    let resumed = orchestrator.resume(&state.run_id, "EU only").await.unwrap();
    let RunOutcome::Completed { state: done, .. } = resumed else {
        panic!("expected the resumed run to complete");
    };
    assert!(done.pending_question.is_none());
    let users: Vec<&str> = done
        .messages
        .value()
        .iter()
        .filter(|m| m.role == Role::User)
        .map(|m| m.content.as_str())
        .collect();
    assert_eq!(users, vec!["Compare A and B", "EU only"]);

    let again = orchestrator.resume(&state.run_id, "more").await;
    assert!(matches!(again, Err(ResearchError::NotSuspended(_))));
    let missing = orchestrator.resume("no-such-run", "hi").await;
    assert!(matches!(missing, Err(ResearchError::Checkpoint(_))));
}

#[tokio::test]
async fn test_final_report_failure_yields_degraded_output() {
    let llm = ScriptedLlmClient::new(|_, messages| match PromptKind::detect(messages) {
        Some(PromptKind::FinalReport) => Err(LlmError::Unauthorized("key revoked".into())),
        _ => default_reply(messages),
    });
    let store = Arc::new(InMemoryCheckpointStore::new());
    let (orchestrator, _rx) = build_orchestrator(config(), llm, store).await;

    let RunOutcome::Completed { final_output, .. } = orchestrator.run("Compare A and B").await.unwrap() else {
        panic!("expected a completed run");
    };
    assert!(final_output.degraded);
    assert!(final_output.report.contains("summary of A"));
    assert!(final_output.report.contains("summary of B"));
}

#[tokio::test]
async fn test_clarify_model_error_proceeds_to_research() {
    let llm = ScriptedLlmClient::new(|_, messages| match PromptKind::detect(messages) {
        Some(PromptKind::Clarify) => Err(LlmError::Provider("internal server error".into())),
        _ => default_reply(messages),
    });
    let (orchestrator, _rx) = build_orchestrator(config(), llm, Arc::new(InMemoryCheckpointStore::new())).await;

    let outcome = orchestrator.run("Compare A and B").await.unwrap();
    let RunOutcome::Completed { final_output, state } = outcome else {
        panic!("expected a completed run");
    };
    assert!(!final_output.degraded);
    assert!(state.pending_question.is_none());
    assert_eq!(state.brief(), "Compare A and B.");
}

#[tokio::test]
async fn test_brief_model_error_uses_user_query_as_brief() {
    let llm = ScriptedLlmClient::new(|_, messages| match PromptKind::detect(messages) {
        Some(PromptKind::Brief) => Err(LlmError::Provider("internal server error".into())),
        _ => default_reply(messages),
    });
    let (orchestrator, mut rx) =
        build_orchestrator(config(), llm, Arc::new(InMemoryCheckpointStore::new())).await;

    let outcome = orchestrator.run("Compare A and B").await.unwrap();
    let RunOutcome::Completed { final_output, state } = outcome else {
        panic!("expected a completed run");
    };
    assert!(!final_output.degraded);
    assert_eq!(state.brief(), "Compare A and B");
    assert!(drain(&mut rx).contains(&ResearchEvent::BriefWritten {
        brief: "Compare A and B".into()
    }));
}

#[tokio::test]
async fn test_compression_failure_in_one_unit_keeps_raw_notes() {
    let seen = Arc::new(Mutex::new(Vec::<Message>::new()));
    let captured = seen.clone();
    let llm = ScriptedLlmClient::new(move |_, messages| match PromptKind::detect(messages) {
        Some(PromptKind::Compress) if first_user(messages) == "A" => {
            Err(LlmError::Unauthorized("compression key revoked".into()))
        }
        Some(PromptKind::Supervisor) if has_tool_results(messages) => {
            *captured.lock().unwrap() = messages.to_vec();
            default_reply(messages)
        }
        _ => default_reply(messages),
    });
    let (orchestrator, mut rx) =
        build_orchestrator(config(), llm, Arc::new(InMemoryCheckpointStore::new())).await;

    let RunOutcome::Completed { final_output, state } = orchestrator.run("Compare A and B").await.unwrap() else {
        panic!("expected a completed run");
    };
    assert!(!final_output.degraded);
    assert_eq!(state.notes.value(), &vec!["summary of B".to_string()]);
    let raw = state.raw_notes.value();
    assert_eq!(raw.len(), 2);
    assert!(raw[0].contains("need one more look"));

    let results: Vec<Message> = seen
        .lock()
        .unwrap()
        .iter()
        .filter(|m| m.role == Role::Tool)
        .cloned()
        .collect();
    assert_eq!(results.len(), 2);
    assert!(results[0].is_error);
    assert!(results[0].content.contains("did not produce a summary"));
    assert!(!results[1].is_error);
    assert_eq!(results[1].content, "summary of B");

    let events = drain(&mut rx);
    let degraded: Vec<(String, bool)> = events
        .iter()
        .filter_map(|e| match e {
            ResearchEvent::UnitFinished { topic, degraded, .. } => Some((topic.clone(), *degraded)),
            _ => None,
        })
        .collect();
    assert_eq!(degraded, vec![("A".to_string(), true), ("B".to_string(), false)]);
}

#[tokio::test]
async fn test_research_model_failure_in_one_unit_spares_sibling() {
    let llm = ScriptedLlmClient::new(|_, messages| match PromptKind::detect(messages) {
        Some(PromptKind::Researcher) if first_user(messages) == "A" => {
            Err(LlmError::Unauthorized("research key revoked".into()))
        }
        _ => default_reply(messages),
    });
    let (orchestrator, mut rx) =
        build_orchestrator(config(), llm, Arc::new(InMemoryCheckpointStore::new())).await;

    let RunOutcome::Completed { final_output, state } = orchestrator.run("Compare A and B").await.unwrap() else {
        panic!("expected a completed run");
    };
    assert!(!final_output.degraded);
    assert!(state.notes.value().contains(&"summary of B".to_string()));

    let units = unit_results(&drain(&mut rx));
    assert_eq!(
        units,
        vec![
            ("A".to_string(), UnitExit::ModelFailure, 0),
            ("B".to_string(), UnitExit::ResearchComplete, 2),
        ]
    );
}

#[tokio::test]
async fn test_immediate_research_complete_counts_one_iteration() {
    for counting in [IterationCounting::PerPass, IterationCounting::PerToolCall] {
        let mut cfg = config();
        cfg.research.iteration_counting = counting;
        let store = Arc::new(InMemoryCheckpointStore::new());
        let llm = ScriptedLlmClient::new(|_, messages| match PromptKind::detect(messages) {
            Some(PromptKind::Researcher) => Ok(json!({"tool": "ResearchComplete", "args": {}}).to_string()),
            _ => default_reply(messages),
        });
        let (orchestrator, mut rx) = build_orchestrator(cfg, llm, store).await;
        orchestrator.run("Compare A and B").await.unwrap();
        let units = unit_results(&drain(&mut rx));
        assert_eq!(units.len(), 2);
        for (_, exit, iterations) in units {
            assert_eq!(exit, UnitExit::ResearchComplete);
            assert_eq!(iterations, 1);
        }
    }
}

/// 研究单元每轮发起两个 think_tool，直到触顶
fn double_think_reply(messages: &[Message]) -> Result<String, LlmError> {
    match PromptKind::detect(messages) {
        Some(PromptKind::Researcher) => Ok(json!({"tool_calls": [
            {"tool": "think_tool", "args": {"reflection": "one"}},
            {"tool": "think_tool", "args": {"reflection": "two"}}
        ]})
        .to_string()),
        _ => default_reply(messages),
    }
}

#[tokio::test]
async fn test_tool_call_ceiling_boundaries() {
    // 按轮计数：3 轮触顶
    let mut cfg = config();
    cfg.research.max_tool_call_iterations = 3;
    let (orchestrator, mut rx) = build_orchestrator(
        cfg,
        ScriptedLlmClient::new(|_, m| double_think_reply(m)),
        Arc::new(InMemoryCheckpointStore::new()),
    )
    .await;
    orchestrator.run("Compare A and B").await.unwrap();
    for (_, exit, iterations) in unit_results(&drain(&mut rx)) {
        assert_eq!(exit, UnitExit::IterationCeilingReached);
        assert_eq!(iterations, 3);
    }

    // 按调用计数：2 + 1 = 3，第二轮只执行一个调用
    let mut cfg = config();
    cfg.research.max_tool_call_iterations = 3;
    cfg.research.iteration_counting = IterationCounting::PerToolCall;
    let (orchestrator, mut rx) = build_orchestrator(
        cfg,
        ScriptedLlmClient::new(|_, m| double_think_reply(m)),
        Arc::new(InMemoryCheckpointStore::new()),
    )
    .await;
    orchestrator.run("Compare A and B").await.unwrap();
    let units = unit_results(&drain(&mut rx));
    assert_eq!(units.len(), 2);
    for (_, exit, iterations) in units {
        assert_eq!(exit, UnitExit::IterationCeilingReached);
        assert_eq!(iterations, 3);
    }
}

#[tokio::test]
async fn test_concurrency_is_bounded_and_merge_follows_dispatch_order() {
    let topics = ["t0", "t1", "t2", "t3", "t4"];
    let llm = ScriptedLlmClient::new(move |_, messages| match PromptKind::detect(messages) {
        Some(PromptKind::Supervisor) if !has_tool_results(messages) => {
            let calls: Vec<_> = topics
                .iter()
                .map(|t| json!({"tool": "ConductResearch", "args": {"research_topic": t}}))
                .collect();
            Ok(json!({ "tool_calls": calls }).to_string())
        }
        Some(PromptKind::Researcher) => Ok(json!({"tool": "ResearchComplete", "args": {}}).to_string()),
        _ => default_reply(messages),
    })
    .with_delay(|messages| match PromptKind::detect(messages) {
        // 先派发的单元更慢，完成顺序与派发顺序相反
        Some(PromptKind::Researcher) => {
            let topic = first_user(messages);
            let rank = topic.trim_start_matches('t').parse::<u64>().unwrap_or(0);
            Duration::from_millis(60 - rank * 10)
        }
        _ => Duration::ZERO,
    });
    let mut cfg = config();
    cfg.research.max_concurrent_research_units = 2;
    cfg.research.allow_clarification = false;
    let (orchestrator, mut rx) = build_orchestrator(cfg, llm, Arc::new(InMemoryCheckpointStore::new())).await;

    let RunOutcome::Completed { state, .. } = orchestrator.run("five topics").await.unwrap() else {
        panic!("expected a completed run");
    };
    let expected: Vec<String> = topics.iter().map(|t| format!("summary of {t}")).collect();
    assert_eq!(state.notes.value(), &expected);

    let events = drain(&mut rx);
    let peak = events
        .iter()
        .find_map(|e| match e {
            ResearchEvent::SupervisorFinished { peak_active_units, .. } => Some(*peak_active_units),
            _ => None,
        })
        .unwrap();
    assert!(peak >= 1 && peak <= 2, "peak {peak} exceeds limit");
}
