//! 核心编排层：错误与恢复、状态与合并、并发派发、检查点、构建与主控状态机

pub mod builder;
pub mod checkpoint;
pub mod dispatcher;
pub mod error;
pub mod orchestrator;
pub mod recovery;
pub mod reducer;
pub mod state;

pub use builder::{create_llm_from_config, ResearchBuilder, ResearchContext};
pub use checkpoint::{CheckpointStore, InMemoryCheckpointStore, JsonFileCheckpointStore};
pub use dispatcher::{ConcurrencyDispatcher, DispatchReport};
pub use error::{FailureKind, RecoveryAction, ResearchError};
pub use orchestrator::{ClarifyWithUser, ResearchOrchestrator, ResearchQuestion, RunOutcome};
pub use recovery::{FailureClassifier, Invocation, RecoveryEngine, RecoveryPolicy};
pub use reducer::{Channel, MergePolicy, ReducerError, Update};
pub use state::{
    FinalOutput, ResearchUnitOutput, SupervisorExit, SupervisorState, UnitExit, WorkflowPhase, WorkflowState,
};
