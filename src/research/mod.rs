//! 研究层：监督循环、研究单元、模型调用与输出解析、prompt 与过程事件

pub mod events;
pub mod planner;
pub mod prompts;
pub mod researcher;
pub mod supervisor;

pub use events::{EventSink, ResearchEvent};
pub use planner::{parse_llm_output, ChatModel, ModelTurn, PlannerOutput, Structured};
pub use researcher::run_research_unit;
pub use supervisor::SupervisorLoop;
