//! 记忆层：消息日志与 token 预算

pub mod conversation;
pub mod token_budget;

pub use conversation::{pending_tool_calls, Message, MessageLog, Role, ToolCall};
pub use token_budget::{truncate_messages, TokenEstimator};
