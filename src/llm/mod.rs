//! LLM 层：客户端抽象与实现（OpenAI 兼容 / DeepSeek / Mock / Scripted）与模型输入上限表

pub mod deepseek;
pub mod limits;
pub mod mock;
pub mod openai;
pub mod traits;

pub use deepseek::{create_deepseek_client, DEEPSEEK_CHAT};
pub use limits::model_token_limit;
pub use mock::{MockLlmClient, ScriptedLlmClient};
pub use openai::{OpenAiClient, TokenUsage};
pub use traits::{LlmClient, LlmError};
