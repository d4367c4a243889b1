//! 模型输入上限表（token）
//!
//! 容量恢复时按模型名查询最大输入预算；先精确匹配，再按最长前缀匹配，
//! 支持 `provider:model` 形式（如 `openai:gpt-4.1`）。

/// (模型名或前缀, 最大输入 token)
const MODEL_TOKEN_LIMITS: &[(&str, usize)] = &[
    ("gpt-4.1-mini", 1_047_576),
    ("gpt-4.1-nano", 1_047_576),
    ("gpt-4.1", 1_047_576),
    ("gpt-4o-mini", 128_000),
    ("gpt-4o", 128_000),
    ("gpt-4-turbo", 128_000),
    ("gpt-4", 8_192),
    ("gpt-3.5-turbo", 16_385),
    ("o4-mini", 200_000),
    ("o3-mini", 200_000),
    ("o3", 200_000),
    ("o1", 200_000),
    ("claude-opus-4", 200_000),
    ("claude-sonnet-4", 200_000),
    ("claude-3-7-sonnet", 200_000),
    ("claude-3-5-sonnet", 200_000),
    ("claude-3-5-haiku", 200_000),
    ("gemini-1.5-pro", 2_097_152),
    ("gemini-1.5-flash", 1_048_576),
    ("deepseek-chat", 64_000),
    ("deepseek-reasoner", 64_000),
    ("llama3.1", 128_000),
    ("mistral-large", 128_000),
];

/// 查询模型最大输入 token；未知模型返回 None
pub fn model_token_limit(model: &str) -> Option<usize> {
    let name = model.rsplit(':').next().unwrap_or(model).trim().to_lowercase();
    if let Some((_, limit)) = MODEL_TOKEN_LIMITS.iter().find(|(m, _)| *m == name) {
        return Some(*limit);
    }
    MODEL_TOKEN_LIMITS
        .iter()
        .filter(|(m, _)| name.starts_with(m))
        .max_by_key(|(m, _)| m.len())
        .map(|(_, limit)| *limit)
}
