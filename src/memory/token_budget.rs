//! Token 预算控制
//!
//! 估算消息序列的 token 数，并在超出模型输入预算时按优先级逐步截断：
//! 先清空最旧的工具结果正文，再移除最旧的中间轮次，最后按比例裁剪最长的正文。
//! system 指令、首条用户消息（研究主题）与最近的轮次不会被移除。

use crate::memory::{Message, Role};

/// 最近若干条消息不参与前两步截断
const KEEP_RECENT: usize = 2;
/// 每条消息的结构开销（role、分隔符等）
const PER_MESSAGE_OVERHEAD: usize = 4;
/// 被清空的工具结果正文替换为此占位
pub const TRUNCATED_PLACEHOLDER: &str = "[tool output truncated to fit the model context]";

/// Token 估算器（简单的字符计数近似）
pub struct TokenEstimator;

impl TokenEstimator {
    /// 估算文本的 token 数量
    /// 使用简单的启发式规则：英文约 4 字符/token，中文约 1.5 字符/token
    pub fn estimate(text: &str) -> usize {
        let mut ascii_chars = 0;
        let mut non_ascii_chars = 0;

        for c in text.chars() {
            if c.is_ascii() {
                ascii_chars += 1;
            } else {
                non_ascii_chars += 1;
            }
        }

        let tokens = ascii_chars / 4 + (non_ascii_chars as f64 / 1.5).ceil() as usize;
        tokens.max(1)
    }

    /// 估算整段消息序列（含工具调用参数）
    pub fn estimate_messages(messages: &[Message]) -> usize {
        messages
            .iter()
            .map(|m| {
                let args: usize = m
                    .tool_calls
                    .iter()
                    .map(|c| Self::estimate(&c.name) + Self::estimate(&c.args.to_string()))
                    .sum();
                Self::estimate(&m.content) + args + PER_MESSAGE_OVERHEAD
            })
            .sum()
    }
}

/// 将消息序列截断到 budget（token）以内；无法再缩减时返回尽力结果
pub fn truncate_messages(messages: &[Message], budget: usize) -> Vec<Message> {
    let mut out: Vec<Message> = messages.to_vec();
    if TokenEstimator::estimate_messages(&out) <= budget {
        return out;
    }

    // 1. 清空最旧的工具结果正文
    let protected_from = out.len().saturating_sub(KEEP_RECENT);
    for i in 0..protected_from {
        if TokenEstimator::estimate_messages(&out) <= budget {
            return out;
        }
        if out[i].role == Role::Tool && out[i].content != TRUNCATED_PLACEHOLDER {
            out[i].content = TRUNCATED_PLACEHOLDER.to_string();
        }
    }

    // 2. 移除最旧的中间轮次（assistant 连同其工具结果一起移除），首条用户消息除外
    while TokenEstimator::estimate_messages(&out) > budget {
        let protected_from = out.len().saturating_sub(KEEP_RECENT);
        let topic = out.iter().position(|m| m.role == Role::User);
        let Some(idx) = (0..protected_from)
            .find(|&i| Some(i) != topic && out[i].role != Role::System && out[i].role != Role::Tool)
        else {
            break;
        };
        let removed = out.remove(idx);
        let ids: Vec<&str> = removed.tool_calls.iter().map(|c| c.id.as_str()).collect();
        if !ids.is_empty() {
            let tail_start = out.len().saturating_sub(KEEP_RECENT);
            let mut i = 0;
            out.retain(|m| {
                let keep = i >= tail_start
                    || !m
                        .tool_call_id
                        .as_deref()
                        .is_some_and(|id| ids.contains(&id));
                i += 1;
                keep
            });
        }
    }

    // 3. 按比例裁剪最长的非 system 正文
    let total = TokenEstimator::estimate_messages(&out);
    if total > budget {
        let longest = out
            .iter()
            .enumerate()
            .filter(|(_, m)| m.role != Role::System)
            .max_by_key(|(_, m)| m.content.len())
            .or_else(|| out.iter().enumerate().max_by_key(|(_, m)| m.content.len()))
            .map(|(i, _)| i);
        if let Some(i) = longest {
            let own = TokenEstimator::estimate(&out[i].content);
            let excess = total - budget;
            let keep_tokens = own.saturating_sub(excess);
            out[i].content = truncate_to_tokens(&out[i].content, keep_tokens);
        }
    }

    out
}

/// 将文本截断到指定 token 数，保留开头部分
pub fn truncate_to_tokens(text: &str, max_tokens: usize) -> String {
    let estimated = TokenEstimator::estimate(text);
    if estimated <= max_tokens {
        return text.to_string();
    }

    let ratio = max_tokens as f64 / estimated as f64;
    let target_chars = (text.chars().count() as f64 * ratio * 0.9) as usize; // 留 10% 余量
    let truncated: String = text.chars().take(target_chars).collect();

    format!("{}...\n[truncated due to token budget]", truncated.trim_end())
}
