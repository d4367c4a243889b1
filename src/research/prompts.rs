//! 各阶段的 system prompt
//!
//! 每个 prompt 的首行固定，PromptKind::detect 据此识别阶段（Mock 客户端与测试使用）。

use crate::memory::{Message, Role};

const CLARIFY_HEADER: &str = "You decide whether a research request needs clarification.";
const BRIEF_HEADER: &str = "You turn a conversation into a focused research brief.";
const SUPERVISOR_HEADER: &str = "You are the research supervisor.";
const RESEARCHER_HEADER: &str = "You are a research assistant working on one focused topic.";
const COMPRESS_HEADER: &str = "You compress research findings without losing information.";
const FINAL_REPORT_HEADER: &str = "You write the final research report.";
const SUMMARIZE_PAGE_HEADER: &str = "You summarize a web page for a researcher.";

/// prompt 所属阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptKind {
    Clarify,
    Brief,
    Supervisor,
    Researcher,
    Compress,
    FinalReport,
    SummarizePage,
}

impl PromptKind {
    /// 根据首条 system 消息的首行识别阶段
    pub fn detect(messages: &[Message]) -> Option<Self> {
        let system = messages.iter().find(|m| m.role == Role::System)?;
        let first_line = system.content.lines().next()?.trim();
        [
            (CLARIFY_HEADER, Self::Clarify),
            (BRIEF_HEADER, Self::Brief),
            (SUPERVISOR_HEADER, Self::Supervisor),
            (RESEARCHER_HEADER, Self::Researcher),
            (COMPRESS_HEADER, Self::Compress),
            (FINAL_REPORT_HEADER, Self::FinalReport),
            (SUMMARIZE_PAGE_HEADER, Self::SummarizePage),
        ]
        .into_iter()
        .find(|(header, _)| first_line == *header)
        .map(|(_, kind)| kind)
    }
}

fn today() -> String {
    chrono::Local::now().format("%a %b %-d, %Y").to_string()
}

/// 将对话渲染为纯文本（澄清与简报阶段只需要用户/助手的可见内容）
pub fn render_conversation(messages: &[Message]) -> String {
    messages
        .iter()
        .filter(|m| matches!(m.role, Role::User | Role::Assistant))
        .map(|m| {
            let who = if m.role == Role::User { "User" } else { "Assistant" };
            format!("{who}: {}", m.content)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn clarify_prompt() -> String {
    format!(
        "{CLARIFY_HEADER}\nToday's date is {}.\n\
        Ask a clarifying question only if the request contains unknown acronyms, \
        is ambiguous, or lacks information needed to research it. \
        If you already asked one in the conversation, do not ask again unless strictly necessary.\n\
        When no clarification is needed, write a short verification that you will start the research.",
        today()
    )
}

pub fn brief_prompt() -> String {
    format!(
        "{BRIEF_HEADER}\nToday's date is {}.\n\
        Translate the conversation into a detailed research question written in the first person. \
        Keep every detail the user gave, mark unstated dimensions as open, \
        and prefer primary and official sources.",
        today()
    )
}

pub fn supervisor_prompt(max_concurrent_units: usize, max_iterations: usize) -> String {
    format!(
        "{SUPERVISOR_HEADER}\nToday's date is {}.\n\
        Delegate research by calling ConductResearch with one standalone topic per call. \
        Use at most {max_concurrent_units} parallel ConductResearch calls per turn and stop after \
        {max_iterations} planning rounds at the latest. \
        Use think_tool to reflect on findings between rounds. \
        Call ResearchComplete when the findings answer the brief.",
        today()
    )
}

pub fn researcher_prompt(mcp_hint: &str) -> String {
    format!(
        "{RESEARCHER_HEADER}\nToday's date is {}.\n\
        Gather information with the available tools, starting broad and narrowing down. \
        After each search, use think_tool to assess what is still missing. \
        Call ResearchComplete as soon as you can answer the topic confidently.\n\
        Additional tools: {mcp_hint}",
        today()
    )
}

pub fn compress_prompt() -> String {
    format!(
        "{COMPRESS_HEADER}\nToday's date is {}.\n\
        Rewrite the tool outputs and notes of the conversation into a cleaned-up list of findings. \
        Keep every relevant fact verbatim, remove duplicates, and cite sources inline with \
        numbered references followed by a Sources section.",
        today()
    )
}

pub fn compress_instruction() -> &'static str {
    "All research above is complete. Clean up the findings now, preserving every relevant statement."
}

pub fn final_report_prompt() -> String {
    format!(
        "{FINAL_REPORT_HEADER}\nToday's date is {}.\n\
        Write a well-structured markdown report that answers the research brief using the findings. \
        Use clear section headings, cite sources with numbered references, \
        and finish with a Sources section.",
        today()
    )
}

pub fn final_report_input(brief: &str, conversation: &str, findings: &str) -> String {
    format!(
        "<Research Brief>\n{brief}\n</Research Brief>\n\n\
        <Conversation>\n{conversation}\n</Conversation>\n\n\
        <Findings>\n{findings}\n</Findings>"
    )
}

pub fn summarize_page_prompt() -> String {
    format!(
        "{SUMMARIZE_PAGE_HEADER}\nToday's date is {}.\n\
        Summarize the main points of the page and quote the most important excerpts verbatim.",
        today()
    )
}

/// 结构化输出 / 工具调用 JSON 解析失败后追加的纠正提示
pub fn corrective_instruction(error: &str) -> String {
    format!(
        "Your previous output could not be parsed: {error}. \
        Reply again with exactly one valid JSON object matching the requested format, \
        without markdown fences or any other text."
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_each_kind() {
        let cases = [
            (clarify_prompt(), PromptKind::Clarify),
            (brief_prompt(), PromptKind::Brief),
            (supervisor_prompt(3, 4), PromptKind::Supervisor),
            (researcher_prompt("none"), PromptKind::Researcher),
            (compress_prompt(), PromptKind::Compress),
            (final_report_prompt(), PromptKind::FinalReport),
            (summarize_page_prompt(), PromptKind::SummarizePage),
        ];
        for (prompt, kind) in cases {
            let msgs = vec![Message::system(prompt), Message::user("x")];
            assert_eq!(PromptKind::detect(&msgs), Some(kind));
        }
    }

    #[test]
    fn test_detect_unknown() {
        assert_eq!(PromptKind::detect(&[Message::user("hi")]), None);
        assert_eq!(PromptKind::detect(&[Message::system("Something else")]), None);
    }

    #[test]
    fn test_render_conversation_skips_tools_and_system() {
        let msgs = vec![
            Message::system("s"),
            Message::user("question"),
            Message::assistant("answer"),
        ];
        assert_eq!(render_conversation(&msgs), "User: question\nAssistant: answer");
    }
}
