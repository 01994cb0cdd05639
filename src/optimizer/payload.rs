//! Message payload optimizer.
//!
//! Shrinks outbound conversations before they are sent to a provider. Each message is cleaned on
//! its own (truncation, markdown, code comments, whitespace, embedded JSON); the conversation as a
//! whole is then deduplicated and, when long, its middle is folded into one placeholder message.
//!
//! Every step is a fixed point of itself, so optimizing an already optimized payload returns it
//! unchanged.

use crate::core::types::{Message, Role};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::debug;

/// Appended to content cut at `max_content_length`
pub const TRUNCATION_MARKER: &str = "\n\n[Note: Content truncated for optimization]";

/// Characters of headroom left for the truncation marker
const TRUNCATION_HEADROOM: usize = 100;

/// Fingerprints shorter than this never count as duplicates
const MIN_FINGERPRINT_LEN: usize = 20;

/// Optimization options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerOptions {
    /// Content longer than this many characters is truncated
    pub max_content_length: usize,

    /// Strip trailing blanks, collapse inner runs of blanks and blank lines
    pub remove_redundant_whitespace: bool,

    /// Re-serialize embedded JSON objects and arrays without whitespace
    pub minify_json: bool,

    /// Collapse long comment runs inside fenced code blocks
    pub optimize_code_blocks: bool,

    /// Drop empty headers/list items and overlong markers
    pub optimize_markdown: bool,

    /// Conversations with at least this many messages get their middle summarized
    pub summarize_threshold: usize,

    /// Most recent messages kept verbatim when summarizing
    pub keep_recent: usize,

    /// Drop near-identical messages
    pub dedupe_messages: bool,
}

impl Default for OptimizerOptions {
    fn default() -> Self {
        Self {
            max_content_length: 8000,
            remove_redundant_whitespace: true,
            minify_json: true,
            optimize_code_blocks: true,
            optimize_markdown: true,
            summarize_threshold: 8,
            keep_recent: 6,
            dedupe_messages: true,
        }
    }
}

impl OptimizerOptions {
    /// Aggressive preset used when a provider timed out on the full payload
    pub fn simplified(max_content_length: usize) -> Self {
        Self {
            max_content_length,
            summarize_threshold: 4,
            keep_recent: 2,
            ..Self::default()
        }
    }
}

struct Patterns {
    header_run: Regex,
    heavy_emphasis: Regex,
    heavy_underline: Regex,
    empty_list_item: Regex,
    empty_header: Regex,
    trailing_blanks: Regex,
    inner_blanks: Regex,
    blank_lines: Regex,
    placeholder: Regex,
}

impl Patterns {
    fn compile() -> Result<Self, regex::Error> {
        Ok(Self {
            header_run: Regex::new(r"#{6,}")?,
            heavy_emphasis: Regex::new(r"\*{4,}([^*\n]+?)\*{4,}")?,
            heavy_underline: Regex::new(r"_{3,}([^_\n]+?)_{3,}")?,
            empty_list_item: Regex::new(r"(?m)^[ \t]*[-*+][ \t]*$")?,
            empty_header: Regex::new(r"(?m)^#+[ \t]*$")?,
            trailing_blanks: Regex::new(r"[ \t]+\n")?,
            inner_blanks: Regex::new(r"(\S)[ \t]{2,}")?,
            blank_lines: Regex::new(r"\n{3,}")?,
            placeholder: Regex::new(
                r"^\[Note: (\d+) earlier messages in the conversation were summarized for efficiency\]$",
            )?,
        })
    }
}

/// Payload optimizer
pub struct PayloadOptimizer {
    options: OptimizerOptions,
    patterns: Option<Patterns>,
}

impl std::fmt::Debug for PayloadOptimizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayloadOptimizer").field("options", &self.options).finish()
    }
}

impl Default for PayloadOptimizer {
    fn default() -> Self {
        Self::new(OptimizerOptions::default())
    }
}

impl PayloadOptimizer {
    pub fn new(options: OptimizerOptions) -> Self {
        let patterns = match Patterns::compile() {
            Ok(patterns) => Some(patterns),
            Err(e) => {
                // Only pattern based steps are skipped; truncation, JSON and dedupe still run.
                tracing::error!(error = %e, "Failed to compile optimizer patterns");
                None
            }
        };
        Self { options, patterns }
    }

    /// Optimizer using [`OptimizerOptions::simplified`]
    pub fn simplified(max_content_length: usize) -> Self {
        Self::new(OptimizerOptions::simplified(max_content_length))
    }

    pub fn options(&self) -> &OptimizerOptions {
        &self.options
    }

    /// Optimize a conversation
    pub fn optimize_messages(&self, messages: &[Message]) -> Vec<Message> {
        if messages.is_empty() {
            return Vec::new();
        }

        let before: usize = messages.iter().map(|m| m.content.len()).sum();

        let mut optimized: Vec<Message> = messages
            .iter()
            .map(|m| Message::new(m.role, self.optimize_content(&m.content)))
            .filter(|m| !m.content.is_empty())
            .collect();

        if self.options.dedupe_messages {
            optimized = self.dedupe(optimized);
        }
        optimized = self.summarize(optimized);

        let after: usize = optimized.iter().map(|m| m.content.len()).sum();
        if after < before {
            debug!(
                messages_before = messages.len(),
                messages_after = optimized.len(),
                bytes_before = before,
                bytes_after = after,
                "Optimized payload"
            );
        }

        optimized
    }

    /// Optimize the content of one message
    pub fn optimize_content(&self, content: &str) -> String {
        let mut text = content.replace("\r\n", "\n");

        let char_count = text.chars().count();
        if char_count > self.options.max_content_length {
            let keep = self.options.max_content_length.saturating_sub(TRUNCATION_HEADROOM);
            debug!(from = char_count, to = keep, "Truncating message content");
            text = text.chars().take(keep).collect::<String>() + TRUNCATION_MARKER;
        }

        if let Some(patterns) = &self.patterns {
            if self.options.optimize_markdown {
                text = patterns.header_run.replace_all(&text, "#####").into_owned();
                text = patterns.heavy_emphasis.replace_all(&text, "**${1}**").into_owned();
                text = patterns.heavy_underline.replace_all(&text, "_${1}_").into_owned();
                text = patterns.empty_list_item.replace_all(&text, "").into_owned();
                text = patterns.empty_header.replace_all(&text, "").into_owned();
            }
        }

        if self.options.optimize_code_blocks {
            text = collapse_comment_runs(&text);
        }

        // Before the whitespace pass so whitespace decoded from JSON escapes is collapsed too
        if self.options.minify_json {
            text = minify_json_blocks(&text);
        }

        if let Some(patterns) = &self.patterns {
            if self.options.remove_redundant_whitespace {
                text = patterns.trailing_blanks.replace_all(&text, "\n").into_owned();
                text = patterns.inner_blanks.replace_all(&text, "${1} ").into_owned();
                text = patterns.blank_lines.replace_all(&text, "\n\n").into_owned();
            }
        }

        text.trim().to_string()
    }

    /// Drop messages whose fingerprint was already seen. The final message is always kept.
    fn dedupe(&self, messages: Vec<Message>) -> Vec<Message> {
        let total = messages.len();
        let mut seen = HashSet::new();
        let mut unique = Vec::with_capacity(total);

        for (index, message) in messages.into_iter().enumerate() {
            let fingerprint = content_fingerprint(&message.content);
            let is_last = index + 1 == total;
            if fingerprint.len() < MIN_FINGERPRINT_LEN || seen.insert(fingerprint) || is_last {
                unique.push(message);
            }
        }

        if unique.len() < total {
            debug!(from = total, to = unique.len(), "Dropped duplicate messages");
        }
        unique
    }

    /// Fold the middle of a long conversation into one placeholder message
    fn summarize(&self, messages: Vec<Message>) -> Vec<Message> {
        let keep_recent = self.options.keep_recent;
        if messages.len() < self.options.summarize_threshold || messages.len() <= keep_recent + 1 {
            return messages;
        }

        let split = messages.len() - keep_recent;
        let summarized: usize = messages[1..split]
            .iter()
            .map(|m| self.placeholder_count(&m.content).unwrap_or(1))
            .sum();

        let mut result = Vec::with_capacity(keep_recent + 2);
        let mut iter = messages.into_iter();
        result.extend(iter.next());
        result.push(summary_placeholder(summarized));
        result.extend(iter.skip(split - 1));
        result
    }

    fn placeholder_count(&self, content: &str) -> Option<usize> {
        let patterns = self.patterns.as_ref()?;
        patterns.placeholder.captures(content)?.get(1)?.as_str().parse().ok()
    }
}

/// Placeholder standing in for `count` summarized messages
pub fn summary_placeholder(count: usize) -> Message {
    Message::new(
        Role::Assistant,
        format!(
            "[Note: {} earlier messages in the conversation were summarized for efficiency]",
            count
        ),
    )
}

/// Optimize a single piece of text with default options
pub fn optimize_message(content: &str) -> String {
    PayloadOptimizer::default().optimize_content(content)
}

/// Hard cut of every message to `max_len` characters followed by `...`
pub fn simplify_messages(messages: &[Message], max_len: usize) -> Vec<Message> {
    messages
        .iter()
        .map(|m| {
            if m.content.chars().count() > max_len {
                let cut: String = m.content.chars().take(max_len).collect();
                Message::new(m.role, cut + "...")
            } else {
                m.clone()
            }
        })
        .collect()
}

/// First ten lowercase words longer than three characters, punctuation removed
fn content_fingerprint(content: &str) -> String {
    let cleaned: String = content
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_' || c.is_whitespace())
        .collect();

    cleaned
        .split_whitespace()
        .filter(|w| w.chars().count() > 3)
        .take(10)
        .collect::<Vec<_>>()
        .join(" ")
}

fn comment_marker(line: &str) -> Option<&'static str> {
    let trimmed = line.trim_start();
    if trimmed.starts_with("//") {
        Some("//")
    } else if trimmed.starts_with('#') {
        Some("#")
    } else {
        None
    }
}

/// Inside fenced code blocks, replace runs of three or more comment lines with one `... ` line
fn collapse_comment_runs(text: &str) -> String {
    fn flush<'a>(run: &mut Vec<&'a str>, marker: Option<&'static str>, out: &mut Vec<String>) {
        match marker {
            Some(marker) if run.len() >= 3 => {
                let first = run[0];
                let indent = &first[..first.len() - first.trim_start().len()];
                out.push(format!("{}{} ...", indent, marker));
            }
            _ => out.extend(run.iter().map(|l| l.to_string())),
        }
        run.clear();
    }

    let mut out = Vec::new();
    let mut run: Vec<&str> = Vec::new();
    let mut run_marker: Option<&'static str> = None;
    let mut in_fence = false;

    for line in text.split('\n') {
        if line.trim_start().starts_with("```") {
            flush(&mut run, run_marker, &mut out);
            run_marker = None;
            in_fence = !in_fence;
            out.push(line.to_string());
            continue;
        }

        let marker = if in_fence { comment_marker(line) } else { None };
        if marker.is_some() && marker == run_marker {
            run.push(line);
            continue;
        }

        flush(&mut run, run_marker, &mut out);
        run_marker = marker;
        if marker.is_some() {
            run.push(line);
        } else {
            out.push(line.to_string());
        }
    }
    flush(&mut run, run_marker, &mut out);

    out.join("\n")
}

/// Index of the bracket closing the one at `start`, skipping over JSON strings
fn matching_bracket(bytes: &[u8], start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &b) in bytes[start..].iter().enumerate() {
        if in_string {
            match b {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' | b'[' => depth += 1,
            b'}' | b']' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(start + offset);
                }
            }
            _ => {}
        }
    }
    None
}

/// Re-serialize every balanced `{...}` / `[...]` span that parses as JSON, unless that would make
/// the span longer
fn minify_json_blocks(text: &str) -> String {
    let bytes = text.as_bytes();
    let mut out = String::with_capacity(text.len());
    let mut copied = 0;
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'{' || bytes[i] == b'[' {
            if let Some(end) = matching_bracket(bytes, i) {
                let candidate = &text[i..=end];
                let compact = serde_json::from_str::<serde_json::Value>(candidate)
                    .ok()
                    .and_then(|value| serde_json::to_string(&value).ok())
                    .filter(|compact| compact.len() <= candidate.len());
                if let Some(compact) = compact {
                    out.push_str(&text[copied..i]);
                    out.push_str(&compact);
                    i = end + 1;
                    copied = i;
                    continue;
                }
            }
        }
        i += 1;
    }

    out.push_str(&text[copied..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn optimizer() -> PayloadOptimizer {
        PayloadOptimizer::default()
    }

    #[test]
    fn test_truncation_keeps_headroom_and_marker() {
        let optimizer = PayloadOptimizer::new(OptimizerOptions {
            max_content_length: 300,
            ..Default::default()
        });
        let long = "word ".repeat(200);
        let out = optimizer.optimize_content(&long);

        assert!(out.ends_with("[Note: Content truncated for optimization]"));
        assert!(out.chars().count() < 300);
        assert_eq!(optimizer.optimize_content(&out), out);
    }

    #[test]
    fn test_whitespace_cleanup_keeps_indentation() {
        let input = "fn main() {   \n    let  x =   1;\n\n\n\n}\t\t\n";
        let out = optimizer().optimize_content(input);
        assert_eq!(out, "fn main() {\n    let x = 1;\n\n}");
    }

    #[test]
    fn test_markdown_cleanup() {
        let input = "######## Title\n\n- \n* real item\n##\n****bold****\n___under___";
        let out = optimizer().optimize_content(input);
        assert_eq!(out, "##### Title\n\n* real item\n\n**bold**\n_under_");
    }

    #[test]
    fn test_code_comment_runs_collapse_only_in_fences() {
        let input = "```rust\n    // one\n    // two\n    // three\n    let x = 1;\n```\n// a\n// b\n// c";
        let out = optimizer().optimize_content(input);
        assert_eq!(out, "```rust\n    // ...\n    let x = 1;\n```\n// a\n// b\n// c");
    }

    #[test]
    fn test_embedded_json_is_minified() {
        let input = "Config:\n{\n  \"name\": \"gateway\",\n  \"ports\": [1, 2]\n}\nand a [link] here.";
        let out = optimizer().optimize_content(input);
        assert_eq!(out, "Config:\n{\"name\":\"gateway\",\"ports\":[1,2]}\nand a [link] here.");
    }

    #[test]
    fn test_json_escapes_and_numbers_stay_stable() {
        let spaced = "Data: {\"a\": \"x\\u0020\\u0020\\u0020y\"}";
        let once = optimizer().optimize_content(spaced);
        assert_eq!(once, "Data: {\"a\":\"x y\"}");
        assert_eq!(optimizer().optimize_content(&once), once);

        let exponent = "Limit {\"n\": 1e5}";
        let out = optimizer().optimize_content(exponent);
        assert_eq!(out, exponent);
        assert_eq!(optimizer().optimize_content(&out), out);
    }

    #[test]
    fn test_near_duplicates_dropped() {
        let messages = vec![
            Message::system("You are a helpful writing assistant."),
            Message::user("Please summarize the following article about distributed caching strategies!"),
            Message::assistant("Sure."),
            Message::user("please summarize the following article about distributed caching strategies"),
            Message::user("Thanks"),
        ];
        let out = optimizer().optimize_messages(&messages);
        assert_eq!(out.len(), 4);
        assert_eq!(out[3].content, "Thanks");
    }

    #[test]
    fn test_last_message_is_never_dropped() {
        let messages = vec![
            Message::user("Explain the importance weighted eviction policy in detail please"),
            Message::assistant("It ranks entries."),
            Message::user("Explain the importance weighted eviction policy in detail please"),
        ];
        assert_eq!(optimizer().optimize_messages(&messages).len(), 3);
    }

    #[test]
    fn test_long_conversation_is_summarized() {
        let messages: Vec<Message> = (0..12)
            .map(|i| {
                if i % 2 == 0 {
                    Message::user(format!("question {}", i))
                } else {
                    Message::assistant(format!("answer {}", i))
                }
            })
            .collect();

        let out = optimizer().optimize_messages(&messages);
        assert_eq!(out.len(), 8);
        assert_eq!(out[0].content, "question 0");
        assert_eq!(out[1], summary_placeholder(5));
        assert_eq!(out[2].content, "question 6");
        assert_eq!(out[7].content, "answer 11");
    }

    #[test]
    fn test_optimize_is_idempotent() {
        let mut messages = vec![Message::system("System   prompt\n\n\n\nwith  gaps")];
        for i in 0..10 {
            messages.push(Message::user(format!(
                "Turn {} ```py\n# a\n# b\n# c\nprint({{ \"k\" : [ {} ] }})\n```  \n######### head",
                i, i
            )));
        }

        let once = optimizer().optimize_messages(&messages);
        let twice = optimizer().optimize_messages(&once);
        assert_eq!(once, twice);
        assert_eq!(once.len(), 8);
        assert_eq!(once[1], summary_placeholder(4));
    }

    #[test]
    fn test_placeholders_are_merged() {
        let mut messages = vec![Message::system("start"), summary_placeholder(10)];
        messages.extend((0..7).map(|i| Message::user(format!("m{}", i))));

        let out = optimizer().optimize_messages(&messages);
        assert_eq!(out[1], summary_placeholder(11));
        assert_eq!(out.len(), 8);
    }

    #[test]
    fn test_simplify_messages() {
        let messages = vec![Message::user("abcdef"), Message::user("abc")];
        let out = simplify_messages(&messages, 4);
        assert_eq!(out[0].content, "abcd...");
        assert_eq!(out[1].content, "abc");
    }

    #[test]
    fn test_optimize_message_helper() {
        assert_eq!(optimize_message("  hello   world  "), "hello world");
    }
}
