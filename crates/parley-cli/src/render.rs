//! Plain-text rendering of transcripts and parser output

use parley_core::{parse_partial, ContentBlock, Message, MessageContent, Role, Transcript};
use serde_json::Value;
use textwrap::Options;

const INDENT: &str = "  ";

/// Render every message, wrapped to `width` columns
pub fn render_transcript(transcript: &Transcript, width: usize) -> String {
    let mut out = String::new();
    for message in transcript.iter() {
        render_message(&mut out, message, width);
        out.push('\n');
    }
    out
}

fn render_message(out: &mut String, message: &Message, width: usize) {
    let role = match message.role {
        Role::User => "user",
        Role::Assistant => "assistant",
    };
    out.push_str(&format!("{}:\n", role));

    match &message.content {
        MessageContent::Text(text) => push_wrapped(out, text, width, INDENT),
        MessageContent::Blocks(blocks) => {
            for block in blocks {
                render_block(out, block, width);
            }
        }
    }
}

fn render_block(out: &mut String, block: &ContentBlock, width: usize) {
    match block {
        ContentBlock::Text { value } => push_wrapped(out, value, width, INDENT),
        ContentBlock::Thinking(thinking) => {
            let mut header = String::from("[thinking");
            if let Some(tokens) = thinking.tokens_used {
                header.push_str(&format!(", ~{} tokens", tokens));
            }
            if let Some(ms) = thinking.duration_ms {
                header.push_str(&format!(", {} ms", ms));
            }
            if !thinking.is_complete {
                header.push_str(", streaming");
            }
            header.push(']');
            out.push_str(&format!("{}{}\n", INDENT, header));
            push_wrapped(out, &thinking.value, width, "  | ");
        }
        ContentBlock::ToolUse { tool } => {
            let status = if tool.is_complete { "" } else { ", streaming" };
            out.push_str(&format!(
                "{}[tool {} ({}){}]\n",
                INDENT, tool.name, tool.id, status
            ));
            let arguments = match &tool.parsed_arguments {
                Some(value) => value.to_string(),
                None => tool.raw_argument_text.clone(),
            };
            if !arguments.is_empty() {
                push_wrapped(out, &format!("args: {}", arguments), width, "    ");
            }
            if let Some(result) = &tool.result {
                let label = if tool.is_error == Some(true) {
                    "error"
                } else {
                    "result"
                };
                push_wrapped(out, &format!("{}: {}", label, result), width, "    ");
            }
        }
    }
}

fn push_wrapped(out: &mut String, text: &str, width: usize, indent: &str) {
    if text.is_empty() {
        return;
    }
    let options = Options::new(width.max(indent.len() + 1))
        .initial_indent(indent)
        .subsequent_indent(indent);
    for paragraph in text.split('\n') {
        if paragraph.is_empty() {
            out.push('\n');
            continue;
        }
        out.push_str(&textwrap::fill(paragraph, &options));
        out.push('\n');
    }
}

/// Compact JSON for a parse result, `none` when nothing usable was derived
pub fn value_or_none(value: Option<&Value>) -> String {
    value.map_or_else(|| "none".to_string(), Value::to_string)
}

/// Parse result for each prefix, ending at every char boundary
pub fn prefix_values(input: &str) -> Vec<(&str, String)> {
    input
        .char_indices()
        .map(|(i, c)| &input[..i + c.len_utf8()])
        .map(|prefix| (prefix, value_or_none(parse_partial(prefix).as_ref())))
        .collect()
}
