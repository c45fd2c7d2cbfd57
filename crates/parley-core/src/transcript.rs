//! Transcript data model
//!
//! Plain nested records: serializable as-is, no cycles, no callbacks.
//! Messages sit behind `Arc` and are only mutated through `Arc::make_mut`,
//! so a cloned `Transcript` is a snapshot that later events never touch.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::partial_json::parse_partial;

/// Who authored a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// Message body: plain text for simple messages, blocks for streamed turns
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

/// One unit of content within an assistant turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContentBlock {
    /// Narrative text; consecutive deltas concatenate
    Text { value: String },
    /// Reasoning segment routed by its stream index
    Thinking(ThinkingBlock),
    /// Tool invocation routed by its tool id
    ToolUse { tool: ToolInvocation },
}

impl ContentBlock {
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text {
            value: value.into(),
        }
    }

    /// Whether deltas or stops can still be routed to this block
    pub fn is_open(&self) -> bool {
        match self {
            Self::Text { .. } => false,
            Self::Thinking(thinking) => !thinking.is_complete,
            Self::ToolUse { tool } => !tool.is_complete,
        }
    }
}

/// Reasoning segment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThinkingBlock {
    pub value: String,
    /// Provider-assigned index used to route deltas and the stop signal
    pub stream_index: usize,
    pub started_at: DateTime<Utc>,
    pub is_complete: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// Approximate token count, estimated from length when the provider gives none
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<u64>,
}

impl ThinkingBlock {
    pub fn new(stream_index: usize, started_at: DateTime<Utc>) -> Self {
        Self {
            value: String::new(),
            stream_index,
            started_at,
            is_complete: false,
            duration_ms: None,
            tokens_used: None,
        }
    }

    /// Finalize the block. Closing is one-way.
    pub fn close(&mut self, now: DateTime<Utc>, chars_per_token: usize) {
        if self.is_complete {
            return;
        }
        self.is_complete = true;
        let elapsed = (now - self.started_at).num_milliseconds().max(0);
        self.duration_ms = Some(u64::try_from(elapsed).unwrap_or(0));
        if self.tokens_used.is_none() {
            self.tokens_used = Some(estimate_tokens(&self.value, chars_per_token));
        }
    }
}

/// Rough token estimate from character count
pub fn estimate_tokens(text: &str, chars_per_token: usize) -> u64 {
    let chars = text.chars().count();
    u64::try_from(chars.div_ceil(chars_per_token.max(1))).unwrap_or(u64::MAX)
}

/// Tool invocation as seen by the renderer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    /// Provider's stable identity, also used to route result events
    pub id: String,
    pub name: String,
    pub stream_index: usize,
    /// Argument text exactly as received, append-only until closed
    pub raw_argument_text: String,
    /// Best value derived from `raw_argument_text` so far
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parsed_arguments: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
    /// Argument streaming has ended
    #[serde(default)]
    pub is_complete: bool,
}

impl ToolInvocation {
    pub fn new(id: impl Into<String>, name: impl Into<String>, stream_index: usize) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            stream_index,
            raw_argument_text: String::new(),
            parsed_arguments: None,
            result: None,
            is_error: None,
            is_complete: false,
        }
    }

    /// Append an argument fragment and refresh the derived value.
    ///
    /// A parse that yields nothing keeps the previous value.
    pub fn append_arguments(&mut self, delta: &str) {
        self.raw_argument_text.push_str(delta);
        if let Some(parsed) = parse_partial(&self.raw_argument_text) {
            self.parsed_arguments = Some(parsed);
        }
    }

    /// Close argument streaming: exact parse, then best effort, then the last good value
    pub fn finalize_arguments(&mut self) {
        if self.is_complete {
            return;
        }
        self.is_complete = true;
        let finalized = serde_json::from_str::<Value>(&self.raw_argument_text)
            .ok()
            .or_else(|| parse_partial(&self.raw_argument_text));
        if let Some(value) = finalized {
            self.parsed_arguments = Some(value);
        }
    }
}

/// One turn in the conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: MessageContent,
    pub created_at: DateTime<Utc>,
}

impl Message {
    fn new(role: Role, content: MessageContent, created_at: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role,
            content,
            created_at,
        }
    }

    pub fn user(text: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self::new(Role::User, MessageContent::Text(text.into()), created_at)
    }

    pub fn assistant_text(text: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self::new(Role::Assistant, MessageContent::Text(text.into()), created_at)
    }

    pub fn assistant_blocks(blocks: Vec<ContentBlock>, created_at: DateTime<Utc>) -> Self {
        Self::new(Role::Assistant, MessageContent::Blocks(blocks), created_at)
    }

    /// Content blocks, empty for plain-text messages
    pub fn blocks(&self) -> &[ContentBlock] {
        match &self.content {
            MessageContent::Blocks(blocks) => blocks,
            MessageContent::Text(_) => &[],
        }
    }

    /// Mutable blocks, `None` for plain-text messages
    pub fn blocks_mut(&mut self) -> Option<&mut Vec<ContentBlock>> {
        match &mut self.content {
            MessageContent::Blocks(blocks) => Some(blocks),
            MessageContent::Text(_) => None,
        }
    }

    /// Concatenated narrative text, ignoring thinking and tool blocks
    pub fn plain_text(&self) -> String {
        match &self.content {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|block| match block {
                    ContentBlock::Text { value } => Some(value.as_str()),
                    ContentBlock::Thinking(_) | ContentBlock::ToolUse { .. } => None,
                })
                .collect(),
        }
    }
}

/// Ordered messages of one session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Transcript {
    messages: Vec<Arc<Message>>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter().map(Arc::as_ref)
    }

    pub fn get(&self, index: usize) -> Option<&Message> {
        self.messages.get(index).map(Arc::as_ref)
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last().map(Arc::as_ref)
    }

    pub(crate) fn push(&mut self, message: Message) {
        self.messages.push(Arc::new(message));
    }

    /// Tail message for writing; detaches it from any snapshot still holding it
    pub(crate) fn last_mut(&mut self) -> Option<&mut Message> {
        self.messages.last_mut().map(Arc::make_mut)
    }

    /// Whether two transcripts share the same message allocation at `index`
    pub fn shares_message_with(&self, other: &Transcript, index: usize) -> bool {
        match (self.messages.get(index), other.messages.get(index)) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}
