//! Stream reconciler
//!
//! Turns an ordered stream of fine-grained provider events into a transcript.
//! Deltas are routed by identity (thinking stream index, tool id), never by
//! position, because several blocks of the same kind can be open at once and
//! the transport interleaves them freely.
//!
//! Rules the routing relies on:
//! - only the tail message of a streaming turn is ever written
//! - a closed block is never matched again, so late or repeated signals are inert
//! - unmatched events change nothing

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use tracing::{debug, info, trace};

use crate::config::{NewTurnPolicy, ReconcilerConfig};
use crate::error::ReconcileError;
use crate::events::StreamEvent;
use crate::transcript::{
    ContentBlock, Message, MessageContent, Role, ThinkingBlock, ToolInvocation, Transcript,
};

/// Per-session reconciliation state
#[derive(Debug, Clone)]
pub struct Reconciler {
    config: ReconcilerConfig,
    transcript: Transcript,
    is_streaming: bool,
    pending_debug_lines: VecDeque<String>,
}

impl Default for Reconciler {
    fn default() -> Self {
        Self::new(ReconcilerConfig::default())
    }
}

impl Reconciler {
    pub fn new(config: ReconcilerConfig) -> Self {
        Self::with_transcript(config, Transcript::new())
    }

    /// Resume on top of an existing (finished) transcript
    pub fn with_transcript(config: ReconcilerConfig, transcript: Transcript) -> Self {
        Self {
            config,
            transcript,
            is_streaming: false,
            pending_debug_lines: VecDeque::new(),
        }
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    /// Cheap immutable copy for readers
    pub fn snapshot(&self) -> Transcript {
        self.transcript.clone()
    }

    pub fn into_transcript(self) -> Transcript {
        self.transcript
    }

    pub fn is_streaming(&self) -> bool {
        self.is_streaming
    }

    pub fn pending_debug_lines(&self) -> impl Iterator<Item = &str> {
        self.pending_debug_lines.iter().map(String::as_str)
    }

    /// Apply one event stamped with the current time
    pub fn apply(&mut self, event: StreamEvent) -> bool {
        self.apply_at(event, Utc::now())
    }

    /// Apply one event. Returns whether the transcript changed.
    pub fn apply_at(&mut self, event: StreamEvent, now: DateTime<Utc>) -> bool {
        trace!("Reconciler event: {}", event.kind());
        match event {
            StreamEvent::TextDelta { chunk } => self.on_text_delta(&chunk, now),
            StreamEvent::ThinkingStart { index } => self.on_thinking_start(index, now),
            StreamEvent::ThinkingDelta { index, delta } => self.on_thinking_delta(index, &delta),
            StreamEvent::BlockStop { index, tool_id } => {
                self.on_block_stop(index, tool_id.as_deref(), now)
            }
            StreamEvent::ToolStart { id, name, index } => {
                self.on_tool_use_start(ToolInvocation::new(id, name, index), now)
            }
            StreamEvent::ToolArgumentDelta { tool_id, delta } => {
                self.on_tool_argument_delta(&tool_id, &delta)
            }
            StreamEvent::ToolResultStart {
                tool_id,
                content,
                is_error,
            } => self.on_tool_result_start(&tool_id, content, is_error),
            StreamEvent::ToolResultDelta { tool_id, delta } => {
                self.on_tool_result_delta(&tool_id, &delta)
            }
            StreamEvent::ToolResultComplete {
                tool_id,
                content,
                is_error,
            } => self.on_tool_result_complete(&tool_id, content, is_error),
            StreamEvent::DebugLine { text } => self.on_debug_line(text),
            StreamEvent::TurnComplete => self.on_complete(now),
            StreamEvent::TurnStopped => self.on_stopped(now),
            StreamEvent::TurnError { message } => self.on_error(&message, now),
        }
    }

    /// Append a user message, starting a new exchange
    pub fn begin_user_turn(
        &mut self,
        text: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), ReconcileError> {
        if self.is_streaming {
            match self.config.new_turn_policy {
                NewTurnPolicy::Reject => {
                    let message_id = self
                        .transcript
                        .last()
                        .map(|message| message.id.clone())
                        .unwrap_or_default();
                    debug!("Rejecting user turn: message {} still streaming", message_id);
                    return Err(ReconcileError::TurnInProgress { message_id });
                }
                NewTurnPolicy::ForceClose => {
                    info!("Force-closing streaming turn before new user turn");
                    self.on_stopped(now);
                }
            }
        }
        self.transcript.push(Message::user(text, now));
        Ok(())
    }

    // =========================================================================
    // Event handlers
    // =========================================================================

    pub fn on_text_delta(&mut self, chunk: &str, now: DateTime<Utc>) -> bool {
        if !self.has_open_message() {
            self.begin_assistant_turn(vec![ContentBlock::text(chunk)], now);
            return true;
        }

        let Some(blocks) = self.open_blocks(now) else {
            return false;
        };
        match blocks.last_mut() {
            Some(ContentBlock::Text { value }) => value.push_str(chunk),
            _ => blocks.push(ContentBlock::text(chunk)),
        }
        true
    }

    pub fn on_thinking_start(&mut self, stream_index: usize, now: DateTime<Utc>) -> bool {
        if self.find_open_thinking(stream_index).is_some() {
            debug!("Ignoring thinking_start for already open index {}", stream_index);
            return false;
        }
        let Some(blocks) = self.open_blocks(now) else {
            return false;
        };
        blocks.push(ContentBlock::Thinking(ThinkingBlock::new(stream_index, now)));
        true
    }

    pub fn on_thinking_delta(&mut self, stream_index: usize, delta: &str) -> bool {
        let Some(position) = self.find_open_thinking(stream_index) else {
            debug!("Dropping thinking_delta for unmatched index {}", stream_index);
            return false;
        };
        match self.open_block_mut(position) {
            Some(ContentBlock::Thinking(thinking)) => {
                thinking.value.push_str(delta);
                true
            }
            _ => false,
        }
    }

    /// Close the thinking block at `index`, else the matching tool block
    pub fn on_block_stop(
        &mut self,
        index: usize,
        tool_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> bool {
        let chars_per_token = self.config.chars_per_token;

        if let Some(position) = self.find_open_thinking(index) {
            if let Some(ContentBlock::Thinking(thinking)) = self.open_block_mut(position) {
                thinking.close(now, chars_per_token);
                debug!(
                    "Thinking block {} closed after {:?} ms",
                    index, thinking.duration_ms
                );
                return true;
            }
        }

        let position = match tool_id.filter(|id| !id.is_empty()) {
            Some(id) => self.find_tool(|tool| !tool.is_complete && tool.id == id),
            None => self.find_tool(|tool| !tool.is_complete && tool.stream_index == index),
        };
        let Some(position) = position else {
            debug!("Dropping block_stop for unmatched index {} ({:?})", index, tool_id);
            return false;
        };

        match self.open_block_mut(position) {
            Some(ContentBlock::ToolUse { tool }) => {
                tool.finalize_arguments();
                debug!("Tool block {} ({}) closed", tool.id, tool.name);
                true
            }
            _ => false,
        }
    }

    pub fn on_tool_use_start(&mut self, tool: ToolInvocation, now: DateTime<Utc>) -> bool {
        let id = tool.id.clone();
        if self
            .find_tool(|open| !open.is_complete && open.id == id)
            .is_some()
        {
            debug!("Ignoring tool_start for already open tool {}", id);
            return false;
        }
        let Some(blocks) = self.open_blocks(now) else {
            return false;
        };
        info!("Tool call started: id={}, name={}", tool.id, tool.name);
        blocks.push(ContentBlock::ToolUse { tool });
        true
    }

    pub fn on_tool_argument_delta(&mut self, tool_id: &str, delta: &str) -> bool {
        if tool_id.is_empty() {
            return false;
        }
        let Some(position) = self.find_tool(|tool| !tool.is_complete && tool.id == tool_id)
        else {
            debug!("Dropping tool_argument_delta for unmatched tool {}", tool_id);
            return false;
        };
        match self.open_block_mut(position) {
            Some(ContentBlock::ToolUse { tool }) => {
                tool.append_arguments(delta);
                true
            }
            _ => false,
        }
    }

    pub fn on_tool_result_start(&mut self, tool_id: &str, content: String, is_error: bool) -> bool {
        self.with_tool_result(tool_id, |tool| {
            tool.result = Some(content);
            tool.is_error = Some(is_error);
        })
    }

    pub fn on_tool_result_delta(&mut self, tool_id: &str, delta: &str) -> bool {
        self.with_tool_result(tool_id, |tool| {
            tool.result.get_or_insert_with(String::new).push_str(delta);
        })
    }

    pub fn on_tool_result_complete(
        &mut self,
        tool_id: &str,
        content: String,
        is_error: Option<bool>,
    ) -> bool {
        self.with_tool_result(tool_id, |tool| {
            tool.result = Some(content);
            if is_error.is_some() {
                tool.is_error = is_error;
            }
        })
    }

    pub fn on_complete(&mut self, now: DateTime<Utc>) -> bool {
        info!("Turn complete");
        self.end_turn(now)
    }

    /// User cancelled: force-close whatever is still open. Idempotent.
    pub fn on_stopped(&mut self, now: DateTime<Utc>) -> bool {
        info!("Turn stopped");
        self.end_turn(now)
    }

    pub fn on_error(&mut self, message: &str, now: DateTime<Utc>) -> bool {
        info!("Turn failed: {}", message);
        self.end_turn(now);
        self.transcript.push(Message::assistant_text(message, now));
        true
    }

    /// Buffer a debug line for the current turn; outside a turn it is dropped
    pub fn on_debug_line(&mut self, line: String) -> bool {
        if !self.is_streaming {
            trace!("Discarding debug line outside a turn");
            return false;
        }
        self.pending_debug_lines.push_back(line);
        while self.pending_debug_lines.len() > self.config.max_debug_lines {
            self.pending_debug_lines.pop_front();
        }
        false
    }

    // =========================================================================
    // Routing helpers
    // =========================================================================

    fn has_open_message(&self) -> bool {
        self.is_streaming
            && self
                .transcript
                .last()
                .is_some_and(|message| message.role == Role::Assistant)
    }

    fn begin_assistant_turn(&mut self, blocks: Vec<ContentBlock>, now: DateTime<Utc>) {
        info!("Assistant turn started");
        self.transcript.push(Message::assistant_blocks(blocks, now));
        self.is_streaming = true;
        self.pending_debug_lines.clear();
    }

    /// Blocks of the open message, opening a new assistant turn if needed
    fn open_blocks(&mut self, now: DateTime<Utc>) -> Option<&mut Vec<ContentBlock>> {
        if !self.has_open_message() {
            self.begin_assistant_turn(Vec::new(), now);
        }
        self.transcript.last_mut()?.blocks_mut()
    }

    /// Read-only blocks of the open message
    fn open_message_blocks(&self) -> &[ContentBlock] {
        if !self.has_open_message() {
            return &[];
        }
        self.transcript.last().map_or(&[], Message::blocks)
    }

    fn open_block_mut(&mut self, position: usize) -> Option<&mut ContentBlock> {
        if !self.has_open_message() {
            return None;
        }
        self.transcript.last_mut()?.blocks_mut()?.get_mut(position)
    }

    fn find_open_thinking(&self, stream_index: usize) -> Option<usize> {
        self.open_message_blocks().iter().rposition(|block| {
            matches!(
                block,
                ContentBlock::Thinking(thinking)
                    if !thinking.is_complete && thinking.stream_index == stream_index
            )
        })
    }

    fn find_tool(&self, predicate: impl Fn(&ToolInvocation) -> bool) -> Option<usize> {
        self.open_message_blocks()
            .iter()
            .rposition(|block| matches!(block, ContentBlock::ToolUse { tool } if predicate(tool)))
    }

    /// Result events match by id whether or not argument streaming has closed
    fn with_tool_result(&mut self, tool_id: &str, update: impl FnOnce(&mut ToolInvocation)) -> bool {
        let Some(position) = self.find_tool(|tool| tool.id == tool_id) else {
            debug!("Dropping tool result event for unmatched tool {}", tool_id);
            return false;
        };
        match self.open_block_mut(position) {
            Some(ContentBlock::ToolUse { tool }) => {
                update(tool);
                true
            }
            _ => false,
        }
    }

    /// Shared terminal path: close open blocks, stop streaming, flush debug lines
    fn end_turn(&mut self, now: DateTime<Utc>) -> bool {
        let was_streaming = self.is_streaming;
        let closed = self.force_close_open_blocks(now);
        self.is_streaming = false;
        let flushed = self.flush_debug_lines(now);
        was_streaming || closed || flushed
    }

    fn force_close_open_blocks(&mut self, now: DateTime<Utc>) -> bool {
        if !self.open_message_blocks().iter().any(ContentBlock::is_open) {
            return false;
        }
        let chars_per_token = self.config.chars_per_token;
        let Some(blocks) = self.transcript.last_mut().and_then(Message::blocks_mut) else {
            return false;
        };

        let mut closed = 0;
        for block in blocks.iter_mut() {
            match block {
                ContentBlock::Thinking(thinking) if !thinking.is_complete => {
                    thinking.close(now, chars_per_token);
                    closed += 1;
                }
                ContentBlock::ToolUse { tool } if !tool.is_complete => {
                    tool.finalize_arguments();
                    closed += 1;
                }
                _ => {}
            }
        }
        debug!("Force-closed {} open blocks", closed);
        closed > 0
    }

    fn flush_debug_lines(&mut self, now: DateTime<Utc>) -> bool {
        if self.pending_debug_lines.is_empty() {
            return false;
        }
        let joined = self
            .pending_debug_lines
            .drain(..)
            .collect::<Vec<_>>()
            .join("\n");

        let appendable = self.transcript.last().is_some_and(|message| {
            message.role == Role::Assistant && matches!(message.content, MessageContent::Blocks(_))
        });
        let tail = if appendable {
            self.transcript.last_mut().and_then(Message::blocks_mut)
        } else {
            None
        };
        match tail {
            Some(blocks) => blocks.push(ContentBlock::text(joined)),
            None => self
                .transcript
                .push(Message::assistant_blocks(vec![ContentBlock::text(joined)], now)),
        }
        true
    }
}
