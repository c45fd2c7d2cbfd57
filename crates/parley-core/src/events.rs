//! Streaming events consumed by the reconciler
//!
//! One discriminated event per provider signal. The wire form is JSON with a
//! `type` tag, one event per line when recorded to disk.

use serde::{Deserialize, Serialize};

/// Events that drive a session transcript
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    /// Narrative text delta
    #[serde(rename = "text_delta")]
    TextDelta { chunk: String },

    /// Thinking block start (extended thinking)
    #[serde(rename = "thinking_start")]
    ThinkingStart { index: usize },

    /// Thinking content delta
    #[serde(rename = "thinking_delta")]
    ThinkingDelta { index: usize, delta: String },

    /// Content block stop, for thinking or tool blocks
    #[serde(rename = "block_stop")]
    BlockStop {
        index: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_id: Option<String>,
    },

    /// Tool call start
    #[serde(rename = "tool_start")]
    ToolStart {
        id: String,
        name: String,
        index: usize,
    },

    /// Tool call arguments delta
    #[serde(rename = "tool_argument_delta")]
    ToolArgumentDelta { tool_id: String, delta: String },

    /// Tool result started streaming
    #[serde(rename = "tool_result_start")]
    ToolResultStart {
        tool_id: String,
        #[serde(default)]
        content: String,
        #[serde(default)]
        is_error: bool,
    },

    /// Tool result output delta
    #[serde(rename = "tool_result_delta")]
    ToolResultDelta { tool_id: String, delta: String },

    /// Tool result finished
    #[serde(rename = "tool_result_complete")]
    ToolResultComplete {
        tool_id: String,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },

    /// Out-of-band log line from the agent process
    #[serde(rename = "debug_line")]
    DebugLine { text: String },

    /// Turn finished normally
    #[serde(rename = "turn_complete")]
    TurnComplete,

    /// Turn cancelled by the user
    #[serde(rename = "turn_stopped")]
    TurnStopped,

    /// Provider reported a hard failure
    #[serde(rename = "turn_error")]
    TurnError { message: String },
}

impl StreamEvent {
    /// Short name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TextDelta { .. } => "text_delta",
            Self::ThinkingStart { .. } => "thinking_start",
            Self::ThinkingDelta { .. } => "thinking_delta",
            Self::BlockStop { .. } => "block_stop",
            Self::ToolStart { .. } => "tool_start",
            Self::ToolArgumentDelta { .. } => "tool_argument_delta",
            Self::ToolResultStart { .. } => "tool_result_start",
            Self::ToolResultDelta { .. } => "tool_result_delta",
            Self::ToolResultComplete { .. } => "tool_result_complete",
            Self::DebugLine { .. } => "debug_line",
            Self::TurnComplete => "turn_complete",
            Self::TurnStopped => "turn_stopped",
            Self::TurnError { .. } => "turn_error",
        }
    }

    /// Whether this event ends the turn
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::TurnComplete | Self::TurnStopped | Self::TurnError { .. }
        )
    }
}

/// Event addressed to one session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionEvent {
    pub session_id: String,
    #[serde(flatten)]
    pub event: StreamEvent,
}

impl SessionEvent {
    pub fn new(session_id: impl Into<String>, event: StreamEvent) -> Self {
        Self {
            session_id: session_id.into(),
            event,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_format() {
        let event: StreamEvent =
            serde_json::from_str(r#"{"type": "block_stop", "index": 3}"#).unwrap();
        assert_eq!(
            event,
            StreamEvent::BlockStop {
                index: 3,
                tool_id: None
            }
        );

        let event: StreamEvent = serde_json::from_str(
            r#"{"type": "tool_result_complete", "tool_id": "toolu_1", "content": "ok"}"#,
        )
        .unwrap();
        assert_eq!(
            event,
            StreamEvent::ToolResultComplete {
                tool_id: "toolu_1".to_string(),
                content: "ok".to_string(),
                is_error: None,
            }
        );

        let json = serde_json::to_string(&StreamEvent::TurnComplete).unwrap();
        assert_eq!(json, r#"{"type":"turn_complete"}"#);
    }

    #[test]
    fn test_session_event_is_flat() {
        let event: SessionEvent = serde_json::from_str(
            r#"{"session_id": "s1", "type": "thinking_delta", "index": 0, "delta": "hm"}"#,
        )
        .unwrap();
        assert_eq!(event.session_id, "s1");
        assert_eq!(
            event.event,
            StreamEvent::ThinkingDelta {
                index: 0,
                delta: "hm".to_string()
            }
        );
    }

    #[test]
    fn test_terminal_events() {
        assert!(StreamEvent::TurnComplete.is_terminal());
        assert!(StreamEvent::TurnStopped.is_terminal());
        assert!(StreamEvent::TurnError {
            message: "boom".to_string()
        }
        .is_terminal());
        assert!(!StreamEvent::DebugLine {
            text: "x".to_string()
        }
        .is_terminal());
        assert_eq!(StreamEvent::TurnStopped.kind(), "turn_stopped");
    }
}
