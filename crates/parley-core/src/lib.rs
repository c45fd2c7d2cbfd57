//! Parley Core Library
//!
//! Streaming transcript reconciliation for agent chat clients:
//! - `partial_json` - best-effort values from incomplete JSON text
//! - `transcript` - messages and content blocks as plain records
//! - `events` - provider events driving a transcript
//! - `reconciler` - per-session state machine applying events
//! - `router` - async fan-in of session events, snapshot publishing, persistence
//! - `persist` - transcript stores
//! - `config` - reconciler settings

pub mod config;
pub mod error;
pub mod events;
pub mod partial_json;
pub mod persist;
pub mod reconciler;
pub mod router;
pub mod transcript;

pub use config::{NewTurnPolicy, ReconcilerConfig};
pub use error::{ConfigError, ReconcileError, RouterError};
pub use events::{SessionEvent, StreamEvent};
pub use partial_json::parse_partial;
pub use persist::{JsonFileStore, NullStore, TranscriptStore};
pub use reconciler::Reconciler;
pub use router::{spawn_router, RouterHandle};
pub use transcript::{
    ContentBlock, Message, MessageContent, Role, ThinkingBlock, ToolInvocation, Transcript,
};
