//! `parley replay` - drive a reconciler from a recorded event log

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use parley_core::{
    JsonFileStore, Reconciler, ReconcilerConfig, StreamEvent, Transcript, TranscriptStore,
};
use tracing::{debug, info};

pub struct ReplayOptions {
    pub prompt: Option<String>,
    pub save_dir: Option<PathBuf>,
    pub session: Option<String>,
}

/// Parse a JSONL event log; blank lines are skipped
pub fn parse_events(content: &str) -> Result<Vec<StreamEvent>> {
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            serde_json::from_str(line).with_context(|| format!("Invalid event on line {}", i + 1))
        })
        .collect()
}

/// Apply every event in order and return the final transcript
pub fn reconcile(
    events: Vec<StreamEvent>,
    config: ReconcilerConfig,
    prompt: Option<&str>,
) -> Result<Transcript> {
    let mut reconciler = Reconciler::new(config);
    if let Some(prompt) = prompt {
        reconciler.begin_user_turn(prompt, Utc::now())?;
    }

    let total = events.len();
    let mut changed = 0usize;
    for event in events {
        debug!("Replaying {}", event.kind());
        if reconciler.apply(event) {
            changed += 1;
        }
    }
    info!("Replayed {} events ({} changed the transcript)", total, changed);

    if reconciler.is_streaming() {
        debug!("Event log ended mid-turn; transcript left open");
    }
    Ok(reconciler.into_transcript())
}

pub async fn run(
    path: &Path,
    config: ReconcilerConfig,
    options: &ReplayOptions,
) -> Result<Transcript> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read event log {:?}", path))?;
    let events = parse_events(&content).with_context(|| format!("In {:?}", path))?;
    let transcript = reconcile(events, config, options.prompt.as_deref())?;

    if let Some(dir) = &options.save_dir {
        let session_id = match &options.session {
            Some(id) => id.clone(),
            None => path
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_else(|| "replay".to_string()),
        };
        JsonFileStore::new(dir).save(&session_id, &transcript).await?;
    }

    Ok(transcript)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::ContentBlock;

    const LOG: &str = r#"
{"type": "thinking_start", "index": 0}
{"type": "thinking_delta", "index": 0, "delta": "check the dir"}
{"type": "block_stop", "index": 0}

{"type": "tool_start", "id": "toolu_1", "name": "bash", "index": 1}
{"type": "tool_argument_delta", "tool_id": "toolu_1", "delta": "{\"command\": \"l"}
{"type": "tool_argument_delta", "tool_id": "toolu_1", "delta": "s\"}"}
{"type": "block_stop", "index": 1, "tool_id": "toolu_1"}
{"type": "text_delta", "chunk": "Done."}
{"type": "turn_complete"}
"#;

    #[test]
    fn test_parse_events_skips_blank_lines() {
        let events = parse_events(LOG).unwrap();
        assert_eq!(events.len(), 9);
        assert!(events[8].is_terminal());
    }

    #[test]
    fn test_parse_events_reports_line_number() {
        let err = parse_events("{\"type\": \"turn_complete\"}\n\n{\"type\": \"nope\"}\n")
            .unwrap_err();
        assert!(err.to_string().contains("line 3"));
    }

    #[test]
    fn test_reconcile_builds_transcript() {
        let events = parse_events(LOG).unwrap();
        let transcript = reconcile(events, ReconcilerConfig::default(), Some("list files")).unwrap();

        assert_eq!(transcript.len(), 2);
        let blocks = transcript.get(1).unwrap().blocks();
        assert_eq!(blocks.len(), 3);
        match &blocks[1] {
            ContentBlock::ToolUse { tool } => {
                assert!(tool.is_complete);
                assert_eq!(
                    tool.parsed_arguments,
                    Some(serde_json::json!({"command": "ls"}))
                );
            }
            other => panic!("expected tool block, got {:?}", other),
        }
        assert!(blocks.iter().all(|b| !b.is_open()));
    }

    #[tokio::test]
    async fn test_run_saves_under_file_stem() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("session-7.jsonl");
        std::fs::write(&log, LOG).unwrap();
        let options = ReplayOptions {
            prompt: None,
            save_dir: Some(dir.path().join("out")),
            session: None,
        };

        let transcript = run(&log, ReconcilerConfig::default(), &options).await.unwrap();

        let saved = JsonFileStore::new(dir.path().join("out"))
            .load("session-7")
            .await
            .unwrap();
        assert_eq!(saved, Some(transcript));
    }
}
