//! Transcript persistence
//!
//! The router hands every finished turn to a `TranscriptStore`. Stores own
//! their I/O; the reconciler never touches disk.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::fs;
use tracing::{debug, info};

use crate::transcript::Transcript;

/// Receives finished transcripts for storage
#[async_trait]
pub trait TranscriptStore: Send + Sync {
    async fn save(&self, session_id: &str, transcript: &Transcript) -> Result<()>;
}

/// Store that keeps nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NullStore;

#[async_trait]
impl TranscriptStore for NullStore {
    async fn save(&self, session_id: &str, _transcript: &Transcript) -> Result<()> {
        debug!("NullStore: discarding transcript for session {}", session_id);
        Ok(())
    }
}

/// One pretty-printed JSON file per session
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File for a session. ASCII letters, digits and `-` are kept; every
    /// other byte becomes `_xx` (lowercase hex), so distinct ids never share
    /// a file. The empty id maps to `_`.
    pub fn path_for(&self, session_id: &str) -> PathBuf {
        let mut file_stem = String::with_capacity(session_id.len());
        for byte in session_id.bytes() {
            if byte.is_ascii_alphanumeric() || byte == b'-' {
                file_stem.push(char::from(byte));
            } else {
                file_stem.push_str(&format!("_{:02x}", byte));
            }
        }
        if file_stem.is_empty() {
            file_stem.push('_');
        }
        self.dir.join(format!("{}.json", file_stem))
    }

    /// Read a stored transcript back, `None` if the session was never saved
    pub async fn load(&self, session_id: &str) -> Result<Option<Transcript>> {
        let path = self.path_for(session_id);
        let exists = fs::try_exists(&path)
            .await
            .with_context(|| format!("Failed to check for transcript {:?}", path))?;
        if !exists {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read transcript {:?}", path))?;
        let transcript = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse transcript {:?}", path))?;
        Ok(Some(transcript))
    }
}

#[async_trait]
impl TranscriptStore for JsonFileStore {
    async fn save(&self, session_id: &str, transcript: &Transcript) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create store directory {:?}", self.dir))?;

        let path = self.path_for(session_id);
        let tmp_path = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(transcript)
            .context("Failed to serialize transcript")?;

        // Write-then-rename so readers never see a torn file
        fs::write(&tmp_path, json)
            .await
            .with_context(|| format!("Failed to write {:?}", tmp_path))?;
        fs::rename(&tmp_path, &path)
            .await
            .with_context(|| format!("Failed to move transcript into place at {:?}", path))?;

        info!(
            "Saved transcript for session {} ({} messages) to {:?}",
            session_id,
            transcript.len(),
            path
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::StreamEvent;
    use crate::reconciler::Reconciler;
    use crate::transcript::Message;

    fn sample_transcript() -> Transcript {
        let mut reconciler = Reconciler::default();
        reconciler.begin_user_turn("list files", chrono::Utc::now()).unwrap();
        for event in [
            StreamEvent::ThinkingStart { index: 0 },
            StreamEvent::ThinkingDelta {
                index: 0,
                delta: "use ls".to_string(),
            },
            StreamEvent::BlockStop {
                index: 0,
                tool_id: None,
            },
            StreamEvent::ToolStart {
                id: "toolu_1".to_string(),
                name: "bash".to_string(),
                index: 1,
            },
            StreamEvent::ToolArgumentDelta {
                tool_id: "toolu_1".to_string(),
                delta: r#"{"command": "ls"}"#.to_string(),
            },
            StreamEvent::BlockStop {
                index: 1,
                tool_id: None,
            },
            StreamEvent::TextDelta {
                chunk: "Here you go.".to_string(),
            },
            StreamEvent::TurnComplete,
        ] {
            reconciler.apply(event);
        }
        reconciler.into_transcript()
    }

    #[tokio::test]
    async fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("transcripts"));
        let transcript = sample_transcript();

        store.save("session-1", &transcript).await.unwrap();
        let loaded = store.load("session-1").await.unwrap();

        assert_eq!(loaded, Some(transcript));
        assert!(!store.path_for("session-1").with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_load_missing_session() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());
        assert_eq!(store.load("nobody").await.unwrap(), None);
    }

    #[test]
    fn test_session_ids_are_escaped() {
        let store = JsonFileStore::new("/tmp/parley");
        assert_eq!(
            store.path_for("../etc/passwd"),
            PathBuf::from("/tmp/parley/_2e_2e_2fetc_2fpasswd.json")
        );
        assert_eq!(
            store.path_for("session-1"),
            PathBuf::from("/tmp/parley/session-1.json")
        );
        assert_eq!(store.path_for(""), PathBuf::from("/tmp/parley/_.json"));
        assert_eq!(store.path_for("é"), PathBuf::from("/tmp/parley/_c3_a9.json"));
    }

    #[test]
    fn test_similar_session_ids_get_distinct_files() {
        let store = JsonFileStore::new("/tmp/parley");
        let ids = ["a/b", "a.b", "a_b", "a_2fb", "a b", ""];
        let paths: std::collections::HashSet<_> =
            ids.iter().map(|id| store.path_for(id)).collect();
        assert_eq!(paths.len(), ids.len());
    }

    #[tokio::test]
    async fn test_similar_session_ids_do_not_overwrite_each_other() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());
        let now = chrono::Utc::now();

        let mut slash = Transcript::new();
        slash.push(Message::assistant_text("from a/b", now));
        let mut underscore = Transcript::new();
        underscore.push(Message::assistant_text("from a_b", now));

        store.save("a/b", &slash).await.unwrap();
        store.save("a_b", &underscore).await.unwrap();

        assert_eq!(store.load("a/b").await.unwrap(), Some(slash));
        assert_eq!(store.load("a_b").await.unwrap(), Some(underscore));
        assert_eq!(store.load("a.b").await.unwrap(), None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_load_reports_unreadable_directory() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let locked = dir.path().join("locked");
        std::fs::create_dir(&locked).unwrap();
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o000)).unwrap();
        let store = JsonFileStore::new(&locked);

        // Root ignores permission bits, so only assert when access is really denied
        let denied = std::fs::metadata(locked.join("s.json"))
            .err()
            .is_some_and(|e| e.kind() == std::io::ErrorKind::PermissionDenied);
        let result = store.load("s").await;
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o755)).unwrap();

        if denied {
            assert!(result.is_err());
        } else {
            assert_eq!(result.unwrap(), None);
        }
    }
}
