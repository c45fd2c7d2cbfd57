//! Session event router
//!
//! Single task that owns one `Reconciler` per session. Events are applied in
//! channel order; after every change the new snapshot is published on a
//! `watch` channel for renderers, and each terminal event hands the finished
//! transcript to the store.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ReconcilerConfig;
use crate::error::{ReconcileError, RouterError};
use crate::events::SessionEvent;
use crate::persist::TranscriptStore;
use crate::reconciler::Reconciler;
use crate::transcript::Transcript;

enum RouterCommand {
    Event(SessionEvent),
    UserTurn {
        session_id: String,
        text: String,
        reply: oneshot::Sender<Result<(), ReconcileError>>,
    },
    Subscribe {
        session_id: String,
        reply: oneshot::Sender<watch::Receiver<Transcript>>,
    },
    CloseSession {
        session_id: String,
        reply: oneshot::Sender<bool>,
    },
}

/// Client side of a running router
pub struct RouterHandle {
    tx: mpsc::UnboundedSender<RouterCommand>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Spawn the router task on the current tokio runtime
pub fn spawn_router(config: ReconcilerConfig, store: Arc<dyn TranscriptStore>) -> RouterHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    let router = Router {
        config,
        store,
        sessions: HashMap::new(),
    };
    let task = tokio::spawn(router.run(rx, cancel.child_token()));
    info!("Event router started");
    RouterHandle { tx, cancel, task }
}

impl RouterHandle {
    /// Queue an event; delivery order per session is preserved
    pub fn send(&self, event: SessionEvent) -> Result<(), RouterError> {
        self.tx
            .send(RouterCommand::Event(event))
            .map_err(|_| RouterError::Closed)
    }

    /// Append a user message to a session
    pub async fn begin_user_turn(
        &self,
        session_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Result<(), RouterError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RouterCommand::UserTurn {
                session_id: session_id.into(),
                text: text.into(),
                reply,
            })
            .map_err(|_| RouterError::Closed)?;
        rx.await.map_err(|_| RouterError::Closed)??;
        Ok(())
    }

    /// Snapshots of a session's transcript, starting with the current one
    pub async fn subscribe(
        &self,
        session_id: impl Into<String>,
    ) -> Result<watch::Receiver<Transcript>, RouterError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RouterCommand::Subscribe {
                session_id: session_id.into(),
                reply,
            })
            .map_err(|_| RouterError::Closed)?;
        rx.await.map_err(|_| RouterError::Closed)
    }

    /// Drop a session's state. A turn still streaming is stopped and persisted
    /// first. Subscribers see their channel close. Returns whether the session
    /// existed.
    pub async fn close_session(
        &self,
        session_id: impl Into<String>,
    ) -> Result<bool, RouterError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RouterCommand::CloseSession {
                session_id: session_id.into(),
                reply,
            })
            .map_err(|_| RouterError::Closed)?;
        rx.await.map_err(|_| RouterError::Closed)
    }

    /// Stop the router after the commands already queued
    pub async fn shutdown(self) {
        drop(self.tx);
        if let Err(e) = self.task.await {
            warn!("Event router task ended abnormally: {}", e);
        }
    }

    /// Stop the router immediately, dropping queued commands
    pub async fn abort(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!("Event router task ended abnormally: {}", e);
        }
    }
}

struct Session {
    reconciler: Reconciler,
    publisher: watch::Sender<Transcript>,
}

impl Session {
    fn new(config: ReconcilerConfig) -> Self {
        let (publisher, _) = watch::channel(Transcript::new());
        Self {
            reconciler: Reconciler::new(config),
            publisher,
        }
    }

    fn publish(&self) {
        self.publisher.send_replace(self.reconciler.snapshot());
    }
}

struct Router {
    config: ReconcilerConfig,
    store: Arc<dyn TranscriptStore>,
    sessions: HashMap<String, Session>,
}

impl Router {
    async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<RouterCommand>,
        cancel: CancellationToken,
    ) {
        loop {
            let command = tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Event router cancelled");
                    break;
                }
                command = rx.recv() => command,
            };
            let Some(command) = command else {
                info!("Event router channel closed");
                break;
            };

            match command {
                RouterCommand::Event(event) => self.handle_event(event).await,
                RouterCommand::UserTurn {
                    session_id,
                    text,
                    reply,
                } => {
                    let session = self.session(&session_id);
                    let result = session
                        .reconciler
                        .begin_user_turn(text, chrono::Utc::now());
                    if result.is_ok() {
                        session.publish();
                    }
                    let _ = reply.send(result);
                }
                RouterCommand::Subscribe { session_id, reply } => {
                    let receiver = self.session(&session_id).publisher.subscribe();
                    let _ = reply.send(receiver);
                }
                RouterCommand::CloseSession { session_id, reply } => {
                    let existed = self.close_session(&session_id).await;
                    let _ = reply.send(existed);
                }
            }
        }
        debug!("Event router exiting with {} sessions", self.sessions.len());
    }

    fn session(&mut self, session_id: &str) -> &mut Session {
        let config = &self.config;
        self.sessions
            .entry(session_id.to_string())
            .or_insert_with(|| {
                debug!("New session {}", session_id);
                Session::new(config.clone())
            })
    }

    async fn handle_event(&mut self, SessionEvent { session_id, event }: SessionEvent) {
        let terminal = event.is_terminal();
        let session = self.session(&session_id);
        if session.reconciler.apply(event) {
            session.publish();
        }

        if terminal {
            let finished = session.reconciler.snapshot();
            self.persist(&session_id, &finished).await;
        }
    }

    async fn close_session(&mut self, session_id: &str) -> bool {
        let Some(mut session) = self.sessions.remove(session_id) else {
            debug!("Close requested for unknown session {}", session_id);
            return false;
        };
        if session.reconciler.is_streaming() {
            session.reconciler.on_stopped(chrono::Utc::now());
            session.publish();
            let stopped = session.reconciler.snapshot();
            self.persist(session_id, &stopped).await;
        }
        info!("Closed session {}", session_id);
        true
    }

    async fn persist(&self, session_id: &str, transcript: &Transcript) {
        if let Err(e) = self.store.save(session_id, transcript).await {
            warn!("Failed to persist session {}: {:#}", session_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::StreamEvent;
    use crate::persist::{JsonFileStore, NullStore};
    use crate::transcript::ContentBlock;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingStore {
        saved: Mutex<Vec<(String, Transcript)>>,
    }

    #[async_trait]
    impl TranscriptStore for RecordingStore {
        async fn save(&self, session_id: &str, transcript: &Transcript) -> Result<()> {
            self.saved
                .lock()
                .unwrap()
                .push((session_id.to_string(), transcript.clone()));
            Ok(())
        }
    }

    fn text(session: &str, chunk: &str) -> SessionEvent {
        SessionEvent::new(
            session,
            StreamEvent::TextDelta {
                chunk: chunk.to_string(),
            },
        )
    }

    #[tokio::test]
    async fn test_sessions_are_isolated() {
        let store = Arc::new(RecordingStore::default());
        let router = spawn_router(ReconcilerConfig::default(), store.clone());

        router.send(text("a", "alpha")).unwrap();
        router.send(text("b", "beta")).unwrap();
        router.send(text("a", " one")).unwrap();
        router
            .send(SessionEvent::new("a", StreamEvent::TurnComplete))
            .unwrap();

        let a = router.subscribe("a").await.unwrap();
        let b = router.subscribe("b").await.unwrap();
        assert_eq!(
            a.borrow().last().map(|m| m.plain_text()).as_deref(),
            Some("alpha one")
        );
        assert_eq!(
            b.borrow().last().map(|m| m.plain_text()).as_deref(),
            Some("beta")
        );

        router.shutdown().await;

        let saved = store.saved.lock().unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].0, "a");
        assert_eq!(saved[0].1.len(), 1);
    }

    #[tokio::test]
    async fn test_subscribers_see_updates() {
        let router = spawn_router(ReconcilerConfig::default(), Arc::new(NullStore));
        let mut rx = router.subscribe("s").await.unwrap();
        assert!(rx.borrow().is_empty());

        router
            .send(SessionEvent::new("s", StreamEvent::ThinkingStart { index: 0 }))
            .unwrap();
        rx.changed().await.unwrap();
        let snapshot = rx.borrow_and_update().clone();
        assert!(matches!(
            snapshot.last().map(|m| m.blocks().to_vec()).as_deref(),
            Some([ContentBlock::Thinking(_)])
        ));

        router.shutdown().await;
    }

    #[tokio::test]
    async fn test_user_turn_rejected_while_streaming() {
        let router = spawn_router(ReconcilerConfig::default(), Arc::new(NullStore));
        router.begin_user_turn("s", "hello").await.unwrap();
        router.send(text("s", "hi")).unwrap();

        let err = router.begin_user_turn("s", "again").await.unwrap_err();
        assert!(matches!(
            err,
            RouterError::Reconcile(ReconcileError::TurnInProgress { .. })
        ));

        router
            .send(SessionEvent::new("s", StreamEvent::TurnComplete))
            .unwrap();
        router.begin_user_turn("s", "again").await.unwrap();
        let rx = router.subscribe("s").await.unwrap();
        assert_eq!(rx.borrow().len(), 3);

        router.shutdown().await;
    }

    #[tokio::test]
    async fn test_terminal_events_persist_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(JsonFileStore::new(dir.path()));
        let router = spawn_router(ReconcilerConfig::default(), store.clone());

        router.send(text("disk", "saved")).unwrap();
        router
            .send(SessionEvent::new(
                "disk",
                StreamEvent::TurnError {
                    message: "boom".to_string(),
                },
            ))
            .unwrap();
        router.shutdown().await;

        let loaded = store.load("disk").await.unwrap().unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(
            loaded.last().map(|m| m.plain_text()).as_deref(),
            Some("boom")
        );
    }

    #[tokio::test]
    async fn test_send_after_abort_fails() {
        let router = spawn_router(ReconcilerConfig::default(), Arc::new(NullStore));
        let tx = router.tx.clone();
        router.abort().await;
        assert!(tx.send(RouterCommand::Event(text("s", "x"))).is_err());
    }

    #[tokio::test]
    async fn test_close_session_releases_state() {
        let store = Arc::new(RecordingStore::default());
        let router = spawn_router(ReconcilerConfig::default(), store.clone());

        router.send(text("a", "done")).unwrap();
        router
            .send(SessionEvent::new("a", StreamEvent::TurnComplete))
            .unwrap();
        let mut rx = router.subscribe("a").await.unwrap();

        assert!(router.close_session("a").await.unwrap());
        assert!(rx.changed().await.is_err());
        assert!(!router.close_session("a").await.unwrap());
        assert!(!router.close_session("never-seen").await.unwrap());

        // A later subscribe starts a fresh session
        let fresh = router.subscribe("a").await.unwrap();
        assert!(fresh.borrow().is_empty());

        router.shutdown().await;
        assert_eq!(store.saved.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_close_session_stops_and_persists_open_turn() {
        let store = Arc::new(RecordingStore::default());
        let router = spawn_router(ReconcilerConfig::default(), store.clone());

        router
            .send(SessionEvent::new("s", StreamEvent::ThinkingStart { index: 0 }))
            .unwrap();
        assert!(router.close_session("s").await.unwrap());
        router.shutdown().await;

        let saved = store.saved.lock().unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].0, "s");
        let blocks = saved[0].1.last().map(|m| m.blocks().to_vec());
        assert!(matches!(
            blocks.as_deref(),
            Some([ContentBlock::Thinking(thinking)]) if thinking.is_complete
        ));
    }
}
