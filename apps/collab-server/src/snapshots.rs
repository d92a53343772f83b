/// JSON snapshots of sessions on disk, written when the engine announces a save point
use collab_engine::{CollaborationEngine, LifecycleEvent, SessionId};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    fn path(&self, session_id: SessionId) -> PathBuf {
        self.dir.join(format!("session_{session_id}.json"))
    }

    /// Write atomically: temp file, then rename
    pub async fn save(&self, session_id: SessionId, json: &str) -> anyhow::Result<PathBuf> {
        fs::create_dir_all(&self.dir).await?;

        let path = self.path(session_id);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json).await?;
        fs::rename(&tmp, &path).await?;
        Ok(path)
    }

    pub async fn remove(&self, session_id: SessionId) -> anyhow::Result<()> {
        let path = self.path(session_id);
        if fs::try_exists(&path).await? {
            fs::remove_file(&path).await?;
        }
        Ok(())
    }

    async fn persist(&self, engine: &CollaborationEngine, session_id: SessionId) {
        let json = match engine.export_session(session_id).await {
            Ok(json) => json,
            Err(e) => {
                warn!(session_id = %session_id, "skipping snapshot: {}", e);
                return;
            }
        };
        match self.save(session_id, &json).await {
            Ok(path) => debug!(session_id = %session_id, path = %path.display(), "snapshot written"),
            Err(e) => error!(session_id = %session_id, "failed to write snapshot: {}", e),
        }
    }

    /// Snapshot every session in the registry
    pub async fn save_all(&self, engine: &CollaborationEngine) {
        for summary in engine.list_sessions().await {
            self.persist(engine, summary.id).await;
        }
    }

    /// Import every snapshot in the directory. Unreadable files are skipped.
    pub async fn load_all(&self, engine: &CollaborationEngine) -> anyhow::Result<usize> {
        if !fs::try_exists(&self.dir).await? {
            return Ok(0);
        }

        let mut loaded = 0;
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }

            let json = match fs::read_to_string(&path).await {
                Ok(json) => json,
                Err(e) => {
                    warn!(path = %path.display(), "failed to read snapshot: {}", e);
                    continue;
                }
            };
            match engine.import_session(&json).await {
                Ok(_) => loaded += 1,
                Err(e) => warn!(path = %path.display(), "failed to import snapshot: {}", e),
            }
        }

        Ok(loaded)
    }
}

/// Persist sessions on `AutoSaved` and `SessionClosed`, delete them on `SessionRemoved`
pub fn spawn_writer(
    engine: Arc<CollaborationEngine>,
    store: SnapshotStore,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    let mut events = engine.subscribe_events();

    tokio::spawn(async move {
        info!(dir = %store.dir.display(), "snapshot writer started");
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.recv() => event,
            };

            match event {
                Ok(LifecycleEvent::AutoSaved { session_id, .. })
                | Ok(LifecycleEvent::SessionClosed { session_id, .. }) => {
                    store.persist(&engine, session_id).await;
                }
                Ok(LifecycleEvent::SessionRemoved { session_id }) => {
                    if let Err(e) = store.remove(session_id).await {
                        error!(session_id = %session_id, "failed to remove snapshot: {}", e);
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "snapshot writer fell behind");
                }
                Err(RecvError::Closed) => break,
            }
        }
        info!("snapshot writer stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use collab_engine::{EngineConfig, Operation, Position, SessionConfig, UserIdentity};

    #[tokio::test]
    async fn test_save_and_restore() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());

        let engine = CollaborationEngine::new(EngineConfig::default());
        let owner = UserIdentity::new("Olivia", "olivia@example.com");
        let owner_id = owner.id;
        let session = engine
            .create_session("persisted", None, SessionConfig::default(), owner)
            .await
            .unwrap();
        engine
            .add_file(session.id, owner_id, "a.txt", "")
            .await
            .unwrap();
        engine
            .apply_operation(
                session.id,
                Operation::insert(owner_id, "a.txt", Position::new(0, 0), "saved"),
            )
            .await
            .unwrap();

        store.save_all(&engine).await;
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();
        std::fs::write(dir.path().join("broken.json"), "{").unwrap();

        let restored = CollaborationEngine::new(EngineConfig::default());
        assert_eq!(store.load_all(&restored).await.unwrap(), 1);
        let copy = restored.session(session.id).await.unwrap();
        assert_eq!(copy.files["a.txt"].content, "saved");
    }

    #[tokio::test]
    async fn test_writer_follows_auto_save() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        let engine = Arc::new(CollaborationEngine::new(EngineConfig::default()));
        let shutdown = CancellationToken::new();
        let writer = spawn_writer(engine.clone(), store.clone(), shutdown.clone());

        let session = engine
            .create_session(
                "auto",
                None,
                SessionConfig::default(),
                UserIdentity::new("a", "a@example.com"),
            )
            .await
            .unwrap();
        engine.auto_save().await;

        let path = store.path(session.id);
        let written = tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while !path.exists() {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(written.is_ok());

        shutdown.cancel();
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_directory_loads_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("absent"));
        let engine = CollaborationEngine::new(EngineConfig::default());
        assert_eq!(store.load_all(&engine).await.unwrap(), 0);
    }
}
