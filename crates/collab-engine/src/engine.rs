//! Engine facade: session registry, serialized per-session mutation, fan-out and events.
//!
//! Each session sits behind its own mutex. Every call locks it, mutates, releases,
//! and only then broadcasts, so a slow connection never holds up a session.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::{
    AppliedOperation, BroadcastMessage, Broadcaster, Clock, CloseReason, CollaborationError,
    Comment, CommentId, Conflict, ConflictId, CursorPosition, EngineConfig, File,
    LifecycleEvent, MessageType, NewComment, Operation, Outbound, Position, ResolutionStrategy,
    Result, Role, Selection, Session, SessionConfig, SessionId, SessionSummary, SystemClock,
    User, UserId, UserIdentity,
};

pub type SessionHandle = Arc<Mutex<Session>>;

/// Outcome of one sweep pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepReport {
    /// Sessions closed for inactivity
    pub closed: Vec<SessionId>,
    /// Inactive sessions dropped after their retention period
    pub removed: Vec<SessionId>,
    pub expired_locks: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.closed.is_empty() && self.removed.is_empty() && self.expired_locks == 0
    }
}

/// Full registry export
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrySnapshot {
    pub exported_at: DateTime<Utc>,
    pub sessions: Vec<Session>,
}

pub struct CollaborationEngine {
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    sessions: RwLock<HashMap<SessionId, SessionHandle>>,
    broadcaster: Broadcaster,
    events: broadcast::Sender<LifecycleEvent>,
}

impl CollaborationEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: EngineConfig, clock: Arc<dyn Clock>) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            config,
            clock,
            sessions: RwLock::new(HashMap::new()),
            broadcaster: Broadcaster::new(),
            events,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Lifecycle events from now on. Slow subscribers lose the oldest events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: LifecycleEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn broadcast<T: Serialize + ?Sized>(
        &self,
        session_id: SessionId,
        kind: MessageType,
        user_id: Option<UserId>,
        data: &T,
        exclude: Option<UserId>,
    ) {
        match serde_json::to_value(data) {
            Ok(data) => {
                self.broadcaster
                    .broadcast(session_id, kind, user_id, data, self.now(), exclude);
            }
            Err(e) => warn!(session_id = %session_id, "failed to encode broadcast: {}", e),
        }
    }

    async fn handle(&self, session_id: SessionId) -> Result<SessionHandle> {
        self.sessions
            .read()
            .await
            .get(&session_id)
            .cloned()
            .ok_or(CollaborationError::SessionNotFound(session_id))
    }

    async fn handles(&self) -> Vec<SessionHandle> {
        self.sessions.read().await.values().cloned().collect()
    }

    pub async fn create_session(
        &self,
        name: &str,
        description: Option<String>,
        config: SessionConfig,
        creator: UserIdentity,
    ) -> Result<Session> {
        config.validate()?;
        let owner = creator.id;
        let session = Session::new(name, description, config, creator, self.now());
        let snapshot = session.clone();

        self.sessions
            .write()
            .await
            .insert(session.id, Arc::new(Mutex::new(session)));

        info!(session_id = %snapshot.id, user_id = %owner, "session created: {}", snapshot.name);
        self.emit(LifecycleEvent::SessionCreated {
            session_id: snapshot.id,
            name: snapshot.name.clone(),
            owner,
        });
        Ok(snapshot)
    }

    /// Join a session. Joining again refreshes presence and keeps the original role.
    pub async fn join_session(
        &self,
        session_id: SessionId,
        identity: UserIdentity,
        role: Role,
    ) -> Result<User> {
        let handle = self.handle(session_id).await?;
        let (user, is_new) = handle.lock().await.join(identity, role, self.now())?;

        if is_new {
            info!(session_id = %session_id, user_id = %user.id, role = %user.role, "user joined");
            self.broadcast(
                session_id,
                MessageType::User,
                Some(user.id),
                &json!({ "event": "joined", "user": user }),
                Some(user.id),
            );
            self.emit(LifecycleEvent::UserJoined {
                session_id,
                user_id: user.id,
                role: user.role,
            });
        }
        Ok(user)
    }

    /// Attach an outbound queue for a member of the session
    pub async fn attach(&self, session_id: SessionId, user_id: UserId, tx: Outbound) -> Result<()> {
        let handle = self.handle(session_id).await?;
        {
            let session = handle.lock().await;
            if !session.is_active {
                return Err(CollaborationError::SessionInactive(session_id));
            }
            session.user(user_id)?;
        }
        self.broadcaster.connect(session_id, user_id, tx);
        Ok(())
    }

    /// Attach a fresh queue and hand back its receiving end
    pub async fn connect(
        &self,
        session_id: SessionId,
        user_id: UserId,
    ) -> Result<mpsc::UnboundedReceiver<BroadcastMessage>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.attach(session_id, user_id, tx).await?;
        Ok(rx)
    }

    /// Drop the user's queue without leaving the session
    pub fn detach(&self, session_id: SessionId, user_id: UserId) -> bool {
        self.broadcaster.disconnect(session_id, user_id)
    }

    pub async fn leave_session(&self, session_id: SessionId, user_id: UserId) -> Result<()> {
        let handle = self.handle(session_id).await?;
        let departure = handle.lock().await.leave(user_id, self.now())?;

        self.broadcaster.disconnect(session_id, user_id);
        info!(session_id = %session_id, user_id = %user_id, "user left");
        self.broadcast(
            session_id,
            MessageType::User,
            Some(user_id),
            &json!({
                "event": "left",
                "userId": user_id,
                "releasedLocks": departure.released_locks,
            }),
            None,
        );
        self.emit(LifecycleEvent::UserLeft {
            session_id,
            user_id,
        });

        if departure.closed {
            self.session_closed(session_id, CloseReason::NoUsers);
        }
        Ok(())
    }

    fn session_closed(&self, session_id: SessionId, reason: CloseReason) {
        info!(session_id = %session_id, ?reason, "session closed");
        self.broadcast(
            session_id,
            MessageType::Sync,
            None,
            &json!({ "event": "session_closed", "reason": reason }),
            None,
        );
        self.broadcaster.disconnect_session(session_id);
        self.emit(LifecycleEvent::SessionClosed { session_id, reason });
    }

    /// Apply an operation and return the copy that was actually applied
    pub async fn apply_operation(&self, session_id: SessionId, op: Operation) -> Result<Operation> {
        let handle = self.handle(session_id).await?;
        let user_id = op.user_id;
        let result = handle
            .lock()
            .await
            .apply_operation(op, &self.config, self.now());
        let AppliedOperation {
            operation,
            conflicts,
        } = result.inspect_err(|e| {
            warn!(session_id = %session_id, user_id = %user_id, "operation rejected: {}", e)
        })?;

        self.broadcast(
            session_id,
            MessageType::Operation,
            Some(user_id),
            &operation,
            Some(user_id),
        );
        self.emit(LifecycleEvent::OperationApplied {
            session_id,
            operation_id: operation.id,
            user_id,
            file: operation.file.clone(),
            file_version: operation.file_version,
        });

        for conflict in &conflicts {
            info!(
                session_id = %session_id,
                conflict_id = %conflict.id,
                file = %conflict.file,
                auto_resolvable = conflict.auto_resolvable,
                "conflict detected"
            );
            self.broadcast(session_id, MessageType::Conflict, Some(user_id), conflict, None);
            self.emit(LifecycleEvent::ConflictDetected {
                session_id,
                conflict_id: conflict.id,
                file: conflict.file.clone(),
                auto_resolvable: conflict.auto_resolvable,
            });
            if let Some(resolution) = &conflict.resolution {
                self.emit(LifecycleEvent::ConflictResolved {
                    session_id,
                    conflict_id: conflict.id,
                    strategy: resolution.strategy,
                    resolved_by: None,
                });
            }
        }

        Ok(operation)
    }

    /// Resolve a conflict. `user_id = None` resolves on behalf of the system.
    pub async fn resolve_conflict(
        &self,
        session_id: SessionId,
        conflict_id: ConflictId,
        strategy: ResolutionStrategy,
        content: Option<String>,
        user_id: Option<UserId>,
    ) -> Result<Conflict> {
        let handle = self.handle(session_id).await?;
        let conflict = handle.lock().await.resolve_conflict(
            conflict_id,
            strategy,
            content.as_deref(),
            user_id,
            &self.config,
            self.now(),
        )?;

        info!(
            session_id = %session_id,
            conflict_id = %conflict_id,
            strategy = strategy.as_str(),
            "conflict resolved"
        );
        self.broadcast(session_id, MessageType::Conflict, user_id, &conflict, None);
        self.emit(LifecycleEvent::ConflictResolved {
            session_id,
            conflict_id,
            strategy,
            resolved_by: user_id,
        });
        Ok(conflict)
    }

    pub async fn add_file(
        &self,
        session_id: SessionId,
        user_id: UserId,
        path: &str,
        content: &str,
    ) -> Result<File> {
        let handle = self.handle(session_id).await?;
        let file = handle
            .lock()
            .await
            .add_file(user_id, path, content, self.now())?;

        debug!(session_id = %session_id, user_id = %user_id, file = %path, "file added");
        self.broadcast(
            session_id,
            MessageType::Sync,
            Some(user_id),
            &json!({ "event": "file_added", "file": file }),
            Some(user_id),
        );
        self.emit(LifecycleEvent::FileAdded {
            session_id,
            path: file.path.clone(),
        });
        Ok(file)
    }

    /// Lock a file for exclusive editing. `timeout` defaults to the engine's lock timeout
    /// and may not exceed `max_lock_timeout_secs`.
    pub async fn lock_file(
        &self,
        session_id: SessionId,
        user_id: UserId,
        path: &str,
        timeout: Option<chrono::Duration>,
    ) -> Result<File> {
        if let Some(timeout) = timeout {
            if timeout <= chrono::Duration::zero() || timeout > self.config.max_lock_timeout() {
                return Err(CollaborationError::Validation(format!(
                    "lock timeout must be between 1s and {}s",
                    self.config.max_lock_timeout_secs
                )));
            }
        }
        let handle = self.handle(session_id).await?;
        let timeout = timeout.unwrap_or_else(|| self.config.default_lock_timeout());
        let file = handle
            .lock()
            .await
            .lock_file(user_id, path, timeout, self.now())?;

        debug!(session_id = %session_id, user_id = %user_id, file = %path, "file locked");
        self.broadcast(
            session_id,
            MessageType::Sync,
            Some(user_id),
            &json!({
                "event": "file_locked",
                "file": path,
                "lockedBy": user_id,
                "lockTimeout": file.lock_timeout,
            }),
            None,
        );
        Ok(file)
    }

    pub async fn unlock_file(&self, session_id: SessionId, user_id: UserId, path: &str) -> Result<File> {
        let handle = self.handle(session_id).await?;
        let file = handle.lock().await.unlock_file(user_id, path, self.now())?;

        debug!(session_id = %session_id, user_id = %user_id, file = %path, "file unlocked");
        self.broadcast(
            session_id,
            MessageType::Sync,
            Some(user_id),
            &json!({ "event": "file_unlocked", "file": path }),
            None,
        );
        Ok(file)
    }

    pub async fn add_comment(
        &self,
        session_id: SessionId,
        user_id: UserId,
        comment: NewComment,
    ) -> Result<Comment> {
        let handle = self.handle(session_id).await?;
        let comment = handle
            .lock()
            .await
            .add_comment(user_id, comment, self.now())?;

        self.broadcast(session_id, MessageType::Comment, Some(user_id), &comment, None);
        self.emit(LifecycleEvent::CommentAdded {
            session_id,
            comment_id: comment.id,
            user_id,
        });
        Ok(comment)
    }

    pub async fn resolve_comment(
        &self,
        session_id: SessionId,
        user_id: UserId,
        comment_id: CommentId,
    ) -> Result<Comment> {
        let handle = self.handle(session_id).await?;
        let comment = handle
            .lock()
            .await
            .resolve_comment(user_id, comment_id, self.now())?;

        self.broadcast(session_id, MessageType::Comment, Some(user_id), &comment, None);
        Ok(comment)
    }

    pub async fn react_to_comment(
        &self,
        session_id: SessionId,
        user_id: UserId,
        comment_id: CommentId,
        emoji: &str,
    ) -> Result<Comment> {
        let handle = self.handle(session_id).await?;
        let comment = handle
            .lock()
            .await
            .react_to_comment(user_id, comment_id, emoji, self.now())?;

        self.broadcast(session_id, MessageType::Comment, Some(user_id), &comment, None);
        Ok(comment)
    }

    pub async fn update_cursor(
        &self,
        session_id: SessionId,
        user_id: UserId,
        file: &str,
        position: Position,
    ) -> Result<()> {
        let handle = self.handle(session_id).await?;
        let cursor = CursorPosition {
            file: file.to_string(),
            position,
        };
        handle
            .lock()
            .await
            .update_cursor(user_id, cursor.clone(), self.now())?;

        self.broadcast(
            session_id,
            MessageType::Cursor,
            Some(user_id),
            &cursor,
            Some(user_id),
        );
        Ok(())
    }

    pub async fn update_selection(
        &self,
        session_id: SessionId,
        user_id: UserId,
        file: &str,
        start: Position,
        end: Position,
    ) -> Result<()> {
        let handle = self.handle(session_id).await?;
        let selection = Selection {
            file: file.to_string(),
            start,
            end,
        };
        handle
            .lock()
            .await
            .update_selection(user_id, selection.clone(), self.now())?;

        self.broadcast(
            session_id,
            MessageType::Selection,
            Some(user_id),
            &selection,
            Some(user_id),
        );
        Ok(())
    }

    /// Snapshot of one session
    pub async fn session(&self, session_id: SessionId) -> Result<Session> {
        let handle = self.handle(session_id).await?;
        let session = handle.lock().await.clone();
        Ok(session)
    }

    pub async fn list_sessions(&self) -> Vec<SessionSummary> {
        let mut summaries = Vec::new();
        for handle in self.handles().await {
            summaries.push(handle.lock().await.summary());
        }
        summaries.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        summaries
    }

    /// Serialize one session graph
    pub async fn export_session(&self, session_id: SessionId) -> Result<String> {
        let session = self.session(session_id).await?;
        Ok(serde_json::to_string_pretty(&session)?)
    }

    /// Serialize the whole registry
    pub async fn export(&self) -> Result<String> {
        let mut sessions = Vec::new();
        for handle in self.handles().await {
            sessions.push(handle.lock().await.clone());
        }
        sessions.sort_by_key(|s| s.created_at);

        let snapshot = RegistrySnapshot {
            exported_at: self.now(),
            sessions,
        };
        Ok(serde_json::to_string_pretty(&snapshot)?)
    }

    /// Replace the whole registry with an [`export`](Self::export) document.
    /// Existing connections are dropped. Returns the number of sessions loaded.
    pub async fn import(&self, json: &str) -> Result<usize> {
        let snapshot: RegistrySnapshot = serde_json::from_str(json)?;
        let sessions: HashMap<SessionId, SessionHandle> = snapshot
            .sessions
            .into_iter()
            .map(|session| (session.id, Arc::new(Mutex::new(session))))
            .collect();
        let count = sessions.len();

        let previous = std::mem::replace(&mut *self.sessions.write().await, sessions);
        for session_id in previous.keys() {
            self.broadcaster.disconnect_session(*session_id);
        }

        info!(sessions = count, "registry imported");
        Ok(count)
    }

    /// Load a single [`export_session`](Self::export_session) document, replacing any
    /// session with the same id.
    pub async fn import_session(&self, json: &str) -> Result<SessionId> {
        let session: Session = serde_json::from_str(json)?;
        let session_id = session.id;

        let previous = self
            .sessions
            .write()
            .await
            .insert(session_id, Arc::new(Mutex::new(session)));
        if previous.is_some() {
            self.broadcaster.disconnect_session(session_id);
        }

        debug!(session_id = %session_id, "session imported");
        Ok(session_id)
    }

    /// Close idle sessions, clear expired locks and drop inactive sessions past retention
    pub async fn sweep(&self) -> SweepReport {
        let now = self.now();
        let idle_timeout = self.config.idle_timeout();
        let mut report = SweepReport::default();
        let mut released = Vec::new();

        for handle in self.handles().await {
            let mut session = handle.lock().await;
            let session_id = session.id;

            let expired = session.expire_locks(now);
            if session.is_idle(now, idle_timeout) {
                session.close(CloseReason::Inactivity, now);
                report.closed.push(session_id);
            }
            if !session.is_active && now - session.updated_at > session.config.retention_period() {
                report.removed.push(session_id);
            }
            drop(session);

            report.expired_locks += expired.len();
            released.extend(expired.into_iter().map(|path| (session_id, path)));
        }

        for (session_id, path) in released {
            debug!(session_id = %session_id, file = %path, "lock expired");
            self.broadcast(
                session_id,
                MessageType::Sync,
                None,
                &json!({ "event": "lock_expired", "file": path }),
                None,
            );
        }
        for session_id in &report.closed {
            self.session_closed(*session_id, CloseReason::Inactivity);
        }

        if !report.removed.is_empty() {
            let mut sessions = self.sessions.write().await;
            for session_id in &report.removed {
                sessions.remove(session_id);
                self.broadcaster.disconnect_session(*session_id);
                info!(session_id = %session_id, "session removed after retention period");
                self.emit(LifecycleEvent::SessionRemoved {
                    session_id: *session_id,
                });
            }
        }

        report
    }

    /// Mark sessions whose save interval has elapsed as saved and announce them
    pub async fn auto_save(&self) -> Vec<SessionId> {
        let now = self.now();
        let mut saved = Vec::new();

        for handle in self.handles().await {
            let mut session = handle.lock().await;
            if !session.is_active || !session.config.auto_save {
                continue;
            }
            let due = session
                .last_saved_at
                .map_or(true, |at| now - at >= session.config.save_interval());
            if !due {
                continue;
            }
            session.last_saved_at = Some(now);
            let (session_id, version) = (session.id, session.version);
            drop(session);

            debug!(session_id = %session_id, version, "auto-save");
            self.emit(LifecycleEvent::AutoSaved {
                session_id,
                version,
                saved_at: now,
            });
            saved.push(session_id);
        }

        saved
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ManualClock;
    use chrono::Duration;

    fn engine_with_clock() -> (CollaborationEngine, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let engine = CollaborationEngine::with_clock(EngineConfig::default(), clock.clone());
        (engine, clock)
    }

    #[tokio::test]
    async fn test_create_session_applies_defaults() {
        let (engine, _) = engine_with_clock();
        let owner = UserIdentity::new("Olivia", "olivia@example.com");
        let session = engine
            .create_session("Design doc", None, SessionConfig::default(), owner.clone())
            .await
            .unwrap();

        assert_eq!(session.config.max_users, 10);
        assert!(session.config.auto_save);
        assert_eq!(session.users[&owner.id].role, Role::Owner);
        assert_eq!(engine.list_sessions().await.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let (engine, _) = engine_with_clock();
        let err = engine
            .join_session(
                SessionId::new(),
                UserIdentity::new("a", "a@example.com"),
                Role::Editor,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CollaborationError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn test_sweep_closes_idle_sessions() {
        let (engine, clock) = engine_with_clock();
        let mut events = engine.subscribe_events();
        let session = engine
            .create_session(
                "idle",
                None,
                SessionConfig::default(),
                UserIdentity::new("a", "a@example.com"),
            )
            .await
            .unwrap();

        clock.advance(Duration::hours(23));
        assert!(engine.sweep().await.closed.is_empty());

        clock.advance(Duration::hours(2));
        let report = engine.sweep().await;
        assert_eq!(report.closed, vec![session.id]);
        assert!(!engine.session(session.id).await.unwrap().is_active);

        let mut closed = false;
        while let Ok(event) = events.try_recv() {
            if let LifecycleEvent::SessionClosed { reason, .. } = event {
                assert_eq!(reason, CloseReason::Inactivity);
                closed = true;
            }
        }
        assert!(closed);
    }

    #[tokio::test]
    async fn test_sweep_drops_sessions_after_retention() {
        let (engine, clock) = engine_with_clock();
        let owner = UserIdentity::new("a", "a@example.com");
        let owner_id = owner.id;
        let session = engine
            .create_session("short", None, SessionConfig::default(), owner)
            .await
            .unwrap();
        engine.leave_session(session.id, owner_id).await.unwrap();

        clock.advance(Duration::days(29));
        assert!(engine.sweep().await.removed.is_empty());

        clock.advance(Duration::days(2));
        assert_eq!(engine.sweep().await.removed, vec![session.id]);
        assert!(engine.session(session.id).await.is_err());
    }

    #[tokio::test]
    async fn test_auto_save_respects_interval() {
        let (engine, clock) = engine_with_clock();
        let mut events = engine.subscribe_events();
        let saving = engine
            .create_session(
                "saving",
                None,
                SessionConfig::default(),
                UserIdentity::new("a", "a@example.com"),
            )
            .await
            .unwrap();
        engine
            .create_session(
                "manual",
                None,
                SessionConfig {
                    auto_save: false,
                    ..SessionConfig::default()
                },
                UserIdentity::new("b", "b@example.com"),
            )
            .await
            .unwrap();

        assert_eq!(engine.auto_save().await, vec![saving.id]);
        clock.advance(Duration::seconds(10));
        assert!(engine.auto_save().await.is_empty());
        clock.advance(Duration::seconds(25));
        assert_eq!(engine.auto_save().await, vec![saving.id]);

        let saves = std::iter::from_fn(|| events.try_recv().ok())
            .filter(|e| matches!(e, LifecycleEvent::AutoSaved { .. }))
            .count();
        assert_eq!(saves, 2);
    }

    #[tokio::test]
    async fn test_sweep_expires_locks() {
        let (engine, clock) = engine_with_clock();
        let owner = UserIdentity::new("a", "a@example.com");
        let owner_id = owner.id;
        let session = engine
            .create_session("locks", None, SessionConfig::default(), owner)
            .await
            .unwrap();
        engine
            .add_file(session.id, owner_id, "notes.md", "")
            .await
            .unwrap();
        engine
            .lock_file(session.id, owner_id, "notes.md", Some(Duration::seconds(30)))
            .await
            .unwrap();

        clock.advance(Duration::seconds(31));
        let report = engine.sweep().await;
        assert_eq!(report.expired_locks, 1);

        let session = engine.session(session.id).await.unwrap();
        assert!(!session.files["notes.md"].is_locked);
    }
}
