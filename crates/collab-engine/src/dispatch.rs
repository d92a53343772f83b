/// Maps inbound client messages onto engine calls for one transport connection
use std::collections::BTreeSet;
use tracing::warn;

use crate::{
    ClientMessage, CollaborationEngine, CollaborationError, Outbound, Reply, Result, SessionId,
    UserId,
};

/// One client transport: its outbound queue and the memberships joined through it
#[derive(Debug)]
pub struct Connection {
    outbound: Outbound,
    memberships: BTreeSet<(SessionId, UserId)>,
}

impl Connection {
    pub fn new(outbound: Outbound) -> Self {
        Self {
            outbound,
            memberships: BTreeSet::new(),
        }
    }

    pub fn memberships(&self) -> impl Iterator<Item = &(SessionId, UserId)> {
        self.memberships.iter()
    }

    /// Messages may only act for users joined on this connection
    fn check(&self, session_id: SessionId, user_id: UserId) -> Result<()> {
        if self.memberships.contains(&(session_id, user_id)) {
            Ok(())
        } else {
            Err(CollaborationError::Validation(format!(
                "user {user_id} has not joined session {session_id} on this connection"
            )))
        }
    }
}

impl CollaborationEngine {
    pub async fn handle_message(&self, conn: &mut Connection, message: ClientMessage) -> Reply {
        match self.dispatch(conn, message).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!("request rejected: {}", e);
                Reply::from(e)
            }
        }
    }

    /// Detach every membership of a closed transport. Users stay in their sessions.
    pub fn close_connection(&self, conn: &Connection) {
        for (session_id, user_id) in conn.memberships() {
            self.detach(*session_id, *user_id);
        }
    }

    async fn dispatch(&self, conn: &mut Connection, message: ClientMessage) -> Result<Reply> {
        match message {
            ClientMessage::Create {
                name,
                description,
                config,
                user,
            } => {
                let user_id = user.id;
                let session = self.create_session(&name, description, config, user).await?;
                self.attach(session.id, user_id, conn.outbound.clone())
                    .await?;
                conn.memberships.insert((session.id, user_id));
                Ok(Reply::ok(&session))
            }

            ClientMessage::Join {
                session_id,
                user,
                role,
            } => {
                let user = self.join_session(session_id, user, role).await?;
                self.attach(session_id, user.id, conn.outbound.clone())
                    .await?;
                conn.memberships.insert((session_id, user.id));
                let session = self.session(session_id).await?;
                Ok(Reply::ok(&session))
            }

            ClientMessage::Leave {
                session_id,
                user_id,
            } => {
                conn.check(session_id, user_id)?;
                self.leave_session(session_id, user_id).await?;
                conn.memberships.remove(&(session_id, user_id));
                Ok(Reply::ok(&()))
            }

            ClientMessage::Operation {
                session_id,
                operation,
            } => {
                conn.check(session_id, operation.user_id)?;
                let applied = self.apply_operation(session_id, operation).await?;
                Ok(Reply::ok(&applied))
            }

            ClientMessage::Cursor {
                session_id,
                user_id,
                file,
                position,
            } => {
                conn.check(session_id, user_id)?;
                self.update_cursor(session_id, user_id, &file, position)
                    .await?;
                Ok(Reply::ok(&()))
            }

            ClientMessage::Selection {
                session_id,
                user_id,
                file,
                start,
                end,
            } => {
                conn.check(session_id, user_id)?;
                self.update_selection(session_id, user_id, &file, start, end)
                    .await?;
                Ok(Reply::ok(&()))
            }

            ClientMessage::Comment {
                session_id,
                user_id,
                comment,
            } => {
                conn.check(session_id, user_id)?;
                let comment = self.add_comment(session_id, user_id, comment).await?;
                Ok(Reply::ok(&comment))
            }

            ClientMessage::ResolveComment {
                session_id,
                user_id,
                comment_id,
            } => {
                conn.check(session_id, user_id)?;
                let comment = self
                    .resolve_comment(session_id, user_id, comment_id)
                    .await?;
                Ok(Reply::ok(&comment))
            }

            ClientMessage::React {
                session_id,
                user_id,
                comment_id,
                emoji,
            } => {
                conn.check(session_id, user_id)?;
                let comment = self
                    .react_to_comment(session_id, user_id, comment_id, &emoji)
                    .await?;
                Ok(Reply::ok(&comment))
            }

            ClientMessage::ConflictResolution {
                session_id,
                conflict_id,
                strategy,
                content,
                user_id,
            } => {
                // System resolutions are not available to clients
                let user_id = user_id.ok_or_else(|| {
                    CollaborationError::Validation("conflict resolution requires userId".into())
                })?;
                conn.check(session_id, user_id)?;
                let conflict = self
                    .resolve_conflict(session_id, conflict_id, strategy, content, Some(user_id))
                    .await?;
                Ok(Reply::ok(&conflict))
            }

            ClientMessage::AddFile {
                session_id,
                user_id,
                path,
                content,
            } => {
                conn.check(session_id, user_id)?;
                let file = self.add_file(session_id, user_id, &path, &content).await?;
                Ok(Reply::ok(&file))
            }

            ClientMessage::LockFile {
                session_id,
                user_id,
                path,
                timeout_secs,
            } => {
                conn.check(session_id, user_id)?;
                let timeout = timeout_secs
                    .map(|secs| {
                        i64::try_from(secs)
                            .ok()
                            .and_then(chrono::Duration::try_seconds)
                            .ok_or_else(|| {
                                CollaborationError::Validation(format!(
                                    "lock timeout of {secs}s is out of range"
                                ))
                            })
                    })
                    .transpose()?;
                let file = self.lock_file(session_id, user_id, &path, timeout).await?;
                Ok(Reply::ok(&file))
            }

            ClientMessage::UnlockFile {
                session_id,
                user_id,
                path,
            } => {
                conn.check(session_id, user_id)?;
                let file = self.unlock_file(session_id, user_id, &path).await?;
                Ok(Reply::ok(&file))
            }

            ClientMessage::Ping => Ok(Reply::ok(&"pong")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EngineConfig, ErrorKind, MessageType, Position, UserIdentity};
    use serde_json::json;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_create_join_and_edit_over_messages() {
        let engine = CollaborationEngine::new(EngineConfig::default());
        let (owner_tx, _owner_rx) = mpsc::unbounded_channel();
        let (editor_tx, mut editor_rx) = mpsc::unbounded_channel();
        let mut owner_conn = Connection::new(owner_tx);
        let mut editor_conn = Connection::new(editor_tx);

        let owner = UserIdentity::new("Olivia", "olivia@example.com");
        let reply = engine
            .handle_message(
                &mut owner_conn,
                serde_json::from_value(json!({
                    "type": "create",
                    "name": "notes",
                    "user": owner,
                }))
                .unwrap(),
            )
            .await;
        let Reply::Ok { data } = reply else {
            panic!("create failed: {reply:?}");
        };
        let session_id: SessionId = serde_json::from_value(data["id"].clone()).unwrap();

        let editor = UserIdentity::new("Eddie", "eddie@example.com");
        let reply = engine
            .handle_message(
                &mut editor_conn,
                ClientMessage::Join {
                    session_id,
                    user: editor.clone(),
                    role: crate::Role::Editor,
                },
            )
            .await;
        assert!(reply.is_ok());

        let reply = engine
            .handle_message(
                &mut owner_conn,
                ClientMessage::AddFile {
                    session_id,
                    user_id: owner.id,
                    path: "a.txt".into(),
                    content: String::new(),
                },
            )
            .await;
        assert!(reply.is_ok());

        let reply = engine
            .handle_message(
                &mut owner_conn,
                ClientMessage::Cursor {
                    session_id,
                    user_id: owner.id,
                    file: "a.txt".into(),
                    position: Position::new(0, 0),
                },
            )
            .await;
        assert!(reply.is_ok());

        let kinds: Vec<MessageType> = std::iter::from_fn(|| editor_rx.try_recv().ok())
            .map(|m| m.kind)
            .collect();
        assert_eq!(kinds, vec![MessageType::Sync, MessageType::Cursor]);
    }

    #[tokio::test]
    async fn test_cannot_act_for_another_user() {
        let engine = CollaborationEngine::new(EngineConfig::default());
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut conn = Connection::new(tx);
        let owner = UserIdentity::new("Olivia", "olivia@example.com");
        let session = engine
            .create_session("s", None, Default::default(), owner.clone())
            .await
            .unwrap();

        let reply = engine
            .handle_message(
                &mut conn,
                ClientMessage::Leave {
                    session_id: session.id,
                    user_id: owner.id,
                },
            )
            .await;
        assert!(matches!(
            reply,
            Reply::Error {
                kind: ErrorKind::ValidationFailed,
                ..
            }
        ));
        assert!(engine.session(session.id).await.unwrap().is_active);
    }

    #[tokio::test]
    async fn test_rejects_out_of_range_client_durations() {
        let engine = CollaborationEngine::new(EngineConfig::default());
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut conn = Connection::new(tx);
        let owner = UserIdentity::new("Olivia", "olivia@example.com");

        let reply = engine
            .handle_message(
                &mut conn,
                serde_json::from_value(json!({
                    "type": "create",
                    "name": "notes",
                    "user": owner,
                    "config": { "save_interval_secs": 10_000_000_000_000_000u64 },
                }))
                .unwrap(),
            )
            .await;
        assert!(matches!(
            reply,
            Reply::Error {
                kind: ErrorKind::ValidationFailed,
                ..
            }
        ));
        assert!(engine.list_sessions().await.is_empty());

        let reply = engine
            .handle_message(
                &mut conn,
                ClientMessage::Create {
                    name: "notes".into(),
                    description: None,
                    config: Default::default(),
                    user: owner.clone(),
                },
            )
            .await;
        let Reply::Ok { data } = reply else {
            panic!("create failed: {reply:?}");
        };
        let session_id: SessionId = serde_json::from_value(data["id"].clone()).unwrap();
        engine
            .add_file(session_id, owner.id, "a.txt", "")
            .await
            .unwrap();

        for secs in [0, 100_000_000_000_000, u64::MAX] {
            let reply = engine
                .handle_message(
                    &mut conn,
                    ClientMessage::LockFile {
                        session_id,
                        user_id: owner.id,
                        path: "a.txt".into(),
                        timeout_secs: Some(secs),
                    },
                )
                .await;
            assert!(
                matches!(
                    reply,
                    Reply::Error {
                        kind: ErrorKind::ValidationFailed,
                        ..
                    }
                ),
                "timeout {secs}: {reply:?}"
            );
        }
        let session = engine.session(session_id).await.unwrap();
        assert!(!session.files["a.txt"].is_locked);

        // Sweeps and auto-saves keep running
        engine.auto_save().await;
        engine.auto_save().await;
        engine.sweep().await;
    }

    #[tokio::test]
    async fn test_ping() {
        let engine = CollaborationEngine::new(EngineConfig::default());
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut conn = Connection::new(tx);
        let reply = engine.handle_message(&mut conn, ClientMessage::Ping).await;
        assert_eq!(reply, Reply::Ok { data: json!("pong") });
    }
}
