/// Wire protocol and outbound fan-out for connected clients
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{
    CollaborationError, CommentId, ConflictId, ErrorKind, NewComment, Operation, Position,
    ResolutionStrategy, Role, SessionConfig, SessionId, UserId, UserIdentity,
};

/// Inbound messages, one per facade call
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    Create {
        name: String,
        #[serde(default)]
        description: Option<String>,
        #[serde(default)]
        config: SessionConfig,
        user: UserIdentity,
    },
    Join {
        session_id: SessionId,
        user: UserIdentity,
        #[serde(default = "default_join_role")]
        role: Role,
    },
    Leave {
        session_id: SessionId,
        user_id: UserId,
    },
    Operation {
        session_id: SessionId,
        operation: Operation,
    },
    Cursor {
        session_id: SessionId,
        user_id: UserId,
        file: String,
        position: Position,
    },
    Selection {
        session_id: SessionId,
        user_id: UserId,
        file: String,
        start: Position,
        end: Position,
    },
    Comment {
        session_id: SessionId,
        user_id: UserId,
        comment: NewComment,
    },
    ResolveComment {
        session_id: SessionId,
        user_id: UserId,
        comment_id: CommentId,
    },
    React {
        session_id: SessionId,
        user_id: UserId,
        comment_id: CommentId,
        emoji: String,
    },
    ConflictResolution {
        session_id: SessionId,
        conflict_id: ConflictId,
        strategy: ResolutionStrategy,
        #[serde(default)]
        content: Option<String>,
        #[serde(default)]
        user_id: Option<UserId>,
    },
    AddFile {
        session_id: SessionId,
        user_id: UserId,
        path: String,
        #[serde(default)]
        content: String,
    },
    LockFile {
        session_id: SessionId,
        user_id: UserId,
        path: String,
        #[serde(default)]
        timeout_secs: Option<u64>,
    },
    UnlockFile {
        session_id: SessionId,
        user_id: UserId,
        path: String,
    },
    Ping,
}

fn default_join_role() -> Role {
    Role::Editor
}

/// Synchronous answer to a [`ClientMessage`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Reply {
    Ok {
        data: serde_json::Value,
    },
    Error {
        kind: ErrorKind,
        message: String,
    },
}

impl Reply {
    pub fn ok<T: Serialize>(data: &T) -> Self {
        match serde_json::to_value(data) {
            Ok(data) => Reply::Ok { data },
            Err(e) => Reply::from(CollaborationError::from(e)),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Reply::Ok { .. })
    }
}

impl From<CollaborationError> for Reply {
    fn from(err: CollaborationError) -> Self {
        Reply::Error {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Operation,
    Cursor,
    Selection,
    Comment,
    Conflict,
    User,
    Sync,
}

/// Outbound envelope delivered to connected users
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastMessage {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub session_id: SessionId,
    /// Originating user
    pub user_id: Option<UserId>,
    pub timestamp: DateTime<Utc>,
    pub data: serde_json::Value,
    /// Global across all sessions in the process
    pub sequence_number: u64,
}

pub type Outbound = mpsc::UnboundedSender<BroadcastMessage>;

/// Registry of per-user outbound queues. Sends never block; closed queues are pruned.
#[derive(Debug, Default)]
pub struct Broadcaster {
    connections: RwLock<HashMap<SessionId, HashMap<UserId, Outbound>>>,
    sequence: AtomicU64,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `tx` as the queue for `user_id`, replacing any previous one
    pub fn connect(&self, session_id: SessionId, user_id: UserId, tx: Outbound) {
        self.connections
            .write()
            .entry(session_id)
            .or_default()
            .insert(user_id, tx);
        debug!(session_id = %session_id, user_id = %user_id, "connection attached");
    }

    pub fn disconnect(&self, session_id: SessionId, user_id: UserId) -> bool {
        let mut connections = self.connections.write();
        let Some(users) = connections.get_mut(&session_id) else {
            return false;
        };
        let removed = users.remove(&user_id).is_some();
        if users.is_empty() {
            connections.remove(&session_id);
        }
        removed
    }

    /// Drop every queue of a session. Receivers see the channel close.
    pub fn disconnect_session(&self, session_id: SessionId) {
        self.connections.write().remove(&session_id);
    }

    pub fn is_connected(&self, session_id: SessionId, user_id: UserId) -> bool {
        self.connections
            .read()
            .get(&session_id)
            .is_some_and(|users| users.contains_key(&user_id))
    }

    pub fn connection_count(&self, session_id: SessionId) -> usize {
        self.connections
            .read()
            .get(&session_id)
            .map_or(0, HashMap::len)
    }

    pub fn last_sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    /// Deliver to every connected user of the session except `exclude`.
    /// Returns the number of queues the message reached.
    pub fn broadcast(
        &self,
        session_id: SessionId,
        kind: MessageType,
        user_id: Option<UserId>,
        data: serde_json::Value,
        timestamp: DateTime<Utc>,
        exclude: Option<UserId>,
    ) -> usize {
        let message = BroadcastMessage {
            kind,
            session_id,
            user_id,
            timestamp,
            data,
            sequence_number: self.sequence.fetch_add(1, Ordering::SeqCst) + 1,
        };

        let mut delivered = 0;
        let mut dead = Vec::new();
        {
            let connections = self.connections.read();
            let Some(users) = connections.get(&session_id) else {
                return 0;
            };
            for (recipient, tx) in users {
                if Some(*recipient) == exclude {
                    continue;
                }
                if tx.send(message.clone()).is_ok() {
                    delivered += 1;
                } else {
                    dead.push(*recipient);
                }
            }
        }

        for recipient in dead {
            warn!(
                session_id = %session_id,
                user_id = %recipient,
                "dropping closed connection"
            );
            self.disconnect(session_id, recipient);
        }

        delivered
    }
}
