//! Real-time collaborative document editing engine.
//! Sessions, operational transform, conflict detection/resolution and broadcast fan-out.
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod clock;
pub use clock::*;

mod config;
pub use config::*;

mod permissions;
pub use permissions::*;

mod operations;
pub use operations::*;

mod transform;
pub use transform::*;

mod conflict;
pub use conflict::*;

mod presence;
pub use presence::*;

mod session;
pub use session::*;

mod sync;
pub use sync::*;

mod engine;
pub use engine::*;

mod dispatch;
pub use dispatch::*;

mod lifecycle;
pub use lifecycle::*;

/// Coarse error classes surfaced to callers and clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    PermissionDenied,
    CapacityExceeded,
    InvalidState,
    ValidationFailed,
    Internal,
}

#[derive(Debug, Error)]
pub enum CollaborationError {
    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("user {user} not found in session {session}")]
    UserNotFound { session: SessionId, user: UserId },

    #[error("conflict not found: {0}")]
    ConflictNotFound(ConflictId),

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("comment not found: {0}")]
    CommentNotFound(CommentId),

    #[error("role {role} is not allowed to {action}")]
    InsufficientPermissions { role: Role, action: &'static str },

    #[error("session is full ({max_users} users)")]
    SessionFull { max_users: usize },

    #[error("session {0} is no longer active")]
    SessionInactive(SessionId),

    #[error("conflict {0} is already resolved")]
    ConflictAlreadyResolved(ConflictId),

    #[error("file {path} is locked by {locked_by}")]
    FileLocked { path: String, locked_by: UserId },

    #[error("file already exists: {0}")]
    FileExists(String),

    #[error("no revision of {path} is retained before version {version}")]
    RevisionUnavailable { path: String, version: u64 },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CollaborationError {
    pub fn kind(&self) -> ErrorKind {
        use CollaborationError::*;

        match self {
            SessionNotFound(_)
            | UserNotFound { .. }
            | ConflictNotFound(_)
            | FileNotFound(_)
            | CommentNotFound(_) => ErrorKind::NotFound,
            InsufficientPermissions { .. } => ErrorKind::PermissionDenied,
            SessionFull { .. } => ErrorKind::CapacityExceeded,
            SessionInactive(_)
            | ConflictAlreadyResolved(_)
            | FileLocked { .. }
            | FileExists(_)
            | RevisionUnavailable { .. } => ErrorKind::InvalidState,
            Validation(_) => ErrorKind::ValidationFailed,
            Serialization(_) => ErrorKind::Internal,
        }
    }
}

pub type Result<T> = std::result::Result<T, CollaborationError>;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub uuid::Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(uuid::Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

id_type!(
    /// Collaborative session identifier
    SessionId
);
id_type!(
    /// User identifier, supplied by the (already authenticated) caller
    UserId
);
id_type!(
    /// Unique operation identifier
    OperationId
);
id_type!(ConflictId);
id_type!(CommentId);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        let session = SessionId::new();
        assert_eq!(
            CollaborationError::SessionNotFound(session).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            CollaborationError::SessionInactive(session).kind(),
            ErrorKind::InvalidState
        );
        assert_eq!(
            CollaborationError::SessionFull { max_users: 10 }.kind(),
            ErrorKind::CapacityExceeded
        );
        assert_eq!(
            CollaborationError::InsufficientPermissions {
                role: Role::Observer,
                action: "edit",
            }
            .kind(),
            ErrorKind::PermissionDenied
        );
    }

    #[test]
    fn test_ids_serialize_as_plain_uuid() {
        let id = UserId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.0));
    }
}
