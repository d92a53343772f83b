//! Lifecycle notifications and the background sweeper.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    CloseReason, CollaborationEngine, CommentId, ConflictId, OperationId, ResolutionStrategy, Role,
    SessionId, UserId,
};

/// Emitted on the engine's event channel after each state change.
/// Persistence and monitoring hang off these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum LifecycleEvent {
    SessionCreated {
        session_id: SessionId,
        name: String,
        owner: UserId,
    },
    UserJoined {
        session_id: SessionId,
        user_id: UserId,
        role: Role,
    },
    UserLeft {
        session_id: SessionId,
        user_id: UserId,
    },
    OperationApplied {
        session_id: SessionId,
        operation_id: OperationId,
        user_id: UserId,
        file: String,
        file_version: Option<u64>,
    },
    ConflictDetected {
        session_id: SessionId,
        conflict_id: ConflictId,
        file: String,
        auto_resolvable: bool,
    },
    ConflictResolved {
        session_id: SessionId,
        conflict_id: ConflictId,
        strategy: ResolutionStrategy,
        resolved_by: Option<UserId>,
    },
    FileAdded {
        session_id: SessionId,
        path: String,
    },
    CommentAdded {
        session_id: SessionId,
        comment_id: CommentId,
        user_id: UserId,
    },
    SessionClosed {
        session_id: SessionId,
        reason: CloseReason,
    },
    /// Dropped from the registry after its retention period
    SessionRemoved {
        session_id: SessionId,
    },
    /// The session's state should be persisted now
    AutoSaved {
        session_id: SessionId,
        version: u64,
        saved_at: DateTime<Utc>,
    },
}

impl LifecycleEvent {
    pub fn session_id(&self) -> SessionId {
        match self {
            LifecycleEvent::SessionCreated { session_id, .. }
            | LifecycleEvent::UserJoined { session_id, .. }
            | LifecycleEvent::UserLeft { session_id, .. }
            | LifecycleEvent::OperationApplied { session_id, .. }
            | LifecycleEvent::ConflictDetected { session_id, .. }
            | LifecycleEvent::ConflictResolved { session_id, .. }
            | LifecycleEvent::FileAdded { session_id, .. }
            | LifecycleEvent::CommentAdded { session_id, .. }
            | LifecycleEvent::SessionClosed { session_id, .. }
            | LifecycleEvent::SessionRemoved { session_id }
            | LifecycleEvent::AutoSaved { session_id, .. } => *session_id,
        }
    }
}

/// Run the idle/lock/retention sweep and the auto-save pass on their configured
/// intervals until `shutdown` is cancelled.
pub fn spawn_lifecycle(
    engine: Arc<CollaborationEngine>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    let sweep_every = Duration::from_secs(engine.config().sweep_interval_secs.max(1));
    let save_every = Duration::from_secs(engine.config().auto_save_interval_secs.max(1));

    tokio::spawn(async move {
        let mut sweep = tokio::time::interval(sweep_every);
        let mut save = tokio::time::interval(save_every);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        save.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(?sweep_every, ?save_every, "lifecycle sweeper started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sweep.tick() => {
                    let report = engine.sweep().await;
                    if !report.is_empty() {
                        debug!(
                            closed = report.closed.len(),
                            removed = report.removed.len(),
                            expired_locks = report.expired_locks,
                            "sweep finished"
                        );
                    }
                }
                _ = save.tick() => {
                    engine.auto_save().await;
                }
            }
        }
        info!("lifecycle sweeper stopped");
    })
}
