//! Session state: users, files, operation log, conflicts and comments.
//!
//! Every mutating method validates first and only then writes, so a failed call leaves
//! the session untouched. Callers serialize access (one lock per session) and supply `now`.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use tracing::debug;

use crate::{
    transform_against, CollaborationError, CommentId, Conflict, ConflictDetector, ConflictId,
    ConflictResolutionMode, ConflictResolver, CursorPosition, EngineConfig, Operation,
    OperationId, OperationLog, Permissions, Position, Resolution, ResolutionStrategy, Result,
    Role, Selection, SessionConfig, SessionId, User, UserId, UserIdentity,
};

/// Cheap 32-bit rolling hash of file content, hex encoded.
/// Change detection only; not collision resistant.
pub fn checksum(content: &str) -> String {
    let hash = content
        .bytes()
        .fold(0u32, |hash, byte| hash.wrapping_mul(31).wrapping_add(byte as u32));
    format!("{hash:08x}")
}

/// File content before a change, kept for merge/revert
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Revision {
    /// Version the change produced
    pub version: u64,
    /// `None` when the change was a conflict resolution
    pub operation_id: Option<OperationId>,
    pub content_before: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct File {
    pub path: String,
    pub content: String,
    pub version: u64,
    pub last_modified: DateTime<Utc>,
    pub modified_by: Option<UserId>,
    #[serde(default)]
    pub is_locked: bool,
    #[serde(default)]
    pub locked_by: Option<UserId>,
    /// Instant the lock expires
    #[serde(default)]
    pub lock_timeout: Option<DateTime<Utc>>,
    /// Recently applied operations new submissions are transformed against
    #[serde(default)]
    pub pending_operations: VecDeque<OperationId>,
    pub checksum: String,
    #[serde(default)]
    pub revisions: VecDeque<Revision>,
}

impl File {
    pub fn new(
        path: impl Into<String>,
        content: impl Into<String>,
        created_by: Option<UserId>,
        now: DateTime<Utc>,
    ) -> Self {
        let content = content.into();
        Self {
            path: path.into(),
            checksum: checksum(&content),
            content,
            version: 0,
            last_modified: now,
            modified_by: created_by,
            is_locked: false,
            locked_by: None,
            lock_timeout: None,
            pending_operations: VecDeque::new(),
            revisions: VecDeque::new(),
        }
    }

    /// Holder of an unexpired lock
    pub fn lock_holder(&self, now: DateTime<Utc>) -> Option<UserId> {
        if !self.is_locked {
            return None;
        }
        match self.lock_timeout {
            Some(expiry) if expiry <= now => None,
            _ => self.locked_by,
        }
    }

    fn release_lock(&mut self) {
        self.is_locked = false;
        self.locked_by = None;
        self.lock_timeout = None;
    }

    fn set_content(
        &mut self,
        content: String,
        by: Option<UserId>,
        operation_id: Option<OperationId>,
        now: DateTime<Utc>,
        max_revisions: usize,
    ) {
        let before = std::mem::replace(&mut self.content, content);
        self.version += 1;
        self.checksum = checksum(&self.content);
        self.modified_by = by;
        self.last_modified = now;

        self.revisions.push_back(Revision {
            version: self.version,
            operation_id,
            content_before: before,
        });
        while self.revisions.len() > max_revisions {
            self.revisions.pop_front();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommentType {
    General,
    Suggestion,
    Question,
    Issue,
    Approval,
}

/// Threaded comment. Replies are stored by id in the session's comment arena.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    pub id: CommentId,
    pub user_id: UserId,
    pub file: String,
    pub position: Position,
    pub content: String,
    #[serde(rename = "type")]
    pub kind: CommentType,
    pub is_resolved: bool,
    #[serde(default)]
    pub parent_id: Option<CommentId>,
    #[serde(default)]
    pub replies: Vec<CommentId>,
    #[serde(default)]
    pub reactions: BTreeMap<String, BTreeSet<UserId>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A new comment or reply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewComment {
    pub file: String,
    pub position: Position,
    pub content: String,
    #[serde(rename = "type", default = "default_comment_type")]
    pub kind: CommentType,
    #[serde(default)]
    pub parent_id: Option<CommentId>,
}

fn default_comment_type() -> CommentType {
    CommentType::General
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    NoUsers,
    Inactivity,
}

/// Result of applying an operation
#[derive(Debug, Clone)]
pub struct AppliedOperation {
    /// The copy that was applied and logged
    pub operation: Operation,
    /// Conflicts the operation raised, resolved ones included
    pub conflicts: Vec<Conflict>,
}

/// Result of a user leaving
#[derive(Debug, Clone)]
pub struct Departure {
    pub user: User,
    pub released_locks: Vec<String>,
    pub closed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: SessionId,
    pub name: String,
    pub is_active: bool,
    pub user_count: usize,
    pub file_count: usize,
    pub open_conflicts: usize,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: SessionId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub config: SessionConfig,
    pub users: BTreeMap<UserId, User>,
    pub files: BTreeMap<String, File>,
    pub operations: OperationLog,
    pub conflicts: Vec<Conflict>,
    pub comments: BTreeMap<CommentId, Comment>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub is_active: bool,
    pub version: u64,
    #[serde(default)]
    pub closed_reason: Option<CloseReason>,
    #[serde(default)]
    pub last_saved_at: Option<DateTime<Utc>>,
}

impl Session {
    /// New active session with `creator` joined as owner
    pub fn new(
        name: impl Into<String>,
        description: Option<String>,
        config: SessionConfig,
        creator: UserIdentity,
        now: DateTime<Utc>,
    ) -> Self {
        let owner = User::new(creator, Role::Owner, now);
        let mut users = BTreeMap::new();
        users.insert(owner.id, owner);

        Self {
            id: SessionId::new(),
            name: name.into(),
            description,
            config,
            users,
            files: BTreeMap::new(),
            operations: OperationLog::new(),
            conflicts: Vec::new(),
            comments: BTreeMap::new(),
            created_at: now,
            updated_at: now,
            is_active: true,
            version: 0,
            closed_reason: None,
            last_saved_at: None,
        }
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id,
            name: self.name.clone(),
            is_active: self.is_active,
            user_count: self.users.len(),
            file_count: self.files.len(),
            open_conflicts: self.conflicts.iter().filter(|c| !c.is_resolved()).count(),
            version: self.version,
            updated_at: self.updated_at,
        }
    }

    pub fn user(&self, user_id: UserId) -> Result<&User> {
        self.users
            .get(&user_id)
            .ok_or(CollaborationError::UserNotFound {
                session: self.id,
                user: user_id,
            })
    }

    pub fn file(&self, path: &str) -> Result<&File> {
        self.files
            .get(path)
            .ok_or_else(|| CollaborationError::FileNotFound(path.to_string()))
    }

    pub fn conflict(&self, conflict_id: ConflictId) -> Result<&Conflict> {
        self.conflicts
            .iter()
            .find(|c| c.id == conflict_id)
            .ok_or(CollaborationError::ConflictNotFound(conflict_id))
    }

    /// Top-level comments in creation order
    pub fn comment_threads(&self) -> Vec<&Comment> {
        let mut threads: Vec<&Comment> = self
            .comments
            .values()
            .filter(|c| c.parent_id.is_none())
            .collect();
        threads.sort_by_key(|c| c.created_at);
        threads
    }

    fn ensure_active(&self) -> Result<()> {
        if self.is_active {
            Ok(())
        } else {
            Err(CollaborationError::SessionInactive(self.id))
        }
    }

    /// Member `user_id` holding the capability selected by `allowed`
    fn authorize(
        &self,
        user_id: UserId,
        allowed: fn(&Permissions) -> bool,
        action: &'static str,
    ) -> Result<&User> {
        let user = self.user(user_id)?;
        if allowed(&user.permissions) {
            Ok(user)
        } else {
            Err(CollaborationError::InsufficientPermissions {
                role: user.role,
                action,
            })
        }
    }

    fn touch(&mut self, user_id: Option<UserId>, now: DateTime<Utc>) {
        self.version += 1;
        self.updated_at = now;
        if let Some(user) = user_id.and_then(|id| self.users.get_mut(&id)) {
            user.touch(now);
        }
    }

    /// Add a user, or refresh one that is already a member.
    /// Returns the user and whether it is new to the session.
    pub fn join(
        &mut self,
        identity: UserIdentity,
        role: Role,
        now: DateTime<Utc>,
    ) -> Result<(User, bool)> {
        self.ensure_active()?;

        if let Some(existing) = self.users.get_mut(&identity.id) {
            existing.touch(now);
            if existing.role != role {
                debug!(
                    session_id = %self.id,
                    user_id = %identity.id,
                    "rejoin keeps original role {}",
                    existing.role
                );
            }
            return Ok((existing.clone(), false));
        }

        if self.users.len() >= self.config.max_users {
            return Err(CollaborationError::SessionFull {
                max_users: self.config.max_users,
            });
        }

        let user = User::new(identity, role, now);
        self.users.insert(user.id, user.clone());
        self.touch(None, now);
        Ok((user, true))
    }

    /// Remove a user, releasing its locks. Closes the session when it was the last one.
    pub fn leave(&mut self, user_id: UserId, now: DateTime<Utc>) -> Result<Departure> {
        self.ensure_active()?;
        let user = self
            .users
            .remove(&user_id)
            .ok_or(CollaborationError::UserNotFound {
                session: self.id,
                user: user_id,
            })?;

        let mut released_locks = Vec::new();
        for file in self.files.values_mut() {
            if file.is_locked && file.locked_by == Some(user_id) {
                file.release_lock();
                released_locks.push(file.path.clone());
            }
        }

        self.touch(None, now);

        let closed = self.users.is_empty();
        if closed {
            self.close(CloseReason::NoUsers, now);
        }

        Ok(Departure {
            user,
            released_locks,
            closed,
        })
    }

    /// Mark the session inactive. Terminal.
    pub fn close(&mut self, reason: CloseReason, now: DateTime<Utc>) {
        if !self.is_active {
            return;
        }
        self.is_active = false;
        self.closed_reason = Some(reason);
        self.version += 1;
        self.updated_at = now;
    }

    /// Active, and every user has been silent for longer than `timeout`
    pub fn is_idle(&self, now: DateTime<Utc>, timeout: chrono::Duration) -> bool {
        self.is_active && self.users.values().all(|u| u.is_idle(now, timeout))
    }

    pub fn add_file(
        &mut self,
        user_id: UserId,
        path: &str,
        content: &str,
        now: DateTime<Utc>,
    ) -> Result<File> {
        self.ensure_active()?;
        self.authorize(user_id, |p| p.can_edit, "add files")?;
        if path.trim().is_empty() {
            return Err(CollaborationError::Validation("file path is empty".into()));
        }
        if self.files.contains_key(path) {
            return Err(CollaborationError::FileExists(path.to_string()));
        }

        let file = File::new(path, content, Some(user_id), now);
        self.files.insert(path.to_string(), file.clone());
        self.touch(Some(user_id), now);
        Ok(file)
    }

    /// Apply `op`: permission and lock checks, transform against in-flight operations,
    /// conflict detection, content update and log append.
    ///
    /// The client's base is `baseVersion`, or failing that the newest file version among
    /// its `dependencies`. Operations with neither are taken as current. In automatic mode
    /// such an operation is instead rebased over each auto-resolvable prior it collides
    /// with, oldest first, and those conflicts are recorded as merged.
    pub fn apply_operation(
        &mut self,
        op: Operation,
        config: &EngineConfig,
        now: DateTime<Utc>,
    ) -> Result<AppliedOperation> {
        self.ensure_active()?;
        if self.operations.get(&op.id).is_some() {
            return Err(CollaborationError::Validation(format!(
                "operation {} has already been applied",
                op.id
            )));
        }
        let user = self.user(op.user_id)?;
        if !user.permissions.allows(op.kind) {
            return Err(CollaborationError::InsufficientPermissions {
                role: user.role,
                action: op.kind.as_str(),
            });
        }

        let file = self.file(&op.file)?;
        if op.is_edit() {
            if let Some(holder) = file.lock_holder(now).filter(|h| *h != op.user_id) {
                return Err(CollaborationError::FileLocked {
                    path: op.file.clone(),
                    locked_by: holder,
                });
            }
        }

        let mut transformed = op.clone();
        transformed.conflicts_with.clear();
        transformed.transformed_against.clear();
        transformed.file_version = None;

        let base = op.base_version.or_else(|| {
            op.dependencies
                .iter()
                .filter_map(|id| self.operations.get(id))
                .filter(|dep| dep.file == op.file)
                .filter_map(|dep| dep.file_version)
                .max()
        });
        if let Some(base) = base {
            for prior in file
                .pending_operations
                .iter()
                .filter_map(|id| self.operations.get(id))
                .filter(|prior| {
                    prior.user_id != op.user_id && prior.file_version.unwrap_or(0) > base
                })
            {
                transformed = transform_against(&transformed, prior);
            }
        }

        let detector = ConflictDetector::new(config);
        let mut conflicts = detector.detect(&transformed, &self.operations, now);

        let mut merged = Vec::new();
        if self.config.conflict_resolution == ConflictResolutionMode::Automatic {
            for conflict in conflicts.iter().rev().filter(|c| c.auto_resolvable) {
                let prior_id = conflict.operations[1];
                if base.is_none() && !transformed.transformed_against.contains(&prior_id) {
                    if let Some(prior) = self.operations.get(&prior_id) {
                        transformed = transform_against(&transformed, prior);
                    }
                }
                merged.push(conflict.id);
            }
        }
        transformed.conflicts_with = conflicts.iter().map(|c| c.operations[1]).collect();

        // Validation done; mutate.
        let file = self
            .files
            .get_mut(&op.file)
            .ok_or_else(|| CollaborationError::FileNotFound(op.file.clone()))?;
        if transformed.is_edit() {
            let content = transformed.apply(&file.content);
            file.set_content(
                content,
                Some(op.user_id),
                Some(transformed.id),
                now,
                config.max_revisions,
            );
            file.pending_operations.push_back(transformed.id);
            while file.pending_operations.len() > config.max_pending_operations {
                file.pending_operations.pop_front();
            }
        }
        transformed.file_version = Some(file.version);

        for conflict in conflicts.iter_mut().filter(|c| merged.contains(&c.id)) {
            conflict.resolution = Some(Resolution {
                strategy: ResolutionStrategy::Merge,
                result: file.content.clone(),
                reasoning: format!(
                    "operation {} rebased over {} on arrival",
                    transformed.id, conflict.operations[1]
                ),
                approved_by: Vec::new(),
                rejected_by: Vec::new(),
            });
            conflict.resolved_at = Some(now);
        }

        debug!(
            session_id = %self.id,
            user_id = %op.user_id,
            file = %op.file,
            operation = op.kind.as_str(),
            file_version = file.version,
            conflicts = conflicts.len(),
            merged = merged.len(),
            "applied operation"
        );

        self.operations.push(transformed.clone());
        self.touch(Some(op.user_id), now);
        self.conflicts.extend(conflicts.iter().cloned());

        Ok(AppliedOperation {
            operation: transformed,
            conflicts,
        })
    }

    /// Resolve a conflict, rewriting the file with the strategy's result.
    /// `by = None` is an automatic resolution.
    pub fn resolve_conflict(
        &mut self,
        conflict_id: ConflictId,
        strategy: ResolutionStrategy,
        content: Option<&str>,
        by: Option<UserId>,
        config: &EngineConfig,
        now: DateTime<Utc>,
    ) -> Result<Conflict> {
        self.ensure_active()?;
        if let Some(user_id) = by {
            self.authorize(user_id, |p| p.can_merge, "resolve conflicts")?;
        }

        let conflict = self.conflict(conflict_id)?;
        if conflict.is_resolved() {
            return Err(CollaborationError::ConflictAlreadyResolved(conflict_id));
        }
        let file = self.file(&conflict.file)?;
        let resolved = ConflictResolver::resolve(conflict, strategy, content, file, &self.operations)?;

        let path = conflict.file.clone();
        if let Some(file) = self.files.get_mut(&path) {
            file.set_content(
                resolved.content.clone(),
                by,
                None,
                now,
                config.max_revisions,
            );
            file.pending_operations.clear();
        }

        let conflict = self
            .conflicts
            .iter_mut()
            .find(|c| c.id == conflict_id)
            .ok_or(CollaborationError::ConflictNotFound(conflict_id))?;
        conflict.resolution = Some(Resolution {
            strategy,
            result: resolved.content,
            reasoning: resolved.reasoning,
            approved_by: by.into_iter().collect(),
            rejected_by: Vec::new(),
        });
        conflict.resolved_at = Some(now);
        conflict.resolved_by = by;
        let conflict = conflict.clone();

        self.touch(by, now);
        Ok(conflict)
    }

    pub fn lock_file(
        &mut self,
        user_id: UserId,
        path: &str,
        timeout: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<File> {
        self.ensure_active()?;
        self.authorize(user_id, |p| p.can_edit, "lock files")?;
        let expiry = now
            .checked_add_signed(timeout)
            .filter(|expiry| *expiry > now)
            .ok_or_else(|| {
                CollaborationError::Validation(format!("lock timeout {timeout} is out of range"))
            })?;
        let file = self.file(path)?;
        if let Some(holder) = file.lock_holder(now).filter(|h| *h != user_id) {
            return Err(CollaborationError::FileLocked {
                path: path.to_string(),
                locked_by: holder,
            });
        }

        let file = self
            .files
            .get_mut(path)
            .ok_or_else(|| CollaborationError::FileNotFound(path.to_string()))?;
        file.is_locked = true;
        file.locked_by = Some(user_id);
        file.lock_timeout = Some(expiry);
        let file = file.clone();

        self.touch(Some(user_id), now);
        Ok(file)
    }

    /// Release a lock. Only the holder, or a user who can merge, may do so.
    pub fn unlock_file(&mut self, user_id: UserId, path: &str, now: DateTime<Utc>) -> Result<File> {
        self.ensure_active()?;
        let user = self.user(user_id)?;
        let file = self.file(path)?;
        if let Some(holder) = file.lock_holder(now) {
            if holder != user_id && !user.permissions.can_merge {
                return Err(CollaborationError::FileLocked {
                    path: path.to_string(),
                    locked_by: holder,
                });
            }
        }

        let file = self
            .files
            .get_mut(path)
            .ok_or_else(|| CollaborationError::FileNotFound(path.to_string()))?;
        file.release_lock();
        let file = file.clone();

        self.touch(Some(user_id), now);
        Ok(file)
    }

    /// Clear expired locks, returning the affected paths
    pub fn expire_locks(&mut self, now: DateTime<Utc>) -> Vec<String> {
        let mut expired = Vec::new();
        for file in self.files.values_mut() {
            if file.is_locked && file.lock_holder(now).is_none() {
                file.release_lock();
                expired.push(file.path.clone());
            }
        }
        if !expired.is_empty() {
            self.version += 1;
            self.updated_at = now;
        }
        expired
    }

    pub fn add_comment(
        &mut self,
        user_id: UserId,
        new: NewComment,
        now: DateTime<Utc>,
    ) -> Result<Comment> {
        self.ensure_active()?;
        self.authorize(user_id, |p| p.can_comment, "comment")?;
        if new.kind == CommentType::Approval {
            self.authorize(user_id, |p| p.can_approve, "approve")?;
        }
        if new.content.trim().is_empty() {
            return Err(CollaborationError::Validation("comment is empty".into()));
        }
        self.file(&new.file)?;
        if let Some(parent) = new.parent_id {
            if !self.comments.contains_key(&parent) {
                return Err(CollaborationError::CommentNotFound(parent));
            }
        }

        let comment = Comment {
            id: CommentId::new(),
            user_id,
            file: new.file,
            position: new.position,
            content: new.content,
            kind: new.kind,
            is_resolved: false,
            parent_id: new.parent_id,
            replies: Vec::new(),
            reactions: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        };

        if let Some(parent) = comment.parent_id.and_then(|id| self.comments.get_mut(&id)) {
            parent.replies.push(comment.id);
            parent.updated_at = now;
        }
        self.comments.insert(comment.id, comment.clone());
        self.touch(Some(user_id), now);
        Ok(comment)
    }

    pub fn resolve_comment(
        &mut self,
        user_id: UserId,
        comment_id: CommentId,
        now: DateTime<Utc>,
    ) -> Result<Comment> {
        self.ensure_active()?;
        self.authorize(user_id, |p| p.can_comment, "resolve comments")?;
        let comment = self
            .comments
            .get_mut(&comment_id)
            .ok_or(CollaborationError::CommentNotFound(comment_id))?;

        comment.is_resolved = true;
        comment.updated_at = now;
        let comment = comment.clone();

        self.touch(Some(user_id), now);
        Ok(comment)
    }

    /// Toggle `user_id`'s `emoji` reaction on a comment
    pub fn react_to_comment(
        &mut self,
        user_id: UserId,
        comment_id: CommentId,
        emoji: &str,
        now: DateTime<Utc>,
    ) -> Result<Comment> {
        self.ensure_active()?;
        self.authorize(user_id, |p| p.can_comment, "react")?;
        if emoji.trim().is_empty() {
            return Err(CollaborationError::Validation("reaction is empty".into()));
        }
        let comment = self
            .comments
            .get_mut(&comment_id)
            .ok_or(CollaborationError::CommentNotFound(comment_id))?;

        let users = comment.reactions.entry(emoji.to_string()).or_default();
        if !users.remove(&user_id) {
            users.insert(user_id);
        }
        if users.is_empty() {
            comment.reactions.remove(emoji);
        }
        comment.updated_at = now;
        let comment = comment.clone();

        self.touch(Some(user_id), now);
        Ok(comment)
    }

    /// Presence only: not logged and does not bump the session version
    pub fn update_cursor(
        &mut self,
        user_id: UserId,
        cursor: CursorPosition,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.ensure_active()?;
        let user = self
            .users
            .get_mut(&user_id)
            .ok_or(CollaborationError::UserNotFound {
                session: self.id,
                user: user_id,
            })?;
        user.cursor = Some(cursor);
        user.touch(now);
        Ok(())
    }

    pub fn update_selection(
        &mut self,
        user_id: UserId,
        selection: Selection,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.ensure_active()?;
        if selection.end < selection.start {
            return Err(CollaborationError::Validation(
                "selection ends before it starts".into(),
            ));
        }
        let user = self
            .users
            .get_mut(&user_id)
            .ok_or(CollaborationError::UserNotFound {
                session: self.id,
                user: user_id,
            })?;
        user.selection = Some(selection);
        user.touch(now);
        Ok(())
    }
}
