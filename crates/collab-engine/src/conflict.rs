/// Conflict detection and resolution for collaborative editing
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    transform_against, CollaborationError, ConflictId, EngineConfig, File, Operation,
    OperationId, OperationLog, OperationType, Result, UserId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    /// Two users edited overlapping content
    Content,
}

/// Conflict resolution strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    /// Replay both operations from the pre-conflict snapshot, transforming the later one
    Merge,
    /// Adopt caller-supplied content
    Override,
    /// Restore the content from before the earliest conflicting operation
    Revert,
    /// Caller-supplied content, recorded as a manual resolution
    Manual,
}

impl ResolutionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionStrategy::Merge => "merge",
            ResolutionStrategy::Override => "override",
            ResolutionStrategy::Revert => "revert",
            ResolutionStrategy::Manual => "manual",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resolution {
    pub strategy: ResolutionStrategy,
    pub result: String,
    pub reasoning: String,
    pub approved_by: Vec<UserId>,
    pub rejected_by: Vec<UserId>,
}

/// A detected overlap between two concurrent operations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    pub id: ConflictId,

    #[serde(rename = "type")]
    pub kind: ConflictType,

    pub file: String,

    /// The new operation first, then the earlier one it collided with
    pub operations: [OperationId; 2],

    pub users: [UserId; 2],

    pub description: String,

    pub auto_resolvable: bool,

    #[serde(default)]
    pub resolution: Option<Resolution>,

    pub created_at: DateTime<Utc>,

    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,

    /// `None` once resolved means the engine resolved it automatically
    #[serde(default)]
    pub resolved_by: Option<UserId>,
}

impl Conflict {
    pub fn is_resolved(&self) -> bool {
        self.resolved_at.is_some()
    }
}

/// Finds recent operations by other users that overlap a new one.
#[derive(Debug, Clone)]
pub struct ConflictDetector {
    window: chrono::Duration,
    line_window: usize,
    column_window: usize,
}

impl ConflictDetector {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            window: config.conflict_window(),
            line_window: config.conflict_line_window,
            column_window: config.conflict_column_window,
        }
    }

    /// Whether two operations are close enough to collide. Columns are compared as the
    /// gap between the spans each edit covers on its starting line.
    pub fn overlaps(&self, a: &Operation, b: &Operation) -> bool {
        if a.position.line.abs_diff(b.position.line) > self.line_window {
            return false;
        }

        let (a_start, a_end) = column_span(a);
        let (b_start, b_end) = column_span(b);
        let gap = a_start.max(b_start).saturating_sub(a_end.min(b_end));
        gap <= self.column_window
    }

    /// One conflict per overlapping prior operation. `op` must not be in `log` yet.
    pub fn detect(&self, op: &Operation, log: &OperationLog, now: DateTime<Utc>) -> Vec<Conflict> {
        if !op.is_edit() {
            return Vec::new();
        }

        log.recent(now, self.window)
            .filter(|prior| {
                prior.file == op.file
                    && prior.user_id != op.user_id
                    && prior.is_edit()
                    && self.overlaps(op, prior)
            })
            .map(|prior| Conflict {
                id: ConflictId::new(),
                kind: ConflictType::Content,
                file: op.file.clone(),
                operations: [op.id, prior.id],
                users: [op.user_id, prior.user_id],
                description: format!(
                    "concurrent edits to {} near line {}, column {}",
                    op.file, op.position.line, op.position.column
                ),
                auto_resolvable: op.kind == OperationType::Insert
                    && prior.kind == OperationType::Insert,
                resolution: None,
                created_at: now,
                resolved_at: None,
                resolved_by: None,
            })
            .collect()
    }
}

fn column_span(op: &Operation) -> (usize, usize) {
    let text = if op.removed_text().is_empty() {
        op.inserted_text()
    } else {
        op.removed_text()
    };
    let width = text.split('\n').next().unwrap_or("").chars().count();
    (op.position.column, op.position.column + width)
}

/// Content produced by a resolution strategy
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedContent {
    pub content: String,
    pub reasoning: String,
}

/// Computes resolved file content. Pure: callers apply the result.
pub struct ConflictResolver;

impl ConflictResolver {
    pub fn resolve(
        conflict: &Conflict,
        strategy: ResolutionStrategy,
        manual_content: Option<&str>,
        file: &File,
        log: &OperationLog,
    ) -> Result<ResolvedContent> {
        match strategy {
            ResolutionStrategy::Override | ResolutionStrategy::Manual => {
                let content = manual_content.ok_or_else(|| {
                    CollaborationError::Validation(format!(
                        "{} resolution requires content",
                        strategy.as_str()
                    ))
                })?;
                let reasoning = match strategy {
                    ResolutionStrategy::Override => "content overridden by caller",
                    _ => "content resolved manually",
                };
                Ok(ResolvedContent {
                    content: content.to_string(),
                    reasoning: reasoning.to_string(),
                })
            }
            ResolutionStrategy::Revert => {
                let (earliest, _) = Self::ordered_operations(conflict, file, log)?;
                let revision = Self::revision_index(file, earliest)?;
                Ok(ResolvedContent {
                    content: file.revisions[revision].content_before.clone(),
                    reasoning: format!("reverted {} to before operation {}", file.path, earliest.id),
                })
            }
            ResolutionStrategy::Merge => Self::merge(conflict, file, log),
        }
    }

    /// Replay the file's history from just before the earliest conflicting operation,
    /// applying the later one as if it had been made concurrently with the earlier.
    fn merge(conflict: &Conflict, file: &File, log: &OperationLog) -> Result<ResolvedContent> {
        let (earliest, later) = Self::ordered_operations(conflict, file, log)?;
        let start = Self::revision_index(file, earliest)?;
        let unavailable = || CollaborationError::RevisionUnavailable {
            path: file.path.clone(),
            version: earliest.file_version.unwrap_or_default(),
        };

        let mut content = file.revisions[start].content_before.clone();
        for revision in file.revisions.iter().skip(start) {
            let op_id = revision.operation_id.ok_or_else(unavailable)?;
            let op = log.get(&op_id).ok_or_else(unavailable)?;

            content = if op.id == later.id && !op.transformed_against.contains(&earliest.id) {
                transform_against(op, earliest).apply(&content)
            } else {
                op.apply(&content)
            };
        }

        Ok(ResolvedContent {
            content,
            reasoning: format!(
                "merged operation {} with earlier operation {}",
                later.id, earliest.id
            ),
        })
    }

    fn ordered_operations<'a>(
        conflict: &Conflict,
        file: &File,
        log: &'a OperationLog,
    ) -> Result<(&'a Operation, &'a Operation)> {
        let mut ops = conflict
            .operations
            .iter()
            .map(|id| log.index_of(id).map(|idx| (idx, &log.as_slice()[idx])))
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| CollaborationError::RevisionUnavailable {
                path: file.path.clone(),
                version: file.version,
            })?;
        ops.sort_by_key(|(idx, _)| *idx);
        Ok((ops[0].1, ops[1].1))
    }

    fn revision_index(file: &File, op: &Operation) -> Result<usize> {
        file.revisions
            .iter()
            .position(|revision| revision.operation_id == Some(op.id))
            .ok_or_else(|| CollaborationError::RevisionUnavailable {
                path: file.path.clone(),
                version: op.file_version.unwrap_or_default(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Position;
    use chrono::Duration;

    fn detector() -> ConflictDetector {
        ConflictDetector::new(&EngineConfig::default())
    }

    fn logged(ops: &[Operation]) -> OperationLog {
        let mut log = OperationLog::new();
        for op in ops {
            log.push(op.clone());
        }
        log
    }

    #[test]
    fn test_detects_overlap_within_ten_columns() {
        let now = Utc::now();
        let u1 = UserId::new();
        let u2 = UserId::new();

        let prior = Operation::insert(u1, "f", Position::new(5, 0), "a").with_timestamp(now);
        let close = Operation::insert(u2, "f", Position::new(5, 10), "b").with_timestamp(now);
        let far = Operation::insert(u2, "f", Position::new(5, 50), "b").with_timestamp(now);
        let log = logged(&[prior.clone()]);

        let conflicts = detector().detect(&close, &log, now);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].operations, [close.id, prior.id]);
        assert_eq!(conflicts[0].users, [u2, u1]);
        assert!(conflicts[0].auto_resolvable);

        assert!(detector().detect(&far, &log, now).is_empty());
    }

    #[test]
    fn test_column_window_boundary() {
        let now = Utc::now();
        let prior = Operation::insert(UserId::new(), "f", Position::new(5, 0), "a")
            .with_timestamp(now);
        let near = Operation::insert(UserId::new(), "f", Position::new(5, 11), "b")
            .with_timestamp(now);
        let far = Operation::insert(UserId::new(), "f", Position::new(5, 50), "b")
            .with_timestamp(now);
        let log = logged(&[prior]);

        assert_eq!(detector().detect(&near, &log, now).len(), 1);
        assert!(detector().detect(&far, &log, now).is_empty());
    }

    #[test]
    fn test_line_window() {
        let now = Utc::now();
        let prior = Operation::insert(UserId::new(), "f", Position::new(3, 0), "a")
            .with_timestamp(now);
        let next_line = Operation::insert(UserId::new(), "f", Position::new(4, 0), "b")
            .with_timestamp(now);
        let two_lines = Operation::insert(UserId::new(), "f", Position::new(5, 0), "b")
            .with_timestamp(now);

        assert!(detector().overlaps(&next_line, &prior));
        assert!(!detector().overlaps(&two_lines, &prior));
    }

    #[test]
    fn test_ignores_same_user_other_file_and_old_ops() {
        let now = Utc::now();
        let u1 = UserId::new();
        let u2 = UserId::new();

        let own = Operation::insert(u1, "f", Position::new(0, 0), "a").with_timestamp(now);
        let other_file = Operation::insert(u2, "g", Position::new(0, 0), "a").with_timestamp(now);
        let stale = Operation::insert(u2, "f", Position::new(0, 0), "a")
            .with_timestamp(now - Duration::seconds(6));
        let log = logged(&[stale, other_file, own]);

        let op = Operation::insert(u1, "f", Position::new(0, 1), "b").with_timestamp(now);
        assert!(detector().detect(&op, &log, now).is_empty());
    }

    #[test]
    fn test_lagging_client_clock_does_not_hide_older_entries() {
        let now = Utc::now();
        let u1 = UserId::new();
        let u2 = UserId::new();
        let u3 = UserId::new();

        let first = Operation::insert(u1, "f", Position::new(0, 0), "A").with_timestamp(now);
        let lagging = Operation::insert(u3, "f", Position::new(6, 0), "x")
            .with_timestamp(now - Duration::seconds(6));
        let log = logged(&[first.clone(), lagging]);

        let op = Operation::insert(u2, "f", Position::new(0, 0), "B").with_timestamp(now);
        let conflicts = detector().detect(&op, &log, now);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].operations, [op.id, first.id]);
    }

    #[test]
    fn test_one_conflict_per_overlapping_prior() {
        let now = Utc::now();
        let u1 = UserId::new();
        let u2 = UserId::new();

        let first = Operation::insert(u1, "f", Position::new(1, 0), "a").with_timestamp(now);
        let second = Operation::delete(u1, "f", Position::new(2, 3), "b").with_timestamp(now);
        let log = logged(&[first, second]);

        let op = Operation::insert(u2, "f", Position::new(1, 2), "c").with_timestamp(now);
        let conflicts = detector().detect(&op, &log, now);
        assert_eq!(conflicts.len(), 2);
        assert!(conflicts.iter().any(|c| !c.auto_resolvable));
    }

    #[test]
    fn test_override_requires_content() {
        let conflict = Conflict {
            id: ConflictId::new(),
            kind: ConflictType::Content,
            file: "f".into(),
            operations: [OperationId::new(), OperationId::new()],
            users: [UserId::new(), UserId::new()],
            description: String::new(),
            auto_resolvable: true,
            resolution: None,
            created_at: Utc::now(),
            resolved_at: None,
            resolved_by: None,
        };
        let file = File::new("f", "text", None, Utc::now());

        let err = ConflictResolver::resolve(
            &conflict,
            ResolutionStrategy::Override,
            None,
            &file,
            &OperationLog::new(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::ValidationFailed);

        let resolved = ConflictResolver::resolve(
            &conflict,
            ResolutionStrategy::Manual,
            Some("new"),
            &file,
            &OperationLog::new(),
        )
        .unwrap();
        assert_eq!(resolved.content, "new");
    }
}
