//! Operational transform for concurrent text operations on the same file.
//!
//! Insert, delete and replace are all handled as one shape: `removed` text starting at
//! `start`, replaced by `inserted`. Given two operations made against the same content,
//! `transform` rewrites each so that applying them in either order yields the same text.
//!
//! Ordering rules when edits touch:
//! - an edit starting strictly inside a concurrently removed range loses its inserted text
//!   and its removal of the overlap;
//! - at the same start point, the edit removing less goes first; equal removals go in
//!   timestamp order (later goes right, ties broken by operation id).
//!
//! `move` and non-content operations are passed through unchanged.
use crate::{Operation, OperationType, Position};

/// Transform two concurrent operations against each other.
pub fn transform(a: &Operation, b: &Operation) -> (Operation, Operation) {
    (transform_against(a, b), transform_against(b, a))
}

/// Rewrite `op` so it applies on top of content that already has `applied`.
pub fn transform_against(op: &Operation, applied: &Operation) -> Operation {
    if op.file != applied.file || op.id == applied.id {
        return op.clone();
    }

    let (Some(edit), Some(other)) = (Edit::of(op), Edit::of(applied)) else {
        return op.clone();
    };

    let goes_first = edit.goes_before(&other, op, applied);
    let rewritten = edit.rebase(&other, goes_first);

    let mut transformed = op.clone();
    transformed.position = rewritten.start;
    match op.kind {
        OperationType::Insert => transformed.content = Some(rewritten.inserted),
        OperationType::Delete => transformed.content = Some(rewritten.removed),
        OperationType::Replace => {
            transformed.previous_content = Some(rewritten.removed);
            transformed.content = Some(rewritten.inserted);
        }
        _ => return op.clone(),
    }
    transformed.transformed_against.push(applied.id);
    transformed
}

struct Edit<'a> {
    start: Position,
    removed: &'a str,
    inserted: &'a str,
}

struct Rebased {
    start: Position,
    removed: String,
    inserted: String,
}

impl<'a> Edit<'a> {
    fn of(op: &'a Operation) -> Option<Self> {
        match op.kind {
            OperationType::Insert | OperationType::Delete | OperationType::Replace => Some(Self {
                start: op.position,
                removed: op.removed_text(),
                inserted: op.inserted_text(),
            }),
            _ => None,
        }
    }

    fn removed_end(&self) -> Position {
        self.start.advance(self.removed)
    }

    fn inserted_end(&self) -> Position {
        self.start.advance(self.inserted)
    }

    /// Tie-break for two edits starting at the same position.
    fn goes_before(&self, other: &Edit, op: &Operation, other_op: &Operation) -> bool {
        let len = self.removed.chars().count();
        let other_len = other.removed.chars().count();
        if len != other_len {
            return len < other_len;
        }
        (op.timestamp, op.id) < (other_op.timestamp, other_op.id)
    }

    /// Char offset inside `removed` of a position within the removed range
    fn offset_of(&self, target: Position) -> usize {
        let mut cursor = self.start;
        for (idx, ch) in self.removed.chars().enumerate() {
            if cursor >= target {
                return idx;
            }
            if ch == '\n' {
                cursor = Position::new(cursor.line + 1, 0);
            } else {
                cursor.column += 1;
            }
        }
        self.removed.chars().count()
    }

    fn removed_slice(&self, from: usize, to: usize) -> String {
        self.removed.chars().skip(from).take(to.saturating_sub(from)).collect()
    }

    /// Map a position at or after `other`'s removed range through `other`
    fn shift(position: Position, other: &Edit) -> Position {
        let end = other.removed_end();
        let new_end = other.inserted_end();
        if position.line == end.line {
            Position::new(new_end.line, new_end.column + (position.column - end.column))
        } else {
            Position::new(position.line - end.line + new_end.line, position.column)
        }
    }

    fn rebase(&self, other: &Edit, goes_first: bool) -> Rebased {
        let (start, end) = (self.start, self.removed_end());
        let (other_start, other_end) = (other.start, other.removed_end());
        let total = self.removed.chars().count();

        if start < other_start || (start == other_start && goes_first) {
            if other_start >= end && start < other_start {
                return self.unchanged(start);
            }

            let overlap_end = self.offset_of(end.min(other_end));
            let removed = if start < other_start {
                // other's inserted text lands inside our removal and goes with it
                let cut = self.offset_of(other_start);
                let mut removed = self.removed_slice(0, cut);
                removed.push_str(other.inserted);
                removed.push_str(&self.removed_slice(overlap_end, total));
                removed
            } else {
                self.removed_slice(overlap_end, total)
            };

            return Rebased {
                start,
                removed,
                inserted: self.inserted.to_string(),
            };
        }

        if start >= other_end {
            return self.unchanged(Edit::shift(start, other));
        }

        // We start inside other's removed range (or share its start and go second).
        let inserted = if start == other_start {
            self.inserted.to_string()
        } else {
            String::new()
        };
        let remainder = if end > other_end {
            self.removed_slice(self.offset_of(other_end), total)
        } else {
            String::new()
        };

        Rebased {
            start: other.inserted_end(),
            removed: remainder,
            inserted,
        }
    }

    fn unchanged(&self, start: Position) -> Rebased {
        Rebased {
            start,
            removed: self.removed.to_string(),
            inserted: self.inserted.to_string(),
        }
    }
}
