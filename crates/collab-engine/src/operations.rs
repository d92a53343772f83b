//! Document operations and their application to file content.
//! Content is addressed by (line, column) with columns counted in characters.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::{OperationId, UserId};

/// Line/column position inside a file. Both are zero-based.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Position {
    pub line: usize,
    pub column: usize,
}

impl Position {
    pub const fn new(line: usize, column: usize) -> Self {
        Self { line, column }
    }

    /// Position reached after writing `text` starting here
    pub fn advance(self, text: &str) -> Position {
        match text.rfind('\n') {
            Some(last) => Position {
                line: self.line + text.matches('\n').count(),
                column: text[last + 1..].chars().count(),
            },
            None => Position {
                line: self.line,
                column: self.column + text.chars().count(),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Insert,
    Delete,
    Replace,
    Move,
    Comment,
    Approve,
    Merge,
    Resolve,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Insert => "insert",
            OperationType::Delete => "delete",
            OperationType::Replace => "replace",
            OperationType::Move => "move",
            OperationType::Comment => "comment",
            OperationType::Approve => "approve",
            OperationType::Merge => "merge",
            OperationType::Resolve => "resolve",
        }
    }

    /// Whether this kind changes file content
    pub fn is_edit(self) -> bool {
        matches!(
            self,
            OperationType::Insert
                | OperationType::Delete
                | OperationType::Replace
                | OperationType::Move
        )
    }
}

/// An operation submitted by a user against one file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub id: OperationId,

    #[serde(rename = "type")]
    pub kind: OperationType,

    pub user_id: UserId,

    /// Client timestamp; orders simultaneous inserts
    pub timestamp: DateTime<Utc>,

    /// Target file path
    pub file: String,

    pub position: Position,

    /// Destination of a move, in coordinates after the text was removed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<Position>,

    /// Inserted text (insert/replace), removed text (delete), moved text (move)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,

    /// Text a replace overwrites
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_content: Option<String>,

    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,

    #[serde(default)]
    pub dependencies: Vec<OperationId>,

    #[serde(default)]
    pub conflicts_with: Vec<OperationId>,

    /// File version the client edited against
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_version: Option<u64>,

    /// File version produced by applying this operation (set by the engine)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_version: Option<u64>,

    /// Operations this copy was transformed against before being applied
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transformed_against: Vec<OperationId>,
}

impl Operation {
    pub fn new(
        kind: OperationType,
        user_id: UserId,
        file: impl Into<String>,
        position: Position,
    ) -> Self {
        Self {
            id: OperationId::new(),
            kind,
            user_id,
            timestamp: Utc::now(),
            file: file.into(),
            position,
            target: None,
            content: None,
            previous_content: None,
            metadata: serde_json::Map::new(),
            dependencies: Vec::new(),
            conflicts_with: Vec::new(),
            base_version: None,
            file_version: None,
            transformed_against: Vec::new(),
        }
    }

    pub fn insert(
        user_id: UserId,
        file: impl Into<String>,
        position: Position,
        text: impl Into<String>,
    ) -> Self {
        Self::new(OperationType::Insert, user_id, file, position).with_content(text)
    }

    pub fn delete(
        user_id: UserId,
        file: impl Into<String>,
        position: Position,
        removed: impl Into<String>,
    ) -> Self {
        Self::new(OperationType::Delete, user_id, file, position).with_content(removed)
    }

    pub fn replace(
        user_id: UserId,
        file: impl Into<String>,
        position: Position,
        previous: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        let mut op = Self::new(OperationType::Replace, user_id, file, position).with_content(text);
        op.previous_content = Some(previous.into());
        op
    }

    pub fn move_text(
        user_id: UserId,
        file: impl Into<String>,
        position: Position,
        text: impl Into<String>,
        target: Position,
    ) -> Self {
        let mut op = Self::new(OperationType::Move, user_id, file, position).with_content(text);
        op.target = Some(target);
        op
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_base_version(mut self, version: u64) -> Self {
        self.base_version = Some(version);
        self
    }

    pub fn with_dependencies(mut self, dependencies: Vec<OperationId>) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn is_edit(&self) -> bool {
        self.kind.is_edit()
    }

    /// Text this operation removes from the file
    pub fn removed_text(&self) -> &str {
        match self.kind {
            OperationType::Delete | OperationType::Move => self.content.as_deref().unwrap_or(""),
            OperationType::Replace => self.previous_content.as_deref().unwrap_or(""),
            _ => "",
        }
    }

    /// Text this operation writes into the file at `position`
    pub fn inserted_text(&self) -> &str {
        match self.kind {
            OperationType::Insert | OperationType::Replace => {
                self.content.as_deref().unwrap_or("")
            }
            _ => "",
        }
    }

    /// Apply this operation to `content`. Stale positions are a no-op.
    pub fn apply(&self, content: &str) -> String {
        let applied = match self.kind {
            OperationType::Insert | OperationType::Delete | OperationType::Replace => splice(
                content,
                self.position,
                self.removed_text().chars().count(),
                self.inserted_text(),
            ),
            OperationType::Move => self.apply_move(content),
            _ => None,
        };

        applied.unwrap_or_else(|| content.to_string())
    }

    fn apply_move(&self, content: &str) -> Option<String> {
        let target = self.target?;
        let start = byte_offset(content, self.position)?;
        let end = advance_chars(content, start, self.removed_text().chars().count());
        let moved = &content[start..end];

        let mut without = String::with_capacity(content.len());
        without.push_str(&content[..start]);
        without.push_str(&content[end..]);

        splice(&without, target, 0, moved)
    }
}

/// Replace `remove` characters at `position` with `insert`.
/// Returns `None` when the line does not exist.
fn splice(content: &str, position: Position, remove: usize, insert: &str) -> Option<String> {
    let start = byte_offset(content, position)?;
    let end = advance_chars(content, start, remove);

    let mut out = String::with_capacity(content.len() + insert.len());
    out.push_str(&content[..start]);
    out.push_str(insert);
    out.push_str(&content[end..]);
    Some(out)
}

/// Byte offset of `position`, with the column clamped to the end of its line.
pub(crate) fn byte_offset(content: &str, position: Position) -> Option<usize> {
    let mut line_start = 0;
    for _ in 0..position.line {
        let newline = content[line_start..].find('\n')?;
        line_start += newline + 1;
    }

    let rest = &content[line_start..];
    let line = match rest.find('\n') {
        Some(end) => &rest[..end],
        None => rest,
    };
    let column = line
        .char_indices()
        .nth(position.column)
        .map(|(idx, _)| idx)
        .unwrap_or(line.len());

    Some(line_start + column)
}

fn advance_chars(content: &str, start: usize, chars: usize) -> usize {
    content[start..]
        .char_indices()
        .nth(chars)
        .map(|(idx, _)| start + idx)
        .unwrap_or(content.len())
}

/// Append-only log of applied operations
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "Vec<Operation>", into = "Vec<Operation>")]
pub struct OperationLog {
    operations: Vec<Operation>,
    operation_index: HashMap<OperationId, usize>,
}

impl OperationLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, op: Operation) {
        self.operation_index.insert(op.id, self.operations.len());
        self.operations.push(op);
    }

    pub fn get(&self, id: &OperationId) -> Option<&Operation> {
        self.operation_index
            .get(id)
            .and_then(|&idx| self.operations.get(idx))
    }

    /// Position of an operation in the log
    pub fn index_of(&self, id: &OperationId) -> Option<usize> {
        self.operation_index.get(id).copied()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Operation> {
        self.operations.iter()
    }

    pub fn as_slice(&self) -> &[Operation] {
        &self.operations
    }

    /// Operations stamped less than `window` before `now`, newest first. Timestamps come
    /// from clients and need not follow log order, so every entry is checked.
    pub fn recent(
        &self,
        now: DateTime<Utc>,
        window: chrono::Duration,
    ) -> impl Iterator<Item = &Operation> {
        self.operations
            .iter()
            .rev()
            .filter(move |op| now.signed_duration_since(op.timestamp) < window)
    }
}

impl From<Vec<Operation>> for OperationLog {
    fn from(operations: Vec<Operation>) -> Self {
        let operation_index = operations
            .iter()
            .enumerate()
            .map(|(idx, op)| (op.id, idx))
            .collect();
        Self {
            operations,
            operation_index,
        }
    }
}

impl From<OperationLog> for Vec<Operation> {
    fn from(log: OperationLog) -> Self {
        log.operations
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> UserId {
        UserId::new()
    }

    #[test]
    fn test_insert_splices_at_column() {
        let op = Operation::insert(user(), "f.txt", Position::new(1, 3), "XY");
        assert_eq!(op.apply("hello\nworld"), "hello\nworXYld");
    }

    #[test]
    fn test_insert_column_past_line_end_appends_to_line() {
        let op = Operation::insert(user(), "f.txt", Position::new(0, 99), "!");
        assert_eq!(op.apply("ab\ncd"), "ab!\ncd");
    }

    #[test]
    fn test_delete_removes_content_length() {
        let op = Operation::delete(user(), "f.txt", Position::new(0, 1), "ell");
        assert_eq!(op.apply("hello"), "ho");
    }

    #[test]
    fn test_delete_can_span_lines() {
        let op = Operation::delete(user(), "f.txt", Position::new(0, 2), "\nc");
        assert_eq!(op.apply("ab\ncd"), "abd");
    }

    #[test]
    fn test_replace_uses_previous_content_length() {
        let op = Operation::replace(user(), "f.txt", Position::new(0, 6), "world", "rust");
        assert_eq!(op.apply("hello world"), "hello rust");
    }

    #[test]
    fn test_out_of_range_line_is_noop() {
        let op = Operation::insert(user(), "f.txt", Position::new(7, 0), "x");
        assert_eq!(op.apply("one\ntwo"), "one\ntwo");
    }

    #[test]
    fn test_multibyte_columns_count_characters() {
        let op = Operation::insert(user(), "f.txt", Position::new(0, 2), "-");
        assert_eq!(op.apply("héllo"), "hé-llo");
    }

    #[test]
    fn test_move_relocates_text() {
        let op = Operation::move_text(
            user(),
            "f.txt",
            Position::new(0, 0),
            "abc ",
            Position::new(0, 4),
        );
        assert_eq!(op.apply("abc def"), "defabc ");
    }

    #[test]
    fn test_non_edit_operations_leave_content() {
        let op = Operation::new(OperationType::Approve, user(), "f.txt", Position::default());
        assert_eq!(op.apply("text"), "text");
    }

    #[test]
    fn test_position_advance() {
        let start = Position::new(2, 4);
        assert_eq!(start.advance("abc"), Position::new(2, 7));
        assert_eq!(start.advance("ab\ncd\nxyz"), Position::new(4, 3));
        assert_eq!(start.advance(""), start);
    }

    #[test]
    fn test_log_roundtrip_rebuilds_index() {
        let mut log = OperationLog::new();
        let op = Operation::insert(user(), "f.txt", Position::default(), "a");
        let id = op.id;
        log.push(op);

        let json = serde_json::to_string(&log).unwrap();
        let restored: OperationLog = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.len(), 1);
        assert!(restored.get(&id).is_some());
    }

    #[test]
    fn test_wire_format_uses_type_field() {
        let op = Operation::insert(user(), "f.txt", Position::new(0, 0), "a");
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["type"], "insert");
        assert_eq!(json["file"], "f.txt");
        assert!(json.get("userId").is_some());
    }
}
