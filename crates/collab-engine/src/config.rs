//! Engine-wide and per-session configuration.
use serde::{Deserialize, Serialize};

use crate::{CollaborationError, Result};

/// Longest auto-save interval a session may ask for
pub const MAX_SAVE_INTERVAL_SECS: u64 = 7 * 24 * 60 * 60;
/// Longest retention period a session may ask for
pub const MAX_RETENTION_DAYS: u32 = 10 * 365;
/// Largest session a client may create
pub const MAX_SESSION_USERS: usize = 1_000;

/// Whole seconds as a duration, saturating at `Duration::MAX`
fn seconds(secs: u64) -> chrono::Duration {
    i64::try_from(secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .unwrap_or(chrono::Duration::MAX)
}

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Interval between idle-session / lock-expiry sweeps
    pub sweep_interval_secs: u64,
    /// Interval between auto-save passes
    pub auto_save_interval_secs: u64,
    /// A session closes once every user has been silent this long
    pub idle_timeout_secs: u64,
    /// Operations closer together than this can conflict
    pub conflict_window_ms: u64,
    /// Max line distance for two operations to overlap
    pub conflict_line_window: usize,
    /// Max column distance for two operations to overlap
    pub conflict_column_window: usize,
    /// Content snapshots kept per file for merge/revert
    pub max_revisions: usize,
    /// Recently applied operations kept per file for transformation
    pub max_pending_operations: usize,
    /// Lock timeout applied when the caller does not pass one
    pub default_lock_timeout_secs: u64,
    /// Longest lock a caller may request
    pub max_lock_timeout_secs: u64,
    /// Lifecycle event channel capacity
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 60,
            auto_save_interval_secs: 30,
            idle_timeout_secs: 24 * 60 * 60,
            conflict_window_ms: 5_000,
            conflict_line_window: 1,
            conflict_column_window: 10,
            max_revisions: 100,
            max_pending_operations: 256,
            default_lock_timeout_secs: 300,
            max_lock_timeout_secs: 24 * 60 * 60,
            event_capacity: 1024,
        }
    }
}

impl EngineConfig {
    pub fn idle_timeout(&self) -> chrono::Duration {
        seconds(self.idle_timeout_secs)
    }

    pub fn conflict_window(&self) -> chrono::Duration {
        i64::try_from(self.conflict_window_ms)
            .ok()
            .and_then(chrono::Duration::try_milliseconds)
            .unwrap_or(chrono::Duration::MAX)
    }

    pub fn default_lock_timeout(&self) -> chrono::Duration {
        seconds(self.default_lock_timeout_secs)
    }

    pub fn max_lock_timeout(&self) -> chrono::Duration {
        seconds(self.max_lock_timeout_secs)
    }
}

/// How detected conflicts are handled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolutionMode {
    /// Conflicts stay open until a user resolves them
    #[default]
    Manual,
    /// Auto-resolvable conflicts are merged as soon as they are detected
    Automatic,
}

/// Per-session settings. Missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub max_users: usize,
    pub auto_save: bool,
    pub save_interval_secs: u64,
    pub conflict_resolution: ConflictResolutionMode,
    pub retention_period_days: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_users: 10,
            auto_save: true,
            save_interval_secs: 30,
            conflict_resolution: ConflictResolutionMode::Manual,
            retention_period_days: 30,
        }
    }
}

impl SessionConfig {
    /// Reject settings a client should not be able to ask for
    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_SESSION_USERS).contains(&self.max_users) {
            return Err(CollaborationError::Validation(format!(
                "max_users must be between 1 and {MAX_SESSION_USERS}"
            )));
        }
        if !(1..=MAX_SAVE_INTERVAL_SECS).contains(&self.save_interval_secs) {
            return Err(CollaborationError::Validation(format!(
                "save_interval_secs must be between 1 and {MAX_SAVE_INTERVAL_SECS}"
            )));
        }
        if !(1..=MAX_RETENTION_DAYS).contains(&self.retention_period_days) {
            return Err(CollaborationError::Validation(format!(
                "retention_period_days must be between 1 and {MAX_RETENTION_DAYS}"
            )));
        }
        Ok(())
    }

    pub fn save_interval(&self) -> chrono::Duration {
        seconds(self.save_interval_secs)
    }

    pub fn retention_period(&self) -> chrono::Duration {
        seconds(u64::from(self.retention_period_days) * 24 * 60 * 60)
    }
}
