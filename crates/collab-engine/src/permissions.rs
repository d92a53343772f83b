//! Role to capability mapping.
use serde::{Deserialize, Serialize};

use crate::OperationType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Owner,
    Editor,
    Reviewer,
    Observer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Owner => "owner",
            Role::Editor => "editor",
            Role::Reviewer => "reviewer",
            Role::Observer => "observer",
        }
    }

    pub fn permissions(self) -> Permissions {
        Permissions::for_role(self)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capabilities a user holds in a session. Fixed at join time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Permissions {
    pub can_edit: bool,
    pub can_comment: bool,
    pub can_approve: bool,
    pub can_merge: bool,
    pub can_invite: bool,
    pub can_change_settings: bool,
}

impl Permissions {
    pub const fn for_role(role: Role) -> Self {
        match role {
            Role::Owner => Self {
                can_edit: true,
                can_comment: true,
                can_approve: true,
                can_merge: true,
                can_invite: true,
                can_change_settings: true,
            },
            Role::Editor => Self {
                can_edit: true,
                can_comment: true,
                can_approve: false,
                can_merge: false,
                can_invite: false,
                can_change_settings: false,
            },
            Role::Reviewer => Self {
                can_edit: false,
                can_comment: true,
                can_approve: true,
                can_merge: false,
                can_invite: false,
                can_change_settings: false,
            },
            Role::Observer => Self {
                can_edit: false,
                can_comment: false,
                can_approve: false,
                can_merge: false,
                can_invite: false,
                can_change_settings: false,
            },
        }
    }

    /// Whether these permissions allow submitting an operation of `kind`
    pub fn allows(&self, kind: OperationType) -> bool {
        match kind {
            OperationType::Insert
            | OperationType::Delete
            | OperationType::Replace
            | OperationType::Move => self.can_edit,
            OperationType::Comment => self.can_comment,
            OperationType::Approve => self.can_approve,
            OperationType::Merge | OperationType::Resolve => self.can_merge,
        }
    }
}
