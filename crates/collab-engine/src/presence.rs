/// User presence in a collaborative session
/// Identity, role, colour and where the user is working
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Permissions, Position, Role, UserId};

/// Authenticated identity supplied by the caller when creating or joining a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    pub id: UserId,
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub avatar: Option<String>,
}

impl UserIdentity {
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id: UserId::new(),
            name: name.into(),
            email: email.into(),
            avatar: None,
        }
    }
}

/// Colour assigned to a user for cursor/selection highlighting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

/// Colours handed out to users, indexed by a hash of their id
const PALETTE: [UserColor; 8] = [
    UserColor::new(0xE5, 0x39, 0x35),
    UserColor::new(0x1E, 0x88, 0xE5),
    UserColor::new(0x43, 0xA0, 0x47),
    UserColor::new(0xFB, 0x8C, 0x00),
    UserColor::new(0x8E, 0x24, 0xAA),
    UserColor::new(0x00, 0xAC, 0xC1),
    UserColor::new(0xD8, 0x1B, 0x60),
    UserColor::new(0x6D, 0x4C, 0x41),
];

impl UserColor {
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Same id, same colour, across sessions and restarts
    pub fn from_user_id(user_id: UserId) -> Self {
        let slot = user_id
            .0
            .as_bytes()
            .iter()
            .fold(0usize, |acc, byte| acc.wrapping_mul(31).wrapping_add(*byte as usize));
        PALETTE[slot % PALETTE.len()]
    }

    /// `#RRGGBB`
    pub fn to_hex(&self) -> String {
        format!("#{:02X}{:02X}{:02X}", self.r, self.g, self.b)
    }
}

/// Cursor location of a user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorPosition {
    pub file: String,
    pub position: Position,
}

/// Selected range of a user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub file: String,
    pub start: Position,
    pub end: Position,
}

/// A participant in a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: UserId,
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub avatar: Option<String>,
    pub role: Role,
    pub color: UserColor,
    #[serde(default)]
    pub cursor: Option<CursorPosition>,
    #[serde(default)]
    pub selection: Option<Selection>,
    pub is_active: bool,
    pub last_seen: DateTime<Utc>,
    /// Derived from `role` at join time
    pub permissions: Permissions,
}

impl User {
    pub fn new(identity: UserIdentity, role: Role, now: DateTime<Utc>) -> Self {
        Self {
            id: identity.id,
            name: identity.name,
            email: identity.email,
            avatar: identity.avatar,
            role,
            color: UserColor::from_user_id(identity.id),
            cursor: None,
            selection: None,
            is_active: true,
            last_seen: now,
            permissions: role.permissions(),
        }
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_seen = now;
        self.is_active = true;
    }

    /// No activity for longer than `timeout`
    pub fn is_idle(&self, now: DateTime<Utc>, timeout: chrono::Duration) -> bool {
        now - self.last_seen > timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_color_from_id() {
        let id = UserId::new();
        let color = UserColor::from_user_id(id);
        assert_eq!(color, UserColor::from_user_id(id));
        assert!(PALETTE.contains(&color));

        let hex = color.to_hex();
        assert!(hex.starts_with('#'));
        assert_eq!(hex.len(), 7);
    }

    #[test]
    fn test_permissions_follow_role() {
        let user = User::new(
            UserIdentity::new("Rita", "rita@example.com"),
            Role::Reviewer,
            Utc::now(),
        );
        assert!(!user.permissions.can_edit);
        assert!(user.permissions.can_approve);
        assert_eq!(user.color, UserColor::from_user_id(user.id));
    }

    #[test]
    fn test_idle_detection() {
        let now = Utc::now();
        let mut user = User::new(UserIdentity::new("Bob", "bob@example.com"), Role::Editor, now);
        let timeout = chrono::Duration::hours(24);

        assert!(!user.is_idle(now, timeout));
        assert!(user.is_idle(now + chrono::Duration::hours(25), timeout));

        user.touch(now + chrono::Duration::hours(25));
        assert!(!user.is_idle(now + chrono::Duration::hours(25), timeout));
    }
}
