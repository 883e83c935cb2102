//! Session identity and completed-command records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

// ============================================================================
// Session Key
// ============================================================================

/// Stable identifier for one logical terminal tab.
///
/// Composed of the user identity and the tab/session identity. All per-session
/// state in the engine (registry handles, monitor state, protocol decode
/// state) is indexed by this key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    user_id: String,
    session_id: String,
}

impl SessionKey {
    /// Creates a new session key from user and session identities.
    pub fn new(user_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            session_id: session_id.into(),
        }
    }

    /// Returns the user identity component.
    pub fn user(&self) -> &str {
        &self.user_id
    }

    /// Returns the tab/session identity component.
    pub fn session(&self) -> &str {
        &self.session_id
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.user_id, self.session_id)
    }
}

// ============================================================================
// Command Record
// ============================================================================

/// A completed command with its metadata.
///
/// Created the instant an exit marker (or the fallback completion heuristic)
/// resolves a pending command. Immutable once created; appended to a bounded
/// per-session history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRecord {
    /// Monotonic per-session sequence number (1-based).
    pub sequence: u64,

    /// The command text as captured from markers or keystrokes.
    pub command: String,

    /// Working directory at the time of execution, if known.
    pub pwd: String,

    /// Exit code reported by the shell, or inferred heuristically.
    pub exit_code: i32,

    /// Wall-clock time the command started executing.
    pub started_at: DateTime<Utc>,

    /// Wall-clock time the command finished.
    pub ended_at: DateTime<Utc>,

    /// Execution duration.
    pub duration: Duration,
}

impl CommandRecord {
    /// Returns true if the command exited successfully.
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_key_display() {
        let key = SessionKey::new("user-1", "tab-a");
        assert_eq!(key.to_string(), "user-1:tab-a");
        assert_eq!(key.user(), "user-1");
        assert_eq!(key.session(), "tab-a");
    }

    #[test]
    fn test_session_key_equality_and_hash() {
        use std::collections::HashMap;

        let a = SessionKey::new("u", "s");
        let b = SessionKey::new("u", "s");
        let c = SessionKey::new("u", "other");
        assert_eq!(a, b);
        assert_ne!(a, c);

        let mut map = HashMap::new();
        map.insert(a, 1);
        assert_eq!(map.get(&b), Some(&1));
        assert_eq!(map.get(&c), None);
    }

    #[test]
    fn test_command_record_succeeded() {
        let now = Utc::now();
        let record = CommandRecord {
            sequence: 1,
            command: "ls".to_string(),
            pwd: "/home/user".to_string(),
            exit_code: 0,
            started_at: now,
            ended_at: now,
            duration: Duration::from_millis(12),
        };
        assert!(record.succeeded());

        let failed = CommandRecord {
            exit_code: 127,
            ..record
        };
        assert!(!failed.succeeded());
    }

    #[test]
    fn test_command_record_serde_round_trip() {
        let now = Utc::now();
        let record = CommandRecord {
            sequence: 7,
            command: "cargo build".to_string(),
            pwd: "/work".to_string(),
            exit_code: 1,
            started_at: now,
            ended_at: now,
            duration: Duration::from_secs(3),
        };

        let json = serde_json::to_string(&record).expect("serialize");
        let back: CommandRecord = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, record);
    }
}
