//! Per-session join/leave flags.
//!
//! The flags outlive any one tracker so that remounting a live view for the
//! same session never sends a second join or leave.

use crate::registry::lock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

/// Whether a session has already been joined and left.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinLeaveInfo {
    pub joined: bool,
    pub left: bool,
}

/// Storage for [`JoinLeaveInfo`] keyed by session uid.
pub trait SessionFlagStore: Send + Sync {
    fn load(&self, session_uid: &str) -> JoinLeaveInfo;

    fn store(&self, session_uid: &str, info: JoinLeaveInfo);

    /// Set `joined` if it was not already set. Returns whether it changed.
    fn mark_joined(&self, session_uid: &str) -> bool {
        let mut info = self.load(session_uid);
        if info.joined {
            return false;
        }
        info.joined = true;
        self.store(session_uid, info);
        true
    }

    /// Set `left` if the session was joined and not yet left. Returns whether
    /// it changed.
    fn mark_left(&self, session_uid: &str) -> bool {
        let mut info = self.load(session_uid);
        if !info.joined || info.left {
            return false;
        }
        info.left = true;
        self.store(session_uid, info);
        true
    }
}

/// In-process flag store.
#[derive(Debug, Default)]
pub struct MemoryFlagStore {
    sessions: Mutex<HashMap<String, JoinLeaveInfo>>,
}

impl MemoryFlagStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionFlagStore for MemoryFlagStore {
    fn load(&self, session_uid: &str) -> JoinLeaveInfo {
        lock(&self.sessions)
            .get(session_uid)
            .copied()
            .unwrap_or_default()
    }

    fn store(&self, session_uid: &str, info: JoinLeaveInfo) {
        lock(&self.sessions).insert(session_uid.to_string(), info);
    }

    // Check and set under one lock so concurrent trackers cannot both win.
    fn mark_joined(&self, session_uid: &str) -> bool {
        let mut sessions = lock(&self.sessions);
        let info = sessions.entry(session_uid.to_string()).or_default();
        if info.joined {
            return false;
        }
        info.joined = true;
        true
    }

    fn mark_left(&self, session_uid: &str) -> bool {
        let mut sessions = lock(&self.sessions);
        let info = sessions.entry(session_uid.to_string()).or_default();
        if !info.joined || info.left {
            return false;
        }
        info.left = true;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_flip_once() {
        let store = MemoryFlagStore::new();
        assert_eq!(store.load("s1"), JoinLeaveInfo::default());

        assert!(!store.mark_left("s1"));
        assert!(store.mark_joined("s1"));
        assert!(!store.mark_joined("s1"));
        assert!(store.mark_left("s1"));
        assert!(!store.mark_left("s1"));

        assert_eq!(
            store.load("s1"),
            JoinLeaveInfo {
                joined: true,
                left: true
            }
        );
        assert_eq!(store.load("s2"), JoinLeaveInfo::default());
    }

    struct PlainStore(MemoryFlagStore);

    impl SessionFlagStore for PlainStore {
        fn load(&self, session_uid: &str) -> JoinLeaveInfo {
            self.0.load(session_uid)
        }

        fn store(&self, session_uid: &str, info: JoinLeaveInfo) {
            self.0.store(session_uid, info)
        }
    }

    #[test]
    fn test_default_mark_methods() {
        let store = PlainStore(MemoryFlagStore::new());
        assert!(store.mark_joined("s1"));
        assert!(!store.mark_joined("s1"));
        assert!(store.mark_left("s1"));
        assert!(store.load("s1").left);
    }

    #[test]
    fn test_info_serializes() {
        let info = JoinLeaveInfo {
            joined: true,
            left: false,
        };
        let json = serde_json::to_string(&info).unwrap();
        assert_eq!(json, r#"{"joined":true,"left":false}"#);
    }
}
