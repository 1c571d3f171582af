//! Session data model (spec.md §3 `Session`).

use chrono::{DateTime, Utc};
use sandbox_proto::hosts::Allowlist;

/// The central entity: a live container plus the policy and metadata
/// controlling access to it.
///
/// Invariants (spec.md §3), upheld by [`crate::service::SessionManager`]:
/// - while present in the session table, its container exists and its
///   agent answered `/health` at least once;
/// - `last_activity >= created_at`;
/// - `allowed_hosts` is immutable after construction.
#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: String,
    pub tenant_id: Option<String>,
    pub container_handle: String,
    pub api_host: String,
    pub api_port: u16,
    pub allowed_hosts: Allowlist,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl Session {
    pub fn api_url(&self) -> String {
        format!("http://{}:{}", self.api_host, self.api_port)
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        // `last_activity` only ever moves forward; a racing update that
        // observes a slightly stale `now` must not roll the timestamp back
        // (spec.md §3 invariant `last_activity >= created_at`, §5 "eventually
        // correct under the invariant 'expired at decision time'").
        if now > self.last_activity {
            self.last_activity = now;
        }
    }
}

/// Snapshot returned by `ListSessions`/`GetSession` (spec.md §4.5, §4.6):
/// deliberately a plain value, decoupled from the live [`Session`] so
/// callers can't mutate manager state through it.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub session_id: String,
    pub tenant_id: Option<String>,
    pub container_id: String,
    pub allowed_hosts: Allowlist,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl From<&Session> for SessionInfo {
    fn from(s: &Session) -> Self {
        Self {
            session_id: s.session_id.clone(),
            tenant_id: s.tenant_id.clone(),
            container_id: s.container_handle.clone(),
            allowed_hosts: s.allowed_hosts.clone(),
            created_at: s.created_at,
            last_activity: s.last_activity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        let now = Utc::now();
        Session {
            session_id: "sess-1".to_string(),
            tenant_id: None,
            container_handle: "abc123".to_string(),
            api_host: "127.0.0.1".to_string(),
            api_port: 49999,
            allowed_hosts: Allowlist::none(),
            created_at: now,
            last_activity: now,
        }
    }

    #[test]
    fn touch_advances_last_activity() {
        let mut s = session();
        let later = s.created_at + chrono::Duration::seconds(5);
        s.touch(later);
        assert_eq!(s.last_activity, later);
    }

    #[test]
    fn touch_never_moves_backward() {
        let mut s = session();
        let later = s.created_at + chrono::Duration::seconds(5);
        s.touch(later);
        s.touch(s.created_at);
        assert_eq!(s.last_activity, later);
    }
}
