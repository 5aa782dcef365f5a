use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Fallback identity when the caller could not resolve a user from headers.
pub const ANONYMOUS_USER: &str = "anonymous";

/// The identity a quota decision is scoped to.
///
/// Header resolution (auth headers, forwarded-for chains) happens in the
/// route handlers; by the time this crate sees a request, identity is just a
/// pair of strings. Distinct users behind a shared proxy can collide into
/// one bucket — accepted for this demo-grade quota system.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: String,
    pub session_id: String,
}

impl Identity {
    pub fn new(user_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            session_id: session_id.into(),
        }
    }

    /// Fills in the defaults: `"anonymous"` for a missing user, and
    /// `user_id:YYYY-MM-DD` (current UTC date) for a missing session.
    pub fn resolve(user_id: Option<&str>, session_id: Option<&str>) -> Self {
        let user_id = user_id
            .filter(|u| !u.is_empty())
            .unwrap_or(ANONYMOUS_USER)
            .to_string();
        let session_id = match session_id.filter(|s| !s.is_empty()) {
            Some(session_id) => session_id.to_string(),
            None => format!("{user_id}:{}", Utc::now().format("%Y-%m-%d")),
        };
        Self {
            user_id,
            session_id,
        }
    }

    pub fn anonymous() -> Self {
        Self::resolve(None, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_defaults_to_anonymous() {
        let identity = Identity::resolve(None, None);
        assert_eq!(identity.user_id, ANONYMOUS_USER);
        assert!(identity.session_id.starts_with("anonymous:"));
    }

    #[test]
    fn test_resolve_derives_session_from_user_and_date() {
        let identity = Identity::resolve(Some("u-42"), None);
        assert_eq!(identity.user_id, "u-42");
        let date = Utc::now().format("%Y-%m-%d").to_string();
        assert_eq!(identity.session_id, format!("u-42:{date}"));
    }

    #[test]
    fn test_resolve_keeps_explicit_session() {
        let identity = Identity::resolve(Some("u-42"), Some("s-1"));
        assert_eq!(identity.session_id, "s-1");
    }

    #[test]
    fn test_empty_strings_are_treated_as_missing() {
        let identity = Identity::resolve(Some(""), Some(""));
        assert_eq!(identity.user_id, ANONYMOUS_USER);
        assert!(identity.session_id.contains(':'));
    }
}
