use dashmap::DashMap;
use log::debug;
use std::collections::HashMap;
use uuid::Uuid;

/// the session a request was attached to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub token: String,
    /// true when the token was minted for this request
    pub is_new: bool,
}

/// session token -> per-session key/value store.
///
/// sessions are never expired, so the registry grows with every new client.
/// that mirrors the upstream application's session model; `len` is exposed
/// so the console can report the size.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, HashMap<String, String>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// returns the session named by the cookie header when it is known,
    /// otherwise mints and registers a fresh one
    pub fn resolve(&self, cookie_header: Option<&str>, cookie_name: &str) -> Session {
        if let Some(token) = cookie_header.and_then(|h| find_cookie(h, cookie_name)) {
            if self.contains(token) {
                debug!("existing session {}", token);
                return Session {
                    token: token.to_string(),
                    is_new: false,
                };
            }
        }

        let token = Uuid::new_v4().simple().to_string();
        self.sessions.insert(token.clone(), HashMap::new());
        debug!("new session {}", token);
        Session { token, is_new: true }
    }

    pub fn contains(&self, token: &str) -> bool {
        self.sessions.contains_key(token)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }
}

/// finds `name=value` inside a `Cookie` header
fn find_cookie<'a>(header: &'a str, name: &str) -> Option<&'a str> {
    header
        .split(';')
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(k, _)| k.trim() == name)
        .map(|(_, v)| v.trim())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mints_when_no_cookie() {
        let registry = SessionRegistry::new();
        let session = registry.resolve(None, "PHPSESSID");
        assert!(session.is_new);
        assert!(registry.contains(&session.token));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn recognises_known_token() {
        let registry = SessionRegistry::new();
        let first = registry.resolve(None, "PHPSESSID");
        let header = format!("theme=dark; PHPSESSID={}", first.token);

        let second = registry.resolve(Some(&header), "PHPSESSID");
        assert_eq!(second.token, first.token);
        assert!(!second.is_new);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn unknown_token_gets_replaced() {
        let registry = SessionRegistry::new();
        let session = registry.resolve(Some("PHPSESSID=forged"), "PHPSESSID");
        assert!(session.is_new);
        assert_ne!(session.token, "forged");
        assert!(!registry.contains("forged"));
    }

    #[test]
    fn tokens_are_unique() {
        let registry = SessionRegistry::new();
        let a = registry.resolve(None, "PHPSESSID");
        let b = registry.resolve(None, "PHPSESSID");
        assert_ne!(a.token, b.token);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn cookie_lookup() {
        assert_eq!(find_cookie("a=1; sid=xyz", "sid"), Some("xyz"));
        assert_eq!(find_cookie("sid=", "sid"), None);
        assert_eq!(find_cookie("other=1", "sid"), None);
    }
}
