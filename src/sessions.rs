use std::collections::HashMap;
use std::sync::Mutex;

use chrono::Utc;

use crate::new_session_token;

#[derive(Debug, Clone)]
pub(crate) struct Session {
    pub(crate) username: String,
    pub(crate) secret_admin: bool,
    #[allow(dead_code)]
    pub(crate) created: i64,
}

/// In-memory session map. Sessions live for the server process; there
/// is no persistence and no expiry beyond logout.
#[derive(Default)]
pub(crate) struct SessionStore {
    sessions: Mutex<HashMap<String, Session>>,
}

impl SessionStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn create(&self, username: &str, secret_admin: bool) -> String {
        let token = new_session_token();
        let session = Session {
            username: username.to_string(),
            secret_admin,
            created: Utc::now().timestamp(),
        };
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.insert(token.clone(), session);
        token
    }

    pub(crate) fn get(&self, token: &str) -> Option<Session> {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.get(token).cloned()
    }

    pub(crate) fn remove(&self, token: &str) {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.remove(token);
    }
}

pub(crate) fn session_cookie(token: &str) -> String {
    format!("session={token}; HttpOnly; Path=/")
}

/// Pull the session token out of a Cookie header value.
pub(crate) fn token_from_cookie_header(value: &str) -> Option<String> {
    for pair in value.split(';') {
        let pair = pair.trim();
        if let Some(token) = pair.strip_prefix("session=") {
            if !token.is_empty() {
                return Some(token.to_string());
            }
        }
    }
    None
}
