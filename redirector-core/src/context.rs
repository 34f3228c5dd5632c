//! Request context passed to rule evaluation.

use std::collections::HashMap;

/// Context key carrying the client session id.
pub const SESSION_ID: &str = "sessionId";

/// Context key that switches on per-session diagnostic logging.
pub const TEST_INFO: &str = "testInfo";

/// Client-supplied parameters for one routing decision.
///
/// Read-only once handed to the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Context {
    params: HashMap<String, String>,
}

impl Context {
    /// An empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Look up a parameter.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// All parameters.
    pub fn params(&self) -> &HashMap<String, String> {
        &self.params
    }

    /// The session id, if the client sent one.
    pub fn session_id(&self) -> Option<&str> {
        self.get(SESSION_ID).filter(|s| !s.is_empty())
    }

    /// Whether the request asked for diagnostic logging.
    pub fn is_test_mode(&self) -> bool {
        matches!(self.get(TEST_INFO), Some(v) if !v.is_empty() && !v.eq_ignore_ascii_case("false"))
    }

    /// Session to log diagnostics into: set only in test mode with a session id.
    pub fn diagnostic_session(&self) -> Option<&str> {
        if self.is_test_mode() {
            self.session_id()
        } else {
            None
        }
    }
}

impl From<HashMap<String, String>> for Context {
    fn from(params: HashMap<String, String>) -> Self {
        Self { params }
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Context {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            params: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }
}
