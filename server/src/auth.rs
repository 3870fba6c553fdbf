//! Authentication seam.
//!
//! Token validation is owned by the platform's auth subsystem; the voice
//! fabric only needs `token -> user_id`. The WebSocket upgrade and the ICE
//! config endpoint both consult the validator before doing anything else.

use std::collections::HashMap;

/// Validates a bearer credential and resolves the stable user identity.
pub trait TokenValidator: Send + Sync {
    /// Returns the user ID for a valid token, `None` otherwise.
    fn validate(&self, token: &str) -> Option<String>;
}

/// Fixed token table. Development and test deployments only.
#[derive(Debug, Default)]
pub struct StaticTokenValidator {
    tokens: HashMap<String, String>,
}

impl StaticTokenValidator {
    #[must_use]
    pub fn new(pairs: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            tokens: pairs.into_iter().collect(),
        }
    }
}

impl TokenValidator for StaticTokenValidator {
    fn validate(&self, token: &str) -> Option<String> {
        self.tokens.get(token).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_validator_resolves_known_tokens() {
        let v = StaticTokenValidator::new([("tok-a".to_string(), "user-1".to_string())]);
        assert_eq!(v.validate("tok-a").as_deref(), Some("user-1"));
        assert!(v.validate("tok-b").is_none());
    }
}
