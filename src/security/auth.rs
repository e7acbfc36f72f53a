//! Shared-token authentication.

use sha2::{Digest, Sha256};

/// Validates the optional shared token clients present in
/// `params.proxy.authToken`. When no token is configured every request
/// passes.
#[derive(Debug, Clone)]
pub struct AuthGate {
    token: Option<String>,
}

impl AuthGate {
    pub fn new(token: Option<String>) -> Self {
        Self { token }
    }

    pub fn configured(&self) -> bool {
        self.token.is_some()
    }

    /// Check a presented token against the configured one.
    ///
    /// Both sides are hashed before comparison so the timing does not depend
    /// on how much of the token prefix matches.
    pub fn validate(&self, presented: Option<&str>) -> bool {
        let Some(expected) = &self.token else {
            return true;
        };
        let Some(presented) = presented else {
            return false;
        };
        Sha256::digest(expected.as_bytes()) == Sha256::digest(presented.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unconfigured_allows_anything() {
        let gate = AuthGate::new(None);
        assert!(!gate.configured());
        assert!(gate.validate(None));
        assert!(gate.validate(Some("whatever")));
    }

    #[test]
    fn test_configured_requires_exact_token() {
        let gate = AuthGate::new(Some("s3cret".to_string()));
        assert!(gate.configured());
        assert!(gate.validate(Some("s3cret")));
        assert!(!gate.validate(Some("s3cret ")));
        assert!(!gate.validate(Some("S3CRET")));
        assert!(!gate.validate(None));
    }

    #[test]
    fn test_empty_token_still_enforced() {
        let gate = AuthGate::new(Some(String::new()));
        assert!(gate.validate(Some("")));
        assert!(!gate.validate(Some("x")));
        assert!(!gate.validate(None));
    }
}
