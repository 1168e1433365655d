//! Bearer-token authentication with rotation support.
//!
//! Tokens are hashed once at startup; comparisons go through the digests so
//! they are constant-time regardless of input length.

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Accepts the current and, during rotation, the previous token.
pub struct TokenGate {
    hashes: Vec<[u8; 32]>,
}

impl TokenGate {
    /// Build from the configured tokens.  No tokens = auth disabled.
    pub fn new(tokens: &[Option<&str>]) -> Self {
        let hashes = tokens
            .iter()
            .flatten()
            .map(|t| Sha256::digest(t.as_bytes()).into())
            .collect();
        Self { hashes }
    }

    pub fn enabled(&self) -> bool {
        !self.hashes.is_empty()
    }

    /// Constant-time check against every accepted token.
    pub fn check(&self, provided: Option<&str>) -> bool {
        if self.hashes.is_empty() {
            return true;
        }
        let Some(provided) = provided else {
            return false;
        };
        let digest: [u8; 32] = Sha256::digest(provided.as_bytes()).into();
        self.hashes
            .iter()
            .fold(false, |ok, hash| {
                ok | bool::from(hash.as_slice().ct_eq(digest.as_slice()))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_gate_accepts_anything() {
        let gate = TokenGate::new(&[None, None]);
        assert!(!gate.enabled());
        assert!(gate.check(None));
        assert!(gate.check(Some("whatever")));
    }

    #[test]
    fn current_and_previous_tokens_accepted() {
        let gate = TokenGate::new(&[Some("current"), Some("previous")]);
        assert!(gate.enabled());
        assert!(gate.check(Some("current")));
        assert!(gate.check(Some("previous")));
        assert!(!gate.check(Some("stale")));
        assert!(!gate.check(None));
    }
}
