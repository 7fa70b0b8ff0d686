// =============================================================================
// Token Authenticator — dual admin tokens with hot rotation
// =============================================================================
//
// Two tokens (primary, secondary) are valid at any time so a rotation never
// locks out in-flight callers; `active` merely labels which slot operators
// consider current.  Comparison is constant time to prevent timing
// side-channels.  Rotation applies all submitted fields atomically under one
// mutex.
//
// `ADMIN_AUTH_DISABLED=1` admits every request; development only.
// =============================================================================

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

/// Which token slot operators consider current.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ActiveSlot {
    Primary,
    Secondary,
}

impl ActiveSlot {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Secondary => "secondary",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "primary" => Some(Self::Primary),
            "secondary" => Some(Self::Secondary),
            _ => None,
        }
    }
}

struct Tokens {
    primary: String,
    secondary: String,
    active: ActiveSlot,
}

/// Dual-token admin authenticator.
pub struct TokenAuthenticator {
    tokens: Mutex<Tokens>,
    disabled: bool,
}

impl TokenAuthenticator {
    pub fn new(primary: String, secondary: String, disabled: bool) -> Self {
        if disabled {
            warn!("admin auth is DISABLED, every request will be admitted");
        }
        Self {
            tokens: Mutex::new(Tokens {
                primary,
                secondary,
                active: ActiveSlot::Primary,
            }),
            disabled,
        }
    }

    /// Seed from `ADMIN_TOKEN_PRIMARY` / `ADMIN_TOKEN_SECONDARY`, falling
    /// back to `ADMIN_TOKEN` for the primary; `ADMIN_AUTH_DISABLED` bypasses.
    pub fn from_env() -> Self {
        let primary = std::env::var("ADMIN_TOKEN_PRIMARY")
            .or_else(|_| std::env::var("ADMIN_TOKEN"))
            .unwrap_or_default();
        let secondary = std::env::var("ADMIN_TOKEN_SECONDARY").unwrap_or_default();
        let disabled = std::env::var("ADMIN_AUTH_DISABLED")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        Self::new(primary, secondary, disabled)
    }

    /// Admit iff the token equals primary or secondary (constant time). An
    /// empty configured slot never matches.
    pub fn check(&self, token: &str) -> bool {
        if self.disabled {
            return true;
        }
        let tokens = self.tokens.lock();
        let p_ok = !tokens.primary.is_empty()
            && constant_time_eq(token.as_bytes(), tokens.primary.as_bytes());
        let s_ok = !tokens.secondary.is_empty()
            && constant_time_eq(token.as_bytes(), tokens.secondary.as_bytes());
        p_ok || s_ok
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    pub fn active(&self) -> ActiveSlot {
        self.tokens.lock().active
    }

    /// Apply a rotation request atomically. Fields left `None` keep their
    /// current value.
    pub fn rotate(
        &self,
        primary: Option<String>,
        secondary: Option<String>,
        activate: Option<ActiveSlot>,
    ) {
        let mut tokens = self.tokens.lock();
        if let Some(p) = primary {
            tokens.primary = p;
        }
        if let Some(s) = secondary {
            tokens.secondary = s;
        }
        if let Some(slot) = activate {
            tokens.active = slot;
        }
        info!(active = tokens.active.as_str(), "admin tokens rotated");
    }
}

impl std::fmt::Debug for TokenAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenAuthenticator")
            .field("disabled", &self.disabled)
            .field("active", &self.active().as_str())
            .finish()
    }
}

/// Compare two byte slices in constant time. Every byte of equal-length
/// inputs is examined even after a mismatch.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_basics() {
        assert!(constant_time_eq(b"hello", b"hello"));
        assert!(!constant_time_eq(b"hello", b"world"));
        assert!(!constant_time_eq(b"short", b"longer_string"));
        assert!(constant_time_eq(b"", b""));
        assert!(!constant_time_eq(b"\x00", b"\x01"));
    }

    #[test]
    fn either_token_admits() {
        let auth = TokenAuthenticator::new("p1".into(), "s1".into(), false);
        assert!(auth.check("p1"));
        assert!(auth.check("s1"));
        assert!(!auth.check("bad"));
        assert!(!auth.check(""));
    }

    #[test]
    fn empty_slots_never_match() {
        let auth = TokenAuthenticator::new("p1".into(), String::new(), false);
        assert!(auth.check("p1"));
        assert!(!auth.check(""));
    }

    #[test]
    fn rotation_swaps_both_tokens() {
        let auth = TokenAuthenticator::new("p1".into(), "s1".into(), false);
        auth.rotate(
            Some("p2".into()),
            Some("s2".into()),
            Some(ActiveSlot::Secondary),
        );
        assert!(auth.check("p2"));
        assert!(auth.check("s2"));
        assert!(!auth.check("p1"));
        assert!(!auth.check("s1"));
        assert_eq!(auth.active(), ActiveSlot::Secondary);
    }

    #[test]
    fn partial_rotation_keeps_other_slot() {
        let auth = TokenAuthenticator::new("p1".into(), "s1".into(), false);
        auth.rotate(Some("p2".into()), None, None);
        assert!(auth.check("p2"));
        assert!(auth.check("s1"));
        assert!(!auth.check("p1"));
        assert_eq!(auth.active(), ActiveSlot::Primary);
    }

    #[test]
    fn disabled_admits_everything() {
        let auth = TokenAuthenticator::new("p1".into(), String::new(), true);
        assert!(auth.check("anything"));
        assert!(auth.check(""));
    }
}
