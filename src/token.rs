//! Opaque, globally-unique identifiers for scopes, finalizer entries, and subscribers.
//!
//! A `Token` carries no information beyond its own identity: two tokens are equal iff
//! they were produced by the same call to [`Token::new`]. Scopes outlive nothing, but
//! tokens outlive scopes, so a `CloseScope` or `find` issued after the scope itself has
//! been torn down can still be recognised as "that scope, whichever one it was".

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT: AtomicU64 = AtomicU64::new(1);

/// Identity-compared id. Cheap to copy, cheap to hash, never reused.
#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub struct Token(u64);

impl Token {
    /// Mints a fresh token. Never returns the same value twice for the lifetime of the
    /// process.
    pub fn new() -> Self {
        Token(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for Token {
    fn default() -> Self {
        Token::new()
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Token({})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_are_pairwise_distinct() {
        let a = Token::new();
        let b = Token::new();
        assert_ne!(a, b);
        assert_eq!(a, a);
    }
}
