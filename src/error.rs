//! Error taxonomy. A single currency crosses the public surface (§7 of SPEC_FULL.md): no
//! `Box<dyn Error>`, no ad-hoc string errors.

use std::fmt;
use std::sync::Arc;

/// Anything a user callback, effect, or `raiseError` can raise.
///
/// Cloneable because the same failure is frequently observed from more than one place at
/// once (a `parJoin` worker fiber and the supervisor racing to report it, a scope's
/// finalizers each wanting to see the exit cause) — the inner payload is `Arc`-shared so
/// cloning never duplicates the underlying error.
#[derive(Clone, thiserror::Error)]
pub enum StreamError {
    /// Raised by `raiseError`, a failing effect, or a user callback.
    #[error("{0}")]
    User(Arc<dyn std::error::Error + Send + Sync + 'static>),

    /// More than one error was observed tearing down a scope or joining a concurrent
    /// combinator. `primary` is whichever was seen first; the rest are suppressed.
    #[error("{primary}{}", format_suppressed(.suppressed))]
    Composite {
        primary: Box<StreamError>,
        suppressed: Vec<StreamError>,
    },

    /// The interpreter could not locate a scope it was asked to `Step` or `CloseScope`
    /// into. Per spec this is a fatal protocol error: a programming bug in whichever
    /// concurrent combinator produced the dangling reference, not a user-recoverable
    /// condition. Never caused by ordinary sequential `Stream` use.
    #[error("scope lookup failure: {0:?} is not reachable from the current scope — use stepLeg for cross-fiber pulls")]
    ScopeLookupFailure(crate::token::Token),

    /// `translate` was asked to move a sub-stream requiring a capability (currently:
    /// fiber-spawning for an open interruptible scope) onto a `Runtime` that does not
    /// advertise it.
    #[error("translate: target runtime does not support {0}")]
    Translation(&'static str),
}

fn format_suppressed(suppressed: &[StreamError]) -> String {
    if suppressed.is_empty() {
        String::new()
    } else {
        format!(" (+{} suppressed)", suppressed.len())
    }
}

impl fmt::Debug for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamError::User(e) => f.debug_tuple("User").field(&e.to_string()).finish(),
            StreamError::Composite { primary, suppressed } => f
                .debug_struct("Composite")
                .field("primary", primary)
                .field("suppressed", suppressed)
                .finish(),
            StreamError::ScopeLookupFailure(t) => {
                f.debug_tuple("ScopeLookupFailure").field(t).finish()
            }
            StreamError::Translation(cap) => f.debug_tuple("Translation").field(cap).finish(),
        }
    }
}

impl StreamError {
    /// Wraps an arbitrary user error.
    pub fn user<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        StreamError::User(Arc::new(err))
    }

    /// Wraps a plain message as a user error.
    pub fn msg(message: impl Into<String>) -> Self {
        #[derive(Debug, thiserror::Error)]
        #[error("{0}")]
        struct Message(String);
        StreamError::user(Message(message.into()))
    }

    /// Combines `self` (as the primary cause) with errors observed afterward while
    /// tearing down. Flattens nested composites so `suppressed` is never itself a
    /// `Composite`.
    pub fn combine(self, mut suppressed: Vec<StreamError>) -> Self {
        if suppressed.is_empty() {
            return self;
        }
        let mut flat = Vec::with_capacity(suppressed.len());
        for err in suppressed.drain(..) {
            match err {
                StreamError::Composite { primary, suppressed: inner } => {
                    flat.push(*primary);
                    flat.extend(inner);
                }
                other => flat.push(other),
            }
        }
        StreamError::Composite {
            primary: Box::new(self),
            suppressed: flat,
        }
    }
}

/// How a scope or a single finalizer concluded.
#[derive(Clone, Debug)]
pub enum ExitCase {
    Succeeded,
    Failed(StreamError),
    Canceled,
}

impl ExitCase {
    pub fn is_success(&self) -> bool {
        matches!(self, ExitCase::Succeeded)
    }
}

/// Result alias used pervasively through the interpreter and public surface.
pub type StreamResult<T> = Result<T, StreamError>;
