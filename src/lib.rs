//! `brookcore`: a compositional, effectful, pull-based stream processing core.
//!
//! The crate is a two-layer algebra — a [`Stream`] of output values over a lower-level
//! `Pull` interpreter ([`pull`]) — coupled with a hierarchical [`scope::Scope`] tree that
//! guarantees bracketed resource finalization under normal termination, failure, and
//! asynchronous interruption. On top of that sit the concurrency primitives
//! ([`deferred::Deferred`], [`queue::BoundedQueue`], [`pubsub`]/[`topic`]) needed to
//! implement merging, concurrent inner streams, and publish/subscribe, and the
//! combinators built from them ([`concurrent`]).
//!
//! A [`Stream`] is inert until handed to a [`compile::Compiler`]: `Compiler::new().to_list(stream)`
//! (or one of its siblings — `drain`, `fold`, `count`, ...) opens a root [`scope::Scope`],
//! drives the stream to exhaustion, and closes the scope, running every registered
//! finalizer in reverse order.
//!
//! ```no_run
//! # async fn demo() -> brookcore::error::StreamResult<()> {
//! use brookcore::{compile::Compiler, constructors};
//!
//! let stream = constructors::range(0, 5).map(|n| n * 2);
//! let doubled = Compiler::new().to_list(stream).await?;
//! assert_eq!(doubled, vec![0, 2, 4, 6, 8]);
//! # Ok(())
//! # }
//! ```

pub mod chunk;
pub mod combinators;
pub mod compile;
pub mod concurrent;
pub mod constructors;
pub mod deferred;
pub mod error;
pub mod pubsub;
pub mod pull;
pub mod queue;
pub mod runtime;
pub mod scope;
pub mod token;
pub mod topic;

pub use crate::combinators::Stream;
pub use crate::compile::Compiler;
pub use crate::error::{ExitCase, StreamError, StreamResult};
pub use crate::runtime::{Runtime, RuntimeConfig, TokioRuntime};
pub use crate::scope::Scope;
pub use crate::token::Token;

/// Re-exports the crate's public surface under one name, for `use brookcore::prelude::*;`.
pub mod prelude {
    pub use crate::chunk::Chunk;
    pub use crate::compile::Compiler;
    pub use crate::constructors::*;
    pub use crate::error::{ExitCase, StreamError, StreamResult};
    pub use crate::runtime::{Runtime, RuntimeConfig, TokioRuntime};
    pub use crate::Stream;
}
