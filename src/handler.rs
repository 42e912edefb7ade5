//! Handler registration tokens.
//!
//! Registration always succeeds and hands back an opaque token; removal is by
//! token, never by comparing callables. Two registrations of the same closure
//! are two independent handlers.

use std::fmt;

use uuid::Uuid;

/// Opaque id of one registered handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HandlerToken(Uuid);

impl HandlerToken {
    pub(crate) fn next() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for HandlerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Failure reported by a message or event handler.
///
/// Handlers are isolated: a failing handler is logged and never blocks the
/// remaining handlers or the dispatch loop.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type HandlerResult = Result<(), HandlerError>;
