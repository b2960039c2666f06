// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error type shared by the cache, observers and mutations.
//!
//! One fetch result fans out to every waiter attached to the in-flight
//! request, so [`QueryError`] is `Clone`. Remote errors are carried verbatim;
//! this layer never interprets the code.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    /// The remote call itself failed (network unreachable, timeout, panic).
    #[error("Transport error: {0}")]
    Transport(String),

    /// The remote store answered with an error object.
    #[error("Remote error [{code}]: {message}")]
    Remote { code: String, message: String },

    /// The response violated the `(data, error)` contract or failed to decode.
    #[error("Malformed response: {0}")]
    Malformed(String),

    /// A key was read back as a different type than it was cached with.
    #[error("Cached data for {key} does not have the requested type")]
    TypeMismatch { key: String },

    #[error("Query cache has been disposed")]
    Disposed,

    /// `fetch` was called outside a Tokio runtime.
    #[error("No Tokio runtime available to drive the fetch")]
    NoRuntime,
}

impl QueryError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    pub fn remote(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Remote {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Machine code of a remote error, if this is one.
    #[must_use]
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Remote { code, .. } => Some(code),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// Short label used for metrics.
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Self::Transport(_) => "transport",
            Self::Remote { .. } => "remote",
            Self::Malformed(_) => "malformed",
            Self::TypeMismatch { .. } => "type_mismatch",
            Self::Disposed => "disposed",
            Self::NoRuntime => "no_runtime",
        }
    }
}
