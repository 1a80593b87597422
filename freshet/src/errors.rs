//! Typed failure causes for a dataflow run.

use crate::value::Value;

/// An error raised by user logic (a map function, a reducer, a source or
/// sink body). Surfaced verbatim through the run's result.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct UserError(pub String);

impl UserError {
    /// Wraps a message as a user-logic failure.
    pub fn new(msg: impl Into<String>) -> Self {
        UserError(msg.into())
    }
}

impl From<&str> for UserError {
    fn from(msg: &str) -> Self {
        UserError(msg.to_string())
    }
}

impl From<String> for UserError {
    fn from(msg: String) -> Self {
        UserError(msg)
    }
}

/// Why a run terminated abnormally.
///
/// The operator runtime never catches [`Error::User`]; any of these tears
/// down the raising worker, which aborts the cluster. The last durable
/// frontier bounds what is considered committed.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// User logic raised; the message is the user's, untouched.
    #[error("{0}")]
    User(#[from] UserError),

    /// A record reached a stateful operator in a non-routable shape.
    #[error("{0}")]
    Type(String),

    /// The recovery store is corrupt or incompatible with this cluster.
    #[error("error resuming from recovery store: {0}")]
    Resume(String),

    /// A peer disconnected or sent a malformed frame mid-run.
    #[error("transport failure: {0}")]
    Transport(String),

    /// A source failed.
    #[error("source error: {0}")]
    Source(String),

    /// The dataflow is structurally invalid.
    #[error("invalid dataflow: {0}")]
    Build(String),

    /// Another worker failed first; this worker shut down in sympathy.
    #[error("run aborted due to a failure on another worker")]
    Aborted,
}

impl Error {
    /// The error for a record reaching a stateful operator without being a
    /// `(key, value)` pair.
    pub(crate) fn not_a_pair(got: &Value) -> Error {
        Error::Type(format!(
            "Dataflow requires a `(key, value)` 2-tuple as input to every stateful \
             operator for routing; got `{}` instead",
            got
        ))
    }

    /// The error for a pair whose key is not a string or integer.
    pub(crate) fn bad_key(got: &Value) -> Error {
        Error::Type(format!(
            "Stateful logic functions must return string or integer keys in \
             `(key, value)`; got `{}` instead",
            got
        ))
    }
}
