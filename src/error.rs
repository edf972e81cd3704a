use thiserror::Error as ThisError;

use crate::command::Token;

pub type OpaqueError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(ThisError, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("failed to launch `{executable}`, reason: {source}")]
    Launch {
        executable: String,
        #[source]
        source: std::io::Error,
    },
    #[error("probe process failure: {0}")]
    Process(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("failed to resolve host `{0}`")]
    HostResolve(String),
    #[error("feature `{0}` is not supported by the probe process")]
    UnsupportedFeature(String),
    #[error("request {0} was cancelled")]
    Cancelled(Token),
    #[error("{0}")]
    Opaque(#[from] OpaqueError),
}
pub type Result<T> = std::result::Result<T, Error>;

/// A reply that does not follow the reply grammar, or does not fit the
/// command it answers.
///
/// `token` is set when the leading token atom could be parsed, in which case
/// only the request owning that token fails. `line` holds the offending line
/// when the error was raised while decoding it.
#[derive(ThisError, Debug, Clone, PartialEq, Eq)]
#[error("malformed reply{}: {reason}", quoted(.line))]
pub struct ProtocolError {
    pub token: Option<Token>,
    pub line: Option<String>,
    pub reason: String,
}

impl ProtocolError {
    pub(crate) fn new(token: Option<Token>, line: &str, reason: impl Into<String>) -> Self {
        Self {
            token,
            line: Some(line.into()),
            reason: reason.into(),
        }
    }

    /// A well-formed reply of the wrong kind for its request.
    pub(crate) fn unexpected(token: Token, reason: impl Into<String>) -> Self {
        Self {
            token: Some(token),
            line: None,
            reason: reason.into(),
        }
    }
}

fn quoted(line: &Option<String>) -> String {
    line.as_ref()
        .map(|line| format!(" `{}`", line))
        .unwrap_or_default()
}

#[derive(ThisError, Debug)]
#[non_exhaustive]
pub enum InputBuildError {
    #[error("probe target is required")]
    MissingTarget,
    #[error("probe target must not be empty")]
    EmptyTarget,
}
