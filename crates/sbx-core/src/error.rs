use thiserror::Error;

/// The three public error kinds callers are allowed to branch on.
///
/// Every classified failure in the library carries one of these at the root
/// of its anyhow chain; everything else is an unclassified backend error.
/// Callers test with [`is_kind`] (or the named helpers), never by string
/// matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ErrorKind {
    #[error("not found")]
    NotFound,
    #[error("already exists")]
    AlreadyExists,
    #[error("not valid")]
    NotValid,
}

impl ErrorKind {
    /// Wrap this kind with a human-readable message.
    pub fn context(self, msg: impl Into<String>) -> anyhow::Error {
        anyhow::Error::new(self).context(msg.into())
    }
}

/// Build a `NotFound` error with a message.
pub fn not_found(msg: impl Into<String>) -> anyhow::Error {
    ErrorKind::NotFound.context(msg)
}

/// Build an `AlreadyExists` error with a message.
pub fn already_exists(msg: impl Into<String>) -> anyhow::Error {
    ErrorKind::AlreadyExists.context(msg)
}

/// Build a `NotValid` error with a message.
pub fn not_valid(msg: impl Into<String>) -> anyhow::Error {
    ErrorKind::NotValid.context(msg)
}

/// True if the error chain is rooted in the given kind.
pub fn is_kind(err: &anyhow::Error, kind: ErrorKind) -> bool {
    err.downcast_ref::<ErrorKind>() == Some(&kind)
}

pub fn is_not_found(err: &anyhow::Error) -> bool {
    is_kind(err, ErrorKind::NotFound)
}

pub fn is_already_exists(err: &anyhow::Error) -> bool {
    is_kind(err, ErrorKind::AlreadyExists)
}

pub fn is_not_valid(err: &anyhow::Error) -> bool {
    is_kind(err, ErrorKind::NotValid)
}
