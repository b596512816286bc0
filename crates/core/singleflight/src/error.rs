use std::{fmt, sync::Arc};

/// Result type with the coalescing [`Error`]
pub type Result<T, E> = std::result::Result<T, Error<E>>;

#[derive(Debug)]
/// Outcome of a failed wave, shared by every caller that took part in it.
pub enum Error<E> {
    /// The operation itself failed, every caller receives the same failure
    Operation(Arc<E>),
    /// The operation panicked while running, contains the panic message if it had one
    Panicked(String),
    /// The leader went away before publishing a result
    RecvError,
}

impl<E> Error<E> {
    /// Failure produced by the operation, if that is what this is
    pub fn operation(&self) -> Option<&E> {
        match self {
            Error::Operation(err) => Some(&**err),
            _ => None,
        }
    }
}

impl<E> Clone for Error<E> {
    fn clone(&self) -> Self {
        match self {
            Error::Operation(err) => Error::Operation(err.clone()),
            Error::Panicked(message) => Error::Panicked(message.clone()),
            Error::RecvError => Error::RecvError,
        }
    }
}

impl<E: PartialEq> PartialEq for Error<E> {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Error::Operation(a), Error::Operation(b)) => a == b,
            (Error::Panicked(a), Error::Panicked(b)) => a == b,
            (Error::RecvError, Error::RecvError) => true,
            _ => false,
        }
    }
}

impl<E: fmt::Display> fmt::Display for Error<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Operation(err) => write!(f, "{err}"),
            Error::Panicked(message) => write!(f, "Operation panicked: {message}"),
            Error::RecvError => write!(f, "Leader dropped before publishing a result"),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for Error<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Operation(err) => Some(&**err),
            _ => None,
        }
    }
}
