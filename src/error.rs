use std::fmt;
use std::io;
use std::result::Result as StdResult;

use mio::Token;

/// Crate-wide result alias.
pub type Result<T> = StdResult<T, CoreError>;

/// Errors surfaced by the reactor core.
///
/// Programmer contract violations (calling loop-private operations from the
/// wrong thread, creating a second loop in one thread) are not represented
/// here; those are fatal and panic after logging.
#[derive(Debug)]
pub enum CoreError {
    /// An operating-system I/O failure.
    Io(io::Error),
    /// The token is reserved for the loop's internal wake-up channel.
    ReservedToken(Token),
    /// A lock guarding shared state was poisoned by a panicking thread.
    PoisonedLock(String),
    /// The receiving end of a task queue is gone; the task was not run.
    QueueClosed,
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreError::Io(e) => write!(f, "IO Error: {}", e),
            CoreError::ReservedToken(t) => {
                write!(f, "Token {:?} is reserved for the wake-up channel", t)
            }
            CoreError::PoisonedLock(msg) => write!(f, "Lock Poisoned: {}", msg),
            CoreError::QueueClosed => write!(f, "Task queue is closed"),
        }
    }
}

impl std::error::Error for CoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CoreError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for CoreError {
    fn from(err: io::Error) -> Self {
        CoreError::Io(err)
    }
}

impl<T> From<std::sync::PoisonError<T>> for CoreError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        CoreError::PoisonedLock(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let e = CoreError::ReservedToken(Token(0));
        assert!(e.to_string().contains("reserved"));

        let e: CoreError = io::Error::new(io::ErrorKind::WouldBlock, "nope").into();
        assert!(matches!(e, CoreError::Io(_)));
    }
}
