//! Thread errors
//!
//! Recoverable conditions reported to the caller. Invariant violations are
//! not errors: they go through [`fatal!`](crate::fatal) and take the whole
//! runtime down.

/// POSIX-style codes, reported negated by [`ThreadError::errno`]
const EAGAIN: i32 = 11;
const ENOMEM: i32 = 12;
const EINVAL: i32 = 22;
const ESRCH: i32 = 3;

/// Errors returned by the thread, scheduler and sync operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThreadError {
    /// Thread table is full
    NoResources,
    /// Stack allocation failed
    NoMemory,
    /// Out-of-range id or priority
    InvalidArgument,
    /// Target slot is empty
    NoSuchThread,
    /// Target already has a joiner
    AlreadyJoined,
    /// Target is detached
    NotJoinable,
    /// Rejected runtime configuration
    InvalidConfig(String),
}

impl ThreadError {
    /// Negative error sentinel for this error
    pub fn errno(&self) -> i32 {
        match self {
            ThreadError::NoResources => -EAGAIN,
            ThreadError::NoMemory => -ENOMEM,
            ThreadError::NoSuchThread => -ESRCH,
            ThreadError::InvalidArgument
            | ThreadError::AlreadyJoined
            | ThreadError::NotJoinable
            | ThreadError::InvalidConfig(_) => -EINVAL,
        }
    }
}

impl std::fmt::Display for ThreadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ThreadError::NoResources => write!(f, "thread table exhausted"),
            ThreadError::NoMemory => write!(f, "cannot allocate thread stack"),
            ThreadError::InvalidArgument => write!(f, "invalid argument"),
            ThreadError::NoSuchThread => write!(f, "no such thread"),
            ThreadError::AlreadyJoined => write!(f, "thread already has a joiner"),
            ThreadError::NotJoinable => write!(f, "thread is not joinable"),
            ThreadError::InvalidConfig(s) => write!(f, "invalid config: {}", s),
        }
    }
}

impl std::error::Error for ThreadError {}

/// Result type for thread operations
pub type Result<T> = std::result::Result<T, ThreadError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_is_negative() {
        let all = [
            ThreadError::NoResources,
            ThreadError::NoMemory,
            ThreadError::InvalidArgument,
            ThreadError::NoSuchThread,
            ThreadError::AlreadyJoined,
            ThreadError::NotJoinable,
            ThreadError::InvalidConfig("x".into()),
        ];
        for err in all {
            assert!(err.errno() < 0, "{} should map to a negative code", err);
        }
    }

    #[test]
    fn test_errno_values() {
        assert_eq!(ThreadError::NoResources.errno(), -11);
        assert_eq!(ThreadError::NoMemory.errno(), -12);
        assert_eq!(ThreadError::NoSuchThread.errno(), -3);
        assert_eq!(ThreadError::NotJoinable.errno(), -22);
    }

    #[test]
    fn test_display() {
        assert_eq!(
            format!("{}", ThreadError::NoResources),
            "thread table exhausted"
        );
        assert_eq!(
            format!("{}", ThreadError::InvalidConfig("stack_size is zero".into())),
            "invalid config: stack_size is zero"
        );
    }
}
