use std::fmt::{Display, Formatter};

/// Why a blocking operation (waiting for credits or for deliverable messages) returned without
///  success. After a timeout, the caller may try again or give up on the message. An interruption
///  means that the state being waited on went away (e.g. the peer left the view), so there is no
///  point in retrying.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum WaitError {
    TimedOut,
    Interrupted,
}

impl Display for WaitError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            WaitError::TimedOut => write!(f, "timed out"),
            WaitError::Interrupted => write!(f, "interrupted"),
        }
    }
}

impl std::error::Error for WaitError {}
