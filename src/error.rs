use thiserror::Error;

/// Failures the session registry reports back to its caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("session {0} not found")]
    NotFound(String),
    #[error("session {0} has nobody waiting")]
    EmptyQueue(String),
    #[error("an interview is already in progress for {0}")]
    InterviewInProgress(String),
    #[error("only the host of session {0} may do that")]
    NotHost(String),
    #[error("the host of session {0} cannot join it as a candidate")]
    OwnSession(String),
    #[error("no free session code after {0} attempts")]
    CodeSpaceExhausted(usize),
}

pub type RegistryResult<T> = std::result::Result<T, RegistryError>;
