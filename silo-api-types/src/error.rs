use anyhow::Error;

/// Typed error kinds surfaced to repository callers.
///
/// These are raised inside [`anyhow::Error`] chains; callers that need to
/// branch on the kind recover it with `downcast_ref::<RepoError>()` or the
/// `is_*` helpers below.
#[derive(thiserror::Error, Debug)]
pub enum RepoError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("wrong passphrase")]
    WrongPassphrase,

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("corrupt: {0}")]
    Corrupt(String),

    #[error("unknown algorithm '{0}'")]
    UnknownAlgorithm(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("transient error after {attempts} attempts: {message}")]
    Retryable { attempts: u32, message: String },

    #[error("operation canceled")]
    Canceled,

    #[error("policy violation: {0}")]
    PolicyViolation(String),

    #[error("completed with {ignored} ignored and {fatal} fatal entry errors")]
    PartialSuccess { ignored: u64, fatal: u64 },
}

fn kind_of(err: &Error) -> Option<&RepoError> {
    err.downcast_ref::<RepoError>()
}

pub fn is_not_found(err: &Error) -> bool {
    matches!(kind_of(err), Some(RepoError::NotFound(_)))
}

pub fn is_wrong_passphrase(err: &Error) -> bool {
    matches!(kind_of(err), Some(RepoError::WrongPassphrase))
}

pub fn is_corrupt(err: &Error) -> bool {
    matches!(kind_of(err), Some(RepoError::Corrupt(_)))
}

pub fn is_conflict(err: &Error) -> bool {
    matches!(kind_of(err), Some(RepoError::Conflict(_)))
}

pub fn is_canceled(err: &Error) -> bool {
    matches!(kind_of(err), Some(RepoError::Canceled))
}

#[cfg(test)]
mod test {
    use super::*;
    use anyhow::Context;

    #[test]
    fn kind_survives_context_wrapping() {
        let err = Error::from(RepoError::NotFound("content abc".into()))
            .context("reading pack")
            .context("opening object");
        assert!(is_not_found(&err));
        assert!(!is_corrupt(&err));
    }
}
