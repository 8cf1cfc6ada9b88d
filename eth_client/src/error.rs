use thiserror::Error;

/// Chain interaction failures, split by retry policy: transient errors are
/// retried with backoff, permanent errors abort the stage and may trigger the
/// refund path.
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("transient chain error: {0}")]
    Transient(String),
    #[error("permanent chain error: {0}")]
    Permanent(String),
}

impl ChainError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

pub type Result<T> = std::result::Result<T, ChainError>;

/// Buckets a send-path error message. Nonce conflicts, repricing rejections
/// and transport hiccups resolve on resubmission; reverts and missing funds
/// do not.
pub fn classify_send(message: String) -> ChainError {
    let lowered = message.to_lowercase();
    let permanent = ["revert", "insufficient funds", "execution failed", "invalid opcode"];
    if permanent.iter().any(|needle| lowered.contains(needle)) {
        ChainError::Permanent(message)
    } else {
        ChainError::Transient(message)
    }
}

pub(crate) fn transient(err: impl std::fmt::Display) -> ChainError {
    ChainError::Transient(err.to_string())
}

pub(crate) fn permanent(err: impl std::fmt::Display) -> ChainError {
    ChainError::Permanent(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reverts_are_permanent() {
        assert!(!classify_send("execution reverted: swap not ready".into()).is_transient());
        assert!(!classify_send("insufficient funds for gas".into()).is_transient());
    }

    #[test]
    fn nonce_and_transport_errors_are_transient() {
        assert!(classify_send("nonce too low".into()).is_transient());
        assert!(classify_send("replacement transaction underpriced".into()).is_transient());
        assert!(classify_send("connection reset by peer".into()).is_transient());
    }
}
