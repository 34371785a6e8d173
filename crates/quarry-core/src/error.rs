use thiserror::Error;

/// Classified failure modes for stage work. Stage-internal helpers raise
/// `anyhow::Error` freely; each stage's top-level callback converts into one
/// of these kinds, and the consumer loop maps the kind to a message
/// disposition.
#[derive(Debug, Error)]
pub enum StageError {
    /// Broker disconnect, store connection reset, DNS/TCP failure, Docker
    /// daemon unreachable. Retryable.
    #[error("transient infrastructure failure: {0:#}")]
    TransientInfra(anyhow::Error),

    /// Helper script nonzero exit while building images/fuzzers.
    #[error("build failure: {0}")]
    BuildFailure(String),

    /// A PoC expected to crash exited cleanly. Warning only.
    #[error("replay produced no crash")]
    ReplayAmbiguous,

    /// Replay output matched no sanitizer grammar.
    #[error("unparseable sanitizer output")]
    ParseFailure,

    /// Message is missing required fields or is not valid JSON.
    #[error("poison message: {0}")]
    PoisonMessage(String),

    /// Task was canceled while the message was in flight.
    #[error("task canceled")]
    TaskCancelled,

    /// Per-task retry budget exhausted.
    #[error("retry quota exceeded")]
    QuotaExceeded,

    /// Irrecoverable local state (e.g. shared storage missing). The worker
    /// process exits so a supervisor restarts it.
    #[error("fatal: {0}")]
    Fatal(String),
}

/// What the consumer loop does with the delivery once the callback returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Work finished, or is moot for this message; remove it.
    Ack,
    /// Poison; nack without requeue.
    Reject,
    /// Recoverable; republish to the tail of the same queue with
    /// `x-retry` incremented, then ack the original.
    RequeueTail,
}

impl StageError {
    pub fn disposition(&self) -> Disposition {
        match self {
            StageError::TransientInfra(_) | StageError::BuildFailure(_) => Disposition::RequeueTail,
            StageError::PoisonMessage(_) | StageError::Fatal(_) => Disposition::Reject,
            StageError::ReplayAmbiguous
            | StageError::ParseFailure
            | StageError::TaskCancelled
            | StageError::QuotaExceeded => Disposition::Ack,
        }
    }

    /// True for errors after which the worker process should exit so a
    /// supervisor can restart it with fresh state.
    pub fn exits_process(&self) -> bool {
        matches!(self, StageError::Fatal(_))
    }

    /// Wrap an arbitrary error as transient infrastructure trouble.
    pub fn transient(err: impl Into<anyhow::Error>) -> Self {
        StageError::TransientInfra(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_requeue() {
        let e = StageError::transient(anyhow::anyhow!("connection reset"));
        assert_eq!(e.disposition(), Disposition::RequeueTail);
        assert!(!e.exits_process());
    }

    #[test]
    fn poison_is_rejected_without_requeue() {
        let e = StageError::PoisonMessage("missing task_id".into());
        assert_eq!(e.disposition(), Disposition::Reject);
    }

    #[test]
    fn cancellation_and_quota_are_clean_acks() {
        assert_eq!(StageError::TaskCancelled.disposition(), Disposition::Ack);
        assert_eq!(StageError::QuotaExceeded.disposition(), Disposition::Ack);
        assert_eq!(StageError::ReplayAmbiguous.disposition(), Disposition::Ack);
    }

    #[test]
    fn fatal_exits_process() {
        let e = StageError::Fatal("storage dir missing".into());
        assert!(e.exits_process());
        assert_eq!(e.disposition(), Disposition::Reject);
    }
}
