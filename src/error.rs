use thiserror::Error;

/// The five error kinds the pipeline must tell apart when deciding whether
/// to ack, nak, or drop a broker message (see the ack/nak table in
/// `SPEC_FULL.md` §9 (ii)).
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Network/broker/DB hiccup. Never advances a watermark; the broker
    /// redelivers and the next poll tick (or the same consumer) retries.
    #[error("transient fetch error: {0}")]
    TransientFetch(#[source] anyhow::Error),

    /// Unparseable queue payload, missing required key, or unparseable feed.
    /// Dropped (acked) to avoid a poison-message storm.
    #[error("malformed input: {0}")]
    MalformedInput(String),

    /// The scoring/writing model returned non-JSON or missing fields.
    /// The (post, user) pair is dropped; the same model call is never retried.
    #[error("model output error: {0}")]
    ModelOutput(String),

    /// User/feed absent during an update. Treated as success: out-of-order
    /// lifecycle events are expected, so the message is acked and logged at
    /// info, not error.
    #[error("not found: {0}")]
    NotFound(String),

    /// Configuration missing at startup. The process refuses to start.
    #[error("fatal configuration error: {0}")]
    Fatal(#[source] anyhow::Error),
}

impl PipelineError {
    /// Whether a broker consumer should ack (drop, no redelivery) a message
    /// that failed with this error, per the table in `SPEC_FULL.md` §9 (ii).
    pub fn should_ack(&self) -> bool {
        !matches!(self, PipelineError::TransientFetch(_))
    }

    /// Short label for the `error_kind` dimension on `ERRORS_TOTAL`
    /// (spec.md §6 Observability: "errors labeled by error type").
    pub fn metric_label(&self) -> &'static str {
        match self {
            PipelineError::TransientFetch(_) => "transient_fetch",
            PipelineError::MalformedInput(_) => "malformed_input",
            PipelineError::ModelOutput(_) => "model_output",
            PipelineError::NotFound(_) => "not_found",
            PipelineError::Fatal(_) => "fatal",
        }
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;
