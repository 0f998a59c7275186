use std::time::Duration;

/// Normalized adapter error taxonomy.
///
/// Every concrete provider adapter must collapse whatever its transport
/// throws into one of these four kinds before the router engine sees it.
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("rate limited{}", retry_after_display(.retry_after))]
    RateLimit { retry_after: Option<Duration> },

    #[error("quota exceeded")]
    QuotaExceeded,

    #[error("transient upstream error: {0}")]
    Transient(String),

    #[error("permanent error: {0}{}", sentinel_display(.sentinel))]
    Permanent {
        message: String,
        sentinel: Option<PermanentSentinel>,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

fn retry_after_display(retry_after: &Option<Duration>) -> String {
    match retry_after {
        Some(d) => format!(" (retry after {}ms)", d.as_millis()),
        None => String::new(),
    }
}

fn sentinel_display(sentinel: &Option<PermanentSentinel>) -> String {
    match sentinel {
        Some(s) => format!(" [{}]", s.as_str()),
        None => String::new(),
    }
}

/// Recognizable sentinels carried on [`AdapterError::Permanent`] so the
/// router can apply special-case handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermanentSentinel {
    ContextLengthExceeded,
}

impl PermanentSentinel {
    pub fn as_str(self) -> &'static str {
        match self {
            PermanentSentinel::ContextLengthExceeded => "context_length_exceeded",
        }
    }
}

impl AdapterError {
    pub fn permanent(message: impl Into<String>) -> Self {
        AdapterError::Permanent {
            message: message.into(),
            sentinel: None,
        }
    }

    pub fn context_length_exceeded(message: impl Into<String>) -> Self {
        AdapterError::Permanent {
            message: message.into(),
            sentinel: Some(PermanentSentinel::ContextLengthExceeded),
        }
    }

    pub fn is_context_length_exceeded(&self) -> bool {
        matches!(
            self,
            AdapterError::Permanent {
                sentinel: Some(PermanentSentinel::ContextLengthExceeded),
                ..
            }
        )
    }
}

/// Engine-level failure, surfaced to the HTTP layer as a single error
/// response.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("no suitable model available")]
    NoSuitableModel { retry_after_ms: u64 },

    #[error("context window too small to fit any message")]
    ContextDoesNotFit,

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}
