/// Shorten long server bodies before they reach logs or reports.
pub fn truncate_string(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let mut out: String = s.chars().take(max).collect();
        out.push_str("...");
        out
    }
}

/// All variants carry owned strings so per-record failures can be cloned
/// into the final report.
#[derive(thiserror::Error, Debug, Clone)]
pub enum EmbedError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("HTTP {status} at {url}: {body}")]
    Http {
        status: u16,
        body: String,
        url: String,
    },

    #[error("Malformed embedding response: {0}")]
    Decode(String),

    #[error("Invalid vector dimension: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Input rejected as oversized: {0}")]
    OversizedInput(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Dataset error: {0}")]
    Dataset(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<reqwest::Error> for EmbedError {
    fn from(e: reqwest::Error) -> Self {
        EmbedError::Network(e.to_string())
    }
}

impl EmbedError {
    /// Transient failures get a bounded retry; everything else fails the
    /// record immediately.
    pub fn is_transient(&self) -> bool {
        match self {
            EmbedError::Network(_) => true,
            EmbedError::Http { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}
