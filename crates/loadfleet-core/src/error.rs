use thiserror::Error;

/// A convenience `Result` alias using [`LoadfleetError`].
pub type LoadfleetResult<T> = Result<T, LoadfleetError>;

/// Top-level error type for loadfleet.
///
/// Each variant corresponds to a subsystem that can produce errors.
#[derive(Error, Debug)]
pub enum LoadfleetError {
    /// Endpoint discovery against the cluster platform failed.
    #[error("Inventory error: {0}")]
    Inventory(String),

    /// Engine progress tracking failed.
    #[error("Progress error: {0}")]
    Progress(String),

    /// Publishing to or subscribing on a broker topic failed.
    #[error("Broker error: {0}")]
    Broker(String),

    /// The coordinator rejected or failed a request.
    #[error("Coordinator error: {0}")]
    Coordinator(String),

    /// A controller lifecycle operation failed.
    #[error("Controller error: {0}")]
    Controller(String),

    /// The engine scheduler (cluster platform) reported an error.
    #[error("Scheduler error: {0}")]
    Scheduler(String),

    /// Plan file or object storage failure.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Invalid or missing configuration.
    #[error("Config error: {0}")]
    Config(String),

    /// An operation was rejected before any side effect took place.
    #[error("Precondition failed: {0}")]
    Precondition(String),

    /// An outbound HTTP request failed or returned an error status.
    #[error("HTTP error: {0}")]
    Http(String),

    /// Several independent sub-operations failed; every failure is listed.
    #[error("{} operation(s) failed: {}", .0.len(), .0.join("; "))]
    Aggregate(Vec<String>),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl LoadfleetError {
    /// Collapse a list of failures into a single error.
    ///
    /// Returns `None` when the list is empty.
    pub fn aggregate(errors: Vec<LoadfleetError>) -> Option<Self> {
        if errors.is_empty() {
            return None;
        }
        Some(Self::Aggregate(
            errors.into_iter().map(|e| e.to_string()).collect(),
        ))
    }

    /// Whether this error is a precondition violation (surfaced as 4xx).
    pub fn is_precondition(&self) -> bool {
        matches!(self, Self::Precondition(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate_empty_is_none() {
        assert!(LoadfleetError::aggregate(vec![]).is_none());
    }

    #[test]
    fn test_aggregate_lists_every_failure() {
        let err = LoadfleetError::aggregate(vec![
            LoadfleetError::Scheduler("engine 0 unreachable".into()),
            LoadfleetError::Http("engine 2 timed out".into()),
        ]);
        let msg = err.map(|e| e.to_string()).unwrap_or_default();
        assert!(msg.starts_with("2 operation(s) failed"));
        assert!(msg.contains("engine 0 unreachable"));
        assert!(msg.contains("engine 2 timed out"));
    }
}
