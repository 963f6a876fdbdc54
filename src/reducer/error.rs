//! Error type for the reduction engine

#[derive(Debug)]
pub enum ReducerError {
    /// Transient store failure (timeout, lock contention, I/O)
    Store(String),
    /// Inbound item missing its correlation identifiers
    Malformed(String),
    /// Strategy could not be reconstructed from its descriptor
    Strategy(String),
    Schedule(String),
    Dispatch(String),
    Serialization(serde_json::Error),
    Io(std::io::Error),
}

impl ReducerError {
    /// Whether the transport should redeliver the item that hit this error
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ReducerError::Malformed(_) | ReducerError::Strategy(_))
    }
}

impl From<rusqlite::Error> for ReducerError {
    fn from(err: rusqlite::Error) -> Self {
        ReducerError::Store(err.to_string())
    }
}

impl From<serde_json::Error> for ReducerError {
    fn from(err: serde_json::Error) -> Self {
        ReducerError::Serialization(err)
    }
}

impl From<std::io::Error> for ReducerError {
    fn from(err: std::io::Error) -> Self {
        ReducerError::Io(err)
    }
}

impl std::fmt::Display for ReducerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReducerError::Store(e) => write!(f, "Store error: {}", e),
            ReducerError::Malformed(e) => write!(f, "Malformed event: {}", e),
            ReducerError::Strategy(e) => write!(f, "Strategy error: {}", e),
            ReducerError::Schedule(e) => write!(f, "Schedule error: {}", e),
            ReducerError::Dispatch(e) => write!(f, "Dispatch error: {}", e),
            ReducerError::Serialization(e) => write!(f, "Serialization error: {}", e),
            ReducerError::Io(e) => write!(f, "IO error: {}", e),
        }
    }
}

impl std::error::Error for ReducerError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(ReducerError::Store("busy".into()).is_retryable());
        assert!(ReducerError::Schedule("closed".into()).is_retryable());
        assert!(ReducerError::Dispatch("down".into()).is_retryable());
        assert!(!ReducerError::Malformed("no group_id".into()).is_retryable());
        assert!(!ReducerError::Strategy("unknown condition".into()).is_retryable());
    }

    #[test]
    fn test_rusqlite_error_maps_to_store() {
        let err: ReducerError = rusqlite::Error::QueryReturnedNoRows.into();
        assert!(matches!(err, ReducerError::Store(_)));
        assert!(err.to_string().starts_with("Store error"));
    }
}
