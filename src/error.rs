//! The structured error boundary the pipeline hands back to callers.
//!
//! Internal plumbing within one component is free to use `anyhow::Result`
//! the way the rest of this codebase does; [`RetrievalError`] is the type
//! a result is converted to at the point it crosses back out of the
//! pipeline (orchestrator, BM25/vector retrieval entry points).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("{message}")]
    InvalidInput { message: String },

    #[error("{message}")]
    QueryFailed {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    #[error("vector search unavailable: {message}")]
    VecSearchUnavailable { message: String },

    #[error("internal error: {message}")]
    Internal {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },
}

impl RetrievalError {
    pub fn code(&self) -> &'static str {
        match self {
            RetrievalError::InvalidInput { .. } => "INVALID_INPUT",
            RetrievalError::QueryFailed { .. } => "QUERY_FAILED",
            RetrievalError::VecSearchUnavailable { .. } => "VEC_SEARCH_UNAVAILABLE",
            RetrievalError::Internal { .. } => "INTERNAL",
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        RetrievalError::InvalidInput {
            message: message.into(),
        }
    }

    pub fn query_failed(message: impl Into<String>, source: anyhow::Error) -> Self {
        RetrievalError::QueryFailed {
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn vec_search_unavailable(message: impl Into<String>) -> Self {
        RetrievalError::VecSearchUnavailable {
            message: message.into(),
        }
    }

    pub fn internal(source: anyhow::Error) -> Self {
        RetrievalError::Internal {
            message: source.to_string(),
            source: Some(source),
        }
    }
}

pub type Result<T> = std::result::Result<T, RetrievalError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(
            RetrievalError::invalid_input("bad query").code(),
            "INVALID_INPUT"
        );
        assert_eq!(
            RetrievalError::vec_search_unavailable("no index").code(),
            "VEC_SEARCH_UNAVAILABLE"
        );
        assert_eq!(
            RetrievalError::internal(anyhow::anyhow!("boom")).code(),
            "INTERNAL"
        );
    }
}
