use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::GenerationParams;

/// One unit of a generation stream, as produced by a worker.
///
/// Every request produces exactly one [`StreamIncrement::End`], and it is always
/// the last value sent for that request. The same sentinel doubles as a worker's
/// load-complete acknowledgment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamIncrement {
    /// Generated text
    Text(String),

    /// Generation failed; still followed by `End`
    Error(String),

    /// End of stream
    End,
}

impl StreamIncrement {
    pub fn is_end(&self) -> bool {
        matches!(self, StreamIncrement::End)
    }
}

/// A prompt and its parameters, addressed to a single worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// Correlates log records across the dispatcher and the worker
    pub id: Uuid,
    pub prompt: String,
    pub params: GenerationParams,
}

impl GenerationRequest {
    pub fn new<S: Into<String>>(prompt: S, params: GenerationParams) -> Self {
        Self {
            id: Uuid::new_v4(),
            prompt: prompt.into(),
            params,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requests_get_unique_ids() {
        let a = GenerationRequest::new("q", GenerationParams::default());
        let b = GenerationRequest::new("q", GenerationParams::default());
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_only_end_is_the_sentinel() {
        assert!(StreamIncrement::End.is_end());
        assert!(!StreamIncrement::Text(String::new()).is_end());
        assert!(!StreamIncrement::Error("x".into()).is_end());
    }
}
