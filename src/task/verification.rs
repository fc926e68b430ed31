//! Result of a step's verify call.
//!
//! A failed verification is treated like an execution error: the attempt
//! counts as failed and the step is retried. Suggestions are carried into
//! the retry reason so they show up in events and logs.

use serde::{Deserialize, Serialize};

/// Outcome of verifying a step result.
///
/// # Invariants
/// - If `verified == false`, the attempt is considered failed
/// - `confidence` is in `[0.0, 1.0]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationResult {
    verified: bool,
    confidence: f64,
    /// Observations backing the verdict
    evidence: Vec<String>,
    /// Hints for the next attempt when verification fails
    suggestions: Vec<String>,
}

impl VerificationResult {
    /// Create a passing result.
    ///
    /// # Postcondition
    /// `result.verified() == true`
    pub fn pass(confidence: f64) -> Self {
        Self {
            verified: true,
            confidence: confidence.clamp(0.0, 1.0),
            evidence: Vec::new(),
            suggestions: Vec::new(),
        }
    }

    /// Create a failing result.
    ///
    /// # Postcondition
    /// `result.verified() == false`
    pub fn fail(confidence: f64) -> Self {
        Self {
            verified: false,
            confidence: confidence.clamp(0.0, 1.0),
            evidence: Vec::new(),
            suggestions: Vec::new(),
        }
    }

    pub fn with_evidence(mut self, evidence: impl Into<String>) -> Self {
        self.evidence.push(evidence.into());
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }

    pub fn verified(&self) -> bool {
        self.verified
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    pub fn evidence(&self) -> &[String] {
        &self.evidence
    }

    pub fn suggestions(&self) -> &[String] {
        &self.suggestions
    }

    /// Human-readable reason used when a failed verification triggers a retry.
    pub fn failure_reason(&self) -> String {
        if self.suggestions.is_empty() {
            "verification failed".to_string()
        } else {
            format!("verification failed; suggestions: {}", self.suggestions.join("; "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_reason_includes_suggestions() {
        let v = VerificationResult::fail(0.2)
            .with_evidence("output missing header")
            .with_suggestion("include a header row")
            .with_suggestion("quote fields");

        assert!(!v.verified());
        assert_eq!(v.evidence().len(), 1);
        assert_eq!(
            v.failure_reason(),
            "verification failed; suggestions: include a header row; quote fields"
        );
        assert_eq!(VerificationResult::fail(0.0).failure_reason(), "verification failed");
    }
}
