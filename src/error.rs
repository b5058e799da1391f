//! Failure taxonomy of the fill pipeline.
//!
//! None of these ever reach a caller: the pipeline turns every [`Failure`]
//! into a [`Diagnostic`], logs it, and answers with the template's defaults.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::db::StructuredError;

/// The synthesizer could not produce a usable plan.
#[derive(Debug, Error)]
pub enum SynthesisError {
    #[error("template must be a non-null JSON value")]
    InvalidTemplate,
    #[error("no resolvable fields for entity `{0}`")]
    NothingToSelect(String),
    #[error("generation service unavailable: {0}")]
    Upstream(String),
    #[error("unusable generation output: {0}")]
    Unusable(String),
    #[error("synthesis timed out after {0:?}")]
    Timeout(Duration),
}

/// A statement was rejected by the safety gate.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("unsafe query rejected: {reason}")]
pub struct UnsafeQuery {
    pub reason: String,
}

impl UnsafeQuery {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// The datastore round trip failed.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("connection pool: {0}")]
    Pool(String),
    #[error("query timed out after {0:?}")]
    Timeout(Duration),
    #[error("{0}")]
    Database(StructuredError),
    #[error("malformed parameter `{key}`: {reason}")]
    Parameter { key: String, reason: String },
    #[error("unexpected result: {0}")]
    UnexpectedResult(String),
}

/// A deterministic handler could not build its fixed plan.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("payload is missing `{0}`")]
    MissingField(&'static str),
    #[error("payload field `{0}` must be a string")]
    InvalidField(&'static str),
}

/// Every terminal failure of a single request.
#[derive(Debug, Error)]
pub enum Failure {
    #[error("synthesis failed: {0}")]
    Synthesis(#[from] SynthesisError),
    #[error(transparent)]
    Unsafe(#[from] UnsafeQuery),
    #[error("execution failed: {0}")]
    Execution(#[from] ExecutionError),
    #[error("fixed plan failed: {0}")]
    Handler(#[from] HandlerError),
}

impl Failure {
    /// Pipeline stage the failure happened in, for log correlation.
    pub fn stage(&self) -> Stage {
        match self {
            Failure::Synthesis(_) => Stage::Synthesis,
            Failure::Unsafe(_) => Stage::SafetyGate,
            Failure::Execution(_) => Stage::Execution,
            Failure::Handler(_) => Stage::FixedPlan,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Synthesis,
    SafetyGate,
    Execution,
    FixedPlan,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Synthesis => write!(f, "synthesis"),
            Stage::SafetyGate => write!(f, "safety_gate"),
            Stage::Execution => write!(f, "execution"),
            Stage::FixedPlan => write!(f, "fixed_plan"),
        }
    }
}

/// A failure plus the request context needed to diagnose it offline.
#[derive(Debug)]
pub struct Diagnostic {
    pub requester: String,
    pub payload_digest: String,
    pub failure: Failure,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] requester={} payload={}: {}",
            self.failure.stage(),
            self.requester,
            self.payload_digest,
            self.failure
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_stage() {
        let f: Failure = SynthesisError::InvalidTemplate.into();
        assert_eq!(f.stage(), Stage::Synthesis);
        let f: Failure = UnsafeQuery::new("DROP").into();
        assert_eq!(f.stage(), Stage::SafetyGate);
        let f: Failure = ExecutionError::Timeout(Duration::from_secs(1)).into();
        assert_eq!(f.stage(), Stage::Execution);
        let f: Failure = HandlerError::MissingField("company_id").into();
        assert_eq!(f.stage(), Stage::FixedPlan);
    }

    #[test]
    fn test_diagnostic_display() {
        let d = Diagnostic {
            requester: "billing".into(),
            payload_digest: "abcd".into(),
            failure: UnsafeQuery::new("contains DROP").into(),
        };
        assert_eq!(
            d.to_string(),
            "[safety_gate] requester=billing payload=abcd: unsafe query rejected: contains DROP"
        );
    }
}
