//! Error taxonomy for the engine.
//!
//! Draw-level conditions ([`DrawError`]) are recoverable and classify the
//! attempt; [`TestError`] is what a test callback reports back; run-level
//! conditions ([`EngineError`]) abort the whole run and reach the caller.

use crate::data::InterestingOrigin;
use thiserror::Error;

/// Conditions raised while drawing choices. These are recovered by the
/// runner, not by strategies: marking the attempt and moving on is the
/// normal path.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DrawError {
    /// The entropy budget for this attempt ran out, or a replayed sequence
    /// was exhausted before the strategy finished drawing.
    #[error("choice sequence exhausted")]
    Overrun,
    /// A draw was attempted on frozen data.
    #[error("cannot draw from frozen data")]
    Frozen,
    /// An assumption could not be satisfied (filter retries exhausted,
    /// empty bundle, recursion bound hit). The attempt is invalid.
    #[error("assumption not satisfied: {0}")]
    Unsatisfied(String),
    /// Malformed draw parameters. Unlike the variants above this indicates
    /// a bug in a strategy and is surfaced immediately.
    #[error("invalid draw arguments: {0}")]
    InvalidArguments(String),
}

/// What a test callback reports for one attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TestError {
    #[error(transparent)]
    Draw(#[from] DrawError),
    /// An explicit assumption failed; the attempt is discarded as invalid.
    #[error("assumption failed: {0}")]
    Rejected(String),
    /// The property failed. The origin groups failures for deduplication
    /// and shrinking.
    #[error("{origin}: {message}")]
    Failure {
        origin: InterestingOrigin,
        message: String,
    },
}

impl TestError {
    /// Build a failure with an assertion-kind origin.
    pub fn failure(label: &str, message: impl Into<String>) -> Self {
        TestError::Failure {
            origin: InterestingOrigin::assertion(label),
            message: message.into(),
        }
    }
}

/// Mark the attempt invalid unless `condition` holds.
pub fn assume(condition: bool) -> Result<(), TestError> {
    if condition {
        Ok(())
    } else {
        Err(TestError::Rejected("assume".into()))
    }
}

/// Fail the property with `label` as the failure identity unless
/// `condition` holds.
pub fn verify(condition: bool, label: &str) -> Result<(), TestError> {
    if condition {
        Ok(())
    } else {
        Err(TestError::failure(label, format!("verify({label}) failed")))
    }
}

/// Heuristic diagnostics for inefficient or misconfigured generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HealthCheck {
    /// Generated examples are routinely close to the choice budget.
    DataTooLarge,
    /// Too high a proportion of attempts are filtered out.
    FilterTooMuch,
    /// Drawing inputs takes an unreasonable share of the run.
    TooSlow,
    /// A function-scoped external resource was reused across attempts.
    /// Raised by adapters via [`crate::engine::Runner::raise_health_check`];
    /// the core cannot observe fixtures itself.
    FunctionScopedResource,
}

impl std::fmt::Display for HealthCheck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthCheck::DataTooLarge => write!(f, "data_too_large"),
            HealthCheck::FilterTooMuch => write!(f, "filter_too_much"),
            HealthCheck::TooSlow => write!(f, "too_slow"),
            HealthCheck::FunctionScopedResource => write!(f, "function_scoped_resource"),
        }
    }
}

/// Run-level failures surfaced to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// Too many invalid attempts: the strategy plus its assumptions cannot
    /// produce enough valid examples.
    #[error(
        "unable to satisfy assumptions: {valid} valid examples in {calls} attempts"
    )]
    Unsatisfiable { valid: usize, calls: usize },

    /// The same choice sequence produced different outcomes on replay.
    /// Never silently resolved by picking one of them.
    #[error("flaky test: replay produced {second} where {first} was recorded")]
    Flaky { first: String, second: String },

    /// A health check fired and was not suppressed in settings.
    #[error("health check {check} failed: {message}")]
    FailedHealthCheck { check: HealthCheck, message: String },

    /// Malformed settings or strategy construction. Raised eagerly, never
    /// mid-generation.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assume_maps_to_rejected() {
        assert!(assume(true).is_ok());
        assert!(matches!(assume(false), Err(TestError::Rejected(_))));
    }

    #[test]
    fn verify_carries_the_label_as_origin() {
        match verify(false, "sum_positive") {
            Err(TestError::Failure { origin, .. }) => {
                assert_eq!(origin.label, "sum_positive");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn draw_errors_convert_into_test_errors() {
        fn inner() -> Result<(), TestError> {
            Err(DrawError::Overrun)?;
            Ok(())
        }
        assert_eq!(inner(), Err(TestError::Draw(DrawError::Overrun)));
    }
}
