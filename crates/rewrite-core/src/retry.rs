use crate::error::PipelineError;

/// Result of one failed attempt.
#[derive(Debug)]
pub enum AttemptError {
    /// Validation-detectable condition; the attempt may be repeated.
    Retryable(String),
    /// Stops the retry loop immediately.
    Fatal(PipelineError),
}

impl From<PipelineError> for AttemptError {
    fn from(err: PipelineError) -> Self {
        if err.is_retryable() {
            AttemptError::Retryable(err.to_string())
        } else {
            AttemptError::Fatal(err)
        }
    }
}

impl From<std::io::Error> for AttemptError {
    fn from(err: std::io::Error) -> Self {
        AttemptError::Fatal(err.into())
    }
}

#[derive(Debug)]
pub enum RetryError {
    Fatal(PipelineError),
    Exhausted { attempts: u32, last_reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 3 }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }

    /// Run `op` until it succeeds, fails fatally, or has been attempted
    /// `max_attempts` times. `op` receives the 1-based attempt number.
    pub fn run<T, F>(&self, label: &str, mut op: F) -> Result<T, RetryError>
    where
        F: FnMut(u32) -> Result<T, AttemptError>,
    {
        let mut last_reason = String::new();
        for attempt in 1..=self.max_attempts {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(AttemptError::Fatal(err)) => return Err(RetryError::Fatal(err)),
                Err(AttemptError::Retryable(reason)) => {
                    tracing::warn!(
                        operation = label,
                        attempt,
                        max_attempts = self.max_attempts,
                        reason = %reason,
                        "attempt failed validation"
                    );
                    last_reason = reason;
                }
            }
        }
        Err(RetryError::Exhausted {
            attempts: self.max_attempts,
            last_reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn always_invalid_exhausts_exactly_max_attempts() {
        let mut calls = 0;
        let result: Result<(), _> = RetryPolicy::default().run("stage", |_| {
            calls += 1;
            Err(AttemptError::Retryable("count mismatch".to_string()))
        });
        assert_eq!(calls, 3);
        match result {
            Err(RetryError::Exhausted {
                attempts,
                last_reason,
            }) => {
                assert_eq!(attempts, 3);
                assert_eq!(last_reason, "count mismatch");
            }
            other => panic!("expected exhaustion, got {:?}", other),
        }
    }

    #[test]
    fn fatal_error_stops_without_retrying() {
        let mut calls = 0;
        let result: Result<(), _> = RetryPolicy::default().run("stage", |_| {
            calls += 1;
            Err(PipelineError::ExternalToolFailure {
                command: "instrument".to_string(),
                stderr: "crash".to_string(),
            }
            .into())
        });
        assert_eq!(calls, 1);
        assert!(matches!(
            result,
            Err(RetryError::Fatal(PipelineError::ExternalToolFailure { .. }))
        ));
    }

    #[test]
    fn timeout_is_retried_then_succeeds() {
        let result = RetryPolicy::default().run("trial", |attempt| {
            if attempt < 2 {
                Err(PipelineError::ToolTimeout {
                    command: "replay".to_string(),
                    timeout_secs: 1,
                }
                .into())
            } else {
                Ok(attempt)
            }
        });
        assert_eq!(result.expect("second attempt succeeds"), 2);
    }

    #[test]
    fn zero_attempts_is_clamped_to_one() {
        assert_eq!(RetryPolicy::new(0).max_attempts, 1);
    }
}
