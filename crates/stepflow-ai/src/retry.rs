use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;

use crate::abort::AbortSignal;
use crate::error::{StepflowError, StepflowErrorCode};
use crate::types::DEFAULT_MAX_RETRIES;

pub const DEFAULT_INITIAL_RETRY_DELAY_MS: u64 = 2_000;
pub const DEFAULT_RETRY_BACKOFF_FACTOR: u64 = 2;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(rename = "maxRetries")]
    pub max_retries: usize,
    #[serde(rename = "initialDelayMs")]
    pub initial_delay_ms: u64,
    #[serde(rename = "backoffFactor")]
    pub backoff_factor: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            initial_delay_ms: DEFAULT_INITIAL_RETRY_DELAY_MS,
            backoff_factor: DEFAULT_RETRY_BACKOFF_FACTOR,
        }
    }
}

impl RetryPolicy {
    fn delay_for_attempt(&self, attempt: usize) -> u64 {
        let mut delay = self.initial_delay_ms;
        for _ in 1..attempt {
            delay = delay.saturating_mul(self.backoff_factor);
        }
        delay
    }
}

/// Runs `operation`, retrying retryable failures with exponentially growing delays.
///
/// The first failure is returned unchanged when it is not retryable or when retries are
/// disabled. Later failures are wrapped in a `retries_exhausted` error whose details list
/// every attempt's error.
pub async fn retry_with_exponential_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    signal: Option<&AbortSignal>,
    mut operation: F,
) -> Result<T, StepflowError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StepflowError>>,
{
    let mut errors: Vec<StepflowError> = Vec::new();
    loop {
        let error = match operation().await {
            Ok(result) => return Ok(result),
            Err(error) => error,
        };

        if error.code == StepflowErrorCode::Aborted || policy.max_retries == 0 {
            return Err(error);
        }

        errors.push(error);
        let attempt = errors.len();
        let last = &errors[attempt - 1];

        if attempt > policy.max_retries {
            return Err(exhausted(
                format!(
                    "Failed after {attempt} attempts. Last error: {}",
                    last.message
                ),
                "maxRetriesExceeded",
                &errors,
            ));
        }

        if !last.is_retryable() {
            if attempt == 1 {
                return Err(errors.remove(0));
            }
            return Err(exhausted(
                format!(
                    "Failed after {attempt} attempts with non-retryable error: '{}'",
                    last.message
                ),
                "errorNotRetryable",
                &errors,
            ));
        }

        let delay_ms = policy.delay_for_attempt(attempt);
        warn!(
            attempt,
            max_retries = policy.max_retries,
            delay_ms,
            error_code = ?last.code,
            error = last.message.as_str(),
            "scheduling retry after model call failure"
        );
        wait_or_abort(delay_ms, signal).await?;
    }
}

async fn wait_or_abort(delay_ms: u64, signal: Option<&AbortSignal>) -> Result<(), StepflowError> {
    let Some(signal) = signal else {
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        return Ok(());
    };

    if signal.is_aborted() {
        return Err(StepflowError::aborted());
    }
    tokio::select! {
        _ = signal.cancelled() => Err(StepflowError::aborted()),
        _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => Ok(()),
    }
}

fn exhausted(message: String, reason: &str, errors: &[StepflowError]) -> StepflowError {
    let errors = errors
        .iter()
        .map(|error| serde_json::to_value(error).unwrap_or(Value::Null))
        .collect::<Vec<_>>();
    StepflowError::new(StepflowErrorCode::RetriesExhausted, message).with_details(json!({
        "reason": reason,
        "errors": errors,
    }))
}
