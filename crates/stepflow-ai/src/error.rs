use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepflowErrorCode {
    InvalidArgument,
    InvalidPrompt,
    NoSuchTool,
    InvalidToolArguments,
    ToolExecutionFailed,
    ProviderAuthMissing,
    ProviderHttp,
    ProviderTransport,
    ProviderProtocol,
    RetriesExhausted,
    CallbackFailed,
    StreamClosed,
    Aborted,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepflowError {
    pub code: StepflowErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl StepflowError {
    pub fn new(code: StepflowErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn invalid_argument(parameter: &str, value: Value, message: impl Into<String>) -> Self {
        Self::new(StepflowErrorCode::InvalidArgument, message).with_details(serde_json::json!({
            "parameter": parameter,
            "value": value,
        }))
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(StepflowErrorCode::Cancelled, message)
    }

    pub fn aborted() -> Self {
        Self::new(StepflowErrorCode::Aborted, "The operation was aborted")
    }

    /// Transport failures and HTTP 408/409/429/5xx responses may succeed when retried.
    pub fn is_retryable(&self) -> bool {
        match self.code {
            StepflowErrorCode::ProviderTransport => true,
            StepflowErrorCode::ProviderHttp => match self.http_status() {
                Some(status) => matches!(status, 408 | 409 | 429) || status >= 500,
                None => true,
            },
            _ => false,
        }
    }

    pub fn http_status(&self) -> Option<u64> {
        self.details
            .as_ref()
            .and_then(|details| details.get("status"))
            .and_then(Value::as_u64)
    }

    pub fn as_compact_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                "{{\"code\":\"provider_protocol\",\"message\":\"{}\"}}",
                self.message.replace('\"', "\\\"")
            )
        })
    }
}

impl Display for StepflowError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

impl std::error::Error for StepflowError {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn http_errors_are_retryable_only_for_transient_statuses() {
        let throttled = StepflowError::new(StepflowErrorCode::ProviderHttp, "slow down")
            .with_details(json!({ "status": 429 }));
        let unauthorized = StepflowError::new(StepflowErrorCode::ProviderHttp, "no key")
            .with_details(json!({ "status": 401 }));
        let overloaded = StepflowError::new(StepflowErrorCode::ProviderHttp, "overloaded")
            .with_details(json!({ "status": 529 }));

        assert!(throttled.is_retryable());
        assert!(!unauthorized.is_retryable());
        assert!(overloaded.is_retryable());
        assert!(StepflowError::new(StepflowErrorCode::ProviderTransport, "reset").is_retryable());
        assert!(!StepflowError::new(StepflowErrorCode::ProviderProtocol, "bad").is_retryable());
    }

    #[test]
    fn compact_json_uses_snake_case_codes() {
        let error =
            StepflowError::invalid_argument("maxSteps", json!(0), "maxSteps must be at least 1");
        let encoded = error.as_compact_json();

        assert!(encoded.contains("\"code\":\"invalid_argument\""));
        assert!(encoded.contains("\"parameter\":\"maxSteps\""));
    }
}
