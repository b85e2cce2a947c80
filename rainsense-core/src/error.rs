use std::time::Duration;

use thiserror::Error;

/// Failure of a single provider call or its construction.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Missing credentials or location; detected when the chain is built,
    /// excludes the provider rather than failing the process.
    #[error("provider '{provider}' is not usable: {reason}")]
    Unsupported { provider: &'static str, reason: String },

    #[error("{provider} request failed: {source}")]
    Http {
        provider: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("{provider} request failed with status {status}: {body}")]
    Status {
        provider: &'static str,
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("{provider} returned a malformed payload: {detail}")]
    Malformed { provider: &'static str, detail: String },

    #[error("{provider} call exceeded its {budget:?} budget")]
    Timeout { provider: &'static str, budget: Duration },
}

impl ProviderError {
    pub fn provider(&self) -> &'static str {
        match self {
            ProviderError::Unsupported { provider, .. }
            | ProviderError::Http { provider, .. }
            | ProviderError::Status { provider, .. }
            | ProviderError::Malformed { provider, .. }
            | ProviderError::Timeout { provider, .. } => provider,
        }
    }
}

/// Failure of a chain-level operation.
#[derive(Debug, Error)]
pub enum ChainError {
    /// Every candidate provider was excluded at construction time.
    #[error("no usable weather provider is configured")]
    NoProviders,

    /// The shared backoff window is active and no cached result can serve
    /// the request; no network attempt was made.
    #[error("backing off after repeated failures, retry in {retry_in:?}")]
    BackoffActive { retry_in: Duration },

    /// Every supported provider failed in one attempt. Carries the last
    /// provider's error; earlier failures are only logged.
    #[error("all providers failed, last: {last}")]
    Exhausted {
        #[source]
        last: ProviderError,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_error_names_its_provider() {
        let err = ProviderError::Unsupported {
            provider: "openweather",
            reason: "no API key".into(),
        };
        assert_eq!(err.provider(), "openweather");
        assert!(err.to_string().contains("openweather"));
    }

    #[test]
    fn exhausted_preserves_last_error() {
        let last = ProviderError::Malformed { provider: "weatherapi", detail: "empty body".into() };
        let err = ChainError::Exhausted { last };
        assert!(err.to_string().contains("weatherapi"));
    }
}
