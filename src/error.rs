use thiserror::Error;

use crate::models::Direction;

/// Errors surfaced by the exchange gateway
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out")]
    Timeout,

    #[error("rate limited (HTTP 429)")]
    RateLimited,

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// Structured error code returned by the exchange for a request
    #[error("exchange error {code}: {msg}")]
    Api { code: String, msg: String },

    #[error("failed to decode response: {0}")]
    Decode(String),

    #[error("empty response from {0}")]
    EmptyResponse(String),

    #[error("request signing failed: {0}")]
    Signature(String),

    #[error("worker task failed: {0}")]
    Worker(String),
}

impl ExchangeError {
    /// Transient errors are retried by the gateway; protocol errors never are.
    pub fn is_retryable(&self) -> bool {
        match self {
            ExchangeError::Network(_) | ExchangeError::Timeout | ExchangeError::RateLimited => true,
            ExchangeError::Http { status, .. } => *status >= 500,
            _ => false,
        }
    }

    pub fn code(&self) -> Option<&str> {
        match self {
            ExchangeError::Api { code, .. } => Some(code),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ExchangeError::Timeout
        } else if e.is_decode() {
            ExchangeError::Decode(e.to_string())
        } else {
            ExchangeError::Network(e.to_string())
        }
    }
}

impl From<serde_json::Error> for ExchangeError {
    fn from(e: serde_json::Error) -> Self {
        ExchangeError::Decode(e.to_string())
    }
}

/// Errors from the on-disk state store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("state file io: {0}")]
    Io(#[from] std::io::Error),

    #[error("state file json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Top-level error for the execution engine
#[derive(Debug, Error)]
pub enum BotError {
    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("market data unavailable: {0}")]
    MarketData(String),

    /// Market close could not be confirmed; protective orders were left in place
    #[error("close of {direction} {size} not confirmed after {attempts} attempts")]
    CloseFailed {
        direction: Direction,
        size: f64,
        attempts: u32,
    },

    /// Emergency close exhausted every attempt: the position may be open without a stop
    #[error("EMERGENCY CLOSE FAILED: {direction} {size} may be unprotected after {attempts} attempts")]
    EmergencyCloseFailed {
        direction: Direction,
        size: f64,
        attempts: u32,
    },
}

impl BotError {
    /// A fatal error means the engine can no longer guarantee the position is protected.
    pub fn is_fatal(&self) -> bool {
        matches!(self, BotError::EmergencyCloseFailed { .. })
    }
}

impl From<config::ConfigError> for BotError {
    fn from(e: config::ConfigError) -> Self {
        BotError::Config(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(ExchangeError::RateLimited.is_retryable());
        assert!(ExchangeError::Timeout.is_retryable());
        assert!(ExchangeError::Http {
            status: 502,
            body: String::new()
        }
        .is_retryable());
        assert!(!ExchangeError::Api {
            code: "51000".to_string(),
            msg: "Parameter error".to_string()
        }
        .is_retryable());
        assert!(!ExchangeError::Http {
            status: 401,
            body: String::new()
        }
        .is_retryable());
    }

    #[test]
    fn test_only_emergency_failure_is_fatal() {
        let fatal = BotError::EmergencyCloseFailed {
            direction: Direction::Long,
            size: 1.0,
            attempts: 3,
        };
        let close = BotError::CloseFailed {
            direction: Direction::Long,
            size: 1.0,
            attempts: 3,
        };
        assert!(fatal.is_fatal());
        assert!(!close.is_fatal());
        assert!(!BotError::Exchange(ExchangeError::Timeout).is_fatal());
    }
}
