use std::fmt;

use serde::{Deserialize, Serialize};

use super::executor::RawError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    Network,
    Authentication,
    RateLimit,
    ClientError,
    ServerError,
    Conflict,
    Unknown,
}

impl ErrorCategory {
    pub const ALL: [ErrorCategory; 7] = [
        ErrorCategory::Network,
        ErrorCategory::Authentication,
        ErrorCategory::RateLimit,
        ErrorCategory::ClientError,
        ErrorCategory::ServerError,
        ErrorCategory::Conflict,
        ErrorCategory::Unknown,
    ];

    /// Whether the category may be retried automatically at all. The number
    /// of attempts is bounded separately per category.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ErrorCategory::ClientError | ErrorCategory::Conflict)
    }

    /// Whether the failure says something about remote health. Auth,
    /// client and conflict errors come from a remote that answered.
    pub fn counts_against_breaker(&self) -> bool {
        matches!(
            self,
            ErrorCategory::Network
                | ErrorCategory::ServerError
                | ErrorCategory::RateLimit
                | ErrorCategory::Unknown
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Network => "NETWORK",
            ErrorCategory::Authentication => "AUTHENTICATION",
            ErrorCategory::RateLimit => "RATE_LIMIT",
            ErrorCategory::ClientError => "CLIENT_ERROR",
            ErrorCategory::ServerError => "SERVER_ERROR",
            ErrorCategory::Conflict => "CONFLICT",
            ErrorCategory::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const NETWORK_HINTS: &[&str] = &[
    "network",
    "connection",
    "connect",
    "offline",
    "timed out",
    "timeout",
    "unreachable",
    "dns",
];
const AUTH_HINTS: &[&str] = &["unauthorized", "unauthenticated", "forbidden", "jwt", "token"];
const RATE_LIMIT_HINTS: &[&str] = &["rate limit", "too many requests", "throttl"];
const CONFLICT_HINTS: &[&str] = &["conflict", "duplicate", "version mismatch"];
const SERVER_HINTS: &[&str] = &[
    "internal server",
    "service unavailable",
    "bad gateway",
    "gateway timeout",
];

/// Map a raw executor failure onto an `ErrorCategory`. Pure.
pub fn classify(error: &RawError) -> ErrorCategory {
    match error {
        RawError::Http { status, .. } => classify_status(*status),
        RawError::Network(_) | RawError::Timeout => ErrorCategory::Network,
        RawError::Other(message) => classify_message(message),
    }
}

fn classify_status(status: u16) -> ErrorCategory {
    match status {
        401 | 403 => ErrorCategory::Authentication,
        408 => ErrorCategory::Network,
        409 | 412 => ErrorCategory::Conflict,
        429 => ErrorCategory::RateLimit,
        400..=499 => ErrorCategory::ClientError,
        500..=599 => ErrorCategory::ServerError,
        _ => ErrorCategory::Unknown,
    }
}

fn classify_message(message: &str) -> ErrorCategory {
    let lower = message.to_lowercase();
    let has = |hints: &[&str]| hints.iter().any(|h| lower.contains(h));

    // Rate-limit and server hints go first: "too many requests" and
    // "gateway timeout" would otherwise match the network hints.
    if has(RATE_LIMIT_HINTS) {
        ErrorCategory::RateLimit
    } else if has(SERVER_HINTS) {
        ErrorCategory::ServerError
    } else if has(AUTH_HINTS) {
        ErrorCategory::Authentication
    } else if has(CONFLICT_HINTS) {
        ErrorCategory::Conflict
    } else if has(NETWORK_HINTS) {
        ErrorCategory::Network
    } else {
        ErrorCategory::Unknown
    }
}
