use std::fmt;
use std::str::FromStr;

use http::StatusCode;
use serde::{Deserialize, Serialize};

use crate::status::ContractError;

/// Number of delivery attempts after which an item is failed permanently.
pub const MAX_ATTEMPTS: u32 = 10;

/// Classification recorded as `last_error` on a queue item. Serialized as
/// its label, e.g. `"http_503"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum FailureReason {
    FileMissing,
    NotAuthenticated,
    NetworkError,
    LocalIo,
    Http(u16),
    CapExceeded,
}

impl FailureReason {
    pub fn from_status(status: StatusCode) -> Self {
        FailureReason::Http(status.as_u16())
    }

    /// Whether another attempt can change the outcome.
    ///
    /// Every HTTP status is retried up to the cap, client errors included. A
    /// 401 also invalidates the credential, so the attempt after it fails fast
    /// as `not_authenticated`.
    pub fn is_retryable(&self) -> bool {
        match self {
            FailureReason::FileMissing
            | FailureReason::NotAuthenticated
            | FailureReason::CapExceeded => false,
            FailureReason::NetworkError | FailureReason::LocalIo | FailureReason::Http(_) => true,
        }
    }

    /// How a `Failed` row with this `last_error` ended: `CapExceeded` when a
    /// retryable failure ran out of attempts, otherwise the reason itself.
    pub fn terminal(self, attempts: u32, max_attempts: u32) -> FailureReason {
        if self.is_retryable() && attempts >= max_attempts {
            FailureReason::CapExceeded
        } else {
            self
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::FileMissing => f.write_str("file_missing"),
            FailureReason::NotAuthenticated => f.write_str("not_authenticated"),
            FailureReason::NetworkError => f.write_str("network_error"),
            FailureReason::LocalIo => f.write_str("local_io_error"),
            FailureReason::Http(code) => write!(f, "http_{code}"),
            FailureReason::CapExceeded => f.write_str("cap_exceeded"),
        }
    }
}

impl FromStr for FailureReason {
    type Err = ContractError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "file_missing" => Ok(FailureReason::FileMissing),
            "not_authenticated" => Ok(FailureReason::NotAuthenticated),
            "network_error" => Ok(FailureReason::NetworkError),
            "local_io_error" => Ok(FailureReason::LocalIo),
            "cap_exceeded" => Ok(FailureReason::CapExceeded),
            other => other
                .strip_prefix("http_")
                .and_then(|code| code.parse::<u16>().ok())
                .map(FailureReason::Http)
                .ok_or_else(|| ContractError::UnknownFailure(other.to_string())),
        }
    }
}

impl From<FailureReason> for String {
    fn from(reason: FailureReason) -> Self {
        reason.to_string()
    }
}

impl TryFrom<String> for FailureReason {
    type Error = ContractError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}
