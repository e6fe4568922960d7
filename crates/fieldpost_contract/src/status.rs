use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ContractError {
    #[error("unknown queue status: {0}")]
    UnknownStatus(String),
    #[error("unknown failure classification: {0}")]
    UnknownFailure(String),
    #[error("invalid field {field}: {detail}")]
    InvalidField { field: &'static str, detail: String },
}

/// Lifecycle of a queued delivery.
///
/// `Sent` is never persisted: a delivered item is removed together with its
/// staged file, so row absence and `Sent` mean the same thing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    Uploading,
    Sent,
    Failed,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Uploading => "uploading",
            QueueStatus::Sent => "sent",
            QueueStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, QueueStatus::Sent | QueueStatus::Failed)
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueStatus {
    type Err = ContractError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(QueueStatus::Pending),
            "uploading" => Ok(QueueStatus::Uploading),
            "sent" => Ok(QueueStatus::Sent),
            "failed" => Ok(QueueStatus::Failed),
            other => Err(ContractError::UnknownStatus(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::QueueStatus;

    #[test]
    fn only_sent_and_failed_are_terminal() {
        assert!(!QueueStatus::Pending.is_terminal());
        assert!(!QueueStatus::Uploading.is_terminal());
        assert!(QueueStatus::Sent.is_terminal());
        assert!(QueueStatus::Failed.is_terminal());
    }

    #[test]
    fn parses_persisted_names() {
        for status in [
            QueueStatus::Pending,
            QueueStatus::Uploading,
            QueueStatus::Sent,
            QueueStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<QueueStatus>(), Ok(status));
        }
        assert!("queued".parse::<QueueStatus>().is_err());
    }
}
