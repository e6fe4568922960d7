use axum::http::StatusCode;
use axum::Json;
use fieldpost_contract::error_codes;
use serde_json::{json, Value};
use thiserror::Error;

/// Why an upload, or one file part of it, was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IngestRejection {
    #[error("upload transfer failed: {0}")]
    Transfer(String),
    #[error("file exceeds {limit} bytes")]
    TooLarge { limit: usize },
    #[error("content is not an accepted type (declared {declared})")]
    UnsupportedMediaType { declared: String },
    #[error("missing field {0}")]
    MissingField(&'static str),
    #[error("invalid field {field}: {detail}")]
    InvalidField { field: &'static str, detail: String },
    #[error("request carries no file part")]
    NoFile,
    #[error("more than {limit} files in one request")]
    TooManyFiles { limit: usize },
}

impl IngestRejection {
    pub fn status(&self) -> StatusCode {
        match self {
            IngestRejection::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            IngestRejection::UnsupportedMediaType { .. } => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            IngestRejection::Transfer(_)
            | IngestRejection::MissingField(_)
            | IngestRejection::InvalidField { .. }
            | IngestRejection::NoFile
            | IngestRejection::TooManyFiles { .. } => StatusCode::BAD_REQUEST,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            IngestRejection::Transfer(_) => error_codes::TRANSFER_ERROR,
            IngestRejection::TooLarge { .. } => error_codes::FILE_TOO_LARGE,
            IngestRejection::UnsupportedMediaType { .. } => error_codes::UNSUPPORTED_MEDIA_TYPE,
            IngestRejection::MissingField(_) => error_codes::MISSING_FIELD,
            IngestRejection::InvalidField { .. } => error_codes::INVALID_FIELD,
            IngestRejection::NoFile => error_codes::NO_FILE,
            IngestRejection::TooManyFiles { .. } => error_codes::TOO_MANY_FILES,
        }
    }

    pub fn into_response_parts(self) -> (StatusCode, Json<Value>) {
        (
            self.status(),
            Json(json!({ "error": self.code(), "detail": self.to_string() })),
        )
    }
}

impl From<fieldpost_contract::ContractError> for IngestRejection {
    fn from(err: fieldpost_contract::ContractError) -> Self {
        match err {
            fieldpost_contract::ContractError::InvalidField { field, detail } => {
                IngestRejection::InvalidField { field, detail }
            }
            other => IngestRejection::Transfer(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejections_map_to_statuses_and_codes() {
        let cases = [
            (IngestRejection::TooLarge { limit: 10 }, 413, "file_too_large"),
            (
                IngestRejection::UnsupportedMediaType {
                    declared: "image/jpeg".to_string(),
                },
                415,
                "unsupported_media_type",
            ),
            (IngestRejection::MissingField("stage"), 400, "missing_field"),
            (IngestRejection::NoFile, 400, "no_file"),
            (IngestRejection::Transfer("reset".to_string()), 400, "transfer_error"),
        ];

        for (rejection, status, code) in cases {
            assert_eq!(rejection.status().as_u16(), status);
            assert_eq!(rejection.code(), code);
        }
    }

    #[test]
    fn body_carries_code_and_detail() {
        let (status, Json(body)) = IngestRejection::MissingField("owner_id").into_response_parts();
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "missing_field");
        assert_eq!(body["detail"], "missing field owner_id");
    }
}
