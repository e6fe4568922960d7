use serde::{Deserialize, Serialize};

use crate::status::ContractError;

pub const UPLOAD_PATH: &str = "/v1/uploads";
pub const HEALTH_LIVE_PATH: &str = "/health/live";

/// Multipart field names of an upload request.
pub mod fields {
    pub const OWNER_TYPE: &str = "owner_type";
    pub const OWNER_ID: &str = "owner_id";
    pub const STAGE: &str = "stage";
    pub const CLIENT_VISIBLE: &str = "client_visible";
    pub const FILE: &str = "file";
}

/// Machine-readable `error` values carried in non-2xx bodies.
pub mod error_codes {
    pub const UNAUTHORIZED: &str = "invalid_or_missing_bearer_token";
    pub const TRANSFER_ERROR: &str = "transfer_error";
    pub const FILE_TOO_LARGE: &str = "file_too_large";
    pub const UNSUPPORTED_MEDIA_TYPE: &str = "unsupported_media_type";
    pub const MISSING_FIELD: &str = "missing_field";
    pub const INVALID_FIELD: &str = "invalid_field";
    pub const NO_FILE: &str = "no_file";
    pub const TOO_MANY_FILES: &str = "too_many_files";
    pub const NOT_FOUND: &str = "not_found";
    pub const INTERNAL: &str = "internal_error";
}

/// Body of a 2xx upload response. `failed` counts rejected sibling parts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UploadResponse {
    pub ids: Vec<i64>,
    pub failed: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorBody {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Metadata fields sent alongside the file part.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UploadMetadata {
    pub owner_type: String,
    pub owner_id: i64,
    pub stage: String,
    pub client_visible: bool,
}

impl UploadMetadata {
    /// Text fields in wire order.
    pub fn form_fields(&self) -> [(&'static str, String); 4] {
        [
            (fields::OWNER_TYPE, self.owner_type.clone()),
            (fields::OWNER_ID, self.owner_id.to_string()),
            (fields::STAGE, self.stage.clone()),
            (
                fields::CLIENT_VISIBLE,
                visibility_flag(self.client_visible).to_string(),
            ),
        ]
    }
}

pub fn visibility_flag(visible: bool) -> &'static str {
    if visible {
        "1"
    } else {
        "0"
    }
}

pub fn parse_visibility(raw: &str) -> Result<bool, ContractError> {
    match raw.trim() {
        "1" => Ok(true),
        "0" => Ok(false),
        other => Err(ContractError::InvalidField {
            field: fields::CLIENT_VISIBLE,
            detail: format!("expected \"0\" or \"1\", got {other:?}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_fields_use_wire_encoding() {
        let metadata = UploadMetadata {
            owner_type: "project".to_string(),
            owner_id: 42,
            stage: "before".to_string(),
            client_visible: true,
        };

        let encoded = metadata.form_fields();
        assert_eq!(encoded[1], ("owner_id", "42".to_string()));
        assert_eq!(encoded[3], ("client_visible", "1".to_string()));
    }

    #[test]
    fn visibility_accepts_only_binary_flags() {
        assert_eq!(parse_visibility("1"), Ok(true));
        assert_eq!(parse_visibility("0"), Ok(false));
        assert!(parse_visibility("true").is_err());
    }

    #[test]
    fn upload_response_shape() {
        let parsed: UploadResponse =
            serde_json::from_str(r#"{"ids":[7,8],"failed":1}"#).expect("parse");
        assert_eq!(
            parsed,
            UploadResponse {
                ids: vec![7, 8],
                failed: 1
            }
        );
    }
}
