pub mod failure;
pub mod status;
pub mod wire;

pub use failure::{FailureReason, MAX_ATTEMPTS};
pub use status::{ContractError, QueueStatus};
pub use wire::{
    error_codes, fields, parse_visibility, visibility_flag, ErrorBody, UploadMetadata,
    UploadResponse, HEALTH_LIVE_PATH, UPLOAD_PATH,
};
