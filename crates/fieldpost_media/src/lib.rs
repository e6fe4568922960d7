//! Media handling shared by the device and the ingest server.
//!
//! - [`sniff`] decides what a file really is from its leading bytes.
//! - [`location`] strips GPS metadata from JPEGs before they are queued.
//! - [`reencode`] decodes and re-encodes accepted images on the server.
//!
//! Sanitising is a privacy control. Every entry point that touches a file
//! degrades to the original bytes on failure instead of losing the upload.

pub mod location;
pub mod reencode;
pub mod sniff;

use thiserror::Error;

pub use location::{strip_location, strip_location_in_place, LocationOutcome};
pub use reencode::{normalize_for_storage, reencode, ReencodeSettings};
pub use sniff::{sniff, MediaKind};

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("not a parseable {0} container: {1}")]
    Container(&'static str, String),
    #[error("exif segment unreadable: {0}")]
    Exif(#[from] exif::Error),
    #[error("image decode failed: {0}")]
    Decode(#[source] image::ImageError),
    #[error("image encode failed: {0}")]
    Encode(#[source] image::ImageError),
    #[error("{kind} cannot be re-encoded")]
    NotReencodable { kind: MediaKind },
    #[error("file i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("sanitizer task aborted")]
    TaskAborted,
}
