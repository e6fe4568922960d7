//! Server side of the upload pipeline: bearer-authenticated multipart
//! ingestion, content sniffing, image re-encoding and blob persistence.

mod app;
mod blobs;
mod rejection;

pub use app::{build_router, AppState, IngestLimits};
pub use blobs::{sanitize_filename, BlobStore};
pub use rejection::IngestRejection;
