use std::fmt;

use mime::Mime;

const JPEG_MAGIC: &[u8] = &[0xFF, 0xD8, 0xFF];
const PNG_MAGIC: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
const PDF_MAGIC: &[u8] = b"%PDF-";

/// Content types recognised from file signatures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Jpeg,
    Png,
    Pdf,
}

impl MediaKind {
    pub const ALL: [MediaKind; 3] = [MediaKind::Jpeg, MediaKind::Png, MediaKind::Pdf];

    pub fn mime(&self) -> Mime {
        match self {
            MediaKind::Jpeg => mime::IMAGE_JPEG,
            MediaKind::Png => mime::IMAGE_PNG,
            MediaKind::Pdf => mime::APPLICATION_PDF,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            MediaKind::Jpeg => "jpg",
            MediaKind::Png => "png",
            MediaKind::Pdf => "pdf",
        }
    }

    pub fn is_image(&self) -> bool {
        matches!(self, MediaKind::Jpeg | MediaKind::Png)
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mime().essence_str())
    }
}

/// Identifies the content from its leading bytes. Names and declared
/// content types are never consulted.
pub fn sniff(data: &[u8]) -> Option<MediaKind> {
    if data.starts_with(JPEG_MAGIC) {
        Some(MediaKind::Jpeg)
    } else if data.starts_with(PNG_MAGIC) {
        Some(MediaKind::Png)
    } else if data.starts_with(PDF_MAGIC) {
        Some(MediaKind::Pdf)
    } else {
        None
    }
}
