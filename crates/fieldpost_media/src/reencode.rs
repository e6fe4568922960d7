use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType, PngEncoder};
use image::{DynamicImage, ImageFormat};
use tracing::warn;

use crate::sniff::MediaKind;
use crate::MediaError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReencodeSettings {
    pub jpeg_quality: u8,
}

impl Default for ReencodeSettings {
    fn default() -> Self {
        Self { jpeg_quality: 85 }
    }
}

/// Decodes and re-encodes an image with fixed parameters. Only pixel data
/// survives, so any metadata the client left behind is discarded.
pub fn reencode(
    kind: MediaKind,
    data: &[u8],
    settings: &ReencodeSettings,
) -> Result<Vec<u8>, MediaError> {
    let format = match kind {
        MediaKind::Jpeg => ImageFormat::Jpeg,
        MediaKind::Png => ImageFormat::Png,
        MediaKind::Pdf => return Err(MediaError::NotReencodable { kind }),
    };

    let img = image::load_from_memory_with_format(data, format).map_err(MediaError::Decode)?;
    let mut out = Vec::with_capacity(data.len());

    if format == ImageFormat::Jpeg {
        // The JPEG encoder has no alpha support.
        let rgb = DynamicImage::ImageRgb8(img.to_rgb8());
        let encoder = JpegEncoder::new_with_quality(&mut out, settings.jpeg_quality);
        rgb.write_with_encoder(encoder).map_err(MediaError::Encode)?;
    } else {
        let encoder =
            PngEncoder::new_with_quality(&mut out, CompressionType::Best, FilterType::Adaptive);
        img.write_with_encoder(encoder).map_err(MediaError::Encode)?;
    }

    Ok(out)
}

/// Re-encodes images before they are persisted, keeping the original bytes
/// when that fails. Documents pass through unchanged.
pub fn normalize_for_storage(kind: MediaKind, data: Vec<u8>, settings: &ReencodeSettings) -> Vec<u8> {
    if !kind.is_image() {
        return data;
    }

    match reencode(kind, &data, settings) {
        Ok(reencoded) => reencoded,
        Err(err) => {
            warn!(kind = %kind, error = %err, "re-encode failed; storing original bytes");
            data
        }
    }
}
