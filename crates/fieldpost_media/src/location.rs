use std::io::Cursor;
use std::path::Path;

use exif::experimental::Writer;
use exif::{Context, Field, In, Tag};
use img_parts::jpeg::Jpeg;
use img_parts::{Bytes, ImageEXIF};
use tracing::{debug, warn};

use crate::sniff::{sniff, MediaKind};
use crate::MediaError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocationOutcome {
    /// Location tags were found and the file was rewritten without them.
    Stripped,
    /// The JPEG carried no location tags.
    NoLocation,
    /// Not a JPEG; nothing to strip.
    NotJpeg,
    /// Sanitising failed and the file was left as captured.
    KeptOriginal,
}

enum ExifRewrite {
    Untouched,
    Replaced(Vec<u8>),
    Removed,
}

/// Removes GPS metadata from a JPEG. Returns `Ok(None)` when there was
/// nothing to remove.
///
/// Non-location tags (orientation, camera, timestamps) are preserved when the
/// EXIF block can be rewritten. If it cannot, the whole EXIF segment is
/// dropped, so location never survives a successful return.
pub fn strip_location(data: &[u8]) -> Result<Option<Vec<u8>>, MediaError> {
    let mut jpeg = Jpeg::from_bytes(Bytes::copy_from_slice(data))
        .map_err(|err| MediaError::Container("jpeg", err.to_string()))?;

    let Some(raw) = jpeg.exif() else {
        return Ok(None);
    };

    let rewrite = rewrite_without_location(&raw).unwrap_or_else(|err| {
        warn!(error = %err, "exif rewrite failed; dropping the whole exif segment");
        ExifRewrite::Removed
    });

    match rewrite {
        ExifRewrite::Untouched => return Ok(None),
        ExifRewrite::Replaced(segment) => jpeg.set_exif(Some(Bytes::from(segment))),
        ExifRewrite::Removed => jpeg.set_exif(None),
    }

    Ok(Some(jpeg.encoder().bytes().to_vec()))
}

fn rewrite_without_location(raw: &[u8]) -> Result<ExifRewrite, MediaError> {
    let exif = exif::Reader::new().read_raw(raw.to_vec())?;
    if !exif.fields().any(is_location) {
        return Ok(ExifRewrite::Untouched);
    }

    // Thumbnail IFD fields are dropped along with the location; the writer
    // would need the thumbnail bytes to re-emit them.
    let kept: Vec<&Field> = exif
        .fields()
        .filter(|field| field.ifd_num == In::PRIMARY && !is_location(field))
        .collect();
    if kept.is_empty() {
        return Ok(ExifRewrite::Removed);
    }

    let mut writer = Writer::new();
    for field in kept {
        writer.push_field(field);
    }

    let little_endian = raw.starts_with(b"II");
    let mut out = Cursor::new(Vec::new());
    writer.write(&mut out, little_endian)?;
    Ok(ExifRewrite::Replaced(out.into_inner()))
}

fn is_location(field: &Field) -> bool {
    field.tag == Tag::GPSInfoIFDPointer || field.tag.context() == Context::Gps
}

/// Strips location from a staged file, replacing it atomically.
///
/// Never fails: any error leaves the file untouched and is reported as
/// [`LocationOutcome::KeptOriginal`].
pub async fn strip_location_in_place(path: &Path) -> LocationOutcome {
    match try_strip_in_place(path).await {
        Ok(outcome) => {
            debug!(path = %path.display(), outcome = ?outcome, "location sanitizer finished");
            outcome
        }
        Err(err) => {
            warn!(path = %path.display(), error = %err, "location sanitizer failed; keeping original bytes");
            LocationOutcome::KeptOriginal
        }
    }
}

async fn try_strip_in_place(path: &Path) -> Result<LocationOutcome, MediaError> {
    let data = tokio::fs::read(path).await?;
    if sniff(&data) != Some(MediaKind::Jpeg) {
        return Ok(LocationOutcome::NotJpeg);
    }

    let stripped = tokio::task::spawn_blocking(move || strip_location(&data))
        .await
        .map_err(|_| MediaError::TaskAborted)??;

    let Some(stripped) = stripped else {
        return Ok(LocationOutcome::NoLocation);
    };

    let scratch = path.with_extension("sanitizing");
    tokio::fs::write(&scratch, &stripped).await?;
    if let Err(err) = tokio::fs::rename(&scratch, path).await {
        if let Err(cleanup) = tokio::fs::remove_file(&scratch).await {
            warn!(path = %scratch.display(), error = %cleanup, "failed to remove sanitizer scratch file");
        }
        return Err(err.into());
    }
    Ok(LocationOutcome::Stripped)
}

#[cfg(test)]
pub(crate) mod fixtures {
    use std::io::Cursor;

    use exif::experimental::Writer;
    use exif::{Field, In, Rational, Tag, Value};
    use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
    use img_parts::jpeg::Jpeg;
    use img_parts::{Bytes, ImageEXIF};

    pub fn plain_jpeg() -> Vec<u8> {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(16, 16, Rgb([200, 10, 10])));
        let mut encoded = Cursor::new(Vec::new());
        img.write_to(&mut encoded, ImageFormat::Jpeg).expect("encode jpeg");
        encoded.into_inner()
    }

    pub fn jpeg_with_gps() -> Vec<u8> {
        let make = Field {
            tag: Tag::Make,
            ifd_num: In::PRIMARY,
            value: Value::Ascii(vec![b"FieldCam".to_vec()]),
        };
        let lat_ref = Field {
            tag: Tag::GPSLatitudeRef,
            ifd_num: In::PRIMARY,
            value: Value::Ascii(vec![b"N".to_vec()]),
        };
        let lat = Field {
            tag: Tag::GPSLatitude,
            ifd_num: In::PRIMARY,
            value: Value::Rational(vec![
                Rational { num: 51, denom: 1 },
                Rational { num: 30, denom: 1 },
                Rational { num: 0, denom: 1 },
            ]),
        };

        let mut writer = Writer::new();
        writer.push_field(&make);
        writer.push_field(&lat_ref);
        writer.push_field(&lat);
        let mut segment = Cursor::new(Vec::new());
        writer.write(&mut segment, false).expect("write exif");

        let mut jpeg = Jpeg::from_bytes(Bytes::from(plain_jpeg())).expect("parse jpeg");
        jpeg.set_exif(Some(Bytes::from(segment.into_inner())));
        jpeg.encoder().bytes().to_vec()
    }

    pub fn read_exif(data: &[u8]) -> Option<exif::Exif> {
        let jpeg = Jpeg::from_bytes(Bytes::copy_from_slice(data)).ok()?;
        let raw = jpeg.exif()?;
        exif::Reader::new().read_raw(raw.to_vec()).ok()
    }
}
