use std::ffi::OsStr;
use std::io::Cursor;
use std::path::Path;

use anyhow::{Context, Result};
use image::imageops::FilterType;
use image::{GenericImageView, ImageFormat};

use crate::blob_store::BlobStore;
use crate::conversation::Attachment;

pub const PDF_MIME_TYPE: &str = "application/pdf";

/// A file as received from the user, before ingestion.
#[derive(Debug, Clone)]
pub struct Upload {
    pub file_name: Option<String>,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadKind {
    Image,
    Pdf,
}

/// Canonical mime type and kind for an accepted upload, `None` otherwise.
pub fn classify_mime(mime_type: &str) -> Option<(&'static str, UploadKind)> {
    match mime_type.trim().to_ascii_lowercase().as_str() {
        "image/png" => Some(("image/png", UploadKind::Image)),
        "image/jpeg" | "image/jpg" => Some(("image/jpeg", UploadKind::Image)),
        "application/pdf" => Some((PDF_MIME_TYPE, UploadKind::Pdf)),
        _ => None,
    }
}

pub fn mime_type_from_path(path: &Path) -> Option<&'static str> {
    match path
        .extension()
        .and_then(OsStr::to_str)
        .map(|s| s.to_ascii_lowercase())
        .as_deref()
    {
        Some("png") => Some("image/png"),
        Some("jpg" | "jpeg") => Some("image/jpeg"),
        Some("pdf") => Some(PDF_MIME_TYPE),
        _ => None,
    }
}

/// Turns an upload into an attachment.
///
/// Images go to `blob_store` when one is given; if there is none, or the
/// upload fails, a display copy no wider than `display_width` is kept
/// locally instead. PDFs are passed through untouched. Unsupported types are
/// dropped.
pub async fn ingest_upload(
    upload: Upload,
    blob_store: Option<&dyn BlobStore>,
    display_width: u32,
) -> Option<Attachment> {
    let Some((mime_type, kind)) = classify_mime(&upload.mime_type) else {
        tracing::warn!(
            "Dropping upload {:?} with unsupported type {}",
            upload.file_name.as_deref().unwrap_or("<unnamed>"),
            upload.mime_type
        );
        return None;
    };
    if upload.bytes.is_empty() {
        tracing::warn!("Dropping empty upload {:?}", upload.file_name);
        return None;
    }

    let mut attachment = Attachment::new(upload.bytes, mime_type);
    if kind == UploadKind::Pdf {
        return Some(attachment);
    }

    if let Some(store) = blob_store {
        match store.upload(&attachment.raw_bytes, mime_type).await {
            Ok(remote) => {
                attachment.remote_ref = Some(remote);
                return Some(attachment);
            }
            Err(e) => tracing::warn!("Blob upload failed, keeping a local copy: {:#}", e),
        }
    }

    attachment.display_form = Some(match resize_for_display(&attachment.raw_bytes, display_width) {
        Ok(resized) => resized,
        Err(e) => {
            tracing::warn!("Could not resize image for display: {:#}", e);
            attachment.raw_bytes.clone()
        }
    });
    Some(attachment)
}

/// Scales an image down to `max_width`, keeping its aspect ratio. Images that
/// already fit come back unchanged.
pub fn resize_for_display(bytes: &[u8], max_width: u32) -> Result<Vec<u8>> {
    let format = image::guess_format(bytes).context("Unrecognized image data")?;
    let img = image::load_from_memory_with_format(bytes, format)
        .context("Failed to decode image")?;
    let (width, height) = img.dimensions();
    if max_width == 0 || width <= max_width {
        return Ok(bytes.to_vec());
    }

    let target_height = ((u64::from(height) * u64::from(max_width)) / u64::from(width)).max(1) as u32;
    let resized = img.resize(max_width, target_height, FilterType::Lanczos3);

    let out_format = match format {
        ImageFormat::Jpeg => ImageFormat::Jpeg,
        _ => ImageFormat::Png,
    };
    let mut out = Cursor::new(Vec::new());
    resized
        .write_to(&mut out, out_format)
        .context("Failed to encode resized image")?;
    Ok(out.into_inner())
}
