//! Image reconciliation: compression, inline encoding, time-bounded upload.
//!
//! Photos captured on the closure form are compressed before any transfer.
//! Online, they are uploaded straight away. Offline, they are inlined into the
//! outbox payload as `data:` URLs so the evidence is as durable as the rest of
//! the closure; the sync engine decodes and uploads them on replay.

use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use fieldops_core::TicketId;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::GenericImageView;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::backend::{BackendError, ObjectStorage};

/// Longest side of a compressed image, in pixels.
pub const MAX_DIMENSION: u32 = 1920;

/// JPEG quality used when re-encoding.
pub const JPEG_QUALITY: u8 = 80;

/// Client-side upload deadline.
pub const UPLOAD_TIMEOUT: Duration = Duration::from_secs(30);

const DATA_URL_PREFIX: &str = "data:";
const BASE64_MARKER: &str = ";base64,";

/// A captured image (or any binary attachment) held in memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageFile {
    pub name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

impl ImageFile {
    pub fn new(name: impl Into<String>, content_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            content_type: content_type.into(),
            bytes,
        }
    }

    /// File extension matching the content type.
    pub fn extension(&self) -> &'static str {
        match self.content_type.as_str() {
            "image/jpeg" | "image/jpg" => "jpg",
            "image/png" => "png",
            "image/webp" => "webp",
            "image/gif" => "gif",
            "application/pdf" => "pdf",
            _ => "bin",
        }
    }
}

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("upload timed out")]
    Timeout,
    #[error("not an inline data URL")]
    NotInline,
    #[error("invalid base64 payload: {0}")]
    Decode(String),
    #[error("upload failed: {0}")]
    Upload(#[source] BackendError),
}

impl ImageError {
    pub fn user_message(&self) -> String {
        match self {
            ImageError::Timeout => {
                "Photo upload took too long. Check your connection and try again.".to_string()
            }
            ImageError::Upload(BackendError::Timeout) => {
                "Photo upload took too long. Check your connection and try again.".to_string()
            }
            ImageError::Upload(BackendError::Offline) => {
                "No connection while uploading the photo.".to_string()
            }
            ImageError::NotInline | ImageError::Decode(_) => {
                "A saved photo could not be read.".to_string()
            }
            ImageError::Upload(err) => format!("Photo upload failed: {err}"),
        }
    }
}

/// Bound the resolution, size and quality of an image.
///
/// Never fails: when the image cannot be decoded or re-encoding does not make
/// it smaller, the original file is returned unchanged.
pub fn compress(file: ImageFile) -> ImageFile {
    match try_compress(&file) {
        Ok(Some(smaller)) => smaller,
        Ok(None) => file,
        Err(err) => {
            tracing::warn!(name = %file.name, "image compression failed, keeping original: {err}");
            file
        }
    }
}

/// [`compress`] on the blocking thread pool, keeping decode and re-encode off
/// the async workers.
pub async fn compress_async(file: ImageFile) -> ImageFile {
    let original = file.clone();
    match tokio::task::spawn_blocking(move || compress(file)).await {
        Ok(compressed) => compressed,
        Err(err) => {
            tracing::warn!(name = %original.name, "image compression task failed, keeping original: {err}");
            original
        }
    }
}

fn try_compress(file: &ImageFile) -> Result<Option<ImageFile>, image::ImageError> {
    let decoded = image::load_from_memory(&file.bytes)?;
    let (width, height) = decoded.dimensions();

    let resized = if width > MAX_DIMENSION || height > MAX_DIMENSION {
        decoded.resize(MAX_DIMENSION, MAX_DIMENSION, FilterType::Triangle)
    } else {
        decoded
    };

    let rgb = resized.to_rgb8();
    let mut out = Cursor::new(Vec::new());
    {
        let mut encoder = JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY);
        encoder.encode(rgb.as_raw(), rgb.width(), rgb.height(), image::ColorType::Rgb8)?;
    }
    let bytes = out.into_inner();

    if bytes.len() >= file.bytes.len() {
        return Ok(None);
    }

    tracing::debug!(
        name = %file.name,
        before = file.bytes.len(),
        after = bytes.len(),
        "image compressed"
    );

    Ok(Some(ImageFile {
        name: replace_extension(&file.name, "jpg"),
        content_type: "image/jpeg".to_string(),
        bytes,
    }))
}

fn replace_extension(name: &str, ext: &str) -> String {
    match name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => format!("{stem}.{ext}"),
        _ => format!("{name}.{ext}"),
    }
}

/// Encode as a `data:<mime>;base64,<payload>` URL.
pub fn to_base64(file: &ImageFile) -> String {
    format!(
        "{DATA_URL_PREFIX}{}{BASE64_MARKER}{}",
        file.content_type,
        BASE64_STANDARD.encode(&file.bytes)
    )
}

/// Decode a `data:` URL produced by [`to_base64`].
pub fn from_base64(data_url: &str) -> Result<ImageFile, ImageError> {
    let rest = data_url
        .strip_prefix(DATA_URL_PREFIX)
        .ok_or(ImageError::NotInline)?;
    let (content_type, payload) = rest.split_once(BASE64_MARKER).ok_or(ImageError::NotInline)?;
    let bytes = BASE64_STANDARD
        .decode(payload)
        .map_err(|e| ImageError::Decode(e.to_string()))?;

    let mut file = ImageFile::new("attachment", content_type, bytes);
    file.name = format!("attachment.{}", file.extension());
    Ok(file)
}

/// Whether a form answer holds an attachment inlined by [`to_base64`],
/// whatever its content type.
pub fn is_inline_attachment(value: &Value) -> bool {
    let Some(rest) = value.as_str().and_then(|s| s.strip_prefix(DATA_URL_PREFIX)) else {
        return false;
    };
    rest.split_once(BASE64_MARKER)
        .is_some_and(|(content_type, _)| content_type.contains('/'))
}

/// Uploads images to object storage under a per-ticket path.
#[derive(Clone)]
pub struct ImageUploader {
    storage: Arc<dyn ObjectStorage>,
    timeout: Duration,
}

impl ImageUploader {
    pub fn new(storage: Arc<dyn ObjectStorage>) -> Self {
        Self {
            storage,
            timeout: UPLOAD_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Upload and return the public URL.
    ///
    /// The in-flight request is dropped, and with it the transfer, once the
    /// deadline passes.
    pub async fn upload(&self, ticket_id: TicketId, file: &ImageFile) -> Result<String, ImageError> {
        let path = format!("tickets/{ticket_id}/{}.{}", Uuid::now_v7(), file.extension());

        let upload = self
            .storage
            .upload(&path, &file.content_type, file.bytes.clone());

        match tokio::time::timeout(self.timeout, upload).await {
            Ok(Ok(url)) => {
                tracing::debug!(%ticket_id, %path, "image uploaded");
                Ok(url)
            }
            Ok(Err(BackendError::Timeout)) => Err(ImageError::Timeout),
            Ok(Err(err)) => Err(ImageError::Upload(err)),
            Err(_) => {
                tracing::warn!(%ticket_id, %path, timeout = ?self.timeout, "image upload aborted");
                Err(ImageError::Timeout)
            }
        }
    }
}

impl std::fmt::Debug for ImageUploader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageUploader")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeBackend;
    use image::{ImageBuffer, Rgb, RgbImage};

    /// Noisy PNG; noise keeps the PNG large so re-encoding always wins.
    fn png(width: u32, height: u32) -> ImageFile {
        let img: RgbImage = ImageBuffer::from_fn(width, height, |x, y| {
            let h = (x.wrapping_mul(2_654_435_761) ^ y.wrapping_mul(2_246_822_519))
                .wrapping_mul(3_266_489_917);
            Rgb([(h >> 24) as u8, (h >> 16) as u8, (h >> 8) as u8])
        });
        let mut bytes = Cursor::new(Vec::new());
        img.write_to(&mut bytes, image::ImageOutputFormat::Png).unwrap();
        ImageFile::new("meter.png", "image/png", bytes.into_inner())
    }

    #[test]
    fn base64_round_trip_is_byte_identical() {
        let file = ImageFile::new("raw.jpg", "image/jpeg", (0u8..=255).cycle().take(4099).collect());

        let encoded = to_base64(&file);
        let decoded = from_base64(&encoded).unwrap();

        assert!(encoded.starts_with("data:image/jpeg;base64,"));
        assert_eq!(decoded.bytes, file.bytes);
        assert_eq!(decoded.content_type, "image/jpeg");
        assert!(is_inline_attachment(&Value::String(encoded)));
    }

    #[test]
    fn any_encoded_attachment_is_inline() {
        let scan = ImageFile::new("scan.pdf", "application/pdf", vec![5; 32]);
        let encoded = to_base64(&scan);

        assert!(is_inline_attachment(&Value::String(encoded.clone())));
        assert_eq!(from_base64(&encoded).unwrap().extension(), "pdf");
        assert!(is_inline_attachment(&Value::String("data:text/plain;base64,aGk=".into())));
    }

    #[test]
    fn plain_values_are_not_inline() {
        assert!(!is_inline_attachment(&Value::String("https://cdn/x.jpg".into())));
        assert!(!is_inline_attachment(&Value::String("data: see notes".into())));
        assert!(!is_inline_attachment(&serde_json::json!(42)));
    }

    #[test]
    fn from_base64_rejects_other_strings() {
        assert!(matches!(from_base64("https://cdn/x.jpg"), Err(ImageError::NotInline)));
        assert!(matches!(
            from_base64("data:image/png;base64,@@@"),
            Err(ImageError::Decode(_))
        ));
    }

    #[test]
    fn oversized_image_is_downscaled_to_jpeg() {
        let original = png(2400, 1200);
        let compressed = compress(original.clone());

        assert_eq!(compressed.content_type, "image/jpeg");
        assert_eq!(compressed.name, "meter.jpg");
        assert!(compressed.bytes.len() < original.bytes.len());

        let decoded = image::load_from_memory(&compressed.bytes).unwrap();
        assert_eq!(decoded.dimensions(), (1920, 960));
    }

    #[tokio::test]
    async fn compression_on_blocking_pool_matches_inline() {
        let original = png(2000, 500);

        let compressed = compress_async(original.clone()).await;

        assert_eq!(compressed, compress(original));
        assert_eq!(compressed.content_type, "image/jpeg");
    }

    #[test]
    fn undecodable_file_falls_back_to_original() {
        let file = ImageFile::new("scan.jpg", "image/jpeg", b"definitely not a jpeg".to_vec());
        assert_eq!(compress(file.clone()), file);
    }

    #[tokio::test]
    async fn upload_returns_public_url_under_ticket_path() {
        let backend = Arc::new(FakeBackend::new());
        let uploader = ImageUploader::new(backend.clone());
        let ticket_id = TicketId::new();

        let url = uploader
            .upload(ticket_id, &ImageFile::new("a.jpg", "image/jpeg", vec![1, 2, 3]))
            .await
            .unwrap();

        assert!(url.contains(&format!("tickets/{ticket_id}/")));
        assert!(url.ends_with(".jpg"));
        assert_eq!(backend.uploads().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_upload_becomes_timeout() {
        let backend = Arc::new(FakeBackend::new());
        backend.stall_uploads(Duration::from_secs(120));
        let uploader = ImageUploader::new(backend);

        let err = uploader
            .upload(TicketId::new(), &ImageFile::new("a.jpg", "image/jpeg", vec![1]))
            .await
            .unwrap_err();

        assert!(matches!(err, ImageError::Timeout));
        assert!(err.user_message().contains("took too long"));
    }
}
