use bytes::Bytes;
use tracing::info;

use savor_types::api::{Envelope, UploadResponse};

use crate::gateway::{Backend, Gateway};

pub const MAX_IMAGE_BYTES: usize = 10 * 1024 * 1024;
pub const MAX_VIDEO_BYTES: usize = 50 * 1024 * 1024;

const IMAGE_TYPES: &[&str] = &["image/jpeg", "image/png", "image/webp", "image/gif"];
const VIDEO_TYPES: &[&str] = &["video/mp4", "video/webm", "video/quicktime"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    pub fn max_bytes(self) -> usize {
        match self {
            Self::Image => MAX_IMAGE_BYTES,
            Self::Video => MAX_VIDEO_BYTES,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bucket {
    Media,
    Avatars,
}

impl Bucket {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Media => "media",
            Self::Avatars => "avatars",
        }
    }
}

/// A file picked by the user, not yet uploaded.
#[derive(Debug, Clone)]
pub struct MediaFile {
    pub file_name: String,
    pub content_type: String,
    pub bytes: Bytes,
}

impl MediaFile {
    pub fn new(file_name: impl Into<String>, content_type: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self {
            file_name: file_name.into(),
            content_type: content_type.into(),
            bytes: bytes.into(),
        }
    }
}

/// Checks type and size locally, before any bytes leave the device.
pub fn validate(file: &MediaFile, bucket: Bucket) -> Result<MediaKind, String> {
    let content_type = file.content_type.to_ascii_lowercase();
    let kind = if IMAGE_TYPES.contains(&content_type.as_str()) {
        MediaKind::Image
    } else if VIDEO_TYPES.contains(&content_type.as_str()) {
        MediaKind::Video
    } else {
        return Err("This file type is not supported".to_string());
    };

    if bucket == Bucket::Avatars && kind != MediaKind::Image {
        return Err("Profile pictures must be images".to_string());
    }
    if file.bytes.is_empty() {
        return Err("File is empty".to_string());
    }
    if file.bytes.len() > kind.max_bytes() {
        let limit_mb = kind.max_bytes() / (1024 * 1024);
        return Err(format!("File is too large (max {limit_mb} MB)"));
    }
    if !file.file_name.contains('.') {
        return Err("File name needs an extension".to_string());
    }
    Ok(kind)
}

/// Uploads validated files and hands back their storage path.
pub struct Uploader<B> {
    gateway: Gateway<B>,
}

impl<B: Backend> Uploader<B> {
    pub fn new(gateway: Gateway<B>) -> Self {
        Self { gateway }
    }

    pub async fn upload(&self, bucket: Bucket, file: MediaFile) -> Envelope<UploadResponse> {
        if let Err(e) = validate(&file, bucket) {
            return Envelope::fail(e);
        }
        let envelope = self
            .gateway
            .upload_media(bucket.as_str(), &file.file_name, &file.content_type, file.bytes)
            .await;
        if let Some(stored) = &envelope.data {
            info!("Uploaded {} ({} bytes)", stored.path, stored.size);
        }
        envelope
    }
}
