//! Checks applied to uploaded images before they reach the engine.

use std::collections::HashSet;

use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum UploadError {
    #[error("image {index} is empty")]
    Empty { index: usize },
    #[error("image {index} is {size} bytes, limit is {limit}")]
    TooLarge { index: usize, size: usize, limit: usize },
    #[error("image {index} is not a JPEG or PNG file")]
    UnsupportedType { index: usize },
}

/// Accepted upload formats, recognised by magic bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    Jpeg,
    Png,
}

impl ImageKind {
    pub fn sniff(bytes: &[u8]) -> Option<Self> {
        match image::guess_format(bytes).ok()? {
            image::ImageFormat::Jpeg => Some(ImageKind::Jpeg),
            image::ImageFormat::Png => Some(ImageKind::Png),
            _ => None,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            ImageKind::Jpeg => "jpg",
            ImageKind::Png => "png",
        }
    }
}

/// An upload that passed validation.
#[derive(Debug, Clone)]
pub struct Upload {
    pub bytes: Vec<u8>,
    pub kind: ImageKind,
    /// Lower-case hex SHA-256 of `bytes`.
    pub digest: String,
}

pub fn validate(index: usize, bytes: Vec<u8>, limit: usize) -> Result<Upload, UploadError> {
    if bytes.is_empty() {
        return Err(UploadError::Empty { index });
    }
    if bytes.len() > limit {
        return Err(UploadError::TooLarge {
            index,
            size: bytes.len(),
            limit,
        });
    }
    let kind = ImageKind::sniff(&bytes).ok_or(UploadError::UnsupportedType { index })?;
    let digest = format!("{:x}", Sha256::digest(&bytes));
    Ok(Upload { bytes, kind, digest })
}

/// Validate every upload, then drop byte-identical repeats keeping the first.
pub fn validate_unique(images: Vec<Vec<u8>>, limit: usize) -> Result<Vec<Upload>, UploadError> {
    let mut seen = HashSet::new();
    let mut kept = Vec::with_capacity(images.len());
    for (index, bytes) in images.into_iter().enumerate() {
        let upload = validate(index, bytes, limit)?;
        if seen.insert(upload.digest.clone()) {
            kept.push(upload);
        }
    }
    Ok(kept)
}
