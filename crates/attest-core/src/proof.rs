use std::sync::OnceLock;

use image::RgbImage;

/// Uploaded image bytes with a decode-once RGB view.
///
/// One `ProofImage` is shared (behind an `Arc`) by every stage of a request,
/// so the face, liveness and task stages never decode the same bytes twice.
pub struct ProofImage {
    bytes: Vec<u8>,
    decoded: OnceLock<Option<RgbImage>>,
}

impl ProofImage {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            decoded: OnceLock::new(),
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// The decoded image, or `None` if the bytes are not a readable image.
    pub fn decoded(&self) -> Option<&RgbImage> {
        self.decoded
            .get_or_init(|| match image::load_from_memory(&self.bytes) {
                Ok(img) => Some(img.to_rgb8()),
                Err(err) => {
                    tracing::debug!(error = %err, len = self.bytes.len(), "image decode failed");
                    None
                }
            })
            .as_ref()
    }
}

impl std::fmt::Debug for ProofImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProofImage")
            .field("len", &self.bytes.len())
            .finish_non_exhaustive()
    }
}
