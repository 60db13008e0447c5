//! Cache keys for decoded previews.

use std::fmt;
use std::path::{Path, PathBuf};

/// Identity of a decoded preview: the source image plus the size it was
/// decoded at. The same source decoded at two sizes is two entries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PreviewKey {
    /// Path of the preview image on disk
    pub source: PathBuf,
    /// Decoded width in pixels
    pub width: u32,
    /// Decoded height in pixels
    pub height: u32,
}

impl PreviewKey {
    pub fn new(source: impl AsRef<Path>, width: u32, height: u32) -> Self {
        Self {
            source: source.as_ref().to_path_buf(),
            width,
            height,
        }
    }

    /// Size estimate of the decoded RGBA pixels.
    pub fn decoded_size_bytes(&self) -> usize {
        (self.width as usize) * (self.height as usize) * 4
    }

    /// Same source at a different size.
    pub fn resized(&self, width: u32, height: u32) -> Self {
        Self {
            source: self.source.clone(),
            width,
            height,
        }
    }
}

impl fmt::Display for PreviewKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}x{}", self.source.display(), self.width, self.height)
    }
}
