//! Pixel formats and the pitch math needed to lay them out in memory.

use anyhow::bail;
use serde::{Deserialize, Serialize};

#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, derive_more::Display,
)]
pub enum Format {
    #[default]
    Unknown,
    R8Unorm,
    R8G8Unorm,
    R8G8B8A8Unorm,
    R8G8B8A8UnormSrgb,
    B8G8R8A8Unorm,
    B8G8R8A8UnormSrgb,
    R16G16B16A16Float,
    R32Uint,
    R32Float,
    R32G32B32A32Float,
    D24UnormS8Uint,
    Bc1Unorm,
    Bc2Unorm,
    Bc3Unorm,
}

impl Format {
    pub const fn bits_per_pixel(self) -> usize {
        match self {
            Self::Unknown => 0,
            Self::R8Unorm => 8,
            Self::R8G8Unorm => 16,
            Self::R8G8B8A8Unorm
            | Self::R8G8B8A8UnormSrgb
            | Self::B8G8R8A8Unorm
            | Self::B8G8R8A8UnormSrgb
            | Self::R32Uint
            | Self::R32Float
            | Self::D24UnormS8Uint => 32,
            Self::R16G16B16A16Float => 64,
            Self::R32G32B32A32Float => 128,
            Self::Bc1Unorm => 4,
            Self::Bc2Unorm | Self::Bc3Unorm => 8,
        }
    }

    pub const fn is_block_compressed(self) -> bool {
        matches!(self, Self::Bc1Unorm | Self::Bc2Unorm | Self::Bc3Unorm)
    }

    /// Width and height of one addressable block: 4 for BC formats, 1 otherwise.
    pub const fn block_dim(self) -> usize {
        if self.is_block_compressed() { 4 } else { 1 }
    }

    /// Bytes in one block (BC) or one pixel.
    pub const fn bytes_per_block(self) -> usize {
        match self {
            Self::Bc1Unorm => 8,
            Self::Bc2Unorm | Self::Bc3Unorm => 16,
            _ => self.bits_per_pixel() / 8,
        }
    }

    /// Tightly packed `(row_pitch, slice_pitch)` for an image of this format.
    pub fn compute_pitch(self, width: usize, height: usize) -> anyhow::Result<(usize, usize)> {
        if self == Self::Unknown {
            bail!("cannot compute pitch of unknown format");
        }

        let row_pitch = self.row_blocks(width) * self.bytes_per_block();
        Ok((row_pitch, row_pitch * self.compute_scanlines(height)))
    }

    /// Number of rows stored in memory: block rows for BC formats, pixel rows otherwise.
    pub const fn compute_scanlines(self, height: usize) -> usize {
        if self.is_block_compressed() {
            let rows = height.div_ceil(4);
            if rows == 0 { 1 } else { rows }
        } else {
            height
        }
    }

    /// Number of blocks (or pixels) needed to cover `width`.
    pub const fn row_blocks(self, width: usize) -> usize {
        if self.is_block_compressed() {
            let blocks = width.div_ceil(4);
            if blocks == 0 { 1 } else { blocks }
        } else {
            width
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uncompressed_pitch() {
        assert_eq!(
            Format::R8G8B8A8Unorm.compute_pitch(3, 2).unwrap(),
            (12, 24)
        );
        assert_eq!(Format::R8Unorm.compute_pitch(5, 5).unwrap(), (5, 25));
    }

    #[test]
    fn block_compressed_pitch() {
        assert_eq!(Format::Bc1Unorm.compute_pitch(8, 8).unwrap(), (16, 32));
        assert_eq!(Format::Bc3Unorm.compute_pitch(1, 1).unwrap(), (16, 16));
        assert_eq!(Format::Bc3Unorm.compute_scanlines(9), 3);
    }

    #[test]
    fn unknown_format_has_no_pitch() {
        assert!(Format::Unknown.compute_pitch(4, 4).is_err());
    }
}
