//! CPU-side images handed to and returned from texture uploads and readbacks.

use anyhow::{Context, bail, ensure};

use crate::{Format, RectSize};

/// One 2D surface with owned pixels.
///
/// `row_pitch` may exceed the tightly packed row size, as it does for images read back
/// from the GPU where rows are padded to the copy alignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    pub format: Format,
    pub width: usize,
    pub height: usize,
    pub row_pitch: usize,
    pub slice_pitch: usize,
    pub pixels: Vec<u8>,
}

impl Image {
    /// A zero-filled, tightly packed image.
    pub fn new(format: Format, width: usize, height: usize) -> anyhow::Result<Self> {
        let (row_pitch, slice_pitch) = format.compute_pitch(width, height)?;
        Ok(Self {
            format,
            width,
            height,
            row_pitch,
            slice_pitch,
            pixels: vec![0; slice_pitch],
        })
    }

    /// Wraps tightly packed pixels.
    pub fn from_pixels(
        format: Format,
        width: usize,
        height: usize,
        pixels: Vec<u8>,
    ) -> anyhow::Result<Self> {
        let (row_pitch, _) = format.compute_pitch(width, height)?;
        Self::with_pitch(format, width, height, row_pitch, pixels)
    }

    /// Wraps pixels laid out with an explicit row pitch.
    pub fn with_pitch(
        format: Format,
        width: usize,
        height: usize,
        row_pitch: usize,
        pixels: Vec<u8>,
    ) -> anyhow::Result<Self> {
        let (tight_row, _) = format.compute_pitch(width, height)?;
        ensure!(
            row_pitch >= tight_row,
            "row pitch {row_pitch} is smaller than a {width} pixel {format} row"
        );

        let slice_pitch = row_pitch * format.compute_scanlines(height);
        ensure!(
            pixels.len() >= slice_pitch,
            "{} bytes cannot hold a {width}x{height} {format} image",
            pixels.len()
        );

        Ok(Self {
            format,
            width,
            height,
            row_pitch,
            slice_pitch,
            pixels,
        })
    }

    pub fn scanlines(&self) -> usize {
        self.format.compute_scanlines(self.height)
    }

    /// Bytes of pixel data in one scanline, without padding.
    pub fn row_bytes(&self) -> usize {
        self.format.row_blocks(self.width) * self.format.bytes_per_block()
    }

    pub fn row(&self, scanline: usize) -> &[u8] {
        let start = scanline * self.row_pitch;
        &self.pixels[start..start + self.row_bytes()]
    }

    /// The same pixels repacked without row padding.
    pub fn to_tight(&self) -> Self {
        let row_bytes = self.row_bytes();
        let mut pixels = Vec::with_capacity(row_bytes * self.scanlines());
        for scanline in 0..self.scanlines() {
            pixels.extend_from_slice(self.row(scanline));
        }

        Self {
            format: self.format,
            width: self.width,
            height: self.height,
            row_pitch: row_bytes,
            slice_pitch: pixels.len(),
            pixels,
        }
    }
}

/// Copies `rect` of `src` into `dst` at `(x, y)`. Both images must share a format, and
/// block-compressed coordinates must land on block boundaries.
pub fn copy_rectangle(
    src: &Image,
    rect: RectSize,
    dst: &mut Image,
    x: usize,
    y: usize,
) -> anyhow::Result<()> {
    ensure!(
        src.format == dst.format,
        "cannot copy {} pixels into a {} image",
        src.format,
        dst.format
    );
    ensure!(
        rect.right <= src.width && rect.bottom <= src.height,
        "source rectangle {rect:?} is outside a {}x{} image",
        src.width,
        src.height
    );
    ensure!(
        x + rect.width() <= dst.width && y + rect.height() <= dst.height,
        "destination ({x}, {y}) cannot fit {}x{}",
        rect.width(),
        rect.height()
    );

    let format = src.format;
    let dim = format.block_dim();
    if dim > 1 && (rect.left % dim != 0 || rect.top % dim != 0 || x % dim != 0 || y % dim != 0) {
        bail!("block compressed copy must be aligned to {dim} pixels");
    }

    let bpb = format.bytes_per_block();
    let row_bytes = format.row_blocks(rect.width()) * bpb;
    let rows = if rect.height() == 0 {
        0
    } else {
        format.compute_scanlines(rect.height())
    };

    for row in 0..rows {
        let src_start = (rect.top / dim + row) * src.row_pitch + (rect.left / dim) * bpb;
        let dst_start = (y / dim + row) * dst.row_pitch + (x / dim) * bpb;
        let src_row = src
            .pixels
            .get(src_start..src_start + row_bytes)
            .context("source image is shorter than its pitch")?;
        dst.pixels
            .get_mut(dst_start..dst_start + row_bytes)
            .context("destination image is shorter than its pitch")?
            .copy_from_slice(src_row);
    }

    Ok(())
}

/// An array of mip chains, stored item-major: `images[item * mip_levels + mip]`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScratchImage {
    format: Format,
    width: usize,
    height: usize,
    array_size: usize,
    mip_levels: usize,
    images: Vec<Image>,
}

impl ScratchImage {
    pub fn initialize_2d(
        format: Format,
        width: usize,
        height: usize,
        array_size: usize,
        mip_levels: usize,
    ) -> anyhow::Result<Self> {
        ensure!(
            width > 0 && height > 0 && array_size > 0 && mip_levels > 0,
            "empty scratch image"
        );

        let mut images = Vec::with_capacity(array_size * mip_levels);
        for _ in 0..array_size {
            for mip in 0..mip_levels {
                images.push(Image::new(
                    format,
                    (width >> mip).max(1),
                    (height >> mip).max(1),
                )?);
            }
        }

        Ok(Self {
            format,
            width,
            height,
            array_size,
            mip_levels,
            images,
        })
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn array_size(&self) -> usize {
        self.array_size
    }

    pub fn mip_levels(&self) -> usize {
        self.mip_levels
    }

    pub fn images(&self) -> &[Image] {
        &self.images
    }

    pub fn images_mut(&mut self) -> &mut [Image] {
        &mut self.images
    }

    pub fn image(&self, mip: usize, item: usize) -> Option<&Image> {
        if mip >= self.mip_levels {
            return None;
        }

        self.images.get(item * self.mip_levels + mip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(width: usize, height: usize) -> Image {
        let pixels = (0..width * height * 4).map(|i| i as u8).collect();
        Image::from_pixels(Format::R8G8B8A8Unorm, width, height, pixels).unwrap()
    }

    #[test]
    fn copy_between_pitches() {
        let src = gradient(4, 4);
        let mut dst =
            Image::with_pitch(Format::R8G8B8A8Unorm, 4, 4, 256, vec![0; 256 * 4]).unwrap();

        copy_rectangle(&src, RectSize::new(0, 0, 4, 4), &mut dst, 0, 0).unwrap();
        assert_eq!(dst.to_tight(), src);
    }

    #[test]
    fn copy_sub_rectangle() {
        let src = gradient(4, 4);
        let mut dst = Image::new(Format::R8G8B8A8Unorm, 2, 2).unwrap();

        copy_rectangle(&src, RectSize::new(2, 2, 4, 4), &mut dst, 0, 0).unwrap();
        assert_eq!(dst.row(0), src.row(2).get(8..16).unwrap());
        assert_eq!(dst.row(1), src.row(3).get(8..16).unwrap());
    }

    #[test]
    fn mismatched_format_is_rejected() {
        let src = gradient(2, 2);
        let mut dst = Image::new(Format::R8Unorm, 2, 2).unwrap();
        assert!(copy_rectangle(&src, RectSize::new(0, 0, 2, 2), &mut dst, 0, 0).is_err());
    }

    #[test]
    fn scratch_image_lays_out_mips() {
        let scratch = ScratchImage::initialize_2d(Format::R8Unorm, 8, 4, 2, 3).unwrap();
        assert_eq!(scratch.images().len(), 6);
        assert_eq!(scratch.image(2, 1).unwrap().width, 2);
        assert_eq!(scratch.image(2, 1).unwrap().height, 1);
        assert!(scratch.image(3, 0).is_none());
    }
}
