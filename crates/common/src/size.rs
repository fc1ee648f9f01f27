//! Size, rectangle and rotation types consumed from the window layer.

use serde::{Deserialize, Serialize};

/// A width/height (or x/y) pair in pixels.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PointSize {
    pub x: usize,
    pub y: usize,
}

impl PointSize {
    pub const ZERO: Self = Self { x: 0, y: 0 };

    pub const fn new(x: usize, y: usize) -> Self {
        Self { x, y }
    }

    /// Both coordinates shifted right by `mip_level`, used to address lower mips.
    pub const fn shifted(self, mip_level: usize) -> Self {
        Self {
            x: self.x >> mip_level,
            y: self.y >> mip_level,
        }
    }

    pub const fn swapped(self) -> Self {
        Self {
            x: self.y,
            y: self.x,
        }
    }
}

/// Half-open pixel rectangle `[left, right) x [top, bottom)`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RectSize {
    pub left: usize,
    pub top: usize,
    pub right: usize,
    pub bottom: usize,
}

impl RectSize {
    pub const fn new(left: usize, top: usize, right: usize, bottom: usize) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    pub const fn from_size(size: PointSize) -> Self {
        Self::new(0, 0, size.x, size.y)
    }

    pub const fn width(&self) -> usize {
        self.right.saturating_sub(self.left)
    }

    pub const fn height(&self) -> usize {
        self.bottom.saturating_sub(self.top)
    }

    pub const fn top_left(&self) -> PointSize {
        PointSize::new(self.left, self.top)
    }

    pub const fn shifted(self, mip_level: usize) -> Self {
        Self {
            left: self.left >> mip_level,
            top: self.top >> mip_level,
            right: self.right >> mip_level,
            bottom: self.bottom >> mip_level,
        }
    }
}

/// Display orientation in quarter turns.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Rotation {
    #[default]
    Rotate0,
    Rotate90,
    Rotate180,
    Rotate270,
}

impl Rotation {
    /// Maps a display-mode orientation index (0..=3) to a rotation; out of range wraps.
    pub const fn from_index(index: i32) -> Self {
        match index.rem_euclid(4) {
            1 => Self::Rotate90,
            2 => Self::Rotate180,
            3 => Self::Rotate270,
            _ => Self::Rotate0,
        }
    }

    pub const fn index(self) -> i32 {
        match self {
            Self::Rotate0 => 0,
            Self::Rotate90 => 1,
            Self::Rotate180 => 2,
            Self::Rotate270 => 3,
        }
    }

    /// Rotation of `current` relative to the display's `native` orientation.
    pub const fn relative(native: Rotation, current: Rotation) -> Rotation {
        Self::from_index(current.index() - native.index())
    }

    pub const fn is_quarter_turn(self) -> bool {
        matches!(self, Self::Rotate90 | Self::Rotate270)
    }
}

/// Everything a render target needs to know about the window it presents to.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WindowSize {
    pub pixel_size: PointSize,
    pub dpi_scale: f64,
    pub native_rotation: Rotation,
    pub current_rotation: Rotation,
}

impl Default for WindowSize {
    fn default() -> Self {
        Self {
            pixel_size: PointSize::ZERO,
            dpi_scale: 1.0,
            native_rotation: Rotation::Rotate0,
            current_rotation: Rotation::Rotate0,
        }
    }
}

impl WindowSize {
    pub const fn new(pixel_size: PointSize, dpi_scale: f64) -> Self {
        Self {
            pixel_size,
            dpi_scale,
            native_rotation: Rotation::Rotate0,
            current_rotation: Rotation::Rotate0,
        }
    }

    pub const fn display_rotation(&self) -> Rotation {
        Rotation::relative(self.native_rotation, self.current_rotation)
    }

    /// Pixel size of the buffer backing this window, with width and height swapped
    /// when the display is turned a quarter from its native orientation.
    pub const fn rotated_pixel_size(&self) -> PointSize {
        if self.display_rotation().is_quarter_turn() {
            self.pixel_size.swapped()
        } else {
            self.pixel_size
        }
    }

    pub fn logical_size(&self) -> (f64, f64) {
        let scale = if self.dpi_scale > 0.0 { self.dpi_scale } else { 1.0 };
        (
            self.pixel_size.x as f64 / scale,
            self.pixel_size.y as f64 / scale,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quarter_turn_swaps_buffer_size() {
        let mut size = WindowSize::new(PointSize::new(1920, 1080), 1.0);
        assert_eq!(size.rotated_pixel_size(), PointSize::new(1920, 1080));

        size.current_rotation = Rotation::Rotate90;
        assert_eq!(size.rotated_pixel_size(), PointSize::new(1080, 1920));

        size.native_rotation = Rotation::Rotate90;
        assert_eq!(size.display_rotation(), Rotation::Rotate0);
        assert_eq!(size.rotated_pixel_size(), PointSize::new(1920, 1080));
    }

    #[test]
    fn relative_rotation_wraps() {
        assert_eq!(
            Rotation::relative(Rotation::Rotate270, Rotation::Rotate0),
            Rotation::Rotate90
        );
    }

    #[test]
    fn rect_shift_follows_mips() {
        let rect = RectSize::new(8, 4, 40, 20).shifted(2);
        assert_eq!(rect, RectSize::new(2, 1, 10, 5));
        assert_eq!(rect.width(), 8);
        assert_eq!(rect.height(), 4);
    }
}
