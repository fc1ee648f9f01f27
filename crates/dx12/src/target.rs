//! Things commands render into: window swap chains and texture sub-ranges.

pub mod texture;
pub mod window;

use ff_common::{Format, WindowSize};
use raw_window_handle::RawWindowHandle;

use crate::{commands::Commands, error::Result};

pub use texture::TargetTexture;
pub use window::TargetWindow;

pub trait Target {
    fn format(&self) -> Format;

    /// Size as the window layer sees it. For rotated displays the pixel size is the size
    /// of the backing buffer.
    fn size(&self) -> WindowSize;

    fn target_array_start(&self) -> usize;

    fn target_array_size(&self) -> usize;

    fn target_mip_start(&self) -> usize;

    fn target_mip_size(&self) -> usize;

    fn clear(&self, commands: &mut Commands, color: [f32; 4]) -> Result<()>;

    fn discard(&self, commands: &mut Commands) -> Result<()>;
}

/// The window a [`TargetWindow`] presents to, owned by the windowing layer.
pub trait WindowHost: Send + Sync {
    fn size(&self) -> WindowSize;

    fn raw_window_handle(&self) -> RawWindowHandle;

    /// Only the main window may go full screen.
    fn is_main(&self) -> bool {
        true
    }
}

/// Window notifications, sent from the UI thread and applied on the render thread.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WindowEvent {
    Resized(WindowSize),
    Deactivated,
    ToggleFullScreen,
    Destroyed,
}
