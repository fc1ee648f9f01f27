//! Plain data types shared between the ff graphics crates and the layers around them
//! (windowing, asset loading). Nothing in this crate talks to a GPU.

pub mod format;
pub mod image;
pub mod math;
pub mod size;

pub use format::Format;
pub use image::{Image, ScratchImage, copy_rectangle};
pub use size::{PointSize, RectSize, Rotation, WindowSize};
