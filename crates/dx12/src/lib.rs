//! Command submission, fence tracking, GPU memory allocation and resource state tracking
//! for Direct3D 12.
//!
//! A [`GraphicsContext`] owns the device, its three queues and the heaps everything is
//! allocated from. Work is recorded into [`Commands`] taken from a [`Queue`] and executing
//! them yields a [`FenceValue`]. [`Resource`]s remember which fence values read and wrote
//! them, so commands touching a resource wait on the GPU for exactly the work they depend
//! on, and memory is only reused once that work completed.

pub mod backend;
pub mod child;
pub mod commands;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod fence;
pub mod heap;
pub mod mem_allocator;
pub mod mem_range;
pub mod queue;
pub mod resource;
pub mod target;

pub use child::{ChildRegistration, DeviceChild, ResetPriority};
pub use commands::Commands;
pub use config::GraphicsConfig;
pub use context::GraphicsContext;
pub use dispatch::{Dispatcher, InlineDispatcher};
pub use error::{Error, Result};
pub use fence::{Fence, FenceValue, FenceValues};
pub use mem_allocator::{PersistentAllocator, RingAllocator};
pub use mem_range::MemRange;
pub use queue::Queue;
pub use resource::{ReadbackTextureData, Resource, ResourceId};
pub use target::{Target, TargetTexture, TargetWindow, WindowEvent, WindowHost};
