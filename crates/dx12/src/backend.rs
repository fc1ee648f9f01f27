//! The seam between the graphics core and a native GPU API.
//!
//! Everything above this module speaks in terms of these traits. `d3d12` implements them
//! with Direct3D 12 on Windows; `sim` implements them in software so the submission,
//! fence and allocation logic can run anywhere.

#[cfg(windows)]
pub mod d3d12;
pub mod sim;

use core::{any::Any, time::Duration};
use std::sync::Arc;

use bitflags::bitflags;
use ff_common::{Format, PointSize, RectSize, Rotation};
use raw_window_handle::RawWindowHandle;
use serde::{Deserialize, Serialize};

/// Row pitch alignment for texture data staged in upload/readback memory.
pub const TEXTURE_DATA_PITCH_ALIGNMENT: u64 = 256;
/// Placement alignment for texture data staged in upload/readback memory.
pub const TEXTURE_DATA_PLACEMENT_ALIGNMENT: u64 = 512;
/// Placement alignment for buffer data staged in upload/readback memory.
pub const BUFFER_DATA_PLACEMENT_ALIGNMENT: u64 = 256;
/// Default placement alignment of buffers and textures inside a heap.
pub const DEFAULT_RESOURCE_PLACEMENT_ALIGNMENT: u64 = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueueKind {
    Direct,
    Compute,
    Copy,
}

impl QueueKind {
    pub const ALL: [QueueKind; 3] = [QueueKind::Direct, QueueKind::Compute, QueueKind::Copy];

    pub const fn index(self) -> usize {
        match self {
            QueueKind::Direct => 0,
            QueueKind::Compute => 1,
            QueueKind::Copy => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HeapKind {
    /// CPU-writable, GPU-readable staging memory.
    Upload,
    /// GPU-writable, CPU-readable staging memory.
    Readback,
    /// GPU-local memory for placed buffers.
    Buffers,
    /// GPU-local memory for placed textures.
    Textures,
}

impl HeapKind {
    pub const fn cpu_visible(self) -> bool {
        matches!(self, HeapKind::Upload | HeapKind::Readback)
    }
}

bitflags! {
    /// Resource usage states. Bit values match `D3D12_RESOURCE_STATES`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ResourceStates: u32 {
        const COMMON = 0;
        const VERTEX_AND_CONSTANT_BUFFER = 0x1;
        const INDEX_BUFFER = 0x2;
        const RENDER_TARGET = 0x4;
        const UNORDERED_ACCESS = 0x8;
        const DEPTH_WRITE = 0x10;
        const DEPTH_READ = 0x20;
        const NON_PIXEL_SHADER_RESOURCE = 0x40;
        const PIXEL_SHADER_RESOURCE = 0x80;
        const STREAM_OUT = 0x100;
        const INDIRECT_ARGUMENT = 0x200;
        const COPY_DEST = 0x400;
        const COPY_SOURCE = 0x800;
        const RESOLVE_DEST = 0x1000;
        const RESOLVE_SOURCE = 0x2000;
        const GENERIC_READ = 0x1 | 0x2 | 0x40 | 0x80 | 0x200 | 0x800;
    }
}

impl ResourceStates {
    pub const PRESENT: Self = Self::COMMON;

    /// States in which the GPU may write the resource.
    pub const WRITE: Self = Self::RENDER_TARGET
        .union(Self::UNORDERED_ACCESS)
        .union(Self::DEPTH_WRITE)
        .union(Self::STREAM_OUT)
        .union(Self::COPY_DEST)
        .union(Self::RESOLVE_DEST);

    pub const fn is_write(self) -> bool {
        self.intersects(Self::WRITE)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceDimension {
    Buffer,
    Texture2d,
}

bitflags! {
    /// Bit values match `D3D12_RESOURCE_FLAGS`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ResourceFlags: u32 {
        const NONE = 0;
        const ALLOW_RENDER_TARGET = 0x1;
        const ALLOW_DEPTH_STENCIL = 0x2;
        const ALLOW_UNORDERED_ACCESS = 0x4;
        const DENY_SHADER_RESOURCE = 0x8;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceDesc {
    pub dimension: ResourceDimension,
    /// Byte size for buffers, pixel width for textures.
    pub width: u64,
    pub height: u32,
    pub array_size: u16,
    pub mip_levels: u16,
    pub format: Format,
    pub flags: ResourceFlags,
}

impl ResourceDesc {
    pub const fn buffer(size: u64) -> Self {
        Self {
            dimension: ResourceDimension::Buffer,
            width: size,
            height: 1,
            array_size: 1,
            mip_levels: 1,
            format: Format::Unknown,
            flags: ResourceFlags::NONE,
        }
    }

    pub const fn texture_2d(
        format: Format,
        width: u64,
        height: u32,
        array_size: u16,
        mip_levels: u16,
    ) -> Self {
        Self {
            dimension: ResourceDimension::Texture2d,
            width,
            height,
            array_size,
            mip_levels,
            format,
            flags: ResourceFlags::NONE,
        }
    }

    pub const fn with_flags(mut self, flags: ResourceFlags) -> Self {
        self.flags = flags;
        self
    }

    pub const fn is_buffer(&self) -> bool {
        matches!(self.dimension, ResourceDimension::Buffer)
    }

    pub const fn subresource_count(&self) -> usize {
        match self.dimension {
            ResourceDimension::Buffer => 1,
            ResourceDimension::Texture2d => self.array_size as usize * self.mip_levels as usize,
        }
    }

    /// Pixel size of subresource `sub_index` (`mip + array_slice * mip_levels`).
    pub fn subresource_size(&self, sub_index: usize) -> PointSize {
        let mip = sub_index % (self.mip_levels.max(1) as usize);
        PointSize::new(
            ((self.width as usize) >> mip).max(1),
            ((self.height as usize) >> mip).max(1),
        )
    }

    pub fn validate(&self) -> bool {
        match self.dimension {
            ResourceDimension::Buffer => self.width > 0,
            ResourceDimension::Texture2d => {
                self.width > 0
                    && self.height > 0
                    && self.array_size > 0
                    && self.mip_levels > 0
                    && self.format != Format::Unknown
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AllocationInfo {
    pub size: u64,
    pub alignment: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClearValue {
    pub format: Format,
    pub color: [f32; 4],
}

/// Layout of one texture subresource staged in upload or readback memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureFootprint {
    /// Byte offset inside the staging heap.
    pub offset: u64,
    pub format: Format,
    pub width: u32,
    pub height: u32,
    pub row_pitch: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapChainDesc {
    pub width: u32,
    pub height: u32,
    pub format: Format,
    pub buffer_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentStatus {
    Presented,
    /// The window is not visible. The frame was dropped but the chain is healthy.
    Occluded,
    DeviceLost,
}

pub trait DeviceBackend: Send + Sync {
    fn name(&self) -> &str;

    fn is_removed(&self) -> bool;

    /// Recreates the native device after removal. Every object created before the
    /// call is dead afterwards.
    fn reset(&self) -> anyhow::Result<()>;

    fn create_queue(&self, kind: QueueKind) -> anyhow::Result<Box<dyn QueueBackend>>;

    fn create_fence(&self, initial_value: u64) -> anyhow::Result<Box<dyn FenceBackend>>;

    fn create_command_allocator(
        &self,
        kind: QueueKind,
    ) -> anyhow::Result<Box<dyn CommandAllocatorBackend>>;

    /// Creates a command list that is open for recording against `allocator`.
    fn create_command_list(
        &self,
        kind: QueueKind,
        allocator: &dyn CommandAllocatorBackend,
    ) -> anyhow::Result<Box<dyn CommandListBackend>>;

    fn create_heap(&self, kind: HeapKind, size: u64) -> anyhow::Result<Box<dyn HeapBackend>>;

    fn allocation_info(&self, desc: &ResourceDesc) -> AllocationInfo;

    fn create_committed_resource(
        &self,
        desc: &ResourceDesc,
        state: ResourceStates,
        clear_value: Option<&ClearValue>,
    ) -> anyhow::Result<Arc<dyn ResourceBackend>>;

    fn create_placed_resource(
        &self,
        heap: &dyn HeapBackend,
        offset: u64,
        desc: &ResourceDesc,
        state: ResourceStates,
        clear_value: Option<&ClearValue>,
    ) -> anyhow::Result<Arc<dyn ResourceBackend>>;

    fn create_swap_chain(
        &self,
        queue: &dyn QueueBackend,
        window: RawWindowHandle,
        desc: &SwapChainDesc,
    ) -> anyhow::Result<Box<dyn SwapChainBackend>>;
}

pub trait QueueBackend: Send + Sync {
    fn kind(&self) -> QueueKind;

    fn execute(&self, lists: &[&dyn CommandListBackend]) -> anyhow::Result<()>;

    /// Enqueues a GPU-side signal of `fence` to `value`.
    fn signal(&self, fence: &dyn FenceBackend, value: u64) -> anyhow::Result<()>;

    /// Enqueues a GPU-side wait until `fence` reaches `value`. Does not block the CPU.
    fn wait(&self, fence: &dyn FenceBackend, value: u64) -> anyhow::Result<()>;

    fn as_any(&self) -> &dyn Any;
}

pub trait FenceBackend: Send + Sync {
    /// Last value the GPU reached. `u64::MAX` once the device is removed.
    fn completed_value(&self) -> u64;

    /// Blocks until the fence reaches `value`. `Ok(false)` on timeout.
    fn wait(&self, value: u64, timeout: Option<Duration>) -> anyhow::Result<bool>;

    fn as_any(&self) -> &dyn Any;
}

pub trait CommandAllocatorBackend: Send {
    /// Frees recorded memory. The GPU must be done with every list recorded into it.
    fn reset(&mut self) -> anyhow::Result<()>;

    fn as_any(&self) -> &dyn Any;
}

/// Recording never fails eagerly; errors surface from [`CommandListBackend::close`].
pub trait CommandListBackend: Send {
    fn reset(&mut self, allocator: &dyn CommandAllocatorBackend) -> anyhow::Result<()>;

    fn close(&mut self) -> anyhow::Result<()>;

    fn barrier(
        &mut self,
        resource: &dyn ResourceBackend,
        before: ResourceStates,
        after: ResourceStates,
    );

    fn aliasing_barrier(
        &mut self,
        before: Option<&dyn ResourceBackend>,
        after: &dyn ResourceBackend,
    );

    fn copy_resource(&mut self, dst: &dyn ResourceBackend, src: &dyn ResourceBackend);

    fn copy_buffer_from_heap(
        &mut self,
        dst: &dyn ResourceBackend,
        dst_offset: u64,
        src: &dyn HeapBackend,
        src_offset: u64,
        size: u64,
    );

    fn copy_buffer_to_heap(
        &mut self,
        dst: &dyn HeapBackend,
        dst_offset: u64,
        src: &dyn ResourceBackend,
        src_offset: u64,
        size: u64,
    );

    fn copy_texture_from_heap(
        &mut self,
        dst: &dyn ResourceBackend,
        sub_index: u32,
        pos: PointSize,
        src: &dyn HeapBackend,
        footprint: &TextureFootprint,
    );

    fn copy_texture_to_heap(
        &mut self,
        dst: &dyn HeapBackend,
        footprint: &TextureFootprint,
        src: &dyn ResourceBackend,
        sub_index: u32,
        rect: RectSize,
    );

    fn clear_render_target(&mut self, target: &dyn ResourceBackend, color: [f32; 4]);

    fn discard_resource(&mut self, resource: &dyn ResourceBackend);

    fn as_any(&self) -> &dyn Any;
}

pub trait HeapBackend: Send + Sync {
    fn kind(&self) -> HeapKind;

    fn size(&self) -> u64;

    /// CPU write into a CPU-visible heap.
    fn write(&self, offset: u64, data: &[u8]) -> anyhow::Result<()>;

    /// CPU read from a CPU-visible heap.
    fn read(&self, offset: u64, out: &mut [u8]) -> anyhow::Result<()>;

    fn gpu_address(&self, offset: u64) -> Option<u64>;

    fn as_any(&self) -> &dyn Any;
}

pub trait ResourceBackend: Send + Sync {
    fn desc(&self) -> &ResourceDesc;

    fn gpu_address(&self) -> Option<u64>;

    fn as_any(&self) -> &dyn Any;
}

pub trait SwapChainBackend: Send + Sync {
    fn buffer_count(&self) -> usize;

    fn current_back_buffer_index(&self) -> usize;

    fn buffer(&self, index: usize) -> anyhow::Result<Arc<dyn ResourceBackend>>;

    fn present(&self, sync_interval: u32) -> anyhow::Result<PresentStatus>;

    /// Every buffer handed out by [`SwapChainBackend::buffer`] must be released first.
    fn resize_buffers(&self, width: u32, height: u32) -> anyhow::Result<()>;

    fn set_rotation(&self, rotation: Rotation) -> anyhow::Result<()>;

    /// Blocks on the frame latency waitable. `Ok(false)` on timeout.
    fn wait_frame_latency(&self, timeout: Duration) -> anyhow::Result<bool>;

    fn full_screen(&self) -> anyhow::Result<bool>;

    fn set_full_screen(&self, value: bool) -> anyhow::Result<()>;
}
