use core::{
    fmt,
    mem,
    sync::atomic::{AtomicU64, Ordering},
};
use std::sync::{Arc, Weak};

use bytemuck::Pod;
use ff_common::{
    Image, PointSize, RectSize, ScratchImage, copy_rectangle,
    math::{align_up, is_aligned},
};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace, warn};

use crate::{
    backend::{
        AllocationInfo, ClearValue, DeviceBackend, HeapKind, ResourceBackend, ResourceDesc,
        ResourceFlags, ResourceStates, TEXTURE_DATA_PITCH_ALIGNMENT, TextureFootprint,
    },
    child::{ChildRegistration, DeviceChild, ResetPriority},
    commands::Commands,
    context::{GraphicsContext, KeepAlive},
    error::{Error, Result},
    fence::{Fence, FenceValue, FenceValues},
    mem_range::MemRange,
};

static NEXT_RESOURCE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceId(u64);

impl ResourceId {
    pub fn get(self) -> u64 {
        self.0
    }
}

/// A GPU buffer or texture with CPU-side state and fence tracking.
///
/// Every use through [`Resource::state`] with commands records which fence values
/// read or write it, so later commands wait for exactly the work they conflict with.
/// Dropping a resource keeps its native object alive until that work completes.
pub struct Resource {
    context: GraphicsContext,
    shared: Arc<ResourceShared>,
}

pub(crate) struct ResourceShared {
    id: ResourceId,
    name: String,
    desc: ResourceDesc,
    alloc_info: AllocationInfo,
    clear_value: Option<ClearValue>,
    external: bool,
    mem_range: Mutex<Option<MemRange>>,
    hw: RwLock<Option<Arc<dyn ResourceBackend>>>,
    tracking: Mutex<Tracking>,
    _registration: ChildRegistration,
}

#[derive(Debug, Clone)]
pub(crate) struct Tracking {
    pub state: ResourceStates,
    pub reads: FenceValues,
    pub write: FenceValue,
}

/// Tracking of one resource as it was before a [`Commands`] first touched it.
pub(crate) struct Touched {
    resource: Weak<ResourceShared>,
    before: Tracking,
    pub state_after: ResourceStates,
}

impl Touched {
    pub fn new(
        resource: &Arc<ResourceShared>,
        before: Tracking,
        state_after: ResourceStates,
    ) -> Self {
        Self {
            resource: Arc::downgrade(resource),
            before,
            state_after,
        }
    }

    pub fn is(&self, resource: &Arc<ResourceShared>) -> bool {
        Weak::ptr_eq(&self.resource, &Arc::downgrade(resource))
    }

    /// Undoes what discarded commands did to the tracking, leaving alone anything other
    /// commands changed since.
    pub fn roll_back(self, fence: &Fence) {
        let Some(shared) = self.resource.upgrade() else {
            return;
        };

        let mut tracking = shared.tracking.lock();
        if tracking.state == self.state_after {
            tracking.state = self.before.state;
        }

        if tracking.write.on_fence(fence) {
            tracking.write = self.before.write;
        }

        tracking.reads.remove_fence(fence);
        tracking.reads.add_all(&self.before.reads);
        trace!(id = ?shared.id, state = ?tracking.state, "resource tracking rolled back");
    }
}

enum Placement {
    Allocate,
    Committed,
    Range(MemRange),
}

impl Resource {
    /// Creates a resource placed in the context's default heaps. Render targets and depth
    /// buffers get their own committed memory.
    pub fn new(
        context: &GraphicsContext,
        name: impl Into<String>,
        desc: ResourceDesc,
        initial_state: ResourceStates,
        clear_value: Option<ClearValue>,
    ) -> Result<Self> {
        Self::create(
            context,
            name.into(),
            desc,
            initial_state,
            clear_value,
            Placement::Allocate,
        )
    }

    pub fn new_committed(
        context: &GraphicsContext,
        name: impl Into<String>,
        desc: ResourceDesc,
        initial_state: ResourceStates,
        clear_value: Option<ClearValue>,
    ) -> Result<Self> {
        Self::create(
            context,
            name.into(),
            desc,
            initial_state,
            clear_value,
            Placement::Committed,
        )
    }

    /// Places the resource in existing memory, possibly aliasing other resources. Falls
    /// back to a fresh allocation if `mem_range` is too small or misaligned.
    pub fn with_mem_range(
        context: &GraphicsContext,
        name: impl Into<String>,
        desc: ResourceDesc,
        initial_state: ResourceStates,
        clear_value: Option<ClearValue>,
        mem_range: MemRange,
    ) -> Result<Self> {
        Self::create(
            context,
            name.into(),
            desc,
            initial_state,
            clear_value,
            Placement::Range(mem_range),
        )
    }

    /// Wraps a native resource created elsewhere, such as a swap chain buffer. It is not
    /// recreated on device reset; its owner replaces it.
    pub fn from_external(
        context: &GraphicsContext,
        name: impl Into<String>,
        hw: Arc<dyn ResourceBackend>,
        state: ResourceStates,
    ) -> Result<Self> {
        let desc = *hw.desc();
        let alloc_info = context.device().allocation_info(&desc);
        Ok(Self::wrap(
            context,
            name.into(),
            desc,
            alloc_info,
            None,
            true,
            None,
            hw,
            state,
        ))
    }

    fn create(
        context: &GraphicsContext,
        name: String,
        desc: ResourceDesc,
        initial_state: ResourceStates,
        clear_value: Option<ClearValue>,
        placement: Placement,
    ) -> Result<Self> {
        if !desc.validate() {
            return Err(Error::InvalidArgument("invalid resource description"));
        }

        let device = context.device();
        let alloc_info = device.allocation_info(&desc);
        if alloc_info.size == 0 {
            return Err(Error::InvalidArgument("resource has no size"));
        }

        let attachment = desc
            .flags
            .intersects(ResourceFlags::ALLOW_RENDER_TARGET | ResourceFlags::ALLOW_DEPTH_STENCIL);
        let mem_range = match placement {
            Placement::Committed => None,
            Placement::Allocate if attachment && !desc.is_buffer() => None,
            Placement::Range(range)
                if is_aligned(range.start(), alloc_info.alignment.max(1))
                    && range.size() >= alloc_info.size =>
            {
                Some(range)
            }
            Placement::Range(_) | Placement::Allocate => {
                let (allocator, kind) = if desc.is_buffer() {
                    (context.buffer_allocator(), HeapKind::Buffers)
                } else {
                    (context.texture_allocator(), HeapKind::Textures)
                };

                let range = allocator
                    .alloc_bytes(alloc_info.size, alloc_info.alignment)
                    .or_else(|| {
                        // Dropped resources may hold memory the GPU is already done with.
                        if context.collect_garbage() == 0 {
                            return None;
                        }
                        allocator.alloc_bytes(alloc_info.size, alloc_info.alignment)
                    })
                    .ok_or(Error::OutOfMemory {
                        kind,
                        size: alloc_info.size,
                        align: alloc_info.alignment,
                    })?;
                Some(range)
            }
        };

        let hw = create_hw(
            device.as_ref(),
            &desc,
            initial_state,
            clear_value.as_ref(),
            mem_range.as_ref(),
        )?;

        let resource = Self::wrap(
            context,
            name,
            desc,
            alloc_info,
            clear_value,
            false,
            mem_range.clone(),
            hw,
            initial_state,
        );

        if let Some(range) = mem_range {
            if range.active_resource().is_none() {
                range.claim(resource.id());
            }
        }

        trace!(id = ?resource.id(), name = resource.name(), ?desc, "resource created");
        Ok(resource)
    }

    #[allow(clippy::too_many_arguments)]
    fn wrap(
        context: &GraphicsContext,
        name: String,
        desc: ResourceDesc,
        alloc_info: AllocationInfo,
        clear_value: Option<ClearValue>,
        external: bool,
        mem_range: Option<MemRange>,
        hw: Arc<dyn ResourceBackend>,
        state: ResourceStates,
    ) -> Self {
        let shared = Arc::new_cyclic(|weak: &Weak<ResourceShared>| {
            let child: Weak<dyn DeviceChild> = weak.clone();
            ResourceShared {
                id: ResourceId(NEXT_RESOURCE_ID.fetch_add(1, Ordering::Relaxed)),
                name,
                desc,
                alloc_info,
                clear_value,
                external,
                mem_range: Mutex::new(mem_range),
                hw: RwLock::new(Some(hw)),
                tracking: Mutex::new(Tracking {
                    state,
                    reads: FenceValues::new(),
                    write: FenceValue::default(),
                }),
                _registration: context.children().add(child, ResetPriority::RESOURCE),
            }
        });

        Self {
            context: context.clone(),
            shared,
        }
    }

    pub fn id(&self) -> ResourceId {
        self.shared.id
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn desc(&self) -> &ResourceDesc {
        &self.shared.desc
    }

    pub fn alloc_info(&self) -> AllocationInfo {
        self.shared.alloc_info
    }

    pub fn clear_value(&self) -> Option<&ClearValue> {
        self.shared.clear_value.as_ref()
    }

    pub fn is_external(&self) -> bool {
        self.shared.external
    }

    pub fn context(&self) -> &GraphicsContext {
        &self.context
    }

    pub fn mem_range(&self) -> Option<MemRange> {
        self.shared.mem_range.lock().clone()
    }

    pub fn gpu_address(&self) -> Option<u64> {
        self.shared.hw.read().as_ref()?.gpu_address()
    }

    /// Native resource, missing while a device reset is in progress.
    pub fn hw(&self) -> Result<Arc<dyn ResourceBackend>> {
        self.shared.hw.read().clone().ok_or(Error::DeviceLost)
    }

    pub fn current_state(&self) -> ResourceStates {
        self.shared.tracking.lock().state
    }

    pub fn read_fence_values(&self) -> FenceValues {
        self.shared.tracking.lock().reads.clone()
    }

    pub fn write_fence_value(&self) -> FenceValue {
        self.shared.tracking.lock().write.clone()
    }

    /// Moves the tracked state to `state` and returns the previous one.
    ///
    /// With commands, they are made to wait for the last write (and for a write, every
    /// read since), the resource records them as its newest reader or writer, and a
    /// barrier is recorded if the state changes. Without commands only the cached state
    /// changes.
    pub fn state(&self, state: ResourceStates, commands: Option<&mut Commands>) -> ResourceStates {
        let mut tracking = self.shared.tracking.lock();
        let before = tracking.state;

        let Some(commands) = commands else {
            tracking.state = state;
            return before;
        };

        commands.touch(&self.shared, &tracking, state);
        commands.wait_before_execute(tracking.write.clone());

        let next = commands.next_fence_value();
        if state.is_write() {
            for read in &tracking.reads {
                commands.wait_before_execute(read.clone());
            }
            tracking.reads.clear();
            tracking.write = next;
        } else {
            tracking.reads.add(next);
        }

        if state != before {
            tracking.state = state;
            match self.shared.hw.read().as_deref() {
                Some(hw) => commands.record_barrier(hw, before, state),
                None => warn!(id = ?self.id(), "no native resource to transition"),
            }
        }

        before
    }

    /// Whether this resource may use its memory. Always true for committed resources.
    pub fn is_active(&self) -> bool {
        match *self.shared.mem_range.lock() {
            Some(ref range) => range.active_resource() == Some(self.id()),
            None => true,
        }
    }

    /// Claims or releases the memory range this resource shares with others.
    ///
    /// Claiming records an aliasing barrier when commands are given. Claiming memory
    /// another resource still holds fails.
    pub fn activate(&self, value: bool, commands: Option<&mut Commands>) -> bool {
        let Some(range) = self.mem_range() else {
            return true;
        };

        if !value {
            range.release(self.id());
            return true;
        }

        if range.active_resource() == Some(self.id()) {
            return true;
        }

        if !range.claim(self.id()) {
            return false;
        }

        if let (Some(commands), Some(hw)) = (commands, self.shared.hw.read().as_deref()) {
            commands.aliasing_barrier(hw);
        }
        true
    }

    /// Runs `f` with `commands`, or with internal copy commands that are executed
    /// right after. Returns the fence value that completes once the recorded work does.
    fn with_copy_commands<R>(
        &self,
        commands: Option<&mut Commands>,
        f: impl FnOnce(&mut Commands) -> Result<R>,
    ) -> Result<(R, FenceValue)> {
        match commands {
            Some(commands) => {
                let fence_value = commands.next_fence_value();
                Ok((f(commands)?, fence_value))
            }
            None => {
                let mut commands = self.context.copy_queue().new_commands()?;
                let result = f(&mut commands)?;
                Ok((result, commands.execute()?))
            }
        }
    }

    /// Copies `data` into the buffer at `offset` through upload memory.
    pub fn update_buffer(
        &self,
        commands: Option<&mut Commands>,
        offset: u64,
        data: &[u8],
    ) -> Result<FenceValue> {
        if data.is_empty() {
            return Ok(FenceValue::default());
        }

        let size = data.len() as u64;
        let width = self.desc().width;
        if !self.desc().is_buffer() || offset.checked_add(size).is_none_or(|end| end > width) {
            return Err(Error::InvalidArgument("buffer update out of range"));
        }

        let ((), fence_value) = self.with_copy_commands(commands, |commands| {
            let range = self
                .context
                .upload_allocator()
                .alloc_buffer(size, commands.next_fence_value())
                .ok_or(Error::OutOfMemory {
                    kind: HeapKind::Upload,
                    size,
                    align: 1,
                })?;
            range.write(0, data)?;

            let before = commands.transition(self, ResourceStates::COPY_DEST);
            let (hw, heap) = (self.hw()?, range.heap().hw()?);
            commands.record(|list| {
                list.copy_buffer_from_heap(hw.as_ref(), offset, &*heap, range.start(), size)
            })?;
            commands.transition(self, before);
            Ok(())
        })?;

        Ok(fence_value)
    }

    pub fn update_buffer_pod<T: Pod>(
        &self,
        commands: Option<&mut Commands>,
        offset: u64,
        data: &[T],
    ) -> Result<FenceValue> {
        self.update_buffer(commands, offset, bytemuck::cast_slice(data))
    }

    /// Copies `size` bytes at `offset` into readback memory. The bytes are valid once the
    /// returned fence value completes.
    pub fn readback_buffer(
        &self,
        commands: Option<&mut Commands>,
        offset: u64,
        size: u64,
    ) -> Result<(FenceValue, MemRange)> {
        let width = self.desc().width;
        if size == 0
            || !self.desc().is_buffer()
            || offset.checked_add(size).is_none_or(|end| end > width)
        {
            return Err(Error::InvalidArgument("buffer readback out of range"));
        }

        let (range, fence_value) = self.with_copy_commands(commands, |commands| {
            let range = self
                .context
                .readback_allocator()
                .alloc_buffer(size, commands.next_fence_value())
                .ok_or(Error::OutOfMemory {
                    kind: HeapKind::Readback,
                    size,
                    align: 1,
                })?;

            let before = commands.transition(self, ResourceStates::COPY_SOURCE);
            let (hw, heap) = (self.hw()?, range.heap().hw()?);
            commands.record(|list| {
                list.copy_buffer_to_heap(&*heap, range.start(), hw.as_ref(), offset, size)
            })?;
            commands.transition(self, before);
            Ok(range.clone())
        })?;

        Ok((fence_value, range))
    }

    /// Reads buffer bytes back to the CPU, blocking until the copy finished.
    pub fn capture_buffer(&self, offset: u64, size: u64) -> Result<Vec<u8>> {
        if size == 0 {
            return Ok(Vec::new());
        }

        let (fence_value, range) = self.readback_buffer(None, offset, size)?;
        fence_value.wait(None)?;
        Ok(range.read_vec(0, size as usize)?)
    }

    /// Uploads one image per subresource, starting at `sub_index`, to `pos` in the first
    /// subresource. Lower mips take `pos` scaled down to their level.
    pub fn update_texture(
        &self,
        commands: Option<&mut Commands>,
        images: &[Image],
        sub_index: usize,
        pos: PointSize,
    ) -> Result<FenceValue> {
        let desc = *self.desc();
        if validate_texture_range(&desc, sub_index, images.len(), None).is_none() {
            return Err(Error::InvalidArgument("texture update out of range"));
        }

        let mips = desc.mip_levels as usize;
        for (i, image) in images.iter().enumerate() {
            let size = desc.subresource_size(sub_index + i);
            let image_pos = pos.shifted(i % mips);
            if image.format != desc.format
                || image_pos.x + image.width > size.x
                || image_pos.y + image.height > size.y
            {
                return Err(Error::InvalidArgument("image does not fit the texture"));
            }
        }

        let ((), fence_value) = self.with_copy_commands(commands, |commands| {
            let before = commands.transition(self, ResourceStates::COPY_DEST);
            let hw = self.hw()?;

            for (i, image) in images.iter().enumerate() {
                let row_bytes = image.row_bytes() as u64;
                let row_pitch = align_up(row_bytes, TEXTURE_DATA_PITCH_ALIGNMENT);
                let scanlines = image.scanlines() as u64;
                let size = row_pitch * scanlines;

                let range = self
                    .context
                    .upload_allocator()
                    .alloc_texture(size, commands.next_fence_value())
                    .ok_or(Error::OutOfMemory {
                        kind: HeapKind::Upload,
                        size,
                        align: row_pitch,
                    })?;
                for scanline in 0..image.scanlines() {
                    range.write(scanline as u64 * row_pitch, image.row(scanline))?;
                }

                let footprint = TextureFootprint {
                    offset: range.start(),
                    format: image.format,
                    width: image.width as u32,
                    height: image.height as u32,
                    row_pitch: row_pitch as u32,
                };
                let heap = range.heap().hw()?;
                commands.record(|list| {
                    list.copy_texture_from_heap(
                        hw.as_ref(),
                        (sub_index + i) as u32,
                        pos.shifted(i % mips),
                        &*heap,
                        &footprint,
                    )
                })?;
            }

            commands.transition(self, before);
            Ok(())
        })?;

        Ok(fence_value)
    }

    /// Copies `sub_count` subresources starting at `sub_index` into readback memory.
    /// `source_rect` applies to the first mip and scales down for lower ones.
    pub fn readback_texture(
        &self,
        commands: Option<&mut Commands>,
        sub_index: usize,
        sub_count: usize,
        source_rect: Option<RectSize>,
    ) -> Result<ReadbackTextureData> {
        let desc = *self.desc();
        let layout = validate_texture_range(&desc, sub_index, sub_count, source_rect)
            .ok_or(Error::InvalidArgument("texture readback out of range"))?;

        let mips = desc.mip_levels as usize;
        let (subresources, fence_value) = self.with_copy_commands(commands, |commands| {
            let before = commands.transition(self, ResourceStates::COPY_SOURCE);
            let hw = self.hw()?;

            let mut subresources = Vec::with_capacity(sub_count);
            for i in 0..sub_count {
                let absolute_mip = (sub_index + i) % mips;
                let rect = match source_rect {
                    Some(rect) => rect.shifted(i % mips),
                    None => RectSize::from_size(desc.subresource_size(absolute_mip)),
                };

                let (width, height) = (rect.width().max(1), rect.height().max(1));
                let row_pitch = align_up(
                    (desc.format.row_blocks(width) * desc.format.bytes_per_block()) as u64,
                    TEXTURE_DATA_PITCH_ALIGNMENT,
                );
                let size = row_pitch * desc.format.compute_scanlines(height) as u64;

                let range = self
                    .context
                    .readback_allocator()
                    .alloc_texture(size, commands.next_fence_value())
                    .ok_or(Error::OutOfMemory {
                        kind: HeapKind::Readback,
                        size,
                        align: row_pitch,
                    })?;

                let footprint = TextureFootprint {
                    offset: range.start(),
                    format: desc.format,
                    width: width as u32,
                    height: height as u32,
                    row_pitch: row_pitch as u32,
                };
                let heap = range.heap().hw()?;
                commands.record(|list| {
                    list.copy_texture_to_heap(
                        &*heap,
                        &footprint,
                        hw.as_ref(),
                        (sub_index + i) as u32,
                        rect,
                    )
                })?;
                drop(heap);

                subresources.push((range, footprint));
            }

            commands.transition(self, before);
            Ok(subresources)
        })?;

        Ok(ReadbackTextureData {
            fence_value,
            width: layout.width,
            height: layout.height,
            mip_count: layout.mip_count,
            array_count: layout.array_count,
            subresources,
        })
    }

    /// Reads subresources back to the CPU, blocking until the copy finished.
    pub fn capture_texture(
        &self,
        sub_index: usize,
        sub_count: usize,
        source_rect: Option<RectSize>,
    ) -> Result<ScratchImage> {
        let data = self.readback_texture(None, sub_index, sub_count, source_rect)?;
        if data.array_count * data.mip_count != data.image_count() {
            return Err(Error::InvalidArgument(
                "texture capture must cover whole mip chains",
            ));
        }

        let mut scratch = ScratchImage::initialize_2d(
            self.desc().format,
            data.width,
            data.height,
            data.array_count,
            data.mip_count,
        )?;

        for i in 0..data.image_count() {
            let image = data.image(i)?;
            let dst = &mut scratch.images_mut()[i];
            let (width, height) = (image.width.min(dst.width), image.height.min(dst.height));
            copy_rectangle(&image, RectSize::new(0, 0, width, height), dst, 0, 0)?;
        }

        Ok(scratch)
    }

    /// A new resource with the same description and contents.
    pub fn duplicate(&self, commands: Option<&mut Commands>) -> Result<Resource> {
        let placement = match self.mem_range() {
            Some(_) => Placement::Allocate,
            None => Placement::Committed,
        };

        let copy = Self::create(
            &self.context,
            format!("{} copy", self.name()),
            *self.desc(),
            ResourceStates::COPY_DEST,
            self.shared.clear_value,
            placement,
        )?;

        self.with_copy_commands(commands, |commands| commands.copy_resource(&copy, self))?;
        Ok(copy)
    }
}

fn create_hw(
    device: &dyn DeviceBackend,
    desc: &ResourceDesc,
    state: ResourceStates,
    clear_value: Option<&ClearValue>,
    mem_range: Option<&MemRange>,
) -> anyhow::Result<Arc<dyn ResourceBackend>> {
    match mem_range {
        Some(range) => {
            let heap = range.heap().hw()?;
            device.create_placed_resource(&*heap, range.start(), desc, state, clear_value)
        }
        None => device.create_committed_resource(desc, state, clear_value),
    }
}

impl DeviceChild for ResourceShared {
    fn before_reset(&self) {
        *self.hw.write() = None;

        let mut tracking = self.tracking.lock();
        tracking.reads.clear();
        tracking.write = FenceValue::default();
    }

    fn reset(&self, device: &dyn DeviceBackend) -> anyhow::Result<()> {
        if self.external {
            return Ok(());
        }

        let state = self.tracking.lock().state;
        let mem_range = self.mem_range.lock().clone();
        let hw = create_hw(
            device,
            &self.desc,
            state,
            self.clear_value.as_ref(),
            mem_range.as_ref(),
        )?;

        *self.hw.write() = Some(hw);
        debug!(id = ?self.id, name = self.name, "resource recreated");
        Ok(())
    }
}

impl Drop for Resource {
    fn drop(&mut self) {
        let mem_range = self.shared.mem_range.lock().take();
        if let Some(ref range) = mem_range {
            range.release(self.id());
        }

        let fence_values = {
            let mut tracking = self.shared.tracking.lock();
            let mut fence_values = mem::take(&mut tracking.reads);
            fence_values.add(mem::take(&mut tracking.write));
            fence_values
        };

        let resource = self.shared.hw.write().take();
        self.context.keep_alive(
            fence_values,
            KeepAlive {
                resource,
                mem_range,
            },
        );
    }
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("id", &self.shared.id)
            .field("name", &self.shared.name)
            .field("desc", &self.shared.desc)
            .field("state", &self.current_state())
            .finish_non_exhaustive()
    }
}

struct TextureRange {
    width: usize,
    height: usize,
    mip_count: usize,
    array_count: usize,
}

/// Checks that `sub_count` subresources from `sub_index` form either a run of mips in
/// one array slice or whole mip chains of consecutive slices.
fn validate_texture_range(
    desc: &ResourceDesc,
    sub_index: usize,
    sub_count: usize,
    source_rect: Option<RectSize>,
) -> Option<TextureRange> {
    if desc.is_buffer()
        || sub_count == 0
        || sub_index
            .checked_add(sub_count)
            .is_none_or(|end| end > desc.subresource_count())
    {
        return None;
    }

    let mips = desc.mip_levels as usize;
    let mip_start = sub_index % mips;
    if mip_start + sub_count > mips && (mip_start != 0 || sub_count % mips != 0) {
        return None;
    }

    let first = desc.subresource_size(sub_index);
    let (width, height) = match source_rect {
        Some(rect) => {
            if rect.width() == 0
                || rect.height() == 0
                || rect.right > first.x
                || rect.bottom > first.y
            {
                return None;
            }
            (rect.width(), rect.height())
        }
        None => (first.x, first.y),
    };

    Some(TextureRange {
        width,
        height,
        mip_count: sub_count.min(mips),
        array_count: (sub_count / mips).max(1),
    })
}

/// Subresources copied into readback memory by [`Resource::readback_texture`].
pub struct ReadbackTextureData {
    pub fence_value: FenceValue,
    pub width: usize,
    pub height: usize,
    pub mip_count: usize,
    pub array_count: usize,
    subresources: Vec<(MemRange, TextureFootprint)>,
}

impl ReadbackTextureData {
    pub fn image_count(&self) -> usize {
        self.subresources.len()
    }

    /// Waits for the copy and reads subresource `index` into an image with the padded
    /// row pitch of the readback memory.
    pub fn image(&self, index: usize) -> Result<Image> {
        let (range, footprint) = self
            .subresources
            .get(index)
            .ok_or(Error::InvalidArgument("readback image index out of range"))?;

        self.fence_value.wait(None)?;

        let row_pitch = footprint.row_pitch as usize;
        let scanlines = footprint.format.compute_scanlines(footprint.height as usize);
        let pixels = range.read_vec(0, row_pitch * scanlines)?;
        Ok(Image::with_pitch(
            footprint.format,
            footprint.width as usize,
            footprint.height as usize,
            row_pitch,
            pixels,
        )?)
    }
}

impl fmt::Debug for ReadbackTextureData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadbackTextureData")
            .field("fence_value", &self.fence_value)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("mip_count", &self.mip_count)
            .field("array_count", &self.array_count)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use ff_common::Format;

    use super::*;

    #[test]
    fn texture_ranges() {
        let desc = ResourceDesc::texture_2d(Format::R8G8B8A8Unorm, 64, 32, 3, 4);

        let mips = validate_texture_range(&desc, 1, 3, None).unwrap();
        assert_eq!((mips.width, mips.height), (32, 16));
        assert_eq!((mips.mip_count, mips.array_count), (3, 1));

        let slices = validate_texture_range(&desc, 4, 8, None).unwrap();
        assert_eq!((slices.mip_count, slices.array_count), (4, 2));

        // crosses into the next slice without starting at mip 0
        assert!(validate_texture_range(&desc, 2, 4, None).is_none());
        assert!(validate_texture_range(&desc, 8, 8, None).is_none());
        assert!(validate_texture_range(&desc, 0, 0, None).is_none());

        let rect = validate_texture_range(&desc, 0, 1, Some(RectSize::new(8, 8, 24, 16))).unwrap();
        assert_eq!((rect.width, rect.height), (16, 8));
        assert!(validate_texture_range(&desc, 0, 1, Some(RectSize::new(0, 0, 65, 1))).is_none());
    }
}
