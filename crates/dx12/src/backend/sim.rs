//! A software GPU that executes recorded command lists against CPU memory.
//!
//! Work submitted to a [`SimDevice`] queue runs as soon as it is submitted unless the
//! device is held. Held work stays pending until [`SimDevice::pump`],
//! [`SimDevice::advance`] or [`SimDevice::resume`], which lets callers observe the window
//! between submission and completion that a real GPU opens.
//!
//! Placed resources get their own storage; aliasing inside a heap is not modelled.

use core::{
    any::Any,
    mem,
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
    time::Duration,
};
use std::{collections::VecDeque, sync::Arc, time::Instant};

use anyhow::{Context, bail, ensure};
use ff_common::{Format, PointSize, RectSize, Rotation, math::align_up};
use parking_lot::{Condvar, Mutex};
use raw_window_handle::RawWindowHandle;
use tracing::{debug, trace, warn};

use super::{
    AllocationInfo, ClearValue, CommandAllocatorBackend, CommandListBackend,
    DEFAULT_RESOURCE_PLACEMENT_ALIGNMENT, DeviceBackend, FenceBackend, HeapBackend, HeapKind,
    PresentStatus, QueueBackend, QueueKind, ResourceBackend, ResourceDesc, ResourceFlags,
    ResourceStates, SwapChainBackend, SwapChainDesc, TextureFootprint,
};
use crate::error::Error;

/// Counters of everything the simulated device was asked to do.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SimStats {
    pub allocators_created: usize,
    pub command_lists_created: usize,
    pub fences_created: usize,
    pub heaps_created: usize,
    pub resources_created: usize,
    pub lists_executed: usize,
    pub barriers: usize,
    /// Barriers whose `before` state did not match the state the GPU had.
    pub barrier_mismatches: usize,
    /// Allocator resets while lists recorded into them were still pending.
    pub allocator_reset_violations: usize,
    pub copy_errors: usize,
    pub presents: usize,
    pub resets: usize,
}

#[derive(Clone)]
pub struct SimDevice {
    shared: Arc<Shared>,
}

struct Shared {
    state: Mutex<State>,
    progress: Condvar,
    removed: AtomicBool,
    next_id: AtomicU64,
}

#[derive(Default)]
struct State {
    held: bool,
    queues: Vec<QueueWork>,
    stats: SimStats,
}

struct QueueWork {
    id: u64,
    kind: QueueKind,
    pending: VecDeque<Work>,
}

enum Work {
    Execute { allocator: u64, ops: Vec<Op> },
    Signal { fence: Arc<FenceCell>, value: u64 },
    Wait { fence: Arc<FenceCell>, value: u64 },
}

#[derive(Default)]
struct FenceCell {
    value: AtomicU64,
}

impl FenceCell {
    fn get(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }
}

impl State {
    /// Runs pending work on queues of `kind` (or all queues) until every queue is empty
    /// or blocked on a wait, spending at most `budget` work items.
    fn pump(&mut self, kind: Option<QueueKind>, budget: &mut usize) -> usize {
        let mut ran = 0;
        loop {
            let mut progressed = false;
            for queue in self
                .queues
                .iter_mut()
                .filter(|queue| kind.is_none_or(|kind| kind == queue.kind))
            {
                while *budget > 0 {
                    match queue.pending.front() {
                        Some(Work::Wait { fence, value }) if fence.get() < *value => break,
                        None => break,
                        _ => {}
                    }

                    let Some(work) = queue.pending.pop_front() else {
                        break;
                    };
                    *budget -= 1;
                    ran += 1;
                    progressed = true;
                    run_work(&mut self.stats, work);
                }
            }

            if !progressed || *budget == 0 {
                return ran;
            }
        }
    }

    fn pump_all(&mut self) -> usize {
        self.pump(None, &mut usize::MAX)
    }

    fn allocator_pending(&self, allocator: u64) -> bool {
        self.queues.iter().any(|queue| {
            queue.pending.iter().any(|work| match work {
                Work::Execute { allocator: id, .. } => *id == allocator,
                _ => false,
            })
        })
    }
}

fn run_work(stats: &mut SimStats, work: Work) {
    match work {
        Work::Execute { ops, .. } => {
            for op in ops {
                op.run(stats);
            }
        }
        Work::Signal { fence, value } => {
            fence.value.store(value, Ordering::Release);
        }
        Work::Wait { .. } => {}
    }
}

impl Shared {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn ensure_alive(&self) -> anyhow::Result<()> {
        if self.removed.load(Ordering::Acquire) {
            return Err(Error::DeviceLost.into());
        }

        Ok(())
    }

    fn submit(&self, queue: u64, work: impl IntoIterator<Item = Work>) {
        let mut state = self.state.lock();
        if let Some(queue) = state.queues.iter_mut().find(|q| q.id == queue) {
            queue.pending.extend(work);
        }

        if !state.held {
            state.pump_all();
        }
        drop(state);

        self.progress.notify_all();
    }
}

impl SimDevice {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                progress: Condvar::new(),
                removed: AtomicBool::new(false),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    pub fn stats(&self) -> SimStats {
        self.shared.state.lock().stats
    }

    /// Stops executing submitted work until resumed.
    pub fn hold(&self) {
        self.shared.state.lock().held = true;
    }

    pub fn resume(&self) {
        {
            let mut state = self.shared.state.lock();
            state.held = false;
            state.pump_all();
        }
        self.shared.progress.notify_all();
    }

    /// Runs everything that can run, even while held. Returns whether anything ran.
    pub fn pump(&self) -> bool {
        let ran = self.shared.state.lock().pump_all();
        self.shared.progress.notify_all();
        ran > 0
    }

    /// Runs at most `count` work items on queues of `kind`. Returns how many ran.
    pub fn advance(&self, kind: QueueKind, count: usize) -> usize {
        let mut budget = count;
        let ran = self.shared.state.lock().pump(Some(kind), &mut budget);
        self.shared.progress.notify_all();
        ran
    }

    pub fn pending_work(&self, kind: QueueKind) -> usize {
        self.shared
            .state
            .lock()
            .queues
            .iter()
            .filter(|queue| queue.kind == kind)
            .map(|queue| queue.pending.len())
            .sum()
    }

    /// Simulates device removal. Pending work is lost, fences report `u64::MAX` and
    /// waits fail with [`Error::DeviceLost`] until [`DeviceBackend::reset`].
    pub fn remove_device(&self) {
        warn!("simulated device removed");
        self.shared.removed.store(true, Ordering::Release);
        {
            let mut state = self.shared.state.lock();
            for queue in &mut state.queues {
                queue.pending.clear();
            }
        }
        self.shared.progress.notify_all();
    }
}

impl Default for SimDevice {
    fn default() -> Self {
        Self::new()
    }
}

fn sim_resource(resource: &dyn ResourceBackend) -> anyhow::Result<Arc<ResourceData>> {
    resource
        .as_any()
        .downcast_ref::<SimResource>()
        .map(|resource| resource.data.clone())
        .context("resource was not created by the simulated device")
}

fn sim_heap(heap: &dyn HeapBackend) -> anyhow::Result<Arc<HeapData>> {
    heap.as_any()
        .downcast_ref::<SimHeap>()
        .map(|heap| heap.data.clone())
        .context("heap was not created by the simulated device")
}

fn sim_fence(fence: &dyn FenceBackend) -> anyhow::Result<Arc<FenceCell>> {
    fence
        .as_any()
        .downcast_ref::<SimFence>()
        .map(|fence| fence.cell.clone())
        .context("fence was not created by the simulated device")
}

fn sim_allocator(allocator: &dyn CommandAllocatorBackend) -> anyhow::Result<u64> {
    allocator
        .as_any()
        .downcast_ref::<SimCommandAllocator>()
        .map(|allocator| allocator.id)
        .context("command allocator was not created by the simulated device")
}

impl DeviceBackend for SimDevice {
    fn name(&self) -> &str {
        "simulated device"
    }

    fn is_removed(&self) -> bool {
        self.shared.removed.load(Ordering::Acquire)
    }

    fn reset(&self) -> anyhow::Result<()> {
        let mut state = self.shared.state.lock();
        for queue in &mut state.queues {
            queue.pending.clear();
        }
        state.stats.resets += 1;
        self.shared.removed.store(false, Ordering::Release);
        drop(state);

        debug!("simulated device reset");
        self.shared.progress.notify_all();
        Ok(())
    }

    fn create_queue(&self, kind: QueueKind) -> anyhow::Result<Box<dyn QueueBackend>> {
        self.shared.ensure_alive()?;

        let id = self.shared.next_id();
        self.shared.state.lock().queues.push(QueueWork {
            id,
            kind,
            pending: VecDeque::new(),
        });

        Ok(Box::new(SimQueue {
            id,
            kind,
            shared: self.shared.clone(),
        }))
    }

    fn create_fence(&self, initial_value: u64) -> anyhow::Result<Box<dyn FenceBackend>> {
        self.shared.ensure_alive()?;
        self.shared.state.lock().stats.fences_created += 1;

        Ok(Box::new(SimFence {
            cell: Arc::new(FenceCell {
                value: AtomicU64::new(initial_value),
            }),
            shared: self.shared.clone(),
        }))
    }

    fn create_command_allocator(
        &self,
        kind: QueueKind,
    ) -> anyhow::Result<Box<dyn CommandAllocatorBackend>> {
        self.shared.ensure_alive()?;
        self.shared.state.lock().stats.allocators_created += 1;

        Ok(Box::new(SimCommandAllocator {
            id: self.shared.next_id(),
            kind,
            shared: self.shared.clone(),
        }))
    }

    fn create_command_list(
        &self,
        kind: QueueKind,
        allocator: &dyn CommandAllocatorBackend,
    ) -> anyhow::Result<Box<dyn CommandListBackend>> {
        self.shared.ensure_alive()?;
        let allocator = sim_allocator(allocator)?;
        self.shared.state.lock().stats.command_lists_created += 1;

        Ok(Box::new(SimCommandList {
            kind,
            allocator,
            open: true,
            ops: Mutex::new(Vec::new()),
            error: None,
        }))
    }

    fn create_heap(&self, kind: HeapKind, size: u64) -> anyhow::Result<Box<dyn HeapBackend>> {
        self.shared.ensure_alive()?;
        ensure!(size > 0, "cannot create an empty heap");
        self.shared.state.lock().stats.heaps_created += 1;

        let id = self.shared.next_id();
        let bytes = if kind.cpu_visible() {
            vec![0; size as usize]
        } else {
            Vec::new()
        };

        Ok(Box::new(SimHeap {
            data: Arc::new(HeapData {
                kind,
                size,
                base_address: id << 32,
                bytes: Mutex::new(bytes),
            }),
        }))
    }

    fn allocation_info(&self, desc: &ResourceDesc) -> AllocationInfo {
        let size = if desc.is_buffer() {
            desc.width
        } else {
            (0..desc.subresource_count())
                .map(|sub| {
                    let size = desc.subresource_size(sub);
                    desc.format
                        .compute_pitch(size.x, size.y)
                        .map_or(0, |(_, slice)| slice as u64)
                })
                .sum()
        };

        AllocationInfo {
            size: align_up(size, DEFAULT_RESOURCE_PLACEMENT_ALIGNMENT),
            alignment: DEFAULT_RESOURCE_PLACEMENT_ALIGNMENT,
        }
    }

    fn create_committed_resource(
        &self,
        desc: &ResourceDesc,
        state: ResourceStates,
        _clear_value: Option<&ClearValue>,
    ) -> anyhow::Result<Arc<dyn ResourceBackend>> {
        self.shared.ensure_alive()?;
        self.create_resource(desc, state)
    }

    fn create_placed_resource(
        &self,
        heap: &dyn HeapBackend,
        offset: u64,
        desc: &ResourceDesc,
        state: ResourceStates,
        _clear_value: Option<&ClearValue>,
    ) -> anyhow::Result<Arc<dyn ResourceBackend>> {
        self.shared.ensure_alive()?;

        let heap = sim_heap(heap)?;
        let expected = if desc.is_buffer() {
            HeapKind::Buffers
        } else {
            HeapKind::Textures
        };
        ensure!(
            heap.kind == expected,
            "cannot place {:?} in a {:?} heap",
            desc.dimension,
            heap.kind
        );

        let info = self.allocation_info(desc);
        ensure!(
            offset % info.alignment == 0 && offset + info.size <= heap.size,
            "placement at {offset} does not fit {} bytes in a {} byte heap",
            info.size,
            heap.size
        );

        self.create_resource(desc, state)
    }

    fn create_swap_chain(
        &self,
        _queue: &dyn QueueBackend,
        _window: RawWindowHandle,
        desc: &SwapChainDesc,
    ) -> anyhow::Result<Box<dyn SwapChainBackend>> {
        self.shared.ensure_alive()?;
        ensure!(desc.buffer_count >= 2, "a swap chain needs at least two buffers");

        let buffers =
            self.create_back_buffers(desc.format, desc.width, desc.height, desc.buffer_count)?;

        Ok(Box::new(SimSwapChain {
            device: self.clone(),
            format: desc.format,
            buffer_count: desc.buffer_count,
            state: Mutex::new(SwapChainState {
                width: desc.width,
                height: desc.height,
                buffers,
                index: 0,
                full_screen: false,
                rotation: Rotation::Rotate0,
            }),
        }))
    }
}

impl SimDevice {
    fn create_resource(
        &self,
        desc: &ResourceDesc,
        state: ResourceStates,
    ) -> anyhow::Result<Arc<dyn ResourceBackend>> {
        ensure!(desc.validate(), "invalid resource description {desc:?}");
        Ok(Arc::new(SimResource {
            data: self.resource_data(desc, state)?,
        }))
    }

    fn resource_data(
        &self,
        desc: &ResourceDesc,
        state: ResourceStates,
    ) -> anyhow::Result<Arc<ResourceData>> {
        let subresources = if desc.is_buffer() {
            vec![vec![0; desc.width as usize]]
        } else {
            (0..desc.subresource_count())
                .map(|sub| {
                    let size = desc.subresource_size(sub);
                    let (_, slice) = desc.format.compute_pitch(size.x, size.y)?;
                    Ok(vec![0; slice])
                })
                .collect::<anyhow::Result<_>>()?
        };

        let id = self.shared.next_id();
        self.shared.state.lock().stats.resources_created += 1;
        trace!(id, ?desc, "simulated resource created");

        Ok(Arc::new(ResourceData {
            id,
            desc: *desc,
            gpu_address: desc.is_buffer().then_some(id << 32),
            state: Mutex::new(state),
            subresources: Mutex::new(subresources),
        }))
    }

    fn create_back_buffers(
        &self,
        format: Format,
        width: u32,
        height: u32,
        count: usize,
    ) -> anyhow::Result<Vec<Arc<ResourceData>>> {
        let desc = ResourceDesc::texture_2d(format, width.max(1) as u64, height.max(1), 1, 1)
            .with_flags(ResourceFlags::ALLOW_RENDER_TARGET);

        (0..count)
            .map(|_| self.resource_data(&desc, ResourceStates::PRESENT))
            .collect()
    }
}

struct SimQueue {
    id: u64,
    kind: QueueKind,
    shared: Arc<Shared>,
}

impl Drop for SimQueue {
    fn drop(&mut self) {
        self.shared.state.lock().queues.retain(|queue| queue.id != self.id);
    }
}

impl QueueBackend for SimQueue {
    fn kind(&self) -> QueueKind {
        self.kind
    }

    fn execute(&self, lists: &[&dyn CommandListBackend]) -> anyhow::Result<()> {
        let mut work = Vec::with_capacity(lists.len());
        for list in lists {
            let list = list
                .as_any()
                .downcast_ref::<SimCommandList>()
                .context("command list was not created by the simulated device")?;
            ensure!(!list.open, "command list executed while still open");
            ensure!(
                list.kind == self.kind,
                "{:?} command list executed on a {:?} queue",
                list.kind,
                self.kind
            );

            work.push(Work::Execute {
                allocator: list.allocator,
                ops: mem::take(&mut *list.ops.lock()),
            });
        }

        // a removed device silently drops submissions, as the native API does
        if self.shared.removed.load(Ordering::Acquire) {
            return Ok(());
        }

        self.shared.state.lock().stats.lists_executed += work.len();
        self.shared.submit(self.id, work);
        Ok(())
    }

    fn signal(&self, fence: &dyn FenceBackend, value: u64) -> anyhow::Result<()> {
        self.shared.ensure_alive()?;
        let fence = sim_fence(fence)?;
        self.shared.submit(self.id, [Work::Signal { fence, value }]);
        Ok(())
    }

    fn wait(&self, fence: &dyn FenceBackend, value: u64) -> anyhow::Result<()> {
        self.shared.ensure_alive()?;
        let fence = sim_fence(fence)?;
        self.shared.submit(self.id, [Work::Wait { fence, value }]);
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct SimFence {
    cell: Arc<FenceCell>,
    shared: Arc<Shared>,
}

impl FenceBackend for SimFence {
    fn completed_value(&self) -> u64 {
        if self.shared.removed.load(Ordering::Acquire) {
            return u64::MAX;
        }

        self.cell.get()
    }

    fn wait(&self, value: u64, timeout: Option<Duration>) -> anyhow::Result<bool> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);

        let mut state = self.shared.state.lock();
        loop {
            self.shared.ensure_alive()?;
            if self.cell.get() >= value {
                return Ok(true);
            }

            match deadline {
                Some(deadline) => {
                    if self
                        .shared
                        .progress
                        .wait_until(&mut state, deadline)
                        .timed_out()
                    {
                        self.shared.ensure_alive()?;
                        return Ok(self.cell.get() >= value);
                    }
                }
                None => self.shared.progress.wait(&mut state),
            }
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct SimCommandAllocator {
    id: u64,
    kind: QueueKind,
    shared: Arc<Shared>,
}

impl CommandAllocatorBackend for SimCommandAllocator {
    fn reset(&mut self) -> anyhow::Result<()> {
        let mut state = self.shared.state.lock();
        if state.allocator_pending(self.id) {
            state.stats.allocator_reset_violations += 1;
            bail!(
                "{:?} command allocator {} reset while its lists are executing",
                self.kind,
                self.id
            );
        }

        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct SimCommandList {
    kind: QueueKind,
    allocator: u64,
    open: bool,
    ops: Mutex<Vec<Op>>,
    error: Option<String>,
}

impl SimCommandList {
    fn record(&mut self, op: impl FnOnce() -> anyhow::Result<Op>) {
        if self.error.is_some() {
            return;
        }

        if !self.open {
            self.error = Some("recorded into a closed command list".to_owned());
            return;
        }

        match op() {
            Ok(op) => self.ops.get_mut().push(op),
            Err(err) => self.error = Some(err.to_string()),
        }
    }
}

impl CommandListBackend for SimCommandList {
    fn reset(&mut self, allocator: &dyn CommandAllocatorBackend) -> anyhow::Result<()> {
        ensure!(!self.open, "command list reset while still recording");

        self.allocator = sim_allocator(allocator)?;
        self.ops.get_mut().clear();
        self.error = None;
        self.open = true;
        Ok(())
    }

    fn close(&mut self) -> anyhow::Result<()> {
        ensure!(self.open, "command list closed twice");

        self.open = false;
        if let Some(err) = self.error.take() {
            bail!(err);
        }

        Ok(())
    }

    fn barrier(
        &mut self,
        resource: &dyn ResourceBackend,
        before: ResourceStates,
        after: ResourceStates,
    ) {
        self.record(|| {
            Ok(Op::Barrier {
                resource: sim_resource(resource)?,
                before,
                after,
            })
        });
    }

    fn aliasing_barrier(
        &mut self,
        _before: Option<&dyn ResourceBackend>,
        after: &dyn ResourceBackend,
    ) {
        self.record(|| {
            sim_resource(after)?;
            Ok(Op::Aliasing)
        });
    }

    fn copy_resource(&mut self, dst: &dyn ResourceBackend, src: &dyn ResourceBackend) {
        self.record(|| {
            Ok(Op::CopyResource {
                dst: sim_resource(dst)?,
                src: sim_resource(src)?,
            })
        });
    }

    fn copy_buffer_from_heap(
        &mut self,
        dst: &dyn ResourceBackend,
        dst_offset: u64,
        src: &dyn HeapBackend,
        src_offset: u64,
        size: u64,
    ) {
        self.record(|| {
            Ok(Op::BufferFromHeap {
                dst: sim_resource(dst)?,
                dst_offset,
                heap: sim_heap(src)?,
                src_offset,
                size,
            })
        });
    }

    fn copy_buffer_to_heap(
        &mut self,
        dst: &dyn HeapBackend,
        dst_offset: u64,
        src: &dyn ResourceBackend,
        src_offset: u64,
        size: u64,
    ) {
        self.record(|| {
            Ok(Op::BufferToHeap {
                heap: sim_heap(dst)?,
                dst_offset,
                src: sim_resource(src)?,
                src_offset,
                size,
            })
        });
    }

    fn copy_texture_from_heap(
        &mut self,
        dst: &dyn ResourceBackend,
        sub_index: u32,
        pos: PointSize,
        src: &dyn HeapBackend,
        footprint: &TextureFootprint,
    ) {
        self.record(|| {
            Ok(Op::TextureFromHeap {
                dst: sim_resource(dst)?,
                sub: sub_index as usize,
                pos,
                heap: sim_heap(src)?,
                footprint: *footprint,
            })
        });
    }

    fn copy_texture_to_heap(
        &mut self,
        dst: &dyn HeapBackend,
        footprint: &TextureFootprint,
        src: &dyn ResourceBackend,
        sub_index: u32,
        rect: RectSize,
    ) {
        self.record(|| {
            Ok(Op::TextureToHeap {
                heap: sim_heap(dst)?,
                footprint: *footprint,
                src: sim_resource(src)?,
                sub: sub_index as usize,
                rect,
            })
        });
    }

    fn clear_render_target(&mut self, target: &dyn ResourceBackend, color: [f32; 4]) {
        self.record(|| {
            Ok(Op::Clear {
                target: sim_resource(target)?,
                color,
            })
        });
    }

    fn discard_resource(&mut self, resource: &dyn ResourceBackend) {
        self.record(|| {
            sim_resource(resource)?;
            Ok(Op::Discard)
        });
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct HeapData {
    kind: HeapKind,
    size: u64,
    base_address: u64,
    bytes: Mutex<Vec<u8>>,
}

struct SimHeap {
    data: Arc<HeapData>,
}

impl HeapBackend for SimHeap {
    fn kind(&self) -> HeapKind {
        self.data.kind
    }

    fn size(&self) -> u64 {
        self.data.size
    }

    fn write(&self, offset: u64, data: &[u8]) -> anyhow::Result<()> {
        ensure!(self.data.kind.cpu_visible(), "{:?} heap is not CPU visible", self.data.kind);

        let start = offset as usize;
        self.data
            .bytes
            .lock()
            .get_mut(start..start + data.len())
            .context("write past the end of the heap")?
            .copy_from_slice(data);
        Ok(())
    }

    fn read(&self, offset: u64, out: &mut [u8]) -> anyhow::Result<()> {
        ensure!(self.data.kind.cpu_visible(), "{:?} heap is not CPU visible", self.data.kind);

        let start = offset as usize;
        out.copy_from_slice(
            self.data
                .bytes
                .lock()
                .get(start..start + out.len())
                .context("read past the end of the heap")?,
        );
        Ok(())
    }

    fn gpu_address(&self, offset: u64) -> Option<u64> {
        Some(self.data.base_address + offset)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct ResourceData {
    id: u64,
    desc: ResourceDesc,
    gpu_address: Option<u64>,
    /// State the simulated GPU believes the resource is in.
    state: Mutex<ResourceStates>,
    /// Tightly packed storage per subresource.
    subresources: Mutex<Vec<Vec<u8>>>,
}

struct SimResource {
    data: Arc<ResourceData>,
}

impl ResourceBackend for SimResource {
    fn desc(&self) -> &ResourceDesc {
        &self.data.desc
    }

    fn gpu_address(&self) -> Option<u64> {
        self.data.gpu_address
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Clone)]
enum Op {
    Barrier {
        resource: Arc<ResourceData>,
        before: ResourceStates,
        after: ResourceStates,
    },
    Aliasing,
    CopyResource {
        dst: Arc<ResourceData>,
        src: Arc<ResourceData>,
    },
    BufferFromHeap {
        dst: Arc<ResourceData>,
        dst_offset: u64,
        heap: Arc<HeapData>,
        src_offset: u64,
        size: u64,
    },
    BufferToHeap {
        heap: Arc<HeapData>,
        dst_offset: u64,
        src: Arc<ResourceData>,
        src_offset: u64,
        size: u64,
    },
    TextureFromHeap {
        dst: Arc<ResourceData>,
        sub: usize,
        pos: PointSize,
        heap: Arc<HeapData>,
        footprint: TextureFootprint,
    },
    TextureToHeap {
        heap: Arc<HeapData>,
        footprint: TextureFootprint,
        src: Arc<ResourceData>,
        sub: usize,
        rect: RectSize,
    },
    Clear {
        target: Arc<ResourceData>,
        color: [f32; 4],
    },
    Discard,
}

impl Op {
    fn run(self, stats: &mut SimStats) {
        let result = match self {
            Op::Barrier {
                resource,
                before,
                after,
            } => {
                stats.barriers += 1;
                let mut state = resource.state.lock();
                if *state != before {
                    stats.barrier_mismatches += 1;
                    warn!(
                        id = resource.id,
                        actual = ?*state,
                        ?before,
                        ?after,
                        "barrier does not match resource state"
                    );
                }
                *state = after;
                Ok(())
            }
            Op::Aliasing | Op::Discard => Ok(()),
            Op::CopyResource { dst, src } => copy_resource(&dst, &src),
            Op::BufferFromHeap {
                dst,
                dst_offset,
                heap,
                src_offset,
                size,
            } => copy_bytes(
                &heap.bytes.lock(),
                src_offset,
                &mut dst.subresources.lock()[0],
                dst_offset,
                size,
            ),
            Op::BufferToHeap {
                heap,
                dst_offset,
                src,
                src_offset,
                size,
            } => copy_bytes(
                &src.subresources.lock()[0],
                src_offset,
                &mut heap.bytes.lock(),
                dst_offset,
                size,
            ),
            Op::TextureFromHeap {
                dst,
                sub,
                pos,
                heap,
                footprint,
            } => texture_from_heap(&dst, sub, pos, &heap, &footprint),
            Op::TextureToHeap {
                heap,
                footprint,
                src,
                sub,
                rect,
            } => texture_to_heap(&heap, &footprint, &src, sub, rect),
            Op::Clear { target, color } => {
                let pixel = encode_color(target.desc.format, color);
                if !pixel.is_empty() {
                    for sub in target.subresources.lock().iter_mut() {
                        for chunk in sub.chunks_exact_mut(pixel.len()) {
                            chunk.copy_from_slice(&pixel);
                        }
                    }
                }
                Ok(())
            }
        };

        if let Err(err) = result {
            stats.copy_errors += 1;
            warn!(%err, "simulated copy failed");
        }
    }
}

fn copy_bytes(
    src: &[u8],
    src_offset: u64,
    dst: &mut [u8],
    dst_offset: u64,
    size: u64,
) -> anyhow::Result<()> {
    let (src_offset, dst_offset, size) = (src_offset as usize, dst_offset as usize, size as usize);
    dst.get_mut(dst_offset..dst_offset + size)
        .context("copy destination out of bounds")?
        .copy_from_slice(
            src.get(src_offset..src_offset + size)
                .context("copy source out of bounds")?,
        );
    Ok(())
}

fn copy_resource(dst: &ResourceData, src: &ResourceData) -> anyhow::Result<()> {
    ensure!(dst.id != src.id, "cannot copy a resource onto itself");
    ensure!(
        dst.desc.dimension == src.desc.dimension
            && dst.desc.width == src.desc.width
            && dst.desc.height == src.desc.height
            && dst.desc.subresource_count() == src.desc.subresource_count(),
        "copy between resources of different shapes"
    );

    let data = src.subresources.lock().clone();
    *dst.subresources.lock() = data;
    Ok(())
}

/// Byte offset of the block at `(x, y)` pixels in a tightly packed subresource.
fn texel_offset(format: Format, width: usize, x: usize, y: usize) -> usize {
    let dim = format.block_dim();
    let bpb = format.bytes_per_block();
    (y / dim) * format.row_blocks(width) * bpb + (x / dim) * bpb
}

fn texture_from_heap(
    dst: &ResourceData,
    sub: usize,
    pos: PointSize,
    heap: &HeapData,
    footprint: &TextureFootprint,
) -> anyhow::Result<()> {
    let format = footprint.format;
    ensure!(format == dst.desc.format, "footprint format does not match texture");

    let size = dst.desc.subresource_size(sub);
    let (width, height) = (footprint.width as usize, footprint.height as usize);
    ensure!(
        pos.x + width <= size.x && pos.y + height <= size.y,
        "copy of {width}x{height} at {pos:?} is outside a {}x{} subresource",
        size.x,
        size.y
    );

    let bytes = heap.bytes.lock();
    let mut subresources = dst.subresources.lock();
    let image = subresources.get_mut(sub).context("subresource out of range")?;

    let row_bytes = format.row_blocks(width) * format.bytes_per_block();
    let dim = format.block_dim();
    for row in 0..format.compute_scanlines(height) {
        let src_start = footprint.offset as usize + row * footprint.row_pitch as usize;
        let dst_start = texel_offset(format, size.x, pos.x, pos.y + row * dim);
        image
            .get_mut(dst_start..dst_start + row_bytes)
            .context("texture row out of bounds")?
            .copy_from_slice(
                bytes
                    .get(src_start..src_start + row_bytes)
                    .context("staging row out of bounds")?,
            );
    }

    Ok(())
}

fn texture_to_heap(
    heap: &HeapData,
    footprint: &TextureFootprint,
    src: &ResourceData,
    sub: usize,
    rect: RectSize,
) -> anyhow::Result<()> {
    let format = src.desc.format;
    ensure!(footprint.format == format, "footprint format does not match texture");

    let size = src.desc.subresource_size(sub);
    ensure!(
        rect.right <= size.x && rect.bottom <= size.y,
        "{rect:?} is outside a {}x{} subresource",
        size.x,
        size.y
    );

    let subresources = src.subresources.lock();
    let image = subresources.get(sub).context("subresource out of range")?;
    let mut bytes = heap.bytes.lock();

    let row_bytes = format.row_blocks(rect.width()) * format.bytes_per_block();
    let dim = format.block_dim();
    for row in 0..format.compute_scanlines(rect.height()) {
        let src_start = texel_offset(format, size.x, rect.left, rect.top + row * dim);
        let dst_start = footprint.offset as usize + row * footprint.row_pitch as usize;
        bytes
            .get_mut(dst_start..dst_start + row_bytes)
            .context("staging row out of bounds")?
            .copy_from_slice(
                image
                    .get(src_start..src_start + row_bytes)
                    .context("texture row out of bounds")?,
            );
    }

    Ok(())
}

fn encode_color(format: Format, color: [f32; 4]) -> Vec<u8> {
    let unorm = |value: f32| (value.clamp(0.0, 1.0) * 255.0).round() as u8;
    let [r, g, b, a] = color;

    match format {
        Format::R8Unorm => vec![unorm(r)],
        Format::R8G8Unorm => vec![unorm(r), unorm(g)],
        Format::R8G8B8A8Unorm | Format::R8G8B8A8UnormSrgb => {
            vec![unorm(r), unorm(g), unorm(b), unorm(a)]
        }
        Format::B8G8R8A8Unorm | Format::B8G8R8A8UnormSrgb => {
            vec![unorm(b), unorm(g), unorm(r), unorm(a)]
        }
        Format::R32Float => r.to_le_bytes().to_vec(),
        Format::R32Uint => (r as u32).to_le_bytes().to_vec(),
        Format::R32G32B32A32Float => color.iter().flat_map(|c| c.to_le_bytes()).collect(),
        _ => vec![0; format.bytes_per_block()],
    }
}

struct SimSwapChain {
    device: SimDevice,
    format: Format,
    buffer_count: usize,
    state: Mutex<SwapChainState>,
}

struct SwapChainState {
    width: u32,
    height: u32,
    buffers: Vec<Arc<ResourceData>>,
    index: usize,
    full_screen: bool,
    rotation: Rotation,
}

impl SwapChainBackend for SimSwapChain {
    fn buffer_count(&self) -> usize {
        self.buffer_count
    }

    fn current_back_buffer_index(&self) -> usize {
        self.state.lock().index
    }

    fn buffer(&self, index: usize) -> anyhow::Result<Arc<dyn ResourceBackend>> {
        let data = self
            .state
            .lock()
            .buffers
            .get(index)
            .cloned()
            .context("back buffer index out of range")?;

        Ok(Arc::new(SimResource { data }))
    }

    fn present(&self, _sync_interval: u32) -> anyhow::Result<PresentStatus> {
        if self.device.is_removed() {
            return Ok(PresentStatus::DeviceLost);
        }

        self.device.shared.state.lock().stats.presents += 1;
        let mut state = self.state.lock();
        state.index = (state.index + 1) % self.buffer_count;
        Ok(PresentStatus::Presented)
    }

    fn resize_buffers(&self, width: u32, height: u32) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        for (i, buffer) in state.buffers.iter().enumerate() {
            ensure!(
                Arc::strong_count(buffer) == 1,
                "back buffer {i} is still referenced during resize"
            );
        }

        state.buffers = self
            .device
            .create_back_buffers(self.format, width, height, self.buffer_count)?;
        state.width = width;
        state.height = height;
        state.index = 0;
        trace!(width, height, "simulated swap chain resized");
        Ok(())
    }

    fn set_rotation(&self, rotation: Rotation) -> anyhow::Result<()> {
        self.state.lock().rotation = rotation;
        Ok(())
    }

    fn wait_frame_latency(&self, _timeout: Duration) -> anyhow::Result<bool> {
        Ok(true)
    }

    fn full_screen(&self) -> anyhow::Result<bool> {
        Ok(self.state.lock().full_screen)
    }

    fn set_full_screen(&self, value: bool) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        state.full_screen = value;
        trace!(
            value,
            width = state.width,
            height = state.height,
            rotation = ?state.rotation,
            "simulated full screen toggled"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list_with(
        device: &SimDevice,
        kind: QueueKind,
    ) -> (Box<dyn CommandAllocatorBackend>, Box<dyn CommandListBackend>) {
        let allocator = device.create_command_allocator(kind).unwrap();
        let list = device.create_command_list(kind, allocator.as_ref()).unwrap();
        (allocator, list)
    }

    #[test]
    fn held_work_completes_on_pump() {
        let device = SimDevice::new();
        let queue = device.create_queue(QueueKind::Direct).unwrap();
        let fence = device.create_fence(0).unwrap();

        device.hold();
        queue.signal(fence.as_ref(), 1).unwrap();
        assert_eq!(fence.completed_value(), 0);
        assert!(!fence.wait(1, Some(Duration::from_millis(10))).unwrap());

        assert!(device.pump());
        assert_eq!(fence.completed_value(), 1);
        assert!(fence.wait(1, Some(Duration::ZERO)).unwrap());
    }

    #[test]
    fn queue_wait_blocks_until_other_queue_signals() {
        let device = SimDevice::new();
        let direct = device.create_queue(QueueKind::Direct).unwrap();
        let copy = device.create_queue(QueueKind::Copy).unwrap();
        let upload_done = device.create_fence(0).unwrap();
        let draw_done = device.create_fence(0).unwrap();

        device.hold();
        direct.wait(upload_done.as_ref(), 1).unwrap();
        direct.signal(draw_done.as_ref(), 1).unwrap();
        copy.signal(upload_done.as_ref(), 1).unwrap();

        assert_eq!(device.advance(QueueKind::Direct, 10), 0);
        assert_eq!(draw_done.completed_value(), 0);

        assert_eq!(device.advance(QueueKind::Copy, 10), 1);
        assert_eq!(device.advance(QueueKind::Direct, 10), 2);
        assert_eq!(draw_done.completed_value(), 1);
    }

    #[test]
    fn allocator_reset_while_pending_is_reported() {
        let device = SimDevice::new();
        let queue = device.create_queue(QueueKind::Direct).unwrap();
        let (mut allocator, mut list) = list_with(&device, QueueKind::Direct);

        device.hold();
        list.close().unwrap();
        queue.execute(&[list.as_ref()]).unwrap();

        assert!(allocator.reset().is_err());
        assert_eq!(device.stats().allocator_reset_violations, 1);

        device.resume();
        allocator.reset().unwrap();
    }

    #[test]
    fn buffer_copies_through_heaps() {
        let device = SimDevice::new();
        let queue = device.create_queue(QueueKind::Copy).unwrap();
        let upload = device.create_heap(HeapKind::Upload, 1024).unwrap();
        let readback = device.create_heap(HeapKind::Readback, 1024).unwrap();
        let buffer = device
            .create_committed_resource(&ResourceDesc::buffer(64), ResourceStates::COPY_DEST, None)
            .unwrap();

        upload.write(16, b"simulated").unwrap();

        let (_allocator, mut list) = list_with(&device, QueueKind::Copy);
        list.copy_buffer_from_heap(buffer.as_ref(), 4, upload.as_ref(), 16, 9);
        list.barrier(buffer.as_ref(), ResourceStates::COPY_DEST, ResourceStates::COPY_SOURCE);
        list.copy_buffer_to_heap(readback.as_ref(), 0, buffer.as_ref(), 4, 9);
        list.close().unwrap();
        queue.execute(&[list.as_ref()]).unwrap();

        let mut out = [0; 9];
        readback.read(0, &mut out).unwrap();
        assert_eq!(&out, b"simulated");
        assert_eq!(device.stats().barrier_mismatches, 0);
    }

    #[test]
    fn mismatched_barrier_is_counted() {
        let device = SimDevice::new();
        let queue = device.create_queue(QueueKind::Direct).unwrap();
        let buffer = device
            .create_committed_resource(&ResourceDesc::buffer(16), ResourceStates::COMMON, None)
            .unwrap();

        let (_allocator, mut list) = list_with(&device, QueueKind::Direct);
        list.barrier(buffer.as_ref(), ResourceStates::COPY_DEST, ResourceStates::COPY_SOURCE);
        list.close().unwrap();
        queue.execute(&[list.as_ref()]).unwrap();

        assert_eq!(device.stats().barrier_mismatches, 1);
    }

    #[test]
    fn removed_device_fails_waits() {
        let device = SimDevice::new();
        let fence = device.create_fence(0).unwrap();

        device.remove_device();
        assert_eq!(fence.completed_value(), u64::MAX);
        let err = fence.wait(1, None).unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::DeviceLost)));

        device.reset().unwrap();
        assert_eq!(fence.completed_value(), 0);
    }
}
