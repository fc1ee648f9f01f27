//! Sub-allocation of GPU heaps.
//!
//! [`RingAllocator`] serves transient upload and readback memory that is reclaimed in
//! submission order as fences complete. [`PersistentAllocator`] serves long-lived
//! resource placements from a first-fit free list and grows by whole heaps.

use core::time::Duration;
use std::{
    collections::{BTreeMap, VecDeque},
    sync::{Arc, Weak},
    time::Instant,
};

use ff_common::math::align_up;
use parking_lot::Mutex;
use tracing::{debug, error, trace};

use crate::{
    backend::{
        BUFFER_DATA_PLACEMENT_ALIGNMENT, DeviceBackend, HeapKind,
        TEXTURE_DATA_PLACEMENT_ALIGNMENT,
    },
    child::{ChildRegistration, DeviceChild, DeviceChildren, ResetPriority},
    fence::FenceValue,
    heap::Heap,
    mem_range::{MemRange, RangeHome, RangeInner},
};

pub struct RingAllocator {
    heap: Arc<Heap>,
    ranges: Mutex<VecDeque<RingRange>>,
    wait_timeout: Duration,
    _registration: ChildRegistration,
}

struct RingRange {
    start: u64,
    size: u64,
    fence_value: FenceValue,
    range: Weak<RangeInner>,
}

impl RingAllocator {
    pub(crate) fn new(
        device: &dyn DeviceBackend,
        children: &Arc<DeviceChildren>,
        kind: HeapKind,
        size: u64,
        wait_timeout: Duration,
    ) -> anyhow::Result<Arc<Self>> {
        let heap = Arc::new(Heap::new(device, kind, size)?);

        Ok(Arc::new_cyclic(|weak: &Weak<Self>| {
            let child: Weak<dyn DeviceChild> = weak.clone();
            Self {
                heap,
                ranges: Mutex::new(VecDeque::new()),
                wait_timeout,
                _registration: children.add(child, ResetPriority::ALLOCATOR),
            }
        }))
    }

    pub fn kind(&self) -> HeapKind {
        self.heap.kind()
    }

    pub fn size(&self) -> u64 {
        self.heap.size()
    }

    /// Ranges not yet reclaimed.
    pub fn pending_ranges(&self) -> usize {
        self.ranges.lock().len()
    }

    pub fn alloc_buffer(&self, size: u64, fence_value: FenceValue) -> Option<MemRange> {
        self.alloc_bytes(size, BUFFER_DATA_PLACEMENT_ALIGNMENT, fence_value)
    }

    pub fn alloc_texture(&self, size: u64, fence_value: FenceValue) -> Option<MemRange> {
        self.alloc_bytes(size, TEXTURE_DATA_PLACEMENT_ALIGNMENT, fence_value)
    }

    /// Allocates `size` bytes that stay reserved until `fence_value` completes and the
    /// returned range is dropped.
    ///
    /// Blocks up to the configured timeout when the ring is full. Returns `None` when
    /// the request can never fit, when the timeout runs out, or when the oldest range is
    /// waiting on `fence_value` itself, which would never complete.
    pub fn alloc_bytes(&self, size: u64, align: u64, fence_value: FenceValue) -> Option<MemRange> {
        let kind = self.heap.kind();
        if size == 0 || size > self.heap.size() {
            error!(?kind, size, ring = self.heap.size(), "ring allocation cannot fit");
            return None;
        }

        let deadline = Instant::now() + self.wait_timeout;
        loop {
            let blocker = {
                let mut ranges = self.ranges.lock();
                while ranges
                    .front()
                    .is_some_and(|range| {
                        range.range.strong_count() == 0 && range.fence_value.complete()
                    })
                {
                    ranges.pop_front();
                }

                if let Some(start) = find_space(&ranges, self.heap.size(), size, align.max(1)) {
                    let range = MemRange::new(self.heap.clone(), start, size, RangeHome::Ring);
                    ranges.push_back(RingRange {
                        start,
                        size,
                        fence_value,
                        range: range.downgrade(),
                    });
                    trace!(?kind, start, size, "ring range allocated");
                    return Some(range);
                }

                // no space means the ring is not empty
                let front = ranges.front()?;
                front.fence_value.clone()
            };

            if blocker.complete() {
                error!(?kind, size, "oldest ring range is still referenced");
                return None;
            }

            if let Some(fence) = fence_value.fence() {
                if blocker.on_fence(fence) && blocker.get() >= fence_value.get() {
                    error!(
                        ?kind,
                        size,
                        "ring is full of memory for commands that were not executed yet"
                    );
                    return None;
                }
            }

            debug!(?kind, size, ?blocker, "ring full, waiting for GPU");
            let remaining = deadline.saturating_duration_since(Instant::now());
            match blocker.wait(Some(remaining)) {
                Ok(true) => {}
                Ok(false) => {
                    error!(
                        ?kind,
                        size,
                        timeout = ?self.wait_timeout,
                        "timed out waiting for ring space"
                    );
                    return None;
                }
                Err(err) => {
                    error!(?kind, size, %err, "ring wait failed");
                    return None;
                }
            }
        }
    }
}

/// Start of a free span of `size` bytes after the newest range, wrapping to the
/// beginning of the heap when the tail is too short.
fn find_space(ranges: &VecDeque<RingRange>, heap_size: u64, size: u64, align: u64) -> Option<u64> {
    let (Some(front), Some(back)) = (ranges.front(), ranges.back()) else {
        return (size <= heap_size).then_some(0);
    };

    let tail = align_up(back.start + back.size, align);
    if back.start >= front.start {
        // used space is [front.start, tail)
        if tail + size <= heap_size {
            Some(tail)
        } else if size <= front.start {
            Some(0)
        } else {
            None
        }
    } else {
        // used space wraps around: [front.start, heap_size) and [0, tail)
        (tail + size <= front.start).then_some(tail)
    }
}

impl DeviceChild for RingAllocator {
    fn before_reset(&self) {
        self.ranges.lock().clear();
        self.heap.release();
    }

    fn reset(&self, device: &dyn DeviceBackend) -> anyhow::Result<()> {
        self.heap.recreate(device)
    }
}

pub struct PersistentAllocator {
    kind: HeapKind,
    heap_size: u64,
    max_heaps: usize,
    device: Arc<dyn DeviceBackend>,
    state: Arc<PersistentState>,
    _registration: ChildRegistration,
}

pub(crate) struct PersistentState {
    slots: Mutex<Vec<HeapSlot>>,
}

struct HeapSlot {
    heap: Arc<Heap>,
    /// Free spans keyed by start offset.
    free: BTreeMap<u64, u64>,
}

impl HeapSlot {
    fn new(heap: Arc<Heap>) -> Self {
        let free = BTreeMap::from([(0, heap.size())]);
        Self { heap, free }
    }

    fn take(&mut self, size: u64, align: u64) -> Option<u64> {
        let (span_start, span_size, start) = self.free.iter().find_map(|(&span_start, &span_size)| {
            let start = align_up(span_start, align);
            (start + size <= span_start + span_size).then_some((span_start, span_size, start))
        })?;

        self.free.remove(&span_start);
        if start > span_start {
            self.free.insert(span_start, start - span_start);
        }

        let end = start + size;
        let span_end = span_start + span_size;
        if end < span_end {
            self.free.insert(end, span_end - end);
        }

        Some(start)
    }

    fn give(&mut self, mut start: u64, mut size: u64) {
        if let Some((&prev_start, &prev_size)) = self.free.range(..start).next_back() {
            if prev_start + prev_size == start {
                self.free.remove(&prev_start);
                start = prev_start;
                size += prev_size;
            }
        }

        if let Some(next_size) = self.free.remove(&(start + size)) {
            size += next_size;
        }

        self.free.insert(start, size);
    }

    fn free_bytes(&self) -> u64 {
        self.free.values().sum()
    }
}

impl PersistentState {
    pub(crate) fn free(&self, heap_id: u64, start: u64, size: u64) {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.iter_mut().find(|slot| slot.heap.id() == heap_id) {
            slot.give(start, size);
            trace!(heap = heap_id, start, size, "persistent range freed");
        }
    }
}

impl PersistentAllocator {
    pub(crate) fn new(
        device: Arc<dyn DeviceBackend>,
        children: &Arc<DeviceChildren>,
        kind: HeapKind,
        heap_size: u64,
        max_heaps: usize,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let child: Weak<dyn DeviceChild> = weak.clone();
            Self {
                kind,
                heap_size,
                max_heaps,
                device,
                state: Arc::new(PersistentState {
                    slots: Mutex::new(Vec::new()),
                }),
                _registration: children.add(child, ResetPriority::ALLOCATOR),
            }
        })
    }

    pub fn kind(&self) -> HeapKind {
        self.kind
    }

    pub fn heap_size(&self) -> u64 {
        self.heap_size
    }

    pub fn heap_count(&self) -> usize {
        self.state.slots.lock().len()
    }

    pub fn free_bytes(&self) -> u64 {
        self.state.slots.lock().iter().map(HeapSlot::free_bytes).sum()
    }

    pub fn used_bytes(&self) -> u64 {
        let slots = self.state.slots.lock();
        slots.len() as u64 * self.heap_size - slots.iter().map(HeapSlot::free_bytes).sum::<u64>()
    }

    /// Allocates from the first heap with a fitting span, creating a heap when none has
    /// room. Returns `None` for requests larger than a heap or once `max_heaps` is hit.
    pub fn alloc_bytes(&self, size: u64, align: u64) -> Option<MemRange> {
        let kind = self.kind;
        if size == 0 || size > self.heap_size {
            error!(?kind, size, heap = self.heap_size, "allocation larger than a heap");
            return None;
        }

        let align = align.max(1);
        let mut slots = self.state.slots.lock();
        for slot in slots.iter_mut() {
            if let Some(start) = slot.take(size, align) {
                return Some(self.range(slot, start, size));
            }
        }

        if slots.len() >= self.max_heaps {
            error!(?kind, size, heaps = slots.len(), "out of heaps");
            return None;
        }

        let heap = match Heap::new(self.device.as_ref(), kind, self.heap_size) {
            Ok(heap) => Arc::new(heap),
            Err(err) => {
                error!(?kind, %err, "cannot grow allocator");
                return None;
            }
        };

        debug!(?kind, heaps = slots.len() + 1, "allocator grew");
        let mut slot = HeapSlot::new(heap);
        let start = slot.take(size, align)?;
        let range = self.range(&slot, start, size);
        slots.push(slot);
        Some(range)
    }

    fn range(&self, slot: &HeapSlot, start: u64, size: u64) -> MemRange {
        MemRange::new(
            slot.heap.clone(),
            start,
            size,
            RangeHome::Persistent(Arc::downgrade(&self.state)),
        )
    }
}

impl DeviceChild for PersistentAllocator {
    fn before_reset(&self) {
        for slot in self.state.slots.lock().iter() {
            slot.heap.release();
        }
    }

    fn reset(&self, device: &dyn DeviceBackend) -> anyhow::Result<()> {
        for slot in self.state.slots.lock().iter() {
            slot.heap.recreate(device)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::{QueueBackend, QueueKind, sim::SimDevice},
        fence::Fence,
    };

    struct Ring {
        device: SimDevice,
        _children: Arc<DeviceChildren>,
        queue: Box<dyn QueueBackend>,
        fence: Fence,
        ring: Arc<RingAllocator>,
    }

    fn ring(size: u64, timeout: Duration) -> Ring {
        let device = SimDevice::new();
        let children = Arc::new(DeviceChildren::default());
        let queue = device.create_queue(QueueKind::Copy).unwrap();
        let fence = Fence::new(&device, &children, QueueKind::Copy).unwrap();
        let ring = RingAllocator::new(&device, &children, HeapKind::Upload, size, timeout).unwrap();

        Ring {
            device,
            _children: children,
            queue,
            fence,
            ring,
        }
    }

    #[test]
    fn ring_wraps_after_oldest_completes() {
        let ring = ring(1024, Duration::from_millis(20));
        ring.device.hold();

        let a = ring.ring.alloc_bytes(400, 1, ring.fence.next_value()).unwrap();
        ring.fence.signal_on(ring.queue.as_ref()).unwrap();
        let b = ring.ring.alloc_bytes(400, 1, ring.fence.next_value()).unwrap();
        ring.fence.signal_on(ring.queue.as_ref()).unwrap();
        assert_eq!((a.start(), b.start()), (0, 400));
        drop((a, b));

        // the oldest range is still in flight
        assert!(ring.ring.alloc_bytes(400, 1, ring.fence.next_value()).is_none());

        ring.device.advance(QueueKind::Copy, 1);
        let c = ring.ring.alloc_bytes(400, 1, ring.fence.next_value()).unwrap();
        assert_eq!(c.start(), 0);
        assert_eq!(ring.ring.pending_ranges(), 2);

        // between the wrapped tail and the second range there is no room left
        assert!(ring.ring.alloc_bytes(100, 1, ring.fence.next_value()).is_none());
    }

    #[test]
    fn ring_waits_for_gpu_when_full() {
        let ring = ring(1024, Duration::from_secs(5));
        ring.device.hold();

        let first = ring.ring.alloc_bytes(1024, 1, ring.fence.next_value()).unwrap();
        ring.fence.signal_on(ring.queue.as_ref()).unwrap();
        drop(first);

        let device = ring.device.clone();
        let worker = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            device.resume();
        });

        let second = ring.ring.alloc_bytes(1024, 1, ring.fence.next_value()).unwrap();
        assert_eq!(second.start(), 0);
        worker.join().unwrap();
    }

    #[test]
    fn ring_refuses_to_wait_on_unsubmitted_fence() {
        let ring = ring(1024, Duration::from_secs(5));
        let pending = ring.fence.next_value();

        let _first = ring.ring.alloc_bytes(1000, 1, pending.clone()).unwrap();
        let started = Instant::now();
        assert!(ring.ring.alloc_bytes(100, 1, pending).is_none());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn ring_keeps_ranges_still_referenced() {
        let ring = ring(1024, Duration::from_millis(20));

        let held = ring.ring.alloc_bytes(1024, 1, FenceValue::default()).unwrap();
        assert!(ring.ring.alloc_bytes(512, 1, FenceValue::default()).is_none());

        drop(held);
        assert!(ring.ring.alloc_bytes(512, 1, FenceValue::default()).is_some());
    }

    #[test]
    fn ring_never_hands_out_memory_in_use() {
        let ring = ring(4096, Duration::ZERO);
        ring.device.hold();

        let mut seed = 0x2545_f491_u64;
        let mut next = move || {
            seed = seed.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
            seed >> 33
        };

        let mut handed_out: Vec<(u64, u64, FenceValue)> = Vec::new();
        let mut allocated = 0;
        for _ in 0..500 {
            let size = 64 + next() % 900;
            let fence_value = ring.fence.next_value();
            if let Some(range) = ring.ring.alloc_bytes(size, 256, fence_value.clone()) {
                for (start, end, value) in &handed_out {
                    if !value.complete() {
                        assert!(
                            range.end() <= *start || *end <= range.start(),
                            "range {range:?} overlaps {start}..{end} still in use"
                        );
                    }
                }

                handed_out.push((range.start(), range.end(), fence_value));
                ring.fence.signal_on(ring.queue.as_ref()).unwrap();
                allocated += 1;
            }

            // completes a random number of submissions out of step with allocation
            ring.device.advance(QueueKind::Copy, (next() % 3) as usize);
            handed_out.retain(|(_, _, value)| !value.complete());
        }

        assert!(allocated > 100);
    }

    #[test]
    fn ring_rejects_oversized() {
        let ring = ring(1024, Duration::from_millis(20));
        assert!(ring.ring.alloc_bytes(2048, 1, FenceValue::default()).is_none());
        assert!(ring.ring.alloc_bytes(0, 1, FenceValue::default()).is_none());
    }

    fn persistent(
        heap_size: u64,
        max_heaps: usize,
    ) -> (Arc<DeviceChildren>, Arc<PersistentAllocator>) {
        let children = Arc::new(DeviceChildren::default());
        let allocator = PersistentAllocator::new(
            Arc::new(SimDevice::new()),
            &children,
            HeapKind::Buffers,
            heap_size,
            max_heaps,
        );
        (children, allocator)
    }

    #[test]
    fn persistent_first_fit_reuses_freed_space() {
        let (_children, allocator) = persistent(4096, 2);

        let r1 = allocator.alloc_bytes(1024, 256).unwrap();
        let r2 = allocator.alloc_bytes(1024, 256).unwrap();
        assert_eq!((r1.start(), r2.start()), (0, 1024));

        drop(r1);
        let r3 = allocator.alloc_bytes(512, 256).unwrap();
        assert_eq!(r3.start(), 0);

        let r4 = allocator.alloc_bytes(2048, 256).unwrap();
        assert_eq!(r4.start(), 2048);
        assert!(!r4.overlaps(&r2));
        assert_eq!(allocator.heap_count(), 1);
        assert_eq!(allocator.used_bytes(), 512 + 1024 + 2048);
    }

    #[test]
    fn persistent_coalesces_on_free() {
        let (_children, allocator) = persistent(4096, 1);

        let ranges: Vec<_> = (0..4).map(|_| allocator.alloc_bytes(1024, 1).unwrap()).collect();
        assert!(allocator.alloc_bytes(1, 1).is_none());

        drop(ranges);
        assert_eq!(allocator.free_bytes(), 4096);
        assert_eq!(allocator.alloc_bytes(4096, 1).unwrap().start(), 0);
    }

    #[test]
    fn persistent_grows_to_max_heaps() {
        let (_children, allocator) = persistent(4096, 2);

        let _a = allocator.alloc_bytes(4096, 1).unwrap();
        let b = allocator.alloc_bytes(4096, 1).unwrap();
        assert_eq!(allocator.heap_count(), 2);
        assert!(allocator.alloc_bytes(4096, 1).is_none());
        assert!(allocator.alloc_bytes(8192, 1).is_none());

        drop(b);
        assert!(allocator.alloc_bytes(4096, 1).is_some());
    }
}
