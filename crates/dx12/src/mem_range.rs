use core::fmt;
use std::sync::{Arc, Weak};

use anyhow::ensure;
use parking_lot::Mutex;
use tracing::error;

use crate::{
    heap::Heap,
    mem_allocator::PersistentState,
    resource::ResourceId,
};

/// A sub-allocation of a [`Heap`].
///
/// Ranges from the persistent allocators return to their free list when the last clone
/// drops. Ring ranges are reclaimed by the ring once both their fence completed and every
/// clone dropped.
#[derive(Clone)]
pub struct MemRange {
    inner: Arc<RangeInner>,
}

pub(crate) struct RangeInner {
    heap: Arc<Heap>,
    start: u64,
    size: u64,
    home: RangeHome,
    /// Resource currently allowed to use the memory, for aliased placements.
    active: Mutex<Option<ResourceId>>,
}

pub(crate) enum RangeHome {
    Ring,
    Persistent(Weak<PersistentState>),
}

impl MemRange {
    pub(crate) fn new(heap: Arc<Heap>, start: u64, size: u64, home: RangeHome) -> Self {
        Self {
            inner: Arc::new(RangeInner {
                heap,
                start,
                size,
                home,
                active: Mutex::new(None),
            }),
        }
    }

    pub(crate) fn downgrade(&self) -> Weak<RangeInner> {
        Arc::downgrade(&self.inner)
    }

    pub fn heap(&self) -> &Arc<Heap> {
        &self.inner.heap
    }

    pub fn start(&self) -> u64 {
        self.inner.start
    }

    pub fn size(&self) -> u64 {
        self.inner.size
    }

    pub fn end(&self) -> u64 {
        self.inner.start + self.inner.size
    }

    pub fn overlaps(&self, other: &MemRange) -> bool {
        self.inner.heap.id() == other.inner.heap.id()
            && self.start() < other.end()
            && other.start() < self.end()
    }

    pub fn gpu_address(&self) -> Option<u64> {
        self.inner.heap.hw().ok()?.gpu_address(self.inner.start)
    }

    /// Copies `data` into the range at `offset`. The heap must be CPU visible.
    pub fn write(&self, offset: u64, data: &[u8]) -> anyhow::Result<()> {
        ensure!(
            offset + data.len() as u64 <= self.inner.size,
            "{} byte write at {offset} overflows a {} byte range",
            data.len(),
            self.inner.size
        );

        self.inner.heap.hw()?.write(self.inner.start + offset, data)
    }

    /// Copies bytes at `offset` into `out`. The heap must be CPU visible.
    pub fn read(&self, offset: u64, out: &mut [u8]) -> anyhow::Result<()> {
        ensure!(
            offset + out.len() as u64 <= self.inner.size,
            "{} byte read at {offset} overflows a {} byte range",
            out.len(),
            self.inner.size
        );

        self.inner.heap.hw()?.read(self.inner.start + offset, out)
    }

    pub fn read_vec(&self, offset: u64, len: usize) -> anyhow::Result<Vec<u8>> {
        let mut out = vec![0; len];
        self.read(offset, &mut out)?;
        Ok(out)
    }

    pub fn active_resource(&self) -> Option<ResourceId> {
        *self.inner.active.lock()
    }

    /// Hands the memory to `owner`. Fails if another resource still holds it.
    pub(crate) fn claim(&self, owner: ResourceId) -> bool {
        let mut active = self.inner.active.lock();
        match *active {
            Some(current) if current != owner => {
                error!(
                    ?current,
                    ?owner,
                    start = self.inner.start,
                    "memory range claimed while another resource is active"
                );
                debug_assert_eq!(current, owner, "memory range is still active");
                false
            }
            _ => {
                *active = Some(owner);
                true
            }
        }
    }

    pub(crate) fn release(&self, owner: ResourceId) {
        let mut active = self.inner.active.lock();
        if *active == Some(owner) {
            *active = None;
        }
    }
}

impl Drop for RangeInner {
    fn drop(&mut self) {
        if let RangeHome::Persistent(ref state) = self.home {
            if let Some(state) = state.upgrade() {
                state.free(self.heap.id(), self.start, self.size);
            }
        }
    }
}

impl fmt::Debug for MemRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemRange")
            .field("heap", &self.inner.heap.id())
            .field("kind", &self.inner.heap.kind())
            .field("start", &self.inner.start)
            .field("size", &self.inner.size)
            .finish()
    }
}
