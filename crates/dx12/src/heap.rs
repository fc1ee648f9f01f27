use core::sync::atomic::{AtomicU64, Ordering};

use anyhow::Context;
use parking_lot::{MappedRwLockReadGuard, RwLock, RwLockReadGuard};
use tracing::trace;

use crate::backend::{DeviceBackend, HeapBackend, HeapKind};

static NEXT_HEAP_ID: AtomicU64 = AtomicU64::new(1);

/// A block of GPU memory that [`MemRange`](crate::MemRange)s are carved from.
///
/// The native heap is released before a device reset and recreated with the same size
/// afterwards, so ranges handed out stay valid across resets.
pub struct Heap {
    id: u64,
    kind: HeapKind,
    size: u64,
    hw: RwLock<Option<Box<dyn HeapBackend>>>,
}

impl Heap {
    pub(crate) fn new(
        device: &dyn DeviceBackend,
        kind: HeapKind,
        size: u64,
    ) -> anyhow::Result<Self> {
        let hw = device
            .create_heap(kind, size)
            .with_context(|| format!("cannot create {size} byte {kind:?} heap"))?;

        let id = NEXT_HEAP_ID.fetch_add(1, Ordering::Relaxed);
        trace!(id, ?kind, size, "heap created");

        Ok(Self {
            id,
            kind,
            size,
            hw: RwLock::new(Some(hw)),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> HeapKind {
        self.kind
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub(crate) fn hw(&self) -> anyhow::Result<MappedRwLockReadGuard<'_, dyn HeapBackend>> {
        RwLockReadGuard::try_map(self.hw.read(), |hw| hw.as_deref())
            .ok()
            .with_context(|| {
                format!("{:?} heap {} was released for device reset", self.kind, self.id)
            })
    }

    pub(crate) fn release(&self) {
        *self.hw.write() = None;
    }

    pub(crate) fn recreate(&self, device: &dyn DeviceBackend) -> anyhow::Result<()> {
        *self.hw.write() = Some(device.create_heap(self.kind, self.size)?);
        Ok(())
    }
}
