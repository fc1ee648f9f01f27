use core::mem;
use std::sync::{Arc, Weak};

use anyhow::{Context, anyhow};
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::{
    backend::{DeviceBackend, HeapKind, QueueKind, ResourceBackend},
    child::{ChildRegistration, DeviceChild, DeviceChildren, ResetPriority},
    config::GraphicsConfig,
    error::{Error, Result},
    fence::{FenceValue, FenceValues},
    mem_allocator::{PersistentAllocator, RingAllocator},
    mem_range::MemRange,
    queue::Queue,
};

/// Owner of the device, its queues and its memory allocators.
///
/// Cheap to clone. Everything created from a context keeps it alive.
#[derive(Clone)]
pub struct GraphicsContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    device: Arc<dyn DeviceBackend>,
    config: GraphicsConfig,
    children: Arc<DeviceChildren>,
    queues: [Queue; 3],
    upload: Arc<RingAllocator>,
    readback: Arc<RingAllocator>,
    buffers: Arc<PersistentAllocator>,
    textures: Arc<PersistentAllocator>,
    keep_alive: Mutex<Vec<KeepAliveEntry>>,
    reset_lock: Mutex<()>,
}

/// Device objects that must outlive the GPU work using them.
#[derive(Default)]
pub(crate) struct KeepAlive {
    pub resource: Option<Arc<dyn ResourceBackend>>,
    pub mem_range: Option<MemRange>,
}

struct KeepAliveEntry {
    fence_values: FenceValues,
    payload: KeepAlive,
}

impl GraphicsContext {
    #[tracing::instrument(skip_all, fields(device = device.name()))]
    pub fn new(device: Arc<dyn DeviceBackend>, config: GraphicsConfig) -> Result<Self> {
        if config.upload_ring_size == 0
            || config.readback_ring_size == 0
            || config.buffer_heap_size == 0
            || config.texture_heap_size == 0
            || config.max_heaps == 0
        {
            return Err(Error::InvalidArgument("memory sizes must be non-zero"));
        }
        if config.back_buffer_count < 2 {
            return Err(Error::InvalidArgument("at least two back buffers are required"));
        }

        let children = Arc::new(DeviceChildren::default());
        let queues = [
            Queue::new(device.clone(), &children, QueueKind::Direct)?,
            Queue::new(device.clone(), &children, QueueKind::Compute)?,
            Queue::new(device.clone(), &children, QueueKind::Copy)?,
        ];

        let upload = RingAllocator::new(
            device.as_ref(),
            &children,
            HeapKind::Upload,
            config.upload_ring_size,
            config.ring_wait_timeout,
        )
        .context("cannot create upload ring")?;
        let readback = RingAllocator::new(
            device.as_ref(),
            &children,
            HeapKind::Readback,
            config.readback_ring_size,
            config.ring_wait_timeout,
        )
        .context("cannot create readback ring")?;
        let buffers = PersistentAllocator::new(
            device.clone(),
            &children,
            HeapKind::Buffers,
            config.buffer_heap_size,
            config.max_heaps,
        );
        let textures = PersistentAllocator::new(
            device.clone(),
            &children,
            HeapKind::Textures,
            config.texture_heap_size,
            config.max_heaps,
        );

        info!("graphics context created");
        Ok(Self {
            inner: Arc::new(ContextInner {
                device,
                config,
                children,
                queues,
                upload,
                readback,
                buffers,
                textures,
                keep_alive: Mutex::new(Vec::new()),
                reset_lock: Mutex::new(()),
            }),
        })
    }

    pub fn device(&self) -> &Arc<dyn DeviceBackend> {
        &self.inner.device
    }

    pub fn config(&self) -> &GraphicsConfig {
        &self.inner.config
    }

    pub fn queue(&self, kind: QueueKind) -> &Queue {
        &self.inner.queues[kind.index()]
    }

    pub fn direct_queue(&self) -> &Queue {
        self.queue(QueueKind::Direct)
    }

    pub fn compute_queue(&self) -> &Queue {
        self.queue(QueueKind::Compute)
    }

    pub fn copy_queue(&self) -> &Queue {
        self.queue(QueueKind::Copy)
    }

    /// Queue whose timeline `value` belongs to.
    pub fn queue_for_fence(&self, value: &FenceValue) -> Option<&Queue> {
        value.fence().map(|fence| self.queue(fence.queue_kind()))
    }

    pub fn upload_allocator(&self) -> &RingAllocator {
        &self.inner.upload
    }

    pub fn readback_allocator(&self) -> &RingAllocator {
        &self.inner.readback
    }

    pub fn buffer_allocator(&self) -> &PersistentAllocator {
        &self.inner.buffers
    }

    pub fn texture_allocator(&self) -> &PersistentAllocator {
        &self.inner.textures
    }

    /// Adds an object to the device reset sequence. It leaves the sequence when the
    /// returned registration drops.
    pub fn register_child(
        &self,
        child: Weak<dyn DeviceChild>,
        priority: ResetPriority,
    ) -> ChildRegistration {
        self.inner.children.add(child, priority)
    }

    pub fn device_child_count(&self) -> usize {
        self.inner.children.len()
    }

    pub(crate) fn children(&self) -> &Arc<DeviceChildren> {
        &self.inner.children
    }

    /// Holds `payload` until every value in `fence_values` completes.
    pub(crate) fn keep_alive(&self, mut fence_values: FenceValues, payload: KeepAlive) {
        if fence_values.complete() {
            return;
        }

        trace!(?fence_values, "keeping device objects alive");
        self.inner.keep_alive.lock().push(KeepAliveEntry {
            fence_values,
            payload,
        });
    }

    pub fn keep_alive_count(&self) -> usize {
        self.inner.keep_alive.lock().len()
    }

    /// Releases kept-alive objects whose fences completed. Returns how many were released.
    pub fn collect_garbage(&self) -> usize {
        let mut released = Vec::new();
        self.inner.keep_alive.lock().retain_mut(|entry| {
            if entry.fence_values.complete() {
                released.push(mem::take(&mut entry.payload));
                false
            } else {
                true
            }
        });

        if !released.is_empty() {
            trace!(count = released.len(), "released kept-alive device objects");
        }
        released.len()
    }

    /// Per-frame housekeeping, called after present.
    pub fn frame_complete(&self) {
        self.collect_garbage();
    }

    /// Blocks until every queue finished its submitted work.
    #[tracing::instrument(skip(self))]
    pub fn wait_for_idle(&self) -> Result<()> {
        let values = self
            .inner
            .queues
            .iter()
            .map(Queue::signal_fence)
            .collect::<Result<Vec<_>>>()?;

        let timeout = self.inner.config.idle_timeout;
        for value in values {
            if !value.wait(Some(timeout))? {
                warn!(?value, ?timeout, "GPU did not go idle");
                return Err(Error::Backend(anyhow!(
                    "timed out after {timeout:?} waiting for the GPU to go idle"
                )));
            }
        }

        self.collect_garbage();
        Ok(())
    }

    /// Recreates the device and every registered child after device removal.
    #[tracing::instrument(skip(self))]
    pub fn reset_device(&self) -> Result<()> {
        let _guard = self.inner.reset_lock.lock();
        info!(removed = self.inner.device.is_removed(), "resetting graphics device");

        if let Err(err) = self.wait_for_idle() {
            debug!(%err, "device did not go idle before reset");
        }

        self.inner.children.before_reset();
        let dropped = mem::take(&mut *self.inner.keep_alive.lock());
        drop(dropped);

        self.inner
            .device
            .reset()
            .context("cannot recreate graphics device")?;
        self.inner.children.reset(self.inner.device.as_ref())?;

        info!("graphics device reset");
        Ok(())
    }
}
