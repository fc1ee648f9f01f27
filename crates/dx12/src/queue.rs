use core::{
    fmt,
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
    time::Duration,
};
use std::{
    collections::VecDeque,
    sync::{Arc, Weak},
};

use parking_lot::{MappedRwLockReadGuard, Mutex, RwLock, RwLockReadGuard};
use raw_window_handle::RawWindowHandle;
use scopeguard::ScopeGuard;
use tracing::{debug, trace, warn};

use crate::{
    backend::{
        CommandAllocatorBackend, CommandListBackend, DeviceBackend, QueueBackend, QueueKind,
        SwapChainBackend, SwapChainDesc,
    },
    child::{ChildRegistration, DeviceChild, DeviceChildren, ResetPriority},
    commands::{Commands, CommandsData},
    error::{Error, Result},
    fence::{Fence, FenceValue, FenceValues},
    resource::Touched,
};

/// A GPU queue with pools of command lists, allocators and fences.
///
/// Command allocators are only reused once the fence value of their last submission
/// completed, so at most as many allocators exist as submissions are in flight.
#[derive(Clone)]
pub struct Queue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    kind: QueueKind,
    device: Arc<dyn DeviceBackend>,
    children: Arc<DeviceChildren>,
    hw: RwLock<Option<Box<dyn QueueBackend>>>,
    /// Signaled by [`Queue::signal_fence`] to mark everything submitted so far.
    idle_fence: Fence,
    allocators: Mutex<VecDeque<(FenceValue, Box<dyn CommandAllocatorBackend>)>>,
    lists: Mutex<Vec<Box<dyn CommandListBackend>>>,
    fences: Mutex<Vec<Fence>>,
    allocators_created: AtomicUsize,
    /// Bumped on device reset to invalidate commands recorded before it.
    generation: AtomicU64,
    _registration: ChildRegistration,
}

impl Queue {
    pub(crate) fn new(
        device: Arc<dyn DeviceBackend>,
        children: &Arc<DeviceChildren>,
        kind: QueueKind,
    ) -> anyhow::Result<Self> {
        let hw = device.create_queue(kind)?;
        let idle_fence = Fence::new(device.as_ref(), children, kind)?;

        let inner = Arc::new_cyclic(|weak: &Weak<QueueInner>| {
            let child: Weak<dyn DeviceChild> = weak.clone();
            QueueInner {
                kind,
                device,
                children: children.clone(),
                hw: RwLock::new(Some(hw)),
                idle_fence,
                allocators: Mutex::new(VecDeque::new()),
                lists: Mutex::new(Vec::new()),
                fences: Mutex::new(Vec::new()),
                allocators_created: AtomicUsize::new(0),
                generation: AtomicU64::new(0),
                _registration: children.add(child, ResetPriority::QUEUE),
            }
        });

        Ok(Self { inner })
    }

    pub fn kind(&self) -> QueueKind {
        self.inner.kind
    }

    /// Command allocators created over the queue's lifetime.
    pub fn allocator_count(&self) -> usize {
        self.inner.allocators_created.load(Ordering::Relaxed)
    }

    /// Allocators waiting in the pool for reuse.
    pub fn pooled_allocators(&self) -> usize {
        self.inner.allocators.lock().len()
    }

    pub(crate) fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::Acquire)
    }

    fn hw(&self) -> Result<MappedRwLockReadGuard<'_, dyn QueueBackend>> {
        RwLockReadGuard::try_map(self.inner.hw.read(), |hw| hw.as_deref())
            .map_err(|_| Error::DeviceLost)
    }

    /// Returns an open command list, reusing pooled objects when the GPU is done with
    /// them.
    #[tracing::instrument(level = "trace", skip(self), fields(kind = ?self.inner.kind))]
    pub fn new_commands(&self) -> Result<Commands> {
        let generation = self.generation();
        // back to the pool if the list or fence cannot be made
        let allocator = scopeguard::guard(self.take_allocator()?, |allocator| {
            self.inner
                .allocators
                .lock()
                .push_back((FenceValue::default(), allocator));
        });

        let pooled = self.inner.lists.lock().pop();
        let list = match pooled {
            Some(mut list) => {
                list.reset(allocator.as_ref())?;
                list
            }
            None => self
                .inner
                .device
                .create_command_list(self.inner.kind, allocator.as_ref())?,
        };

        let pooled = self.inner.fences.lock().pop();
        let fence = match pooled {
            Some(fence) => fence,
            None => Fence::new(self.inner.device.as_ref(), &self.inner.children, self.inner.kind)?,
        };

        let allocator = ScopeGuard::into_inner(allocator);
        Ok(Commands::new(
            self.clone(),
            CommandsData {
                list,
                allocator,
                fence,
                generation,
                open: true,
            },
        ))
    }

    fn take_allocator(&self) -> anyhow::Result<Box<dyn CommandAllocatorBackend>> {
        let reusable = {
            let mut allocators = self.inner.allocators.lock();
            allocators
                .iter()
                .position(|(fence_value, _)| fence_value.complete())
                .and_then(|index| allocators.remove(index))
        };

        match reusable {
            Some((_, mut allocator)) => {
                allocator.reset()?;
                Ok(allocator)
            }
            None => {
                let count = self.inner.allocators_created.fetch_add(1, Ordering::Relaxed) + 1;
                trace!(kind = ?self.inner.kind, count, "creating command allocator");
                self.inner.device.create_command_allocator(self.inner.kind)
            }
        }
    }

    pub fn execute(&self, commands: Commands) -> Result<FenceValue> {
        self.execute_many([commands])
    }

    /// Submits several command lists in order, after making the queue wait for every
    /// fence value they depend on.
    ///
    /// Returns the fence value of the last list. It completes after all of them.
    pub fn execute_many(&self, commands: impl IntoIterator<Item = Commands>) -> Result<FenceValue> {
        let mut batch: Vec<Commands> = commands.into_iter().collect();
        if batch.is_empty() {
            return Ok(FenceValue::default());
        }

        let generation = self.generation();
        let mut waits = FenceValues::new();
        for commands in &mut batch {
            if !Arc::ptr_eq(&commands.queue().inner, &self.inner) {
                return Err(Error::InvalidArgument("commands executed on another queue"));
            }
            if commands.generation() != generation {
                return Err(Error::StaleCommands);
            }

            commands.close()?;
            waits.add_all(commands.pending_waits());
        }

        // the batch signals its own fences only after executing
        for commands in &batch {
            if let Some(fence) = commands.fence() {
                waits.remove_fence(fence);
            }
        }
        waits.complete();

        let hw = self.hw()?;
        for value in &waits {
            if let Some(fence) = value.fence() {
                fence.queue_wait(&*hw, value.get())?;
            }
        }

        let lists: Vec<&dyn CommandListBackend> = batch.iter().filter_map(Commands::list).collect();
        hw.execute(&lists)?;
        drop(lists);

        let mut last = FenceValue::default();
        for mut commands in batch {
            let Some(data) = commands.take_data() else {
                continue;
            };

            let fence_value = data.fence.signal_on(&*hw)?;
            trace!(
                kind = ?self.inner.kind,
                value = ?fence_value,
                barriers = commands.barrier_count(),
                "commands executed"
            );
            self.recycle(data, fence_value.clone());
            last = fence_value;
        }

        Ok(last)
    }

    /// Closes and recycles commands that are never going to be executed.
    pub(crate) fn discard(&self, mut data: CommandsData, touched: Vec<Touched>) {
        if data.generation != self.generation() {
            debug!(kind = ?self.inner.kind, "releasing commands recorded before device reset");
            return;
        }

        if data.open {
            if let Err(err) = data.list.close() {
                warn!(%err, "cannot close discarded command list");
            }
            data.open = false;
        }

        for touched in touched {
            touched.roll_back(&data.fence);
        }

        // someone may already wait on this value through a resource it touched
        let signaled = self
            .hw()
            .and_then(|hw| Ok(data.fence.signal_on(&*hw)?));
        match signaled {
            Ok(fence_value) => {
                trace!(kind = ?self.inner.kind, value = ?fence_value, "commands discarded");
                self.recycle(data, fence_value);
            }
            Err(err) => warn!(%err, "cannot signal discarded commands"),
        }
    }

    fn recycle(&self, data: CommandsData, fence_value: FenceValue) {
        self.inner.lists.lock().push(data.list);
        self.inner
            .allocators
            .lock()
            .push_back((fence_value, data.allocator));
        self.inner.fences.lock().push(data.fence);
    }

    /// Signals a fresh value covering everything submitted to this queue so far.
    pub fn signal_fence(&self) -> Result<FenceValue> {
        let hw = self.hw()?;
        Ok(self.inner.idle_fence.signal_on(&*hw)?)
    }

    pub fn fence_complete(&self, value: &FenceValue) -> bool {
        value.complete()
    }

    /// Makes this queue wait on the GPU for `value`. The CPU does not block.
    pub fn wait_for_fence(&self, value: &FenceValue) -> Result<()> {
        let Some(fence) = value.fence() else {
            return Ok(());
        };
        if value.complete() {
            return Ok(());
        }

        let hw = self.hw()?;
        Ok(fence.queue_wait(&*hw, value.get())?)
    }

    /// Blocks until the queue finished its submitted work. `Ok(false)` on timeout.
    pub fn wait_for_idle(&self, timeout: Option<Duration>) -> Result<bool> {
        self.signal_fence()?.wait(timeout)
    }

    pub(crate) fn create_swap_chain(
        &self,
        window: RawWindowHandle,
        desc: &SwapChainDesc,
    ) -> anyhow::Result<Box<dyn SwapChainBackend>> {
        let hw = self.hw()?;
        self.inner.device.create_swap_chain(&*hw, window, desc)
    }
}

impl DeviceChild for QueueInner {
    fn before_reset(&self) {
        self.allocators.lock().clear();
        self.lists.lock().clear();
        *self.hw.write() = None;
    }

    fn reset(&self, device: &dyn DeviceBackend) -> anyhow::Result<()> {
        *self.hw.write() = Some(device.create_queue(self.kind)?);
        self.generation.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("kind", &self.inner.kind)
            .field("generation", &self.generation())
            .finish_non_exhaustive()
    }
}
