use core::{fmt, mem};
use std::sync::Arc;

use crate::{
    backend::{
        CommandAllocatorBackend, CommandListBackend, QueueKind, ResourceBackend, ResourceStates,
    },
    error::{Error, Result},
    fence::{Fence, FenceValue, FenceValues},
    queue::Queue,
    resource::{Resource, ResourceShared, Touched, Tracking},
};

/// An open command list bound to a queue.
///
/// Executing consumes the commands. Dropping them without executing discards the
/// recording: the list is closed, the tracking of every resource it touched is rolled
/// back, and the pooled objects return to the queue.
pub struct Commands {
    queue: Queue,
    data: Option<CommandsData>,
    wait_before_execute: FenceValues,
    touched: Vec<Touched>,
    barriers: usize,
}

pub(crate) struct CommandsData {
    pub list: Box<dyn CommandListBackend>,
    pub allocator: Box<dyn CommandAllocatorBackend>,
    /// Signaled once when these commands execute or are discarded.
    pub fence: Fence,
    pub generation: u64,
    pub open: bool,
}

impl Commands {
    pub(crate) fn new(queue: Queue, data: CommandsData) -> Self {
        Self {
            queue,
            data: Some(data),
            wait_before_execute: FenceValues::new(),
            touched: Vec::new(),
            barriers: 0,
        }
    }

    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    pub fn kind(&self) -> QueueKind {
        self.queue.kind()
    }

    /// Fence value that completes once these commands finished on the GPU.
    pub fn next_fence_value(&self) -> FenceValue {
        self.data
            .as_ref()
            .map(|data| data.fence.next_value())
            .unwrap_or_default()
    }

    /// Makes the queue wait for `value` before running these commands.
    pub fn wait_before_execute(&mut self, value: FenceValue) {
        self.wait_before_execute.add(value);
    }

    pub fn pending_waits(&self) -> &FenceValues {
        &self.wait_before_execute
    }

    /// Transition barriers recorded so far.
    pub fn barrier_count(&self) -> usize {
        self.barriers
    }

    /// Records directly into the native list.
    pub fn record<R>(&mut self, f: impl FnOnce(&mut dyn CommandListBackend) -> R) -> Result<R> {
        Ok(f(self.list_mut()?))
    }

    /// Moves `resource` to `state`, recording a barrier only if it was elsewhere.
    /// Returns the previous state.
    pub fn transition(&mut self, resource: &Resource, state: ResourceStates) -> ResourceStates {
        resource.state(state, Some(self))
    }

    /// Records a barrier from the tracked state to `state`, skipping it if they match.
    /// Unlike [`Commands::transition`] the resource's fence tracking is left alone, so
    /// the caller orders this work against other users of the resource.
    pub fn resource_barrier(
        &mut self,
        resource: &Resource,
        state: ResourceStates,
    ) -> Result<ResourceStates> {
        let before = resource.state(state, None);
        if before != state {
            let hw = resource.hw()?;
            self.record_barrier(hw.as_ref(), before, state);
        }
        Ok(before)
    }

    pub fn copy_resource(&mut self, dst: &Resource, src: &Resource) -> Result<()> {
        if dst.id() == src.id() {
            return Err(Error::InvalidArgument("cannot copy a resource onto itself"));
        }

        self.transition(dst, ResourceStates::COPY_DEST);
        self.transition(src, ResourceStates::COPY_SOURCE);
        let (dst, src) = (dst.hw()?, src.hw()?);
        self.record(|list| list.copy_resource(dst.as_ref(), src.as_ref()))
    }

    pub fn clear_resource(&mut self, target: &Resource, color: [f32; 4]) -> Result<()> {
        self.transition(target, ResourceStates::RENDER_TARGET);
        let target = target.hw()?;
        self.record(|list| list.clear_render_target(target.as_ref(), color))
    }

    pub fn discard_resource(&mut self, target: &Resource) -> Result<()> {
        self.transition(target, ResourceStates::RENDER_TARGET);
        let target = target.hw()?;
        self.record(|list| list.discard_resource(target.as_ref()))
    }

    /// Submits to the owning queue.
    pub fn execute(self) -> Result<FenceValue> {
        let queue = self.queue.clone();
        queue.execute(self)
    }

    /// Throws the recording away. Same as dropping.
    pub fn discard(self) {}

    pub(crate) fn list_mut(&mut self) -> Result<&mut dyn CommandListBackend> {
        match self.data {
            Some(ref mut data) => Ok(data.list.as_mut()),
            None => Err(Error::InvalidArgument("commands were already submitted")),
        }
    }

    pub(crate) fn list(&self) -> Option<&dyn CommandListBackend> {
        self.data.as_ref().map(|data| data.list.as_ref())
    }

    pub(crate) fn fence(&self) -> Option<&Fence> {
        self.data.as_ref().map(|data| &data.fence)
    }

    pub(crate) fn generation(&self) -> u64 {
        self.data.as_ref().map_or(0, |data| data.generation)
    }

    pub(crate) fn record_barrier(
        &mut self,
        resource: &dyn ResourceBackend,
        before: ResourceStates,
        after: ResourceStates,
    ) {
        if let Some(ref mut data) = self.data {
            data.list.barrier(resource, before, after);
            self.barriers += 1;
        }
    }

    pub(crate) fn aliasing_barrier(&mut self, resource: &dyn ResourceBackend) {
        if let Some(ref mut data) = self.data {
            data.list.aliasing_barrier(None, resource);
        }
    }

    /// Remembers how `resource` was tracked before these commands first touched it.
    pub(crate) fn touch(
        &mut self,
        resource: &Arc<ResourceShared>,
        before: &Tracking,
        state_after: ResourceStates,
    ) {
        match self
            .touched
            .iter_mut()
            .find(|touched| touched.is(resource))
        {
            Some(touched) => touched.state_after = state_after,
            None => self
                .touched
                .push(Touched::new(resource, before.clone(), state_after)),
        }
    }

    pub(crate) fn close(&mut self) -> Result<()> {
        let data = self
            .data
            .as_mut()
            .ok_or(Error::InvalidArgument("commands were already submitted"))?;

        if data.open {
            data.open = false;
            data.list.close()?;
        }

        Ok(())
    }

    pub(crate) fn take_data(&mut self) -> Option<CommandsData> {
        self.touched.clear();
        self.data.take()
    }
}

impl Drop for Commands {
    fn drop(&mut self) {
        if let Some(data) = self.data.take() {
            self.queue.discard(data, mem::take(&mut self.touched));
        }
    }
}

impl fmt::Debug for Commands {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Commands")
            .field("kind", &self.kind())
            .field("next_fence_value", &self.next_fence_value())
            .field("waits", &self.wait_before_execute)
            .field("barriers", &self.barriers)
            .finish()
    }
}
