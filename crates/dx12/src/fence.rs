use core::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};
use std::{
    sync::{Arc, Weak},
    time::Instant,
};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

use crate::{
    backend::{DeviceBackend, FenceBackend, QueueBackend, QueueKind},
    child::{ChildRegistration, DeviceChild, DeviceChildren, ResetPriority},
    error::{Error, Result},
};

static NEXT_FENCE_ID: AtomicU64 = AtomicU64::new(1);

/// A GPU timeline with a monotonically increasing value.
///
/// Every value handed out by [`Fence::next_value`] is signaled at most once and values
/// never repeat, even across device resets.
#[derive(Clone)]
pub struct Fence {
    inner: Arc<FenceInner>,
}

struct FenceInner {
    id: u64,
    kind: QueueKind,
    hw: RwLock<Box<dyn FenceBackend>>,
    /// Value the next signal will use.
    next_value: Mutex<u64>,
    /// Highest value known complete. Lags the hardware until refreshed.
    completed_value: AtomicU64,
    _registration: ChildRegistration,
}

impl Fence {
    pub(crate) fn new(
        device: &dyn DeviceBackend,
        children: &Arc<DeviceChildren>,
        kind: QueueKind,
    ) -> anyhow::Result<Self> {
        let hw = device.create_fence(0)?;
        let inner = Arc::new_cyclic(|weak: &Weak<FenceInner>| {
            let child: Weak<dyn DeviceChild> = weak.clone();
            FenceInner {
                id: NEXT_FENCE_ID.fetch_add(1, Ordering::Relaxed),
                kind,
                hw: RwLock::new(hw),
                next_value: Mutex::new(1),
                completed_value: AtomicU64::new(0),
                _registration: children.add(child, ResetPriority::FENCE),
            }
        });

        trace!(id = inner.id, ?kind, "fence created");
        Ok(Self { inner })
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Kind of queue this fence is signaled on.
    pub fn queue_kind(&self) -> QueueKind {
        self.inner.kind
    }

    /// The value the next signal will reach. Nothing waiting on it completes until the
    /// owner of the fence signals.
    pub fn next_value(&self) -> FenceValue {
        FenceValue {
            fence: Some(self.clone()),
            value: *self.inner.next_value.lock(),
        }
    }

    pub fn completed_value(&self) -> u64 {
        let hw = self.inner.hw.read().completed_value();
        self.inner.completed_value.fetch_max(hw, Ordering::AcqRel).max(hw)
    }

    pub fn complete(&self, value: u64) -> bool {
        value <= self.inner.completed_value.load(Ordering::Acquire)
            || value <= self.completed_value()
    }

    /// Blocks until the fence reaches `value`. `Ok(false)` on timeout.
    pub fn wait(&self, value: u64, timeout: Option<Duration>) -> Result<bool> {
        if self.complete(value) && !self.removed() {
            return Ok(true);
        }

        let hw = self.inner.hw.read();
        if hw.completed_value() == u64::MAX {
            return Err(Error::DeviceLost);
        }

        if !hw.wait(value, timeout)? {
            return Ok(false);
        }

        self.inner.completed_value.fetch_max(value, Ordering::AcqRel);
        Ok(true)
    }

    fn removed(&self) -> bool {
        self.inner.completed_value.load(Ordering::Acquire) == u64::MAX
    }

    /// Enqueues a GPU signal of the next value on `queue` and advances the fence.
    pub(crate) fn signal_on(&self, queue: &dyn QueueBackend) -> anyhow::Result<FenceValue> {
        let mut next = self.inner.next_value.lock();
        let value = *next;
        queue.signal(self.inner.hw.read().as_ref(), value)?;
        *next += 1;

        Ok(FenceValue {
            fence: Some(self.clone()),
            value,
        })
    }

    /// Enqueues a GPU-side wait for `value` on `queue`.
    pub(crate) fn queue_wait(&self, queue: &dyn QueueBackend, value: u64) -> anyhow::Result<()> {
        queue.wait(self.inner.hw.read().as_ref(), value)
    }

    pub(crate) fn ptr_eq(&self, other: &Fence) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl DeviceChild for FenceInner {
    fn reset(&self, device: &dyn DeviceBackend) -> anyhow::Result<()> {
        // everything handed out so far counts as complete on the new timeline
        let next = *self.next_value.lock();
        *self.hw.write() = device.create_fence(next - 1)?;
        self.completed_value.store(next - 1, Ordering::Release);

        debug!(id = self.id, value = next - 1, "fence recreated");
        Ok(())
    }
}

impl fmt::Debug for Fence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fence")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("next_value", &*self.inner.next_value.lock())
            .field(
                "completed_value",
                &self.inner.completed_value.load(Ordering::Relaxed),
            )
            .finish()
    }
}

/// A point on a [`Fence`] timeline. The default value has no fence and is always
/// complete.
#[derive(Clone, Default)]
pub struct FenceValue {
    fence: Option<Fence>,
    value: u64,
}

impl FenceValue {
    pub fn fence(&self) -> Option<&Fence> {
        self.fence.as_ref()
    }

    pub fn get(&self) -> u64 {
        self.value
    }

    pub fn is_valid(&self) -> bool {
        self.fence.is_some() && self.value > 0
    }

    pub fn complete(&self) -> bool {
        match self.fence {
            Some(ref fence) => fence.complete(self.value),
            None => true,
        }
    }

    pub fn wait(&self, timeout: Option<Duration>) -> Result<bool> {
        match self.fence {
            Some(ref fence) => fence.wait(self.value, timeout),
            None => Ok(true),
        }
    }

    pub(crate) fn on_fence(&self, fence: &Fence) -> bool {
        self.fence.as_ref().is_some_and(|own| own.ptr_eq(fence))
    }

    /// Whether reaching `self` implies `other` was reached.
    pub fn covers(&self, other: &FenceValue) -> bool {
        match other.fence {
            Some(ref fence) => self.on_fence(fence) && self.value >= other.value,
            None => true,
        }
    }
}

impl PartialEq for FenceValue {
    fn eq(&self, other: &Self) -> bool {
        let same_fence = match (&self.fence, &other.fence) {
            (Some(a), Some(b)) => a.ptr_eq(b),
            (None, None) => true,
            _ => false,
        };

        same_fence && self.value == other.value
    }
}

impl Eq for FenceValue {}

impl fmt::Debug for FenceValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.fence {
            Some(ref fence) => write!(f, "FenceValue({}@{})", self.value, fence.id()),
            None => f.write_str("FenceValue(none)"),
        }
    }
}

/// At most one value per fence, keeping the highest.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct FenceValues {
    values: Vec<FenceValue>,
}

impl FenceValues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, value: FenceValue) {
        let Some(ref fence) = value.fence else {
            return;
        };
        if value.value == 0 {
            return;
        }

        match self.values.iter_mut().find(|existing| existing.on_fence(fence)) {
            Some(existing) => existing.value = existing.value.max(value.value),
            None => self.values.push(value),
        }
    }

    pub fn add_all(&mut self, other: &FenceValues) {
        for value in &other.values {
            self.add(value.clone());
        }
    }

    /// Drops the value held for `fence`, if any.
    pub(crate) fn remove_fence(&mut self, fence: &Fence) {
        self.values.retain(|value| !value.on_fence(fence));
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FenceValue> {
        self.values.iter()
    }

    /// Whether waiting on this set implies `value` was reached.
    pub fn covers(&self, value: &FenceValue) -> bool {
        !value.is_valid() || self.values.iter().any(|own| own.covers(value))
    }

    /// Drops completed values. Returns whether the set is now empty.
    pub fn complete(&mut self) -> bool {
        self.values.retain(|value| !value.complete());
        self.values.is_empty()
    }

    /// Waits for every value, sharing `timeout` between them. Returns `Ok(false)` if the
    /// timeout ran out first, keeping the values not yet reached.
    pub fn wait(&mut self, timeout: Option<Duration>) -> Result<bool> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);

        while let Some(value) = self.values.last() {
            let remaining =
                deadline.map(|deadline| deadline.saturating_duration_since(Instant::now()));
            if !value.wait(remaining)? {
                return Ok(false);
            }

            self.values.pop();
        }

        Ok(true)
    }
}

impl fmt::Debug for FenceValues {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(&self.values).finish()
    }
}

impl FromIterator<FenceValue> for FenceValues {
    fn from_iter<T: IntoIterator<Item = FenceValue>>(iter: T) -> Self {
        let mut values = Self::new();
        for value in iter {
            values.add(value);
        }
        values
    }
}

impl<'a> IntoIterator for &'a FenceValues {
    type Item = &'a FenceValue;
    type IntoIter = core::slice::Iter<'a, FenceValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.values.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::sim::SimDevice;

    fn setup() -> (
        SimDevice,
        Arc<DeviceChildren>,
        Box<dyn QueueBackend>,
        Fence,
    ) {
        let device = SimDevice::new();
        let children = Arc::new(DeviceChildren::default());
        let queue = device.create_queue(QueueKind::Direct).unwrap();
        let fence = Fence::new(&device, &children, QueueKind::Direct).unwrap();
        (device, children, queue, fence)
    }

    #[test]
    fn signaled_values_increase() {
        let (device, _children, queue, fence) = setup();
        device.hold();

        let first = fence.signal_on(queue.as_ref()).unwrap();
        let second = fence.signal_on(queue.as_ref()).unwrap();
        assert!(second.get() > first.get());
        assert_eq!(fence.next_value().get(), second.get() + 1);
        assert!(!first.complete());

        device.resume();
        assert!(first.complete());
        assert!(second.complete());
        assert!(!fence.next_value().complete());
    }

    #[test]
    fn default_value_is_complete() {
        let value = FenceValue::default();
        assert!(!value.is_valid());
        assert!(value.complete());
        assert!(value.wait(Some(Duration::ZERO)).unwrap());
    }

    #[test]
    fn set_keeps_highest_per_fence() {
        let (device, children, queue, fence) = setup();
        let other = Fence::new(&device, &children, QueueKind::Copy).unwrap();
        device.hold();

        let low = fence.signal_on(queue.as_ref()).unwrap();
        let high = fence.signal_on(queue.as_ref()).unwrap();
        let elsewhere = other.signal_on(queue.as_ref()).unwrap();

        let mut values: FenceValues = [high.clone(), low.clone(), elsewhere].into_iter().collect();
        assert_eq!(values.len(), 2);
        assert!(values.covers(&low));
        assert!(values.covers(&high));
        assert!(values.iter().any(|value| *value == high));

        assert!(!values.complete());
        device.resume();
        assert!(values.complete());
    }

    #[test]
    fn wait_times_out_while_held() {
        let (device, _children, queue, fence) = setup();
        device.hold();

        let value = fence.signal_on(queue.as_ref()).unwrap();
        let mut values = FenceValues::new();
        values.add(value.clone());
        assert!(!values.wait(Some(Duration::from_millis(20))).unwrap());
        assert_eq!(values.len(), 1);

        device.resume();
        assert!(values.wait(Some(Duration::from_millis(20))).unwrap());
        assert!(values.is_empty());
    }

    #[test]
    fn reset_keeps_timeline() {
        let (device, children, queue, fence) = setup();
        device.hold();
        let pending = fence.signal_on(queue.as_ref()).unwrap();

        device.remove_device();
        assert!(matches!(pending.wait(None), Err(Error::DeviceLost)));

        device.reset().unwrap();
        children.reset(&device).unwrap();

        assert!(pending.complete());
        let next = fence.next_value();
        assert!(next.get() > pending.get());
        assert!(!next.complete());
    }
}
