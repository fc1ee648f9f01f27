//! Registry of objects that own device handles and must be rebuilt after device removal.

use core::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use nohash_hasher::BuildNoHashHasher;
use tracing::{debug, trace};

use crate::backend::DeviceBackend;

/// An object holding native device handles.
///
/// On device reset every live child first gets [`DeviceChild::before_reset`] in ascending
/// priority, then the device is recreated, then [`DeviceChild::reset`] runs in descending
/// priority so fences and queues exist before anything that records or waits on them.
pub trait DeviceChild: Send + Sync {
    fn before_reset(&self) {}

    fn reset(&self, device: &dyn DeviceBackend) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResetPriority(pub i32);

impl ResetPriority {
    pub const FENCE: Self = Self(100);
    pub const QUEUE: Self = Self(98);
    pub const ALLOCATOR: Self = Self(90);
    pub const RESOURCE: Self = Self(50);
    pub const NORMAL: Self = Self(0);
    pub const TARGET_WINDOW: Self = Self(-100);
}

#[derive(Default)]
pub(crate) struct DeviceChildren {
    next_id: AtomicU64,
    children: DashMap<u64, (ResetPriority, Weak<dyn DeviceChild>), BuildNoHashHasher<u64>>,
}

impl DeviceChildren {
    pub fn add(
        self: &Arc<Self>,
        child: Weak<dyn DeviceChild>,
        priority: ResetPriority,
    ) -> ChildRegistration {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.children.insert(id, (priority, child));
        trace!(id, ?priority, "device child registered");

        ChildRegistration {
            registry: Arc::downgrade(self),
            id,
        }
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    /// Live children ordered by descending priority, then registration order.
    fn sorted(&self) -> Vec<(ResetPriority, u64, Arc<dyn DeviceChild>)> {
        // collected first so children may register or drop others while being reset
        let mut children: Vec<_> = self
            .children
            .iter()
            .filter_map(|entry| {
                let (priority, child) = entry.value();
                Some((*priority, *entry.key(), child.upgrade()?))
            })
            .collect();
        children.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        children
    }

    pub fn before_reset(&self) {
        let children = self.sorted();
        debug!(count = children.len(), "releasing device children");
        for (_, _, child) in children.iter().rev() {
            child.before_reset();
        }
    }

    pub fn reset(&self, device: &dyn DeviceBackend) -> anyhow::Result<()> {
        let children = self.sorted();
        debug!(count = children.len(), "recreating device children");
        for (priority, id, child) in children {
            trace!(id, ?priority, "resetting device child");
            child.reset(device)?;
        }

        Ok(())
    }
}

/// Keeps a child in the reset registry until dropped.
pub struct ChildRegistration {
    registry: Weak<DeviceChildren>,
    id: u64,
}

impl Drop for ChildRegistration {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.children.remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;
    use crate::backend::sim::SimDevice;

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl DeviceChild for Recorder {
        fn before_reset(&self) {
            self.log.lock().push(format!("before {}", self.name));
        }

        fn reset(&self, _: &dyn DeviceBackend) -> anyhow::Result<()> {
            self.log.lock().push(format!("reset {}", self.name));
            Ok(())
        }
    }

    #[test]
    fn reset_runs_in_priority_order() {
        let registry = Arc::new(DeviceChildren::default());
        let log = Arc::new(Mutex::new(Vec::new()));

        let make = |name| {
            Arc::new(Recorder {
                name,
                log: log.clone(),
            })
        };
        let window = make("window");
        let fence = make("fence");
        let resource = make("resource");

        let _r1 = registry.add(
            Arc::downgrade(&window) as Weak<dyn DeviceChild>,
            ResetPriority::TARGET_WINDOW,
        );
        let _r2 = registry.add(
            Arc::downgrade(&fence) as Weak<dyn DeviceChild>,
            ResetPriority::FENCE,
        );
        let _r3 = registry.add(
            Arc::downgrade(&resource) as Weak<dyn DeviceChild>,
            ResetPriority::RESOURCE,
        );

        let device = SimDevice::new();
        registry.before_reset();
        registry.reset(&device).unwrap();

        assert_eq!(
            *log.lock(),
            [
                "before window",
                "before resource",
                "before fence",
                "reset fence",
                "reset resource",
                "reset window",
            ]
        );
    }

    #[test]
    fn dropped_registration_leaves_registry() {
        let registry = Arc::new(DeviceChildren::default());
        let child = Arc::new(Recorder {
            name: "child",
            log: Default::default(),
        });

        let registration = registry.add(
            Arc::downgrade(&child) as Weak<dyn DeviceChild>,
            ResetPriority::NORMAL,
        );
        assert_eq!(registry.len(), 1);

        drop(registration);
        assert_eq!(registry.len(), 0);
    }
}
