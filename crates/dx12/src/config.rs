use core::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables for a [`GraphicsContext`](crate::GraphicsContext).
///
/// Deserializes with every field optional so an application can embed it in its own
/// settings file and only override what it cares about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    /// Size of the CPU-writable ring used for uploads and per-frame constants.
    pub upload_ring_size: u64,
    /// Size of the CPU-readable ring used for readbacks.
    pub readback_ring_size: u64,
    /// Size of each default heap created for static buffers.
    pub buffer_heap_size: u64,
    /// Size of each default heap created for textures.
    pub texture_heap_size: u64,
    /// Upper bound on heaps per persistent allocator.
    pub max_heaps: usize,
    pub back_buffer_count: usize,
    pub sync_interval: u32,
    /// Longest a frame may block waiting for its back buffer to become free.
    #[serde(with = "millis")]
    pub frame_latency_timeout: Duration,
    /// Longest a ring allocation may block waiting for the GPU to retire old ranges.
    #[serde(with = "millis")]
    pub ring_wait_timeout: Duration,
    #[serde(with = "millis")]
    pub idle_timeout: Duration,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            upload_ring_size: 32 * 1024 * 1024,
            readback_ring_size: 8 * 1024 * 1024,
            buffer_heap_size: 16 * 1024 * 1024,
            texture_heap_size: 64 * 1024 * 1024,
            max_heaps: 16,
            back_buffer_count: 2,
            sync_interval: 1,
            frame_latency_timeout: Duration::from_millis(1000),
            ring_wait_timeout: Duration::from_millis(5000),
            idle_timeout: Duration::from_millis(10_000),
        }
    }
}

mod millis {
    use core::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
