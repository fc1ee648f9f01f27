#![allow(dead_code)]

use core::time::Duration;
use std::{num::NonZeroIsize, sync::Arc};

use ff_common::{PointSize, WindowSize};
use ff_dx12::{GraphicsConfig, GraphicsContext, WindowHost, backend::sim::SimDevice};
use parking_lot::Mutex;
use raw_window_handle::{RawWindowHandle, Win32WindowHandle};

pub fn init_tracing() {
    _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

pub fn config() -> GraphicsConfig {
    GraphicsConfig {
        upload_ring_size: 256 * 1024,
        readback_ring_size: 256 * 1024,
        buffer_heap_size: 1024 * 1024,
        texture_heap_size: 1024 * 1024,
        max_heaps: 4,
        back_buffer_count: 2,
        sync_interval: 1,
        frame_latency_timeout: Duration::from_millis(100),
        ring_wait_timeout: Duration::from_millis(200),
        idle_timeout: Duration::from_millis(500),
    }
}

pub fn context() -> (SimDevice, GraphicsContext) {
    init_tracing();

    let device = SimDevice::new();
    let context = GraphicsContext::new(Arc::new(device.clone()), config()).unwrap();
    (device, context)
}

pub struct TestWindow {
    size: Mutex<WindowSize>,
}

impl TestWindow {
    pub fn new(width: usize, height: usize) -> Arc<Self> {
        Arc::new(Self {
            size: Mutex::new(WindowSize::new(PointSize::new(width, height), 1.0)),
        })
    }

    pub fn resize(&self, width: usize, height: usize) -> WindowSize {
        let mut size = self.size.lock();
        size.pixel_size = PointSize::new(width, height);
        *size
    }
}

impl WindowHost for TestWindow {
    fn size(&self) -> WindowSize {
        *self.size.lock()
    }

    fn raw_window_handle(&self) -> RawWindowHandle {
        RawWindowHandle::Win32(Win32WindowHandle::new(NonZeroIsize::new(1).unwrap()))
    }
}
