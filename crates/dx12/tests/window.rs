mod common;

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use ff_common::{PointSize, WindowSize};
use ff_dx12::{InlineDispatcher, Target, TargetWindow, WindowEvent, backend::ResourceStates};

use common::{TestWindow, context};

const CLEAR: Option<[f32; 4]> = Some([0.0, 0.0, 0.0, 1.0]);

fn render_frame(context: &ff_dx12::GraphicsContext, window: &TargetWindow) -> bool {
    let mut commands = context.direct_queue().new_commands().unwrap();
    assert!(window.frame_started(&mut commands, CLEAR).unwrap());
    window.present(commands).unwrap()
}

#[test]
fn back_buffers_rotate_on_present() {
    let (device, context) = context();
    let window = TargetWindow::new(
        &context,
        TestWindow::new(64, 32),
        Arc::new(InlineDispatcher),
    )
    .unwrap();
    assert!(window.is_valid());
    assert_eq!(window.back_buffer_count(), 2);
    assert_eq!(window.size().pixel_size, PointSize::new(64, 32));

    let presented = Arc::new(AtomicUsize::new(0));
    window.on_render_presented({
        let presented = presented.clone();
        move |_| {
            presented.fetch_add(1, Ordering::Relaxed);
        }
    });

    for frame in 0..4 {
        assert!(window.wait_for_render_ready().unwrap());
        assert_eq!(window.back_buffer_index(), frame % 2);
        assert!(render_frame(&context, &window));
        assert_eq!(
            window.with_back_buffer(|buffer| buffer.current_state()),
            Some(ResourceStates::PRESENT)
        );
    }

    assert_eq!(presented.load(Ordering::Relaxed), 4);
    let stats = device.stats();
    assert_eq!(stats.presents, 4);
    assert_eq!(stats.barrier_mismatches, 0);
}

#[test]
fn busy_back_buffer_is_not_ready() {
    let (device, context) = context();
    let window = TargetWindow::new(
        &context,
        TestWindow::new(64, 32),
        Arc::new(InlineDispatcher),
    )
    .unwrap();

    device.hold();
    assert!(window.wait_for_render_ready().unwrap());
    assert!(render_frame(&context, &window));
    // the second buffer was never rendered to
    assert!(window.wait_for_render_ready().unwrap());
    assert!(render_frame(&context, &window));

    // back at the first buffer, whose frame is still queued
    assert!(!window.wait_for_render_ready().unwrap());

    device.resume();
    assert!(window.wait_for_render_ready().unwrap());
}

#[test]
fn resize_is_deferred_to_the_render_thread() {
    let (device, context) = context();
    let host = TestWindow::new(64, 32);
    let window = TargetWindow::new(&context, host.clone(), Arc::new(InlineDispatcher)).unwrap();

    let notified = Arc::new(AtomicUsize::new(0));
    window.on_size_changed({
        let notified = notified.clone();
        move |_| {
            notified.fetch_add(1, Ordering::Relaxed);
        }
    });

    assert!(window.wait_for_render_ready().unwrap());
    assert!(render_frame(&context, &window));

    let size = host.resize(128, 96);
    window.window_event(WindowEvent::Resized(size));
    assert_eq!(window.size().pixel_size, PointSize::new(64, 32));

    assert!(window.wait_for_render_ready().unwrap());
    assert_eq!(window.size().pixel_size, PointSize::new(128, 96));
    assert_eq!(window.with_back_buffer(|buffer| buffer.desc().width), Some(128));
    assert_eq!(notified.load(Ordering::Relaxed), 1);

    // minimized windows keep their buffers
    window.window_event(WindowEvent::Resized(WindowSize::new(PointSize::ZERO, 1.0)));
    assert!(window.wait_for_render_ready().unwrap());
    assert_eq!(window.size().pixel_size, PointSize::new(128, 96));
    assert_eq!(notified.load(Ordering::Relaxed), 1);

    assert!(render_frame(&context, &window));
    assert_eq!(device.stats().barrier_mismatches, 0);
}

#[test]
fn full_screen_follows_window_events() {
    let (_device, context) = context();
    let window = TargetWindow::new(
        &context,
        TestWindow::new(64, 32),
        Arc::new(InlineDispatcher),
    )
    .unwrap();
    assert!(window.allow_full_screen());
    assert!(!window.full_screen());

    window.window_event(WindowEvent::ToggleFullScreen);
    assert!(!window.full_screen());
    assert!(window.wait_for_render_ready().unwrap());
    assert!(window.full_screen());

    window.window_event(WindowEvent::Deactivated);
    assert!(window.wait_for_render_ready().unwrap());
    assert!(!window.full_screen());

    assert!(window.set_full_screen(true).unwrap());
    assert!(!window.set_full_screen(true).unwrap());

    window.window_event(WindowEvent::Destroyed);
    assert!(!window.wait_for_render_ready().unwrap());
    assert!(!window.is_valid());
    assert!(window.full_screen());

    let commands = context.direct_queue().new_commands().unwrap();
    assert!(!window.present(commands).unwrap());
}

#[test]
fn window_survives_device_reset() {
    let (device, context) = context();
    let window = TargetWindow::new(
        &context,
        TestWindow::new(64, 32),
        Arc::new(InlineDispatcher),
    )
    .unwrap();
    assert!(window.set_full_screen(true).unwrap());
    assert!(window.wait_for_render_ready().unwrap());

    let mut commands = context.direct_queue().new_commands().unwrap();
    assert!(window.frame_started(&mut commands, CLEAR).unwrap());
    device.remove_device();
    let err = window.present(commands).unwrap_err();
    assert!(err.is_device_lost());

    context.reset_device().unwrap();
    assert!(window.is_valid());
    assert!(window.full_screen());
    assert_eq!(window.back_buffer_count(), 2);

    assert!(window.wait_for_render_ready().unwrap());
    assert!(render_frame(&context, &window));
    assert_eq!(device.stats().resets, 1);
}
