mod common;

use core::time::Duration;
use std::sync::Arc;

use ff_dx12::{
    Error, GraphicsConfig, GraphicsContext, Resource,
    backend::{ResourceDesc, ResourceStates, sim::SimDevice},
};

use common::{config, context, init_tracing};

#[test]
fn fence_values_increase_and_never_repeat() {
    let (_device, context) = context();
    let queue = context.direct_queue();

    let mut last = queue.signal_fence().unwrap();
    for _ in 0..8 {
        let value = queue.signal_fence().unwrap();
        assert_eq!(value.fence().unwrap().id(), last.fence().unwrap().id());
        assert!(value.get() > last.get());
        assert!(value.covers(&last));
        last = value;
    }

    let first = queue.new_commands().unwrap().execute().unwrap();
    let second = queue.new_commands().unwrap().execute().unwrap();
    if first.fence().unwrap().id() == second.fence().unwrap().id() {
        assert!(second.get() > first.get());
    }
    assert!(first.complete() && second.complete());
}

#[test]
fn allocators_are_not_reused_before_their_work_completes() {
    let (device, context) = context();
    let queue = context.direct_queue();

    device.hold();
    let pending = (0..3)
        .map(|_| queue.new_commands().unwrap().execute().unwrap())
        .collect::<Vec<_>>();
    assert_eq!(queue.allocator_count(), 3);
    assert!(pending.iter().all(|value| !value.complete()));

    device.resume();
    assert!(pending.iter().all(|value| value.complete()));

    for _ in 0..16 {
        queue.new_commands().unwrap().execute().unwrap();
    }
    assert_eq!(queue.allocator_count(), 3);
    assert_eq!(device.stats().allocator_reset_violations, 0);
}

#[test]
fn wait_times_out_while_gpu_is_busy() {
    let (device, context) = context();
    let queue = context.direct_queue();

    device.hold();
    let value = queue.new_commands().unwrap().execute().unwrap();
    assert!(!value.wait(Some(Duration::from_millis(20))).unwrap());
    assert!(!queue.wait_for_idle(Some(Duration::from_millis(20))).unwrap());

    device.resume();
    assert!(value.wait(Some(Duration::from_millis(20))).unwrap());
}

#[test]
fn dropped_commands_roll_back_resource_tracking() {
    let (device, context) = context();
    let buffer = Resource::new(
        &context,
        "buffer",
        ResourceDesc::buffer(256),
        ResourceStates::COMMON,
        None,
    )
    .unwrap();

    {
        let mut commands = context.direct_queue().new_commands().unwrap();
        commands.transition(&buffer, ResourceStates::COPY_DEST);
        assert_eq!(buffer.current_state(), ResourceStates::COPY_DEST);
        assert!(!buffer.write_fence_value().complete());
    }

    assert_eq!(buffer.current_state(), ResourceStates::COMMON);
    assert!(buffer.write_fence_value().complete());

    let mut commands = context.direct_queue().new_commands().unwrap();
    commands.transition(&buffer, ResourceStates::UNORDERED_ACCESS);
    commands.execute().unwrap();

    let stats = device.stats();
    assert_eq!(stats.barriers, 1);
    assert_eq!(stats.barrier_mismatches, 0);
}

#[test]
fn discarded_commands_still_signal_their_fence() {
    let (_device, context) = context();
    let commands = context.direct_queue().new_commands().unwrap();
    let value = commands.next_fence_value();
    assert!(!value.complete());

    commands.discard();
    assert!(value.wait(Some(Duration::from_millis(100))).unwrap());
}

#[test]
fn commands_from_before_reset_are_stale() {
    let (device, context) = context();
    let buffer = Resource::new(
        &context,
        "buffer",
        ResourceDesc::buffer(1024),
        ResourceStates::COMMON,
        None,
    )
    .unwrap();
    buffer.update_buffer(None, 0, &[7; 1024]).unwrap();

    let stale = context.direct_queue().new_commands().unwrap();
    device.remove_device();

    let err = context.direct_queue().wait_for_idle(None).unwrap_err();
    assert!(err.is_device_lost());

    context.reset_device().unwrap();
    assert_eq!(device.stats().resets, 1);
    assert!(matches!(stale.execute(), Err(Error::StaleCommands)));

    // recreated resources keep working, their contents do not survive
    buffer.update_buffer(None, 16, &[3; 16]).unwrap();
    let bytes = buffer.capture_buffer(0, 32).unwrap();
    assert_eq!(&bytes[..16], &[0; 16]);
    assert_eq!(&bytes[16..], &[3; 16]);

    assert!(context.direct_queue().wait_for_idle(None).unwrap());
}

#[test]
fn keep_alive_holds_memory_until_gpu_is_done() {
    let (device, context) = context();
    let buffer = Resource::new(
        &context,
        "buffer",
        ResourceDesc::buffer(4096),
        ResourceStates::COMMON,
        None,
    )
    .unwrap();
    assert!(context.buffer_allocator().used_bytes() > 0);

    device.hold();
    let mut commands = context.direct_queue().new_commands().unwrap();
    commands.transition(&buffer, ResourceStates::COPY_DEST);
    let value = commands.execute().unwrap();

    drop(buffer);
    assert_eq!(context.keep_alive_count(), 1);
    assert_eq!(context.collect_garbage(), 0);
    assert!(context.buffer_allocator().used_bytes() > 0);

    device.resume();
    assert!(value.complete());
    assert_eq!(context.collect_garbage(), 1);
    assert_eq!(context.keep_alive_count(), 0);
    assert_eq!(context.buffer_allocator().used_bytes(), 0);
}

#[test]
fn allocation_reclaims_memory_of_finished_work() {
    init_tracing();
    let device = SimDevice::new();
    let context = GraphicsContext::new(
        Arc::new(device.clone()),
        GraphicsConfig {
            max_heaps: 1,
            ..config()
        },
    )
    .unwrap();

    let desc = ResourceDesc::buffer(1024 * 1024);
    let buffer = Resource::new(&context, "first", desc, ResourceStates::COMMON, None).unwrap();

    device.hold();
    let mut commands = context.direct_queue().new_commands().unwrap();
    buffer.update_buffer(Some(&mut commands), 0, &[1; 64]).unwrap();
    let value = commands.execute().unwrap();
    drop(buffer);
    assert_eq!(context.keep_alive_count(), 1);

    let pending = Resource::new(&context, "pending", desc, ResourceStates::COMMON, None);
    assert!(matches!(pending, Err(Error::OutOfMemory { .. })));

    device.resume();
    assert!(value.complete());
    let second = Resource::new(&context, "second", desc, ResourceStates::COMMON, None).unwrap();
    assert_eq!(context.keep_alive_count(), 0);
    assert!(second.mem_range().is_some());
}
