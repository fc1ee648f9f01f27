mod common;

use std::sync::Arc;

use ff_common::{Format, Image, PointSize, RectSize};
use ff_dx12::{
    Error, Resource, Target, TargetTexture,
    backend::{ResourceDesc, ResourceFlags, ResourceStates},
};

use common::context;

fn buffer(context: &ff_dx12::GraphicsContext, size: u64) -> Resource {
    Resource::new(
        context,
        "buffer",
        ResourceDesc::buffer(size),
        ResourceStates::COMMON,
        None,
    )
    .unwrap()
}

fn gradient(width: usize, height: usize, seed: u8) -> Image {
    let pixels = (0..width * height * 4)
        .map(|i| (i as u8).wrapping_mul(3).wrapping_add(seed))
        .collect();
    Image::from_pixels(Format::R8G8B8A8Unorm, width, height, pixels).unwrap()
}

#[test]
fn readers_wait_for_writer_and_writer_waits_for_readers() {
    let (device, context) = context();
    let buffer = buffer(&context, 1024);

    device.hold();
    let mut writer = context.direct_queue().new_commands().unwrap();
    writer.transition(&buffer, ResourceStates::COPY_DEST);
    let write = writer.execute().unwrap();
    assert_eq!(buffer.write_fence_value(), write);

    let reads = [
        context.compute_queue(),
        context.copy_queue(),
        context.compute_queue(),
        context.copy_queue(),
    ]
    .map(|queue| {
        let mut reader = queue.new_commands().unwrap();
        reader.transition(&buffer, ResourceStates::NON_PIXEL_SHADER_RESOURCE);
        assert!(reader.pending_waits().covers(&write));
        let read = reader.execute().unwrap();
        assert!(buffer.read_fence_values().covers(&read));
        read
    });

    let mut second_writer = context.direct_queue().new_commands().unwrap();
    second_writer.transition(&buffer, ResourceStates::UNORDERED_ACCESS);
    for read in &reads {
        assert!(second_writer.pending_waits().covers(read));
    }
    assert!(second_writer.pending_waits().covers(&write));
    assert!(buffer.read_fence_values().is_empty());
    let second_write = second_writer.execute().unwrap();
    assert_eq!(buffer.write_fence_value(), second_write);

    let mut last_reader = context.copy_queue().new_commands().unwrap();
    last_reader.transition(&buffer, ResourceStates::COPY_SOURCE);
    assert_eq!(last_reader.pending_waits().len(), 1);
    assert!(last_reader.pending_waits().covers(&second_write));
    let last_read = last_reader.execute().unwrap();

    assert!(device.pending_work(ff_dx12::backend::QueueKind::Compute) > 0);
    device.resume();
    assert!(second_write.complete() && last_read.complete());
    assert_eq!(device.stats().barrier_mismatches, 0);
}

#[test]
fn barrier_is_skipped_when_state_is_unchanged() {
    let (device, context) = context();
    let buffer = buffer(&context, 256);

    let mut commands = context.direct_queue().new_commands().unwrap();
    commands.transition(&buffer, ResourceStates::COPY_DEST);
    commands.transition(&buffer, ResourceStates::COPY_DEST);
    assert_eq!(
        commands
            .resource_barrier(&buffer, ResourceStates::COPY_DEST)
            .unwrap(),
        ResourceStates::COPY_DEST
    );
    assert_eq!(commands.barrier_count(), 1);

    commands
        .resource_barrier(&buffer, ResourceStates::COPY_SOURCE)
        .unwrap();
    assert_eq!(commands.barrier_count(), 2);
    commands.execute().unwrap();

    assert_eq!(device.stats().barriers, 2);
    assert_eq!(device.stats().barrier_mismatches, 0);
}

#[test]
fn buffer_round_trip() {
    let (device, context) = context();
    let buffer = buffer(&context, 1024);

    let data = (0..256u32).collect::<Vec<_>>();
    buffer.update_buffer_pod(None, 0, &data).unwrap();
    let bytes = buffer.capture_buffer(0, 1024).unwrap();
    assert_eq!(bytes, bytemuck::cast_slice::<u32, u8>(&data));

    let bytes = buffer.capture_buffer(16, 8).unwrap();
    assert_eq!(bytes, bytemuck::cast_slice::<u32, u8>(&data[4..6]));
    assert_eq!(device.stats().copy_errors, 0);
}

#[test]
fn upload_ring_wraps_across_many_updates() {
    let (_device, context) = context();
    let buffer = buffer(&context, 64 * 1024);

    // four times the ring size in total
    for i in 0..16u8 {
        buffer.update_buffer(None, 0, &vec![i; 64 * 1024]).unwrap();
    }

    let bytes = buffer.capture_buffer(0, 64 * 1024).unwrap();
    assert!(bytes.iter().all(|&b| b == 15));
}

#[test]
fn out_of_range_updates_are_rejected() {
    let (_device, context) = context();
    let buffer = buffer(&context, 64);

    assert!(buffer.update_buffer(None, 60, &[0; 8]).is_err());
    assert!(matches!(
        buffer.update_buffer(None, u64::MAX, &[1]),
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        buffer.readback_buffer(None, u64::MAX, 2),
        Err(Error::InvalidArgument(_))
    ));
    assert!(buffer.readback_buffer(None, 0, 0).is_err());
    assert!(buffer.update_buffer(None, 0, &[]).unwrap().complete());
}

#[test]
fn texture_updates_stay_within_one_mip_chain() {
    let (_device, context) = context();
    let texture = Resource::new(
        &context,
        "texture",
        ResourceDesc::texture_2d(Format::R8G8B8A8Unorm, 16, 16, 2, 3),
        ResourceStates::COMMON,
        None,
    )
    .unwrap();

    let crossing = [gradient(8, 8, 0), gradient(4, 4, 1), gradient(16, 16, 2)];
    assert!(matches!(
        texture.update_texture(None, &crossing, 1, PointSize::ZERO),
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        texture.update_texture(None, &crossing[..1], usize::MAX, PointSize::ZERO),
        Err(Error::InvalidArgument(_))
    ));

    texture
        .update_texture(None, &crossing[..2], 1, PointSize::ZERO)
        .unwrap();
    let scratch = texture.capture_texture(1, 2, None).unwrap();
    for (image, expected) in scratch.images().iter().zip(&crossing) {
        assert_eq!(image.to_tight().pixels, expected.pixels);
    }
}

#[test]
fn texture_round_trip() {
    let (device, context) = context();
    let texture = Resource::new(
        &context,
        "texture",
        ResourceDesc::texture_2d(Format::R8G8B8A8Unorm, 16, 8, 1, 2),
        ResourceStates::COMMON,
        None,
    )
    .unwrap();
    assert!(texture.mem_range().is_some());

    let mips = [gradient(16, 8, 1), gradient(8, 4, 2)];
    texture
        .update_texture(None, &mips, 0, PointSize::ZERO)
        .unwrap();

    let scratch = texture.capture_texture(0, 2, None).unwrap();
    assert_eq!(scratch.mip_levels(), 2);
    for (image, expected) in scratch.images().iter().zip(&mips) {
        assert_eq!(image.to_tight().pixels, expected.pixels);
    }

    let data = texture
        .readback_texture(None, 0, 1, Some(RectSize::new(4, 2, 12, 6)))
        .unwrap();
    let image = data.image(0).unwrap();
    assert_eq!((image.width, image.height), (8, 4));
    assert_eq!(image.row(0), &mips[0].row(2)[4 * 4..12 * 4]);
    assert_eq!(device.stats().copy_errors, 0);
}

#[test]
fn partial_texture_update_lands_at_position() {
    let (_device, context) = context();
    let texture = Resource::new(
        &context,
        "texture",
        ResourceDesc::texture_2d(Format::R8G8B8A8Unorm, 8, 8, 1, 1),
        ResourceStates::COMMON,
        None,
    )
    .unwrap();

    let patch = gradient(2, 2, 9);
    texture
        .update_texture(None, &[patch.clone()], 0, PointSize::new(4, 4))
        .unwrap();
    assert!(
        texture
            .update_texture(None, &[patch.clone()], 0, PointSize::new(7, 7))
            .is_err()
    );

    let scratch = texture.capture_texture(0, 1, None).unwrap();
    let image = &scratch.images()[0];
    assert_eq!(&image.row(4)[16..24], patch.row(0));
    assert_eq!(&image.row(5)[16..24], patch.row(1));
    assert!(image.row(3).iter().all(|&b| b == 0));
}

#[test]
fn duplicate_copies_contents() {
    let (_device, context) = context();
    let buffer = buffer(&context, 128);
    buffer.update_buffer(None, 0, &[42; 128]).unwrap();

    let copy = buffer.duplicate(None).unwrap();
    assert_ne!(copy.id(), buffer.id());
    assert_eq!(copy.capture_buffer(0, 128).unwrap(), vec![42; 128]);
}

#[test]
fn aliased_resources_take_turns() {
    let (_device, context) = context();
    let range = context
        .buffer_allocator()
        .alloc_bytes(64 * 1024, 64 * 1024)
        .unwrap();

    let first = Resource::with_mem_range(
        &context,
        "first",
        ResourceDesc::buffer(1024),
        ResourceStates::COMMON,
        None,
        range.clone(),
    )
    .unwrap();
    let second = Resource::with_mem_range(
        &context,
        "second",
        ResourceDesc::buffer(2048),
        ResourceStates::COMMON,
        None,
        range.clone(),
    )
    .unwrap();

    assert!(first.is_active());
    assert!(!second.is_active());
    assert_eq!(range.active_resource(), Some(first.id()));

    first.activate(false, None);
    let mut commands = context.direct_queue().new_commands().unwrap();
    assert!(second.activate(true, Some(&mut commands)));
    commands.execute().unwrap();
    assert!(second.is_active());

    drop(second);
    assert_eq!(range.active_resource(), None);
}

#[test]
#[cfg(debug_assertions)]
#[should_panic(expected = "memory range is still active")]
fn claiming_memory_held_by_another_resource_panics() {
    let (_device, context) = context();
    let range = context
        .buffer_allocator()
        .alloc_bytes(64 * 1024, 64 * 1024)
        .unwrap();

    let _first = Resource::with_mem_range(
        &context,
        "first",
        ResourceDesc::buffer(1024),
        ResourceStates::COMMON,
        None,
        range.clone(),
    )
    .unwrap();
    let second = Resource::with_mem_range(
        &context,
        "second",
        ResourceDesc::buffer(1024),
        ResourceStates::COMMON,
        None,
        range,
    )
    .unwrap();

    second.activate(true, None);
}

#[test]
fn target_texture_clears_one_mip() {
    let (device, context) = context();
    let texture = Resource::new(
        &context,
        "target",
        ResourceDesc::texture_2d(Format::R8G8B8A8Unorm, 32, 16, 2, 2)
            .with_flags(ResourceFlags::ALLOW_RENDER_TARGET),
        ResourceStates::PRESENT,
        None,
    )
    .unwrap();
    // render targets get their own memory
    assert!(texture.mem_range().is_none());

    let target = TargetTexture::new(Arc::new(texture), 1, 0, 1).unwrap();
    assert_eq!(target.target_array_size(), 1);
    assert_eq!(target.size().pixel_size, PointSize::new(16, 8));

    let mut commands = context.direct_queue().new_commands().unwrap();
    target
        .begin_render(&mut commands, Some([1.0, 0.0, 0.0, 1.0]))
        .unwrap();
    target.end_render(&mut commands);
    commands.execute().unwrap();

    let texture = target.shared_texture();
    assert_eq!(texture.current_state(), ResourceStates::PRESENT);
    let scratch = texture.capture_texture(0, 4, None).unwrap();
    assert_eq!(&scratch.images()[3].row(0)[..4], &[255, 0, 0, 255]);
    assert_eq!(device.stats().barrier_mismatches, 0);

    let plain = Resource::new(
        &context,
        "plain",
        ResourceDesc::texture_2d(Format::R8G8B8A8Unorm, 4, 4, 1, 1),
        ResourceStates::COMMON,
        None,
    )
    .unwrap();
    assert!(TargetTexture::new(Arc::new(plain), 0, 0, 0).is_err());
}
