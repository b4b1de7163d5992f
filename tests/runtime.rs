//! End-to-end tests. They require a working Vulkan driver and skip
//! themselves when none is present (CI machines rarely have a GPU).

use scoria::{
    record::Record, Access, BufferDesc, BufferUse, Executor, ExecutorState, HostAccess,
    PushConstantBlock, QueueRole, ResourceManager, Runtime, RuntimeError, RuntimeOptions,
    TableKind,
};
use smallvec::smallvec;

fn runtime() -> Option<Runtime> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    match Runtime::new(RuntimeOptions::default()) {
        Ok(runtime) => Some(runtime),
        Err(err) => {
            eprintln!("skipping: no usable Vulkan runtime ({err})");
            None
        }
    }
}

#[test]
fn buffer_copy_round_trip() {
    let Some(runtime) = runtime() else { return };
    let ctx = runtime.device(0).clone();
    let resources = ResourceManager::new(ctx.device().clone()).unwrap();

    let payload: Vec<u8> = (0..=255).collect();
    let src = resources
        .create_buffer(&BufferDesc {
            size: payload.len() as u64,
            host_access: HostAccess::SequentialWrite,
            ..Default::default()
        })
        .unwrap();
    src.write().write_mapped(0, &payload).unwrap();

    let dst = resources
        .create_buffer(&BufferDesc {
            size: payload.len() as u64,
            host_access: HostAccess::Random,
            ..Default::default()
        })
        .unwrap();

    let mut executor = Executor::new(
        ctx.clone(),
        resources.tables().clone(),
        QueueRole::Transfer,
    );
    executor.begin().unwrap();
    executor
        .push(Record::CopyBuffer {
            src: src.clone(),
            dst: dst.clone(),
            regions: smallvec![scoria::vk::BufferCopy {
                src_offset: 0,
                dst_offset: 0,
                size: payload.len() as u64,
            }],
        })
        .unwrap();
    let submission = executor.commit().unwrap().unwrap();
    submission.wait_blocked().unwrap();

    let guard = dst.read();
    let mapped = guard.mapped_ptr().unwrap();
    let result = unsafe { std::slice::from_raw_parts(mapped, payload.len()) };
    assert_eq!(result, payload.as_slice());
}

#[test]
fn timeline_advances_per_commit() {
    let Some(runtime) = runtime() else { return };
    let ctx = runtime.device(0).clone();
    let resources = ResourceManager::new(ctx.device().clone()).unwrap();

    let buffer = resources
        .create_buffer(&BufferDesc {
            size: 64,
            host_access: HostAccess::SequentialWrite,
            ..Default::default()
        })
        .unwrap();
    let scratch = resources
        .create_buffer(&BufferDesc {
            size: 64,
            ..Default::default()
        })
        .unwrap();

    let mut executor = Executor::new(
        ctx.clone(),
        resources.tables().clone(),
        QueueRole::Transfer,
    );
    let mut values = Vec::new();
    for _ in 0..2 {
        executor.begin().unwrap();
        executor
            .push(Record::CopyBuffer {
                src: buffer.clone(),
                dst: scratch.clone(),
                regions: smallvec![scoria::vk::BufferCopy {
                    src_offset: 0,
                    dst_offset: 0,
                    size: 64,
                }],
            })
            .unwrap();
        let submission = executor.commit().unwrap().unwrap();
        submission.wait_blocked().unwrap();
        assert!(submission.is_complete());
        values.push(submission);
        executor.reset();
    }
    // Both batches landed; the second could not have reused the first's
    // timeline point.
    assert!(values[1].is_complete());
}

#[test]
fn cross_executor_wait_orders_batches() {
    let Some(runtime) = runtime() else { return };
    let ctx = runtime.device(0).clone();
    let resources = ResourceManager::new(ctx.device().clone()).unwrap();

    let payload = vec![0xA5u8; 128];
    let staging = resources
        .create_buffer(&BufferDesc {
            size: 128,
            host_access: HostAccess::SequentialWrite,
            ..Default::default()
        })
        .unwrap();
    staging.write().write_mapped(0, &payload).unwrap();
    let middle = resources
        .create_buffer(&BufferDesc {
            size: 128,
            ..Default::default()
        })
        .unwrap();
    let readback = resources
        .create_buffer(&BufferDesc {
            size: 128,
            host_access: HostAccess::Random,
            ..Default::default()
        })
        .unwrap();

    let region = smallvec![scoria::vk::BufferCopy {
        src_offset: 0,
        dst_offset: 0,
        size: 128,
    }];

    let mut producer = Executor::new(
        ctx.clone(),
        resources.tables().clone(),
        QueueRole::Transfer,
    );
    producer.begin().unwrap();
    producer
        .push(Record::CopyBuffer {
            src: staging.clone(),
            dst: middle.clone(),
            regions: region.clone(),
        })
        .unwrap();
    let upstream = producer.commit().unwrap().unwrap();

    let mut consumer = Executor::new(
        ctx.clone(),
        resources.tables().clone(),
        QueueRole::Transfer,
    );
    consumer.begin().unwrap();
    consumer.wait(upstream).unwrap();
    consumer
        .push(Record::CopyBuffer {
            src: middle.clone(),
            dst: readback.clone(),
            regions: region,
        })
        .unwrap();
    let downstream = consumer.commit().unwrap().unwrap();
    downstream.wait_blocked().unwrap();

    let guard = readback.read();
    let mapped = guard.mapped_ptr().unwrap();
    let result = unsafe { std::slice::from_raw_parts(mapped, 128) };
    assert_eq!(result, payload.as_slice());
}

#[test]
fn executor_state_machine_is_enforced() {
    let Some(runtime) = runtime() else { return };
    let ctx = runtime.device(0).clone();
    let resources = ResourceManager::new(ctx.device().clone()).unwrap();
    let buffer = resources
        .create_buffer(&BufferDesc {
            size: 16,
            ..Default::default()
        })
        .unwrap();

    let mut executor = Executor::new(
        ctx.clone(),
        resources.tables().clone(),
        QueueRole::Compute,
    );
    // Push and commit both need an active recording.
    let err = executor
        .push(Record::CopyBuffer {
            src: buffer.clone(),
            dst: buffer.clone(),
            regions: smallvec![],
        })
        .unwrap_err();
    assert!(matches!(err, RuntimeError::InvalidExecutorState { .. }));
    assert!(matches!(
        executor.commit(),
        Err(RuntimeError::InvalidExecutorState { .. })
    ));

    executor.begin().unwrap();
    assert_eq!(executor.state(), ExecutorState::Recording);
    assert!(executor.begin().is_err());
    executor.reset();
    assert_eq!(executor.state(), ExecutorState::Idle);
}

#[test]
fn descriptor_store_is_idempotent() {
    let Some(runtime) = runtime() else { return };
    let ctx = runtime.device(0).clone();
    let resources = ResourceManager::new(ctx.device().clone()).unwrap();
    let buffer = resources
        .create_buffer(&BufferDesc {
            size: 256,
            usage: scoria::vk::BufferUsageFlags::STORAGE_BUFFER,
            ..Default::default()
        })
        .unwrap();

    let first = resources
        .store_buffer_descriptor(&buffer, TableKind::StorageBuffer)
        .unwrap();
    let second = resources
        .store_buffer_descriptor(&buffer, TableKind::StorageBuffer)
        .unwrap();
    assert_eq!(first, second);

    // A different table gets its own index space.
    let uniform = resources
        .store_buffer_descriptor(&buffer, TableKind::UniformBuffer)
        .unwrap();
    let _ = uniform;

    let image = resources
        .create_image(&scoria::ImageDesc {
            format: scoria::vk::Format::R8G8B8A8_UNORM,
            extent: scoria::vk::Extent3D {
                width: 16,
                height: 16,
                depth: 1,
            },
            usage: scoria::vk::ImageUsageFlags::STORAGE,
            mip_levels: 4,
            ..Default::default()
        })
        .unwrap();
    let whole = resources
        .store_image_descriptor(&image, TableKind::StorageImage)
        .unwrap();
    let mip2 = resources
        .store_image_descriptor_mip(&image, TableKind::StorageImage, 2)
        .unwrap();
    assert_ne!(whole, mip2);
    assert_eq!(
        resources
            .store_image_descriptor_mip(&image, TableKind::StorageImage, 2)
            .unwrap(),
        mip2
    );
}

#[test]
fn heap_accounting_tracks_allocations() {
    let Some(runtime) = runtime() else { return };
    let ctx = runtime.device(0).clone();
    let resources = ResourceManager::new(ctx.device().clone()).unwrap();

    let before = resources.memory_usage();
    let buffer = resources
        .create_buffer(&BufferDesc {
            size: 1 << 20,
            ..Default::default()
        })
        .unwrap();
    let during = resources.memory_usage();
    let total_during = during.device_local + during.host_shared + during.multi_instance;
    let total_before = before.device_local + before.host_shared + before.multi_instance;
    assert!(total_during >= total_before + (1 << 20));

    resources.destroy_buffer(buffer).unwrap();
    let after = resources.memory_usage();
    let total_after = after.device_local + after.host_shared + after.multi_instance;
    assert_eq!(total_after, total_before);
}

#[test]
fn pick_available_queues_never_blocks() {
    let Some(runtime) = runtime() else { return };
    let ctx = runtime.device(0).clone();

    let all = ctx.pick_available_queues(|_| true);
    assert!(!all.is_empty());
    // Guards hold the queues; a second pick sees none available.
    let none = ctx.pick_available_queues(|_| true);
    assert!(none.is_empty());
    drop(all);

    let transfers_only =
        ctx.pick_available_queues(|queue| queue.role() == QueueRole::Transfer);
    for guard in &transfers_only {
        assert_eq!(guard.queue().role(), QueueRole::Transfer);
    }
}

#[test]
fn empty_commit_skips_submission() {
    let Some(runtime) = runtime() else { return };
    let ctx = runtime.device(0).clone();
    let resources = ResourceManager::new(ctx.device().clone()).unwrap();
    let buffer = resources
        .create_buffer(&BufferDesc {
            size: 16,
            ..Default::default()
        })
        .unwrap();

    // Nothing pushed: no queue work, no timeline tick.
    let mut executor = Executor::new(
        ctx.clone(),
        resources.tables().clone(),
        QueueRole::Transfer,
    );
    executor.begin().unwrap();
    assert!(executor.commit().unwrap().is_none());
    assert_eq!(executor.state(), ExecutorState::Committed);
    executor.reset();

    // A batch whose only record was role-dropped is empty too.
    executor.begin().unwrap();
    executor
        .push(Record::ComputeDispatch {
            pipeline: scoria::vk::Pipeline::null(),
            layout: scoria::vk::PipelineLayout::null(),
            push_constants: None,
            group_counts: glam::UVec3::ONE,
            buffers: vec![BufferUse {
                buffer: buffer.clone(),
                access: Access {
                    stage: scoria::vk::PipelineStageFlags2::COMPUTE_SHADER,
                    access: scoria::vk::AccessFlags2::SHADER_STORAGE_WRITE,
                },
            }],
            images: Vec::new(),
        })
        .unwrap();
    assert!(executor.commit().unwrap().is_none());
}

#[test]
fn last_handle_drop_waits_for_in_flight_work() {
    let Some(runtime) = runtime() else { return };
    let ctx = runtime.device(0).clone();
    let resources = ResourceManager::new(ctx.device().clone()).unwrap();

    let payload = vec![0x5Au8; 4096];
    let src = resources
        .create_buffer(&BufferDesc {
            size: 4096,
            host_access: HostAccess::SequentialWrite,
            ..Default::default()
        })
        .unwrap();
    src.write().write_mapped(0, &payload).unwrap();
    let dst = resources
        .create_buffer(&BufferDesc {
            size: 4096,
            host_access: HostAccess::Random,
            ..Default::default()
        })
        .unwrap();

    let mut executor = Executor::new(
        ctx.clone(),
        resources.tables().clone(),
        QueueRole::Transfer,
    );
    executor.begin().unwrap();
    executor
        .push(Record::CopyBuffer {
            src: src.clone(),
            dst: dst.clone(),
            regions: smallvec![scoria::vk::BufferCopy {
                src_offset: 0,
                dst_offset: 0,
                size: 4096,
            }],
        })
        .unwrap();

    // A handle dropped before commit: the record's clone must carry the
    // scratch buffer through encoding and submission.
    let scratch = resources
        .create_buffer(&BufferDesc {
            size: 4096,
            ..Default::default()
        })
        .unwrap();
    executor
        .push(Record::CopyBuffer {
            src: src.clone(),
            dst: scratch.clone(),
            regions: smallvec![scoria::vk::BufferCopy {
                src_offset: 0,
                dst_offset: 0,
                size: 4096,
            }],
        })
        .unwrap();
    drop(scratch);

    let submission = executor.commit().unwrap().unwrap();

    // Dropping the source right after commit must stall until the copy has
    // retired rather than free memory the queue is still reading.
    drop(src);
    assert!(submission.is_complete());

    let guard = dst.read();
    let mapped = guard.mapped_ptr().unwrap();
    let result = unsafe { std::slice::from_raw_parts(mapped, 4096) };
    assert_eq!(result, payload.as_slice());
}

#[test]
fn compute_dispatch_inverts_pixels() {
    let Some(runtime) = runtime() else { return };
    let ctx = runtime.device(0).clone();
    let resources = ResourceManager::new(ctx.device().clone()).unwrap();

    const PIXEL_COUNT: usize = 64 * 64;
    const RED: u32 = 0xFF0000FF;
    const CYAN: u32 = 0xFFFFFF00;

    let pixels = resources
        .create_buffer(&BufferDesc {
            size: (PIXEL_COUNT * 4) as u64,
            usage: scoria::vk::BufferUsageFlags::STORAGE_BUFFER,
            host_access: HostAccess::Random,
            ..Default::default()
        })
        .unwrap();
    pixels
        .write()
        .write_mapped(0, bytemuck::cast_slice(&vec![RED; PIXEL_COUNT]))
        .unwrap();
    let index = resources
        .store_buffer_descriptor(&pixels, TableKind::StorageBuffer)
        .unwrap();

    let device = ctx.device().clone();
    let tables = resources.tables();
    let shader_info = scoria::vk::ShaderModuleCreateInfo {
        code_size: INVERT_SPV.len() * 4,
        p_code: INVERT_SPV.as_ptr(),
        ..Default::default()
    };
    let module = unsafe { device.create_shader_module(&shader_info, None) }.unwrap();
    let set_layouts: Vec<scoria::vk::DescriptorSetLayout> = TableKind::ALL
        .iter()
        .map(|kind| tables.layout(*kind))
        .collect();
    let push_range = scoria::vk::PushConstantRange {
        stage_flags: scoria::vk::ShaderStageFlags::ALL,
        offset: 0,
        size: 8,
    };
    let layout_info = scoria::vk::PipelineLayoutCreateInfo {
        set_layout_count: set_layouts.len() as u32,
        p_set_layouts: set_layouts.as_ptr(),
        push_constant_range_count: 1,
        p_push_constant_ranges: &push_range,
        ..Default::default()
    };
    let layout = unsafe { device.create_pipeline_layout(&layout_info, None) }.unwrap();
    let pipeline_info = scoria::vk::ComputePipelineCreateInfo {
        stage: scoria::vk::PipelineShaderStageCreateInfo {
            stage: scoria::vk::ShaderStageFlags::COMPUTE,
            module,
            p_name: c"main".as_ptr(),
            ..Default::default()
        },
        layout,
        ..Default::default()
    };
    let pipeline = unsafe {
        device.create_compute_pipelines(
            scoria::vk::PipelineCache::null(),
            &[pipeline_info],
            None,
        )
    }
    .map_err(|(_, err)| err)
    .unwrap()[0];

    let push = PushConstantBlock::new(8);
    push.write(0, &index).unwrap();
    push.write(4, &(PIXEL_COUNT as u32)).unwrap();

    let mut executor = Executor::new(ctx.clone(), tables.clone(), QueueRole::Compute);
    executor.begin().unwrap();
    executor
        .push(Record::ComputeDispatch {
            pipeline,
            layout,
            push_constants: Some(push),
            group_counts: glam::UVec3::new((PIXEL_COUNT / 64) as u32, 1, 1),
            buffers: vec![BufferUse {
                buffer: pixels.clone(),
                access: Access {
                    stage: scoria::vk::PipelineStageFlags2::COMPUTE_SHADER,
                    access: scoria::vk::AccessFlags2::SHADER_STORAGE_READ
                        | scoria::vk::AccessFlags2::SHADER_STORAGE_WRITE,
                },
            }],
            images: Vec::new(),
        })
        .unwrap();
    let submission = executor.commit().unwrap().unwrap();
    submission.wait_blocked().unwrap();

    {
        let guard = pixels.read();
        let mapped = guard.mapped_ptr().unwrap();
        let result =
            unsafe { std::slice::from_raw_parts(mapped as *const u32, PIXEL_COUNT) };
        assert!(result.iter().all(|px| *px == CYAN));
    }

    unsafe {
        device.device_wait_idle().unwrap();
        device.destroy_pipeline(pipeline, None);
        device.destroy_pipeline_layout(layout, None);
        device.destroy_shader_module(module, None);
    }
}

/// Invert-RGB compute kernel, `local_size_x = 64`, built against the four
/// bindless tables. Push constants are `{ buffer_index: u32, count: u32 }`;
/// each invocation XORs one packed RGBA8 texel in
/// `storage_buffers[buffer_index]` with `0x00FFFFFF`, leaving alpha alone.
#[rustfmt::skip]
const INVERT_SPV: &[u32] = &[
    0x07230203, 0x00010500, 0x00000000, 0x00000024, 0x00000000, 0x00020011,
    0x00000001, 0x00020011, 0x000014b6, 0x0003000e, 0x00000000, 0x00000001,
    0x0008000f, 0x00000005, 0x00000016, 0x6e69616d, 0x00000000, 0x00000006,
    0x0000000c, 0x00000010, 0x00060010, 0x00000016, 0x00000011, 0x00000040,
    0x00000001, 0x00000001, 0x00040047, 0x00000006, 0x0000000b, 0x0000001c,
    0x00040047, 0x00000008, 0x00000006, 0x00000004, 0x00050048, 0x00000009,
    0x00000000, 0x00000023, 0x00000000, 0x00030047, 0x00000009, 0x00000002,
    0x00040047, 0x0000000c, 0x00000022, 0x00000002, 0x00040047, 0x0000000c,
    0x00000021, 0x00000000, 0x00050048, 0x0000000e, 0x00000000, 0x00000023,
    0x00000000, 0x00050048, 0x0000000e, 0x00000001, 0x00000023, 0x00000004,
    0x00030047, 0x0000000e, 0x00000002, 0x00020013, 0x00000001, 0x00030021,
    0x00000002, 0x00000001, 0x00040015, 0x00000003, 0x00000020, 0x00000000,
    0x00040017, 0x00000004, 0x00000003, 0x00000003, 0x00040020, 0x00000005,
    0x00000001, 0x00000004, 0x0004003b, 0x00000005, 0x00000006, 0x00000001,
    0x00040020, 0x00000007, 0x00000001, 0x00000003, 0x0003001d, 0x00000008,
    0x00000003, 0x0003001e, 0x00000009, 0x00000008, 0x0003001d, 0x0000000a,
    0x00000009, 0x00040020, 0x0000000b, 0x0000000c, 0x0000000a, 0x0004003b,
    0x0000000b, 0x0000000c, 0x0000000c, 0x00040020, 0x0000000d, 0x0000000c,
    0x00000003, 0x0004001e, 0x0000000e, 0x00000003, 0x00000003, 0x00040020,
    0x0000000f, 0x00000009, 0x0000000e, 0x0004003b, 0x0000000f, 0x00000010,
    0x00000009, 0x00040020, 0x00000011, 0x00000009, 0x00000003, 0x00020014,
    0x00000012, 0x0004002b, 0x00000003, 0x00000013, 0x00000000, 0x0004002b,
    0x00000003, 0x00000014, 0x00000001, 0x0004002b, 0x00000003, 0x00000015,
    0x00ffffff, 0x00050036, 0x00000001, 0x00000016, 0x00000000, 0x00000002,
    0x000200f8, 0x00000017, 0x00050041, 0x00000007, 0x00000018, 0x00000006,
    0x00000013, 0x0004003d, 0x00000003, 0x00000019, 0x00000018, 0x00050041,
    0x00000011, 0x0000001a, 0x00000010, 0x00000014, 0x0004003d, 0x00000003,
    0x0000001b, 0x0000001a, 0x000500b0, 0x00000012, 0x0000001c, 0x00000019,
    0x0000001b, 0x000300f7, 0x0000001e, 0x00000000, 0x000400fa, 0x0000001c,
    0x0000001d, 0x0000001e, 0x000200f8, 0x0000001d, 0x00050041, 0x00000011,
    0x0000001f, 0x00000010, 0x00000013, 0x0004003d, 0x00000003, 0x00000020,
    0x0000001f, 0x00070041, 0x0000000d, 0x00000021, 0x0000000c, 0x00000020,
    0x00000013, 0x00000019, 0x0004003d, 0x00000003, 0x00000022, 0x00000021,
    0x000500c6, 0x00000003, 0x00000023, 0x00000022, 0x00000015, 0x0003003e,
    0x00000021, 0x00000023, 0x000200f9, 0x0000001e, 0x000200f8, 0x0000001e,
    0x000100fd, 0x00010038,
];
