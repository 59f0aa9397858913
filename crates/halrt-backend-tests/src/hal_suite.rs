use std::sync::Arc;
use std::thread;
use std::time::Duration;

use halrt::hal::{
    BufferBinding, CommandBufferMode, CommandBufferState, Device, ExecutableSpec, HalError,
    SemaphoreValue,
};

use crate::fixtures::{
    add_bindings, elementwise_spec, prepare_elementwise, read_f32, record, upload_f32,
    workgroups_for, KernelSection, ADD_ENTRY, COPY_ENTRY, FAIL_ENTRY, TIMEOUT,
};

pub fn device_reports_identity(device: &Arc<dyn Device>) {
    let info = device.info();
    assert!(!info.driver_name.is_empty());
    assert!(!info.name.is_empty());
    assert!(device.executable_cache().is_empty());
}

pub fn semaphore_releases_waiters(device: &Arc<dyn Device>) {
    let semaphore = device.create_semaphore(0);
    let waiters: Vec<_> = (0..3)
        .map(|_| {
            let semaphore = semaphore.clone();
            thread::spawn(move || semaphore.wait(2, Some(TIMEOUT)))
        })
        .collect();
    semaphore.signal(1).unwrap();
    semaphore.signal(2).unwrap();
    for waiter in waiters {
        waiter.join().unwrap().unwrap();
    }
    assert_eq!(semaphore.query(), 2);
    assert!(matches!(semaphore.signal(2), Err(HalError::InvalidArgument(_))));
}

pub fn semaphore_wait_times_out(device: &Arc<dyn Device>) {
    let semaphore = device.create_semaphore(0);
    let err = semaphore.wait(1, Some(Duration::from_millis(20))).unwrap_err();
    assert!(matches!(err, HalError::DeadlineExceeded(_)));
}

pub fn command_buffer_lifecycle(device: &Arc<dyn Device>) {
    let buffer = device.allocator().allocate(16).unwrap();

    let mut one_shot = device.create_command_buffer(CommandBufferMode::OneShot);
    assert_eq!(one_shot.state(), CommandBufferState::Recording);
    assert!(matches!(
        device.submit(&one_shot, &[], &[]),
        Err(HalError::InvalidState(_))
    ));
    one_shot.fill_buffer(&buffer, 0, 16, &[1]).unwrap();
    one_shot.finalize().unwrap();
    assert!(matches!(one_shot.finalize(), Err(HalError::InvalidState(_))));
    assert!(one_shot.fill_buffer(&buffer, 0, 16, &[2]).is_err());
    device.submit(&one_shot, &[], &[]).unwrap();
    one_shot.wait_settled(Some(TIMEOUT)).unwrap();
    assert_eq!(one_shot.state(), CommandBufferState::Completed);
    assert!(matches!(
        device.submit(&one_shot, &[], &[]),
        Err(HalError::InvalidState(_))
    ));

    let reusable = record(device, CommandBufferMode::Reusable, |cb| {
        cb.fill_buffer(&buffer, 0, 16, &[3]).unwrap();
    });
    for _ in 0..2 {
        device.submit(&reusable, &[], &[]).unwrap();
        reusable.wait_settled(Some(TIMEOUT)).unwrap();
    }
    assert_eq!(buffer.read_all().unwrap(), vec![3; 16]);
}

pub fn foreign_command_buffer_is_rejected(device: &Arc<dyn Device>, other: &Arc<dyn Device>) {
    let command_buffer = record(other, CommandBufferMode::OneShot, |_| {});
    assert!(matches!(
        device.submit(&command_buffer, &[], &[]),
        Err(HalError::InvalidArgument(_))
    ));
    assert_eq!(command_buffer.state(), CommandBufferState::Finalized);
}

pub fn copy_and_fill_round_trip(device: &Arc<dyn Device>) {
    let source = upload_f32(device, &[1.0, 2.0, 3.0, 4.0]);
    let target = device.allocator().allocate(32).unwrap();
    let done = device.create_semaphore(0);
    let command_buffer = record(device, CommandBufferMode::OneShot, |cb| {
        cb.fill_buffer(&target, 0, 32, &[0xAB, 0xCD]).unwrap();
        cb.copy_buffer(&source, 4, &target, 8, 8).unwrap();
    });
    device
        .submit(&command_buffer, &[], &[SemaphoreValue::new(&done, 1)])
        .unwrap();
    done.wait(1, Some(TIMEOUT)).unwrap();

    let bytes = target.read_all().unwrap();
    assert_eq!(&bytes[..8], &[0xAB, 0xCD, 0xAB, 0xCD, 0xAB, 0xCD, 0xAB, 0xCD]);
    assert_eq!(&bytes[8..16], &[2.0f32.to_le_bytes(), 3.0f32.to_le_bytes()].concat()[..]);
    assert_eq!(&bytes[16..18], &[0xAB, 0xCD]);
}

pub fn transfer_ranges_are_validated(device: &Arc<dyn Device>) {
    let buffer = device.allocator().allocate(8).unwrap();
    let mut command_buffer = device.create_command_buffer(CommandBufferMode::OneShot);
    assert!(matches!(
        command_buffer.copy_buffer(&buffer, 4, &buffer, 0, 8),
        Err(HalError::InvalidArgument(_))
    ));
    assert!(matches!(
        command_buffer.fill_buffer(&buffer, 0, 6, &[1, 2, 3, 4]),
        Err(HalError::InvalidArgument(_))
    ));
    assert!(command_buffer.is_empty());
}

pub fn waits_gate_submissions(device: &Arc<dyn Device>) {
    let buffer = device.allocator().allocate(4).unwrap();
    let gate = device.create_semaphore(0);
    let done = device.create_semaphore(0);
    let command_buffer = record(device, CommandBufferMode::OneShot, |cb| {
        cb.fill_buffer(&buffer, 0, 4, &[7]).unwrap();
    });
    device
        .submit(
            &command_buffer,
            &[SemaphoreValue::new(&gate, 1)],
            &[SemaphoreValue::new(&done, 1)],
        )
        .unwrap();
    assert!(matches!(
        done.wait(1, Some(Duration::from_millis(50))),
        Err(HalError::DeadlineExceeded(_))
    ));
    assert_eq!(buffer.read_all().unwrap(), vec![0; 4]);
    gate.signal(1).unwrap();
    done.wait(1, Some(TIMEOUT)).unwrap();
    assert_eq!(buffer.read_all().unwrap(), vec![7; 4]);
}

pub fn submissions_chain_through_semaphores(device: &Arc<dyn Device>) {
    let buffer = device.allocator().allocate(4).unwrap();
    let timeline = device.create_semaphore(0);
    let first = record(device, CommandBufferMode::OneShot, |cb| {
        cb.fill_buffer(&buffer, 0, 4, &[1]).unwrap();
    });
    let second = record(device, CommandBufferMode::OneShot, |cb| {
        cb.fill_buffer(&buffer, 0, 2, &[2]).unwrap();
    });
    device
        .submit(
            &second,
            &[SemaphoreValue::new(&timeline, 1)],
            &[SemaphoreValue::new(&timeline, 2)],
        )
        .unwrap();
    device
        .submit(&first, &[], &[SemaphoreValue::new(&timeline, 1)])
        .unwrap();
    timeline.wait(2, Some(TIMEOUT)).unwrap();
    assert_eq!(buffer.read_all().unwrap(), vec![2, 2, 1, 1]);
}

pub fn dispatch_add_matches_host(device: &Arc<dyn Device>, section: &KernelSection) {
    let executable = prepare_elementwise(device, section);
    let lhs: Vec<f32> = (0..10).map(|i| i as f32).collect();
    let rhs: Vec<f32> = (0..10).map(|i| 0.5 * i as f32).collect();
    let a = upload_f32(device, &lhs);
    let b = upload_f32(device, &rhs);
    let out = device.allocator().allocate(lhs.len() * 4).unwrap();
    let done = device.create_semaphore(0);
    let command_buffer = record(device, CommandBufferMode::OneShot, |cb| {
        cb.dispatch(
            &executable,
            ADD_ENTRY,
            workgroups_for(lhs.len()),
            add_bindings(&a, &b, &out),
        )
        .unwrap();
    });
    device
        .submit(&command_buffer, &[], &[SemaphoreValue::new(&done, 1)])
        .unwrap();
    done.wait(1, Some(TIMEOUT)).unwrap();
    let expected: Vec<f32> = lhs.iter().zip(&rhs).map(|(x, y)| x + y).collect();
    assert_eq!(read_f32(&out), expected);
}

/// Dispatching `copy` and signalling S=1 leaves the device idle with S at exactly 1.
pub fn dispatch_round_trip_settles_device(device: &Arc<dyn Device>, section: &KernelSection) {
    let executable = prepare_elementwise(device, section);
    let values: Vec<f32> = (0..9).map(|i| i as f32 - 2.5).collect();
    let src = upload_f32(device, &values);
    let dst = device.allocator().allocate(values.len() * 4).unwrap();
    let done = device.create_semaphore(0);
    let command_buffer = record(device, CommandBufferMode::OneShot, |cb| {
        cb.dispatch(
            &executable,
            COPY_ENTRY,
            workgroups_for(values.len()),
            vec![BufferBinding::whole(&src), BufferBinding::whole(&dst)],
        )
        .unwrap();
    });
    device
        .submit(&command_buffer, &[], &[SemaphoreValue::new(&done, 1)])
        .unwrap();
    device.wait_idle(Some(TIMEOUT)).unwrap();
    assert_eq!(done.query(), 1);
    assert_eq!(command_buffer.state(), CommandBufferState::Completed);
    assert_eq!(read_f32(&dst), values);
}

pub fn wait_idle_times_out_on_blocked_work(device: &Arc<dyn Device>) {
    let buffer = device.allocator().allocate(4).unwrap();
    let gate = device.create_semaphore(0);
    let command_buffer = record(device, CommandBufferMode::OneShot, |cb| {
        cb.fill_buffer(&buffer, 0, 4, &[8]).unwrap();
    });
    device
        .submit(&command_buffer, &[SemaphoreValue::new(&gate, 1)], &[])
        .unwrap();
    let err = device
        .wait_idle(Some(Duration::from_millis(50)))
        .unwrap_err();
    assert!(matches!(err, HalError::DeadlineExceeded(_)), "{err}");
    assert_eq!(command_buffer.state(), CommandBufferState::Submitted);

    gate.signal(1).unwrap();
    device.wait_idle(Some(TIMEOUT)).unwrap();
    assert_eq!(buffer.read_all().unwrap(), vec![8; 4]);
}

/// A consumer gated by a wait recorded in its own command buffer does not
/// hold back the producer submitted after it.
pub fn embedded_wait_yields_to_producer(device: &Arc<dyn Device>) {
    let consumed = device.allocator().allocate(4).unwrap();
    let produced = device.allocator().allocate(4).unwrap();
    let gate = device.create_semaphore(0);
    let consumer = record(device, CommandBufferMode::OneShot, |cb| {
        cb.wait_semaphore(SemaphoreValue::new(&gate, 1)).unwrap();
        cb.fill_buffer(&consumed, 0, 4, &[3]).unwrap();
    });
    let producer = record(device, CommandBufferMode::OneShot, |cb| {
        cb.fill_buffer(&produced, 0, 4, &[4]).unwrap();
    });
    device.submit(&consumer, &[], &[]).unwrap();
    device
        .submit(&producer, &[], &[SemaphoreValue::new(&gate, 1)])
        .unwrap();
    gate.wait(1, Some(TIMEOUT)).unwrap();
    device.wait_idle(Some(TIMEOUT)).unwrap();
    assert_eq!(consumer.state(), CommandBufferState::Completed);
    assert_eq!(produced.read_all().unwrap(), vec![4; 4]);
    assert_eq!(consumed.read_all().unwrap(), vec![3; 4]);
}

pub fn dispatch_validates_bindings(device: &Arc<dyn Device>, section: &KernelSection) {
    let executable = prepare_elementwise(device, section);
    let a = upload_f32(device, &[1.0]);
    let mut command_buffer = device.create_command_buffer(CommandBufferMode::OneShot);
    let err = command_buffer
        .dispatch(&executable, ADD_ENTRY, [1, 1, 1], add_bindings(&a, &a, &a)[..2].to_vec())
        .unwrap_err();
    assert!(matches!(err, HalError::InvalidArgument(_)));
    let err = command_buffer
        .dispatch(&executable, 7, [1, 1, 1], Vec::new())
        .unwrap_err();
    assert!(matches!(err, HalError::InvalidArgument(_)));
}

pub fn failed_dispatch_leaves_signals_untouched(device: &Arc<dyn Device>, section: &KernelSection) {
    let executable = prepare_elementwise(device, section);
    let scratch = device.allocator().allocate(4).unwrap();
    let done = device.create_semaphore(0);
    let command_buffer = record(device, CommandBufferMode::OneShot, |cb| {
        cb.dispatch(
            &executable,
            FAIL_ENTRY,
            [1, 1, 1],
            vec![BufferBinding::whole(&scratch)],
        )
        .unwrap();
    });
    device
        .submit(&command_buffer, &[], &[SemaphoreValue::new(&done, 1)])
        .unwrap();
    let err = command_buffer.wait_settled(Some(TIMEOUT)).unwrap_err();
    assert!(
        matches!(err, HalError::Execution(_) | HalError::DeviceLost(_)),
        "unexpected failure {err}"
    );
    assert_eq!(command_buffer.state(), CommandBufferState::Failed);
    assert_eq!(done.query(), 0);
}

pub fn executable_cache_single_flight(device: &Arc<dyn Device>, section: &KernelSection) {
    let cache = device.create_executable_cache();
    let spec = elementwise_spec(section);
    let executables: Vec<_> = (0..4)
        .map(|_| {
            let cache = Arc::clone(&cache);
            let spec = spec.clone();
            thread::spawn(move || cache.create_executable(&spec))
        })
        .collect::<Vec<_>>()
        .into_iter()
        .map(|handle| handle.join().unwrap().unwrap())
        .collect();
    assert!(executables.windows(2).all(|pair| pair[0].ptr_eq(&pair[1])));
    assert_eq!(cache.compilation_count(), 1);
    assert_eq!(cache.len(), 1);
    assert!(device.executable_cache().is_empty());
}

pub fn malformed_executable_fails_compilation(device: &Arc<dyn Device>, section: &KernelSection) {
    let cache = device.create_executable_cache();
    let spec = ExecutableSpec::new(
        "conformance",
        "garbage",
        section.format,
        vec![0xFFu8; 7],
        crate::fixtures::elementwise_entry_points(),
    );
    let first = cache.create_executable(&spec).unwrap_err();
    assert!(matches!(first, HalError::CompilationFailure(_)), "{first}");
    let second = cache.create_executable(&spec).unwrap_err();
    assert_eq!(first, second);
    assert_eq!(cache.compilation_count(), 1);

    let foreign = ExecutableSpec::new(
        "conformance",
        "foreign",
        "no-such-format",
        vec![0u8; 4],
        crate::fixtures::elementwise_entry_points(),
    );
    assert!(matches!(
        cache.create_executable(&foreign),
        Err(HalError::CompilationFailure(_))
    ));
}

pub fn abandon_cancels_pending_work(device: &Arc<dyn Device>) {
    let buffer = device.allocator().allocate(4).unwrap();
    let gate = device.create_semaphore(0);
    let done = device.create_semaphore(0);
    let command_buffer = record(device, CommandBufferMode::OneShot, |cb| {
        cb.fill_buffer(&buffer, 0, 4, &[9]).unwrap();
    });
    device
        .submit(
            &command_buffer,
            &[SemaphoreValue::new(&gate, 1)],
            &[SemaphoreValue::new(&done, 1)],
        )
        .unwrap();
    device.abandon();
    device.wait_idle(Some(TIMEOUT)).unwrap();
    assert!(matches!(
        command_buffer.wait_settled(Some(TIMEOUT)),
        Err(HalError::Cancelled(_))
    ));
    gate.signal(1).unwrap();
    assert_eq!(done.query(), 0);
    assert_eq!(buffer.read_all().unwrap(), vec![0; 4]);

    let after = record(device, CommandBufferMode::OneShot, |cb| {
        cb.fill_buffer(&buffer, 0, 4, &[5]).unwrap();
    });
    device.submit(&after, &[], &[]).unwrap();
    after.wait_settled(Some(TIMEOUT)).unwrap();
    assert_eq!(buffer.read_all().unwrap(), vec![5; 4]);
}

pub fn teardown_cancels_pending_work(device: Arc<dyn Device>) {
    let buffer = device.allocator().allocate(4).unwrap();
    let gate = device.create_semaphore(0);
    let done = device.create_semaphore(0);
    let command_buffer = record(&device, CommandBufferMode::OneShot, |cb| {
        cb.fill_buffer(&buffer, 0, 4, &[1]).unwrap();
    });
    device
        .submit(
            &command_buffer,
            &[SemaphoreValue::new(&gate, 1)],
            &[SemaphoreValue::new(&done, 1)],
        )
        .unwrap();
    drop(device);
    assert_eq!(command_buffer.state(), CommandBufferState::Failed);
    assert!(matches!(command_buffer.failure(), Some(HalError::Cancelled(_))));
    gate.signal(1).unwrap();
    assert_eq!(done.query(), 0);
}

pub fn live_resources_track_handles(device: &Arc<dyn Device>) {
    let before = device.live_resources();
    let semaphore = device.create_semaphore(0);
    let command_buffer = device.create_command_buffer(CommandBufferMode::OneShot);
    let during = device.live_resources();
    assert_eq!(during.semaphores, before.semaphores + 1);
    assert_eq!(during.command_buffers, before.command_buffers + 1);
    drop(semaphore);
    drop(command_buffer);
    assert_eq!(device.live_resources(), before);
}
