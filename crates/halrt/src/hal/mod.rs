//! Hardware abstraction layer: the contract every backend implements.

mod buffer;
mod command_buffer;
mod device;
mod driver;
mod error;
mod executable;
mod executable_cache;
mod queue;
mod semaphore;

pub use buffer::{
    element_count, Allocator, Buffer, BufferStorage, BufferView, ElementType, HostAllocator,
    HostBuffer, HostTensor, Shape,
};
pub use command_buffer::{
    BufferBinding, Command, CommandBuffer, CommandBufferMode, CommandBufferState,
};
pub use device::{BackendKind, Device, DeviceCore, DeviceId, DeviceInfo, LiveResources};
pub use driver::{
    create_device_from_descriptor, create_driver, ensure_drivers_registered, has_driver,
    list_drivers, register_driver, validate_device_info, DeviceDescriptor, Driver,
    DriverConstructor, DriverId, DRIVER_REGISTRARS,
};
pub use error::{HalError, HalResult};
pub use executable::{
    EntryPointDef, Executable, ExecutableCompiler, ExecutableSpec, Fingerprint,
    PreparedExecutable, FORMAT_CUDA_PTX, FORMAT_DYLIB_C, FORMAT_DYLIB_SO, FORMAT_INTERP_BYTECODE,
};
pub use executable_cache::ExecutableCache;
pub use queue::{CommandExecutor, DeviceQueue, SchedulingModel};
pub use semaphore::{Semaphore, SemaphoreValue, TimepointWaker, WeakSemaphore};

use std::time::Duration;

/// Runs a host-side copy or fill. Host-visible backends share this for transfer commands.
pub fn execute_host_transfer(command: &Command) -> HalResult<()> {
    match command {
        Command::CopyBuffer {
            source,
            source_offset,
            target,
            target_offset,
            length,
        } => {
            let mut bytes = vec![0u8; *length];
            source.read(*source_offset, &mut bytes)?;
            target.write(*target_offset, &bytes)
        }
        Command::FillBuffer {
            target,
            offset,
            length,
            pattern,
        } => target.fill(*offset, *length, pattern),
        other => Err(HalError::invalid_argument(format!(
            "'{}' is not a transfer command",
            other.name()
        ))),
    }
}

/// Records, submits and waits for a one-shot command buffer.
///
/// Synchronous helper used by native imports: the work itself still goes
/// through the device queue and signals a fresh semaphore.
pub fn submit_and_wait<F>(device: &dyn Device, timeout: Option<Duration>, record: F) -> HalResult<()>
where
    F: FnOnce(&mut CommandBuffer) -> HalResult<()>,
{
    let mut command_buffer = device.create_command_buffer(CommandBufferMode::OneShot);
    record(&mut command_buffer)?;
    command_buffer.finalize()?;
    let done = device.create_semaphore(0);
    device.submit(&command_buffer, &[], &[SemaphoreValue::new(&done, 1)])?;
    command_buffer.wait_settled(timeout)?;
    done.wait(1, timeout)
}
