//! Native JIT backend: kernels are C functions compiled into shared objects
//! and called in-process.

pub mod abi;
mod compiler;
mod device;

use std::sync::Arc;

use halrt::hal::{Device, Driver, HalResult};

pub use abi::{KernelFn, RawBinding, KERNEL_PRELUDE};
pub use compiler::{DylibCompiler, DylibExecutable};
pub use device::{DylibDevice, DylibDriver, DylibExecutor, DRIVER_NAME};

/// Register the native driver with the global driver registry.
///
/// Runs automatically through the link-time registrar list, but can also be
/// called manually.
pub fn register_dylib_driver() {
    halrt::hal::register_driver(DRIVER_NAME, || {
        Ok(Arc::new(DylibDriver::new()) as Arc<dyn Driver>)
    });
}

#[halrt::linkme::distributed_slice(halrt::hal::DRIVER_REGISTRARS)]
static REGISTER_DYLIB_DRIVER: fn() = register_dylib_driver;

/// Default native device, bypassing the registry.
pub fn create_dylib_device() -> HalResult<Arc<dyn Device>> {
    DylibDriver::new().create_default_device()
}
