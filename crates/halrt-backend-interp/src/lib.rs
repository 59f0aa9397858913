//! Portable reference backend: executables are verified bytecode run by a
//! register interpreter on the device queue's worker threads.

pub mod assembler;
pub mod bytecode;
mod compiler;
mod device;

use std::sync::Arc;

use halrt::hal::{Device, Driver, HalResult};

pub use assembler::{assemble, assemble_program, AssembleError};
pub use compiler::{InterpCompiler, InterpProgram};
pub use device::{InterpDevice, InterpDriver, InterpExecutor, DRIVER_NAME};

/// Register the interpreter driver with the global driver registry.
///
/// Runs automatically through the link-time registrar list, but can also be
/// called manually.
pub fn register_interp_driver() {
    halrt::hal::register_driver(DRIVER_NAME, || {
        Ok(Arc::new(InterpDriver::new()) as Arc<dyn Driver>)
    });
}

#[halrt::linkme::distributed_slice(halrt::hal::DRIVER_REGISTRARS)]
static REGISTER_INTERP_DRIVER: fn() = register_interp_driver;

/// Default interpreter device, bypassing the registry.
pub fn create_interp_device() -> HalResult<Arc<dyn Device>> {
    InterpDriver::new().create_default_device()
}
