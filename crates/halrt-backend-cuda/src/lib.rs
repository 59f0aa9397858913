//! GPU backend over the CUDA driver API.
//!
//! The driver library is loaded at runtime, so the crate builds and registers
//! everywhere; enumeration reports `Unavailable` on machines without it.
//! Executables are PTX text JIT-loaded per device context.

mod compiler;
mod device;
mod driver_api;
mod memory;

use std::sync::Arc;

use halrt::hal::{Device, Driver, HalResult};

pub use compiler::{CudaExecutable, PtxCompiler};
pub use device::{CudaDevice, CudaDriver, CudaExecutor, DRIVER_NAME};
pub use driver_api::CudaApi;
pub use memory::{CudaAllocator, CudaContext, DeviceBuffer};

/// Register the CUDA driver with the global driver registry.
pub fn register_cuda_driver() {
    halrt::hal::register_driver(DRIVER_NAME, || {
        Ok(Arc::new(CudaDriver::new()) as Arc<dyn Driver>)
    });
}

#[halrt::linkme::distributed_slice(halrt::hal::DRIVER_REGISTRARS)]
static REGISTER_CUDA_DRIVER: fn() = register_cuda_driver;

/// Default CUDA device, bypassing the registry.
pub fn create_cuda_device() -> HalResult<Arc<dyn Device>> {
    CudaDriver::new().create_default_device()
}
