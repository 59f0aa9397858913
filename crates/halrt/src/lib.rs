extern crate self as halrt;

pub use linkme;

pub mod check;
pub mod compare;
pub mod compiler;
pub mod config;
pub mod hal;
pub mod hashing;
pub mod module;
pub mod vm;

pub use check::{CheckModule, CheckRecorder, CheckReport};
pub use compiler::{ConversionError, ConversionResult};
pub use config::RuntimeConfig;
pub use hal::{
    Buffer, BufferView, CommandBuffer, Device, DeviceDescriptor, Driver, ElementType,
    ExecutableCache, HalError, HalResult, HostTensor, Semaphore,
};
pub use module::CompiledModule;
pub use vm::{Context, ImportRegistry, Value};
