//! Module runtime: import dispatch table, loading and invocation.

mod context;
mod hal_module;
mod imports;
mod value;

use std::sync::Arc;

use crate::check::{CheckModule, CheckRecorder};
use crate::hal::HalResult;

pub use context::Context;
pub use hal_module::{
    buffer_view_allocate_signature, buffer_view_copy_signature, device_dispatch_signature,
    HalModule, BUFFER_VIEW_ALLOCATE, BUFFER_VIEW_COPY, DEVICE_DISPATCH,
};
pub use imports::{CallContext, ImportBinding, ImportFn, ImportRegistry, NativeModule};
pub use value::Value;

/// Registry with the `hal` and `check` modules, checks reporting to `recorder`.
pub fn standard_registry(recorder: Arc<CheckRecorder>) -> HalResult<ImportRegistry> {
    let mut registry = ImportRegistry::new();
    registry.register_module(&HalModule)?;
    registry.register_module(&CheckModule::new(recorder))?;
    Ok(registry)
}
