//! `hal.*` imports: buffer view allocation, copies and dispatches on the bound device.

use super::imports::{CallContext, ImportRegistry, NativeModule};
use super::value::Value;
use crate::hal::{submit_and_wait, BufferBinding, BufferView, ElementType, HalError, HalResult};
use crate::module::{Signature, ValueKind};

pub const BUFFER_VIEW_ALLOCATE: &str = "hal.buffer_view.allocate";
pub const BUFFER_VIEW_COPY: &str = "hal.buffer_view.copy";
pub const DEVICE_DISPATCH: &str = "hal.device.dispatch";

pub fn buffer_view_allocate_signature() -> Signature {
    Signature::new([ValueKind::I32], [ValueKind::BufferView]).with_variadic(ValueKind::I64)
}

pub fn buffer_view_copy_signature() -> Signature {
    Signature::new([ValueKind::BufferView, ValueKind::BufferView], [])
}

pub fn device_dispatch_signature() -> Signature {
    Signature::new([ValueKind::I32; 5], []).with_variadic(ValueKind::BufferView)
}

#[derive(Default)]
pub struct HalModule;

impl NativeModule for HalModule {
    fn name(&self) -> &str {
        "hal"
    }

    fn register(&self, registry: &mut ImportRegistry) -> HalResult<()> {
        registry.register_import(BUFFER_VIEW_ALLOCATE, buffer_view_allocate_signature(), allocate)?;
        registry.register_import(BUFFER_VIEW_COPY, buffer_view_copy_signature(), copy)?;
        registry.register_import(DEVICE_DISPATCH, device_dispatch_signature(), dispatch)?;
        Ok(())
    }
}

fn allocate(ctx: &CallContext<'_>, args: &[Value]) -> HalResult<Vec<Value>> {
    let element_type = ElementType::from_code(args[0].as_i32()?)?;
    let shape = args[1..]
        .iter()
        .map(|dim| {
            let dim = dim.as_i64()?;
            usize::try_from(dim)
                .map_err(|_| HalError::invalid_argument(format!("negative dimension {dim}")))
        })
        .collect::<HalResult<Vec<usize>>>()?;
    let view = BufferView::allocate(ctx.device.allocator(), element_type, &shape)?;
    Ok(vec![Value::BufferView(view)])
}

fn copy(ctx: &CallContext<'_>, args: &[Value]) -> HalResult<Vec<Value>> {
    let source = args[0].as_buffer_view()?;
    let target = args[1].as_buffer_view()?;
    if source.byte_length() != target.byte_length() {
        return Err(HalError::invalid_argument(format!(
            "buffer view copy of {} bytes into {} bytes",
            source.byte_length(),
            target.byte_length()
        )));
    }
    submit_and_wait(ctx.device.as_ref(), None, |cb| {
        cb.copy_buffer(source.buffer(), 0, target.buffer(), 0, source.byte_length())
    })?;
    Ok(Vec::new())
}

fn dispatch(ctx: &CallContext<'_>, args: &[Value]) -> HalResult<Vec<Value>> {
    let executable = ctx.executable(args[0].as_i32()?)?;
    let entry_point = usize::try_from(args[1].as_i32()?)
        .map_err(|_| HalError::invalid_argument("negative entry point ordinal"))?;
    let mut workgroups = [0u32; 3];
    for (slot, arg) in workgroups.iter_mut().zip(&args[2..5]) {
        let count = arg.as_i32()?;
        *slot = u32::try_from(count)
            .map_err(|_| HalError::invalid_argument(format!("negative workgroup count {count}")))?;
    }
    let bindings = args[5..]
        .iter()
        .map(|arg| arg.as_buffer_view().map(BufferBinding::from_view))
        .collect::<HalResult<Vec<_>>>()?;
    submit_and_wait(ctx.device.as_ref(), None, |cb| {
        cb.dispatch(executable, entry_point, workgroups, bindings)
    })?;
    Ok(Vec::new())
}
