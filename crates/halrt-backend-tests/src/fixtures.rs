//! Shared kernel contract and helpers.
//!
//! Every backend supplies one code section for the `elementwise` executable:
//! entry point 0 `add` takes `(f32 a, f32 b, f32 out)` and writes
//! `out[i] = a[i] + b[i]` for every `i` below the element count of `out`;
//! entry point 1 `fail` takes one binding and always reports a failure;
//! entry point 2 `copy` takes `(f32 src, f32 dst)` and writes `dst[i] = src[i]`.

use std::sync::Arc;
use std::time::Duration;

use halrt::hal::{
    Buffer, BufferBinding, CommandBuffer, CommandBufferMode, Device, EntryPointDef, Executable,
    ExecutableSpec,
};
use halrt::module::ExecutableDef;

pub const ELEMENTWISE: &str = "elementwise";
pub const ADD_ENTRY: usize = 0;
pub const FAIL_ENTRY: usize = 1;
pub const COPY_ENTRY: usize = 2;
pub const WORKGROUP_SIZE: u32 = 4;

/// Generous bound for waits that should finish promptly.
pub const TIMEOUT: Duration = Duration::from_secs(10);

/// One backend's implementation of the `elementwise` executable.
#[derive(Debug, Clone)]
pub struct KernelSection {
    pub format: &'static str,
    pub data: Vec<u8>,
}

pub fn elementwise_entry_points() -> Vec<EntryPointDef> {
    vec![
        EntryPointDef::new("add", 3, [WORKGROUP_SIZE, 1, 1]),
        EntryPointDef::new("fail", 1, [1, 1, 1]),
        EntryPointDef::new("copy", 2, [WORKGROUP_SIZE, 1, 1]),
    ]
}

pub fn elementwise_spec(section: &KernelSection) -> ExecutableSpec {
    ExecutableSpec::new(
        "conformance",
        ELEMENTWISE,
        section.format,
        section.data.clone(),
        elementwise_entry_points(),
    )
}

pub fn elementwise_executable(section: &KernelSection) -> ExecutableDef {
    ExecutableDef::new(ELEMENTWISE, elementwise_entry_points())
        .with_section(section.format, section.data.clone())
}

pub fn prepare_elementwise(device: &Arc<dyn Device>, section: &KernelSection) -> Executable {
    device
        .executable_cache()
        .create_executable(&elementwise_spec(section))
        .unwrap_or_else(|err| panic!("failed to prepare elementwise executable: {err}"))
}

pub fn workgroups_for(elements: usize) -> [u32; 3] {
    let groups = (elements as u32).div_ceil(WORKGROUP_SIZE);
    [groups.max(1), 1, 1]
}

pub fn f32_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn read_f32(buffer: &Buffer) -> Vec<f32> {
    buffer
        .read_all()
        .unwrap()
        .chunks_exact(4)
        .map(|raw| f32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
        .collect()
}

pub fn upload_f32(device: &Arc<dyn Device>, values: &[f32]) -> Buffer {
    device
        .allocator()
        .allocate_with_data(&f32_bytes(values))
        .unwrap()
}

/// Records a finalized one-shot command buffer.
pub fn record<F>(device: &Arc<dyn Device>, mode: CommandBufferMode, body: F) -> CommandBuffer
where
    F: FnOnce(&mut CommandBuffer),
{
    let mut command_buffer = device.create_command_buffer(mode);
    body(&mut command_buffer);
    command_buffer.finalize().unwrap();
    command_buffer
}

pub fn add_bindings(a: &Buffer, b: &Buffer, out: &Buffer) -> Vec<BufferBinding> {
    vec![
        BufferBinding::whole(a),
        BufferBinding::whole(b),
        BufferBinding::whole(out),
    ]
}

/// Installs a test subscriber honouring `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
