use std::collections::BTreeSet;
use std::sync::Arc;

use halrt::config::RuntimeConfig;
use halrt::hal::{
    execute_host_transfer, validate_device_info, BackendKind, Buffer, BufferBinding, Command,
    CommandExecutor, Device, DeviceCore, DeviceInfo, Driver, DriverId, ElementType, Executable,
    HalError, HalResult, HostAllocator, SchedulingModel,
};

use crate::bytecode::{Kernel, Op, MAX_REGISTERS};
use crate::compiler::{InterpCompiler, InterpProgram};

pub const DRIVER_NAME: &str = "interp";

fn encode_element(ty: ElementType, value: f64, out: &mut [u8]) {
    match ty {
        ElementType::I1 => out[0] = u8::from(value != 0.0),
        ElementType::I8 => out[0] = (value as i8) as u8,
        ElementType::U8 => out[0] = value as u8,
        ElementType::I32 => out.copy_from_slice(&(value as i32).to_le_bytes()),
        ElementType::I64 => out.copy_from_slice(&(value as i64).to_le_bytes()),
        ElementType::F32 => out.copy_from_slice(&(value as f32).to_le_bytes()),
        ElementType::F64 => out.copy_from_slice(&value.to_le_bytes()),
    }
}

/// Host copy of the bytes a dispatch touches in one distinct buffer.
///
/// Bindings that alias the same buffer share one image, so a store through
/// one binding is visible to loads through the other and the buffer is
/// written back once.
struct Image {
    buffer: Buffer,
    base: usize,
    bytes: Vec<u8>,
    dirty: bool,
}

/// Typed window of one binding into its image.
struct Slot {
    ty: ElementType,
    image: usize,
    start: usize,
    length: usize,
}

impl Slot {
    fn len(&self) -> usize {
        self.length / self.ty.size_in_bytes()
    }

    fn element(&self, index: u64) -> Option<std::ops::Range<usize>> {
        let index = usize::try_from(index).ok()?;
        if index >= self.len() {
            return None;
        }
        let size = self.ty.size_in_bytes();
        let first = self.start + index * size;
        Some(first..first + size)
    }
}

fn stage_bindings(
    bindings: &[BufferBinding],
    types: &[ElementType],
) -> HalResult<(Vec<Image>, Vec<Slot>)> {
    let mut images: Vec<Image> = Vec::new();
    let mut spans: Vec<(usize, usize)> = Vec::new();
    let mut owners = Vec::with_capacity(bindings.len());
    for binding in bindings {
        let end = binding.offset + binding.length;
        match images
            .iter()
            .position(|image| image.buffer.ptr_eq(&binding.buffer))
        {
            Some(owner) => {
                let span = &mut spans[owner];
                *span = (span.0.min(binding.offset), span.1.max(end));
                owners.push(owner);
            }
            None => {
                owners.push(images.len());
                spans.push((binding.offset, end));
                images.push(Image {
                    buffer: binding.buffer.clone(),
                    base: 0,
                    bytes: Vec::new(),
                    dirty: false,
                });
            }
        }
    }
    for (image, (start, end)) in images.iter_mut().zip(spans) {
        image.base = start;
        image.bytes = vec![0u8; end - start];
        image.buffer.read(start, &mut image.bytes)?;
    }
    let slots = bindings
        .iter()
        .zip(types)
        .zip(owners)
        .map(|((binding, ty), owner)| Slot {
            ty: *ty,
            image: owner,
            start: binding.offset - images[owner].base,
            length: binding.length,
        })
        .collect();
    Ok((images, slots))
}

fn run_invocation(
    kernel: &Kernel,
    index: u64,
    slots: &[Slot],
    images: &mut [Image],
    regs: &mut [f64; MAX_REGISTERS],
) -> HalResult<()> {
    let out_of_bounds = |what: &str, binding: u16, len: usize| {
        HalError::execution(format!(
            "kernel '{}' invocation {index}: {what} b{binding} out of bounds ({len} elements)",
            kernel.name
        ))
    };
    for op in &kernel.code {
        match *op {
            Op::Load { dst, binding } => {
                let slot = &slots[usize::from(binding)];
                let range = slot
                    .element(index)
                    .ok_or_else(|| out_of_bounds("load from", binding, slot.len()))?;
                regs[usize::from(dst)] = slot.ty.decode_f64(&images[slot.image].bytes[range]);
            }
            Op::Store { binding, src } => {
                let slot = &slots[usize::from(binding)];
                let range = slot
                    .element(index)
                    .ok_or_else(|| out_of_bounds("store to", binding, slot.len()))?;
                let image = &mut images[slot.image];
                encode_element(slot.ty, regs[usize::from(src)], &mut image.bytes[range]);
                image.dirty = true;
            }
            Op::Const { dst, value } => regs[usize::from(dst)] = value,
            Op::Index { dst } => regs[usize::from(dst)] = index as f64,
            Op::Add { dst, lhs, rhs } => {
                regs[usize::from(dst)] = regs[usize::from(lhs)] + regs[usize::from(rhs)]
            }
            Op::Sub { dst, lhs, rhs } => {
                regs[usize::from(dst)] = regs[usize::from(lhs)] - regs[usize::from(rhs)]
            }
            Op::Mul { dst, lhs, rhs } => {
                regs[usize::from(dst)] = regs[usize::from(lhs)] * regs[usize::from(rhs)]
            }
            Op::Div { dst, lhs, rhs } => {
                regs[usize::from(dst)] = regs[usize::from(lhs)] / regs[usize::from(rhs)]
            }
            Op::Max { dst, lhs, rhs } => {
                regs[usize::from(dst)] = regs[usize::from(lhs)].max(regs[usize::from(rhs)])
            }
            Op::Min { dst, lhs, rhs } => {
                regs[usize::from(dst)] = regs[usize::from(lhs)].min(regs[usize::from(rhs)])
            }
            Op::Neg { dst, src } => regs[usize::from(dst)] = -regs[usize::from(src)],
            Op::Abs { dst, src } => regs[usize::from(dst)] = regs[usize::from(src)].abs(),
            Op::Copy { dst, src } => regs[usize::from(dst)] = regs[usize::from(src)],
            Op::Guard { binding } => {
                if slots[usize::from(binding)].element(index).is_none() {
                    return Ok(());
                }
            }
            Op::Trap { code } => {
                return Err(HalError::execution(format!(
                    "kernel '{}' trapped with code {code} at invocation {index}",
                    kernel.name
                )))
            }
            Op::Halt => return Ok(()),
        }
    }
    Ok(())
}

/// Runs commands on the calling worker thread.
#[derive(Debug, Default)]
pub struct InterpExecutor;

impl InterpExecutor {
    fn dispatch(
        &self,
        executable: &Executable,
        entry_point: usize,
        workgroups: [u32; 3],
        bindings: &[BufferBinding],
    ) -> HalResult<()> {
        let program = executable.prepared::<InterpProgram>()?;
        let kernel = program.kernel(entry_point)?;
        let entry = executable.entry_point(entry_point)?;
        let invocations = workgroups
            .iter()
            .chain(entry.workgroup_size.iter())
            .map(|dim| u64::from(*dim))
            .try_fold(1u64, u64::checked_mul)
            .ok_or_else(|| HalError::invalid_argument("dispatch invocation count overflows"))?;
        let _span = tracing::trace_span!("interp_dispatch", kernel = %kernel.name, invocations)
            .entered();

        let (mut images, slots) = stage_bindings(bindings, &kernel.bindings)?;
        let mut regs = [0f64; MAX_REGISTERS];
        for index in 0..invocations {
            run_invocation(kernel, index, &slots, &mut images, &mut regs)?;
        }
        for image in images.iter().filter(|image| image.dirty) {
            image.buffer.write(image.base, &image.bytes)?;
        }
        Ok(())
    }
}

impl CommandExecutor for InterpExecutor {
    fn execute(&self, command: &Command) -> HalResult<()> {
        match command {
            Command::Dispatch {
                executable,
                entry_point,
                workgroups,
                bindings,
            } => self.dispatch(executable, *entry_point, *workgroups, bindings),
            other => execute_host_transfer(other),
        }
    }
}

/// Software interpreter device. Dispatches run on a pool of queue workers.
pub struct InterpDevice {
    core: DeviceCore,
}

impl InterpDevice {
    pub fn new(info: DeviceInfo, config: &RuntimeConfig) -> HalResult<Self> {
        let core = DeviceCore::new(
            info,
            Arc::new(HostAllocator::new(config.host_memory_limit)),
            Arc::new(InterpCompiler),
            SchedulingModel::Workers(config.interpreter_workers.max(1)),
            Arc::new(InterpExecutor),
        )?;
        Ok(Self { core })
    }
}

impl Device for InterpDevice {
    fn core(&self) -> &DeviceCore {
        &self.core
    }
}

pub struct InterpDriver {
    id: DriverId,
    config: RuntimeConfig,
}

impl InterpDriver {
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::global().clone())
    }

    pub fn with_config(config: RuntimeConfig) -> Self {
        Self {
            id: DriverId::next(),
            config,
        }
    }
}

impl Default for InterpDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl Driver for InterpDriver {
    fn id(&self) -> DriverId {
        self.id
    }

    fn name(&self) -> &str {
        DRIVER_NAME
    }

    fn enumerate_devices(&self) -> HalResult<Vec<DeviceInfo>> {
        let features: BTreeSet<String> = ["host-visible-memory", "interp-bytecode"]
            .into_iter()
            .map(String::from)
            .collect();
        Ok(vec![DeviceInfo {
            driver: self.id,
            driver_name: DRIVER_NAME.to_string(),
            ordinal: 0,
            name: "software interpreter".to_string(),
            backend: BackendKind::Interpreter,
            features,
        }])
    }

    fn create_device(&self, info: &DeviceInfo) -> HalResult<Arc<dyn Device>> {
        validate_device_info(self, info)?;
        Ok(Arc::new(InterpDevice::new(info.clone(), &self.config)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use halrt::hal::Allocator;

    #[test]
    fn integer_stores_truncate() {
        let mut out = [0u8; 4];
        encode_element(ElementType::I32, -2.75, &mut out);
        assert_eq!(i32::from_le_bytes(out), -2);
        let mut flag = [0u8; 1];
        encode_element(ElementType::I1, 0.5, &mut flag);
        assert_eq!(flag, [1]);
    }

    #[test]
    fn aliased_bindings_share_one_image() {
        let allocator = HostAllocator::new(None);
        let buffer = allocator.allocate(16).unwrap();
        let other = allocator.allocate(4).unwrap();
        let bindings = vec![
            BufferBinding {
                buffer: buffer.clone(),
                offset: 8,
                length: 8,
            },
            BufferBinding::whole(&other),
            BufferBinding {
                buffer: buffer.clone(),
                offset: 4,
                length: 8,
            },
        ];
        let types = [ElementType::F32, ElementType::F32, ElementType::F32];
        let (mut images, slots) = stage_bindings(&bindings, &types).unwrap();
        assert_eq!(images.len(), 2);
        assert_eq!((images[0].base, images[0].bytes.len()), (4, 12));
        assert_eq!((slots[0].start, slots[2].start), (4, 0));

        let range = slots[0].element(0).unwrap();
        encode_element(ElementType::F32, 1.5, &mut images[0].bytes[range]);
        let aliased = slots[2].element(1).unwrap();
        assert_eq!(ElementType::F32.decode_f64(&images[0].bytes[aliased]), 1.5);
    }

    #[test]
    fn infos_from_another_driver_instance_are_rejected() {
        let first = InterpDriver::with_config(RuntimeConfig::default());
        let second = InterpDriver::with_config(RuntimeConfig::default());
        let info = first.enumerate_devices().unwrap().remove(0);
        assert!(first.create_device(&info).is_ok());
        let err = second.create_device(&info).err().unwrap();
        assert_eq!(err.code(), "invalid_argument");
        assert!(second.create_device_by_ordinal(1).is_err());
    }
}
