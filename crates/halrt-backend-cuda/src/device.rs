use std::collections::BTreeSet;
use std::ffi::c_void;
use std::sync::{Arc, Mutex, OnceLock};

use halrt::config::RuntimeConfig;
use halrt::hal::{
    validate_device_info, BackendKind, Buffer, BufferBinding, BufferStorage, Command,
    CommandExecutor, Device, DeviceCore, DeviceInfo, Driver, DriverId, Executable, HalError,
    HalResult, SchedulingModel,
};

use crate::compiler::{CudaExecutable, PtxCompiler};
use crate::driver_api::{check_cuda, CudaApi};
use crate::memory::{device_storage, CudaAllocator, CudaContext, DeviceBuffer};

pub const DRIVER_NAME: &str = "cuda";

/// Launches kernels on the context's default stream.
///
/// Kernel parameters are `(u64 data, u64 length)` per binding followed by a
/// `u64` pointer to a zeroed `u32` status word; a nonzero status after the
/// launch completes fails the dispatch.
pub struct CudaExecutor {
    context: Arc<CudaContext>,
    status: Mutex<DeviceBuffer>,
}

impl CudaExecutor {
    pub fn new(context: Arc<CudaContext>) -> HalResult<Self> {
        let status = context.alloc(std::mem::size_of::<u32>())?;
        Ok(Self {
            context,
            status: Mutex::new(status),
        })
    }

    fn dispatch(
        &self,
        executable: &Executable,
        entry_point: usize,
        workgroups: [u32; 3],
        bindings: &[BufferBinding],
    ) -> HalResult<()> {
        let function = executable.prepared::<CudaExecutable>()?.function(entry_point)?;
        let entry = executable.entry_point(entry_point)?;

        let status = self.status.lock()?;
        status.fill_bytes(0, std::mem::size_of::<u32>(), &[0])?;

        let mut values: Vec<u64> = Vec::with_capacity(bindings.len() * 2 + 1);
        for binding in bindings {
            let storage = device_storage(&binding.buffer, &self.context)?;
            values.push(storage.device_ptr() + binding.offset as u64);
            values.push(binding.length as u64);
        }
        values.push(status.device_ptr());
        let mut params: Vec<*mut c_void> = values
            .iter_mut()
            .map(|value| value as *mut u64 as *mut c_void)
            .collect();

        let _span = tracing::trace_span!("cuda_dispatch", kernel = %entry.name).entered();
        let [block_x, block_y, block_z] = entry.workgroup_size;
        self.context.ensure_current()?;
        // SAFETY: `function` belongs to this context, `params` points at one
        // live value per declared kernel parameter for the duration of the call.
        unsafe {
            check_cuda(
                (self.context.api().fns.cu_launch_kernel)(
                    function,
                    workgroups[0],
                    workgroups[1],
                    workgroups[2],
                    block_x,
                    block_y,
                    block_z,
                    0,
                    std::ptr::null_mut(),
                    params.as_mut_ptr(),
                    std::ptr::null_mut(),
                ),
                "cuLaunchKernel",
            )?;
        }
        self.context.synchronize()?;

        let mut word = [0u8; 4];
        status.read_bytes(0, &mut word)?;
        let code = u32::from_le_bytes(word);
        if code != 0 {
            return Err(HalError::execution(format!(
                "kernel '{}' returned status {code}",
                entry.name
            )));
        }
        Ok(())
    }

    fn copy(
        &self,
        source: &Buffer,
        source_offset: usize,
        target: &Buffer,
        target_offset: usize,
        length: usize,
    ) -> HalResult<()> {
        let source = device_storage(source, &self.context)?;
        let target = device_storage(target, &self.context)?;
        target.copy_from(target_offset, source, source_offset, length)
    }
}

impl CommandExecutor for CudaExecutor {
    fn execute(&self, command: &Command) -> HalResult<()> {
        match command {
            Command::Dispatch {
                executable,
                entry_point,
                workgroups,
                bindings,
            } => self.dispatch(executable, *entry_point, *workgroups, bindings),
            Command::CopyBuffer {
                source,
                source_offset,
                target,
                target_offset,
                length,
            } => self.copy(source, *source_offset, target, *target_offset, *length),
            Command::FillBuffer {
                target,
                offset,
                length,
                pattern,
            } => target.fill(*offset, *length, pattern),
            other => Err(HalError::invalid_argument(format!(
                "'{}' cannot run on the CUDA executor",
                other.name()
            ))),
        }
    }

    fn flush(&self) -> HalResult<()> {
        self.context.synchronize()
    }
}

/// GPU device backed by one CUDA context and a single submission worker.
pub struct CudaDevice {
    core: DeviceCore,
    context: Arc<CudaContext>,
}

impl CudaDevice {
    pub fn new(info: DeviceInfo, api: Arc<CudaApi>) -> HalResult<Self> {
        let context = Arc::new(CudaContext::new(api, info.ordinal)?);
        let core = DeviceCore::new(
            info,
            Arc::new(CudaAllocator::new(Arc::clone(&context))),
            Arc::new(PtxCompiler::new(Arc::clone(&context))),
            SchedulingModel::Workers(1),
            Arc::new(CudaExecutor::new(Arc::clone(&context))?),
        )?;
        Ok(Self { core, context })
    }

    pub fn context(&self) -> &Arc<CudaContext> {
        &self.context
    }
}

impl Device for CudaDevice {
    fn core(&self) -> &DeviceCore {
        &self.core
    }
}

pub struct CudaDriver {
    id: DriverId,
    config: RuntimeConfig,
    api: OnceLock<Result<Arc<CudaApi>, HalError>>,
}

impl CudaDriver {
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::global().clone())
    }

    pub fn with_config(config: RuntimeConfig) -> Self {
        Self {
            id: DriverId::next(),
            config,
            api: OnceLock::new(),
        }
    }

    /// Whether the driver library loads and reports at least one device.
    pub fn is_available(&self) -> bool {
        self.enumerate_devices().is_ok()
    }

    fn api(&self) -> HalResult<Arc<CudaApi>> {
        self.api
            .get_or_init(|| CudaApi::load(self.config.cuda_library.as_deref()).map(Arc::new))
            .clone()
    }
}

impl Default for CudaDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl Driver for CudaDriver {
    fn id(&self) -> DriverId {
        self.id
    }

    fn name(&self) -> &str {
        DRIVER_NAME
    }

    fn enumerate_devices(&self) -> HalResult<Vec<DeviceInfo>> {
        let api = self.api()?;
        let count = api.device_count()?;
        if count == 0 {
            return Err(HalError::unavailable("no CUDA devices present"));
        }
        (0..count)
            .map(|ordinal| {
                let features: BTreeSet<String> = ["device-local-memory", "cuda-ptx"]
                    .into_iter()
                    .map(String::from)
                    .collect();
                Ok(DeviceInfo {
                    driver: self.id,
                    driver_name: DRIVER_NAME.to_string(),
                    ordinal,
                    name: api.device_name(ordinal)?,
                    backend: BackendKind::GpuQueue,
                    features,
                })
            })
            .collect()
    }

    fn create_device(&self, info: &DeviceInfo) -> HalResult<Arc<dyn Device>> {
        validate_device_info(self, info)?;
        Ok(Arc::new(CudaDevice::new(info.clone(), self.api()?)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_library_is_unavailable() {
        let config = RuntimeConfig {
            cuda_library: Some("/nonexistent/halrt/libcuda.so".into()),
            ..RuntimeConfig::default()
        };
        let driver = CudaDriver::with_config(config);
        assert!(!driver.is_available());
        assert!(matches!(
            driver.enumerate_devices(),
            Err(HalError::Unavailable(_))
        ));
        assert!(matches!(
            driver.create_default_device().err(),
            Some(HalError::Unavailable(_))
        ));
    }
}
