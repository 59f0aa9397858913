use std::collections::BTreeSet;
use std::sync::{Arc, MutexGuard, OnceLock};

use halrt::config::RuntimeConfig;
use halrt::hal::{
    execute_host_transfer, validate_device_info, BackendKind, Buffer, BufferBinding, Command,
    CommandExecutor, Device, DeviceCore, DeviceInfo, Driver, DriverId, Executable, HalError,
    HalResult, HostAllocator, HostBuffer, SchedulingModel,
};

use crate::abi::RawBinding;
use crate::compiler::{probe_compiler, DylibCompiler, DylibExecutable};

pub const DRIVER_NAME: &str = "dylib";

/// Runs kernels as direct in-process calls on the submitting thread.
#[derive(Debug, Default)]
pub struct DylibExecutor;

impl DylibExecutor {
    fn dispatch(
        &self,
        executable: &Executable,
        entry_point: usize,
        workgroups: [u32; 3],
        bindings: &[BufferBinding],
    ) -> HalResult<()> {
        let kernel = executable.prepared::<DylibExecutable>()?.kernel(entry_point)?;
        let entry = executable.entry_point(entry_point)?;

        // Lock each distinct buffer once, in address order.
        let mut buffers: Vec<&Buffer> = bindings.iter().map(|binding| &binding.buffer).collect();
        buffers.sort_by_key(|buffer| buffer.storage_addr());
        buffers.dedup_by_key(|buffer| buffer.storage_addr());
        let mut guards: Vec<(usize, MutexGuard<'_, Vec<u8>>)> = Vec::with_capacity(buffers.len());
        for buffer in buffers {
            let host = buffer.storage::<HostBuffer>().ok_or_else(|| {
                HalError::invalid_argument("native dispatch requires host buffers")
            })?;
            guards.push((buffer.storage_addr(), host.lock()));
        }

        let mut raw = Vec::with_capacity(bindings.len());
        for binding in bindings {
            let addr = binding.buffer.storage_addr();
            let (_, guard) = guards
                .iter_mut()
                .find(|(locked, _)| *locked == addr)
                .ok_or_else(|| HalError::execution("binding buffer was not locked"))?;
            // SAFETY: `offset..offset + length` was range-checked against the
            // buffer when the dispatch was recorded.
            let data = unsafe { guard.as_mut_ptr().add(binding.offset) };
            raw.push(RawBinding {
                data: data.cast(),
                length: binding.length,
            });
        }

        let _span = tracing::trace_span!("dylib_dispatch", kernel = %entry.name).entered();
        // SAFETY: every binding points into a locked host buffer that stays
        // locked for the duration of the call; the arrays outlive the call.
        let status = unsafe {
            kernel(
                raw.as_ptr(),
                raw.len(),
                workgroups.as_ptr(),
                entry.workgroup_size.as_ptr(),
            )
        };
        drop(guards);
        if status != 0 {
            return Err(HalError::execution(format!(
                "kernel '{}' returned status {status}",
                entry.name
            )));
        }
        Ok(())
    }
}

impl CommandExecutor for DylibExecutor {
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

/// Native JIT device: ready work runs inline on the submitting thread.
pub struct DylibDevice {
    core: DeviceCore,
}

impl DylibDevice {
    pub fn new(info: DeviceInfo, config: &RuntimeConfig) -> HalResult<Self> {
        let compiler = DylibCompiler::new(&config.dylib_cache_dir, config.dylib_compiler.clone());
        let core = DeviceCore::new(
            info,
            Arc::new(HostAllocator::new(config.host_memory_limit)),
            Arc::new(compiler),
            SchedulingModel::Inline,
            Arc::new(DylibExecutor),
        )?;
        Ok(Self { core })
    }
}

impl Device for DylibDevice {
    fn core(&self) -> &DeviceCore {
        &self.core
    }
}

pub struct DylibDriver {
    id: DriverId,
    config: RuntimeConfig,
    toolchain: OnceLock<HalResult<()>>,
}

impl DylibDriver {
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::global().clone())
    }

    pub fn with_config(config: RuntimeConfig) -> Self {
        Self {
            id: DriverId::next(),
            config,
            toolchain: OnceLock::new(),
        }
    }

    /// Whether the configured C compiler runs.
    pub fn is_available(&self) -> bool {
        self.toolchain().is_ok()
    }

    fn toolchain(&self) -> HalResult<()> {
        self.toolchain
            .get_or_init(|| probe_compiler(&self.config.dylib_compiler))
            .clone()
    }
}

impl Default for DylibDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl Driver for DylibDriver {
    fn id(&self) -> DriverId {
        self.id
    }

    fn name(&self) -> &str {
        DRIVER_NAME
    }

    fn enumerate_devices(&self) -> HalResult<Vec<DeviceInfo>> {
        self.toolchain()?;
        let features: BTreeSet<String> = ["host-visible-memory", "dylib-c", "dylib-so"]
            .into_iter()
            .map(String::from)
            .collect();
        Ok(vec![DeviceInfo {
            driver: self.id,
            driver_name: DRIVER_NAME.to_string(),
            ordinal: 0,
            name: format!("native host ({})", self.config.dylib_compiler),
            backend: BackendKind::NativeJit,
            features,
        }])
    }

    fn create_device(&self, info: &DeviceInfo) -> HalResult<Arc<dyn Device>> {
        validate_device_info(self, info)?;
        Ok(Arc::new(DylibDevice::new(info.clone(), &self.config)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_compiler_is_unavailable() {
        let config = RuntimeConfig {
            dylib_compiler: "halrt-no-such-cc".to_string(),
            ..RuntimeConfig::default()
        };
        let driver = DylibDriver::with_config(config);
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
