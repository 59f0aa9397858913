use std::any::Any;
use std::ffi::{c_void, CString};
use std::sync::Arc;

use halrt::hal::{
    ExecutableCompiler, ExecutableSpec, HalError, HalResult, PreparedExecutable, FORMAT_CUDA_PTX,
};

use crate::driver_api::{check_cuda, CUfunction, CUmodule};
use crate::memory::CudaContext;

/// Loaded PTX module; unloaded when the last executable referencing it drops.
pub struct CudaModule {
    context: Arc<CudaContext>,
    module: usize,
}

impl CudaModule {
    fn module_ptr(&self) -> CUmodule {
        self.module as CUmodule
    }
}

impl Drop for CudaModule {
    fn drop(&mut self) {
        if self.module != 0 {
            let _ = self.context.ensure_current();
            // SAFETY: Module belongs to this context and is unloaded once.
            let _ = unsafe { (self.context.api().fns.cu_module_unload)(self.module_ptr()) };
            self.module = 0;
        }
    }
}

/// One resolved kernel function per entry point.
pub struct CudaExecutable {
    functions: Vec<usize>,
    _module: CudaModule,
}

impl CudaExecutable {
    pub(crate) fn function(&self, entry_point: usize) -> HalResult<CUfunction> {
        self.functions
            .get(entry_point)
            .map(|func| *func as CUfunction)
            .ok_or_else(|| {
                HalError::invalid_argument(format!(
                    "entry point ordinal {entry_point} out of range ({} kernels)",
                    self.functions.len()
                ))
            })
    }
}

impl PreparedExecutable for CudaExecutable {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// JIT-loads PTX text through the driver.
pub struct PtxCompiler {
    context: Arc<CudaContext>,
}

impl PtxCompiler {
    pub fn new(context: Arc<CudaContext>) -> Self {
        Self { context }
    }

    fn load_module(&self, ptx: &str) -> HalResult<CudaModule> {
        let c_ptx = CString::new(ptx)
            .map_err(|_| HalError::compilation("ptx source contains NUL byte"))?;
        self.context.ensure_current()?;
        let mut module: CUmodule = std::ptr::null_mut();
        // SAFETY: pointer arguments are valid for cuModuleLoadDataEx.
        unsafe {
            check_cuda(
                (self.context.api().fns.cu_module_load_data_ex)(
                    &mut module as *mut CUmodule,
                    c_ptx.as_ptr() as *const c_void,
                    0,
                    std::ptr::null_mut(),
                    std::ptr::null_mut(),
                ),
                "cuModuleLoadDataEx",
            )?;
        }
        Ok(CudaModule {
            context: Arc::clone(&self.context),
            module: module as usize,
        })
    }

    fn get_function(&self, module: &CudaModule, symbol: &str) -> HalResult<usize> {
        let c_symbol = CString::new(symbol)
            .map_err(|_| HalError::compilation("kernel symbol contains NUL byte"))?;
        let mut function: CUfunction = std::ptr::null_mut();
        // SAFETY: module and output pointers are valid.
        unsafe {
            check_cuda(
                (self.context.api().fns.cu_module_get_function)(
                    &mut function as *mut CUfunction,
                    module.module_ptr(),
                    c_symbol.as_ptr(),
                ),
                "cuModuleGetFunction",
            )?;
        }
        Ok(function as usize)
    }
}

/// Anything but device loss or memory pressure during preparation is a bad artifact.
fn as_compilation_failure(err: HalError, context: &str) -> HalError {
    match err {
        HalError::DeviceLost(_) | HalError::ResourceExhausted(_) => err,
        other => HalError::compilation(format!("{context}: {other}")),
    }
}

impl ExecutableCompiler for PtxCompiler {
    fn formats(&self) -> &[&'static str] {
        &[FORMAT_CUDA_PTX]
    }

    fn prepare(&self, spec: &ExecutableSpec) -> HalResult<Box<dyn PreparedExecutable>> {
        if spec.format != FORMAT_CUDA_PTX {
            return Err(HalError::compilation(format!(
                "CUDA backend cannot prepare format '{}'",
                spec.format
            )));
        }
        let ptx = std::str::from_utf8(&spec.data).map_err(|err| {
            HalError::compilation(format!("{}: PTX is not UTF-8: {err}", spec.fingerprint))
        })?;
        let module = self
            .load_module(ptx)
            .map_err(|err| as_compilation_failure(err, &spec.fingerprint.to_string()))?;
        let functions = spec
            .entry_points
            .iter()
            .map(|entry| {
                self.get_function(&module, &entry.name).map_err(|err| {
                    as_compilation_failure(
                        err,
                        &format!("{}: missing kernel symbol '{}'", spec.fingerprint, entry.name),
                    )
                })
            })
            .collect::<HalResult<Vec<_>>>()?;
        tracing::debug!(
            executable = %spec.fingerprint,
            kernels = functions.len(),
            device = self.context.ordinal(),
            "loaded PTX module"
        );
        Ok(Box::new(CudaExecutable {
            functions,
            _module: module,
        }))
    }
}
