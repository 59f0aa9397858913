//! Runtime-loaded subset of the CUDA driver API.

use std::ffi::{c_char, c_void, CStr};
use std::path::Path;

use halrt::hal::{HalError, HalResult};
use libloading::Library;

pub(crate) type CUresult = i32;
pub(crate) type CUdevice = i32;
pub(crate) type CUcontext = *mut c_void;
pub(crate) type CUdeviceptr = u64;
pub(crate) type CUmodule = *mut c_void;
pub(crate) type CUfunction = *mut c_void;
pub(crate) type CUstream = *mut c_void;

const CUDA_SUCCESS: CUresult = 0;
const CUDA_ERROR_OUT_OF_MEMORY: CUresult = 2;
const CUDA_ERROR_STUB_LIBRARY: CUresult = 34;
const CUDA_ERROR_INSUFFICIENT_DRIVER: CUresult = 35;
const CUDA_ERROR_NO_DEVICE: CUresult = 100;
const CUDA_ERROR_INVALID_IMAGE: CUresult = 200;
const CUDA_ERROR_NO_BINARY_FOR_GPU: CUresult = 209;
const CUDA_ERROR_INVALID_PTX: CUresult = 218;
const CUDA_ERROR_UNSUPPORTED_PTX_VERSION: CUresult = 222;
const CUDA_ERROR_JIT_COMPILER_NOT_FOUND: CUresult = 221;
const CUDA_ERROR_NOT_FOUND: CUresult = 500;
const CUDA_ERROR_LAUNCH_OUT_OF_RESOURCES: CUresult = 701;
const CUDA_ERROR_ILLEGAL_ADDRESS: CUresult = 700;
const CUDA_ERROR_LAUNCH_FAILED: CUresult = 719;
const CUDA_ERROR_UNKNOWN: CUresult = 999;

type CuInitFn = unsafe extern "C" fn(flags: u32) -> CUresult;
type CuDeviceGetCountFn = unsafe extern "C" fn(count: *mut i32) -> CUresult;
type CuDeviceGetFn = unsafe extern "C" fn(device: *mut CUdevice, ordinal: i32) -> CUresult;
type CuDeviceGetNameFn =
    unsafe extern "C" fn(name: *mut c_char, len: i32, device: CUdevice) -> CUresult;
type CuCtxCreateV2Fn =
    unsafe extern "C" fn(ctx: *mut CUcontext, flags: u32, dev: CUdevice) -> CUresult;
type CuCtxDestroyV2Fn = unsafe extern "C" fn(ctx: CUcontext) -> CUresult;
type CuCtxSetCurrentFn = unsafe extern "C" fn(ctx: CUcontext) -> CUresult;
type CuCtxSynchronizeFn = unsafe extern "C" fn() -> CUresult;
type CuMemAllocV2Fn = unsafe extern "C" fn(dptr: *mut CUdeviceptr, bytesize: usize) -> CUresult;
type CuMemFreeV2Fn = unsafe extern "C" fn(dptr: CUdeviceptr) -> CUresult;
type CuMemcpyHtoDV2Fn = unsafe extern "C" fn(
    dst_device: CUdeviceptr,
    src_host: *const c_void,
    byte_count: usize,
) -> CUresult;
type CuMemcpyDtoHV2Fn = unsafe extern "C" fn(
    dst_host: *mut c_void,
    src_device: CUdeviceptr,
    byte_count: usize,
) -> CUresult;
type CuMemcpyDtoDV2Fn = unsafe extern "C" fn(
    dst_device: CUdeviceptr,
    src_device: CUdeviceptr,
    byte_count: usize,
) -> CUresult;
type CuMemsetD8V2Fn =
    unsafe extern "C" fn(dst_device: CUdeviceptr, value: u8, count: usize) -> CUresult;
type CuModuleLoadDataExFn = unsafe extern "C" fn(
    module: *mut CUmodule,
    image: *const c_void,
    num_options: u32,
    options: *mut u32,
    option_values: *mut *mut c_void,
) -> CUresult;
type CuModuleUnloadFn = unsafe extern "C" fn(module: CUmodule) -> CUresult;
type CuModuleGetFunctionFn =
    unsafe extern "C" fn(hfunc: *mut CUfunction, hmod: CUmodule, name: *const c_char) -> CUresult;
type CuLaunchKernelFn = unsafe extern "C" fn(
    f: CUfunction,
    grid_dim_x: u32,
    grid_dim_y: u32,
    grid_dim_z: u32,
    block_dim_x: u32,
    block_dim_y: u32,
    block_dim_z: u32,
    shared_mem_bytes: u32,
    h_stream: CUstream,
    kernel_params: *mut *mut c_void,
    extra: *mut *mut c_void,
) -> CUresult;

pub(crate) struct DriverFns {
    pub cu_init: CuInitFn,
    pub cu_device_get_count: CuDeviceGetCountFn,
    pub cu_device_get: CuDeviceGetFn,
    pub cu_device_get_name: CuDeviceGetNameFn,
    pub cu_ctx_create_v2: CuCtxCreateV2Fn,
    pub cu_ctx_destroy_v2: CuCtxDestroyV2Fn,
    pub cu_ctx_set_current: CuCtxSetCurrentFn,
    pub cu_ctx_synchronize: CuCtxSynchronizeFn,
    pub cu_mem_alloc_v2: CuMemAllocV2Fn,
    pub cu_mem_free_v2: CuMemFreeV2Fn,
    pub cu_memcpy_hto_d_v2: CuMemcpyHtoDV2Fn,
    pub cu_memcpy_dto_h_v2: CuMemcpyDtoHV2Fn,
    pub cu_memcpy_dto_d_v2: CuMemcpyDtoDV2Fn,
    pub cu_memset_d8_v2: CuMemsetD8V2Fn,
    pub cu_module_load_data_ex: CuModuleLoadDataExFn,
    pub cu_module_unload: CuModuleUnloadFn,
    pub cu_module_get_function: CuModuleGetFunctionFn,
    pub cu_launch_kernel: CuLaunchKernelFn,
}

/// Loaded driver library plus its resolved entry points.
pub struct CudaApi {
    _lib: Library,
    pub(crate) fns: DriverFns,
}

impl CudaApi {
    /// Loads the driver library and runs `cuInit`.
    ///
    /// An explicit `library` path is the only candidate tried; otherwise the
    /// usual platform names are probed in order.
    pub fn load(library: Option<&Path>) -> HalResult<Self> {
        let lib = load_cuda_library(library)?;
        let fns = DriverFns {
            cu_init: load_symbol(&lib, b"cuInit\0")?,
            cu_device_get_count: load_symbol(&lib, b"cuDeviceGetCount\0")?,
            cu_device_get: load_symbol(&lib, b"cuDeviceGet\0")?,
            cu_device_get_name: load_symbol(&lib, b"cuDeviceGetName\0")?,
            cu_ctx_create_v2: load_symbol(&lib, b"cuCtxCreate_v2\0")?,
            cu_ctx_destroy_v2: load_symbol(&lib, b"cuCtxDestroy_v2\0")?,
            cu_ctx_set_current: load_symbol(&lib, b"cuCtxSetCurrent\0")?,
            cu_ctx_synchronize: load_symbol(&lib, b"cuCtxSynchronize\0")?,
            cu_mem_alloc_v2: load_symbol(&lib, b"cuMemAlloc_v2\0")?,
            cu_mem_free_v2: load_symbol(&lib, b"cuMemFree_v2\0")?,
            cu_memcpy_hto_d_v2: load_symbol(&lib, b"cuMemcpyHtoD_v2\0")?,
            cu_memcpy_dto_h_v2: load_symbol(&lib, b"cuMemcpyDtoH_v2\0")?,
            cu_memcpy_dto_d_v2: load_symbol(&lib, b"cuMemcpyDtoD_v2\0")?,
            cu_memset_d8_v2: load_symbol(&lib, b"cuMemsetD8_v2\0")?,
            cu_module_load_data_ex: load_symbol(&lib, b"cuModuleLoadDataEx\0")?,
            cu_module_unload: load_symbol(&lib, b"cuModuleUnload\0")?,
            cu_module_get_function: load_symbol(&lib, b"cuModuleGetFunction\0")?,
            cu_launch_kernel: load_symbol(&lib, b"cuLaunchKernel\0")?,
        };
        // SAFETY: cuInit takes no pointers and may be called repeatedly.
        unsafe { check_cuda((fns.cu_init)(0), "cuInit")? };
        Ok(Self { _lib: lib, fns })
    }

    pub fn device_count(&self) -> HalResult<usize> {
        let mut count = 0i32;
        // SAFETY: `count` is a valid out pointer.
        unsafe {
            check_cuda(
                (self.fns.cu_device_get_count)(&mut count as *mut i32),
                "cuDeviceGetCount",
            )?;
        }
        Ok(count.max(0) as usize)
    }

    pub(crate) fn device_handle(&self, ordinal: usize) -> HalResult<CUdevice> {
        let ordinal = i32::try_from(ordinal)
            .map_err(|_| HalError::invalid_argument(format!("CUDA ordinal {ordinal} out of range")))?;
        let mut device: CUdevice = 0;
        // SAFETY: `device` is a valid out pointer.
        unsafe {
            check_cuda(
                (self.fns.cu_device_get)(&mut device as *mut CUdevice, ordinal),
                "cuDeviceGet",
            )?;
        }
        Ok(device)
    }

    pub fn device_name(&self, ordinal: usize) -> HalResult<String> {
        let device = self.device_handle(ordinal)?;
        let mut name = [0 as c_char; 256];
        // SAFETY: the buffer holds `name.len()` bytes and the driver NUL-terminates within it.
        unsafe {
            check_cuda(
                (self.fns.cu_device_get_name)(name.as_mut_ptr(), name.len() as i32, device),
                "cuDeviceGetName",
            )?;
            Ok(CStr::from_ptr(name.as_ptr()).to_string_lossy().into_owned())
        }
    }
}

const LIBRARY_CANDIDATES: [&str; 4] = ["libcuda.so.1", "libcuda.so", "nvcuda.dll", "libcuda.dylib"];

fn load_cuda_library(explicit: Option<&Path>) -> HalResult<Library> {
    if let Some(path) = explicit {
        // SAFETY: Dynamic library probe only; no symbols are invoked at this stage.
        return unsafe { Library::new(path) }.map_err(|err| {
            HalError::unavailable(format!(
                "failed to load CUDA driver library {}: {err}",
                path.display()
            ))
        });
    }

    for candidate in LIBRARY_CANDIDATES {
        // SAFETY: Dynamic library probe only; no symbols are invoked at this stage.
        if let Ok(lib) = unsafe { Library::new(candidate) } {
            tracing::debug!(library = candidate, "loaded CUDA driver library");
            return Ok(lib);
        }
    }

    Err(HalError::unavailable(format!(
        "failed to load CUDA driver library (tried {})",
        LIBRARY_CANDIDATES.join(", ")
    )))
}

fn load_symbol<T: Copy>(lib: &Library, name: &'static [u8]) -> HalResult<T> {
    // SAFETY: Caller provides expected symbol type from CUDA driver API.
    let sym = unsafe { lib.get::<T>(name) }.map_err(|err| {
        HalError::unavailable(format!(
            "failed to resolve CUDA symbol {}: {err}",
            String::from_utf8_lossy(name.strip_suffix(b"\0").unwrap_or(name))
        ))
    })?;
    Ok(*sym)
}

/// Maps a driver status onto the HAL taxonomy.
pub(crate) fn check_cuda(code: CUresult, op: &str) -> HalResult<()> {
    if code == CUDA_SUCCESS {
        return Ok(());
    }
    let message = format!("CUDA driver call {op} failed with code {code}");
    Err(match code {
        CUDA_ERROR_OUT_OF_MEMORY | CUDA_ERROR_LAUNCH_OUT_OF_RESOURCES => {
            HalError::resource_exhausted(message)
        }
        CUDA_ERROR_STUB_LIBRARY | CUDA_ERROR_INSUFFICIENT_DRIVER | CUDA_ERROR_NO_DEVICE => {
            HalError::unavailable(message)
        }
        CUDA_ERROR_INVALID_IMAGE
        | CUDA_ERROR_NO_BINARY_FOR_GPU
        | CUDA_ERROR_INVALID_PTX
        | CUDA_ERROR_JIT_COMPILER_NOT_FOUND
        | CUDA_ERROR_UNSUPPORTED_PTX_VERSION
        | CUDA_ERROR_NOT_FOUND => HalError::compilation(message),
        // Sticky launch errors poison the context.
        CUDA_ERROR_ILLEGAL_ADDRESS..=CUDA_ERROR_LAUNCH_FAILED | CUDA_ERROR_UNKNOWN => {
            HalError::device_lost(message)
        }
        _ => HalError::execution(message),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_map_onto_error_kinds() {
        assert!(check_cuda(CUDA_SUCCESS, "cuInit").is_ok());
        let code = |status| check_cuda(status, "op").unwrap_err().code();
        assert_eq!(code(CUDA_ERROR_OUT_OF_MEMORY), "resource_exhausted");
        assert_eq!(code(CUDA_ERROR_NO_DEVICE), "unavailable");
        assert_eq!(code(CUDA_ERROR_INVALID_PTX), "compilation_failure");
        assert_eq!(code(CUDA_ERROR_ILLEGAL_ADDRESS), "device_lost");
        assert_eq!(code(CUDA_ERROR_LAUNCH_FAILED), "device_lost");
        assert_eq!(code(1), "execution");
        assert!(check_cuda(1, "cuMemAlloc_v2")
            .unwrap_err()
            .to_string()
            .contains("cuMemAlloc_v2 failed with code 1"));
    }

    #[test]
    fn explicit_missing_library_is_unavailable() {
        let err = CudaApi::load(Some(Path::new("/nonexistent/halrt/libcuda.so"))).err().unwrap();
        assert!(matches!(err, HalError::Unavailable(_)), "{err}");
    }
}
