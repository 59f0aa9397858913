use std::any::Any;
use std::ffi::c_void;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use halrt::hal::{Allocator, Buffer, BufferStorage, HalError, HalResult};

use crate::driver_api::{check_cuda, CUcontext, CUdeviceptr, CudaApi};

/// One CUDA context, owned by a single HAL device.
pub struct CudaContext {
    api: Arc<CudaApi>,
    // Stored as usize so the context can satisfy Send/Sync requirements.
    ctx: usize,
    ordinal: usize,
}

impl CudaContext {
    pub fn new(api: Arc<CudaApi>, ordinal: usize) -> HalResult<Self> {
        let device = api.device_handle(ordinal)?;
        let mut ctx: CUcontext = std::ptr::null_mut();
        // SAFETY: `ctx` is a valid out pointer and `device` came from cuDeviceGet.
        unsafe {
            check_cuda(
                (api.fns.cu_ctx_create_v2)(&mut ctx as *mut CUcontext, 0, device),
                "cuCtxCreate_v2",
            )?;
        }
        Ok(Self {
            api,
            ctx: ctx as usize,
            ordinal,
        })
    }

    pub fn api(&self) -> &CudaApi {
        &self.api
    }

    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    /// Binds the context to the calling thread.
    pub fn ensure_current(&self) -> HalResult<()> {
        // SAFETY: Context was created by this instance and remains valid until drop.
        unsafe {
            check_cuda(
                (self.api.fns.cu_ctx_set_current)(self.ctx_ptr()),
                "cuCtxSetCurrent",
            )
        }
    }

    pub fn synchronize(&self) -> HalResult<()> {
        self.ensure_current()?;
        // SAFETY: the context is current on this thread.
        unsafe { check_cuda((self.api.fns.cu_ctx_synchronize)(), "cuCtxSynchronize") }
    }

    /// Raw zero-filled allocation, not counted against any allocator.
    pub(crate) fn alloc(self: &Arc<Self>, bytes: usize) -> HalResult<DeviceBuffer> {
        let mut ptr: CUdeviceptr = 0;
        if bytes != 0 {
            self.ensure_current()?;
            // SAFETY: `ptr` is a valid out pointer; memset stays within the new allocation.
            unsafe {
                check_cuda(
                    (self.api.fns.cu_mem_alloc_v2)(&mut ptr as *mut CUdeviceptr, bytes),
                    "cuMemAlloc_v2",
                )?;
                let zeroed = (self.api.fns.cu_memset_d8_v2)(ptr, 0, bytes);
                if let Err(err) = check_cuda(zeroed, "cuMemsetD8_v2") {
                    let _ = (self.api.fns.cu_mem_free_v2)(ptr);
                    return Err(err);
                }
            }
        }
        Ok(DeviceBuffer {
            context: Arc::clone(self),
            ptr,
            bytes,
            accounting: None,
        })
    }

    fn ctx_ptr(&self) -> CUcontext {
        self.ctx as CUcontext
    }
}

impl Drop for CudaContext {
    fn drop(&mut self) {
        if self.ctx != 0 {
            // SAFETY: Context is owned by this instance and destroyed once on drop.
            let _ = unsafe { (self.api.fns.cu_ctx_destroy_v2)(self.ctx_ptr()) };
            self.ctx = 0;
        }
    }
}

/// Device-resident allocation.
pub struct DeviceBuffer {
    context: Arc<CudaContext>,
    ptr: CUdeviceptr,
    bytes: usize,
    accounting: Option<Arc<AtomicUsize>>,
}

impl fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("ptr", &self.ptr)
            .field("bytes", &self.bytes)
            .finish()
    }
}

impl DeviceBuffer {
    pub fn device_ptr(&self) -> u64 {
        self.ptr
    }

    pub fn context(&self) -> &Arc<CudaContext> {
        &self.context
    }

    fn at(&self, offset: usize) -> CUdeviceptr {
        self.ptr + offset as CUdeviceptr
    }

    pub(crate) fn copy_from(
        &self,
        offset: usize,
        source: &DeviceBuffer,
        source_offset: usize,
        bytes: usize,
    ) -> HalResult<()> {
        if bytes == 0 {
            return Ok(());
        }
        self.context.ensure_current()?;
        // SAFETY: both ranges were validated against their buffers when recorded.
        unsafe {
            check_cuda(
                (self.context.api.fns.cu_memcpy_dto_d_v2)(
                    self.at(offset),
                    source.at(source_offset),
                    bytes,
                ),
                "cuMemcpyDtoD_v2",
            )
        }
    }
}

impl BufferStorage for DeviceBuffer {
    fn byte_length(&self) -> usize {
        self.bytes
    }

    fn read_bytes(&self, offset: usize, out: &mut [u8]) -> HalResult<()> {
        if out.is_empty() {
            return Ok(());
        }
        self.context.ensure_current()?;
        // SAFETY: Source range lies within the allocation; destination host slice is writable.
        unsafe {
            check_cuda(
                (self.context.api.fns.cu_memcpy_dto_h_v2)(
                    out.as_mut_ptr() as *mut c_void,
                    self.at(offset),
                    out.len(),
                ),
                "cuMemcpyDtoH_v2",
            )
        }
    }

    fn write_bytes(&self, offset: usize, data: &[u8]) -> HalResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.context.ensure_current()?;
        // SAFETY: Destination range lies within the allocation; source host slice is valid.
        unsafe {
            check_cuda(
                (self.context.api.fns.cu_memcpy_hto_d_v2)(
                    self.at(offset),
                    data.as_ptr() as *const c_void,
                    data.len(),
                ),
                "cuMemcpyHtoD_v2",
            )
        }
    }

    fn fill_bytes(&self, offset: usize, length: usize, pattern: &[u8]) -> HalResult<()> {
        match pattern {
            [byte] if length != 0 => {
                self.context.ensure_current()?;
                // SAFETY: memset count is bounded by the validated fill range.
                unsafe {
                    check_cuda(
                        (self.context.api.fns.cu_memset_d8_v2)(self.at(offset), *byte, length),
                        "cuMemsetD8_v2",
                    )
                }
            }
            _ => {
                let data: Vec<u8> = pattern.iter().copied().cycle().take(length).collect();
                self.write_bytes(offset, &data)
            }
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        if self.ptr != 0 {
            let _ = self.context.ensure_current();
            // SAFETY: Device pointer was allocated in this context and is released once on drop.
            let _ = unsafe { (self.context.api.fns.cu_mem_free_v2)(self.ptr) };
        }
        if let Some(accounting) = &self.accounting {
            accounting.fetch_sub(self.bytes, Ordering::AcqRel);
        }
    }
}

/// Allocates device memory in one context.
pub struct CudaAllocator {
    context: Arc<CudaContext>,
    in_use: Arc<AtomicUsize>,
}

impl CudaAllocator {
    pub fn new(context: Arc<CudaContext>) -> Self {
        Self {
            context,
            in_use: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl Allocator for CudaAllocator {
    fn allocate(&self, byte_length: usize) -> HalResult<Buffer> {
        let mut storage = self.context.alloc(byte_length)?;
        self.in_use.fetch_add(byte_length, Ordering::AcqRel);
        storage.accounting = Some(Arc::clone(&self.in_use));
        Ok(Buffer::from_storage(Arc::new(storage)))
    }

    fn bytes_in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }
}

/// Resolves a binding's storage as device memory of `context`.
pub(crate) fn device_storage<'a>(
    buffer: &'a Buffer,
    context: &Arc<CudaContext>,
) -> HalResult<&'a DeviceBuffer> {
    let storage = buffer
        .storage::<DeviceBuffer>()
        .ok_or_else(|| HalError::invalid_argument("CUDA commands require device buffers"))?;
    if !Arc::ptr_eq(storage.context(), context) {
        return Err(HalError::invalid_argument("buffer belongs to another CUDA context"));
    }
    Ok(storage)
}
