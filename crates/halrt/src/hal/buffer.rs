//! Buffers, buffer views and host-side allocation.
//!
//! A [`Buffer`] is a shared handle over backend storage. Host-visible backends
//! (interpreter, native JIT) use [`HostBuffer`]; GPU backends plug their own
//! storage in through [`BufferStorage`].

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use super::error::{HalError, HalResult};

/// Element types a buffer view can describe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementType {
    I1,
    I8,
    U8,
    I32,
    I64,
    F32,
    F64,
}

impl ElementType {
    pub const ALL: [ElementType; 7] = [
        ElementType::I1,
        ElementType::I8,
        ElementType::U8,
        ElementType::I32,
        ElementType::I64,
        ElementType::F32,
        ElementType::F64,
    ];

    pub fn size_in_bytes(self) -> usize {
        match self {
            ElementType::I1 | ElementType::I8 | ElementType::U8 => 1,
            ElementType::I32 | ElementType::F32 => 4,
            ElementType::I64 | ElementType::F64 => 8,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, ElementType::F32 | ElementType::F64)
    }

    /// Stable integer code passed through `i32` import arguments.
    pub fn code(self) -> i32 {
        match self {
            ElementType::I1 => 1,
            ElementType::I8 => 2,
            ElementType::U8 => 3,
            ElementType::I32 => 4,
            ElementType::I64 => 5,
            ElementType::F32 => 6,
            ElementType::F64 => 7,
        }
    }

    pub fn from_code(code: i32) -> HalResult<Self> {
        ElementType::ALL
            .into_iter()
            .find(|ty| ty.code() == code)
            .ok_or_else(|| HalError::invalid_argument(format!("unknown element type code {code}")))
    }

    pub fn name(self) -> &'static str {
        match self {
            ElementType::I1 => "i1",
            ElementType::I8 => "i8",
            ElementType::U8 => "u8",
            ElementType::I32 => "i32",
            ElementType::I64 => "i64",
            ElementType::F32 => "f32",
            ElementType::F64 => "f64",
        }
    }

    pub fn parse(name: &str) -> HalResult<Self> {
        ElementType::ALL
            .into_iter()
            .find(|ty| ty.name() == name)
            .ok_or_else(|| HalError::invalid_argument(format!("unknown element type '{name}'")))
    }

    /// Decodes one little-endian element into `f64`.
    pub fn decode_f64(self, bytes: &[u8]) -> f64 {
        match self {
            ElementType::I1 | ElementType::U8 => f64::from(bytes[0]),
            ElementType::I8 => f64::from(bytes[0] as i8),
            ElementType::I32 => f64::from(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])),
            ElementType::I64 => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&bytes[..8]);
                i64::from_le_bytes(raw) as f64
            }
            ElementType::F32 => f64::from(f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])),
            ElementType::F64 => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&bytes[..8]);
                f64::from_le_bytes(raw)
            }
        }
    }

    /// Decodes one element as an integer; floats are truncated.
    pub fn decode_i64(self, bytes: &[u8]) -> i64 {
        match self {
            ElementType::I64 => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&bytes[..8]);
                i64::from_le_bytes(raw)
            }
            ElementType::I32 => i64::from(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])),
            ElementType::I8 => i64::from(bytes[0] as i8),
            ElementType::I1 | ElementType::U8 => i64::from(bytes[0]),
            ElementType::F32 | ElementType::F64 => self.decode_f64(bytes) as i64,
        }
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Backend storage behind a [`Buffer`].
///
/// Implementations must be internally synchronized: the device queue reads and
/// writes storage from worker threads while the host may hold other handles.
pub trait BufferStorage: Send + Sync + 'static {
    fn byte_length(&self) -> usize;

    /// Reads `out.len()` bytes starting at `offset`. Ranges are pre-validated by [`Buffer`].
    fn read_bytes(&self, offset: usize, out: &mut [u8]) -> HalResult<()>;

    /// Writes `data` at `offset`. Ranges are pre-validated by [`Buffer`].
    fn write_bytes(&self, offset: usize, data: &[u8]) -> HalResult<()>;

    fn fill_bytes(&self, offset: usize, length: usize, pattern: &[u8]) -> HalResult<()> {
        let data: Vec<u8> = pattern.iter().copied().cycle().take(length).collect();
        self.write_bytes(offset, &data)
    }

    fn as_any(&self) -> &dyn Any;
}

/// Shared handle to device or host memory.
#[derive(Clone)]
pub struct Buffer {
    storage: Arc<dyn BufferStorage>,
}

impl Buffer {
    pub fn from_storage(storage: Arc<dyn BufferStorage>) -> Self {
        Self { storage }
    }

    pub fn byte_length(&self) -> usize {
        self.storage.byte_length()
    }

    pub fn check_range(&self, offset: usize, length: usize) -> HalResult<()> {
        let end = offset.checked_add(length).ok_or_else(|| {
            HalError::invalid_argument(format!("buffer range {offset}+{length} overflows"))
        })?;
        if end > self.byte_length() {
            return Err(HalError::invalid_argument(format!(
                "buffer range {offset}..{end} exceeds buffer length {}",
                self.byte_length()
            )));
        }
        Ok(())
    }

    pub fn read(&self, offset: usize, out: &mut [u8]) -> HalResult<()> {
        self.check_range(offset, out.len())?;
        self.storage.read_bytes(offset, out)
    }

    pub fn write(&self, offset: usize, data: &[u8]) -> HalResult<()> {
        self.check_range(offset, data.len())?;
        self.storage.write_bytes(offset, data)
    }

    pub fn fill(&self, offset: usize, length: usize, pattern: &[u8]) -> HalResult<()> {
        if pattern.is_empty() || length % pattern.len() != 0 {
            return Err(HalError::invalid_argument(format!(
                "fill length {length} is not a multiple of pattern length {}",
                pattern.len()
            )));
        }
        self.check_range(offset, length)?;
        self.storage.fill_bytes(offset, length, pattern)
    }

    pub fn read_all(&self) -> HalResult<Vec<u8>> {
        let mut out = vec![0u8; self.byte_length()];
        self.read(0, &mut out)?;
        Ok(out)
    }

    /// Downcasts the backing storage to a concrete backend type.
    pub fn storage<T: BufferStorage>(&self) -> Option<&T> {
        self.storage.as_any().downcast_ref::<T>()
    }

    pub fn ptr_eq(&self, other: &Buffer) -> bool {
        Arc::ptr_eq(&self.storage, &other.storage)
    }

    /// Address of the shared storage, used to order multi-buffer locking.
    pub fn storage_addr(&self) -> usize {
        Arc::as_ptr(&self.storage) as *const () as usize
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("byte_length", &self.byte_length())
            .field("addr", &format_args!("{:#x}", self.storage_addr()))
            .finish()
    }
}

/// Host memory storage.
pub struct HostBuffer {
    bytes: Mutex<Vec<u8>>,
    accounting: Option<Arc<AtomicUsize>>,
    byte_length: usize,
}

impl HostBuffer {
    pub fn new(byte_length: usize) -> Self {
        Self {
            bytes: Mutex::new(vec![0u8; byte_length]),
            accounting: None,
            byte_length,
        }
    }

    /// Exclusive access to the bytes; the native JIT backend hands the pointer to kernels.
    pub fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        self.bytes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl BufferStorage for HostBuffer {
    fn byte_length(&self) -> usize {
        self.byte_length
    }

    fn read_bytes(&self, offset: usize, out: &mut [u8]) -> HalResult<()> {
        let bytes = self.lock();
        out.copy_from_slice(&bytes[offset..offset + out.len()]);
        Ok(())
    }

    fn write_bytes(&self, offset: usize, data: &[u8]) -> HalResult<()> {
        let mut bytes = self.lock();
        bytes[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn fill_bytes(&self, offset: usize, length: usize, pattern: &[u8]) -> HalResult<()> {
        let mut bytes = self.lock();
        for (dst, src) in bytes[offset..offset + length]
            .iter_mut()
            .zip(pattern.iter().cycle())
        {
            *dst = *src;
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for HostBuffer {
    fn drop(&mut self) {
        if let Some(accounting) = &self.accounting {
            accounting.fetch_sub(self.byte_length, Ordering::AcqRel);
        }
    }
}

/// Allocates buffers usable by one device.
pub trait Allocator: Send + Sync {
    fn allocate(&self, byte_length: usize) -> HalResult<Buffer>;

    fn allocate_with_data(&self, data: &[u8]) -> HalResult<Buffer> {
        let buffer = self.allocate(data.len())?;
        buffer.write(0, data)?;
        Ok(buffer)
    }

    /// Bytes currently held by live allocations.
    fn bytes_in_use(&self) -> usize;
}

/// Allocator for host-visible devices with an optional byte cap.
#[derive(Clone, Default)]
pub struct HostAllocator {
    limit: Option<usize>,
    in_use: Arc<AtomicUsize>,
}

impl HostAllocator {
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            limit,
            in_use: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    fn reserve(&self, byte_length: usize) -> HalResult<()> {
        let limit = self.limit;
        self.in_use
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                let next = current.checked_add(byte_length)?;
                match limit {
                    Some(cap) if next > cap => None,
                    _ => Some(next),
                }
            })
            .map(|_| ())
            .map_err(|current| {
                HalError::resource_exhausted(format!(
                    "host allocation of {byte_length} bytes exceeds limit {} ({current} bytes in use)",
                    limit.unwrap_or(usize::MAX)
                ))
            })
    }
}

impl Allocator for HostAllocator {
    fn allocate(&self, byte_length: usize) -> HalResult<Buffer> {
        self.reserve(byte_length)?;
        let storage = HostBuffer {
            bytes: Mutex::new(vec![0u8; byte_length]),
            accounting: Some(Arc::clone(&self.in_use)),
            byte_length,
        };
        Ok(Buffer::from_storage(Arc::new(storage)))
    }

    fn bytes_in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }
}

pub type Shape = SmallVec<[usize; 4]>;

/// Typed, shaped window onto a buffer.
#[derive(Clone, Debug)]
pub struct BufferView {
    buffer: Buffer,
    element_type: ElementType,
    shape: Shape,
}

impl BufferView {
    pub fn new(buffer: Buffer, element_type: ElementType, shape: &[usize]) -> HalResult<Self> {
        let needed = element_count(shape)
            .checked_mul(element_type.size_in_bytes())
            .ok_or_else(|| HalError::invalid_argument("buffer view byte length overflows"))?;
        if needed > buffer.byte_length() {
            return Err(HalError::invalid_argument(format!(
                "buffer view {element_type}{shape:?} needs {needed} bytes, buffer has {}",
                buffer.byte_length()
            )));
        }
        Ok(Self {
            buffer,
            element_type,
            shape: Shape::from_slice(shape),
        })
    }

    pub fn allocate(
        allocator: &dyn Allocator,
        element_type: ElementType,
        shape: &[usize],
    ) -> HalResult<Self> {
        let length = element_count(shape) * element_type.size_in_bytes();
        let buffer = allocator.allocate(length)?;
        Self::new(buffer, element_type, shape)
    }

    pub fn from_host(allocator: &dyn Allocator, host: &HostTensor) -> HalResult<Self> {
        host.validate()?;
        let buffer = allocator.allocate_with_data(&host.data)?;
        Self::new(buffer, host.element_type, &host.shape)
    }

    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }

    pub fn element_type(&self) -> ElementType {
        self.element_type
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn element_count(&self) -> usize {
        element_count(&self.shape)
    }

    pub fn byte_length(&self) -> usize {
        self.element_count() * self.element_type.size_in_bytes()
    }

    pub fn to_host(&self) -> HalResult<HostTensor> {
        let mut data = vec![0u8; self.byte_length()];
        self.buffer.read(0, &mut data)?;
        Ok(HostTensor {
            element_type: self.element_type,
            shape: self.shape.to_vec(),
            data,
        })
    }
}

pub fn element_count(shape: &[usize]) -> usize {
    shape.iter().product()
}

/// Dense host copy of a buffer view, used for arguments, results and comparisons.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HostTensor {
    pub element_type: ElementType,
    pub shape: Vec<usize>,
    pub data: Vec<u8>,
}

impl HostTensor {
    pub fn from_f32(shape: &[usize], values: &[f32]) -> Self {
        Self {
            element_type: ElementType::F32,
            shape: shape.to_vec(),
            data: values.iter().flat_map(|v| v.to_le_bytes()).collect(),
        }
    }

    pub fn from_i32(shape: &[usize], values: &[i32]) -> Self {
        Self {
            element_type: ElementType::I32,
            shape: shape.to_vec(),
            data: values.iter().flat_map(|v| v.to_le_bytes()).collect(),
        }
    }

    pub fn element_count(&self) -> usize {
        element_count(&self.shape)
    }

    pub fn validate(&self) -> HalResult<()> {
        let expected = self.element_count() * self.element_type.size_in_bytes();
        if expected != self.data.len() {
            return Err(HalError::invalid_argument(format!(
                "host tensor {}{:?} expects {expected} bytes, got {}",
                self.element_type,
                self.shape,
                self.data.len()
            )));
        }
        Ok(())
    }

    fn elements(&self) -> impl Iterator<Item = &[u8]> {
        self.data.chunks_exact(self.element_type.size_in_bytes())
    }

    pub fn to_f64_vec(&self) -> Vec<f64> {
        self.elements()
            .map(|raw| self.element_type.decode_f64(raw))
            .collect()
    }

    pub fn to_i64_vec(&self) -> Vec<i64> {
        self.elements()
            .map(|raw| self.element_type.decode_i64(raw))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn element_type_codes_round_trip() {
        for ty in ElementType::ALL {
            assert_eq!(ElementType::from_code(ty.code()).unwrap(), ty);
            assert_eq!(ElementType::parse(ty.name()).unwrap(), ty);
        }
        assert!(matches!(
            ElementType::from_code(99),
            Err(HalError::InvalidArgument(_))
        ));
    }

    #[test]
    fn out_of_range_access_is_rejected() {
        let allocator = HostAllocator::default();
        let buffer = allocator.allocate(8).unwrap();
        buffer.write(4, &[1, 2, 3, 4]).unwrap();
        let err = buffer.write(6, &[0; 4]).unwrap_err();
        assert!(matches!(err, HalError::InvalidArgument(_)));
        let mut out = [0u8; 4];
        buffer.read(4, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4]);
    }

    #[test]
    fn fill_repeats_pattern() {
        let buffer = HostAllocator::default().allocate(8).unwrap();
        buffer.fill(0, 8, &[0xAB, 0xCD]).unwrap();
        assert_eq!(buffer.read_all().unwrap(), vec![0xAB, 0xCD, 0xAB, 0xCD, 0xAB, 0xCD, 0xAB, 0xCD]);
        assert!(buffer.fill(0, 3, &[1, 2]).is_err());
    }

    #[test]
    fn host_allocator_enforces_limit_and_releases_on_drop() {
        let allocator = HostAllocator::new(Some(16));
        let first = allocator.allocate(12).unwrap();
        assert_eq!(allocator.bytes_in_use(), 12);
        let err = allocator.allocate(8).unwrap_err();
        assert!(matches!(err, HalError::ResourceExhausted(_)));
        drop(first);
        assert_eq!(allocator.bytes_in_use(), 0);
        allocator.allocate(16).unwrap();
    }

    #[test]
    fn buffer_view_reads_back_host_tensor() {
        let allocator = HostAllocator::default();
        let host = HostTensor::from_f32(&[2, 2], &[1.0, 2.5, -3.0, 4.0]);
        let view = BufferView::from_host(&allocator, &host).unwrap();
        assert_eq!(view.element_count(), 4);
        let back = view.to_host().unwrap();
        assert_eq!(back, host);
        assert_eq!(back.to_f64_vec(), vec![1.0, 2.5, -3.0, 4.0]);
    }

    #[test]
    fn buffer_view_rejects_short_buffer() {
        let buffer = HostAllocator::default().allocate(8).unwrap();
        let err = BufferView::new(buffer, ElementType::F32, &[3]).unwrap_err();
        assert!(matches!(err, HalError::InvalidArgument(_)));
    }
}
