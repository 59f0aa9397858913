use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::device::DeviceId;
use super::error::{HalError, HalResult};
use crate::hashing::{fnv1a_bytes, fnv1a_init, fnv1a_str};

pub const FORMAT_INTERP_BYTECODE: &str = "interp-bytecode";
pub const FORMAT_DYLIB_C: &str = "dylib-c";
pub const FORMAT_DYLIB_SO: &str = "dylib-so";
pub const FORMAT_CUDA_PTX: &str = "cuda-ptx";

static NEXT_EXECUTABLE_ID: AtomicU64 = AtomicU64::new(1);

/// Exported kernel of an executable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntryPointDef {
    pub name: String,
    pub binding_count: usize,
    pub workgroup_size: [u32; 3],
}

impl EntryPointDef {
    pub fn new(name: impl Into<String>, binding_count: usize, workgroup_size: [u32; 3]) -> Self {
        Self {
            name: name.into(),
            binding_count,
            workgroup_size,
        }
    }
}

/// Cache identity of an executable: module content, format, entry points and options.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    pub module: String,
    pub executable: String,
    pub format: String,
    pub content_hash: u64,
    pub options_hash: u64,
}

impl Fingerprint {
    pub fn for_section(
        module: &str,
        executable: &str,
        format: &str,
        data: &[u8],
        entry_points: &[EntryPointDef],
    ) -> Self {
        let mut hash = fnv1a_bytes(fnv1a_init(), data);
        for entry in entry_points {
            hash = fnv1a_str(hash, &entry.name);
            hash = fnv1a_bytes(hash, &(entry.binding_count as u64).to_le_bytes());
            for dim in entry.workgroup_size {
                hash = fnv1a_bytes(hash, &dim.to_le_bytes());
            }
        }
        Self {
            module: module.to_string(),
            executable: executable.to_string(),
            format: format.to_string(),
            content_hash: hash,
            options_hash: 0,
        }
    }

    pub fn with_options(mut self, options_hash: u64) -> Self {
        self.options_hash = options_hash;
        self
    }

    /// Single 64-bit digest, used to name on-disk artifacts.
    pub fn digest(&self) -> u64 {
        let mut hash = fnv1a_str(fnv1a_init(), &self.module);
        hash = fnv1a_str(hash, &self.executable);
        hash = fnv1a_str(hash, &self.format);
        hash = fnv1a_bytes(hash, &self.content_hash.to_le_bytes());
        fnv1a_bytes(hash, &self.options_hash.to_le_bytes())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}::{}@{}#{:016x}",
            self.module,
            self.executable,
            self.format,
            self.digest()
        )
    }
}

/// Everything a backend compiler needs to prepare one executable.
#[derive(Debug, Clone)]
pub struct ExecutableSpec {
    pub fingerprint: Fingerprint,
    pub format: String,
    pub data: Arc<[u8]>,
    pub entry_points: Vec<EntryPointDef>,
}

impl ExecutableSpec {
    pub fn new(
        module: &str,
        executable: &str,
        format: &str,
        data: impl Into<Arc<[u8]>>,
        entry_points: Vec<EntryPointDef>,
    ) -> Self {
        let data = data.into();
        Self {
            fingerprint: Fingerprint::for_section(module, executable, format, &data, &entry_points),
            format: format.to_string(),
            data,
            entry_points,
        }
    }
}

/// Backend-specific compiled artifact.
pub trait PreparedExecutable: Send + Sync + 'static {
    fn as_any(&self) -> &dyn Any;
}

/// Turns executable blobs into prepared backend artifacts.
pub trait ExecutableCompiler: Send + Sync {
    fn formats(&self) -> &[&'static str];

    fn can_prepare(&self, format: &str) -> bool {
        self.formats().iter().any(|candidate| *candidate == format)
    }

    /// Hash of backend options that change the produced code.
    fn options_hash(&self) -> u64 {
        0
    }

    fn prepare(&self, spec: &ExecutableSpec) -> HalResult<Box<dyn PreparedExecutable>>;
}

struct ExecutableInner {
    id: u64,
    device: DeviceId,
    fingerprint: Fingerprint,
    entry_points: Vec<EntryPointDef>,
    prepared: Box<dyn PreparedExecutable>,
}

/// Immutable compiled artifact shared by every command buffer that dispatches it.
#[derive(Clone)]
pub struct Executable {
    inner: Arc<ExecutableInner>,
}

impl Executable {
    pub(crate) fn new(
        device: DeviceId,
        spec: &ExecutableSpec,
        prepared: Box<dyn PreparedExecutable>,
    ) -> Self {
        Self {
            inner: Arc::new(ExecutableInner {
                id: NEXT_EXECUTABLE_ID.fetch_add(1, Ordering::Relaxed),
                device,
                fingerprint: spec.fingerprint.clone(),
                entry_points: spec.entry_points.clone(),
                prepared,
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn device(&self) -> DeviceId {
        self.inner.device
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.inner.fingerprint
    }

    pub fn entry_points(&self) -> &[EntryPointDef] {
        &self.inner.entry_points
    }

    pub fn entry_point(&self, ordinal: usize) -> HalResult<&EntryPointDef> {
        self.inner.entry_points.get(ordinal).ok_or_else(|| {
            HalError::invalid_argument(format!(
                "entry point ordinal {ordinal} out of range for {} ({} entry points)",
                self.inner.fingerprint,
                self.inner.entry_points.len()
            ))
        })
    }

    pub fn entry_point_ordinal(&self, name: &str) -> Option<usize> {
        self.inner
            .entry_points
            .iter()
            .position(|entry| entry.name == name)
    }

    /// Downcasts to the backend's prepared artifact.
    pub fn prepared<T: PreparedExecutable>(&self) -> HalResult<&T> {
        self.inner
            .prepared
            .as_any()
            .downcast_ref::<T>()
            .ok_or_else(|| {
                HalError::invalid_argument(format!(
                    "executable {} was prepared by another backend",
                    self.inner.fingerprint
                ))
            })
    }

    pub fn ptr_eq(&self, other: &Executable) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Executable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executable")
            .field("id", &self.inner.id)
            .field("fingerprint", &self.inner.fingerprint.to_string())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_covers_content_and_entry_points() {
        let entries = vec![EntryPointDef::new("copy", 2, [1, 1, 1])];
        let base = Fingerprint::for_section("m", "e", FORMAT_INTERP_BYTECODE, b"abc", &entries);
        let same = Fingerprint::for_section("m", "e", FORMAT_INTERP_BYTECODE, b"abc", &entries);
        assert_eq!(base, same);

        let other_data = Fingerprint::for_section("m", "e", FORMAT_INTERP_BYTECODE, b"abd", &entries);
        assert_ne!(base, other_data);

        let other_entries = vec![EntryPointDef::new("copy", 3, [1, 1, 1])];
        let other_entry = Fingerprint::for_section("m", "e", FORMAT_INTERP_BYTECODE, b"abc", &other_entries);
        assert_ne!(base, other_entry);

        assert_ne!(base.clone().with_options(7), base);
    }
}
