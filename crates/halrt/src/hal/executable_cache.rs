use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use super::device::DeviceId;
use super::error::{HalError, HalResult};
use super::executable::{Executable, ExecutableCompiler, ExecutableSpec, Fingerprint};

type CacheEntry = Arc<OnceLock<HalResult<Executable>>>;

/// Deduplicating compiler/store for executables of one device.
///
/// At most one compilation per fingerprint is ever in flight; concurrent
/// requesters block on the same cell and observe the same executable or the
/// same error. Entries live as long as the cache.
///
/// Only [`HalError::CompilationFailure`] is remembered as a negative entry.
/// Any other failure (`ResourceExhausted`, `DeviceLost`, ...) is handed to the
/// requesters already waiting on the cell and then forgotten, so a later
/// request compiles again.
pub struct ExecutableCache {
    device: DeviceId,
    compiler: Arc<dyn ExecutableCompiler>,
    entries: Mutex<HashMap<Fingerprint, CacheEntry>>,
    compilations: AtomicU64,
}

impl ExecutableCache {
    /// Creates an empty cache that prepares executables with `compiler` on
    /// behalf of `device`.
    pub fn new(device: DeviceId, compiler: Arc<dyn ExecutableCompiler>) -> Self {
        Self {
            device,
            compiler,
            entries: Mutex::new(HashMap::new()),
            compilations: AtomicU64::new(0),
        }
    }

    /// The device every executable from this cache belongs to.
    pub fn device(&self) -> DeviceId {
        self.device
    }

    /// Whether the underlying compiler accepts code sections in `format`.
    pub fn can_prepare_format(&self, format: &str) -> bool {
        self.compiler.can_prepare(format)
    }

    /// Returns the executable for `spec`, compiling it on first request.
    ///
    /// The key is the executable fingerprint combined with the compiler's options
    /// hash. An unsupported format fails with `CompilationFailure` without
    /// touching the cache.
    pub fn create_executable(&self, spec: &ExecutableSpec) -> HalResult<Executable> {
        if !self.compiler.can_prepare(&spec.format) {
            return Err(HalError::compilation(format!(
                "executable format '{}' is not supported by this device (supported: {})",
                spec.format,
                self.compiler.formats().join(", ")
            )));
        }
        let key = spec
            .fingerprint
            .clone()
            .with_options(self.compiler.options_hash());

        let cell = {
            let mut entries = self.entries.lock()?;
            entries
                .entry(key.clone())
                .or_insert_with(|| Arc::new(OnceLock::new()))
                .clone()
        };

        if let Some(existing) = cell.get() {
            tracing::debug!(fingerprint = %key, "executable cache hit");
            return existing.clone();
        }

        let result = cell
            .get_or_init(|| {
                let _span =
                    tracing::debug_span!("prepare_executable", fingerprint = %key).entered();
                self.compilations.fetch_add(1, Ordering::AcqRel);
                let prepared = self.compiler.prepare(spec);
                match &prepared {
                    Ok(_) => tracing::debug!("executable compiled"),
                    Err(err) => tracing::debug!(error = %err, "executable compilation failed"),
                }
                prepared.map(|prepared| Executable::new(self.device, spec, prepared))
            })
            .clone();

        if let Err(err) = &result {
            if !matches!(err, HalError::CompilationFailure(_)) {
                self.forget(&key, &cell)?;
            }
        }
        result
    }

    /// Drops `key` if it still maps to `cell`, so a transient failure is retried.
    fn forget(&self, key: &Fingerprint, cell: &CacheEntry) -> HalResult<()> {
        let mut entries = self.entries.lock()?;
        if entries
            .get(key)
            .is_some_and(|current| Arc::ptr_eq(current, cell))
        {
            tracing::debug!(fingerprint = %key, "dropping transient compilation failure");
            entries.remove(key);
        }
        Ok(())
    }

    /// Number of compilations actually run (hits excluded).
    pub fn compilation_count(&self) -> u64 {
        self.compilations.load(Ordering::Acquire)
    }

    /// Number of fingerprints with a settled or in-flight entry.
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .map(|entries| entries.len())
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::executable::{EntryPointDef, PreparedExecutable};
    use std::any::Any;
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    struct Blob;

    impl PreparedExecutable for Blob {
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    struct SlowCompiler {
        calls: AtomicU64,
    }

    /// Out of memory on the first `exhausted` calls, then succeeds.
    struct ScarceCompiler {
        calls: AtomicU64,
        exhausted: u64,
    }

    impl ExecutableCompiler for ScarceCompiler {
        fn formats(&self) -> &[&'static str] {
            &["test"]
        }

        fn prepare(&self, _spec: &ExecutableSpec) -> HalResult<Box<dyn PreparedExecutable>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.exhausted {
                return Err(HalError::resource_exhausted("out of device memory"));
            }
            Ok(Box::new(Blob))
        }
    }

    impl ExecutableCompiler for SlowCompiler {
        fn formats(&self) -> &[&'static str] {
            &["test"]
        }

        fn prepare(&self, spec: &ExecutableSpec) -> HalResult<Box<dyn PreparedExecutable>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(30));
            if spec.data.is_empty() {
                return Err(HalError::compilation("empty blob"));
            }
            Ok(Box::new(Blob))
        }
    }

    fn spec(data: &[u8]) -> ExecutableSpec {
        ExecutableSpec::new(
            "module",
            "exe",
            "test",
            data.to_vec(),
            vec![EntryPointDef::new("main", 1, [1, 1, 1])],
        )
    }

    #[test]
    fn concurrent_requests_share_one_compilation() {
        let compiler = Arc::new(SlowCompiler {
            calls: AtomicU64::new(0),
        });
        let cache = Arc::new(ExecutableCache::new(DeviceId::next(), compiler.clone()));
        let barrier = Arc::new(Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    cache.create_executable(&spec(b"code")).unwrap()
                })
            })
            .collect();
        let executables: Vec<Executable> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(compiler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.compilation_count(), 1);
        for executable in &executables[1..] {
            assert!(executable.ptr_eq(&executables[0]));
        }
    }

    #[test]
    fn failures_are_cached() {
        let compiler = Arc::new(SlowCompiler {
            calls: AtomicU64::new(0),
        });
        let cache = ExecutableCache::new(DeviceId::next(), compiler.clone());
        let first = cache.create_executable(&spec(b"")).unwrap_err();
        let second = cache.create_executable(&spec(b"")).unwrap_err();
        assert_eq!(first, second);
        assert!(matches!(first, HalError::CompilationFailure(_)));
        assert_eq!(compiler.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn resource_exhaustion_is_retried() {
        let compiler = Arc::new(ScarceCompiler {
            calls: AtomicU64::new(0),
            exhausted: 1,
        });
        let cache = ExecutableCache::new(DeviceId::next(), compiler.clone());
        let first = cache.create_executable(&spec(b"code")).unwrap_err();
        assert!(matches!(first, HalError::ResourceExhausted(_)), "{first}");
        assert!(cache.is_empty());

        let executable = cache.create_executable(&spec(b"code")).unwrap();
        let again = cache.create_executable(&spec(b"code")).unwrap();
        assert!(executable.ptr_eq(&again));
        assert_eq!(compiler.calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.compilation_count(), 2);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn unsupported_format_is_a_compilation_failure() {
        let compiler = Arc::new(SlowCompiler {
            calls: AtomicU64::new(0),
        });
        let cache = ExecutableCache::new(DeviceId::next(), compiler);
        let mut other = spec(b"code");
        other.format = "elsewhere".to_string();
        assert!(matches!(
            cache.create_executable(&other),
            Err(HalError::CompilationFailure(_))
        ));
        assert!(cache.is_empty());
    }
}
