use std::any::Any;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicU64, Ordering};

use halrt::hal::{
    ExecutableCompiler, ExecutableSpec, HalError, HalResult, PreparedExecutable, FORMAT_DYLIB_C,
    FORMAT_DYLIB_SO,
};
use halrt::hashing::{fnv1a_init, fnv1a_str};
use libloading::Library;

use crate::abi::{KernelFn, KERNEL_PRELUDE};

static NEXT_SCRATCH: AtomicU64 = AtomicU64::new(0);

/// Platform suffix for shared objects, including the dot.
pub(crate) fn lib_ext() -> &'static str {
    if cfg!(target_os = "macos") {
        ".dylib"
    } else if cfg!(target_os = "windows") {
        ".dll"
    } else {
        ".so"
    }
}

/// Probes the C compiler with `--version`.
pub(crate) fn probe_compiler(compiler: &str) -> HalResult<()> {
    let output = Command::new(compiler)
        .arg("--version")
        .output()
        .map_err(|err| HalError::unavailable(format!("C compiler '{compiler}' not found: {err}")))?;
    if !output.status.success() {
        return Err(HalError::unavailable(format!(
            "C compiler '{compiler}' is not usable (exit status {})",
            output.status
        )));
    }
    Ok(())
}

fn compile_c(compiler: &str, src: &Path, out: &Path) -> HalResult<()> {
    let mut cmd = Command::new(compiler);
    if cfg!(target_os = "macos") {
        cmd.arg("-dynamiclib");
    } else {
        cmd.arg("-shared").arg("-fPIC");
    }
    cmd.arg("-O3");
    cmd.arg("-o").arg(out).arg(src);
    if !cfg!(target_os = "windows") {
        cmd.arg("-lm");
    }

    let output = cmd
        .output()
        .map_err(|err| HalError::unavailable(format!("cannot run C compiler '{compiler}': {err}")))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(HalError::compilation(format!("C compiler failed: {stderr}")));
    }
    Ok(())
}

fn io_error(action: &str, path: &Path, err: std::io::Error) -> HalError {
    HalError::compilation(format!("cannot {action} {}: {err}", path.display()))
}

/// Writes through a scratch file and renames, so concurrent preparers never
/// observe a half-written artifact.
fn publish<F>(target: &Path, produce: F) -> HalResult<()>
where
    F: FnOnce(&Path) -> HalResult<()>,
{
    let scratch = target.with_extension(format!(
        "{}.{}.tmp",
        std::process::id(),
        NEXT_SCRATCH.fetch_add(1, Ordering::Relaxed)
    ));
    let produced = produce(&scratch);
    if produced.is_err() {
        let _ = fs::remove_file(&scratch);
        return produced;
    }
    fs::rename(&scratch, target).map_err(|err| io_error("publish", target, err))
}

/// Loaded shared object with one resolved symbol per entry point.
pub struct DylibExecutable {
    kernels: Vec<KernelFn>,
    path: PathBuf,
    _library: Library,
}

impl DylibExecutable {
    /// Resolved kernel for `entry_point`, in executable entry-point order.
    ///
    /// An out-of-range ordinal is `InvalidArgument`.
    pub fn kernel(&self, entry_point: usize) -> HalResult<KernelFn> {
        self.kernels.get(entry_point).copied().ok_or_else(|| {
            HalError::invalid_argument(format!(
                "entry point ordinal {entry_point} out of range ({} kernels)",
                self.kernels.len()
            ))
        })
    }

    /// The cached shared object backing this executable.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PreparedExecutable for DylibExecutable {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Compiles `dylib-c` sources with the system C compiler and loads
/// `dylib-c`/`dylib-so` artifacts from an on-disk cache keyed by fingerprint.
///
/// Artifact names combine the executable fingerprint with the compiler
/// command and flags, so switching compilers never reuses a stale object.
/// The directory may be shared between processes; artifacts are published
/// atomically and an existing one is loaded without recompiling.
#[derive(Debug, Clone)]
pub struct DylibCompiler {
    cache_dir: PathBuf,
    compiler: String,
}

impl DylibCompiler {
    /// `compiler` is the C compiler command (e.g. `cc`, `clang`). Nothing is
    /// probed or created until the first `prepare`.
    pub fn new(cache_dir: impl Into<PathBuf>, compiler: impl Into<String>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            compiler: compiler.into(),
        }
    }

    /// Directory holding compiled shared objects.
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    fn artifact_path(&self, spec: &ExecutableSpec) -> PathBuf {
        let digest = spec
            .fingerprint
            .clone()
            .with_options(self.options_hash())
            .digest();
        self.cache_dir
            .join(format!("libhalrt_kernel_{digest:016x}{}", lib_ext()))
    }

    /// Produces the shared object for `spec` at `lib_path`.
    fn materialize(&self, spec: &ExecutableSpec, lib_path: &Path) -> HalResult<()> {
        match spec.format.as_str() {
            FORMAT_DYLIB_C => {
                let source = std::str::from_utf8(&spec.data).map_err(|err| {
                    HalError::compilation(format!("{}: C source is not UTF-8: {err}", spec.fingerprint))
                })?;
                publish(lib_path, |scratch| {
                    let src_path = scratch.with_extension("c");
                    fs::write(&src_path, format!("{KERNEL_PRELUDE}{source}"))
                        .map_err(|err| io_error("write", &src_path, err))?;
                    tracing::debug!(src = %src_path.display(), compiler = %self.compiler, "compiling C kernels");
                    let compiled = compile_c(&self.compiler, &src_path, scratch);
                    let _ = fs::remove_file(&src_path);
                    compiled
                })
            }
            FORMAT_DYLIB_SO => publish(lib_path, |scratch| {
                fs::write(scratch, &spec.data).map_err(|err| io_error("write", scratch, err))
            }),
            other => Err(HalError::compilation(format!(
                "native backend cannot prepare format '{other}'"
            ))),
        }
    }
}

impl ExecutableCompiler for DylibCompiler {
    fn formats(&self) -> &[&'static str] {
        &[FORMAT_DYLIB_C, FORMAT_DYLIB_SO]
    }

    /// Compiler command and optimisation flags, folded into cache keys.
    fn options_hash(&self) -> u64 {
        fnv1a_str(fnv1a_str(fnv1a_init(), &self.compiler), "-O3")
    }

    /// Compiles or reuses the artifact, loads it and resolves one symbol per
    /// entry point. Every failure is `CompilationFailure` except a missing
    /// compiler, which is `Unavailable`.
    fn prepare(&self, spec: &ExecutableSpec) -> HalResult<Box<dyn PreparedExecutable>> {
        fs::create_dir_all(&self.cache_dir)
            .map_err(|err| io_error("create cache directory", &self.cache_dir, err))?;
        let lib_path = self.artifact_path(spec);
        if lib_path.exists() {
            tracing::debug!(path = %lib_path.display(), "reusing cached shared object");
        } else {
            self.materialize(spec, &lib_path)?;
        }

        // SAFETY: loading runs the library's initializers; artifacts come from
        // this cache directory and were produced from the executable's own code.
        let library = unsafe { Library::new(&lib_path) }.map_err(|err| {
            HalError::compilation(format!("cannot load {}: {err}", lib_path.display()))
        })?;
        let kernels = spec
            .entry_points
            .iter()
            .map(|entry| {
                // SAFETY: exported kernels follow the `KernelFn` ABI from the prelude.
                unsafe { library.get::<KernelFn>(entry.name.as_bytes()) }
                    .map(|symbol| *symbol)
                    .map_err(|err| {
                        HalError::compilation(format!(
                            "{}: missing kernel symbol '{}': {err}",
                            spec.fingerprint, entry.name
                        ))
                    })
            })
            .collect::<HalResult<Vec<_>>>()?;
        Ok(Box::new(DylibExecutable {
            kernels,
            path: lib_path,
            _library: library,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use halrt::hal::EntryPointDef;

    const SOURCE: &str = "HALRT_KERNEL(noop) { (void)bindings; (void)binding_count; (void)workgroups; (void)workgroup_size; return 0; }\n";

    fn compiler_or_skip(dir: &Path) -> Option<DylibCompiler> {
        let cc = std::env::var("CC").unwrap_or_else(|_| "cc".to_string());
        if let Err(err) = probe_compiler(&cc) {
            eprintln!("skipping dylib compiler test: {err}");
            return None;
        }
        Some(DylibCompiler::new(dir, cc))
    }

    fn spec(format: &str, data: Vec<u8>, entry: &str) -> ExecutableSpec {
        ExecutableSpec::new("m", "e", format, data, vec![EntryPointDef::new(entry, 0, [1, 1, 1])])
    }

    #[test]
    fn compiled_objects_are_cached_on_disk_and_loadable_as_so() {
        let dir = tempfile::tempdir().unwrap();
        let Some(compiler) = compiler_or_skip(dir.path()) else {
            return;
        };
        let c_spec = spec(FORMAT_DYLIB_C, SOURCE.as_bytes().to_vec(), "noop");
        let prepared = compiler.prepare(&c_spec).unwrap();
        let executable = prepared.as_any().downcast_ref::<DylibExecutable>().unwrap();
        assert!(executable.path().starts_with(dir.path()));
        assert!(executable.kernel(0).is_ok());
        assert!(executable.kernel(1).is_err());

        let bytes = fs::read(executable.path()).unwrap();
        let so_spec = spec(FORMAT_DYLIB_SO, bytes, "noop");
        assert!(compiler.prepare(&so_spec).is_ok());
    }

    #[test]
    fn compiler_diagnostics_surface_as_compilation_failure() {
        let dir = tempfile::tempdir().unwrap();
        let Some(compiler) = compiler_or_skip(dir.path()) else {
            return;
        };
        let err = compiler
            .prepare(&spec(FORMAT_DYLIB_C, b"this is not C".to_vec(), "noop"))
            .err()
            .unwrap();
        assert!(matches!(err, HalError::CompilationFailure(_)), "{err}");
        assert!(err.to_string().contains("C compiler failed"));
    }

    #[test]
    fn missing_symbols_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let Some(compiler) = compiler_or_skip(dir.path()) else {
            return;
        };
        let err = compiler
            .prepare(&spec(FORMAT_DYLIB_C, SOURCE.as_bytes().to_vec(), "absent"))
            .err()
            .unwrap();
        assert!(err.to_string().contains("missing kernel symbol 'absent'"), "{err}");
    }
}
