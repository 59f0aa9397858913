//! Device abstraction and the bookkeeping every backend shares.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use super::buffer::Allocator;
use super::command_buffer::{CommandBuffer, CommandBufferMode, CommandBufferStatus};
use super::driver::DriverId;
use super::error::HalResult;
use super::executable::ExecutableCompiler;
use super::executable_cache::ExecutableCache;
use super::queue::{CommandExecutor, DeviceQueue, SchedulingModel};
use super::semaphore::{Semaphore, SemaphoreValue, WeakSemaphore};

static NEXT_DEVICE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(u64);

impl DeviceId {
    pub fn next() -> Self {
        DeviceId(NEXT_DEVICE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    NativeJit,
    GpuQueue,
    Interpreter,
}

impl BackendKind {
    pub fn name(self) -> &'static str {
        match self {
            BackendKind::NativeJit => "native-jit",
            BackendKind::GpuQueue => "gpu-queue",
            BackendKind::Interpreter => "interpreter",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Immutable description of one device, produced by a driver's enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub driver: DriverId,
    pub driver_name: String,
    pub ordinal: usize,
    pub name: String,
    pub backend: BackendKind,
    pub features: BTreeSet<String>,
}

impl DeviceInfo {
    pub fn has_feature(&self, feature: &str) -> bool {
        self.features.contains(feature)
    }
}

/// Counts of resources a device has issued that are still referenced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LiveResources {
    pub command_buffers: usize,
    pub semaphores: usize,
}

#[derive(Default)]
struct ResourceTracker {
    command_buffers: Mutex<Vec<Weak<CommandBufferStatus>>>,
    semaphores: Mutex<Vec<WeakSemaphore>>,
}

impl ResourceTracker {
    fn track_command_buffer(&self, command_buffer: &CommandBuffer) {
        let mut tracked = self
            .command_buffers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        tracked.retain(|status| status.strong_count() > 0);
        tracked.push(command_buffer.status_handle());
    }

    fn track_semaphore(&self, semaphore: &Semaphore) {
        let mut tracked = self
            .semaphores
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        tracked.retain(WeakSemaphore::is_alive);
        tracked.push(semaphore.downgrade());
    }

    fn live(&self) -> LiveResources {
        let command_buffers = self
            .command_buffers
            .lock()
            .map(|tracked| tracked.iter().filter(|s| s.strong_count() > 0).count())
            .unwrap_or_default();
        let semaphores = self
            .semaphores
            .lock()
            .map(|tracked| tracked.iter().filter(|s| s.is_alive()).count())
            .unwrap_or_default();
        LiveResources {
            command_buffers,
            semaphores,
        }
    }
}

/// Per-backend execution context.
///
/// Backends implement [`Device::core`] and inherit the common operations;
/// everything backend-specific lives in the [`CommandExecutor`] and
/// [`ExecutableCompiler`] they hand to [`DeviceCore::new`].
pub trait Device: Send + Sync {
    /// Shared bookkeeping every default method below delegates to.
    fn core(&self) -> &DeviceCore;

    /// Process-unique identity; command buffers and executables carry it to
    /// detect cross-device use.
    fn id(&self) -> DeviceId {
        self.core().id
    }

    /// The enumeration record this device was created from.
    fn info(&self) -> &DeviceInfo {
        &self.core().info
    }

    /// Allocator for buffers this device's executors can bind.
    fn allocator(&self) -> &dyn Allocator {
        self.core().allocator.as_ref()
    }

    /// The device-owned cache; created with the device and empty at first.
    fn executable_cache(&self) -> &Arc<ExecutableCache> {
        &self.core().cache
    }

    /// An additional, independent cache.
    fn create_executable_cache(&self) -> Arc<ExecutableCache> {
        let core = self.core();
        Arc::new(ExecutableCache::new(core.id, Arc::clone(&core.compiler)))
    }

    /// A new command buffer in `Recording`, bound to this device.
    fn create_command_buffer(&self, mode: CommandBufferMode) -> CommandBuffer {
        let core = self.core();
        let command_buffer = CommandBuffer::new(core.id, mode);
        core.tracker.track_command_buffer(&command_buffer);
        command_buffer
    }

    /// A new timeline semaphore starting at `initial_value`.
    ///
    /// Semaphores hold no reference to the device and may be shared with
    /// other devices' submissions.
    fn create_semaphore(&self, initial_value: u64) -> Semaphore {
        let semaphore = Semaphore::new(initial_value);
        self.core().tracker.track_semaphore(&semaphore);
        semaphore
    }

    /// Schedules a finalized command buffer after all waits are satisfied.
    ///
    /// Every signal value must exceed the semaphore's current payload. On
    /// success the signals are reached before the buffer reads `Completed`;
    /// on failure they are never advanced.
    fn submit(
        &self,
        command_buffer: &CommandBuffer,
        waits: &[SemaphoreValue],
        signals: &[SemaphoreValue],
    ) -> HalResult<()> {
        self.core().queue.submit(command_buffer, waits, signals)
    }

    /// Blocks until nothing is pending or running.
    ///
    /// Fails with `DeadlineExceeded` once `timeout` elapses, or with
    /// `DeviceLost` after the device has been lost.
    fn wait_idle(&self, timeout: Option<Duration>) -> HalResult<()> {
        self.core().queue.wait_idle(timeout)
    }

    /// Fails all outstanding work with `Cancelled` without shutting the device down.
    fn abandon(&self) {
        self.core().queue.abandon()
    }

    /// Command buffers and semaphores created here that are still alive.
    fn live_resources(&self) -> LiveResources {
        self.core().tracker.live()
    }
}

/// Common device bookkeeping: identity, allocator, cache ownership and queue.
///
/// Fields drop in declaration order: the queue stops and joins its workers
/// before the executable cache releases compiled artifacts.
pub struct DeviceCore {
    queue: DeviceQueue,
    cache: Arc<ExecutableCache>,
    compiler: Arc<dyn ExecutableCompiler>,
    allocator: Arc<dyn Allocator>,
    tracker: ResourceTracker,
    id: DeviceId,
    info: DeviceInfo,
}

impl DeviceCore {
    pub fn new(
        info: DeviceInfo,
        allocator: Arc<dyn Allocator>,
        compiler: Arc<dyn ExecutableCompiler>,
        model: SchedulingModel,
        executor: Arc<dyn CommandExecutor>,
    ) -> HalResult<Self> {
        let id = DeviceId::next();
        let queue = DeviceQueue::new(id, model, executor)?;
        let cache = Arc::new(ExecutableCache::new(id, Arc::clone(&compiler)));
        tracing::debug!(
            device = %id,
            driver = %info.driver_name,
            name = %info.name,
            backend = %info.backend,
            "device created"
        );
        Ok(Self {
            queue,
            cache,
            compiler,
            allocator,
            tracker: ResourceTracker::default(),
            id,
            info,
        })
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn queue(&self) -> &DeviceQueue {
        &self.queue
    }
}

impl Drop for DeviceCore {
    fn drop(&mut self) {
        tracing::debug!(device = %self.id, name = %self.info.name, "device teardown");
    }
}
