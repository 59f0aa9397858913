//! Recorded command sequences and their lifecycle.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::buffer::{Buffer, BufferView};
use super::device::DeviceId;
use super::error::{HalError, HalResult};
use super::executable::Executable;
use super::semaphore::SemaphoreValue;

static NEXT_COMMAND_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandBufferMode {
    /// Submitted at most once.
    OneShot,
    /// May be resubmitted after each submission completes or fails.
    Reusable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandBufferState {
    Recording,
    Finalized,
    Submitted,
    Completed,
    Failed,
}

/// A byte range of a buffer bound to a dispatch.
#[derive(Clone, Debug)]
pub struct BufferBinding {
    pub buffer: Buffer,
    pub offset: usize,
    pub length: usize,
}

impl BufferBinding {
    pub fn new(buffer: &Buffer, offset: usize, length: usize) -> Self {
        Self {
            buffer: buffer.clone(),
            offset,
            length,
        }
    }

    pub fn whole(buffer: &Buffer) -> Self {
        Self::new(buffer, 0, buffer.byte_length())
    }

    pub fn from_view(view: &BufferView) -> Self {
        Self::new(view.buffer(), 0, view.byte_length())
    }
}

#[derive(Clone, Debug)]
pub enum Command {
    Dispatch {
        executable: Executable,
        entry_point: usize,
        workgroups: [u32; 3],
        bindings: Vec<BufferBinding>,
    },
    CopyBuffer {
        source: Buffer,
        source_offset: usize,
        target: Buffer,
        target_offset: usize,
        length: usize,
    },
    FillBuffer {
        target: Buffer,
        offset: usize,
        length: usize,
        pattern: Vec<u8>,
    },
    WaitSemaphore(SemaphoreValue),
    SignalSemaphore(SemaphoreValue),
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Dispatch { .. } => "dispatch",
            Command::CopyBuffer { .. } => "copy_buffer",
            Command::FillBuffer { .. } => "fill_buffer",
            Command::WaitSemaphore(_) => "wait_semaphore",
            Command::SignalSemaphore(_) => "signal_semaphore",
        }
    }
}

struct StatusInner {
    state: CommandBufferState,
    failure: Option<HalError>,
}

/// Lifecycle state shared between a command buffer and its in-flight submission.
pub(crate) struct CommandBufferStatus {
    inner: Mutex<StatusInner>,
    settled: Condvar,
}

impl CommandBufferStatus {
    fn new() -> Self {
        Self {
            inner: Mutex::new(StatusInner {
                state: CommandBufferState::Recording,
                failure: None,
            }),
            settled: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StatusInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn state(&self) -> CommandBufferState {
        self.lock().state
    }

    pub(crate) fn mark_completed(&self) {
        let mut inner = self.lock();
        inner.state = CommandBufferState::Completed;
        inner.failure = None;
        self.settled.notify_all();
    }

    pub(crate) fn mark_failed(&self, error: HalError) {
        let mut inner = self.lock();
        inner.state = CommandBufferState::Failed;
        inner.failure = Some(error);
        self.settled.notify_all();
    }
}

/// An ordered list of dispatch, transfer and synchronization commands.
///
/// Not internally synchronized for recording: `&mut self` is required to
/// append commands, so concurrent mutation is ruled out by the borrow checker.
pub struct CommandBuffer {
    id: u64,
    device: DeviceId,
    mode: CommandBufferMode,
    commands: Vec<Command>,
    frozen: Option<Arc<[Command]>>,
    status: Arc<CommandBufferStatus>,
}

impl CommandBuffer {
    pub fn new(device: DeviceId, mode: CommandBufferMode) -> Self {
        Self {
            id: NEXT_COMMAND_BUFFER_ID.fetch_add(1, Ordering::Relaxed),
            device,
            mode,
            commands: Vec::new(),
            frozen: None,
            status: Arc::new(CommandBufferStatus::new()),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn mode(&self) -> CommandBufferMode {
        self.mode
    }

    pub fn state(&self) -> CommandBufferState {
        self.status.state()
    }

    /// Error that moved the last submission to `Failed`, if any.
    pub fn failure(&self) -> Option<HalError> {
        self.status.lock().failure.clone()
    }

    /// Blocks until the current submission completes or fails.
    ///
    /// Returns the recorded failure for `Failed`, `InvalidState` when nothing
    /// was submitted, and `DeadlineExceeded` when the timeout elapses first.
    pub fn wait_settled(&self, timeout: Option<Duration>) -> HalResult<()> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut inner = self.status.lock();
        loop {
            match inner.state {
                CommandBufferState::Completed => return Ok(()),
                CommandBufferState::Failed => {
                    return Err(inner.failure.clone().unwrap_or_else(|| {
                        HalError::execution("command buffer failed without a recorded error")
                    }))
                }
                CommandBufferState::Submitted => {}
                state => {
                    return Err(HalError::invalid_state(format!(
                        "command buffer {} is {state:?}, not submitted",
                        self.id
                    )))
                }
            }
            inner = match deadline {
                None => self
                    .status
                    .settled
                    .wait(inner)
                    .unwrap_or_else(|poisoned| poisoned.into_inner()),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(HalError::deadline_exceeded(format!(
                            "command buffer {} still running",
                            self.id
                        )));
                    }
                    self.status
                        .settled
                        .wait_timeout(inner, deadline - now)
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .0
                }
            };
        }
    }

    pub fn commands(&self) -> &[Command] {
        match &self.frozen {
            Some(frozen) => frozen,
            None => &self.commands,
        }
    }

    pub fn len(&self) -> usize {
        self.commands().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn ensure_recording(&self, what: &str) -> HalResult<()> {
        match self.state() {
            CommandBufferState::Recording => Ok(()),
            state => Err(HalError::invalid_state(format!(
                "cannot {what} command buffer {} in state {state:?}",
                self.id
            ))),
        }
    }

    pub fn dispatch(
        &mut self,
        executable: &Executable,
        entry_point: usize,
        workgroups: [u32; 3],
        bindings: Vec<BufferBinding>,
    ) -> HalResult<()> {
        self.ensure_recording("record dispatch into")?;
        if executable.device() != self.device {
            return Err(HalError::invalid_argument(format!(
                "executable {} belongs to device {}, command buffer to device {}",
                executable.fingerprint(),
                executable.device(),
                self.device
            )));
        }
        let entry = executable.entry_point(entry_point)?;
        if bindings.len() != entry.binding_count {
            return Err(HalError::invalid_argument(format!(
                "entry point '{}' expects {} bindings, got {}",
                entry.name,
                entry.binding_count,
                bindings.len()
            )));
        }
        for binding in &bindings {
            binding.buffer.check_range(binding.offset, binding.length)?;
        }
        self.commands.push(Command::Dispatch {
            executable: executable.clone(),
            entry_point,
            workgroups,
            bindings,
        });
        Ok(())
    }

    pub fn copy_buffer(
        &mut self,
        source: &Buffer,
        source_offset: usize,
        target: &Buffer,
        target_offset: usize,
        length: usize,
    ) -> HalResult<()> {
        self.ensure_recording("record copy into")?;
        source.check_range(source_offset, length)?;
        target.check_range(target_offset, length)?;
        self.commands.push(Command::CopyBuffer {
            source: source.clone(),
            source_offset,
            target: target.clone(),
            target_offset,
            length,
        });
        Ok(())
    }

    pub fn fill_buffer(
        &mut self,
        target: &Buffer,
        offset: usize,
        length: usize,
        pattern: &[u8],
    ) -> HalResult<()> {
        self.ensure_recording("record fill into")?;
        if pattern.is_empty() || pattern.len() > 8 || length % pattern.len() != 0 {
            return Err(HalError::invalid_argument(format!(
                "fill pattern of {} bytes cannot cover {length} bytes",
                pattern.len()
            )));
        }
        target.check_range(offset, length)?;
        self.commands.push(Command::FillBuffer {
            target: target.clone(),
            offset,
            length,
            pattern: pattern.to_vec(),
        });
        Ok(())
    }

    /// Blocks subsequent commands until the semaphore reaches the value.
    pub fn wait_semaphore(&mut self, wait: SemaphoreValue) -> HalResult<()> {
        self.ensure_recording("record semaphore wait into")?;
        self.commands.push(Command::WaitSemaphore(wait));
        Ok(())
    }

    /// Signals the semaphore once all preceding commands have finished.
    pub fn signal_semaphore(&mut self, signal: SemaphoreValue) -> HalResult<()> {
        self.ensure_recording("record semaphore signal into")?;
        self.commands.push(Command::SignalSemaphore(signal));
        Ok(())
    }

    pub fn finalize(&mut self) -> HalResult<()> {
        let mut status = self.status.lock();
        if status.state != CommandBufferState::Recording {
            return Err(HalError::invalid_state(format!(
                "command buffer {} already finalized (state {:?})",
                self.id, status.state
            )));
        }
        status.state = CommandBufferState::Finalized;
        drop(status);
        self.frozen = Some(Arc::from(std::mem::take(&mut self.commands)));
        Ok(())
    }

    /// Transitions to `Submitted` and hands out the frozen command list.
    pub(crate) fn begin_submit(&self) -> HalResult<(Arc<[Command]>, Arc<CommandBufferStatus>)> {
        let mut status = self.status.lock();
        let allowed = match (self.mode, status.state) {
            (_, CommandBufferState::Finalized) => true,
            (CommandBufferMode::Reusable, CommandBufferState::Completed)
            | (CommandBufferMode::Reusable, CommandBufferState::Failed) => true,
            _ => false,
        };
        if !allowed {
            return Err(HalError::invalid_state(format!(
                "cannot submit {:?} command buffer {} in state {:?}",
                self.mode, self.id, status.state
            )));
        }
        let commands = self.frozen.clone().ok_or_else(|| {
            HalError::invalid_state(format!("command buffer {} has no frozen commands", self.id))
        })?;
        status.state = CommandBufferState::Submitted;
        status.failure = None;
        Ok((commands, Arc::clone(&self.status)))
    }

    /// Rolls back a `begin_submit` whose enqueue was rejected.
    pub(crate) fn cancel_submit(&self, previous: CommandBufferState) {
        self.status.lock().state = previous;
    }

    pub(crate) fn status_handle(&self) -> std::sync::Weak<CommandBufferStatus> {
        Arc::downgrade(&self.status)
    }
}

impl fmt::Debug for CommandBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandBuffer")
            .field("id", &self.id)
            .field("device", &self.device)
            .field("mode", &self.mode)
            .field("state", &self.state())
            .field("commands", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::buffer::{Allocator, HostAllocator};

    #[test]
    fn finalize_twice_is_invalid_state() {
        let mut cb = CommandBuffer::new(DeviceId::next(), CommandBufferMode::OneShot);
        cb.finalize().unwrap();
        assert_eq!(cb.state(), CommandBufferState::Finalized);
        assert!(matches!(cb.finalize(), Err(HalError::InvalidState(_))));
    }

    #[test]
    fn recording_after_finalize_is_rejected() {
        let allocator = HostAllocator::default();
        let buffer = allocator.allocate(16).unwrap();
        let mut cb = CommandBuffer::new(DeviceId::next(), CommandBufferMode::OneShot);
        cb.fill_buffer(&buffer, 0, 16, &[1, 2, 3, 4]).unwrap();
        cb.finalize().unwrap();
        assert!(matches!(
            cb.fill_buffer(&buffer, 0, 16, &[0]),
            Err(HalError::InvalidState(_))
        ));
        assert_eq!(cb.len(), 1);
    }

    #[test]
    fn copy_ranges_are_validated_at_record_time() {
        let allocator = HostAllocator::default();
        let src = allocator.allocate(8).unwrap();
        let dst = allocator.allocate(4).unwrap();
        let mut cb = CommandBuffer::new(DeviceId::next(), CommandBufferMode::OneShot);
        assert!(matches!(
            cb.copy_buffer(&src, 0, &dst, 0, 8),
            Err(HalError::InvalidArgument(_))
        ));
        cb.copy_buffer(&src, 4, &dst, 0, 4).unwrap();
    }

    #[test]
    fn submission_rules_follow_mode() {
        let mut recording = CommandBuffer::new(DeviceId::next(), CommandBufferMode::OneShot);
        assert!(matches!(
            recording.begin_submit(),
            Err(HalError::InvalidState(_))
        ));

        recording.finalize().unwrap();
        let (_, status) = recording.begin_submit().unwrap();
        status.mark_completed();
        assert_eq!(recording.state(), CommandBufferState::Completed);
        assert!(matches!(
            recording.begin_submit(),
            Err(HalError::InvalidState(_))
        ));

        let mut reusable = CommandBuffer::new(DeviceId::next(), CommandBufferMode::Reusable);
        reusable.finalize().unwrap();
        let (_, status) = reusable.begin_submit().unwrap();
        assert!(matches!(
            reusable.begin_submit(),
            Err(HalError::InvalidState(_))
        ));
        status.mark_failed(HalError::execution("boom"));
        assert_eq!(reusable.failure(), Some(HalError::execution("boom")));
        reusable.begin_submit().unwrap();
        assert_eq!(reusable.failure(), None);
    }
}
