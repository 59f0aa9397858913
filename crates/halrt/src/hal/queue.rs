//! Submission queue shared by every backend.
//!
//! Backends provide a [`CommandExecutor`] that knows how to run dispatch and
//! transfer commands; the queue owns ordering, semaphore waits and signals,
//! failure propagation, abandonment and device loss.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::command_buffer::{Command, CommandBuffer, CommandBufferStatus};
use super::device::DeviceId;
use super::error::{HalError, HalResult};
use super::semaphore::{SemaphoreValue, TimepointWaker};

static NEXT_SUBMISSION_ID: AtomicU64 = AtomicU64::new(1);

/// Runs non-synchronization commands for one backend.
pub trait CommandExecutor: Send + Sync + 'static {
    /// Executes a dispatch, copy or fill. Semaphore commands never reach the executor.
    fn execute(&self, command: &Command) -> HalResult<()>;

    /// Waits for work handed to the hardware to finish. Called before every
    /// semaphore signal and at the end of each submission.
    fn flush(&self) -> HalResult<()> {
        Ok(())
    }
}

/// Where submitted work runs.
///
/// Neither model parks a thread on a semaphore recorded inside a command
/// buffer: the submission is split at the wait and the remainder goes back to
/// the pending set until the wait is satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulingModel {
    /// A pool of worker threads picks up ready submissions.
    Workers(usize),
    /// Ready submissions run on the submitting thread when the queue is idle;
    /// anything else is deferred to a single fallback worker.
    Inline,
}

struct Submission {
    id: u64,
    epoch: u64,
    commands: Arc<[Command]>,
    /// Index of the next command to run.
    resume_at: usize,
    status: Arc<CommandBufferStatus>,
    waits: Vec<SemaphoreValue>,
    signals: Vec<SemaphoreValue>,
}

impl Submission {
    fn is_ready(&self) -> bool {
        self.waits.iter().all(SemaphoreValue::is_reached)
    }
}

/// How far one pass over a submission got.
enum Progress {
    Finished,
    /// Stopped before command `resume_at`, behind an unreached embedded wait.
    Parked {
        resume_at: usize,
        wait: SemaphoreValue,
    },
}

struct QueueState {
    pending: VecDeque<Submission>,
    in_flight: usize,
    shutdown: bool,
    lost: Option<HalError>,
    epoch: u64,
}

struct QueueShared {
    device: DeviceId,
    state: Mutex<QueueState>,
    work: Condvar,
    idle: Condvar,
    executor: Arc<dyn CommandExecutor>,
    this: Weak<QueueShared>,
}

impl TimepointWaker for QueueShared {
    fn wake(&self) {
        let _state = self.lock();
        self.work.notify_all();
    }
}

impl QueueShared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn waker(&self) -> Weak<dyn TimepointWaker> {
        self.this.clone()
    }

    fn is_idle(state: &QueueState) -> bool {
        state.pending.is_empty() && state.in_flight == 0
    }

    fn interrupted(&self, state: &QueueState, epoch: u64) -> HalResult<()> {
        if let Some(lost) = &state.lost {
            return Err(lost.clone());
        }
        if state.epoch != epoch {
            return Err(HalError::cancelled(format!(
                "work on device {} was abandoned",
                self.device
            )));
        }
        Ok(())
    }

    fn run(&self, submission: &Submission) -> HalResult<Progress> {
        let commands = submission.commands.iter().enumerate();
        for (index, command) in commands.skip(submission.resume_at) {
            self.interrupted(&self.lock(), submission.epoch)?;
            match command {
                Command::WaitSemaphore(wait) => {
                    if !wait.is_reached() {
                        self.executor.flush()?;
                        return Ok(Progress::Parked {
                            resume_at: index + 1,
                            wait: wait.clone(),
                        });
                    }
                }
                Command::SignalSemaphore(signal) => {
                    self.executor.flush()?;
                    signal.semaphore.signal(signal.value)?;
                }
                other => self.executor.execute(other)?,
            }
        }
        self.executor.flush()?;
        Ok(Progress::Finished)
    }

    fn settle(&self, submission: Submission, result: HalResult<Progress>) {
        match result {
            Ok(Progress::Finished) => self.finish(submission, Ok(())),
            Ok(Progress::Parked { resume_at, wait }) => self.park(submission, resume_at, wait),
            Err(err) => self.finish(submission, Err(err)),
        }
    }

    /// Returns the unfinished tail of a submission to the pending set, gated on `wait`.
    fn park(&self, submission: Submission, resume_at: usize, wait: SemaphoreValue) {
        tracing::debug!(
            device = %self.device,
            submission = submission.id,
            resume_at,
            semaphore = wait.semaphore.id(),
            value = wait.value,
            "submission parked on embedded wait"
        );
        let mut state = self.lock();
        state.in_flight -= 1;
        if state.epoch != submission.epoch || state.lost.is_some() {
            let err = state.lost.clone().unwrap_or_else(|| {
                HalError::cancelled(format!("submission {} was abandoned", submission.id))
            });
            submission.status.mark_failed(err);
            if Self::is_idle(&state) {
                self.idle.notify_all();
            }
            return;
        }
        wait.semaphore.register_timepoint(wait.value, self.waker());
        // Ahead of later submissions so the tail keeps its place once ready.
        state.pending.push_front(Submission {
            resume_at,
            waits: vec![wait],
            ..submission
        });
        self.work.notify_all();
    }

    fn finish(&self, submission: Submission, result: HalResult<()>) {
        match result {
            Ok(()) => {
                for signal in &submission.signals {
                    if let Err(err) = signal.semaphore.signal(signal.value) {
                        tracing::warn!(
                            submission = submission.id,
                            semaphore = signal.semaphore.id(),
                            error = %err,
                            "failed to signal semaphore after completion"
                        );
                    }
                }
                // Completed only once every signal target is reached.
                submission.status.mark_completed();
                tracing::debug!(device = %self.device, submission = submission.id, "submission completed");
            }
            Err(err) => {
                tracing::warn!(
                    device = %self.device,
                    submission = submission.id,
                    error = %err,
                    "submission failed; signal semaphores left untouched"
                );
                if err.is_device_lost() {
                    self.mark_lost(err.clone());
                }
                submission.status.mark_failed(err);
            }
        }
        let mut state = self.lock();
        state.in_flight -= 1;
        if Self::is_idle(&state) {
            self.idle.notify_all();
        }
        self.work.notify_all();
    }

    fn mark_lost(&self, error: HalError) {
        let mut state = self.lock();
        if state.lost.is_none() {
            tracing::warn!(device = %self.device, error = %error, "device lost");
            state.lost = Some(error.clone());
        }
        for pending in state.pending.drain(..) {
            pending.status.mark_failed(error.clone());
        }
        self.work.notify_all();
        if Self::is_idle(&state) {
            self.idle.notify_all();
        }
    }

    fn worker_loop(self: Arc<Self>) {
        loop {
            let submission = {
                let mut state = self.lock();
                loop {
                    if let Some(index) = state.pending.iter().position(Submission::is_ready) {
                        if let Some(submission) = state.pending.remove(index) {
                            state.in_flight += 1;
                            break submission;
                        }
                    }
                    if state.shutdown {
                        return;
                    }
                    state = self
                        .work
                        .wait(state)
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                }
            };
            tracing::debug!(device = %self.device, submission = submission.id, "submission started");
            let result = self.run(&submission);
            self.settle(submission, result);
        }
    }
}

/// Per-device ordered submission queue.
pub struct DeviceQueue {
    shared: Arc<QueueShared>,
    model: SchedulingModel,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl DeviceQueue {
    pub fn new(
        device: DeviceId,
        model: SchedulingModel,
        executor: Arc<dyn CommandExecutor>,
    ) -> HalResult<Self> {
        let shared = Arc::new_cyclic(|this| QueueShared {
            device,
            state: Mutex::new(QueueState {
                pending: VecDeque::new(),
                in_flight: 0,
                shutdown: false,
                lost: None,
                epoch: 0,
            }),
            work: Condvar::new(),
            idle: Condvar::new(),
            executor,
            this: this.clone(),
        });
        let worker_count = match model {
            SchedulingModel::Workers(count) => count.max(1),
            SchedulingModel::Inline => 1,
        };
        let mut workers = Vec::with_capacity(worker_count);
        for index in 0..worker_count {
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("halrt-queue-{device}-{index}"))
                .spawn(move || shared.worker_loop())
                .map_err(|err| {
                    HalError::resource_exhausted(format!("failed to spawn queue worker: {err}"))
                })?;
            workers.push(handle);
        }
        Ok(Self {
            shared,
            model,
            workers: Mutex::new(workers),
        })
    }

    pub fn model(&self) -> SchedulingModel {
        self.model
    }

    /// Enqueues a finalized command buffer. Returns once the work is scheduled
    /// (or, for inline scheduling of ready work, once it has run).
    pub fn submit(
        &self,
        command_buffer: &CommandBuffer,
        waits: &[SemaphoreValue],
        signals: &[SemaphoreValue],
    ) -> HalResult<()> {
        let device = self.shared.device;
        if command_buffer.device() != device {
            return Err(HalError::invalid_argument(format!(
                "command buffer {} was created by device {}, submitted to device {device}",
                command_buffer.id(),
                command_buffer.device()
            )));
        }
        for signal in signals {
            let current = signal.semaphore.query();
            if signal.value <= current {
                return Err(HalError::invalid_argument(format!(
                    "signal value {} for semaphore {} does not advance current value {current}",
                    signal.value,
                    signal.semaphore.id()
                )));
            }
        }

        let previous = command_buffer.state();
        let (commands, status) = command_buffer.begin_submit()?;
        let submission = Submission {
            id: NEXT_SUBMISSION_ID.fetch_add(1, Ordering::Relaxed),
            epoch: 0,
            commands,
            resume_at: 0,
            status,
            waits: waits.to_vec(),
            signals: signals.to_vec(),
        };

        let mut state = self.shared.lock();
        if let Some(lost) = &state.lost {
            let err = lost.clone();
            drop(state);
            command_buffer.cancel_submit(previous);
            return Err(err);
        }
        if state.shutdown {
            drop(state);
            command_buffer.cancel_submit(previous);
            return Err(HalError::invalid_state(format!("device {device} is shutting down")));
        }
        let submission = Submission {
            epoch: state.epoch,
            ..submission
        };

        let run_inline = self.model == SchedulingModel::Inline
            && QueueShared::is_idle(&state)
            && submission.is_ready();
        if run_inline {
            state.in_flight += 1;
            drop(state);
            tracing::debug!(device = %device, submission = submission.id, "running submission inline");
            let result = self.shared.run(&submission);
            self.shared.settle(submission, result);
            return Ok(());
        }

        for wait in &submission.waits {
            wait.semaphore
                .register_timepoint(wait.value, self.shared.waker());
        }
        tracing::debug!(
            device = %device,
            submission = submission.id,
            waits = submission.waits.len(),
            signals = submission.signals.len(),
            "submission enqueued"
        );
        state.pending.push_back(submission);
        self.shared.work.notify_all();
        Ok(())
    }

    /// Blocks until no submission is pending or running.
    pub fn wait_idle(&self, timeout: Option<Duration>) -> HalResult<()> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut state = self.shared.lock();
        while !QueueShared::is_idle(&state) {
            state = match deadline {
                None => self
                    .shared
                    .idle
                    .wait(state)
                    .unwrap_or_else(|poisoned| poisoned.into_inner()),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(HalError::deadline_exceeded(format!(
                            "device {} still has {} pending and {} running submissions",
                            self.shared.device,
                            state.pending.len(),
                            state.in_flight
                        )));
                    }
                    self.shared
                        .idle
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .0
                }
            };
        }
        match &state.lost {
            Some(lost) => Err(lost.clone()),
            None => Ok(()),
        }
    }

    /// Fails every submission that has not completed with `Cancelled`.
    ///
    /// Pending work is failed immediately; running work stops at its next
    /// command boundary. Signal semaphores are left untouched.
    pub fn abandon(&self) {
        let mut state = self.shared.lock();
        state.epoch += 1;
        let abandoned = state.pending.len();
        for pending in state.pending.drain(..) {
            pending.status.mark_failed(HalError::cancelled(format!(
                "submission {} abandoned before it started",
                pending.id
            )));
        }
        if abandoned > 0 || state.in_flight > 0 {
            tracing::debug!(
                device = %self.shared.device,
                pending = abandoned,
                running = state.in_flight,
                "abandoning outstanding work"
            );
        }
        self.shared.work.notify_all();
        if QueueShared::is_idle(&state) {
            self.shared.idle.notify_all();
        }
    }

    /// Marks the device permanently unusable.
    pub fn mark_lost(&self, error: HalError) {
        self.shared.mark_lost(error);
    }

    pub fn lost(&self) -> Option<HalError> {
        self.shared.lock().lost.clone()
    }

    pub fn pending_count(&self) -> usize {
        self.shared.lock().pending.len()
    }
}

impl Drop for DeviceQueue {
    fn drop(&mut self) {
        self.abandon();
        {
            let mut state = self.shared.lock();
            state.shutdown = true;
            self.shared.work.notify_all();
        }
        let workers = std::mem::take(
            &mut *self
                .workers
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        let current = thread::current().id();
        for worker in workers {
            if worker.thread().id() == current {
                continue;
            }
            if worker.join().is_err() {
                tracing::warn!(device = %self.shared.device, "queue worker panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::buffer::{Allocator, HostAllocator};
    use crate::hal::command_buffer::{CommandBufferMode, CommandBufferState};
    use crate::hal::semaphore::Semaphore;
    use std::sync::atomic::AtomicBool;

    /// Runs copies and fills on host buffers; fails fills with a 0xEE pattern.
    struct HostExecutor {
        lose_device: AtomicBool,
    }

    impl CommandExecutor for HostExecutor {
        fn execute(&self, command: &Command) -> HalResult<()> {
            match command {
                Command::CopyBuffer {
                    source,
                    source_offset,
                    target,
                    target_offset,
                    length,
                } => {
                    let mut bytes = vec![0u8; *length];
                    source.read(*source_offset, &mut bytes)?;
                    target.write(*target_offset, &bytes)
                }
                Command::FillBuffer {
                    target,
                    offset,
                    length,
                    pattern,
                } => {
                    if pattern.first() == Some(&0xEE) {
                        if self.lose_device.load(Ordering::SeqCst) {
                            return Err(HalError::device_lost("simulated"));
                        }
                        return Err(HalError::execution("poisoned fill"));
                    }
                    target.fill(*offset, *length, pattern)
                }
                _ => Err(HalError::execution("unsupported")),
            }
        }
    }

    fn queue(model: SchedulingModel) -> (DeviceId, DeviceQueue) {
        let device = DeviceId::next();
        let executor = Arc::new(HostExecutor {
            lose_device: AtomicBool::new(false),
        });
        (device, DeviceQueue::new(device, model, executor).unwrap())
    }

    fn fill_buffer(device: DeviceId, target: &crate::hal::buffer::Buffer, byte: u8) -> CommandBuffer {
        let mut cb = CommandBuffer::new(device, CommandBufferMode::OneShot);
        cb.fill_buffer(target, 0, target.byte_length(), &[byte]).unwrap();
        cb.finalize().unwrap();
        cb
    }

    #[test]
    fn completes_and_signals() {
        let (device, queue) = queue(SchedulingModel::Workers(2));
        let buffer = HostAllocator::default().allocate(4).unwrap();
        let cb = fill_buffer(device, &buffer, 7);
        let done = Semaphore::new(0);
        queue.submit(&cb, &[], &[SemaphoreValue::new(&done, 1)]).unwrap();
        done.wait(1, Some(Duration::from_secs(5))).unwrap();
        queue.wait_idle(Some(Duration::from_secs(5))).unwrap();
        assert_eq!(cb.state(), CommandBufferState::Completed);
        assert_eq!(buffer.read_all().unwrap(), vec![7; 4]);
    }

    #[test]
    fn failure_leaves_semaphore_untouched() {
        let (device, queue) = queue(SchedulingModel::Workers(1));
        let buffer = HostAllocator::default().allocate(4).unwrap();
        let cb = fill_buffer(device, &buffer, 0xEE);
        let done = Semaphore::new(0);
        queue.submit(&cb, &[], &[SemaphoreValue::new(&done, 1)]).unwrap();
        queue.wait_idle(Some(Duration::from_secs(5))).unwrap();
        assert_eq!(cb.state(), CommandBufferState::Failed);
        assert_eq!(done.query(), 0);
        assert!(matches!(
            done.wait(1, Some(Duration::from_millis(20))),
            Err(HalError::DeadlineExceeded(_))
        ));
    }

    #[test]
    fn blocked_submission_does_not_block_ready_ones() {
        let (device, queue) = queue(SchedulingModel::Workers(1));
        let allocator = HostAllocator::default();
        let first = allocator.allocate(4).unwrap();
        let second = allocator.allocate(4).unwrap();
        let gate = Semaphore::new(0);
        let blocked = fill_buffer(device, &first, 1);
        let ready = fill_buffer(device, &second, 2);
        let ready_done = Semaphore::new(0);
        queue.submit(&blocked, &[SemaphoreValue::new(&gate, 1)], &[]).unwrap();
        queue
            .submit(&ready, &[], &[SemaphoreValue::new(&ready_done, 1)])
            .unwrap();
        ready_done.wait(1, Some(Duration::from_secs(5))).unwrap();
        ready.wait_settled(Some(Duration::from_secs(5))).unwrap();
        assert!(matches!(
            queue.wait_idle(Some(Duration::from_millis(50))),
            Err(HalError::DeadlineExceeded(_))
        ));
        assert_eq!(ready.state(), CommandBufferState::Completed);
        assert_eq!(blocked.state(), CommandBufferState::Submitted);
        gate.signal(1).unwrap();
        queue.wait_idle(Some(Duration::from_secs(5))).unwrap();
        assert_eq!(first.read_all().unwrap(), vec![1; 4]);
    }

    #[test]
    fn abandon_cancels_pending_work() {
        let (device, queue) = queue(SchedulingModel::Workers(1));
        let buffer = HostAllocator::default().allocate(4).unwrap();
        let gate = Semaphore::new(0);
        let done = Semaphore::new(0);
        let cb = fill_buffer(device, &buffer, 3);
        queue
            .submit(&cb, &[SemaphoreValue::new(&gate, 1)], &[SemaphoreValue::new(&done, 1)])
            .unwrap();
        queue.abandon();
        queue.wait_idle(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(cb.state(), CommandBufferState::Failed);
        assert!(matches!(cb.failure(), Some(HalError::Cancelled(_))));
        gate.signal(1).unwrap();
        assert_eq!(done.query(), 0);
    }

    #[test]
    fn device_loss_fails_pending_and_rejects_new_work() {
        let device = DeviceId::next();
        let executor = Arc::new(HostExecutor {
            lose_device: AtomicBool::new(true),
        });
        let queue = DeviceQueue::new(device, SchedulingModel::Workers(1), executor).unwrap();
        let buffer = HostAllocator::default().allocate(4).unwrap();
        let gate = Semaphore::new(0);
        let parked = fill_buffer(device, &buffer, 1);
        queue.submit(&parked, &[SemaphoreValue::new(&gate, 1)], &[]).unwrap();
        let failing = fill_buffer(device, &buffer, 0xEE);
        queue.submit(&failing, &[], &[]).unwrap();
        assert!(matches!(
            queue.wait_idle(Some(Duration::from_secs(5))),
            Err(HalError::DeviceLost(_))
        ));
        assert!(matches!(parked.failure(), Some(HalError::DeviceLost(_))));
        let late = fill_buffer(device, &buffer, 2);
        assert!(matches!(
            queue.submit(&late, &[], &[]),
            Err(HalError::DeviceLost(_))
        ));
        assert_eq!(late.state(), CommandBufferState::Finalized);
    }

    #[test]
    fn inline_model_runs_ready_work_on_caller() {
        let (device, queue) = queue(SchedulingModel::Inline);
        let buffer = HostAllocator::default().allocate(4).unwrap();
        let cb = fill_buffer(device, &buffer, 9);
        queue.submit(&cb, &[], &[]).unwrap();
        assert_eq!(cb.state(), CommandBufferState::Completed);
        assert_eq!(buffer.read_all().unwrap(), vec![9; 4]);
    }

    #[test]
    fn embedded_wait_orders_commands() {
        let (device, queue) = queue(SchedulingModel::Workers(2));
        let allocator = HostAllocator::default();
        let buffer = allocator.allocate(4).unwrap();
        let gate = Semaphore::new(0);
        let mut cb = CommandBuffer::new(device, CommandBufferMode::OneShot);
        cb.wait_semaphore(SemaphoreValue::new(&gate, 1)).unwrap();
        cb.fill_buffer(&buffer, 0, 4, &[5]).unwrap();
        cb.finalize().unwrap();
        queue.submit(&cb, &[], &[]).unwrap();
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(buffer.read_all().unwrap(), vec![0; 4]);
        gate.signal(1).unwrap();
        queue.wait_idle(Some(Duration::from_secs(5))).unwrap();
        assert_eq!(buffer.read_all().unwrap(), vec![5; 4]);
    }

    /// Stalls whoever signals the semaphore it is registered on.
    struct SlowWaker;

    impl TimepointWaker for SlowWaker {
        fn wake(&self) {
            std::thread::sleep(Duration::from_millis(50));
        }
    }

    #[test]
    fn completion_follows_every_signal() {
        let (device, queue) = queue(SchedulingModel::Workers(1));
        let buffer = HostAllocator::default().allocate(4).unwrap();
        let (a, b) = (Semaphore::new(0), Semaphore::new(0));
        let waker: Arc<dyn TimepointWaker> = Arc::new(SlowWaker);
        assert!(!a.register_timepoint(1, Arc::downgrade(&waker)));

        let cb = fill_buffer(device, &buffer, 4);
        queue
            .submit(&cb, &[], &[SemaphoreValue::new(&a, 1), SemaphoreValue::new(&b, 1)])
            .unwrap();
        cb.wait_settled(Some(Duration::from_secs(5))).unwrap();
        assert_eq!(cb.state(), CommandBufferState::Completed);
        assert_eq!((a.query(), b.query()), (1, 1));
    }

    /// A consumer parked on an embedded wait must not starve the producer
    /// submitted after it, whatever the number of threads.
    fn embedded_wait_yields_to_later_work(model: SchedulingModel) {
        let (device, queue) = queue(model);
        let allocator = HostAllocator::default();
        let consumed = allocator.allocate(4).unwrap();
        let produced = allocator.allocate(4).unwrap();
        let gate = Semaphore::new(0);

        let mut consumer = CommandBuffer::new(device, CommandBufferMode::OneShot);
        consumer.wait_semaphore(SemaphoreValue::new(&gate, 1)).unwrap();
        consumer.fill_buffer(&consumed, 0, 4, &[5]).unwrap();
        consumer.finalize().unwrap();
        let producer = fill_buffer(device, &produced, 6);

        queue.submit(&consumer, &[], &[]).unwrap();
        assert_eq!(consumer.state(), CommandBufferState::Submitted);
        queue
            .submit(&producer, &[], &[SemaphoreValue::new(&gate, 1)])
            .unwrap();

        gate.wait(1, Some(Duration::from_secs(5))).unwrap();
        queue.wait_idle(Some(Duration::from_secs(5))).unwrap();
        assert_eq!(producer.state(), CommandBufferState::Completed);
        assert_eq!(consumer.state(), CommandBufferState::Completed);
        assert_eq!(produced.read_all().unwrap(), vec![6; 4]);
        assert_eq!(consumed.read_all().unwrap(), vec![5; 4]);
    }

    #[test]
    fn embedded_wait_yields_inline() {
        embedded_wait_yields_to_later_work(SchedulingModel::Inline);
    }

    #[test]
    fn embedded_wait_yields_on_single_worker() {
        embedded_wait_yields_to_later_work(SchedulingModel::Workers(1));
    }

    #[test]
    fn abandon_cancels_parked_tail() {
        let (device, queue) = queue(SchedulingModel::Workers(1));
        let buffer = HostAllocator::default().allocate(4).unwrap();
        let gate = Semaphore::new(0);
        let mut cb = CommandBuffer::new(device, CommandBufferMode::OneShot);
        cb.fill_buffer(&buffer, 0, 4, &[1]).unwrap();
        cb.wait_semaphore(SemaphoreValue::new(&gate, 1)).unwrap();
        cb.fill_buffer(&buffer, 0, 4, &[2]).unwrap();
        cb.finalize().unwrap();
        queue.submit(&cb, &[], &[]).unwrap();
        while buffer.read_all().unwrap() != vec![1; 4] {
            std::thread::sleep(Duration::from_millis(1));
        }
        queue.abandon();
        assert!(matches!(
            cb.wait_settled(Some(Duration::from_secs(5))),
            Err(HalError::Cancelled(_))
        ));
        gate.signal(1).unwrap();
        queue.wait_idle(Some(Duration::from_secs(5))).unwrap();
        assert_eq!(buffer.read_all().unwrap(), vec![1; 4]);
    }

    #[test]
    fn foreign_command_buffer_is_rejected() {
        let (_, queue) = queue(SchedulingModel::Workers(1));
        let mut cb = CommandBuffer::new(DeviceId::next(), CommandBufferMode::OneShot);
        cb.finalize().unwrap();
        assert!(matches!(
            queue.submit(&cb, &[], &[]),
            Err(HalError::InvalidArgument(_))
        ));
    }
}
