use crate::config::WorkerSpec;
use crate::logging::log_with_tag;
use crate::shutdown::StopFlag;
use crate::sink::SharedSink;

use std::io;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

/// Capability every cancellable worker exposes to its owner
///
/// A worker repeats bounded units of work and looks at its stop flag only
/// between units, at a "safe point". A unit that has started always runs to
/// completion before any stop check. The owner only ever asks; the worker
/// decides when it is safe to comply.
pub trait CancellableWorker: Send + Sync + 'static {
    /// Worker identity, used for thread names and log tags
    fn name(&self) -> &str;

    /// The flag the owner sets to ask for a stop
    fn stop_flag(&self) -> &StopFlag;

    /// Asks the worker to stop at its next safe point. Callable from any thread.
    fn request_stop_at_next_safe_point(&self) {
        self.stop_flag().request();
    }

    fn stop_requested(&self) -> bool {
        self.stop_flag().is_requested()
    }

    /// Number of fully completed units. Only stable once the worker has returned.
    fn completed_units(&self) -> u64;

    /// Wakes the worker from a pause between units; the worker then aborts.
    /// Workers without an interruptible pause ignore this.
    fn interrupt(&self) {}

    /// The worker's execution entry point, run on its own thread
    fn run(&self) -> WorkerExit;
}

/// Why a worker's run loop returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// Stop request observed at a safe point
    StopRequested,
    /// Internal unit cap reached
    UnitCap,
    /// Pause between units was interrupted (unsolicited abort)
    Interrupted,
    /// The worker thread panicked
    Panicked,
}

/// Observable position of a worker in its run loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    Idle = 0,
    RunningUnit = 1,
    SleepingBetweenUnits = 2,
    CheckingSafePoint = 3,
    Terminated = 4,
}

impl WorkerState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => WorkerState::RunningUnit,
            2 => WorkerState::SleepingBetweenUnits,
            3 => WorkerState::CheckingSafePoint,
            4 => WorkerState::Terminated,
            _ => WorkerState::Idle,
        }
    }
}

/// Source of the pauses a worker takes between units
pub trait Pacer: Send + Sync {
    /// Waits for `duration`. Returns false if interrupted before it elapsed.
    fn pause(&self, duration: Duration) -> bool;

    /// Cuts the current or next pause short
    fn interrupt(&self);
}

/// Wall-clock pause that can be cut short from another thread
///
/// The interrupt is sticky: interrupting a worker that is mid-unit makes its
/// next pause return immediately.
#[derive(Default)]
pub struct Pause {
    interrupted: Mutex<bool>,
    wakeup: Condvar,
}

impl Pacer for Pause {
    fn pause(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut interrupted = self.interrupted.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if *interrupted {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            interrupted = self
                .wakeup
                .wait_timeout(interrupted, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn interrupt(&self) {
        *self.interrupted.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.wakeup.notify_all();
    }
}

/// Worker that writes "started"/"finished" markers for each unit to a shared sink
pub struct CooperativeWorker {
    name: String,
    delay: Duration,
    unit_time: Duration,
    max_units: Option<u64>,
    completed: AtomicU64,
    stop: StopFlag,
    state: AtomicU8,
    pacer: Arc<dyn Pacer>,
    sink: SharedSink,
}

impl CooperativeWorker {
    pub fn new(spec: &WorkerSpec, sink: SharedSink) -> Self {
        Self::with_pacer(spec, sink, Arc::new(Pause::default()))
    }

    /// Like `new`, with the pauses between units taken from `pacer`
    pub fn with_pacer(spec: &WorkerSpec, sink: SharedSink, pacer: Arc<dyn Pacer>) -> Self {
        Self {
            name: spec.name.clone(),
            delay: spec.delay(),
            unit_time: spec.unit_time(),
            max_units: spec.unit_cap(),
            completed: AtomicU64::new(0),
            stop: StopFlag::new(),
            state: AtomicU8::new(WorkerState::Idle as u8),
            pacer,
            sink,
        }
    }

    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: WorkerState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Runs units until `should_stop` is true at a safe point
    ///
    /// `run()` passes the worker's own stop flag; the inline mode of the
    /// orchestrator also passes the listener's terminate flag.
    pub fn run_until<F: Fn() -> bool>(&self, should_stop: F) -> WorkerExit {
        let exit = self.work_loop(should_stop);
        self.set_state(WorkerState::Terminated);

        let reason = match exit {
            WorkerExit::StopRequested => "received stop request",
            WorkerExit::UnitCap => "finished all work units",
            WorkerExit::Interrupted => "was interrupted between units",
            WorkerExit::Panicked => "panicked",
        };
        let _ = log_with_tag(
            &format!("Worker {} {} after {} units, returning", self.name, reason, self.completed_units()),
            Some(&self.name),
        );
        exit
    }

    fn work_loop<F: Fn() -> bool>(&self, should_stop: F) -> WorkerExit {
        let thread_name = thread::current().name().unwrap_or("unnamed").to_string();
        let header = [
            format!("worker {} running", self.name),
            format!("worker {} thread {}", self.name, thread_name),
        ];
        self.write(&[header[0].as_str(), header[1].as_str()]);

        loop {
            // Point of no return: from here the unit always completes
            self.set_state(WorkerState::RunningUnit);
            let unit = self.completed.load(Ordering::SeqCst) + 1;
            self.write_line(&format!("worker {} started work unit {}-{}", self.name, self.name, unit));
            if !self.unit_time.is_zero() {
                thread::sleep(self.unit_time);
            }
            self.completed.store(unit, Ordering::SeqCst);
            self.write_line(&format!("worker {} finished work unit {}-{}", self.name, self.name, unit));

            self.set_state(WorkerState::SleepingBetweenUnits);
            if !self.pacer.pause(self.delay) {
                return WorkerExit::Interrupted;
            }

            self.set_state(WorkerState::CheckingSafePoint);
            if should_stop() {
                return WorkerExit::StopRequested;
            }
            if self.max_units.map_or(false, |cap| unit >= cap) {
                return WorkerExit::UnitCap;
            }
        }
    }

    fn write(&self, lines: &[&str]) {
        if let Err(e) = self.sink.write_block(lines) {
            let _ = log_with_tag(&format!("Error writing to output sink: {}", e), Some(&self.name));
        }
    }

    fn write_line(&self, line: &str) {
        self.write(&[line]);
    }
}

impl CancellableWorker for CooperativeWorker {
    fn name(&self) -> &str {
        &self.name
    }

    fn stop_flag(&self) -> &StopFlag {
        &self.stop
    }

    fn completed_units(&self) -> u64 {
        self.completed.load(Ordering::SeqCst)
    }

    fn interrupt(&self) {
        self.pacer.interrupt();
    }

    fn run(&self) -> WorkerExit {
        self.run_until(|| self.stop.is_requested())
    }
}

/// Final figures of a joined worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerReport {
    pub name: String,
    pub completed_units: u64,
    pub exit: WorkerExit,
}

/// A worker running on its own OS thread
pub struct WorkerHandle<W: CancellableWorker> {
    worker: Arc<W>,
    thread: thread::JoinHandle<WorkerExit>,
}

/// Starts `worker.run()` on a dedicated, named thread
pub fn spawn<W: CancellableWorker>(worker: Arc<W>) -> io::Result<WorkerHandle<W>> {
    let thread_worker = Arc::clone(&worker);
    let thread = thread::Builder::new()
        .name(format!("worker-{}", worker.name()))
        .spawn(move || thread_worker.run())?;
    Ok(WorkerHandle { worker, thread })
}

impl<W: CancellableWorker> WorkerHandle<W> {
    pub fn request_stop_at_next_safe_point(&self) {
        self.worker.request_stop_at_next_safe_point();
    }

    pub fn interrupt(&self) {
        self.worker.interrupt();
    }

    /// Waits, without any timeout, for the worker thread to return
    pub fn join(self) -> WorkerReport {
        let exit = self.thread.join().unwrap_or(WorkerExit::Panicked);
        WorkerReport {
            name: self.worker.name().to_string(),
            completed_units: self.worker.completed_units(),
            exit,
        }
    }
}
