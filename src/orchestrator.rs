use crate::config::{WorkerSpec, DEFAULT_MAX_ITERATIONS, DEFAULT_POLL_MILLIS};
use crate::listener::{ListenerError, ListenerExit, SignalListener};
use crate::logging::log_with_tag;
use crate::shutdown::StopFlag;
use crate::sink::SharedSink;
use crate::worker::{self, CancellableWorker, CooperativeWorker, WorkerHandle, WorkerReport};

use std::cell::Cell;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const TAG: &str = "main";

/// Listener address and poll loop bounds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// Address the listener binds to
    pub bind_host: String,
    /// Listener port; 0 picks an ephemeral port
    pub port: u16,
    /// Poll iterations before shutting down unprompted; None polls forever
    pub max_iterations: Option<u32>,
    /// Pause before each look at the stop condition
    pub poll_interval: Duration,
}

impl OrchestratorConfig {
    pub fn new(port: u16) -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            port,
            max_iterations: Some(DEFAULT_MAX_ITERATIONS),
            poll_interval: Duration::from_millis(DEFAULT_POLL_MILLIS),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Listener(#[from] ListenerError),

    #[error("failed to start worker {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: io::Error,
    },
}

/// What ended the poll loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopCause {
    /// The listener received the terminate marker
    RemoteSignal,
    /// SIGINT/SIGTERM (or another local stop flag) was raised
    LocalSignal,
    /// The poll budget ran out
    IterationBudget,
}

/// Outcome of a full run, available once everything has been joined
#[derive(Debug)]
pub struct ShutdownReport {
    pub cause: StopCause,
    pub iterations: u32,
    pub workers: Vec<WorkerReport>,
    pub listener: ListenerExit,
}

/// What the poll loop needs to know about the stop listener
pub trait ListenerStatus {
    /// A terminate marker has been received
    fn is_terminate(&self) -> bool;

    /// The listener has stopped accepting, for whatever reason
    fn is_finished(&self) -> bool;
}

impl ListenerStatus for SignalListener {
    fn is_terminate(&self) -> bool {
        SignalListener::is_terminate(self)
    }

    fn is_finished(&self) -> bool {
        SignalListener::is_finished(self)
    }
}

/// Owns the listener and all worker threads for one run
///
/// Shutdown is always "ask, then wait": workers get a stop request and are
/// then joined without a timeout. The listener is torn down only after every
/// worker has returned, so a stop marker arriving during teardown is harmless.
pub struct ShutdownOrchestrator {
    listener: SignalListener,
    workers: Vec<WorkerHandle<CooperativeWorker>>,
    local_stop: Option<StopFlag>,
    config: OrchestratorConfig,
}

impl ShutdownOrchestrator {
    /// Starts the listener, then every worker
    ///
    /// # Errors
    /// A bind failure is returned before any worker starts. If a worker thread
    /// can't be spawned, workers already running are stopped and joined and
    /// the listener is closed before the error is returned.
    pub fn start(
        specs: &[WorkerSpec],
        sink: &SharedSink,
        config: OrchestratorConfig,
    ) -> Result<Self, OrchestratorError> {
        let _ = log_with_tag("Starting a thread to handle termination requests", Some(TAG));
        let listener = SignalListener::start((config.bind_host.as_str(), config.port))?;

        // Closes the listener again if a worker fails to start
        let listener = scopeguard::guard(listener, |mut listener| {
            let _ = listener.kill();
            listener.join();
        });

        let names: Vec<&str> = specs.iter().map(|s| s.name.as_str()).collect();
        let _ = log_with_tag(&format!("Starting {} worker threads: {}", specs.len(), names.join(", ")), Some(TAG));

        let mut workers = Vec::with_capacity(specs.len());
        for spec in specs {
            let worker = Arc::new(CooperativeWorker::new(spec, sink.clone()));
            match worker::spawn(worker) {
                Ok(handle) => workers.push(handle),
                Err(source) => {
                    stop_workers(workers);
                    return Err(OrchestratorError::Spawn {
                        name: spec.name.clone(),
                        source,
                    });
                }
            }
        }

        Ok(Self {
            listener: scopeguard::ScopeGuard::into_inner(listener),
            workers,
            local_stop: None,
            config,
        })
    }

    /// Also stop when `flag` is raised, e.g. by `LocalSignals`
    pub fn with_local_stop(mut self, flag: StopFlag) -> Self {
        self.local_stop = Some(flag);
        self
    }

    /// Where the listener is accepting stop requests
    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    /// Polls until a stop is requested or the iteration budget runs out
    pub fn wait_for_termination(&self) -> (StopCause, u32) {
        poll_for_stop(&self.listener, self.local_stop.as_ref(), &self.config)
    }

    /// Asks every worker to stop, waits for all of them, then closes the listener
    pub fn shutdown(mut self, cause: StopCause, iterations: u32) -> ShutdownReport {
        let _ = log_with_tag("Signaling workers to stop when it is safe to do so", Some(TAG));
        let workers = stop_workers(self.workers);
        for report in &workers {
            let _ = log_with_tag(
                &format!("Worker {} did {} units of work ({:?})", report.name, report.completed_units, report.exit),
                Some(TAG),
            );
        }

        if let Err(e) = self.listener.kill() {
            let _ = log_with_tag(&format!("Error closing listener: {}", e), Some(TAG));
        }
        let listener = self.listener.join();

        ShutdownReport {
            cause,
            iterations,
            workers,
            listener,
        }
    }

    /// Polls for a stop condition, then performs the ordered shutdown
    pub fn run(self) -> ShutdownReport {
        let (cause, iterations) = self.wait_for_termination();
        self.shutdown(cause, iterations)
    }
}

/// The poll loop behind `ShutdownOrchestrator::wait_for_termination`
///
/// A listener that died without a terminate flag is noted once; polling
/// then continues on the budget and local signals alone.
pub fn poll_for_stop<L: ListenerStatus>(
    listener: &L,
    local_stop: Option<&StopFlag>,
    config: &OrchestratorConfig,
) -> (StopCause, u32) {
    let mut iterations = 0u32;
    let mut listener_gone = false;

    loop {
        if let Some(max) = config.max_iterations {
            if iterations >= max {
                let _ = log_with_tag(&format!("Poll budget of {} iterations exhausted, shutting down", max), Some(TAG));
                return (StopCause::IterationBudget, iterations);
            }
        }

        thread::sleep(config.poll_interval);
        iterations += 1;

        if listener.is_terminate() {
            let _ = log_with_tag("Handling remote termination request", Some(TAG));
            return (StopCause::RemoteSignal, iterations);
        }
        if local_stop.map_or(false, StopFlag::is_requested) {
            let _ = log_with_tag("Handling local termination request", Some(TAG));
            return (StopCause::LocalSignal, iterations);
        }
        if !listener_gone && listener.is_finished() {
            listener_gone = true;
            let _ = log_with_tag(
                "Listener exited without a stop request; continuing on iteration budget",
                Some(TAG),
            );
        }
    }
}

fn stop_workers(workers: Vec<WorkerHandle<CooperativeWorker>>) -> Vec<WorkerReport> {
    // Everyone is asked before anyone is waited on
    for handle in &workers {
        handle.request_stop_at_next_safe_point();
    }
    workers.into_iter().map(WorkerHandle::join).collect()
}

/// Starts the listener and workers, waits for a stop condition and shuts down
pub fn run(
    specs: &[WorkerSpec],
    sink: &SharedSink,
    config: OrchestratorConfig,
    local_stop: Option<StopFlag>,
) -> Result<ShutdownReport, OrchestratorError> {
    let mut orchestrator = ShutdownOrchestrator::start(specs, sink, config)?;
    if let Some(flag) = local_stop {
        orchestrator = orchestrator.with_local_stop(flag);
    }
    Ok(orchestrator.run())
}

/// Single-threaded variant: one worker runs on the calling thread
///
/// The worker consults the listener's terminate flag (and `local_stop`)
/// directly at each safe point. `max_iterations` bounds the number of units;
/// the worker's own delay takes the place of the poll interval.
pub fn run_inline(
    spec: &WorkerSpec,
    sink: &SharedSink,
    config: OrchestratorConfig,
    local_stop: Option<StopFlag>,
) -> Result<ShutdownReport, OrchestratorError> {
    let mut listener = SignalListener::start((config.bind_host.as_str(), config.port))?;
    let worker = CooperativeWorker::new(spec, sink.clone());

    let checks = Cell::new(0u32);
    let exit = worker.run_until(|| {
        checks.set(checks.get() + 1);
        listener.is_terminate()
            || local_stop.as_ref().map_or(false, StopFlag::is_requested)
            || config.max_iterations.map_or(false, |max| checks.get() >= max)
    });

    let cause = if listener.is_terminate() {
        StopCause::RemoteSignal
    } else if local_stop.as_ref().map_or(false, StopFlag::is_requested) {
        StopCause::LocalSignal
    } else {
        StopCause::IterationBudget
    };
    let _ = log_with_tag(
        &format!("Handling {:?} after {} units of work", cause, worker.completed_units()),
        Some(TAG),
    );

    if let Err(e) = listener.kill() {
        let _ = log_with_tag(&format!("Error closing listener: {}", e), Some(TAG));
    }
    let listener_exit = listener.join();

    Ok(ShutdownReport {
        cause,
        iterations: checks.get(),
        workers: vec![WorkerReport {
            name: worker.name().to_string(),
            completed_units: worker.completed_units(),
            exit,
        }],
        listener: listener_exit,
    })
}
