//! Orderly Shutdown Protocol Library
//!
//! This library contains the core logic for the ospd utility: a stop
//! listener that a second invocation of the program can signal over TCP,
//! cooperative workers that honor stop requests only between units of
//! work, and the orchestration that starts everything and tears it down
//! in order.

pub mod cli;
pub mod config;
pub mod listener;
pub mod logging;
pub mod orchestrator;
pub mod sender;
pub mod shutdown;
pub mod sink;
pub mod worker;

pub use cli::parse_args;
pub use config::{parse_worker_file, WorkerSpec};
pub use listener::{ListenerError, ListenerExit, SignalListener, TERMINATE_MARKER};
pub use logging::{log, log_with_tag, set_log_file};
pub use orchestrator::{ListenerStatus, OrchestratorConfig, ShutdownOrchestrator, ShutdownReport, StopCause};
pub use sender::{send_terminate, send_terminate_local, send_terminate_with_timeout};
pub use shutdown::{LocalSignals, StopFlag};
pub use sink::{MemorySink, SharedSink};
pub use worker::{CancellableWorker, CooperativeWorker, Pacer, Pause, WorkerExit, WorkerReport, WorkerState};

/// Name of the program, used in usage and version output
pub const PROGRAM_NAME: &str = "ospd";

/// Current version of the program (from Cargo.toml)
pub const PROGRAM_VERSION: &str = env!("CARGO_PKG_VERSION");
