use ospd::cli::{Command, ServeOptions};
use ospd::config::{default_workers, parse_worker_file, validate_workers};
use ospd::orchestrator::{self, OrchestratorConfig, OrchestratorError};
use ospd::{log, parse_args, send_terminate, send_terminate_with_timeout, set_log_file, LocalSignals, SharedSink};

use std::process;
use std::time::Duration;

fn main() {
    let args = parse_args();
    if let Some(log_file) = &args.log_file {
        set_log_file(log_file);
    }

    let code = match args.command {
        Command::Stop { host, port, connect_timeout } => stop(&host, port, connect_timeout),
        Command::Serve(opts) => serve(opts),
        Command::Help | Command::Version => 0,
    };
    process::exit(code);
}

fn stop(host: &str, port: u16, connect_timeout: Option<u64>) -> i32 {
    let _ = log(&format!("Attempting to stop running instance at {}:{}", host, port));
    let sent = match connect_timeout {
        Some(secs) => send_terminate_with_timeout(host, port, Duration::from_secs(secs)),
        None => send_terminate(host, port),
    };
    if sent {
        let _ = log("Stop request sent");
        0
    } else {
        let _ = log("Stop request failed");
        1
    }
}

fn serve(opts: ServeOptions) -> i32 {
    let _ = log("Begin of main()");
    scopeguard::defer! {
        let _ = log("End of main()");
    }

    let mut workers = match &opts.worker_file {
        Some(path) => match parse_worker_file(path) {
            Ok(specs) => specs,
            Err(e) => {
                let _ = log(&format!("Error reading worker file {}: {}", path, e));
                return 1;
            }
        },
        None => Vec::new(),
    };
    workers.extend(opts.workers.iter().cloned());
    if workers.is_empty() {
        workers = default_workers();
    }
    if let Err(e) = validate_workers(&workers) {
        let _ = log(&format!("Invalid worker configuration: {}", e));
        return 1;
    }

    let sink = match SharedSink::create_file(&opts.output_file) {
        Ok(sink) => sink,
        Err(e) => {
            let _ = log(&e.to_string());
            return 1;
        }
    };

    // Ctrl+C and SIGTERM go through the same orderly path as a remote stop
    let signals = match LocalSignals::install() {
        Ok(signals) => Some(signals),
        Err(e) => {
            let _ = log(&format!("Failed to install signal handlers, continuing without: {}", e));
            None
        }
    };
    let local_stop = signals.as_ref().map(LocalSignals::stop_flag);

    let config = OrchestratorConfig {
        bind_host: opts.bind_host.clone(),
        port: opts.port,
        max_iterations: opts.max_iterations,
        poll_interval: Duration::from_millis(opts.poll_millis),
    };

    let result = if opts.basic {
        if workers.len() > 1 {
            let _ = log(&format!("Basic mode runs one worker; using {}", workers[0].name));
        }
        orchestrator::run_inline(&workers[0], &sink, config, local_stop)
    } else {
        orchestrator::run(&workers, &sink, config, local_stop)
    };

    if let Some(signals) = signals {
        signals.close();
    }
    if let Err(e) = sink.flush() {
        let _ = log(&format!("Error flushing output file {}: {}", opts.output_file, e));
    }

    match result {
        Ok(report) => {
            let _ = log(&format!("Shut down after {} polls ({:?})", report.iterations, report.cause));
            for worker in &report.workers {
                let _ = log(&format!("Worker {} did {} units of work", worker.name, worker.completed_units));
            }
            0
        }
        Err(OrchestratorError::Listener(e)) => {
            let _ = log(&format!("Cannot start: {}", e));
            1
        }
        Err(e) => {
            let _ = log(&format!("Startup failed: {}", e));
            1
        }
    }
}
