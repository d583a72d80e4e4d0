use ospd::orchestrator::{OrchestratorConfig, ShutdownOrchestrator, StopCause};
use ospd::{send_terminate, send_terminate_local, MemorySink, SharedSink, WorkerExit, WorkerSpec};

use std::fs;
use std::thread;
use std::time::{Duration, Instant};

fn config(max_iterations: u32, poll: Duration) -> OrchestratorConfig {
    OrchestratorConfig {
        bind_host: "127.0.0.1".to_string(),
        port: 0,
        max_iterations: Some(max_iterations),
        poll_interval: poll,
    }
}

fn two_workers() -> Vec<WorkerSpec> {
    vec![WorkerSpec::new("A", 100), WorkerSpec::new("B", 50)]
}

#[test]
fn remote_stop_is_observed_within_one_poll() {
    let memory = MemorySink::new();
    let poll = Duration::from_millis(20);
    // Budget is large enough that only the remote stop can end the loop
    let orchestrator = ShutdownOrchestrator::start(&two_workers(), &memory.shared(), config(250, poll)).unwrap();
    let port = orchestrator.local_addr().port();

    let started = Instant::now();
    let sender = thread::spawn(move || {
        thread::sleep(Duration::from_millis(120));
        let sent = send_terminate("127.0.0.1", port);
        (sent, Instant::now())
    });

    let (cause, iterations) = orchestrator.wait_for_termination();
    let observed = Instant::now();
    let (sent, sent_at) = sender.join().unwrap();

    assert!(sent);
    assert_eq!(cause, StopCause::RemoteSignal);
    assert!(iterations < 250);
    assert!(observed >= sent_at);
    assert!(
        observed - sent_at < poll + Duration::from_millis(250),
        "termination noticed {:?} after the send",
        observed - sent_at
    );

    let report = orchestrator.shutdown(cause, iterations);
    assert!(started.elapsed() < Duration::from_secs(5), "shutdown took too long");
    assert!(report.listener.is_terminate());
    assert_eq!(report.workers.len(), 2);
    for worker in &report.workers {
        assert_eq!(worker.exit, WorkerExit::StopRequested);
        assert!(worker.completed_units >= 1, "{} did no work", worker.name);
    }

    let contents = memory.contents();
    for worker in &report.workers {
        let started_lines = contents
            .lines()
            .filter(|l| l.starts_with(&format!("worker {} started", worker.name)))
            .count() as u64;
        assert_eq!(started_lines, worker.completed_units);
    }
}

#[test]
fn budget_alone_ends_the_run_without_a_signal() {
    let memory = MemorySink::new();
    let started = Instant::now();

    let orchestrator =
        ShutdownOrchestrator::start(&two_workers(), &memory.shared(), config(5, Duration::from_secs(1))).unwrap();
    let report = orchestrator.run();
    let elapsed = started.elapsed();

    assert_eq!(report.cause, StopCause::IterationBudget);
    assert_eq!(report.iterations, 5);
    assert!(elapsed >= Duration::from_secs(5));
    assert!(elapsed < Duration::from_secs(8), "run took {:?}", elapsed);
    assert!(!report.listener.is_terminate());
    for worker in &report.workers {
        assert_eq!(worker.exit, WorkerExit::StopRequested);
        assert!(worker.completed_units >= 1);
    }
}

#[test]
fn file_sink_holds_every_unit_after_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("work.txt");
    let sink = SharedSink::create_file(&path).unwrap();

    let orchestrator = ShutdownOrchestrator::start(&two_workers(), &sink, config(100, Duration::from_millis(10))).unwrap();
    let port = orchestrator.local_addr().port();

    let sender = thread::spawn(move || {
        thread::sleep(Duration::from_millis(150));
        send_terminate_local(port)
    });
    let report = orchestrator.run();
    assert!(sender.join().unwrap());
    sink.flush().unwrap();

    let contents = fs::read_to_string(&path).unwrap();
    let total: u64 = report.workers.iter().map(|w| w.completed_units).sum();
    assert_eq!(contents.matches(" finished work unit ").count() as u64, total);
    assert_eq!(report.cause, StopCause::RemoteSignal);
}

#[test]
fn stopping_a_missing_instance_fails() {
    let port = {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        probe.local_addr().unwrap().port()
    };
    assert!(!send_terminate("127.0.0.1", port));
}
