use crate::config::{WorkerSpec, DEFAULT_MAX_ITERATIONS, DEFAULT_POLL_MILLIS};
use std::env;
use std::process;

/// Options for a serving instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServeOptions {
    /// Port the stop listener binds to
    pub port: u16,
    /// Address the stop listener binds to
    pub bind_host: String,
    /// Where workers write their work lines
    pub output_file: String,
    /// JSONL worker file (`-c`)
    pub worker_file: Option<String>,
    /// Workers given as `-w NAME:DELAY_MS`
    pub workers: Vec<WorkerSpec>,
    /// Poll budget; None polls until stopped
    pub max_iterations: Option<u32>,
    /// Pause between polls (milliseconds)
    pub poll_millis: u64,
    /// Run a single worker on the main thread
    pub basic: bool,
}

/// What this invocation should do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Serve(ServeOptions),
    /// Ask a running instance on `host:port` to stop
    Stop {
        host: String,
        port: u16,
        connect_timeout: Option<u64>,
    },
    Help,
    Version,
}

/// Parsed command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Args {
    /// Diagnostic log file (`-l`); None logs to stdout
    pub log_file: Option<String>,
    pub command: Command,
}

/// Prints usage instructions for the program.
pub fn print_usage() {
    println!(
        "Usage: {prog} [-h] [-v] [-l logfile] [-c workers.jsonl] [-w name:delay_ms]... [-n max_iterations] [-i poll_millis] [-b] [--bind host] port output_file\n       {prog} [-l logfile] [-t connect_timeout] [host] port stop",
        prog = crate::PROGRAM_NAME
    );
}

/// Parses the process arguments, exiting on `-h`, `-v` or invalid input
pub fn parse_args() -> Args {
    match parse_args_from(env::args().skip(1)) {
        Ok(Args { command: Command::Help, .. }) => {
            print_usage();
            process::exit(0);
        }
        Ok(Args { command: Command::Version, .. }) => {
            println!("{} version {}", crate::PROGRAM_NAME, crate::PROGRAM_VERSION);
            process::exit(0);
        }
        Ok(args) => args,
        Err(e) => {
            eprintln!("Error: {}", e);
            print_usage();
            process::exit(1);
        }
    }
}

fn next_value<I: Iterator<Item = String>>(args: &mut I, what: &str) -> Result<String, String> {
    args.next().ok_or_else(|| format!("Missing {} argument", what))
}

fn parse_number<T: std::str::FromStr>(value: &str, what: &str) -> Result<T, String> {
    value
        .parse()
        .map_err(|_| format!("{} must be a non-negative number, got '{}'", what, value))
}

/// Parses arguments (without the program name)
///
/// # Errors
/// A message describing the first invalid or missing argument
pub fn parse_args_from<I: IntoIterator<Item = String>>(args: I) -> Result<Args, String> {
    let mut log_file = None;
    let mut worker_file = None;
    let mut workers = Vec::new();
    let mut max_iterations = Some(DEFAULT_MAX_ITERATIONS);
    let mut poll_millis = DEFAULT_POLL_MILLIS;
    let mut connect_timeout = None;
    let mut basic = false;
    let mut bind_host = "0.0.0.0".to_string();
    let mut positional = Vec::new();

    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" => return Ok(Args { log_file, command: Command::Help }),
            "-v" => return Ok(Args { log_file, command: Command::Version }),
            "-l" => log_file = Some(next_value(&mut args, "log file")?),
            "-c" => worker_file = Some(next_value(&mut args, "worker file")?),
            "-w" => {
                let value = next_value(&mut args, "worker")?;
                workers.push(WorkerSpec::parse_short(&value).map_err(|e| e.to_string())?);
            }
            "-n" => {
                let n: u32 = parse_number(&next_value(&mut args, "max iterations")?, "Max iterations")?;
                max_iterations = if n == 0 { None } else { Some(n) };
            }
            "-i" => {
                poll_millis = parse_number(&next_value(&mut args, "poll interval")?, "Poll interval")?;
            }
            "-t" => {
                let t: u64 = parse_number(&next_value(&mut args, "connect timeout")?, "Connect timeout")?;
                if t == 0 {
                    return Err("Connect timeout must be a positive number".to_string());
                }
                connect_timeout = Some(t);
            }
            "-b" => basic = true,
            "--bind" => bind_host = next_value(&mut args, "bind host")?,
            _ if arg.starts_with('-') && arg.len() > 1 => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => positional.push(arg),
        }
    }

    let is_stop = positional
        .last()
        .map_or(false, |last| last.eq_ignore_ascii_case("stop"));

    let command = if is_stop {
        let (host, port) = match positional.len() {
            2 => ("localhost".to_string(), &positional[0]),
            3 => (positional[0].clone(), &positional[1]),
            _ => return Err("Stop mode takes [host] port stop".to_string()),
        };
        Command::Stop {
            host,
            port: parse_number(port, "Port")?,
            connect_timeout,
        }
    } else {
        if positional.len() != 2 {
            return Err("Expected port and output file arguments".to_string());
        }
        Command::Serve(ServeOptions {
            port: parse_number(&positional[0], "Port")?,
            bind_host,
            output_file: positional[1].clone(),
            worker_file,
            workers,
            max_iterations,
            poll_millis,
            basic,
        })
    };

    Ok(Args { log_file, command })
}
