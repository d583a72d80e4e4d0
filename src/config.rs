use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufRead, BufReader, Error, ErrorKind};
use std::time::Duration;

/// Default pause between polls of the stop condition (milliseconds)
pub const DEFAULT_POLL_MILLIS: u64 = 3000;

/// Default bound on poll iterations before shutting down on our own
pub const DEFAULT_MAX_ITERATIONS: u32 = 12;

/// Default cap on units a single worker performs
pub const DEFAULT_MAX_UNITS: u64 = 100_000;

static WORKER_NAME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9_-]{1,32}$").expect("worker name pattern is valid")
});

/// One worker to start (JSON fields: name, delay_ms, unit_ms, max_units)
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct WorkerSpec {
    /// Worker identity, also used in output lines and thread names
    pub name: String,
    /// Interruptible pause after each unit (milliseconds)
    pub delay_ms: u64,
    /// Uninterruptible simulated work inside each unit (milliseconds)
    #[serde(default)]
    pub unit_ms: u64,
    /// Units to perform before stopping on its own; absent or 0 means unbounded
    #[serde(default = "default_max_units")]
    pub max_units: Option<u64>,
}

fn default_max_units() -> Option<u64> {
    Some(DEFAULT_MAX_UNITS)
}

impl WorkerSpec {
    pub fn new(name: &str, delay_ms: u64) -> Self {
        Self {
            name: name.to_string(),
            delay_ms,
            unit_ms: 0,
            max_units: default_max_units(),
        }
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    pub fn unit_time(&self) -> Duration {
        Duration::from_millis(self.unit_ms)
    }

    /// The unit cap, with 0 normalized to "no cap"
    pub fn unit_cap(&self) -> Option<u64> {
        self.max_units.filter(|&cap| cap > 0)
    }

    /// Parses the `NAME:DELAY_MS` form used on the command line
    pub fn parse_short(s: &str) -> Result<Self, Error> {
        let (name, delay) = s.split_once(':').ok_or_else(|| {
            Error::new(
                ErrorKind::InvalidInput,
                format!("worker '{}' must look like NAME:DELAY_MS", s),
            )
        })?;
        let delay_ms = delay.parse::<u64>().map_err(|e| {
            Error::new(
                ErrorKind::InvalidInput,
                format!("invalid delay '{}' for worker {}: {}", delay, name, e),
            )
        })?;
        let spec = Self::new(name, delay_ms);
        validate_name(&spec.name)?;
        Ok(spec)
    }
}

/// The two workers started when none are configured
pub fn default_workers() -> Vec<WorkerSpec> {
    vec![WorkerSpec::new("A", 6000), WorkerSpec::new("B", 1500)]
}

fn validate_name(name: &str) -> Result<(), Error> {
    if WORKER_NAME_RE.is_match(name) {
        Ok(())
    } else {
        Err(Error::new(
            ErrorKind::InvalidInput,
            format!("invalid worker name '{}': use 1-32 letters, digits, '_' or '-'", name),
        ))
    }
}

/// Rejects invalid or duplicate worker names
pub fn validate_workers(specs: &[WorkerSpec]) -> Result<(), Error> {
    let mut seen = HashSet::new();
    for spec in specs {
        validate_name(&spec.name)?;
        if !seen.insert(spec.name.as_str()) {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                format!("duplicate worker name '{}'", spec.name),
            ));
        }
    }
    Ok(())
}

/// Parses a worker file into worker specs
///
/// # File Format
/// JSONL - one JSON object per line, `#` comments and blank lines skipped:
/// `{"name":"A","delay_ms":6000,"unit_ms":0,"max_units":100000}`
///
/// # Errors
/// - File not found or unreadable
/// - Invalid JSON or missing required fields (reported with line number)
/// - Invalid or duplicate worker names
pub fn parse_worker_file(filename: &str) -> Result<Vec<WorkerSpec>, Error> {
    let file = File::open(filename)?;
    let reader = BufReader::new(file);

    let mut specs = Vec::new();
    for (line_num, line) in reader.lines().enumerate() {
        let line = line?;
        let line = line.trim();

        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let spec: WorkerSpec = serde_json::from_str(line).map_err(|e| {
            Error::new(
                ErrorKind::InvalidInput,
                format!("invalid JSON on line {}: {}", line_num + 1, e),
            )
        })?;

        validate_name(&spec.name).map_err(|e| {
            Error::new(ErrorKind::InvalidInput, format!("line {}: {}", line_num + 1, e))
        })?;

        specs.push(spec);
    }

    validate_workers(&specs)?;
    Ok(specs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn write_file(contents: &str) -> (tempfile::TempDir, String) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("workers.jsonl");
        fs::write(&path, contents).unwrap();
        let path = path.to_str().unwrap().to_string();
        (dir, path)
    }

    #[test]
    fn test_parse_worker_file() {
        let (_dir, path) = write_file(
            r#"# workers for the demo
{"name":"A","delay_ms":6000}

{"name":"B","delay_ms":1500,"unit_ms":250,"max_units":0}
{"name":"C","delay_ms":10,"max_units":null}
"#,
        );

        let specs = parse_worker_file(&path).unwrap();
        assert_eq!(
            specs,
            vec![
                WorkerSpec {
                    name: "A".to_string(),
                    delay_ms: 6000,
                    unit_ms: 0,
                    max_units: Some(DEFAULT_MAX_UNITS),
                },
                WorkerSpec {
                    name: "B".to_string(),
                    delay_ms: 1500,
                    unit_ms: 250,
                    max_units: Some(0),
                },
                WorkerSpec {
                    name: "C".to_string(),
                    delay_ms: 10,
                    unit_ms: 0,
                    max_units: None,
                },
            ]
        );
        assert_eq!(specs[1].unit_cap(), None);
        assert_eq!(specs[1].unit_time(), Duration::from_millis(250));
    }

    #[test]
    fn test_parse_worker_file_reports_line() {
        let (_dir, path) = write_file("{\"name\":\"A\",\"delay_ms\":1}\n{\"name\":\"B\"}\n");
        let err = parse_worker_file(&path).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert!(err.to_string().contains("line 2"), "{}", err);
    }

    #[test]
    fn test_parse_worker_file_rejects_duplicates_and_bad_names() {
        let (_dir, path) = write_file("{\"name\":\"A\",\"delay_ms\":1}\n{\"name\":\"A\",\"delay_ms\":2}\n");
        assert!(parse_worker_file(&path).unwrap_err().to_string().contains("duplicate"));

        let (_dir, path) = write_file("{\"name\":\"no spaces\",\"delay_ms\":1}\n");
        assert!(parse_worker_file(&path).is_err());
    }

    #[test]
    fn test_parse_short_form() {
        let spec = WorkerSpec::parse_short("fast:50").unwrap();
        assert_eq!(spec.name, "fast");
        assert_eq!(spec.delay(), Duration::from_millis(50));

        assert!(WorkerSpec::parse_short("fast").is_err());
        assert!(WorkerSpec::parse_short("fast:soon").is_err());
        assert!(WorkerSpec::parse_short(":50").is_err());
    }

    #[test]
    fn test_default_workers_are_valid() {
        let workers = default_workers();
        assert_eq!(workers.len(), 2);
        validate_workers(&workers).unwrap();
    }
}
