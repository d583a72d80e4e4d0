use crate::listener::TERMINATE_MARKER;
use crate::logging::log;

use std::io::{self, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;

/// Sends the terminate marker to `host:port`
///
/// Failures are logged, never propagated; retry policy is the caller's.
///
/// # Returns
/// `true` if the connection was made and both bytes were written
pub fn send_terminate(host: &str, port: u16) -> bool {
    report(host, port, try_send(host, port, None))
}

/// Shorthand for a listener on this machine
pub fn send_terminate_local(port: u16) -> bool {
    send_terminate("localhost", port)
}

/// Same as `send_terminate`, but gives up connecting after `timeout`
/// per resolved address
pub fn send_terminate_with_timeout(host: &str, port: u16, timeout: Duration) -> bool {
    report(host, port, try_send(host, port, Some(timeout)))
}

fn report(host: &str, port: u16, result: io::Result<()>) -> bool {
    match result {
        Ok(()) => true,
        Err(e) => {
            let _ = log(&format!("Failed to send terminate request to {}:{}: {}", host, port, e));
            false
        }
    }
}

fn try_send(host: &str, port: u16, timeout: Option<Duration>) -> io::Result<()> {
    let mut stream = connect(host, port, timeout)?;
    stream.write_all(&TERMINATE_MARKER)?;
    stream.flush()?;
    stream.shutdown(Shutdown::Write)?;
    Ok(())
}

fn connect(host: &str, port: u16, timeout: Option<Duration>) -> io::Result<TcpStream> {
    let timeout = match timeout {
        Some(timeout) => timeout,
        None => return TcpStream::connect((host, port)),
    };

    // connect_timeout takes a single address, so try each one in turn
    let mut last_err = None;
    for addr in (host, port).to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("{}:{} did not resolve to any address", host, port),
        )
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn test_send_terminate_writes_exact_marker() {
        let server = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = server.local_addr().unwrap().port();

        let reader = thread::spawn(move || {
            let (mut stream, _) = server.accept().unwrap();
            let mut received = Vec::new();
            stream.read_to_end(&mut received).unwrap();
            received
        });

        assert!(send_terminate("127.0.0.1", port));
        assert_eq!(reader.join().unwrap(), TERMINATE_MARKER.to_vec());
    }

    #[test]
    fn test_send_terminate_with_timeout_writes_marker() {
        let server = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = server.local_addr().unwrap().port();

        let reader = thread::spawn(move || {
            let (mut stream, _) = server.accept().unwrap();
            let mut received = Vec::new();
            stream.read_to_end(&mut received).unwrap();
            received
        });

        assert!(send_terminate_with_timeout("127.0.0.1", port, Duration::from_secs(2)));
        assert_eq!(reader.join().unwrap(), b":X".to_vec());
    }

    #[test]
    fn test_refused_connection_returns_false() {
        // Grab a free port, then release it so nothing is listening there
        let port = {
            let probe = TcpListener::bind("127.0.0.1:0").unwrap();
            probe.local_addr().unwrap().port()
        };

        assert!(!send_terminate("127.0.0.1", port));
        assert!(!send_terminate_with_timeout("127.0.0.1", port, Duration::from_millis(500)));
    }

    #[test]
    fn test_unresolvable_host_returns_false() {
        assert!(!send_terminate("host.invalid", 1789));
        assert!(!send_terminate_with_timeout("host.invalid", 1789, Duration::from_millis(200)));
    }
}
