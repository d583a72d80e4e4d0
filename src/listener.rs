use crate::logging::log_with_tag;

use std::io::{self, Read};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

/// The two bytes a sender writes to request termination: ASCII `:` then `X`
pub const TERMINATE_MARKER: [u8; 2] = [0x3A, 0x58];

const TAG: &str = "listener";

/// How long a connected client may take to deliver its two bytes.
/// A client that stays silent longer is treated as a non-match.
pub const MARKER_READ_TIMEOUT: Duration = Duration::from_secs(2);

/// The connection currently being read, shared so `kill()` can cut it off
type InFlight = Arc<Mutex<Option<TcpStream>>>;

/// Failure kinds of the listener
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    /// The port couldn't be bound. Fatal to startup.
    #[error("failed to bind signal listener on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// The owner closed the socket via `kill()`.
    #[error("signal listener closed by owner")]
    ClosedByOwner,

    /// Any other accept/read failure. Fatal to the listener thread only.
    #[error("signal listener I/O failure: {0}")]
    Io(#[source] io::Error),
}

/// How the listener thread ended
#[derive(Debug)]
pub enum ListenerExit {
    /// A valid marker arrived; the terminate flag is set.
    TerminateReceived,
    /// `kill()` closed the socket before any marker arrived.
    ClosedByOwner,
    /// An unexpected I/O error ended the thread without setting the flag.
    Failed(io::Error),
    /// The thread panicked.
    Panicked,
}

impl ListenerExit {
    pub fn is_terminate(&self) -> bool {
        matches!(self, ListenerExit::TerminateReceived)
    }
}

/// Background receiver for the terminate marker
///
/// The accept thread handles one short-lived connection at a time. It reads
/// at most two bytes, closes the connection and compares the bytes against
/// `TERMINATE_MARKER`. A match sets the terminate flag and ends the thread.
///
/// The blocking accept has no timeout. Its only cancellation mechanism is
/// `kill()`, which shuts the listening socket (and any connection being
/// read) down from the owner's thread.
pub struct SignalListener {
    local_addr: SocketAddr,
    terminated: Arc<AtomicBool>,
    closed_by_owner: Arc<AtomicBool>,
    in_flight: InFlight,
    /// Owner's handle to the listening socket, used only by `kill()`
    socket: Option<TcpListener>,
    handle: Option<thread::JoinHandle<ListenerExit>>,
}

impl SignalListener {
    /// Binds `addr` and starts the accept thread
    ///
    /// Binding happens on the caller's thread, so an unavailable port is
    /// reported here rather than from the background thread.
    ///
    /// # Errors
    /// `ListenerError::Bind` if the address can't be bound,
    /// `ListenerError::Io` if the thread can't be started.
    pub fn start<A: ToSocketAddrs + std::fmt::Debug>(addr: A) -> Result<Self, ListenerError> {
        let listener = TcpListener::bind(&addr).map_err(|source| ListenerError::Bind {
            addr: format!("{:?}", addr),
            source,
        })?;
        let local_addr = listener.local_addr().map_err(ListenerError::Io)?;
        let owner_socket = listener.try_clone().map_err(ListenerError::Io)?;

        let terminated = Arc::new(AtomicBool::new(false));
        let closed_by_owner = Arc::new(AtomicBool::new(false));
        let in_flight: InFlight = Arc::new(Mutex::new(None));

        let thread_terminated = Arc::clone(&terminated);
        let thread_closed = Arc::clone(&closed_by_owner);
        let thread_in_flight = Arc::clone(&in_flight);
        let handle = thread::Builder::new()
            .name(TAG.to_string())
            .spawn(move || {
                let exit = match accept_loop(&listener, &thread_terminated, &thread_closed, &thread_in_flight) {
                    Ok(()) => ListenerExit::TerminateReceived,
                    Err(ListenerError::ClosedByOwner) => {
                        let _ = log_with_tag("Listener closed by owner, exiting", Some(TAG));
                        ListenerExit::ClosedByOwner
                    }
                    Err(ListenerError::Io(e)) => {
                        let _ = log_with_tag(&format!("I/O failure, listener exiting: {}", e), Some(TAG));
                        ListenerExit::Failed(e)
                    }
                    Err(e @ ListenerError::Bind { .. }) => {
                        let _ = log_with_tag(&format!("Unexpected listener error: {}", e), Some(TAG));
                        ListenerExit::Failed(io::Error::new(io::ErrorKind::Other, e.to_string()))
                    }
                };
                drop(listener);
                exit
            })
            .map_err(ListenerError::Io)?;

        let _ = log_with_tag(&format!("Listening for stop requests on {}", local_addr), Some(TAG));

        Ok(Self {
            local_addr,
            terminated,
            closed_by_owner,
            in_flight,
            socket: Some(owner_socket),
            handle: Some(handle),
        })
    }

    /// The address actually bound (useful when binding port 0)
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Non-blocking read of the terminate flag. Once true, always true.
    pub fn is_terminate(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Whether the accept thread has already returned
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Closes the listening socket, unblocking a pending accept or read
    ///
    /// Meant to be called once, after which only `join()` is useful.
    /// Never sets the terminate flag.
    pub fn kill(&mut self) -> io::Result<()> {
        let socket = match self.socket.take() {
            Some(socket) => socket,
            None => return Ok(()),
        };

        // Raised first so the accept thread can tell this apart from a real failure
        self.closed_by_owner.store(true, Ordering::SeqCst);

        // A client that connected but never writes would otherwise hold the thread
        let in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(stream) = in_flight {
            let _ = stream.shutdown(Shutdown::Both);
        }

        // Dropping our clone alone wouldn't wake a thread blocked in accept()
        let rc = unsafe { libc::shutdown(socket.as_raw_fd(), libc::SHUT_RDWR) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            // Already finished listeners may report the socket as not connected
            if err.raw_os_error() != Some(libc::ENOTCONN) {
                return Err(err);
            }
        }
        drop(socket);
        Ok(())
    }

    /// Blocks until the accept thread has returned
    ///
    /// Returns `ListenerExit::ClosedByOwner` if called a second time.
    pub fn join(&mut self) -> ListenerExit {
        match self.handle.take() {
            Some(handle) => handle.join().unwrap_or(ListenerExit::Panicked),
            None => ListenerExit::ClosedByOwner,
        }
    }
}

fn accept_loop(
    listener: &TcpListener,
    terminated: &AtomicBool,
    closed_by_owner: &AtomicBool,
    in_flight: &Mutex<Option<TcpStream>>,
) -> Result<(), ListenerError> {
    let classify = |e: io::Error| {
        if closed_by_owner.load(Ordering::SeqCst) {
            ListenerError::ClosedByOwner
        } else {
            ListenerError::Io(e)
        }
    };

    loop {
        let (stream, peer) = match listener.accept() {
            Ok(conn) => conn,
            Err(e) if e.kind() == io::ErrorKind::Interrupted && !closed_by_owner.load(Ordering::SeqCst) => continue,
            Err(e) => return Err(classify(e)),
        };

        {
            // Checked under the lock so kill() either sees this stream or we see its flag
            let mut slot = in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            if closed_by_owner.load(Ordering::SeqCst) {
                let _ = stream.shutdown(Shutdown::Both);
                return Err(ListenerError::ClosedByOwner);
            }
            *slot = stream.try_clone().ok();
        }

        let read = read_marker(stream);
        in_flight.lock().unwrap_or_else(PoisonError::into_inner).take();
        if closed_by_owner.load(Ordering::SeqCst) && read.as_ref().map_or(true, |buf| *buf != TERMINATE_MARKER) {
            return Err(ListenerError::ClosedByOwner);
        }
        let buf = read.map_err(classify)?;

        if buf == TERMINATE_MARKER {
            let _ = log_with_tag(&format!("Received terminate marker from {}", peer), Some(TAG));
            terminated.store(true, Ordering::SeqCst);
            return Ok(());
        }

        let _ = log_with_tag(&format!("Discarded foreign message from {}: {:02X?}", peer, buf), Some(TAG));
    }
}

/// Reads up to two bytes, then closes the connection whatever arrived
///
/// A short read (EOF or `MARKER_READ_TIMEOUT` before two bytes) leaves the
/// unread slots zeroed, which can never equal the marker.
fn read_marker(mut stream: TcpStream) -> io::Result<[u8; 2]> {
    let mut buf = [0u8; 2];
    let mut filled = 0;
    let result = stream.set_read_timeout(Some(MARKER_READ_TIMEOUT)).and_then(|()| loop {
        if filled == buf.len() {
            break Ok(());
        }
        match stream.read(&mut buf[filled..]) {
            Ok(0) => break Ok(()),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => break Ok(()),
            Err(e) => break Err(e),
        }
    });
    let _ = stream.shutdown(Shutdown::Both);
    drop(stream);
    result.map(|()| if filled == buf.len() { buf } else { [0u8; 2] })
}
