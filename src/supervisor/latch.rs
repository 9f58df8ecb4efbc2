//! Self-wake latch and the supervisor's wait set
//!
//! The latch is the classic self-pipe: a nonblocking pipe plus an atomic
//! flag. Signal handlers may only set the flag and write one byte to the
//! pipe, which is enough to break the event loop out of `poll`. The wait set
//! multiplexes the latch with the listening sockets.

use std::io;
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::time::Duration;

use nix::fcntl::OFlag;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::unistd::pipe2;

/// Flag half of the latch. Lives in a static so signal handlers can reach it.
static LATCH_SET: AtomicBool = AtomicBool::new(false);
/// Write end of the latch pipe, -1 until the latch exists.
static LATCH_WRITE_FD: AtomicI32 = AtomicI32::new(-1);

/// Wake the latch from a signal handler. Only atomics and `write` here;
/// anything else is not async-signal-safe.
pub fn wake_from_handler() {
    LATCH_SET.store(true, Ordering::SeqCst);
    let fd = LATCH_WRITE_FD.load(Ordering::SeqCst);
    if fd >= 0 {
        let byte = [0u8; 1];
        unsafe {
            libc::write(fd, byte.as_ptr() as *const libc::c_void, 1);
        }
    }
}

/// The supervisor's self-wake latch.
pub struct Latch {
    read_fd: OwnedFd,
    write_fd: OwnedFd,
}

impl Latch {
    pub fn new() -> io::Result<Self> {
        let (read_fd, write_fd) = pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC)
            .map_err(|e| io::Error::from_raw_os_error(e as i32))?;
        LATCH_WRITE_FD.store(write_fd.as_raw_fd(), Ordering::SeqCst);
        Ok(Latch { read_fd, write_fd })
    }

    /// Set the latch from normal (non-handler) code.
    pub fn set(&self) {
        LATCH_SET.store(true, Ordering::SeqCst);
        let byte = [0u8; 1];
        let _ = nix::unistd::write(self.write_fd.as_fd(), &byte);
    }

    pub fn is_set(&self) -> bool {
        LATCH_SET.load(Ordering::SeqCst)
    }

    /// Clear the flag and drain whatever bytes handlers pushed into the pipe.
    pub fn clear(&self) {
        LATCH_SET.store(false, Ordering::SeqCst);
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe {
                libc::read(
                    self.read_fd.as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n < buf.len() as isize {
                break;
            }
        }
    }

    pub fn read_fd(&self) -> RawFd {
        self.read_fd.as_raw_fd()
    }

    pub fn write_fd(&self) -> RawFd {
        self.write_fd.as_raw_fd()
    }

}

/// One readiness event out of the wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitEvent {
    /// The latch fired.
    Latch,
    /// Listening socket at this index is ready for accept.
    Accept(usize),
}

/// Longest a single wait may block.
pub const MAX_WAIT: Duration = Duration::from_secs(60);

/// Block until the latch fires, a listening socket becomes readable, or the
/// timeout expires. An interrupted wait reports no events; the caller checks
/// the pending-work flags regardless of what woke it.
pub fn wait(latch: &Latch, sockets: &[RawFd], timeout: Duration) -> io::Result<Vec<WaitEvent>> {
    // A latch set before we block means no sleeping at all.
    let timeout = if latch.is_set() { Duration::ZERO } else { timeout.min(MAX_WAIT) };
    let millis = u16::try_from(timeout.as_millis()).unwrap_or(u16::MAX);

    let latch_borrow = latch.read_fd.as_fd();
    let mut fds = Vec::with_capacity(sockets.len() + 1);
    fds.push(PollFd::new(latch_borrow, PollFlags::POLLIN));
    let borrowed: Vec<std::os::fd::BorrowedFd> = sockets
        .iter()
        .map(|fd| unsafe { std::os::fd::BorrowedFd::borrow_raw(*fd) })
        .collect();
    for b in &borrowed {
        fds.push(PollFd::new(*b, PollFlags::POLLIN));
    }

    match poll(&mut fds, PollTimeout::from(millis)) {
        Ok(_) => {}
        Err(nix::errno::Errno::EINTR) => return Ok(Vec::new()),
        Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
    }

    let mut events = Vec::new();
    if fds[0]
        .revents()
        .map(|r| r.intersects(PollFlags::POLLIN))
        .unwrap_or(false)
    {
        events.push(WaitEvent::Latch);
    }
    for (i, fd) in fds[1..].iter().enumerate() {
        if fd
            .revents()
            .map(|r| r.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR))
            .unwrap_or(false)
        {
            events.push(WaitEvent::Accept(i));
        }
    }
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Instant;

    // The handler-facing halves of the latch are process globals, so latch
    // tests cannot overlap.
    static LATCH_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn test_latch_set_wakes_wait() {
        let _lock = LATCH_LOCK.lock().unwrap();
        let latch = Latch::new().unwrap();
        latch.set();
        let start = Instant::now();
        let events = wait(&latch, &[], Duration::from_secs(5)).unwrap();
        assert!(events.contains(&WaitEvent::Latch));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_wait_times_out() {
        let _lock = LATCH_LOCK.lock().unwrap();
        let latch = Latch::new().unwrap();
        latch.clear();
        let start = Instant::now();
        let events = wait(&latch, &[], Duration::from_millis(50)).unwrap();
        assert!(events.is_empty());
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn test_clear_resets() {
        let _lock = LATCH_LOCK.lock().unwrap();
        let latch = Latch::new().unwrap();
        latch.set();
        assert!(latch.is_set());
        latch.clear();
        assert!(!latch.is_set());
        let events = wait(&latch, &[], Duration::from_millis(20)).unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn test_handler_path_wakes() {
        let _lock = LATCH_LOCK.lock().unwrap();
        let latch = Latch::new().unwrap();
        latch.clear();
        wake_from_handler();
        let events = wait(&latch, &[], Duration::from_secs(5)).unwrap();
        assert!(events.contains(&WaitEvent::Latch));
        latch.clear();
    }

    #[test]
    fn test_socket_readiness_reported() {
        use std::io::Write;
        use std::net::{TcpListener, TcpStream};

        let _lock = LATCH_LOCK.lock().unwrap();
        let latch = Latch::new().unwrap();
        latch.clear();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = TcpStream::connect(addr).unwrap();
        client.write_all(b"x").unwrap();

        let events = wait(&latch, &[listener.as_raw_fd()], Duration::from_secs(5)).unwrap();
        assert!(events.contains(&WaitEvent::Accept(0)));
    }
}
