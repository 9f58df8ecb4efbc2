//! Listening sockets
//!
//! All listeners are established before the event loop starts: TCP on every
//! configured address (v4 and v6 resolve independently) and one Unix-domain
//! socket per configured directory. Each Unix socket gets a sibling lockfile
//! naming the owner, and both files are touched periodically so /tmp
//! cleaners leave them alone.

use std::io;
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::os::fd::{AsRawFd, RawFd};
use std::path::PathBuf;

use crate::config::Config;

/// Hard cap on listeners of all families combined.
pub const MAX_LISTENERS: usize = 64;

enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

/// One accepted client connection, family-erased.
pub enum ClientStream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl ClientStream {
    pub fn as_raw_fd(&self) -> RawFd {
        match self {
            ClientStream::Tcp(s) => s.as_raw_fd(),
            ClientStream::Unix(s) => s.as_raw_fd(),
        }
    }

    pub fn peer(&self) -> String {
        match self {
            ClientStream::Tcp(s) => s
                .peer_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "tcp peer".into()),
            ClientStream::Unix(_) => "local socket".into(),
        }
    }
}

/// The supervisor's listener set plus the Unix-socket files it must clean up.
pub struct ListenerSet {
    listeners: Vec<Listener>,
    /// (socket file, lockfile) pairs to touch and eventually remove.
    unix_files: Vec<(PathBuf, PathBuf)>,
}

/// Socket file name inside a socket directory.
pub fn socket_file_name(port: u16) -> String {
    format!(".s.dbvisor.{port}")
}

impl ListenerSet {
    /// Bind every configured address. Failing to bind anything at all is an
    /// error; failing one address among several is logged and skipped, which
    /// is the useful behavior when v6 is configured but unavailable.
    pub fn establish(cfg: &Config) -> Result<ListenerSet, SocketError> {
        let mut set = ListenerSet {
            listeners: Vec::new(),
            unix_files: Vec::new(),
        };

        for host in &cfg.listen_addresses {
            let addrs = match (host.as_str(), cfg.port).to_socket_addrs() {
                Ok(a) => a,
                Err(e) => {
                    log::warn!("cannot resolve listen address {host:?}: {e}");
                    continue;
                }
            };
            for addr in addrs {
                if set.listeners.len() >= MAX_LISTENERS {
                    return Err(SocketError::TooManyListeners);
                }
                match TcpListener::bind(addr) {
                    Ok(l) => {
                        l.set_nonblocking(true).map_err(SocketError::Io)?;
                        log::info!("listening on {addr}");
                        set.listeners.push(Listener::Tcp(l));
                    }
                    Err(e) => {
                        log::warn!("cannot bind {addr}: {e}");
                    }
                }
            }
        }

        for dir in &cfg.unix_socket_directories {
            if set.listeners.len() >= MAX_LISTENERS {
                return Err(SocketError::TooManyListeners);
            }
            let path = dir.join(socket_file_name(cfg.port));
            // a previous unclean shutdown may have left the file behind
            let _ = std::fs::remove_file(&path);
            match UnixListener::bind(&path) {
                Ok(l) => {
                    l.set_nonblocking(true).map_err(SocketError::Io)?;
                    let _ = std::fs::set_permissions(
                        &path,
                        std::fs::Permissions::from_mode(0o777),
                    );
                    let lock = write_socket_lockfile(&path, cfg)?;
                    log::info!("listening on {}", path.display());
                    set.listeners.push(Listener::Unix(l));
                    set.unix_files.push((path, lock));
                }
                Err(e) => {
                    log::warn!("cannot bind {}: {e}", path.display());
                }
            }
        }

        if set.listeners.is_empty() {
            return Err(SocketError::NothingBound);
        }
        Ok(set)
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub fn raw_fds(&self) -> Vec<RawFd> {
        self.listeners
            .iter()
            .map(|l| match l {
                Listener::Tcp(t) => t.as_raw_fd(),
                Listener::Unix(u) => u.as_raw_fd(),
            })
            .collect()
    }

    /// Accept one connection from listener `idx`. `None` when the readiness
    /// report was stale (another wakeup consumed the connection).
    pub fn accept(&self, idx: usize) -> io::Result<Option<ClientStream>> {
        let result = match &self.listeners[idx] {
            Listener::Tcp(l) => l.accept().map(|(s, _)| ClientStream::Tcp(s)),
            Listener::Unix(l) => l.accept().map(|(s, _)| ClientStream::Unix(s)),
        };
        match result {
            Ok(stream) => Ok(Some(stream)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Refresh mtimes so tmpfile reapers keep their hands off.
    pub fn touch_unix_files(&self) {
        use std::os::unix::ffi::OsStrExt;
        for (sock, lock) in &self.unix_files {
            for path in [sock, lock] {
                let Ok(cpath) = std::ffi::CString::new(path.as_os_str().as_bytes()) else {
                    continue;
                };
                // null times = set both stamps to now
                unsafe {
                    libc::utimensat(libc::AT_FDCWD, cpath.as_ptr(), std::ptr::null(), 0);
                }
            }
        }
    }

    /// Close every listener. First step of the exit sequence; the socket
    /// files must not be removed while something could still connect.
    pub fn close_all(&mut self) {
        self.listeners.clear();
    }

    /// Remove socket files and their lockfiles. Called from the exit path
    /// after the listeners are closed.
    pub fn remove_unix_files(&self) {
        for (sock, lock) in &self.unix_files {
            let _ = std::fs::remove_file(sock);
            let _ = std::fs::remove_file(lock);
        }
    }
}

fn write_socket_lockfile(socket_path: &PathBuf, cfg: &Config) -> Result<PathBuf, SocketError> {
    let lock = PathBuf::from(format!("{}.lock", socket_path.display()));
    let content = format!(
        "{}\n{}\n{}\n",
        std::process::id(),
        cfg.data_dir.display(),
        cfg.port
    );
    std::fs::write(&lock, content).map_err(SocketError::Io)?;
    let _ = std::fs::set_permissions(&lock, std::fs::Permissions::from_mode(0o600));
    Ok(lock)
}

#[derive(Debug, thiserror::Error)]
pub enum SocketError {
    #[error("more than {MAX_LISTENERS} listening sockets configured")]
    TooManyListeners,

    #[error("could not bind any listening socket")]
    NothingBound,

    #[error("socket setup failed: {0}")]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback_config(dir: &std::path::Path) -> Config {
        let mut cfg = Config::defaults();
        cfg.data_dir = dir.to_path_buf();
        cfg.apply("listen_addresses", "127.0.0.1").unwrap();
        cfg.apply("port", "0").unwrap();
        cfg.apply("unix_socket_directories", &dir.display().to_string())
            .unwrap();
        cfg
    }

    #[test]
    fn test_establish_and_accept_unix() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = loopback_config(dir.path());
        let set = ListenerSet::establish(&cfg).unwrap();
        assert!(set.len() >= 1);

        // connect over the unix socket and see it surface through accept
        let sock_path = dir.path().join(socket_file_name(0));
        assert!(sock_path.exists());
        let _client = UnixStream::connect(&sock_path).unwrap();

        let unix_idx = set.len() - 1;
        let accepted = set.accept(unix_idx).unwrap();
        assert!(accepted.is_some());
    }

    #[test]
    fn test_accept_without_client_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = loopback_config(dir.path());
        let set = ListenerSet::establish(&cfg).unwrap();
        assert!(set.accept(set.len() - 1).unwrap().is_none());
    }

    #[test]
    fn test_lockfile_written_and_removed() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = loopback_config(dir.path());
        let set = ListenerSet::establish(&cfg).unwrap();
        let lock = dir.path().join(format!("{}.lock", socket_file_name(0)));
        assert!(lock.exists());
        let content = std::fs::read_to_string(&lock).unwrap();
        assert!(content.starts_with(&std::process::id().to_string()));

        set.remove_unix_files();
        assert!(!lock.exists());
        assert!(!dir.path().join(socket_file_name(0)).exists());
    }

    #[test]
    fn test_no_listeners_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = Config::defaults();
        cfg.data_dir = dir.path().to_path_buf();
        // resolvable nowhere, and no socket directories
        cfg.listen_addresses = vec!["".into()];
        cfg.unix_socket_directories = vec![];
        assert!(matches!(
            ListenerSet::establish(&cfg),
            Err(SocketError::NothingBound)
        ));
    }
}
