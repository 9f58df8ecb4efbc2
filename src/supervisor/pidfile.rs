//! Data-directory pidfile and opts file
//!
//! The pidfile is the interlock that keeps two supervisors out of one data
//! directory, and the place tooling looks up how to reach a running server.
//! Eight lines, fixed order:
//!
//! ```text
//! 1  supervisor pid
//! 2  data directory
//! 3  start time, epoch seconds
//! 4  port
//! 5  first socket directory, or empty
//! 6  first listen address, or empty
//! 7  shared-segment name
//! 8  status word: starting | ready | stopping
//! ```
//!
//! The file is rewritten whole at start; lines 7 and 8 are appended as they
//! become known, each with a single write so a concurrent reader never sees
//! a torn line. The opts file next to it records the exact argv for restart
//! tooling.

use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use crate::config::Config;

pub const PIDFILE_NAME: &str = "dbvisor.pid";
pub const OPTS_FILE_NAME: &str = "dbvisor.opts";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PidFileStatus {
    Starting,
    Ready,
    Stopping,
}

impl PidFileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Stopping => "stopping",
        }
    }
}

/// Supervisor-side handle on the pidfile.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
    pid: u32,
    lines: Vec<String>,
}

impl PidFile {
    /// Create the pidfile for this data directory, refusing if another live
    /// supervisor owns it. A pidfile whose pid no longer exists is stale and
    /// is replaced.
    pub fn create(cfg: &Config, start_epoch: u64) -> Result<PidFile, PidFileError> {
        let path = cfg.data_dir.join(PIDFILE_NAME);

        if let Some(existing_pid) = read_pid(&path) {
            if pid_is_live(existing_pid) {
                return Err(PidFileError::Occupied {
                    path,
                    pid: existing_pid,
                });
            }
            log::warn!("removing stale pidfile left by pid {existing_pid}");
            let _ = std::fs::remove_file(&path);
        }

        let pid = std::process::id();
        let lines = vec![
            pid.to_string(),
            cfg.data_dir.display().to_string(),
            start_epoch.to_string(),
            cfg.port.to_string(),
            cfg.unix_socket_directories
                .first()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            cfg.listen_addresses.first().cloned().unwrap_or_default(),
        ];

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&path)
            .map_err(|e| PidFileError::Io {
                path: path.clone(),
                source: e,
            })?;
        let content: String = lines.iter().map(|l| format!("{l}\n")).collect();
        file.write_all(content.as_bytes()).map_err(|e| PidFileError::Io {
            path: path.clone(),
            source: e,
        })?;

        Ok(PidFile { path, pid, lines })
    }

    /// Append line 7 once the shared segment exists.
    pub fn publish_segment(&mut self, segment_name: &str) -> Result<(), PidFileError> {
        if self.lines.len() != 6 {
            return Err(PidFileError::OutOfOrder);
        }
        self.append_line(segment_name)?;
        Ok(())
    }

    /// Publish the status word. Appends the first time; afterwards the whole
    /// file is rewritten with the new final line.
    pub fn publish_status(&mut self, status: PidFileStatus) -> Result<(), PidFileError> {
        match self.lines.len() {
            7 => self.append_line(status.as_str()),
            8 => {
                self.lines[7] = status.as_str().to_string();
                self.rewrite()
            }
            _ => Err(PidFileError::OutOfOrder),
        }
    }

    fn append_line(&mut self, value: &str) -> Result<(), PidFileError> {
        let mut file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .map_err(|e| PidFileError::Io {
                path: self.path.clone(),
                source: e,
            })?;
        file.write_all(format!("{value}\n").as_bytes())
            .map_err(|e| PidFileError::Io {
                path: self.path.clone(),
                source: e,
            })?;
        self.lines.push(value.to_string());
        Ok(())
    }

    fn rewrite(&self) -> Result<(), PidFileError> {
        let content: String = self.lines.iter().map(|l| format!("{l}\n")).collect();
        let mut file = OpenOptions::new()
            .write(true)
            .truncate(true)
            .mode(0o600)
            .open(&self.path)
            .map_err(|e| PidFileError::Io {
                path: self.path.clone(),
                source: e,
            })?;
        file.write_all(content.as_bytes()).map_err(|e| PidFileError::Io {
            path: self.path.clone(),
            source: e,
        })
    }

    /// Is the file on disk still ours? A missing file or a foreign pid in
    /// line 1 means someone interfered with the data directory.
    pub fn still_ours(&self) -> bool {
        read_pid(&self.path) == Some(self.pid as i32)
    }

    pub fn unlink(&self) {
        let _ = std::fs::remove_file(&self.path);
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn read_pid(path: &Path) -> Option<i32> {
    let mut content = String::new();
    std::fs::File::open(path)
        .and_then(|mut f| f.read_to_string(&mut content))
        .ok()?;
    content.lines().next()?.trim().parse().ok()
}

fn pid_is_live(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    // signal 0 probes existence; EPERM still means the pid is taken
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Record the supervisor's argv next to the pidfile so restart tooling can
/// reproduce the invocation.
pub fn write_opts_file(data_dir: &Path) -> Result<(), PidFileError> {
    let path = data_dir.join(OPTS_FILE_NAME);
    let argv: Vec<String> = std::env::args().collect();
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(&path)
        .map_err(|e| PidFileError::Io {
            path: path.clone(),
            source: e,
        })?;
    file.write_all(format!("{}\n", argv.join(" ")).as_bytes())
        .map_err(|e| PidFileError::Io { path, source: e })
}

pub fn remove_opts_file(data_dir: &Path) {
    let _ = std::fs::remove_file(data_dir.join(OPTS_FILE_NAME));
}

#[derive(Debug, thiserror::Error)]
pub enum PidFileError {
    #[error("data directory already in use by pid {pid} ({path})")]
    Occupied { path: PathBuf, pid: i32 },

    #[error("pidfile lines published out of order")]
    OutOfOrder,

    #[error("pidfile I/O failed on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
