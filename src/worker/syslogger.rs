//! Log collector child
//!
//! Owns the read end of the stderr pipe every other child (and the
//! supervisor itself) writes into. Lines land in the current log file under
//! the configured directory; a SIGUSR1 from the supervisor rotates it. EOF
//! on the pipe means every writer is gone, supervisor included.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::fd::FromRawFd;
use std::path::PathBuf;

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use super::{take_usr1_pending, term_pending, WorkerBootstrap, EXIT_CLEAN_FATAL};

pub const LOG_FILE_NAME: &str = "server.log";

pub fn run(bootstrap: &WorkerBootstrap) -> i32 {
    let Some(pipe_fd) = bootstrap.logpipe_fd else {
        log::error!("syslogger: no log pipe");
        return EXIT_CLEAN_FATAL;
    };

    let log_dir = bootstrap.config.log_path();
    if let Err(e) = std::fs::create_dir_all(&log_dir) {
        log::error!("syslogger: cannot create {}: {e}", log_dir.display());
        return EXIT_CLEAN_FATAL;
    }
    let log_path = log_dir.join(LOG_FILE_NAME);
    let mut out = match open_log(&log_path) {
        Ok(f) => f,
        Err(e) => {
            log::error!("syslogger: cannot open {}: {e}", log_path.display());
            return EXIT_CLEAN_FATAL;
        }
    };

    let mut pipe = unsafe { File::from_raw_fd(pipe_fd) };
    let mut buf = [0u8; 4096];
    loop {
        if take_usr1_pending() {
            out = match rotate_log(&log_path) {
                Ok(f) => f,
                Err(e) => {
                    log::error!("syslogger: rotation failed: {e}");
                    out
                }
            };
        }
        if term_pending() {
            let _ = out.flush();
            return 0;
        }

        let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(pipe_fd) };
        let mut fds = [PollFd::new(borrowed, PollFlags::POLLIN)];
        let ready = matches!(poll(&mut fds, PollTimeout::from(250u16)), Ok(n) if n > 0);
        if !ready {
            continue;
        }

        match pipe.read(&mut buf) {
            Ok(0) => {
                // every writer closed: the cluster is gone
                let _ = out.flush();
                return 0;
            }
            Ok(n) => {
                if out.write_all(&buf[..n]).is_err() {
                    return EXIT_CLEAN_FATAL;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                log::error!("syslogger: pipe read failed: {e}");
                return EXIT_CLEAN_FATAL;
            }
        }
    }
}

fn open_log(path: &PathBuf) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// Move the current file aside and start a fresh one.
fn rotate_log(path: &PathBuf) -> std::io::Result<File> {
    let rotated = PathBuf::from(format!("{}.old", path.display()));
    let _ = std::fs::rename(path, &rotated);
    open_log(path)
}
