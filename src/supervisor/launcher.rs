//! Child launching
//!
//! Two strategies behind one call. Fork inheritance clones the supervisor:
//! the child keeps the mapped segment, the configuration and the accepted
//! socket, and only has to shed the supervisor-only descriptors.
//! Spawn-and-reattach starts a fresh process: the bootstrap payload is
//! serialized to a private file, the child re-executes this binary in
//! `spawn-child` mode and reattaches to the segment by name.

use std::io::Write;
use std::os::fd::RawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::process::Command;
use std::sync::atomic::{AtomicU64, Ordering};

use nix::sys::signal::{kill, sigprocmask, SigSet, SigmaskHow, Signal};
use nix::unistd::{fork, setpgid, ForkResult, Pid};

use crate::config::LaunchStrategy;
use crate::shmem::Segment;
use crate::worker::{self, WorkerBootstrap};

/// Directory under the data directory for spawn payload files.
pub const SPAWN_DIR: &str = "spawn";

static SPAWN_SEQ: AtomicU64 = AtomicU64::new(0);

/// Deliver a signal to a child, and for the process-affecting ones to its
/// process group as well. A child makes itself a group leader right after
/// creation, but we can race ahead of that, so both targets are signaled.
pub fn signal_child(pid: i32, sig: Signal) -> nix::Result<()> {
    kill(Pid::from_raw(pid), sig)?;
    if matches!(
        sig,
        Signal::SIGTERM | Signal::SIGINT | Signal::SIGQUIT | Signal::SIGKILL | Signal::SIGABRT
    ) {
        let _ = kill(Pid::from_raw(-pid), sig);
    }
    Ok(())
}

/// Everything a launch needs besides the bootstrap payload itself.
pub struct LaunchEnv<'a> {
    /// Mapped segment, inherited as-is by forked children.
    pub segment: Option<&'a Segment>,
    /// Supervisor-only descriptors a forked child must close: listening
    /// sockets, the latch pipe, the death-watch write end.
    pub close_in_child: &'a [RawFd],
}

/// Start a child and return its pid. The child side never returns through
/// here: forked children exit through the worker dispatch, spawned ones
/// re-enter `main`.
pub fn launch(
    strategy: LaunchStrategy,
    bootstrap: WorkerBootstrap,
    env: &LaunchEnv<'_>,
) -> Result<i32, LaunchError> {
    match strategy {
        LaunchStrategy::Fork => launch_fork(bootstrap, env),
        LaunchStrategy::Spawn => launch_spawn(bootstrap),
    }
}

/// Signals the child must not see between fork and its own handler setup:
/// the defaults would kill it, and the supervisor may signal the fresh pid
/// immediately (the shutdown-checkpoint request being the usual case).
pub(crate) fn handoff_sigset() -> SigSet {
    let mut set = SigSet::empty();
    for sig in [
        Signal::SIGHUP,
        Signal::SIGINT,
        Signal::SIGTERM,
        Signal::SIGQUIT,
        Signal::SIGUSR1,
        Signal::SIGUSR2,
        Signal::SIGCHLD,
        Signal::SIGPIPE,
    ] {
        set.add(sig);
    }
    set
}

fn launch_fork(bootstrap: WorkerBootstrap, env: &LaunchEnv<'_>) -> Result<i32, LaunchError> {
    // Hold signals across the fork: the child inherits the blocked mask and
    // releases it only after its handlers are in place.
    let block = handoff_sigset();
    let mut saved = SigSet::empty();
    let _ = sigprocmask(SigmaskHow::SIG_BLOCK, Some(&block), Some(&mut saved));

    // Single-threaded process, so forking without exec is sound.
    let forked = unsafe { fork() };
    match forked {
        Ok(ForkResult::Parent { child }) => {
            let _ = sigprocmask(SigmaskHow::SIG_SETMASK, Some(&saved), None);
            // Mirror the child's own setpgid; whichever runs first wins and
            // the other is a no-op.
            let _ = setpgid(child, child);
            Ok(child.as_raw())
        }
        Ok(ForkResult::Child) => {
            let _ = setpgid(Pid::from_raw(0), Pid::from_raw(0));
            for fd in env.close_in_child {
                unsafe {
                    libc::close(*fd);
                }
            }
            let code = worker::child_main(bootstrap, env.segment);
            std::process::exit(code);
        }
        Err(e) => {
            let _ = sigprocmask(SigmaskHow::SIG_SETMASK, Some(&saved), None);
            Err(LaunchError::Fork(e))
        }
    }
}

fn launch_spawn(bootstrap: WorkerBootstrap) -> Result<i32, LaunchError> {
    let payload_path = write_payload(&bootstrap)?;

    // descriptors named in the payload must survive the exec
    for fd in [bootstrap.client_fd, bootstrap.deathwatch_fd].into_iter().flatten() {
        clear_cloexec(fd);
    }

    let exe = std::env::current_exe().map_err(LaunchError::Io)?;
    let child = Command::new(exe)
        .arg("spawn-child")
        .arg(&payload_path)
        .spawn()
        .map_err(|e| {
            let _ = std::fs::remove_file(&payload_path);
            LaunchError::Io(e)
        })?;
    let pid = child.id() as i32;
    // reaped through SIGCHLD with everything else, not through the handle
    drop(child);
    let _ = setpgid(Pid::from_raw(pid), Pid::from_raw(pid));
    Ok(pid)
}

fn write_payload(bootstrap: &WorkerBootstrap) -> Result<PathBuf, LaunchError> {
    let dir = bootstrap.config.data_dir.join(SPAWN_DIR);
    std::fs::create_dir_all(&dir).map_err(LaunchError::Io)?;

    let seq = SPAWN_SEQ.fetch_add(1, Ordering::SeqCst);
    let path = dir.join(format!(
        "{}.{}.{}.json",
        bootstrap.kind.as_str(),
        std::process::id(),
        seq
    ));
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(&path)
        .map_err(LaunchError::Io)?;
    let body = serde_json::to_vec(bootstrap).map_err(LaunchError::Payload)?;
    file.write_all(&body).map_err(LaunchError::Io)?;
    Ok(path)
}

fn clear_cloexec(fd: RawFd) {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFD);
        if flags >= 0 {
            libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC);
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("fork failed: {0}")]
    Fork(nix::errno::Errno),

    #[error("spawn failed: {0}")]
    Io(std::io::Error),

    #[error("payload serialization failed: {0}")]
    Payload(serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::worker::WorkerKind;

    #[test]
    fn test_payload_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = Config::defaults();
        cfg.data_dir = dir.path().to_path_buf();

        let bootstrap = WorkerBootstrap {
            kind: WorkerKind::Checkpointer,
            config: cfg,
            segment_name: "/dbvisor.test.1".into(),
            supervisor_pid: 1234,
            deathwatch_fd: None,
            slot: Some(3),
            cancel_token: Some(0xabcd),
            client_fd: None,
            reject_reason: None,
            bgworker_name: None,
            crash_recovery: true,
            logpipe_fd: None,
        };

        let path = write_payload(&bootstrap).unwrap();
        let body = std::fs::read(&path).unwrap();
        let parsed: WorkerBootstrap = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed.kind, WorkerKind::Checkpointer);
        assert_eq!(parsed.slot, Some(3));
        assert_eq!(parsed.segment_name, "/dbvisor.test.1");
        assert!(parsed.crash_recovery);
    }

    #[test]
    fn test_payload_files_are_unique() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = Config::defaults();
        cfg.data_dir = dir.path().to_path_buf();

        let bootstrap = WorkerBootstrap::plain(WorkerKind::BgWriter, cfg, "/seg".into(), 1);
        let a = write_payload(&bootstrap).unwrap();
        let b = write_payload(&bootstrap).unwrap();
        assert_ne!(a, b);
    }
}
