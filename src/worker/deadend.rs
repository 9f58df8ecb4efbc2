//! Dead-end rejection worker
//!
//! Launched when admission says no. Delivers exactly one rejection line so
//! the client sees a clean error instead of a closed socket, then exits.
//! Dead-end children count as registry members until they are gone, because
//! they were created attached to shared memory.

use std::io::Write;
use std::os::fd::FromRawFd;

use super::{WorkerBootstrap, EXIT_CLEAN_FATAL};

pub fn run(bootstrap: &WorkerBootstrap, reason: &str) -> i32 {
    let Some(fd) = bootstrap.client_fd else {
        return EXIT_CLEAN_FATAL;
    };
    let mut stream = unsafe { std::fs::File::from_raw_fd(fd) };
    let _ = stream.write_all(format!("rejected: {reason}\n").as_bytes());
    let _ = stream.flush();
    0
}
