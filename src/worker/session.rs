//! Session worker shell
//!
//! The wire protocol and the query engine are external to the supervisor
//! design; this shell speaks a minimal line-based stand-in with the same
//! process obligations a real session has: publish readiness, honor
//! termination and cancel signals, resolve cancel-request packets against
//! the shared slot array, and mark itself a WAL sender where applicable.

use std::io::{Read, Write};
use std::os::fd::FromRawFd;

use crate::shmem::slots::{SlotArray, SLOT_FLAG_WALSENDER};
use crate::shmem::{Segment, REGION_PROC_SLOTS};
use crate::supervisor::admission;

use super::{
    take_int_pending, take_usr2_pending, term_pending, WorkerBootstrap, EXIT_CLEAN_FATAL,
    EXIT_CRASH,
};

const MAX_LINE: usize = 1024;

pub fn run(bootstrap: &WorkerBootstrap, segment: &Segment) -> i32 {
    let Some(fd) = bootstrap.client_fd else {
        log::error!("session: no client socket");
        return EXIT_CRASH;
    };
    let mut stream = unsafe { std::fs::File::from_raw_fd(fd) };

    let Some(first) = read_line(&mut stream) else {
        // client went away before saying anything
        return 0;
    };

    // A cancel packet is a whole conversation by itself.
    if let Some(rest) = first.strip_prefix("cancel ") {
        return handle_cancel_packet(segment, rest);
    }

    if first.trim() == "walsender" {
        if let Some(slot) = bootstrap.slot {
            if let Some(view) = segment.region(REGION_PROC_SLOTS) {
                SlotArray::new(&view).set_flag(slot, SLOT_FLAG_WALSENDER);
            }
        }
        log::debug!("session {}: acting as wal sender", std::process::id());
    }

    if write_line(&mut stream, &format!("ready {}", std::process::id())).is_err() {
        return 0;
    }

    // the engine would run here; the shell echoes
    loop {
        if term_pending() {
            let _ = write_line(&mut stream, "terminating");
            return 0;
        }
        if take_int_pending() {
            let _ = write_line(&mut stream, "canceled");
        }
        match read_line(&mut stream) {
            Some(line) => {
                if write_line(&mut stream, &format!("echo {line}")).is_err() {
                    return 0;
                }
            }
            None => {
                if term_pending() {
                    let _ = write_line(&mut stream, "terminating");
                }
                return 0;
            }
        }
    }
}

fn handle_cancel_packet(segment: &Segment, args: &str) -> i32 {
    let mut parts = args.split_whitespace();
    let pid: Option<i32> = parts.next().and_then(|s| s.parse().ok());
    let token: Option<u32> = parts.next().and_then(|s| s.parse().ok());
    let (Some(pid), Some(token)) = (pid, token) else {
        log::info!("malformed cancel request dropped");
        return EXIT_CLEAN_FATAL;
    };

    let Some(view) = segment.region(REGION_PROC_SLOTS) else {
        return EXIT_CRASH;
    };
    let slots = SlotArray::new(&view);
    admission::process_cancel_request(&slots, pid, token);
    // no response either way; the requester learns nothing about live pids
    0
}

/// Read one newline-terminated line. `None` on EOF, a dead connection, or an
/// interrupted read with termination pending.
fn read_line(stream: &mut std::fs::File) -> Option<String> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        match stream.read(&mut byte) {
            Ok(0) => {
                if line.is_empty() {
                    return None;
                }
                break;
            }
            Ok(_) => {
                if byte[0] == b'\n' {
                    break;
                }
                if line.len() < MAX_LINE {
                    line.push(byte[0]);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {
                if term_pending() {
                    return None;
                }
                // WAL senders are told to finish with SIGUSR2 once the
                // shutdown checkpoint is on disk
                if take_usr2_pending() {
                    return None;
                }
                if take_int_pending() {
                    let _ = write_line(stream, "canceled");
                }
            }
            Err(_) => return None,
        }
    }
    Some(String::from_utf8_lossy(&line).into_owned())
}

fn write_line(stream: &mut std::fs::File, line: &str) -> std::io::Result<()> {
    stream.write_all(format!("{line}\n").as_bytes())?;
    stream.flush()
}
