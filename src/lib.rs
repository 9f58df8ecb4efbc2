//! dbvisor - supervisor process of a multi-process database server
//!
//! One long-lived parent owns the cluster's shared memory and listening
//! sockets, spawns a fixed set of worker kinds plus per-connection sessions,
//! and drives the global lifecycle: startup, recovery, normal service, three
//! gradations of shutdown, and the crash cascade that resets shared memory
//! after an unclean child death.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                     supervisor                       │
//! │  signal intake → event loop → phase machine          │
//! │  registry · admission · launcher · bgworker sched    │
//! ├──────────────────────────────────────────────────────┤
//! │           shared memory (segment + semaphores)       │
//! ├──────────────┬───────────────┬───────────────────────┤
//! │  aux workers │   sessions    │  dead-end rejections  │
//! └──────────────┴───────────────┴───────────────────────┘
//! ```
//!
//! The supervisor itself never touches the shared data pages it provisions;
//! it arbitrates processes only.

pub mod config;
pub mod control;
pub mod shmem;
pub mod supervisor;
pub mod worker;

pub use supervisor::{Supervisor, EXIT_BADCONFIG, EXIT_FAILURE, EXIT_OK};
