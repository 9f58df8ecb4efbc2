//! Cluster lifecycle state
//!
//! ```text
//!      ┌──────┐
//!      │ Init │
//!      └──┬───┘
//!         │ shared memory ready, startup launched
//!      ┌──▼──────┐   recovery-started    ┌──────────┐
//!      │ Startup │──────────────────────▶│ Recovery │
//!      └──┬──────┘                       └──┬───┬───┘
//!         │ startup exit 0    begin-hot-standby │   │ startup exit 0
//!         │                  ┌──────────────┐◀──┘   │
//!         │                  │  HotStandby  │───────┤
//!      ┌──▼───┐              └──────┬───────┘       │
//!      │ Run  │◀────────────────────┴───────────────┘
//!      └──┬───┘
//!         │ shutdown request or crash
//!      ┌──▼───────────┐    ┌──────────────┐    ┌────────────────────┐
//!      │ StopBackends │───▶│ WaitBackends │───▶│ ShutdownCheckpoint │
//!      └──────────────┘    └──────┬───────┘    └─────────┬──────────┘
//!                                 │ crash                │ checkpointer exit 0
//!                                 │              ┌───────▼────────┐
//!                                 │              │ WaitWalSenders │
//!                                 │              └───────┬────────┘
//!                          ┌──────▼──────┐◀─────────────┘
//!                          │ WaitDeadEnd │
//!                          └──────┬──────┘
//!                                 │ registry empty
//!                          ┌──────▼─────┐
//!                          │ NoChildren │  exit, or reinit and relaunch
//!                          └────────────┘
//! ```

/// Where the cluster is in its life. Every transition is made by the
/// supervisor's event loop; children observe phase changes only through the
/// signals it sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PmPhase {
    /// Provisioning shared memory, nothing launched yet.
    Init,
    /// Startup worker is replaying or validating; no sessions.
    Startup,
    /// Crash or archive recovery confirmed in progress.
    Recovery,
    /// Recovery reached consistency; read-only sessions allowed.
    HotStandby,
    /// Normal service.
    Run,
    /// Telling live backends to go away.
    StopBackends,
    /// Waiting for ordinary backends to drain.
    WaitBackends,
    /// Checkpointer is writing the shutdown checkpoint.
    ShutdownCheckpoint,
    /// Waiting for WAL senders and the archiver to finish.
    WaitWalSenders,
    /// Only dead-end children may remain; sockets are closed.
    WaitDeadEnd,
    /// Registry empty; decide between exit and reinitialization.
    NoChildren,
}

impl PmPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Startup => "startup",
            Self::Recovery => "recovery",
            Self::HotStandby => "hot-standby",
            Self::Run => "run",
            Self::StopBackends => "stop-backends",
            Self::WaitBackends => "wait-backends",
            Self::ShutdownCheckpoint => "shutdown-checkpoint",
            Self::WaitWalSenders => "wait-wal-senders",
            Self::WaitDeadEnd => "wait-dead-end",
            Self::NoChildren => "no-children",
        }
    }

    /// Phases in which client sessions may be admitted at all.
    pub fn serving(&self) -> bool {
        matches!(self, Self::Run | Self::HotStandby)
    }

    /// Phases in which the shutdown sequence is already past the point of
    /// accepting new work of any kind.
    pub fn winding_down(&self) -> bool {
        matches!(
            self,
            Self::StopBackends
                | Self::WaitBackends
                | Self::ShutdownCheckpoint
                | Self::WaitWalSenders
                | Self::WaitDeadEnd
                | Self::NoChildren
        )
    }
}

/// Most severe shutdown request received so far. Discriminants are the merge
/// order: a later, milder request never lowers the latched value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ShutdownMode {
    None = 0,
    /// Wait for sessions to end on their own.
    Smart = 1,
    /// Terminate sessions, then shut down in order.
    Fast = 2,
    /// Quit-with-core everything and rely on recovery at next boot.
    Immediate = 3,
}

impl ShutdownMode {
    pub fn from_severity(v: u8) -> Self {
        match v {
            0 => Self::None,
            1 => Self::Smart,
            2 => Self::Fast,
            _ => Self::Immediate,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Smart => "smart",
            Self::Fast => "fast",
            Self::Immediate => "immediate",
        }
    }

    /// Merge a newly arrived request into the latched one.
    pub fn merge(self, other: ShutdownMode) -> ShutdownMode {
        self.max(other)
    }
}

/// What the supervisor knows about the startup worker. Tells an expected
/// death (we signaled it) from a catastrophic one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupStatus {
    NotRunning,
    Running,
    /// We sent it a termination or quit signal ourselves.
    Signaled,
    Crashed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serving_phases() {
        assert!(PmPhase::Run.serving());
        assert!(PmPhase::HotStandby.serving());
        assert!(!PmPhase::Startup.serving());
        assert!(!PmPhase::Recovery.serving());
        assert!(!PmPhase::WaitDeadEnd.serving());
    }

    #[test]
    fn test_winding_down_phases() {
        assert!(!PmPhase::Run.winding_down());
        assert!(!PmPhase::Recovery.winding_down());
        assert!(PmPhase::StopBackends.winding_down());
        assert!(PmPhase::NoChildren.winding_down());
    }

    #[test]
    fn test_shutdown_merge_keeps_most_severe() {
        assert_eq!(
            ShutdownMode::Smart.merge(ShutdownMode::Immediate),
            ShutdownMode::Immediate
        );
        assert_eq!(
            ShutdownMode::Immediate.merge(ShutdownMode::Smart),
            ShutdownMode::Immediate
        );
        assert_eq!(ShutdownMode::None.merge(ShutdownMode::Fast), ShutdownMode::Fast);
    }

    #[test]
    fn test_phase_as_str() {
        assert_eq!(PmPhase::Init.as_str(), "init");
        assert_eq!(PmPhase::HotStandby.as_str(), "hot-standby");
        assert_eq!(PmPhase::ShutdownCheckpoint.as_str(), "shutdown-checkpoint");
        assert_eq!(PmPhase::NoChildren.as_str(), "no-children");
        assert_eq!(ShutdownMode::Immediate.as_str(), "immediate");
    }

    #[test]
    fn test_severity_roundtrip() {
        for mode in [
            ShutdownMode::None,
            ShutdownMode::Smart,
            ShutdownMode::Fast,
            ShutdownMode::Immediate,
        ] {
            assert_eq!(ShutdownMode::from_severity(mode as u8), mode);
        }
    }
}
