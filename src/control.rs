//! Cluster control file
//!
//! A tiny fixed-format file in the data directory recording whether the
//! cluster was shut down cleanly. The startup worker reads it to decide
//! whether recovery is needed and marks the cluster in production; the
//! checkpointer's shutdown checkpoint marks it shut down again. A cluster
//! found in production at boot did not shut down cleanly.

use std::path::{Path, PathBuf};

pub const CONTROL_FILE: &str = "control";
const CONTROL_MAGIC: &str = "DBVISOR-CONTROL";
const CONTROL_VERSION: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterState {
    ShutDown,
    InProduction,
}

impl ClusterState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ShutDown => "shut-down",
            Self::InProduction => "in-production",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "shut-down" => Some(Self::ShutDown),
            "in-production" => Some(Self::InProduction),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ControlData {
    pub state: ClusterState,
    pub updated_at: u64,
}

fn control_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONTROL_FILE)
}

/// Read and validate the control file. Anything malformed is an error: a
/// damaged control file means the data directory cannot be trusted.
pub fn read(data_dir: &Path) -> Result<ControlData, ControlError> {
    let path = control_path(data_dir);
    let content = std::fs::read_to_string(&path).map_err(|e| ControlError::Io {
        path: path.clone(),
        source: e,
    })?;

    let mut lines = content.lines();
    let header = lines.next().unwrap_or_default();
    let Some((magic, version)) = header.split_once(' ') else {
        return Err(ControlError::Damaged(path));
    };
    if magic != CONTROL_MAGIC {
        return Err(ControlError::Damaged(path));
    }
    if version.parse::<u32>() != Ok(CONTROL_VERSION) {
        return Err(ControlError::VersionMismatch {
            path,
            found: version.to_string(),
        });
    }
    let state = lines
        .next()
        .and_then(ClusterState::parse)
        .ok_or_else(|| ControlError::Damaged(path.clone()))?;
    let updated_at = lines
        .next()
        .and_then(|l| l.trim().parse().ok())
        .ok_or(ControlError::Damaged(path))?;

    Ok(ControlData { state, updated_at })
}

/// Write the control file whole. Used by bootstrap and by the workers that
/// move the cluster between states.
pub fn write(data_dir: &Path, state: ClusterState) -> Result<(), ControlError> {
    let path = control_path(data_dir);
    let updated_at = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let content = format!("{CONTROL_MAGIC} {CONTROL_VERSION}\n{}\n{updated_at}\n", state.as_str());
    std::fs::write(&path, content).map_err(|e| ControlError::Io { path, source: e })
}

pub fn exists(data_dir: &Path) -> bool {
    control_path(data_dir).exists()
}

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("control file {0} is damaged")]
    Damaged(PathBuf),

    #[error("control file {path} has incompatible version {found}")]
    VersionMismatch { path: PathBuf, found: String },

    #[error("cannot access control file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), ClusterState::ShutDown).unwrap();
        let data = read(dir.path()).unwrap();
        assert_eq!(data.state, ClusterState::ShutDown);

        write(dir.path(), ClusterState::InProduction).unwrap();
        let data = read(dir.path()).unwrap();
        assert_eq!(data.state, ClusterState::InProduction);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(read(dir.path()), Err(ControlError::Io { .. })));
    }

    #[test]
    fn test_garbage_is_damaged() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONTROL_FILE), "not a control file\n").unwrap();
        assert!(matches!(read(dir.path()), Err(ControlError::Damaged(_))));
    }

    #[test]
    fn test_version_mismatch_detected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONTROL_FILE),
            "DBVISOR-CONTROL 99\nshut-down\n0\n",
        )
        .unwrap();
        assert!(matches!(
            read(dir.path()),
            Err(ControlError::VersionMismatch { .. })
        ));
    }
}
