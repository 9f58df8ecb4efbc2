//! Configuration store
//!
//! Settings come from three layers, later wins: built-in defaults, the
//! `dbvisor.conf` file in the data directory, and `-c name=value` overrides
//! from the command line. A SIGHUP reload re-reads the file but only applies
//! settings marked reloadable; the rest keep their boot-time values until the
//! next start.

use std::ffi::CString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Name of the configuration file inside the data directory.
pub const CONFIG_FILE: &str = "dbvisor.conf";

/// Value kinds an option can take, for `describe-config` output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionKind {
    Bool,
    Integer,
    String,
    List,
}

/// Static description of one option.
pub struct OptionDef {
    pub name: &'static str,
    pub kind: OptionKind,
    pub default: &'static str,
    pub reloadable: bool,
    pub description: &'static str,
}

/// The option table. Order here is the order `describe-config` prints.
pub static OPTIONS: &[OptionDef] = &[
    OptionDef {
        name: "port",
        kind: OptionKind::Integer,
        default: "5454",
        reloadable: false,
        description: "TCP port the server listens on",
    },
    OptionDef {
        name: "listen_addresses",
        kind: OptionKind::List,
        default: "localhost",
        reloadable: false,
        description: "comma-separated host names or addresses to bind, empty for none",
    },
    OptionDef {
        name: "unix_socket_directories",
        kind: OptionKind::List,
        default: "/tmp",
        reloadable: false,
        description: "directories for Unix-domain sockets, empty for none",
    },
    OptionDef {
        name: "max_sessions",
        kind: OptionKind::Integer,
        default: "100",
        reloadable: false,
        description: "maximum number of concurrent client sessions",
    },
    OptionDef {
        name: "max_autovac_workers",
        kind: OptionKind::Integer,
        default: "3",
        reloadable: false,
        description: "maximum number of concurrent autovacuum workers",
    },
    OptionDef {
        name: "max_wal_senders",
        kind: OptionKind::Integer,
        default: "10",
        reloadable: false,
        description: "maximum number of WAL sender sessions",
    },
    OptionDef {
        name: "max_bgworkers",
        kind: OptionKind::Integer,
        default: "8",
        reloadable: false,
        description: "maximum number of registered background workers",
    },
    OptionDef {
        name: "max_replication_slots",
        kind: OptionKind::Integer,
        default: "10",
        reloadable: false,
        description: "maximum number of replication slots",
    },
    OptionDef {
        name: "shared_buffers",
        kind: OptionKind::Integer,
        default: "1024",
        reloadable: false,
        description: "shared buffer pool size, in 8 KiB pages",
    },
    OptionDef {
        name: "wal_buffers",
        kind: OptionKind::Integer,
        default: "64",
        reloadable: false,
        description: "WAL buffer size, in 8 KiB pages",
    },
    OptionDef {
        name: "lock_table_entries",
        kind: OptionKind::Integer,
        default: "4096",
        reloadable: false,
        description: "entries in the shared lock table",
    },
    OptionDef {
        name: "extra_shared_memory",
        kind: OptionKind::Integer,
        default: "0",
        reloadable: false,
        description: "extra shared memory reserved for preload libraries, in bytes",
    },
    OptionDef {
        name: "restart_after_crash",
        kind: OptionKind::Bool,
        default: "on",
        reloadable: true,
        description: "reinitialize after a child crash instead of exiting",
    },
    OptionDef {
        name: "hot_standby",
        kind: OptionKind::Bool,
        default: "off",
        reloadable: false,
        description: "allow read-only sessions while recovery is still running",
    },
    OptionDef {
        name: "send_abort_for_crash",
        kind: OptionKind::Bool,
        default: "off",
        reloadable: true,
        description: "use SIGABRT instead of SIGQUIT when tearing down after a crash",
    },
    OptionDef {
        name: "archive_mode",
        kind: OptionKind::Bool,
        default: "off",
        reloadable: false,
        description: "run the archiver child",
    },
    OptionDef {
        name: "wal_summarize",
        kind: OptionKind::Bool,
        default: "off",
        reloadable: true,
        description: "run the WAL summarizer child",
    },
    OptionDef {
        name: "slot_sync",
        kind: OptionKind::Bool,
        default: "off",
        reloadable: true,
        description: "run the replication slot synchronization child",
    },
    OptionDef {
        name: "autovacuum",
        kind: OptionKind::Bool,
        default: "on",
        reloadable: true,
        description: "run the autovacuum launcher child",
    },
    OptionDef {
        name: "logging_collector",
        kind: OptionKind::Bool,
        default: "off",
        reloadable: false,
        description: "capture child stderr through the log collector child",
    },
    OptionDef {
        name: "log_directory",
        kind: OptionKind::String,
        default: "log",
        reloadable: true,
        description: "directory for collected log files, relative to the data directory",
    },
    OptionDef {
        name: "launch_strategy",
        kind: OptionKind::String,
        default: "fork",
        reloadable: false,
        description: "child launch strategy: fork or spawn",
    },
    OptionDef {
        name: "bgworker_restart_floor_ms",
        kind: OptionKind::Integer,
        default: "0",
        reloadable: true,
        description: "minimum delay before any background worker restart, in milliseconds",
    },
];

fn option_def(name: &str) -> Option<&'static OptionDef> {
    OPTIONS.iter().find(|d| d.name == name)
}

/// How children are created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LaunchStrategy {
    /// Plain fork; the child inherits everything.
    Fork,
    /// Fresh process that reattaches from a serialized payload.
    Spawn,
}

/// Resolved configuration, owned by the supervisor and inherited read-only
/// by forked children. Serializable so spawn-and-reattach children receive
/// the same resolved values instead of re-reading the file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub data_dir: PathBuf,
    pub port: u16,
    pub listen_addresses: Vec<String>,
    pub unix_socket_directories: Vec<PathBuf>,
    pub max_sessions: u32,
    pub max_autovac_workers: u32,
    pub max_wal_senders: u32,
    pub max_bgworkers: u32,
    pub max_replication_slots: u32,
    pub shared_buffers: u32,
    pub wal_buffers: u32,
    pub lock_table_entries: u32,
    pub extra_shared_memory: usize,
    pub restart_after_crash: bool,
    pub hot_standby: bool,
    pub send_abort_for_crash: bool,
    pub archive_mode: bool,
    pub wal_summarize: bool,
    pub slot_sync: bool,
    pub autovacuum: bool,
    pub logging_collector: bool,
    pub log_directory: String,
    pub launch_strategy: LaunchStrategy,
    pub bgworker_restart_floor: Duration,
    /// Command-line overrides, reapplied on top of every reload.
    overrides: Vec<(String, String)>,
}

impl Config {
    /// Built-in defaults with an empty data directory path.
    pub fn defaults() -> Self {
        Config {
            data_dir: PathBuf::new(),
            port: 5454,
            listen_addresses: vec!["localhost".into()],
            unix_socket_directories: vec![PathBuf::from("/tmp")],
            max_sessions: 100,
            max_autovac_workers: 3,
            max_wal_senders: 10,
            max_bgworkers: 8,
            max_replication_slots: 10,
            shared_buffers: 1024,
            wal_buffers: 64,
            lock_table_entries: 4096,
            extra_shared_memory: 0,
            restart_after_crash: true,
            hot_standby: false,
            send_abort_for_crash: false,
            archive_mode: false,
            wal_summarize: false,
            slot_sync: false,
            autovacuum: true,
            logging_collector: false,
            log_directory: "log".into(),
            launch_strategy: LaunchStrategy::Fork,
            bgworker_restart_floor: Duration::ZERO,
            overrides: Vec::new(),
        }
    }

    /// Load the configuration for a data directory, applying `-c` overrides
    /// on top of the file.
    pub fn load(data_dir: &Path, overrides: &[(String, String)]) -> Result<Self, ConfigError> {
        let mut cfg = Config::defaults();
        cfg.data_dir = data_dir.to_path_buf();
        cfg.overrides = overrides.to_vec();

        let path = data_dir.join(CONFIG_FILE);
        if path.exists() {
            for (name, value) in parse_config_file(&path)? {
                cfg.apply(&name, &value)?;
            }
        }
        for (name, value) in overrides.to_vec() {
            cfg.apply(&name, &value)?;
        }
        cfg.validate()?;
        Ok(cfg)
    }

    /// Re-read the file and apply the settings marked reloadable. Returns the
    /// names of settings that changed.
    pub fn reload(&mut self) -> Result<Vec<String>, ConfigError> {
        let path = self.data_dir.join(CONFIG_FILE);
        let mut incoming = Config::defaults();
        incoming.data_dir = self.data_dir.clone();
        if path.exists() {
            for (name, value) in parse_config_file(&path)? {
                incoming.apply(&name, &value)?;
            }
        }
        for (name, value) in self.overrides.clone() {
            incoming.apply(&name, &value)?;
        }
        incoming.validate()?;

        let mut changed = Vec::new();
        for def in OPTIONS {
            if !def.reloadable {
                continue;
            }
            let new = incoming.get(def.name).unwrap_or_default();
            if self.get(def.name).unwrap_or_default() != new {
                self.apply(def.name, &new)?;
                changed.push(def.name.to_string());
            }
        }
        Ok(changed)
    }

    /// Set one option by name. Unknown names and malformed values are errors.
    pub fn apply(&mut self, name: &str, value: &str) -> Result<(), ConfigError> {
        let def = option_def(name).ok_or_else(|| ConfigError::Unknown(name.to_string()))?;
        let bad = || ConfigError::BadValue {
            name: name.to_string(),
            value: value.to_string(),
        };
        match def.name {
            "port" => self.port = value.parse().map_err(|_| bad())?,
            "listen_addresses" => self.listen_addresses = parse_list(value),
            "unix_socket_directories" => {
                self.unix_socket_directories = parse_list(value).into_iter().map(PathBuf::from).collect()
            }
            "max_sessions" => self.max_sessions = parse_positive(value).ok_or_else(bad)?,
            "max_autovac_workers" => self.max_autovac_workers = value.parse().map_err(|_| bad())?,
            "max_wal_senders" => self.max_wal_senders = value.parse().map_err(|_| bad())?,
            "max_bgworkers" => self.max_bgworkers = value.parse().map_err(|_| bad())?,
            "max_replication_slots" => self.max_replication_slots = value.parse().map_err(|_| bad())?,
            "shared_buffers" => self.shared_buffers = parse_positive(value).ok_or_else(bad)?,
            "wal_buffers" => self.wal_buffers = parse_positive(value).ok_or_else(bad)?,
            "lock_table_entries" => self.lock_table_entries = parse_positive(value).ok_or_else(bad)?,
            "extra_shared_memory" => self.extra_shared_memory = value.parse().map_err(|_| bad())?,
            "restart_after_crash" => self.restart_after_crash = parse_bool(value).ok_or_else(bad)?,
            "hot_standby" => self.hot_standby = parse_bool(value).ok_or_else(bad)?,
            "send_abort_for_crash" => self.send_abort_for_crash = parse_bool(value).ok_or_else(bad)?,
            "archive_mode" => self.archive_mode = parse_bool(value).ok_or_else(bad)?,
            "wal_summarize" => self.wal_summarize = parse_bool(value).ok_or_else(bad)?,
            "slot_sync" => self.slot_sync = parse_bool(value).ok_or_else(bad)?,
            "autovacuum" => self.autovacuum = parse_bool(value).ok_or_else(bad)?,
            "logging_collector" => self.logging_collector = parse_bool(value).ok_or_else(bad)?,
            "log_directory" => self.log_directory = value.to_string(),
            "launch_strategy" => {
                self.launch_strategy = match value {
                    "fork" => LaunchStrategy::Fork,
                    "spawn" => LaunchStrategy::Spawn,
                    _ => return Err(bad()),
                }
            }
            "bgworker_restart_floor_ms" => {
                self.bgworker_restart_floor =
                    Duration::from_millis(value.parse().map_err(|_| bad())?)
            }
            _ => unreachable!("option table out of sync"),
        }
        Ok(())
    }

    /// Current value of one option, formatted the way the file would spell it.
    pub fn get(&self, name: &str) -> Option<String> {
        let v = match name {
            "port" => self.port.to_string(),
            "listen_addresses" => self.listen_addresses.join(","),
            "unix_socket_directories" => self
                .unix_socket_directories
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(","),
            "max_sessions" => self.max_sessions.to_string(),
            "max_autovac_workers" => self.max_autovac_workers.to_string(),
            "max_wal_senders" => self.max_wal_senders.to_string(),
            "max_bgworkers" => self.max_bgworkers.to_string(),
            "max_replication_slots" => self.max_replication_slots.to_string(),
            "shared_buffers" => self.shared_buffers.to_string(),
            "wal_buffers" => self.wal_buffers.to_string(),
            "lock_table_entries" => self.lock_table_entries.to_string(),
            "extra_shared_memory" => self.extra_shared_memory.to_string(),
            "restart_after_crash" => format_bool(self.restart_after_crash),
            "hot_standby" => format_bool(self.hot_standby),
            "send_abort_for_crash" => format_bool(self.send_abort_for_crash),
            "archive_mode" => format_bool(self.archive_mode),
            "wal_summarize" => format_bool(self.wal_summarize),
            "slot_sync" => format_bool(self.slot_sync),
            "autovacuum" => format_bool(self.autovacuum),
            "logging_collector" => format_bool(self.logging_collector),
            "log_directory" => self.log_directory.clone(),
            "launch_strategy" => match self.launch_strategy {
                LaunchStrategy::Fork => "fork".into(),
                LaunchStrategy::Spawn => "spawn".into(),
            },
            "bgworker_restart_floor_ms" => self.bgworker_restart_floor.as_millis().to_string(),
            _ => return None,
        };
        Some(v)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_sessions == 0 {
            return Err(ConfigError::BadValue {
                name: "max_sessions".into(),
                value: "0".into(),
            });
        }
        if self.listen_addresses.is_empty() && self.unix_socket_directories.is_empty() {
            return Err(ConfigError::NoListeners);
        }
        Ok(())
    }

    /// Hard ceiling on simultaneously live children. Dead-end children and
    /// workers that are already exiting still count, hence the headroom
    /// factor.
    pub fn live_children_ceiling(&self) -> u32 {
        2 * (self.max_sessions + self.max_autovac_workers + self.max_wal_senders + self.max_bgworkers + 1)
    }

    /// Semaphores provisioned in the shared pool: one per possible
    /// shared-memory participant.
    pub fn semaphore_count(&self) -> u32 {
        self.live_children_ceiling()
    }

    pub fn log_path(&self) -> PathBuf {
        self.data_dir.join(&self.log_directory)
    }
}

fn parse_bool(v: &str) -> Option<bool> {
    match v {
        "on" | "true" | "yes" | "1" => Some(true),
        "off" | "false" | "no" | "0" => Some(false),
        _ => None,
    }
}

fn format_bool(v: bool) -> String {
    if v { "on".into() } else { "off".into() }
}

fn parse_positive(v: &str) -> Option<u32> {
    v.parse().ok().filter(|n: &u32| *n > 0)
}

fn parse_list(v: &str) -> Vec<String> {
    v.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Parse `name = value` lines. `#` starts a comment, values may be single- or
/// double-quoted, blank lines are skipped.
fn parse_config_file(path: &Path) -> Result<Vec<(String, String)>, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;

    let mut settings = Vec::new();
    for (lineno, raw) in content.lines().enumerate() {
        let line = match raw.find('#') {
            Some(pos) if !in_quotes(raw, pos) => &raw[..pos],
            _ => raw,
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some((name, value)) = line.split_once('=') else {
            return Err(ConfigError::Syntax {
                path: path.to_path_buf(),
                line: lineno + 1,
            });
        };
        let name = name.trim().to_string();
        let value = value.trim().trim_matches('"').trim_matches('\'').to_string();
        settings.push((name, value));
    }
    Ok(settings)
}

fn in_quotes(line: &str, pos: usize) -> bool {
    let quotes = line[..pos].chars().filter(|c| *c == '"' || *c == '\'').count();
    quotes % 2 == 1
}

/// Consult the locale environment the way the server expects it: the
/// collate/ctype/messages triple comes from the environment, while the
/// numeric-looking categories are pinned to "C" so formatting stays stable.
/// LC_ALL would override the pinning later, so it is consumed and unset.
pub fn setup_locale() {
    for category in [libc::LC_COLLATE, libc::LC_CTYPE, libc::LC_MESSAGES] {
        let empty = CString::new("").unwrap();
        unsafe { libc::setlocale(category, empty.as_ptr()) };
    }
    for category in [libc::LC_MONETARY, libc::LC_NUMERIC, libc::LC_TIME] {
        let c = CString::new("C").unwrap();
        unsafe { libc::setlocale(category, c.as_ptr()) };
    }
    std::env::remove_var("LC_ALL");
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unknown configuration option: {0}")]
    Unknown(String),

    #[error("invalid value for {name}: {value:?}")]
    BadValue { name: String, value: String },

    #[error("no listen addresses and no socket directories configured")]
    NoListeners,

    #[error("syntax error in {path} line {line}")]
    Syntax { path: PathBuf, line: usize },

    #[error("cannot read {path}: {source}")]
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
    fn test_defaults_valid() {
        let cfg = Config::defaults();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.port, 5454);
        assert!(cfg.restart_after_crash);
    }

    #[test]
    fn test_apply_and_get_roundtrip() {
        let mut cfg = Config::defaults();
        cfg.apply("port", "6000").unwrap();
        cfg.apply("hot_standby", "on").unwrap();
        cfg.apply("listen_addresses", "127.0.0.1, ::1").unwrap();
        assert_eq!(cfg.get("port").unwrap(), "6000");
        assert_eq!(cfg.get("hot_standby").unwrap(), "on");
        assert_eq!(cfg.get("listen_addresses").unwrap(), "127.0.0.1,::1");
    }

    #[test]
    fn test_unknown_option_rejected() {
        let mut cfg = Config::defaults();
        assert!(matches!(
            cfg.apply("no_such_option", "1"),
            Err(ConfigError::Unknown(_))
        ));
    }

    #[test]
    fn test_bad_value_rejected() {
        let mut cfg = Config::defaults();
        assert!(cfg.apply("port", "not-a-port").is_err());
        assert!(cfg.apply("max_sessions", "0").is_err());
        assert!(cfg.apply("launch_strategy", "vfork").is_err());
    }

    #[test]
    fn test_parse_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(
            &path,
            "# comment\nport = 6001\nlisten_addresses = 'localhost'\n\nautovacuum = off # inline\n",
        )
        .unwrap();
        let settings = parse_config_file(&path).unwrap();
        assert_eq!(
            settings,
            vec![
                ("port".to_string(), "6001".to_string()),
                ("listen_addresses".to_string(), "localhost".to_string()),
                ("autovacuum".to_string(), "off".to_string()),
            ]
        );
    }

    #[test]
    fn test_load_with_overrides() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "port = 6001\n").unwrap();
        let overrides = vec![("port".to_string(), "6002".to_string())];
        let cfg = Config::load(dir.path(), &overrides).unwrap();
        assert_eq!(cfg.port, 6002);
    }

    #[test]
    fn test_reload_only_touches_reloadable() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "port = 6001\n").unwrap();
        let mut cfg = Config::load(dir.path(), &[]).unwrap();
        assert_eq!(cfg.port, 6001);

        // port is not reloadable, autovacuum is
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            "port = 7000\nautovacuum = off\n",
        )
        .unwrap();
        let changed = cfg.reload().unwrap();
        assert_eq!(cfg.port, 6001);
        assert!(!cfg.autovacuum);
        assert_eq!(changed, vec!["autovacuum".to_string()]);
    }

    #[test]
    fn test_ceiling_formula() {
        let cfg = Config::defaults();
        assert_eq!(
            cfg.live_children_ceiling(),
            2 * (100 + 3 + 10 + 8 + 1)
        );
    }
}
