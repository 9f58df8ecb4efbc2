//! dbvisor entry point
//!
//! Mode selector as the first argument, with plain `dbvisor` meaning
//! "supervise". Everything except the read-only inspection modes refuses to
//! run as root.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use dbvisor::config::{self, Config, OptionKind};
use dbvisor::control::{self, ClusterState};
use dbvisor::supervisor::{Supervisor, EXIT_BADCONFIG, EXIT_FAILURE, EXIT_OK};
use dbvisor::worker::{self, WorkerBootstrap};

#[derive(Parser)]
#[command(name = "dbvisor")]
#[command(version)]
#[command(about = "Supervisor process for a multi-process database server")]
struct Args {
    /// Data directory (or set DBVISOR_DATA)
    #[arg(short = 'D', long = "data-dir", global = true)]
    data_dir: Option<PathBuf>,

    /// Set a configuration option, overriding the configuration file
    #[arg(short = 'c', value_name = "NAME=VALUE", global = true)]
    set: Vec<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Validate the configuration and data directory, then exit
    Check,
    /// Create a new cluster skeleton in the data directory
    Bootstrap,
    /// Print the configuration option table
    DescribeConfig,
    /// Run a single session inline, without any worker processes
    Single,
    /// Internal: come up as a worker from a serialized payload
    #[command(hide = true)]
    SpawnChild { payload: PathBuf },
    /// Print one resolved configuration value
    PrintConfig { name: String },
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    config::setup_locale();

    let args = Args::parse();

    let overrides = match parse_overrides(&args.set) {
        Ok(o) => o,
        Err(bad) => {
            log::error!("invalid -c option {bad:?}, expected NAME=VALUE");
            return ExitCode::from(EXIT_BADCONFIG as u8);
        }
    };

    let read_only = matches!(
        args.command,
        Some(Command::DescribeConfig) | Some(Command::PrintConfig { .. })
    );
    let root_permitted = std::env::var_os("DBVISOR_ALLOW_ROOT").is_some_and(|v| v == "1");
    let is_root = unsafe { libc::geteuid() } == 0;
    if !read_only && !root_permitted && is_root {
        log::error!("refusing to run as root; start the server under an unprivileged account");
        return ExitCode::from(EXIT_BADCONFIG as u8);
    }

    let code = match args.command {
        None => run_supervise(args.data_dir, &overrides),
        Some(Command::Check) => run_check(args.data_dir, &overrides),
        Some(Command::Bootstrap) => run_bootstrap(args.data_dir),
        Some(Command::DescribeConfig) => run_describe_config(),
        Some(Command::Single) => run_single(args.data_dir, &overrides),
        Some(Command::SpawnChild { payload }) => run_spawn_child(&payload),
        Some(Command::PrintConfig { name }) => run_print_config(args.data_dir, &overrides, &name),
    };
    ExitCode::from(code as u8)
}

fn parse_overrides(raw: &[String]) -> Result<Vec<(String, String)>, String> {
    raw.iter()
        .map(|s| {
            s.split_once('=')
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                .ok_or_else(|| s.clone())
        })
        .collect()
}

fn resolve_data_dir(arg: Option<PathBuf>) -> Result<PathBuf, i32> {
    if let Some(dir) = arg {
        return Ok(dir);
    }
    if let Some(dir) = std::env::var_os("DBVISOR_DATA") {
        return Ok(PathBuf::from(dir));
    }
    log::error!("no data directory: pass -D or set DBVISOR_DATA");
    Err(EXIT_BADCONFIG)
}

fn load_config(data_dir: Option<PathBuf>, overrides: &[(String, String)]) -> Result<Config, i32> {
    let dir = resolve_data_dir(data_dir)?;
    if !dir.is_dir() {
        log::error!("data directory {} does not exist", dir.display());
        return Err(EXIT_BADCONFIG);
    }
    Config::load(&dir, overrides).map_err(|e| {
        log::error!("{e}");
        EXIT_BADCONFIG
    })
}

fn run_supervise(data_dir: Option<PathBuf>, overrides: &[(String, String)]) -> i32 {
    let cfg = match load_config(data_dir, overrides) {
        Ok(cfg) => cfg,
        Err(code) => return code,
    };
    match Supervisor::boot(cfg) {
        Ok(mut supervisor) => supervisor.run(),
        Err(e) => {
            log::error!("{e}");
            e.exit_code()
        }
    }
}

fn run_check(data_dir: Option<PathBuf>, overrides: &[(String, String)]) -> i32 {
    let cfg = match load_config(data_dir, overrides) {
        Ok(cfg) => cfg,
        Err(code) => return code,
    };
    match control::read(&cfg.data_dir) {
        Ok(data) => {
            println!("configuration valid; cluster state: {}", data.state.as_str());
            EXIT_OK
        }
        Err(e) => {
            log::error!("{e}");
            EXIT_BADCONFIG
        }
    }
}

fn run_bootstrap(data_dir: Option<PathBuf>) -> i32 {
    let dir = match resolve_data_dir(data_dir) {
        Ok(d) => d,
        Err(code) => return code,
    };
    if control::exists(&dir) {
        log::error!("data directory {} already contains a cluster", dir.display());
        return EXIT_BADCONFIG;
    }
    if let Err(e) = std::fs::create_dir_all(&dir) {
        log::error!("cannot create data directory {}: {e}", dir.display());
        return EXIT_FAILURE;
    }

    let conf_path = dir.join(config::CONFIG_FILE);
    if !conf_path.exists() {
        let mut template = String::from("# dbvisor configuration\n");
        for def in config::OPTIONS {
            template.push_str(&format!("#{} = {}\n", def.name, def.default));
        }
        if let Err(e) = std::fs::write(&conf_path, template) {
            log::error!("cannot write {}: {e}", conf_path.display());
            return EXIT_FAILURE;
        }
    }

    if let Err(e) = control::write(&dir, ClusterState::ShutDown) {
        log::error!("{e}");
        return EXIT_FAILURE;
    }
    println!("cluster initialized in {}", dir.display());
    EXIT_OK
}

fn run_describe_config() -> i32 {
    for def in config::OPTIONS {
        let kind = match def.kind {
            OptionKind::Bool => "bool",
            OptionKind::Integer => "integer",
            OptionKind::String => "string",
            OptionKind::List => "list",
        };
        let reload = if def.reloadable { "reload" } else { "restart" };
        println!(
            "{}\t{}\t{}\t{}\t{}",
            def.name, kind, def.default, reload, def.description
        );
    }
    EXIT_OK
}

fn run_print_config(data_dir: Option<PathBuf>, overrides: &[(String, String)], name: &str) -> i32 {
    let cfg = match load_config(data_dir, overrides) {
        Ok(cfg) => cfg,
        Err(code) => return code,
    };
    match cfg.get(name) {
        Some(value) => {
            println!("{value}");
            EXIT_OK
        }
        None => {
            log::error!("unknown configuration option: {name}");
            EXIT_BADCONFIG
        }
    }
}

/// Single-user mode: one inline session against stdin, no workers, private
/// use of the data directory under the normal interlock. The escape hatch
/// for a cluster that cannot come up multi-user: it runs the same recovery
/// decision the startup worker makes, against process-private memory.
fn run_single(data_dir: Option<PathBuf>, overrides: &[(String, String)]) -> i32 {
    use std::io::{BufRead, Write};

    let cfg = match load_config(data_dir, overrides) {
        Ok(cfg) => cfg,
        Err(code) => return code,
    };
    let control_data = match control::read(&cfg.data_dir) {
        Ok(data) => data,
        Err(e) => {
            log::error!("{e}");
            return EXIT_BADCONFIG;
        }
    };

    let start_epoch = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let pidfile = match dbvisor::supervisor::pidfile::PidFile::create(&cfg, start_epoch) {
        Ok(p) => p,
        Err(e) => {
            log::error!("{e}");
            return EXIT_FAILURE;
        }
    };

    // same subsystem layout the supervisor provisions, but anonymous
    // process-private memory: nothing else can attach, nothing survives us
    let arena = match dbvisor::shmem::PrivateArena::create(&cfg) {
        Ok(a) => a,
        Err(e) => {
            log::error!("{e}");
            pidfile.unlink();
            return EXIT_FAILURE;
        }
    };

    // the startup worker's recovery decision, inline
    if control_data.state == ClusterState::InProduction {
        log::info!("database system was not shut down cleanly, running recovery");
        // redo would run here, against the private arena
    }
    if let Err(e) = control::write(&cfg.data_dir, ClusterState::InProduction) {
        log::error!("{e}");
        pidfile.unlink();
        return EXIT_FAILURE;
    }

    println!("dbvisor single-user mode; end input to quit");
    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout();
    for line in stdin.lock().lines() {
        match line {
            Ok(line) => {
                // the engine would evaluate here, on the arena's subsystems
                let _ = writeln!(stdout, "echo {line}");
            }
            Err(_) => break,
        }
    }

    // a clean single-user exit stamps the cluster shut down, the way the
    // checkpointer's shutdown checkpoint does after multi-user service
    let code = match control::write(&cfg.data_dir, ClusterState::ShutDown) {
        Ok(()) => EXIT_OK,
        Err(e) => {
            log::error!("{e}");
            EXIT_FAILURE
        }
    };

    drop(arena);
    pidfile.unlink();
    code
}

/// Spawn-and-reattach entry: read the serialized bootstrap, reattach to the
/// segment, and become the worker described there.
fn run_spawn_child(payload: &PathBuf) -> i32 {
    let body = match std::fs::read(payload) {
        Ok(b) => b,
        Err(e) => {
            log::error!("cannot read spawn payload {}: {e}", payload.display());
            return worker::EXIT_CRASH;
        }
    };
    // one-shot file; remove before doing anything observable
    let _ = std::fs::remove_file(payload);

    let bootstrap: WorkerBootstrap = match serde_json::from_slice(&body) {
        Ok(b) => b,
        Err(e) => {
            log::error!("malformed spawn payload {}: {e}", payload.display());
            return worker::EXIT_CRASH;
        }
    };
    worker::child_main(bootstrap, None)
}
