use std::env;
use std::path::PathBuf;
use std::process::exit;

use anyhow::{bail, Context};
use clap::Parser;
use log::LevelFilter;

use sledis::config::Config;
use sledis::server::Server;

/// Redis-wire-compatible data server backed by sled.
#[derive(Parser, Debug)]
#[command(name = "sledis", version)]
struct Args {
    /// Listen address, host:port
    #[arg(long)]
    addr: Option<String>,

    /// Data directory (backing store files plus the optional dump file)
    #[arg(long)]
    dir: Option<PathBuf>,

    /// Start as a replica of the given master
    #[arg(long, num_args = 2, value_names = ["HOST", "PORT"])]
    replicaof: Option<Vec<String>>,

    /// debug | verbose | notice | warning (or any env_logger level)
    #[arg(long)]
    log_level: Option<String>,

    /// Require AUTH with this password
    #[arg(long)]
    password: Option<String>,
}

/// The teacher-era level names map onto the log facade's filters.
fn level_filter(name: &str) -> LevelFilter {
    match name.to_ascii_lowercase().as_str() {
        "debug" | "trace" => LevelFilter::Debug,
        "verbose" | "info" | "notice" => LevelFilter::Info,
        "warning" | "warn" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        _ => LevelFilter::Info,
    }
}

fn env_fallback(flag: Option<String>, var: &str) -> Option<String> {
    flag.or_else(|| env::var(var).ok())
}

fn build_config(args: Args) -> anyhow::Result<Config> {
    let mut config = Config::default();
    if let Some(addr) = env_fallback(args.addr, "SLEDIS_ADDR") {
        config.addr = addr;
    }
    if let Some(dir) = args
        .dir
        .or_else(|| env::var("SLEDIS_DIR").ok().map(PathBuf::from))
    {
        config.dir = dir;
    }
    if let Some(level) = env_fallback(args.log_level, "SLEDIS_LOG_LEVEL") {
        config.log_level = level;
    }
    if let Some(password) = env_fallback(args.password, "SLEDIS_PASSWORD") {
        if !password.is_empty() {
            config.password = Some(password);
        }
    }
    let replicaof = match args.replicaof {
        Some(parts) => Some(parts.join(" ")),
        None => env::var("SLEDIS_REPLICAOF").ok(),
    };
    if let Some(spec) = replicaof {
        let mut it = spec.split_whitespace();
        let (Some(host), Some(port)) = (it.next(), it.next()) else {
            bail!("--replicaof expects HOST PORT");
        };
        let port: u16 = port.parse().context("replica port must be a number")?;
        config.replicaof = Some((host.to_string(), port));
    }
    Ok(config)
}

fn main() {
    let args = Args::parse();
    let config = match build_config(args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("sledis: {}", e);
            exit(1);
        }
    };
    env_logger::Builder::new()
        .filter_level(level_filter(&config.log_level))
        .format_timestamp_millis()
        .init();

    let server = match Server::new(config) {
        Ok(server) => server,
        Err(e) => {
            eprintln!("sledis: startup failed: {}", e);
            exit(1);
        }
    };
    if let Err(e) = server.run() {
        eprintln!("sledis: {}", e);
        exit(1);
    }
}
