use std::path::PathBuf;

use crate::errors::ServerError;
use crate::util::glob_match;

pub const DEFAULT_ADDR: &str = "127.0.0.1:6379";
pub const DEFAULT_DIR: &str = "./data";
pub const DEFAULT_BACKLOG_SIZE: usize = 1024 * 1024;
pub const DEFAULT_SLOWLOG_SLOWER_THAN_US: i64 = 10_000;
pub const DEFAULT_SLOWLOG_MAX_LEN: usize = 128;

/// Server configuration. Built once from flags and environment, then held
/// behind the server context; CONFIG SET mutates the runtime-tunable part.
#[derive(Debug, Clone)]
pub struct Config {
    pub addr: String,
    pub dir: PathBuf,
    pub password: Option<String>,
    pub replicaof: Option<(String, u16)>,
    pub log_level: String,

    // Runtime-tunable parameters (the CONFIG table below).
    pub maxmemory: u64,
    pub repl_backlog_size: usize,
    pub proto_max_bulk_len: usize,
    pub proto_max_multibulk_len: usize,
    pub cluster_enabled: bool,
    pub slowlog_log_slower_than: i64,
    pub slowlog_max_len: usize,
    pub timeout: u64,
    pub dbfilename: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            addr: DEFAULT_ADDR.to_string(),
            dir: PathBuf::from(DEFAULT_DIR),
            password: None,
            replicaof: None,
            log_level: "notice".to_string(),
            maxmemory: 0,
            repl_backlog_size: DEFAULT_BACKLOG_SIZE,
            proto_max_bulk_len: crate::resp::DEFAULT_MAX_BULK_LEN,
            proto_max_multibulk_len: crate::resp::DEFAULT_MAX_MULTIBULK_LEN,
            cluster_enabled: false,
            slowlog_log_slower_than: DEFAULT_SLOWLOG_SLOWER_THAN_US,
            slowlog_max_len: DEFAULT_SLOWLOG_MAX_LEN,
            timeout: 0,
            dbfilename: "dump.rdb".to_string(),
        }
    }
}

fn yes_no_to_bool(v: &str) -> Result<bool, ServerError> {
    match v.to_ascii_lowercase().as_str() {
        "yes" | "1" | "true" => Ok(true),
        "no" | "0" | "false" => Ok(false),
        _ => Err(ServerError::other("argument must be 'yes' or 'no'")),
    }
}

fn bool_to_yes_no(v: bool) -> String {
    if v { "yes".into() } else { "no".into() }
}

/// Parse "100", "1kb", "64mb", "1gb" (powers of 1024; "k"/"m"/"g" are
/// powers of 1000, matching the usual config file convention).
pub fn parse_memory(v: &str) -> Result<u64, ServerError> {
    let v = v.trim().to_ascii_lowercase();
    let (num, mult) = if let Some(n) = v.strip_suffix("kb") {
        (n, 1024)
    } else if let Some(n) = v.strip_suffix("mb") {
        (n, 1024 * 1024)
    } else if let Some(n) = v.strip_suffix("gb") {
        (n, 1024 * 1024 * 1024)
    } else if let Some(n) = v.strip_suffix('k') {
        (n, 1000)
    } else if let Some(n) = v.strip_suffix('m') {
        (n, 1_000_000)
    } else if let Some(n) = v.strip_suffix('g') {
        (n, 1_000_000_000)
    } else {
        (v.as_str(), 1)
    };
    num.trim()
        .parse::<u64>()
        .map(|n| n * mult)
        .map_err(|_| ServerError::other("argument couldn't be parsed into an integer"))
}

impl Config {
    /// Names and current values of every parameter CONFIG GET can see.
    pub fn visible_params(&self) -> Vec<(&'static str, String)> {
        vec![
            ("dir", self.dir.display().to_string()),
            ("requirepass", self.password.clone().unwrap_or_default()),
            ("maxmemory", self.maxmemory.to_string()),
            ("repl-backlog-size", self.repl_backlog_size.to_string()),
            ("proto-max-bulk-len", self.proto_max_bulk_len.to_string()),
            ("cluster-enabled", bool_to_yes_no(self.cluster_enabled)),
            (
                "slowlog-log-slower-than",
                self.slowlog_log_slower_than.to_string(),
            ),
            ("slowlog-max-len", self.slowlog_max_len.to_string()),
            ("timeout", self.timeout.to_string()),
            ("dbfilename", self.dbfilename.clone()),
            ("appendonly", "no".to_string()),
            ("save", "".to_string()),
        ]
    }

    /// `CONFIG GET pattern`: glob over the fixed table.
    pub fn get_params(&self, pattern: &[u8]) -> Vec<(String, String)> {
        self.visible_params()
            .into_iter()
            .filter(|(name, _)| glob_match(pattern, name.as_bytes()))
            .map(|(name, value)| (name.to_string(), value))
            .collect()
    }

    /// `CONFIG SET name value`: best-effort compatibility shim. Unknown
    /// parameters are rejected the way the real server rejects them.
    pub fn set_param(&mut self, name: &str, value: &str) -> Result<(), ServerError> {
        match name.to_ascii_lowercase().as_str() {
            "requirepass" => {
                self.password = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                };
            }
            "maxmemory" => self.maxmemory = parse_memory(value)?,
            "repl-backlog-size" => {
                let n = parse_memory(value)?;
                if n < 16 * 1024 {
                    return Err(ServerError::other(
                        "repl-backlog-size must be at least 16kb",
                    ));
                }
                self.repl_backlog_size = n as usize;
            }
            "proto-max-bulk-len" => self.proto_max_bulk_len = parse_memory(value)? as usize,
            "cluster-enabled" => self.cluster_enabled = yes_no_to_bool(value)?,
            "slowlog-log-slower-than" => {
                self.slowlog_log_slower_than = value
                    .parse()
                    .map_err(|_| ServerError::other("argument couldn't be parsed into an integer"))?
            }
            "slowlog-max-len" => {
                self.slowlog_max_len = value
                    .parse()
                    .map_err(|_| ServerError::other("argument couldn't be parsed into an integer"))?
            }
            "timeout" => {
                self.timeout = value
                    .parse()
                    .map_err(|_| ServerError::other("argument couldn't be parsed into an integer"))?
            }
            "dbfilename" => self.dbfilename = value.to_string(),
            "appendonly" | "save" => {
                // accepted for client compatibility, persistence is the
                // backing store's job here
                let _ = value;
            }
            other => {
                return Err(ServerError::other(format!(
                    "Unknown option or number of arguments for CONFIG SET - '{}'",
                    other
                )))
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_units() {
        assert_eq!(parse_memory("100").unwrap(), 100);
        assert_eq!(parse_memory("1kb").unwrap(), 1024);
        assert_eq!(parse_memory("1k").unwrap(), 1000);
        assert_eq!(parse_memory("64mb").unwrap(), 64 * 1024 * 1024);
        assert!(parse_memory("nope").is_err());
    }

    #[test]
    fn config_get_glob() {
        let cfg = Config::default();
        let all = cfg.get_params(b"*");
        assert!(all.iter().any(|(n, _)| n == "dir"));
        let slow = cfg.get_params(b"slowlog-*");
        assert_eq!(slow.len(), 2);
    }

    #[test]
    fn config_set_roundtrip() {
        let mut cfg = Config::default();
        cfg.set_param("cluster-enabled", "yes").unwrap();
        assert!(cfg.cluster_enabled);
        cfg.set_param("requirepass", "secret").unwrap();
        assert_eq!(cfg.password.as_deref(), Some("secret"));
        assert!(cfg.set_param("no-such-param", "1").is_err());
    }
}
