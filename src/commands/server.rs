//! Connection and server administration commands: PING/ECHO/AUTH, CLIENT,
//! CONFIG, INFO, persistence triggers and the diagnostic shims.

use std::process;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{info, warn};

use crate::client::Session;
use crate::commands::{self, Reply};
use crate::errors::ServerError;
use crate::repl::Role;
use crate::resp::Frame;
use crate::server::Server;
use crate::util::{now_ms, parse_f64, parse_i64, parse_u64};

const COMPAT_VERSION: &str = "7.2.0";
const SLEDIS_VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn ping_command(
    _server: &Arc<Server>,
    session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    if session.subscribed() {
        // subscriber-mode ping answers in message shape
        return Ok(Frame::Array(vec![
            Frame::bulk(&b"pong"[..]),
            Frame::Bulk(argv.get(1).cloned().unwrap_or_default()),
        ])
        .into());
    }
    Ok(match argv.get(1) {
        Some(payload) => Frame::Bulk(payload.clone()),
        None => Frame::Simple("PONG".into()),
    }
    .into())
}

pub fn echo_command(
    _server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    Ok(Frame::Bulk(argv[1].clone()).into())
}

pub fn auth_command(
    server: &Arc<Server>,
    session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let password = match argv.len() {
        2 => &argv[1],
        3 => {
            if !argv[1].eq_ignore_ascii_case(b"default") {
                session.authenticated = false;
                return Err(ServerError::WrongPass);
            }
            &argv[2]
        }
        _ => return Err(ServerError::WrongArity("auth".into())),
    };
    let expected = server.config.read().unwrap().password.clone();
    match expected {
        None => Err(ServerError::other(
            "Client sent AUTH, but no password is set. Did you mean AUTH <username> <password>?",
        )),
        Some(expected) if expected.as_bytes() == password.as_slice() => {
            session.authenticated = true;
            Ok(Frame::ok().into())
        }
        Some(_) => {
            session.authenticated = false;
            Err(ServerError::WrongPass)
        }
    }
}

pub fn hello_command(
    server: &Arc<Server>,
    session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    if let Some(proto) = argv.get(1) {
        if proto.as_slice() != b"2" {
            return Err(ServerError::raw("NOPROTO unsupported protocol version"));
        }
    }
    let role = if server.repl.is_master() { "master" } else { "replica" };
    Ok(Frame::Array(vec![
        Frame::bulk(&b"server"[..]),
        Frame::bulk(&b"redis"[..]),
        Frame::bulk(&b"version"[..]),
        Frame::bulk(COMPAT_VERSION.as_bytes()),
        Frame::bulk(&b"proto"[..]),
        Frame::Integer(2),
        Frame::bulk(&b"id"[..]),
        Frame::Integer(session.handle.id as i64),
        Frame::bulk(&b"mode"[..]),
        Frame::bulk(&b"standalone"[..]),
        Frame::bulk(&b"role"[..]),
        Frame::bulk(role.as_bytes()),
        Frame::bulk(&b"modules"[..]),
        Frame::Array(vec![]),
    ])
    .into())
}

pub fn select_command(
    _server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    // single keyspace: SELECT is accepted for compatibility only
    match parse_i64(&argv[1]) {
        Some(n) if (0..16).contains(&n) => Ok(Frame::ok().into()),
        Some(_) => Err(ServerError::other("DB index is out of range")),
        None => Err(ServerError::NotInteger),
    }
}

pub fn swapdb_command(
    _server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    for raw in &argv[1..3] {
        if parse_i64(raw).filter(|n| (0..16).contains(n)).is_none() {
            return Err(ServerError::other("DB index is out of range"));
        }
    }
    Ok(Frame::ok().into())
}

fn render_client_line(handle: &crate::client::ClientHandle) -> String {
    let age = (now_ms() - handle.created_ms) / 1000;
    format!(
        "id={} addr={} laddr= fd=-1 name={} age={} idle=0 flags={} db=0 sub={} psub=0 multi=-1 cmd={}",
        handle.id,
        handle.addr,
        handle.name.lock().unwrap(),
        age,
        if handle.is_replica_link.load(Ordering::SeqCst) { "S" } else { "N" },
        handle.sub_count.load(Ordering::SeqCst),
        handle.last_command.lock().unwrap().to_lowercase(),
    )
}

pub fn client_command(
    server: &Arc<Server>,
    session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    match argv[1].to_ascii_uppercase().as_slice() {
        b"ID" => Ok(Frame::Integer(session.handle.id as i64).into()),
        b"GETNAME" => Ok(Frame::Bulk(session.handle.name.lock().unwrap().clone().into_bytes()).into()),
        b"SETNAME" => {
            let name = argv.get(2).ok_or_else(|| ServerError::WrongArity("client".into()))?;
            if name.iter().any(|b| *b == b' ' || *b == b'\n' || *b == b'\r') {
                return Err(ServerError::other(
                    "Client names cannot contain spaces, newlines or special characters.",
                ));
            }
            *session.handle.name.lock().unwrap() = String::from_utf8_lossy(name).into_owned();
            Ok(Frame::ok().into())
        }
        b"LIST" => {
            let clients = server.clients.lock().unwrap();
            let mut lines = String::new();
            let mut ids: Vec<&u64> = clients.keys().collect();
            ids.sort();
            for id in ids {
                lines.push_str(&render_client_line(&clients[id]));
                lines.push('\n');
            }
            Ok(Frame::bulk(lines.into_bytes()).into())
        }
        b"INFO" => Ok(Frame::bulk(render_client_line(&session.handle).into_bytes()).into()),
        b"KILL" => {
            // old form: CLIENT KILL addr:port; filter form: ID/ADDR
            if argv.len() == 3 {
                let target = String::from_utf8_lossy(&argv[2]).into_owned();
                let clients = server.clients.lock().unwrap();
                match clients.values().find(|c| c.addr == target) {
                    Some(client) => {
                        client.request_kill();
                        return Ok(Frame::ok().into());
                    }
                    None => return Err(ServerError::other("No such client address")),
                }
            }
            let mut killed = 0;
            let mut i = 2;
            while i + 1 < argv.len() {
                let value = &argv[i + 1];
                let clients = server.clients.lock().unwrap();
                match argv[i].to_ascii_uppercase().as_slice() {
                    b"ID" => {
                        let id = parse_u64(value).ok_or(ServerError::NotInteger)?;
                        if let Some(client) = clients.get(&id) {
                            client.request_kill();
                            killed += 1;
                        }
                    }
                    b"ADDR" => {
                        let addr = String::from_utf8_lossy(value);
                        for client in clients.values().filter(|c| c.addr == addr) {
                            client.request_kill();
                            killed += 1;
                        }
                    }
                    b"LADDR" | b"TYPE" | b"USER" | b"MAXAGE" => {}
                    _ => return Err(ServerError::Syntax),
                }
                i += 2;
            }
            Ok(Frame::Integer(killed).into())
        }
        b"PAUSE" => {
            let ms = argv
                .get(2)
                .and_then(|a| parse_u64(a))
                .ok_or_else(|| ServerError::other("timeout is not an integer or out of range"))?;
            *server.pause_until.lock().unwrap() =
                Some(Instant::now() + Duration::from_millis(ms));
            Ok(Frame::ok().into())
        }
        b"UNPAUSE" => {
            *server.pause_until.lock().unwrap() = None;
            Ok(Frame::ok().into())
        }
        b"TRACKING" | b"NO-EVICT" | b"NOEVICT" | b"NO-TOUCH" | b"REPLY" => Ok(Frame::ok().into()),
        _ => Err(ServerError::other(format!(
            "Unknown subcommand or wrong number of arguments for '{}'. Try CLIENT HELP.",
            String::from_utf8_lossy(&argv[1])
        ))),
    }
}

pub fn config_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    match argv[1].to_ascii_uppercase().as_slice() {
        b"GET" => {
            if argv.len() < 3 {
                return Err(ServerError::WrongArity("config|get".into()));
            }
            let config = server.config.read().unwrap();
            let mut out = Vec::new();
            for pattern in &argv[2..] {
                for (name, value) in config.get_params(pattern) {
                    out.push(Frame::bulk(name.into_bytes()));
                    out.push(Frame::bulk(value.into_bytes()));
                }
            }
            Ok(Frame::Array(out).into())
        }
        b"SET" => {
            if argv.len() < 4 || argv.len() % 2 != 0 {
                return Err(ServerError::WrongArity("config|set".into()));
            }
            let mut config = server.config.write().unwrap();
            for pair in argv[2..].chunks(2) {
                config.set_param(
                    &String::from_utf8_lossy(&pair[0]),
                    &String::from_utf8_lossy(&pair[1]),
                )?;
            }
            Ok(Frame::ok().into())
        }
        b"REWRITE" => Ok(Frame::ok().into()),
        b"RESETSTAT" => {
            server.stats.total_commands.store(0, Ordering::SeqCst);
            server.stats.total_connections.store(0, Ordering::SeqCst);
            Ok(Frame::ok().into())
        }
        _ => Err(ServerError::other(format!(
            "Unknown CONFIG subcommand or wrong number of arguments for '{}'",
            String::from_utf8_lossy(&argv[1])
        ))),
    }
}

pub fn debug_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    match argv[1].to_ascii_uppercase().as_slice() {
        b"SLEEP" => {
            let seconds = argv
                .get(2)
                .and_then(|a| parse_f64(a))
                .filter(|s| *s >= 0.0)
                .ok_or(ServerError::NotFloat)?;
            // a hard sleep on the connection thread, pipelined or not
            thread::sleep(Duration::from_secs_f64(seconds));
            Ok(Frame::ok().into())
        }
        b"OBJECT" => {
            let key = argv.get(2).ok_or_else(|| ServerError::WrongArity("debug".into()))?;
            let Some(meta) = server.store.meta(key)? else {
                return Err(ServerError::NoSuchKey);
            };
            Ok(Frame::Simple(format!(
                "Value at:0x0 refcount:1 encoding:{} serializedlength:{} lru:0 lru_seconds_idle:0",
                meta.tag.type_name(),
                server.store.memory_usage(key)?.unwrap_or(0),
            ))
            .into())
        }
        b"JMAP" | b"SET-ACTIVE-EXPIRE" | b"QUICKLIST-PACKED-THRESHOLD" | b"STRINGMATCH-LEN"
        | b"CHANGE-REPL-ID" => Ok(Frame::ok().into()),
        _ => Err(ServerError::other(format!(
            "DEBUG subcommand '{}' not supported",
            String::from_utf8_lossy(&argv[1])
        ))),
    }
}

pub fn command_command(
    _server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let spec_frame = |spec: &commands::CommandSpec| {
        let mut flags = vec![];
        if spec.flags & commands::CMD_WRITE != 0 {
            flags.push(Frame::Simple("write".into()));
        } else {
            flags.push(Frame::Simple("readonly".into()));
        }
        if spec.flags & commands::CMD_ADMIN != 0 {
            flags.push(Frame::Simple("admin".into()));
        }
        Frame::Array(vec![
            Frame::bulk(spec.name.to_lowercase().into_bytes()),
            Frame::Integer(spec.arity as i64),
            Frame::Array(flags),
            Frame::Integer(spec.first_key as i64),
            Frame::Integer(spec.last_key as i64),
            Frame::Integer(spec.key_step as i64),
        ])
    };
    match argv.get(1).map(|s| s.to_ascii_uppercase()) {
        None => Ok(Frame::Array(commands::all_specs().map(|s| spec_frame(s)).collect()).into()),
        Some(sub) => match sub.as_slice() {
            b"COUNT" => Ok(Frame::Integer(commands::command_count() as i64).into()),
            b"DOCS" => Ok(Frame::Array(vec![]).into()),
            b"INFO" => {
                let mut out = Vec::new();
                for name in &argv[2..] {
                    let name = String::from_utf8_lossy(name).to_ascii_uppercase();
                    out.push(match commands::lookup(&name) {
                        Some(spec) => spec_frame(spec),
                        None => Frame::NullArray,
                    });
                }
                Ok(Frame::Array(out).into())
            }
            _ => Err(ServerError::other(format!(
                "Unknown subcommand or wrong number of arguments for '{}'",
                String::from_utf8_lossy(&argv[1])
            ))),
        },
    }
}

fn info_text(server: &Arc<Server>, sections: &[String]) -> String {
    let wants = |name: &str| {
        sections.is_empty()
            || sections.iter().any(|s| s.eq_ignore_ascii_case(name))
            || sections.iter().any(|s| s.eq_ignore_ascii_case("everything"))
            || sections.iter().any(|s| s.eq_ignore_ascii_case("all"))
    };
    let mut out = String::new();
    let config = server.config.read().unwrap();
    if wants("server") {
        out.push_str("# Server\r\n");
        out.push_str(&format!("redis_version:{}\r\n", COMPAT_VERSION));
        out.push_str(&format!("sledis_version:{}\r\n", SLEDIS_VERSION));
        out.push_str("redis_mode:standalone\r\n");
        out.push_str(&format!("os:{}\r\n", std::env::consts::OS));
        out.push_str(&format!("process_id:{}\r\n", process::id()));
        out.push_str(&format!("run_id:{}\r\n", server.run_id));
        out.push_str(&format!("tcp_port:{}\r\n", server.listen_port()));
        out.push_str(&format!(
            "uptime_in_seconds:{}\r\n",
            server.start_time.elapsed().as_secs()
        ));
        out.push_str("\r\n");
    }
    if wants("clients") {
        out.push_str("# Clients\r\n");
        out.push_str(&format!(
            "connected_clients:{}\r\n",
            server.clients.lock().unwrap().len()
        ));
        out.push_str("blocked_clients:0\r\n\r\n");
    }
    if wants("memory") {
        out.push_str("# Memory\r\n");
        let on_disk = server.store.db().size_on_disk().unwrap_or(0);
        out.push_str(&format!("used_memory:{}\r\n", on_disk));
        out.push_str(&format!("used_memory_human:{}K\r\n", on_disk / 1024));
        out.push_str(&format!("maxmemory:{}\r\n", config.maxmemory));
        out.push_str("\r\n");
    }
    if wants("persistence") {
        out.push_str("# Persistence\r\n");
        out.push_str("loading:0\r\n");
        out.push_str(&format!(
            "rdb_changes_since_last_save:{}\r\n",
            server.store.dirty.load(Ordering::SeqCst)
        ));
        out.push_str(&format!(
            "rdb_last_save_time:{}\r\n",
            server.last_save_ms.load(Ordering::SeqCst) / 1000
        ));
        out.push_str("rdb_last_bgsave_status:ok\r\n");
        out.push_str("aof_enabled:0\r\n\r\n");
    }
    if wants("stats") {
        out.push_str("# Stats\r\n");
        out.push_str(&format!(
            "total_connections_received:{}\r\n",
            server.stats.total_connections.load(Ordering::Relaxed)
        ));
        out.push_str(&format!(
            "total_commands_processed:{}\r\n",
            server.stats.total_commands.load(Ordering::Relaxed)
        ));
        out.push_str(&format!(
            "expired_keys:{}\r\n",
            server.store.expired_total.load(Ordering::Relaxed)
        ));
        out.push_str("evicted_keys:0\r\n");
        out.push_str(&format!(
            "pubsub_channels:{}\r\n",
            server.pubsub.channels_matching(None).len()
        ));
        out.push_str(&format!(
            "pubsub_patterns:{}\r\n",
            server.pubsub.pattern_count()
        ));
        out.push_str("\r\n");
    }
    if wants("replication") {
        out.push_str("# Replication\r\n");
        let role = server.repl.role();
        out.push_str(&format!(
            "role:{}\r\n",
            if role == Role::Master { "master" } else { "slave" }
        ));
        if role == Role::Replica {
            if let Some((host, port)) = server.repl.master_addr.lock().unwrap().clone() {
                out.push_str(&format!("master_host:{}\r\n", host));
                out.push_str(&format!("master_port:{}\r\n", port));
            }
            out.push_str(&format!(
                "master_link_status:{}\r\n",
                server.repl.link_status.lock().unwrap().name()
            ));
            out.push_str(&format!(
                "slave_repl_offset:{}\r\n",
                server.repl.applied_offset.load(Ordering::SeqCst)
            ));
        }
        let replicas = server.repl.replicas.lock().unwrap();
        out.push_str(&format!(
            "connected_slaves:{}\r\n",
            replicas.iter().filter(|r| !r.is_closed()).count()
        ));
        for (i, replica) in replicas.iter().filter(|r| !r.is_closed()).enumerate() {
            let (host, _) = replica
                .addr
                .rsplit_once(':')
                .unwrap_or((replica.addr.as_str(), "0"));
            out.push_str(&format!(
                "slave{}:ip={},port={},state=online,offset={},lag=0\r\n",
                i,
                host,
                replica.listening_port.load(Ordering::SeqCst),
                replica.ack_offset.load(Ordering::SeqCst),
            ));
        }
        drop(replicas);
        out.push_str(&format!("master_replid:{}\r\n", server.repl.replid));
        out.push_str(&format!(
            "master_repl_offset:{}\r\n",
            server.repl.master_repl_offset()
        ));
        out.push_str(&format!(
            "repl_backlog_size:{}\r\n",
            config.repl_backlog_size
        ));
        out.push_str("\r\n");
    }
    if wants("cpu") {
        out.push_str("# CPU\r\nused_cpu_sys:0.0\r\nused_cpu_user:0.0\r\n\r\n");
    }
    if wants("cluster") {
        out.push_str("# Cluster\r\n");
        out.push_str(&format!(
            "cluster_enabled:{}\r\n\r\n",
            config.cluster_enabled as u8
        ));
    }
    if wants("keyspace") {
        out.push_str("# Keyspace\r\n");
        let keys = server.store.key_count();
        if keys > 0 {
            out.push_str(&format!(
                "db0:keys={},expires={},avg_ttl=0\r\n",
                keys,
                server.store.expires_count()
            ));
        }
    }
    out
}

pub fn info_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let sections: Vec<String> = argv[1..]
        .iter()
        .map(|s| String::from_utf8_lossy(s).into_owned())
        .collect();
    Ok(Frame::bulk(info_text(server, &sections).into_bytes()).into())
}

pub fn dbsize_command(
    server: &Arc<Server>,
    _session: &mut Session,
    _argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    Ok(Frame::Integer(server.store.key_count() as i64).into())
}

pub fn time_command(
    _server: &Arc<Server>,
    _session: &mut Session,
    _argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let us = crate::util::now_us();
    Ok(Frame::Array(vec![
        Frame::bulk((us / 1_000_000).to_string().into_bytes()),
        Frame::bulk((us % 1_000_000).to_string().into_bytes()),
    ])
    .into())
}

pub fn lastsave_command(
    server: &Arc<Server>,
    _session: &mut Session,
    _argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    Ok(Frame::Integer((server.last_save_ms.load(Ordering::SeqCst) / 1000) as i64).into())
}

pub fn save_command(
    server: &Arc<Server>,
    session: &mut Session,
    _argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let _guard = if session.in_exec {
        None
    } else {
        Some(server.engine_lock.read().unwrap())
    };
    server.save_snapshot()?;
    Ok(Frame::ok().into())
}

pub fn bgsave_command(
    server: &Arc<Server>,
    _session: &mut Session,
    _argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let background = server.clone();
    thread::Builder::new()
        .name("bgsave".into())
        .spawn(move || {
            let _guard = background.engine_lock.read().unwrap();
            if let Err(e) = background.save_snapshot() {
                warn!("background save failed: {}", e);
            }
        })
        .map_err(|e| ServerError::Internal(e.to_string()))?;
    Ok(Frame::Simple("Background saving started".into()).into())
}

pub fn shutdown_command(
    server: &Arc<Server>,
    session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let nosave = argv
        .get(1)
        .map_or(false, |a| a.eq_ignore_ascii_case(b"NOSAVE"));
    server.shutdown.store(true, Ordering::SeqCst);
    if !nosave {
        let _guard = if session.in_exec {
            None
        } else {
            Some(server.engine_lock.read().unwrap())
        };
        if let Err(e) = server.save_snapshot() {
            warn!("shutdown save failed: {}", e);
        }
    }
    info!("server is now ready to exit, bye bye...");
    process::exit(0);
}

pub fn flushdb_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    if let Some(mode) = argv.get(1) {
        let mode = mode.to_ascii_uppercase();
        if mode.as_slice() != b"ASYNC" && mode.as_slice() != b"SYNC" {
            return Err(ServerError::Syntax);
        }
    }
    server.store.flush_all()?;
    Ok(Frame::ok().into())
}

pub fn flushall_command(
    server: &Arc<Server>,
    session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    flushdb_command(server, session, argv)
}

pub fn memory_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    match argv[1].to_ascii_uppercase().as_slice() {
        b"USAGE" => {
            let key = argv.get(2).ok_or_else(|| ServerError::WrongArity("memory".into()))?;
            // SAMPLES is accepted and ignored, the estimate is exact
            Ok(match server.store.memory_usage(key)? {
                Some(bytes) => Frame::Integer(bytes as i64).into(),
                None => Frame::Null.into(),
            })
        }
        b"DOCTOR" => Ok(Frame::bulk(&b"Sam, I have inspected this instance and everything looks fine."[..]).into()),
        b"STATS" => {
            let on_disk = server.store.db().size_on_disk().unwrap_or(0);
            Ok(Frame::Array(vec![
                Frame::bulk(&b"keys.count"[..]),
                Frame::Integer(server.store.key_count() as i64),
                Frame::bulk(&b"dataset.bytes"[..]),
                Frame::Integer(on_disk as i64),
            ])
            .into())
        }
        b"HELP" => Ok(Frame::Array(vec![
            Frame::bulk(&b"MEMORY USAGE <key> [SAMPLES <count>]"[..]),
            Frame::bulk(&b"MEMORY DOCTOR"[..]),
            Frame::bulk(&b"MEMORY STATS"[..]),
        ])
        .into()),
        _ => Err(ServerError::other(format!(
            "Unknown subcommand or wrong number of arguments for '{}'. Try MEMORY HELP.",
            String::from_utf8_lossy(&argv[1])
        ))),
    }
}

pub fn slowlog_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    match argv[1].to_ascii_uppercase().as_slice() {
        b"GET" => {
            let count = match argv.get(2) {
                Some(raw) => parse_i64(raw).ok_or(ServerError::NotInteger)?,
                None => 10,
            };
            let slowlog = server.slowlog.lock().unwrap();
            let take = if count < 0 {
                slowlog.entries.len()
            } else {
                (count as usize).min(slowlog.entries.len())
            };
            let out = slowlog
                .entries
                .iter()
                .take(take)
                .map(|entry| {
                    Frame::Array(vec![
                        Frame::Integer(entry.id as i64),
                        Frame::Integer(entry.timestamp as i64),
                        Frame::Integer(entry.duration_us as i64),
                        Frame::Array(entry.argv.iter().map(|a| Frame::Bulk(a.clone())).collect()),
                        Frame::bulk(entry.client_addr.clone().into_bytes()),
                        Frame::bulk(entry.client_name.clone().into_bytes()),
                    ])
                })
                .collect();
            Ok(Frame::Array(out).into())
        }
        b"LEN" => Ok(Frame::Integer(server.slowlog.lock().unwrap().entries.len() as i64).into()),
        b"RESET" => {
            server.slowlog.lock().unwrap().reset();
            Ok(Frame::ok().into())
        }
        b"HELP" => Ok(Frame::Array(vec![
            Frame::bulk(&b"SLOWLOG GET [count]"[..]),
            Frame::bulk(&b"SLOWLOG LEN"[..]),
            Frame::bulk(&b"SLOWLOG RESET"[..]),
        ])
        .into()),
        _ => Err(ServerError::other(format!(
            "Unknown SLOWLOG subcommand or wrong number of arguments for '{}'",
            String::from_utf8_lossy(&argv[1])
        ))),
    }
}

pub fn lolwut_command(
    _server: &Arc<Server>,
    _session: &mut Session,
    _argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    Ok(Frame::bulk(
        format!("sledis ver. {} says: the cube spins on.\n", SLEDIS_VERSION).into_bytes(),
    )
    .into())
}
