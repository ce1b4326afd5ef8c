//! Replication control surface: REPLICAOF/SLAVEOF, the PSYNC entry point
//! (which hands the connection to the master driver), REPLCONF, and WAIT.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use log::info;

use crate::client::Session;
use crate::commands::Reply;
use crate::errors::ServerError;
use crate::repl::replica;
use crate::resp::Frame;
use crate::server::Server;
use crate::util::parse_u64;

pub fn replicaof_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    if argv[1].eq_ignore_ascii_case(b"NO") && argv[2].eq_ignore_ascii_case(b"ONE") {
        if !server.repl.is_master() {
            replica::promote_to_master(server);
        }
        return Ok(Frame::ok().into());
    }
    let host = String::from_utf8_lossy(&argv[1]).into_owned();
    let port: u16 = parse_u64(&argv[2])
        .filter(|p| *p > 0 && *p < 65536)
        .ok_or_else(|| ServerError::other("Invalid master port"))?
        as u16;
    info!("REPLICAOF {}:{} enabled", host, port);
    replica::start(server, host, port);
    Ok(Frame::ok().into())
}

/// PSYNC <replid> <offset>. The handler only records the request; the
/// connection loop hands the socket over to the master replication driver,
/// which answers with +CONTINUE or +FULLRESYNC.
pub fn psync_command(
    _server: &Arc<Server>,
    session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let replid = String::from_utf8_lossy(&argv[1]).into_owned();
    let offset: i64 = std::str::from_utf8(&argv[2])
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(ServerError::NotInteger)?;
    session.psync_request = Some((replid, offset));
    Ok(Reply::None)
}

pub fn replconf_command(
    _server: &Arc<Server>,
    session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    match argv[1].to_ascii_lowercase().as_slice() {
        b"listening-port" => {
            if let Some(port) = argv.get(2).and_then(|p| parse_u64(p)) {
                session.handle.replica_port.store(port, Ordering::SeqCst);
            }
            Ok(Frame::ok().into())
        }
        b"capa" | b"ip-address" | b"client-id" => Ok(Frame::ok().into()),
        // ACKs carry no reply; they normally arrive on the replica feed
        // socket and are consumed there
        b"ack" => Ok(Reply::None),
        b"getack" => Ok(Frame::ok().into()),
        _ => Err(ServerError::other(format!(
            "Unrecognized REPLCONF option: {}",
            String::from_utf8_lossy(&argv[1])
        ))),
    }
}

/// Asynchronous replication makes no synchronous durability promise, so
/// WAIT reports zero acknowledged replicas rather than blocking.
pub fn wait_command(
    _server: &Arc<Server>,
    _session: &mut Session,
    _argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    Ok(Frame::Integer(0).into())
}
