//! Master side of replication: propagate effectful commands to the backlog
//! and every live replica, and service PSYNC with a partial or full resync.

use std::io::Read;
use std::net::TcpStream;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{info, warn};

use crate::client::ClientHandle;
use crate::resp::{self, Limits};
use crate::server::Server;
use crate::snapshot;
use crate::util::parse_u64;

/// Serialize an executed command back to RESP2, append it to the backlog
/// and fan it out to every replica's output buffer. Runs under the engine's
/// exclusive lock, which is what keeps the backlog byte order equal to the
/// effect order.
pub fn propagate(server: &Server, argv: &[Vec<u8>]) {
    let bytes = resp::encode_command(argv);
    server.repl.backlog.lock().unwrap().append(&bytes);
    let mut lagging: Vec<u64> = Vec::new();
    {
        let replicas = server.repl.replicas.lock().unwrap();
        for replica in replicas.iter() {
            if !replica.push(bytes.clone()) {
                lagging.push(replica.client_id);
            }
        }
    }
    for id in lagging {
        warn!("replica client #{} overflowed its output buffer, closing", id);
        if let Some(client) = server.clients.lock().unwrap().get(&id) {
            client.request_kill();
        }
    }
    server.repl.drop_closed_replicas();
}

/// Take over a connection that issued PSYNC. Decides partial vs full
/// resync, streams the snapshot when needed, then keeps reading ACK
/// offsets until the replica goes away.
pub fn serve_replica(
    server: &Arc<Server>,
    client: &Arc<ClientHandle>,
    mut stream: TcpStream,
    req_replid: &str,
    req_offset: i64,
) {
    client.is_replica_link.store(true, Ordering::SeqCst);
    let replica = Arc::new(super::ReplicaHandle::new(
        client.id,
        client.addr.clone(),
        0,
    ));
    replica
        .listening_port
        .store(client.replica_port.load(Ordering::SeqCst), Ordering::SeqCst);

    // Everything up to registration happens under the exclusive lock so no
    // write can slip between the snapshot/backlog cut and the fan-out list.
    // Partial-resync backlog bytes enter the outbox under the same lock,
    // keeping them ahead of any write propagated after registration.
    let mut full: Option<(u64, Vec<u8>)> = None;
    let mut is_partial = false;
    {
        let _guard = server.engine_lock.write().unwrap();
        let backlog = server.repl.backlog.lock().unwrap();
        let mut partial: Option<Vec<u8>> = None;
        if req_offset >= 0 && req_replid == server.repl.replid {
            partial = backlog.range_from(req_offset as u64);
        }
        let end_offset = backlog.end_offset();
        drop(backlog);
        if let Some(bytes) = partial {
            is_partial = true;
            replica.ack_offset.store(req_offset as u64, Ordering::SeqCst);
            replica.push(bytes);
        } else {
            match snapshot::serialize_snapshot(&server.store) {
                Ok(bytes) => full = Some((end_offset, bytes)),
                Err(e) => {
                    warn!("full resync failed: {}", e);
                    return;
                }
            }
            replica.ack_offset.store(end_offset, Ordering::SeqCst);
        }
        server.repl.replicas.lock().unwrap().push(replica.clone());
    }

    let header_ok = if is_partial {
        info!(
            "partial resynchronization accepted for replica {} from offset {}",
            client.addr, req_offset
        );
        client
            .send_bytes(format!("+CONTINUE {}\r\n", server.repl.replid).as_bytes())
            .is_ok()
    } else if let Some((offset, bytes)) = full {
        info!(
            "full resynchronization requested by replica {} ({} snapshot bytes)",
            client.addr,
            bytes.len()
        );
        let mut payload = format!("+FULLRESYNC {} {}\r\n", server.repl.replid, offset).into_bytes();
        payload.extend_from_slice(format!("${}\r\n", bytes.len()).as_bytes());
        payload.extend_from_slice(&bytes);
        client.send_bytes(&payload).is_ok()
    } else {
        false
    };
    if !header_ok {
        replica.close();
        server.repl.drop_closed_replicas();
        return;
    }

    // Feeder drains the outbox to the socket; this thread turns into the
    // ACK reader.
    let feeder_client = client.clone();
    let feeder_replica = replica.clone();
    let feeder = thread::spawn(move || {
        while let Some(chunk) = feeder_replica.pop_wait(Duration::from_millis(100)) {
            if feeder_client.send_bytes(&chunk).is_err() {
                feeder_replica.close();
                break;
            }
        }
        if feeder_replica.is_closed() {
            feeder_client.request_kill();
        }
    });

    ack_loop(server, client, &replica, &mut stream);
    replica.close();
    feeder.join().ok();
    server.repl.drop_closed_replicas();
    info!("replica {} disconnected", client.addr);
}

fn ack_loop(
    server: &Arc<Server>,
    client: &Arc<ClientHandle>,
    replica: &Arc<super::ReplicaHandle>,
    stream: &mut TcpStream,
) {
    stream
        .set_read_timeout(Some(Duration::from_millis(200)))
        .ok();
    let limits = Limits::default();
    let mut buf: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        if client.kill.load(Ordering::SeqCst)
            || replica.is_closed()
            || server.shutdown.load(Ordering::SeqCst)
        {
            return;
        }
        match stream.read(&mut chunk) {
            Ok(0) => return,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(_) => return,
        }
        loop {
            match resp::parse_command(&buf, &limits) {
                Ok(Some((argv, used))) => {
                    buf.drain(..used);
                    if argv.len() == 3
                        && argv[0].eq_ignore_ascii_case(b"REPLCONF")
                        && argv[1].eq_ignore_ascii_case(b"ACK")
                    {
                        if let Some(offset) = parse_u64(&argv[2]) {
                            replica.ack_offset.store(offset, Ordering::SeqCst);
                        }
                    }
                }
                Ok(None) => break,
                Err(_) => return,
            }
        }
    }
}
