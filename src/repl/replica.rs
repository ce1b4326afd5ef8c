//! Replica side of replication: connect to the master, walk the PSYNC
//! handshake, ingest the snapshot on a full resync, then apply the
//! streamed command flow and acknowledge offsets.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{info, warn};

use crate::client::Session;
use crate::commands;
use crate::errors::ServerError;
use crate::repl::{LinkStatus, Role};
use crate::resp::{self, Frame, Limits};
use crate::server::Server;
use crate::snapshot;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(5);
const ACK_INTERVAL: Duration = Duration::from_secs(1);

/// REPLICAOF host port: become a replica of the given master. A fresh
/// driver thread takes over; any previous one notices the generation bump
/// and dies.
pub fn start(server: &Arc<Server>, host: String, port: u16) {
    *server.repl.role.write().unwrap() = Role::Replica;
    *server.repl.master_addr.lock().unwrap() = Some((host.clone(), port));
    *server.repl.link_status.lock().unwrap() = LinkStatus::Connecting;
    let generation = server.repl.link_generation.fetch_add(1, Ordering::SeqCst) + 1;
    let server = server.clone();
    thread::Builder::new()
        .name("replica-link".into())
        .spawn(move || run_loop(server, host, port, generation))
        .expect("spawn replica link thread");
}

/// REPLICAOF NO ONE: stop following and serve writes again.
pub fn promote_to_master(server: &Arc<Server>) {
    server.repl.link_generation.fetch_add(1, Ordering::SeqCst);
    *server.repl.role.write().unwrap() = Role::Master;
    *server.repl.master_addr.lock().unwrap() = None;
    *server.repl.link_status.lock().unwrap() = LinkStatus::Down;
    info!("MASTER MODE enabled");
}

fn current(server: &Server, generation: u64) -> bool {
    server.repl.link_generation.load(Ordering::SeqCst) == generation
        && !server.shutdown.load(Ordering::SeqCst)
}

fn run_loop(server: Arc<Server>, host: String, port: u16, generation: u64) {
    let mut backoff = INITIAL_BACKOFF;
    while current(&server, generation) {
        *server.repl.link_status.lock().unwrap() = LinkStatus::Connecting;
        match sync_once(&server, &host, port, generation) {
            Ok(()) => {
                // clean exit: superseded or shutting down
                return;
            }
            Err(e) => {
                if !current(&server, generation) {
                    return;
                }
                warn!("MASTER <-> REPLICA sync error: {}, retrying in {:?}", e, backoff);
                *server.repl.link_status.lock().unwrap() = LinkStatus::Down;
                thread::sleep(backoff);
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }
    }
}

/// Buffered framed reader over the master link.
struct Link {
    stream: TcpStream,
    buf: Vec<u8>,
    limits: Limits,
}

impl Link {
    fn send_command(&mut self, argv: &[&[u8]]) -> Result<(), ServerError> {
        let owned: Vec<Vec<u8>> = argv.iter().map(|a| a.to_vec()).collect();
        self.stream.write_all(&resp::encode_command(&owned))?;
        Ok(())
    }

    fn fill(&mut self) -> Result<usize, ServerError> {
        let mut chunk = [0u8; 16 * 1024];
        match self.stream.read(&mut chunk) {
            Ok(0) => Err(ServerError::other("connection closed by master")),
            Ok(n) => {
                self.buf.extend_from_slice(&chunk[..n]);
                Ok(n)
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                Ok(0)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn read_frame(&mut self, deadline: Instant) -> Result<Frame, ServerError> {
        loop {
            if let Some((frame, used)) = resp::parse_frame(&self.buf, &self.limits)
                .map_err(|e| ServerError::other(e.to_string()))?
            {
                self.buf.drain(..used);
                return Ok(frame);
            }
            if Instant::now() >= deadline {
                return Err(ServerError::other("timeout waiting for master reply"));
            }
            self.fill()?;
        }
    }

    /// Read a `$<len>\r\n<bytes>` payload (no trailing CRLF), the framing
    /// the master uses for the snapshot transfer.
    fn read_snapshot_bulk(&mut self, deadline: Instant) -> Result<Vec<u8>, ServerError> {
        loop {
            if let Some(nl) = self.buf.iter().position(|&b| b == b'\n') {
                if self.buf[0] != b'$' {
                    return Err(ServerError::other("bad snapshot bulk header"));
                }
                let line = &self.buf[1..nl];
                let line = if line.ends_with(b"\r") { &line[..line.len() - 1] } else { line };
                let len: usize = std::str::from_utf8(line)
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| ServerError::other("bad snapshot bulk length"))?;
                self.buf.drain(..nl + 1);
                while self.buf.len() < len {
                    if Instant::now() >= deadline {
                        return Err(ServerError::other("timeout reading snapshot"));
                    }
                    self.fill()?;
                }
                let payload = self.buf[..len].to_vec();
                self.buf.drain(..len);
                return Ok(payload);
            }
            if Instant::now() >= deadline {
                return Err(ServerError::other("timeout reading snapshot header"));
            }
            self.fill()?;
        }
    }
}

fn expect_ok_ish(frame: &Frame, step: &str) -> Result<(), ServerError> {
    match frame {
        Frame::Simple(_) => Ok(()),
        other => Err(ServerError::other(format!(
            "unexpected reply in {} handshake step: {:?}",
            step, other
        ))),
    }
}

fn sync_once(
    server: &Arc<Server>,
    host: &str,
    port: u16,
    generation: u64,
) -> Result<(), ServerError> {
    let addr = format!("{}:{}", host, port);
    info!("Connecting to MASTER {}", addr);
    let stream = TcpStream::connect(&addr)?;
    stream.set_nodelay(true).ok();
    stream
        .set_read_timeout(Some(Duration::from_millis(100)))
        .ok();
    let mut link = Link {
        stream,
        buf: Vec::new(),
        limits: Limits::default(),
    };

    // PING -> REPLCONF listening-port -> REPLCONF capa -> PSYNC
    let deadline = || Instant::now() + HANDSHAKE_TIMEOUT;
    link.send_command(&[b"PING"])?;
    expect_ok_ish(&link.read_frame(deadline())?, "PING")?;

    let my_port = server.listen_port().to_string();
    link.send_command(&[b"REPLCONF", b"listening-port", my_port.as_bytes()])?;
    expect_ok_ish(&link.read_frame(deadline())?, "REPLCONF listening-port")?;

    link.send_command(&[b"REPLCONF", b"capa", b"psync2"])?;
    expect_ok_ish(&link.read_frame(deadline())?, "REPLCONF capa")?;

    let (known_replid, known_offset) = {
        let replid = server.repl.master_replid.lock().unwrap().clone();
        match replid {
            Some(id) => (id, server.repl.applied_offset.load(Ordering::SeqCst).to_string()),
            None => ("?".to_string(), "-1".to_string()),
        }
    };
    link.send_command(&[b"PSYNC", known_replid.as_bytes(), known_offset.as_bytes()])?;
    let psync_reply = link.read_frame(deadline())?;
    let Frame::Simple(line) = psync_reply else {
        return Err(ServerError::other("unexpected PSYNC reply type"));
    };

    if let Some(rest) = line.strip_prefix("FULLRESYNC ") {
        let mut parts = rest.split_whitespace();
        let replid = parts
            .next()
            .ok_or_else(|| ServerError::other("malformed FULLRESYNC"))?
            .to_string();
        let offset: u64 = parts
            .next()
            .and_then(|o| o.parse().ok())
            .ok_or_else(|| ServerError::other("malformed FULLRESYNC offset"))?;
        *server.repl.link_status.lock().unwrap() = LinkStatus::Syncing;
        info!("Full resync from master: {} at offset {}", replid, offset);
        let payload = link.read_snapshot_bulk(Instant::now() + Duration::from_secs(60))?;
        {
            let _guard = server.engine_lock.write().unwrap();
            server.store.flush_all()?;
            let loaded = snapshot::install_snapshot(&server.store, &payload)?;
            info!("MASTER <-> REPLICA sync: loaded {} keys", loaded);
        }
        *server.repl.master_replid.lock().unwrap() = Some(replid);
        server.repl.applied_offset.store(offset, Ordering::SeqCst);
    } else if line.starts_with("CONTINUE") {
        info!("Successful partial resynchronization with master");
    } else {
        return Err(ServerError::other(format!("unexpected PSYNC reply: {}", line)));
    }

    *server.repl.link_status.lock().unwrap() = LinkStatus::Up;
    streaming_loop(server, &mut link, generation)
}

/// Apply the command stream. Each applied frame advances the offset by its
/// wire length; an ACK goes back every second and on GETACK.
fn streaming_loop(
    server: &Arc<Server>,
    link: &mut Link,
    generation: u64,
) -> Result<(), ServerError> {
    let mut session = Session::master_link(server);
    let mut last_ack = Instant::now();
    loop {
        if !current(server, generation) {
            return Ok(());
        }
        loop {
            let parsed = resp::parse_command(&link.buf, &link.limits)
                .map_err(|e| ServerError::other(e.to_string()))?;
            let Some((argv, used)) = parsed else { break };
            link.buf.drain(..used);
            let offset = server
                .repl
                .applied_offset
                .fetch_add(used as u64, Ordering::SeqCst)
                + used as u64;
            if argv.is_empty() {
                continue;
            }
            if argv[0].eq_ignore_ascii_case(b"REPLCONF")
                && argv.len() >= 2
                && argv[1].eq_ignore_ascii_case(b"GETACK")
            {
                send_ack(link, offset)?;
                last_ack = Instant::now();
                continue;
            }
            if argv[0].eq_ignore_ascii_case(b"PING") {
                continue;
            }
            commands::dispatch(server, &mut session, &argv);
        }
        if last_ack.elapsed() >= ACK_INTERVAL {
            send_ack(link, server.repl.applied_offset.load(Ordering::SeqCst))?;
            last_ack = Instant::now();
        }
        link.fill()?;
    }
}

fn send_ack(link: &mut Link, offset: u64) -> Result<(), ServerError> {
    let offset = offset.to_string();
    link.send_command(&[b"REPLCONF", b"ACK", offset.as_bytes()])
}
