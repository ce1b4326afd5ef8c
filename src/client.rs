//! Per-connection state and the connection thread's read-dispatch-reply
//! loop. Replies for a pipelined batch are encoded into one buffer and
//! flushed with a single write.

use std::collections::HashSet;
use std::io::Read;
use std::io::Write;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Buf, BytesMut};
use log::{debug, warn};

use crate::commands::{self, Reply};
use crate::repl::master;
use crate::resp::{self, Frame, Limits};
use crate::server::Server;
use crate::util::now_ms;

const READ_SLICE: Duration = Duration::from_millis(200);
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// The shareable half of a connection: everything other threads (pub/sub
/// publishers, CLIENT KILL, the replica feeder) need to reach it.
pub struct ClientHandle {
    pub id: u64,
    pub addr: String,
    pub name: Mutex<String>,
    pub created_ms: u64,
    pub last_command: Mutex<String>,
    writer: Mutex<Option<TcpStream>>,
    pub kill: AtomicBool,
    pub sub_count: AtomicU64,
    pub is_replica_link: AtomicBool,
    /// REPLCONF listening-port, once the peer announced one.
    pub replica_port: AtomicU64,
}

impl ClientHandle {
    fn new(id: u64, addr: String, writer: Option<TcpStream>) -> Arc<ClientHandle> {
        Arc::new(ClientHandle {
            id,
            addr,
            name: Mutex::new(String::new()),
            created_ms: now_ms(),
            last_command: Mutex::new(String::new()),
            writer: Mutex::new(writer),
            kill: AtomicBool::new(false),
            sub_count: AtomicU64::new(0),
            is_replica_link: AtomicBool::new(false),
            replica_port: AtomicU64::new(0),
        })
    }

    /// Commands are always executed in the context of a client; loaders and
    /// the master link use a socketless one whose replies go nowhere.
    pub fn detached() -> Arc<ClientHandle> {
        ClientHandle::new(0, "<detached>".to_string(), None)
    }

    pub fn send_bytes(&self, bytes: &[u8]) -> std::io::Result<()> {
        let mut writer = self.writer.lock().unwrap();
        match writer.as_mut() {
            Some(stream) => {
                stream.write_all(bytes)?;
                Ok(())
            }
            None => Ok(()),
        }
    }

    pub fn send_frame(&self, frame: &Frame) -> std::io::Result<()> {
        self.send_bytes(&frame.encode())
    }

    pub fn request_kill(&self) {
        self.kill.store(true, Ordering::SeqCst);
    }
}

/// Client MULTI/EXEC state: commands queued verbatim, plus the flag a
/// failed queueing raises so EXEC aborts.
pub struct MultiState {
    pub queue: Vec<Vec<Vec<u8>>>,
    pub errored: bool,
}

/// Connection-private state driven by the dispatcher.
pub struct Session {
    pub handle: Arc<ClientHandle>,
    pub authenticated: bool,
    pub multi: Option<MultiState>,
    /// WATCHed keys with the revision seen at WATCH time.
    pub watch: Vec<(Vec<u8>, u64)>,
    pub subscriptions: HashSet<Vec<u8>>,
    pub psubscriptions: HashSet<Vec<u8>>,
    /// True on the session the replica driver applies the master stream
    /// through: bypasses the READONLY gate, never re-propagates.
    pub is_master_link: bool,
    /// True while EXEC drains its queue: blocking commands answer
    /// immediately and lock-managing handlers trust the held lock.
    pub in_exec: bool,
    pub should_close: bool,
    /// Set by the PSYNC handler; the connection loop hands the socket to
    /// the master replication driver.
    pub psync_request: Option<(String, i64)>,
    /// Commands to propagate in place of the verbatim request (XADD with a
    /// generated id, expiries rewritten absolute, SPOP as SREM, ...).
    pub prop_override: Option<Vec<Vec<Vec<u8>>>>,
    /// XREAD's `$` resolves against the stream tops once, at block time;
    /// the resolved ids are pinned here across blocking retries.
    pub block_ids: Option<Vec<(u64, u64)>>,
}

impl Session {
    pub fn new(handle: Arc<ClientHandle>) -> Session {
        Session {
            handle,
            authenticated: false,
            multi: None,
            watch: Vec::new(),
            subscriptions: HashSet::new(),
            psubscriptions: HashSet::new(),
            is_master_link: false,
            in_exec: false,
            should_close: false,
            psync_request: None,
            prop_override: None,
            block_ids: None,
        }
    }

    pub fn master_link(_server: &Arc<Server>) -> Session {
        let mut session = Session::new(ClientHandle::detached());
        session.authenticated = true;
        session.is_master_link = true;
        session
    }

    pub fn subscribed(&self) -> bool {
        !self.subscriptions.is_empty() || !self.psubscriptions.is_empty()
    }

    pub fn sub_total(&self) -> u64 {
        (self.subscriptions.len() + self.psubscriptions.len()) as u64
    }
}

pub fn serve_connection(server: Arc<Server>, mut stream: TcpStream) {
    let addr = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    stream.set_nodelay(true).ok();
    stream.set_read_timeout(Some(READ_SLICE)).ok();
    stream.set_write_timeout(Some(WRITE_TIMEOUT)).ok();
    let writer = match stream.try_clone() {
        Ok(w) => w,
        Err(e) => {
            warn!("can't clone client socket: {}", e);
            return;
        }
    };
    let handle = ClientHandle::new(server.next_client_id(), addr.clone(), Some(writer));
    server
        .clients
        .lock()
        .unwrap()
        .insert(handle.id, handle.clone());
    debug!("accepted client #{} from {}", handle.id, addr);

    let mut session = Session::new(handle.clone());
    let mut buf = BytesMut::with_capacity(16 * 1024);
    let mut chunk = [0u8; 16 * 1024];
    let mut takeover: Option<(String, i64)> = None;

    'outer: loop {
        if handle.kill.load(Ordering::SeqCst) || server.shutdown.load(Ordering::SeqCst) {
            break;
        }
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        }

        // Drain every complete pipelined command before flushing once.
        let mut out: Vec<u8> = Vec::new();
        loop {
            let limits = {
                let config = server.config.read().unwrap();
                Limits {
                    max_bulk_len: config.proto_max_bulk_len,
                    max_multibulk_len: config.proto_max_multibulk_len,
                }
            };
            match resp::parse_command(&buf, &limits) {
                Ok(Some((argv, used))) => {
                    buf.advance(used);
                    if argv.is_empty() {
                        continue;
                    }
                    match commands::dispatch(&server, &mut session, &argv) {
                        Reply::Frame(frame) => frame.encode_into(&mut out),
                        Reply::Multi(frames) => {
                            for frame in frames {
                                frame.encode_into(&mut out);
                            }
                        }
                        Reply::None | Reply::Block { .. } => {}
                    }
                    if session.psync_request.is_some() {
                        takeover = session.psync_request.take();
                        break;
                    }
                    if session.should_close {
                        handle.send_bytes(&out).ok();
                        break 'outer;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    let msg = Frame::Error(format!("ERR {}", e));
                    handle.send_bytes(&msg.encode()).ok();
                    warn!("protocol error from {}: {}", addr, e);
                    break 'outer;
                }
            }
        }
        if !out.is_empty() && handle.send_bytes(&out).is_err() {
            break;
        }
        if let Some((replid, offset)) = takeover.take() {
            master::serve_replica(&server, &handle, stream, &replid, offset);
            break;
        }
    }

    server.clients.lock().unwrap().remove(&handle.id);
    server.pubsub.drop_client(handle.id);
    handle.request_kill();
    debug!("client #{} from {} closed", handle.id, addr);
}
