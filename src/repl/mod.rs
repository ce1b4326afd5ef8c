//! Replication state shared between the master-side driver (feeding
//! replicas) and the replica-side driver (following a master).

pub mod master;
pub mod replica;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, RwLock};
use std::time::Duration;

use crate::backlog::ReplBacklog;

/// A replica's per-connection output buffer. The engine write path pushes
/// serialized commands here and never touches the socket; a feeder thread
/// drains the queue. Crossing the high-water mark closes the replica.
pub const REPLICA_OUTBOX_HIGH_WATER: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Master,
    Replica,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Down,
    Connecting,
    Syncing,
    Up,
}

impl LinkStatus {
    pub fn name(&self) -> &'static str {
        match self {
            LinkStatus::Down => "down",
            LinkStatus::Connecting => "connecting",
            LinkStatus::Syncing => "sync",
            LinkStatus::Up => "up",
        }
    }
}

struct Outbox {
    queue: VecDeque<Vec<u8>>,
    bytes: usize,
    closed: bool,
}

pub struct ReplicaHandle {
    pub client_id: u64,
    pub addr: String,
    pub listening_port: AtomicU64,
    pub ack_offset: AtomicU64,
    outbox: Mutex<Outbox>,
    cv: Condvar,
}

impl ReplicaHandle {
    pub fn new(client_id: u64, addr: String, start_offset: u64) -> ReplicaHandle {
        ReplicaHandle {
            client_id,
            addr,
            listening_port: AtomicU64::new(0),
            ack_offset: AtomicU64::new(start_offset),
            outbox: Mutex::new(Outbox {
                queue: VecDeque::new(),
                bytes: 0,
                closed: false,
            }),
            cv: Condvar::new(),
        }
    }

    /// Queue bytes for the feeder. Returns false when the replica fell too
    /// far behind and has been closed instead.
    pub fn push(&self, bytes: Vec<u8>) -> bool {
        let mut outbox = self.outbox.lock().unwrap();
        if outbox.closed {
            return false;
        }
        if outbox.bytes + bytes.len() > REPLICA_OUTBOX_HIGH_WATER {
            outbox.closed = true;
            self.cv.notify_all();
            return false;
        }
        outbox.bytes += bytes.len();
        outbox.queue.push_back(bytes);
        self.cv.notify_all();
        true
    }

    /// Feeder side: wait up to `timeout` for the next chunk. `None` with a
    /// closed flag means the feeder should exit.
    pub fn pop_wait(&self, timeout: Duration) -> Option<Vec<u8>> {
        let mut outbox = self.outbox.lock().unwrap();
        if outbox.queue.is_empty() && !outbox.closed {
            let (guard, _) = self.cv.wait_timeout(outbox, timeout).unwrap();
            outbox = guard;
        }
        let chunk = outbox.queue.pop_front();
        if let Some(c) = &chunk {
            outbox.bytes -= c.len();
        }
        chunk
    }

    pub fn close(&self) {
        let mut outbox = self.outbox.lock().unwrap();
        outbox.closed = true;
        outbox.queue.clear();
        outbox.bytes = 0;
        self.cv.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.outbox.lock().unwrap().closed
    }
}

pub struct ReplicationState {
    /// This node's replication id, fixed for the process lifetime.
    pub replid: String,
    pub role: RwLock<Role>,
    pub master_addr: Mutex<Option<(String, u16)>>,
    pub backlog: Mutex<ReplBacklog>,
    pub replicas: Mutex<Vec<std::sync::Arc<ReplicaHandle>>>,
    /// Replica side: id of the master we last synced from, and how many
    /// stream bytes we have applied.
    pub master_replid: Mutex<Option<String>>,
    pub applied_offset: AtomicU64,
    pub link_status: Mutex<LinkStatus>,
    /// Bumped by every REPLICAOF; stale driver threads notice and exit.
    pub link_generation: AtomicU64,
}

impl ReplicationState {
    pub fn new(replid: String, backlog_size: usize) -> ReplicationState {
        ReplicationState {
            replid,
            role: RwLock::new(Role::Master),
            master_addr: Mutex::new(None),
            backlog: Mutex::new(ReplBacklog::new(backlog_size)),
            replicas: Mutex::new(Vec::new()),
            master_replid: Mutex::new(None),
            applied_offset: AtomicU64::new(0),
            link_status: Mutex::new(LinkStatus::Down),
            link_generation: AtomicU64::new(0),
        }
    }

    pub fn role(&self) -> Role {
        *self.role.read().unwrap()
    }

    pub fn is_master(&self) -> bool {
        self.role() == Role::Master
    }

    /// The offset INFO reports: bytes fed into the backlog on a master,
    /// bytes applied on a replica.
    pub fn master_repl_offset(&self) -> u64 {
        match self.role() {
            Role::Master => self.backlog.lock().unwrap().end_offset(),
            Role::Replica => self.applied_offset.load(Ordering::SeqCst),
        }
    }

    pub fn connected_replicas(&self) -> usize {
        self.replicas
            .lock()
            .unwrap()
            .iter()
            .filter(|r| !r.is_closed())
            .count()
    }

    pub fn drop_closed_replicas(&self) {
        self.replicas.lock().unwrap().retain(|r| !r.is_closed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outbox_orders_chunks() {
        let h = ReplicaHandle::new(1, "x".into(), 0);
        assert!(h.push(b"one".to_vec()));
        assert!(h.push(b"two".to_vec()));
        assert_eq!(h.pop_wait(Duration::from_millis(1)).unwrap(), b"one");
        assert_eq!(h.pop_wait(Duration::from_millis(1)).unwrap(), b"two");
        assert!(h.pop_wait(Duration::from_millis(1)).is_none());
    }

    #[test]
    fn high_water_closes() {
        let h = ReplicaHandle::new(1, "x".into(), 0);
        assert!(!h.push(vec![0u8; REPLICA_OUTBOX_HIGH_WATER + 1]));
        assert!(h.is_closed());
    }
}
