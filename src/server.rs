//! Server context and lifecycle: the process-wide singletons (config,
//! store, cluster map, replication state, pub/sub hub, client registry)
//! bundled into one struct handed to every connection thread, plus the
//! accept loop and the background cron.

use std::collections::{HashMap, VecDeque};
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use log::{error, info, warn};

use crate::blocking::BlockerHub;
use crate::client::{self, ClientHandle};
use crate::cluster::ClusterMap;
use crate::config::Config;
use crate::errors::ServerError;
use crate::pubsub::PubSubHub;
use crate::repl::{replica, ReplicationState};
use crate::snapshot;
use crate::storage::Store;
use crate::util::{gen_hex_id, now_ms};

const CRON_PERIOD: Duration = Duration::from_millis(100);
const EXPIRE_BATCH: usize = 32;

#[derive(Default)]
pub struct Stats {
    pub total_connections: AtomicU64,
    pub total_commands: AtomicU64,
}

pub struct SlowLogEntry {
    pub id: u64,
    pub timestamp: u64,
    pub duration_us: u64,
    pub argv: Vec<Vec<u8>>,
    pub client_addr: String,
    pub client_name: String,
}

#[derive(Default)]
pub struct SlowLog {
    next_id: u64,
    pub entries: VecDeque<SlowLogEntry>,
}

impl SlowLog {
    pub fn push(&mut self, mut entry: SlowLogEntry, max_len: usize) {
        entry.id = self.next_id;
        self.next_id += 1;
        self.entries.push_front(entry);
        while self.entries.len() > max_len {
            self.entries.pop_back();
        }
    }

    pub fn reset(&mut self) {
        self.entries.clear();
    }
}

pub struct Server {
    pub config: RwLock<Config>,
    pub store: Store,
    /// The logical engine lock: exclusive around any mutating command or an
    /// EXEC batch, shared for reads. The backing store is internally
    /// thread-safe; this lock provides command-level atomicity.
    pub engine_lock: RwLock<()>,
    pub pubsub: PubSubHub,
    pub blockers: BlockerHub,
    pub cluster: RwLock<ClusterMap>,
    pub repl: ReplicationState,
    pub clients: Mutex<HashMap<u64, Arc<ClientHandle>>>,
    next_client_id: AtomicU64,
    pub run_id: String,
    pub start_time: Instant,
    pub start_unix_ms: u64,
    pub stats: Stats,
    pub slowlog: Mutex<SlowLog>,
    pub pause_until: Mutex<Option<Instant>>,
    pub shutdown: AtomicBool,
    pub last_save_ms: AtomicU64,
    pub bound_addr: Mutex<Option<SocketAddr>>,
}

impl Server {
    pub fn new(config: Config) -> Result<Arc<Server>, ServerError> {
        std::fs::create_dir_all(&config.dir)?;
        let store = Store::open(&config.dir.join("store"))?;
        if store.key_count() == 0 {
            let loaded = snapshot::load_from_file(&store, &config.dir, &config.dbfilename);
            if let Err(e) = loaded {
                warn!("snapshot load skipped: {}", e);
            }
        }
        let replid = gen_hex_id();
        let repl = ReplicationState::new(replid, config.repl_backlog_size);
        let cluster = ClusterMap::new(&config.addr);
        let server = Arc::new(Server {
            repl,
            cluster: RwLock::new(cluster),
            store,
            engine_lock: RwLock::new(()),
            pubsub: PubSubHub::default(),
            blockers: BlockerHub::default(),
            clients: Mutex::new(HashMap::new()),
            next_client_id: AtomicU64::new(1),
            run_id: gen_hex_id(),
            start_time: Instant::now(),
            start_unix_ms: now_ms(),
            stats: Stats::default(),
            slowlog: Mutex::new(SlowLog::default()),
            pause_until: Mutex::new(None),
            shutdown: AtomicBool::new(false),
            last_save_ms: AtomicU64::new(now_ms()),
            bound_addr: Mutex::new(None),
            config: RwLock::new(config),
        });
        Ok(server)
    }

    /// Bind, start background work, and accept connections until shutdown.
    pub fn run(self: &Arc<Server>) -> Result<(), ServerError> {
        let addr = self.config.read().unwrap().addr.clone();
        let listener = TcpListener::bind(&addr)
            .map_err(|e| ServerError::Internal(format!("can't bind {}: {}", addr, e)))?;
        self.start_background(&listener)?;
        info!(
            "Ready to accept connections on {}",
            self.bound_addr.lock().unwrap().unwrap()
        );
        self.accept_loop(listener);
        Ok(())
    }

    /// Test-friendly variant: bind (possibly on an ephemeral port), start
    /// everything, and serve from a background thread.
    pub fn spawn(self: &Arc<Server>) -> Result<SocketAddr, ServerError> {
        let addr = self.config.read().unwrap().addr.clone();
        let listener = TcpListener::bind(&addr)
            .map_err(|e| ServerError::Internal(format!("can't bind {}: {}", addr, e)))?;
        self.start_background(&listener)?;
        let bound = self.bound_addr.lock().unwrap().unwrap();
        let server = self.clone();
        thread::Builder::new()
            .name("acceptor".into())
            .spawn(move || server.accept_loop(listener))
            .expect("spawn acceptor");
        Ok(bound)
    }

    fn start_background(self: &Arc<Server>, listener: &TcpListener) -> Result<(), ServerError> {
        *self.bound_addr.lock().unwrap() = Some(listener.local_addr()?);
        let cron_server = self.clone();
        thread::Builder::new()
            .name("cron".into())
            .spawn(move || cron_server.cron_loop())
            .expect("spawn cron");
        let replicaof = self.config.read().unwrap().replicaof.clone();
        if let Some((host, port)) = replicaof {
            replica::start(self, host, port);
        }
        Ok(())
    }

    fn accept_loop(self: &Arc<Server>, listener: TcpListener) {
        for incoming in listener.incoming() {
            if self.shutdown.load(Ordering::SeqCst) {
                return;
            }
            match incoming {
                Ok(stream) => {
                    self.stats.total_connections.fetch_add(1, Ordering::Relaxed);
                    let server = self.clone();
                    if let Err(e) = thread::Builder::new()
                        .name("client".into())
                        .spawn(move || client::serve_connection(server, stream))
                    {
                        error!("can't spawn connection thread: {}", e);
                    }
                }
                Err(e) => {
                    warn!("accept failed: {}", e);
                    thread::sleep(Duration::from_millis(10));
                }
            }
        }
    }

    /// Periodic housekeeping: actively expire due keys and prune dead
    /// replica handles. Takes the exclusive lock only for short batches.
    fn cron_loop(self: Arc<Server>) {
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                return;
            }
            {
                let _guard = self.engine_lock.write().unwrap();
                if let Err(e) = self.store.sweep_expired(EXPIRE_BATCH) {
                    error!("expire sweep failed: {}", e);
                }
            }
            self.repl.drop_closed_replicas();
            thread::sleep(CRON_PERIOD);
        }
    }

    pub fn next_client_id(&self) -> u64 {
        self.next_client_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn listen_port(&self) -> u16 {
        if let Some(addr) = *self.bound_addr.lock().unwrap() {
            return addr.port();
        }
        self.config
            .read()
            .unwrap()
            .addr
            .rsplit_once(':')
            .and_then(|(_, p)| p.parse().ok())
            .unwrap_or(6379)
    }

    /// SAVE: serialize the keyspace under the shared lock (writers blocked)
    /// and atomically replace the dump file.
    pub fn save_snapshot(&self) -> Result<(), ServerError> {
        let (dir, filename) = {
            let config = self.config.read().unwrap();
            (config.dir.clone(), config.dbfilename.clone())
        };
        snapshot::save_to_file(&self.store, &dir, &filename)?;
        self.last_save_ms.store(now_ms(), Ordering::SeqCst);
        Ok(())
    }

    pub fn wait_if_paused(&self) {
        let deadline = *self.pause_until.lock().unwrap();
        if let Some(deadline) = deadline {
            let now = Instant::now();
            if now < deadline {
                thread::sleep(deadline - now);
            }
            *self.pause_until.lock().unwrap() = None;
        }
    }
}
