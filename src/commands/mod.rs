//! Command table and dispatcher: arity validation, auth/subscriber/readonly
//! gating, MULTI queueing, cluster redirection, lock management around the
//! handlers, and replication propagation of effectful commands.

pub mod bitmap;
pub mod cluster;
pub mod generic;
pub mod geo;
pub mod hash;
pub mod hll;
pub mod json;
pub mod list;
pub mod pubsub;
pub mod repl;
pub mod server;
pub mod set;
pub mod stream;
pub mod string;
pub mod ts;
pub mod txn;
pub mod zset;

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;

use crate::client::Session;
use crate::cluster::key_hash_slot;
use crate::errors::ServerError;
use crate::repl::master;
use crate::resp::Frame;
use crate::server::{Server, SlowLogEntry};
use crate::util::now_ms;

/// Takes the exclusive engine lock, counts as dirty, propagates on effect.
pub const CMD_WRITE: u32 = 1;
/// Skips CLIENT PAUSE.
pub const CMD_ADMIN: u32 = 1 << 1;
/// Still allowed while the connection is in subscriber mode.
pub const CMD_PUBSUB: u32 = 1 << 2;
/// Allowed before AUTH when a password is configured.
pub const CMD_NOAUTH: u32 = 1 << 3;
/// May suspend the connection; the dispatcher drives the retry loop.
pub const CMD_BLOCKING: u32 = 1 << 4;
/// Never queued by MULTI (the transaction control commands themselves).
pub const CMD_SKIP_MULTI: u32 = 1 << 5;
/// Handler propagates for itself (EXEC).
pub const CMD_SELF_PROPAGATE: u32 = 1 << 6;
/// Runs without the dispatcher taking the engine lock (SAVE and friends
/// manage their own consistency window).
pub const CMD_LOCK_FREE: u32 = 1 << 7;
/// Rejected inside MULTI (subscription state cannot be queued).
pub const CMD_NO_MULTI: u32 = 1 << 8;

pub enum Reply {
    Frame(Frame),
    Multi(Vec<Frame>),
    /// A blocking command found nothing: park on `keys` until woken or the
    /// timeout elapses, then retry. Only the dispatcher sees this.
    Block { keys: Vec<Vec<u8>>, timeout_ms: u64 },
    None,
}

impl From<Frame> for Reply {
    fn from(frame: Frame) -> Reply {
        Reply::Frame(frame)
    }
}

pub type Handler = fn(&Arc<Server>, &mut Session, &[Vec<u8>]) -> Result<Reply, ServerError>;

pub struct CommandSpec {
    pub name: &'static str,
    pub handler: Handler,
    /// Exact argument count when positive, minimum when negative.
    pub arity: i32,
    pub flags: u32,
    pub first_key: usize,
    /// Negative counts from the end (-1 = last argument). Ignored when
    /// first_key is 0.
    pub last_key: i32,
    pub key_step: usize,
}

fn add(
    t: &mut HashMap<&'static str, CommandSpec>,
    name: &'static str,
    handler: Handler,
    arity: i32,
    flags: u32,
    first_key: usize,
    last_key: i32,
    key_step: usize,
) {
    t.insert(
        name,
        CommandSpec {
            name,
            handler,
            arity,
            flags,
            first_key,
            last_key,
            key_step,
        },
    );
}

static COMMANDS: Lazy<HashMap<&'static str, CommandSpec>> = Lazy::new(|| {
    let mut t = HashMap::new();
    let w = CMD_WRITE;

    // connection / server
    add(&mut t, "PING", server::ping_command, -1, CMD_PUBSUB, 0, 0, 0);
    add(&mut t, "ECHO", server::echo_command, 2, 0, 0, 0, 0);
    add(&mut t, "AUTH", server::auth_command, -2, CMD_NOAUTH | CMD_PUBSUB, 0, 0, 0);
    add(&mut t, "HELLO", server::hello_command, -1, CMD_NOAUTH, 0, 0, 0);
    add(&mut t, "SELECT", server::select_command, 2, 0, 0, 0, 0);
    add(&mut t, "SWAPDB", server::swapdb_command, 3, 0, 0, 0, 0);
    add(&mut t, "CLIENT", server::client_command, -2, CMD_ADMIN, 0, 0, 0);
    add(&mut t, "CONFIG", server::config_command, -2, CMD_ADMIN, 0, 0, 0);
    add(&mut t, "DEBUG", server::debug_command, -2, CMD_ADMIN | CMD_LOCK_FREE, 0, 0, 0);
    add(&mut t, "COMMAND", server::command_command, -1, 0, 0, 0, 0);
    add(&mut t, "INFO", server::info_command, -1, 0, 0, 0, 0);
    add(&mut t, "DBSIZE", server::dbsize_command, 1, 0, 0, 0, 0);
    add(&mut t, "TIME", server::time_command, 1, 0, 0, 0, 0);
    add(&mut t, "LASTSAVE", server::lastsave_command, 1, 0, 0, 0, 0);
    add(&mut t, "SAVE", server::save_command, 1, CMD_ADMIN | CMD_LOCK_FREE, 0, 0, 0);
    add(&mut t, "BGSAVE", server::bgsave_command, -1, CMD_ADMIN | CMD_LOCK_FREE, 0, 0, 0);
    add(&mut t, "SHUTDOWN", server::shutdown_command, -1, CMD_ADMIN | CMD_LOCK_FREE, 0, 0, 0);
    add(&mut t, "FLUSHDB", server::flushdb_command, -1, w, 0, 0, 0);
    add(&mut t, "FLUSHALL", server::flushall_command, -1, w, 0, 0, 0);
    add(&mut t, "MEMORY", server::memory_command, -2, 0, 0, 0, 0);
    add(&mut t, "SLOWLOG", server::slowlog_command, -2, CMD_ADMIN, 0, 0, 0);
    add(&mut t, "LOLWUT", server::lolwut_command, -1, 0, 0, 0, 0);

    // generic keyspace
    add(&mut t, "DEL", generic::del_command, -2, w, 1, -1, 1);
    add(&mut t, "UNLINK", generic::del_command, -2, w, 1, -1, 1);
    add(&mut t, "EXISTS", generic::exists_command, -2, 0, 1, -1, 1);
    add(&mut t, "TYPE", generic::type_command, 2, 0, 1, 1, 1);
    add(&mut t, "KEYS", generic::keys_command, 2, 0, 0, 0, 0);
    add(&mut t, "RANDOMKEY", generic::randomkey_command, 1, 0, 0, 0, 0);
    add(&mut t, "RENAME", generic::rename_command, 3, w, 1, 2, 1);
    add(&mut t, "RENAMENX", generic::renamenx_command, 3, w, 1, 2, 1);
    add(&mut t, "COPY", generic::copy_command, -3, w, 1, 2, 1);
    add(&mut t, "TOUCH", generic::touch_command, -2, 0, 1, -1, 1);
    add(&mut t, "EXPIRE", generic::expire_command, -3, w, 1, 1, 1);
    add(&mut t, "PEXPIRE", generic::pexpire_command, -3, w, 1, 1, 1);
    add(&mut t, "EXPIREAT", generic::expireat_command, -3, w, 1, 1, 1);
    add(&mut t, "PEXPIREAT", generic::pexpireat_command, -3, w, 1, 1, 1);
    add(&mut t, "EXPIRETIME", generic::expiretime_command, 2, 0, 1, 1, 1);
    add(&mut t, "PEXPIRETIME", generic::pexpiretime_command, 2, 0, 1, 1, 1);
    add(&mut t, "TTL", generic::ttl_command, 2, 0, 1, 1, 1);
    add(&mut t, "PTTL", generic::pttl_command, 2, 0, 1, 1, 1);
    add(&mut t, "PERSIST", generic::persist_command, 2, w, 1, 1, 1);
    add(&mut t, "SCAN", generic::scan_command, -2, 0, 0, 0, 0);
    add(&mut t, "SORT", generic::sort_command, -2, w, 1, 1, 1);
    add(&mut t, "DUMP", generic::dump_command, 2, 0, 1, 1, 1);
    add(&mut t, "RESTORE", generic::restore_command, -4, w, 1, 1, 1);
    add(&mut t, "OBJECT", generic::object_command, -2, 0, 2, 2, 1);

    // strings
    add(&mut t, "SET", string::set_command, -3, w, 1, 1, 1);
    add(&mut t, "GET", string::get_command, 2, 0, 1, 1, 1);
    add(&mut t, "GETSET", string::getset_command, 3, w, 1, 1, 1);
    add(&mut t, "GETDEL", string::getdel_command, 2, w, 1, 1, 1);
    add(&mut t, "GETEX", string::getex_command, -2, w, 1, 1, 1);
    add(&mut t, "APPEND", string::append_command, 3, w, 1, 1, 1);
    add(&mut t, "STRLEN", string::strlen_command, 2, 0, 1, 1, 1);
    add(&mut t, "SETRANGE", string::setrange_command, 4, w, 1, 1, 1);
    add(&mut t, "GETRANGE", string::getrange_command, 4, 0, 1, 1, 1);
    add(&mut t, "SETNX", string::setnx_command, 3, w, 1, 1, 1);
    add(&mut t, "SETEX", string::setex_command, 4, w, 1, 1, 1);
    add(&mut t, "PSETEX", string::psetex_command, 4, w, 1, 1, 1);
    add(&mut t, "MSET", string::mset_command, -3, w, 1, -1, 2);
    add(&mut t, "MSETNX", string::msetnx_command, -3, w, 1, -1, 2);
    add(&mut t, "MGET", string::mget_command, -2, 0, 1, -1, 1);
    add(&mut t, "INCR", string::incr_command, 2, w, 1, 1, 1);
    add(&mut t, "INCRBY", string::incrby_command, 3, w, 1, 1, 1);
    add(&mut t, "INCRBYFLOAT", string::incrbyfloat_command, 3, w, 1, 1, 1);
    add(&mut t, "DECR", string::decr_command, 2, w, 1, 1, 1);
    add(&mut t, "DECRBY", string::decrby_command, 3, w, 1, 1, 1);

    // lists
    add(&mut t, "LPUSH", list::lpush_command, -3, w, 1, 1, 1);
    add(&mut t, "RPUSH", list::rpush_command, -3, w, 1, 1, 1);
    add(&mut t, "LPUSHX", list::lpushx_command, -3, w, 1, 1, 1);
    add(&mut t, "RPUSHX", list::rpushx_command, -3, w, 1, 1, 1);
    add(&mut t, "LPOP", list::lpop_command, -2, w, 1, 1, 1);
    add(&mut t, "RPOP", list::rpop_command, -2, w, 1, 1, 1);
    add(&mut t, "LLEN", list::llen_command, 2, 0, 1, 1, 1);
    add(&mut t, "LRANGE", list::lrange_command, 4, 0, 1, 1, 1);
    add(&mut t, "LTRIM", list::ltrim_command, 4, w, 1, 1, 1);
    add(&mut t, "LREM", list::lrem_command, 4, w, 1, 1, 1);
    add(&mut t, "LSET", list::lset_command, 4, w, 1, 1, 1);
    add(&mut t, "LINDEX", list::lindex_command, 3, 0, 1, 1, 1);
    add(&mut t, "LINSERT", list::linsert_command, 5, w, 1, 1, 1);
    add(&mut t, "LPOS", list::lpos_command, -3, 0, 1, 1, 1);
    add(&mut t, "LMOVE", list::lmove_command, 5, w, 1, 2, 1);
    add(&mut t, "RPOPLPUSH", list::rpoplpush_command, 3, w, 1, 2, 1);
    add(&mut t, "BLPOP", list::blpop_command, -3, w | CMD_BLOCKING, 1, -2, 1);
    add(&mut t, "BRPOP", list::brpop_command, -3, w | CMD_BLOCKING, 1, -2, 1);
    add(&mut t, "BLMOVE", list::blmove_command, 6, w | CMD_BLOCKING, 1, 2, 1);
    add(&mut t, "BRPOPLPUSH", list::brpoplpush_command, 4, w | CMD_BLOCKING, 1, 2, 1);

    // hashes
    add(&mut t, "HSET", hash::hset_command, -4, w, 1, 1, 1);
    add(&mut t, "HMSET", hash::hmset_command, -4, w, 1, 1, 1);
    add(&mut t, "HSETNX", hash::hsetnx_command, 4, w, 1, 1, 1);
    add(&mut t, "HGET", hash::hget_command, 3, 0, 1, 1, 1);
    add(&mut t, "HMGET", hash::hmget_command, -3, 0, 1, 1, 1);
    add(&mut t, "HGETALL", hash::hgetall_command, 2, 0, 1, 1, 1);
    add(&mut t, "HDEL", hash::hdel_command, -3, w, 1, 1, 1);
    add(&mut t, "HLEN", hash::hlen_command, 2, 0, 1, 1, 1);
    add(&mut t, "HEXISTS", hash::hexists_command, 3, 0, 1, 1, 1);
    add(&mut t, "HKEYS", hash::hkeys_command, 2, 0, 1, 1, 1);
    add(&mut t, "HVALS", hash::hvals_command, 2, 0, 1, 1, 1);
    add(&mut t, "HINCRBY", hash::hincrby_command, 4, w, 1, 1, 1);
    add(&mut t, "HINCRBYFLOAT", hash::hincrbyfloat_command, 4, w, 1, 1, 1);
    add(&mut t, "HSTRLEN", hash::hstrlen_command, 3, 0, 1, 1, 1);
    add(&mut t, "HRANDFIELD", hash::hrandfield_command, -2, 0, 1, 1, 1);
    add(&mut t, "HSCAN", hash::hscan_command, -3, 0, 1, 1, 1);

    // sets
    add(&mut t, "SADD", set::sadd_command, -3, w, 1, 1, 1);
    add(&mut t, "SREM", set::srem_command, -3, w, 1, 1, 1);
    add(&mut t, "SPOP", set::spop_command, -2, w, 1, 1, 1);
    add(&mut t, "SRANDMEMBER", set::srandmember_command, -2, 0, 1, 1, 1);
    add(&mut t, "SCARD", set::scard_command, 2, 0, 1, 1, 1);
    add(&mut t, "SISMEMBER", set::sismember_command, 3, 0, 1, 1, 1);
    add(&mut t, "SMISMEMBER", set::smismember_command, -3, 0, 1, 1, 1);
    add(&mut t, "SMEMBERS", set::smembers_command, 2, 0, 1, 1, 1);
    add(&mut t, "SMOVE", set::smove_command, 4, w, 1, 2, 1);
    add(&mut t, "SINTER", set::sinter_command, -2, 0, 1, -1, 1);
    add(&mut t, "SINTERCARD", set::sintercard_command, -3, 0, 0, 0, 0);
    add(&mut t, "SUNION", set::sunion_command, -2, 0, 1, -1, 1);
    add(&mut t, "SDIFF", set::sdiff_command, -2, 0, 1, -1, 1);
    add(&mut t, "SINTERSTORE", set::sinterstore_command, -3, w, 1, -1, 1);
    add(&mut t, "SUNIONSTORE", set::sunionstore_command, -3, w, 1, -1, 1);
    add(&mut t, "SDIFFSTORE", set::sdiffstore_command, -3, w, 1, -1, 1);
    add(&mut t, "SSCAN", set::sscan_command, -3, 0, 1, 1, 1);

    // sorted sets
    add(&mut t, "ZADD", zset::zadd_command, -4, w, 1, 1, 1);
    add(&mut t, "ZREM", zset::zrem_command, -3, w, 1, 1, 1);
    add(&mut t, "ZSCORE", zset::zscore_command, 3, 0, 1, 1, 1);
    add(&mut t, "ZMSCORE", zset::zmscore_command, -3, 0, 1, 1, 1);
    add(&mut t, "ZCARD", zset::zcard_command, 2, 0, 1, 1, 1);
    add(&mut t, "ZCOUNT", zset::zcount_command, 4, 0, 1, 1, 1);
    add(&mut t, "ZLEXCOUNT", zset::zlexcount_command, 4, 0, 1, 1, 1);
    add(&mut t, "ZINCRBY", zset::zincrby_command, 4, w, 1, 1, 1);
    add(&mut t, "ZRANK", zset::zrank_command, -3, 0, 1, 1, 1);
    add(&mut t, "ZREVRANK", zset::zrevrank_command, -3, 0, 1, 1, 1);
    add(&mut t, "ZRANGE", zset::zrange_command, -4, 0, 1, 1, 1);
    add(&mut t, "ZREVRANGE", zset::zrevrange_command, -4, 0, 1, 1, 1);
    add(&mut t, "ZRANGEBYSCORE", zset::zrangebyscore_command, -4, 0, 1, 1, 1);
    add(&mut t, "ZREVRANGEBYSCORE", zset::zrevrangebyscore_command, -4, 0, 1, 1, 1);
    add(&mut t, "ZRANGEBYLEX", zset::zrangebylex_command, -4, 0, 1, 1, 1);
    add(&mut t, "ZREVRANGEBYLEX", zset::zrevrangebylex_command, -4, 0, 1, 1, 1);
    add(&mut t, "ZREMRANGEBYRANK", zset::zremrangebyrank_command, 4, w, 1, 1, 1);
    add(&mut t, "ZREMRANGEBYSCORE", zset::zremrangebyscore_command, 4, w, 1, 1, 1);
    add(&mut t, "ZREMRANGEBYLEX", zset::zremrangebylex_command, 4, w, 1, 1, 1);
    add(&mut t, "ZPOPMIN", zset::zpopmin_command, -2, w, 1, 1, 1);
    add(&mut t, "ZPOPMAX", zset::zpopmax_command, -2, w, 1, 1, 1);
    add(&mut t, "BZPOPMIN", zset::bzpopmin_command, -3, w | CMD_BLOCKING, 1, -2, 1);
    add(&mut t, "BZPOPMAX", zset::bzpopmax_command, -3, w | CMD_BLOCKING, 1, -2, 1);
    add(&mut t, "ZRANDMEMBER", zset::zrandmember_command, -2, 0, 1, 1, 1);
    add(&mut t, "ZUNIONSTORE", zset::zunionstore_command, -4, w, 1, 1, 1);
    add(&mut t, "ZINTERSTORE", zset::zinterstore_command, -4, w, 1, 1, 1);
    add(&mut t, "ZDIFFSTORE", zset::zdiffstore_command, -4, w, 1, 1, 1);
    add(&mut t, "ZSCAN", zset::zscan_command, -3, 0, 1, 1, 1);

    // streams
    add(&mut t, "XADD", stream::xadd_command, -5, w, 1, 1, 1);
    add(&mut t, "XLEN", stream::xlen_command, 2, 0, 1, 1, 1);
    add(&mut t, "XRANGE", stream::xrange_command, -4, 0, 1, 1, 1);
    add(&mut t, "XREVRANGE", stream::xrevrange_command, -4, 0, 1, 1, 1);
    add(&mut t, "XREAD", stream::xread_command, -4, CMD_BLOCKING, 0, 0, 0);
    add(&mut t, "XDEL", stream::xdel_command, -3, w, 1, 1, 1);
    add(&mut t, "XTRIM", stream::xtrim_command, -4, w, 1, 1, 1);
    add(&mut t, "XGROUP", stream::xgroup_command, -2, w, 2, 2, 1);
    add(&mut t, "XREADGROUP", stream::xreadgroup_command, -7, CMD_BLOCKING | w, 0, 0, 0);
    add(&mut t, "XACK", stream::xack_command, -4, w, 1, 1, 1);
    add(&mut t, "XPENDING", stream::xpending_command, -3, 0, 1, 1, 1);
    add(&mut t, "XCLAIM", stream::xclaim_command, -6, w, 1, 1, 1);
    add(&mut t, "XAUTOCLAIM", stream::xautoclaim_command, -7, w, 1, 1, 1);
    add(&mut t, "XSETID", stream::xsetid_command, -3, w, 1, 1, 1);
    add(&mut t, "XINFO", stream::xinfo_command, -3, 0, 2, 2, 1);

    // JSON documents
    add(&mut t, "JSON.SET", json::set_command, -4, w, 1, 1, 1);
    add(&mut t, "JSON.GET", json::get_command, -2, 0, 1, 1, 1);
    add(&mut t, "JSON.DEL", json::del_command, -2, w, 1, 1, 1);
    add(&mut t, "JSON.TYPE", json::type_command, -2, 0, 1, 1, 1);
    add(&mut t, "JSON.CLEAR", json::clear_command, -2, w, 1, 1, 1);
    add(&mut t, "JSON.ARRAPPEND", json::arrappend_command, -4, w, 1, 1, 1);
    add(&mut t, "JSON.ARRLEN", json::arrlen_command, -2, 0, 1, 1, 1);
    add(&mut t, "JSON.NUMINCRBY", json::numincrby_command, 4, w, 1, 1, 1);
    add(&mut t, "JSON.NUMMULTBY", json::nummultby_command, 4, w, 1, 1, 1);
    add(&mut t, "JSON.OBJKEYS", json::objkeys_command, -2, 0, 1, 1, 1);
    add(&mut t, "JSON.OBJLEN", json::objlen_command, -2, 0, 1, 1, 1);
    add(&mut t, "JSON.STRLEN", json::strlen_command, -2, 0, 1, 1, 1);

    // bitmaps
    add(&mut t, "SETBIT", bitmap::setbit_command, 4, w, 1, 1, 1);
    add(&mut t, "GETBIT", bitmap::getbit_command, 3, 0, 1, 1, 1);
    add(&mut t, "BITCOUNT", bitmap::bitcount_command, -2, 0, 1, 1, 1);
    add(&mut t, "BITPOS", bitmap::bitpos_command, -3, 0, 1, 1, 1);
    add(&mut t, "BITOP", bitmap::bitop_command, -4, w, 2, -1, 1);
    add(&mut t, "BITFIELD", bitmap::bitfield_command, -2, w, 1, 1, 1);
    add(&mut t, "BITFIELD_RO", bitmap::bitfield_ro_command, -2, 0, 1, 1, 1);

    // hyperloglog
    add(&mut t, "PFADD", hll::pfadd_command, -2, w, 1, 1, 1);
    add(&mut t, "PFCOUNT", hll::pfcount_command, -2, 0, 1, -1, 1);
    add(&mut t, "PFMERGE", hll::pfmerge_command, -2, w, 1, -1, 1);

    // geospatial
    add(&mut t, "GEOADD", geo::geoadd_command, -5, w, 1, 1, 1);
    add(&mut t, "GEOPOS", geo::geopos_command, -2, 0, 1, 1, 1);
    add(&mut t, "GEODIST", geo::geodist_command, -4, 0, 1, 1, 1);
    add(&mut t, "GEOHASH", geo::geohash_command, -2, 0, 1, 1, 1);
    add(&mut t, "GEOSEARCH", geo::geosearch_command, -7, 0, 1, 1, 1);
    add(&mut t, "GEOSEARCHSTORE", geo::geosearchstore_command, -8, w, 1, 2, 1);

    // time series
    add(&mut t, "TS.CREATE", ts::create_command, -2, w, 1, 1, 1);
    add(&mut t, "TS.ALTER", ts::alter_command, -2, w, 1, 1, 1);
    add(&mut t, "TS.ADD", ts::add_command, -4, w, 1, 1, 1);
    add(&mut t, "TS.GET", ts::get_command, 2, 0, 1, 1, 1);
    add(&mut t, "TS.RANGE", ts::range_command, -4, 0, 1, 1, 1);
    add(&mut t, "TS.REVRANGE", ts::revrange_command, -4, 0, 1, 1, 1);
    add(&mut t, "TS.INCRBY", ts::incrby_command, -3, w, 1, 1, 1);
    add(&mut t, "TS.DECRBY", ts::decrby_command, -3, w, 1, 1, 1);
    add(&mut t, "TS.DEL", ts::del_command, 4, w, 1, 1, 1);
    add(&mut t, "TS.INFO", ts::info_command, 2, 0, 1, 1, 1);

    // pub/sub
    add(&mut t, "SUBSCRIBE", pubsub::subscribe_command, -2, CMD_PUBSUB | CMD_NO_MULTI, 0, 0, 0);
    add(&mut t, "UNSUBSCRIBE", pubsub::unsubscribe_command, -1, CMD_PUBSUB | CMD_NO_MULTI, 0, 0, 0);
    add(&mut t, "PSUBSCRIBE", pubsub::psubscribe_command, -2, CMD_PUBSUB | CMD_NO_MULTI, 0, 0, 0);
    add(&mut t, "PUNSUBSCRIBE", pubsub::punsubscribe_command, -1, CMD_PUBSUB | CMD_NO_MULTI, 0, 0, 0);
    add(&mut t, "PUBLISH", pubsub::publish_command, 3, 0, 0, 0, 0);
    add(&mut t, "PUBSUB", pubsub::pubsub_command, -2, 0, 0, 0, 0);

    // transactions
    add(&mut t, "MULTI", txn::multi_command, 1, CMD_SKIP_MULTI, 0, 0, 0);
    add(&mut t, "EXEC", txn::exec_command, 1, CMD_SKIP_MULTI | CMD_WRITE | CMD_SELF_PROPAGATE, 0, 0, 0);
    add(&mut t, "DISCARD", txn::discard_command, 1, CMD_SKIP_MULTI, 0, 0, 0);
    add(&mut t, "WATCH", txn::watch_command, -2, CMD_SKIP_MULTI, 1, -1, 1);
    add(&mut t, "UNWATCH", txn::unwatch_command, 1, CMD_SKIP_MULTI, 0, 0, 0);

    // cluster
    add(&mut t, "CLUSTER", cluster::cluster_command, -2, CMD_ADMIN, 0, 0, 0);

    // replication
    add(&mut t, "REPLICAOF", repl::replicaof_command, 3, CMD_ADMIN, 0, 0, 0);
    add(&mut t, "SLAVEOF", repl::replicaof_command, 3, CMD_ADMIN, 0, 0, 0);
    add(&mut t, "PSYNC", repl::psync_command, 3, CMD_ADMIN | CMD_LOCK_FREE, 0, 0, 0);
    add(&mut t, "REPLCONF", repl::replconf_command, -2, CMD_ADMIN | CMD_LOCK_FREE, 0, 0, 0);
    add(&mut t, "WAIT", repl::wait_command, 3, 0, 0, 0, 0);

    t
});

pub fn lookup(name: &str) -> Option<&'static CommandSpec> {
    COMMANDS.get(name)
}

pub fn command_count() -> usize {
    COMMANDS.len()
}

pub fn all_specs() -> impl Iterator<Item = &'static CommandSpec> {
    COMMANDS.values()
}

/// Full dispatch pipeline for one request. Never panics back to the
/// connection loop; every failure becomes an error frame.
pub fn dispatch(server: &Arc<Server>, session: &mut Session, argv: &[Vec<u8>]) -> Reply {
    let started = Instant::now();
    let name = String::from_utf8_lossy(&argv[0]).to_ascii_uppercase();
    server.stats.total_commands.fetch_add(1, Ordering::Relaxed);
    *session.handle.last_command.lock().unwrap() = name.clone();

    if name == "QUIT" {
        session.should_close = true;
        return Frame::ok().into();
    }

    let Some(spec) = lookup(&name) else {
        if let Some(multi) = session.multi.as_mut() {
            multi.errored = true;
        }
        return ServerError::UnknownCommand(name.to_lowercase()).to_frame().into();
    };

    if (spec.arity > 0 && argv.len() != spec.arity as usize)
        || (argv.len() as i32) < -spec.arity
    {
        if let Some(multi) = session.multi.as_mut() {
            multi.errored = true;
        }
        return ServerError::WrongArity(spec.name.to_lowercase())
            .to_frame()
            .into();
    }

    let password_set = server.config.read().unwrap().password.is_some();
    if password_set && !session.authenticated && spec.flags & CMD_NOAUTH == 0 {
        return ServerError::NoAuth.to_frame().into();
    }

    if session.subscribed() && spec.flags & CMD_PUBSUB == 0 {
        return Frame::Error(format!(
            "ERR Can't execute '{}': only (P)SUBSCRIBE / (P)UNSUBSCRIBE / PING / QUIT are allowed in this context",
            spec.name.to_lowercase()
        ))
        .into();
    }

    if session.multi.is_some() && spec.flags & CMD_SKIP_MULTI == 0 {
        if spec.flags & CMD_NO_MULTI != 0 {
            session.multi.as_mut().unwrap().errored = true;
            return Frame::Error(format!(
                "ERR {} is not allowed in transactions",
                spec.name
            ))
            .into();
        }
        session
            .multi
            .as_mut()
            .unwrap()
            .queue
            .push(argv.to_vec());
        return Frame::Simple("QUEUED".into()).into();
    }

    if let Some(redirect) = cluster_redirect(server, session, spec, argv) {
        return redirect.to_frame().into();
    }

    if spec.flags & CMD_WRITE != 0 && !session.is_master_link && !server.repl.is_master() {
        return ServerError::ReadOnly.to_frame().into();
    }

    if spec.flags & CMD_ADMIN == 0 && !session.is_master_link {
        server.wait_if_paused();
    }

    let reply = match execute(server, session, spec, argv) {
        Ok(reply) => reply,
        Err(e) => e.to_frame().into(),
    };

    let elapsed_us = started.elapsed().as_micros() as u64;
    let (threshold, max_len) = {
        let config = server.config.read().unwrap();
        (config.slowlog_log_slower_than, config.slowlog_max_len)
    };
    if threshold >= 0 && elapsed_us >= threshold as u64 {
        server.slowlog.lock().unwrap().push(
            SlowLogEntry {
                id: 0,
                timestamp: now_ms() / 1000,
                duration_us: elapsed_us,
                argv: argv.iter().take(32).cloned().collect(),
                client_addr: session.handle.addr.clone(),
                client_name: session.handle.name.lock().unwrap().clone(),
            },
            max_len,
        );
    }

    reply
}

fn execute(
    server: &Arc<Server>,
    session: &mut Session,
    spec: &CommandSpec,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    if spec.flags & CMD_BLOCKING != 0 && !session.in_exec {
        return execute_blocking(server, session, spec, argv);
    }
    if spec.flags & CMD_LOCK_FREE != 0 || session.in_exec {
        // inside EXEC the dispatcher already holds the exclusive lock
        return invoke(server, session, spec, argv);
    }
    if spec.flags & CMD_WRITE != 0 {
        let _guard = server.engine_lock.write().unwrap();
        invoke(server, session, spec, argv)
    } else {
        let _guard = server.engine_lock.read().unwrap();
        invoke(server, session, spec, argv)
    }
}

/// Call the handler and, when the store changed on a master, hand the
/// request (or its rewritten form) to the replication driver. Runs with
/// the appropriate lock already held.
pub(crate) fn invoke(
    server: &Arc<Server>,
    session: &mut Session,
    spec: &CommandSpec,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let dirty_before = server.store.dirty.load(Ordering::SeqCst);
    let result = (spec.handler)(server, session, argv);
    let dirty_after = server.store.dirty.load(Ordering::SeqCst);
    let overrides = session.prop_override.take();
    if dirty_after > dirty_before
        && server.repl.is_master()
        && !session.is_master_link
        && spec.flags & CMD_SELF_PROPAGATE == 0
    {
        match overrides {
            Some(commands) => {
                for command in commands {
                    master::propagate(server, &command);
                }
            }
            None => master::propagate(server, argv),
        }
    }
    result
}

/// Retry loop for blocking reads: attempt under the exclusive lock, park
/// registered under the same lock when the handler reports Block, wake on
/// notify/timeout and re-validate.
fn execute_blocking(
    server: &Arc<Server>,
    session: &mut Session,
    spec: &CommandSpec,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let mut deadline: Option<Option<Instant>> = None;
    loop {
        let (attempt, waiter) = {
            let _guard = server.engine_lock.write().unwrap();
            let attempt = invoke(server, session, spec, argv)?;
            let waiter = match &attempt {
                Reply::Block { keys, .. } => Some(server.blockers.register(keys)),
                _ => None,
            };
            (attempt, waiter)
        };
        match attempt {
            Reply::Block { keys, timeout_ms } => {
                let waiter = waiter.expect("waiter registered for Block");
                let deadline = *deadline.get_or_insert_with(|| {
                    if timeout_ms == 0 {
                        None
                    } else {
                        Some(Instant::now() + Duration::from_millis(timeout_ms))
                    }
                });
                let handle = session.handle.clone();
                waiter.wait(deadline, &handle.kill);
                server.blockers.unregister(&keys, &waiter);
                let expired = deadline.map_or(false, |d| Instant::now() >= d);
                if expired || handle.kill.load(Ordering::SeqCst) {
                    // final non-blocking attempt settles the timeout reply
                    let _guard = server.engine_lock.write().unwrap();
                    session.in_exec = true;
                    let last = invoke(server, session, spec, argv);
                    session.in_exec = false;
                    session.block_ids = None;
                    return last;
                }
            }
            other => {
                session.block_ids = None;
                return Ok(other);
            }
        }
    }
}

fn cluster_redirect(
    server: &Arc<Server>,
    session: &Session,
    spec: &CommandSpec,
    argv: &[Vec<u8>],
) -> Option<ServerError> {
    if spec.first_key == 0 || session.is_master_link {
        return None;
    }
    if !server.config.read().unwrap().cluster_enabled {
        return None;
    }
    let cluster = server.cluster.read().unwrap();
    let last = if spec.last_key < 0 {
        (argv.len() as i32 + spec.last_key) as usize
    } else {
        spec.last_key as usize
    };
    let mut slot: Option<u16> = None;
    let mut i = spec.first_key;
    while i <= last && i < argv.len() {
        let s = key_hash_slot(&argv[i]);
        match slot {
            None => slot = Some(s),
            Some(prev) if prev != s => return Some(ServerError::CrossSlot),
            _ => {}
        }
        i += spec.key_step.max(1);
    }
    let slot = slot?;
    if !cluster.owns_slot(slot) {
        let addr = cluster.slot_owner_addr(slot).unwrap_or_default();
        return Some(ServerError::Moved(slot, addr));
    }
    if let Some(target) = cluster.migrating_target(slot) {
        return Some(ServerError::Ask(slot, target));
    }
    None
}

/// Run one queued command inside an EXEC batch; the exclusive lock is held
/// by the dispatcher for the whole batch.
pub(crate) fn execute_queued(
    server: &Arc<Server>,
    session: &mut Session,
    argv: &[Vec<u8>],
) -> Frame {
    let name = String::from_utf8_lossy(&argv[0]).to_ascii_uppercase();
    let Some(spec) = lookup(&name) else {
        return ServerError::UnknownCommand(name.to_lowercase()).to_frame();
    };
    match invoke(server, session, spec, argv) {
        Ok(Reply::Frame(frame)) => frame,
        Ok(Reply::Multi(frames)) => Frame::Array(frames),
        Ok(Reply::None) | Ok(Reply::Block { .. }) => Frame::ok(),
        Err(e) => e.to_frame(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_is_consistent() {
        for spec in all_specs() {
            assert_eq!(spec.name.to_ascii_uppercase(), spec.name, "{}", spec.name);
            assert_ne!(spec.arity, 0, "{}", spec.name);
            if spec.first_key > 0 {
                assert!(spec.key_step >= 1, "{}", spec.name);
            }
        }
        assert!(lookup("GET").is_some());
        assert!(lookup("JSON.SET").is_some());
        assert!(lookup("NOPE").is_none());
    }

    #[test]
    fn blocking_commands_are_writes() {
        for name in ["BLPOP", "BRPOP", "BLMOVE", "BZPOPMIN", "XREADGROUP"] {
            let spec = lookup(name).unwrap();
            assert!(spec.flags & CMD_BLOCKING != 0);
            assert!(spec.flags & CMD_WRITE != 0);
        }
    }
}
