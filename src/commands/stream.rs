//! Stream commands: the append-only entry log plus consumer groups.
//!
//! Entries are individual records keyed by (ms, seq) big-endian, so range
//! reads are prefix scans. Consumer-group state (groups, consumers, PELs)
//! lives in one blob per stream; groups and consumers reference each other
//! through flat tables and small indices rather than pointers.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::client::Session;
use crate::commands::Reply;
use crate::errors::ServerError;
use crate::resp::Frame;
use crate::server::Server;
use crate::storage::encoding::{
    elem_prefix, groups_key, put_bytes, put_u32, put_u64, stream_entry_key, ByteReader, Meta,
    MetaAux, ValueTag, KIND_STREAM,
};
use crate::storage::Store;
use crate::util::{now_ms, parse_i64, parse_u64};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct StreamId {
    pub ms: u64,
    pub seq: u64,
}

impl StreamId {
    pub const MIN: StreamId = StreamId { ms: 0, seq: 0 };
    pub const MAX: StreamId = StreamId {
        ms: u64::MAX,
        seq: u64::MAX,
    };

    pub fn render(&self) -> Vec<u8> {
        format!("{}-{}", self.ms, self.seq).into_bytes()
    }

    fn next(&self) -> StreamId {
        if self.seq == u64::MAX {
            StreamId {
                ms: self.ms + 1,
                seq: 0,
            }
        } else {
            StreamId {
                ms: self.ms,
                seq: self.seq + 1,
            }
        }
    }
}

fn bad_id() -> ServerError {
    ServerError::other("Invalid stream ID specified as stream command argument")
}

/// `ms` or `ms-seq`; a missing sequence takes `default_seq`.
fn parse_id(raw: &[u8], default_seq: u64) -> Result<StreamId, ServerError> {
    let (ms_raw, seq_raw) = match raw.iter().position(|&b| b == b'-') {
        Some(dash) => (&raw[..dash], Some(&raw[dash + 1..])),
        None => (raw, None),
    };
    let ms = parse_u64(ms_raw).ok_or_else(bad_id)?;
    let seq = match seq_raw {
        Some(s) => parse_u64(s).ok_or_else(bad_id)?,
        None => default_seq,
    };
    Ok(StreamId { ms, seq })
}

/// Range start token: `-`, exclusive `(id`, or an id (seq defaults to 0).
fn parse_range_start(raw: &[u8]) -> Result<StreamId, ServerError> {
    match raw {
        b"-" => Ok(StreamId::MIN),
        _ if raw.first() == Some(&b'(') => Ok(parse_id(&raw[1..], 0)?.next()),
        _ => parse_id(raw, 0),
    }
}

/// Range end token: `+`, exclusive `(id`, or an id (seq defaults to max).
fn parse_range_end(raw: &[u8]) -> Result<StreamId, ServerError> {
    match raw {
        b"+" => Ok(StreamId::MAX),
        _ if raw.first() == Some(&b'(') => {
            let id = parse_id(&raw[1..], u64::MAX)?;
            if id == StreamId::MIN {
                return Err(bad_id());
            }
            Ok(StreamId {
                ms: if id.seq == 0 { id.ms - 1 } else { id.ms },
                seq: if id.seq == 0 { u64::MAX } else { id.seq - 1 },
            })
        }
        _ => parse_id(raw, u64::MAX),
    }
}

// -- entry payload ----------------------------------------------------------

fn encode_fields(fields: &[(Vec<u8>, Vec<u8>)]) -> Vec<u8> {
    let mut out = Vec::new();
    put_u32(&mut out, fields.len() as u32);
    for (field, value) in fields {
        put_bytes(&mut out, field);
        put_bytes(&mut out, value);
    }
    out
}

fn decode_fields(raw: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
    let mut reader = ByteReader::new(raw);
    let Some(count) = reader.u32() else {
        return Vec::new();
    };
    let mut out = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let (Some(field), Some(value)) = (reader.bytes(), reader.bytes()) else {
            break;
        };
        out.push((field, value));
    }
    out
}

fn entry_frame(id: StreamId, fields: Vec<(Vec<u8>, Vec<u8>)>) -> Frame {
    let mut inner = Vec::with_capacity(fields.len() * 2);
    for (field, value) in fields {
        inner.push(Frame::Bulk(field));
        inner.push(Frame::Bulk(value));
    }
    Frame::Array(vec![Frame::Bulk(id.render()), Frame::Array(inner)])
}

// -- consumer group state ---------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct StreamGroups {
    pub groups: Vec<Group>,
}

#[derive(Debug, Clone)]
pub struct Group {
    pub name: Vec<u8>,
    pub last: StreamId,
    pub entries_read: u64,
    pub consumers: Vec<Consumer>,
    /// Delivered-but-unacknowledged entries: id -> owning consumer index
    /// plus delivery bookkeeping.
    pub pel: BTreeMap<(u64, u64), PelEntry>,
}

#[derive(Debug, Clone)]
pub struct Consumer {
    pub name: Vec<u8>,
    pub seen_ms: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct PelEntry {
    pub consumer: usize,
    pub delivery_ms: u64,
    pub delivery_count: u64,
}

impl StreamGroups {
    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        put_u32(&mut out, self.groups.len() as u32);
        for group in &self.groups {
            put_bytes(&mut out, &group.name);
            put_u64(&mut out, group.last.ms);
            put_u64(&mut out, group.last.seq);
            put_u64(&mut out, group.entries_read);
            put_u32(&mut out, group.consumers.len() as u32);
            for consumer in &group.consumers {
                put_bytes(&mut out, &consumer.name);
                put_u64(&mut out, consumer.seen_ms);
            }
            put_u32(&mut out, group.pel.len() as u32);
            for ((ms, seq), entry) in &group.pel {
                put_u64(&mut out, *ms);
                put_u64(&mut out, *seq);
                put_u32(&mut out, entry.consumer as u32);
                put_u64(&mut out, entry.delivery_ms);
                put_u64(&mut out, entry.delivery_count);
            }
        }
        out
    }

    fn decode(raw: &[u8]) -> Option<StreamGroups> {
        let mut reader = ByteReader::new(raw);
        let group_count = reader.u32()?;
        let mut groups = Vec::with_capacity(group_count as usize);
        for _ in 0..group_count {
            let name = reader.bytes()?;
            let last = StreamId {
                ms: reader.u64()?,
                seq: reader.u64()?,
            };
            let entries_read = reader.u64()?;
            let consumer_count = reader.u32()?;
            let mut consumers = Vec::with_capacity(consumer_count as usize);
            for _ in 0..consumer_count {
                consumers.push(Consumer {
                    name: reader.bytes()?,
                    seen_ms: reader.u64()?,
                });
            }
            let pel_count = reader.u32()?;
            let mut pel = BTreeMap::new();
            for _ in 0..pel_count {
                let ms = reader.u64()?;
                let seq = reader.u64()?;
                pel.insert(
                    (ms, seq),
                    PelEntry {
                        consumer: reader.u32()? as usize,
                        delivery_ms: reader.u64()?,
                        delivery_count: reader.u64()?,
                    },
                );
            }
            groups.push(Group {
                name,
                last,
                entries_read,
                consumers,
                pel,
            });
        }
        Some(StreamGroups { groups })
    }

    fn group_mut(&mut self, name: &[u8]) -> Option<&mut Group> {
        self.groups.iter_mut().find(|g| g.name == name)
    }

    fn group(&self, name: &[u8]) -> Option<&Group> {
        self.groups.iter().find(|g| g.name == name)
    }
}

impl Group {
    /// Index of the named consumer, creating it on first sight.
    fn consumer_index(&mut self, name: &[u8], now: u64) -> usize {
        if let Some(idx) = self.consumers.iter().position(|c| c.name == name) {
            self.consumers[idx].seen_ms = now;
            return idx;
        }
        self.consumers.push(Consumer {
            name: name.to_vec(),
            seen_ms: now,
        });
        self.consumers.len() - 1
    }
}

fn load_groups(store: &Store, key: &[u8]) -> Result<StreamGroups, ServerError> {
    Ok(store
        .db()
        .get(groups_key(key))?
        .and_then(|raw| StreamGroups::decode(&raw))
        .unwrap_or_default())
}

fn save_groups(store: &Store, key: &[u8], groups: &StreamGroups) -> Result<(), ServerError> {
    if groups.groups.is_empty() {
        store.db().remove(groups_key(key))?;
    } else {
        store.db().insert(groups_key(key), groups.encode())?;
    }
    Ok(())
}

// -- stream access ----------------------------------------------------------

fn stream_meta(store: &Store, key: &[u8]) -> Result<Option<Meta>, ServerError> {
    store.meta_expect(key, &[ValueTag::Stream])
}

fn stream_aux(meta: &Meta) -> (StreamId, u64, u64) {
    match meta.aux {
        MetaAux::Stream {
            last_ms,
            last_seq,
            len,
            entries_added,
        } => (
            StreamId {
                ms: last_ms,
                seq: last_seq,
            },
            len,
            entries_added,
        ),
        _ => (StreamId::MIN, 0, 0),
    }
}

fn write_stream_meta(
    store: &Store,
    key: &[u8],
    mut meta: Meta,
    last: StreamId,
    len: u64,
    entries_added: u64,
) -> Result<(), ServerError> {
    meta.aux = MetaAux::Stream {
        last_ms: last.ms,
        last_seq: last.seq,
        len,
        entries_added,
    };
    store.write_meta(key, &meta)?;
    store.bump(key);
    Ok(())
}

fn entries_range(
    store: &Store,
    key: &[u8],
    start: StreamId,
    end: StreamId,
    count: Option<usize>,
    reverse: bool,
) -> Result<Vec<(StreamId, Vec<(Vec<u8>, Vec<u8>)>)>, ServerError> {
    if start > end {
        return Ok(Vec::new());
    }
    let prefix = elem_prefix(KIND_STREAM, key);
    let from = stream_entry_key(key, start.ms, start.seq);
    let mut out = Vec::new();
    for item in store.db().range(from..) {
        let (k, v) = item?;
        if !k.starts_with(&prefix) {
            break;
        }
        let suffix = &k[prefix.len()..];
        let id = StreamId {
            ms: u64::from_be_bytes(suffix[..8].try_into().unwrap()),
            seq: u64::from_be_bytes(suffix[8..16].try_into().unwrap()),
        };
        if id > end {
            break;
        }
        out.push((id, decode_fields(&v)));
        if !reverse {
            if let Some(limit) = count {
                if out.len() >= limit {
                    break;
                }
            }
        }
    }
    if reverse {
        out.reverse();
        if let Some(limit) = count {
            out.truncate(limit);
        }
    }
    Ok(out)
}

fn entry_at(
    store: &Store,
    key: &[u8],
    id: StreamId,
) -> Result<Option<Vec<(Vec<u8>, Vec<u8>)>>, ServerError> {
    Ok(store
        .db()
        .get(stream_entry_key(key, id.ms, id.seq))?
        .map(|v| decode_fields(&v)))
}

// -- XADD / XTRIM / XDEL ----------------------------------------------------

enum TrimSpec {
    MaxLen(u64),
    MinId(StreamId),
}

fn parse_trim(
    argv: &[Vec<u8>],
    i: &mut usize,
) -> Result<Option<TrimSpec>, ServerError> {
    let strategy = argv[*i].to_ascii_uppercase();
    let spec = match strategy.as_slice() {
        b"MAXLEN" | b"MINID" => {
            *i += 1;
            // `~` (approximate) and `=` (exact) are both honored exactly
            if let Some(tok) = argv.get(*i) {
                if tok.as_slice() == b"~" || tok.as_slice() == b"=" {
                    *i += 1;
                }
            }
            let raw = argv.get(*i).ok_or(ServerError::Syntax)?;
            let spec = if strategy.as_slice() == b"MAXLEN" {
                TrimSpec::MaxLen(
                    parse_i64(raw)
                        .filter(|n| *n >= 0)
                        .ok_or(ServerError::NotInteger)? as u64,
                )
            } else {
                TrimSpec::MinId(parse_id(raw, 0)?)
            };
            *i += 1;
            Some(spec)
        }
        _ => None,
    };
    Ok(spec)
}

fn apply_trim(
    store: &Store,
    key: &[u8],
    len: &mut u64,
    spec: &TrimSpec,
) -> Result<u64, ServerError> {
    let prefix = elem_prefix(KIND_STREAM, key);
    let mut removed = 0;
    for item in store.db().scan_prefix(&prefix) {
        let (k, _) = item?;
        let suffix = &k[prefix.len()..];
        let id = StreamId {
            ms: u64::from_be_bytes(suffix[..8].try_into().unwrap()),
            seq: u64::from_be_bytes(suffix[8..16].try_into().unwrap()),
        };
        let evict = match spec {
            TrimSpec::MaxLen(max) => *len > *max,
            TrimSpec::MinId(min) => id < *min,
        };
        if !evict {
            break;
        }
        store.db().remove(k)?;
        *len -= 1;
        removed += 1;
    }
    Ok(removed)
}

pub fn xadd_command(
    server: &Arc<Server>,
    session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let store = &server.store;
    let key = &argv[1];
    let mut i = 2;
    let mut nomkstream = false;
    let mut trim: Option<TrimSpec> = None;
    loop {
        let token = argv.get(i).ok_or(ServerError::Syntax)?;
        match token.to_ascii_uppercase().as_slice() {
            b"NOMKSTREAM" => {
                nomkstream = true;
                i += 1;
            }
            b"MAXLEN" | b"MINID" => {
                trim = parse_trim(argv, &mut i)?;
            }
            _ => break,
        }
    }
    let id_raw = argv.get(i).ok_or(ServerError::Syntax)?.clone();
    i += 1;
    let fields_raw = &argv[i..];
    if fields_raw.is_empty() || fields_raw.len() % 2 != 0 {
        return Err(ServerError::WrongArity("xadd".into()));
    }

    let meta = stream_meta(store, key)?;
    if meta.is_none() && nomkstream {
        return Ok(Frame::Null.into());
    }
    let meta = meta.unwrap_or_else(|| Meta::new(ValueTag::Stream));
    let (last, mut len, entries_added) = stream_aux(&meta);

    let now = now_ms();
    let id = if id_raw.as_slice() == b"*" {
        if now > last.ms {
            StreamId { ms: now, seq: 0 }
        } else {
            last.next()
        }
    } else if id_raw.ends_with(b"-*") {
        let ms = parse_u64(&id_raw[..id_raw.len() - 2]).ok_or_else(bad_id)?;
        if ms < last.ms {
            return Err(ServerError::other(
                "The ID specified in XADD is equal or smaller than the target stream top item",
            ));
        }
        if ms == last.ms {
            last.next()
        } else {
            StreamId { ms, seq: 0 }
        }
    } else {
        let id = parse_id(&id_raw, 0)?;
        if id == StreamId::MIN {
            return Err(ServerError::other(
                "The ID specified in XADD must be greater than 0-0",
            ));
        }
        if id <= last && (len > 0 || last != StreamId::MIN) {
            return Err(ServerError::other(
                "The ID specified in XADD is equal or smaller than the target stream top item",
            ));
        }
        id
    };

    let fields: Vec<(Vec<u8>, Vec<u8>)> = fields_raw
        .chunks(2)
        .map(|pair| (pair[0].clone(), pair[1].clone()))
        .collect();
    store
        .db()
        .insert(stream_entry_key(key, id.ms, id.seq), encode_fields(&fields))?;
    len += 1;
    if let Some(spec) = &trim {
        apply_trim(store, key, &mut len, spec)?;
    }
    write_stream_meta(store, key, meta, id, len, entries_added + 1)?;
    server.blockers.notify_key(key);

    // auto-generated ids replicate as the concrete id
    let mut rewritten = argv.to_vec();
    rewritten[i - 1] = id.render();
    session.prop_override = Some(vec![rewritten]);

    Ok(Frame::Bulk(id.render()).into())
}

pub fn xlen_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let len = stream_meta(&server.store, &argv[1])?
        .map(|m| m.len())
        .unwrap_or(0);
    Ok(Frame::Integer(len as i64).into())
}

fn xrange_generic(
    server: &Arc<Server>,
    argv: &[Vec<u8>],
    reverse: bool,
) -> Result<Reply, ServerError> {
    let (start_raw, end_raw) = if reverse {
        (&argv[3], &argv[2])
    } else {
        (&argv[2], &argv[3])
    };
    let start = parse_range_start(start_raw)?;
    let end = parse_range_end(end_raw)?;
    let count = match argv.get(4) {
        Some(tok) if tok.eq_ignore_ascii_case(b"COUNT") => {
            let n = argv
                .get(5)
                .and_then(|a| parse_i64(a))
                .ok_or(ServerError::NotInteger)?;
            Some(n.max(0) as usize)
        }
        Some(_) => return Err(ServerError::Syntax),
        None => None,
    };
    let store = &server.store;
    if stream_meta(store, &argv[1])?.is_none() {
        return Ok(Frame::Array(vec![]).into());
    }
    let entries = entries_range(store, &argv[1], start, end, count, reverse)?;
    Ok(Frame::Array(
        entries
            .into_iter()
            .map(|(id, fields)| entry_frame(id, fields))
            .collect(),
    )
    .into())
}

pub fn xrange_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    xrange_generic(server, argv, false)
}

pub fn xrevrange_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    xrange_generic(server, argv, true)
}

pub fn xdel_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let store = &server.store;
    let key = &argv[1];
    let Some(meta) = stream_meta(store, key)? else {
        return Ok(Frame::Integer(0).into());
    };
    let (last, mut len, entries_added) = stream_aux(&meta);
    let mut removed = 0;
    for raw in &argv[2..] {
        let id = parse_id(raw, 0)?;
        if store
            .db()
            .remove(stream_entry_key(key, id.ms, id.seq))?
            .is_some()
        {
            removed += 1;
            len -= 1;
        }
    }
    if removed > 0 {
        // a stream with groups survives at zero length
        write_stream_meta(store, key, meta, last, len, entries_added)?;
    }
    Ok(Frame::Integer(removed).into())
}

pub fn xtrim_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let store = &server.store;
    let key = &argv[1];
    let mut i = 2;
    let Some(spec) = parse_trim(argv, &mut i)? else {
        return Err(ServerError::Syntax);
    };
    let Some(meta) = stream_meta(store, key)? else {
        return Ok(Frame::Integer(0).into());
    };
    let (last, mut len, entries_added) = stream_aux(&meta);
    let removed = apply_trim(store, key, &mut len, &spec)?;
    if removed > 0 {
        write_stream_meta(store, key, meta, last, len, entries_added)?;
    }
    Ok(Frame::Integer(removed as i64).into())
}

pub fn xsetid_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let store = &server.store;
    let key = &argv[1];
    let id = parse_id(&argv[2], 0)?;
    let Some(meta) = stream_meta(store, key)? else {
        return Err(ServerError::other(
            "The XSETID command requires the key to exist.",
        ));
    };
    let (_, len, entries_added) = stream_aux(&meta);
    let top = entries_range(store, key, StreamId::MIN, StreamId::MAX, None, true)?
        .first()
        .map(|(id, _)| *id);
    if let Some(top) = top {
        if id < top {
            return Err(ServerError::other(
                "The ID specified in XSETID is smaller than the target stream top item",
            ));
        }
    }
    write_stream_meta(store, key, meta, id, len, entries_added)?;
    Ok(Frame::ok().into())
}

// -- XREAD ------------------------------------------------------------------

struct ReadSpec {
    count: Option<usize>,
    block_ms: Option<u64>,
    keys: Vec<Vec<u8>>,
    ids: Vec<Vec<u8>>,
}

fn parse_read_args(argv: &[Vec<u8>], mut i: usize) -> Result<ReadSpec, ServerError> {
    let mut count = None;
    let mut block_ms = None;
    while i < argv.len() {
        match argv[i].to_ascii_uppercase().as_slice() {
            b"COUNT" => {
                let n = argv
                    .get(i + 1)
                    .and_then(|a| parse_i64(a))
                    .ok_or(ServerError::NotInteger)?;
                count = Some(n.max(0) as usize);
                i += 2;
            }
            b"BLOCK" => {
                let n = argv
                    .get(i + 1)
                    .and_then(|a| parse_i64(a))
                    .ok_or_else(|| ServerError::other("timeout is not an integer or out of range"))?;
                if n < 0 {
                    return Err(ServerError::other("timeout is negative"));
                }
                block_ms = Some(n as u64);
                i += 2;
            }
            b"STREAMS" => {
                let rest = &argv[i + 1..];
                if rest.is_empty() || rest.len() % 2 != 0 {
                    return Err(ServerError::other(
                        "Unbalanced XREAD list of streams: for each stream key an ID or '$' must be specified.",
                    ));
                }
                let half = rest.len() / 2;
                return Ok(ReadSpec {
                    count,
                    block_ms,
                    keys: rest[..half].to_vec(),
                    ids: rest[half..].to_vec(),
                });
            }
            _ => return Err(ServerError::Syntax),
        }
    }
    Err(ServerError::Syntax)
}

pub fn xread_command(
    server: &Arc<Server>,
    session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let spec = parse_read_args(argv, 1)?;
    let store = &server.store;

    // resolve `$` once; pinned ids survive the block-retry loop
    let resolved: Vec<(u64, u64)> = match &session.block_ids {
        Some(pinned) => pinned.clone(),
        None => {
            let mut resolved = Vec::with_capacity(spec.keys.len());
            for (key, id_raw) in spec.keys.iter().zip(&spec.ids) {
                let id = if id_raw.as_slice() == b"$" {
                    match stream_meta(store, key)? {
                        Some(meta) => stream_aux(&meta).0,
                        None => StreamId::MIN,
                    }
                } else {
                    parse_id(id_raw, 0)?
                };
                resolved.push((id.ms, id.seq));
            }
            session.block_ids = Some(resolved.clone());
            resolved
        }
    };

    let mut per_key = Vec::new();
    for (key, &(ms, seq)) in spec.keys.iter().zip(&resolved) {
        if stream_meta(store, key)?.is_none() {
            continue;
        }
        let after = StreamId { ms, seq }.next();
        let entries = entries_range(store, key, after, StreamId::MAX, spec.count, false)?;
        if !entries.is_empty() {
            per_key.push(Frame::Array(vec![
                Frame::Bulk(key.clone()),
                Frame::Array(
                    entries
                        .into_iter()
                        .map(|(id, fields)| entry_frame(id, fields))
                        .collect(),
                ),
            ]));
        }
    }
    if !per_key.is_empty() {
        session.block_ids = None;
        return Ok(Frame::Array(per_key).into());
    }
    match spec.block_ms {
        Some(timeout_ms) if !session.in_exec => Ok(Reply::Block {
            keys: spec.keys,
            timeout_ms,
        }),
        _ => {
            session.block_ids = None;
            Ok(Frame::NullArray.into())
        }
    }
}

// -- consumer groups --------------------------------------------------------

fn nogroup(key: &[u8], group: &[u8]) -> ServerError {
    ServerError::raw(format!(
        "NOGROUP No such consumer group '{}' for key name '{}'",
        String::from_utf8_lossy(group),
        String::from_utf8_lossy(key)
    ))
}

pub fn xgroup_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let store = &server.store;
    let sub = argv[1].to_ascii_uppercase();
    match sub.as_slice() {
        b"CREATE" => {
            if argv.len() < 5 {
                return Err(ServerError::WrongArity("xgroup".into()));
            }
            let key = &argv[2];
            let mkstream = argv
                .get(5)
                .map_or(false, |t| t.eq_ignore_ascii_case(b"MKSTREAM"));
            let meta = match stream_meta(store, key)? {
                Some(meta) => meta,
                None if mkstream => {
                    let meta = Meta::new(ValueTag::Stream);
                    store.write_meta(key, &meta)?;
                    store.bump(key);
                    meta
                }
                None => {
                    return Err(ServerError::other(
                        "The XGROUP subcommand requires the key to exist. Note that for CREATE you may want to use the MKSTREAM option to create an empty stream automatically.",
                    ))
                }
            };
            let last = if argv[4].as_slice() == b"$" {
                stream_aux(&meta).0
            } else {
                parse_id(&argv[4], 0)?
            };
            let mut groups = load_groups(store, key)?;
            if groups.group(&argv[3]).is_some() {
                return Err(ServerError::raw(
                    "BUSYGROUP Consumer Group name already exists",
                ));
            }
            groups.groups.push(Group {
                name: argv[3].clone(),
                last,
                entries_read: 0,
                consumers: Vec::new(),
                pel: BTreeMap::new(),
            });
            save_groups(store, key, &groups)?;
            store.bump(key);
            Ok(Frame::ok().into())
        }
        b"DESTROY" => {
            if argv.len() != 4 {
                return Err(ServerError::WrongArity("xgroup".into()));
            }
            let key = &argv[2];
            if stream_meta(store, key)?.is_none() {
                return Ok(Frame::Integer(0).into());
            }
            let mut groups = load_groups(store, key)?;
            let before = groups.groups.len();
            groups.groups.retain(|g| g.name != argv[3]);
            let removed = before - groups.groups.len();
            save_groups(store, key, &groups)?;
            store.bump(key);
            Ok(Frame::Integer(removed as i64).into())
        }
        b"CREATECONSUMER" => {
            if argv.len() != 5 {
                return Err(ServerError::WrongArity("xgroup".into()));
            }
            let key = &argv[2];
            stream_meta(store, key)?.ok_or_else(|| nogroup(key, &argv[3]))?;
            let mut groups = load_groups(store, key)?;
            let group = groups.group_mut(&argv[3]).ok_or_else(|| nogroup(key, &argv[3]))?;
            let created = if group.consumers.iter().any(|c| c.name == argv[4]) {
                0
            } else {
                group.consumer_index(&argv[4], now_ms());
                1
            };
            save_groups(store, key, &groups)?;
            store.bump(key);
            Ok(Frame::Integer(created).into())
        }
        b"DELCONSUMER" => {
            if argv.len() != 5 {
                return Err(ServerError::WrongArity("xgroup".into()));
            }
            let key = &argv[2];
            stream_meta(store, key)?.ok_or_else(|| nogroup(key, &argv[3]))?;
            let mut groups = load_groups(store, key)?;
            let group = groups.group_mut(&argv[3]).ok_or_else(|| nogroup(key, &argv[3]))?;
            let Some(idx) = group.consumers.iter().position(|c| c.name == argv[4]) else {
                return Ok(Frame::Integer(0).into());
            };
            let pending: Vec<(u64, u64)> = group
                .pel
                .iter()
                .filter(|(_, e)| e.consumer == idx)
                .map(|(id, _)| *id)
                .collect();
            let count = pending.len();
            for id in pending {
                group.pel.remove(&id);
            }
            group.consumers.remove(idx);
            // indices above the removed consumer shift down
            for entry in group.pel.values_mut() {
                if entry.consumer > idx {
                    entry.consumer -= 1;
                }
            }
            save_groups(store, key, &groups)?;
            store.bump(key);
            Ok(Frame::Integer(count as i64).into())
        }
        b"SETID" => {
            if argv.len() < 5 {
                return Err(ServerError::WrongArity("xgroup".into()));
            }
            let key = &argv[2];
            let meta = stream_meta(store, key)?.ok_or_else(|| nogroup(key, &argv[3]))?;
            let mut groups = load_groups(store, key)?;
            let last = if argv[4].as_slice() == b"$" {
                stream_aux(&meta).0
            } else {
                parse_id(&argv[4], 0)?
            };
            let group = groups.group_mut(&argv[3]).ok_or_else(|| nogroup(key, &argv[3]))?;
            group.last = last;
            save_groups(store, key, &groups)?;
            store.bump(key);
            Ok(Frame::ok().into())
        }
        _ => Err(ServerError::other(format!(
            "Unknown XGROUP subcommand or wrong number of arguments for '{}'",
            String::from_utf8_lossy(&argv[1])
        ))),
    }
}

pub fn xreadgroup_command(
    server: &Arc<Server>,
    session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    if !argv[1].eq_ignore_ascii_case(b"GROUP") {
        return Err(ServerError::Syntax);
    }
    let group_name = argv[2].clone();
    let consumer_name = argv[3].clone();
    let mut noack = false;
    let mut i = 4;
    // NOACK can appear among the options; the rest is shared with XREAD
    let mut filtered: Vec<Vec<u8>> = argv[..1].to_vec();
    while i < argv.len() {
        if argv[i].eq_ignore_ascii_case(b"NOACK") {
            noack = true;
            i += 1;
        } else {
            filtered.push(argv[i].clone());
            i += 1;
        }
    }
    let spec = parse_read_args(&filtered, 1)?;
    let store = &server.store;
    let now = now_ms();

    let mut per_key = Vec::new();
    for (key, id_raw) in spec.keys.iter().zip(&spec.ids) {
        stream_meta(store, key)?.ok_or_else(|| nogroup(key, &group_name))?;
        let mut groups = load_groups(store, key)?;
        let group = groups
            .group_mut(&group_name)
            .ok_or_else(|| nogroup(key, &group_name))?;
        let consumer = group.consumer_index(&consumer_name, now);

        let mut entry_frames = Vec::new();
        if id_raw.as_slice() == b">" {
            let after = group.last.next();
            let entries = entries_range(store, key, after, StreamId::MAX, spec.count, false)?;
            for (id, fields) in entries {
                group.last = id;
                group.entries_read += 1;
                if !noack {
                    group.pel.insert(
                        (id.ms, id.seq),
                        PelEntry {
                            consumer,
                            delivery_ms: now,
                            delivery_count: 1,
                        },
                    );
                }
                entry_frames.push(entry_frame(id, fields));
            }
            save_groups(store, key, &groups)?;
            store.bump(key);
        } else {
            // history replay from this consumer's PEL
            let from = parse_id(id_raw, 0)?;
            let ids: Vec<(u64, u64)> = group
                .pel
                .iter()
                .filter(|((ms, seq), e)| {
                    e.consumer == consumer && StreamId { ms: *ms, seq: *seq } >= from
                })
                .map(|(id, _)| *id)
                .take(spec.count.unwrap_or(usize::MAX))
                .collect();
            for (ms, seq) in ids {
                let id = StreamId { ms, seq };
                let fields = entry_at(store, key, id)?.unwrap_or_default();
                entry_frames.push(entry_frame(id, fields));
            }
        }
        if !entry_frames.is_empty() || id_raw.as_slice() != b">" {
            per_key.push(Frame::Array(vec![
                Frame::Bulk(key.clone()),
                Frame::Array(entry_frames),
            ]));
        }
    }

    let has_data = per_key.iter().any(|frame| match frame {
        Frame::Array(parts) => !matches!(&parts[1], Frame::Array(e) if e.is_empty()),
        _ => false,
    });
    if has_data || spec.ids.iter().any(|id| id.as_slice() != b">") {
        return Ok(Frame::Array(per_key).into());
    }
    match spec.block_ms {
        Some(timeout_ms) if !session.in_exec => Ok(Reply::Block {
            keys: spec.keys,
            timeout_ms,
        }),
        _ => Ok(Frame::NullArray.into()),
    }
}

pub fn xack_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let store = &server.store;
    let key = &argv[1];
    if stream_meta(store, key)?.is_none() {
        return Ok(Frame::Integer(0).into());
    }
    let mut groups = load_groups(store, key)?;
    let Some(group) = groups.group_mut(&argv[2]) else {
        return Ok(Frame::Integer(0).into());
    };
    let mut acked = 0;
    for raw in &argv[3..] {
        let id = parse_id(raw, 0)?;
        if group.pel.remove(&(id.ms, id.seq)).is_some() {
            acked += 1;
        }
    }
    if acked > 0 {
        save_groups(store, key, &groups)?;
        store.bump(key);
    }
    Ok(Frame::Integer(acked).into())
}

pub fn xpending_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let store = &server.store;
    let key = &argv[1];
    stream_meta(store, key)?.ok_or_else(|| nogroup(key, &argv[2]))?;
    let groups = load_groups(store, key)?;
    let group = groups.group(&argv[2]).ok_or_else(|| nogroup(key, &argv[2]))?;

    if argv.len() == 3 {
        // summary form
        if group.pel.is_empty() {
            return Ok(Frame::Array(vec![
                Frame::Integer(0),
                Frame::Null,
                Frame::Null,
                Frame::NullArray,
            ])
            .into());
        }
        let min = group.pel.keys().next().unwrap();
        let max = group.pel.keys().next_back().unwrap();
        let mut per_consumer: BTreeMap<usize, u64> = BTreeMap::new();
        for entry in group.pel.values() {
            *per_consumer.entry(entry.consumer).or_insert(0) += 1;
        }
        let consumers = per_consumer
            .into_iter()
            .map(|(idx, count)| {
                Frame::Array(vec![
                    Frame::Bulk(group.consumers[idx].name.clone()),
                    Frame::bulk(count.to_string().into_bytes()),
                ])
            })
            .collect();
        return Ok(Frame::Array(vec![
            Frame::Integer(group.pel.len() as i64),
            Frame::Bulk(StreamId { ms: min.0, seq: min.1 }.render()),
            Frame::Bulk(StreamId { ms: max.0, seq: max.1 }.render()),
            Frame::Array(consumers),
        ])
        .into());
    }

    // extended form: [IDLE ms] start end count [consumer]
    let mut i = 3;
    let mut min_idle = 0u64;
    if argv[i].eq_ignore_ascii_case(b"IDLE") {
        min_idle = argv
            .get(i + 1)
            .and_then(|a| parse_u64(a))
            .ok_or(ServerError::NotInteger)?;
        i += 2;
    }
    if argv.len() < i + 3 {
        return Err(ServerError::Syntax);
    }
    let start = parse_range_start(&argv[i])?;
    let end = parse_range_end(&argv[i + 1])?;
    let count = parse_i64(&argv[i + 2]).ok_or(ServerError::NotInteger)?;
    let consumer_filter = argv.get(i + 3).cloned();
    let now = now_ms();
    let mut out = Vec::new();
    for ((ms, seq), entry) in &group.pel {
        let id = StreamId { ms: *ms, seq: *seq };
        if id < start || id > end {
            continue;
        }
        let idle = now.saturating_sub(entry.delivery_ms);
        if idle < min_idle {
            continue;
        }
        if let Some(filter) = &consumer_filter {
            if group.consumers[entry.consumer].name != *filter {
                continue;
            }
        }
        out.push(Frame::Array(vec![
            Frame::Bulk(id.render()),
            Frame::Bulk(group.consumers[entry.consumer].name.clone()),
            Frame::Integer(idle as i64),
            Frame::Integer(entry.delivery_count as i64),
        ]));
        if out.len() >= count.max(0) as usize {
            break;
        }
    }
    Ok(Frame::Array(out).into())
}

pub fn xclaim_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let store = &server.store;
    let key = &argv[1];
    stream_meta(store, key)?.ok_or_else(|| nogroup(key, &argv[2]))?;
    let min_idle = parse_u64(&argv[4]).ok_or(ServerError::NotInteger)?;
    let mut ids = Vec::new();
    let mut justid = false;
    let mut force = false;
    let mut i = 5;
    while i < argv.len() {
        match argv[i].to_ascii_uppercase().as_slice() {
            b"JUSTID" => justid = true,
            b"FORCE" => force = true,
            b"IDLE" | b"TIME" | b"RETRYCOUNT" | b"LASTID" => i += 1, // value consumed below
            _ => ids.push(parse_id(&argv[i], 0)?),
        }
        i += 1;
    }
    let mut groups = load_groups(store, key)?;
    let group = groups.group_mut(&argv[2]).ok_or_else(|| nogroup(key, &argv[2]))?;
    let now = now_ms();
    let consumer = group.consumer_index(&argv[3], now);
    let mut out = Vec::new();
    let mut changed = false;
    for id in ids {
        let pel_key = (id.ms, id.seq);
        let entry_exists = entry_at(store, key, id)?.is_some();
        let claimable = match group.pel.get(&pel_key) {
            Some(entry) => now.saturating_sub(entry.delivery_ms) >= min_idle,
            None => force && entry_exists,
        };
        if !claimable {
            continue;
        }
        if !entry_exists {
            // entry vanished (XDEL/trim): drop the stale PEL entry
            group.pel.remove(&pel_key);
            changed = true;
            continue;
        }
        let delivery_count = group
            .pel
            .get(&pel_key)
            .map(|e| e.delivery_count + if justid { 0 } else { 1 })
            .unwrap_or(1);
        group.pel.insert(
            pel_key,
            PelEntry {
                consumer,
                delivery_ms: now,
                delivery_count,
            },
        );
        changed = true;
        if justid {
            out.push(Frame::Bulk(id.render()));
        } else {
            let fields = entry_at(store, key, id)?.unwrap_or_default();
            out.push(entry_frame(id, fields));
        }
    }
    if changed {
        save_groups(store, key, &groups)?;
        store.bump(key);
    }
    Ok(Frame::Array(out).into())
}

pub fn xautoclaim_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let store = &server.store;
    let key = &argv[1];
    stream_meta(store, key)?.ok_or_else(|| nogroup(key, &argv[2]))?;
    let min_idle = parse_u64(&argv[4]).ok_or(ServerError::NotInteger)?;
    let start = parse_range_start(&argv[5])?;
    let mut count = 100usize;
    let mut justid = false;
    let mut i = 6;
    while i < argv.len() {
        match argv[i].to_ascii_uppercase().as_slice() {
            b"COUNT" => {
                count = argv
                    .get(i + 1)
                    .and_then(|a| parse_i64(a))
                    .filter(|n| *n > 0)
                    .ok_or(ServerError::NotInteger)? as usize;
                i += 2;
            }
            b"JUSTID" => {
                justid = true;
                i += 1;
            }
            _ => return Err(ServerError::Syntax),
        }
    }
    let mut groups = load_groups(store, key)?;
    let group = groups.group_mut(&argv[2]).ok_or_else(|| nogroup(key, &argv[2]))?;
    let now = now_ms();
    let consumer = group.consumer_index(&argv[3], now);

    let candidates: Vec<(u64, u64)> = group
        .pel
        .range((start.ms, start.seq)..)
        .map(|(id, _)| *id)
        .collect();
    let mut claimed = Vec::new();
    let mut deleted = Vec::new();
    let mut next_cursor = StreamId::MIN;
    let mut scanned = 0usize;
    let mut changed = false;
    for (ms, seq) in candidates {
        if scanned >= count {
            next_cursor = StreamId { ms, seq };
            break;
        }
        scanned += 1;
        let id = StreamId { ms, seq };
        let entry = group.pel[&(ms, seq)];
        if now.saturating_sub(entry.delivery_ms) < min_idle {
            continue;
        }
        match entry_at(store, key, id)? {
            None => {
                group.pel.remove(&(ms, seq));
                deleted.push(Frame::Bulk(id.render()));
                changed = true;
            }
            Some(fields) => {
                group.pel.insert(
                    (ms, seq),
                    PelEntry {
                        consumer,
                        delivery_ms: now,
                        delivery_count: entry.delivery_count + if justid { 0 } else { 1 },
                    },
                );
                changed = true;
                if justid {
                    claimed.push(Frame::Bulk(id.render()));
                } else {
                    claimed.push(entry_frame(id, fields));
                }
            }
        }
    }
    if changed {
        save_groups(store, key, &groups)?;
        store.bump(key);
    }
    Ok(Frame::Array(vec![
        Frame::Bulk(next_cursor.render()),
        Frame::Array(claimed),
        Frame::Array(deleted),
    ])
    .into())
}

pub fn xinfo_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let store = &server.store;
    let sub = argv[1].to_ascii_uppercase();
    let key = &argv[2];
    let Some(meta) = stream_meta(store, key)? else {
        return Err(ServerError::NoSuchKey);
    };
    let (last, len, entries_added) = stream_aux(&meta);
    let groups = load_groups(store, key)?;
    match sub.as_slice() {
        b"STREAM" => {
            let first = entries_range(store, key, StreamId::MIN, StreamId::MAX, Some(1), false)?
                .into_iter()
                .next();
            let last_entry = entries_range(store, key, StreamId::MIN, StreamId::MAX, Some(1), true)?
                .into_iter()
                .next();
            Ok(Frame::Array(vec![
                Frame::bulk(&b"length"[..]),
                Frame::Integer(len as i64),
                Frame::bulk(&b"last-generated-id"[..]),
                Frame::Bulk(last.render()),
                Frame::bulk(&b"entries-added"[..]),
                Frame::Integer(entries_added as i64),
                Frame::bulk(&b"groups"[..]),
                Frame::Integer(groups.groups.len() as i64),
                Frame::bulk(&b"first-entry"[..]),
                first.map_or(Frame::Null, |(id, fields)| entry_frame(id, fields)),
                Frame::bulk(&b"last-entry"[..]),
                last_entry.map_or(Frame::Null, |(id, fields)| entry_frame(id, fields)),
            ])
            .into())
        }
        b"GROUPS" => {
            let out = groups
                .groups
                .iter()
                .map(|group| {
                    Frame::Array(vec![
                        Frame::bulk(&b"name"[..]),
                        Frame::Bulk(group.name.clone()),
                        Frame::bulk(&b"consumers"[..]),
                        Frame::Integer(group.consumers.len() as i64),
                        Frame::bulk(&b"pending"[..]),
                        Frame::Integer(group.pel.len() as i64),
                        Frame::bulk(&b"last-delivered-id"[..]),
                        Frame::Bulk(group.last.render()),
                        Frame::bulk(&b"entries-read"[..]),
                        Frame::Integer(group.entries_read as i64),
                    ])
                })
                .collect();
            Ok(Frame::Array(out).into())
        }
        b"CONSUMERS" => {
            let group_name = argv.get(3).ok_or(ServerError::Syntax)?;
            let group = groups.group(group_name).ok_or_else(|| nogroup(key, group_name))?;
            let now = now_ms();
            let out = group
                .consumers
                .iter()
                .enumerate()
                .map(|(idx, consumer)| {
                    let pending = group.pel.values().filter(|e| e.consumer == idx).count();
                    Frame::Array(vec![
                        Frame::bulk(&b"name"[..]),
                        Frame::Bulk(consumer.name.clone()),
                        Frame::bulk(&b"pending"[..]),
                        Frame::Integer(pending as i64),
                        Frame::bulk(&b"idle"[..]),
                        Frame::Integer(now.saturating_sub(consumer.seen_ms) as i64),
                    ])
                })
                .collect();
            Ok(Frame::Array(out).into())
        }
        _ => Err(ServerError::other(format!(
            "Unknown XINFO subcommand or wrong number of arguments for '{}'",
            String::from_utf8_lossy(&argv[1])
        ))),
    }
}
