//! Keyspace-generic commands: existence, expiration, scanning, renaming,
//! SORT and the DUMP/RESTORE pair.

use std::sync::Arc;

use rand::Rng;

use crate::client::Session;
use crate::commands::Reply;
use crate::errors::ServerError;
use crate::resp::Frame;
use crate::server::Server;
use crate::snapshot;
use crate::storage::encoding::{
    elem_prefix, hash_field_key, list_elem_key, string_key, Meta, MetaAux, ValueTag, KIND_LIST,
    KIND_META, KIND_SET, KIND_ZSET_SCORE, LIST_BIAS,
};
use crate::storage::Store;
use crate::util::{glob_match, now_ms, parse_f64, parse_i64, parse_u64};

pub fn del_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let mut deleted = 0;
    for key in &argv[1..] {
        // an expired key counts as already gone
        if server.store.meta(key)?.is_some() && server.store.delete_key(key)? {
            deleted += 1;
        }
    }
    Ok(Frame::Integer(deleted).into())
}

pub fn exists_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let mut found = 0;
    for key in &argv[1..] {
        if server.store.meta(key)?.is_some() {
            found += 1;
        }
    }
    Ok(Frame::Integer(found).into())
}

pub fn type_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let name = match server.store.meta(&argv[1])? {
        Some(meta) => meta.tag.type_name(),
        None => "none",
    };
    Ok(Frame::Simple(name.to_string()).into())
}

pub fn touch_command(
    server: &Arc<Server>,
    session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    exists_command(server, session, argv)
}

pub fn keys_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let pattern = &argv[1];
    let mut out = Vec::new();
    let mut resume: Option<Vec<u8>> = None;
    loop {
        let (batch, next) = server.store.scan_keys(resume.as_deref(), 512)?;
        for (key, _) in batch {
            if glob_match(pattern, &key) {
                out.push(Frame::Bulk(key));
            }
        }
        match next {
            Some(r) => resume = Some(r),
            None => break,
        }
    }
    Ok(Frame::Array(out).into())
}

pub fn randomkey_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let _ = argv;
    let store = &server.store;
    if store.key_count() == 0 {
        return Ok(Frame::Null.into());
    }
    // jump to a random point in key order and take the next live key,
    // wrapping to the front when the dice land past the last one
    let mut probe = vec![KIND_META];
    let mut rng = rand::thread_rng();
    for _ in 0..8 {
        probe.push(rng.gen());
    }
    let picked = match store.db().range(probe..).next() {
        Some(item) => {
            let (k, _) = item?;
            if k[0] == KIND_META {
                Some(k[1..].to_vec())
            } else {
                None
            }
        }
        None => None,
    };
    let picked = match picked {
        Some(k) => Some(k),
        None => match store.db().scan_prefix([KIND_META]).next() {
            Some(item) => {
                let (k, _) = item?;
                Some(k[1..].to_vec())
            }
            None => None,
        },
    };
    match picked {
        Some(key) if store.meta(&key)?.is_some() => Ok(Frame::Bulk(key).into()),
        _ => Ok(Frame::Null.into()),
    }
}

fn rename_inner(store: &Store, src: &[u8], dst: &[u8]) -> Result<(), ServerError> {
    if src == dst {
        return Ok(());
    }
    store.delete_key(dst)?;
    store.copy_value(src, dst)?;
    store.delete_key(src)?;
    Ok(())
}

pub fn rename_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    if server.store.meta(&argv[1])?.is_none() {
        return Err(ServerError::NoSuchKey);
    }
    rename_inner(&server.store, &argv[1], &argv[2])?;
    Ok(Frame::ok().into())
}

pub fn renamenx_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    if server.store.meta(&argv[1])?.is_none() {
        return Err(ServerError::NoSuchKey);
    }
    if argv[1] != argv[2] && server.store.meta(&argv[2])?.is_some() {
        return Ok(Frame::Integer(0).into());
    }
    rename_inner(&server.store, &argv[1], &argv[2])?;
    Ok(Frame::Integer(1).into())
}

pub fn copy_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let mut replace = false;
    for opt in &argv[3..] {
        match opt.to_ascii_uppercase().as_slice() {
            b"REPLACE" => replace = true,
            b"DB" => return Err(ServerError::other("DB option is not supported")),
            _ => return Err(ServerError::Syntax),
        }
    }
    let store = &server.store;
    if store.meta(&argv[1])?.is_none() {
        return Ok(Frame::Integer(0).into());
    }
    if store.meta(&argv[2])?.is_some() {
        if !replace {
            return Ok(Frame::Integer(0).into());
        }
        store.delete_key(&argv[2])?;
    }
    store.copy_value(&argv[1], &argv[2])?;
    Ok(Frame::Integer(1).into())
}

// -- expiration -------------------------------------------------------------

fn expire_generic(
    server: &Arc<Server>,
    session: &mut Session,
    argv: &[Vec<u8>],
    absolute: bool,
    unit_ms: i64,
) -> Result<Reply, ServerError> {
    let key = &argv[1];
    let n = parse_i64(&argv[2]).ok_or(ServerError::NotInteger)?;
    if argv.len() > 3 {
        // NX/XX/GT/LT modifiers are not part of this surface
        return Err(ServerError::Syntax);
    }
    if server.store.meta(key)?.is_none() {
        return Ok(Frame::Integer(0).into());
    }
    let at = if absolute {
        n.saturating_mul(unit_ms)
    } else {
        now_ms() as i64 + n.saturating_mul(unit_ms)
    };
    if at <= now_ms() as i64 {
        // already in the past: the key dies now, replicas see a DEL
        server.store.delete_key(key)?;
        session.prop_override = Some(vec![vec![b"DEL".to_vec(), key.clone()]]);
        return Ok(Frame::Integer(1).into());
    }
    server.store.set_expire(key, at as u64)?;
    session.prop_override = Some(vec![vec![
        b"PEXPIREAT".to_vec(),
        key.clone(),
        at.to_string().into_bytes(),
    ]]);
    Ok(Frame::Integer(1).into())
}

pub fn expire_command(
    server: &Arc<Server>,
    session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    expire_generic(server, session, argv, false, 1000)
}

pub fn pexpire_command(
    server: &Arc<Server>,
    session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    expire_generic(server, session, argv, false, 1)
}

pub fn expireat_command(
    server: &Arc<Server>,
    session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    expire_generic(server, session, argv, true, 1000)
}

pub fn pexpireat_command(
    server: &Arc<Server>,
    session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    expire_generic(server, session, argv, true, 1)
}

pub fn ttl_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let reply = match server.store.pttl(&argv[1])? {
        None => -2,
        Some(None) => -1,
        Some(Some(ms)) => ((ms + 999) / 1000) as i64,
    };
    Ok(Frame::Integer(reply).into())
}

pub fn pttl_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let reply = match server.store.pttl(&argv[1])? {
        None => -2,
        Some(None) => -1,
        Some(Some(ms)) => ms as i64,
    };
    Ok(Frame::Integer(reply).into())
}

pub fn expiretime_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let reply = match server.store.meta(&argv[1])? {
        None => -2,
        Some(meta) if meta.expire_at == 0 => -1,
        Some(meta) => (meta.expire_at / 1000) as i64,
    };
    Ok(Frame::Integer(reply).into())
}

pub fn pexpiretime_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let reply = match server.store.meta(&argv[1])? {
        None => -2,
        Some(meta) if meta.expire_at == 0 => -1,
        Some(meta) => meta.expire_at as i64,
    };
    Ok(Frame::Integer(reply).into())
}

pub fn persist_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    match server.store.meta(&argv[1])? {
        Some(meta) if meta.expire_at > 0 => {
            server.store.set_expire(&argv[1], 0)?;
            Ok(Frame::Integer(1).into())
        }
        _ => Ok(Frame::Integer(0).into()),
    }
}

// -- SCAN -------------------------------------------------------------------

pub(crate) struct ScanArgs {
    pub pattern: Option<Vec<u8>>,
    pub count: usize,
    pub type_filter: Option<String>,
}

pub(crate) fn parse_scan_args(args: &[Vec<u8>], allow_type: bool) -> Result<ScanArgs, ServerError> {
    let mut parsed = ScanArgs {
        pattern: None,
        count: 10,
        type_filter: None,
    };
    let mut i = 0;
    while i < args.len() {
        match args[i].to_ascii_uppercase().as_slice() {
            b"MATCH" => {
                parsed.pattern = Some(args.get(i + 1).ok_or(ServerError::Syntax)?.clone());
                i += 2;
            }
            b"COUNT" => {
                let n = args
                    .get(i + 1)
                    .and_then(|a| parse_i64(a))
                    .ok_or(ServerError::NotInteger)?;
                if n < 1 {
                    return Err(ServerError::Syntax);
                }
                parsed.count = (n as usize).min(10_000);
                i += 2;
            }
            b"TYPE" if allow_type => {
                let t = args.get(i + 1).ok_or(ServerError::Syntax)?;
                parsed.type_filter = Some(String::from_utf8_lossy(t).into_owned());
                i += 2;
            }
            _ => return Err(ServerError::Syntax),
        }
    }
    Ok(parsed)
}

pub fn scan_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let cursor = parse_u64(&argv[1]).ok_or(ServerError::other("invalid cursor"))?;
    let args = parse_scan_args(&argv[2..], true)?;
    let store = &server.store;
    let resume = if cursor == 0 {
        None
    } else {
        match store.cursor_take(cursor) {
            Some(r) => Some(r),
            // unknown or aged-out cursor: report an already-finished scan
            None => return Ok(scan_reply(0, Vec::new()).into()),
        }
    };
    let (batch, next) = store.scan_keys(resume.as_deref(), args.count)?;
    let mut keys = Vec::new();
    for (key, meta) in batch {
        if let Some(pattern) = &args.pattern {
            if !glob_match(pattern, &key) {
                continue;
            }
        }
        if let Some(filter) = &args.type_filter {
            if meta.tag.type_name() != filter {
                continue;
            }
        }
        keys.push(Frame::Bulk(key));
    }
    let next_cursor = match next {
        Some(resume_after) => store.cursor_save(resume_after),
        None => 0,
    };
    Ok(scan_reply(next_cursor, keys).into())
}

pub(crate) fn scan_reply(cursor: u64, items: Vec<Frame>) -> Frame {
    Frame::Array(vec![
        Frame::Bulk(cursor.to_string().into_bytes()),
        Frame::Array(items),
    ])
}

/// Shared walk for HSCAN/SSCAN/ZSCAN: up to `count` element records after
/// the cursor position, as (sub-key, value) pairs plus the next cursor.
/// Returns None for a stale or aged-out cursor.
#[allow(clippy::type_complexity)]
pub(crate) fn scan_subkeys(
    store: &Store,
    prefix: &[u8],
    cursor: u64,
    count: usize,
) -> Result<Option<(Vec<(Vec<u8>, Vec<u8>)>, u64)>, ServerError> {
    let resume = if cursor == 0 {
        None
    } else {
        match store.cursor_take(cursor) {
            Some(r) => Some(r),
            None => return Ok(None),
        }
    };
    let mut start = prefix.to_vec();
    if let Some(r) = &resume {
        start.extend_from_slice(r);
        start.push(0);
    }
    let mut walked = Vec::with_capacity(count);
    let mut more = false;
    for item in store.db().range(start..) {
        let (k, v) = item?;
        if !k.starts_with(prefix) {
            break;
        }
        if walked.len() >= count {
            more = true;
            break;
        }
        walked.push((k[prefix.len()..].to_vec(), v.to_vec()));
    }
    let next_cursor = if more {
        let last = walked.last().map(|(s, _)| s.clone()).unwrap_or_default();
        store.cursor_save(last)
    } else {
        0
    };
    Ok(Some((walked, next_cursor)))
}

// -- DUMP / RESTORE ---------------------------------------------------------

pub fn dump_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    Ok(Frame::from_opt(snapshot::dump_value(&server.store, &argv[1])?).into())
}

pub fn restore_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let ttl = parse_i64(&argv[2]).ok_or(ServerError::NotInteger)?;
    if ttl < 0 {
        return Err(ServerError::other("Invalid TTL value, must be >= 0"));
    }
    let mut replace = false;
    let mut absttl = false;
    for opt in &argv[4..] {
        match opt.to_ascii_uppercase().as_slice() {
            b"REPLACE" => replace = true,
            b"ABSTTL" => absttl = true,
            _ => return Err(ServerError::Syntax),
        }
    }
    let store = &server.store;
    if store.meta(&argv[1])?.is_some() {
        if !replace {
            return Err(ServerError::raw("BUSYKEY Target key name already exists."));
        }
        store.delete_key(&argv[1])?;
    }
    let expire_at = if ttl == 0 {
        0
    } else if absttl {
        ttl as u64
    } else {
        now_ms() + ttl as u64
    };
    snapshot::restore_value(store, &argv[1], expire_at, &argv[3])?;
    Ok(Frame::ok().into())
}

// -- OBJECT -----------------------------------------------------------------

fn encoding_name(store: &Store, key: &[u8], meta: &Meta) -> Result<&'static str, ServerError> {
    Ok(match meta.tag {
        ValueTag::Str | ValueTag::Hll => {
            let value = store.db().get(string_key(key))?.unwrap_or_default();
            if parse_i64(&value).is_some() {
                "int"
            } else if value.len() <= 44 {
                "embstr"
            } else {
                "raw"
            }
        }
        ValueTag::List => "quicklist",
        ValueTag::Hash => "hashtable",
        ValueTag::Set => {
            let prefix = elem_prefix(KIND_SET, key);
            let mut all_ints = true;
            for item in store.db().scan_prefix(&prefix) {
                let (k, _) = item?;
                if parse_i64(&k[prefix.len()..]).is_none() {
                    all_ints = false;
                    break;
                }
            }
            if all_ints {
                "intset"
            } else {
                "hashtable"
            }
        }
        ValueTag::ZSet => "skiplist",
        ValueTag::Stream => "stream",
        ValueTag::Json | ValueTag::Series => "raw",
    })
}

pub fn object_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let sub = argv[1].to_ascii_uppercase();
    match sub.as_slice() {
        b"HELP" => Ok(Frame::Array(vec![
            Frame::bulk(&b"OBJECT <subcommand> <key>"[..]),
            Frame::bulk(&b"REFCOUNT | ENCODING | IDLETIME | FREQ"[..]),
        ])
        .into()),
        b"REFCOUNT" | b"ENCODING" | b"IDLETIME" | b"FREQ" => {
            let key = argv.get(2).ok_or_else(|| {
                ServerError::WrongArity("object".into())
            })?;
            let Some(meta) = server.store.meta(key)? else {
                return Err(ServerError::NoSuchKey);
            };
            Ok(match sub.as_slice() {
                b"REFCOUNT" => Frame::Integer(1),
                b"IDLETIME" | b"FREQ" => Frame::Integer(0),
                _ => Frame::bulk(encoding_name(&server.store, key, &meta)?.as_bytes()),
            }
            .into())
        }
        _ => Err(ServerError::other(format!(
            "Unknown subcommand or wrong number of arguments for '{}'. Try OBJECT HELP.",
            String::from_utf8_lossy(&argv[1])
        ))),
    }
}

// -- SORT -------------------------------------------------------------------

struct SortArgs {
    by: Option<Vec<u8>>,
    limit: Option<(usize, usize)>,
    gets: Vec<Vec<u8>>,
    desc: bool,
    alpha: bool,
    store: Option<Vec<u8>>,
}

fn parse_sort_args(args: &[Vec<u8>]) -> Result<SortArgs, ServerError> {
    let mut parsed = SortArgs {
        by: None,
        limit: None,
        gets: Vec::new(),
        desc: false,
        alpha: false,
        store: None,
    };
    let mut i = 0;
    while i < args.len() {
        match args[i].to_ascii_uppercase().as_slice() {
            b"ASC" => parsed.desc = false,
            b"DESC" => parsed.desc = true,
            b"ALPHA" => parsed.alpha = true,
            b"BY" => {
                parsed.by = Some(args.get(i + 1).ok_or(ServerError::Syntax)?.clone());
                i += 1;
            }
            b"GET" => {
                parsed.gets.push(args.get(i + 1).ok_or(ServerError::Syntax)?.clone());
                i += 1;
            }
            b"LIMIT" => {
                let off = args
                    .get(i + 1)
                    .and_then(|a| parse_i64(a))
                    .ok_or(ServerError::NotInteger)?;
                let cnt = args
                    .get(i + 2)
                    .and_then(|a| parse_i64(a))
                    .ok_or(ServerError::NotInteger)?;
                if off < 0 {
                    return Err(ServerError::other("LIMIT offset must be non-negative"));
                }
                parsed.limit = Some((off as usize, cnt.max(0) as usize));
                i += 2;
            }
            b"STORE" => {
                parsed.store = Some(args.get(i + 1).ok_or(ServerError::Syntax)?.clone());
                i += 1;
            }
            _ => return Err(ServerError::Syntax),
        }
        i += 1;
    }
    Ok(parsed)
}

/// `pattern` with `*` replaced by the element; `->` selects a hash field.
fn pattern_lookup(
    store: &Store,
    pattern: &[u8],
    element: &[u8],
) -> Result<Option<Vec<u8>>, ServerError> {
    let star = match pattern.iter().position(|&b| b == b'*') {
        Some(p) => p,
        None => return Ok(None),
    };
    let mut expanded = Vec::with_capacity(pattern.len() + element.len());
    expanded.extend_from_slice(&pattern[..star]);
    expanded.extend_from_slice(element);
    expanded.extend_from_slice(&pattern[star + 1..]);
    // hash field form: key_*->field
    if let Some(arrow) = expanded.windows(2).position(|w| w == b"->") {
        let (key, field) = (expanded[..arrow].to_vec(), expanded[arrow + 2..].to_vec());
        match store.meta(&key)? {
            Some(meta) if meta.tag == ValueTag::Hash => {
                return Ok(store.db().get(hash_field_key(&key, &field))?.map(|v| v.to_vec()));
            }
            _ => return Ok(None),
        }
    }
    match store.meta(&expanded)? {
        Some(meta) if meta.tag == ValueTag::Str => {
            Ok(store.db().get(string_key(&expanded))?.map(|v| v.to_vec()))
        }
        _ => Ok(None),
    }
}

pub fn sort_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let store = &server.store;
    let key = &argv[1];
    let args = parse_sort_args(&argv[2..])?;

    let elements: Vec<Vec<u8>> = match store.meta_expect(
        key,
        &[ValueTag::List, ValueTag::Set, ValueTag::ZSet],
    )? {
        None => Vec::new(),
        Some(meta) => {
            let kind = match meta.tag {
                ValueTag::List => KIND_LIST,
                ValueTag::Set => KIND_SET,
                _ => KIND_ZSET_SCORE,
            };
            let prefix = elem_prefix(kind, key);
            let mut out = Vec::with_capacity(meta.len() as usize);
            for item in store.db().scan_prefix(&prefix) {
                let (k, v) = item?;
                match meta.tag {
                    ValueTag::List => out.push(v.to_vec()),
                    ValueTag::Set => out.push(k[prefix.len()..].to_vec()),
                    _ => out.push(k[prefix.len() + 8..].to_vec()),
                }
            }
            out
        }
    };

    // BY without a '*' disables sorting entirely
    let dontsort = args.by.as_deref().map_or(false, |p| !p.contains(&b'*'));
    let mut keyed: Vec<(Vec<u8>, Option<f64>, Option<Vec<u8>>)> = Vec::new();
    for element in elements {
        let weight_bytes = match &args.by {
            Some(pattern) if !dontsort => pattern_lookup(store, pattern, &element)?,
            _ => None,
        };
        let sort_bytes = weight_bytes.clone().unwrap_or_else(|| element.clone());
        let weight = if args.alpha || dontsort {
            None
        } else {
            Some(parse_f64(&sort_bytes).ok_or_else(|| {
                ServerError::other("One or more scores can't be converted into double")
            })?)
        };
        keyed.push((element, weight, if args.alpha { Some(sort_bytes) } else { None }));
    }

    if !dontsort {
        if args.alpha {
            keyed.sort_by(|a, b| a.2.cmp(&b.2));
        } else {
            keyed.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        }
        if args.desc {
            keyed.reverse();
        }
    }

    let (offset, count) = args
        .limit
        .unwrap_or((0, keyed.len()));
    let window = keyed.iter().skip(offset).take(count);

    let mut frames = Vec::new();
    let mut stored: Vec<Vec<u8>> = Vec::new();
    for (element, _, _) in window {
        if args.gets.is_empty() {
            if args.store.is_some() {
                stored.push(element.clone());
            } else {
                frames.push(Frame::Bulk(element.clone()));
            }
        } else {
            for get in &args.gets {
                let fetched = if get.as_slice() == b"#" {
                    Some(element.clone())
                } else {
                    pattern_lookup(store, get, element)?
                };
                if args.store.is_some() {
                    stored.push(fetched.unwrap_or_default());
                } else {
                    frames.push(Frame::from_opt(fetched));
                }
            }
        }
    }

    if let Some(dest) = args.store {
        store.delete_key(&dest)?;
        if !stored.is_empty() {
            let mut meta = Meta::new(ValueTag::List);
            meta.aux = MetaAux::List {
                head: LIST_BIAS,
                tail: LIST_BIAS + stored.len() as u64,
            };
            for (i, v) in stored.iter().enumerate() {
                store.db().insert(list_elem_key(&dest, LIST_BIAS + i as u64), v.as_slice())?;
            }
            store.write_meta(&dest, &meta)?;
        }
        store.bump(&dest);
        return Ok(Frame::Integer(stored.len() as i64).into());
    }
    Ok(Frame::Array(frames).into())
}
