//! List commands. Elements live in the store under biased big-endian
//! indices, so pushes at either end are single inserts and indexed access
//! is a point lookup; the splice-style operations rewrite the run.

use std::sync::Arc;

use crate::client::Session;
use crate::commands::Reply;
use crate::errors::ServerError;
use crate::resp::Frame;
use crate::server::Server;
use crate::storage::encoding::{
    elem_prefix, list_elem_key, Meta, MetaAux, ValueTag, KIND_LIST, LIST_BIAS,
};
use crate::storage::Store;
use crate::util::{parse_f64, parse_i64};

fn list_meta(store: &Store, key: &[u8]) -> Result<Option<(Meta, u64, u64)>, ServerError> {
    match store.meta_expect(key, &[ValueTag::List])? {
        Some(meta) => {
            let MetaAux::List { head, tail } = meta.aux else {
                return Err(ServerError::Internal("list meta mismatch".into()));
            };
            Ok(Some((meta, head, tail)))
        }
        None => Ok(None),
    }
}

fn write_bounds(
    store: &Store,
    key: &[u8],
    mut meta: Meta,
    head: u64,
    tail: u64,
) -> Result<(), ServerError> {
    if head == tail {
        store.delete_key(key)?;
        return Ok(());
    }
    meta.aux = MetaAux::List { head, tail };
    store.write_meta(key, &meta)?;
    store.bump(key);
    Ok(())
}

fn elem_at(store: &Store, key: &[u8], idx: u64) -> Result<Option<Vec<u8>>, ServerError> {
    Ok(store.db().get(list_elem_key(key, idx))?.map(|v| v.to_vec()))
}

pub(crate) fn push(
    server: &Arc<Server>,
    key: &[u8],
    values: &[Vec<u8>],
    left: bool,
    require_existing: bool,
) -> Result<Option<u64>, ServerError> {
    let store = &server.store;
    let (meta, mut head, mut tail) = match list_meta(store, key)? {
        Some(state) => state,
        None if require_existing => return Ok(None),
        None => (Meta::new(ValueTag::List), LIST_BIAS, LIST_BIAS),
    };
    for value in values {
        if left {
            head -= 1;
            store.db().insert(list_elem_key(key, head), value.as_slice())?;
        } else {
            store.db().insert(list_elem_key(key, tail), value.as_slice())?;
            tail += 1;
        }
    }
    write_bounds(store, key, meta, head, tail)?;
    server.blockers.notify_key(key);
    Ok(Some(tail - head))
}

pub(crate) fn pop(
    server: &Arc<Server>,
    key: &[u8],
    left: bool,
) -> Result<Option<Vec<u8>>, ServerError> {
    let store = &server.store;
    let Some((meta, head, tail)) = list_meta(store, key)? else {
        return Ok(None);
    };
    let idx = if left { head } else { tail - 1 };
    let value = elem_at(store, key, idx)?
        .ok_or_else(|| ServerError::Internal("list element missing".into()))?;
    store.db().remove(list_elem_key(key, idx))?;
    if left {
        write_bounds(store, key, meta, head + 1, tail)?;
    } else {
        write_bounds(store, key, meta, head, tail - 1)?;
    }
    Ok(Some(value))
}

fn read_all(store: &Store, key: &[u8]) -> Result<Vec<Vec<u8>>, ServerError> {
    let prefix = elem_prefix(KIND_LIST, key);
    let mut out = Vec::new();
    for item in store.db().scan_prefix(&prefix) {
        let (_, v) = item?;
        out.push(v.to_vec());
    }
    Ok(out)
}

/// Replace the whole run of elements; the escape hatch for the splice-style
/// commands (LREM, LINSERT, LTRIM in its general form).
fn rewrite(store: &Store, key: &[u8], elements: &[Vec<u8>]) -> Result<(), ServerError> {
    let meta = match store.meta_raw(key)? {
        Some(meta) => meta,
        None => Meta::new(ValueTag::List),
    };
    store.delete_prefix(&elem_prefix(KIND_LIST, key))?;
    if elements.is_empty() {
        store.delete_key(key)?;
        return Ok(());
    }
    for (i, v) in elements.iter().enumerate() {
        store
            .db()
            .insert(list_elem_key(key, LIST_BIAS + i as u64), v.as_slice())?;
    }
    write_bounds(
        store,
        key,
        meta,
        LIST_BIAS,
        LIST_BIAS + elements.len() as u64,
    )
}

pub fn lpush_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let len = push(server, &argv[1], &argv[2..], true, false)?.unwrap_or(0);
    Ok(Frame::Integer(len as i64).into())
}

pub fn rpush_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let len = push(server, &argv[1], &argv[2..], false, false)?.unwrap_or(0);
    Ok(Frame::Integer(len as i64).into())
}

pub fn lpushx_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let len = push(server, &argv[1], &argv[2..], true, true)?.unwrap_or(0);
    Ok(Frame::Integer(len as i64).into())
}

pub fn rpushx_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let len = push(server, &argv[1], &argv[2..], false, true)?.unwrap_or(0);
    Ok(Frame::Integer(len as i64).into())
}

fn pop_command(
    server: &Arc<Server>,
    argv: &[Vec<u8>],
    left: bool,
) -> Result<Reply, ServerError> {
    let count = match argv.get(2) {
        Some(raw) => {
            let n = parse_i64(raw).ok_or(ServerError::NotInteger)?;
            if n < 0 {
                return Err(ServerError::other("value is out of range, must be positive"));
            }
            Some(n as usize)
        }
        None => None,
    };
    match count {
        None => Ok(Frame::from_opt(pop(server, &argv[1], left)?).into()),
        Some(n) => {
            let mut out = Vec::new();
            for _ in 0..n {
                match pop(server, &argv[1], left)? {
                    Some(v) => out.push(Frame::Bulk(v)),
                    None => break,
                }
            }
            if out.is_empty() {
                Ok(Frame::NullArray.into())
            } else {
                Ok(Frame::Array(out).into())
            }
        }
    }
}

pub fn lpop_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    pop_command(server, argv, true)
}

pub fn rpop_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    pop_command(server, argv, false)
}

pub fn llen_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let len = list_meta(&server.store, &argv[1])?
        .map(|(_, h, t)| t - h)
        .unwrap_or(0);
    Ok(Frame::Integer(len as i64).into())
}

/// Resolve (start, stop) with tail-relative negatives against `len`,
/// returning None for an empty result window.
fn resolve_range(start: i64, stop: i64, len: u64) -> Option<(u64, u64)> {
    let len = len as i64;
    let mut start = if start < 0 { len + start } else { start };
    let mut stop = if stop < 0 { len + stop } else { stop };
    if start < 0 {
        start = 0;
    }
    if stop >= len {
        stop = len - 1;
    }
    if start > stop || len == 0 || start >= len {
        return None;
    }
    Some((start as u64, stop as u64))
}

pub fn lrange_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let start = parse_i64(&argv[2]).ok_or(ServerError::NotInteger)?;
    let stop = parse_i64(&argv[3]).ok_or(ServerError::NotInteger)?;
    let store = &server.store;
    let Some((_, head, tail)) = list_meta(store, &argv[1])? else {
        return Ok(Frame::Array(vec![]).into());
    };
    let Some((from, to)) = resolve_range(start, stop, tail - head) else {
        return Ok(Frame::Array(vec![]).into());
    };
    let mut out = Vec::with_capacity((to - from + 1) as usize);
    for idx in from..=to {
        if let Some(v) = elem_at(store, &argv[1], head + idx)? {
            out.push(Frame::Bulk(v));
        }
    }
    Ok(Frame::Array(out).into())
}

pub fn ltrim_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let start = parse_i64(&argv[2]).ok_or(ServerError::NotInteger)?;
    let stop = parse_i64(&argv[3]).ok_or(ServerError::NotInteger)?;
    let store = &server.store;
    let Some((meta, head, tail)) = list_meta(store, &argv[1])? else {
        return Ok(Frame::ok().into());
    };
    match resolve_range(start, stop, tail - head) {
        None => {
            store.delete_key(&argv[1])?;
        }
        Some((from, to)) => {
            for idx in 0..from {
                store.db().remove(list_elem_key(&argv[1], head + idx))?;
            }
            for idx in to + 1..tail - head {
                store.db().remove(list_elem_key(&argv[1], head + idx))?;
            }
            write_bounds(store, &argv[1], meta, head + from, head + to + 1)?;
        }
    }
    Ok(Frame::ok().into())
}

pub fn lrem_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let count = parse_i64(&argv[2]).ok_or(ServerError::NotInteger)?;
    let store = &server.store;
    if list_meta(store, &argv[1])?.is_none() {
        return Ok(Frame::Integer(0).into());
    }
    let elements = read_all(store, &argv[1])?;
    let target = &argv[3];
    let limit = count.unsigned_abs() as usize;
    let mut removed = 0usize;
    let mut keep: Vec<Vec<u8>>;
    if count >= 0 {
        keep = Vec::with_capacity(elements.len());
        for e in elements {
            if e == *target && (limit == 0 || removed < limit) {
                removed += 1;
            } else {
                keep.push(e);
            }
        }
    } else {
        let mut rev: Vec<Vec<u8>> = Vec::with_capacity(elements.len());
        for e in elements.into_iter().rev() {
            if e == *target && removed < limit {
                removed += 1;
            } else {
                rev.push(e);
            }
        }
        rev.reverse();
        keep = rev;
    }
    if removed > 0 {
        rewrite(store, &argv[1], &keep)?;
    }
    Ok(Frame::Integer(removed as i64).into())
}

pub fn lset_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let index = parse_i64(&argv[2]).ok_or(ServerError::NotInteger)?;
    let store = &server.store;
    let Some((_, head, tail)) = list_meta(store, &argv[1])? else {
        return Err(ServerError::NoSuchKey);
    };
    let len = (tail - head) as i64;
    let index = if index < 0 { len + index } else { index };
    if index < 0 || index >= len {
        return Err(ServerError::IndexOutOfRange);
    }
    store
        .db()
        .insert(list_elem_key(&argv[1], head + index as u64), argv[3].as_slice())?;
    store.bump(&argv[1]);
    Ok(Frame::ok().into())
}

pub fn lindex_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let index = parse_i64(&argv[2]).ok_or(ServerError::NotInteger)?;
    let store = &server.store;
    let Some((_, head, tail)) = list_meta(store, &argv[1])? else {
        return Ok(Frame::Null.into());
    };
    let len = (tail - head) as i64;
    let index = if index < 0 { len + index } else { index };
    if index < 0 || index >= len {
        return Ok(Frame::Null.into());
    }
    Ok(Frame::from_opt(elem_at(store, &argv[1], head + index as u64)?).into())
}

pub fn linsert_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let before = match argv[2].to_ascii_uppercase().as_slice() {
        b"BEFORE" => true,
        b"AFTER" => false,
        _ => return Err(ServerError::Syntax),
    };
    let store = &server.store;
    if list_meta(store, &argv[1])?.is_none() {
        return Ok(Frame::Integer(0).into());
    }
    let mut elements = read_all(store, &argv[1])?;
    let Some(pos) = elements.iter().position(|e| *e == argv[3]) else {
        return Ok(Frame::Integer(-1).into());
    };
    let at = if before { pos } else { pos + 1 };
    elements.insert(at, argv[4].clone());
    let len = elements.len();
    rewrite(store, &argv[1], &elements)?;
    Ok(Frame::Integer(len as i64).into())
}

pub fn lpos_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let mut rank: i64 = 1;
    let mut count: Option<usize> = None;
    let mut maxlen: usize = 0;
    let mut i = 3;
    while i < argv.len() {
        match argv[i].to_ascii_uppercase().as_slice() {
            b"RANK" => {
                rank = argv
                    .get(i + 1)
                    .and_then(|a| parse_i64(a))
                    .ok_or(ServerError::NotInteger)?;
                if rank == 0 {
                    return Err(ServerError::other(
                        "RANK can't be zero. Use 1 to start searching from the first matching element, 2 for the second, ... or use a negative number to start searching from the end.",
                    ));
                }
                i += 2;
            }
            b"COUNT" => {
                let n = argv
                    .get(i + 1)
                    .and_then(|a| parse_i64(a))
                    .ok_or(ServerError::NotInteger)?;
                if n < 0 {
                    return Err(ServerError::other("COUNT can't be negative"));
                }
                count = Some(n as usize);
                i += 2;
            }
            b"MAXLEN" => {
                let n = argv
                    .get(i + 1)
                    .and_then(|a| parse_i64(a))
                    .ok_or(ServerError::NotInteger)?;
                if n < 0 {
                    return Err(ServerError::other("MAXLEN can't be negative"));
                }
                maxlen = n as usize;
                i += 2;
            }
            _ => return Err(ServerError::Syntax),
        }
    }
    let store = &server.store;
    let elements = if list_meta(store, &argv[1])?.is_some() {
        read_all(store, &argv[1])?
    } else {
        Vec::new()
    };
    let mut hits: Vec<i64> = Vec::new();
    let wanted = count.unwrap_or(1);
    let mut skip = rank.unsigned_abs() as usize - 1;
    let indices: Vec<usize> = if rank > 0 {
        (0..elements.len()).collect()
    } else {
        (0..elements.len()).rev().collect()
    };
    let mut compared = 0usize;
    for idx in indices {
        if maxlen > 0 && compared >= maxlen {
            break;
        }
        compared += 1;
        if elements[idx] == argv[2] {
            if skip > 0 {
                skip -= 1;
                continue;
            }
            hits.push(idx as i64);
            if wanted != 0 && hits.len() >= wanted {
                break;
            }
        }
    }
    match count {
        None => Ok(match hits.first() {
            Some(&idx) => Frame::Integer(idx).into(),
            None => Frame::Null.into(),
        }),
        Some(_) => Ok(Frame::Array(hits.into_iter().map(Frame::Integer).collect()).into()),
    }
}

fn parse_side(arg: &[u8]) -> Result<bool, ServerError> {
    match arg.to_ascii_uppercase().as_slice() {
        b"LEFT" => Ok(true),
        b"RIGHT" => Ok(false),
        _ => Err(ServerError::Syntax),
    }
}

/// Shared by LMOVE/RPOPLPUSH and their blocking forms.
fn move_once(
    server: &Arc<Server>,
    src: &[u8],
    dst: &[u8],
    from_left: bool,
    to_left: bool,
) -> Result<Option<Vec<u8>>, ServerError> {
    let Some(value) = pop(server, src, from_left)? else {
        return Ok(None);
    };
    push(server, dst, std::slice::from_ref(&value), to_left, false)?;
    Ok(Some(value))
}

fn lmove_propagation(
    session: &mut Session,
    src: &[u8],
    dst: &[u8],
    from_left: bool,
    to_left: bool,
) {
    session.prop_override = Some(vec![vec![
        b"LMOVE".to_vec(),
        src.to_vec(),
        dst.to_vec(),
        if from_left { b"LEFT".to_vec() } else { b"RIGHT".to_vec() },
        if to_left { b"LEFT".to_vec() } else { b"RIGHT".to_vec() },
    ]]);
}

pub fn lmove_command(
    server: &Arc<Server>,
    session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let from_left = parse_side(&argv[3])?;
    let to_left = parse_side(&argv[4])?;
    match move_once(server, &argv[1], &argv[2], from_left, to_left)? {
        Some(value) => {
            lmove_propagation(session, &argv[1], &argv[2], from_left, to_left);
            Ok(Frame::Bulk(value).into())
        }
        None => Ok(Frame::Null.into()),
    }
}

pub fn rpoplpush_command(
    server: &Arc<Server>,
    session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    match move_once(server, &argv[1], &argv[2], false, true)? {
        Some(value) => {
            lmove_propagation(session, &argv[1], &argv[2], false, true);
            Ok(Frame::Bulk(value).into())
        }
        None => Ok(Frame::Null.into()),
    }
}

/// Seconds-with-fraction timeout, `0` meaning forever, as milliseconds.
pub(crate) fn parse_timeout(arg: &[u8]) -> Result<u64, ServerError> {
    let t = parse_f64(arg)
        .ok_or_else(|| ServerError::other("timeout is not a float or out of range"))?;
    if t.is_nan() || t.is_infinite() {
        return Err(ServerError::other("timeout is not a float or out of range"));
    }
    if t < 0.0 {
        return Err(ServerError::other("timeout is negative"));
    }
    Ok((t * 1000.0) as u64)
}

fn bpop_command(
    server: &Arc<Server>,
    session: &mut Session,
    argv: &[Vec<u8>],
    left: bool,
) -> Result<Reply, ServerError> {
    let timeout_ms = parse_timeout(&argv[argv.len() - 1])?;
    let keys = &argv[1..argv.len() - 1];
    // the caller's leftmost ready key wins
    for key in keys {
        if let Some(value) = pop(server, key, left)? {
            session.prop_override = Some(vec![vec![
                if left { b"LPOP".to_vec() } else { b"RPOP".to_vec() },
                key.clone(),
            ]]);
            return Ok(Frame::Array(vec![Frame::Bulk(key.clone()), Frame::Bulk(value)]).into());
        }
    }
    if session.in_exec {
        return Ok(Frame::NullArray.into());
    }
    Ok(Reply::Block {
        keys: keys.to_vec(),
        timeout_ms,
    })
}

pub fn blpop_command(
    server: &Arc<Server>,
    session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    bpop_command(server, session, argv, true)
}

pub fn brpop_command(
    server: &Arc<Server>,
    session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    bpop_command(server, session, argv, false)
}

fn bmove_command(
    server: &Arc<Server>,
    session: &mut Session,
    src: &[u8],
    dst: &[u8],
    from_left: bool,
    to_left: bool,
    timeout_ms: u64,
) -> Result<Reply, ServerError> {
    match move_once(server, src, dst, from_left, to_left)? {
        Some(value) => {
            lmove_propagation(session, src, dst, from_left, to_left);
            Ok(Frame::Bulk(value).into())
        }
        None if session.in_exec => Ok(Frame::Null.into()),
        None => Ok(Reply::Block {
            keys: vec![src.to_vec()],
            timeout_ms,
        }),
    }
}

pub fn blmove_command(
    server: &Arc<Server>,
    session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let from_left = parse_side(&argv[3])?;
    let to_left = parse_side(&argv[4])?;
    let timeout_ms = parse_timeout(&argv[5])?;
    bmove_command(server, session, &argv[1], &argv[2], from_left, to_left, timeout_ms)
}

pub fn brpoplpush_command(
    server: &Arc<Server>,
    session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let timeout_ms = parse_timeout(&argv[3])?;
    bmove_command(server, session, &argv[1], &argv[2], false, true, timeout_ms)
}
