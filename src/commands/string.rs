//! String commands, including the option-heavy SET and the integer/float
//! reinterpretations.

use std::sync::Arc;

use crate::client::Session;
use crate::commands::Reply;
use crate::errors::ServerError;
use crate::resp::Frame;
use crate::server::Server;
use crate::storage::encoding::{string_key, Meta, ValueTag};
use crate::storage::Store;
use crate::util::{fmt_f64, now_ms, parse_f64, parse_i64};

/// Read a string payload; HyperLogLogs are strings as far as the string
/// commands are concerned.
pub(crate) fn lookup_string(
    store: &Store,
    key: &[u8],
) -> Result<Option<(Meta, Vec<u8>)>, ServerError> {
    let Some(meta) = store.meta_expect(key, &[ValueTag::Str, ValueTag::Hll])? else {
        return Ok(None);
    };
    let value = store
        .db()
        .get(string_key(key))?
        .map(|v| v.to_vec())
        .unwrap_or_default();
    Ok(Some((meta, value)))
}

/// Replace whatever lives at `key` with a plain string value.
pub(crate) fn overwrite_string(
    store: &Store,
    key: &[u8],
    value: &[u8],
    expire_at: u64,
) -> Result<(), ServerError> {
    if let Some(old) = store.meta_raw(key)? {
        if old.tag != ValueTag::Str && old.tag != ValueTag::Hll {
            store.delete_value_records(key, old.tag)?;
        }
    }
    let mut meta = Meta::new(ValueTag::Str);
    meta.expire_at = expire_at;
    store.write_meta(key, &meta)?;
    store.db().insert(string_key(key), value)?;
    store.bump(key);
    Ok(())
}

/// Update the payload of an existing string without touching its TTL.
pub(crate) fn update_string(
    store: &Store,
    key: &[u8],
    meta: &Meta,
    value: &[u8],
) -> Result<(), ServerError> {
    store.write_meta(key, meta)?;
    store.db().insert(string_key(key), value)?;
    store.bump(key);
    Ok(())
}

fn invalid_expire(cmd: &str) -> ServerError {
    ServerError::other(format!("invalid expire time in '{}' command", cmd))
}

pub fn set_command(
    server: &Arc<Server>,
    session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let key = &argv[1];
    let value = &argv[2];
    let mut nx = false;
    let mut xx = false;
    let mut keepttl = false;
    let mut get = false;
    let mut expire_at: Option<u64> = None;
    let mut i = 3;
    while i < argv.len() {
        let opt = argv[i].to_ascii_uppercase();
        match opt.as_slice() {
            b"NX" => nx = true,
            b"XX" => xx = true,
            b"KEEPTTL" => keepttl = true,
            b"GET" => get = true,
            b"EX" | b"PX" | b"EXAT" | b"PXAT" => {
                i += 1;
                let n = argv
                    .get(i)
                    .and_then(|a| parse_i64(a))
                    .ok_or(ServerError::NotInteger)?;
                let at = match opt.as_slice() {
                    b"EX" => {
                        if n <= 0 {
                            return Err(invalid_expire("set"));
                        }
                        now_ms() + n as u64 * 1000
                    }
                    b"PX" => {
                        if n <= 0 {
                            return Err(invalid_expire("set"));
                        }
                        now_ms() + n as u64
                    }
                    b"EXAT" => {
                        if n <= 0 {
                            return Err(invalid_expire("set"));
                        }
                        n as u64 * 1000
                    }
                    _ => {
                        if n <= 0 {
                            return Err(invalid_expire("set"));
                        }
                        n as u64
                    }
                };
                if expire_at.replace(at).is_some() {
                    return Err(ServerError::Syntax);
                }
            }
            _ => return Err(ServerError::Syntax),
        }
        i += 1;
    }
    if nx && xx {
        return Err(ServerError::Syntax);
    }
    if keepttl && expire_at.is_some() {
        return Err(ServerError::Syntax);
    }

    let store = &server.store;
    let existing = store.meta(key)?;
    let old_value = if get {
        // GET demands the previous value be a string
        match &existing {
            Some(meta) if meta.tag != ValueTag::Str && meta.tag != ValueTag::Hll => {
                return Err(ServerError::WrongType)
            }
            Some(_) => store.db().get(string_key(key))?.map(|v| v.to_vec()),
            None => None,
        }
    } else {
        None
    };

    if (nx && existing.is_some()) || (xx && existing.is_none()) {
        return Ok(if get {
            Frame::from_opt(old_value).into()
        } else {
            Frame::Null.into()
        });
    }

    let final_expire = match (expire_at, keepttl) {
        (Some(at), _) => at,
        (None, true) => existing.as_ref().map(|m| m.expire_at).unwrap_or(0),
        (None, false) => 0,
    };
    overwrite_string(store, key, value, final_expire)?;

    // relative expirations propagate in absolute form
    let mut rewritten = vec![b"SET".to_vec(), key.clone(), value.clone()];
    if final_expire > 0 {
        rewritten.push(b"PXAT".to_vec());
        rewritten.push(final_expire.to_string().into_bytes());
    }
    session.prop_override = Some(vec![rewritten]);

    Ok(if get {
        Frame::from_opt(old_value).into()
    } else {
        Frame::ok().into()
    })
}

pub fn get_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let value = lookup_string(&server.store, &argv[1])?.map(|(_, v)| v);
    Ok(Frame::from_opt(value).into())
}

pub fn getset_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let store = &server.store;
    let old = lookup_string(store, &argv[1])?.map(|(_, v)| v);
    overwrite_string(store, &argv[1], &argv[2], 0)?;
    Ok(Frame::from_opt(old).into())
}

pub fn getdel_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let store = &server.store;
    let old = lookup_string(store, &argv[1])?.map(|(_, v)| v);
    if old.is_some() {
        store.delete_key(&argv[1])?;
    }
    Ok(Frame::from_opt(old).into())
}

pub fn getex_command(
    server: &Arc<Server>,
    session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let store = &server.store;
    let key = &argv[1];
    let Some((mut meta, value)) = lookup_string(store, key)? else {
        return Ok(Frame::Null.into());
    };
    if argv.len() == 2 {
        return Ok(Frame::Bulk(value).into());
    }
    let opt = argv[2].to_ascii_uppercase();
    let new_expire = match opt.as_slice() {
        b"PERSIST" if argv.len() == 3 => 0,
        b"EX" | b"PX" | b"EXAT" | b"PXAT" if argv.len() == 4 => {
            let n = parse_i64(&argv[3]).ok_or(ServerError::NotInteger)?;
            if n <= 0 {
                return Err(invalid_expire("getex"));
            }
            match opt.as_slice() {
                b"EX" => now_ms() + n as u64 * 1000,
                b"PX" => now_ms() + n as u64,
                b"EXAT" => n as u64 * 1000,
                _ => n as u64,
            }
        }
        _ => return Err(ServerError::Syntax),
    };
    if new_expire != meta.expire_at {
        meta.expire_at = new_expire;
        store.write_meta(key, &meta)?;
        store.bump(key);
        session.prop_override = Some(vec![if new_expire == 0 {
            vec![b"PERSIST".to_vec(), key.clone()]
        } else {
            vec![
                b"PEXPIREAT".to_vec(),
                key.clone(),
                new_expire.to_string().into_bytes(),
            ]
        }]);
    }
    Ok(Frame::Bulk(value).into())
}

pub fn append_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let store = &server.store;
    let key = &argv[1];
    match lookup_string(store, key)? {
        Some((mut meta, mut value)) => {
            value.extend_from_slice(&argv[2]);
            meta.tag = ValueTag::Str;
            let len = value.len();
            update_string(store, key, &meta, &value)?;
            Ok(Frame::Integer(len as i64).into())
        }
        None => {
            overwrite_string(store, key, &argv[2], 0)?;
            Ok(Frame::Integer(argv[2].len() as i64).into())
        }
    }
}

pub fn strlen_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let len = lookup_string(&server.store, &argv[1])?
        .map(|(_, v)| v.len())
        .unwrap_or(0);
    Ok(Frame::Integer(len as i64).into())
}

pub fn setrange_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let store = &server.store;
    let key = &argv[1];
    let offset = parse_i64(&argv[2]).ok_or(ServerError::NotInteger)?;
    if offset < 0 {
        return Err(ServerError::other("offset is out of range"));
    }
    let offset = offset as usize;
    let existing = lookup_string(store, key)?;
    if argv[3].is_empty() {
        let len = existing.map(|(_, v)| v.len()).unwrap_or(0);
        return Ok(Frame::Integer(len as i64).into());
    }
    let (meta, mut value) = match existing {
        Some((mut meta, value)) => {
            meta.tag = ValueTag::Str;
            (meta, value)
        }
        None => (Meta::new(ValueTag::Str), Vec::new()),
    };
    if value.len() < offset + argv[3].len() {
        value.resize(offset + argv[3].len(), 0);
    }
    value[offset..offset + argv[3].len()].copy_from_slice(&argv[3]);
    let len = value.len();
    update_string(store, key, &meta, &value)?;
    Ok(Frame::Integer(len as i64).into())
}

pub fn getrange_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let value = lookup_string(&server.store, &argv[1])?
        .map(|(_, v)| v)
        .unwrap_or_default();
    let start = parse_i64(&argv[2]).ok_or(ServerError::NotInteger)?;
    let end = parse_i64(&argv[3]).ok_or(ServerError::NotInteger)?;
    let len = value.len() as i64;
    let mut start = if start < 0 { (len + start).max(0) } else { start };
    let mut end = if end < 0 { len + end } else { end };
    if end >= len {
        end = len - 1;
    }
    if start > end || len == 0 {
        return Ok(Frame::bulk(&b""[..]).into());
    }
    start = start.min(len - 1);
    Ok(Frame::Bulk(value[start as usize..=end as usize].to_vec()).into())
}

pub fn setnx_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let store = &server.store;
    if store.meta(&argv[1])?.is_some() {
        return Ok(Frame::Integer(0).into());
    }
    overwrite_string(store, &argv[1], &argv[2], 0)?;
    Ok(Frame::Integer(1).into())
}

fn setex_generic(
    server: &Arc<Server>,
    session: &mut Session,
    argv: &[Vec<u8>],
    unit_ms: u64,
    cmd: &str,
) -> Result<Reply, ServerError> {
    let n = parse_i64(&argv[2]).ok_or(ServerError::NotInteger)?;
    if n <= 0 {
        return Err(invalid_expire(cmd));
    }
    let at = now_ms() + n as u64 * unit_ms;
    overwrite_string(&server.store, &argv[1], &argv[3], at)?;
    session.prop_override = Some(vec![vec![
        b"SET".to_vec(),
        argv[1].clone(),
        argv[3].clone(),
        b"PXAT".to_vec(),
        at.to_string().into_bytes(),
    ]]);
    Ok(Frame::ok().into())
}

pub fn setex_command(
    server: &Arc<Server>,
    session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    setex_generic(server, session, argv, 1000, "setex")
}

pub fn psetex_command(
    server: &Arc<Server>,
    session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    setex_generic(server, session, argv, 1, "psetex")
}

pub fn mset_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    if argv.len() % 2 != 1 {
        return Err(ServerError::WrongArity("mset".into()));
    }
    for pair in argv[1..].chunks(2) {
        overwrite_string(&server.store, &pair[0], &pair[1], 0)?;
    }
    Ok(Frame::ok().into())
}

pub fn msetnx_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    if argv.len() % 2 != 1 {
        return Err(ServerError::WrongArity("msetnx".into()));
    }
    for pair in argv[1..].chunks(2) {
        if server.store.meta(&pair[0])?.is_some() {
            return Ok(Frame::Integer(0).into());
        }
    }
    for pair in argv[1..].chunks(2) {
        overwrite_string(&server.store, &pair[0], &pair[1], 0)?;
    }
    Ok(Frame::Integer(1).into())
}

pub fn mget_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let mut out = Vec::with_capacity(argv.len() - 1);
    for key in &argv[1..] {
        // wrong-typed keys answer nil here instead of failing the batch
        let value = match server.store.meta(key)? {
            Some(meta) if meta.tag == ValueTag::Str || meta.tag == ValueTag::Hll => {
                server.store.db().get(string_key(key))?.map(|v| v.to_vec())
            }
            _ => None,
        };
        out.push(Frame::from_opt(value));
    }
    Ok(Frame::Array(out).into())
}

fn incr_generic(
    server: &Arc<Server>,
    argv: &[Vec<u8>],
    delta: i64,
) -> Result<Reply, ServerError> {
    let store = &server.store;
    let key = &argv[1];
    let (meta, current) = match lookup_string(store, key)? {
        Some((meta, value)) => {
            let n = parse_i64(&value).ok_or(ServerError::NotInteger)?;
            (Some(meta), n)
        }
        None => (None, 0),
    };
    let new = current.checked_add(delta).ok_or(ServerError::Overflow)?;
    let encoded = new.to_string().into_bytes();
    match meta {
        Some(mut meta) => {
            meta.tag = ValueTag::Str;
            update_string(store, key, &meta, &encoded)?;
        }
        None => overwrite_string(store, key, &encoded, 0)?,
    }
    Ok(Frame::Integer(new).into())
}

pub fn incr_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    incr_generic(server, argv, 1)
}

pub fn incrby_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let delta = parse_i64(&argv[2]).ok_or(ServerError::NotInteger)?;
    incr_generic(server, argv, delta)
}

pub fn decr_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    incr_generic(server, argv, -1)
}

pub fn decrby_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let delta = parse_i64(&argv[2]).ok_or(ServerError::NotInteger)?;
    incr_generic(server, argv, delta.checked_neg().ok_or(ServerError::Overflow)?)
}

pub fn incrbyfloat_command(
    server: &Arc<Server>,
    session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let store = &server.store;
    let key = &argv[1];
    let delta = parse_f64(&argv[2]).ok_or(ServerError::NotFloat)?;
    let (meta, current) = match lookup_string(store, key)? {
        Some((meta, value)) => {
            let n = parse_f64(&value).ok_or(ServerError::NotFloat)?;
            (Some(meta), n)
        }
        None => (None, 0.0),
    };
    let new = current + delta;
    if new.is_nan() || new.is_infinite() {
        return Err(ServerError::other("increment would produce NaN or Infinity"));
    }
    let encoded = fmt_f64(new).into_bytes();
    match meta {
        Some(mut meta) => {
            meta.tag = ValueTag::Str;
            update_string(store, key, &meta, &encoded)?;
        }
        None => overwrite_string(store, key, &encoded, 0)?,
    }
    // float arithmetic propagates as the computed result
    session.prop_override = Some(vec![vec![b"SET".to_vec(), key.clone(), encoded.clone()]]);
    Ok(Frame::Bulk(encoded).into())
}
