//! Hash commands: field records live under the owner key's prefix in
//! bytewise field order.

use std::sync::Arc;

use rand::seq::SliceRandom;
use rand::Rng;

use crate::client::Session;
use crate::commands::generic::{parse_scan_args, scan_reply, scan_subkeys};
use crate::commands::Reply;
use crate::errors::ServerError;
use crate::resp::Frame;
use crate::server::Server;
use crate::storage::encoding::{elem_prefix, hash_field_key, Meta, MetaAux, ValueTag, KIND_HASH};
use crate::storage::Store;
use crate::util::{fmt_f64, glob_match, parse_f64, parse_i64, parse_u64};

fn hash_meta(store: &Store, key: &[u8]) -> Result<Option<Meta>, ServerError> {
    store.meta_expect(key, &[ValueTag::Hash])
}

fn hash_len(meta: &Option<Meta>) -> u64 {
    meta.as_ref().map(|m| m.len()).unwrap_or(0)
}

fn set_len(store: &Store, key: &[u8], meta: Option<Meta>, len: u64) -> Result<(), ServerError> {
    if len == 0 {
        store.delete_key(key)?;
        return Ok(());
    }
    let mut meta = meta.unwrap_or_else(|| Meta::new(ValueTag::Hash));
    meta.aux = MetaAux::Coll { len };
    store.write_meta(key, &meta)?;
    store.bump(key);
    Ok(())
}

fn field_get(store: &Store, key: &[u8], field: &[u8]) -> Result<Option<Vec<u8>>, ServerError> {
    Ok(store.db().get(hash_field_key(key, field))?.map(|v| v.to_vec()))
}

fn all_pairs(store: &Store, key: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, ServerError> {
    let prefix = elem_prefix(KIND_HASH, key);
    let mut out = Vec::new();
    for item in store.db().scan_prefix(&prefix) {
        let (k, v) = item?;
        out.push((k[prefix.len()..].to_vec(), v.to_vec()));
    }
    Ok(out)
}

pub fn hset_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    if argv.len() % 2 != 0 {
        return Err(ServerError::WrongArity("hset".into()));
    }
    let store = &server.store;
    let key = &argv[1];
    let meta = hash_meta(store, key)?;
    let mut len = hash_len(&meta);
    let mut created = 0;
    for pair in argv[2..].chunks(2) {
        let existed = store
            .db()
            .insert(hash_field_key(key, &pair[0]), pair[1].as_slice())?
            .is_some();
        if !existed {
            created += 1;
            len += 1;
        }
    }
    set_len(store, key, meta, len)?;
    Ok(Frame::Integer(created).into())
}

pub fn hmset_command(
    server: &Arc<Server>,
    session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    hset_command(server, session, argv)?;
    Ok(Frame::ok().into())
}

pub fn hsetnx_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let store = &server.store;
    let key = &argv[1];
    let meta = hash_meta(store, key)?;
    if field_get(store, key, &argv[2])?.is_some() {
        return Ok(Frame::Integer(0).into());
    }
    let len = hash_len(&meta) + 1;
    store
        .db()
        .insert(hash_field_key(key, &argv[2]), argv[3].as_slice())?;
    set_len(store, key, meta, len)?;
    Ok(Frame::Integer(1).into())
}

pub fn hget_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let store = &server.store;
    if hash_meta(store, &argv[1])?.is_none() {
        return Ok(Frame::Null.into());
    }
    Ok(Frame::from_opt(field_get(store, &argv[1], &argv[2])?).into())
}

pub fn hmget_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let store = &server.store;
    let present = hash_meta(store, &argv[1])?.is_some();
    let mut out = Vec::with_capacity(argv.len() - 2);
    for field in &argv[2..] {
        let value = if present {
            field_get(store, &argv[1], field)?
        } else {
            None
        };
        out.push(Frame::from_opt(value));
    }
    Ok(Frame::Array(out).into())
}

pub fn hgetall_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let store = &server.store;
    if hash_meta(store, &argv[1])?.is_none() {
        return Ok(Frame::Array(vec![]).into());
    }
    let mut out = Vec::new();
    for (field, value) in all_pairs(store, &argv[1])? {
        out.push(Frame::Bulk(field));
        out.push(Frame::Bulk(value));
    }
    Ok(Frame::Array(out).into())
}

pub fn hdel_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let store = &server.store;
    let key = &argv[1];
    let Some(meta) = hash_meta(store, key)? else {
        return Ok(Frame::Integer(0).into());
    };
    let mut len = meta.len();
    let mut removed = 0;
    for field in &argv[2..] {
        if store.db().remove(hash_field_key(key, field))?.is_some() {
            removed += 1;
            len -= 1;
        }
    }
    if removed > 0 {
        set_len(store, key, Some(meta), len)?;
    }
    Ok(Frame::Integer(removed).into())
}

pub fn hlen_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let meta = hash_meta(&server.store, &argv[1])?;
    Ok(Frame::Integer(hash_len(&meta) as i64).into())
}

pub fn hexists_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let store = &server.store;
    let found = hash_meta(store, &argv[1])?.is_some()
        && field_get(store, &argv[1], &argv[2])?.is_some();
    Ok(Frame::Integer(found as i64).into())
}

pub fn hkeys_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let store = &server.store;
    if hash_meta(store, &argv[1])?.is_none() {
        return Ok(Frame::Array(vec![]).into());
    }
    let out = all_pairs(store, &argv[1])?
        .into_iter()
        .map(|(f, _)| Frame::Bulk(f))
        .collect();
    Ok(Frame::Array(out).into())
}

pub fn hvals_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let store = &server.store;
    if hash_meta(store, &argv[1])?.is_none() {
        return Ok(Frame::Array(vec![]).into());
    }
    let out = all_pairs(store, &argv[1])?
        .into_iter()
        .map(|(_, v)| Frame::Bulk(v))
        .collect();
    Ok(Frame::Array(out).into())
}

pub fn hincrby_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let delta = parse_i64(&argv[3]).ok_or(ServerError::NotInteger)?;
    let store = &server.store;
    let key = &argv[1];
    let meta = hash_meta(store, key)?;
    let current = match field_get(store, key, &argv[2])? {
        Some(raw) => parse_i64(&raw).ok_or_else(|| {
            ServerError::other("hash value is not an integer")
        })?,
        None => 0,
    };
    let new = current.checked_add(delta).ok_or(ServerError::Overflow)?;
    let grew = field_get(store, key, &argv[2])?.is_none();
    store
        .db()
        .insert(hash_field_key(key, &argv[2]), new.to_string().into_bytes())?;
    let len = hash_len(&meta) + grew as u64;
    set_len(store, key, meta, len)?;
    Ok(Frame::Integer(new).into())
}

pub fn hincrbyfloat_command(
    server: &Arc<Server>,
    session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let delta = parse_f64(&argv[3]).ok_or(ServerError::NotFloat)?;
    let store = &server.store;
    let key = &argv[1];
    let meta = hash_meta(store, key)?;
    let current = match field_get(store, key, &argv[2])? {
        Some(raw) => parse_f64(&raw).ok_or_else(|| {
            ServerError::other("hash value is not a float")
        })?,
        None => 0.0,
    };
    let new = current + delta;
    if new.is_nan() || new.is_infinite() {
        return Err(ServerError::other("increment would produce NaN or Infinity"));
    }
    let encoded = fmt_f64(new).into_bytes();
    let grew = field_get(store, key, &argv[2])?.is_none();
    store
        .db()
        .insert(hash_field_key(key, &argv[2]), encoded.clone())?;
    let len = hash_len(&meta) + grew as u64;
    set_len(store, key, meta, len)?;
    session.prop_override = Some(vec![vec![
        b"HSET".to_vec(),
        key.clone(),
        argv[2].clone(),
        encoded.clone(),
    ]]);
    Ok(Frame::Bulk(encoded).into())
}

pub fn hstrlen_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let store = &server.store;
    let len = if hash_meta(store, &argv[1])?.is_some() {
        field_get(store, &argv[1], &argv[2])?.map(|v| v.len()).unwrap_or(0)
    } else {
        0
    };
    Ok(Frame::Integer(len as i64).into())
}

pub fn hrandfield_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let store = &server.store;
    let with_values = match argv.get(3) {
        Some(opt) if opt.eq_ignore_ascii_case(b"WITHVALUES") => true,
        Some(_) => return Err(ServerError::Syntax),
        None => false,
    };
    let count = match argv.get(2) {
        Some(raw) => Some(parse_i64(raw).ok_or(ServerError::NotInteger)?),
        None => None,
    };
    let pairs = if hash_meta(store, &argv[1])?.is_some() {
        all_pairs(store, &argv[1])?
    } else {
        Vec::new()
    };
    let mut rng = rand::thread_rng();
    match count {
        None => Ok(match pairs.choose(&mut rng) {
            Some((f, _)) => Frame::Bulk(f.clone()).into(),
            None => Frame::Null.into(),
        }),
        Some(n) => {
            let mut out = Vec::new();
            if n >= 0 {
                // distinct fields, at most the hash size
                let mut shuffled = pairs;
                shuffled.shuffle(&mut rng);
                for (f, v) in shuffled.into_iter().take(n as usize) {
                    out.push(Frame::Bulk(f));
                    if with_values {
                        out.push(Frame::Bulk(v));
                    }
                }
            } else if !pairs.is_empty() {
                // negative count allows repeats
                for _ in 0..n.unsigned_abs() {
                    let (f, v) = &pairs[rng.gen_range(0..pairs.len())];
                    out.push(Frame::Bulk(f.clone()));
                    if with_values {
                        out.push(Frame::Bulk(v.clone()));
                    }
                }
            }
            Ok(Frame::Array(out).into())
        }
    }
}

pub fn hscan_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let cursor = parse_u64(&argv[2]).ok_or_else(|| ServerError::other("invalid cursor"))?;
    let args = parse_scan_args(&argv[3..], false)?;
    let store = &server.store;
    if hash_meta(store, &argv[1])?.is_none() {
        return Ok(scan_reply(0, Vec::new()).into());
    }
    let prefix = elem_prefix(KIND_HASH, &argv[1]);
    let Some((walked, next_cursor)) = scan_subkeys(store, &prefix, cursor, args.count)? else {
        return Ok(scan_reply(0, Vec::new()).into());
    };
    let mut items = Vec::new();
    for (field, value) in walked {
        if args
            .pattern
            .as_deref()
            .map_or(true, |p| glob_match(p, &field))
        {
            items.push(Frame::Bulk(field));
            items.push(Frame::Bulk(value));
        }
    }
    Ok(scan_reply(next_cursor, items).into())
}
