//! Set commands, including the algebra (SINTER/SUNION/SDIFF) and the
//! *STORE forms.

use std::collections::HashSet;
use std::sync::Arc;

use rand::seq::SliceRandom;
use rand::Rng;

use crate::client::Session;
use crate::commands::generic::{parse_scan_args, scan_reply, scan_subkeys};
use crate::commands::Reply;
use crate::errors::ServerError;
use crate::resp::Frame;
use crate::server::Server;
use crate::storage::encoding::{elem_prefix, set_member_key, Meta, MetaAux, ValueTag, KIND_SET};
use crate::storage::Store;
use crate::util::{glob_match, parse_i64, parse_u64};

fn set_meta(store: &Store, key: &[u8]) -> Result<Option<Meta>, ServerError> {
    store.meta_expect(key, &[ValueTag::Set])
}

fn write_len(store: &Store, key: &[u8], meta: Option<Meta>, len: u64) -> Result<(), ServerError> {
    if len == 0 {
        store.delete_key(key)?;
        return Ok(());
    }
    let mut meta = meta.unwrap_or_else(|| Meta::new(ValueTag::Set));
    meta.aux = MetaAux::Coll { len };
    store.write_meta(key, &meta)?;
    store.bump(key);
    Ok(())
}

pub(crate) fn members(store: &Store, key: &[u8]) -> Result<Vec<Vec<u8>>, ServerError> {
    let prefix = elem_prefix(KIND_SET, key);
    let mut out = Vec::new();
    for item in store.db().scan_prefix(&prefix) {
        let (k, _) = item?;
        out.push(k[prefix.len()..].to_vec());
    }
    Ok(out)
}

fn members_checked(store: &Store, key: &[u8]) -> Result<Vec<Vec<u8>>, ServerError> {
    match set_meta(store, key)? {
        Some(_) => members(store, key),
        None => Ok(Vec::new()),
    }
}

/// Replace `key` with exactly `members`; used by the *STORE commands.
pub(crate) fn store_set(
    store: &Store,
    key: &[u8],
    members: &HashSet<Vec<u8>>,
) -> Result<(), ServerError> {
    store.delete_key(key)?;
    if members.is_empty() {
        store.bump(key);
        return Ok(());
    }
    for member in members {
        store.db().insert(set_member_key(key, member), &[][..])?;
    }
    let mut meta = Meta::new(ValueTag::Set);
    meta.aux = MetaAux::Coll {
        len: members.len() as u64,
    };
    store.write_meta(key, &meta)?;
    store.bump(key);
    Ok(())
}

pub fn sadd_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let store = &server.store;
    let key = &argv[1];
    let meta = set_meta(store, key)?;
    let mut len = meta.as_ref().map(|m| m.len()).unwrap_or(0);
    let mut added = 0;
    for member in &argv[2..] {
        if store
            .db()
            .insert(set_member_key(key, member), &[][..])?
            .is_none()
        {
            added += 1;
            len += 1;
        }
    }
    write_len(store, key, meta, len)?;
    Ok(Frame::Integer(added).into())
}

pub fn srem_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let store = &server.store;
    let key = &argv[1];
    let Some(meta) = set_meta(store, key)? else {
        return Ok(Frame::Integer(0).into());
    };
    let mut len = meta.len();
    let mut removed = 0;
    for member in &argv[2..] {
        if store.db().remove(set_member_key(key, member))?.is_some() {
            removed += 1;
            len -= 1;
        }
    }
    if removed > 0 {
        write_len(store, key, Some(meta), len)?;
    }
    Ok(Frame::Integer(removed).into())
}

pub fn spop_command(
    server: &Arc<Server>,
    session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let store = &server.store;
    let key = &argv[1];
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
    let Some(meta) = set_meta(store, key)? else {
        return Ok(match count {
            None => Frame::Null.into(),
            Some(_) => Frame::Array(vec![]).into(),
        });
    };
    let mut all = members(store, key)?;
    let mut rng = rand::thread_rng();
    all.shuffle(&mut rng);
    let take = count.unwrap_or(1).min(all.len());
    let popped: Vec<Vec<u8>> = all.drain(..take).collect();
    let mut len = meta.len();
    for member in &popped {
        store.db().remove(set_member_key(key, member))?;
        len -= 1;
    }
    write_len(store, key, Some(meta), len)?;
    // random removal must replicate deterministically
    if !popped.is_empty() {
        let mut srem = vec![b"SREM".to_vec(), key.clone()];
        srem.extend(popped.iter().cloned());
        session.prop_override = Some(vec![srem]);
    }
    Ok(match count {
        None => Frame::from_opt(popped.into_iter().next()).into(),
        Some(_) => Frame::Array(popped.into_iter().map(Frame::Bulk).collect()).into(),
    })
}

pub fn srandmember_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let store = &server.store;
    let count = match argv.get(2) {
        Some(raw) => Some(parse_i64(raw).ok_or(ServerError::NotInteger)?),
        None => None,
    };
    let all = members_checked(store, &argv[1])?;
    let mut rng = rand::thread_rng();
    match count {
        None => Ok(match all.choose(&mut rng) {
            Some(m) => Frame::Bulk(m.clone()).into(),
            None => Frame::Null.into(),
        }),
        Some(n) if n >= 0 => {
            let mut shuffled = all;
            shuffled.shuffle(&mut rng);
            Ok(Frame::Array(
                shuffled
                    .into_iter()
                    .take(n as usize)
                    .map(Frame::Bulk)
                    .collect(),
            )
            .into())
        }
        Some(n) => {
            let mut out = Vec::new();
            if !all.is_empty() {
                for _ in 0..n.unsigned_abs() {
                    out.push(Frame::Bulk(all[rng.gen_range(0..all.len())].clone()));
                }
            }
            Ok(Frame::Array(out).into())
        }
    }
}

pub fn scard_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let len = set_meta(&server.store, &argv[1])?
        .map(|m| m.len())
        .unwrap_or(0);
    Ok(Frame::Integer(len as i64).into())
}

pub fn sismember_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let store = &server.store;
    let found = set_meta(store, &argv[1])?.is_some()
        && store.db().get(set_member_key(&argv[1], &argv[2]))?.is_some();
    Ok(Frame::Integer(found as i64).into())
}

pub fn smismember_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let store = &server.store;
    let present = set_meta(store, &argv[1])?.is_some();
    let mut out = Vec::with_capacity(argv.len() - 2);
    for member in &argv[2..] {
        let found =
            present && store.db().get(set_member_key(&argv[1], member))?.is_some();
        out.push(Frame::Integer(found as i64));
    }
    Ok(Frame::Array(out).into())
}

pub fn smembers_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let all = members_checked(&server.store, &argv[1])?;
    Ok(Frame::Array(all.into_iter().map(Frame::Bulk).collect()).into())
}

pub fn smove_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let store = &server.store;
    let src = &argv[1];
    let dst = &argv[2];
    let member = &argv[3];
    let Some(src_meta) = set_meta(store, src)? else {
        return Ok(Frame::Integer(0).into());
    };
    let dst_meta = set_meta(store, dst)?; // type check before mutating
    if store.db().get(set_member_key(src, member))?.is_none() {
        return Ok(Frame::Integer(0).into());
    }
    if src == dst {
        return Ok(Frame::Integer(1).into());
    }
    store.db().remove(set_member_key(src, member))?;
    write_len(store, src, Some(src_meta.clone()), src_meta.len() - 1)?;
    let mut dst_len = dst_meta.as_ref().map(|m| m.len()).unwrap_or(0);
    if store
        .db()
        .insert(set_member_key(dst, member), &[][..])?
        .is_none()
    {
        dst_len += 1;
    }
    write_len(store, dst, dst_meta, dst_len)?;
    Ok(Frame::Integer(1).into())
}

enum SetOp {
    Inter,
    Union,
    Diff,
}

fn combine(
    store: &Store,
    keys: &[Vec<u8>],
    op: SetOp,
) -> Result<HashSet<Vec<u8>>, ServerError> {
    let mut result: HashSet<Vec<u8>> = members_checked(store, &keys[0])?.into_iter().collect();
    for key in &keys[1..] {
        let other: HashSet<Vec<u8>> = members_checked(store, key)?.into_iter().collect();
        match op {
            SetOp::Inter => result.retain(|m| other.contains(m)),
            SetOp::Union => result.extend(other),
            SetOp::Diff => result.retain(|m| !other.contains(m)),
        }
        if result.is_empty() {
            break;
        }
    }
    Ok(result)
}

fn setop_command(
    server: &Arc<Server>,
    argv: &[Vec<u8>],
    op: SetOp,
) -> Result<Reply, ServerError> {
    let result = combine(&server.store, &argv[1..], op)?;
    Ok(Frame::Array(result.into_iter().map(Frame::Bulk).collect()).into())
}

fn setop_store_command(
    server: &Arc<Server>,
    argv: &[Vec<u8>],
    op: SetOp,
) -> Result<Reply, ServerError> {
    let result = combine(&server.store, &argv[2..], op)?;
    let len = result.len();
    store_set(&server.store, &argv[1], &result)?;
    Ok(Frame::Integer(len as i64).into())
}

pub fn sinter_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    setop_command(server, argv, SetOp::Inter)
}

pub fn sunion_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    setop_command(server, argv, SetOp::Union)
}

pub fn sdiff_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    setop_command(server, argv, SetOp::Diff)
}

pub fn sinterstore_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    setop_store_command(server, argv, SetOp::Inter)
}

pub fn sunionstore_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    setop_store_command(server, argv, SetOp::Union)
}

pub fn sdiffstore_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    setop_store_command(server, argv, SetOp::Diff)
}

pub fn sintercard_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let numkeys = parse_i64(&argv[1]).ok_or(ServerError::NotInteger)?;
    if numkeys < 1 {
        return Err(ServerError::other("numkeys should be greater than 0"));
    }
    let numkeys = numkeys as usize;
    if argv.len() < 2 + numkeys {
        return Err(ServerError::Syntax);
    }
    let mut limit = usize::MAX;
    let rest = &argv[2 + numkeys..];
    if !rest.is_empty() {
        if rest.len() != 2 || !rest[0].eq_ignore_ascii_case(b"LIMIT") {
            return Err(ServerError::Syntax);
        }
        let n = parse_i64(&rest[1]).ok_or(ServerError::NotInteger)?;
        if n < 0 {
            return Err(ServerError::other("LIMIT can't be negative"));
        }
        if n > 0 {
            limit = n as usize;
        }
    }
    let result = combine(&server.store, &argv[2..2 + numkeys], SetOp::Inter)?;
    Ok(Frame::Integer(result.len().min(limit) as i64).into())
}

pub fn sscan_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let cursor = parse_u64(&argv[2]).ok_or_else(|| ServerError::other("invalid cursor"))?;
    let args = parse_scan_args(&argv[3..], false)?;
    let store = &server.store;
    if set_meta(store, &argv[1])?.is_none() {
        return Ok(scan_reply(0, Vec::new()).into());
    }
    let prefix = elem_prefix(KIND_SET, &argv[1]);
    let Some((walked, next_cursor)) = scan_subkeys(store, &prefix, cursor, args.count)? else {
        return Ok(scan_reply(0, Vec::new()).into());
    };
    let items = walked
        .into_iter()
        .filter(|(member, _)| {
            args.pattern
                .as_deref()
                .map_or(true, |p| glob_match(p, member))
        })
        .map(|(member, _)| Frame::Bulk(member))
        .collect();
    Ok(scan_reply(next_cursor, items).into())
}
