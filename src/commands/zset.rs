//! Sorted-set commands. Two records per member: member -> score bits for
//! O(log n) score lookup, and an (encoded score, member) key whose store
//! order is exactly the (score, member) order the wire exposes.

use std::collections::HashMap;
use std::sync::Arc;

use rand::seq::SliceRandom;
use rand::Rng;

use crate::client::Session;
use crate::commands::generic::{parse_scan_args, scan_reply, scan_subkeys};
use crate::commands::Reply;
use crate::errors::ServerError;
use crate::resp::Frame;
use crate::server::Server;
use crate::storage::encoding::{
    elem_prefix, zset_member_key, zset_score_key, Meta, MetaAux, ValueTag, KIND_SET,
    KIND_ZSET_MEMBER, KIND_ZSET_SCORE,
};
use crate::storage::Store;
use crate::util::{fmt_f64, glob_match, parse_f64, parse_i64, parse_u64};

fn zset_meta(store: &Store, key: &[u8]) -> Result<Option<Meta>, ServerError> {
    store.meta_expect(key, &[ValueTag::ZSet])
}

fn write_len(store: &Store, key: &[u8], meta: Option<Meta>, len: u64) -> Result<(), ServerError> {
    if len == 0 {
        store.delete_key(key)?;
        return Ok(());
    }
    let mut meta = meta.unwrap_or_else(|| Meta::new(ValueTag::ZSet));
    meta.aux = MetaAux::Coll { len };
    store.write_meta(key, &meta)?;
    store.bump(key);
    Ok(())
}

pub(crate) fn member_score(
    store: &Store,
    key: &[u8],
    member: &[u8],
) -> Result<Option<f64>, ServerError> {
    Ok(store
        .db()
        .get(zset_member_key(key, member))?
        .map(|v| f64::from_bits(u64::from_be_bytes(v[..8].try_into().unwrap()))))
}

/// Insert or move one member. Returns true when the member is new.
pub(crate) fn upsert_member(
    store: &Store,
    key: &[u8],
    member: &[u8],
    score: f64,
) -> Result<bool, ServerError> {
    if let Some(old) = member_score(store, key, member)? {
        if old.to_bits() != score.to_bits() {
            store.db().remove(zset_score_key(key, old, member))?;
            store.db().insert(zset_score_key(key, score, member), &[][..])?;
            store
                .db()
                .insert(zset_member_key(key, member), score.to_bits().to_be_bytes().to_vec())?;
        }
        Ok(false)
    } else {
        store.db().insert(zset_score_key(key, score, member), &[][..])?;
        store
            .db()
            .insert(zset_member_key(key, member), score.to_bits().to_be_bytes().to_vec())?;
        Ok(true)
    }
}

fn remove_member(store: &Store, key: &[u8], member: &[u8]) -> Result<bool, ServerError> {
    match member_score(store, key, member)? {
        Some(score) => {
            store.db().remove(zset_member_key(key, member))?;
            store.db().remove(zset_score_key(key, score, member))?;
            Ok(true)
        }
        None => Ok(false),
    }
}

/// All (score, member) pairs in (score, member) order.
pub(crate) fn ordered(store: &Store, key: &[u8]) -> Result<Vec<(f64, Vec<u8>)>, ServerError> {
    let prefix = elem_prefix(KIND_ZSET_SCORE, key);
    let mut out = Vec::new();
    for item in store.db().scan_prefix(&prefix) {
        let (k, _) = item?;
        let score = crate::storage::encoding::decode_score(&k[prefix.len()..prefix.len() + 8]);
        out.push((score, k[prefix.len() + 8..].to_vec()));
    }
    Ok(out)
}

fn ordered_checked(store: &Store, key: &[u8]) -> Result<Vec<(f64, Vec<u8>)>, ServerError> {
    match zset_meta(store, key)? {
        Some(_) => ordered(store, key),
        None => Ok(Vec::new()),
    }
}

/// Replace `key` with the given pairs (the *STORE commands).
pub(crate) fn store_zset(
    store: &Store,
    key: &[u8],
    pairs: &HashMap<Vec<u8>, f64>,
) -> Result<(), ServerError> {
    store.delete_key(key)?;
    if pairs.is_empty() {
        store.bump(key);
        return Ok(());
    }
    for (member, &score) in pairs {
        store.db().insert(zset_score_key(key, score, member), &[][..])?;
        store
            .db()
            .insert(zset_member_key(key, member), score.to_bits().to_be_bytes().to_vec())?;
    }
    let mut meta = Meta::new(ValueTag::ZSet);
    meta.aux = MetaAux::Coll {
        len: pairs.len() as u64,
    };
    store.write_meta(key, &meta)?;
    store.bump(key);
    Ok(())
}

// -- range bound parsing ----------------------------------------------------

#[derive(Clone, Copy)]
pub(crate) struct ScoreBound {
    pub value: f64,
    pub exclusive: bool,
}

pub(crate) fn parse_score_bound(raw: &[u8]) -> Result<ScoreBound, ServerError> {
    let (raw, exclusive) = match raw.first() {
        Some(b'(') => (&raw[1..], true),
        _ => (raw, false),
    };
    let value = parse_f64(raw).ok_or_else(|| ServerError::other("min or max is not a float"))?;
    if value.is_nan() {
        return Err(ServerError::other("min or max is not a float"));
    }
    Ok(ScoreBound { value, exclusive })
}

fn score_in(score: f64, min: &ScoreBound, max: &ScoreBound) -> bool {
    let lower = if min.exclusive {
        score > min.value
    } else {
        score >= min.value
    };
    let upper = if max.exclusive {
        score < max.value
    } else {
        score <= max.value
    };
    lower && upper
}

#[derive(Clone)]
pub(crate) enum LexBound {
    NegInf,
    PosInf,
    Inclusive(Vec<u8>),
    Exclusive(Vec<u8>),
}

pub(crate) fn parse_lex_bound(raw: &[u8]) -> Result<LexBound, ServerError> {
    match raw.first() {
        Some(b'-') if raw.len() == 1 => Ok(LexBound::NegInf),
        Some(b'+') if raw.len() == 1 => Ok(LexBound::PosInf),
        Some(b'[') => Ok(LexBound::Inclusive(raw[1..].to_vec())),
        Some(b'(') => Ok(LexBound::Exclusive(raw[1..].to_vec())),
        _ => Err(ServerError::other("min or max not valid string range item")),
    }
}

fn lex_in(member: &[u8], min: &LexBound, max: &LexBound) -> bool {
    let lower = match min {
        LexBound::NegInf => true,
        LexBound::PosInf => false,
        LexBound::Inclusive(b) => member >= b.as_slice(),
        LexBound::Exclusive(b) => member > b.as_slice(),
    };
    let upper = match max {
        LexBound::NegInf => false,
        LexBound::PosInf => true,
        LexBound::Inclusive(b) => member <= b.as_slice(),
        LexBound::Exclusive(b) => member < b.as_slice(),
    };
    lower && upper
}

fn with_scores_reply(pairs: Vec<(f64, Vec<u8>)>, withscores: bool) -> Frame {
    let mut out = Vec::with_capacity(pairs.len() * if withscores { 2 } else { 1 });
    for (score, member) in pairs {
        out.push(Frame::Bulk(member));
        if withscores {
            out.push(Frame::bulk(fmt_f64(score).into_bytes()));
        }
    }
    Frame::Array(out)
}

// -- ZADD and friends -------------------------------------------------------

pub fn zadd_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let mut nx = false;
    let mut xx = false;
    let mut gt = false;
    let mut lt = false;
    let mut ch = false;
    let mut incr = false;
    let mut i = 2;
    while i < argv.len() {
        match argv[i].to_ascii_uppercase().as_slice() {
            b"NX" => nx = true,
            b"XX" => xx = true,
            b"GT" => gt = true,
            b"LT" => lt = true,
            b"CH" => ch = true,
            b"INCR" => incr = true,
            _ => break,
        }
        i += 1;
    }
    if nx && xx {
        return Err(ServerError::other(
            "XX and NX options at the same time are not compatible",
        ));
    }
    if (gt && lt) || (nx && (gt || lt)) {
        return Err(ServerError::other(
            "GT, LT, and/or NX options at the same time are not compatible",
        ));
    }
    let rest = &argv[i..];
    if rest.is_empty() || rest.len() % 2 != 0 {
        return Err(ServerError::Syntax);
    }
    if incr && rest.len() != 2 {
        return Err(ServerError::other(
            "INCR option supports a single increment-element pair",
        ));
    }
    let mut pairs = Vec::with_capacity(rest.len() / 2);
    for chunk in rest.chunks(2) {
        let score = parse_f64(&chunk[0]).ok_or(ServerError::NotFloat)?;
        if score.is_nan() {
            return Err(ServerError::NotFloat);
        }
        pairs.push((score, chunk[1].clone()));
    }

    let store = &server.store;
    let key = &argv[1];
    let meta = zset_meta(store, key)?;
    let mut len = meta.as_ref().map(|m| m.len()).unwrap_or(0);
    let mut added = 0i64;
    let mut changed = 0i64;
    let mut incr_result: Option<Option<f64>> = None;

    for (score, member) in pairs {
        let existing = member_score(store, key, &member)?;
        let target = if incr {
            match existing {
                Some(old) => {
                    let new = old + score;
                    if new.is_nan() {
                        return Err(ServerError::other("resulting score is not a number (NaN)"));
                    }
                    new
                }
                None => score,
            }
        } else {
            score
        };
        let skip = match existing {
            Some(old) => nx || (gt && target <= old) || (lt && target >= old),
            None => xx,
        };
        if skip {
            if incr {
                incr_result = Some(None);
            }
            continue;
        }
        let was_new = upsert_member(store, key, &member, target)?;
        if was_new {
            added += 1;
            len += 1;
        } else if existing.map(|o| o.to_bits()) != Some(target.to_bits()) {
            changed += 1;
        }
        if incr {
            incr_result = Some(Some(target));
        }
    }
    write_len(store, key, meta, len)?;
    server.blockers.notify_key(key);

    if incr {
        return Ok(match incr_result {
            Some(Some(score)) => Frame::bulk(fmt_f64(score).into_bytes()).into(),
            _ => Frame::Null.into(),
        });
    }
    Ok(Frame::Integer(if ch { added + changed } else { added }).into())
}

pub fn zincrby_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let delta = parse_f64(&argv[2]).ok_or(ServerError::NotFloat)?;
    let store = &server.store;
    let key = &argv[1];
    let meta = zset_meta(store, key)?;
    let mut len = meta.as_ref().map(|m| m.len()).unwrap_or(0);
    let new = match member_score(store, key, &argv[3])? {
        Some(old) => {
            let new = old + delta;
            if new.is_nan() {
                return Err(ServerError::other("resulting score is not a number (NaN)"));
            }
            new
        }
        None => delta,
    };
    if upsert_member(store, key, &argv[3], new)? {
        len += 1;
    }
    write_len(store, key, meta, len)?;
    server.blockers.notify_key(key);
    Ok(Frame::bulk(fmt_f64(new).into_bytes()).into())
}

pub fn zrem_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let store = &server.store;
    let key = &argv[1];
    let Some(meta) = zset_meta(store, key)? else {
        return Ok(Frame::Integer(0).into());
    };
    let mut len = meta.len();
    let mut removed = 0;
    for member in &argv[2..] {
        if remove_member(store, key, member)? {
            removed += 1;
            len -= 1;
        }
    }
    if removed > 0 {
        write_len(store, key, Some(meta), len)?;
    }
    Ok(Frame::Integer(removed).into())
}

pub fn zscore_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let store = &server.store;
    if zset_meta(store, &argv[1])?.is_none() {
        return Ok(Frame::Null.into());
    }
    Ok(match member_score(store, &argv[1], &argv[2])? {
        Some(score) => Frame::bulk(fmt_f64(score).into_bytes()).into(),
        None => Frame::Null.into(),
    })
}

pub fn zmscore_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let store = &server.store;
    let present = zset_meta(store, &argv[1])?.is_some();
    let mut out = Vec::with_capacity(argv.len() - 2);
    for member in &argv[2..] {
        let score = if present {
            member_score(store, &argv[1], member)?
        } else {
            None
        };
        out.push(match score {
            Some(s) => Frame::bulk(fmt_f64(s).into_bytes()),
            None => Frame::Null,
        });
    }
    Ok(Frame::Array(out).into())
}

pub fn zcard_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let len = zset_meta(&server.store, &argv[1])?
        .map(|m| m.len())
        .unwrap_or(0);
    Ok(Frame::Integer(len as i64).into())
}

pub fn zcount_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let min = parse_score_bound(&argv[2])?;
    let max = parse_score_bound(&argv[3])?;
    let count = ordered_checked(&server.store, &argv[1])?
        .into_iter()
        .filter(|(score, _)| score_in(*score, &min, &max))
        .count();
    Ok(Frame::Integer(count as i64).into())
}

pub fn zlexcount_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let min = parse_lex_bound(&argv[2])?;
    let max = parse_lex_bound(&argv[3])?;
    let count = ordered_checked(&server.store, &argv[1])?
        .into_iter()
        .filter(|(_, member)| lex_in(member, &min, &max))
        .count();
    Ok(Frame::Integer(count as i64).into())
}

fn rank_of(
    store: &Store,
    key: &[u8],
    member: &[u8],
    reverse: bool,
) -> Result<Option<i64>, ServerError> {
    let pairs = ordered_checked(store, key)?;
    let len = pairs.len();
    let position = pairs.into_iter().position(|(_, m)| m == member);
    Ok(position.map(|p| {
        if reverse {
            (len - 1 - p) as i64
        } else {
            p as i64
        }
    }))
}

pub fn zrank_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    Ok(match rank_of(&server.store, &argv[1], &argv[2], false)? {
        Some(rank) => Frame::Integer(rank).into(),
        None => Frame::Null.into(),
    })
}

pub fn zrevrank_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    Ok(match rank_of(&server.store, &argv[1], &argv[2], true)? {
        Some(rank) => Frame::Integer(rank).into(),
        None => Frame::Null.into(),
    })
}

// -- ranges -----------------------------------------------------------------

fn index_range(
    pairs: Vec<(f64, Vec<u8>)>,
    start: i64,
    stop: i64,
    reverse: bool,
) -> Vec<(f64, Vec<u8>)> {
    let mut pairs = pairs;
    if reverse {
        pairs.reverse();
    }
    let len = pairs.len() as i64;
    let mut start = if start < 0 { len + start } else { start };
    let mut stop = if stop < 0 { len + stop } else { stop };
    if start < 0 {
        start = 0;
    }
    if stop >= len {
        stop = len - 1;
    }
    if start > stop || len == 0 || start >= len {
        return Vec::new();
    }
    pairs[start as usize..=stop as usize].to_vec()
}

fn parse_limit(args: &[Vec<u8>], i: &mut usize) -> Result<(i64, i64), ServerError> {
    let offset = args
        .get(*i + 1)
        .and_then(|a| parse_i64(a))
        .ok_or(ServerError::NotInteger)?;
    let count = args
        .get(*i + 2)
        .and_then(|a| parse_i64(a))
        .ok_or(ServerError::NotInteger)?;
    *i += 2;
    Ok((offset, count))
}

fn apply_limit(pairs: Vec<(f64, Vec<u8>)>, offset: i64, count: i64) -> Vec<(f64, Vec<u8>)> {
    if offset < 0 {
        return Vec::new();
    }
    let iter = pairs.into_iter().skip(offset as usize);
    if count < 0 {
        iter.collect()
    } else {
        iter.take(count as usize).collect()
    }
}

pub fn zrange_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let mut by_score = false;
    let mut by_lex = false;
    let mut reverse = false;
    let mut withscores = false;
    let mut limit: Option<(i64, i64)> = None;
    let mut i = 4;
    while i < argv.len() {
        match argv[i].to_ascii_uppercase().as_slice() {
            b"BYSCORE" => by_score = true,
            b"BYLEX" => by_lex = true,
            b"REV" => reverse = true,
            b"WITHSCORES" => withscores = true,
            b"LIMIT" => limit = Some(parse_limit(argv, &mut i)?),
            _ => return Err(ServerError::Syntax),
        }
        i += 1;
    }
    if by_score && by_lex {
        return Err(ServerError::Syntax);
    }
    if limit.is_some() && !by_score && !by_lex {
        return Err(ServerError::other(
            "syntax error, LIMIT is only supported in combination with either BYSCORE or BYLEX",
        ));
    }
    if by_lex && withscores {
        return Err(ServerError::Syntax);
    }
    let pairs = ordered_checked(&server.store, &argv[1])?;
    let result = if by_score {
        // in REV form min and max are swapped on the wire
        let (min_raw, max_raw) = if reverse {
            (&argv[3], &argv[2])
        } else {
            (&argv[2], &argv[3])
        };
        let min = parse_score_bound(min_raw)?;
        let max = parse_score_bound(max_raw)?;
        let mut filtered: Vec<(f64, Vec<u8>)> = pairs
            .into_iter()
            .filter(|(score, _)| score_in(*score, &min, &max))
            .collect();
        if reverse {
            filtered.reverse();
        }
        match limit {
            Some((offset, count)) => apply_limit(filtered, offset, count),
            None => filtered,
        }
    } else if by_lex {
        let (min_raw, max_raw) = if reverse {
            (&argv[3], &argv[2])
        } else {
            (&argv[2], &argv[3])
        };
        let min = parse_lex_bound(min_raw)?;
        let max = parse_lex_bound(max_raw)?;
        let mut filtered: Vec<(f64, Vec<u8>)> = pairs
            .into_iter()
            .filter(|(_, member)| lex_in(member, &min, &max))
            .collect();
        if reverse {
            filtered.reverse();
        }
        match limit {
            Some((offset, count)) => apply_limit(filtered, offset, count),
            None => filtered,
        }
    } else {
        let start = parse_i64(&argv[2]).ok_or(ServerError::NotInteger)?;
        let stop = parse_i64(&argv[3]).ok_or(ServerError::NotInteger)?;
        index_range(pairs, start, stop, reverse)
    };
    Ok(with_scores_reply(result, withscores).into())
}

fn legacy_range(
    server: &Arc<Server>,
    argv: &[Vec<u8>],
    reverse: bool,
) -> Result<Reply, ServerError> {
    let withscores = match argv.get(4) {
        Some(opt) if opt.eq_ignore_ascii_case(b"WITHSCORES") => true,
        Some(_) => return Err(ServerError::Syntax),
        None => false,
    };
    let start = parse_i64(&argv[2]).ok_or(ServerError::NotInteger)?;
    let stop = parse_i64(&argv[3]).ok_or(ServerError::NotInteger)?;
    let pairs = ordered_checked(&server.store, &argv[1])?;
    Ok(with_scores_reply(index_range(pairs, start, stop, reverse), withscores).into())
}

pub fn zrevrange_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    legacy_range(server, argv, true)
}

fn legacy_rangebyscore(
    server: &Arc<Server>,
    argv: &[Vec<u8>],
    reverse: bool,
) -> Result<Reply, ServerError> {
    let (min_raw, max_raw) = if reverse {
        (&argv[3], &argv[2])
    } else {
        (&argv[2], &argv[3])
    };
    let min = parse_score_bound(min_raw)?;
    let max = parse_score_bound(max_raw)?;
    let mut withscores = false;
    let mut limit: Option<(i64, i64)> = None;
    let mut i = 4;
    while i < argv.len() {
        match argv[i].to_ascii_uppercase().as_slice() {
            b"WITHSCORES" => withscores = true,
            b"LIMIT" => limit = Some(parse_limit(argv, &mut i)?),
            _ => return Err(ServerError::Syntax),
        }
        i += 1;
    }
    let mut filtered: Vec<(f64, Vec<u8>)> = ordered_checked(&server.store, &argv[1])?
        .into_iter()
        .filter(|(score, _)| score_in(*score, &min, &max))
        .collect();
    if reverse {
        filtered.reverse();
    }
    if let Some((offset, count)) = limit {
        filtered = apply_limit(filtered, offset, count);
    }
    Ok(with_scores_reply(filtered, withscores).into())
}

pub fn zrangebyscore_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    legacy_rangebyscore(server, argv, false)
}

pub fn zrevrangebyscore_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    legacy_rangebyscore(server, argv, true)
}

fn legacy_rangebylex(
    server: &Arc<Server>,
    argv: &[Vec<u8>],
    reverse: bool,
) -> Result<Reply, ServerError> {
    let (min_raw, max_raw) = if reverse {
        (&argv[3], &argv[2])
    } else {
        (&argv[2], &argv[3])
    };
    let min = parse_lex_bound(min_raw)?;
    let max = parse_lex_bound(max_raw)?;
    let mut limit: Option<(i64, i64)> = None;
    let mut i = 4;
    while i < argv.len() {
        match argv[i].to_ascii_uppercase().as_slice() {
            b"LIMIT" => limit = Some(parse_limit(argv, &mut i)?),
            _ => return Err(ServerError::Syntax),
        }
        i += 1;
    }
    let mut filtered: Vec<(f64, Vec<u8>)> = ordered_checked(&server.store, &argv[1])?
        .into_iter()
        .filter(|(_, member)| lex_in(member, &min, &max))
        .collect();
    if reverse {
        filtered.reverse();
    }
    if let Some((offset, count)) = limit {
        filtered = apply_limit(filtered, offset, count);
    }
    Ok(with_scores_reply(filtered, false).into())
}

pub fn zrangebylex_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    legacy_rangebylex(server, argv, false)
}

pub fn zrevrangebylex_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    legacy_rangebylex(server, argv, true)
}

// -- removals by range ------------------------------------------------------

fn remove_pairs(
    store: &Store,
    key: &[u8],
    victims: Vec<(f64, Vec<u8>)>,
) -> Result<i64, ServerError> {
    let Some(meta) = zset_meta(store, key)? else {
        return Ok(0);
    };
    let mut len = meta.len();
    let mut removed = 0;
    for (_, member) in victims {
        if remove_member(store, key, &member)? {
            removed += 1;
            len -= 1;
        }
    }
    if removed > 0 {
        write_len(store, key, Some(meta), len)?;
    }
    Ok(removed)
}

pub fn zremrangebyrank_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let start = parse_i64(&argv[2]).ok_or(ServerError::NotInteger)?;
    let stop = parse_i64(&argv[3]).ok_or(ServerError::NotInteger)?;
    let pairs = ordered_checked(&server.store, &argv[1])?;
    let victims = index_range(pairs, start, stop, false);
    Ok(Frame::Integer(remove_pairs(&server.store, &argv[1], victims)?).into())
}

pub fn zremrangebyscore_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let min = parse_score_bound(&argv[2])?;
    let max = parse_score_bound(&argv[3])?;
    let victims: Vec<(f64, Vec<u8>)> = ordered_checked(&server.store, &argv[1])?
        .into_iter()
        .filter(|(score, _)| score_in(*score, &min, &max))
        .collect();
    Ok(Frame::Integer(remove_pairs(&server.store, &argv[1], victims)?).into())
}

pub fn zremrangebylex_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let min = parse_lex_bound(&argv[2])?;
    let max = parse_lex_bound(&argv[3])?;
    let victims: Vec<(f64, Vec<u8>)> = ordered_checked(&server.store, &argv[1])?
        .into_iter()
        .filter(|(_, member)| lex_in(member, &min, &max))
        .collect();
    Ok(Frame::Integer(remove_pairs(&server.store, &argv[1], victims)?).into())
}

// -- pops -------------------------------------------------------------------

pub(crate) fn pop_extreme(
    store: &Store,
    key: &[u8],
    min_side: bool,
) -> Result<Option<(f64, Vec<u8>)>, ServerError> {
    let pairs = ordered_checked(store, key)?;
    let target = if min_side {
        pairs.first().cloned()
    } else {
        pairs.last().cloned()
    };
    let Some((score, member)) = target else {
        return Ok(None);
    };
    remove_pairs(store, key, vec![(score, member.clone())])?;
    Ok(Some((score, member)))
}

fn zpop_command(
    server: &Arc<Server>,
    argv: &[Vec<u8>],
    min_side: bool,
) -> Result<Reply, ServerError> {
    let count = match argv.get(2) {
        Some(raw) => {
            let n = parse_i64(raw).ok_or(ServerError::NotInteger)?;
            if n < 0 {
                return Err(ServerError::other("value is out of range, must be positive"));
            }
            n as usize
        }
        None => 1,
    };
    let mut out = Vec::new();
    for _ in 0..count {
        match pop_extreme(&server.store, &argv[1], min_side)? {
            Some((score, member)) => {
                out.push(Frame::Bulk(member));
                out.push(Frame::bulk(fmt_f64(score).into_bytes()));
            }
            None => break,
        }
    }
    Ok(Frame::Array(out).into())
}

pub fn zpopmin_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    zpop_command(server, argv, true)
}

pub fn zpopmax_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    zpop_command(server, argv, false)
}

fn bzpop_command(
    server: &Arc<Server>,
    session: &mut Session,
    argv: &[Vec<u8>],
    min_side: bool,
) -> Result<Reply, ServerError> {
    let timeout_ms = super::list::parse_timeout(&argv[argv.len() - 1])?;
    let keys = &argv[1..argv.len() - 1];
    for key in keys {
        if let Some((score, member)) = pop_extreme(&server.store, key, min_side)? {
            session.prop_override = Some(vec![vec![
                if min_side {
                    b"ZPOPMIN".to_vec()
                } else {
                    b"ZPOPMAX".to_vec()
                },
                key.clone(),
            ]]);
            return Ok(Frame::Array(vec![
                Frame::Bulk(key.clone()),
                Frame::Bulk(member),
                Frame::bulk(fmt_f64(score).into_bytes()),
            ])
            .into());
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

pub fn bzpopmin_command(
    server: &Arc<Server>,
    session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    bzpop_command(server, session, argv, true)
}

pub fn bzpopmax_command(
    server: &Arc<Server>,
    session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    bzpop_command(server, session, argv, false)
}

pub fn zrandmember_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let count = match argv.get(2) {
        Some(raw) => Some(parse_i64(raw).ok_or(ServerError::NotInteger)?),
        None => None,
    };
    let withscores = match argv.get(3) {
        Some(opt) if opt.eq_ignore_ascii_case(b"WITHSCORES") => true,
        Some(_) => return Err(ServerError::Syntax),
        None => false,
    };
    let pairs = ordered_checked(&server.store, &argv[1])?;
    let mut rng = rand::thread_rng();
    match count {
        None => Ok(match pairs.choose(&mut rng) {
            Some((_, member)) => Frame::Bulk(member.clone()).into(),
            None => Frame::Null.into(),
        }),
        Some(n) => {
            let mut out = Vec::new();
            if n >= 0 {
                let mut shuffled = pairs;
                shuffled.shuffle(&mut rng);
                for (score, member) in shuffled.into_iter().take(n as usize) {
                    out.push(Frame::Bulk(member));
                    if withscores {
                        out.push(Frame::bulk(fmt_f64(score).into_bytes()));
                    }
                }
            } else if !pairs.is_empty() {
                for _ in 0..n.unsigned_abs() {
                    let (score, member) = &pairs[rng.gen_range(0..pairs.len())];
                    out.push(Frame::Bulk(member.clone()));
                    if withscores {
                        out.push(Frame::bulk(fmt_f64(*score).into_bytes()));
                    }
                }
            }
            Ok(Frame::Array(out).into())
        }
    }
}

// -- store-combining --------------------------------------------------------

#[derive(Clone, Copy, PartialEq)]
enum Aggregate {
    Sum,
    Min,
    Max,
}

/// Load a source for the aggregation commands: sorted sets keep their
/// scores, plain sets count 1.0 per member.
fn load_weighted(store: &Store, key: &[u8]) -> Result<Vec<(Vec<u8>, f64)>, ServerError> {
    match store.meta_expect(key, &[ValueTag::ZSet, ValueTag::Set])? {
        None => Ok(Vec::new()),
        Some(meta) if meta.tag == ValueTag::ZSet => Ok(ordered(store, key)?
            .into_iter()
            .map(|(score, member)| (member, score))
            .collect()),
        Some(_) => {
            let prefix = elem_prefix(KIND_SET, key);
            let mut out = Vec::new();
            for item in store.db().scan_prefix(&prefix) {
                let (k, _) = item?;
                out.push((k[prefix.len()..].to_vec(), 1.0));
            }
            Ok(out)
        }
    }
}

fn zstore_command(
    server: &Arc<Server>,
    argv: &[Vec<u8>],
    op: u8,
) -> Result<Reply, ServerError> {
    let numkeys = parse_i64(&argv[2]).ok_or(ServerError::NotInteger)?;
    if numkeys < 1 {
        return Err(ServerError::other(
            "at least 1 input key is needed for ZUNIONSTORE/ZINTERSTORE",
        ));
    }
    let numkeys = numkeys as usize;
    if argv.len() < 3 + numkeys {
        return Err(ServerError::Syntax);
    }
    let keys = &argv[3..3 + numkeys];
    let mut weights = vec![1.0f64; numkeys];
    let mut aggregate = Aggregate::Sum;
    let mut i = 3 + numkeys;
    while i < argv.len() {
        match argv[i].to_ascii_uppercase().as_slice() {
            b"WEIGHTS" if op != b'D' => {
                for w in weights.iter_mut() {
                    i += 1;
                    *w = argv
                        .get(i)
                        .and_then(|a| parse_f64(a))
                        .ok_or_else(|| ServerError::other("weight value is not a float"))?;
                }
            }
            b"AGGREGATE" if op != b'D' => {
                i += 1;
                aggregate = match argv.get(i).map(|a| a.to_ascii_uppercase()) {
                    Some(a) if a == b"SUM" => Aggregate::Sum,
                    Some(a) if a == b"MIN" => Aggregate::Min,
                    Some(a) if a == b"MAX" => Aggregate::Max,
                    _ => return Err(ServerError::Syntax),
                };
            }
            _ => return Err(ServerError::Syntax),
        }
        i += 1;
    }

    let store = &server.store;
    let mut acc: HashMap<Vec<u8>, f64> = HashMap::new();
    match op {
        b'U' | b'I' => {
            let mut seen_count: HashMap<Vec<u8>, usize> = HashMap::new();
            for (idx, key) in keys.iter().enumerate() {
                for (member, score) in load_weighted(store, key)? {
                    let weighted = score * weights[idx];
                    *seen_count.entry(member.clone()).or_insert(0) += 1;
                    acc.entry(member)
                        .and_modify(|current| {
                            *current = match aggregate {
                                Aggregate::Sum => *current + weighted,
                                Aggregate::Min => current.min(weighted),
                                Aggregate::Max => current.max(weighted),
                            }
                        })
                        .or_insert(weighted);
                }
            }
            if op == b'I' {
                acc.retain(|member, _| seen_count.get(member) == Some(&numkeys));
            }
        }
        _ => {
            for (member, score) in load_weighted(store, &keys[0])? {
                acc.insert(member, score);
            }
            for key in &keys[1..] {
                for (member, _) in load_weighted(store, key)? {
                    acc.remove(&member);
                }
            }
        }
    }
    // NaN from inf + -inf aggregations settles to 0, matching the wire
    for score in acc.values_mut() {
        if score.is_nan() {
            *score = 0.0;
        }
    }
    let len = acc.len();
    store_zset(store, &argv[1], &acc)?;
    Ok(Frame::Integer(len as i64).into())
}

pub fn zunionstore_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    zstore_command(server, argv, b'U')
}

pub fn zinterstore_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    zstore_command(server, argv, b'I')
}

pub fn zdiffstore_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    zstore_command(server, argv, b'D')
}

pub fn zscan_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let cursor = parse_u64(&argv[2]).ok_or_else(|| ServerError::other("invalid cursor"))?;
    let args = parse_scan_args(&argv[3..], false)?;
    let store = &server.store;
    if zset_meta(store, &argv[1])?.is_none() {
        return Ok(scan_reply(0, Vec::new()).into());
    }
    let prefix = elem_prefix(KIND_ZSET_MEMBER, &argv[1]);
    let Some((walked, next_cursor)) = scan_subkeys(store, &prefix, cursor, args.count)? else {
        return Ok(scan_reply(0, Vec::new()).into());
    };
    let mut items = Vec::new();
    for (member, score_bits) in walked {
        if args
            .pattern
            .as_deref()
            .map_or(true, |p| glob_match(p, &member))
        {
            let score = f64::from_bits(u64::from_be_bytes(score_bits[..8].try_into().unwrap()));
            items.push(Frame::Bulk(member));
            items.push(Frame::bulk(fmt_f64(score).into_bytes()));
        }
    }
    Ok(scan_reply(next_cursor, items).into())
}
