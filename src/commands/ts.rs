//! Time-series commands: ordered (ms-timestamp, f64) samples per key with
//! retention trimming and a duplicate policy, plus range queries with
//! bucketed aggregation.

use std::sync::Arc;

use crate::client::Session;
use crate::commands::Reply;
use crate::errors::ServerError;
use crate::resp::Frame;
use crate::server::Server;
use crate::storage::encoding::{
    elem_prefix, series_sample_key, DupPolicy, Meta, MetaAux, ValueTag, KIND_SERIES,
};
use crate::storage::Store;
use crate::util::{fmt_f64, now_ms, parse_f64, parse_u64};

fn series_meta(store: &Store, key: &[u8]) -> Result<Option<Meta>, ServerError> {
    store.meta_expect(key, &[ValueTag::Series])
}

fn series_aux(meta: &Meta) -> (u64, DupPolicy, u64) {
    match meta.aux {
        MetaAux::Series {
            retention_ms,
            policy,
            len,
        } => (retention_ms, policy, len),
        _ => (0, DupPolicy::Block, 0),
    }
}

fn write_series_meta(
    store: &Store,
    key: &[u8],
    mut meta: Meta,
    retention_ms: u64,
    policy: DupPolicy,
    len: u64,
) -> Result<(), ServerError> {
    meta.aux = MetaAux::Series {
        retention_ms,
        policy,
        len,
    };
    store.write_meta(key, &meta)?;
    store.bump(key);
    Ok(())
}

fn sample_at(store: &Store, key: &[u8], ts: u64) -> Result<Option<f64>, ServerError> {
    Ok(store
        .db()
        .get(series_sample_key(key, ts))?
        .map(|v| f64::from_bits(u64::from_be_bytes(v[..8].try_into().unwrap()))))
}

fn last_sample(store: &Store, key: &[u8]) -> Result<Option<(u64, f64)>, ServerError> {
    let prefix = elem_prefix(KIND_SERIES, key);
    match store.db().scan_prefix(&prefix).next_back() {
        Some(item) => {
            let (k, v) = item?;
            let ts = u64::from_be_bytes(k[prefix.len()..prefix.len() + 8].try_into().unwrap());
            let value = f64::from_bits(u64::from_be_bytes(v[..8].try_into().unwrap()));
            Ok(Some((ts, value)))
        }
        None => Ok(None),
    }
}

fn samples_range(
    store: &Store,
    key: &[u8],
    from: u64,
    to: u64,
) -> Result<Vec<(u64, f64)>, ServerError> {
    let prefix = elem_prefix(KIND_SERIES, key);
    let start = series_sample_key(key, from);
    let mut out = Vec::new();
    for item in store.db().range(start..) {
        let (k, v) = item?;
        if !k.starts_with(&prefix) {
            break;
        }
        let ts = u64::from_be_bytes(k[prefix.len()..prefix.len() + 8].try_into().unwrap());
        if ts > to {
            break;
        }
        out.push((
            ts,
            f64::from_bits(u64::from_be_bytes(v[..8].try_into().unwrap())),
        ));
    }
    Ok(out)
}

fn parse_ts_token(raw: &[u8]) -> Result<u64, ServerError> {
    if raw == b"*" {
        return Ok(now_ms());
    }
    parse_u64(raw).ok_or_else(|| ServerError::raw("TSDB: invalid timestamp"))
}

struct SeriesOptions {
    retention_ms: Option<u64>,
    policy: Option<DupPolicy>,
    on_duplicate: Option<DupPolicy>,
}

fn parse_series_options(args: &[Vec<u8>]) -> Result<SeriesOptions, ServerError> {
    let mut parsed = SeriesOptions {
        retention_ms: None,
        policy: None,
        on_duplicate: None,
    };
    let mut i = 0;
    while i < args.len() {
        match args[i].to_ascii_uppercase().as_slice() {
            b"RETENTION" => {
                parsed.retention_ms = Some(
                    args.get(i + 1)
                        .and_then(|a| parse_u64(a))
                        .ok_or_else(|| ServerError::raw("TSDB: invalid RETENTION value"))?,
                );
                i += 2;
            }
            b"DUPLICATE_POLICY" => {
                parsed.policy = Some(
                    args.get(i + 1)
                        .and_then(|a| DupPolicy::parse(a))
                        .ok_or_else(|| ServerError::raw("TSDB: invalid DUPLICATE_POLICY"))?,
                );
                i += 2;
            }
            b"ON_DUPLICATE" => {
                parsed.on_duplicate = Some(
                    args.get(i + 1)
                        .and_then(|a| DupPolicy::parse(a))
                        .ok_or_else(|| ServerError::raw("TSDB: invalid ON_DUPLICATE policy"))?,
                );
                i += 2;
            }
            // accepted for client compatibility, storage is uniform here
            b"ENCODING" | b"CHUNK_SIZE" => i += 2,
            _ => return Err(ServerError::raw("TSDB: unknown or misplaced argument")),
        }
    }
    Ok(parsed)
}

pub fn create_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let store = &server.store;
    if series_meta(store, &argv[1])?.is_some() {
        return Err(ServerError::raw("TSDB: key already exists"));
    }
    let options = parse_series_options(&argv[2..])?;
    let meta = Meta::new(ValueTag::Series);
    write_series_meta(
        store,
        &argv[1],
        meta,
        options.retention_ms.unwrap_or(0),
        options.policy.unwrap_or(DupPolicy::Block),
        0,
    )?;
    Ok(Frame::ok().into())
}

pub fn alter_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let store = &server.store;
    let Some(meta) = series_meta(store, &argv[1])? else {
        return Err(ServerError::raw("TSDB: the key does not exist"));
    };
    let (retention_ms, policy, len) = series_aux(&meta);
    let options = parse_series_options(&argv[2..])?;
    write_series_meta(
        store,
        &argv[1],
        meta,
        options.retention_ms.unwrap_or(retention_ms),
        options.policy.unwrap_or(policy),
        len,
    )?;
    Ok(Frame::ok().into())
}

fn apply_retention(
    store: &Store,
    key: &[u8],
    last_ts: u64,
    retention_ms: u64,
    len: &mut u64,
) -> Result<(), ServerError> {
    if retention_ms == 0 {
        return Ok(());
    }
    let horizon = last_ts.saturating_sub(retention_ms);
    let prefix = elem_prefix(KIND_SERIES, key);
    for item in store.db().scan_prefix(&prefix) {
        let (k, _) = item?;
        let ts = u64::from_be_bytes(k[prefix.len()..prefix.len() + 8].try_into().unwrap());
        if ts >= horizon {
            break;
        }
        store.db().remove(k)?;
        *len -= 1;
    }
    Ok(())
}

pub fn add_command(
    server: &Arc<Server>,
    session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let store = &server.store;
    let key = &argv[1];
    let ts = parse_ts_token(&argv[2])?;
    let value = parse_f64(&argv[3]).ok_or_else(|| ServerError::raw("TSDB: invalid value"))?;
    let options = parse_series_options(&argv[4..])?;

    let meta = match series_meta(store, key)? {
        Some(meta) => meta,
        None => Meta::new(ValueTag::Series),
    };
    let (retention_ms, policy, mut len) = series_aux(&meta);
    let retention_ms = options.retention_ms.unwrap_or(retention_ms);
    let policy = options.policy.unwrap_or(policy);
    let effective = options.on_duplicate.unwrap_or(policy);

    let stored = match sample_at(store, key, ts)? {
        Some(old) => match effective {
            DupPolicy::Block => {
                return Err(ServerError::other(
                    "TSDB: Error at upsert, update is not supported when DUPLICATE_POLICY is set to BLOCK",
                ))
            }
            DupPolicy::First => old,
            DupPolicy::Last => value,
            DupPolicy::Min => old.min(value),
            DupPolicy::Max => old.max(value),
            DupPolicy::Sum => old + value,
        },
        None => {
            len += 1;
            value
        }
    };
    store
        .db()
        .insert(series_sample_key(key, ts), stored.to_bits().to_be_bytes().to_vec())?;
    let last_ts = last_sample(store, key)?.map(|(t, _)| t).unwrap_or(ts);
    apply_retention(store, key, last_ts, retention_ms, &mut len)?;
    write_series_meta(store, key, meta, retention_ms, policy, len)?;

    // `*` timestamps replicate as the concrete value
    let mut rewritten = argv.to_vec();
    rewritten[2] = ts.to_string().into_bytes();
    session.prop_override = Some(vec![rewritten]);
    Ok(Frame::Integer(ts as i64).into())
}

fn incr_command_generic(
    server: &Arc<Server>,
    session: &mut Session,
    argv: &[Vec<u8>],
    sign: f64,
) -> Result<Reply, ServerError> {
    let store = &server.store;
    let key = &argv[1];
    let delta = parse_f64(&argv[2]).ok_or_else(|| ServerError::raw("TSDB: invalid value"))?
        * sign;
    let mut ts = now_ms();
    let rest = &argv[3..];
    let mut i = 0;
    while i < rest.len() {
        match rest[i].to_ascii_uppercase().as_slice() {
            b"TIMESTAMP" => {
                ts = parse_ts_token(rest.get(i + 1).ok_or(ServerError::Syntax)?)?;
                i += 2;
            }
            _ => return Err(ServerError::raw("TSDB: unknown or misplaced argument")),
        }
    }
    let meta = match series_meta(store, key)? {
        Some(meta) => meta,
        None => Meta::new(ValueTag::Series),
    };
    let (retention_ms, policy, mut len) = series_aux(&meta);
    let last = last_sample(store, key)?;
    if let Some((last_ts, _)) = last {
        if ts < last_ts {
            return Err(ServerError::other(
                "TSDB: timestamp must be equal to or higher than the maximum existing timestamp",
            ));
        }
    }
    let base = last.map(|(_, v)| v).unwrap_or(0.0);
    let new = base + delta;
    if sample_at(store, key, ts)?.is_none() {
        len += 1;
    }
    store
        .db()
        .insert(series_sample_key(key, ts), new.to_bits().to_be_bytes().to_vec())?;
    apply_retention(store, key, ts, retention_ms, &mut len)?;
    write_series_meta(store, key, meta, retention_ms, policy, len)?;
    let mut rewritten = vec![
        b"TS.ADD".to_vec(),
        key.clone(),
        ts.to_string().into_bytes(),
        fmt_f64(new).into_bytes(),
        b"ON_DUPLICATE".to_vec(),
        b"LAST".to_vec(),
    ];
    session.prop_override = Some(vec![rewritten]);
    Ok(Frame::Integer(ts as i64).into())
}

pub fn incrby_command(
    server: &Arc<Server>,
    session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    incr_command_generic(server, session, argv, 1.0)
}

pub fn decrby_command(
    server: &Arc<Server>,
    session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    incr_command_generic(server, session, argv, -1.0)
}

pub fn get_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let store = &server.store;
    if series_meta(store, &argv[1])?.is_none() {
        return Err(ServerError::raw("TSDB: the key does not exist"));
    }
    Ok(match last_sample(store, &argv[1])? {
        Some((ts, value)) => Frame::Array(vec![
            Frame::Integer(ts as i64),
            Frame::bulk(fmt_f64(value).into_bytes()),
        ])
        .into(),
        None => Frame::Array(vec![]).into(),
    })
}

fn parse_range_ts(raw: &[u8]) -> Result<u64, ServerError> {
    match raw {
        b"-" => Ok(0),
        b"+" => Ok(u64::MAX),
        _ => parse_u64(raw)
            .ok_or_else(|| ServerError::raw("TSDB: wrong fromTimestamp or toTimestamp")),
    }
}

#[derive(Clone, Copy)]
enum Agg {
    Avg,
    Sum,
    Min,
    Max,
    Count,
    First,
    Last,
}

fn parse_agg(raw: &[u8]) -> Option<Agg> {
    Some(match raw.to_ascii_uppercase().as_slice() {
        b"AVG" => Agg::Avg,
        b"SUM" => Agg::Sum,
        b"MIN" => Agg::Min,
        b"MAX" => Agg::Max,
        b"COUNT" => Agg::Count,
        b"FIRST" => Agg::First,
        b"LAST" => Agg::Last,
        _ => return None,
    })
}

fn aggregate(samples: &[(u64, f64)], agg: Agg, bucket_ms: u64) -> Vec<(u64, f64)> {
    let mut out: Vec<(u64, f64)> = Vec::new();
    let mut bucket: Option<(u64, Vec<f64>)> = None;
    let flush = |bucket: &Option<(u64, Vec<f64>)>, out: &mut Vec<(u64, f64)>| {
        if let Some((start, values)) = bucket {
            let v = match agg {
                Agg::Avg => values.iter().sum::<f64>() / values.len() as f64,
                Agg::Sum => values.iter().sum(),
                Agg::Min => values.iter().cloned().fold(f64::INFINITY, f64::min),
                Agg::Max => values.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
                Agg::Count => values.len() as f64,
                Agg::First => values[0],
                Agg::Last => values[values.len() - 1],
            };
            out.push((*start, v));
        }
    };
    for &(ts, value) in samples {
        let start = ts - ts % bucket_ms;
        match &mut bucket {
            Some((current, values)) if *current == start => values.push(value),
            _ => {
                flush(&bucket, &mut out);
                bucket = Some((start, vec![value]));
            }
        }
    }
    flush(&bucket, &mut out);
    out
}

fn range_generic(
    server: &Arc<Server>,
    argv: &[Vec<u8>],
    reverse: bool,
) -> Result<Reply, ServerError> {
    let store = &server.store;
    if series_meta(store, &argv[1])?.is_none() {
        return Err(ServerError::raw("TSDB: the key does not exist"));
    }
    let from = parse_range_ts(&argv[2])?;
    let to = parse_range_ts(&argv[3])?;
    let mut count: Option<usize> = None;
    let mut agg: Option<(Agg, u64)> = None;
    let mut i = 4;
    while i < argv.len() {
        match argv[i].to_ascii_uppercase().as_slice() {
            b"COUNT" => {
                count = Some(
                    argv.get(i + 1)
                        .and_then(|a| parse_u64(a))
                        .ok_or_else(|| ServerError::raw("TSDB: invalid COUNT"))?
                        as usize,
                );
                i += 2;
            }
            b"AGGREGATION" => {
                let kind = argv
                    .get(i + 1)
                    .and_then(|a| parse_agg(a))
                    .ok_or_else(|| ServerError::raw("TSDB: unknown AGGREGATION type"))?;
                let bucket = argv
                    .get(i + 2)
                    .and_then(|a| parse_u64(a))
                    .filter(|b| *b > 0)
                    .ok_or_else(|| ServerError::raw("TSDB: invalid timeBucket"))?;
                agg = Some((kind, bucket));
                i += 3;
            }
            _ => return Err(ServerError::raw("TSDB: unknown or misplaced argument")),
        }
    }
    let mut samples = samples_range(store, &argv[1], from, to)?;
    if let Some((kind, bucket)) = agg {
        samples = aggregate(&samples, kind, bucket);
    }
    if reverse {
        samples.reverse();
    }
    if let Some(limit) = count {
        samples.truncate(limit);
    }
    let out = samples
        .into_iter()
        .map(|(ts, value)| {
            Frame::Array(vec![
                Frame::Integer(ts as i64),
                Frame::bulk(fmt_f64(value).into_bytes()),
            ])
        })
        .collect();
    Ok(Frame::Array(out).into())
}

pub fn range_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    range_generic(server, argv, false)
}

pub fn revrange_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    range_generic(server, argv, true)
}

pub fn del_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let store = &server.store;
    let Some(meta) = series_meta(store, &argv[1])? else {
        return Err(ServerError::raw("TSDB: the key does not exist"));
    };
    let from = parse_range_ts(&argv[2])?;
    let to = parse_range_ts(&argv[3])?;
    let (retention_ms, policy, mut len) = series_aux(&meta);
    let victims = samples_range(store, &argv[1], from, to)?;
    let removed = victims.len();
    for (ts, _) in victims {
        store.db().remove(series_sample_key(&argv[1], ts))?;
        len -= 1;
    }
    if removed > 0 {
        write_series_meta(store, &argv[1], meta, retention_ms, policy, len)?;
    }
    Ok(Frame::Integer(removed as i64).into())
}

pub fn info_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let store = &server.store;
    let Some(meta) = series_meta(store, &argv[1])? else {
        return Err(ServerError::raw("TSDB: the key does not exist"));
    };
    let (retention_ms, policy, len) = series_aux(&meta);
    let first = samples_range(store, &argv[1], 0, u64::MAX)?
        .first()
        .map(|(ts, _)| *ts)
        .unwrap_or(0);
    let last = last_sample(store, &argv[1])?.map(|(ts, _)| ts).unwrap_or(0);
    Ok(Frame::Array(vec![
        Frame::bulk(&b"totalSamples"[..]),
        Frame::Integer(len as i64),
        Frame::bulk(&b"firstTimestamp"[..]),
        Frame::Integer(first as i64),
        Frame::bulk(&b"lastTimestamp"[..]),
        Frame::Integer(last as i64),
        Frame::bulk(&b"retentionTime"[..]),
        Frame::Integer(retention_ms as i64),
        Frame::bulk(&b"duplicatePolicy"[..]),
        Frame::bulk(policy.name().as_bytes()),
    ])
    .into())
}
