//! Geospatial commands over sorted sets: positions are packed into a
//! 52-bit interleaved cell index used as the member's score, distances come
//! from the haversine formula.

use std::sync::Arc;

use crate::client::Session;
use crate::commands::zset;
use crate::commands::Reply;
use crate::errors::ServerError;
use crate::resp::Frame;
use crate::server::Server;
use crate::storage::encoding::ValueTag;
use crate::util::{parse_f64, parse_i64};

const LON_MIN: f64 = -180.0;
const LON_MAX: f64 = 180.0;
const LAT_MIN: f64 = -85.05112878;
const LAT_MAX: f64 = 85.05112878;
const GEO_STEP: u32 = 26;
const EARTH_RADIUS_M: f64 = 6372797.560856;

fn invalid_pair(lon: f64, lat: f64) -> ServerError {
    ServerError::other(format!(
        "invalid longitude,latitude pair {:.6},{:.6}",
        lon, lat
    ))
}

/// Pack (lon, lat) into 52 interleaved bits, longitude first.
pub(crate) fn encode_cell(lon: f64, lat: f64) -> u64 {
    let lon_unit =
        (((lon - LON_MIN) / (LON_MAX - LON_MIN)) * (1u64 << GEO_STEP) as f64) as u64;
    let lat_unit =
        (((lat - LAT_MIN) / (LAT_MAX - LAT_MIN)) * (1u64 << GEO_STEP) as f64) as u64;
    let lon_unit = lon_unit.min((1 << GEO_STEP) - 1);
    let lat_unit = lat_unit.min((1 << GEO_STEP) - 1);
    let mut bits = 0u64;
    for i in (0..GEO_STEP).rev() {
        bits = (bits << 1) | ((lon_unit >> i) & 1);
        bits = (bits << 1) | ((lat_unit >> i) & 1);
    }
    bits
}

/// Center of the cell back to (lon, lat).
pub(crate) fn decode_cell(bits: u64) -> (f64, f64) {
    let mut lon_unit = 0u64;
    let mut lat_unit = 0u64;
    for i in 0..GEO_STEP {
        let shift = (GEO_STEP - 1 - i) * 2;
        lon_unit = (lon_unit << 1) | ((bits >> (shift + 1)) & 1);
        lat_unit = (lat_unit << 1) | ((bits >> shift) & 1);
    }
    let cell = (1u64 << GEO_STEP) as f64;
    let lon = LON_MIN + (lon_unit as f64 + 0.5) / cell * (LON_MAX - LON_MIN);
    let lat = LAT_MIN + (lat_unit as f64 + 0.5) / cell * (LAT_MAX - LAT_MIN);
    (lon, lat)
}

pub(crate) fn haversine(lon1: f64, lat1: f64, lon2: f64, lat2: f64) -> f64 {
    let lat1r = lat1.to_radians();
    let lat2r = lat2.to_radians();
    let u = ((lat2r - lat1r) / 2.0).sin();
    let v = ((lon2.to_radians() - lon1.to_radians()) / 2.0).sin();
    let a = u * u + lat1r.cos() * lat2r.cos() * v * v;
    2.0 * EARTH_RADIUS_M * a.sqrt().asin()
}

fn unit_to_meters(unit: &[u8]) -> Result<f64, ServerError> {
    match unit.to_ascii_lowercase().as_slice() {
        b"m" => Ok(1.0),
        b"km" => Ok(1000.0),
        b"ft" => Ok(0.3048),
        b"mi" => Ok(1609.34),
        _ => Err(ServerError::other(
            "unsupported unit provided. please use m, km, ft, mi",
        )),
    }
}

fn fmt_coord(v: f64) -> Vec<u8> {
    format!("{:.17}", v).into_bytes()
}

pub fn geoadd_command(
    server: &Arc<Server>,
    session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let mut i = 2;
    let mut nx = false;
    let mut xx = false;
    let mut ch = false;
    while i < argv.len() {
        match argv[i].to_ascii_uppercase().as_slice() {
            b"NX" => nx = true,
            b"XX" => xx = true,
            b"CH" => ch = true,
            _ => break,
        }
        i += 1;
    }
    if nx && xx {
        return Err(ServerError::Syntax);
    }
    let rest = &argv[i..];
    if rest.is_empty() || rest.len() % 3 != 0 {
        return Err(ServerError::Syntax);
    }
    // reuse ZADD with the packed cell as score
    let mut zadd = vec![b"ZADD".to_vec(), argv[1].clone()];
    if nx {
        zadd.push(b"NX".to_vec());
    }
    if xx {
        zadd.push(b"XX".to_vec());
    }
    if ch {
        zadd.push(b"CH".to_vec());
    }
    for triple in rest.chunks(3) {
        let lon = parse_f64(&triple[0]).ok_or(ServerError::NotFloat)?;
        let lat = parse_f64(&triple[1]).ok_or(ServerError::NotFloat)?;
        if !(LON_MIN..=LON_MAX).contains(&lon) || !(LAT_MIN..=LAT_MAX).contains(&lat) {
            return Err(invalid_pair(lon, lat));
        }
        zadd.push(encode_cell(lon, lat).to_string().into_bytes());
        zadd.push(triple[2].clone());
    }
    zset::zadd_command(server, session, &zadd)
}

fn member_position(
    server: &Arc<Server>,
    key: &[u8],
    member: &[u8],
) -> Result<Option<(f64, f64)>, ServerError> {
    if server
        .store
        .meta_expect(key, &[ValueTag::ZSet])?
        .is_none()
    {
        return Ok(None);
    }
    Ok(zset::member_score(&server.store, key, member)?
        .map(|score| decode_cell(score as u64)))
}

pub fn geopos_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let mut out = Vec::with_capacity(argv.len() - 2);
    for member in &argv[2..] {
        out.push(match member_position(server, &argv[1], member)? {
            Some((lon, lat)) => Frame::Array(vec![
                Frame::Bulk(fmt_coord(lon)),
                Frame::Bulk(fmt_coord(lat)),
            ]),
            None => Frame::NullArray,
        });
    }
    Ok(Frame::Array(out).into())
}

pub fn geodist_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let divisor = match argv.get(4) {
        Some(unit) => unit_to_meters(unit)?,
        None => 1.0,
    };
    let (Some((lon1, lat1)), Some((lon2, lat2))) = (
        member_position(server, &argv[1], &argv[2])?,
        member_position(server, &argv[1], &argv[3])?,
    ) else {
        return Ok(Frame::Null.into());
    };
    let meters = haversine(lon1, lat1, lon2, lat2);
    Ok(Frame::bulk(format!("{:.4}", meters / divisor).into_bytes()).into())
}

pub fn geohash_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    const ALPHABET: &[u8] = b"0123456789bcdefghjkmnpqrstuvwxyz";
    let mut out = Vec::with_capacity(argv.len() - 2);
    for member in &argv[2..] {
        out.push(match member_position(server, &argv[1], member)? {
            Some((lon, lat)) => {
                // standard geohash uses the full latitude range
                let mut lat_range = (-90.0f64, 90.0f64);
                let mut lon_range = (-180.0f64, 180.0f64);
                let mut bits: Vec<u8> = Vec::with_capacity(55);
                let mut even = true;
                while bits.len() < 55 {
                    if even {
                        let mid = (lon_range.0 + lon_range.1) / 2.0;
                        if lon >= mid {
                            bits.push(1);
                            lon_range.0 = mid;
                        } else {
                            bits.push(0);
                            lon_range.1 = mid;
                        }
                    } else {
                        let mid = (lat_range.0 + lat_range.1) / 2.0;
                        if lat >= mid {
                            bits.push(1);
                            lat_range.0 = mid;
                        } else {
                            bits.push(0);
                            lat_range.1 = mid;
                        }
                    }
                    even = !even;
                }
                let encoded: Vec<u8> = bits
                    .chunks(5)
                    .take(11)
                    .map(|chunk| {
                        let mut idx = 0usize;
                        for &b in chunk {
                            idx = (idx << 1) | b as usize;
                        }
                        ALPHABET[idx]
                    })
                    .collect();
                Frame::Bulk(encoded)
            }
            None => Frame::Null,
        });
    }
    Ok(Frame::Array(out).into())
}

enum Shape {
    Radius(f64),
    Box { width: f64, height: f64 },
}

struct SearchArgs {
    center: (f64, f64),
    shape: Shape,
    ascending: Option<bool>,
    count: Option<usize>,
    any: bool,
    withcoord: bool,
    withdist: bool,
    withhash: bool,
    unit: f64,
    store_dist: bool,
}

fn parse_search(
    server: &Arc<Server>,
    key: &[u8],
    args: &[Vec<u8>],
    allow_store_dist: bool,
) -> Result<SearchArgs, ServerError> {
    let mut center: Option<(f64, f64)> = None;
    let mut shape: Option<Shape> = None;
    let mut parsed = SearchArgs {
        center: (0.0, 0.0),
        shape: Shape::Radius(0.0),
        ascending: None,
        count: None,
        any: false,
        withcoord: false,
        withdist: false,
        withhash: false,
        unit: 1.0,
        store_dist: false,
    };
    let mut i = 0;
    while i < args.len() {
        match args[i].to_ascii_uppercase().as_slice() {
            b"FROMMEMBER" => {
                let member = args.get(i + 1).ok_or(ServerError::Syntax)?;
                center = Some(
                    member_position(server, key, member)?
                        .ok_or_else(|| ServerError::other("could not decode requested zset member"))?,
                );
                i += 2;
            }
            b"FROMLONLAT" => {
                let lon = args
                    .get(i + 1)
                    .and_then(|a| parse_f64(a))
                    .ok_or(ServerError::NotFloat)?;
                let lat = args
                    .get(i + 2)
                    .and_then(|a| parse_f64(a))
                    .ok_or(ServerError::NotFloat)?;
                if !(LON_MIN..=LON_MAX).contains(&lon) || !(LAT_MIN..=LAT_MAX).contains(&lat) {
                    return Err(invalid_pair(lon, lat));
                }
                center = Some((lon, lat));
                i += 3;
            }
            b"BYRADIUS" => {
                let r = args
                    .get(i + 1)
                    .and_then(|a| parse_f64(a))
                    .ok_or(ServerError::NotFloat)?;
                parsed.unit = unit_to_meters(args.get(i + 2).ok_or(ServerError::Syntax)?)?;
                shape = Some(Shape::Radius(r * parsed.unit));
                i += 3;
            }
            b"BYBOX" => {
                let w = args
                    .get(i + 1)
                    .and_then(|a| parse_f64(a))
                    .ok_or(ServerError::NotFloat)?;
                let h = args
                    .get(i + 2)
                    .and_then(|a| parse_f64(a))
                    .ok_or(ServerError::NotFloat)?;
                parsed.unit = unit_to_meters(args.get(i + 3).ok_or(ServerError::Syntax)?)?;
                shape = Some(Shape::Box {
                    width: w * parsed.unit,
                    height: h * parsed.unit,
                });
                i += 4;
            }
            b"ASC" => {
                parsed.ascending = Some(true);
                i += 1;
            }
            b"DESC" => {
                parsed.ascending = Some(false);
                i += 1;
            }
            b"COUNT" => {
                let n = args
                    .get(i + 1)
                    .and_then(|a| parse_i64(a))
                    .filter(|n| *n > 0)
                    .ok_or_else(|| ServerError::other("COUNT must be > 0"))?;
                parsed.count = Some(n as usize);
                i += 2;
                if args
                    .get(i)
                    .map_or(false, |a| a.eq_ignore_ascii_case(b"ANY"))
                {
                    parsed.any = true;
                    i += 1;
                }
            }
            b"WITHCOORD" => {
                parsed.withcoord = true;
                i += 1;
            }
            b"WITHDIST" => {
                parsed.withdist = true;
                i += 1;
            }
            b"WITHHASH" => {
                parsed.withhash = true;
                i += 1;
            }
            b"STOREDIST" if allow_store_dist => {
                parsed.store_dist = true;
                i += 1;
            }
            _ => return Err(ServerError::Syntax),
        }
    }
    parsed.center = center.ok_or_else(|| {
        ServerError::other("exactly one of FROMMEMBER or FROMLONLAT can be specified for GEOSEARCH")
    })?;
    parsed.shape = shape.ok_or_else(|| {
        ServerError::other("exactly one of BYRADIUS and BYBOX can be specified for GEOSEARCH")
    })?;
    Ok(parsed)
}

/// Members matching the shape with their distance (meters), position and
/// cell bits, sorted per the request.
fn run_search(
    server: &Arc<Server>,
    key: &[u8],
    args: &SearchArgs,
) -> Result<Vec<(Vec<u8>, f64, (f64, f64), u64)>, ServerError> {
    if server.store.meta_expect(key, &[ValueTag::ZSet])?.is_none() {
        return Ok(Vec::new());
    }
    let (clon, clat) = args.center;
    let mut hits = Vec::new();
    for (score, member) in zset::ordered(&server.store, key)? {
        let bits = score as u64;
        let (lon, lat) = decode_cell(bits);
        let dist = haversine(clon, clat, lon, lat);
        let matches = match args.shape {
            Shape::Radius(radius) => dist <= radius,
            Shape::Box { width, height } => {
                let dx = haversine(clon, lat, lon, lat);
                let dy = haversine(lon, clat, lon, lat);
                dx <= width / 2.0 && dy <= height / 2.0
            }
        };
        if matches {
            hits.push((member, dist, (lon, lat), bits));
            if args.any && args.count.map_or(false, |c| hits.len() >= c) {
                break;
            }
        }
    }
    if args.ascending.unwrap_or(true) {
        hits.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
    } else {
        hits.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    }
    if let Some(count) = args.count {
        hits.truncate(count);
    }
    Ok(hits)
}

pub fn geosearch_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let args = parse_search(server, &argv[1], &argv[2..], false)?;
    let hits = run_search(server, &argv[1], &args)?;
    let plain = !args.withcoord && !args.withdist && !args.withhash;
    let out = hits
        .into_iter()
        .map(|(member, dist, (lon, lat), bits)| {
            if plain {
                Frame::Bulk(member)
            } else {
                let mut parts = vec![Frame::Bulk(member)];
                if args.withdist {
                    parts.push(Frame::bulk(
                        format!("{:.4}", dist / args.unit).into_bytes(),
                    ));
                }
                if args.withhash {
                    parts.push(Frame::Integer(bits as i64));
                }
                if args.withcoord {
                    parts.push(Frame::Array(vec![
                        Frame::Bulk(fmt_coord(lon)),
                        Frame::Bulk(fmt_coord(lat)),
                    ]));
                }
                Frame::Array(parts)
            }
        })
        .collect();
    Ok(Frame::Array(out).into())
}

pub fn geosearchstore_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let args = parse_search(server, &argv[2], &argv[3..], true)?;
    let hits = run_search(server, &argv[2], &args)?;
    let mut pairs = std::collections::HashMap::with_capacity(hits.len());
    for (member, dist, _, bits) in &hits {
        let score = if args.store_dist {
            dist / args.unit
        } else {
            *bits as f64
        };
        pairs.insert(member.clone(), score);
    }
    let len = pairs.len();
    zset::store_zset(&server.store, &argv[1], &pairs)?;
    Ok(Frame::Integer(len as i64).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cell_roundtrip_is_close() {
        let (lon, lat) = (13.361389, 38.115556); // Palermo
        let bits = encode_cell(lon, lat);
        assert!(bits < 1 << 52);
        let (dlon, dlat) = decode_cell(bits);
        assert!((dlon - lon).abs() < 0.001);
        assert!((dlat - lat).abs() < 0.001);
    }

    #[test]
    fn haversine_palermo_catania() {
        // the classic example pair, roughly 166 km apart
        let d = haversine(13.361389, 38.115556, 15.087269, 37.502669);
        assert!((d - 166_274.0).abs() < 500.0, "{}", d);
    }

    #[test]
    fn units() {
        assert_eq!(unit_to_meters(b"km").unwrap(), 1000.0);
        assert!(unit_to_meters(b"parsec").is_err());
    }
}
