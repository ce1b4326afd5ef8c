//! Bit-level operations over string values: single bits, population
//! counts, boolean combination, and BITFIELD's typed integer fields at
//! arbitrary bit offsets with WRAP/SAT/FAIL overflow control.

use std::sync::Arc;

use crate::client::Session;
use crate::commands::string::{lookup_string, overwrite_string, update_string};
use crate::commands::Reply;
use crate::errors::ServerError;
use crate::resp::Frame;
use crate::server::Server;
use crate::storage::Store;
use crate::util::parse_i64;

const MAX_BIT_OFFSET: u64 = 4 * 1024 * 1024 * 1024 * 8 - 1; // 4 GB worth of bits

fn load_bytes(store: &Store, key: &[u8]) -> Result<Vec<u8>, ServerError> {
    Ok(lookup_string(store, key)?.map(|(_, v)| v).unwrap_or_default())
}

fn save_bytes(store: &Store, key: &[u8], bytes: &[u8]) -> Result<(), ServerError> {
    match lookup_string(store, key)? {
        Some((meta, _)) => update_string(store, key, &meta, bytes),
        None => overwrite_string(store, key, bytes, 0),
    }
}

pub fn setbit_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let offset = parse_i64(&argv[2])
        .filter(|n| *n >= 0 && (*n as u64) <= MAX_BIT_OFFSET)
        .ok_or_else(|| ServerError::other("bit offset is not an integer or out of range"))?
        as u64;
    let bit = match argv[3].as_slice() {
        b"0" => 0u8,
        b"1" => 1u8,
        _ => return Err(ServerError::other("bit is not an integer or out of range")),
    };
    let store = &server.store;
    let mut bytes = load_bytes(store, &argv[1])?;
    let byte = (offset / 8) as usize;
    let mask = 1u8 << (7 - (offset % 8));
    if bytes.len() <= byte {
        bytes.resize(byte + 1, 0);
    }
    let old = (bytes[byte] & mask != 0) as i64;
    if bit == 1 {
        bytes[byte] |= mask;
    } else {
        bytes[byte] &= !mask;
    }
    save_bytes(store, &argv[1], &bytes)?;
    Ok(Frame::Integer(old).into())
}

pub fn getbit_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let offset = parse_i64(&argv[2])
        .filter(|n| *n >= 0)
        .ok_or_else(|| ServerError::other("bit offset is not an integer or out of range"))?
        as u64;
    let bytes = load_bytes(&server.store, &argv[1])?;
    let byte = (offset / 8) as usize;
    let bit = bytes
        .get(byte)
        .map_or(0, |b| (b >> (7 - (offset % 8))) & 1);
    Ok(Frame::Integer(bit as i64).into())
}

/// Resolve a [start, end] window given in bytes or bits onto a bit range.
fn resolve_bit_window(
    len_bytes: usize,
    start: i64,
    end: i64,
    by_bit: bool,
) -> Option<(u64, u64)> {
    let total = if by_bit {
        len_bytes as i64 * 8
    } else {
        len_bytes as i64
    };
    if total == 0 {
        return None;
    }
    let mut start = if start < 0 { total + start } else { start };
    let mut end = if end < 0 { total + end } else { end };
    if start < 0 {
        start = 0;
    }
    if end >= total {
        end = total - 1;
    }
    if start > end {
        return None;
    }
    if by_bit {
        Some((start as u64, end as u64))
    } else {
        Some((start as u64 * 8, end as u64 * 8 + 7))
    }
}

pub fn bitcount_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let bytes = load_bytes(&server.store, &argv[1])?;
    let window = match argv.len() {
        2 => {
            if bytes.is_empty() {
                None
            } else {
                Some((0, bytes.len() as u64 * 8 - 1))
            }
        }
        4 | 5 => {
            let start = parse_i64(&argv[2]).ok_or(ServerError::NotInteger)?;
            let end = parse_i64(&argv[3]).ok_or(ServerError::NotInteger)?;
            let by_bit = match argv.get(4) {
                Some(unit) if unit.eq_ignore_ascii_case(b"BIT") => true,
                Some(unit) if unit.eq_ignore_ascii_case(b"BYTE") => false,
                Some(_) => return Err(ServerError::Syntax),
                None => false,
            };
            resolve_bit_window(bytes.len(), start, end, by_bit)
        }
        _ => return Err(ServerError::Syntax),
    };
    let Some((from, to)) = window else {
        return Ok(Frame::Integer(0).into());
    };
    let mut count = 0i64;
    for bit in from..=to {
        let byte = (bit / 8) as usize;
        if bytes[byte] & (1 << (7 - (bit % 8))) != 0 {
            count += 1;
        }
    }
    Ok(Frame::Integer(count).into())
}

pub fn bitpos_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let wanted = match argv[2].as_slice() {
        b"0" => 0u8,
        b"1" => 1u8,
        _ => return Err(ServerError::other("The bit argument must be 1 or 0.")),
    };
    let bytes = load_bytes(&server.store, &argv[1])?;
    let explicit_end = argv.len() > 4;
    let start = match argv.get(3) {
        Some(raw) => parse_i64(raw).ok_or(ServerError::NotInteger)?,
        None => 0,
    };
    let end = match argv.get(4) {
        Some(raw) => parse_i64(raw).ok_or(ServerError::NotInteger)?,
        None => -1,
    };
    let by_bit = match argv.get(5) {
        Some(unit) if unit.eq_ignore_ascii_case(b"BIT") => true,
        Some(unit) if unit.eq_ignore_ascii_case(b"BYTE") => false,
        Some(_) => return Err(ServerError::Syntax),
        None => false,
    };
    let Some((from, to)) = resolve_bit_window(bytes.len(), start, end, by_bit) else {
        // empty string or empty window
        return Ok(Frame::Integer(if wanted == 0 && bytes.is_empty() { 0 } else { -1 }).into());
    };
    for bit in from..=to {
        let byte = (bit / 8) as usize;
        let value = (bytes[byte] >> (7 - (bit % 8))) & 1;
        if value == wanted {
            return Ok(Frame::Integer(bit as i64).into());
        }
    }
    // searching for 0 with no explicit end acts as if the string were
    // followed by zeros
    if wanted == 0 && !explicit_end {
        return Ok(Frame::Integer(bytes.len() as i64 * 8).into());
    }
    Ok(Frame::Integer(-1).into())
}

pub fn bitop_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let op = argv[1].to_ascii_uppercase();
    let store = &server.store;
    let sources = &argv[3..];
    if op.as_slice() == b"NOT" && sources.len() != 1 {
        return Err(ServerError::other(
            "BITOP NOT must be called with a single source key.",
        ));
    }
    let mut inputs = Vec::with_capacity(sources.len());
    let mut max_len = 0;
    for key in sources {
        let bytes = load_bytes(store, key)?;
        max_len = max_len.max(bytes.len());
        inputs.push(bytes);
    }
    let mut result = vec![0u8; max_len];
    match op.as_slice() {
        b"NOT" => {
            for (i, b) in inputs[0].iter().enumerate() {
                result[i] = !b;
            }
        }
        b"AND" | b"OR" | b"XOR" => {
            for (idx, input) in inputs.iter().enumerate() {
                for i in 0..max_len {
                    let b = input.get(i).copied().unwrap_or(0);
                    if idx == 0 {
                        result[i] = b;
                    } else {
                        result[i] = match op.as_slice() {
                            b"AND" => result[i] & b,
                            b"OR" => result[i] | b,
                            _ => result[i] ^ b,
                        };
                    }
                }
            }
        }
        _ => return Err(ServerError::Syntax),
    }
    if result.is_empty() {
        store.delete_key(&argv[2])?;
    } else {
        save_bytes(store, &argv[2], &result)?;
    }
    Ok(Frame::Integer(result.len() as i64).into())
}

// -- BITFIELD ---------------------------------------------------------------

#[derive(Clone, Copy)]
struct FieldType {
    signed: bool,
    width: u8,
}

#[derive(Clone, Copy, PartialEq)]
enum Overflow {
    Wrap,
    Sat,
    Fail,
}

enum FieldOp {
    Get(FieldType, u64),
    Set(FieldType, u64, i64, Overflow),
    IncrBy(FieldType, u64, i64, Overflow),
}

fn parse_field_type(raw: &[u8]) -> Result<FieldType, ServerError> {
    let err = || ServerError::other("Invalid bitfield type. Use something like i16 u8. Note that u64 is not supported but i64 is.");
    let (signed, digits) = match raw.first() {
        Some(b'i') => (true, &raw[1..]),
        Some(b'u') => (false, &raw[1..]),
        _ => return Err(err()),
    };
    let width: u8 = std::str::from_utf8(digits)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(err)?;
    if width == 0 || (signed && width > 64) || (!signed && width > 63) {
        return Err(err());
    }
    Ok(FieldType { signed, width })
}

fn parse_offset(raw: &[u8], ty: FieldType) -> Result<u64, ServerError> {
    let err = || ServerError::other("bit offset is not an integer or out of range");
    let (raw, multiply) = match raw.first() {
        Some(b'#') => (&raw[1..], true),
        _ => (raw, false),
    };
    let n = std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .ok_or_else(err)?;
    let offset = if multiply { n * ty.width as u64 } else { n };
    if offset + ty.width as u64 > MAX_BIT_OFFSET + 1 {
        return Err(err());
    }
    Ok(offset)
}

fn get_bits(buf: &[u8], offset: u64, width: u8) -> u64 {
    let mut out = 0u64;
    for i in 0..width as u64 {
        let bit_index = offset + i;
        let byte = (bit_index / 8) as usize;
        let bit = 7 - (bit_index % 8) as u8;
        let b = buf.get(byte).copied().unwrap_or(0);
        out = (out << 1) | ((b >> bit) & 1) as u64;
    }
    out
}

fn set_bits(buf: &mut Vec<u8>, offset: u64, width: u8, value: u64) {
    let end_byte = ((offset + width as u64 + 7) / 8) as usize;
    if buf.len() < end_byte {
        buf.resize(end_byte, 0);
    }
    for i in 0..width as u64 {
        let bit_index = offset + i;
        let byte = (bit_index / 8) as usize;
        let bit = 7 - (bit_index % 8) as u8;
        if (value >> (width as u64 - 1 - i)) & 1 == 1 {
            buf[byte] |= 1 << bit;
        } else {
            buf[byte] &= !(1 << bit);
        }
    }
}

fn field_value(buf: &[u8], ty: FieldType, offset: u64) -> i64 {
    let raw = get_bits(buf, offset, ty.width);
    if ty.signed && ty.width < 64 && raw & (1 << (ty.width - 1)) != 0 {
        // sign-extend
        (raw | (!0u64 << ty.width)) as i64
    } else {
        raw as i64
    }
}

/// Fit `value` into the field per the overflow policy. None means FAIL.
fn fit(value: i128, ty: FieldType, overflow: Overflow) -> Option<i64> {
    let (min, max): (i128, i128) = if ty.signed {
        (-(1i128 << (ty.width - 1)), (1i128 << (ty.width - 1)) - 1)
    } else {
        (0, (1i128 << ty.width) - 1)
    };
    if value >= min && value <= max {
        return Some(value as i64);
    }
    match overflow {
        Overflow::Fail => None,
        Overflow::Sat => Some(if value < min { min as i64 } else { max as i64 }),
        Overflow::Wrap => {
            let span = 1i128 << ty.width;
            let mut wrapped = value.rem_euclid(span);
            if ty.signed && wrapped > max {
                wrapped -= span;
            }
            Some(wrapped as i64)
        }
    }
}

fn run_bitfield(
    server: &Arc<Server>,
    argv: &[Vec<u8>],
    read_only: bool,
) -> Result<Reply, ServerError> {
    let mut ops = Vec::new();
    let mut overflow = Overflow::Wrap;
    let mut i = 2;
    while i < argv.len() {
        match argv[i].to_ascii_uppercase().as_slice() {
            b"OVERFLOW" if !read_only => {
                overflow = match argv.get(i + 1).map(|a| a.to_ascii_uppercase()) {
                    Some(o) if o == b"WRAP" => Overflow::Wrap,
                    Some(o) if o == b"SAT" => Overflow::Sat,
                    Some(o) if o == b"FAIL" => Overflow::Fail,
                    _ => {
                        return Err(ServerError::other(
                            "Invalid OVERFLOW type specified",
                        ))
                    }
                };
                i += 2;
            }
            b"GET" => {
                let ty = parse_field_type(argv.get(i + 1).ok_or(ServerError::Syntax)?)?;
                let offset = parse_offset(argv.get(i + 2).ok_or(ServerError::Syntax)?, ty)?;
                ops.push(FieldOp::Get(ty, offset));
                i += 3;
            }
            b"SET" if !read_only => {
                let ty = parse_field_type(argv.get(i + 1).ok_or(ServerError::Syntax)?)?;
                let offset = parse_offset(argv.get(i + 2).ok_or(ServerError::Syntax)?, ty)?;
                let value = argv
                    .get(i + 3)
                    .and_then(|a| parse_i64(a))
                    .ok_or(ServerError::NotInteger)?;
                ops.push(FieldOp::Set(ty, offset, value, overflow));
                i += 4;
            }
            b"INCRBY" if !read_only => {
                let ty = parse_field_type(argv.get(i + 1).ok_or(ServerError::Syntax)?)?;
                let offset = parse_offset(argv.get(i + 2).ok_or(ServerError::Syntax)?, ty)?;
                let value = argv
                    .get(i + 3)
                    .and_then(|a| parse_i64(a))
                    .ok_or(ServerError::NotInteger)?;
                ops.push(FieldOp::IncrBy(ty, offset, value, overflow));
                i += 4;
            }
            _ if read_only => {
                return Err(ServerError::other(
                    "BITFIELD_RO only supports the GET subcommand",
                ))
            }
            _ => return Err(ServerError::Syntax),
        }
    }

    let store = &server.store;
    let mut bytes = load_bytes(store, &argv[1])?;
    let mut dirty = false;
    let mut replies = Vec::with_capacity(ops.len());
    for op in ops {
        match op {
            FieldOp::Get(ty, offset) => {
                replies.push(Frame::Integer(field_value(&bytes, ty, offset)));
            }
            FieldOp::Set(ty, offset, value, overflow) => {
                let old = field_value(&bytes, ty, offset);
                match fit(value as i128, ty, overflow) {
                    Some(fitted) => {
                        set_bits(&mut bytes, offset, ty.width, fitted as u64);
                        dirty = true;
                        replies.push(Frame::Integer(old));
                    }
                    None => replies.push(Frame::Null),
                }
            }
            FieldOp::IncrBy(ty, offset, value, overflow) => {
                let old = field_value(&bytes, ty, offset) as i128;
                match fit(old + value as i128, ty, overflow) {
                    Some(fitted) => {
                        set_bits(&mut bytes, offset, ty.width, fitted as u64);
                        dirty = true;
                        replies.push(Frame::Integer(fitted));
                    }
                    None => replies.push(Frame::Null),
                }
            }
        }
    }
    if dirty {
        save_bytes(store, &argv[1], &bytes)?;
    }
    Ok(Frame::Array(replies).into())
}

pub fn bitfield_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    run_bitfield(server, argv, false)
}

pub fn bitfield_ro_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    run_bitfield(server, argv, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bit_field_roundtrip() {
        let mut buf = Vec::new();
        set_bits(&mut buf, 5, 8, 0xAB);
        assert_eq!(get_bits(&buf, 5, 8), 0xAB);
        set_bits(&mut buf, 0, 4, 0x5);
        assert_eq!(get_bits(&buf, 0, 4), 0x5);
        assert_eq!(get_bits(&buf, 5, 8), 0xAB);
    }

    #[test]
    fn signed_fields_sign_extend() {
        let mut buf = Vec::new();
        let ty = FieldType { signed: true, width: 8 };
        set_bits(&mut buf, 0, 8, (-5i64) as u64);
        assert_eq!(field_value(&buf, ty, 0), -5);
    }

    #[test]
    fn overflow_policies() {
        let ty = FieldType { signed: false, width: 8 };
        assert_eq!(fit(300, ty, Overflow::Wrap), Some(44));
        assert_eq!(fit(300, ty, Overflow::Sat), Some(255));
        assert_eq!(fit(300, ty, Overflow::Fail), None);
        let sty = FieldType { signed: true, width: 8 };
        assert_eq!(fit(130, sty, Overflow::Wrap), Some(-126));
        assert_eq!(fit(-200, sty, Overflow::Sat), Some(-128));
    }
}
