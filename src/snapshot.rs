//! Snapshot service: a self-describing dump of the whole keyspace used by
//! SAVE/BGSAVE, replication full-resync and DUMP/RESTORE.
//!
//! Layout: `SLEDIS` magic, u16 format version, then one 0xFE-marked record
//! per key `(type-tag, expire-ms, key, payload)`, 0xFF EOF and a CRC-64/XZ
//! trailer over everything before it.
//!
//! String payloads use a compact length prefix: the two MSBs of the first
//! byte select 6-bit, 14-bit or 32-bit lengths, or a special encoding
//! (small integers, LZF-compressed blobs) exactly like classic dump files
//! do it.

use std::fs::{rename, File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;
use std::process;

use crc::{Crc, CRC_64_XZ};
use log::{info, warn};
use lzf::{compress, decompress};

use crate::errors::ServerError;
use crate::storage::encoding::*;
use crate::storage::Store;
use crate::util::now_ms;

pub const SNAPSHOT_MAGIC: &[u8] = b"SLEDIS";
pub const SNAPSHOT_VERSION: u16 = 1;
pub const DUMP_VERSION: u16 = 1;

const OP_RECORD: u8 = 0xFE;
const OP_EOF: u8 = 0xFF;

const LEN_6BIT: u8 = 0;
const LEN_14BIT: u8 = 1;
const LEN_32BIT: u8 = 2;
const LEN_ENCVAL: u8 = 3;

const ENC_INT8: u8 = 0;
const ENC_INT16: u8 = 1;
const ENC_INT32: u8 = 2;
const ENC_LZF: u8 = 3;

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_XZ);

// -- primitive writers ------------------------------------------------------

fn save_len(out: &mut Vec<u8>, len: u64) {
    if len < 1 << 6 {
        out.push((LEN_6BIT << 6) | len as u8);
    } else if len < 1 << 14 {
        out.push((LEN_14BIT << 6) | (len >> 8) as u8);
        out.push(len as u8);
    } else {
        out.push(LEN_32BIT << 6);
        out.extend_from_slice(&(len as u32).to_be_bytes());
    }
}

fn save_string(out: &mut Vec<u8>, bytes: &[u8]) {
    // small decimal integers get the compact integer encodings
    if bytes.len() <= 11 {
        if let Some(n) = crate::util::parse_i64(bytes) {
            if (i8::MIN as i64..=i8::MAX as i64).contains(&n) {
                out.push((LEN_ENCVAL << 6) | ENC_INT8);
                out.push(n as i8 as u8);
                return;
            } else if (i16::MIN as i64..=i16::MAX as i64).contains(&n) {
                out.push((LEN_ENCVAL << 6) | ENC_INT16);
                out.extend_from_slice(&(n as i16).to_be_bytes());
                return;
            } else if (i32::MIN as i64..=i32::MAX as i64).contains(&n) {
                out.push((LEN_ENCVAL << 6) | ENC_INT32);
                out.extend_from_slice(&(n as i32).to_be_bytes());
                return;
            }
        }
    }
    if bytes.len() > 20 {
        if let Ok(compressed) = compress(bytes) {
            if compressed.len() < bytes.len() {
                out.push((LEN_ENCVAL << 6) | ENC_LZF);
                save_len(out, compressed.len() as u64);
                save_len(out, bytes.len() as u64);
                out.extend_from_slice(&compressed);
                return;
            }
        }
    }
    save_len(out, bytes.len() as u64);
    out.extend_from_slice(bytes);
}

fn save_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_be_bytes());
}

fn save_f64(out: &mut Vec<u8>, v: f64) {
    out.extend_from_slice(&v.to_bits().to_be_bytes());
}

// -- primitive reader -------------------------------------------------------

struct SnapReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> SnapReader<'a> {
    fn new(buf: &'a [u8]) -> SnapReader<'a> {
        SnapReader { buf, pos: 0 }
    }

    fn short(&self) -> ServerError {
        ServerError::Internal("short read in snapshot".into())
    }

    fn u8(&mut self) -> Result<u8, ServerError> {
        let b = *self.buf.get(self.pos).ok_or_else(|| self.short())?;
        self.pos += 1;
        Ok(b)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ServerError> {
        let s = self
            .buf
            .get(self.pos..self.pos + n)
            .ok_or_else(|| self.short())?;
        self.pos += n;
        Ok(s)
    }

    fn u64(&mut self) -> Result<u64, ServerError> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn f64(&mut self) -> Result<f64, ServerError> {
        Ok(f64::from_bits(self.u64()?))
    }

    /// Returns Err(enc) via the bool flag: (value, is_encval).
    fn load_len(&mut self) -> Result<(u64, bool), ServerError> {
        let first = self.u8()?;
        match first >> 6 {
            LEN_6BIT => Ok(((first & 0x3F) as u64, false)),
            LEN_14BIT => {
                let second = self.u8()?;
                Ok(((((first & 0x3F) as u64) << 8) | second as u64, false))
            }
            LEN_32BIT => {
                let v = u32::from_be_bytes(self.take(4)?.try_into().unwrap());
                Ok((v as u64, false))
            }
            _ => Ok(((first & 0x3F) as u64, true)),
        }
    }

    fn load_string(&mut self) -> Result<Vec<u8>, ServerError> {
        let (len, encval) = self.load_len()?;
        if !encval {
            return Ok(self.take(len as usize)?.to_vec());
        }
        match len as u8 {
            ENC_INT8 => Ok((self.u8()? as i8).to_string().into_bytes()),
            ENC_INT16 => {
                let v = i16::from_be_bytes(self.take(2)?.try_into().unwrap());
                Ok(v.to_string().into_bytes())
            }
            ENC_INT32 => {
                let v = i32::from_be_bytes(self.take(4)?.try_into().unwrap());
                Ok(v.to_string().into_bytes())
            }
            ENC_LZF => {
                let (clen, _) = self.load_len()?;
                let (ulen, _) = self.load_len()?;
                let compressed = self.take(clen as usize)?;
                decompress(compressed, ulen as usize)
                    .map_err(|e| ServerError::Internal(format!("lzf: {:?}", e)))
            }
            other => Err(ServerError::Internal(format!(
                "unknown string encoding {}",
                other
            ))),
        }
    }
}

// -- per-type payloads ------------------------------------------------------

fn write_value_payload(
    store: &Store,
    key: &[u8],
    meta: &Meta,
    out: &mut Vec<u8>,
) -> Result<(), ServerError> {
    match meta.tag {
        ValueTag::Str | ValueTag::Hll => {
            let v = store.db().get(string_key(key))?.unwrap_or_default();
            save_string(out, &v);
        }
        ValueTag::Json => {
            let v = store.db().get(json_key(key))?.unwrap_or_default();
            save_string(out, &v);
        }
        ValueTag::List => {
            save_len(out, meta.len());
            for item in store.db().scan_prefix(elem_prefix(KIND_LIST, key)) {
                let (_, v) = item?;
                save_string(out, &v);
            }
        }
        ValueTag::Hash => {
            save_len(out, meta.len());
            let prefix = elem_prefix(KIND_HASH, key);
            for item in store.db().scan_prefix(&prefix) {
                let (k, v) = item?;
                save_string(out, &k[prefix.len()..]);
                save_string(out, &v);
            }
        }
        ValueTag::Set => {
            save_len(out, meta.len());
            let prefix = elem_prefix(KIND_SET, key);
            for item in store.db().scan_prefix(&prefix) {
                let (k, _) = item?;
                save_string(out, &k[prefix.len()..]);
            }
        }
        ValueTag::ZSet => {
            save_len(out, meta.len());
            let prefix = elem_prefix(KIND_ZSET_MEMBER, key);
            for item in store.db().scan_prefix(&prefix) {
                let (k, v) = item?;
                save_string(out, &k[prefix.len()..]);
                save_f64(out, f64::from_bits(u64::from_be_bytes(v[..8].try_into().unwrap())));
            }
        }
        ValueTag::Stream => {
            let MetaAux::Stream {
                last_ms,
                last_seq,
                entries_added,
                ..
            } = &meta.aux
            else {
                return Err(ServerError::Internal("stream meta mismatch".into()));
            };
            let (last_ms, last_seq, entries_added) = (*last_ms, *last_seq, *entries_added);
            save_len(out, meta.len());
            let prefix = elem_prefix(KIND_STREAM, key);
            for item in store.db().scan_prefix(&prefix) {
                let (k, v) = item?;
                let suffix = &k[prefix.len()..];
                save_u64(out, u64::from_be_bytes(suffix[..8].try_into().unwrap()));
                save_u64(out, u64::from_be_bytes(suffix[8..16].try_into().unwrap()));
                save_string(out, &v);
            }
            save_u64(out, last_ms);
            save_u64(out, last_seq);
            save_u64(out, entries_added);
            let groups = store.db().get(groups_key(key))?.unwrap_or_default();
            save_string(out, &groups);
        }
        ValueTag::Series => {
            let MetaAux::Series {
                retention_ms,
                policy,
                ..
            } = &meta.aux
            else {
                return Err(ServerError::Internal("series meta mismatch".into()));
            };
            let (retention_ms, policy) = (*retention_ms, *policy);
            save_u64(out, retention_ms);
            out.push(policy as u8);
            save_len(out, meta.len());
            let prefix = elem_prefix(KIND_SERIES, key);
            for item in store.db().scan_prefix(&prefix) {
                let (k, v) = item?;
                let suffix = &k[prefix.len()..];
                save_u64(out, u64::from_be_bytes(suffix[..8].try_into().unwrap()));
                save_f64(out, f64::from_bits(u64::from_be_bytes(v[..8].try_into().unwrap())));
            }
        }
    }
    Ok(())
}

/// Rebuild one value's records from its payload. Returns the meta to write
/// (expiration left to the caller).
fn read_value_payload(
    reader: &mut SnapReader,
    store: &Store,
    key: &[u8],
    tag: ValueTag,
) -> Result<Meta, ServerError> {
    let mut meta = Meta::new(tag);
    match tag {
        ValueTag::Str | ValueTag::Hll => {
            let v = reader.load_string()?;
            store.db().insert(string_key(key), v)?;
        }
        ValueTag::Json => {
            let v = reader.load_string()?;
            store.db().insert(json_key(key), v)?;
        }
        ValueTag::List => {
            let (n, _) = reader.load_len()?;
            for i in 0..n {
                let v = reader.load_string()?;
                store.db().insert(list_elem_key(key, LIST_BIAS + i), v)?;
            }
            meta.aux = MetaAux::List {
                head: LIST_BIAS,
                tail: LIST_BIAS + n,
            };
        }
        ValueTag::Hash => {
            let (n, _) = reader.load_len()?;
            for _ in 0..n {
                let field = reader.load_string()?;
                let value = reader.load_string()?;
                store.db().insert(hash_field_key(key, &field), value)?;
            }
            meta.aux = MetaAux::Coll { len: n };
        }
        ValueTag::Set => {
            let (n, _) = reader.load_len()?;
            for _ in 0..n {
                let member = reader.load_string()?;
                store.db().insert(set_member_key(key, &member), &[][..])?;
            }
            meta.aux = MetaAux::Coll { len: n };
        }
        ValueTag::ZSet => {
            let (n, _) = reader.load_len()?;
            for _ in 0..n {
                let member = reader.load_string()?;
                let score = reader.f64()?;
                store
                    .db()
                    .insert(zset_member_key(key, &member), score.to_bits().to_be_bytes().to_vec())?;
                store
                    .db()
                    .insert(zset_score_key(key, score, &member), &[][..])?;
            }
            meta.aux = MetaAux::Coll { len: n };
        }
        ValueTag::Stream => {
            let (n, _) = reader.load_len()?;
            for _ in 0..n {
                let ms = reader.u64()?;
                let seq = reader.u64()?;
                let fields = reader.load_string()?;
                store.db().insert(stream_entry_key(key, ms, seq), fields)?;
            }
            let last_ms = reader.u64()?;
            let last_seq = reader.u64()?;
            let entries_added = reader.u64()?;
            let groups = reader.load_string()?;
            if !groups.is_empty() {
                store.db().insert(groups_key(key), groups)?;
            }
            meta.aux = MetaAux::Stream {
                last_ms,
                last_seq,
                len: n,
                entries_added,
            };
        }
        ValueTag::Series => {
            let retention_ms = reader.u64()?;
            let policy = DupPolicy::from_u8(reader.u8()?)
                .ok_or_else(|| ServerError::Internal("bad duplicate policy".into()))?;
            let (n, _) = reader.load_len()?;
            for _ in 0..n {
                let ms = reader.u64()?;
                let v = reader.f64()?;
                store
                    .db()
                    .insert(series_sample_key(key, ms), v.to_bits().to_be_bytes().to_vec())?;
            }
            meta.aux = MetaAux::Series {
                retention_ms,
                policy,
                len: n,
            };
        }
    }
    Ok(meta)
}

// -- whole-keyspace snapshots -----------------------------------------------

pub fn serialize_snapshot(store: &Store) -> Result<Vec<u8>, ServerError> {
    let mut out = Vec::new();
    out.extend_from_slice(SNAPSHOT_MAGIC);
    out.extend_from_slice(&SNAPSHOT_VERSION.to_be_bytes());
    let now = now_ms();
    for item in store.db().scan_prefix([KIND_META]) {
        let (k, v) = item?;
        let key = &k[1..];
        let Some(meta) = Meta::decode(&v) else {
            continue;
        };
        if meta.expire_at > 0 && meta.expire_at <= now {
            continue; // already dead, don't persist it
        }
        out.push(OP_RECORD);
        out.push(meta.tag as u8);
        save_u64(&mut out, meta.expire_at);
        save_string(&mut out, key);
        write_value_payload(store, key, &meta, &mut out)?;
    }
    out.push(OP_EOF);
    let sum = CRC64.checksum(&out);
    out.extend_from_slice(&sum.to_le_bytes());
    Ok(out)
}

/// Ingest a snapshot into an empty store. The caller holds the exclusive
/// lock and has flushed beforehand.
pub fn install_snapshot(store: &Store, bytes: &[u8]) -> Result<usize, ServerError> {
    if bytes.len() < SNAPSHOT_MAGIC.len() + 2 + 1 + 8 {
        return Err(ServerError::Internal("snapshot truncated".into()));
    }
    let (body, trailer) = bytes.split_at(bytes.len() - 8);
    let expect = u64::from_le_bytes(trailer.try_into().unwrap());
    if CRC64.checksum(body) != expect {
        return Err(ServerError::Internal("snapshot checksum mismatch".into()));
    }
    if &body[..SNAPSHOT_MAGIC.len()] != SNAPSHOT_MAGIC {
        return Err(ServerError::Internal("bad snapshot signature".into()));
    }
    let version = u16::from_be_bytes(
        body[SNAPSHOT_MAGIC.len()..SNAPSHOT_MAGIC.len() + 2]
            .try_into()
            .unwrap(),
    );
    if version != SNAPSHOT_VERSION {
        return Err(ServerError::Internal(format!(
            "can't handle snapshot version {}",
            version
        )));
    }
    let mut reader = SnapReader::new(&body[SNAPSHOT_MAGIC.len() + 2..]);
    let mut loaded = 0;
    loop {
        match reader.u8()? {
            OP_EOF => break,
            OP_RECORD => {
                let tag = ValueTag::from_u8(reader.u8()?)
                    .ok_or_else(|| ServerError::Internal("unknown value type".into()))?;
                let expire_at = reader.u64()?;
                let key = reader.load_string()?;
                let mut meta = read_value_payload(&mut reader, store, &key, tag)?;
                meta.expire_at = expire_at;
                store.write_meta(&key, &meta)?;
                loaded += 1;
            }
            other => {
                return Err(ServerError::Internal(format!(
                    "unexpected snapshot opcode {}",
                    other
                )))
            }
        }
    }
    Ok(loaded)
}

pub fn save_to_file(store: &Store, dir: &Path, filename: &str) -> Result<(), ServerError> {
    let bytes = serialize_snapshot(store)?;
    let tmp = dir.join(format!("temp-{}.rdb", process::id()));
    let target = dir.join(filename);
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&tmp)?;
    file.write_all(&bytes)?;
    file.sync_all()?;
    rename(&tmp, &target)?;
    info!("DB saved on disk ({} bytes)", bytes.len());
    Ok(())
}

pub fn load_from_file(store: &Store, dir: &Path, filename: &str) -> Result<usize, ServerError> {
    let path = dir.join(filename);
    if !path.is_file() {
        return Ok(0);
    }
    let mut bytes = Vec::new();
    File::open(&path)?.read_to_end(&mut bytes)?;
    match install_snapshot(store, &bytes) {
        Ok(n) => {
            info!("DB loaded from {}: {} keys", path.display(), n);
            Ok(n)
        }
        Err(e) => {
            warn!("failed to load {}: {}", path.display(), e);
            Err(e)
        }
    }
}

// -- DUMP / RESTORE ---------------------------------------------------------

pub fn dump_value(store: &Store, key: &[u8]) -> Result<Option<Vec<u8>>, ServerError> {
    let Some(meta) = store.meta(key)? else {
        return Ok(None);
    };
    let mut out = Vec::new();
    out.push(meta.tag as u8);
    write_value_payload(store, key, &meta, &mut out)?;
    out.extend_from_slice(&DUMP_VERSION.to_le_bytes());
    let sum = CRC64.checksum(&out);
    out.extend_from_slice(&sum.to_le_bytes());
    Ok(Some(out))
}

pub fn restore_value(
    store: &Store,
    key: &[u8],
    expire_at: u64,
    payload: &[u8],
) -> Result<(), ServerError> {
    if payload.len() < 11 {
        return Err(ServerError::other("DUMP payload version or checksum are wrong"));
    }
    let (body, trailer) = payload.split_at(payload.len() - 8);
    let expect = u64::from_le_bytes(trailer.try_into().unwrap());
    if CRC64.checksum(body) != expect {
        return Err(ServerError::other("DUMP payload version or checksum are wrong"));
    }
    let (body, version_bytes) = body.split_at(body.len() - 2);
    if u16::from_le_bytes(version_bytes.try_into().unwrap()) != DUMP_VERSION {
        return Err(ServerError::other("DUMP payload version or checksum are wrong"));
    }
    let tag = ValueTag::from_u8(body[0])
        .ok_or_else(|| ServerError::other("Bad data format"))?;
    let mut reader = SnapReader::new(&body[1..]);
    let mut meta = read_value_payload(&mut reader, store, key, tag)?;
    meta.expire_at = expire_at;
    store.write_meta(key, &meta)?;
    store.bump(key);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn scratch() -> (TempDir, Store) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path().join("db").as_path()).unwrap();
        (dir, store)
    }

    fn put_string(store: &Store, key: &[u8], value: &[u8]) {
        store.write_meta(key, &Meta::new(ValueTag::Str)).unwrap();
        store.db().insert(string_key(key), value).unwrap();
    }

    #[test]
    fn snapshot_roundtrip() {
        let (dir, store) = scratch();
        put_string(&store, b"alpha", b"1");
        put_string(&store, b"beta", &vec![b'x'; 4096]); // exercises lzf
        let mut zmeta = Meta::new(ValueTag::ZSet);
        zmeta.aux = MetaAux::Coll { len: 1 };
        store.write_meta(b"scores", &zmeta).unwrap();
        store
            .db()
            .insert(zset_member_key(b"scores", b"m"), 2.5f64.to_bits().to_be_bytes().to_vec())
            .unwrap();
        store
            .db()
            .insert(zset_score_key(b"scores", 2.5, b"m"), &[][..])
            .unwrap();

        let bytes = serialize_snapshot(&store).unwrap();
        let store2 = Store::open(dir.path().join("db2").as_path()).unwrap();
        let n = install_snapshot(&store2, &bytes).unwrap();
        assert_eq!(n, 3);
        assert_eq!(
            store2.db().get(string_key(b"beta")).unwrap().unwrap().len(),
            4096
        );
        let meta = store2.meta(b"scores").unwrap().unwrap();
        assert_eq!(meta.tag, ValueTag::ZSet);
        assert_eq!(meta.len(), 1);
    }

    #[test]
    fn corrupted_snapshot_is_rejected() {
        let (_dir, store) = scratch();
        put_string(&store, b"k", b"v");
        let mut bytes = serialize_snapshot(&store).unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xFF;
        assert!(install_snapshot(&store, &bytes).is_err());
    }

    #[test]
    fn dump_restore_preserves_value() {
        let (_dir, store) = scratch();
        put_string(&store, b"k", b"hello world");
        let payload = dump_value(&store, b"k").unwrap().unwrap();
        store.delete_key(b"k").unwrap();
        restore_value(&store, b"k", 0, &payload).unwrap();
        assert_eq!(
            store.db().get(string_key(b"k")).unwrap().unwrap().as_ref(),
            b"hello world"
        );
    }

    #[test]
    fn restore_rejects_bad_checksum() {
        let (_dir, store) = scratch();
        put_string(&store, b"k", b"hello");
        let mut payload = dump_value(&store, b"k").unwrap().unwrap();
        let last = payload.len() - 1;
        payload[last] ^= 1;
        assert!(restore_value(&store, b"k2", 0, &payload).is_err());
    }

    #[test]
    fn integer_strings_use_compact_encoding() {
        let mut out = Vec::new();
        save_string(&mut out, b"123");
        assert_eq!(out.len(), 2); // ENC_INT8 marker + one byte
        let mut r = SnapReader::new(&out);
        assert_eq!(r.load_string().unwrap(), b"123");
    }

    #[test]
    fn file_save_load() {
        let (dir, store) = scratch();
        put_string(&store, b"k", b"v");
        save_to_file(&store, dir.path(), "dump.rdb").unwrap();
        let store2 = Store::open(dir.path().join("db3").as_path()).unwrap();
        let n = load_from_file(&store2, dir.path(), "dump.rdb").unwrap();
        assert_eq!(n, 1);
    }
}
