//! Typed storage engine over an ordered persistent byte-key store. The
//! backing sled tree holds one meta record per key plus per-type element
//! records (see `encoding`). The TTL index, per-key revisions (WATCH) and
//! scan cursors live in memory and are rebuilt or reset at startup.

pub mod encoding;

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;

use log::{debug, info};

use crate::errors::ServerError;
use crate::util::now_ms;
use encoding::*;

const CURSOR_TABLE_CAP: usize = 1024;

/// Opaque SCAN cursors: each continuation gets a fresh monotonically
/// increasing id mapped to the position to resume after. Abandoned cursors
/// age out of the bounded table.
struct CursorTable {
    next: u64,
    live: HashMap<u64, Vec<u8>>,
    order: VecDeque<u64>,
}

impl CursorTable {
    fn new() -> CursorTable {
        CursorTable {
            next: 1,
            live: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn save(&mut self, resume_after: Vec<u8>) -> u64 {
        let id = self.next;
        self.next += 1;
        self.live.insert(id, resume_after);
        self.order.push_back(id);
        while self.order.len() > CURSOR_TABLE_CAP {
            if let Some(old) = self.order.pop_front() {
                self.live.remove(&old);
            }
        }
        id
    }

    fn take(&mut self, id: u64) -> Option<Vec<u8>> {
        self.live.remove(&id)
    }
}

pub struct Store {
    db: sled::Db,
    revisions: Mutex<HashMap<Vec<u8>, u64>>,
    rev_counter: AtomicU64,
    ttl: Mutex<BTreeSet<(u64, Vec<u8>)>>,
    lazily_expired: Mutex<Vec<Vec<u8>>>,
    cursors: Mutex<CursorTable>,
    key_count: AtomicI64,
    /// Mutation counter; the dispatcher diffs it around a handler to decide
    /// whether to propagate the command to replicas.
    pub dirty: AtomicU64,
    pub expired_total: AtomicU64,
}

impl Store {
    pub fn open(path: &Path) -> Result<Store, ServerError> {
        let db = sled::open(path)?;
        let store = Store {
            db,
            revisions: Mutex::new(HashMap::new()),
            rev_counter: AtomicU64::new(1),
            ttl: Mutex::new(BTreeSet::new()),
            lazily_expired: Mutex::new(Vec::new()),
            cursors: Mutex::new(CursorTable::new()),
            key_count: AtomicI64::new(0),
            dirty: AtomicU64::new(0),
            expired_total: AtomicU64::new(0),
        };
        store.rebuild_indices()?;
        Ok(store)
    }

    fn rebuild_indices(&self) -> Result<(), ServerError> {
        let mut count = 0i64;
        let mut ttl = self.ttl.lock().unwrap();
        for item in self.db.scan_prefix([KIND_META]) {
            let (k, v) = item?;
            count += 1;
            if let Some(meta) = Meta::decode(&v) {
                if meta.expire_at > 0 {
                    ttl.insert((meta.expire_at, k[1..].to_vec()));
                }
            }
        }
        drop(ttl);
        self.key_count.store(count, Ordering::SeqCst);
        if count > 0 {
            info!("loaded {} keys from the backing store", count);
        }
        Ok(())
    }

    pub fn db(&self) -> &sled::Db {
        &self.db
    }

    // -- meta and expiry ----------------------------------------------------

    /// Meta record of a live key. An expired key reads as absent and is
    /// queued for eager deletion by the sweeper.
    pub fn meta(&self, key: &[u8]) -> Result<Option<Meta>, ServerError> {
        match self.meta_raw(key)? {
            Some(meta) if meta.expire_at > 0 && meta.expire_at <= now_ms() => {
                self.lazily_expired.lock().unwrap().push(key.to_vec());
                Ok(None)
            }
            other => Ok(other),
        }
    }

    pub fn meta_raw(&self, key: &[u8]) -> Result<Option<Meta>, ServerError> {
        Ok(self
            .db
            .get(meta_key(key))?
            .and_then(|v| Meta::decode(&v)))
    }

    /// Meta of a live key constrained to `accepted` type tags; a live key of
    /// a different type is a WRONGTYPE error.
    pub fn meta_expect(
        &self,
        key: &[u8],
        accepted: &[ValueTag],
    ) -> Result<Option<Meta>, ServerError> {
        match self.meta(key)? {
            Some(meta) if accepted.contains(&meta.tag) => Ok(Some(meta)),
            Some(_) => Err(ServerError::WrongType),
            None => Ok(None),
        }
    }

    /// Insert or update a meta record, keeping the key counter and TTL
    /// index in sync.
    pub fn write_meta(&self, key: &[u8], meta: &Meta) -> Result<(), ServerError> {
        let old = self.db.insert(meta_key(key), meta.encode())?;
        let old_expire = old.and_then(|v| Meta::decode(&v)).map(|m| m.expire_at);
        match old_expire {
            None => {
                self.key_count.fetch_add(1, Ordering::SeqCst);
                if meta.expire_at > 0 {
                    self.ttl.lock().unwrap().insert((meta.expire_at, key.to_vec()));
                }
            }
            Some(prev) if prev != meta.expire_at => {
                let mut ttl = self.ttl.lock().unwrap();
                if prev > 0 {
                    ttl.remove(&(prev, key.to_vec()));
                }
                if meta.expire_at > 0 {
                    ttl.insert((meta.expire_at, key.to_vec()));
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Remove a key and every record belonging to it. Returns whether the
    /// key existed.
    pub fn delete_key(&self, key: &[u8]) -> Result<bool, ServerError> {
        let Some(meta) = self.meta_raw(key)? else {
            return Ok(false);
        };
        self.delete_value_records(key, meta.tag)?;
        self.db.remove(meta_key(key))?;
        self.key_count.fetch_sub(1, Ordering::SeqCst);
        if meta.expire_at > 0 {
            self.ttl.lock().unwrap().remove(&(meta.expire_at, key.to_vec()));
        }
        self.bump(key);
        Ok(true)
    }

    /// Drop the payload records of a value, leaving the meta record alone.
    pub fn delete_value_records(&self, key: &[u8], tag: ValueTag) -> Result<(), ServerError> {
        match tag {
            ValueTag::Str | ValueTag::Hll => {
                self.db.remove(string_key(key))?;
            }
            ValueTag::Json => {
                self.db.remove(json_key(key))?;
            }
            ValueTag::List => self.delete_prefix(&elem_prefix(KIND_LIST, key))?,
            ValueTag::Hash => self.delete_prefix(&elem_prefix(KIND_HASH, key))?,
            ValueTag::Set => self.delete_prefix(&elem_prefix(KIND_SET, key))?,
            ValueTag::ZSet => {
                self.delete_prefix(&elem_prefix(KIND_ZSET_MEMBER, key))?;
                self.delete_prefix(&elem_prefix(KIND_ZSET_SCORE, key))?;
            }
            ValueTag::Stream => {
                self.delete_prefix(&elem_prefix(KIND_STREAM, key))?;
                self.db.remove(groups_key(key))?;
            }
            ValueTag::Series => self.delete_prefix(&elem_prefix(KIND_SERIES, key))?,
        }
        Ok(())
    }

    pub fn delete_prefix(&self, prefix: &[u8]) -> Result<(), ServerError> {
        let keys: Vec<sled::IVec> = self
            .db
            .scan_prefix(prefix)
            .map(|item| item.map(|(k, _)| k))
            .collect::<Result<_, _>>()?;
        for k in keys {
            self.db.remove(k)?;
        }
        Ok(())
    }

    /// Copy every record of `src` under `dst` (which must not exist).
    pub fn copy_value(&self, src: &[u8], dst: &[u8]) -> Result<bool, ServerError> {
        let Some(meta) = self.meta(src)? else {
            return Ok(false);
        };
        match meta.tag {
            ValueTag::Str | ValueTag::Hll => {
                if let Some(v) = self.db.get(string_key(src))? {
                    self.db.insert(string_key(dst), v)?;
                }
            }
            ValueTag::Json => {
                if let Some(v) = self.db.get(json_key(src))? {
                    self.db.insert(json_key(dst), v)?;
                }
            }
            _ => {
                for kind in element_kinds(meta.tag) {
                    let src_prefix = elem_prefix(*kind, src);
                    let dst_prefix = elem_prefix(*kind, dst);
                    for item in self.db.scan_prefix(&src_prefix) {
                        let (k, v) = item?;
                        let mut nk = dst_prefix.clone();
                        nk.extend_from_slice(&k[src_prefix.len()..]);
                        self.db.insert(nk, v)?;
                    }
                }
                if meta.tag == ValueTag::Stream {
                    if let Some(v) = self.db.get(groups_key(src))? {
                        self.db.insert(groups_key(dst), v)?;
                    }
                }
            }
        }
        // expiration travels with the value
        let dst_meta = meta.clone();
        self.write_meta(dst, &dst_meta)?;
        self.bump(dst);
        Ok(true)
    }

    // -- revisions (WATCH) --------------------------------------------------

    /// Bump the key's revision; called by every mutation path so WATCH can
    /// detect conflicting writes.
    pub fn bump(&self, key: &[u8]) {
        let rev = self.rev_counter.fetch_add(1, Ordering::SeqCst);
        self.revisions.lock().unwrap().insert(key.to_vec(), rev);
        self.dirty.fetch_add(1, Ordering::SeqCst);
    }

    pub fn revision(&self, key: &[u8]) -> u64 {
        self.revisions.lock().unwrap().get(key).copied().unwrap_or(0)
    }

    // -- TTL ----------------------------------------------------------------

    /// Update the expiration of an existing key. `at_ms == 0` clears it.
    pub fn set_expire(&self, key: &[u8], at_ms: u64) -> Result<bool, ServerError> {
        let Some(mut meta) = self.meta(key)? else {
            return Ok(false);
        };
        meta.expire_at = at_ms;
        self.write_meta(key, &meta)?;
        self.bump(key);
        Ok(true)
    }

    /// Milliseconds until expiry: None when the key is missing,
    /// Some(None) when it has no expiration.
    pub fn pttl(&self, key: &[u8]) -> Result<Option<Option<u64>>, ServerError> {
        match self.meta(key)? {
            None => Ok(None),
            Some(meta) if meta.expire_at == 0 => Ok(Some(None)),
            Some(meta) => Ok(Some(Some(meta.expire_at.saturating_sub(now_ms())))),
        }
    }

    /// One sweeper pass: delete keys whose expiration is due, plus any keys
    /// a read already noticed were stale. Caller holds the exclusive lock.
    pub fn sweep_expired(&self, limit: usize) -> Result<usize, ServerError> {
        let now = now_ms();
        let mut due: Vec<Vec<u8>> = {
            let ttl = self.ttl.lock().unwrap();
            ttl.iter()
                .take_while(|(at, _)| *at <= now)
                .take(limit)
                .map(|(_, k)| k.clone())
                .collect()
        };
        due.append(&mut self.lazily_expired.lock().unwrap());
        let mut removed = 0;
        for key in due {
            // re-check: the key may have been touched since it was queued
            if let Some(meta) = self.meta_raw(&key)? {
                if meta.expire_at > 0 && meta.expire_at <= now {
                    self.delete_key(&key)?;
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            self.expired_total.fetch_add(removed as u64, Ordering::Relaxed);
            debug!("expired {} keys", removed);
        }
        Ok(removed as usize)
    }

    // -- keyspace -----------------------------------------------------------

    pub fn key_count(&self) -> usize {
        self.key_count.load(Ordering::SeqCst).max(0) as usize
    }

    pub fn expires_count(&self) -> usize {
        self.ttl.lock().unwrap().len()
    }

    pub fn flush_all(&self) -> Result<usize, ServerError> {
        let removed = self.key_count();
        self.db.clear()?;
        self.ttl.lock().unwrap().clear();
        self.revisions.lock().unwrap().clear();
        self.lazily_expired.lock().unwrap().clear();
        self.key_count.store(0, Ordering::SeqCst);
        self.dirty.fetch_add(1, Ordering::SeqCst);
        Ok(removed)
    }

    /// Walk live keys in lexicographic order starting after `resume`.
    /// Returns up to `count` (key, meta) pairs plus the resume position for
    /// the next call, None when the keyspace is exhausted.
    pub fn scan_keys(
        &self,
        resume_after: Option<&[u8]>,
        count: usize,
    ) -> Result<(Vec<(Vec<u8>, Meta)>, Option<Vec<u8>>), ServerError> {
        let mut out = Vec::with_capacity(count);
        let start: Vec<u8> = match resume_after {
            // first byte past the resume key: append a zero byte
            Some(k) => {
                let mut s = meta_key(k);
                s.push(0);
                s
            }
            None => vec![KIND_META],
        };
        let now = now_ms();
        let mut last: Option<Vec<u8>> = None;
        for item in self.db.range(start..) {
            let (k, v) = item?;
            if k[0] != KIND_META {
                break;
            }
            let user_key = k[1..].to_vec();
            last = Some(user_key.clone());
            if let Some(meta) = Meta::decode(&v) {
                if meta.expire_at > 0 && meta.expire_at <= now {
                    self.lazily_expired.lock().unwrap().push(user_key);
                    continue;
                }
                out.push((user_key, meta));
            }
            if out.len() >= count {
                return Ok((out, last));
            }
        }
        Ok((out, None))
    }

    pub fn cursor_save(&self, resume_after: Vec<u8>) -> u64 {
        self.cursors.lock().unwrap().save(resume_after)
    }

    pub fn cursor_take(&self, id: u64) -> Option<Vec<u8>> {
        self.cursors.lock().unwrap().take(id)
    }

    /// Rough per-key footprint: the byte size of every record the key owns.
    pub fn memory_usage(&self, key: &[u8]) -> Result<Option<u64>, ServerError> {
        let Some(meta) = self.meta(key)? else {
            return Ok(None);
        };
        let mut total = (meta_key(key).len() + meta.encode().len()) as u64;
        match meta.tag {
            ValueTag::Str | ValueTag::Hll => {
                if let Some(v) = self.db.get(string_key(key))? {
                    total += v.len() as u64;
                }
            }
            ValueTag::Json => {
                if let Some(v) = self.db.get(json_key(key))? {
                    total += v.len() as u64;
                }
            }
            tag => {
                for kind in element_kinds(tag) {
                    for item in self.db.scan_prefix(elem_prefix(*kind, key)) {
                        let (k, v) = item?;
                        total += (k.len() + v.len()) as u64;
                    }
                }
                if tag == ValueTag::Stream {
                    if let Some(v) = self.db.get(groups_key(key))? {
                        total += v.len() as u64;
                    }
                }
            }
        }
        Ok(Some(total))
    }
}

fn element_kinds(tag: ValueTag) -> &'static [u8] {
    match tag {
        ValueTag::List => &[KIND_LIST],
        ValueTag::Hash => &[KIND_HASH],
        ValueTag::Set => &[KIND_SET],
        ValueTag::ZSet => &[KIND_ZSET_MEMBER, KIND_ZSET_SCORE],
        ValueTag::Stream => &[KIND_STREAM],
        ValueTag::Series => &[KIND_SERIES],
        _ => &[],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn scratch() -> (TempDir, Store) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn meta_lifecycle() {
        let (_dir, store) = scratch();
        assert!(store.meta(b"k").unwrap().is_none());
        store.write_meta(b"k", &Meta::new(ValueTag::Str)).unwrap();
        store.db().insert(string_key(b"k"), &b"v"[..]).unwrap();
        assert_eq!(store.meta(b"k").unwrap().unwrap().tag, ValueTag::Str);
        assert_eq!(store.key_count(), 1);
        assert!(store.delete_key(b"k").unwrap());
        assert!(store.meta(b"k").unwrap().is_none());
        assert_eq!(store.key_count(), 0);
    }

    #[test]
    fn wrong_type_is_detected() {
        let (_dir, store) = scratch();
        store.write_meta(b"k", &Meta::new(ValueTag::List)).unwrap();
        assert!(matches!(
            store.meta_expect(b"k", &[ValueTag::Str]),
            Err(ServerError::WrongType)
        ));
        assert!(store.meta_expect(b"k", &[ValueTag::List]).unwrap().is_some());
    }

    #[test]
    fn expired_key_reads_as_missing_and_sweeps() {
        let (_dir, store) = scratch();
        let mut meta = Meta::new(ValueTag::Str);
        meta.expire_at = now_ms() - 10;
        store.write_meta(b"gone", &meta).unwrap();
        assert!(store.meta(b"gone").unwrap().is_none());
        let removed = store.sweep_expired(128).unwrap();
        assert_eq!(removed, 1);
        assert!(store.meta_raw(b"gone").unwrap().is_none());
    }

    #[test]
    fn revisions_bump_on_mutation() {
        let (_dir, store) = scratch();
        assert_eq!(store.revision(b"k"), 0);
        store.bump(b"k");
        let r1 = store.revision(b"k");
        assert!(r1 > 0);
        store.bump(b"k");
        assert!(store.revision(b"k") > r1);
    }

    #[test]
    fn scan_resumes_in_order() {
        let (_dir, store) = scratch();
        for name in [b"a".as_slice(), b"b", b"c", b"d"] {
            store.write_meta(name, &Meta::new(ValueTag::Str)).unwrap();
        }
        let (first, resume) = store.scan_keys(None, 2).unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].0, b"a");
        let (second, done) = store.scan_keys(resume.as_deref(), 10).unwrap();
        assert_eq!(second.len(), 2);
        assert_eq!(second[1].0, b"d");
        assert!(done.is_none());
    }

    #[test]
    fn copy_clones_all_records() {
        let (_dir, store) = scratch();
        store.write_meta(b"src", &Meta::new(ValueTag::Str)).unwrap();
        store.db().insert(string_key(b"src"), &b"payload"[..]).unwrap();
        assert!(store.copy_value(b"src", b"dst").unwrap());
        assert_eq!(
            store.db().get(string_key(b"dst")).unwrap().unwrap().as_ref(),
            b"payload"
        );
        assert_eq!(store.key_count(), 2);
    }
}
