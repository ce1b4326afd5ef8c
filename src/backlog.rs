//! Replication backlog: a bounded ring of the most recent serialized master
//! writes, addressable by the global byte offset. A briefly-disconnected
//! replica whose offset is still inside the ring resumes with +CONTINUE
//! instead of a full resync.

pub struct ReplBacklog {
    buf: Vec<u8>,
    capacity: usize,
    len: usize,
    write_pos: usize,
    end_offset: u64,
}

impl ReplBacklog {
    pub fn new(capacity: usize) -> ReplBacklog {
        assert!(capacity > 0);
        ReplBacklog {
            buf: vec![0; capacity],
            capacity,
            len: 0,
            write_pos: 0,
            end_offset: 0,
        }
    }

    /// Offset of the first byte still held by the ring.
    pub fn start_offset(&self) -> u64 {
        self.end_offset - self.len as u64
    }

    /// Offset one past the last appended byte; this is the master
    /// replication offset.
    pub fn end_offset(&self) -> u64 {
        self.end_offset
    }

    pub fn append(&mut self, mut bytes: &[u8]) {
        self.end_offset += bytes.len() as u64;
        if bytes.len() >= self.capacity {
            // only the tail fits; the ring restarts from it
            bytes = &bytes[bytes.len() - self.capacity..];
            self.buf.copy_from_slice(bytes);
            self.write_pos = 0;
            self.len = self.capacity;
            return;
        }
        let first = (self.capacity - self.write_pos).min(bytes.len());
        self.buf[self.write_pos..self.write_pos + first].copy_from_slice(&bytes[..first]);
        if first < bytes.len() {
            self.buf[..bytes.len() - first].copy_from_slice(&bytes[first..]);
        }
        self.write_pos = (self.write_pos + bytes.len()) % self.capacity;
        self.len = (self.len + bytes.len()).min(self.capacity);
    }

    /// Bytes from `offset` to the end, or None when the ring no longer
    /// holds them (the replica must full-resync).
    pub fn range_from(&self, offset: u64) -> Option<Vec<u8>> {
        if offset < self.start_offset() || offset > self.end_offset {
            return None;
        }
        let want = (self.end_offset - offset) as usize;
        let mut out = Vec::with_capacity(want);
        // read position of `offset` inside the ring
        let skip = (offset - self.start_offset()) as usize;
        let start = (self.write_pos + self.capacity - self.len + skip) % self.capacity;
        let first = (self.capacity - start).min(want);
        out.extend_from_slice(&self.buf[start..start + first]);
        if first < want {
            out.extend_from_slice(&self.buf[..want - first]);
        }
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_read_back() {
        let mut b = ReplBacklog::new(16);
        b.append(b"hello");
        assert_eq!(b.end_offset(), 5);
        assert_eq!(b.range_from(0).unwrap(), b"hello");
        assert_eq!(b.range_from(2).unwrap(), b"llo");
        assert_eq!(b.range_from(5).unwrap(), b"");
    }

    #[test]
    fn wraparound_evicts_oldest() {
        let mut b = ReplBacklog::new(8);
        b.append(b"abcd");
        b.append(b"efgh");
        b.append(b"ij");
        assert_eq!(b.end_offset(), 10);
        assert_eq!(b.start_offset(), 2);
        assert!(b.range_from(0).is_none());
        assert!(b.range_from(1).is_none());
        assert_eq!(b.range_from(2).unwrap(), b"cdefghij");
        assert_eq!(b.range_from(6).unwrap(), b"ghij");
    }

    #[test]
    fn oversized_append_keeps_tail() {
        let mut b = ReplBacklog::new(4);
        b.append(b"0123456789");
        assert_eq!(b.end_offset(), 10);
        assert_eq!(b.start_offset(), 6);
        assert_eq!(b.range_from(6).unwrap(), b"6789");
        assert!(b.range_from(5).is_none());
    }

    #[test]
    fn future_offset_is_rejected() {
        let mut b = ReplBacklog::new(8);
        b.append(b"xy");
        assert!(b.range_from(3).is_none());
    }
}
