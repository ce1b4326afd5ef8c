//! Record-key layout for the backing store. Every record key starts with a
//! one-byte kind, composite types add a length-framed owner key so one
//! prefix scan walks a single value's elements in element order: list
//! indices big-endian, hash fields bytewise, sorted-set scores through the
//! order-preserving double transform, stream ids as two big-endian u64s.

pub const KIND_META: u8 = b'M';
pub const KIND_STRING: u8 = b'S';
pub const KIND_LIST: u8 = b'L';
pub const KIND_HASH: u8 = b'H';
pub const KIND_SET: u8 = b'E';
pub const KIND_ZSET_MEMBER: u8 = b'Z';
pub const KIND_ZSET_SCORE: u8 = b'z';
pub const KIND_STREAM: u8 = b'X';
pub const KIND_GROUPS: u8 = b'G';
pub const KIND_JSON: u8 = b'J';
pub const KIND_SERIES: u8 = b'T';

/// List element indices are biased around the middle of the u64 space so
/// pushes at the head can decrement forever.
pub const LIST_BIAS: u64 = 1 << 63;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueTag {
    Str = 0,
    List = 1,
    Hash = 2,
    Set = 3,
    ZSet = 4,
    Stream = 5,
    Json = 6,
    Hll = 7,
    Series = 8,
}

impl ValueTag {
    pub fn from_u8(b: u8) -> Option<ValueTag> {
        Some(match b {
            0 => ValueTag::Str,
            1 => ValueTag::List,
            2 => ValueTag::Hash,
            3 => ValueTag::Set,
            4 => ValueTag::ZSet,
            5 => ValueTag::Stream,
            6 => ValueTag::Json,
            7 => ValueTag::Hll,
            8 => ValueTag::Series,
            _ => return None,
        })
    }

    /// What TYPE reports. HyperLogLogs live in strings on the wire, and the
    /// module-backed types answer with their registered names.
    pub fn type_name(&self) -> &'static str {
        match self {
            ValueTag::Str | ValueTag::Hll => "string",
            ValueTag::List => "list",
            ValueTag::Hash => "hash",
            ValueTag::Set => "set",
            ValueTag::ZSet => "zset",
            ValueTag::Stream => "stream",
            ValueTag::Json => "ReJSON-RL",
            ValueTag::Series => "TSDB-TYPE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DupPolicy {
    Block = 0,
    First = 1,
    Last = 2,
    Min = 3,
    Max = 4,
    Sum = 5,
}

impl DupPolicy {
    pub fn from_u8(b: u8) -> Option<DupPolicy> {
        Some(match b {
            0 => DupPolicy::Block,
            1 => DupPolicy::First,
            2 => DupPolicy::Last,
            3 => DupPolicy::Min,
            4 => DupPolicy::Max,
            5 => DupPolicy::Sum,
            _ => return None,
        })
    }

    pub fn parse(name: &[u8]) -> Option<DupPolicy> {
        Some(match name.to_ascii_uppercase().as_slice() {
            b"BLOCK" => DupPolicy::Block,
            b"FIRST" => DupPolicy::First,
            b"LAST" => DupPolicy::Last,
            b"MIN" => DupPolicy::Min,
            b"MAX" => DupPolicy::Max,
            b"SUM" => DupPolicy::Sum,
            _ => return None,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            DupPolicy::Block => "block",
            DupPolicy::First => "first",
            DupPolicy::Last => "last",
            DupPolicy::Min => "min",
            DupPolicy::Max => "max",
            DupPolicy::Sum => "sum",
        }
    }
}

/// Per-type header carried by the meta record, so length and boundary
/// queries never scan elements.
#[derive(Debug, Clone, PartialEq)]
pub enum MetaAux {
    None,
    /// Elements live at indices [head, tail).
    List { head: u64, tail: u64 },
    /// Hash, set and sorted-set cardinality.
    Coll { len: u64 },
    Stream {
        last_ms: u64,
        last_seq: u64,
        len: u64,
        entries_added: u64,
    },
    Series {
        retention_ms: u64,
        policy: DupPolicy,
        len: u64,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Meta {
    pub tag: ValueTag,
    /// Absolute expiration in ms since the epoch; 0 means no expiration.
    pub expire_at: u64,
    pub aux: MetaAux,
}

impl Meta {
    pub fn new(tag: ValueTag) -> Meta {
        let aux = match tag {
            ValueTag::List => MetaAux::List {
                head: LIST_BIAS,
                tail: LIST_BIAS,
            },
            ValueTag::Hash | ValueTag::Set | ValueTag::ZSet => MetaAux::Coll { len: 0 },
            ValueTag::Stream => MetaAux::Stream {
                last_ms: 0,
                last_seq: 0,
                len: 0,
                entries_added: 0,
            },
            ValueTag::Series => MetaAux::Series {
                retention_ms: 0,
                policy: DupPolicy::Block,
                len: 0,
            },
            _ => MetaAux::None,
        };
        Meta {
            tag,
            expire_at: 0,
            aux,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        out.push(self.tag as u8);
        out.extend_from_slice(&self.expire_at.to_be_bytes());
        match &self.aux {
            MetaAux::None => {}
            MetaAux::List { head, tail } => {
                out.extend_from_slice(&head.to_be_bytes());
                out.extend_from_slice(&tail.to_be_bytes());
            }
            MetaAux::Coll { len } => out.extend_from_slice(&len.to_be_bytes()),
            MetaAux::Stream {
                last_ms,
                last_seq,
                len,
                entries_added,
            } => {
                out.extend_from_slice(&last_ms.to_be_bytes());
                out.extend_from_slice(&last_seq.to_be_bytes());
                out.extend_from_slice(&len.to_be_bytes());
                out.extend_from_slice(&entries_added.to_be_bytes());
            }
            MetaAux::Series {
                retention_ms,
                policy,
                len,
            } => {
                out.extend_from_slice(&retention_ms.to_be_bytes());
                out.push(*policy as u8);
                out.extend_from_slice(&len.to_be_bytes());
            }
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Meta> {
        if bytes.len() < 9 {
            return None;
        }
        let tag = ValueTag::from_u8(bytes[0])?;
        let expire_at = u64::from_be_bytes(bytes[1..9].try_into().ok()?);
        let rest = &bytes[9..];
        let aux = match tag {
            ValueTag::List => MetaAux::List {
                head: u64::from_be_bytes(rest.get(0..8)?.try_into().ok()?),
                tail: u64::from_be_bytes(rest.get(8..16)?.try_into().ok()?),
            },
            ValueTag::Hash | ValueTag::Set | ValueTag::ZSet => MetaAux::Coll {
                len: u64::from_be_bytes(rest.get(0..8)?.try_into().ok()?),
            },
            ValueTag::Stream => MetaAux::Stream {
                last_ms: u64::from_be_bytes(rest.get(0..8)?.try_into().ok()?),
                last_seq: u64::from_be_bytes(rest.get(8..16)?.try_into().ok()?),
                len: u64::from_be_bytes(rest.get(16..24)?.try_into().ok()?),
                entries_added: u64::from_be_bytes(rest.get(24..32)?.try_into().ok()?),
            },
            ValueTag::Series => MetaAux::Series {
                retention_ms: u64::from_be_bytes(rest.get(0..8)?.try_into().ok()?),
                policy: DupPolicy::from_u8(*rest.get(8)?)?,
                len: u64::from_be_bytes(rest.get(9..17)?.try_into().ok()?),
            },
            _ => MetaAux::None,
        };
        Some(Meta {
            tag,
            expire_at,
            aux,
        })
    }

    pub fn len(&self) -> u64 {
        match &self.aux {
            MetaAux::List { head, tail } => tail - head,
            MetaAux::Coll { len } => *len,
            MetaAux::Stream { len, .. } => *len,
            MetaAux::Series { len, .. } => *len,
            MetaAux::None => 0,
        }
    }
}

// -- record key builders ----------------------------------------------------

pub fn meta_key(key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + key.len());
    out.push(KIND_META);
    out.extend_from_slice(key);
    out
}

pub fn string_key(key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + key.len());
    out.push(KIND_STRING);
    out.extend_from_slice(key);
    out
}

pub fn json_key(key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + key.len());
    out.push(KIND_JSON);
    out.extend_from_slice(key);
    out
}

pub fn groups_key(key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + key.len());
    out.push(KIND_GROUPS);
    out.extend_from_slice(key);
    out
}

/// Prefix shared by all element records of one composite value.
pub fn elem_prefix(kind: u8, key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(5 + key.len());
    out.push(kind);
    out.extend_from_slice(&(key.len() as u32).to_be_bytes());
    out.extend_from_slice(key);
    out
}

pub fn list_elem_key(key: &[u8], index: u64) -> Vec<u8> {
    let mut out = elem_prefix(KIND_LIST, key);
    out.extend_from_slice(&index.to_be_bytes());
    out
}

pub fn hash_field_key(key: &[u8], field: &[u8]) -> Vec<u8> {
    let mut out = elem_prefix(KIND_HASH, key);
    out.extend_from_slice(field);
    out
}

pub fn set_member_key(key: &[u8], member: &[u8]) -> Vec<u8> {
    let mut out = elem_prefix(KIND_SET, key);
    out.extend_from_slice(member);
    out
}

pub fn zset_member_key(key: &[u8], member: &[u8]) -> Vec<u8> {
    let mut out = elem_prefix(KIND_ZSET_MEMBER, key);
    out.extend_from_slice(member);
    out
}

pub fn zset_score_key(key: &[u8], score: f64, member: &[u8]) -> Vec<u8> {
    let mut out = elem_prefix(KIND_ZSET_SCORE, key);
    out.extend_from_slice(&encode_score(score));
    out.extend_from_slice(member);
    out
}

pub fn stream_entry_key(key: &[u8], ms: u64, seq: u64) -> Vec<u8> {
    let mut out = elem_prefix(KIND_STREAM, key);
    out.extend_from_slice(&ms.to_be_bytes());
    out.extend_from_slice(&seq.to_be_bytes());
    out
}

pub fn series_sample_key(key: &[u8], ms: u64) -> Vec<u8> {
    let mut out = elem_prefix(KIND_SERIES, key);
    out.extend_from_slice(&ms.to_be_bytes());
    out
}

// -- order-preserving double encoding ---------------------------------------

/// IEEE-754 double to a byte-sortable u64 key: flip the sign bit for
/// non-negative values, flip all bits for negative ones. Lexicographic
/// order of the result equals numeric order of the input.
pub fn encode_score(score: f64) -> [u8; 8] {
    let bits = score.to_bits();
    let mapped = if bits & (1 << 63) == 0 {
        bits ^ (1 << 63)
    } else {
        !bits
    };
    mapped.to_be_bytes()
}

pub fn decode_score(bytes: &[u8]) -> f64 {
    let mapped = u64::from_be_bytes(bytes[..8].try_into().unwrap());
    let bits = if mapped & (1 << 63) != 0 {
        mapped ^ (1 << 63)
    } else {
        !mapped
    };
    f64::from_bits(bits)
}

// -- length-framed byte reader, shared by stream/group payloads -------------

pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(buf: &'a [u8]) -> ByteReader<'a> {
        ByteReader { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn u8(&mut self) -> Option<u8> {
        let b = *self.buf.get(self.pos)?;
        self.pos += 1;
        Some(b)
    }

    pub fn u32(&mut self) -> Option<u32> {
        let v = u32::from_be_bytes(self.buf.get(self.pos..self.pos + 4)?.try_into().ok()?);
        self.pos += 4;
        Some(v)
    }

    pub fn u64(&mut self) -> Option<u64> {
        let v = u64::from_be_bytes(self.buf.get(self.pos..self.pos + 8)?.try_into().ok()?);
        self.pos += 8;
        Some(v)
    }

    pub fn f64(&mut self) -> Option<f64> {
        Some(f64::from_bits(self.u64()?))
    }

    pub fn bytes(&mut self) -> Option<Vec<u8>> {
        let len = self.u32()? as usize;
        let v = self.buf.get(self.pos..self.pos + len)?.to_vec();
        self.pos += len;
        Some(v)
    }
}

pub fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_be_bytes());
}

pub fn put_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_be_bytes());
}

pub fn put_f64(out: &mut Vec<u8>, v: f64) {
    out.extend_from_slice(&v.to_bits().to_be_bytes());
}

pub fn put_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    put_u32(out, bytes.len() as u32);
    out.extend_from_slice(bytes);
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::quickcheck;

    #[test]
    fn meta_roundtrip_all_tags() {
        for tag in [
            ValueTag::Str,
            ValueTag::List,
            ValueTag::Hash,
            ValueTag::Set,
            ValueTag::ZSet,
            ValueTag::Stream,
            ValueTag::Json,
            ValueTag::Hll,
            ValueTag::Series,
        ] {
            let mut meta = Meta::new(tag);
            meta.expire_at = 123456;
            let decoded = Meta::decode(&meta.encode()).unwrap();
            assert_eq!(decoded, meta);
        }
    }

    #[test]
    fn score_order_examples() {
        let values = [
            f64::NEG_INFINITY,
            -1e300,
            -2.5,
            -0.0,
            0.0,
            1e-300,
            2.5,
            1e300,
            f64::INFINITY,
        ];
        for pair in values.windows(2) {
            assert!(
                encode_score(pair[0]) <= encode_score(pair[1]),
                "{} should sort before {}",
                pair[0],
                pair[1]
            );
        }
    }

    quickcheck! {
        fn score_encoding_preserves_order(a: f64, b: f64) -> bool {
            if a.is_nan() || b.is_nan() {
                return true;
            }
            let (ea, eb) = (encode_score(a), encode_score(b));
            if a < b { ea < eb } else if a > b { ea > eb } else { true }
        }

        fn score_roundtrip(a: f64) -> bool {
            if a.is_nan() {
                return true;
            }
            decode_score(&encode_score(a)) == a
        }
    }

    #[test]
    fn elem_prefix_frames_key_length() {
        let p = elem_prefix(KIND_LIST, b"mylist");
        assert_eq!(p[0], KIND_LIST);
        assert_eq!(&p[1..5], &(6u32).to_be_bytes());
        assert_eq!(&p[5..], b"mylist");
        let full = list_elem_key(b"mylist", LIST_BIAS);
        assert!(full.starts_with(&p));
    }
}
