//! RESP2 framing: encode replies, decode pipelined commands and frames from
//! a byte buffer, with the inline-command fallback for hand-typed clients.

use thiserror::Error;

pub const DEFAULT_MAX_BULK_LEN: usize = 512 * 1024 * 1024;
pub const DEFAULT_MAX_MULTIBULK_LEN: usize = 1024 * 1024;
pub const MAX_INLINE_LEN: usize = 64 * 1024;

#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub max_bulk_len: usize,
    pub max_multibulk_len: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            max_bulk_len: DEFAULT_MAX_BULK_LEN,
            max_multibulk_len: DEFAULT_MAX_MULTIBULK_LEN,
        }
    }
}

/// A framing violation. The connection is closed after reporting it.
#[derive(Debug, Error)]
#[error("Protocol error: {0}")]
pub struct ProtocolError(pub String);

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Vec<u8>),
    Null,
    Array(Vec<Frame>),
    NullArray,
}

impl Frame {
    pub fn ok() -> Frame {
        Frame::Simple("OK".into())
    }

    pub fn bulk(bytes: impl Into<Vec<u8>>) -> Frame {
        Frame::Bulk(bytes.into())
    }

    pub fn from_opt(v: Option<Vec<u8>>) -> Frame {
        match v {
            Some(b) => Frame::Bulk(b),
            None => Frame::Null,
        }
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Frame::Simple(s) => {
                out.push(b'+');
                out.extend_from_slice(s.as_bytes());
                out.extend_from_slice(b"\r\n");
            }
            Frame::Error(s) => {
                out.push(b'-');
                out.extend_from_slice(s.as_bytes());
                out.extend_from_slice(b"\r\n");
            }
            Frame::Integer(n) => {
                out.push(b':');
                out.extend_from_slice(n.to_string().as_bytes());
                out.extend_from_slice(b"\r\n");
            }
            Frame::Bulk(b) => {
                out.push(b'$');
                out.extend_from_slice(b.len().to_string().as_bytes());
                out.extend_from_slice(b"\r\n");
                out.extend_from_slice(b);
                out.extend_from_slice(b"\r\n");
            }
            Frame::Null => out.extend_from_slice(b"$-1\r\n"),
            Frame::Array(items) => {
                out.push(b'*');
                out.extend_from_slice(items.len().to_string().as_bytes());
                out.extend_from_slice(b"\r\n");
                for item in items {
                    item.encode_into(out);
                }
            }
            Frame::NullArray => out.extend_from_slice(b"*-1\r\n"),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }
}

/// Re-encode a command argv as the canonical multibulk form. Used for
/// replication propagation and the replica handshake.
pub fn encode_command(argv: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::new();
    out.push(b'*');
    out.extend_from_slice(argv.len().to_string().as_bytes());
    out.extend_from_slice(b"\r\n");
    for arg in argv {
        out.push(b'$');
        out.extend_from_slice(arg.len().to_string().as_bytes());
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(arg);
        out.extend_from_slice(b"\r\n");
    }
    out
}

fn find_line(buf: &[u8], from: usize) -> Option<(usize, usize)> {
    // returns (line_end_exclusive, next_pos)
    let mut i = from;
    while i < buf.len() {
        if buf[i] == b'\n' {
            let end = if i > from && buf[i - 1] == b'\r' { i - 1 } else { i };
            return Some((end, i + 1));
        }
        i += 1;
    }
    None
}

fn parse_line_i64(line: &[u8]) -> Result<i64, ProtocolError> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| ProtocolError("invalid length".into()))
}

/// Decode one command from `buf`. Returns the argv plus the number of bytes
/// consumed, or `None` when more input is needed. A leading `*` selects the
/// multibulk form; anything else is an inline command split on whitespace.
pub fn parse_command(
    buf: &[u8],
    limits: &Limits,
) -> Result<Option<(Vec<Vec<u8>>, usize)>, ProtocolError> {
    if buf.is_empty() {
        return Ok(None);
    }
    if buf[0] != b'*' {
        // Inline command fallback.
        let Some((end, next)) = find_line(buf, 0) else {
            if buf.len() > MAX_INLINE_LEN {
                return Err(ProtocolError("too big inline request".into()));
            }
            return Ok(None);
        };
        let argv: Vec<Vec<u8>> = buf[..end]
            .split(|&b| b == b' ' || b == b'\t')
            .filter(|part| !part.is_empty())
            .map(|part| part.to_vec())
            .collect();
        return Ok(Some((argv, next)));
    }

    let Some((end, mut pos)) = find_line(buf, 1) else {
        return Ok(None);
    };
    let count = parse_line_i64(&buf[1..end])
        .map_err(|_| ProtocolError("invalid multibulk length".into()))?;
    if count < 0 || count as usize > limits.max_multibulk_len {
        return Err(ProtocolError("invalid multibulk length".into()));
    }
    let mut argv = Vec::with_capacity(count as usize);
    for _ in 0..count {
        if pos >= buf.len() {
            return Ok(None);
        }
        if buf[pos] != b'$' {
            return Err(ProtocolError(format!(
                "expected '$', got '{}'",
                buf[pos] as char
            )));
        }
        let Some((lend, lnext)) = find_line(buf, pos + 1) else {
            return Ok(None);
        };
        let len = parse_line_i64(&buf[pos + 1..lend])
            .map_err(|_| ProtocolError("invalid bulk length".into()))?;
        if len < 0 || len as usize > limits.max_bulk_len {
            return Err(ProtocolError("invalid bulk length".into()));
        }
        let len = len as usize;
        if lnext + len + 2 > buf.len() {
            return Ok(None);
        }
        argv.push(buf[lnext..lnext + len].to_vec());
        if &buf[lnext + len..lnext + len + 2] != b"\r\n" {
            return Err(ProtocolError("bulk not terminated by CRLF".into()));
        }
        pos = lnext + len + 2;
    }
    Ok(Some((argv, pos)))
}

/// Decode one frame of any type. Used by the replica link, which sees
/// simple-string replies and bulk payloads besides command arrays.
pub fn parse_frame(
    buf: &[u8],
    limits: &Limits,
) -> Result<Option<(Frame, usize)>, ProtocolError> {
    if buf.is_empty() {
        return Ok(None);
    }
    match buf[0] {
        b'+' => {
            let Some((end, next)) = find_line(buf, 1) else {
                return Ok(None);
            };
            let s = String::from_utf8_lossy(&buf[1..end]).into_owned();
            Ok(Some((Frame::Simple(s), next)))
        }
        b'-' => {
            let Some((end, next)) = find_line(buf, 1) else {
                return Ok(None);
            };
            let s = String::from_utf8_lossy(&buf[1..end]).into_owned();
            Ok(Some((Frame::Error(s), next)))
        }
        b':' => {
            let Some((end, next)) = find_line(buf, 1) else {
                return Ok(None);
            };
            let n = parse_line_i64(&buf[1..end])?;
            Ok(Some((Frame::Integer(n), next)))
        }
        b'$' => {
            let Some((end, next)) = find_line(buf, 1) else {
                return Ok(None);
            };
            let len = parse_line_i64(&buf[1..end])?;
            if len == -1 {
                return Ok(Some((Frame::Null, next)));
            }
            if len < 0 || len as usize > limits.max_bulk_len {
                return Err(ProtocolError("invalid bulk length".into()));
            }
            let len = len as usize;
            if next + len + 2 > buf.len() {
                return Ok(None);
            }
            if &buf[next + len..next + len + 2] != b"\r\n" {
                return Err(ProtocolError("bulk not terminated by CRLF".into()));
            }
            Ok(Some((Frame::Bulk(buf[next..next + len].to_vec()), next + len + 2)))
        }
        b'*' => {
            let Some((end, mut pos)) = find_line(buf, 1) else {
                return Ok(None);
            };
            let count = parse_line_i64(&buf[1..end])?;
            if count == -1 {
                return Ok(Some((Frame::NullArray, pos)));
            }
            if count < 0 || count as usize > limits.max_multibulk_len {
                return Err(ProtocolError("invalid multibulk length".into()));
            }
            let mut items = Vec::with_capacity(count as usize);
            for _ in 0..count {
                match parse_frame(&buf[pos..], limits)? {
                    Some((item, used)) => {
                        items.push(item);
                        pos += used;
                    }
                    None => return Ok(None),
                }
            }
            Ok(Some((Frame::Array(items), pos)))
        }
        other => Err(ProtocolError(format!(
            "unexpected byte '{}'",
            other as char
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> Limits {
        Limits::default()
    }

    #[test]
    fn multibulk_roundtrip() {
        let argv: Vec<Vec<u8>> = vec![b"SET".to_vec(), b"k".to_vec(), b"v\r\n\0".to_vec()];
        let wire = encode_command(&argv);
        let (parsed, used) = parse_command(&wire, &limits()).unwrap().unwrap();
        assert_eq!(parsed, argv);
        assert_eq!(used, wire.len());
    }

    #[test]
    fn partial_input_returns_none() {
        let wire = encode_command(&[b"GET".to_vec(), b"key".to_vec()]);
        for cut in 0..wire.len() {
            assert!(parse_command(&wire[..cut], &limits()).unwrap().is_none());
        }
    }

    #[test]
    fn pipelined_commands_consume_in_order() {
        let mut wire = encode_command(&[b"PING".to_vec()]);
        wire.extend_from_slice(&encode_command(&[b"ECHO".to_vec(), b"hi".to_vec()]));
        let (first, used) = parse_command(&wire, &limits()).unwrap().unwrap();
        assert_eq!(first[0], b"PING");
        let (second, used2) = parse_command(&wire[used..], &limits()).unwrap().unwrap();
        assert_eq!(second[1], b"hi");
        assert_eq!(used + used2, wire.len());
    }

    #[test]
    fn inline_fallback() {
        let (argv, used) = parse_command(b"PING\r\n", &limits()).unwrap().unwrap();
        assert_eq!(argv, vec![b"PING".to_vec()]);
        assert_eq!(used, 6);
        let (argv, _) = parse_command(b"SET  a   b\r\n", &limits()).unwrap().unwrap();
        assert_eq!(argv.len(), 3);
    }

    #[test]
    fn frame_encode_decode_identity() {
        let cases = vec![
            Frame::Simple("OK".into()),
            Frame::Error("ERR boom".into()),
            Frame::Integer(-42),
            Frame::Bulk(b"\x00\x01binary\r\n".to_vec()),
            Frame::Null,
            Frame::NullArray,
            Frame::Array(vec![Frame::Integer(1), Frame::Bulk(b"x".to_vec()), Frame::Null]),
        ];
        for frame in cases {
            let wire = frame.encode();
            let (parsed, used) = parse_frame(&wire, &limits()).unwrap().unwrap();
            assert_eq!(parsed, frame);
            assert_eq!(used, wire.len());
        }
    }

    #[test]
    fn oversized_bulk_is_rejected() {
        let l = Limits { max_bulk_len: 16, max_multibulk_len: 4 };
        let wire = b"*1\r\n$100\r\n";
        assert!(parse_command(wire, &l).is_err());
        assert!(parse_command(b"*9999\r\n", &l).is_err());
    }
}
