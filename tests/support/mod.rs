//! Shared harness for the integration tests: an in-process server on an
//! ephemeral port plus a tiny blocking client speaking RESP2.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use sledis::config::Config;
use sledis::resp::{encode_command, parse_frame, Frame, Limits};
use sledis::server::Server;

pub struct TestServer {
    pub server: Arc<Server>,
    pub addr: SocketAddr,
    // dropped last so the data directory outlives the server
    _dir: TempDir,
}

pub fn start_server() -> TestServer {
    start_server_with(|_| {})
}

pub fn start_server_with(tweak: impl FnOnce(&mut Config)) -> TestServer {
    let dir = TempDir::new().expect("scratch dir");
    let mut config = Config {
        addr: "127.0.0.1:0".to_string(),
        dir: dir.path().to_path_buf(),
        ..Config::default()
    };
    tweak(&mut config);
    let server = Server::new(config).expect("server boots");
    let addr = server.spawn().expect("server binds");
    TestServer {
        server,
        addr,
        _dir: dir,
    }
}

pub struct Client {
    stream: TcpStream,
    buf: Vec<u8>,
}

impl Client {
    pub fn connect(addr: SocketAddr) -> Client {
        let stream = TcpStream::connect(addr).expect("connect");
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();
        Client {
            stream,
            buf: Vec::new(),
        }
    }

    pub fn send(&mut self, args: &[&[u8]]) {
        let argv: Vec<Vec<u8>> = args.iter().map(|a| a.to_vec()).collect();
        self.stream.write_all(&encode_command(&argv)).expect("send");
    }

    pub fn read_reply(&mut self) -> Frame {
        let limits = Limits::default();
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            if let Some((frame, used)) = parse_frame(&self.buf, &limits).expect("valid frame") {
                self.buf.drain(..used);
                return frame;
            }
            assert!(Instant::now() < deadline, "timed out waiting for reply");
            let mut chunk = [0u8; 4096];
            match self.stream.read(&mut chunk) {
                Ok(0) => panic!("connection closed while waiting for reply"),
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    continue;
                }
                Err(e) => panic!("read failed: {}", e),
            }
        }
    }

    pub fn cmd(&mut self, args: &[&[u8]]) -> Frame {
        self.send(args);
        self.read_reply()
    }

    /// Send the whole batch first, then collect the replies in order.
    pub fn pipeline(&mut self, batch: &[&[&[u8]]]) -> Vec<Frame> {
        for args in batch {
            self.send(args);
        }
        batch.iter().map(|_| self.read_reply()).collect()
    }
}

pub fn bulk(frame: &Frame) -> Vec<u8> {
    match frame {
        Frame::Bulk(b) => b.clone(),
        Frame::Simple(s) => s.clone().into_bytes(),
        other => panic!("expected bulk, got {:?}", other),
    }
}

pub fn int(frame: &Frame) -> i64 {
    match frame {
        Frame::Integer(n) => *n,
        other => panic!("expected integer, got {:?}", other),
    }
}
