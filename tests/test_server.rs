//! End-to-end tests over a real TCP connection: data types, expiration,
//! transactions, blocking reads, pub/sub, scanning, DUMP/RESTORE and the
//! cluster redirection path.

mod support;

use std::thread;
use std::time::{Duration, Instant};

use sledis::resp::Frame;
use support::{bulk, int, start_server, Client};

#[test]
fn ping_echo_and_binary_safe_strings() {
    let ts = start_server();
    let mut c = Client::connect(ts.addr);
    assert_eq!(c.cmd(&[b"PING"]), Frame::Simple("PONG".into()));
    assert_eq!(c.cmd(&[b"ECHO", b"hello"]), Frame::Bulk(b"hello".to_vec()));

    let payload = b"\x00\x01\r\nbinary\xff";
    assert_eq!(c.cmd(&[b"SET", b"k", payload]), Frame::Simple("OK".into()));
    assert_eq!(c.cmd(&[b"GET", b"k"]), Frame::Bulk(payload.to_vec()));
    assert_eq!(int(&c.cmd(&[b"STRLEN", b"k"])), payload.len() as i64);
}

#[test]
fn inline_commands_work() {
    let ts = start_server();
    let mut c = Client::connect(ts.addr);
    use std::io::Write;
    let mut stream = std::net::TcpStream::connect(ts.addr).unwrap();
    stream.write_all(b"PING\r\n").unwrap();
    use std::io::Read;
    let mut reply = [0u8; 7];
    stream.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"+PONG\r\n");
    // the framed connection still behaves
    assert_eq!(c.cmd(&[b"PING"]), Frame::Simple("PONG".into()));
}

#[test]
fn wrong_type_and_unknown_command_errors() {
    let ts = start_server();
    let mut c = Client::connect(ts.addr);
    c.cmd(&[b"LPUSH", b"mylist", b"a"]);
    match c.cmd(&[b"GET", b"mylist"]) {
        Frame::Error(e) => assert!(e.starts_with("WRONGTYPE"), "{}", e),
        other => panic!("expected error, got {:?}", other),
    }
    match c.cmd(&[b"NOPE", b"x"]) {
        Frame::Error(e) => assert!(e.contains("unknown command"), "{}", e),
        other => panic!("expected error, got {:?}", other),
    }
    match c.cmd(&[b"GET"]) {
        Frame::Error(e) => assert!(e.contains("wrong number of arguments"), "{}", e),
        other => panic!("expected error, got {:?}", other),
    }
}

#[test]
fn ttl_precision() {
    let ts = start_server();
    let mut c = Client::connect(ts.addr);
    assert_eq!(
        c.cmd(&[b"SET", b"k", b"v", b"PX", b"100"]),
        Frame::Simple("OK".into())
    );
    thread::sleep(Duration::from_millis(50));
    assert_eq!(c.cmd(&[b"GET", b"k"]), Frame::Bulk(b"v".to_vec()));
    thread::sleep(Duration::from_millis(80));
    assert_eq!(c.cmd(&[b"GET", b"k"]), Frame::Null);
    assert_eq!(int(&c.cmd(&[b"TTL", b"k"])), -2);
    assert_eq!(int(&c.cmd(&[b"EXISTS", b"k"])), 0);
}

#[test]
fn expire_and_persist() {
    let ts = start_server();
    let mut c = Client::connect(ts.addr);
    c.cmd(&[b"SET", b"k", b"v"]);
    assert_eq!(int(&c.cmd(&[b"TTL", b"k"])), -1);
    assert_eq!(int(&c.cmd(&[b"EXPIRE", b"k", b"100"])), 1);
    let ttl = int(&c.cmd(&[b"TTL", b"k"]));
    assert!(ttl > 95 && ttl <= 100, "ttl {}", ttl);
    assert_eq!(int(&c.cmd(&[b"PERSIST", b"k"])), 1);
    assert_eq!(int(&c.cmd(&[b"TTL", b"k"])), -1);
}

#[test]
fn lists_and_negative_indices() {
    let ts = start_server();
    let mut c = Client::connect(ts.addr);
    assert_eq!(int(&c.cmd(&[b"RPUSH", b"l", b"a", b"b", b"c", b"d"])), 4);
    assert_eq!(int(&c.cmd(&[b"LPUSH", b"l", b"z"])), 5);
    let range = c.cmd(&[b"LRANGE", b"l", b"0", b"-1"]);
    match range {
        Frame::Array(items) => {
            let got: Vec<Vec<u8>> = items.iter().map(bulk).collect();
            assert_eq!(got, vec![b"z".to_vec(), b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]);
        }
        other => panic!("{:?}", other),
    }
    assert_eq!(c.cmd(&[b"LINDEX", b"l", b"-1"]), Frame::Bulk(b"d".to_vec()));
    assert_eq!(int(&c.cmd(&[b"LREM", b"l", b"0", b"b"])), 1);
    assert_eq!(c.cmd(&[b"LPOP", b"l"]), Frame::Bulk(b"z".to_vec()));
    assert_eq!(c.cmd(&[b"RPOP", b"l"]), Frame::Bulk(b"d".to_vec()));
    // draining the list removes the key
    c.cmd(&[b"LPOP", b"l"]);
    c.cmd(&[b"LPOP", b"l"]);
    assert_eq!(int(&c.cmd(&[b"EXISTS", b"l"])), 0);
    assert_eq!(c.cmd(&[b"TYPE", b"l"]), Frame::Simple("none".into()));
}

#[test]
fn hashes_round_trip() {
    let ts = start_server();
    let mut c = Client::connect(ts.addr);
    assert_eq!(int(&c.cmd(&[b"HSET", b"h", b"f1", b"v1", b"f2", b"v2"])), 2);
    assert_eq!(int(&c.cmd(&[b"HSET", b"h", b"f1", b"v1b"])), 0);
    assert_eq!(c.cmd(&[b"HGET", b"h", b"f1"]), Frame::Bulk(b"v1b".to_vec()));
    assert_eq!(int(&c.cmd(&[b"HLEN", b"h"])), 2);
    assert_eq!(int(&c.cmd(&[b"HINCRBY", b"h", b"n", b"7"])), 7);
    assert_eq!(int(&c.cmd(&[b"HDEL", b"h", b"f1", b"f2", b"n"])), 3);
    assert_eq!(int(&c.cmd(&[b"EXISTS", b"h"])), 0);
}

#[test]
fn zset_ordering_invariant() {
    let ts = start_server();
    let mut c = Client::connect(ts.addr);
    c.cmd(&[b"ZADD", b"z", b"2", b"bbb", b"1", b"ccc", b"2", b"aaa", b"-1", b"neg"]);
    let reply = c.cmd(&[b"ZRANGE", b"z", b"0", b"-1", b"WITHSCORES"]);
    let Frame::Array(items) = reply else { panic!() };
    let flat: Vec<Vec<u8>> = items.iter().map(bulk).collect();
    // non-decreasing score order, lexicographic members break ties
    assert_eq!(
        flat,
        vec![
            b"neg".to_vec(), b"-1".to_vec(),
            b"ccc".to_vec(), b"1".to_vec(),
            b"aaa".to_vec(), b"2".to_vec(),
            b"bbb".to_vec(), b"2".to_vec(),
        ]
    );
    assert_eq!(c.cmd(&[b"ZSCORE", b"z", b"aaa"]), Frame::Bulk(b"2".to_vec()));
    assert_eq!(int(&c.cmd(&[b"ZRANK", b"z", b"bbb"])), 3);
    // score range with exclusive bound
    let reply = c.cmd(&[b"ZRANGEBYSCORE", b"z", b"(1", b"+inf"]);
    let Frame::Array(items) = reply else { panic!() };
    assert_eq!(items.len(), 2);
}

#[test]
fn zscore_is_bit_exact() {
    let ts = start_server();
    let mut c = Client::connect(ts.addr);
    let score = b"3.141592653589793";
    c.cmd(&[b"ZADD", b"z", score, b"pi"]);
    let got = bulk(&c.cmd(&[b"ZSCORE", b"z", b"pi"]));
    let parsed: f64 = std::str::from_utf8(&got).unwrap().parse().unwrap();
    assert_eq!(parsed.to_bits(), std::f64::consts::PI.to_bits());
}

#[test]
fn set_operations() {
    let ts = start_server();
    let mut c = Client::connect(ts.addr);
    c.cmd(&[b"SADD", b"s1", b"a", b"b", b"c"]);
    c.cmd(&[b"SADD", b"s2", b"b", b"c", b"d"]);
    assert_eq!(int(&c.cmd(&[b"SINTERSTORE", b"dst", b"s1", b"s2"])), 2);
    assert_eq!(int(&c.cmd(&[b"SCARD", b"dst"])), 2);
    assert_eq!(int(&c.cmd(&[b"SISMEMBER", b"dst", b"b"])), 1);
    assert_eq!(int(&c.cmd(&[b"SISMEMBER", b"dst", b"a"])), 0);
    let Frame::Array(diff) = c.cmd(&[b"SDIFF", b"s1", b"s2"]) else { panic!() };
    assert_eq!(diff.len(), 1);
    assert_eq!(bulk(&diff[0]), b"a".to_vec());
}

#[test]
fn incr_semantics() {
    let ts = start_server();
    let mut c = Client::connect(ts.addr);
    assert_eq!(int(&c.cmd(&[b"INCR", b"n"])), 1);
    assert_eq!(int(&c.cmd(&[b"INCRBY", b"n", b"41"])), 42);
    c.cmd(&[b"SET", b"s", b"notanumber"]);
    match c.cmd(&[b"INCR", b"s"]) {
        Frame::Error(e) => assert!(e.contains("not an integer"), "{}", e),
        other => panic!("{:?}", other),
    }
    c.cmd(&[b"SET", b"big", b"9223372036854775807"]);
    match c.cmd(&[b"INCR", b"big"]) {
        Frame::Error(_) => {}
        other => panic!("expected overflow error, got {:?}", other),
    }
}

#[test]
fn transaction_basics_and_watch_conflict() {
    let ts = start_server();
    let mut a = Client::connect(ts.addr);
    let mut b = Client::connect(ts.addr);

    // plain transaction
    assert_eq!(a.cmd(&[b"MULTI"]), Frame::Simple("OK".into()));
    assert_eq!(a.cmd(&[b"SET", b"t", b"1"]), Frame::Simple("QUEUED".into()));
    assert_eq!(a.cmd(&[b"INCR", b"t"]), Frame::Simple("QUEUED".into()));
    let Frame::Array(results) = a.cmd(&[b"EXEC"]) else { panic!() };
    assert_eq!(results.len(), 2);
    assert_eq!(int(&results[1]), 2);

    // WATCH conflict aborts
    a.cmd(&[b"SET", b"k", b"0"]);
    assert_eq!(a.cmd(&[b"WATCH", b"k"]), Frame::Simple("OK".into()));
    assert_eq!(a.cmd(&[b"MULTI"]), Frame::Simple("OK".into()));
    assert_eq!(a.cmd(&[b"INCR", b"k"]), Frame::Simple("QUEUED".into()));
    assert_eq!(b.cmd(&[b"SET", b"k", b"42"]), Frame::Simple("OK".into()));
    assert_eq!(a.cmd(&[b"EXEC"]), Frame::NullArray);
    assert_eq!(a.cmd(&[b"GET", b"k"]), Frame::Bulk(b"42".to_vec()));
}

#[test]
fn queued_arity_error_aborts_exec() {
    let ts = start_server();
    let mut c = Client::connect(ts.addr);
    c.cmd(&[b"MULTI"]);
    match c.cmd(&[b"SET", b"only-one-arg"]) {
        Frame::Error(e) => assert!(e.contains("wrong number of arguments"), "{}", e),
        other => panic!("{:?}", other),
    }
    c.cmd(&[b"GET", b"x"]); // still queues fine
    match c.cmd(&[b"EXEC"]) {
        Frame::Error(e) => assert!(e.starts_with("EXECABORT"), "{}", e),
        other => panic!("{:?}", other),
    }
}

#[test]
fn errors_inside_exec_do_not_stop_the_batch() {
    let ts = start_server();
    let mut c = Client::connect(ts.addr);
    c.cmd(&[b"LPUSH", b"wrong", b"x"]);
    c.cmd(&[b"MULTI"]);
    c.cmd(&[b"INCR", b"wrong"]); // wrong type, fails at exec time
    c.cmd(&[b"SET", b"after", b"yes"]);
    let Frame::Array(results) = c.cmd(&[b"EXEC"]) else { panic!() };
    assert!(matches!(results[0], Frame::Error(_)));
    assert_eq!(results[1], Frame::Simple("OK".into()));
    assert_eq!(c.cmd(&[b"GET", b"after"]), Frame::Bulk(b"yes".to_vec()));
}

#[test]
fn blocking_pop_unblocks_on_push() {
    let ts = start_server();
    let addr = ts.addr;
    let waiter = thread::spawn(move || {
        let mut a = Client::connect(addr);
        let started = Instant::now();
        let reply = a.cmd(&[b"BLPOP", b"mylist", b"0"]);
        (reply, started.elapsed())
    });
    thread::sleep(Duration::from_millis(150)); // let BLPOP park
    let mut b = Client::connect(ts.addr);
    assert_eq!(int(&b.cmd(&[b"RPUSH", b"mylist", b"hello"])), 1);
    let (reply, _elapsed) = waiter.join().unwrap();
    let Frame::Array(parts) = reply else { panic!("{:?}", reply) };
    assert_eq!(bulk(&parts[0]), b"mylist".to_vec());
    assert_eq!(bulk(&parts[1]), b"hello".to_vec());
    // consumed by the waiter
    assert_eq!(int(&b.cmd(&[b"LLEN", b"mylist"])), 0);
}

#[test]
fn blocking_pop_times_out() {
    let ts = start_server();
    let mut c = Client::connect(ts.addr);
    let started = Instant::now();
    assert_eq!(c.cmd(&[b"BLPOP", b"missing", b"0.1"]), Frame::NullArray);
    assert!(started.elapsed() >= Duration::from_millis(100));
}

#[test]
fn pipeline_parity() {
    let ts = start_server();
    let mut c = Client::connect(ts.addr);
    let pipelined = c.pipeline(&[
        &[b"SET", b"p1", b"a"],
        &[b"SET", b"p2", b"b"],
        &[b"GET", b"p1"],
        &[b"GET", b"p2"],
        &[b"DEL", b"p1", b"p2"],
    ]);
    let mut d = Client::connect(ts.addr);
    let sequential = vec![
        d.cmd(&[b"SET", b"p1", b"a"]),
        d.cmd(&[b"SET", b"p2", b"b"]),
        d.cmd(&[b"GET", b"p1"]),
        d.cmd(&[b"GET", b"p2"]),
        d.cmd(&[b"DEL", b"p1", b"p2"]),
    ];
    assert_eq!(pipelined, sequential);
}

#[test]
fn pubsub_delivery_and_counts() {
    let ts = start_server();
    let mut subscriber = Client::connect(ts.addr);
    let Frame::Array(confirm) = subscriber.cmd(&[b"SUBSCRIBE", b"news"]) else { panic!() };
    assert_eq!(bulk(&confirm[0]), b"subscribe".to_vec());
    assert_eq!(int(&confirm[2]), 1);

    let mut publisher = Client::connect(ts.addr);
    assert_eq!(int(&publisher.cmd(&[b"PUBLISH", b"news", b"flash"])), 1);
    let Frame::Array(message) = subscriber.read_reply() else { panic!() };
    assert_eq!(bulk(&message[0]), b"message".to_vec());
    assert_eq!(bulk(&message[1]), b"news".to_vec());
    assert_eq!(bulk(&message[2]), b"flash".to_vec());

    // subscriber mode restricts the command set
    match subscriber.cmd(&[b"GET", b"x"]) {
        Frame::Error(e) => assert!(e.contains("only (P)SUBSCRIBE"), "{}", e),
        other => panic!("{:?}", other),
    }
    assert_eq!(int(&publisher.cmd(&[b"PUBLISH", b"nobody", b"x"])), 0);
}

#[test]
fn scan_walks_everything_once() {
    let ts = start_server();
    let mut c = Client::connect(ts.addr);
    for i in 0..50 {
        c.cmd(&[b"SET", format!("key:{:02}", i).as_bytes(), b"v"]);
    }
    let mut cursor = b"0".to_vec();
    let mut seen = std::collections::HashSet::new();
    loop {
        let Frame::Array(reply) = c.cmd(&[b"SCAN", &cursor, b"COUNT", b"7"]) else { panic!() };
        cursor = bulk(&reply[0]);
        let Frame::Array(keys) = &reply[1] else { panic!() };
        for key in keys {
            assert!(seen.insert(bulk(key)), "key seen twice");
        }
        if cursor == b"0" {
            break;
        }
    }
    assert_eq!(seen.len(), 50);
}

#[test]
fn keys_glob_and_type_filter() {
    let ts = start_server();
    let mut c = Client::connect(ts.addr);
    c.cmd(&[b"SET", b"user:1", b"a"]);
    c.cmd(&[b"SET", b"user:2", b"b"]);
    c.cmd(&[b"LPUSH", b"queue", b"x"]);
    let Frame::Array(keys) = c.cmd(&[b"KEYS", b"user:*"]) else { panic!() };
    assert_eq!(keys.len(), 2);
    let Frame::Array(reply) = c.cmd(&[b"SCAN", b"0", b"TYPE", b"list"]) else { panic!() };
    let Frame::Array(keys) = &reply[1] else { panic!() };
    assert_eq!(keys.len(), 1);
    assert_eq!(bulk(&keys[0]), b"queue".to_vec());
}

#[test]
fn dump_restore_is_indistinguishable() {
    let ts = start_server();
    let mut c = Client::connect(ts.addr);
    c.cmd(&[b"RPUSH", b"src", b"one", b"two", b"three"]);
    let payload = bulk(&c.cmd(&[b"DUMP", b"src"]));
    assert_eq!(int(&c.cmd(&[b"DEL", b"src"])), 1);
    assert_eq!(
        c.cmd(&[b"RESTORE", b"src", b"0", &payload]),
        Frame::Simple("OK".into())
    );
    assert_eq!(c.cmd(&[b"TYPE", b"src"]), Frame::Simple("list".into()));
    assert_eq!(int(&c.cmd(&[b"LLEN", b"src"])), 3);
    let Frame::Array(items) = c.cmd(&[b"LRANGE", b"src", b"0", b"-1"]) else { panic!() };
    assert_eq!(bulk(&items[0]), b"one".to_vec());
    assert_eq!(bulk(&items[2]), b"three".to_vec());
    // restoring over an existing key needs REPLACE
    match c.cmd(&[b"RESTORE", b"src", b"0", &payload]) {
        Frame::Error(e) => assert!(e.starts_with("BUSYKEY"), "{}", e),
        other => panic!("{:?}", other),
    }
}

#[test]
fn stream_consumer_group_flow() {
    let ts = start_server();
    let mut c = Client::connect(ts.addr);
    let id1 = bulk(&c.cmd(&[b"XADD", b"s", b"*", b"f", b"1"]));
    let id2 = bulk(&c.cmd(&[b"XADD", b"s", b"*", b"f", b"2"]));
    assert_ne!(id1, id2);
    assert_eq!(int(&c.cmd(&[b"XLEN", b"s"])), 2);
    assert_eq!(c.cmd(&[b"XGROUP", b"CREATE", b"s", b"g", b"0"]), Frame::Simple("OK".into()));

    // first read delivers id1 and parks it in the PEL
    let Frame::Array(keys) = c.cmd(&[
        b"XREADGROUP", b"GROUP", b"g", b"c1", b"COUNT", b"1", b"STREAMS", b"s", b">",
    ]) else { panic!() };
    let Frame::Array(key_entry) = &keys[0] else { panic!() };
    let Frame::Array(entries) = &key_entry[1] else { panic!() };
    let Frame::Array(first) = &entries[0] else { panic!() };
    assert_eq!(bulk(&first[0]), id1);

    let Frame::Array(pending) = c.cmd(&[b"XPENDING", b"s", b"g"]) else { panic!() };
    assert_eq!(int(&pending[0]), 1);

    assert_eq!(int(&c.cmd(&[b"XACK", b"s", b"g", &id1])), 1);
    let Frame::Array(pending) = c.cmd(&[b"XPENDING", b"s", b"g"]) else { panic!() };
    assert_eq!(int(&pending[0]), 0);

    // next group read hands out id2
    let Frame::Array(keys) = c.cmd(&[
        b"XREADGROUP", b"GROUP", b"g", b"c1", b"COUNT", b"1", b"STREAMS", b"s", b">",
    ]) else { panic!() };
    let Frame::Array(key_entry) = &keys[0] else { panic!() };
    let Frame::Array(entries) = &key_entry[1] else { panic!() };
    let Frame::Array(second) = &entries[0] else { panic!() };
    assert_eq!(bulk(&second[0]), id2);
}

#[test]
fn stream_xrange_roundtrip() {
    let ts = start_server();
    let mut c = Client::connect(ts.addr);
    c.cmd(&[b"XADD", b"s", b"5-1", b"field", b"value"]);
    let Frame::Array(entries) = c.cmd(&[b"XRANGE", b"s", b"5-1", b"5-1"]) else { panic!() };
    assert_eq!(entries.len(), 1);
    let Frame::Array(entry) = &entries[0] else { panic!() };
    assert_eq!(bulk(&entry[0]), b"5-1".to_vec());
    let Frame::Array(fields) = &entry[1] else { panic!() };
    assert_eq!(bulk(&fields[0]), b"field".to_vec());
    assert_eq!(bulk(&fields[1]), b"value".to_vec());
    // monotonicity is enforced
    match c.cmd(&[b"XADD", b"s", b"4-1", b"f", b"v"]) {
        Frame::Error(e) => assert!(e.contains("equal or smaller"), "{}", e),
        other => panic!("{:?}", other),
    }
}

#[test]
fn json_documents() {
    let ts = start_server();
    let mut c = Client::connect(ts.addr);
    assert_eq!(
        c.cmd(&[b"JSON.SET", b"doc", b"$", br#"{"user":{"name":"ada","tags":["a"]},"n":1}"#]),
        Frame::Simple("OK".into())
    );
    assert_eq!(
        bulk(&c.cmd(&[b"JSON.GET", b"doc", b"$.user.name"])),
        br#""ada""#.to_vec()
    );
    assert_eq!(int(&c.cmd(&[b"JSON.ARRAPPEND", b"doc", b"$.user.tags", b"\"b\""])), 2);
    assert_eq!(bulk(&c.cmd(&[b"JSON.NUMINCRBY", b"doc", b"$.n", b"4"])), b"5".to_vec());
    assert_eq!(bulk(&c.cmd(&[b"JSON.TYPE", b"doc", b"$.user"])), b"object".to_vec());
    assert_eq!(int(&c.cmd(&[b"JSON.DEL", b"doc", b"$.user.tags[0]"])), 1);
    assert_eq!(int(&c.cmd(&[b"JSON.ARRLEN", b"doc", b"$.user.tags"])), 1);
    assert_eq!(c.cmd(&[b"TYPE", b"doc"]), Frame::Simple("ReJSON-RL".into()));
}

#[test]
fn bitmaps_and_bitfield() {
    let ts = start_server();
    let mut c = Client::connect(ts.addr);
    assert_eq!(int(&c.cmd(&[b"SETBIT", b"bits", b"7", b"1"])), 0);
    assert_eq!(int(&c.cmd(&[b"GETBIT", b"bits", b"7"])), 1);
    assert_eq!(int(&c.cmd(&[b"GETBIT", b"bits", b"6"])), 0);
    assert_eq!(int(&c.cmd(&[b"BITCOUNT", b"bits"])), 1);
    let Frame::Array(results) = c.cmd(&[
        b"BITFIELD", b"bf", b"SET", b"u8", b"0", b"255", b"INCRBY", b"u8", b"0", b"10",
    ]) else { panic!() };
    assert_eq!(int(&results[0]), 0);
    assert_eq!(int(&results[1]), 9); // wrap is the default overflow
    let Frame::Array(results) = c.cmd(&[
        b"BITFIELD", b"bf", b"OVERFLOW", b"FAIL", b"INCRBY", b"u8", b"0", b"250",
    ]) else { panic!() };
    assert_eq!(results[0], Frame::Null);
}

#[test]
fn hyperloglog_estimates() {
    let ts = start_server();
    let mut c = Client::connect(ts.addr);
    for i in 0..1000u32 {
        c.cmd(&[b"PFADD", b"hll", format!("item-{}", i).as_bytes()]);
    }
    let estimate = int(&c.cmd(&[b"PFCOUNT", b"hll"]));
    assert!((estimate - 1000).abs() < 60, "estimate {}", estimate);
    c.cmd(&[b"PFADD", b"hll2", b"item-1", b"other"]);
    let merged = int(&c.cmd(&[b"PFCOUNT", b"hll", b"hll2"]));
    assert!(merged >= estimate, "merged {} < {}", merged, estimate);
    assert_eq!(c.cmd(&[b"PFMERGE", b"dst", b"hll", b"hll2"]), Frame::Simple("OK".into()));
    assert_eq!(c.cmd(&[b"TYPE", b"hll"]), Frame::Simple("string".into()));
}

#[test]
fn geo_distance_and_search() {
    let ts = start_server();
    let mut c = Client::connect(ts.addr);
    assert_eq!(
        int(&c.cmd(&[
            b"GEOADD", b"places",
            b"13.361389", b"38.115556", b"Palermo",
            b"15.087269", b"37.502669", b"Catania",
        ])),
        2
    );
    let dist = bulk(&c.cmd(&[b"GEODIST", b"places", b"Palermo", b"Catania", b"km"]));
    let km: f64 = std::str::from_utf8(&dist).unwrap().parse().unwrap();
    assert!((km - 166.27).abs() < 2.0, "distance {}", km);
    let Frame::Array(found) = c.cmd(&[
        b"GEOSEARCH", b"places", b"FROMLONLAT", b"15", b"37", b"BYRADIUS", b"200", b"km", b"ASC",
    ]) else { panic!() };
    assert_eq!(found.len(), 2);
    assert_eq!(bulk(&found[0]), b"Catania".to_vec());
    assert_eq!(c.cmd(&[b"TYPE", b"places"]), Frame::Simple("zset".into()));
}

#[test]
fn time_series_basics() {
    let ts = start_server();
    let mut c = Client::connect(ts.addr);
    assert_eq!(c.cmd(&[b"TS.CREATE", b"temps", b"DUPLICATE_POLICY", b"LAST"]), Frame::Simple("OK".into()));
    assert_eq!(int(&c.cmd(&[b"TS.ADD", b"temps", b"1000", b"20.5"])), 1000);
    assert_eq!(int(&c.cmd(&[b"TS.ADD", b"temps", b"2000", b"21.5"])), 2000);
    assert_eq!(int(&c.cmd(&[b"TS.ADD", b"temps", b"2000", b"22.0"])), 2000); // LAST wins
    let Frame::Array(last) = c.cmd(&[b"TS.GET", b"temps"]) else { panic!() };
    assert_eq!(int(&last[0]), 2000);
    assert_eq!(bulk(&last[1]), b"22".to_vec());
    let Frame::Array(range) = c.cmd(&[
        b"TS.RANGE", b"temps", b"-", b"+", b"AGGREGATION", b"avg", b"10000",
    ]) else { panic!() };
    assert_eq!(range.len(), 1);
}

#[test]
fn sort_with_by_and_get() {
    let ts = start_server();
    let mut c = Client::connect(ts.addr);
    c.cmd(&[b"RPUSH", b"ids", b"3", b"1", b"2"]);
    let Frame::Array(sorted) = c.cmd(&[b"SORT", b"ids"]) else { panic!() };
    let got: Vec<Vec<u8>> = sorted.iter().map(bulk).collect();
    assert_eq!(got, vec![b"1".to_vec(), b"2".to_vec(), b"3".to_vec()]);

    c.cmd(&[b"SET", b"weight_1", b"30"]);
    c.cmd(&[b"SET", b"weight_2", b"20"]);
    c.cmd(&[b"SET", b"weight_3", b"10"]);
    let Frame::Array(sorted) = c.cmd(&[b"SORT", b"ids", b"BY", b"weight_*"]) else { panic!() };
    let got: Vec<Vec<u8>> = sorted.iter().map(bulk).collect();
    assert_eq!(got, vec![b"3".to_vec(), b"2".to_vec(), b"1".to_vec()]);
    assert_eq!(int(&c.cmd(&[b"SORT", b"ids", b"ALPHA", b"STORE", b"out"])), 3);
    assert_eq!(c.cmd(&[b"TYPE", b"out"]), Frame::Simple("list".into()));
}

#[test]
fn cluster_keyslot_and_redirection() {
    let ts = start_server();
    let mut c = Client::connect(ts.addr);
    assert_eq!(int(&c.cmd(&[b"CLUSTER", b"KEYSLOT", b"foo"])), 12182);
    assert_eq!(
        int(&c.cmd(&[b"CLUSTER", b"KEYSLOT", b"{user1}.name"])),
        int(&c.cmd(&[b"CLUSTER", b"KEYSLOT", b"{user1}.age"]))
    );

    // without cluster mode everything is served locally
    assert_eq!(c.cmd(&[b"SET", b"foo", b"bar"]), Frame::Simple("OK".into()));

    assert_eq!(c.cmd(&[b"CONFIG", b"SET", b"cluster-enabled", b"yes"]), Frame::Simple("OK".into()));
    assert_eq!(c.cmd(&[b"CLUSTER", b"MEET", b"10.0.0.9", b"7777"]), Frame::Simple("OK".into()));
    // find the met node's id in the NODES rendering
    let nodes = String::from_utf8(bulk(&c.cmd(&[b"CLUSTER", b"NODES"]))).unwrap();
    let other_id = nodes
        .lines()
        .find(|line| line.contains("10.0.0.9:7777"))
        .map(|line| line.split_whitespace().next().unwrap().to_string())
        .expect("met node rendered");
    assert_eq!(
        c.cmd(&[b"CLUSTER", b"SETSLOT", b"12182", b"NODE", other_id.as_bytes()]),
        Frame::Simple("OK".into())
    );
    match c.cmd(&[b"SET", b"foo", b"again"]) {
        Frame::Error(e) => assert_eq!(e, "MOVED 12182 10.0.0.9:7777"),
        other => panic!("{:?}", other),
    }
    // keys on slots we still own keep working
    assert_eq!(c.cmd(&[b"SET", b"bar", b"ok"]), Frame::Simple("OK".into()));
}

#[test]
fn info_and_admin_surface() {
    let ts = start_server();
    let mut c = Client::connect(ts.addr);
    c.cmd(&[b"SET", b"k", b"v"]);
    let info = String::from_utf8(bulk(&c.cmd(&[b"INFO"]))).unwrap();
    for key in [
        "role:master",
        "connected_slaves:0",
        "master_replid:",
        "master_repl_offset:",
        "cluster_enabled:0",
    ] {
        assert!(info.contains(key), "INFO missing {}", key);
    }
    assert_eq!(int(&c.cmd(&[b"DBSIZE"])), 1);
    assert_eq!(c.cmd(&[b"SELECT", b"3"]), Frame::Simple("OK".into()));
    assert_eq!(int(&c.cmd(&[b"WAIT", b"1", b"100"])), 0);
    let Frame::Array(time) = c.cmd(&[b"TIME"]) else { panic!() };
    assert_eq!(time.len(), 2);
    assert_eq!(c.cmd(&[b"FLUSHDB"]), Frame::Simple("OK".into()));
    assert_eq!(int(&c.cmd(&[b"DBSIZE"])), 0);
    assert!(int(&c.cmd(&[b"CLIENT", b"ID"])) > 0);
}

#[test]
fn auth_gates_commands() {
    let ts = support::start_server_with(|config| {
        config.password = Some("sesame".to_string());
    });
    let mut c = Client::connect(ts.addr);
    match c.cmd(&[b"GET", b"x"]) {
        Frame::Error(e) => assert!(e.starts_with("NOAUTH"), "{}", e),
        other => panic!("{:?}", other),
    }
    match c.cmd(&[b"AUTH", b"wrong"]) {
        Frame::Error(e) => assert!(e.starts_with("WRONGPASS"), "{}", e),
        other => panic!("{:?}", other),
    }
    assert_eq!(c.cmd(&[b"AUTH", b"sesame"]), Frame::Simple("OK".into()));
    assert_eq!(c.cmd(&[b"PING"]), Frame::Simple("PONG".into()));
}
