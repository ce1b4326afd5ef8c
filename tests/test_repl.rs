//! Master/replica end-to-end: full resync, streaming propagation, the
//! replica's READONLY gate, and INFO's replication block.

mod support;

use std::thread;
use std::time::{Duration, Instant};

use sledis::resp::Frame;
use support::{bulk, int, start_server, Client};

fn wait_until(deadline: Duration, mut probe: impl FnMut() -> bool) -> bool {
    let end = Instant::now() + deadline;
    while Instant::now() < end {
        if probe() {
            return true;
        }
        thread::sleep(Duration::from_millis(50));
    }
    false
}

#[test]
fn replica_catches_up_and_streams() {
    let master = start_server();
    let replica = start_server();
    let mut m = Client::connect(master.addr);

    // preload before the replica ever connects: exercises full resync
    for i in 0..500 {
        m.cmd(&[b"SET", format!("key:{}", i).as_bytes(), format!("value-{}", i).as_bytes()]);
    }
    assert_eq!(int(&m.cmd(&[b"DBSIZE"])), 500);

    let mut r = Client::connect(replica.addr);
    let master_port = master.addr.port().to_string();
    assert_eq!(
        r.cmd(&[b"REPLICAOF", b"127.0.0.1", master_port.as_bytes()]),
        Frame::Simple("OK".into())
    );

    // snapshot ingested
    let mut probe = Client::connect(replica.addr);
    assert!(
        wait_until(Duration::from_secs(5), || int(&probe.cmd(&[b"DBSIZE"])) == 500),
        "replica never caught up, dbsize={}",
        int(&probe.cmd(&[b"DBSIZE"]))
    );
    for i in (0..500).step_by(71) {
        assert_eq!(
            probe.cmd(&[b"GET", format!("key:{}", i).as_bytes()]),
            Frame::Bulk(format!("value-{}", i).into_bytes())
        );
    }

    // streamed writes flow through after the sync
    m.cmd(&[b"SET", b"streamed", b"yes"]);
    m.cmd(&[b"LPUSH", b"slist", b"a", b"b"]);
    m.cmd(&[b"DEL", b"key:0"]);
    assert!(wait_until(Duration::from_secs(5), || {
        probe.cmd(&[b"GET", b"streamed"]) == Frame::Bulk(b"yes".to_vec())
            && int(&probe.cmd(&[b"LLEN", b"slist"])) == 2
            && int(&probe.cmd(&[b"EXISTS", b"key:0"])) == 0
    }));

    // replicas reject client writes but serve reads
    match probe.cmd(&[b"SET", b"nope", b"x"]) {
        Frame::Error(e) => assert!(e.starts_with("READONLY"), "{}", e),
        other => panic!("{:?}", other),
    }
    assert_eq!(probe.cmd(&[b"GET", b"streamed"]), Frame::Bulk(b"yes".to_vec()));

    // both sides agree in INFO
    let minfo = String::from_utf8(bulk(&m.cmd(&[b"INFO", b"replication"]))).unwrap();
    assert!(minfo.contains("role:master"), "{}", minfo);
    assert!(minfo.contains("connected_slaves:1"), "{}", minfo);
    let rinfo = String::from_utf8(bulk(&probe.cmd(&[b"INFO", b"replication"]))).unwrap();
    assert!(rinfo.contains("role:slave"), "{}", rinfo);
    assert!(rinfo.contains("master_link_status:up"), "{}", rinfo);

    // relative expirations arrive in absolute form and still expire
    m.cmd(&[b"SET", b"short", b"lived", b"PX", b"300"]);
    assert!(wait_until(Duration::from_secs(2), || {
        probe.cmd(&[b"GET", b"short"]) == Frame::Bulk(b"lived".to_vec())
    }));
    assert!(wait_until(Duration::from_secs(2), || {
        probe.cmd(&[b"GET", b"short"]) == Frame::Null
    }));

    // REPLICAOF NO ONE promotes back to a writable master
    assert_eq!(probe.cmd(&[b"REPLICAOF", b"NO", b"ONE"]), Frame::Simple("OK".into()));
    assert_eq!(probe.cmd(&[b"SET", b"nope", b"now-ok"]), Frame::Simple("OK".into()));
}

#[test]
fn spop_replicates_deterministically() {
    let master = start_server();
    let replica = start_server();
    let mut m = Client::connect(master.addr);
    m.cmd(&[b"SADD", b"bag", b"a", b"b", b"c", b"d", b"e"]);

    let mut r = Client::connect(replica.addr);
    let master_port = master.addr.port().to_string();
    r.cmd(&[b"REPLICAOF", b"127.0.0.1", master_port.as_bytes()]);
    let mut probe = Client::connect(replica.addr);
    assert!(wait_until(Duration::from_secs(5), || {
        int(&probe.cmd(&[b"SCARD", b"bag"])) == 5
    }));

    let popped = bulk(&m.cmd(&[b"SPOP", b"bag"]));
    assert!(wait_until(Duration::from_secs(5), || {
        int(&probe.cmd(&[b"SCARD", b"bag"])) == 4
    }));
    // the replica lost exactly the member the master popped
    assert_eq!(int(&probe.cmd(&[b"SISMEMBER", b"bag", &popped])), 0);
}

#[test]
fn master_offset_advances_with_writes() {
    let master = start_server();
    let mut m = Client::connect(master.addr);
    let info = String::from_utf8(bulk(&m.cmd(&[b"INFO", b"replication"]))).unwrap();
    let offset_line = |text: &str| {
        text.lines()
            .find(|l| l.starts_with("master_repl_offset:"))
            .and_then(|l| l.split(':').nth(1))
            .and_then(|v| v.trim().parse::<u64>().ok())
            .unwrap()
    };
    let before = offset_line(&info);
    m.cmd(&[b"SET", b"k", b"v"]);
    let info = String::from_utf8(bulk(&m.cmd(&[b"INFO", b"replication"]))).unwrap();
    assert!(offset_line(&info) > before);
    // reads do not occupy backlog bytes
    m.cmd(&[b"GET", b"k"]);
    let info2 = String::from_utf8(bulk(&m.cmd(&[b"INFO", b"replication"]))).unwrap();
    assert_eq!(offset_line(&info2), offset_line(&info));
}
