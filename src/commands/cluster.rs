//! CLUSTER administration: local idempotent updates to the node table and
//! slot map, plus the introspection subcommands clients and drivers use.

use std::sync::Arc;

use crate::client::Session;
use crate::cluster::{key_hash_slot, NodeRole, SLOT_COUNT};
use crate::commands::Reply;
use crate::errors::ServerError;
use crate::resp::Frame;
use crate::server::Server;
use crate::util::parse_u64;

fn parse_slot(raw: &[u8]) -> Result<u16, ServerError> {
    parse_u64(raw)
        .filter(|s| *s < SLOT_COUNT as u64)
        .map(|s| s as u16)
        .ok_or_else(|| ServerError::other("Invalid or out of range slot"))
}

fn map_err(e: String) -> ServerError {
    ServerError::other(e)
}

pub fn cluster_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let sub = argv[1].to_ascii_uppercase();
    match sub.as_slice() {
        b"KEYSLOT" => {
            let key = argv.get(2).ok_or_else(|| ServerError::WrongArity("cluster".into()))?;
            Ok(Frame::Integer(key_hash_slot(key) as i64).into())
        }
        b"MYID" => {
            let cluster = server.cluster.read().unwrap();
            Ok(Frame::bulk(cluster.my_id.as_bytes()).into())
        }
        b"NODES" => {
            let cluster = server.cluster.read().unwrap();
            Ok(Frame::bulk(cluster.render_nodes().into_bytes()).into())
        }
        b"INFO" => {
            let enabled = server.config.read().unwrap().cluster_enabled;
            let cluster = server.cluster.read().unwrap();
            let text = format!(
                "cluster_enabled:{}\r\ncluster_state:ok\r\ncluster_slots_assigned:{}\r\ncluster_known_nodes:{}\r\ncluster_size:{}\r\ncluster_current_epoch:{}\r\n",
                enabled as u8,
                cluster.slots_assigned(),
                cluster.node_count(),
                cluster
                    .nodes()
                    .filter(|n| n.role == NodeRole::Master)
                    .count(),
                cluster.current_epoch,
            );
            Ok(Frame::bulk(text.into_bytes()).into())
        }
        b"SLOTS" => {
            let cluster = server.cluster.read().unwrap();
            let mut out = Vec::new();
            for node in cluster.nodes() {
                if node.role != NodeRole::Master {
                    continue;
                }
                let (host, port) = node
                    .addr
                    .rsplit_once(':')
                    .unwrap_or((node.addr.as_str(), "0"));
                // contiguous runs owned by this node
                let mut start: Option<u16> = None;
                for slot in 0..=SLOT_COUNT {
                    let owned = slot < SLOT_COUNT
                        && cluster.slot_owner_addr(slot).as_deref() == Some(node.addr.as_str());
                    match (owned, start) {
                        (true, None) => start = Some(slot),
                        (false, Some(s)) => {
                            out.push(Frame::Array(vec![
                                Frame::Integer(s as i64),
                                Frame::Integer(slot as i64 - 1),
                                Frame::Array(vec![
                                    Frame::bulk(host.as_bytes()),
                                    Frame::Integer(port.parse::<i64>().unwrap_or(0)),
                                    Frame::bulk(node.id.as_bytes()),
                                ]),
                            ]));
                            start = None;
                        }
                        _ => {}
                    }
                }
            }
            Ok(Frame::Array(out).into())
        }
        b"SHARDS" => {
            let cluster = server.cluster.read().unwrap();
            let out = cluster
                .nodes()
                .filter(|n| n.role == NodeRole::Master)
                .map(|node| {
                    Frame::Array(vec![
                        Frame::bulk(&b"nodes"[..]),
                        Frame::Array(vec![Frame::Array(vec![
                            Frame::bulk(&b"id"[..]),
                            Frame::bulk(node.id.as_bytes()),
                            Frame::bulk(&b"endpoint"[..]),
                            Frame::bulk(node.addr.as_bytes()),
                            Frame::bulk(&b"role"[..]),
                            Frame::bulk(&b"master"[..]),
                        ])]),
                    ])
                })
                .collect();
            Ok(Frame::Array(out).into())
        }
        b"MEET" => {
            let host = argv.get(2).ok_or(ServerError::Syntax)?;
            let port = argv
                .get(3)
                .and_then(|p| parse_u64(p))
                .filter(|p| *p > 0 && *p < 65536)
                .ok_or_else(|| ServerError::other("Invalid TCP base port"))?;
            let mut cluster = server.cluster.write().unwrap();
            cluster.meet(&String::from_utf8_lossy(host), port as u16);
            Ok(Frame::ok().into())
        }
        b"ADDSLOTS" => {
            let mut slots = Vec::with_capacity(argv.len() - 2);
            for raw in &argv[2..] {
                slots.push(parse_slot(raw)?);
            }
            if slots.is_empty() {
                return Err(ServerError::WrongArity("cluster".into()));
            }
            let mut cluster = server.cluster.write().unwrap();
            cluster.add_slots(&slots).map_err(map_err)?;
            Ok(Frame::ok().into())
        }
        b"DELSLOTS" => {
            let mut slots = Vec::with_capacity(argv.len() - 2);
            for raw in &argv[2..] {
                slots.push(parse_slot(raw)?);
            }
            let mut cluster = server.cluster.write().unwrap();
            cluster.del_slots(&slots);
            Ok(Frame::ok().into())
        }
        b"SETSLOT" => {
            let slot = parse_slot(argv.get(2).ok_or(ServerError::Syntax)?)?;
            let mode = argv
                .get(3)
                .map(|m| m.to_ascii_uppercase())
                .ok_or(ServerError::Syntax)?;
            let mut cluster = server.cluster.write().unwrap();
            match mode.as_slice() {
                b"NODE" => {
                    let id = argv.get(4).ok_or(ServerError::Syntax)?;
                    cluster
                        .set_slot_node(slot, &String::from_utf8_lossy(id))
                        .map_err(map_err)?;
                }
                b"MIGRATING" => {
                    let id = argv.get(4).ok_or(ServerError::Syntax)?;
                    cluster
                        .set_slot_migrating(slot, &String::from_utf8_lossy(id))
                        .map_err(map_err)?;
                }
                b"IMPORTING" => {
                    let id = argv.get(4).ok_or(ServerError::Syntax)?;
                    cluster
                        .set_slot_importing(slot, &String::from_utf8_lossy(id))
                        .map_err(map_err)?;
                }
                b"STABLE" => cluster.set_slot_stable(slot),
                _ => return Err(ServerError::Syntax),
            }
            Ok(Frame::ok().into())
        }
        b"FORGET" => {
            let id = argv.get(2).ok_or(ServerError::Syntax)?;
            let mut cluster = server.cluster.write().unwrap();
            cluster
                .forget(&String::from_utf8_lossy(id))
                .map_err(map_err)?;
            Ok(Frame::ok().into())
        }
        b"REPLICATE" => {
            let id = argv.get(2).ok_or(ServerError::Syntax)?;
            let mut cluster = server.cluster.write().unwrap();
            cluster
                .replicate(&String::from_utf8_lossy(id))
                .map_err(map_err)?;
            Ok(Frame::ok().into())
        }
        b"RESET" => {
            let addr = server.config.read().unwrap().addr.clone();
            let mut cluster = server.cluster.write().unwrap();
            cluster.reset(&addr);
            Ok(Frame::ok().into())
        }
        _ => Err(ServerError::other(format!(
            "Unknown subcommand or wrong number of arguments for '{}'. Try CLUSTER HELP.",
            String::from_utf8_lossy(&argv[1])
        ))),
    }
}
