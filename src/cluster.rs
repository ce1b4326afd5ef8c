//! Cluster slot map: CRC16/16384 slot calculation with hash-tag parsing,
//! the node table, and redirection decisions. Administration commands apply
//! local idempotent updates; there is no gossip here.

use std::collections::HashMap;

use crc16::{State, XMODEM};

use crate::util::{gen_hex_id, now_ms};

pub const SLOT_COUNT: u16 = 16384;

/// Slot of a key. If the key contains `{tag}` with a non-empty tag, only the
/// tag bytes are hashed so related keys can be forced onto one slot; empty
/// braces hash the whole key.
pub fn key_hash_slot(key: &[u8]) -> u16 {
    let hashed = match key.iter().position(|&b| b == b'{') {
        Some(open) => match key[open + 1..].iter().position(|&b| b == b'}') {
            Some(0) | None => key,
            Some(close) => &key[open + 1..open + 1 + close],
        },
        None => key,
    };
    State::<XMODEM>::calculate(hashed) % SLOT_COUNT
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    Master,
    Replica,
}

#[derive(Debug, Clone)]
pub struct ClusterNode {
    pub id: String,
    pub addr: String, // host:port
    pub role: NodeRole,
    pub master_id: Option<String>,
    pub epoch: u64,
}

#[derive(Debug)]
pub struct ClusterMap {
    pub my_id: String,
    pub current_epoch: u64,
    nodes: HashMap<String, ClusterNode>,
    slots: Vec<Option<String>>, // slot -> node id
    migrating: HashMap<u16, String>,
    importing: HashMap<u16, String>,
}

impl ClusterMap {
    /// With no cluster config the local node owns every slot.
    pub fn new(my_addr: &str) -> ClusterMap {
        let my_id = gen_hex_id();
        let mut nodes = HashMap::new();
        nodes.insert(
            my_id.clone(),
            ClusterNode {
                id: my_id.clone(),
                addr: my_addr.to_string(),
                role: NodeRole::Master,
                master_id: None,
                epoch: 0,
            },
        );
        ClusterMap {
            slots: vec![Some(my_id.clone()); SLOT_COUNT as usize],
            my_id,
            current_epoch: 0,
            nodes,
            migrating: HashMap::new(),
            importing: HashMap::new(),
        }
    }

    pub fn owns_slot(&self, slot: u16) -> bool {
        self.slots[slot as usize].as_deref() == Some(self.my_id.as_str())
    }

    pub fn slot_owner_addr(&self, slot: u16) -> Option<String> {
        let id = self.slots[slot as usize].as_deref()?;
        self.nodes.get(id).map(|n| n.addr.clone())
    }

    pub fn migrating_target(&self, slot: u16) -> Option<String> {
        let id = self.migrating.get(&slot)?;
        self.nodes.get(id).map(|n| n.addr.clone())
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn slots_assigned(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn meet(&mut self, host: &str, port: u16) -> String {
        let addr = format!("{}:{}", host, port);
        if let Some(existing) = self.nodes.values().find(|n| n.addr == addr) {
            return existing.id.clone();
        }
        let id = gen_hex_id();
        self.nodes.insert(
            id.clone(),
            ClusterNode {
                id: id.clone(),
                addr,
                role: NodeRole::Master,
                master_id: None,
                epoch: self.current_epoch,
            },
        );
        id
    }

    pub fn add_slots(&mut self, slots: &[u16]) -> Result<(), String> {
        for &slot in slots {
            if self.slots[slot as usize].is_some()
                && self.slots[slot as usize].as_deref() != Some(self.my_id.as_str())
            {
                return Err(format!("Slot {} is already busy", slot));
            }
        }
        for &slot in slots {
            self.slots[slot as usize] = Some(self.my_id.clone());
        }
        Ok(())
    }

    pub fn del_slots(&mut self, slots: &[u16]) {
        for &slot in slots {
            self.slots[slot as usize] = None;
            self.migrating.remove(&slot);
            self.importing.remove(&slot);
        }
    }

    pub fn set_slot_node(&mut self, slot: u16, node_id: &str) -> Result<(), String> {
        if !self.nodes.contains_key(node_id) {
            return Err(format!("Unknown node {}", node_id));
        }
        self.slots[slot as usize] = Some(node_id.to_string());
        self.migrating.remove(&slot);
        self.importing.remove(&slot);
        Ok(())
    }

    pub fn set_slot_migrating(&mut self, slot: u16, node_id: &str) -> Result<(), String> {
        if !self.nodes.contains_key(node_id) {
            return Err(format!("Unknown node {}", node_id));
        }
        self.migrating.insert(slot, node_id.to_string());
        Ok(())
    }

    pub fn set_slot_importing(&mut self, slot: u16, node_id: &str) -> Result<(), String> {
        if !self.nodes.contains_key(node_id) {
            return Err(format!("Unknown node {}", node_id));
        }
        self.importing.insert(slot, node_id.to_string());
        Ok(())
    }

    pub fn set_slot_stable(&mut self, slot: u16) {
        self.migrating.remove(&slot);
        self.importing.remove(&slot);
    }

    pub fn forget(&mut self, node_id: &str) -> Result<(), String> {
        if node_id == self.my_id {
            return Err("I tried hard but I can't forget myself...".into());
        }
        if self.nodes.remove(node_id).is_none() {
            return Err(format!("Unknown node {}", node_id));
        }
        for slot in self.slots.iter_mut() {
            if slot.as_deref() == Some(node_id) {
                *slot = None;
            }
        }
        Ok(())
    }

    pub fn replicate(&mut self, master_id: &str) -> Result<(), String> {
        if !self.nodes.contains_key(master_id) {
            return Err(format!("Unknown node {}", master_id));
        }
        if master_id == self.my_id {
            return Err("Can't replicate myself".into());
        }
        if let Some(me) = self.nodes.get_mut(&self.my_id) {
            me.role = NodeRole::Replica;
            me.master_id = Some(master_id.to_string());
        }
        for slot in self.slots.iter_mut() {
            if slot.as_deref() == Some(self.my_id.as_str()) {
                *slot = None;
            }
        }
        Ok(())
    }

    pub fn reset(&mut self, my_addr: &str) {
        *self = ClusterMap::new(my_addr);
    }

    /// Contiguous slot ranges owned by `node_id`, rendered `a-b` or `a`.
    fn slot_ranges(&self, node_id: &str) -> Vec<String> {
        let mut ranges = Vec::new();
        let mut start: Option<u16> = None;
        for slot in 0..SLOT_COUNT {
            let owned = self.slots[slot as usize].as_deref() == Some(node_id);
            match (owned, start) {
                (true, None) => start = Some(slot),
                (false, Some(s)) => {
                    ranges.push(if s == slot - 1 {
                        s.to_string()
                    } else {
                        format!("{}-{}", s, slot - 1)
                    });
                    start = None;
                }
                _ => {}
            }
        }
        if let Some(s) = start {
            ranges.push(if s == SLOT_COUNT - 1 {
                s.to_string()
            } else {
                format!("{}-{}", s, SLOT_COUNT - 1)
            });
        }
        ranges
    }

    /// The documented multi-line CLUSTER NODES text format.
    pub fn render_nodes(&self) -> String {
        let now = now_ms();
        let mut out = String::new();
        let mut ids: Vec<&String> = self.nodes.keys().collect();
        ids.sort();
        for id in ids {
            let node = &self.nodes[id];
            let myself = node.id == self.my_id;
            let mut flags = String::new();
            if myself {
                flags.push_str("myself,");
            }
            flags.push_str(match node.role {
                NodeRole::Master => "master",
                NodeRole::Replica => "slave",
            });
            let (host, port) = node
                .addr
                .rsplit_once(':')
                .unwrap_or((node.addr.as_str(), "0"));
            let cport = port.parse::<u32>().unwrap_or(0) + 10000;
            out.push_str(&format!(
                "{} {}:{}@{} {} {} 0 {} {} connected",
                node.id,
                host,
                port,
                cport,
                flags,
                node.master_id.as_deref().unwrap_or("-"),
                now,
                node.epoch,
            ));
            if node.role == NodeRole::Master {
                for range in self.slot_ranges(&node.id) {
                    out.push(' ');
                    out.push_str(&range);
                }
            }
            out.push('\n');
        }
        out
    }

    pub fn nodes(&self) -> impl Iterator<Item = &ClusterNode> {
        self.nodes.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_slot_values() {
        // reference values from the protocol's own test vectors
        assert_eq!(key_hash_slot(b"foo"), 12182);
        assert_eq!(key_hash_slot(b""), 0);
    }

    #[test]
    fn hash_tags_colocate() {
        assert_eq!(key_hash_slot(b"{user1}.name"), key_hash_slot(b"{user1}.age"));
        assert_eq!(key_hash_slot(b"{x}1"), key_hash_slot(b"x"));
        // empty tag hashes the whole key, braces included
        assert_ne!(key_hash_slot(b"{}a"), key_hash_slot(b"{}b"));
        // only the first tag counts
        assert_eq!(key_hash_slot(b"{a}{b}"), key_hash_slot(b"a"));
    }

    #[test]
    fn fresh_map_owns_everything() {
        let map = ClusterMap::new("127.0.0.1:6379");
        assert!(map.owns_slot(0));
        assert!(map.owns_slot(SLOT_COUNT - 1));
        assert_eq!(map.slots_assigned(), SLOT_COUNT as usize);
    }

    #[test]
    fn moved_target_after_setslot() {
        let mut map = ClusterMap::new("127.0.0.1:6379");
        let other = map.meet("10.0.0.2", 6379);
        map.set_slot_node(7000, &other).unwrap();
        assert!(!map.owns_slot(7000));
        assert_eq!(map.slot_owner_addr(7000).unwrap(), "10.0.0.2:6379");
        assert!(map.owns_slot(7001));
    }

    #[test]
    fn nodes_rendering_has_ranges() {
        let map = ClusterMap::new("127.0.0.1:6379");
        let text = map.render_nodes();
        assert!(text.contains("myself,master"));
        assert!(text.contains("0-16383"));
    }
}
