//! Channel and pattern subscription registry with fan-out publish.
//! Delivery snapshots the recipient set under the hub lock, then writes to
//! subscriber sockets after releasing it; a subscriber whose socket cannot
//! be written is flagged for disconnection.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::client::ClientHandle;
use crate::resp::Frame;
use crate::util::glob_match;

#[derive(Default)]
struct HubInner {
    channels: HashMap<Vec<u8>, Vec<Arc<ClientHandle>>>,
    patterns: HashMap<Vec<u8>, Vec<Arc<ClientHandle>>>,
}

#[derive(Default)]
pub struct PubSubHub {
    inner: Mutex<HubInner>,
}

impl PubSubHub {
    pub fn subscribe(&self, channel: &[u8], client: &Arc<ClientHandle>) {
        let mut inner = self.inner.lock().unwrap();
        let subs = inner.channels.entry(channel.to_vec()).or_default();
        if !subs.iter().any(|c| c.id == client.id) {
            subs.push(client.clone());
        }
    }

    pub fn psubscribe(&self, pattern: &[u8], client: &Arc<ClientHandle>) {
        let mut inner = self.inner.lock().unwrap();
        let subs = inner.patterns.entry(pattern.to_vec()).or_default();
        if !subs.iter().any(|c| c.id == client.id) {
            subs.push(client.clone());
        }
    }

    pub fn unsubscribe(&self, channel: &[u8], client_id: u64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(subs) = inner.channels.get_mut(channel) {
            subs.retain(|c| c.id != client_id);
            if subs.is_empty() {
                inner.channels.remove(channel);
            }
        }
    }

    pub fn punsubscribe(&self, pattern: &[u8], client_id: u64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(subs) = inner.patterns.get_mut(pattern) {
            subs.retain(|c| c.id != client_id);
            if subs.is_empty() {
                inner.patterns.remove(pattern);
            }
        }
    }

    /// Drop every registration of a disconnecting client.
    pub fn drop_client(&self, client_id: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.channels.retain(|_, subs| {
            subs.retain(|c| c.id != client_id);
            !subs.is_empty()
        });
        inner.patterns.retain(|_, subs| {
            subs.retain(|c| c.id != client_id);
            !subs.is_empty()
        });
    }

    /// Fan out a message; the return value counts deliveries, a connection
    /// subscribed through both a channel and a matching pattern counts
    /// twice.
    pub fn publish(&self, channel: &[u8], payload: &[u8]) -> usize {
        // (recipient, message) pairs snapshotted under the lock
        let mut deliveries: Vec<(Arc<ClientHandle>, Frame)> = Vec::new();
        {
            let inner = self.inner.lock().unwrap();
            if let Some(subs) = inner.channels.get(channel) {
                for sub in subs {
                    deliveries.push((
                        sub.clone(),
                        Frame::Array(vec![
                            Frame::bulk(&b"message"[..]),
                            Frame::bulk(channel),
                            Frame::bulk(payload),
                        ]),
                    ));
                }
            }
            for (pattern, subs) in inner.patterns.iter() {
                if glob_match(pattern, channel) {
                    for sub in subs {
                        deliveries.push((
                            sub.clone(),
                            Frame::Array(vec![
                                Frame::bulk(&b"pmessage"[..]),
                                Frame::bulk(pattern.as_slice()),
                                Frame::bulk(channel),
                                Frame::bulk(payload),
                            ]),
                        ));
                    }
                }
            }
        }
        let mut receivers = 0;
        for (client, message) in deliveries {
            if client.send_frame(&message).is_ok() {
                receivers += 1;
            } else {
                // slow or dead consumer, cut it loose
                client.request_kill();
            }
        }
        receivers
    }

    pub fn channels_matching(&self, pattern: Option<&[u8]>) -> Vec<Vec<u8>> {
        let inner = self.inner.lock().unwrap();
        inner
            .channels
            .keys()
            .filter(|ch| pattern.map_or(true, |p| glob_match(p, ch)))
            .cloned()
            .collect()
    }

    pub fn subscriber_count(&self, channel: &[u8]) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.channels.get(channel).map_or(0, |subs| subs.len())
    }

    pub fn pattern_count(&self) -> usize {
        self.inner.lock().unwrap().patterns.len()
    }
}
