//! SUBSCRIBE family and PUBLISH. Subscription replies are pushed through
//! the normal reply path, one confirmation frame per channel.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::client::Session;
use crate::commands::Reply;
use crate::errors::ServerError;
use crate::resp::Frame;
use crate::server::Server;

fn confirmation(kind: &str, channel: Option<&[u8]>, count: u64) -> Frame {
    Frame::Array(vec![
        Frame::bulk(kind.as_bytes()),
        match channel {
            Some(ch) => Frame::Bulk(ch.to_vec()),
            None => Frame::Null,
        },
        Frame::Integer(count as i64),
    ])
}

fn sync_handle_count(session: &Session) {
    session
        .handle
        .sub_count
        .store(session.sub_total(), Ordering::SeqCst);
}

pub fn subscribe_command(
    server: &Arc<Server>,
    session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let mut frames = Vec::with_capacity(argv.len() - 1);
    for channel in &argv[1..] {
        server.pubsub.subscribe(channel, &session.handle);
        session.subscriptions.insert(channel.clone());
        frames.push(confirmation("subscribe", Some(channel), session.sub_total()));
    }
    sync_handle_count(session);
    Ok(Reply::Multi(frames))
}

pub fn psubscribe_command(
    server: &Arc<Server>,
    session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let mut frames = Vec::with_capacity(argv.len() - 1);
    for pattern in &argv[1..] {
        server.pubsub.psubscribe(pattern, &session.handle);
        session.psubscriptions.insert(pattern.clone());
        frames.push(confirmation("psubscribe", Some(pattern), session.sub_total()));
    }
    sync_handle_count(session);
    Ok(Reply::Multi(frames))
}

pub fn unsubscribe_command(
    server: &Arc<Server>,
    session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let targets: Vec<Vec<u8>> = if argv.len() > 1 {
        argv[1..].to_vec()
    } else {
        session.subscriptions.iter().cloned().collect()
    };
    if targets.is_empty() {
        return Ok(Reply::Frame(confirmation("unsubscribe", None, session.sub_total())));
    }
    let mut frames = Vec::with_capacity(targets.len());
    for channel in targets {
        server.pubsub.unsubscribe(&channel, session.handle.id);
        session.subscriptions.remove(&channel);
        frames.push(confirmation(
            "unsubscribe",
            Some(&channel),
            session.sub_total(),
        ));
    }
    sync_handle_count(session);
    Ok(Reply::Multi(frames))
}

pub fn punsubscribe_command(
    server: &Arc<Server>,
    session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let targets: Vec<Vec<u8>> = if argv.len() > 1 {
        argv[1..].to_vec()
    } else {
        session.psubscriptions.iter().cloned().collect()
    };
    if targets.is_empty() {
        return Ok(Reply::Frame(confirmation(
            "punsubscribe",
            None,
            session.sub_total(),
        )));
    }
    let mut frames = Vec::with_capacity(targets.len());
    for pattern in targets {
        server.pubsub.punsubscribe(&pattern, session.handle.id);
        session.psubscriptions.remove(&pattern);
        frames.push(confirmation(
            "punsubscribe",
            Some(&pattern),
            session.sub_total(),
        ));
    }
    sync_handle_count(session);
    Ok(Reply::Multi(frames))
}

pub fn publish_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let receivers = server.pubsub.publish(&argv[1], &argv[2]);
    Ok(Frame::Integer(receivers as i64).into())
}

pub fn pubsub_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    match argv[1].to_ascii_uppercase().as_slice() {
        b"CHANNELS" => {
            let pattern = argv.get(2).map(|p| p.as_slice());
            let channels = server.pubsub.channels_matching(pattern);
            Ok(Frame::Array(channels.into_iter().map(Frame::Bulk).collect()).into())
        }
        b"NUMSUB" => {
            let mut out = Vec::with_capacity((argv.len() - 2) * 2);
            for channel in &argv[2..] {
                out.push(Frame::Bulk(channel.clone()));
                out.push(Frame::Integer(server.pubsub.subscriber_count(channel) as i64));
            }
            Ok(Frame::Array(out).into())
        }
        b"NUMPAT" => Ok(Frame::Integer(server.pubsub.pattern_count() as i64).into()),
        _ => Err(ServerError::other(format!(
            "Unknown PUBSUB subcommand or wrong number of arguments for '{}'",
            String::from_utf8_lossy(&argv[1])
        ))),
    }
}
