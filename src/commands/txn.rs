//! MULTI/EXEC transactions with optimistic concurrency via WATCH: queued
//! commands run as one batch under the exclusive lock; a watched key whose
//! revision moved since WATCH aborts the whole transaction.

use std::sync::Arc;

use crate::client::{MultiState, Session};
use crate::commands::{execute_queued, Reply};
use crate::errors::ServerError;
use crate::resp::Frame;
use crate::server::Server;

pub fn multi_command(
    _server: &Arc<Server>,
    session: &mut Session,
    _argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    if session.multi.is_some() {
        return Err(ServerError::other("MULTI calls can not be nested"));
    }
    session.multi = Some(MultiState {
        queue: Vec::new(),
        errored: false,
    });
    Ok(Frame::ok().into())
}

pub fn discard_command(
    _server: &Arc<Server>,
    session: &mut Session,
    _argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    if session.multi.take().is_none() {
        return Err(ServerError::other("DISCARD without MULTI"));
    }
    session.watch.clear();
    Ok(Frame::ok().into())
}

pub fn exec_command(
    server: &Arc<Server>,
    session: &mut Session,
    _argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let Some(state) = session.multi.take() else {
        return Err(ServerError::other("EXEC without MULTI"));
    };
    let watch = std::mem::take(&mut session.watch);
    if state.errored {
        return Err(ServerError::ExecAbort);
    }
    // optimistic check: any watched key whose revision moved aborts
    for (key, revision) in &watch {
        if server.store.revision(key) != *revision {
            return Ok(Frame::NullArray.into());
        }
    }
    session.in_exec = true;
    let mut replies = Vec::with_capacity(state.queue.len());
    for queued in &state.queue {
        replies.push(execute_queued(server, session, queued));
    }
    session.in_exec = false;
    Ok(Frame::Array(replies).into())
}

pub fn watch_command(
    server: &Arc<Server>,
    session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    if session.multi.is_some() {
        return Err(ServerError::other("WATCH inside MULTI is not allowed"));
    }
    for key in &argv[1..] {
        let revision = server.store.revision(key);
        if !session.watch.iter().any(|(k, _)| k == key) {
            session.watch.push((key.clone(), revision));
        }
    }
    Ok(Frame::ok().into())
}

pub fn unwatch_command(
    _server: &Arc<Server>,
    session: &mut Session,
    _argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    session.watch.clear();
    Ok(Frame::ok().into())
}
