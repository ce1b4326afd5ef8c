//! JSON document commands over a JSONPath-lite addressing scheme: `$`,
//! `$.field`, `$.a.b`, `$.arr[i]`, with the legacy leading-dot form
//! accepted. Documents are stored as canonical serialized JSON.

use std::sync::Arc;

use serde_json::Value;

use crate::client::Session;
use crate::commands::Reply;
use crate::errors::ServerError;
use crate::resp::Frame;
use crate::server::Server;
use crate::storage::encoding::{json_key, Meta, ValueTag};
use crate::storage::Store;
use crate::util::parse_f64;

#[derive(Debug, Clone, PartialEq)]
enum Seg {
    Field(String),
    Index(usize),
}

fn bad_path(raw: &[u8]) -> ServerError {
    ServerError::other(format!(
        "Path '{}' does not exist or is not valid",
        String::from_utf8_lossy(raw)
    ))
}

fn parse_path(raw: &[u8]) -> Result<Vec<Seg>, ServerError> {
    let s = std::str::from_utf8(raw).map_err(|_| bad_path(raw))?;
    let mut rest = s.strip_prefix('$').unwrap_or(s);
    if rest.is_empty() || rest == "." {
        return Ok(Vec::new());
    }
    let mut segs = Vec::new();
    while !rest.is_empty() {
        if let Some(after) = rest.strip_prefix('.') {
            rest = after;
            continue;
        }
        if let Some(after) = rest.strip_prefix('[') {
            let close = after.find(']').ok_or_else(|| bad_path(raw))?;
            let idx: usize = after[..close].parse().map_err(|_| bad_path(raw))?;
            segs.push(Seg::Index(idx));
            rest = &after[close + 1..];
            continue;
        }
        let end = rest
            .find(|c| c == '.' || c == '[')
            .unwrap_or(rest.len());
        if end == 0 {
            return Err(bad_path(raw));
        }
        segs.push(Seg::Field(rest[..end].to_string()));
        rest = &rest[end..];
    }
    Ok(segs)
}

fn resolve<'a>(doc: &'a Value, path: &[Seg]) -> Option<&'a Value> {
    let mut current = doc;
    for seg in path {
        current = match seg {
            Seg::Field(name) => current.as_object()?.get(name)?,
            Seg::Index(idx) => current.as_array()?.get(*idx)?,
        };
    }
    Some(current)
}

fn resolve_mut<'a>(doc: &'a mut Value, path: &[Seg]) -> Option<&'a mut Value> {
    let mut current = doc;
    for seg in path {
        current = match seg {
            Seg::Field(name) => current.as_object_mut()?.get_mut(name)?,
            Seg::Index(idx) => current.as_array_mut()?.get_mut(*idx)?,
        };
    }
    Some(current)
}

fn load_doc(store: &Store, key: &[u8]) -> Result<Option<Value>, ServerError> {
    if store.meta_expect(key, &[ValueTag::Json])?.is_none() {
        return Ok(None);
    }
    let raw = store.db().get(json_key(key))?.unwrap_or_default();
    serde_json::from_slice(&raw)
        .map(Some)
        .map_err(|e| ServerError::Internal(format!("stored document corrupt: {}", e)))
}

fn save_doc(store: &Store, key: &[u8], doc: &Value) -> Result<(), ServerError> {
    let mut meta = match store.meta_raw(key)? {
        Some(meta) => meta,
        None => Meta::new(ValueTag::Json),
    };
    meta.tag = ValueTag::Json;
    store.write_meta(key, &meta)?;
    store.db().insert(
        json_key(key),
        serde_json::to_vec(doc).map_err(|e| ServerError::Internal(e.to_string()))?,
    )?;
    store.bump(key);
    Ok(())
}

fn parse_json(raw: &[u8]) -> Result<Value, ServerError> {
    serde_json::from_slice(raw)
        .map_err(|_| ServerError::other("Could not parse supplied json"))
}

pub fn set_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let store = &server.store;
    let key = &argv[1];
    let path = parse_path(&argv[2])?;
    let new_value = parse_json(&argv[3])?;
    let (mut nx, mut xx) = (false, false);
    for opt in &argv[4..] {
        match opt.to_ascii_uppercase().as_slice() {
            b"NX" => nx = true,
            b"XX" => xx = true,
            _ => return Err(ServerError::Syntax),
        }
    }
    if nx && xx {
        return Err(ServerError::Syntax);
    }

    let existing = load_doc(store, key)?;
    if path.is_empty() {
        if (nx && existing.is_some()) || (xx && existing.is_none()) {
            return Ok(Frame::Null.into());
        }
        save_doc(store, key, &new_value)?;
        return Ok(Frame::ok().into());
    }
    let Some(mut doc) = existing else {
        return Err(ServerError::other(
            "new objects must be created at the root",
        ));
    };
    let (leaf, parent_path) = path.split_last().unwrap();
    let Some(parent) = resolve_mut(&mut doc, parent_path) else {
        return Err(bad_path(&argv[2]));
    };
    let target_exists = match leaf {
        Seg::Field(name) => parent.as_object().map_or(false, |o| o.contains_key(name)),
        Seg::Index(idx) => parent.as_array().map_or(false, |a| *idx < a.len()),
    };
    if (nx && target_exists) || (xx && !target_exists) {
        return Ok(Frame::Null.into());
    }
    match leaf {
        Seg::Field(name) => {
            let Some(obj) = parent.as_object_mut() else {
                return Err(bad_path(&argv[2]));
            };
            obj.insert(name.clone(), new_value);
        }
        Seg::Index(idx) => {
            let Some(arr) = parent.as_array_mut() else {
                return Err(bad_path(&argv[2]));
            };
            if *idx >= arr.len() {
                return Err(ServerError::other("array index out of range"));
            }
            arr[*idx] = new_value;
        }
    }
    save_doc(store, key, &doc)?;
    Ok(Frame::ok().into())
}

pub fn get_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let Some(doc) = load_doc(&server.store, &argv[1])? else {
        return Ok(Frame::Null.into());
    };
    let serialize =
        |v: &Value| serde_json::to_vec(v).map_err(|e| ServerError::Internal(e.to_string()));
    match argv.len() {
        2 => Ok(Frame::Bulk(serialize(&doc)?).into()),
        3 => {
            let path = parse_path(&argv[2])?;
            match resolve(&doc, &path) {
                Some(value) => Ok(Frame::Bulk(serialize(value)?).into()),
                None => Ok(Frame::Null.into()),
            }
        }
        _ => {
            // multi-path read: one array, values in path order
            let mut values = Vec::with_capacity(argv.len() - 2);
            for raw in &argv[2..] {
                let path = parse_path(raw)?;
                values.push(resolve(&doc, &path).cloned().unwrap_or(Value::Null));
            }
            Ok(Frame::Bulk(serialize(&Value::Array(values))?).into())
        }
    }
}

pub fn del_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let store = &server.store;
    let key = &argv[1];
    let path = match argv.get(2) {
        Some(raw) => parse_path(raw)?,
        None => Vec::new(),
    };
    if load_doc(store, key)?.is_none() {
        return Ok(Frame::Integer(0).into());
    }
    if path.is_empty() {
        store.delete_key(key)?;
        return Ok(Frame::Integer(1).into());
    }
    let mut doc = load_doc(store, key)?.unwrap();
    let (leaf, parent_path) = path.split_last().unwrap();
    let removed = match resolve_mut(&mut doc, parent_path) {
        Some(parent) => match leaf {
            Seg::Field(name) => parent
                .as_object_mut()
                .map_or(false, |o| o.remove(name).is_some()),
            Seg::Index(idx) => match parent.as_array_mut() {
                Some(arr) if *idx < arr.len() => {
                    arr.remove(*idx);
                    true
                }
                _ => false,
            },
        },
        None => false,
    };
    if removed {
        save_doc(store, key, &doc)?;
    }
    Ok(Frame::Integer(removed as i64).into())
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

pub fn type_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let Some(doc) = load_doc(&server.store, &argv[1])? else {
        return Ok(Frame::Null.into());
    };
    let path = match argv.get(2) {
        Some(raw) => parse_path(raw)?,
        None => Vec::new(),
    };
    Ok(match resolve(&doc, &path) {
        Some(value) => Frame::bulk(type_name(value).as_bytes()).into(),
        None => Frame::Null.into(),
    })
}

pub fn clear_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let store = &server.store;
    let key = &argv[1];
    let Some(mut doc) = load_doc(store, key)? else {
        return Err(ServerError::NoSuchKey);
    };
    let path = match argv.get(2) {
        Some(raw) => parse_path(raw)?,
        None => Vec::new(),
    };
    let Some(target) = resolve_mut(&mut doc, &path) else {
        return Ok(Frame::Integer(0).into());
    };
    let cleared = match target {
        Value::Object(map) if !map.is_empty() => {
            map.clear();
            true
        }
        Value::Array(arr) if !arr.is_empty() => {
            arr.clear();
            true
        }
        Value::Number(_) => {
            *target = Value::Number(0.into());
            true
        }
        _ => false,
    };
    if cleared {
        save_doc(store, key, &doc)?;
    }
    Ok(Frame::Integer(cleared as i64).into())
}

pub fn arrappend_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let store = &server.store;
    let key = &argv[1];
    let Some(mut doc) = load_doc(store, key)? else {
        return Err(ServerError::NoSuchKey);
    };
    let path = parse_path(&argv[2])?;
    let mut values = Vec::with_capacity(argv.len() - 3);
    for raw in &argv[3..] {
        values.push(parse_json(raw)?);
    }
    let Some(Value::Array(arr)) = resolve_mut(&mut doc, &path) else {
        return Err(bad_path(&argv[2]));
    };
    arr.extend(values);
    let len = arr.len();
    save_doc(store, key, &doc)?;
    Ok(Frame::Integer(len as i64).into())
}

pub fn arrlen_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let Some(doc) = load_doc(&server.store, &argv[1])? else {
        return Ok(Frame::Null.into());
    };
    let path = match argv.get(2) {
        Some(raw) => parse_path(raw)?,
        None => Vec::new(),
    };
    Ok(match resolve(&doc, &path) {
        Some(Value::Array(arr)) => Frame::Integer(arr.len() as i64).into(),
        _ => Frame::Null.into(),
    })
}

fn num_mutate(
    server: &Arc<Server>,
    argv: &[Vec<u8>],
    multiply: bool,
) -> Result<Reply, ServerError> {
    let store = &server.store;
    let key = &argv[1];
    let Some(mut doc) = load_doc(store, key)? else {
        return Err(ServerError::NoSuchKey);
    };
    let path = parse_path(&argv[2])?;
    let operand = parse_f64(&argv[3]).ok_or(ServerError::NotFloat)?;
    let Some(target) = resolve_mut(&mut doc, &path) else {
        return Err(bad_path(&argv[2]));
    };
    let Some(current) = target.as_f64() else {
        return Err(ServerError::other("expected a number at the path"));
    };
    let new = if multiply {
        current * operand
    } else {
        current + operand
    };
    if new.is_nan() || new.is_infinite() {
        return Err(ServerError::other("result is not a number"));
    }
    // integral results stay integers
    *target = if new.fract() == 0.0 && new.abs() < i64::MAX as f64 {
        Value::Number((new as i64).into())
    } else {
        Value::Number(
            serde_json::Number::from_f64(new)
                .ok_or_else(|| ServerError::other("result is not a number"))?,
        )
    };
    let rendered = serde_json::to_vec(target).map_err(|e| ServerError::Internal(e.to_string()))?;
    save_doc(store, key, &doc)?;
    Ok(Frame::Bulk(rendered).into())
}

pub fn numincrby_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    num_mutate(server, argv, false)
}

pub fn nummultby_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    num_mutate(server, argv, true)
}

pub fn objkeys_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let Some(doc) = load_doc(&server.store, &argv[1])? else {
        return Ok(Frame::Null.into());
    };
    let path = match argv.get(2) {
        Some(raw) => parse_path(raw)?,
        None => Vec::new(),
    };
    Ok(match resolve(&doc, &path) {
        Some(Value::Object(map)) => Frame::Array(
            map.keys()
                .map(|k| Frame::bulk(k.as_bytes()))
                .collect(),
        )
        .into(),
        _ => Frame::Null.into(),
    })
}

pub fn objlen_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let Some(doc) = load_doc(&server.store, &argv[1])? else {
        return Ok(Frame::Null.into());
    };
    let path = match argv.get(2) {
        Some(raw) => parse_path(raw)?,
        None => Vec::new(),
    };
    Ok(match resolve(&doc, &path) {
        Some(Value::Object(map)) => Frame::Integer(map.len() as i64).into(),
        _ => Frame::Null.into(),
    })
}

pub fn strlen_command(
    server: &Arc<Server>,
    _session: &mut Session,
    argv: &[Vec<u8>],
) -> Result<Reply, ServerError> {
    let Some(doc) = load_doc(&server.store, &argv[1])? else {
        return Ok(Frame::Null.into());
    };
    let path = match argv.get(2) {
        Some(raw) => parse_path(raw)?,
        None => Vec::new(),
    };
    Ok(match resolve(&doc, &path) {
        Some(Value::String(s)) => Frame::Integer(s.len() as i64).into(),
        _ => Frame::Null.into(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_parsing() {
        assert_eq!(parse_path(b"$").unwrap(), vec![]);
        assert_eq!(
            parse_path(b"$.user.name").unwrap(),
            vec![Seg::Field("user".into()), Seg::Field("name".into())]
        );
        assert_eq!(
            parse_path(b"$.items[2]").unwrap(),
            vec![Seg::Field("items".into()), Seg::Index(2)]
        );
        assert_eq!(parse_path(b".legacy").unwrap(), vec![Seg::Field("legacy".into())]);
        assert!(parse_path(b"$.a[x]").is_err());
    }

    #[test]
    fn resolve_walks_nesting() {
        let doc: Value = serde_json::from_str(r#"{"a": {"b": [1, 2, 3]}}"#).unwrap();
        let path = parse_path(b"$.a.b[1]").unwrap();
        assert_eq!(resolve(&doc, &path), Some(&Value::Number(2.into())));
        assert!(resolve(&doc, &parse_path(b"$.a.c").unwrap()).is_none());
    }
}
