//! Key schema layered on the KV substrate.
//!
//! ```text
//! n/<id>                         node record
//! e/<id>                         edge record
//! L/<label>/<id>                 label membership tag
//! P/<label>/<prop>/<value>/<id>  property index entry
//! C/<cname>/<keybytes>           constraint sentinel (value = owner id)
//! Eo/<from>/<type>/<to>/<eid>    adjacency, forward
//! Ei/<to>/<type>/<from>/<eid>    adjacency, reverse
//! m/<name>                       store metadata
//! ```
//!
//! Label, type and property names are validated at the schema boundary to
//! exclude `/`; property values may contain anything, so identifiers are
//! always recovered by stripping a known prefix or taking the last segment,
//! never by naive splitting.

pub const NODE_PREFIX: &str = "n/";
pub const EDGE_PREFIX: &str = "e/";
pub const LABEL_PREFIX: &str = "L/";
pub const PROP_PREFIX: &str = "P/";
pub const SENTINEL_PREFIX: &str = "C/";
pub const ADJ_OUT_PREFIX: &str = "Eo/";
pub const ADJ_IN_PREFIX: &str = "Ei/";
pub const META_PREFIX: &str = "m/";

pub const META_SCHEMA: &str = "m/schema";
pub const META_NEXT_ORDINAL: &str = "m/next_ordinal";

pub fn node_key(id: &str) -> Vec<u8> {
    format!("{NODE_PREFIX}{id}").into_bytes()
}

pub fn edge_key(id: &str) -> Vec<u8> {
    format!("{EDGE_PREFIX}{id}").into_bytes()
}

pub fn label_key(label_lc: &str, id: &str) -> Vec<u8> {
    format!("{LABEL_PREFIX}{label_lc}/{id}").into_bytes()
}

pub fn label_scan_prefix(label_lc: &str) -> Vec<u8> {
    format!("{LABEL_PREFIX}{label_lc}/").into_bytes()
}

pub fn prop_key(label_lc: &str, prop: &str, value_key: &str, id: &str) -> Vec<u8> {
    format!("{PROP_PREFIX}{label_lc}/{prop}/{value_key}/{id}").into_bytes()
}

pub fn prop_scan_prefix(label_lc: &str, prop: &str, value_key: &str) -> Vec<u8> {
    format!("{PROP_PREFIX}{label_lc}/{prop}/{value_key}/").into_bytes()
}

pub fn sentinel_key(cname: &str, key_bytes: &str) -> Vec<u8> {
    format!("{SENTINEL_PREFIX}{cname}/{key_bytes}").into_bytes()
}

pub fn adj_out_key(from: &str, edge_type: &str, to: &str, eid: &str) -> Vec<u8> {
    format!("{ADJ_OUT_PREFIX}{from}/{edge_type}/{to}/{eid}").into_bytes()
}

pub fn adj_in_key(to: &str, edge_type: &str, from: &str, eid: &str) -> Vec<u8> {
    format!("{ADJ_IN_PREFIX}{to}/{edge_type}/{from}/{eid}").into_bytes()
}

pub fn adj_out_prefix(from: &str) -> Vec<u8> {
    format!("{ADJ_OUT_PREFIX}{from}/").into_bytes()
}

pub fn adj_in_prefix(to: &str) -> Vec<u8> {
    format!("{ADJ_IN_PREFIX}{to}/").into_bytes()
}

pub fn adj_out_typed_prefix(from: &str, edge_type: &str) -> Vec<u8> {
    format!("{ADJ_OUT_PREFIX}{from}/{edge_type}/").into_bytes()
}

pub fn adj_in_typed_prefix(to: &str, edge_type: &str) -> Vec<u8> {
    format!("{ADJ_IN_PREFIX}{to}/{edge_type}/").into_bytes()
}

/// Final `/`-separated segment of a key (the entity id for index entries).
pub fn last_segment(key: &[u8]) -> Option<&str> {
    let text = std::str::from_utf8(key).ok()?;
    text.rsplit('/').next()
}

/// Splits an adjacency key (past its prefix) into `(near, type, far, eid)`.
pub fn split_adjacency(key: &[u8], prefix_len: usize) -> Option<(String, String, String, String)> {
    let text = std::str::from_utf8(key).ok()?;
    let rest = text.get(prefix_len..)?;
    let mut parts = rest.split('/');
    let near = parts.next()?.to_string();
    let edge_type = parts.next()?.to_string();
    let far = parts.next()?.to_string();
    let eid = parts.next()?.to_string();
    Some((near, edge_type, far, eid))
}
