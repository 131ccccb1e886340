//! Binary encoding of queue blobs
//!
//! Each blob is a field-by-field encoding of the serializable slice of an
//! item: URL and parent URL as JSON-quoted strings, identifier as a plain
//! string, counters as LEB128 varints, flags as single bytes. Strings are
//! length-prefixed with a varint. The schema is stable so queues written
//! by older builds keep decoding after an upgrade.

use thiserror::Error;
use uuid::Uuid;

use crate::models::{CrawlUrl, Item, ItemKind};

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("blob truncated")]
    Truncated,
    #[error("varint overflow")]
    BadVarint,
    #[error("invalid utf-8 in blob")]
    BadUtf8,
    #[error("invalid JSON-quoted url: {0}")]
    BadJson(String),
    #[error("invalid item id: {0}")]
    BadId(String),
    #[error("unknown item kind: {0}")]
    BadKind(String),
}

/// The serializable slice of an item, as persisted in the queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedItem {
    pub url: String,
    pub parent_url: Option<String>,
    pub id: Uuid,
    pub hops: u16,
    pub kind: ItemKind,
    pub bypass_seencheck: bool,
    pub hash: String,
    pub redirects: u8,
    pub locally_crawled: u64,
}

impl QueuedItem {
    pub fn from_item(item: &Item) -> Self {
        Self {
            url: item.url().raw().to_string(),
            parent_url: item.parent_url().map(str::to_string),
            id: item.id(),
            hops: item.url().hops(),
            kind: item.kind(),
            bypass_seencheck: item.bypass_seencheck(),
            hash: item.content_hash().to_string(),
            redirects: item.url().redirects(),
            locally_crawled: item.locally_crawled(),
        }
    }

    pub fn into_item(self) -> Item {
        let url = CrawlUrl::new(self.url)
            .with_hops(self.hops)
            .with_redirects(self.redirects);
        let mut item = Item::new(self.id, url, self.parent_url, self.kind);
        item.set_bypass_seencheck(self.bypass_seencheck);
        item.set_content_hash(self.hash);
        item.set_locally_crawled(self.locally_crawled);
        item
    }
}

pub fn put_uvarint(buf: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        buf.push((v as u8) | 0x80);
        v >>= 7;
    }
    buf.push(v as u8);
}

pub fn read_uvarint(buf: &[u8], pos: &mut usize) -> Result<u64, DecodeError> {
    let mut value: u64 = 0;
    let mut shift = 0u32;
    loop {
        let byte = *buf.get(*pos).ok_or(DecodeError::Truncated)?;
        *pos += 1;
        if shift >= 64 {
            return Err(DecodeError::BadVarint);
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

fn put_string(buf: &mut Vec<u8>, s: &str) {
    put_uvarint(buf, s.len() as u64);
    buf.extend_from_slice(s.as_bytes());
}

fn read_string(buf: &[u8], pos: &mut usize) -> Result<String, DecodeError> {
    let len = read_uvarint(buf, pos)? as usize;
    let end = pos.checked_add(len).ok_or(DecodeError::Truncated)?;
    let bytes = buf.get(*pos..end).ok_or(DecodeError::Truncated)?;
    *pos = end;
    String::from_utf8(bytes.to_vec()).map_err(|_| DecodeError::BadUtf8)
}

fn put_json_string(buf: &mut Vec<u8>, s: Option<&str>) {
    // serializing a &str or None never fails
    let quoted = serde_json::to_string(&s).unwrap();
    put_string(buf, &quoted);
}

fn read_json_string(buf: &[u8], pos: &mut usize) -> Result<Option<String>, DecodeError> {
    let quoted = read_string(buf, pos)?;
    serde_json::from_str(&quoted).map_err(|e| DecodeError::BadJson(e.to_string()))
}

/// Encode an item blob (without the outer length prefix)
pub fn encode_item(item: &QueuedItem) -> Vec<u8> {
    let mut buf = Vec::with_capacity(128);
    put_json_string(&mut buf, Some(&item.url));
    put_json_string(&mut buf, item.parent_url.as_deref());
    put_string(&mut buf, &item.id.to_string());
    put_uvarint(&mut buf, u64::from(item.hops));
    put_string(&mut buf, item.kind.as_str());
    buf.push(u8::from(item.bypass_seencheck));
    put_string(&mut buf, &item.hash);
    put_string(&mut buf, &item.redirects.to_string());
    put_uvarint(&mut buf, item.locally_crawled);
    buf
}

/// Decode an item blob (without the outer length prefix)
pub fn decode_item(buf: &[u8]) -> Result<QueuedItem, DecodeError> {
    let mut pos = 0usize;

    let url = read_json_string(buf, &mut pos)?
        .ok_or_else(|| DecodeError::BadJson("url must not be null".to_string()))?;
    let parent_url = read_json_string(buf, &mut pos)?;
    let id_str = read_string(buf, &mut pos)?;
    let id = Uuid::parse_str(&id_str).map_err(|_| DecodeError::BadId(id_str))?;
    let hops = read_uvarint(buf, &mut pos)? as u16;
    let kind_str = read_string(buf, &mut pos)?;
    let kind = ItemKind::from_str(&kind_str).ok_or(DecodeError::BadKind(kind_str))?;
    let bypass = *buf.get(pos).ok_or(DecodeError::Truncated)? != 0;
    pos += 1;
    let hash = read_string(buf, &mut pos)?;
    let redirects_str = read_string(buf, &mut pos)?;
    let redirects = redirects_str
        .parse::<u8>()
        .map_err(|_| DecodeError::BadJson(format!("bad redirect count '{redirects_str}'")))?;
    let locally_crawled = read_uvarint(buf, &mut pos)?;

    Ok(QueuedItem {
        url,
        parent_url,
        id,
        hops,
        kind,
        bypass_seencheck: bypass,
        hash,
        redirects,
        locally_crawled,
    })
}
