//! Packed archive container used by the shipped transports.
//!
//! Layout (big-endian):
//! - magic `LWPK`, version `u16`, entry count `u32`
//! - per entry: name length `u16`, UTF-8 name, data length `u32`, data
//!
//! Raw-file bundles are never packed; their bytes are the payload.

use std::collections::BTreeMap;

use anyhow::{bail, ensure, Context};
use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const ARCHIVE_MAGIC: &[u8; 4] = b"LWPK";
pub const ARCHIVE_VERSION: u16 = 1;

/// Named byte entries, in name order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PackedArchive {
    entries: BTreeMap<String, Bytes>,
}

impl PackedArchive {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces an entry.
    pub fn insert(&mut self, name: impl Into<String>, data: impl Into<Bytes>) {
        self.entries.insert(name.into(), data.into());
    }

    pub fn get(&self, name: &str) -> Option<&Bytes> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total payload bytes, headers excluded.
    pub fn payload_size(&self) -> u64 {
        self.entries.values().map(|b| b.len() as u64).sum()
    }

    pub fn encode(&self) -> anyhow::Result<Bytes> {
        let mut buf = BytesMut::with_capacity(10 + self.payload_size() as usize);
        buf.put_slice(ARCHIVE_MAGIC);
        buf.put_u16(ARCHIVE_VERSION);
        buf.put_u32(u32::try_from(self.entries.len()).context("too many archive entries")?);
        for (name, data) in &self.entries {
            let name_len = u16::try_from(name.len())
                .with_context(|| format!("entry name too long: {name}"))?;
            let data_len = u32::try_from(data.len())
                .with_context(|| format!("entry too large: {name}"))?;
            buf.put_u16(name_len);
            buf.put_slice(name.as_bytes());
            buf.put_u32(data_len);
            buf.put_slice(data);
        }
        Ok(buf.freeze())
    }

    /// Decodes an archive. Entry payloads share the input buffer.
    pub fn decode(mut bytes: Bytes) -> anyhow::Result<Self> {
        ensure!(bytes.remaining() >= 10, "archive header truncated");
        let magic = bytes.split_to(4);
        ensure!(&magic[..] == ARCHIVE_MAGIC, "bad archive magic");
        let version = bytes.get_u16();
        if version != ARCHIVE_VERSION {
            bail!("unsupported archive version {version}");
        }
        let count = bytes.get_u32() as usize;

        let mut entries = BTreeMap::new();
        for i in 0..count {
            ensure!(bytes.remaining() >= 2, "entry {i}: name length truncated");
            let name_len = bytes.get_u16() as usize;
            ensure!(bytes.remaining() >= name_len, "entry {i}: name truncated");
            let name = String::from_utf8(bytes.split_to(name_len).to_vec())
                .with_context(|| format!("entry {i}: name is not utf-8"))?;
            ensure!(bytes.remaining() >= 4, "entry {name}: data length truncated");
            let data_len = bytes.get_u32() as usize;
            ensure!(bytes.remaining() >= data_len, "entry {name}: data truncated");
            entries.insert(name, bytes.split_to(data_len));
        }
        ensure!(!bytes.has_remaining(), "trailing bytes after archive");
        Ok(Self { entries })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_preserves_entries() {
        let mut archive = PackedArchive::new();
        archive.insert("a", Bytes::from_static(b"alpha"));
        archive.insert("b", Bytes::from_static(b""));
        let back = PackedArchive::decode(archive.encode().unwrap()).unwrap();
        assert_eq!(back, archive);
        assert_eq!(back.get("a").unwrap().as_ref(), b"alpha");
        assert_eq!(back.names().collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[test]
    fn rejects_bad_magic() {
        let err = PackedArchive::decode(Bytes::from_static(b"NOPE\0\x01\0\0\0\0")).unwrap_err();
        assert!(err.to_string().contains("magic"));
    }

    #[test]
    fn rejects_truncated_entry() {
        let mut archive = PackedArchive::new();
        archive.insert("texture", Bytes::from_static(b"0123456789"));
        let encoded = archive.encode().unwrap();
        let cut = encoded.slice(..encoded.len() - 3);
        assert!(PackedArchive::decode(cut).is_err());
    }
}
