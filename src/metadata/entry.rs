//! Fixed-slot codec for per-chunk metadata entries.
//!
//! An entry serializes to exactly [`ENTRY_SLOT_BYTES`] bytes: the encoded
//! record followed by zero padding. Decoding reads only the record prefix,
//! so an all-zero slot (a freshly allocated entry whose content is still
//! pending) decodes as the default entry.

use serde::{Deserialize, Serialize};

use crate::error::{Result, ZirconError};
use crate::model::{ServerAddress, Version, ENTRY_SLOT_BYTES};

/// Per-chunk metadata: the ordered replica set and the most recently known
/// committed version.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataEntry {
    pub replicas: Vec<ServerAddress>,
    pub version: Version,
}

impl MetadataEntry {
    pub fn new(replicas: Vec<ServerAddress>, version: Version) -> Self {
        Self { replicas, version }
    }

    /// Serializes to exactly [`ENTRY_SLOT_BYTES`] bytes, zero-padded.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut slot = Vec::with_capacity(ENTRY_SLOT_BYTES);
        slot.extend_from_slice(&self.version.0.to_le_bytes());
        let count: u8 = self.replicas.len().try_into().map_err(|_| {
            ZirconError::Serialization("entry holds more than 255 replicas".into())
        })?;
        slot.push(count);
        for address in &self.replicas {
            if address.is_empty() {
                return Err(ZirconError::Serialization(
                    "replica addresses must be non-empty".into(),
                ));
            }
            let bytes = address.as_bytes();
            let len: u8 = bytes.len().try_into().map_err(|_| {
                ZirconError::Serialization(format!("replica address {address:?} exceeds 255 bytes"))
            })?;
            slot.push(len);
            slot.extend_from_slice(bytes);
        }
        if slot.len() > ENTRY_SLOT_BYTES {
            return Err(ZirconError::Serialization(format!(
                "entry encodes to {} bytes, slot holds {ENTRY_SLOT_BYTES}",
                slot.len()
            )));
        }
        slot.resize(ENTRY_SLOT_BYTES, 0);
        Ok(slot)
    }

    /// Decodes the record prefix of a slot. Padding after the record is
    /// ignored.
    pub fn decode(slot: &[u8]) -> Result<Self> {
        let mut cursor = Cursor { slot, at: 0 };
        let version = Version(u64::from_le_bytes(
            cursor.take(8)?.try_into().expect("eight bytes"),
        ));
        let count = cursor.take(1)?[0];
        let mut replicas = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let len = cursor.take(1)?[0] as usize;
            let bytes = cursor.take(len)?;
            let address = std::str::from_utf8(bytes).map_err(|_| {
                ZirconError::Serialization("replica address is not valid UTF-8".into())
            })?;
            if address.is_empty() {
                return Err(ZirconError::Serialization(
                    "replica address in slot is empty".into(),
                ));
            }
            replicas.push(address.to_string());
        }
        Ok(Self { replicas, version })
    }
}

struct Cursor<'a> {
    slot: &'a [u8],
    at: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self.at.checked_add(len).filter(|&end| end <= self.slot.len());
        match end {
            Some(end) => {
                let taken = &self.slot[self.at..end];
                self.at = end;
                Ok(taken)
            }
            None => Err(ZirconError::Serialization("entry slot truncated".into())),
        }
    }
}
