//! Per-member RAID metadata block
//!
//! Every member carries one 4 KiB block describing the set it belongs to,
//! so a set can be reassembled from its members alone.
//!
//! ```text
//! +-----------+------------------------------------------------+
//! | 0..8      | magic "TDRAID\0\1"                             |
//! | 8..12     | crc32c of bytes 12..4096                       |
//! | 12..16    | format version                                 |
//! | 16..32    | RAID set UUID                                  |
//! | 32..48    | UUID of the member holding this block          |
//! | 48..52    | slot of that member                            |
//! | 52..56    | number of config entries in use                |
//! | 56..1080  | 64 config entries {key u32, reserved u32, u64} |
//! | 1080..    | 32 member records {uuid [16], state u8, [7]}   |
//! +-----------+------------------------------------------------+
//! ```
//!
//! All integers are little endian; everything past the member records is
//! zero.

use crate::member::MemberState;
use bytes::{Buf, BufMut, BytesMut};
use std::path::Path;
use tdimm_common::{Error, MAX_RAID_MEMBERS, RAID_METADATA_SIZE, Result};
use uuid::Uuid;

pub const MAGIC: [u8; 8] = *b"TDRAID\0\x01";

pub const FORMAT_VERSION: u32 = 1;

/// Config entry slots in a block
pub const MAX_CONFIG_ENTRIES: usize = 64;

const CHECKSUM_OFFSET: usize = 8;
const CHECKSUM_START: usize = 12;
const ENTRIES_OFFSET: usize = 56;
const ENTRY_SIZE: usize = 16;
const MEMBERS_OFFSET: usize = ENTRIES_OFFSET + MAX_CONFIG_ENTRIES * ENTRY_SIZE;
const MEMBER_RECORD_SIZE: usize = 24;

/// Well-known config entry keys
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ConfigKey {
    /// Index into [`LEVELS`]
    Level = 1,
    StrideSectors = 2,
    ReadStrideSectors = 3,
    /// Number of member slots the set spans
    Width = 4,
}

/// Level names by their persisted code
pub const LEVELS: [&str; 2] = ["stripe", "mirror"];

/// Persisted code of a level name
#[must_use]
pub fn level_code(name: &str) -> Option<u64> {
    LEVELS.iter().position(|l| *l == name).map(|i| i as u64)
}

/// One `{key, value}` config entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigEntry {
    pub key: u32,
    pub value: u64,
}

/// One member slot as recorded on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemberRecord {
    pub uuid: Uuid,
    pub state: MemberState,
}

/// Decoded metadata block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaidMetadata {
    pub version: u32,
    pub raid_uuid: Uuid,
    pub member_uuid: Uuid,
    pub member_index: u32,
    pub entries: Vec<ConfigEntry>,
    pub members: [MemberRecord; MAX_RAID_MEMBERS],
}

impl RaidMetadata {
    #[must_use]
    pub fn new(raid_uuid: Uuid, member_uuid: Uuid, member_index: u32) -> Self {
        Self {
            version: FORMAT_VERSION,
            raid_uuid,
            member_uuid,
            member_index,
            entries: Vec::new(),
            members: [MemberRecord::default(); MAX_RAID_MEMBERS],
        }
    }

    /// Value of the first entry with `key`
    #[must_use]
    pub fn entry(&self, key: ConfigKey) -> Option<u64> {
        self.entries
            .iter()
            .find(|e| e.key == key as u32)
            .map(|e| e.value)
    }

    /// Set an entry, replacing an existing one with the same key
    pub fn set_entry(&mut self, key: u32, value: u64) -> Result<()> {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.key == key) {
            entry.value = value;
            return Ok(());
        }
        if self.entries.len() >= MAX_CONFIG_ENTRIES {
            return Err(Error::configuration("metadata config table is full"));
        }
        self.entries.push(ConfigEntry { key, value });
        Ok(())
    }

    /// Encode into a full block
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        if self.entries.len() > MAX_CONFIG_ENTRIES {
            return Err(Error::configuration(format!(
                "{} config entries exceed {}",
                self.entries.len(),
                MAX_CONFIG_ENTRIES
            )));
        }
        let mut buf = BytesMut::with_capacity(RAID_METADATA_SIZE);
        buf.put_slice(&MAGIC);
        buf.put_u32_le(0);
        buf.put_u32_le(self.version);
        buf.put_slice(self.raid_uuid.as_bytes());
        buf.put_slice(self.member_uuid.as_bytes());
        buf.put_u32_le(self.member_index);
        buf.put_u32_le(u32::try_from(self.entries.len()).unwrap_or(u32::MAX));
        for entry in &self.entries {
            buf.put_u32_le(entry.key);
            buf.put_u32_le(0);
            buf.put_u64_le(entry.value);
        }
        buf.resize(MEMBERS_OFFSET, 0);
        for record in &self.members {
            buf.put_slice(record.uuid.as_bytes());
            buf.put_u8(record.state.into());
            buf.put_bytes(0, 7);
        }
        buf.resize(RAID_METADATA_SIZE, 0);

        let crc = crc32c::crc32c(&buf[CHECKSUM_START..]);
        buf[CHECKSUM_OFFSET..CHECKSUM_START].copy_from_slice(&crc.to_le_bytes());
        Ok(buf.to_vec())
    }

    /// Decode and validate a block
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() != RAID_METADATA_SIZE {
            return Err(Error::corrupt(format!(
                "metadata block is {} bytes, expected {}",
                data.len(),
                RAID_METADATA_SIZE
            )));
        }
        let mut buf = data;
        let mut magic = [0u8; 8];
        buf.copy_to_slice(&mut magic);
        if magic != MAGIC {
            return Err(Error::corrupt("bad metadata magic"));
        }
        let expected = buf.get_u32_le();
        let actual = crc32c::crc32c(&data[CHECKSUM_START..]);
        if expected != actual {
            return Err(Error::ChecksumMismatch { expected, actual });
        }

        let version = buf.get_u32_le();
        if version != FORMAT_VERSION {
            return Err(Error::corrupt(format!("unsupported metadata version {version}")));
        }
        let raid_uuid = get_uuid(&mut buf);
        let member_uuid = get_uuid(&mut buf);
        let member_index = buf.get_u32_le();
        if member_index as usize >= MAX_RAID_MEMBERS {
            return Err(Error::corrupt(format!("member index {member_index} out of range")));
        }
        let count = buf.get_u32_le() as usize;
        if count > MAX_CONFIG_ENTRIES {
            return Err(Error::corrupt(format!("{count} config entries")));
        }

        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let key = buf.get_u32_le();
            let _reserved = buf.get_u32_le();
            let value = buf.get_u64_le();
            entries.push(ConfigEntry { key, value });
        }

        let mut records = &data[MEMBERS_OFFSET..];
        let mut members = [MemberRecord::default(); MAX_RAID_MEMBERS];
        for record in &mut members {
            record.uuid = get_uuid(&mut records);
            record.state = MemberState::from(records.get_u8());
            records.advance(7);
        }
        if members[member_index as usize].uuid != member_uuid {
            return Err(Error::corrupt("member table disagrees with block owner"));
        }

        Ok(Self {
            version,
            raid_uuid,
            member_uuid,
            member_index,
            entries,
            members,
        })
    }

    /// Write the block to a file, replacing its contents
    pub fn write_to(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_bytes()?)?;
        Ok(())
    }

    /// Read a block from the start of a file
    pub fn read_from(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)?;
        let block = data.get(..RAID_METADATA_SIZE).ok_or_else(|| {
            Error::corrupt(format!("{} holds only {} bytes", path.display(), data.len()))
        })?;
        Self::from_bytes(block)
    }
}

fn get_uuid(buf: &mut &[u8]) -> Uuid {
    let mut bytes = [0u8; 16];
    buf.copy_to_slice(&mut bytes);
    Uuid::from_bytes(bytes)
}
