//! INDEX entry codec — one fixed-shape-but-variable-length record per file.
//!
//! ```text
//! name_length: u16          (LE)
//! name:        UTF-8 bytes  (name_length bytes, NUL-free)
//! data_offset: u64          (LE, absolute)
//! data_length: u64          (LE)
//! meta_offset: u64          (LE, absolute)
//! meta_length: u32          (LE)
//! flags:       u32          (LE; bit 0 = external, rest reserved)
//! reserved:    8 bytes      (zero)
//! ```
//!
//! INDEX has no per-entry framing beyond `name_length`, so entries are read
//! sequentially from `index_start` for `index_length` bytes — there is no
//! random access into INDEX itself. That's fine: the index cache (§4.4)
//! exists precisely so this scan happens once per container identity, not
//! once per read.

use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};

use crate::error::{DesError, DesResult};

/// This file's bytes live outside the container (see `blob`), uploaded to
/// the sidecar location under `_bigFiles/<container-stem>/<name>`.
pub const FLAG_EXTERNAL: u32 = 0x0000_0001;

/// Fixed portion of an index entry, excluding the variable-length name.
const FIXED_TAIL_SIZE: usize = 8 + 8 + 8 + 4 + 4 + 8; // offsets/lengths/flags/reserved

/// Also `Serialize`/`Deserialize` so the external KV index cache (§4.4) can
/// round-trip a parsed index through JSON without a bespoke wire format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub name: String,
    pub data_offset: u64,
    pub data_length: u64,
    pub meta_offset: u64,
    pub meta_length: u32,
    pub flags: u32,
}

impl IndexEntry {
    #[inline]
    pub fn is_external(&self) -> bool {
        self.flags & FLAG_EXTERNAL != 0
    }

    pub fn encoded_len(&self) -> usize {
        2 + self.name.len() + FIXED_TAIL_SIZE
    }

    pub fn write<W: Write>(&self, mut w: W) -> io::Result<()> {
        let name_bytes = self.name.as_bytes();
        w.write_u16::<LittleEndian>(name_bytes.len() as u16)?;
        w.write_all(name_bytes)?;
        w.write_u64::<LittleEndian>(self.data_offset)?;
        w.write_u64::<LittleEndian>(self.data_length)?;
        w.write_u64::<LittleEndian>(self.meta_offset)?;
        w.write_u32::<LittleEndian>(self.meta_length)?;
        w.write_u32::<LittleEndian>(self.flags)?;
        w.write_all(&[0u8; 8])?; // reserved
        Ok(())
    }

    /// Read one entry from a sequential cursor over the INDEX region.
    pub fn read<R: Read>(mut r: R) -> DesResult<Self> {
        let name_len = r.read_u16::<LittleEndian>()? as usize;

        let mut name_buf = vec![0u8; name_len];
        r.read_exact(&mut name_buf)?;
        let name = String::from_utf8(name_buf)
            .map_err(|_| DesError::CorruptContainer("index entry name is not valid UTF-8".into()))?;

        let data_offset = r.read_u64::<LittleEndian>()?;
        let data_length = r.read_u64::<LittleEndian>()?;
        let meta_offset = r.read_u64::<LittleEndian>()?;
        let meta_length = r.read_u32::<LittleEndian>()?;
        let flags = r.read_u32::<LittleEndian>()?;
        let mut reserved = [0u8; FIXED_TAIL_SIZE - 32];
        r.read_exact(&mut reserved)?;

        Ok(Self {
            name,
            data_offset,
            data_length,
            meta_offset,
            meta_length,
            flags,
        })
    }
}

/// Validate a candidate file name against spec §4.1's rules, before it is
/// ever written into DATA or INDEX.
///
/// Rejects: empty, >65535 UTF-8 bytes, containing NUL, containing `..`,
/// or leading/trailing whitespace.
pub fn validate_name(name: &str) -> DesResult<()> {
    if name.is_empty() {
        return Err(DesError::InvalidName(name.to_owned(), "name is empty"));
    }
    if name.len() > u16::MAX as usize {
        return Err(DesError::InvalidName(name.to_owned(), "name exceeds 65535 bytes"));
    }
    if name.contains('\0') {
        return Err(DesError::InvalidName(name.to_owned(), "name contains a NUL byte"));
    }
    if name.contains("..") {
        return Err(DesError::InvalidName(
            name.to_owned(),
            "name contains a path-traversal sequence",
        ));
    }
    if name.trim() != name {
        return Err(DesError::InvalidName(
            name.to_owned(),
            "name has leading or trailing whitespace",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_bytes() {
        let entry = IndexEntry {
            name: "a/b/c.txt".into(),
            data_offset: 16,
            data_length: 5,
            meta_offset: 21,
            meta_length: 19,
            flags: 0,
        };
        let mut buf = Vec::new();
        entry.write(&mut buf).unwrap();
        assert_eq!(buf.len(), entry.encoded_len());
        let parsed = IndexEntry::read(&buf[..]).unwrap();
        assert_eq!(parsed, entry);
    }

    #[test]
    fn rejects_bad_names() {
        assert!(validate_name("").is_err());
        assert!(validate_name("a/../b").is_err());
        assert!(validate_name(" leading").is_err());
        assert!(validate_name("trailing ").is_err());
        assert!(validate_name("has\0nul").is_err());
        assert!(validate_name("fine/name.bin").is_ok());
    }
}
