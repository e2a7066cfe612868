//! HEADER — format anchor at offset 0.
//!
//! ```text
//! Offset  Size  Field
//!    0      8   magic    = "DESHEAD1" (8 ASCII bytes, not LE)
//!    8      2   version  (LE u16)
//!   10      6   reserved (zero padding out to the 16-byte boundary)
//! ```
//!
//! Compatibility rule (spec §6.1): consumers MUST refuse any container whose
//! `version > 1`. There is no negotiation and no partial decode.

use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{DesError, DesResult};

use super::{FORMAT_VERSION, HEADER_SIZE};

pub const MAGIC: &[u8; 8] = b"DESHEAD1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u16,
}

impl Default for Header {
    fn default() -> Self {
        Self { version: FORMAT_VERSION }
    }
}

impl Header {
    pub fn write<W: Write>(&self, mut w: W) -> io::Result<()> {
        w.write_all(MAGIC)?;
        w.write_u16::<LittleEndian>(self.version)?;
        w.write_all(&[0u8; HEADER_SIZE - 10]) // reserved
    }

    pub fn read<R: Read>(mut r: R) -> DesResult<Self> {
        let mut magic = [0u8; 8];
        r.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(DesError::CorruptContainer("bad HEADER magic".into()));
        }
        let version = r.read_u16::<LittleEndian>()?;
        if version > FORMAT_VERSION {
            return Err(DesError::CorruptContainer(format!(
                "unsupported container version {version} (this build handles up to {FORMAT_VERSION})"
            )));
        }
        let mut reserved = [0u8; HEADER_SIZE - 10];
        r.read_exact(&mut reserved)?;
        Ok(Self { version })
    }
}
